use crate::hypervisor::Hypervisor;
use crate::{MigrateError, Result, log_error, log_info};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// The single ephemeral snapshot a copy cycle reads from.
#[derive(Debug)]
pub struct SnapshotHandle {
    pub name: String,
    pub reference: String,
    pub created_at: DateTime<Utc>,
    closed: bool,
}

impl SnapshotHandle {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Record that the snapshot was removed outside [`SnapshotLifecycle`].
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }
}

pub struct SnapshotLifecycle {
    hypervisor: Arc<dyn Hypervisor>,
}

impl SnapshotLifecycle {
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }

    /// Create the cycle's snapshot. Failure is fatal to the whole cycle.
    pub async fn create_cycle(&self) -> Result<SnapshotHandle> {
        let name = format!("vmshift-{}", uuid::Uuid::new_v4());
        log_info!(
            "Creating snapshot '{}' of VM '{}'",
            name,
            self.hypervisor.vm_name()
        );

        let reference = self
            .hypervisor
            .create_snapshot(&name)
            .await
            .map_err(|e| match e {
                MigrateError::Snapshot(_) => e,
                other => MigrateError::Snapshot(other.to_string()),
            })?;

        log_info!("Snapshot '{}' ready ({})", name, reference);
        Ok(SnapshotHandle {
            name,
            reference,
            created_at: Utc::now(),
            closed: false,
        })
    }

    /// Remove the snapshot with consolidation. Calling it again on an already
    /// closed handle does nothing.
    pub async fn close_cycle(&self, handle: &mut SnapshotHandle) -> Result<()> {
        if handle.closed {
            return Ok(());
        }
        // A failed removal is not retried by a second close.
        handle.closed = true;

        log_info!(
            "Removing snapshot '{}' of VM '{}' (held {}s)",
            handle.name,
            self.hypervisor.vm_name(),
            (Utc::now() - handle.created_at).num_seconds()
        );
        self.hypervisor
            .remove_snapshot(&handle.reference, true)
            .await
            .map_err(|e| {
                log_error!("Failed to remove snapshot '{}': {}", handle.name, e);
                match e {
                    MigrateError::Snapshot(_) => e,
                    other => MigrateError::Snapshot(other.to_string()),
                }
            })
    }
}
