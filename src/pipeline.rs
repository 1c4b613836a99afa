//! One replication cycle: snapshot the VM, export its disks, bring every
//! target up to date, optionally convert the guest, then tear everything
//! down again.

use crate::conversion::{GuestConverter, POST_CONVERSION_TOKEN};
use crate::decision::{CopyDecision, decide};
use crate::disk::{DiskDescriptor, eligible_disks};
use crate::export::{BlockExporter, ExportContext, ExportSession, LiveSessions};
use crate::full_copy::BulkCopier;
use crate::hypervisor::{Hypervisor, SourceDescriptor};
use crate::incremental;
use crate::snapshot::{SnapshotHandle, SnapshotLifecycle};
use crate::status::ProgressSink;
use crate::target::{Target, TargetProvider};
use crate::{MigrateError, Result, log_error, log_info, log_warn};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CycleRequest {
    /// Where the controller wants the target devices; empty for the default.
    pub location_ref: String,
    pub convert_guest: bool,
    /// Label of the boot disk, if known.
    pub root_disk: Option<String>,
    /// Unpacked SDK directory for the export processes.
    pub libdir: Option<PathBuf>,
    /// Driver package (unpacked tree or ISO) for guest conversion.
    pub drivers: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct DiskReport {
    pub label: String,
    pub decision: CopyDecision,
    pub target_path: PathBuf,
    pub converted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub disks: Vec<DiskReport>,
    pub root_target: Option<PathBuf>,
}

pub struct Pipeline {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub source: SourceDescriptor,
    pub exporter: Arc<dyn BlockExporter>,
    pub copier: Arc<dyn BulkCopier>,
    pub targets: Arc<dyn TargetProvider>,
    pub converter: Arc<dyn GuestConverter>,
    pub live: Arc<LiveSessions>,
}

/// The boot disk: the hinted label when it is among the disks, otherwise
/// the disk with the lowest device key.
pub fn root_disk_key(disks: &[DiskDescriptor], hint: Option<&str>) -> Option<i32> {
    hint.and_then(|label| {
        disks
            .iter()
            .find(|d| d.label.eq_ignore_ascii_case(label.trim()))
            .map(|d| d.key)
    })
    .or_else(|| disks.iter().map(|d| d.key).min())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Pipeline {
    /// Run one cycle. The snapshot and every export started for it are
    /// released before this returns, whatever happened in between.
    pub async fn run_cycle(
        &self,
        request: &CycleRequest,
        progress: &mut dyn ProgressSink,
    ) -> Result<CycleReport> {
        let lifecycle = SnapshotLifecycle::new(self.hypervisor.clone());
        let mut handle = lifecycle.create_cycle().await?;
        self.live
            .register_snapshot(self.hypervisor.clone(), &handle.reference);
        progress.report(
            format!("Snapshot {} created for VM {}", handle.name, self.source.vm_name),
            true,
        );

        let outcome = AssertUnwindSafe(self.copy_under_snapshot(&handle, request, progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(MigrateError::Copy(format!(
                    "copy cycle panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });

        let stopped = self.exporter.stop(self.live.take()).await;
        let closed = if self.live.release_snapshot(&handle.reference) {
            lifecycle.close_cycle(&mut handle).await
        } else {
            log_warn!("Snapshot '{}' was already removed by the interrupt handler", handle.name);
            handle.mark_closed();
            Ok(())
        };

        match outcome {
            Ok(report) => {
                stopped?;
                closed?;
                progress.report(
                    format!("Cycle finished, {} disk(s) in sync", report.disks.len()),
                    true,
                );
                Ok(report)
            }
            Err(e) => {
                for teardown in [stopped, closed] {
                    if let Err(te) = teardown {
                        log_error!("Teardown after failed cycle: {}", te);
                    }
                }
                Err(e)
            }
        }
    }

    async fn copy_under_snapshot(
        &self,
        handle: &SnapshotHandle,
        request: &CycleRequest,
        progress: &mut dyn ProgressSink,
    ) -> Result<CycleReport> {
        let devices = self.hypervisor.snapshot_devices(&handle.reference).await?;
        let disks = eligible_disks(&devices);
        if disks.is_empty() {
            return Err(MigrateError::UnsupportedDisk(format!(
                "VM '{}' has no disks that can be copied",
                self.source.vm_name
            )));
        }

        let ctx = ExportContext {
            source: self.source.clone(),
            vm_ref: self.hypervisor.vm_ref().await?,
            snapshot_ref: handle.reference.clone(),
            libdir: request.libdir.clone(),
        };
        let sessions = self.exporter.start(&ctx, &disks).await?;
        self.live.install(&sessions);

        let root_key = root_disk_key(&disks, request.root_disk.as_deref());
        let mut report = CycleReport::default();
        let mut pending_conversion: Option<(usize, Box<dyn Target>)> = None;

        for session in &sessions {
            let disk = &session.disk;
            let is_root = Some(disk.key) == root_key;
            let synced = self
                .sync_disk(handle, session, request, progress)
                .await
                .map_err(|e| e.for_disk(&disk.label));
            let (decision, mut target) = match synced {
                Ok(synced) => synced,
                Err(e) => {
                    if let Some((_, mut held)) = pending_conversion.take() {
                        if let Err(de) = held.disconnect().await {
                            log_warn!("Disconnecting {}: {}", held.path().display(), de);
                        }
                    }
                    return Err(e);
                }
            };

            let target_path = target.path().to_path_buf();
            if is_root {
                report.root_target = Some(target_path.clone());
                self.targets.record_root(&disk.label)?;
            }
            report.disks.push(DiskReport {
                label: disk.label.clone(),
                decision,
                target_path,
                converted: false,
            });

            if is_root && request.convert_guest {
                pending_conversion = Some((report.disks.len() - 1, target));
            } else {
                target.disconnect().await?;
            }
        }

        if let Some((index, mut target)) = pending_conversion {
            let label = report.disks[index].label.clone();
            progress.report(format!("Converting guest on disk {}", label), true);
            let converted = self
                .converter
                .convert(target.path(), request.drivers.as_deref())
                .await
                .map_err(|e| e.for_disk(&label));
            if let Err(e) = converted {
                if let Err(de) = target.disconnect().await {
                    log_warn!("Disconnecting {}: {}", target.path().display(), de);
                }
                return Err(e);
            }
            target.write_change_token(POST_CONVERSION_TOKEN).await?;
            target.disconnect().await?;
            report.disks[index].converted = true;
        }

        Ok(report)
    }

    async fn sync_disk(
        &self,
        handle: &SnapshotHandle,
        session: &ExportSession,
        request: &CycleRequest,
        progress: &mut dyn ProgressSink,
    ) -> Result<(CopyDecision, Box<dyn Target>)> {
        let disk = &session.disk;
        let mut target = self.targets.target_for(&request.location_ref, disk);
        let decision = decide(target.as_ref(), disk).await?;
        target.connect().await?;

        match &decision.base_token {
            Some(base) if !decision.need_full => {
                let mut reader = self.exporter.open(session).await?;
                let copied = match target.open_writer() {
                    Ok(mut writer) => {
                        incremental::copy_changed(
                            self.hypervisor.as_ref(),
                            &handle.reference,
                            disk,
                            base,
                            reader.as_mut(),
                            writer.as_mut(),
                            progress,
                        )
                        .await
                    }
                    Err(e) => Err(e),
                };
                if let Err(e) = reader.close().await {
                    log_warn!("Closing export reader for '{}': {}", disk.label, e);
                }
                copied?;
            }
            _ => {
                self.copier
                    .copy(session, target.path(), decision.target_is_zeroed, progress)
                    .await?;
            }
        }

        // Only the snapshot's own id describes exactly what was just written.
        match disk.change_id.as_deref() {
            Some(change_id) => target.write_change_token(change_id).await?,
            None => {
                log_warn!(
                    "Disk '{}' has no change id (CBT disabled?), next cycle copies it in full",
                    disk.label
                );
                target.write_change_token("").await?;
            }
        }
        log_info!(
            "Disk '{}' in sync ({})",
            disk.label,
            if decision.need_full { "full" } else { "incremental" }
        );
        progress.report(format!("Disk {} copied", disk.label), true);
        Ok((decision, target))
    }
}
