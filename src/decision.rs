use crate::change_id::{ChangeToken, PersistedToken};
use crate::disk::DiskDescriptor;
use crate::target::Target;
use crate::{Result, log_info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionReason {
    TargetAbsent,
    NoPersistedToken,
    InvalidPersistedToken,
    SnapshotTokenUnavailable,
    LineageChanged,
    Continuous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDecision {
    pub need_full: bool,
    pub target_is_zeroed: bool,
    pub reason: DecisionReason,
    /// Token the incremental pass starts from.
    pub base_token: Option<ChangeToken>,
}

impl CopyDecision {
    fn full(target_is_zeroed: bool, reason: DecisionReason) -> Self {
        Self {
            need_full: true,
            target_is_zeroed,
            reason,
            base_token: None,
        }
    }
}

/// Pure decision over the three inputs; every "can't tell" case degrades to
/// a full copy rather than an error.
pub fn decide_from(
    target_exists: bool,
    persisted: &PersistedToken,
    snapshot_change_id: Option<&str>,
) -> CopyDecision {
    if !target_exists {
        return CopyDecision::full(true, DecisionReason::TargetAbsent);
    }

    let previous = match persisted {
        PersistedToken::Absent => {
            return CopyDecision::full(false, DecisionReason::NoPersistedToken);
        }
        PersistedToken::Invalid(_) => {
            return CopyDecision::full(false, DecisionReason::InvalidPersistedToken);
        }
        PersistedToken::Valid(token) => token,
    };

    // CBT disabled on the source shows up as a missing or unparsable id.
    let Some(current) = snapshot_change_id.and_then(|raw| ChangeToken::parse(raw).ok()) else {
        return CopyDecision::full(false, DecisionReason::SnapshotTokenUnavailable);
    };

    if !previous.is_continuous_with(&current) {
        return CopyDecision::full(false, DecisionReason::LineageChanged);
    }

    CopyDecision {
        need_full: false,
        target_is_zeroed: false,
        reason: DecisionReason::Continuous,
        base_token: Some(previous.clone()),
    }
}

/// Decide for one disk. Must run before the target is connected, since
/// connecting may create it.
pub async fn decide(target: &dyn Target, disk: &DiskDescriptor) -> Result<CopyDecision> {
    let exists = target.exists().await?;
    let persisted = if exists {
        PersistedToken::from_raw(target.read_change_token().await?)
    } else {
        PersistedToken::Absent
    };

    let decision = decide_from(exists, &persisted, disk.change_id.as_deref());
    log_info!(
        "Disk '{}': {} copy ({:?})",
        disk.label,
        if decision.need_full { "full" } else { "incremental" },
        decision.reason
    );
    Ok(decision)
}
