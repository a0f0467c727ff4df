use serde::{Deserialize, Serialize};

/// BuildStatus is the overall status of a Build, always a pure function
/// of its packages' statuses (see [`BuildStatus::roll_up`]).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "build_status", rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Running,
    Success,
    Failed,
    /// Some packages succeeded while others failed or were skipped
    /// because an upstream dependency failed.
    Partial,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Partial)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The overall status implied by a set of package statuses.
    ///
    /// Any non-terminal package keeps the build running. Once every
    /// package is terminal: all success => success; a mix of success and
    /// failed/skipped => partial; no successes => failed.
    pub fn roll_up(statuses: &[PackageStatus]) -> Self {
        if statuses.iter().any(|s| !s.is_terminal()) {
            return Self::Running;
        }
        let succeeded = statuses
            .iter()
            .filter(|s| matches!(s, PackageStatus::Success))
            .count();
        if succeeded == statuses.len() {
            Self::Success
        } else if succeeded > 0 {
            Self::Partial
        } else {
            Self::Failed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }
}

/// PackageStatus is the lifecycle of one PackageJob.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "package_status", rename_all = "snake_case")]
pub enum PackageStatus {
    Pending,
    /// Waiting on an in-build dependency which is not yet terminal.
    Blocked,
    Running,
    Success,
    Failed,
    /// Not executed because an upstream dependency failed or was skipped.
    Skipped,
}

impl PackageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Skipped)
    }

    /// Whether the transition `self -> next` is permitted.
    ///
    /// The lattice is monotonic: pending and blocked may trade places
    /// while dependencies settle, pending becomes running only via a
    /// claim, running resolves to success or failed, and skipped is
    /// reached from the non-running waiting states. `running -> pending`
    /// is the crash-recovery reset of an expired claim lease.
    pub fn may_transition_to(self, next: Self) -> bool {
        use PackageStatus::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Pending, Blocked)
                | (Pending, Running)
                | (Pending, Skipped)
                | (Blocked, Pending)
                | (Blocked, Skipped)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Pending)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Blocked => "blocked",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}
