//! Worker lifecycle state.
//!
//! One `WorkerState` lives exactly as long as the worker process. Nothing in
//! it is persisted; after a restart it is rebuilt from the stores (see
//! `OfflineWorker::resume`).

use serde::Serialize;

use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Installing,
    Installed,
    Activating,
    Activated,
    Redundant,
}

impl Phase {
    fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Installing, Installed)
                | (Installing, Redundant)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Activating, Installed)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Installing => "installing",
            Phase::Installed => "installed",
            Phase::Activating => "activating",
            Phase::Activated => "activated",
            Phase::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, schemars::JsonSchema)]
pub struct WorkerState {
    pub version: String,
    pub phase: Phase,
    /// Activation requested without waiting for pages to close.
    pub skip_waiting: bool,
    /// Already-open pages are controlled by this worker.
    pub clients_claimed: bool,
}

impl WorkerState {
    pub fn new(version: impl Into<String>) -> Self {
        Self { version: version.into(), phase: Phase::Installing, skip_waiting: false, clients_claimed: false }
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn advance(&mut self, next: Phase) -> Result<(), Error> {
        if !self.phase.can_advance_to(next) {
            return Err(Error::InvalidState(format!("cannot go from {} to {next}", self.phase)));
        }
        tracing::info!(version = %self.version, from = %self.phase, to = %next, "worker phase change");
        self.phase = next;
        Ok(())
    }

    /// Worker restarted while its version was already serving.
    pub fn resume_activated(&mut self) {
        self.phase = Phase::Activated;
        self.clients_claimed = true;
    }

    /// Worker restarted after installing but before it was activated.
    pub fn resume_installed(&mut self, skip_waiting: bool) {
        self.phase = Phase::Installed;
        self.skip_waiting = skip_waiting;
        self.clients_claimed = false;
    }

    pub fn is_serving(&self) -> bool {
        self.phase == Phase::Activated
    }
}
