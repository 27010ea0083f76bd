//! Host to machine claim index.
//!
//! The source of truth is `spec.consumerRef` on each host; this index is
//! the reverse lookup rebuilt from observed hosts. Claims are first-wins:
//! a machine referenced by a second host keeps the host it was first seen on.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClaimError {
    #[error("{machine} already claims host {host}")]
    MachineTaken { machine: String, host: String },
}

#[derive(Debug, Default)]
pub struct ClaimIndex {
    by_host: DashMap<String, String>,
    by_machine: DashMap<String, String>,
}

impl ClaimIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the claimant observed on a host, or its absence.
    ///
    /// # Errors
    /// Returns [`ClaimError::MachineTaken`] when the claimant already holds
    /// another host; the index is left unchanged.
    pub fn observe(&self, host: &str, claimant: Option<&str>) -> Result<(), ClaimError> {
        let Some(machine) = claimant else {
            self.remove_host(host);
            return Ok(());
        };

        match self.by_machine.entry(machine.to_string()) {
            Entry::Occupied(entry) if entry.get() != host => {
                return Err(ClaimError::MachineTaken {
                    machine: machine.to_string(),
                    host: entry.get().clone(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(entry) => {
                entry.insert(host.to_string());
                debug!(host, machine, "Host claimed");
            }
        }

        if let Some(previous) = self.by_host.insert(host.to_string(), machine.to_string()) {
            if previous != machine {
                self.by_machine.remove_if(&previous, |_, h| h == host);
            }
        }
        Ok(())
    }

    /// Forget a host and its claim.
    pub fn remove_host(&self, host: &str) {
        if let Some((_, machine)) = self.by_host.remove(host) {
            self.by_machine.remove_if(&machine, |_, h| h == host);
        }
    }

    #[must_use]
    pub fn claimant_of(&self, host: &str) -> Option<String> {
        self.by_host.get(host).map(|m| m.value().clone())
    }

    #[must_use]
    pub fn host_for(&self, machine: &str) -> Option<String> {
        self.by_machine.get(machine).map(|h| h.value().clone())
    }
}
