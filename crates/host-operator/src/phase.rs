//! Host lifecycle phases and the transitions allowed between them.

use std::fmt;

use hetzner_provider::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase of a bare metal host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    /// Known but not claimed; nothing is done to the machine.
    #[default]
    Unmanaged,
    /// Booting the rescue system.
    Preparing,
    /// Collecting hardware inventory from the rescue system.
    Registering,
    /// Checking the install plan against the inventory.
    Inspecting,
    /// Running the install pipeline in the rescue system.
    ImageInstalling,
    /// Waiting for the installed OS to come up.
    Provisioning,
    /// Installed OS is reachable.
    Provisioned,
    /// Wiping and powering off after release or deletion.
    Deprovisioning,
    /// Unrecoverable failure; cleared by editing the spec.
    Error,
    /// Gone; the finalizer can be removed.
    Deleted,
}

impl Phase {
    /// Every phase, in lifecycle order.
    pub const ALL: [Phase; 10] = [
        Phase::Unmanaged,
        Phase::Preparing,
        Phase::Registering,
        Phase::Inspecting,
        Phase::ImageInstalling,
        Phase::Provisioning,
        Phase::Provisioned,
        Phase::Deprovisioning,
        Phase::Error,
        Phase::Deleted,
    ];

    /// Phases reachable from `self` in one step, excluding `self`.
    #[must_use]
    pub fn successors(self) -> &'static [Phase] {
        use Phase::{
            Deleted, Deprovisioning, Error, ImageInstalling, Inspecting, Preparing, Provisioned,
            Provisioning, Registering, Unmanaged,
        };
        match self {
            Unmanaged => &[Preparing, Deleted, Error],
            Preparing => &[Registering, Deprovisioning, Error],
            Registering => &[Inspecting, Preparing, Deprovisioning, Error],
            Inspecting => &[ImageInstalling, Deprovisioning, Error],
            ImageInstalling => &[Provisioning, Preparing, Deprovisioning, Error],
            Provisioning => &[Provisioned, ImageInstalling, Deprovisioning, Error],
            Provisioned => &[Deprovisioning, Error],
            Deprovisioning => &[Unmanaged, Deleted, Error],
            Error => &[Preparing, Deleted],
            Deleted => &[],
        }
    }

    /// Whether moving from `self` to `to` is allowed. Staying put always is.
    #[must_use]
    pub fn can_transition_to(self, to: Phase) -> bool {
        self == to || self.successors().contains(&to)
    }

    /// Validate a transition.
    ///
    /// # Errors
    /// Returns a permanent `InvalidTransition` error for moves outside the
    /// transition table.
    pub fn transition(self, to: Phase) -> Result<Phase, Error> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(Error::permanent(
                "InvalidTransition",
                format!("transition from {self} to {to} is not allowed"),
            ))
        }
    }

    /// Phases in which the host is held for a claimant and provider work
    /// happens on its behalf.
    #[must_use]
    pub fn is_claimed(self) -> bool {
        matches!(
            self,
            Phase::Preparing
                | Phase::Registering
                | Phase::Inspecting
                | Phase::ImageInstalling
                | Phase::Provisioning
                | Phase::Provisioned
        )
    }

    /// Phases that only change on external input.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Error | Phase::Deleted)
    }

    /// Phase name as persisted.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unmanaged => "Unmanaged",
            Phase::Preparing => "Preparing",
            Phase::Registering => "Registering",
            Phase::Inspecting => "Inspecting",
            Phase::ImageInstalling => "ImageInstalling",
            Phase::Provisioning => "Provisioning",
            Phase::Provisioned => "Provisioned",
            Phase::Deprovisioning => "Deprovisioning",
            Phase::Error => "Error",
            Phase::Deleted => "Deleted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
