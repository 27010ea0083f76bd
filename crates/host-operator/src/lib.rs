//! Kubernetes operator for Hetzner dedicated servers.
//!
//! Each `HetznerBareMetalHost` resource maps to one Robot server. A claimed
//! host is booted into the Hetzner rescue system, inventoried, partitioned
//! and imaged with `installimage`, then rebooted into the installed OS.
//! Releasing the claim powers the server off again.
//!
//! - [`state_machine`]: one bounded step of the host lifecycle
//! - [`reconciler`]: the kube-rs controller driving those steps
//! - [`install`] and [`partition`]: the rescue-side install pipeline
//! - [`hardware`]: inventory collected in the rescue system

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod claims;
pub mod conditions;
pub mod config;
pub mod crds;
pub mod hardware;
pub mod install;
pub mod partition;
pub mod phase;
pub mod reconciler;
pub mod secrets;
pub mod state_machine;

#[cfg(test)]
mod testing;

pub use config::OperatorConfig;
pub use crds::HetznerBareMetalHost;
pub use phase::Phase;
pub use reconciler::{run_host_controller, Reconciler};
