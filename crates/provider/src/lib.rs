//! Hetzner provider clients.
//!
//! This crate provides the client layer shared by every host controller:
//!
//! - **Cloud API**: typed client for virtual servers and actions
//! - **Robot API**: dedicated server resets, rescue boots and SSH keys
//! - **Remote execution**: SSH sessions for scripts run on hosts
//!
//! All HTTP traffic goes through a [`Governor`], which enforces a request
//! budget per credential set and retries transient failures. Every error is
//! classified into the [`Error`] taxonomy before it leaves this crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use hetzner_provider::robot::{self, RobotApi, RobotClient, RobotCredentials};
//! use hetzner_provider::BudgetRegistry;
//!
//! let client = RobotClient::new(credentials, &robot::default_options(), BudgetRegistry::global())?;
//! let servers = client.list_servers().await?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backoff;
pub mod error;
pub mod governor;
pub mod hcloud;
pub mod options;
pub mod remote;
pub mod robot;

pub use backoff::RetryConfig;
pub use error::{Error, ProviderError, RemoteError, Result};
pub use governor::{BudgetConfig, BudgetRegistry, CredentialKey, Governor, RateBudget};
pub use options::ClientOptions;
