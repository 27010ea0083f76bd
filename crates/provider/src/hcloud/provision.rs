//! Label-driven convergence of a single Cloud server.
//!
//! The provisioner never waits for an action in-process. While the server is
//! still changing state it reports [`ProvisionOutcome::Pending`] and the
//! caller requeues.

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use super::models::{Action, ActionStatus, CreateServerRequest, Server, ServerStatus};
use super::HCloudApi;
use crate::error::{Error, Result};

/// Desired state of a Cloud server.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredServer {
    /// Server name.
    pub name: String,
    /// Server type, e.g. "cx22".
    pub server_type: String,
    /// Image name.
    pub image: String,
    /// Location, e.g. "fsn1".
    pub location: Option<String>,
    /// SSH key names.
    pub ssh_keys: Vec<String>,
    /// Cloud-init user data.
    pub user_data: Option<String>,
    /// Labels that identify the server. Must not be empty.
    pub labels: BTreeMap<String, String>,
}

impl DesiredServer {
    /// Label selector matching exactly the identifying labels.
    #[must_use]
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn create_request(&self) -> CreateServerRequest {
        CreateServerRequest {
            name: self.name.clone(),
            server_type: self.server_type.clone(),
            image: self.image.clone(),
            ssh_keys: self.ssh_keys.clone(),
            location: self.location.clone(),
            user_data: self.user_data.clone(),
            start_after_create: Some(true),
            labels: self.labels.clone(),
            networks: Vec::new(),
            placement_group: None,
        }
    }
}

/// Result of one convergence step.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// The server exists and is running.
    Ready(Box<Server>),
    /// Something is in progress; check again later.
    Pending {
        /// Suggested delay before the next check.
        requeue_after: Duration,
    },
    /// No server matches the labels.
    Absent,
}

/// Drives one Cloud server towards a [`DesiredServer`].
pub struct CloudServerProvisioner<'a> {
    api: &'a dyn HCloudApi,
    poll_interval: Duration,
}

impl<'a> CloudServerProvisioner<'a> {
    /// Create a provisioner polling every `poll_interval` while pending.
    #[must_use]
    pub fn new(api: &'a dyn HCloudApi, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }

    fn pending(&self) -> ProvisionOutcome {
        ProvisionOutcome::Pending {
            requeue_after: self.poll_interval,
        }
    }

    async fn find(&self, desired: &DesiredServer) -> Result<Option<Server>> {
        if desired.labels.is_empty() {
            return Err(Error::permanent(
                "InvalidConfiguration",
                format!("server {} has no identifying labels", desired.name),
            ));
        }

        let mut servers = self.api.list_servers(Some(&desired.label_selector())).await?;
        if servers.len() > 1 {
            return Err(Error::permanent(
                "DuplicateServers",
                format!(
                    "{} servers match labels {}",
                    servers.len(),
                    desired.label_selector()
                ),
            ));
        }
        Ok(servers.pop())
    }

    /// Create, label and power on the server as needed.
    ///
    /// # Errors
    /// Returns the classified provider error, or `Permanent` when a started
    /// action failed or more than one server carries the labels.
    pub async fn ensure(&self, desired: &DesiredServer) -> Result<ProvisionOutcome> {
        let Some(server) = self.find(desired).await? else {
            let (server, action) = self.api.create_server(&desired.create_request()).await?;
            check_action(&action)?;
            info!(server_id = server.id, name = %server.name, "Created cloud server");
            return Ok(self.pending());
        };

        let missing_labels = desired
            .labels
            .iter()
            .any(|(k, v)| server.labels.get(k) != Some(v));
        if missing_labels {
            let mut labels = server.labels.clone();
            labels.extend(desired.labels.clone());
            self.api.set_server_labels(server.id, &labels).await?;
        }

        if server.locked {
            debug!(server_id = server.id, "Server locked by running action");
            return Ok(self.pending());
        }

        match server.status {
            ServerStatus::Running => Ok(ProvisionOutcome::Ready(Box::new(server))),
            ServerStatus::Off => {
                let action = self.api.power_on(server.id).await?;
                check_action(&action)?;
                Ok(self.pending())
            }
            status => {
                debug!(server_id = server.id, status = %status, "Waiting for server");
                Ok(self.pending())
            }
        }
    }

    /// Delete the server if it exists.
    ///
    /// # Errors
    /// Returns the classified provider error.
    pub async fn ensure_absent(&self, desired: &DesiredServer) -> Result<ProvisionOutcome> {
        let Some(server) = self.find(desired).await? else {
            return Ok(ProvisionOutcome::Absent);
        };
        if server.status == ServerStatus::Deleting || server.locked {
            return Ok(self.pending());
        }
        if server.protection.delete {
            let action = self.api.change_protection(server.id, false, false).await?;
            check_action(&action)?;
        }
        let action = self.api.delete_server(server.id).await?;
        check_action(&action)?;
        info!(server_id = server.id, "Deleting cloud server");
        Ok(self.pending())
    }
}

fn check_action(action: &Action) -> Result<()> {
    if action.status == ActionStatus::Error {
        let message = action
            .error
            .as_ref()
            .map_or_else(String::new, |e| format!("{}: {}", e.code, e.message));
        return Err(Error::permanent(
            "ActionFailed",
            format!("action {} ({}) failed: {message}", action.id, action.command),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::*;
    use crate::hcloud::models::{ServerProtection, ServerPublicNet, ServerType};

    #[derive(Default)]
    struct FakeCloud {
        servers: Mutex<Vec<Server>>,
        calls: Mutex<Vec<String>>,
    }

    impl FakeCloud {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn with_server(status: ServerStatus, labels: &[(&str, &str)]) -> Self {
            let fake = Self::default();
            fake.servers.lock().unwrap().push(server(1, status, labels));
            fake
        }
    }

    fn server(id: i64, status: ServerStatus, labels: &[(&str, &str)]) -> Server {
        Server {
            id,
            name: format!("server-{id}"),
            status,
            created: Utc::now(),
            public_net: ServerPublicNet::default(),
            private_net: Vec::new(),
            server_type: ServerType { name: "cx22".into() },
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            protection: ServerProtection::default(),
            rescue_enabled: false,
            locked: false,
            primary_disk_size: 40,
            image: None,
        }
    }

    fn action(command: &str) -> Action {
        Action {
            id: 99,
            command: command.into(),
            status: ActionStatus::Running,
            progress: 0,
            error: None,
        }
    }

    #[async_trait]
    impl HCloudApi for FakeCloud {
        async fn list_servers(&self, label_selector: Option<&str>) -> Result<Vec<Server>> {
            self.record(format!("list {}", label_selector.unwrap_or_default()));
            Ok(self.servers.lock().unwrap().clone())
        }

        async fn get_server(&self, id: i64) -> Result<Server> {
            self.servers
                .lock()
                .unwrap()
                .iter()
                .find(|s| s.id == id)
                .cloned()
                .ok_or_else(|| Error::permanent("NotFound", id.to_string()))
        }

        async fn create_server(&self, request: &CreateServerRequest) -> Result<(Server, Action)> {
            self.record(format!("create {}", request.name));
            let created = server(7, ServerStatus::Initializing, &[]);
            self.servers.lock().unwrap().push(created.clone());
            Ok((created, action("create_server")))
        }

        async fn delete_server(&self, id: i64) -> Result<Action> {
            self.record(format!("delete {id}"));
            Ok(action("delete_server"))
        }

        async fn set_server_labels(
            &self,
            id: i64,
            labels: &BTreeMap<String, String>,
        ) -> Result<Server> {
            self.record(format!("label {id} {}", labels.len()));
            let mut servers = self.servers.lock().unwrap();
            let server = servers.iter_mut().find(|s| s.id == id).unwrap();
            server.labels.clone_from(labels);
            Ok(server.clone())
        }

        async fn power_on(&self, id: i64) -> Result<Action> {
            self.record(format!("power_on {id}"));
            Ok(action("start_server"))
        }

        async fn power_off(&self, id: i64) -> Result<Action> {
            self.record(format!("power_off {id}"));
            Ok(action("stop_server"))
        }

        async fn reset_server(&self, id: i64) -> Result<Action> {
            self.record(format!("reset {id}"));
            Ok(action("reset_server"))
        }

        async fn rebuild_server(&self, id: i64, _image: &str) -> Result<Action> {
            self.record(format!("rebuild {id}"));
            Ok(action("rebuild_server"))
        }

        async fn attach_iso(&self, id: i64, _iso: &str) -> Result<Action> {
            self.record(format!("attach_iso {id}"));
            Ok(action("attach_iso"))
        }

        async fn change_protection(&self, id: i64, _delete: bool, _rebuild: bool) -> Result<Action> {
            self.record(format!("protection {id}"));
            Ok(action("change_protection"))
        }

        async fn get_action(&self, _id: i64) -> Result<Action> {
            Ok(action("noop"))
        }
    }

    fn desired() -> DesiredServer {
        DesiredServer {
            name: "worker-0".into(),
            server_type: "cx22".into(),
            image: "ubuntu-24.04".into(),
            location: Some("fsn1".into()),
            ssh_keys: vec!["ops".into()],
            user_data: None,
            labels: BTreeMap::from([("cluster".to_string(), "prod".to_string())]),
        }
    }

    #[test]
    fn test_label_selector() {
        let mut d = desired();
        d.labels.insert("role".into(), "worker".into());
        assert_eq!(d.label_selector(), "cluster=prod,role=worker");
    }

    #[tokio::test]
    async fn test_missing_server_is_created_and_pending() {
        let cloud = FakeCloud::default();
        let provisioner = CloudServerProvisioner::new(&cloud, Duration::from_secs(5));

        let outcome = provisioner.ensure(&desired()).await.unwrap();

        assert_eq!(
            outcome,
            ProvisionOutcome::Pending {
                requeue_after: Duration::from_secs(5)
            }
        );
        assert_eq!(cloud.calls(), vec!["list cluster=prod", "create worker-0"]);
    }

    #[tokio::test]
    async fn test_running_server_is_ready() {
        let cloud = FakeCloud::with_server(ServerStatus::Running, &[("cluster", "prod")]);
        let provisioner = CloudServerProvisioner::new(&cloud, Duration::from_secs(5));

        match provisioner.ensure(&desired()).await.unwrap() {
            ProvisionOutcome::Ready(server) => assert_eq!(server.id, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(cloud.calls(), vec!["list cluster=prod"]);
    }

    #[tokio::test]
    async fn test_off_server_is_powered_on_once_per_step() {
        let cloud = FakeCloud::with_server(ServerStatus::Off, &[("cluster", "prod")]);
        let provisioner = CloudServerProvisioner::new(&cloud, Duration::from_secs(5));

        let outcome = provisioner.ensure(&desired()).await.unwrap();

        assert!(matches!(outcome, ProvisionOutcome::Pending { .. }));
        assert_eq!(cloud.calls(), vec!["list cluster=prod", "power_on 1"]);
    }

    #[tokio::test]
    async fn test_duplicate_servers_are_permanent() {
        let cloud = FakeCloud::with_server(ServerStatus::Running, &[("cluster", "prod")]);
        cloud
            .servers
            .lock()
            .unwrap()
            .push(server(2, ServerStatus::Running, &[("cluster", "prod")]));
        let provisioner = CloudServerProvisioner::new(&cloud, Duration::from_secs(5));

        match provisioner.ensure(&desired()).await {
            Err(Error::Permanent { reason, .. }) => assert_eq!(reason, "DuplicateServers"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ensure_absent_deletes_then_reports_absent() {
        let cloud = FakeCloud::with_server(ServerStatus::Running, &[("cluster", "prod")]);
        let provisioner = CloudServerProvisioner::new(&cloud, Duration::from_secs(5));

        let outcome = provisioner.ensure_absent(&desired()).await.unwrap();
        assert!(matches!(outcome, ProvisionOutcome::Pending { .. }));
        assert!(cloud.calls().contains(&"delete 1".to_string()));

        cloud.servers.lock().unwrap().clear();
        assert_eq!(
            provisioner.ensure_absent(&desired()).await.unwrap(),
            ProvisionOutcome::Absent
        );
    }

    #[test]
    fn test_failed_action_is_permanent() {
        let mut failed = action("start_server");
        failed.status = ActionStatus::Error;
        assert!(matches!(check_action(&failed), Err(Error::Permanent { .. })));
        assert!(check_action(&action("start_server")).is_ok());
    }
}
