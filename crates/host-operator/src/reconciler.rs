//! Control loop for `HetznerBareMetalHost`.
//!
//! Each attempt reads the host fresh from the API server, runs one state
//! machine step and writes the status back with the resourceVersion it
//! read. A conflicting write re-runs the whole attempt.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use hetzner_provider::remote::{RemoteExecutor, Ssh2Executor};
use hetzner_provider::robot::{RobotApi, RobotClient, RobotCredentials};
use hetzner_provider::{BudgetRegistry, ClientOptions, Error};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config;
use kube::runtime::{watcher, Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::claims::{ClaimError, ClaimIndex};
use crate::conditions::{Severity, CLAIM_ACCEPTED, CREDENTIALS_AVAILABLE};
use crate::config::OperatorConfig;
use crate::crds::{
    ConsumerRef, HetznerBareMetalHost, HetznerBareMetalHostSpec, HetznerBareMetalHostStatus,
};
use crate::phase::Phase;
use crate::secrets::{self, SecretError, SshKeyPair};
use crate::state_machine::{self, HostView, StepContext, StepOutcome};

pub const HOST_FINALIZER: &str = "infrastructure.cluster.x-k8s.io/hetzner-bare-metal-host";

/// Attempts per reconcile before a status conflict is surfaced.
pub const MAX_CONFLICT_RERUNS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource version conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("failed to serialize resource: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),
}

impl StoreError {
    fn from_kube(err: kube::Error, name: &str) -> Self {
        match err {
            kube::Error::Api(response) if response.code == 409 => Self::Conflict(response.message),
            kube::Error::Api(response) if response.code == 404 => Self::NotFound(name.to_string()),
            other => Self::Kube(other),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("provider error: {0}")]
    Provider(#[from] Error),

    #[error("status of {0} kept conflicting after {attempts} attempts", attempts = MAX_CONFLICT_RERUNS)]
    Conflict(String),

    #[error("step for {0} was cancelled")]
    Cancelled(String),
}

/// What the controller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    Requeue(Duration),
    AwaitChange,
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue(delay) => Action::requeue(delay),
            ReconcileAction::AwaitChange => Action::await_change(),
        }
    }
}

/// Persistence of hosts and their secrets.
///
/// Writes carry the resourceVersion of the object passed in and fail with
/// [`StoreError::Conflict`] when it is stale.
#[async_trait]
pub trait HostStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<HetznerBareMetalHost>, StoreError>;

    async fn list(&self) -> Result<Vec<HetznerBareMetalHost>, StoreError>;

    /// Replace the status subresource.
    async fn replace_status(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError>;

    async fn add_finalizer(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError>;

    async fn remove_finalizer(&self, host: &HetznerBareMetalHost) -> Result<(), StoreError>;

    async fn set_consumer_ref(
        &self,
        host: &HetznerBareMetalHost,
        consumer: Option<&ConsumerRef>,
    ) -> Result<HetznerBareMetalHost, StoreError>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError>;
}

/// [`HostStore`] backed by the Kubernetes API.
pub struct KubeHostStore {
    hosts: Api<HetznerBareMetalHost>,
    secrets: Api<Secret>,
}

impl KubeHostStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            hosts: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
        }
    }

    async fn merge(
        &self,
        host: &HetznerBareMetalHost,
        patch: serde_json::Value,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let name = host.name_any();
        self.hosts
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }
}

#[async_trait]
impl HostStore for KubeHostStore {
    async fn get(&self, name: &str) -> Result<Option<HetznerBareMetalHost>, StoreError> {
        Ok(self.hosts.get_opt(name).await?)
    }

    async fn list(&self) -> Result<Vec<HetznerBareMetalHost>, StoreError> {
        Ok(self.hosts.list(&ListParams::default()).await?.items)
    }

    async fn replace_status(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let name = host.name_any();
        self.hosts
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(host)?)
            .await
            .map_err(|e| StoreError::from_kube(e, &name))
    }

    async fn add_finalizer(
        &self,
        host: &HetznerBareMetalHost,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        let mut finalizers = host.finalizers().to_vec();
        finalizers.push(HOST_FINALIZER.to_string());
        self.merge(
            host,
            json!({"metadata": {"finalizers": finalizers, "resourceVersion": host.resource_version()}}),
        )
        .await
    }

    async fn remove_finalizer(&self, host: &HetznerBareMetalHost) -> Result<(), StoreError> {
        let finalizers: Vec<&String> = host
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != HOST_FINALIZER)
            .collect();
        self.merge(
            host,
            json!({"metadata": {"finalizers": finalizers, "resourceVersion": host.resource_version()}}),
        )
        .await
        .map(|_| ())
    }

    async fn set_consumer_ref(
        &self,
        host: &HetznerBareMetalHost,
        consumer: Option<&ConsumerRef>,
    ) -> Result<HetznerBareMetalHost, StoreError> {
        self.merge(
            host,
            json!({
                "metadata": {"resourceVersion": host.resource_version()},
                "spec": {"consumerRef": consumer},
            }),
        )
        .await
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.secrets.get_opt(name).await?)
    }
}

/// Builds Robot clients for a credential set.
pub trait RobotFactory: Send + Sync {
    /// # Errors
    /// Returns a permanent error for unusable client options.
    fn robot(&self, credentials: &RobotCredentials) -> Result<Arc<dyn RobotApi>, Error>;
}

/// Caches one [`RobotClient`] per credential set; budgets live in the
/// process-wide registry.
pub struct RobotClientFactory {
    options: ClientOptions,
    clients: DashMap<String, Arc<RobotClient>>,
}

impl RobotClientFactory {
    #[must_use]
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            clients: DashMap::new(),
        }
    }
}

impl RobotFactory for RobotClientFactory {
    fn robot(&self, credentials: &RobotCredentials) -> Result<Arc<dyn RobotApi>, Error> {
        let key = credentials.key().as_str().to_string();
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.value().clone());
        }
        let client = Arc::new(
            RobotClient::new(credentials.clone(), &self.options, BudgetRegistry::global())
                .map_err(hetzner_provider::ProviderError::classify)?,
        );
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

/// Cancellation tokens of running steps, keyed by host name.
#[derive(Default)]
pub struct InFlight {
    next_id: AtomicU64,
    tokens: DashMap<String, (u64, CancellationToken)>,
}

/// Removes the registration when the step ends.
pub struct InFlightGuard<'a> {
    registry: &'a InFlight,
    name: String,
    id: u64,
    token: CancellationToken,
}

impl InFlight {
    fn register(&self, name: &str, parent: &CancellationToken) -> InFlightGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        self.tokens.insert(name.to_string(), (id, token.clone()));
        InFlightGuard {
            registry: self,
            name: name.to_string(),
            id,
            token,
        }
    }

    /// Cancel the running step of `name`, if any.
    pub fn cancel(&self, name: &str) -> bool {
        match self.tokens.get(name) {
            Some(entry) => {
                entry.1.cancel();
                true
            }
            None => false,
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .tokens
            .remove_if(&self.name, |_, (id, _)| *id == self.id);
    }
}

struct HostCredentials {
    robot: RobotCredentials,
    rescue: SshKeyPair,
    os: SshKeyPair,
}

/// Drives hosts of one namespace.
pub struct Reconciler {
    store: Arc<dyn HostStore>,
    robots: Arc<dyn RobotFactory>,
    remote: Arc<dyn RemoteExecutor>,
    config: OperatorConfig,
    namespace: String,
    claims: ClaimIndex,
    in_flight: InFlight,
    shutdown: CancellationToken,
}

impl Reconciler {
    #[must_use]
    pub fn new(
        store: Arc<dyn HostStore>,
        robots: Arc<dyn RobotFactory>,
        remote: Arc<dyn RemoteExecutor>,
        config: OperatorConfig,
        namespace: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            robots,
            remote,
            config,
            namespace: namespace.into(),
            claims: ClaimIndex::new(),
            in_flight: InFlight::default(),
            shutdown,
        }
    }

    #[must_use]
    pub fn claims(&self) -> &ClaimIndex {
        &self.claims
    }

    /// Abort the running step of a host, e.g. because it is being deleted.
    pub fn cancel_step(&self, name: &str) {
        if self.in_flight.cancel(name) {
            info!(host = name, "Cancelled in-flight step");
        }
    }

    fn claim_key(&self, name: &str) -> String {
        format!("{}/{name}", self.namespace)
    }

    fn consumer_key(&self, host: &HetznerBareMetalHost) -> Option<String> {
        host.spec
            .consumer_ref
            .as_ref()
            .map(|c| c.key(&self.namespace))
    }

    /// Seed the claim index from stored hosts. Hosts past `Unmanaged` go
    /// first so a restart cannot hand their machines to a waiting host.
    ///
    /// # Errors
    /// Returns the store error when hosts cannot be listed.
    pub async fn prime_claims(&self) -> Result<(), StoreError> {
        let mut hosts = self.store.list().await?;
        hosts.sort_by_key(|host| {
            host.status
                .as_ref()
                .map_or(Phase::Unmanaged, |status| status.phase)
                == Phase::Unmanaged
        });
        for host in &hosts {
            let name = host.name_any();
            let consumer = self.consumer_key(host);
            if let Err(conflict) = self.claims.observe(&self.claim_key(&name), consumer.as_deref()) {
                warn!(host = %name, error = %conflict, "Conflicting claim found at startup");
            }
        }
        debug!(hosts = hosts.len(), "Claim index primed");
        Ok(())
    }

    /// Reconcile one host, re-running on status conflicts.
    ///
    /// # Errors
    /// Returns [`ReconcileError::Conflict`] when every attempt conflicted,
    /// and store or cancellation errors as they occur.
    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub async fn reconcile_host(&self, name: &str) -> Result<ReconcileAction, ReconcileError> {
        for attempt in 1..=MAX_CONFLICT_RERUNS {
            match self.reconcile_once(name).await {
                Err(ReconcileError::Store(StoreError::Conflict(message))) => {
                    debug!(host = name, attempt, %message, "Status conflict, re-running step");
                }
                other => return other,
            }
        }
        Err(ReconcileError::Conflict(name.to_string()))
    }

    async fn reconcile_once(&self, name: &str) -> Result<ReconcileAction, ReconcileError> {
        let claim_key = self.claim_key(name);
        let Some(mut host) = self.store.get(name).await? else {
            self.claims.remove_host(&claim_key);
            return Ok(ReconcileAction::AwaitChange);
        };

        let consumer = self.consumer_key(&host);
        let claim = self.claims.observe(&claim_key, consumer.as_deref());

        let deleting = host.metadata.deletion_timestamp.is_some();
        let has_finalizer = host.finalizers().iter().any(|f| f == HOST_FINALIZER);
        let stored = host.status.clone().unwrap_or_default();
        let mut current = stored.clone();

        if current.phase == Phase::Deleted {
            if has_finalizer {
                self.store.remove_finalizer(&host).await?;
                info!(host = name, "Removed finalizer");
            }
            self.claims.remove_host(&claim_key);
            return Ok(ReconcileAction::AwaitChange);
        }
        if !has_finalizer {
            if deleting {
                return Ok(ReconcileAction::AwaitChange);
            }
            host = self.store.add_finalizer(&host).await?;
            debug!(host = name, "Added finalizer");
        }

        match claim {
            Err(conflict) if current.phase == Phase::Unmanaged && !deleting => {
                return self.refuse_claim(host, &stored, &conflict).await;
            }
            Err(conflict) => {
                warn!(host = name, phase = %current.phase, error = %conflict, "Host shares its claimant with another host");
            }
            Ok(()) => current.conditions.remove(CLAIM_ACCEPTED),
        }

        let now = Utc::now();
        let generation = host.metadata.generation.unwrap_or(0);
        let view = HostView {
            name,
            spec: &host.spec,
            status: &current,
            generation,
            deleting,
        };
        let outcome = match state_machine::local_step(&view, now) {
            Some(outcome) => outcome,
            None => match self.load_credentials(&host.spec).await? {
                Ok(credentials) => {
                    self.provider_step(&host, &current, generation, deleting, &credentials)
                        .await?
                }
                Err(err) => {
                    warn!(host = name, error = %err, "Credentials unavailable");
                    let mut status = current.clone();
                    let reason = match err {
                        SecretError::NotFound(_) => "SecretNotFound",
                        _ => "SecretInvalid",
                    };
                    status.conditions.mark_false(
                        CREDENTIALS_AVAILABLE,
                        reason,
                        Severity::Error,
                        err.to_string(),
                        now,
                    );
                    StepOutcome {
                        status,
                        requeue_after: Some(self.config.host.secret_error_retry_delay()),
                        release_claim: false,
                    }
                }
            },
        };

        if outcome.release_claim {
            host = self.store.set_consumer_ref(&host, None).await?;
            self.claims.remove_host(&claim_key);
            info!(host = name, "Released claim");
        }
        if !outcome.status.same_state(&stored) {
            host.status = Some(outcome.status.clone());
            self.store.replace_status(&host).await?;
        }

        Ok(match outcome.requeue_after {
            Some(delay) => ReconcileAction::Requeue(delay),
            None => ReconcileAction::AwaitChange,
        })
    }

    /// Keep an unstarted host `Unmanaged` while its claimant holds another host.
    async fn refuse_claim(
        &self,
        mut host: HetznerBareMetalHost,
        stored: &HetznerBareMetalHostStatus,
        conflict: &ClaimError,
    ) -> Result<ReconcileAction, ReconcileError> {
        warn!(host = %host.name_any(), error = %conflict, "Refusing claim held by another host");
        let mut status = stored.clone();
        status.conditions.mark_false(
            CLAIM_ACCEPTED,
            "ClaimConflict",
            Severity::Error,
            conflict.to_string(),
            Utc::now(),
        );
        if !status.same_state(stored) {
            host.status = Some(status);
            self.store.replace_status(&host).await?;
        }
        Ok(ReconcileAction::Requeue(self.config.host.retryable_requeue()))
    }

    async fn secret(&self, name: &str) -> Result<Result<Secret, SecretError>, StoreError> {
        Ok(self
            .store
            .get_secret(name)
            .await?
            .ok_or_else(|| SecretError::NotFound(name.to_string())))
    }

    async fn load_credentials(
        &self,
        spec: &HetznerBareMetalHostSpec,
    ) -> Result<Result<HostCredentials, SecretError>, StoreError> {
        let keys = &self.config.secrets;
        let robot = match self.secret(&spec.robot_secret_ref.name).await? {
            Ok(secret) => secrets::robot_credentials(&secret, keys),
            Err(e) => Err(e),
        };
        let rescue = match self.secret(&spec.rescue_ssh_secret_ref.name).await? {
            Ok(secret) => secrets::ssh_key_pair(&secret, keys),
            Err(e) => Err(e),
        };
        let os = match self.secret(&spec.os_ssh_secret_ref.name).await? {
            Ok(secret) => secrets::ssh_key_pair(&secret, keys),
            Err(e) => Err(e),
        };
        Ok(robot.and_then(|robot| {
            Ok(HostCredentials {
                robot,
                rescue: rescue?,
                os: os?,
            })
        }))
    }

    async fn provider_step(
        &self,
        host: &HetznerBareMetalHost,
        current: &HetznerBareMetalHostStatus,
        generation: i64,
        deleting: bool,
        credentials: &HostCredentials,
    ) -> Result<StepOutcome, ReconcileError> {
        let name = host.name_any();
        let now = Utc::now();
        let mut status = current.clone();
        status.conditions.mark_true(CREDENTIALS_AVAILABLE, now);
        let view = HostView {
            name: &name,
            spec: &host.spec,
            status: &status,
            generation,
            deleting,
        };

        let robot = self.robots.robot(&credentials.robot)?;
        let guard = self.in_flight.register(&name, &self.shutdown);
        let ctx = StepContext {
            robot: robot.as_ref(),
            remote: self.remote.as_ref(),
            config: &self.config.host,
            rescue_key: &credentials.rescue,
            os_key: &credentials.os,
            cancel: &guard.token,
            now,
        };

        let deadline = self.config.host.step_deadline();
        let result = tokio::time::timeout(deadline, state_machine::step(&view, &ctx)).await;
        match result {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(Error::Cancelled)) => Err(ReconcileError::Cancelled(name)),
            Ok(Err(other)) => Err(other.into()),
            Err(_) => {
                guard.token.cancel();
                warn!(host = %name, ?deadline, "Step exceeded its deadline");
                status.attempt.count += 1;
                status.attempt.last_error =
                    Some(format!("step exceeded its {}s deadline", deadline.as_secs()));
                status.last_updated = Some(Utc::now());
                Ok(StepOutcome {
                    status,
                    requeue_after: Some(self.config.host.retryable_requeue()),
                    release_claim: false,
                })
            }
        }
    }
}

#[instrument(skip_all, fields(host = %host.name_any()))]
async fn reconcile(
    host: Arc<HetznerBareMetalHost>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcileError> {
    let action = ctx.reconcile_host(&host.name_any()).await?;
    Ok(action.into())
}

fn error_policy(host: Arc<HetznerBareMetalHost>, err: &ReconcileError, ctx: Arc<Reconciler>) -> Action {
    warn!(host = %host.name_any(), error = %err, "Host reconciliation failed");
    Action::requeue(ctx.config.host.retryable_requeue())
}

/// Cancel in-flight steps of hosts that are being deleted.
async fn watch_deletions(api: Api<HetznerBareMetalHost>, reconciler: Arc<Reconciler>) {
    let mut events = pin!(watcher(api, watcher::Config::default()).default_backoff());
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Apply(host) | watcher::Event::InitApply(host))
                if host.metadata.deletion_timestamp.is_some() =>
            {
                reconciler.cancel_step(&host.name_any());
            }
            Ok(watcher::Event::Delete(host)) => {
                let name = host.name_any();
                reconciler.cancel_step(&name);
                reconciler.claims.remove_host(&reconciler.claim_key(&name));
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Deletion watcher error"),
        }
    }
}

/// Run the host controller until `shutdown` is cancelled.
#[instrument(skip(client, config, shutdown), fields(namespace = %namespace))]
pub async fn run_host_controller(
    client: Client,
    namespace: String,
    config: OperatorConfig,
    shutdown: CancellationToken,
) {
    info!("Starting HetznerBareMetalHost controller");

    let hosts: Api<HetznerBareMetalHost> = Api::namespaced(client.clone(), &namespace);
    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeHostStore::new(client, &namespace)),
        Arc::new(RobotClientFactory::new(config.robot_client_options())),
        Arc::new(Ssh2Executor),
        config,
        namespace,
        shutdown.clone(),
    ));

    if let Err(e) = reconciler.prime_claims().await {
        warn!(error = %e, "Failed to prime claim index, claims are indexed as hosts are seen");
    }
    let deletions = tokio::spawn(watch_deletions(hosts.clone(), Arc::clone(&reconciler)));

    let controller = Controller::new(hosts, Config::default().any_semantic())
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| {
            let span = info_span!("host_reconciliation_result");
            async move {
                match result {
                    Ok(host) => debug!(resource = ?host, "Host reconciliation successful"),
                    Err(e) => error!(error = ?e, "Host reconciliation error"),
                }
            }
            .instrument(span)
        });

    tokio::select! {
        () = controller => {}
        () = shutdown.cancelled() => info!("Shutdown requested, cancelling in-flight steps"),
    }
    deletions.abort();

    info!("HetznerBareMetalHost controller shutting down");
}
