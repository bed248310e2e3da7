//! Runs every registered controller while this replica leads.
use crate::{
    client::{LeaseClient, ResourceClient},
    config::OperatorConfig,
    controller::{Controller, ControllerConfig, ReconcileRequest},
    election::{self, LeaderElection, LeaseElector, NoopElection},
    informer::{self, Informer, InformerConfig},
};
use ahash::AHashMap;
use async_trait::async_trait;
use futures::{
    future::{self, BoxFuture},
    Future, FutureExt,
};
use kubeop_core::Resource;
use std::{
    any::{Any, TypeId},
    borrow::Cow,
    pin::pin,
    sync::Arc,
    time::Duration,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Errors ending a single leadership term
#[derive(Debug, Error)]
pub enum Error {
    /// An informer could not complete its initial list
    #[error("failed to start informer for {kind}: {source}")]
    InformerStartFailed {
        /// The kind served by the informer
        kind: String,
        /// The underlying informer error
        #[source]
        source: informer::Error,
    },

    /// The leader election configuration is invalid
    #[error("leader election: {0}")]
    Election(#[from] election::Error),
}

/// Operator result type
pub type Result<T, E = Error> = std::result::Result<T, E>;

type ResyncFn<K> = Arc<dyn Fn(&K) -> Option<Duration> + Send + Sync>;

/// A controller waiting to be started by an [`Operator`]
///
/// Settings left unset fall back to the ones in [`OperatorConfig`].
pub struct Registration<K, R, Ctx> {
    client: Arc<dyn ResourceClient<K>>,
    reconciler: Arc<R>,
    context: Arc<Ctx>,
    config: Option<ControllerConfig>,
    informer_config: Option<InformerConfig>,
    resync: Option<ResyncFn<K>>,
}

impl<K, R, Ctx> Registration<K, R, Ctx> {
    /// Reconcile the objects served by `client` with `reconciler`
    pub fn new(client: Arc<dyn ResourceClient<K>>, reconciler: R, context: Arc<Ctx>) -> Self {
        Self {
            client,
            reconciler: Arc::new(reconciler),
            context,
            config: None,
            informer_config: None,
            resync: None,
        }
    }

    /// Override the operator wide controller settings for this kind
    #[must_use]
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Decide the resync interval per object, see [`Controller::resync_interval`]
    #[must_use]
    pub fn resync_interval(mut self, resync: impl Fn(&K) -> Option<Duration> + Send + Sync + 'static) -> Self {
        self.resync = Some(Arc::new(resync));
        self
    }

    /// Override the operator wide informer settings for this kind
    ///
    /// Only the first registration of a kind decides how its informer is configured.
    #[must_use]
    pub fn informer_config(mut self, config: InformerConfig) -> Self {
        self.informer_config = Some(config);
        self
    }
}

/// The controllers an [`Operator`] runs, built once at startup
#[derive(Default)]
pub struct ControllerRegistry {
    registrations: Vec<Box<dyn Launch>>,
}

impl ControllerRegistry {
    /// Creates an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a controller
    ///
    /// Registrations for the same kind share one informer.
    #[must_use]
    pub fn register<K, R, Fut, E, Ctx>(mut self, registration: Registration<K, R, Ctx>) -> Self
    where
        K: Resource + Clone + Send + Sync + 'static,
        R: Fn(ReconcileRequest<K>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
        Ctx: Send + Sync + 'static,
    {
        self.registrations.push(Box::new(registration));
        self
    }

    /// The number of registered controllers
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether nothing was registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    /// The kinds of the registered controllers, in registration order
    #[must_use]
    pub fn kinds(&self) -> Vec<Cow<'static, str>> {
        self.registrations.iter().map(|reg| reg.kind()).collect()
    }
}

/// A type erased [`Registration`]
trait Launch: Send + Sync {
    fn kind(&self) -> Cow<'static, str>;

    /// Build the controller and return its unspawned run loop
    ///
    /// The controller subscribes to its informer here, before any informer starts.
    fn launch(
        &self,
        informers: &mut InformerFactory,
        defaults: &ControllerConfig,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

impl<K, R, Fut, E, Ctx> Launch for Registration<K, R, Ctx>
where
    K: Resource + Clone + Send + Sync + 'static,
    R: Fn(ReconcileRequest<K>, Arc<Ctx>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
    Ctx: Send + Sync + 'static,
{
    fn kind(&self) -> Cow<'static, str> {
        K::kind()
    }

    fn launch(
        &self,
        informers: &mut InformerFactory,
        defaults: &ControllerConfig,
        token: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        let informer = informers.informer_for(&self.client, self.informer_config.as_ref());
        let reconciler = self.reconciler.clone();
        let mut controller = Controller::new(
            informer,
            move |request: ReconcileRequest<K>, ctx: Arc<Ctx>| (*reconciler)(request, ctx),
            self.context.clone(),
        )
        .config(self.config.clone().unwrap_or_else(|| defaults.clone()));
        if let Some(resync) = self.resync.clone() {
            controller = controller.resync_interval(move |obj: &K| resync(obj));
        }
        controller.run(token).boxed()
    }
}

/// An informer seen without its kind
#[async_trait]
trait ErasedInformer: Send + Sync {
    fn kind(&self) -> Cow<'static, str>;

    async fn launch(&self, token: CancellationToken) -> informer::Result<JoinHandle<()>>;

    async fn synced(&self, token: &CancellationToken) -> bool;
}

#[async_trait]
impl<K> ErasedInformer for Informer<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn kind(&self) -> Cow<'static, str> {
        K::kind()
    }

    async fn launch(&self, token: CancellationToken) -> informer::Result<JoinHandle<()>> {
        self.start(token).await
    }

    async fn synced(&self, token: &CancellationToken) -> bool {
        self.wait_for_sync(token).await
    }
}

/// Creates at most one [`Informer`] per kind
struct InformerFactory {
    defaults: InformerConfig,
    typed: AHashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    erased: Vec<Arc<dyn ErasedInformer>>,
}

impl InformerFactory {
    fn new(defaults: InformerConfig) -> Self {
        Self {
            defaults,
            typed: AHashMap::new(),
            erased: Vec::new(),
        }
    }

    fn informer_for<K>(
        &mut self,
        client: &Arc<dyn ResourceClient<K>>,
        config: Option<&InformerConfig>,
    ) -> Arc<Informer<K>>
    where
        K: Resource + Clone + Send + Sync + 'static,
    {
        let existing = self
            .typed
            .get(&TypeId::of::<K>())
            .and_then(|informer| informer.clone().downcast::<Informer<K>>().ok());
        if let Some(informer) = existing {
            return informer;
        }
        let config = config.cloned().unwrap_or_else(|| self.defaults.clone());
        let informer = Arc::new(Informer::new(client.clone(), config));
        self.typed.insert(TypeId::of::<K>(), informer.clone());
        self.erased.push(informer.clone());
        informer
    }
}

/// Runs the registered controllers while this replica leads
///
/// Every leadership term starts from scratch: fresh informers list the cluster, and the
/// controllers only start once every informer has synced. When leadership is lost the
/// term is cancelled and everything started for it is awaited before campaigning again.
pub struct Operator {
    registry: ControllerRegistry,
    election: Arc<dyn LeaderElection>,
    config: OperatorConfig,
}

impl Operator {
    /// Create an operator gated by `election`
    #[must_use]
    pub fn new(registry: ControllerRegistry, election: Arc<dyn LeaderElection>, config: OperatorConfig) -> Self {
        Self {
            registry,
            election,
            config,
        }
    }

    /// Create an operator which competes for a lease when the config enables leader election
    ///
    /// # Errors
    /// Fails when leader election is enabled with an invalid configuration.
    pub fn with_leases(
        registry: ControllerRegistry,
        leases: Arc<dyn LeaseClient>,
        config: OperatorConfig,
    ) -> Result<Self> {
        let election: Arc<dyn LeaderElection> = if config.leader_election.enabled {
            Arc::new(LeaseElector::new(leases, config.leader_election.clone())?)
        } else {
            Arc::new(NoopElection)
        };
        Ok(Self::new(registry, election, config))
    }

    /// Run until `token` is cancelled
    ///
    /// Failures are logged and retried after [`OperatorConfig::retry_delay`].
    #[tracing::instrument(skip_all, fields(operator = %self.config.name))]
    pub async fn run(self, token: CancellationToken) {
        info!(kinds = ?self.registry.kinds(), "operator started");
        let elector = {
            let election = self.election.clone();
            let token = token.clone();
            tokio::spawn(async move { election.run(token).await })
        };

        while !token.is_cancelled() && self.election.wait_for_leadership(&token).await {
            info!("leading, starting controllers");
            match self.run_term(&token).await {
                Ok(()) if token.is_cancelled() => break,
                Ok(()) => warn!("leadership lost, controllers stopped"),
                Err(err) => {
                    error!(
                        error = &err as &(dyn std::error::Error + 'static),
                        "operator cycle failed, retrying in {:?}",
                        self.config.retry_delay
                    );
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }

        if let Err(err) = elector.await {
            error!(error = %err, "leader election task failed");
        }
        info!("operator stopped");
    }

    /// Run the controllers for a single leadership term
    async fn run_term(&self, token: &CancellationToken) -> Result<()> {
        let term = token.child_token();
        let mut informers = InformerFactory::new(self.config.informer.clone());
        let controllers = self
            .registry
            .registrations
            .iter()
            .map(|reg| reg.launch(&mut informers, &self.config.controller, term.clone()))
            .collect::<Vec<_>>();

        let mut launches =
            pin!(future::join_all(informers.erased.iter().map(|informer| informer.launch(term.clone()))));
        let (started, demoted) = tokio::select! {
            started = &mut launches => (started, false),
            () = self.election.wait_for_leadership_lost(token) => {
                term.cancel();
                (launches.await, true)
            }
        };
        let mut informer_tasks = Vec::with_capacity(started.len());
        let mut failure = None;
        for (informer, res) in informers.erased.iter().zip(started) {
            match res {
                Ok(task) => informer_tasks.push(task),
                Err(source) => {
                    failure.get_or_insert(Error::InformerStartFailed {
                        kind: informer.kind().into_owned(),
                        source,
                    });
                }
            }
        }
        if demoted {
            join_tasks(informer_tasks).await;
            return Ok(());
        }
        if let Some(err) = failure {
            term.cancel();
            join_tasks(informer_tasks).await;
            return Err(err);
        }

        let synced = future::join_all(informers.erased.iter().map(|informer| informer.synced(&term)));
        tokio::select! {
            _ = synced => {}
            () = self.election.wait_for_leadership_lost(token) => {
                term.cancel();
                join_tasks(informer_tasks).await;
                return Ok(());
            }
        }

        info!(controllers = controllers.len(), "caches synced, running controllers");
        let controller_tasks = controllers.into_iter().map(tokio::spawn).collect::<Vec<_>>();
        self.election.wait_for_leadership_lost(token).await;

        term.cancel();
        join_tasks(controller_tasks).await;
        join_tasks(informer_tasks).await;
        Ok(())
    }
}

async fn join_tasks(tasks: Vec<JoinHandle<()>>) {
    for res in future::join_all(tasks).await {
        if let Err(err) = res {
            error!(error = %err, "operator task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ControllerRegistry, Operator, Registration};
    use crate::{
        client::ResourceClient,
        controller::{ControllerConfig, ReconcileRequest},
        election::NoopElection,
        fake::{FakeClient, FakeLeases},
        test_utils::{gadget, init_tracing, widget, Gadget, Widget},
        OperatorConfig,
    };
    use kubeop_core::{Resource, ResourceKey};
    use std::{convert::Infallible, sync::Arc, time::Duration};
    use tokio::{sync::mpsc, time::Instant};
    use tokio_util::sync::CancellationToken;

    type Seen = mpsc::UnboundedSender<(String, ResourceKey)>;

    async fn record<K: Resource>(req: ReconcileRequest<K>, seen: Arc<Seen>) -> Result<(), Infallible> {
        let _ = seen.send((K::kind().into_owned(), req.key));
        Ok(())
    }

    fn shared<K: Resource + Clone + Send + Sync + 'static>(client: &FakeClient<K>) -> Arc<dyn ResourceClient<K>> {
        Arc::new(client.clone())
    }

    fn registry(widgets: &FakeClient<Widget>, gadgets: &FakeClient<Gadget>, seen: &Arc<Seen>) -> ControllerRegistry {
        let quiet = ControllerConfig::default().disable_resync();
        ControllerRegistry::new()
            .register(Registration::new(shared(widgets), record::<Widget>, seen.clone()).config(quiet))
            .register(Registration::new(shared(gadgets), record::<Gadget>, seen.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_every_registered_controller() {
        init_tracing();
        let widgets = FakeClient::new();
        widgets.seed(widget("w", Some("ns"), 1));
        let gadgets = FakeClient::new();
        gadgets.seed(gadget("g", "ns"));
        let (tx, mut seen) = mpsc::unbounded_channel();
        let registry = registry(&widgets, &gadgets, &Arc::new(tx));
        assert_eq!(registry.kinds(), vec!["Widget", "Gadget"]);

        let token = CancellationToken::new();
        let operator = Operator::new(registry, Arc::new(NoopElection), OperatorConfig::new("test"));
        let running = tokio::spawn(operator.run(token.clone()));

        let mut got = vec![seen.recv().await.unwrap(), seen.recv().await.unwrap()];
        got.sort();
        assert_eq!(got, vec![
            ("Gadget".to_string(), ResourceKey::new("g", Some("ns"))),
            ("Widget".to_string(), ResourceKey::new("w", Some("ns"))),
        ]);

        // gadgets declare a 30s resync interval, widgets opted out of resyncs
        let first = Instant::now();
        assert_eq!(seen.recv().await.unwrap().0, "Gadget");
        assert_eq!(first.elapsed(), Duration::from_secs(30));

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn informer_start_failures_are_retried() {
        let widgets = FakeClient::new();
        widgets.seed(widget("w", Some("ns"), 1));
        widgets.fail_next_lists(1);
        let gadgets = FakeClient::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let operator = Operator::new(
            registry(&widgets, &gadgets, &Arc::new(tx)),
            Arc::new(NoopElection),
            OperatorConfig::new("test"),
        );
        let token = CancellationToken::new();
        let started = Instant::now();
        let running = tokio::spawn(operator.run(token.clone()));

        let (kind, _) = seen.recv().await.unwrap();
        assert_eq!(kind, "Widget");
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        assert_eq!(widgets.list_count(), 2);

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_stalled_informer_start() {
        let widgets = FakeClient::new();
        widgets.stall_lists();
        let gadgets = FakeClient::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let operator = Operator::new(
            registry(&widgets, &gadgets, &Arc::new(tx)),
            Arc::new(NoopElection),
            OperatorConfig::new("test"),
        );
        let token = CancellationToken::new();
        let running = tokio::spawn(operator.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(widgets.list_count(), 1);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("operator kept waiting for the list")
            .unwrap();
        assert!(seen.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_runs_without_leadership() {
        let leases = FakeLeases::new();
        let mut config = OperatorConfig::new("test");
        config.leader_election.enabled = true;
        config.leader_election.identity = "second".into();
        leases.partition("second");

        let widgets = FakeClient::new();
        widgets.seed(widget("w", Some("ns"), 1));
        let gadgets = FakeClient::new();
        let (tx, mut seen) = mpsc::unbounded_channel();
        let operator =
            Operator::with_leases(registry(&widgets, &gadgets, &Arc::new(tx)), Arc::new(leases.clone()), config).unwrap();
        assert!(!operator.election.is_leader());

        let token = CancellationToken::new();
        let running = tokio::spawn(operator.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(seen.try_recv().is_err());
        assert_eq!(widgets.list_count(), 0);

        leases.heal("second");
        assert_eq!(seen.recv().await.unwrap().0, "Widget");

        token.cancel();
        running.await.unwrap();
    }

    #[test]
    fn disabled_election_always_leads() {
        let operator = Operator::with_leases(
            ControllerRegistry::new(),
            Arc::new(FakeLeases::new()),
            OperatorConfig::new("test"),
        )
        .unwrap();
        assert!(operator.election.is_leader());
        assert!(operator.registry.is_empty());
    }

    #[test]
    fn invalid_election_config_is_rejected() {
        let mut config = OperatorConfig::new("test");
        config.leader_election.enabled = true;
        config.leader_election.retry_period = Duration::from_secs(30);
        assert!(Operator::with_leases(ControllerRegistry::new(), Arc::new(FakeLeases::new()), config).is_err());
    }
}
