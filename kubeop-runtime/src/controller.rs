//! Runs a reconciler for every object of one kind.
//!
//! A [`Controller`] turns the changes published by an [`Informer`] into keys on a
//! [`WorkQueue`] and hands them, one at a time, to a user supplied reconciler. Besides
//! reacting to changes it periodically re-enqueues every object whose resync interval
//! has elapsed, so that drift is corrected even when nothing changes on the server.
use crate::{
    cache::ResourceCache,
    config::interval,
    informer::{Event, EventStream, Informer},
    queue::WorkQueue,
};
use ahash::AHashMap;
use futures::{Future, FutureExt, StreamExt};
use kubeop_core::{parse_interval, Resource, ResourceKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Configuration for a [`Controller`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Periodically re-enqueue objects whose resync interval has elapsed
    pub resync_enabled: bool,

    /// How often the resync schedule is scanned
    #[serde(with = "interval")]
    pub resync_tick: Duration,

    /// How long to wait before retrying a failed reconcile
    #[serde(with = "interval")]
    pub error_backoff: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_enabled: true,
            resync_tick: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
        }
    }
}

impl ControllerConfig {
    /// Only reconcile in response to changes
    #[must_use]
    pub fn disable_resync(mut self) -> Self {
        self.resync_enabled = false;
        self
    }

    /// Set how often the resync schedule is scanned
    #[must_use]
    pub fn resync_tick(mut self, tick: Duration) -> Self {
        self.resync_tick = tick;
        self
    }

    /// Set the delay before a failed reconcile is retried
    #[must_use]
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// The lifecycle of a [`Controller`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Created, or waiting for the informer to sync
    Idle,
    /// Reconciling
    Running,
    /// Cancelled, waiting for background tasks to finish
    Draining,
    /// Done
    Stopped,
}

/// When an object is due for its next periodic reconcile
#[derive(Clone, Copy, Debug)]
struct ResourceSchedule {
    last_reconciled: Instant,
    interval: Duration,
    next_reconciliation: Instant,
}

impl ResourceSchedule {
    fn starting_now(interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            last_reconciled: now,
            interval,
            next_reconciliation: now + interval,
        }
    }
}

type Schedules = Arc<Mutex<AHashMap<ResourceKey, ResourceSchedule>>>;
type ResyncFn<K> = Arc<dyn Fn(&K) -> Option<Duration> + Send + Sync>;

/// A single reconcile invocation
///
/// The object is read from the cache when the key is dequeued, not when it was enqueued,
/// and is `None` if the object no longer exists.
pub struct ReconcileRequest<K> {
    /// The object to reconcile
    pub key: ResourceKey,
    /// The current cached state of the object
    pub object: Option<Arc<K>>,
    /// Cancelled when the controller stops
    pub token: CancellationToken,
    cache: ResourceCache<K>,
    queue: WorkQueue<ResourceKey>,
}

impl<K> ReconcileRequest<K> {
    /// Read access to every cached object of this kind
    #[must_use]
    pub fn store(&self) -> &ResourceCache<K> {
        &self.cache
    }

    /// Reconcile this object again after `delay`
    pub fn requeue(&self, delay: Duration) {
        self.queue.requeue(self.key.clone(), Some(delay), &self.token);
    }
}

/// Reconciles every object of kind `K` known to an [`Informer`]
///
/// The reconciler is called with a [`ReconcileRequest`] and the shared context. It must be
/// idempotent: the same key can be handed out several times in a row. Errors are logged
/// and the key is retried after [`ControllerConfig::error_backoff`]; they never stop the
/// controller.
pub struct Controller<K, R, Ctx> {
    informer: Arc<Informer<K>>,
    events: EventStream<K>,
    reconciler: R,
    context: Arc<Ctx>,
    config: ControllerConfig,
    resync: ResyncFn<K>,
    queue: WorkQueue<ResourceKey>,
    schedules: Schedules,
    state: watch::Sender<ControllerState>,
}

impl<K, R, Ctx> Controller<K, R, Ctx>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    /// Create a controller that reconciles the objects of `informer`
    ///
    /// The controller subscribes to the informer right away, so every event published from
    /// here on is seen by [`run`](Self::run), including those published before it starts.
    pub fn new(informer: Arc<Informer<K>>, reconciler: R, context: Arc<Ctx>) -> Self {
        Self {
            events: informer.subscribe(),
            informer,
            reconciler,
            context,
            config: ControllerConfig::default(),
            resync: Arc::new(|_| None),
            queue: WorkQueue::new(),
            schedules: Arc::default(),
            state: watch::channel(ControllerState::Idle).0,
        }
    }

    /// Replace the configuration
    #[must_use]
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Decide the resync interval per object
    ///
    /// When this returns `None`, or is not set, the interval declared by the kind through
    /// [`Resource::resync_interval`] is used, and five minutes when none is declared.
    #[must_use]
    pub fn resync_interval(mut self, resync: impl Fn(&K) -> Option<Duration> + Send + Sync + 'static) -> Self {
        self.resync = Arc::new(resync);
        self
    }

    /// Use an existing queue instead of a fresh one
    #[must_use]
    pub fn queue(mut self, queue: WorkQueue<ResourceKey>) -> Self {
        self.queue = queue;
        self
    }

    /// Observe the lifecycle of this controller
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ControllerState> {
        self.state.subscribe()
    }

    /// Reconcile until `token` is cancelled
    ///
    /// Nothing is reconciled before the informer has synced. On cancellation the
    /// in-flight reconcile is allowed to finish, after which the background tasks are
    /// stopped and awaited.
    pub async fn run<Fut, E>(self, token: CancellationToken)
    where
        R: Fn(ReconcileRequest<K>, Arc<Ctx>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let Self {
            informer,
            events,
            reconciler,
            context,
            config,
            resync,
            queue,
            schedules,
            state,
        } = self;
        let kind = K::kind();

        if !informer.wait_for_sync(&token).await {
            transition(&state, &kind, ControllerState::Stopped);
            return;
        }
        transition(&state, &kind, ControllerState::Running);

        let cache = informer.store();
        let declared = parse_interval(&K::resync_interval().unwrap_or_default());
        let background = token.child_token();
        let pump = tokio::spawn(pump_events(
            events,
            queue.clone(),
            schedules.clone(),
            background.clone(),
        ));
        let scheduler = config.resync_enabled.then(|| {
            tokio::spawn(schedule_resyncs(
                cache.clone(),
                queue.clone(),
                schedules.clone(),
                config.resync_tick,
                background.clone(),
            ))
        });

        while let Some(key) = queue.dequeue(&token).await {
            let request = ReconcileRequest {
                key: key.clone(),
                object: cache.get_key(&key),
                token: token.child_token(),
                cache: cache.clone(),
                queue: queue.clone(),
            };
            let span = tracing::info_span!("reconcile", kind = %kind, key = %key);
            let reconciled = AssertUnwindSafe(async { reconciler(request, context.clone()).await })
                .catch_unwind()
                .instrument(span)
                .await;
            match reconciled {
                Ok(Ok(())) => {
                    debug!(kind = %kind, key = %key, "reconciled");
                    if let Some(obj) = cache.get_key(&key) {
                        let interval = resync(&obj).unwrap_or(declared);
                        schedules.lock().insert(key, ResourceSchedule::starting_now(interval));
                    }
                }
                Ok(Err(err)) => {
                    error!(
                        kind = %kind,
                        key = %key,
                        error = &err as &(dyn std::error::Error + 'static),
                        "reconcile failed, retrying in {:?}",
                        config.error_backoff
                    );
                    queue.requeue(key, Some(config.error_backoff), &token);
                }
                Err(panic) => {
                    error!(
                        kind = %kind,
                        key = %key,
                        panic = panic_message(&*panic),
                        "reconciler panicked, retrying in {:?}",
                        config.error_backoff
                    );
                    queue.requeue(key, Some(config.error_backoff), &token);
                }
            }
        }

        transition(&state, &kind, ControllerState::Draining);
        background.cancel();
        queue.shutdown();
        for task in std::iter::once(pump).chain(scheduler) {
            if let Err(err) = task.await {
                error!(kind = %kind, error = %err, "controller task failed");
            }
        }
        transition(&state, &kind, ControllerState::Stopped);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

fn transition(state: &watch::Sender<ControllerState>, kind: &str, next: ControllerState) {
    let previous = state.send_replace(next);
    if previous != next {
        info!(kind, from = ?previous, to = ?next, "controller state changed");
    }
}

/// Forward every informer event to the queue
async fn pump_events<K: Resource>(
    mut events: EventStream<K>,
    queue: WorkQueue<ResourceKey>,
    schedules: Schedules,
    token: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = token.cancelled() => break,
            event = events.next() => event,
        };
        let Some(event) = event else { break };
        let key = ResourceKey::from_obj(event.object().as_ref());
        if let Event::Deleted(_) = event {
            schedules.lock().remove(&key);
        }
        queue.enqueue(key);
    }
}

/// Enqueue objects that were never reconciled or whose schedule is due
///
/// The first scan happens one tick after start.
async fn schedule_resyncs<K: Resource>(
    cache: ResourceCache<K>,
    queue: WorkQueue<ResourceKey>,
    schedules: Schedules,
    tick: Duration,
    token: CancellationToken,
) {
    let tick = tick.max(Duration::from_millis(1));
    let mut ticks = tokio::time::interval_at(Instant::now() + tick, tick);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            _ = ticks.tick() => {}
        }
        let now = Instant::now();
        let due = {
            let schedules = schedules.lock();
            cache
                .keys()
                .into_iter()
                .filter(|key| match schedules.get(key) {
                    None => true,
                    Some(schedule) if schedule.next_reconciliation <= now => {
                        debug!(
                            kind = %K::kind(),
                            key = %key,
                            interval = ?schedule.interval,
                            since = ?now.duration_since(schedule.last_reconciled),
                            "resync due"
                        );
                        true
                    }
                    Some(_) => false,
                })
                .collect::<Vec<_>>()
        };
        for key in due {
            queue.enqueue(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Controller, ControllerConfig, ControllerState, ReconcileRequest};
    use crate::{
        fake::FakeClient,
        informer::{Informer, InformerConfig},
        test_utils::{init_tracing, widget, Widget},
    };
    use kubeop_core::{ResourceExt, ResourceKey};
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::{sync::mpsc, time::Instant};
    use tokio_util::sync::CancellationToken;

    #[derive(Debug, thiserror::Error)]
    #[error("reconcile exploded")]
    struct Boom;

    struct Ctx {
        seen: mpsc::UnboundedSender<(ResourceKey, Option<i64>)>,
        failures: AtomicUsize,
        requeue_once: Option<Duration>,
        calls: AtomicUsize,
    }

    impl Ctx {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(ResourceKey, Option<i64>)>) {
            let (seen, rx) = mpsc::unbounded_channel();
            let ctx = Ctx {
                seen,
                failures: AtomicUsize::new(0),
                requeue_once: None,
                calls: AtomicUsize::new(0),
            };
            (Arc::new(ctx), rx)
        }
    }

    async fn reconcile(req: ReconcileRequest<Widget>, ctx: Arc<Ctx>) -> Result<(), Boom> {
        let _ = ctx.seen.send((req.key.clone(), req.object.as_ref().map(|obj| obj.generation())));
        let call = ctx.calls.fetch_add(1, Ordering::SeqCst);
        if let (0, Some(delay)) = (call, ctx.requeue_once) {
            req.requeue(delay);
        }
        if ctx.failures.load(Ordering::SeqCst) > 0 {
            ctx.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(Boom);
        }
        Ok(())
    }

    fn informer(client: &FakeClient<Widget>) -> Arc<Informer<Widget>> {
        Arc::new(Informer::new(Arc::new(client.clone()), InformerConfig::default()))
    }

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(name, Some("ns"))
    }

    #[tokio::test(start_paused = true)]
    async fn reconciles_existing_objects_once_synced() {
        init_tracing();
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .config(ControllerConfig::default().disable_resync());
        let mut state = controller.state();
        let token = CancellationToken::new();
        let running = tokio::spawn(controller.run(token.clone()));

        // nothing happens against an unsynced cache
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(seen.try_recv().is_err());
        assert_eq!(*state.borrow(), ControllerState::Idle);

        let _informer_task = informer.start(token.clone()).await.unwrap();
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        assert_eq!(*state.borrow_and_update(), ControllerState::Running);

        token.cancel();
        running.await.unwrap();
        assert_eq!(*state.borrow(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_before_sync_stops_the_controller() {
        let client = FakeClient::<Widget>::new();
        let (ctx, _seen) = Ctx::new();
        let controller = Controller::new(informer(&client), reconcile, ctx);
        let state = controller.state();
        let token = CancellationToken::new();
        token.cancel();
        controller.run(token).await;
        assert_eq!(*state.borrow(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_reconciles_are_retried_after_backoff() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        ctx.failures.store(1, Ordering::SeqCst);
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .config(ControllerConfig::default().disable_resync());
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let running = tokio::spawn(controller.run(token.clone()));

        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        let failed_at = Instant::now();
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        assert_eq!(failed_at.elapsed(), Duration::from_secs(5));

        token.cancel();
        running.await.unwrap();
    }

    async fn panic_once(req: ReconcileRequest<Widget>, ctx: Arc<Ctx>) -> Result<(), Boom> {
        let _ = ctx.seen.send((req.key.clone(), req.object.as_ref().map(|obj| obj.generation())));
        if ctx.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("reconciler bug");
        }
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_reconciles_are_retried_after_backoff() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), panic_once, ctx)
            .config(ControllerConfig::default().disable_resync());
        let state = controller.state();
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let running = tokio::spawn(controller.run(token.clone()));

        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        let panicked_at = Instant::now();
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        assert_eq!(panicked_at.elapsed(), Duration::from_secs(5));

        client.wait_for_watchers(1).await;
        client.apply(widget("b", Some("ns"), 1));
        assert_eq!(seen.recv().await, Some((key("b"), Some(1))));
        assert_eq!(*state.borrow(), ControllerState::Running);

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn spec_change_is_reconciled_once_before_the_first_resync_tick() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), reconcile, ctx);
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let started = Instant::now();
        let running = tokio::spawn(controller.run(token.clone()));
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        client.wait_for_watchers(1).await;

        client.apply(widget("a", Some("ns"), 2));
        assert_eq!(seen.recv().await, Some((key("a"), Some(2))));
        assert!(started.elapsed() < Duration::from_secs(10));
        // the first resync tick finds the object freshly reconciled
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert!(seen.try_recv().is_err());

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reconciler_can_ask_for_a_requeue() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (seen_tx, mut seen) = mpsc::unbounded_channel();
        let ctx = Arc::new(Ctx {
            seen: seen_tx,
            failures: AtomicUsize::new(0),
            requeue_once: Some(Duration::from_secs(2)),
            calls: AtomicUsize::new(0),
        });
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .config(ControllerConfig::default().disable_resync());
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let running = tokio::spawn(controller.run(token.clone()));

        seen.recv().await;
        let first = Instant::now();
        seen.recv().await;
        assert_eq!(first.elapsed(), Duration::from_secs(2));

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_reconciles_again_once_the_interval_elapses() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .resync_interval(|_| Some(Duration::from_secs(30)));
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let started = Instant::now();
        let running = tokio::spawn(controller.run(token.clone()));

        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        // the 30s schedule is noticed on the tick at 30s
        assert_eq!(started.elapsed(), Duration::from_secs(30));

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn first_scan_picks_up_objects_without_events() {
        let client = FakeClient::new();
        client.seed(widget("quiet", Some("ns"), 1));
        let informer = informer(&client);
        let token = CancellationToken::new();
        // the initial events are published before anyone subscribes
        let _informer_task = informer.start(token.clone()).await.unwrap();
        client.wait_for_watchers(1).await;

        let (ctx, mut seen) = Ctx::new();
        let started = Instant::now();
        let running = tokio::spawn(Controller::new(informer.clone(), reconcile, ctx).run(token.clone()));

        assert_eq!(seen.recv().await, Some((key("quiet"), Some(1))));
        assert_eq!(started.elapsed(), Duration::from_secs(10));

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn deleted_objects_are_reconciled_without_object() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .config(ControllerConfig::default().disable_resync());
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let running = tokio::spawn(controller.run(token.clone()));
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));

        client.wait_for_watchers(1).await;
        client.delete("ns", "a");
        assert_eq!(seen.recv().await, Some((key("a"), None)));
        assert!(informer.get("a", Some("ns")).is_none());

        token.cancel();
        running.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn only_generation_changes_trigger_reconciles() {
        let client = FakeClient::new();
        client.seed(widget("a", Some("ns"), 1));
        let informer = informer(&client);
        let (ctx, mut seen) = Ctx::new();
        let controller = Controller::new(informer.clone(), reconcile, ctx)
            .config(ControllerConfig::default().disable_resync());
        let token = CancellationToken::new();
        let _informer_task = informer.start(token.clone()).await.unwrap();
        let running = tokio::spawn(controller.run(token.clone()));
        assert_eq!(seen.recv().await, Some((key("a"), Some(1))));
        client.wait_for_watchers(1).await;

        let mut same_generation = client.get("ns", "a").unwrap();
        same_generation.spec.size = 3;
        client.apply(same_generation);
        client.apply(widget("a", Some("ns"), 2));
        assert_eq!(seen.recv().await, Some((key("a"), Some(2))));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(seen.try_recv().is_err());

        token.cancel();
        running.await.unwrap();
    }
}
