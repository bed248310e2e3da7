//! Two replicas of an operator sharing one fake cluster.
use kubeop::{prelude::*, runtime::client};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WidgetSpec {
    size: u32,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct WidgetStatus {
    observed_generation: i64,
}

impl ResourceSpec for WidgetSpec {
    const GROUP: &'static str = "example.com";
    const KIND: &'static str = "Widget";
    const PLURAL: &'static str = "widgets";
    const VERSION: &'static str = "v1";
}

type Widget = Object<WidgetSpec, WidgetStatus>;

fn widget(name: &str) -> Widget {
    Widget::new(name, WidgetSpec::default()).within("ns").with_generation(1)
}

#[derive(Debug, PartialEq)]
struct Seen {
    replica: String,
    name: String,
    generation: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
enum Error {
    #[error("failed to write status: {0}")]
    WriteStatus(#[source] client::Error),
}

struct Context {
    replica: String,
    client: Arc<dyn ResourceClient<Widget>>,
    seen: mpsc::UnboundedSender<Seen>,
}

async fn reconcile(req: ReconcileRequest<Widget>, ctx: Arc<Context>) -> Result<(), Error> {
    let _ = ctx.seen.send(Seen {
        replica: ctx.replica.clone(),
        name: req.key.name.clone(),
        generation: req.object.as_ref().map(|obj| obj.generation()),
    });
    let Some(obj) = req.object else {
        return Ok(());
    };
    let observed = obj.status.as_ref().map(|status| status.observed_generation);
    if observed != Some(obj.generation()) {
        let mut updated = (*obj).clone();
        updated.status = Some(WidgetStatus {
            observed_generation: obj.generation(),
        });
        ctx.client.replace_status(&updated).await.map_err(Error::WriteStatus)?;
    }
    Ok(())
}

fn replica(
    identity: &str,
    widgets: &FakeClient<Widget>,
    leases: &FakeLeases,
    seen: &mpsc::UnboundedSender<Seen>,
    token: &CancellationToken,
) -> JoinHandle<()> {
    let client: Arc<dyn ResourceClient<Widget>> = Arc::new(widgets.clone());
    let context = Arc::new(Context {
        replica: identity.to_string(),
        client: client.clone(),
        seen: seen.clone(),
    });
    let registry = ControllerRegistry::new().register(Registration::new(client, reconcile, context));

    let mut config = OperatorConfig::new("widgets");
    config.leader_election.enabled = true;
    config.leader_election.identity = identity.to_string();
    config.controller = ControllerConfig::default().disable_resync();
    let operator = Operator::with_leases(registry, Arc::new(leases.clone()), config).unwrap();
    tokio::spawn(operator.run(token.clone()))
}

async fn next(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
    tokio::time::timeout(Duration::from_secs(120), seen.recv())
        .await
        .expect("timed out waiting for a reconcile")
        .expect("every replica stopped")
}

async fn next_two(seen: &mut mpsc::UnboundedReceiver<Seen>) -> Vec<Seen> {
    let mut both = vec![next(seen).await, next(seen).await];
    both.sort_by(|a, b| a.name.cmp(&b.name));
    both
}

fn seen(replica: &str, name: &str, generation: Option<i64>) -> Seen {
    Seen {
        replica: replica.to_string(),
        name: name.to_string(),
        generation,
    }
}

#[tokio::test(start_paused = true)]
async fn only_the_leader_reconciles_and_a_follower_takes_over() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let widgets = FakeClient::new();
    widgets.seed(widget("alpha"));
    widgets.seed(widget("beta"));
    let leases = FakeLeases::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let token = CancellationToken::new();
    let replicas = [
        replica("a", &widgets, &leases, &tx, &token),
        replica("b", &widgets, &leases, &tx, &token),
    ];

    // whoever wins the lease reconciles every existing object
    let first = next_two(&mut rx).await;
    let leader = first[0].replica.clone();
    let follower = if leader == "a" { "b" } else { "a" };
    assert_eq!(first, vec![seen(&leader, "alpha", Some(1)), seen(&leader, "beta", Some(1))]);
    assert_eq!(leases.holder("widgets-leader-election", "default").as_deref(), Some(leader.as_str()));

    // a spec change is reconciled once, the status write it causes is not
    let mut alpha = widgets.get("ns", "alpha").unwrap();
    assert_eq!(alpha.status.as_ref().unwrap().observed_generation, 1);
    alpha.spec.size = 3;
    alpha.metadata.generation = Some(2);
    widgets.apply(alpha);
    assert_eq!(next(&mut rx).await, seen(&leader, "alpha", Some(2)));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(widgets.get("ns", "alpha").unwrap().status.unwrap().observed_generation, 2);

    // the leader loses its connection, the follower relists and takes over
    leases.partition(&leader);
    let second = next_two(&mut rx).await;
    assert_eq!(second, vec![seen(follower, "alpha", Some(2)), seen(follower, "beta", Some(1))]);
    assert_eq!(leases.holder("widgets-leader-election", "default").as_deref(), Some(follower));

    widgets.delete("ns", "beta");
    assert_eq!(next(&mut rx).await, seen(follower, "beta", None));

    token.cancel();
    for replica in replicas {
        replica.await.unwrap();
    }
    assert_eq!(leases.holder("widgets-leader-election", "default"), None);
}

#[tokio::test]
async fn single_replica_without_election() {
    let widgets = FakeClient::new();
    widgets.seed(widget("alpha"));
    let client: Arc<dyn ResourceClient<Widget>> = Arc::new(widgets.clone());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let context = Arc::new(Context {
        replica: "solo".into(),
        client: client.clone(),
        seen: tx,
    });
    let registry = ControllerRegistry::new().register(Registration::new(client, reconcile, context));
    let operator = Operator::with_leases(registry, Arc::new(FakeLeases::new()), OperatorConfig::new("widgets")).unwrap();
    let token = CancellationToken::new();
    let running = tokio::spawn(operator.run(token.clone()));

    assert_eq!(next(&mut rx).await, seen("solo", "alpha", Some(1)));
    widgets.apply(widget("gamma"));
    assert_eq!(next(&mut rx).await, seen("solo", "gamma", Some(1)));

    token.cancel();
    running.await.unwrap();
}
