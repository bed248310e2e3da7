//! Leader election gating which replica runs the controllers.
//!
//! The [`LeaseElector`] competes for a lease through a [`LeaseClient`]. A client only acts
//! on timestamps captured locally: a leader considers itself leading for at most
//! `renew_deadline` after the start of its last successful renewal, which is shorter than
//! the `lease_duration` the server grants. Any other replica has to wait for the full lease
//! duration before it can take over, so a partitioned leader always steps down before a
//! new one is elected, as long as clocks progress at a comparable rate.
//!
//! This does not guarantee that only one client is acting as a leader (a.k.a. fencing):
//! work started before stepping down may still be completing.
use crate::{client::LeaseClient, config::interval};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::watch,
    time::{timeout, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The jitter factor applied to follower retries.
const JITTER_FACTOR: f64 = 1.2;

/// Leader election error variants.
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration is not usable
    #[error("invalid leader election config: {0}")]
    ConfigError(String),
}

/// Leader election result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Configuration for leader election
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LeaderElectionConfig {
    /// Whether to compete for a lease at all
    ///
    /// When disabled every replica considers itself the leader.
    pub enabled: bool,

    /// The name of the lease object
    pub lease_name: String,

    /// The namespace of the lease object
    pub lease_namespace: String,

    /// The identity written into the lease when it is acquired
    ///
    /// Typically the name of the pod running this process.
    pub identity: String,

    /// How long an acquired lease is valid without renewal
    ///
    /// Other candidates have to wait this long before taking over an abandoned lease.
    #[serde(with = "interval")]
    pub lease_duration: Duration,

    /// How long the leader keeps acting as such without a successful renewal
    #[serde(with = "interval")]
    pub renew_deadline: Duration,

    /// How long to wait between attempts
    #[serde(with = "interval")]
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            lease_name: String::new(),
            lease_namespace: String::new(),
            identity: String::new(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaderElectionConfig {
    /// Compete for `lease_name` in `namespace` as `identity`, with default timings
    #[must_use]
    pub fn new(lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            enabled: true,
            lease_name: lease_name.into(),
            lease_namespace: namespace.into(),
            identity: identity.into(),
            ..Self::default()
        }
    }

    /// Check that the timings leave a leader time to step down
    ///
    /// # Errors
    /// Will return `Error::ConfigError` if the fields are invalid according to the following
    /// constraints:
    /// - `identity`, `lease_name` and `lease_namespace` must not be empty;
    /// - `lease_duration` must be greater than `renew_deadline`;
    /// - `renew_deadline` must be greater than `JITTER_FACTOR * retry_period`;
    /// - `retry_period` must not be zero.
    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(Error::ConfigError("identity may not be empty".into()));
        }
        if self.lease_name.is_empty() || self.lease_namespace.is_empty() {
            return Err(Error::ConfigError("lease name and namespace may not be empty".into()));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(Error::ConfigError(
                "lease_duration must be greater than renew_deadline".into(),
            ));
        }
        if self.renew_deadline <= self.retry_period.mul_f64(JITTER_FACTOR) {
            return Err(Error::ConfigError(format!(
                "renew_deadline must be greater than retry_period*{JITTER_FACTOR}"
            )));
        }
        if self.retry_period.is_zero() {
            return Err(Error::ConfigError("retry_period may not be zero".into()));
        }
        Ok(())
    }
}

/// The leadership state of this replica
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderState {
    /// Another replica holds the lease, or the lease is unknown
    Follower,
    /// Attempting to acquire the lease
    Candidate,
    /// This replica holds the lease
    Leader,
}

impl LeaderState {
    /// Whether this state is [`LeaderState::Leader`]
    #[must_use]
    pub fn is_leader(self) -> bool {
        matches!(self, Self::Leader)
    }
}

/// Decides whether this replica may run controllers
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Whether this replica currently leads
    fn is_leader(&self) -> bool;

    /// Compete for leadership until `token` is cancelled
    async fn run(&self, token: CancellationToken);

    /// Wait until this replica leads
    ///
    /// Returns `false` if `token` was cancelled first.
    async fn wait_for_leadership(&self, token: &CancellationToken) -> bool;

    /// Wait until this replica no longer leads, or `token` is cancelled
    async fn wait_for_leadership_lost(&self, token: &CancellationToken);
}

/// Competes for a lease through a [`LeaseClient`]
pub struct LeaseElector {
    client: Arc<dyn LeaseClient>,
    config: LeaderElectionConfig,
    state: watch::Sender<LeaderState>,
}

impl LeaseElector {
    /// Create an elector which starts as [`LeaderState::Follower`]
    ///
    /// # Errors
    /// Fails when `config` does not [validate](LeaderElectionConfig::validate).
    pub fn new(client: Arc<dyn LeaseClient>, config: LeaderElectionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            client,
            config,
            state: watch::channel(LeaderState::Follower).0,
        })
    }

    /// Observe the leadership state
    #[must_use]
    pub fn state(&self) -> watch::Receiver<LeaderState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: LeaderState) {
        let previous = self.state.send_replace(next);
        match (previous.is_leader(), next.is_leader()) {
            (false, true) => info!(identity = %self.config.identity, lease = %self.config.lease_name, "acquired leadership"),
            (true, false) => warn!(identity = %self.config.identity, lease = %self.config.lease_name, "lost leadership"),
            _ if previous != next => debug!(from = ?previous, to = ?next, "leader election state changed"),
            _ => {}
        }
    }

    fn follower_delay(&self) -> Duration {
        self.config
            .retry_period
            .mul_f64(rand::rng().random_range(1.0..JITTER_FACTOR))
    }

    #[tracing::instrument(skip_all, fields(identity = %self.config.identity, lease = %self.config.lease_name))]
    async fn campaign(&self, token: CancellationToken) {
        let config = &self.config;
        info!("leader elector started");
        // start of the last attempt that the server accepted
        let mut last_renewed: Option<Instant> = None;

        loop {
            let renew_by = last_renewed.map(|at| at + config.renew_deadline);
            if self.is_leader() && renew_by.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!("could not renew lease within {:?}", config.renew_deadline);
                last_renewed = None;
                self.set_state(LeaderState::Follower);
            }
            let leading = self.is_leader();
            if !leading {
                self.set_state(LeaderState::Candidate);
            }

            let started = Instant::now();
            let deadline = match renew_by {
                Some(deadline) if leading => deadline,
                _ => started + config.renew_deadline,
            };
            let attempt = tokio::select! {
                () = token.cancelled() => break,
                attempt = timeout_at(deadline, self.client.try_acquire_or_renew(
                    &config.lease_name,
                    &config.lease_namespace,
                    &config.identity,
                    config.lease_duration,
                )) => attempt,
            };
            match attempt {
                Ok(Ok(true)) => {
                    last_renewed = Some(started);
                    self.set_state(LeaderState::Leader);
                }
                Ok(Ok(false)) => {
                    if leading {
                        warn!("lease was taken over");
                    }
                    last_renewed = None;
                    self.set_state(LeaderState::Follower);
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "failed to acquire or renew lease");
                    if !leading {
                        self.set_state(LeaderState::Follower);
                    }
                }
                Err(_elapsed) => {
                    warn!("timed out acquiring or renewing lease");
                    if !leading {
                        self.set_state(LeaderState::Follower);
                    }
                }
            }

            let delay = match last_renewed {
                Some(at) if self.is_leader() => config
                    .retry_period
                    .min((at + config.renew_deadline).saturating_duration_since(Instant::now())),
                _ => self.follower_delay(),
            };
            tokio::select! {
                () = token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        if self.is_leader() {
            self.release().await;
        }
        self.set_state(LeaderState::Follower);
        info!("leader elector stopped");
    }

    async fn release(&self) {
        let config = &self.config;
        let released = timeout(
            config.retry_period,
            self.client
                .release(&config.lease_name, &config.lease_namespace, &config.identity),
        )
        .await;
        match released {
            Ok(Ok(())) => info!(lease = %config.lease_name, "released lease"),
            Ok(Err(err)) => warn!(lease = %config.lease_name, error = %err, "failed to release lease"),
            Err(_elapsed) => warn!(lease = %config.lease_name, "timed out releasing lease"),
        }
    }
}

#[async_trait]
impl LeaderElection for LeaseElector {
    fn is_leader(&self) -> bool {
        self.state.borrow().is_leader()
    }

    async fn run(&self, token: CancellationToken) {
        self.campaign(token).await;
    }

    async fn wait_for_leadership(&self, token: &CancellationToken) -> bool {
        let mut state = self.state.subscribe();
        tokio::select! {
            res = state.wait_for(|state| state.is_leader()) => res.is_ok(),
            () = token.cancelled() => false,
        }
    }

    async fn wait_for_leadership_lost(&self, token: &CancellationToken) {
        let mut state = self.state.subscribe();
        tokio::select! {
            _ = state.wait_for(|state| !state.is_leader()) => {}
            () = token.cancelled() => {}
        }
    }
}

/// Leadership for single replica deployments
///
/// Always leads, and only stops leading when cancelled.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopElection;

#[async_trait]
impl LeaderElection for NoopElection {
    fn is_leader(&self) -> bool {
        true
    }

    async fn run(&self, token: CancellationToken) {
        token.cancelled().await;
    }

    async fn wait_for_leadership(&self, _token: &CancellationToken) -> bool {
        true
    }

    async fn wait_for_leadership_lost(&self, token: &CancellationToken) {
        token.cancelled().await;
    }
}
