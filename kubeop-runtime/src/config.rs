//! Operator level configuration.
use crate::{controller::ControllerConfig, election::LeaderElectionConfig, informer::InformerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// (De)serialize a [`Duration`] in the interval grammar, e.g. `"15s"` or `"2h30m"`
///
/// For use with `#[serde(with = "...")]`.
pub mod interval {
    use kubeop_core::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize as an interval string
    pub fn serialize<S: Serializer>(value: &std::time::Duration, serializer: S) -> Result<S::Ok, S::Error> {
        Duration::from(*value).serialize(serializer)
    }

    /// Deserialize from an interval string
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<std::time::Duration, D::Error> {
        Duration::deserialize(deserializer).map(Into::into)
    }
}

/// Everything needed to run an [`Operator`](crate::Operator)
///
/// Deserializable from the usual configuration formats, with every field optional:
///
/// ```
/// # use kubeop_runtime::OperatorConfig;
/// let config: OperatorConfig = serde_json::from_str(r#"{
///     "name": "widgets",
///     "leaderElection": { "enabled": true, "leaseDuration": "30s", "renewDeadline": "20s" },
///     "controller": { "resyncTick": "1m" }
/// }"#).unwrap();
/// assert_eq!(config.leader_election.lease_duration.as_secs(), 30);
/// assert_eq!(config.controller.resync_tick.as_secs(), 60);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// The name of the operator, used in logs and for the default lease name
    pub name: String,

    /// The namespace the operator runs in, used for the default lease namespace
    pub namespace: String,

    /// Settings applied to every informer
    pub informer: InformerConfig,

    /// Settings applied to every controller
    pub controller: ControllerConfig,

    /// Leader election settings
    pub leader_election: LeaderElectionConfig,

    /// How long to wait before retrying a failed operator cycle
    #[serde(with = "interval")]
    pub retry_delay: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            name: "operator".into(),
            namespace: "default".into(),
            informer: InformerConfig::default(),
            controller: ControllerConfig::default(),
            leader_election: LeaderElectionConfig::default(),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl OperatorConfig {
    /// Creates a config with defaults for an operator called `name`
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
        .with_lease_defaults()
    }

    /// Fills in a config from the process environment
    ///
    /// | variable                                 | field                        |
    /// |------------------------------------------|------------------------------|
    /// | `OPERATOR_NAME`                          | `name`                       |
    /// | `OPERATOR_NAMESPACE` or `POD_NAMESPACE`  | `namespace`                  |
    /// | `POD_NAME` or `HOSTNAME`                 | `leader_election.identity`   |
    /// | `OPERATOR_LEADER_ELECTION`               | `leader_election.enabled`    |
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(name) = lookup("OPERATOR_NAME") {
            config.name = name;
        }
        if let Some(ns) = lookup("OPERATOR_NAMESPACE").or_else(|| lookup("POD_NAMESPACE")) {
            config.namespace = ns;
        }
        if let Some(identity) = lookup("POD_NAME").or_else(|| lookup("HOSTNAME")) {
            config.leader_election.identity = identity;
        }
        if let Some(enabled) = lookup("OPERATOR_LEADER_ELECTION") {
            config.leader_election.enabled = matches!(enabled.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.with_lease_defaults()
    }

    /// Derive unset lease settings from the operator name and namespace
    ///
    /// The lease is called `<name>-leader-election` and lives in the operator namespace.
    #[must_use]
    pub fn with_lease_defaults(mut self) -> Self {
        let election = &mut self.leader_election;
        if election.lease_name.is_empty() {
            election.lease_name = format!("{}-leader-election", self.name);
        }
        if election.lease_namespace.is_empty() {
            election.lease_namespace = self.namespace.clone();
        }
        if election.identity.is_empty() {
            election.identity = format!("{}-{:08x}", self.name, rand::random::<u32>());
        }
        self
    }
}
