use crate::kafka::BrokerConfig;
use crate::storage::s3::S3Config;
use std::env;
use std::time::Duration;

const CONSUMER_GROUP_BASE: &str = "minio-deduplication";
const DEFAULT_FETCH_MAX_WAIT: Duration = Duration::from_secs(1);

/// Runtime configuration. Flags come from the command line; broker settings
/// come from the environment and select broker mode when present.
#[derive(Debug, Clone)]
pub struct Config {
    pub inbox: String,
    pub archive: String,
    pub host: String,
    pub secure: bool,
    pub access_key: String,
    pub secret_key: String,
    pub metrics_listen: String,
    pub trace: bool,
    pub batch: bool,
    pub batchmetrics: bool,
    /// Delay before restarting the watcher loop; zero restarts immediately.
    pub restart_delay: Duration,
    pub index_write: bool,
    pub broker: Option<BrokerConfig>,
}

impl Config {
    /// Flag combinations that cannot run.
    pub fn validate(&self) -> Result<(), String> {
        if self.batchmetrics && !self.batch {
            return Err("batchmetrics without batch".to_string());
        }
        if self.index_write && !self.batch {
            return Err(
                "index only allowed in batch mode, TBD when to serialize in watch mode".to_string(),
            );
        }
        if self.batch && self.broker.is_some() {
            return Err("batch and broker notification mode cannot be combined".to_string());
        }
        Ok(())
    }

    pub fn s3_config(&self) -> S3Config {
        S3Config {
            host: self.host.clone(),
            secure: self.secure,
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            trace: self.trace,
        }
    }
}

/// Broker-related environment, read once at startup.
#[derive(Debug, Clone, Default)]
pub struct BrokerEnv {
    pub bootstrap: Option<String>,
    pub topic: Option<String>,
    pub consumer_group: Option<String>,
    pub fetch_max_wait: Option<String>,
    pub pod_namespace: Option<String>,
    pub host: Option<String>,
}

impl BrokerEnv {
    pub fn from_env() -> Self {
        let read = |name: &str| env::var(name).ok().filter(|value| !value.is_empty());
        Self {
            bootstrap: read("KAFKA_BOOTSTRAP"),
            topic: read("KAFKA_TOPIC"),
            consumer_group: read("KAFKA_CONSUMER_GROUP"),
            fetch_max_wait: read("KAFKA_FETCH_MAX_WAIT"),
            pod_namespace: read("POD_NAMESPACE"),
            host: read("HOST"),
        }
    }
}

/// Build the broker configuration when `KAFKA_BOOTSTRAP` selects broker
/// mode. The record-key filter is pinned to the inbox bucket because the
/// store keys notifications as `<bucket>/<object>`.
pub fn broker_config(env: &BrokerEnv, inbox: &str) -> Result<Option<BrokerConfig>, String> {
    let Some(bootstrap) = &env.bootstrap else {
        return Ok(None);
    };
    let fetch_max_wait = match &env.fetch_max_wait {
        Some(value) => humantime::parse_duration(value)
            .map_err(|err| format!("failed to parse KAFKA_FETCH_MAX_WAIT {value:?}: {err}"))?,
        None => DEFAULT_FETCH_MAX_WAIT,
    };
    Ok(Some(BrokerConfig {
        bootstrap: bootstrap
            .split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect(),
        topics: vec![env.topic.clone().unwrap_or_default()],
        consumer_group: consumer_group_name(env)?,
        fetch_max_wait,
        key_prefix: Some(format!("{inbox}/")),
    }))
}

/// Resolve the consumer group id: configured value, then a namespace-derived
/// guess, then the hostname. No usable source is a configuration error.
pub fn consumer_group_name(env: &BrokerEnv) -> Result<String, String> {
    if let Some(group) = &env.consumer_group {
        return Ok(group.clone());
    }
    if let Some(namespace) = &env.pod_namespace {
        let name = format!("{CONSUMER_GROUP_BASE}.{namespace}");
        tracing::info!(name = %name, "consumer group not configured, used namespace to guess");
        return Ok(name);
    }
    if let Some(host) = &env.host {
        tracing::info!(name = %host, "consumer group not configured, used hostname to guess");
        return Ok(host.clone());
    }
    Err("consumer group required but not set, and no HOST env".to_string())
}
