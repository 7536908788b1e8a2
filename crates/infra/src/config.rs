//! Process configuration, read from environment variables.
//!
//! | Variable                   | Default                          |
//! |----------------------------|----------------------------------|
//! | `USE_REDIS_QUEUE`          | `false`                          |
//! | `REDIS_URL`                | `redis://localhost:6379`         |
//! | `JOB_KEY_PREFIX`           | `eduapp:jobs`                    |
//! | `WORKER_CONCURRENCY`       | `4`                              |
//! | `WORKER_POLL_INTERVAL_MS`  | `100`                            |
//! | `JOB_LEASE_SECS`           | `300`                            |
//! | `QUEUE_WEIGHTS`            | `critical=6,notifications=3`     |
//! | `OUTBOX_RELAY_INTERVAL_MS` | `5000`                           |
//! | `JOB_ROUTING`              | default table (`legacy` or JSON) |
//! | `SMTP_*`                   | unset: recording notifier        |
//! | `VERIFY_EMAIL_BASE_URL`    | `http://localhost:3390`          |
//! | `RESET_PASSWORD_URL`       | `http://localhost:3390/reset/password` |

use std::time::Duration;

use crate::handlers::NotificationLinks;
use crate::jobs::{PoolConfig, QueueName, RoutingOverrideError, RoutingTable};
use crate::notifier::EmailConfig;

const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
const DEFAULT_KEY_PREFIX: &str = "eduapp:jobs";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error("invalid JOB_ROUTING: {0}")]
    Routing(#[from] RoutingOverrideError),
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub queue: QueueBackend,
    pub pool: PoolConfig,
    pub routing: RoutingTable,
    pub outbox_relay_interval: Duration,
    /// `None` when SMTP is not configured.
    pub email: Option<EmailConfig>,
    pub links: NotificationLinks,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let queue = if parse_bool("USE_REDIS_QUEUE", var("USE_REDIS_QUEUE"))? {
            QueueBackend::Redis {
                url: var("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
                key_prefix: var("JOB_KEY_PREFIX").unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string()),
            }
        } else {
            QueueBackend::InMemory
        };

        let mut routing = RoutingTable::default();
        match var("JOB_ROUTING").as_deref() {
            None => {}
            Some("legacy") => routing = RoutingTable::legacy(),
            Some(json) => routing.apply_overrides_json(json)?,
        }

        let defaults = PoolConfig::default();
        let mut pool = PoolConfig::default()
            .with_concurrency(parse_num("WORKER_CONCURRENCY", var("WORKER_CONCURRENCY"), defaults.concurrency)?)
            .with_poll_interval(Duration::from_millis(parse_num(
                "WORKER_POLL_INTERVAL_MS",
                var("WORKER_POLL_INTERVAL_MS"),
                defaults.poll_interval.as_millis() as u64,
            )?));
        pool.lease = Duration::from_secs(parse_num(
            "JOB_LEASE_SECS",
            var("JOB_LEASE_SECS"),
            defaults.lease.as_secs(),
        )?);
        let weights = match var("QUEUE_WEIGHTS") {
            Some(raw) => parse_weights(&raw)?,
            None => defaults.queue_weights,
        };
        pool = pool.with_queue_weights(complete_weights(weights, &routing));

        let outbox_relay_interval = Duration::from_millis(parse_num(
            "OUTBOX_RELAY_INTERVAL_MS",
            var("OUTBOX_RELAY_INTERVAL_MS"),
            5_000,
        )?);

        let link_defaults = NotificationLinks::default();
        let links = NotificationLinks {
            verify_email_base_url: var("VERIFY_EMAIL_BASE_URL")
                .unwrap_or(link_defaults.verify_email_base_url),
            reset_password_url: var("RESET_PASSWORD_URL").unwrap_or(link_defaults.reset_password_url),
        };

        Ok(Self {
            queue,
            pool,
            routing,
            outbox_relay_interval,
            email: EmailConfig::from_lookup(&lookup),
            links,
        })
    }
}

fn parse_bool(key: &'static str, raw: Option<String>) -> Result<bool, ConfigError> {
    match raw.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None | Some("false") | Some("0") | Some("no") => Ok(false),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some(other) => Err(ConfigError::invalid(key, format!("expected a boolean, got {other:?}"))),
    }
}

fn parse_num<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => raw
            .parse()
            .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}"))),
        None => Ok(default),
    }
}

/// `critical=6,notifications=3`
fn parse_weights(raw: &str) -> Result<Vec<(QueueName, u32)>, ConfigError> {
    let mut weights = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (name, weight) = part
            .split_once('=')
            .ok_or_else(|| ConfigError::invalid("QUEUE_WEIGHTS", format!("expected name=weight, got {part:?}")))?;
        let weight: u32 = weight
            .trim()
            .parse()
            .map_err(|e| ConfigError::invalid("QUEUE_WEIGHTS", format!("{part:?}: {e}")))?;
        if weight == 0 {
            return Err(ConfigError::invalid("QUEUE_WEIGHTS", format!("zero weight for {name}")));
        }
        weights.push((QueueName::new(name.trim().to_string()), weight));
    }
    if weights.is_empty() {
        return Err(ConfigError::invalid("QUEUE_WEIGHTS", "no queues listed"));
    }
    Ok(weights)
}

/// Routed queues missing from the weights get weight 1 so nothing is
/// left unconsumed.
fn complete_weights(mut weights: Vec<(QueueName, u32)>, routing: &RoutingTable) -> Vec<(QueueName, u32)> {
    for queue in routing.queues() {
        if !weights.iter().any(|(q, _)| *q == queue) {
            weights.push((queue, 1));
        }
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::jobs::TaskType;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.queue, QueueBackend::InMemory);
        assert_eq!(cfg.pool.concurrency, 4);
        assert_eq!(cfg.pool.lease, Duration::from_secs(300));
        assert_eq!(
            cfg.pool.queue_weights,
            vec![(QueueName::CRITICAL, 6), (QueueName::NOTIFICATIONS, 3)]
        );
        assert_eq!(cfg.outbox_relay_interval, Duration::from_secs(5));
        assert!(cfg.email.is_none());
        assert_eq!(cfg.links, NotificationLinks::default());
    }

    #[test]
    fn redis_backend_and_overrides() {
        let cfg = config(&[
            ("USE_REDIS_QUEUE", "true"),
            ("REDIS_URL", "redis://cache:6379"),
            ("WORKER_CONCURRENCY", "8"),
            ("WORKER_POLL_INTERVAL_MS", "250"),
            ("SMTP_HOST", "mail.local"),
        ])
        .unwrap();
        assert_eq!(
            cfg.queue,
            QueueBackend::Redis {
                url: "redis://cache:6379".to_string(),
                key_prefix: "eduapp:jobs".to_string(),
            }
        );
        assert_eq!(cfg.pool.concurrency, 8);
        assert_eq!(cfg.pool.poll_interval, Duration::from_millis(250));
        assert_eq!(cfg.email.unwrap().smtp_host, "mail.local");
    }

    #[test]
    fn routing_overrides_add_weighted_queue() {
        let cfg = config(&[(
            "JOB_ROUTING",
            r#"{"reset-password": {"queue": "mail"}}"#,
        )])
        .unwrap();
        assert_eq!(cfg.routing.route(TaskType::ResetPassword).queue.as_str(), "mail");
        assert!(cfg.pool.queue_weights.contains(&(QueueName::new("mail"), 1)));
    }

    #[test]
    fn legacy_routing() {
        let cfg = config(&[("JOB_ROUTING", "legacy")]).unwrap();
        assert_eq!(cfg.routing.queues(), vec![QueueName::CRITICAL]);
    }

    #[test]
    fn bad_values_are_typed_errors() {
        assert!(matches!(
            config(&[("WORKER_CONCURRENCY", "many")]),
            Err(ConfigError::Invalid { key: "WORKER_CONCURRENCY", .. })
        ));
        assert!(matches!(
            config(&[("USE_REDIS_QUEUE", "maybe")]),
            Err(ConfigError::Invalid { key: "USE_REDIS_QUEUE", .. })
        ));
        assert!(matches!(
            config(&[("QUEUE_WEIGHTS", "critical=0")]),
            Err(ConfigError::Invalid { key: "QUEUE_WEIGHTS", .. })
        ));
        assert!(matches!(
            config(&[("JOB_ROUTING", r#"{"nope": {}}"#)]),
            Err(ConfigError::Routing(RoutingOverrideError::UnknownTask(_)))
        ));
    }

    #[test]
    fn weights_parse() {
        let weights = parse_weights("critical=2, notifications=1").unwrap();
        assert_eq!(
            weights,
            vec![(QueueName::CRITICAL, 2), (QueueName::NOTIFICATIONS, 1)]
        );
    }
}
