//! `{task type -> queue, retry policy, initial delay}` routing table.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Deserialize;

use super::types::{BackoffStrategy, DEFAULT_DELAY, QueueName, RetryPolicy, TaskType};

/// Where and how a task type is enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub queue: QueueName,
    pub retry_policy: RetryPolicy,
    /// Delay before the job first becomes visible.
    pub initial_delay: Duration,
}

impl Route {
    pub fn new(queue: QueueName) -> Self {
        Self {
            queue,
            retry_policy: RetryPolicy::default(),
            initial_delay: DEFAULT_DELAY,
        }
    }
}

impl Default for Route {
    fn default() -> Self {
        Self::new(QueueName::CRITICAL)
    }
}

/// Routing table consulted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingTable {
    routes: HashMap<TaskType, Route>,
}

impl Default for RoutingTable {
    /// Data mutations on `critical`, pure notifications on `notifications`.
    fn default() -> Self {
        let routes = TaskType::ALL
            .into_iter()
            .map(|task| {
                let queue = if task.is_notification() {
                    QueueName::NOTIFICATIONS
                } else {
                    QueueName::CRITICAL
                };
                (task, Route::new(queue))
            })
            .collect();
        Self { routes }
    }
}

/// Per-task override, as read from `JOB_ROUTING`.
///
/// ```json
/// {"send-verify-email": {"queue": "mail", "max_attempts": 5, "delay_secs": 3}}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteOverride {
    pub queue: Option<String>,
    pub max_attempts: Option<u32>,
    /// Initial visibility delay and retry base delay, in seconds.
    pub delay_secs: Option<u64>,
    pub max_delay_secs: Option<u64>,
    pub backoff: Option<BackoffStrategy>,
}

impl RoutingTable {
    /// Everything on `critical` with the default policy.
    pub fn legacy() -> Self {
        Self {
            routes: TaskType::ALL
                .into_iter()
                .map(|task| (task, Route::default()))
                .collect(),
        }
    }

    pub fn route(&self, task: TaskType) -> Route {
        self.routes.get(&task).cloned().unwrap_or_default()
    }

    pub fn set(&mut self, task: TaskType, route: Route) {
        self.routes.insert(task, route);
    }

    /// Same table with every initial and retry delay replaced.
    pub fn with_delays(mut self, initial: Duration, retry: Duration) -> Self {
        for route in self.routes.values_mut() {
            route.initial_delay = initial;
            route.retry_policy.base_delay = retry;
            route.retry_policy.max_delay = match route.retry_policy.strategy {
                BackoffStrategy::Fixed => retry,
                _ => route.retry_policy.max_delay.max(retry),
            };
        }
        self
    }

    pub fn apply_override(&mut self, task: TaskType, o: &RouteOverride) {
        let route = self.routes.entry(task).or_default();
        if let Some(queue) = &o.queue {
            route.queue = QueueName::new(queue.clone());
        }
        if let Some(max_attempts) = o.max_attempts {
            route.retry_policy.max_attempts = max_attempts.max(1);
        }
        if let Some(strategy) = o.backoff {
            route.retry_policy.strategy = strategy;
        }
        if let Some(secs) = o.delay_secs {
            let delay = Duration::from_secs(secs);
            route.initial_delay = delay;
            route.retry_policy.base_delay = delay;
            if route.retry_policy.strategy == BackoffStrategy::Fixed {
                route.retry_policy.max_delay = delay;
            }
        }
        if let Some(secs) = o.max_delay_secs {
            route.retry_policy.max_delay = Duration::from_secs(secs);
        }
    }

    /// Parse and apply a JSON object keyed by task type name.
    pub fn apply_overrides_json(&mut self, json: &str) -> Result<(), RoutingOverrideError> {
        let parsed: BTreeMap<String, RouteOverride> =
            serde_json::from_str(json).map_err(|e| RoutingOverrideError::Json(e.to_string()))?;
        for (name, o) in &parsed {
            let task: TaskType = name
                .parse()
                .map_err(|_| RoutingOverrideError::UnknownTask(name.clone()))?;
            self.apply_override(task, o);
        }
        Ok(())
    }

    /// Every queue some task is routed to, sorted.
    pub fn queues(&self) -> Vec<QueueName> {
        let mut queues: Vec<QueueName> = self.routes.values().map(|r| r.queue.clone()).collect();
        queues.sort();
        queues.dedup();
        queues
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingOverrideError {
    #[error("invalid routing JSON: {0}")]
    Json(String),
    #[error("routing override for unknown task type: {0}")]
    UnknownTask(String),
}
