use serde::{Deserialize, Serialize};

/// What happens to a delivery whose handler failed, timed out or panicked.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Always `nack(requeue = true)`. A message that never succeeds is
    /// redelivered indefinitely.
    #[default]
    RequeueForever,
    /// Requeue until the broker reports `max_deliveries` deliveries, then
    /// publish the raw body to `exchange` / `routing_key` and ack.
    DeadLetter {
        max_deliveries: u32,
        exchange: String,
        routing_key: String,
    },
}

/// Decision for one failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction<'a> {
    Requeue,
    DeadLetter {
        exchange: &'a str,
        routing_key: &'a str,
    },
}

impl RetryPolicy {
    pub fn dead_letter(
        max_deliveries: u32,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        RetryPolicy::DeadLetter {
            max_deliveries,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Decide for a failed delivery given the broker-reported delivery count.
    ///
    /// Without a count there is no way to bound retries, so the message is
    /// requeued.
    pub fn on_failure(&self, delivery_count: Option<u32>) -> FailureAction<'_> {
        match (self, delivery_count) {
            (
                RetryPolicy::DeadLetter {
                    max_deliveries,
                    exchange,
                    routing_key,
                },
                Some(count),
            ) if count >= *max_deliveries => FailureAction::DeadLetter {
                exchange,
                routing_key,
            },
            _ => FailureAction::Requeue,
        }
    }

    /// Exchange dead letters go to, if any.
    pub fn dead_letter_exchange(&self) -> Option<&str> {
        match self {
            RetryPolicy::RequeueForever => None,
            RetryPolicy::DeadLetter { exchange, .. } => Some(exchange.as_str()),
        }
    }
}
