//! Handler adapters for consumers that speak envelopes instead of raw bytes.
//!
//! [`Subscriber::consume`](crate::Subscriber::consume) hands every handler
//! the raw delivery body, and only distinguishes `Ok` (ack) from `Err`
//! (requeue). The adapters here decode first and map consumer outcomes onto
//! that contract:
//!
//! | situation                          | result        | broker action |
//! |------------------------------------|---------------|---------------|
//! | body is not an envelope            | per policy    | ack / requeue |
//! | payload does not decode into `T`   | per policy    | ack / requeue |
//! | `Ok(())`                           | `Ok`          | ack           |
//! | `Err(ConsumeError::Permanent)`     | `Ok` (logged) | ack (dropped) |
//! | `Err(ConsumeError::Transient)`     | `Err`         | requeue       |

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::{DecodeError, Envelope};
use crate::error::BoxError;

/// What to do with a delivery that cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodePolicy {
    /// Log and ack. Redelivering bytes that will never decode only loops.
    #[default]
    Drop,
    /// Nack with requeue.
    Requeue,
}

/// Failure reported by a typed consumer.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Retrying will not help (validation, unknown entity, ...). Acked.
    #[error("permanent: {0}")]
    Permanent(BoxError),

    /// Worth retrying (database down, dependency timeout, ...). Requeued.
    #[error("transient: {0}")]
    Transient(BoxError),
}

impl ConsumeError {
    pub fn permanent(err: impl Into<BoxError>) -> Self {
        ConsumeError::Permanent(err.into())
    }

    pub fn transient(err: impl Into<BoxError>) -> Self {
        ConsumeError::Transient(err.into())
    }
}

/// Error an adapter returns to the subscriber; every variant means requeue.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("undecodable message: {0}")]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Transient(BoxError),
}

/// Boxed raw handler produced by the adapters.
pub type RawHandler =
    Box<dyn Fn(Vec<u8>) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

fn on_decode_failure(policy: DecodePolicy, err: DecodeError) -> Result<(), HandlerError> {
    match policy {
        DecodePolicy::Drop => {
            tracing::warn!(error = %err, "dropping undecodable message");
            Ok(())
        }
        DecodePolicy::Requeue => {
            tracing::warn!(error = %err, "requeueing undecodable message");
            Err(HandlerError::Decode(err))
        }
    }
}

fn classify(
    event_id: &str,
    event_type: &str,
    result: Result<(), ConsumeError>,
) -> Result<(), HandlerError> {
    match result {
        Ok(()) => Ok(()),
        Err(ConsumeError::Permanent(e)) => {
            tracing::error!(
                event_id,
                event_type,
                error = %e,
                "permanent failure, dropping message"
            );
            Ok(())
        }
        Err(ConsumeError::Transient(e)) => Err(HandlerError::Transient(e)),
    }
}

/// Decode each body as an [`Envelope`] and pass it to `f`.
pub fn envelope_handler<F, Fut>(policy: DecodePolicy, f: F) -> RawHandler
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    let f = Arc::new(f);
    Box::new(move |body: Vec<u8>| {
        let f = Arc::clone(&f);
        async move {
            let envelope = match Envelope::decode(&body) {
                Ok(envelope) => envelope,
                Err(e) => return on_decode_failure(policy, e),
            };
            let event_id = envelope.event_id.clone();
            let event_type = envelope.event_type.clone();
            classify(&event_id, &event_type, f(envelope).await)
        }
        .boxed()
    })
}

/// Decode the envelope and its payload into `T`, then call `f(event, envelope)`.
///
/// ```ignore
/// subscriber
///     .consume(event_handler::<ProductCreated, _, _>(DecodePolicy::Drop, |event, env| async move {
///         catalog.index(event).await.map_err(ConsumeError::transient)
///     }))
///     .await?;
/// ```
pub fn event_handler<T, F, Fut>(policy: DecodePolicy, f: F) -> RawHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T, Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ConsumeError>> + Send + 'static,
{
    let f = Arc::new(f);
    Box::new(move |body: Vec<u8>| {
        let f = Arc::clone(&f);
        async move {
            let envelope = match Envelope::decode(&body) {
                Ok(envelope) => envelope,
                Err(e) => return on_decode_failure(policy, e),
            };
            let event: T = match envelope.decode_payload() {
                Ok(event) => event,
                Err(e) => {
                    tracing::debug!(
                        event_id = %envelope.event_id,
                        event_type = %envelope.event_type,
                        expected = std::any::type_name::<T>(),
                        "payload does not match expected type"
                    );
                    return on_decode_failure(policy, e);
                }
            };
            let event_id = envelope.event_id.clone();
            let event_type = envelope.event_type.clone();
            classify(&event_id, &event_type, f(event, envelope).await)
        }
        .boxed()
    })
}
