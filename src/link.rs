//! Link: one broker connection plus one channel, and its lifecycle.
//!
//! A [`Link`] is opened once at startup (no retry: a broker that is not there
//! at boot is a configuration problem). Afterwards, when its owner notices the
//! connection is gone, [`Link::reconnect_with`] re-dials with exponential
//! backoff and replays the owner's topology before reporting
//! [`ConnectionState::Connected`] again.
//!
//! ```text
//!   open() ──► Connected ──(loss)──► Disconnected ──► Reconnecting{1..n} ──► Connected
//!                  │                      │                   │
//!                  └──────── close() ─────┴───────────────────┴──────────► Closed
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::broker::{Broker, Channel, Connection};
use crate::error::BusError;

/// Channel type of broker `B`.
pub type ChannelOf<B> = <<B as Broker>::Connection as Connection>::Channel;

/// Observable state of a [`Link`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Lost, and not currently trying to come back.
    Disconnected,
    /// Re-dialing; `attempt` starts at 1.
    Reconnecting { attempt: u32 },
    /// Closed by its owner. Terminal.
    Closed,
}

/// Backoff schedule for reconnection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Wait before the first attempt.
    pub initial_delay: Duration,
    /// Ceiling for the doubling delay.
    pub max_delay: Duration,
    /// `None` retries until cancelled.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Never reconnect; a lost connection ends the owner's work.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before attempt `attempt` (1-based): `initial_delay * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

struct Session<B: Broker> {
    connection: B::Connection,
    channel: Arc<ChannelOf<B>>,
}

impl<B: Broker> Session<B> {
    fn is_open(&self) -> bool {
        self.connection.is_open() && self.channel.is_open()
    }

    async fn shut(self) -> Result<(), BusError> {
        if let Err(e) = self.channel.close().await {
            tracing::debug!(error = %e, "channel close failed");
        }
        self.connection.close().await
    }
}

/// One connection and one channel to a broker.
pub struct Link<B: Broker> {
    broker: B,
    uri: String,
    session: Mutex<Option<Session<B>>>,
    state: watch::Sender<ConnectionState>,
    closing: CancellationToken,
}

impl<B: Broker> Link<B> {
    /// Connect and open a channel. Fails immediately if either step fails.
    pub async fn open(broker: B, uri: impl Into<String>) -> Result<Self, BusError> {
        let uri = uri.into();
        let session = Self::dial(&broker, &uri).await?;
        tracing::debug!("broker link established");
        let (state, _) = watch::channel(ConnectionState::Connected);
        Ok(Self {
            broker,
            uri,
            session: Mutex::new(Some(session)),
            state,
            closing: CancellationToken::new(),
        })
    }

    async fn dial(broker: &B, uri: &str) -> Result<Session<B>, BusError> {
        let connection = broker.connect(uri).await?;
        match connection.open_channel().await {
            Ok(channel) => Ok(Session {
                connection,
                channel: Arc::new(channel),
            }),
            Err(e) => {
                let _ = connection.close().await;
                Err(e)
            }
        }
    }

    /// The current channel.
    pub async fn channel(&self) -> Result<Arc<ChannelOf<B>>, BusError> {
        if self.closing.is_cancelled() {
            return Err(BusError::Closed);
        }
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.channel))
            .ok_or(BusError::ChannelClosed)
    }

    /// Whether both the connection and the channel are open.
    pub async fn is_open(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(Session::is_open)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Move to `next` unless the link is already closed. `Closed` is only
    /// ever written by [`close`](Self::close).
    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
    }

    /// Record that the connection was lost. No-op unless currently connected.
    pub fn mark_disconnected(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
    }

    /// Re-dial with backoff, then run `setup` on the fresh channel before
    /// declaring the link connected. A failing `setup` counts as a failed
    /// attempt.
    ///
    /// If another caller already restored the link, returns its channel
    /// without dialing. Gives up with [`BusError::Reconnect`] when the policy
    /// is disabled or its attempts run out, and with [`BusError::Closed`] when
    /// `cancel` fires or the link is closed.
    pub async fn reconnect_with<F, Fut>(
        &self,
        policy: &ReconnectPolicy,
        cancel: &CancellationToken,
        mut setup: F,
    ) -> Result<Arc<ChannelOf<B>>, BusError>
    where
        F: FnMut(Arc<ChannelOf<B>>) -> Fut,
        Fut: Future<Output = Result<(), BusError>>,
    {
        let mut session = self.session.lock().await;

        if self.closing.is_cancelled() {
            return Err(BusError::Closed);
        }
        if let Some(current) = session.as_ref() {
            if current.is_open() && self.state() == ConnectionState::Connected {
                return Ok(Arc::clone(&current.channel));
            }
        }
        self.mark_disconnected();

        if !policy.enabled {
            return Err(BusError::Reconnect {
                attempts: 0,
                last_error: "reconnect disabled".into(),
            });
        }

        if let Some(stale) = session.take() {
            let _ = stale.shut().await;
        }

        let mut attempt = 0u32;
        let mut last_error = String::from("not attempted");
        loop {
            if policy.exhausted(attempt) {
                self.transition(ConnectionState::Disconnected);
                tracing::error!(attempts = attempt, error = %last_error, "giving up on reconnect");
                return Err(BusError::Reconnect {
                    attempts: attempt,
                    last_error,
                });
            }
            attempt += 1;
            self.transition(ConnectionState::Reconnecting { attempt });

            let delay = policy.delay_for(attempt);
            tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to broker");
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Err(BusError::Closed),
                _ = cancel.cancelled() => {
                    self.transition(ConnectionState::Disconnected);
                    return Err(BusError::Closed);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            let fresh = match Self::dial(&self.broker, &self.uri).await {
                Ok(fresh) => fresh,
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                    last_error = e.to_string();
                    continue;
                }
            };
            if let Err(e) = setup(Arc::clone(&fresh.channel)).await {
                tracing::warn!(attempt, error = %e, "topology replay failed after reconnect");
                last_error = e.to_string();
                let _ = fresh.shut().await;
                continue;
            }

            if self.closing.is_cancelled() {
                let _ = fresh.shut().await;
                return Err(BusError::Closed);
            }

            let channel = Arc::clone(&fresh.channel);
            *session = Some(fresh);
            self.transition(ConnectionState::Connected);
            tracing::info!(attempt, "reconnected to broker");
            return Ok(channel);
        }
    }

    /// Close channel and connection. Later calls return `Ok(())`.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.closing.is_cancelled() {
            return Ok(());
        }
        self.closing.cancel();
        self.state.send_replace(ConnectionState::Closed);

        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.shut().await,
            None => Ok(()),
        }
    }
}
