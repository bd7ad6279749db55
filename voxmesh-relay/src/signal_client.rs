//! Outbound and inbound negotiation messages over the signal relay.
//!
//! Sends are bounded by a timeout and retried with capped exponential
//! backoff. The inbound pump keeps only signals addressed to the local
//! participant and drops redeliveries.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use voxmesh_core::backend::SignalRelay;
use voxmesh_core::config::RelayConfig;
use voxmesh_core::models::{ParticipantId, Signal};
use voxmesh_core::{Error, Result};

use crate::dedup::SignalDeduplicator;

pub struct SignalRelayClient {
    relay: Arc<dyn SignalRelay>,
    config: RelayConfig,
    deduplicator: SignalDeduplicator,
    cancel_token: CancellationToken,
}

impl SignalRelayClient {
    #[must_use]
    pub fn new(relay: Arc<dyn SignalRelay>, config: RelayConfig) -> Self {
        let deduplicator = SignalDeduplicator::new(config.dedup_window());
        Self {
            relay,
            config,
            deduplicator,
            cancel_token: CancellationToken::new(),
        }
    }

    /// Send one signal, retrying transient failures
    pub async fn send(&self, signal: Signal) -> Result<()> {
        let attempts = self.config.max_send_attempts.max(1);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut last_error = Error::Relay("signal was never sent".to_string());

        for attempt in 1..=attempts {
            match timeout(self.config.send_timeout(), self.relay.send_signal(signal.clone())).await {
                Ok(Ok(())) => {
                    debug!(
                        signal_id = %signal.id,
                        kind = %signal.kind(),
                        to = %signal.to,
                        scope = %signal.scope,
                        attempt,
                        "Signal sent"
                    );
                    return Ok(());
                }
                Ok(Err(e)) => {
                    warn!(signal_id = %signal.id, to = %signal.to, attempt, error = %e, "Signal send failed");
                    last_error = e;
                }
                Err(_) => {
                    warn!(signal_id = %signal.id, to = %signal.to, attempt, "Signal send timed out");
                    last_error = Error::Timeout(format!("sending {} to {}", signal.kind(), signal.to));
                }
            }

            if attempt < attempts {
                tokio::select! {
                    () = self.cancel_token.cancelled() => {
                        return Err(Error::Relay("signal client shut down".to_string()));
                    }
                    () = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(max_backoff);
            }
        }

        Err(last_error)
    }

    /// Start pumping signals addressed to `local` into the returned receiver.
    ///
    /// The pump ends when the relay closes the subscription, the receiver is
    /// dropped or the client shuts down.
    pub async fn subscribe(&self, local: &ParticipantId) -> Result<mpsc::UnboundedReceiver<Signal>> {
        let mut inbound = self.relay.subscribe_signals(local).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let local = local.clone();
        let deduplicator = self.deduplicator.clone();
        let cancel = self.cancel_token.clone();

        tokio::spawn(async move {
            info!(participant_id = %local, "Signal subscription started");
            loop {
                let signal = tokio::select! {
                    () = cancel.cancelled() => break,
                    signal = inbound.recv() => match signal {
                        Some(signal) => signal,
                        None => break,
                    },
                };

                if signal.to != local {
                    debug!(signal_id = %signal.id, to = %signal.to, "Dropping signal addressed to someone else");
                    continue;
                }
                if !deduplicator.should_process(&signal.id) {
                    debug!(signal_id = %signal.id, kind = %signal.kind(), "Dropping redelivered signal");
                    continue;
                }
                if tx.send(signal).is_err() {
                    break;
                }
            }
            info!(participant_id = %local, "Signal subscription ended");
        });

        Ok(rx)
    }

    /// Stop the inbound pump and abort pending retries
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for SignalRelayClient {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
