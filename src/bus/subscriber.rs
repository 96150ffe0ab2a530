//! Single bus subscriber per process.
//!
//! One dedicated pub/sub connection covers every topic family via pattern
//! subscriptions; per-connection and per-channel subscriptions never open
//! their own bus connections. Reconnects use exponential backoff and the
//! loop only exits on shutdown.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::channels::ChannelRoomService;
use crate::config::BusConfig;

use super::{BusEnvelope, ExponentialBackoff, Topic};

pub struct BusSubscriber {
    config: BusConfig,
    channels: Arc<ChannelRoomService>,
}

impl BusSubscriber {
    pub fn new(config: BusConfig, channels: Arc<ChannelRoomService>) -> Self {
        Self { config, channels }
    }

    /// Spawn the subscriber loop. Returns immediately; the task runs until
    /// the shutdown signal fires.
    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(shutdown_rx).await;
        })
    }

    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut backoff = ExponentialBackoff::new();

        loop {
            match self.subscribe_and_listen(&mut shutdown_rx, &mut backoff).await {
                Ok(()) => {
                    tracing::info!("Bus subscriber stopped");
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Bus subscriber connection lost, reconnecting"
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Bus subscriber stopped during reconnect wait");
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Subscribe to all topic families and pump messages until the
    /// connection drops or shutdown is signaled. Returns Ok only on
    /// shutdown.
    async fn subscribe_and_listen(
        &self,
        shutdown_rx: &mut broadcast::Receiver<()>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), redis::RedisError> {
        let client = redis::Client::open(self.config.url.as_str())?;
        let mut pubsub = client.get_async_pubsub().await?;

        let prefix = &self.config.key_prefix;
        pubsub.psubscribe(format!("{}:channel:*", prefix)).await?;
        pubsub.psubscribe(format!("{}:room:*", prefix)).await?;
        pubsub.psubscribe(format!("{}:user:*", prefix)).await?;
        pubsub.subscribe(format!("{}:broadcast:all", prefix)).await?;

        backoff.reset();
        tracing::info!(prefix = %prefix, "Bus subscriber connected");

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    return Ok(());
                }
                msg = stream.next() => {
                    match msg {
                        Some(msg) => self.dispatch(&msg).await,
                        None => {
                            return Err(redis::RedisError::from((
                                redis::ErrorKind::IoError,
                                "pub/sub stream ended",
                            )));
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&self, msg: &redis::Msg) {
        let wire_channel = msg.get_channel_name();

        let Some(logical) = wire_channel.strip_prefix(&format!("{}:", self.config.key_prefix))
        else {
            tracing::warn!(channel = %wire_channel, "Bus message outside namespace, ignoring");
            return;
        };

        let Some(topic) = Topic::parse(logical) else {
            tracing::warn!(channel = %wire_channel, "Unrecognized bus topic, ignoring");
            return;
        };

        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, topic = %topic, "Failed to read bus payload");
                return;
            }
        };

        let envelope: BusEnvelope = match serde_json::from_str(&payload) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(error = %e, topic = %topic, "Malformed bus envelope, dropping");
                return;
            }
        };

        crate::metrics::BUS_MESSAGES_RECEIVED.inc();
        tracing::trace!(
            topic = %topic,
            fingerprint = %envelope.fingerprint,
            origin = %envelope.origin,
            "Bus message received"
        );

        self.channels.handle_bus_message(&topic, envelope).await;
    }
}
