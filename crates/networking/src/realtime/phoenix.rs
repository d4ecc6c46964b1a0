//! Websocket transport for the hosted realtime broker
//!
//! Opens one socket per channel, joins the topic with a `postgres_changes`
//! filter, keeps it alive with heartbeats, and forwards decoded events to
//! the [`RealtimeChannel`] returned to the caller.

use super::frame::{decode, Frame, Inbound};
use super::{ChannelEvent, ChannelTopic, RealtimeChannel, RealtimeTransport};
use async_trait::async_trait;
use claimsync_core::{BackendConfig, ChannelStatus, Error, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Events buffered per channel before the socket loop waits on the consumer
const EVENT_BUFFER: usize = 64;

const JOIN_REF: u64 = 1;

/// Realtime transport over tokio-tungstenite
pub struct PhoenixTransport {
    config: BackendConfig,
}

impl PhoenixTransport {
    pub fn new(config: BackendConfig) -> Self {
        Self { config }
    }

    fn table_for(&self, topic: &ChannelTopic) -> &str {
        if topic.is_offer() {
            &self.config.offers_table
        } else {
            &self.config.claims_table
        }
    }
}

#[async_trait]
impl RealtimeTransport for PhoenixTransport {
    #[instrument(skip(self), fields(topic = %topic))]
    async fn open(&self, topic: &ChannelTopic) -> Result<RealtimeChannel> {
        let (ws, _) = tokio_tungstenite::connect_async(self.config.realtime_url())
            .await
            .map_err(|e| Error::NetworkError(format!("realtime connect failed: {}", e)))?;

        let (mut sink, stream) = ws.split();

        let join = Frame::join(
            &topic.name(),
            self.table_for(topic),
            &topic.filter(),
            self.config.bearer_token(),
            JOIN_REF,
        );
        let json = serde_json::to_string(&join)?;
        sink.send(Message::Text(json.into()))
            .await
            .map_err(|e| Error::NetworkError(format!("join send failed: {}", e)))?;

        debug!("Join sent");

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(socket_loop(
            sink,
            stream,
            SocketParams {
                topic: topic.name(),
                offer_rows: topic.is_offer(),
                join_timeout: Duration::from_secs(self.config.join_timeout_secs),
                heartbeat: Duration::from_secs(self.config.heartbeat_interval_secs.max(1)),
            },
            tx,
            cancel.clone(),
        ));

        Ok(RealtimeChannel::new(rx, cancel))
    }
}

struct SocketParams {
    topic: String,
    offer_rows: bool,
    join_timeout: Duration,
    heartbeat: Duration,
}

async fn socket_loop<S, R>(
    mut sink: S,
    mut stream: R,
    params: SocketParams,
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
) where
    S: futures_util::Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: futures_util::Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let join_ref = JOIN_REF.to_string();
    let mut next_ref = JOIN_REF + 1;
    let mut joined = false;

    let join_deadline = tokio::time::sleep(params.join_timeout);
    tokio::pin!(join_deadline);

    let mut heartbeat = tokio::time::interval(params.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately
    heartbeat.tick().await;

    let terminal = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Channel {} closed by consumer", params.topic);
                if let Ok(json) = serde_json::to_string(&Frame::leave(&params.topic, next_ref)) {
                    let _ = sink.send(Message::Text(json.into())).await;
                }
                let _ = sink.close().await;
                return;
            }
            _ = &mut join_deadline, if !joined => {
                warn!("Join of {} timed out", params.topic);
                break ChannelStatus::TimedOut;
            }
            _ = heartbeat.tick() => {
                let frame = Frame::heartbeat(next_ref);
                next_ref += 1;
                if let Ok(json) = serde_json::to_string(&frame) {
                    if let Err(e) = sink.send(Message::Text(json.into())).await {
                        warn!("Heartbeat failed on {}: {}", params.topic, e);
                        break ChannelStatus::ChannelError;
                    }
                }
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match decode(&text, &params.topic, &join_ref, params.offer_rows) {
                        Inbound::Event(event) => {
                            if event == ChannelEvent::Status(ChannelStatus::Subscribed) {
                                info!("Subscribed to {}", params.topic);
                                joined = true;
                            }
                            if tx.send(event).await.is_err() {
                                // Consumer went away
                                let _ = sink.close().await;
                                return;
                            }
                        }
                        Inbound::Terminal(status) => break status,
                        Inbound::Ignore => {}
                    }
                }
                Some(Ok(Message::Close(_))) | None => break ChannelStatus::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Socket error on {}: {}", params.topic, e);
                    break ChannelStatus::ChannelError;
                }
            }
        }
    };

    let _ = tx.send(ChannelEvent::Status(terminal)).await;
    let _ = sink.close().await;
}
