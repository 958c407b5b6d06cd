//! Shared WebSocket push worker.
//!
//! One worker per venue: connect, subscribe, translate venue frames into
//! typed `MarketEvent`s, and reconnect with bounded backoff until told to
//! stop. Venue specifics (URL, subscribe frames, message schema) live in a
//! `PushProtocol` implementation owned by the adapter.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::events::{EventSink, MarketEvent};
use crate::types::Venue;
use crate::venue::HealthTracker;

/// Delay before the first reconnect attempt.
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Cap for the reconnect backoff.
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
/// Keepalive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Venue-specific half of the push transport.
pub trait PushProtocol: Send + Sync + 'static {
    fn venue(&self) -> Venue;

    fn ws_url(&self) -> String;

    /// Frames to send right after connecting.
    fn subscribe_frames(&self, ids: &[String]) -> Vec<String>;

    /// Translate one text frame into zero or more events. Unparseable frames
    /// return empty and count as schema drops inside the implementation.
    fn parse(&self, text: &str) -> Vec<MarketEvent>;
}

/// Run the push loop until the shutdown flag flips.
///
/// Each (re)connection: dial, subscribe, then pump frames into the sink.
/// Errors reconnect with exponential backoff; a clean server close
/// reconnects after the base delay.
pub async fn run_push_worker(
    protocol: Arc<dyn PushProtocol>,
    subscribed_ids: Vec<String>,
    sink: EventSink,
    health: Arc<HealthTracker>,
    mut shutdown: watch::Receiver<bool>,
) {
    let venue = protocol.venue();
    let mut delay = RECONNECT_BASE_DELAY;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match connect_and_pump(&protocol, &subscribed_ids, &sink, &health, &mut shutdown).await {
            Ok(()) => {
                // Clean disconnect or shutdown.
                if *shutdown.borrow() {
                    break;
                }
                info!(venue = %venue, "push transport disconnected; reconnecting");
                delay = RECONNECT_BASE_DELAY;
            }
            Err(e) => {
                health.record_error();
                warn!(venue = %venue, error = %e, delay_secs = delay.as_secs(), "push transport error; reconnecting");
                delay = (delay * 2).min(RECONNECT_MAX_DELAY);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!(venue = %venue, "push worker stopped");
}

async fn connect_and_pump(
    protocol: &Arc<dyn PushProtocol>,
    subscribed_ids: &[String],
    sink: &EventSink,
    health: &Arc<HealthTracker>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let url = protocol.ws_url();
    let (mut ws, _) = connect_async(url.as_str()).await?;
    info!(venue = %protocol.venue(), url = %url, ids = subscribed_ids.len(), "push transport connected");

    for frame in protocol.subscribe_frames(subscribed_ids) {
        ws.send(Message::Text(frame)).await?;
    }
    health.record_success(0);

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Close immediately on shutdown; in-flight fetches elsewhere
                // get the grace period, push transports do not.
                let _ = ws.close(None).await;
                return Ok(());
            }
            _ = ping.tick() => {
                ws.send(Message::Ping(Vec::new())).await?;
            }
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for event in protocol.parse(&text) {
                            sink.send(event);
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopProtocol;

    impl PushProtocol for NoopProtocol {
        fn venue(&self) -> Venue {
            Venue::Kalshi
        }
        fn ws_url(&self) -> String {
            // Nothing listens here; the worker must keep retrying, not panic.
            "ws://127.0.0.1:1".to_string()
        }
        fn subscribe_frames(&self, _ids: &[String]) -> Vec<String> {
            vec![]
        }
        fn parse(&self, _text: &str) -> Vec<MarketEvent> {
            vec![]
        }
    }

    #[tokio::test]
    async fn worker_stops_on_shutdown() {
        let (tx, rx) = watch::channel(false);
        let buffer = crate::events::EventBuffer::new(4);
        let sink = EventSink::new(buffer);
        let health = Arc::new(HealthTracker::new(Venue::Kalshi));

        let handle = tokio::spawn(run_push_worker(
            Arc::new(NoopProtocol),
            vec![],
            sink,
            health,
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
