//! WebSocket event feed.
//!
//! Bridges the in-process [`EventLog`] to remote subscribers, which is how
//! other instances and browser clients see events of a room.
//!
//! ```text
//! Client ── {"subscribe": "checklist:E1"} ──► feed
//!        ◄── {"subscribed": "checklist:E1"} ──
//!        ◄── Event JSON ── mpsc ◄── EventLog listener (room)
//!        ◄── ...
//! ```
//!
//! Each connection owns one subscription and a bounded outbound queue. A
//! subscriber that falls behind loses frames rather than stalling writers.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::events::{EventLog, Subscription};

/// Feed statistics.
#[derive(Debug, Clone, Default)]
pub struct FeedStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_sent: u64,
    pub dropped_frames: u64,
}

#[derive(Debug, Deserialize)]
struct SubscribeFrame {
    subscribe: String,
}

pub struct EventFeed {
    events: Arc<EventLog>,
    buffer: usize,
    stats: Arc<RwLock<FeedStats>>,
    dropped: Arc<AtomicU64>,
}

impl EventFeed {
    pub fn new(events: Arc<EventLog>, buffer: usize) -> Self {
        Self {
            events,
            buffer: buffer.max(1),
            stats: Arc::new(RwLock::new(FeedStats::default())),
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bind `addr` and serve until the listener fails.
    pub async fn run(&self, addr: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        log::info!("Event feed listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New feed connection from {addr}");

            let events = self.events.clone();
            let stats = self.stats.clone();
            let dropped = self.dropped.clone();
            let buffer = self.buffer;

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, events, stats, dropped, buffer).await
                {
                    log::error!("Feed connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        events: Arc<EventLog>,
        stats: Arc<RwLock<FeedStats>>,
        dropped: Arc<AtomicU64>,
        buffer: usize,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (tx, mut rx) = mpsc::channel::<String>(buffer);
        let mut subscription: Option<Subscription> = None;

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if subscription.is_some() {
                                    log::debug!("Ignoring frame from already subscribed {addr}");
                                    continue;
                                }
                                match serde_json::from_str::<SubscribeFrame>(text.as_str()) {
                                    Ok(frame) if !frame.subscribe.is_empty() => {
                                        let room = frame.subscribe;
                                        let tx = tx.clone();
                                        let dropped = dropped.clone();
                                        subscription = Some(events.subscribe(room.clone(), move |event| {
                                            let frame = serde_json::to_string(event)?;
                                            if tx.try_send(frame).is_err() {
                                                dropped.fetch_add(1, Ordering::Relaxed);
                                                return Err("feed subscriber is not keeping up".into());
                                            }
                                            Ok(())
                                        }));
                                        let ack = json!({ "subscribed": room }).to_string();
                                        ws_sender.send(Message::Text(ack.into())).await?;
                                        log::info!("Feed client {addr} subscribed to {room}");
                                    }
                                    _ => {
                                        let err = json!({ "error": "expected {\"subscribe\": roomId}" }).to_string();
                                        ws_sender.send(Message::Text(err.into())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Feed connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        ws_sender.send(Message::Text(frame.into())).await?;
                        stats.write().await.frames_sent += 1;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(sub) = subscription.take() {
            let room = sub.room_id().to_string();
            if sub.unsubscribe() {
                log::debug!("Feed client {addr} unsubscribed from {room}");
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    pub async fn stats(&self) -> FeedStats {
        let mut stats = self.stats.read().await.clone();
        stats.dropped_frames = self.dropped.load(Ordering::Relaxed);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityRef, EntityType, NewEvent};
    use crate::storage::MemoryStore;
    use crate::sync_state::SyncStateTracker;

    #[tokio::test]
    async fn test_feed_stats_initial() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(SyncStateTracker::new(store.clone()));
        let feed = EventFeed::new(Arc::new(EventLog::new(store, tracker, 1_000)), 0);
        let stats = feed.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.dropped_frames, 0);
        assert_eq!(feed.buffer, 1);
    }

    #[tokio::test]
    async fn test_feed_pushes_room_events() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(SyncStateTracker::new(store.clone()));
        let events = Arc::new(EventLog::new(store, tracker, 60_000));
        let feed = Arc::new(EventFeed::new(events.clone(), 16));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = feed.clone();
        tokio::spawn(async move { server.serve(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        ws.send(Message::Text(r#"{"subscribe":"checklist:E1"}"#.into()))
            .await
            .unwrap();
        let ack = ws.next().await.unwrap().unwrap();
        assert_eq!(ack.into_text().unwrap().as_str(), r#"{"subscribed":"checklist:E1"}"#);

        events
            .create_event(NewEvent::new(
                "member.joined",
                "u1",
                EntityRef::new(EntityType::Checklist, "E1"),
                json!({"userName": "Alice"}),
            ))
            .unwrap();

        let frame = ws.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(frame.into_text().unwrap().as_str()).unwrap();
        assert_eq!(value["eventType"], "member.joined");
        assert_eq!(value["roomId"], "checklist:E1");

        ws.close(None).await.unwrap();
        for _ in 0..100 {
            if events.listener_count("checklist:E1") == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(events.listener_count("checklist:E1"), 0);
        assert_eq!(feed.stats().await.total_connections, 1);
    }
}
