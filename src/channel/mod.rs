//! Persistent WebSocket link to the inference server.
//!
//! One socket at a time; every close re-arms a single reconnect timer until
//! [`MessageChannel::shutdown`] is called.

pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use protocol::{ClientFrame, ServerFrame, StatusKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Disconnected,
    Connecting,
    Connected,
}

/// Inbound events, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ChannelEvent {
    Token {
        prompt_id: String,
        token: String,
    },
    Complete {
        prompt_id: Option<String>,
    },
    /// `prompt_id` is `None` for socket-level errors.
    Error {
        prompt_id: Option<String>,
        error: String,
    },
    Started {
        prompt_id: Option<String>,
        session_id: Option<String>,
    },
    Canceled {
        prompt_id: Option<String>,
    },
    MemoryCleared {
        session_id: Option<String>,
    },
    Ready,
    Disconnected,
}

/// A prompt awaiting its terminal event.
#[derive(Debug, Clone, Serialize)]
pub struct PromptRequest {
    pub id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

struct ChannelState {
    phase: ChannelPhase,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    reconnect: Option<JoinHandle<()>>,
    in_flight: HashMap<String, PromptRequest>,
}

struct Inner {
    url: String,
    reconnect_delay: Duration,
    state: Mutex<ChannelState>,
    events: broadcast::Sender<ChannelEvent>,
    shutdown: CancellationToken,
    reconnects_scheduled: AtomicU64,
}

#[derive(Clone)]
pub struct MessageChannel {
    inner: Arc<Inner>,
}

impl MessageChannel {
    #[must_use]
    pub fn new(url: impl Into<String>, reconnect_delay: Duration) -> Self {
        let (events, _) = broadcast::channel(512);
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                reconnect_delay,
                state: Mutex::new(ChannelState {
                    phase: ChannelPhase::Disconnected,
                    outbound: None,
                    reconnect: None,
                    in_flight: HashMap::new(),
                }),
                events,
                shutdown: CancellationToken::new(),
                reconnects_scheduled: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: ChannelEvent) {
        let _ = self.inner.events.send(event);
    }

    #[must_use]
    pub fn phase(&self) -> ChannelPhase {
        self.lock().phase
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.inner.events.subscribe()
    }

    /// Prompts sent on this channel that have not reached a terminal event.
    #[must_use]
    pub fn in_flight(&self) -> Vec<PromptRequest> {
        let mut prompts: Vec<_> = self.lock().in_flight.values().cloned().collect();
        prompts.sort_by_key(|p| p.created_at);
        prompts
    }

    /// Open the socket in the background.
    ///
    /// No-op while a connection attempt is in flight or open, and after
    /// [`MessageChannel::shutdown`].
    pub fn connect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        {
            let mut st = self.lock();
            if st.phase != ChannelPhase::Disconnected {
                log::debug!("channel already {:?}, connect ignored", st.phase);
                return;
            }
            st.phase = ChannelPhase::Connecting;
        }
        tokio::spawn(self.clone().run_connection());
    }

    /// Send a prompt. `None` (and no write) unless connected.
    pub fn send(&self, text: &str) -> Option<String> {
        let mut st = self.lock();
        if st.phase != ChannelPhase::Connected {
            log::warn!("WebSocket not connected, prompt not sent");
            return None;
        }

        let prompt_id = Uuid::new_v4().to_string();
        let frame = ClientFrame::Prompt {
            prompt: text.to_string(),
            prompt_id: prompt_id.clone(),
        };
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("failed to encode prompt: {e}");
                return None;
            }
        };
        let tx = st.outbound.as_ref()?;
        if tx.send(Message::Text(encoded)).is_err() {
            log::warn!("channel writer gone, prompt not sent");
            return None;
        }

        st.in_flight.insert(
            prompt_id.clone(),
            PromptRequest {
                id: prompt_id.clone(),
                text: text.to_string(),
                created_at: Utc::now(),
            },
        );
        log::info!("Sent prompt {prompt_id}");
        Some(prompt_id)
    }

    /// Best-effort cancel; ignored when disconnected.
    pub fn cancel(&self, prompt_id: &str) {
        if self.write(&ClientFrame::Cancel {
            prompt_id: prompt_id.to_string(),
        }) {
            log::info!("Sent cancel for prompt {prompt_id}");
        }
    }

    /// Best-effort; ignored when disconnected.
    pub fn clear_memory(&self) {
        if self.write(&ClientFrame::ClearMemory) {
            log::info!("Sent clear memory request");
        }
    }

    fn write(&self, frame: &ClientFrame) -> bool {
        let st = self.lock();
        if st.phase != ChannelPhase::Connected {
            return false;
        }
        let (Some(tx), Ok(encoded)) = (st.outbound.as_ref(), frame.encode()) else {
            return false;
        };
        tx.send(Message::Text(encoded)).is_ok()
    }

    /// Close the socket for good and disarm any pending reconnect.
    pub fn shutdown(&self) {
        log::info!("Shutting down inference channel");
        self.inner.shutdown.cancel();
        if let Some(timer) = self.lock().reconnect.take() {
            timer.abort();
        }
    }

    async fn run_connection(self) {
        let url = self.inner.url.clone();
        log::info!("Connecting to inference channel at {url}");

        let connected = tokio::select! {
            r = tokio_tungstenite::connect_async(url.as_str()) => r,
            () = self.inner.shutdown.cancelled() => {
                self.lock().phase = ChannelPhase::Disconnected;
                return;
            }
        };

        let ws = match connected {
            Ok((ws, _response)) => ws,
            Err(e) => {
                log::warn!("Inference channel connect failed: {e}");
                self.emit(ChannelEvent::Error {
                    prompt_id: None,
                    error: format!("Connection error: {e}"),
                });
                self.on_closed();
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        {
            let mut st = self.lock();
            st.phase = ChannelPhase::Connected;
            st.outbound = Some(tx);
            if let Some(timer) = st.reconnect.take() {
                timer.abort();
            }
        }
        log::info!("✓ Connected to inference channel");
        self.emit(ChannelEvent::Ready);

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(msg) = outbound else { break };
                    if let Err(e) = sink.send(msg).await {
                        log::warn!("Inference channel write failed: {e}");
                        self.emit(ChannelEvent::Error {
                            prompt_id: None,
                            error: format!("Connection error: {e}"),
                        });
                        break;
                    }
                }
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => self.dispatch(&text),
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Inference channel closed by server: {frame:?}");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Inference channel error: {e}");
                        self.emit(ChannelEvent::Error {
                            prompt_id: None,
                            error: format!("Connection error: {e}"),
                        });
                        break;
                    }
                    None => break,
                },
                () = self.inner.shutdown.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    let _ = sink.close().await;
                    break;
                }
            }
        }

        self.on_closed();
    }

    fn dispatch(&self, text: &str) {
        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping inbound frame: {e}");
                return;
            }
        };

        let event = match frame {
            ServerFrame::Hello { session_id } => {
                log::debug!("inference session {session_id:?} opened");
                return;
            }
            ServerFrame::Token { prompt_id, token } => ChannelEvent::Token { prompt_id, token },
            ServerFrame::Complete { prompt_id } => {
                self.settle(prompt_id.as_deref());
                ChannelEvent::Complete { prompt_id }
            }
            ServerFrame::Error { prompt_id, error } => {
                self.settle(prompt_id.as_deref());
                ChannelEvent::Error { prompt_id, error }
            }
            ServerFrame::Status {
                status,
                prompt_id,
                session_id,
            } => match status {
                StatusKind::Started => ChannelEvent::Started {
                    prompt_id,
                    session_id,
                },
                StatusKind::Canceled => {
                    self.settle(prompt_id.as_deref());
                    ChannelEvent::Canceled { prompt_id }
                }
                StatusKind::MemoryCleared => ChannelEvent::MemoryCleared { session_id },
            },
        };
        self.emit(event);
    }

    fn settle(&self, prompt_id: Option<&str>) {
        if let Some(id) = prompt_id {
            self.lock().in_flight.remove(id);
        }
    }

    fn on_closed(&self) {
        let dropped = {
            let mut st = self.lock();
            st.phase = ChannelPhase::Disconnected;
            st.outbound = None;
            std::mem::take(&mut st.in_flight).len()
        };
        if dropped > 0 {
            log::warn!("{dropped} prompt(s) abandoned by disconnect");
        }
        log::info!("Inference channel disconnected");
        self.emit(ChannelEvent::Disconnected);

        if !self.inner.shutdown.is_cancelled() {
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        let mut st = self.lock();
        if st.reconnect.is_some() {
            log::debug!("reconnect already scheduled");
            return;
        }

        let delay = self.inner.reconnect_delay;
        self.inner.reconnects_scheduled.fetch_add(1, Ordering::SeqCst);
        log::info!("Reconnecting to inference channel in {delay:?}");

        let this = self.clone();
        st.reconnect = Some(tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = this.inner.shutdown.cancelled() => return,
            }
            this.lock().reconnect = None;
            this.connect();
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Echo-style fake inference server. Replies to a prompt with
    /// started, one token, then completion. Returns (url, accepted count).
    async fn fake_server(drop_first: bool) -> (String, Arc<AtomicU64>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicU64::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(stream).await else {
                        return;
                    };
                    if drop_first && n == 0 {
                        let _ = ws.close(None).await;
                        return;
                    }
                    let _ = ws
                        .send(Message::Text(r#"{"type":"ready","sessionId":"s1"}"#.into()))
                        .await;
                    while let Some(Ok(msg)) = ws.next().await {
                        let Message::Text(text) = msg else { continue };
                        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
                        if v["action"] == "prompt" {
                            let id = v["promptId"].as_str().unwrap().to_string();
                            let frames = [
                                serde_json::json!({"type": "mystery"}),
                                serde_json::json!({"type": "started", "status": "started", "promptId": id, "sessionId": "s1"}),
                                serde_json::json!({"type": "token", "promptId": id, "token": "Hi"}),
                                serde_json::json!({"type": "complete", "promptId": id, "complete": true}),
                            ];
                            for frame in frames {
                                let _ = ws.send(Message::Text(frame.to_string())).await;
                            }
                        } else if v["action"] == "clear_memory" {
                            let frame = serde_json::json!({"type": "memory_cleared", "status": "history_cleared", "sessionId": "s1"});
                            let _ = ws.send(Message::Text(frame.to_string())).await;
                        }
                    }
                });
            }
        });

        (url, accepted)
    }

    async fn next_event(rx: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for channel event")
            .unwrap()
    }

    #[tokio::test]
    async fn send_while_disconnected_returns_none() {
        let channel = MessageChannel::new("ws://127.0.0.1:9", Duration::from_secs(3));
        assert_eq!(channel.phase(), ChannelPhase::Disconnected);
        assert!(channel.send("hello").is_none());
        assert!(channel.in_flight().is_empty());
        channel.cancel("nope");
        channel.clear_memory();
    }

    #[tokio::test]
    async fn prompt_round_trip() {
        let (url, accepted) = fake_server(false).await;
        let channel = MessageChannel::new(url, Duration::from_millis(100));
        let mut events = channel.subscribe();

        channel.connect();
        channel.connect();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Ready);
        assert_eq!(channel.phase(), ChannelPhase::Connected);

        let id = channel.send("hello").unwrap();
        assert_eq!(channel.in_flight().len(), 1);

        assert!(matches!(next_event(&mut events).await, ChannelEvent::Started { .. }));
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Token {
                prompt_id: id.clone(),
                token: "Hi".into()
            }
        );
        assert_eq!(
            next_event(&mut events).await,
            ChannelEvent::Complete {
                prompt_id: Some(id)
            }
        );
        assert!(channel.in_flight().is_empty());
        assert!(channel.send("again").is_some());

        channel.clear_memory();
        loop {
            if let ChannelEvent::MemoryCleared { session_id } = next_event(&mut events).await {
                assert_eq!(session_id.as_deref(), Some("s1"));
                break;
            }
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        channel.shutdown();
    }

    #[tokio::test]
    async fn reconnects_after_server_close() {
        let (url, accepted) = fake_server(true).await;
        let channel = MessageChannel::new(url, Duration::from_millis(100));
        let mut events = channel.subscribe();
        channel.connect();

        assert_eq!(next_event(&mut events).await, ChannelEvent::Ready);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
        assert_eq!(next_event(&mut events).await, ChannelEvent::Ready);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(channel.inner.reconnects_scheduled.load(Ordering::SeqCst), 1);
        channel.shutdown();
    }

    #[tokio::test]
    async fn repeated_close_schedules_one_reconnect() {
        let channel = MessageChannel::new("ws://127.0.0.1:9", Duration::from_secs(60));
        channel.on_closed();
        channel.on_closed();
        channel.on_closed();
        assert_eq!(channel.inner.reconnects_scheduled.load(Ordering::SeqCst), 1);
        channel.shutdown();
        assert!(channel.lock().reconnect.is_none());
    }

    #[tokio::test]
    async fn shutdown_stops_reconnect_loop() {
        let (url, accepted) = fake_server(false).await;
        let channel = MessageChannel::new(url, Duration::from_millis(50));
        let mut events = channel.subscribe();
        channel.connect();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Ready);

        channel.shutdown();
        assert_eq!(next_event(&mut events).await, ChannelEvent::Disconnected);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(channel.phase(), ChannelPhase::Disconnected);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);

        channel.connect();
        assert_eq!(channel.phase(), ChannelPhase::Disconnected);
    }
}
