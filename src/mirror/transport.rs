//! Transport - owns the one multiplexed books connection.
//!
//! A single task owns the socket, the reconnect timer and the backoff
//! counter. Everything else talks to it through a command channel; the only
//! state it shares is the desired asset set and the transport state, kept
//! together under one lock so that "is it open" and "what will the next
//! resync carry" are always decided atomically.
//!
//! Every forwarded frame carries a sequence number. On open the transport
//! records the first number of the new connection, so a consumer can tell
//! frames of the live connection from frames of one that already closed.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        error::ProtocolError,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use super::{
    ingest::InboundFrame,
    metrics::TransportMetrics,
    session::{Disconnect, ReconnectBackoff, TransportState, ABNORMAL_CLOSE_CODE},
    store::BookStore,
    subscriptions::SubscriptionSink,
};
use crate::{
    config::MirrorConfig,
    models::{AssetSubscription, Intent},
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Command {
    Send(Intent),
    Stop,
}

enum SessionEnd {
    Stopped,
    Disconnected(Disconnect),
}

struct Shared {
    state: TransportState,
    desired: Vec<AssetSubscription>,
    /// Sequence number of the first frame of the current connection
    open_seq: u64,
}

struct Inner {
    config: MirrorConfig,
    shared: Mutex<Shared>,
    state_tx: watch::Sender<TransportState>,
    frames_tx: Mutex<mpsc::UnboundedSender<InboundFrame>>,
    next_seq: AtomicU64,
    store: Arc<BookStore>,
    metrics: Arc<TransportMetrics>,
}

struct Running {
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct Transport {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

impl Transport {
    /// `frames_tx` receives every inbound text frame.
    pub fn new(
        config: &MirrorConfig,
        store: Arc<BookStore>,
        frames_tx: mpsc::UnboundedSender<InboundFrame>,
        metrics: Arc<TransportMetrics>,
    ) -> Self {
        let (state_tx, _) = watch::channel(TransportState::Idle);
        Self {
            inner: Arc::new(Inner {
                config: config.clone(),
                shared: Mutex::new(Shared {
                    state: TransportState::Idle,
                    desired: Vec::new(),
                    open_seq: 0,
                }),
                state_tx,
                frames_tx: Mutex::new(frames_tx),
                next_seq: AtomicU64::new(0),
                store,
                metrics,
            }),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> TransportState {
        self.inner.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Every state transition, in order (intermediate values may be skipped
    /// by slow readers)
    pub fn subscribe_state(&self) -> watch::Receiver<TransportState> {
        self.inner.state_tx.subscribe()
    }

    pub fn metrics(&self) -> &Arc<TransportMetrics> {
        &self.inner.metrics
    }

    /// The set the next open will resync
    pub fn desired(&self) -> Vec<AssetSubscription> {
        self.inner.shared.lock().desired.clone()
    }

    /// Point inbound frames at a different consumer
    pub fn rewire(&self, frames_tx: mpsc::UnboundedSender<InboundFrame>) {
        *self.inner.frames_tx.lock() = frames_tx;
    }

    /// Sequence number the next inbound frame will get
    pub fn next_seq(&self) -> u64 {
        self.inner.next_seq.load(Ordering::SeqCst)
    }

    /// Run `apply` with the first sequence number of the current connection,
    /// holding the state lock, if the connection is open. A disconnect cannot
    /// land while `apply` runs, so whatever it writes is either followed by
    /// the disconnect's status stamp or not written at all.
    pub fn with_open_connection<R>(&self, apply: impl FnOnce(u64) -> R) -> Option<R> {
        let shared = self.inner.shared.lock();
        (shared.state == TransportState::Open).then(|| apply(shared.open_seq))
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.task.is_finished())
    }

    /// Record `desired` and make sure a connection task is running. A
    /// running task picks the new set up on its next open.
    pub fn start(&self, desired: &[AssetSubscription]) {
        self.inner.shared.lock().desired = desired.to_vec();

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return;
        }

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(self.inner.clone(), cmd_rx));
        *running = Some(Running { cmd_tx, task });
    }

    /// Write an intent if the connection is open; otherwise it is dropped and
    /// the next open's resync covers it.
    pub fn send(&self, intent: Intent) {
        let running = self.running.lock();
        match running.as_ref() {
            Some(r) if r.cmd_tx.send(Command::Send(intent)).is_ok() => {}
            _ => TransportMetrics::incr(&self.inner.metrics.intents_dropped),
        }
    }

    /// Cancel any pending reconnect, detach the reader, close the socket and
    /// wait for the connection task to finish. Leaves the transport `Idle`.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.cmd_tx.send(Command::Stop);
            if let Err(e) = running.task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "transport task failed");
                }
            }
        }
        self.inner.set_state(TransportState::Idle);
    }
}

impl SubscriptionSink for Transport {
    fn update_desired(&self, desired: &[AssetSubscription]) -> bool {
        let mut shared = self.inner.shared.lock();
        shared.desired = desired.to_vec();
        shared.state == TransportState::Open
    }

    fn send(&self, intent: Intent) {
        Transport::send(self, intent);
    }

    fn frame_fence(&self) -> u64 {
        self.next_seq()
    }
}

impl Inner {
    fn set_state(&self, state: TransportState) {
        self.shared.lock().state = state;
        self.publish_state(state);
    }

    fn publish_state(&self, state: TransportState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    /// Flip to `Open` and snapshot the resync set in one step
    fn on_open(&self) -> Vec<AssetSubscription> {
        let desired = {
            let mut shared = self.shared.lock();
            shared.state = TransportState::Open;
            shared.open_seq = self.next_seq.load(Ordering::SeqCst);
            shared.desired.clone()
        };
        self.publish_state(TransportState::Open);
        desired
    }

    fn on_disconnect(&self, disconnect: &Disconnect) {
        let state = disconnect.transport_state();
        {
            let mut shared = self.shared.lock();
            shared.state = state;
            self.store.set_status_bulk(
                shared.desired.iter().map(|s| s.asset_id.as_str()),
                disconnect.asset_status(),
            );
        }
        self.publish_state(state);

        let counter = match disconnect {
            Disconnect::Normal => &self.metrics.normal_closes,
            Disconnect::Abnormal { .. } => &self.metrics.abnormal_closes,
            Disconnect::Failed { .. } => &self.metrics.errors,
        };
        TransportMetrics::incr(counter);
    }

    /// Handle a command while no socket is open. Returns true on stop.
    fn absorb_idle_command(&self, cmd: Option<Command>) -> bool {
        match cmd {
            Some(Command::Send(intent)) => {
                TransportMetrics::incr(&self.metrics.intents_dropped);
                trace!(assets = intent.len(), "intent dropped while not open");
                false
            }
            Some(Command::Stop) | None => true,
        }
    }

    fn forward(&self, text: String) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        if self.frames_tx.lock().send(InboundFrame { seq, text }).is_ok() {
            TransportMetrics::incr(&self.metrics.frames_forwarded);
        } else {
            trace!("frame consumer gone, frame dropped");
        }
    }

    async fn stream(
        &self,
        ws: WsStream,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
        backoff: &mut ReconnectBackoff,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        let resync = self.on_open();
        backoff.reset();
        TransportMetrics::incr(&self.metrics.opens);
        info!(assets = resync.len(), "books stream open");

        // Full resync, never a diff
        if !resync.is_empty() {
            let intent = Intent::Subscribe { assets: resync };
            if let Err(e) = write.send(Message::Text(intent.to_json())).await {
                return SessionEnd::Disconnected(Disconnect::Failed {
                    reason: format!("resync send failed: {e}"),
                });
            }
            TransportMetrics::incr(&self.metrics.resyncs_sent);
            TransportMetrics::incr(&self.metrics.intents_sent);
        }

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Send(intent)) => {
                        if intent.is_empty() {
                            continue;
                        }
                        if let Err(e) = write.send(Message::Text(intent.to_json())).await {
                            return SessionEnd::Disconnected(Disconnect::Failed {
                                reason: format!("intent send failed: {e}"),
                            });
                        }
                        TransportMetrics::incr(&self.metrics.intents_sent);
                        debug!(assets = intent.len(), "intent sent");
                    }
                    Some(Command::Stop) | None => {
                        // Detach the reader before closing so nothing is
                        // delivered after teardown
                        drop(read);
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "client stop".into(),
                        };
                        let closing = async {
                            write.send(Message::Close(Some(frame))).await?;
                            write.close().await
                        };
                        match timeout(self.config.close_timeout(), closing).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => debug!(error = %e, "close handshake failed"),
                            Err(_) => debug!("close handshake timed out"),
                        }
                        return SessionEnd::Stopped;
                    }
                },

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.forward(text),
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => self.forward(text),
                        Err(_) => trace!("non-UTF-8 binary frame dropped"),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            return SessionEnd::Disconnected(classify_error(e));
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "close frame received");
                        return SessionEnd::Disconnected(Disconnect::from_close_frame(frame.as_ref()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Disconnected(classify_error(e)),
                    None => {
                        return SessionEnd::Disconnected(Disconnect::Abnormal {
                            code: ABNORMAL_CLOSE_CODE,
                        });
                    }
                },
            }
        }
    }
}

/// The connection task: connect, stream, back off, repeat until stopped or
/// closed normally.
async fn run_connection(inner: Arc<Inner>, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
    let mut backoff = ReconnectBackoff::new(
        inner.config.reconnect_base_delay_ms,
        inner.config.reconnect_max_delay_ms,
        inner.config.reconnect_jitter_ms,
    );
    let connect_timeout = inner.config.connect_timeout();

    loop {
        inner.set_state(TransportState::Connecting);
        TransportMetrics::incr(&inner.metrics.connect_attempts);
        info!(url = %inner.config.ws_url, attempt = backoff.attempt(), "connecting to books stream");

        let connect = timeout(connect_timeout, connect_async(inner.config.ws_url.as_str()));
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                res = &mut connect => break res,
                cmd = cmd_rx.recv() => {
                    if inner.absorb_idle_command(cmd) {
                        inner.set_state(TransportState::Idle);
                        return;
                    }
                }
            }
        };

        let disconnect = match connected {
            Ok(Ok((ws, _response))) => match inner.stream(ws, &mut cmd_rx, &mut backoff).await {
                SessionEnd::Stopped => {
                    inner.set_state(TransportState::Idle);
                    info!("books stream stopped");
                    return;
                }
                SessionEnd::Disconnected(d) => d,
            },
            Ok(Err(e)) => Disconnect::Failed {
                reason: e.to_string(),
            },
            Err(_) => Disconnect::Failed {
                reason: format!("connect timed out after {}ms", connect_timeout.as_millis()),
            },
        };

        inner.on_disconnect(&disconnect);
        if !disconnect.should_reconnect() {
            info!("books stream closed normally, not reconnecting");
            return;
        }

        let delay = backoff.next_delay();
        TransportMetrics::incr(&inner.metrics.reconnects_scheduled);
        warn!(
            reason = %disconnect,
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempt(),
            "books stream disconnected, reconnecting"
        );

        let wait = sleep(delay);
        tokio::pin!(wait);
        loop {
            tokio::select! {
                () = &mut wait => break,
                cmd = cmd_rx.recv() => {
                    if inner.absorb_idle_command(cmd) {
                        inner.set_state(TransportState::Idle);
                        debug!("pending reconnect cancelled");
                        return;
                    }
                }
            }
        }
    }
}

fn classify_error(err: tungstenite::Error) -> Disconnect {
    use std::io::ErrorKind;

    match err {
        tungstenite::Error::ConnectionClosed
        | tungstenite::Error::AlreadyClosed
        | tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            Disconnect::Abnormal {
                code: ABNORMAL_CLOSE_CODE,
            }
        }
        tungstenite::Error::Io(ref e)
            if matches!(
                e.kind(),
                ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
            ) =>
        {
            Disconnect::Abnormal {
                code: ABNORMAL_CLOSE_CODE,
            }
        }
        other => Disconnect::Failed {
            reason: other.to_string(),
        },
    }
}
