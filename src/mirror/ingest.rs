//! Ingestion Worker - validates raw frames off the caller's path and
//! coalesces them per asset into timed batches.
//!
//! The worker owns its pending buffer and its single flush timer; nothing
//! else touches them. Frames come in over one mpsc channel, batches leave
//! over another.

use serde_json::Value;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, oneshot},
    task::{JoinError, JoinHandle},
    time::{sleep, Instant},
};
use tracing::{debug, trace};

use super::{
    metrics::IngestMetrics,
    validator::{is_loading_placeholder, validate_update},
};
use crate::models::BookState;

/// A raw text frame, numbered by the transport in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundFrame {
    pub seq: u64,
    pub text: String,
}

/// A validated update and the sequence number of the frame it came from
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub seq: u64,
    pub book: BookState,
}

/// One flush worth of updates, at most one per asset
pub type FlushBatch = HashMap<String, PendingUpdate>;

/// Pending per-asset updates between two flushes
pub struct IngestBuffer {
    pending: FlushBatch,
    max_depth: usize,
    metrics: Arc<IngestMetrics>,
}

impl IngestBuffer {
    pub fn new(max_depth: usize, metrics: Arc<IngestMetrics>) -> Self {
        Self {
            pending: HashMap::new(),
            max_depth,
            metrics,
        }
    }

    /// Feed one raw text frame. Returns how many updates it contributed.
    pub fn ingest_frame(&mut self, seq: u64, raw: &str) -> usize {
        IngestMetrics::incr(&self.metrics.frames_received);

        let trimmed = raw.trim();
        if !matches!(trimmed.as_bytes().first(), Some(b'{') | Some(b'[')) {
            IngestMetrics::incr(&self.metrics.fast_rejects);
            trace!(len = raw.len(), "fast-rejected non-JSON frame");
            return 0;
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                IngestMetrics::incr(&self.metrics.invalid_frames);
                trace!(error = %e, "unparsable frame");
                return 0;
            }
        };

        match value {
            Value::Array(items) => items.iter().map(|p| self.ingest_payload(seq, p)).sum(),
            Value::Object(ref obj) if obj.get("type").and_then(Value::as_str) == Some("books") => {
                match obj.get("updates").and_then(Value::as_array) {
                    Some(items) => items.iter().map(|p| self.ingest_payload(seq, p)).sum(),
                    None => {
                        IngestMetrics::incr(&self.metrics.invalid_frames);
                        0
                    }
                }
            }
            other => self.ingest_payload(seq, &other),
        }
    }

    fn ingest_payload(&mut self, seq: u64, payload: &Value) -> usize {
        if is_loading_placeholder(payload) {
            IngestMetrics::incr(&self.metrics.loading_placeholders);
            return 0;
        }

        let Some(update) = validate_update(payload, self.max_depth) else {
            IngestMetrics::incr(&self.metrics.invalid_frames);
            return 0;
        };

        IngestMetrics::incr(&self.metrics.updates_accepted);
        // Last write before the flush wins
        let pending = PendingUpdate {
            seq,
            book: update.book,
        };
        if self.pending.insert(update.asset_id, pending).is_some() {
            IngestMetrics::incr(&self.metrics.coalesced_overwrites);
        }
        1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Drain the buffer into a batch
    pub fn take(&mut self) -> FlushBatch {
        std::mem::take(&mut self.pending)
    }
}

/// Handle to a running worker task
pub struct IngestWorker {
    frames_tx: mpsc::UnboundedSender<InboundFrame>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl IngestWorker {
    pub fn spawn(
        flush_window: Duration,
        max_depth: usize,
        metrics: Arc<IngestMetrics>,
        batches_tx: mpsc::UnboundedSender<FlushBatch>,
    ) -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let buffer = IngestBuffer::new(max_depth, metrics.clone());

        let task = tokio::spawn(run_worker(
            frames_rx,
            batches_tx,
            shutdown_rx,
            buffer,
            flush_window,
            metrics,
        ));

        Self {
            frames_tx,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Producer side of the frame channel
    pub fn frame_sender(&self) -> mpsc::UnboundedSender<InboundFrame> {
        self.frames_tx.clone()
    }

    /// Resolves when the task exits for any reason. Cancel safe.
    pub async fn wait(&mut self) -> Result<(), JoinError> {
        (&mut self.task).await
    }

    /// Stop the worker and wait for it. Pending updates and the flush timer
    /// are dropped.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if !self.task.is_finished() {
            let _ = (&mut self.task).await;
        }
    }

    /// Kill the task without a clean stop
    #[cfg(test)]
    pub(crate) fn abort(&self) {
        self.task.abort();
    }
}

async fn run_worker(
    mut frames_rx: mpsc::UnboundedReceiver<InboundFrame>,
    batches_tx: mpsc::UnboundedSender<FlushBatch>,
    mut shutdown_rx: oneshot::Receiver<()>,
    mut buffer: IngestBuffer,
    flush_window: Duration,
    metrics: Arc<IngestMetrics>,
) {
    let flush = sleep(flush_window);
    tokio::pin!(flush);
    let mut armed = false;

    debug!(window_ms = flush_window.as_millis() as u64, "ingest worker started");

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(dropped = buffer.len(), "ingest worker stopping");
                break;
            }

            frame = frames_rx.recv() => {
                let Some(frame) = frame else {
                    // Every producer is gone; deliver what we have and exit
                    if !buffer.is_empty() {
                        let _ = batches_tx.send(buffer.take());
                        IngestMetrics::incr(&metrics.flushes);
                    }
                    break;
                };

                buffer.ingest_frame(frame.seq, &frame.text);

                // At most one timer, and only once there is something to flush
                if !armed && !buffer.is_empty() {
                    flush.as_mut().reset(Instant::now() + flush_window);
                    armed = true;
                    IngestMetrics::incr(&metrics.flush_timers_armed);
                }
            }

            () = &mut flush, if armed => {
                armed = false;
                let batch = buffer.take();
                if batch.is_empty() {
                    continue;
                }
                trace!(assets = batch.len(), "flushing batch");
                IngestMetrics::incr(&metrics.flushes);
                if batches_tx.send(batch).is_err() {
                    debug!("batch receiver dropped, ingest worker exiting");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(asset: &str, msg_count: u64) -> String {
        json!({
            "asset_id": asset,
            "ready": true,
            "msg_count": msg_count,
            "bids": [{"price": 0.4, "size": 10.0, "cum": 10.0}],
            "asks": [{"price": 0.6, "size": 10.0, "cum": 10.0}]
        })
        .to_string()
    }

    fn inbound(seq: u64, text: impl Into<String>) -> InboundFrame {
        InboundFrame {
            seq,
            text: text.into(),
        }
    }

    fn buffer() -> (IngestBuffer, Arc<IngestMetrics>) {
        let metrics = Arc::new(IngestMetrics::default());
        (IngestBuffer::new(20, metrics.clone()), metrics)
    }

    #[test]
    fn test_fast_reject() {
        let (mut buf, metrics) = buffer();
        assert_eq!(buf.ingest_frame(0, ""), 0);
        assert_eq!(buf.ingest_frame(0, "   \n"), 0);
        assert_eq!(buf.ingest_frame(0, "PONG"), 0);
        assert_eq!(buf.ingest_frame(0, "42"), 0);

        let s = metrics.summary();
        assert_eq!(s.frames_received, 4);
        assert_eq!(s.fast_rejects, 4);
        assert_eq!(s.invalid_frames, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_frames_counted_and_processing_continues() {
        let (mut buf, metrics) = buffer();
        assert_eq!(buf.ingest_frame(0, "{not json"), 0);
        assert_eq!(buf.ingest_frame(0, r#"{"asset_id": "A", "ready": "no"}"#), 0);
        assert_eq!(buf.ingest_frame(0, &frame("A", 1)), 1);

        assert_eq!(metrics.summary().invalid_frames, 2);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_loading_placeholder_is_ignored_not_invalid() {
        let (mut buf, metrics) = buffer();
        buf.ingest_frame(0, r#"{"status": "loading", "asset_id": "A"}"#);
        let s = metrics.summary();
        assert_eq!(s.loading_placeholders, 1);
        assert_eq!(s.invalid_frames, 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_last_write_wins() {
        let (mut buf, metrics) = buffer();
        buf.ingest_frame(1, &frame("A", 1));
        buf.ingest_frame(2, &frame("A", 2));
        buf.ingest_frame(3, &frame("A", 3));

        let batch = buf.take();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch["A"].book.msg_count, 3);
        assert_eq!(batch["A"].seq, 3);
        assert_eq!(metrics.summary().coalesced_overwrites, 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_envelope_and_array_elements_validated_independently() {
        let (mut buf, metrics) = buffer();
        let envelope = format!(
            r#"{{"type": "books", "updates": [{}, {{"asset_id": "X"}}, {{"status": "loading", "asset_id": "Y"}}]}}"#,
            frame("A", 1)
        );
        assert_eq!(buf.ingest_frame(0, &envelope), 1);

        let array = format!("[{}, {}]", frame("B", 1), frame("C", 1));
        assert_eq!(buf.ingest_frame(0, &array), 2);

        let s = metrics.summary();
        assert_eq!(s.invalid_frames, 1);
        assert_eq!(s.loading_placeholders, 1);
        assert_eq!(buf.len(), 3);
    }

    fn spawn_worker() -> (
        IngestWorker,
        mpsc::UnboundedReceiver<FlushBatch>,
        Arc<IngestMetrics>,
    ) {
        let metrics = Arc::new(IngestMetrics::default());
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let worker = IngestWorker::spawn(
            Duration::from_millis(200),
            20,
            metrics.clone(),
            batches_tx,
        );
        (worker, batches_rx, metrics)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalescing_window() {
        let (worker, mut batches, metrics) = spawn_worker();
        let tx = worker.frame_sender();
        let start = Instant::now();

        tx.send(inbound(1, frame("A", 1))).unwrap();
        sleep(Duration::from_millis(10)).await;
        tx.send(inbound(2, frame("B", 10))).unwrap();
        sleep(Duration::from_millis(40)).await;
        tx.send(inbound(3, frame("A", 50))).unwrap();

        let batch = batches.recv().await.unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(250));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch["A"].book.msg_count, 50);
        assert_eq!(batch["B"].book.msg_count, 10);
        // The surviving update keeps the number of the frame it came from
        assert_eq!(batch["A"].seq, 3);

        let s = metrics.summary();
        assert_eq!(s.flushes, 1);
        assert_eq!(s.flush_timers_armed, 1);

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_worker_arms_no_timer() {
        let (worker, mut batches, metrics) = spawn_worker();
        let tx = worker.frame_sender();

        sleep(Duration::from_secs(5)).await;
        assert_eq!(metrics.summary().flush_timers_armed, 0);

        // Noise alone never arms a timer either
        tx.send(inbound(0, "ping")).unwrap();
        tx.send(inbound(1, "{broken")).unwrap();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(metrics.summary().flush_timers_armed, 0);
        assert!(batches.try_recv().is_err());

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_timer_per_window() {
        let (worker, mut batches, metrics) = spawn_worker();
        let tx = worker.frame_sender();

        for i in 0..20 {
            tx.send(inbound(i, frame("A", i))).unwrap();
            sleep(Duration::from_millis(5)).await;
        }
        let first = batches.recv().await.unwrap();
        assert_eq!(metrics.summary().flush_timers_armed, 1);
        assert_eq!(first["A"].book.msg_count, 19);

        // Next frame opens a new window
        tx.send(inbound(20, frame("B", 1))).unwrap();
        let second = batches.recv().await.unwrap();
        assert!(second.contains_key("B"));
        assert_eq!(metrics.summary().flush_timers_armed, 2);

        worker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_flush() {
        let (worker, mut batches, metrics) = spawn_worker();
        worker.frame_sender().send(inbound(0, frame("A", 1))).unwrap();
        sleep(Duration::from_millis(50)).await;

        worker.shutdown().await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(metrics.summary().flushes, 0);
        // Worker is gone, so the channel is closed and empty
        assert!(batches.recv().await.is_none());
    }
}
