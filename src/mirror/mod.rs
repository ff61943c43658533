//! Order-book mirror pipeline.
//!
//! ```text
//! desired set -> SubscriptionManager -> Transport -> IngestWorker -> supervisor -> BookStore
//! ```
//!
//! [`BookMirror`] is the one owner of the pipeline. It creates it when the
//! desired set first becomes non-empty and tears it down completely (socket,
//! reconnect timer, flush timer, tasks) when the set becomes empty again.

pub mod ingest;
pub mod metrics;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod transport;
pub mod validator;

use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::mpsc, task::JoinError, task::JoinHandle};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::MirrorConfig,
    models::{AssetSubscription, BookState, ConnectionStatus},
};

pub use ingest::{FlushBatch, InboundFrame, IngestWorker, PendingUpdate};
pub use metrics::{IngestMetrics, MirrorMetricsSummary, TransportMetrics};
pub use session::{Disconnect, ReconnectBackoff, TransportState};
pub use store::{BookStore, StatusCounts, StoreSnapshot, TradeNotice};
pub use subscriptions::{DetachedSink, SubscriptionDiff, SubscriptionManager, SubscriptionSink};
pub use transport::Transport;

enum Control {
    Shutdown,
    #[cfg(test)]
    KillWorker,
}

struct Pipeline {
    transport: Arc<Transport>,
    control_tx: mpsc::UnboundedSender<Control>,
    supervisor: JoinHandle<()>,
}

/// Coordinates the store, the subscription manager and the pipeline
pub struct BookMirror {
    config: MirrorConfig,
    store: Arc<BookStore>,
    manager: Arc<Mutex<SubscriptionManager>>,
    pipeline: tokio::sync::Mutex<Option<Pipeline>>,
    /// Read side of the live transport, for status reporting
    transport: RwLock<Option<Arc<Transport>>>,
    ingest_metrics: Arc<IngestMetrics>,
    transport_metrics: Arc<TransportMetrics>,
}

impl BookMirror {
    pub fn new(config: MirrorConfig) -> Self {
        Self::with_store(config, Arc::new(BookStore::new()))
    }

    pub fn with_store(config: MirrorConfig, store: Arc<BookStore>) -> Self {
        Self {
            config,
            store,
            manager: Arc::new(Mutex::new(SubscriptionManager::new())),
            pipeline: tokio::sync::Mutex::new(None),
            transport: RwLock::new(None),
            ingest_metrics: Arc::new(IngestMetrics::default()),
            transport_metrics: Arc::new(TransportMetrics::default()),
        }
    }

    #[inline]
    pub fn store(&self) -> &Arc<BookStore> {
        &self.store
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn active(&self) -> Vec<AssetSubscription> {
        self.manager.lock().active().to_vec()
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport
            .read()
            .as_ref()
            .map(|t| t.state())
            .unwrap_or(TransportState::Idle)
    }

    pub fn book(&self, asset_id: &str) -> Option<Arc<BookState>> {
        self.store.book(asset_id)
    }

    pub fn status(&self, asset_id: &str) -> Option<ConnectionStatus> {
        self.store.status(asset_id)
    }

    /// Register the desired asset set. Starts the pipeline on the first
    /// non-empty set and tears it down, before returning, once the set is
    /// empty.
    pub async fn set_desired(&self, desired: Vec<AssetSubscription>) -> SubscriptionDiff {
        let mut pipeline = self.pipeline.lock().await;

        let wants_assets = desired.iter().any(|s| !s.asset_id.trim().is_empty());
        if wants_assets && pipeline.is_none() {
            *pipeline = Some(self.spawn_pipeline());
        }

        let diff = {
            let mut manager = self.manager.lock();
            match pipeline.as_ref() {
                Some(p) => manager.apply(desired, p.transport.as_ref(), &self.store),
                None => manager.apply(desired, &DetachedSink, &self.store),
            }
        };

        let active = self.active();
        if active.is_empty() {
            if let Some(p) = pipeline.take() {
                self.teardown(p).await;
            }
        } else if let Some(p) = pipeline.as_ref() {
            // A transport that was closed normally comes back on the next change
            if !diff.is_empty() {
                p.transport.start(&active);
            }
        }

        diff
    }

    /// Tear everything down and clear the store
    pub async fn shutdown(&self) {
        self.set_desired(Vec::new()).await;
    }

    pub fn metrics_summary(&self) -> MirrorMetricsSummary {
        let snap = self.store.snapshot();
        MirrorMetricsSummary {
            frame: snap.frame,
            revision: snap.revision,
            books: snap.books.len(),
            active_assets: self.manager.lock().len(),
            status: snap.status_counts(),
            transport_state: self.transport_state().to_string(),
            ingest: self.ingest_metrics.summary(),
            transport: self.transport_metrics.summary(),
        }
    }

    fn spawn_pipeline(&self) -> Pipeline {
        let (batches_tx, batches_rx) = mpsc::unbounded_channel();
        let worker = IngestWorker::spawn(
            self.config.flush_window(),
            self.config.max_book_depth,
            self.ingest_metrics.clone(),
            batches_tx.clone(),
        );
        let transport = Arc::new(Transport::new(
            &self.config,
            self.store.clone(),
            worker.frame_sender(),
            self.transport_metrics.clone(),
        ));
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let supervisor = Supervisor {
            config: self.config.clone(),
            store: self.store.clone(),
            manager: self.manager.clone(),
            transport: transport.clone(),
            metrics: self.ingest_metrics.clone(),
            batches_tx,
            batches_rx,
            control_rx,
            worker,
            worker_alive: true,
            restarts: 0,
        };
        let supervisor = tokio::spawn(supervisor.run());

        *self.transport.write() = Some(transport.clone());
        info!(url = %self.config.ws_url, "mirror pipeline started");

        Pipeline {
            transport,
            control_tx,
            supervisor,
        }
    }

    async fn teardown(&self, pipeline: Pipeline) {
        pipeline.transport.stop().await;
        let _ = pipeline.control_tx.send(Control::Shutdown);
        if let Err(e) = pipeline.supervisor.await {
            warn!(error = %e, "mirror supervisor failed");
        }
        *self.transport.write() = None;
        info!("mirror pipeline torn down");
    }

    #[cfg(test)]
    async fn kill_worker(&self) {
        if let Some(p) = self.pipeline.lock().await.as_ref() {
            let _ = p.control_tx.send(Control::KillWorker);
        }
    }
}

/// Applies flushed batches to the store and keeps a worker alive
struct Supervisor {
    config: MirrorConfig,
    store: Arc<BookStore>,
    manager: Arc<Mutex<SubscriptionManager>>,
    transport: Arc<Transport>,
    metrics: Arc<IngestMetrics>,
    batches_tx: mpsc::UnboundedSender<FlushBatch>,
    batches_rx: mpsc::UnboundedReceiver<FlushBatch>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    worker: IngestWorker,
    worker_alive: bool,
    /// Consecutive restarts without a successful flush in between
    restarts: u32,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;

                control = self.control_rx.recv() => match control {
                    Some(Control::Shutdown) | None => break,
                    #[cfg(test)]
                    Some(Control::KillWorker) => self.worker.abort(),
                },

                batch = self.batches_rx.recv() => {
                    // We hold a sender, so this only ends with us
                    let Some(batch) = batch else { break };
                    self.apply_batch(batch);
                }

                exit = self.worker.wait(), if self.worker_alive => {
                    self.on_worker_exit(exit);
                }
            }
        }

        if self.worker_alive {
            self.worker.shutdown().await;
        }
        debug!("mirror supervisor stopped");
    }

    fn apply_batch(&mut self, mut batch: FlushBatch) {
        let offered = batch.len();
        let applied = {
            // The manager lock keeps a concurrent removal from re-creating a
            // cleared asset; the transport lock keeps a disconnect from
            // being overwritten with data from before it
            let manager = self.manager.lock();
            let store = &self.store;
            self.transport
                .with_open_connection(|connection_start| {
                    manager.retain_current(&mut batch, connection_start);
                    let books: HashMap<String, BookState> = batch
                        .drain()
                        .map(|(asset_id, update)| (asset_id, update.book))
                        .collect();
                    let applied = books.len();
                    if applied > 0 {
                        store.set_books_bulk(books, Some(ConnectionStatus::Live));
                    }
                    applied
                })
                .unwrap_or(0)
        };

        let dropped = offered - applied;
        if dropped > 0 {
            IngestMetrics::add(&self.metrics.stale_updates_dropped, dropped as u64);
            trace!(dropped, "dropped updates from a closed connection or subscription");
        }

        let frame = self.store.bump_frame();
        trace!(frame, "batch applied");
        self.restarts = 0;
    }

    fn on_worker_exit(&mut self, exit: Result<(), JoinError>) {
        self.worker_alive = false;

        {
            let manager = self.manager.lock();
            self.store.set_status_bulk(
                manager.active().iter().map(|s| s.asset_id.as_str()),
                ConnectionStatus::Error,
            );
        }

        match exit {
            Ok(()) => warn!("ingest worker exited unexpectedly"),
            Err(e) => warn!(error = %e, "ingest worker died"),
        }

        if self.restarts >= self.config.max_worker_restarts {
            error!(
                restarts = self.restarts,
                "ingest worker keeps dying, giving up until the next start"
            );
            return;
        }

        self.restarts += 1;
        IngestMetrics::incr(&self.metrics.worker_restarts);

        let worker = IngestWorker::spawn(
            self.config.flush_window(),
            self.config.max_book_depth,
            self.metrics.clone(),
            self.batches_tx.clone(),
        );
        self.transport.rewire(worker.frame_sender());
        self.worker = worker;
        self.worker_alive = true;
        info!(restart = self.restarts, "ingest worker restarted");
    }
}
