//! State Store - the single canonical asset -> book/status mapping.
//!
//! Readers get a lock-free [`StoreSnapshot`] through `ArcSwap`. Writers go
//! through the bulk operations below, which are serialized by one mutex and
//! publish exactly one new snapshot (and one revision notification) each.

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{broadcast, watch};
use tracing::trace;

use crate::models::{BookState, ConnectionStatus, LastTrade};

/// Frame counter wraps here
pub const FRAME_MODULUS: u32 = 1_000_000;

const TRADE_CHANNEL_CAPACITY: usize = 1024;

/// Immutable view of the store at one revision
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub books: HashMap<String, Arc<BookState>>,
    pub status: HashMap<String, ConnectionStatus>,
    pub frame: u32,
    /// Incremented once per bulk mutation
    pub revision: u64,
}

impl StoreSnapshot {
    pub fn book(&self, asset_id: &str) -> Option<&Arc<BookState>> {
        self.books.get(asset_id)
    }

    pub fn status(&self, asset_id: &str) -> Option<ConnectionStatus> {
        self.status.get(asset_id).copied()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for status in self.status.values() {
            match status {
                ConnectionStatus::Connecting => counts.connecting += 1,
                ConnectionStatus::Live => counts.live += 1,
                ConnectionStatus::Error => counts.error += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub connecting: usize,
    pub live: usize,
    pub error: usize,
}

/// A new trade seen on an asset's book
#[derive(Debug, Clone, PartialEq)]
pub struct TradeNotice {
    pub asset_id: String,
    pub trade: LastTrade,
}

pub struct BookStore {
    current: ArcSwap<StoreSnapshot>,
    write_lock: Mutex<()>,
    revision_tx: watch::Sender<u64>,
    frame_tx: watch::Sender<u32>,
    trades_tx: broadcast::Sender<TradeNotice>,
}

impl Default for BookStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BookStore {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        let (frame_tx, _) = watch::channel(0);
        let (trades_tx, _) = broadcast::channel(TRADE_CHANNEL_CAPACITY);
        Self {
            current: ArcSwap::from_pointee(StoreSnapshot::default()),
            write_lock: Mutex::new(()),
            revision_tx,
            frame_tx,
            trades_tx,
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    #[inline]
    pub fn snapshot(&self) -> Arc<StoreSnapshot> {
        self.current.load_full()
    }

    pub fn book(&self, asset_id: &str) -> Option<Arc<BookState>> {
        self.current.load().books.get(asset_id).cloned()
    }

    pub fn status(&self, asset_id: &str) -> Option<ConnectionStatus> {
        self.current.load().status.get(asset_id).copied()
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.current.load().frame
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.current.load().revision
    }

    pub fn book_count(&self) -> usize {
        self.current.load().books.len()
    }

    /// Fires once per bulk mutation
    pub fn subscribe_revision(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    /// Fires once per flush
    pub fn subscribe_frame(&self) -> watch::Receiver<u32> {
        self.frame_tx.subscribe()
    }

    pub fn subscribe_trades(&self) -> broadcast::Receiver<TradeNotice> {
        self.trades_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Atomic bulk writes
    // ------------------------------------------------------------------

    /// Merge `updates` into the books, optionally stamping `status` on every
    /// touched asset, as one notification.
    pub fn set_books_bulk(
        &self,
        updates: HashMap<String, BookState>,
        status: Option<ConnectionStatus>,
    ) {
        if updates.is_empty() {
            return;
        }

        let mut trades = Vec::new();
        self.mutate(|next| {
            for (asset_id, book) in updates {
                let prev_ts = next.books.get(&asset_id).and_then(|b| b.last_trade_ts());
                if let Some(trade) = book.last_trade {
                    if prev_ts != Some(trade.timestamp) {
                        trades.push(TradeNotice {
                            asset_id: asset_id.clone(),
                            trade,
                        });
                    }
                }
                if let Some(status) = status {
                    next.status.insert(asset_id.clone(), status);
                }
                next.books.insert(asset_id, Arc::new(book));
            }
            true
        });

        for notice in trades {
            // No receivers is fine
            let _ = self.trades_tx.send(notice);
        }
    }

    /// Stamp `status` on every listed asset as one notification.
    pub fn set_status_bulk<I, S>(&self, asset_ids: I, status: ConnectionStatus)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = asset_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        if ids.is_empty() {
            return;
        }

        self.mutate(|next| {
            let mut changed = false;
            for id in ids {
                if next.status.insert(id, status) != Some(status) {
                    changed = true;
                }
            }
            changed
        });
    }

    /// Remove the book and status of one asset. Returns false (and notifies
    /// nobody) if neither existed.
    pub fn clear_book(&self, asset_id: &str) -> bool {
        self.clear_books([asset_id]) > 0
    }

    /// Remove books and statuses of many assets as one notification.
    /// Returns how many assets had an entry.
    pub fn clear_books<I, S>(&self, asset_ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let ids: Vec<String> = asset_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .collect();
        if ids.is_empty() {
            return 0;
        }

        let mut removed = 0;
        self.mutate(|next| {
            for id in &ids {
                let had_book = next.books.remove(id).is_some();
                let had_status = next.status.remove(id).is_some();
                if had_book || had_status {
                    removed += 1;
                }
            }
            removed > 0
        });
        removed
    }

    /// Advance the frame counter by one (mod [`FRAME_MODULUS`]).
    pub fn bump_frame(&self) -> u32 {
        let _guard = self.write_lock.lock();
        let cur = self.current.load();
        let mut next = StoreSnapshot::clone(&cur);
        next.frame = (next.frame + 1) % FRAME_MODULUS;
        let frame = next.frame;
        self.current.store(Arc::new(next));
        self.frame_tx.send_replace(frame);
        frame
    }

    /// Copy-on-write helper. `apply` returns whether anything changed; an
    /// unchanged store is neither republished nor notified.
    fn mutate<F>(&self, apply: F)
    where
        F: FnOnce(&mut StoreSnapshot) -> bool,
    {
        let _guard = self.write_lock.lock();
        let cur = self.current.load();
        let mut next = StoreSnapshot::clone(&cur);
        if !apply(&mut next) {
            return;
        }
        next.revision = next.revision.wrapping_add(1);
        let revision = next.revision;
        self.current.store(Arc::new(next));
        self.revision_tx.send_replace(revision);
        trace!(revision, "store revision published");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderLevel, TradeSide};

    fn book(msg_count: u64) -> BookState {
        BookState {
            ready: true,
            msg_count,
            bids: vec![OrderLevel {
                price: 0.45,
                size: 10.0,
                cumulative: 10.0,
            }],
            asks: vec![OrderLevel {
                price: 0.55,
                size: 10.0,
                cumulative: 10.0,
            }],
            tick_size: 0.01,
            last_trade: None,
        }
    }

    fn with_trade(mut b: BookState, ts: i64) -> BookState {
        b.last_trade = Some(LastTrade {
            price: 0.5,
            size: 1.0,
            side: TradeSide::Buy,
            timestamp: ts,
        });
        b
    }

    #[test]
    fn test_bulk_set_is_one_revision() {
        let store = BookStore::new();
        let mut updates = HashMap::new();
        updates.insert("A".to_string(), book(1));
        updates.insert("B".to_string(), book(2));
        updates.insert("C".to_string(), book(3));

        store.set_books_bulk(updates, Some(ConnectionStatus::Live));

        assert_eq!(store.revision(), 1);
        assert_eq!(store.book_count(), 3);
        assert_eq!(store.status("B"), Some(ConnectionStatus::Live));
        assert_eq!(store.book("C").unwrap().msg_count, 3);
    }

    #[test]
    fn test_bulk_set_without_status_keeps_status() {
        let store = BookStore::new();
        store.set_status_bulk(["A"], ConnectionStatus::Connecting);
        store.set_books_bulk(HashMap::from([("A".to_string(), book(1))]), None);
        assert_eq!(store.status("A"), Some(ConnectionStatus::Connecting));
    }

    #[test]
    fn test_status_bulk_and_counts() {
        let store = BookStore::new();
        store.set_status_bulk(["A", "B", "C"], ConnectionStatus::Connecting);
        store.set_status_bulk(["C"], ConnectionStatus::Error);

        let counts = store.snapshot().status_counts();
        assert_eq!(counts.connecting, 2);
        assert_eq!(counts.error, 1);
        assert_eq!(store.revision(), 2);

        // Same status again changes nothing
        store.set_status_bulk(["C"], ConnectionStatus::Error);
        assert_eq!(store.revision(), 2);
    }

    #[test]
    fn test_clear_book_is_idempotent() {
        let store = BookStore::new();
        store.set_books_bulk(
            HashMap::from([("A".to_string(), book(1))]),
            Some(ConnectionStatus::Live),
        );
        let rev = store.revision();

        assert!(store.clear_book("A"));
        assert!(store.book("A").is_none());
        assert!(store.status("A").is_none());
        assert_eq!(store.revision(), rev + 1);

        assert!(!store.clear_book("A"));
        assert_eq!(store.revision(), rev + 1);
    }

    #[test]
    fn test_clear_removes_status_only_entries() {
        let store = BookStore::new();
        store.set_status_bulk(["A", "B"], ConnectionStatus::Connecting);
        assert_eq!(store.clear_books(["A", "B", "Z"]), 2);
        assert!(store.snapshot().status.is_empty());
    }

    #[test]
    fn test_frame_wraps() {
        let store = BookStore::new();
        assert_eq!(store.bump_frame(), 1);

        {
            let _guard = store.write_lock.lock();
            let mut next = StoreSnapshot::clone(&store.current.load());
            next.frame = FRAME_MODULUS - 1;
            store.current.store(Arc::new(next));
        }
        assert_eq!(store.bump_frame(), 0);
        // Frame bumps do not count as content revisions
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_trade_notice_only_on_new_timestamp() {
        let store = BookStore::new();
        let mut trades = store.subscribe_trades();

        store.set_books_bulk(
            HashMap::from([("A".to_string(), with_trade(book(1), 100))]),
            None,
        );
        store.set_books_bulk(
            HashMap::from([("A".to_string(), with_trade(book(2), 100))]),
            None,
        );
        store.set_books_bulk(
            HashMap::from([("A".to_string(), with_trade(book(3), 101))]),
            None,
        );

        let first = trades.try_recv().unwrap();
        assert_eq!(first.asset_id, "A");
        assert_eq!(first.trade.timestamp, 100);
        assert_eq!(trades.try_recv().unwrap().trade.timestamp, 101);
        assert!(trades.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_revision_watch_notifies_once_per_bulk() {
        let store = BookStore::new();
        let mut rx = store.subscribe_revision();

        let updates: HashMap<String, BookState> =
            (0..50).map(|i| (format!("asset-{i}"), book(i))).collect();
        store.set_books_bulk(updates, Some(ConnectionStatus::Live));

        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 1);
        assert!(!rx.has_changed().unwrap());
    }
}
