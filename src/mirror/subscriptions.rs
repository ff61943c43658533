//! Subscription Manager - diffs the desired asset set against the active one.
//!
//! `apply` is a pure diff keyed by asset id: the same input twice produces
//! no intents and no store writes the second time.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::{ingest::FlushBatch, store::BookStore};
use crate::models::{AssetSubscription, ConnectionStatus, Intent};

/// Where subscription intents go. Implemented by the transport.
pub trait SubscriptionSink {
    /// Replace the set the connection resyncs on open. Returns whether the
    /// connection is open at the moment the set was replaced.
    fn update_desired(&self, desired: &[AssetSubscription]) -> bool;

    /// Write an intent now, if the connection is open.
    fn send(&self, intent: Intent);

    /// Sequence number from which inbound frames can reflect an intent
    /// sent now. Without a connection there are no frames to fence.
    fn frame_fence(&self) -> u64 {
        0
    }
}

/// Sink used while no transport exists
pub struct DetachedSink;

impl SubscriptionSink for DetachedSink {
    fn update_desired(&self, _desired: &[AssetSubscription]) -> bool {
        false
    }

    fn send(&self, _intent: Intent) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionDiff {
    pub added: Vec<AssetSubscription>,
    pub removed: Vec<String>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct SubscriptionManager {
    active: Vec<AssetSubscription>,
    /// Per active asset, the first frame sequence number that belongs to
    /// its current subscription
    fences: HashMap<String, u64>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> &[AssetSubscription] {
        &self.active
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Move the active set to `desired`, emitting exactly the intents and
    /// store changes the difference calls for.
    pub fn apply(
        &mut self,
        desired: Vec<AssetSubscription>,
        sink: &dyn SubscriptionSink,
        store: &BookStore,
    ) -> SubscriptionDiff {
        let desired = normalize(desired);

        let previous: HashMap<&str, &AssetSubscription> = self
            .active
            .iter()
            .map(|s| (s.asset_id.as_str(), s))
            .collect();
        let next_ids: HashSet<&str> = desired.iter().map(|s| s.asset_id.as_str()).collect();

        let added: Vec<AssetSubscription> = desired
            .iter()
            .filter(|s| !previous.contains_key(s.asset_id.as_str()))
            .cloned()
            .collect();
        let removed: Vec<String> = self
            .active
            .iter()
            .filter(|s| !next_ids.contains(s.asset_id.as_str()))
            .map(|s| s.asset_id.clone())
            .collect();
        let metadata_changed = desired
            .iter()
            .any(|s| previous.get(s.asset_id.as_str()).is_some_and(|p| *p != s));

        let diff = SubscriptionDiff { added, removed };
        if diff.is_empty() && !metadata_changed {
            return diff;
        }

        self.active = desired;
        let open = sink.update_desired(&self.active);
        if diff.is_empty() {
            // Only routing metadata moved; the next resync carries it
            return diff;
        }

        let fence = sink.frame_fence();
        for sub in &diff.added {
            self.fences.insert(sub.asset_id.clone(), fence);
        }
        for asset_id in &diff.removed {
            self.fences.remove(asset_id);
        }

        if !diff.added.is_empty() {
            store.set_status_bulk(
                diff.added.iter().map(|s| s.asset_id.as_str()),
                ConnectionStatus::Connecting,
            );
            if open {
                sink.send(Intent::Subscribe {
                    assets: diff.added.clone(),
                });
            }
        }

        if !diff.removed.is_empty() {
            if open {
                sink.send(Intent::Unsubscribe {
                    assets: diff.removed.clone(),
                });
            }
            // Regardless of transport state
            store.clear_books(&diff.removed);
        }

        debug!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            active = self.active.len(),
            open,
            "subscription diff applied"
        );
        diff
    }

    /// Keep only batch entries for active assets whose frame arrived on the
    /// connection starting at `connection_start` and after the asset was
    /// last subscribed. Returns how many were dropped.
    pub fn retain_current(&self, batch: &mut FlushBatch, connection_start: u64) -> usize {
        let before = batch.len();
        batch.retain(|asset_id, update| {
            self.fences
                .get(asset_id)
                .is_some_and(|fence| update.seq >= connection_start.max(*fence))
        });
        before - batch.len()
    }
}

/// Trim ids, drop empty ones, keep the first occurrence of each id
fn normalize(desired: Vec<AssetSubscription>) -> Vec<AssetSubscription> {
    let mut seen = HashSet::new();
    desired
        .into_iter()
        .filter_map(|mut sub| {
            let trimmed = sub.asset_id.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed.len() != sub.asset_id.len() {
                sub.asset_id = trimmed.to_string();
            }
            seen.insert(sub.asset_id.clone()).then_some(sub)
        })
        .collect()
}
