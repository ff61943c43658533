//! Book payload validation.
//!
//! Turns one decoded update payload into a well-formed [`BookState`], or
//! `None`. Nothing here panics or returns an error: malformed levels are
//! dropped, a malformed `last_trade` is dropped, and anything that cannot
//! be a book at all yields `None`.

use serde_json::{Map, Value};

use crate::models::{BookState, LastTrade, OrderLevel, TradeSide};

/// Tick size assumed when the payload does not carry a usable one
pub const DEFAULT_TICK_SIZE: f64 = 0.01;

/// A validated update routed to one asset
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedUpdate {
    pub asset_id: String,
    pub book: BookState,
}

/// `{"status": "loading", ...}` is sent while the server warms a book up.
/// It is a non-update, not an error.
pub fn is_loading_placeholder(value: &Value) -> bool {
    value
        .get("status")
        .and_then(Value::as_str)
        .map(|s| s == "loading")
        .unwrap_or(false)
}

/// Validate a single payload into a book state.
pub fn validate_book(value: &Value) -> Option<BookState> {
    let obj = value.as_object()?;
    if is_loading_placeholder(value) {
        return None;
    }

    let ready = obj.get("ready")?.as_bool()?;
    let msg_count = number_to_count(obj.get("msg_count")?)?;
    let mut bids = parse_levels(obj.get("bids")?.as_array()?);
    let mut asks = parse_levels(obj.get("asks")?.as_array()?);

    sort_side(&mut bids, true);
    sort_side(&mut asks, false);
    normalize_cumulative(&mut bids);
    normalize_cumulative(&mut asks);

    let tick_size = obj
        .get("tick_size")
        .and_then(Value::as_f64)
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or(DEFAULT_TICK_SIZE);

    let last_trade = obj.get("last_trade").and_then(parse_last_trade);

    Some(BookState {
        ready,
        msg_count,
        bids,
        asks,
        tick_size,
        last_trade,
    })
}

/// Validate a payload that must also carry its routing `asset_id`.
///
/// `max_depth` caps each side after sorting (0 = unlimited).
pub fn validate_update(value: &Value, max_depth: usize) -> Option<ValidatedUpdate> {
    let asset_id = value
        .get("asset_id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())?
        .to_string();

    let mut book = validate_book(value)?;
    if max_depth > 0 {
        book.bids.truncate(max_depth);
        book.asks.truncate(max_depth);
    }

    Some(ValidatedUpdate { asset_id, book })
}

fn number_to_count(value: &Value) -> Option<u64> {
    if let Some(n) = value.as_u64() {
        return Some(n);
    }
    let f = value.as_f64()?;
    Some(if f.is_finite() && f > 0.0 { f as u64 } else { 0 })
}

fn parse_levels(raw: &[Value]) -> Vec<OrderLevel> {
    raw.iter().filter_map(parse_level).collect()
}

fn parse_level(raw: &Value) -> Option<OrderLevel> {
    let obj = raw.as_object()?;
    let price = obj.get("price")?.as_f64()?;
    let size = obj.get("size")?.as_f64()?;
    let cumulative = cumulative_field(obj)?.as_f64()?;
    Some(OrderLevel {
        price,
        size,
        cumulative,
    })
}

// Wire name is `cum`; `cumulative` is accepted for already-normalised payloads.
fn cumulative_field(obj: &Map<String, Value>) -> Option<&Value> {
    obj.get("cum").or_else(|| obj.get("cumulative"))
}

fn parse_last_trade(raw: &Value) -> Option<LastTrade> {
    let obj = raw.as_object()?;
    let price = obj.get("price")?.as_f64()?;
    let size = obj.get("size")?.as_f64()?;
    let side = TradeSide::parse(obj.get("side")?.as_str()?)?;
    let ts = obj.get("timestamp")?;
    let timestamp = match ts.as_i64() {
        Some(t) => t,
        None => {
            let f = ts.as_f64().filter(|f| f.is_finite())?;
            f.trunc() as i64
        }
    };
    Some(LastTrade {
        price,
        size,
        side,
        timestamp,
    })
}

/// Bids descending, asks ascending
fn sort_side(levels: &mut [OrderLevel], is_bid: bool) {
    levels.sort_by(|a, b| {
        let ord = a
            .price
            .partial_cmp(&b.price)
            .unwrap_or(std::cmp::Ordering::Equal);
        if is_bid {
            ord.reverse()
        } else {
            ord
        }
    });
}

/// Keep `cumulative` non-decreasing along the side; recompute from sizes if the wire
/// values violate that.
fn normalize_cumulative(levels: &mut [OrderLevel]) {
    let monotonic = levels
        .windows(2)
        .all(|w| w[1].cumulative >= w[0].cumulative);
    if monotonic {
        return;
    }

    let mut running = 0.0;
    for level in levels.iter_mut() {
        running += level.size;
        level.cumulative = running;
    }
}
