//! Runtime configuration for the book mirror.
//!
//! Defaults match the browser client's constants; every field can be
//! overridden through a `BOOK_MIRROR_*` environment variable.

use std::path::Path;
use std::time::Duration;

/// Configuration for the mirror pipeline
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Multiplexed books stream on the terminal server
    pub ws_url: String,
    /// Coalescing window of the ingestion worker (ms)
    pub flush_window_ms: u64,
    /// Reconnect base delay (ms), doubled per failed attempt
    pub reconnect_base_delay_ms: u64,
    /// Reconnect delay cap (ms), jitter is added on top
    pub reconnect_max_delay_ms: u64,
    /// Upper bound of the random jitter added to each reconnect delay (ms)
    pub reconnect_jitter_ms: u64,
    /// A connect attempt taking longer than this counts as a transport error
    pub connect_timeout_ms: u64,
    /// Bound on the close handshake when stopping
    pub close_timeout_ms: u64,
    /// Maximum book depth to keep per side (0 = unlimited)
    pub max_book_depth: usize,
    /// How many times a dead ingestion worker is replaced before giving up
    pub max_worker_restarts: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://127.0.0.1:8000/ws/books/stream".to_string(),
            flush_window_ms: 200,
            reconnect_base_delay_ms: 500,
            reconnect_max_delay_ms: 5_000,
            reconnect_jitter_ms: 250,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 1_000,
            max_book_depth: 20,
            max_worker_restarts: 5,
        }
    }
}

impl MirrorConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("BOOK_MIRROR_WS_URL") {
            if !v.trim().is_empty() {
                cfg.ws_url = v.trim().to_string();
            }
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_FLUSH_WINDOW_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    cfg.flush_window_ms = ms;
                }
            }
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_RECONNECT_BASE_MS") {
            cfg.reconnect_base_delay_ms = v.parse().unwrap_or(cfg.reconnect_base_delay_ms);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_RECONNECT_MAX_MS") {
            cfg.reconnect_max_delay_ms = v.parse().unwrap_or(cfg.reconnect_max_delay_ms);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_RECONNECT_JITTER_MS") {
            cfg.reconnect_jitter_ms = v.parse().unwrap_or(cfg.reconnect_jitter_ms);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_CONNECT_TIMEOUT_MS") {
            cfg.connect_timeout_ms = v.parse().unwrap_or(cfg.connect_timeout_ms);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_CLOSE_TIMEOUT_MS") {
            cfg.close_timeout_ms = v.parse().unwrap_or(cfg.close_timeout_ms);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_MAX_DEPTH") {
            cfg.max_book_depth = v.parse().unwrap_or(cfg.max_book_depth);
        }
        if let Ok(v) = std::env::var("BOOK_MIRROR_MAX_WORKER_RESTARTS") {
            cfg.max_worker_restarts = v.parse().unwrap_or(cfg.max_worker_restarts);
        }

        cfg
    }

    #[inline]
    pub fn flush_window(&self) -> Duration {
        Duration::from_millis(self.flush_window_ms)
    }

    #[inline]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[inline]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

/// Load `.env` from the working directory (and parents), then from the crate root.
pub fn load_env() {
    let _ = dotenv::dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
