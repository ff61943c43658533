//! Transport session state, disconnect classification and reconnect backoff.

use std::time::Duration;

use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::models::ConnectionStatus;

/// Close code sent by a peer that is shutting down on purpose
pub const NORMAL_CLOSE_CODE: u16 = 1000;
/// Close frame carried no status code
pub const NO_STATUS_CODE: u16 = 1005;
/// Connection dropped without any close frame
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// Lifecycle of the multiplexed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Not started, or stopped
    Idle,
    /// Connect in flight, or waiting out a backoff delay
    Connecting,
    Open,
    /// Closed by the peer; a reconnect follows unless the close was normal
    Closed,
    /// Last cycle failed with a transport error
    Error,
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Why a connection cycle ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// Peer closed with 1000
    Normal,
    /// Peer closed with any other code, or the stream ended without a handshake
    Abnormal { code: u16 },
    /// Connect failure, timeout, or a protocol/IO error on an open socket
    Failed { reason: String },
}

impl Disconnect {
    pub fn from_close_frame(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) if u16::from(frame.code) == NORMAL_CLOSE_CODE => Disconnect::Normal,
            Some(frame) => Disconnect::Abnormal {
                code: u16::from(frame.code),
            },
            None => Disconnect::Abnormal {
                code: NO_STATUS_CODE,
            },
        }
    }

    pub fn should_reconnect(&self) -> bool {
        !matches!(self, Disconnect::Normal)
    }

    /// Per-asset status every desired asset takes when this happens
    pub fn asset_status(&self) -> ConnectionStatus {
        match self {
            Disconnect::Normal | Disconnect::Abnormal { .. } => ConnectionStatus::Connecting,
            Disconnect::Failed { .. } => ConnectionStatus::Error,
        }
    }

    pub fn transport_state(&self) -> TransportState {
        match self {
            Disconnect::Normal | Disconnect::Abnormal { .. } => TransportState::Closed,
            Disconnect::Failed { .. } => TransportState::Error,
        }
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Disconnect::Normal => write!(f, "normal close"),
            Disconnect::Abnormal { code } => write!(f, "abnormal close ({code})"),
            Disconnect::Failed { reason } => write!(f, "transport error: {reason}"),
        }
    }
}

/// Exponential reconnect backoff: `min(max, base * 2^attempt)` plus jitter
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_ms: u64,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base_ms: u64, max_ms: u64, jitter_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_ms,
            attempt: 0,
        }
    }

    /// Delay for attempt `n` before jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.base_ms.saturating_mul(factor).min(self.max_ms);
        Duration::from_millis(ms)
    }

    /// Delay to wait before the next attempt; advances the attempt counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        let jitter = if self.jitter_ms > 0 {
            rand::random::<u64>() % (self.jitter_ms + 1)
        } else {
            0
        };
        self.attempt = self.attempt.saturating_add(1);
        base + Duration::from_millis(jitter)
    }

    /// Called on every successful open
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_base_delay_schedule() {
        let backoff = ReconnectBackoff::new(500, 5_000, 250);
        let expected = [500, 1_000, 2_000, 4_000, 5_000, 5_000, 5_000];
        for (n, ms) in expected.iter().enumerate() {
            assert_eq!(backoff.base_delay(n as u32), Duration::from_millis(*ms));
        }
        // Huge attempt counts saturate at the cap
        assert_eq!(backoff.base_delay(200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_delay_non_decreasing_with_jitter_bounds() {
        let mut backoff = ReconnectBackoff::new(500, 5_000, 250);
        let mut prev_base = Duration::ZERO;
        for _ in 0..10 {
            let n = backoff.attempt();
            let base = backoff.base_delay(n);
            let delay = backoff.next_delay();
            assert!(base >= prev_base);
            assert!(delay >= base);
            assert!(delay <= base + Duration::from_millis(250));
            prev_base = base;
        }
    }

    #[test]
    fn test_reset_returns_to_first_delay() {
        let mut backoff = ReconnectBackoff::new(500, 5_000, 0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_disconnect_classification() {
        let normal = CloseFrame {
            code: CloseCode::Normal,
            reason: Cow::Borrowed("bye"),
        };
        let away = CloseFrame {
            code: CloseCode::Away,
            reason: Cow::Borrowed(""),
        };

        let d = Disconnect::from_close_frame(Some(&normal));
        assert_eq!(d, Disconnect::Normal);
        assert!(!d.should_reconnect());
        assert_eq!(d.asset_status(), ConnectionStatus::Connecting);

        let d = Disconnect::from_close_frame(Some(&away));
        assert_eq!(d, Disconnect::Abnormal { code: 1001 });
        assert!(d.should_reconnect());
        assert_eq!(d.transport_state(), TransportState::Closed);

        let d = Disconnect::from_close_frame(None);
        assert_eq!(d, Disconnect::Abnormal { code: NO_STATUS_CODE });

        let d = Disconnect::Failed {
            reason: "connection refused".into(),
        };
        assert!(d.should_reconnect());
        assert_eq!(d.asset_status(), ConnectionStatus::Error);
        assert_eq!(d.transport_state(), TransportState::Error);
    }
}
