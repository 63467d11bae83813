// Connection lifecycle for the chat socket
// Owns the connect/disconnect state, the bounded reconnect policy and the
// outbound writer handle. Socket IO itself lives in the client event loop.

use log::{debug, error, info, warn};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use super::protocol::OutboundFrame;

/// Anything outbound frames can be written to.
pub trait FrameSink {
    /// Fire-and-forget. Returns false when the frame was dropped.
    fn send(&mut self, frame: &OutboundFrame) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Coarse status events for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Retry budget exhausted; nothing more will be attempted automatically.
    GaveUp,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum reconnect attempts before giving up.
    pub budget: u32,
    /// Attempt `n` waits `n * base_interval`.
    pub base_interval: Duration,
    /// Keep retrying after a session that had already connected drops.
    pub reconnect_after_established: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            budget: 3,
            base_interval: Duration::from_secs(1),
            reconnect_after_established: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryTimer {
    Idle,
    Scheduled { at: Instant, attempt: u32 },
}

pub struct ConnectionManager {
    policy: RetryPolicy,
    endpoint: Option<String>,
    state: ConnectionState,
    retry: RetryTimer,
    attempts: u32,
    has_connected_once: bool,
    shut_down: bool,
    writer: Option<mpsc::UnboundedSender<String>>,
    status_subscribers: Vec<mpsc::UnboundedSender<ConnectionStatus>>,
}

impl ConnectionManager {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            endpoint: None,
            state: ConnectionState::Disconnected,
            retry: RetryTimer::Idle,
            attempts: 0,
            has_connected_once: false,
            shut_down: false,
            writer: None,
            status_subscribers: Vec::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected && self.writer.is_some()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn has_connected_once(&self) -> bool {
        self.has_connected_once
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    pub fn is_retry_scheduled(&self) -> bool {
        matches!(self.retry, RetryTimer::Scheduled { .. })
    }

    /// Deadline of the pending reconnect, if any.
    pub fn next_retry_at(&self) -> Option<Instant> {
        match self.retry {
            RetryTimer::Scheduled { at, .. } => Some(at),
            RetryTimer::Idle => None,
        }
    }

    /// Budget spent and nothing in flight.
    pub fn is_exhausted(&self) -> bool {
        self.state == ConnectionState::Disconnected
            && self.retry == RetryTimer::Idle
            && self.attempts >= self.policy.budget
    }

    pub fn subscribe_status(&mut self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.status_subscribers.push(tx);
        rx
    }

    fn emit(&mut self, status: ConnectionStatus) {
        debug!("Connection status: {:?}", status);
        self.status_subscribers.retain(|tx| tx.send(status.clone()).is_ok());
    }

    /// Begin connecting. Returns the endpoint the caller should open, or
    /// `None` if a connection is already open or in progress.
    pub fn connect(&mut self, endpoint: &str) -> Option<String> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Connecting => {
                debug!("connect({}) ignored, already {:?}", endpoint, self.state);
                None
            }
            ConnectionState::Disconnected => {
                info!("Connecting to {}", endpoint);
                self.endpoint = Some(endpoint.to_string());
                self.shut_down = false;
                self.retry = RetryTimer::Idle;
                self.state = ConnectionState::Connecting;
                self.emit(ConnectionStatus::Connecting);
                Some(endpoint.to_string())
            }
        }
    }

    /// The socket handshake completed; `writer` feeds the socket writer task.
    pub fn on_open(&mut self, writer: mpsc::UnboundedSender<String>) {
        if self.shut_down {
            debug!("Socket opened after disconnect(), discarding");
            return;
        }
        info!("Connected to {}", self.endpoint.as_deref().unwrap_or("<unknown>"));
        self.state = ConnectionState::Connected;
        self.attempts = 0;
        self.has_connected_once = true;
        self.retry = RetryTimer::Idle;
        self.writer = Some(writer);
        self.emit(ConnectionStatus::Connected);
    }

    /// The socket closed or the handshake failed.
    pub fn on_close(&mut self, now: Instant, reason: &str) {
        if self.state == ConnectionState::Disconnected {
            debug!("Close ({}) while already disconnected", reason);
            return;
        }
        warn!("Connection closed: {}", reason);
        self.state = ConnectionState::Disconnected;
        self.writer = None;
        self.emit(ConnectionStatus::Disconnected);
        if self.shut_down {
            return;
        }
        self.schedule_retry(now);
    }

    fn retry_allowed(&self) -> bool {
        !self.shut_down
            && self.endpoint.is_some()
            && self.attempts < self.policy.budget
            && (!self.has_connected_once || self.policy.reconnect_after_established)
    }

    fn schedule_retry(&mut self, now: Instant) {
        if !self.retry_allowed() {
            if self.has_connected_once && !self.policy.reconnect_after_established {
                info!("Established session dropped; automatic reconnect disabled");
            } else if self.attempts >= self.policy.budget {
                error!("Giving up after {} reconnect attempts", self.attempts);
                self.emit(ConnectionStatus::GaveUp);
            }
            return;
        }
        self.attempts += 1;
        let delay = self.policy.base_interval * self.attempts;
        info!(
            "Reconnect attempt {}/{} in {:?}",
            self.attempts, self.policy.budget, delay
        );
        self.retry = RetryTimer::Scheduled {
            at: now + delay,
            attempt: self.attempts,
        };
    }

    /// Fire the reconnect timer if it is due. Returns the endpoint to open.
    pub fn poll_retry(&mut self, now: Instant) -> Option<String> {
        let RetryTimer::Scheduled { at, attempt } = self.retry else {
            return None;
        };
        if now < at {
            return None;
        }
        self.retry = RetryTimer::Idle;
        let endpoint = self.endpoint.clone()?;
        debug!("Reconnect timer fired (attempt {})", attempt);
        self.state = ConnectionState::Connecting;
        self.emit(ConnectionStatus::Connecting);
        Some(endpoint)
    }

    /// Watchdog tick: recover if we are down, nothing is scheduled, and the
    /// budget still allows an attempt. Consumes one attempt from the budget.
    pub fn on_watchdog(&mut self, now: Instant) -> Option<String> {
        if let Some(endpoint) = self.poll_retry(now) {
            return Some(endpoint);
        }
        if self.state != ConnectionState::Disconnected || self.is_retry_scheduled() || !self.retry_allowed() {
            return None;
        }
        self.attempts += 1;
        warn!(
            "Watchdog starting reconnect attempt {}/{}",
            self.attempts, self.policy.budget
        );
        self.state = ConnectionState::Connecting;
        self.emit(ConnectionStatus::Connecting);
        self.endpoint.clone()
    }

    /// Tear down and cancel pending timers. Safe to call repeatedly.
    pub fn disconnect(&mut self) {
        self.shut_down = true;
        self.retry = RetryTimer::Idle;
        // Dropping the sender ends the writer task, which closes the socket.
        self.writer = None;
        if self.state != ConnectionState::Disconnected {
            info!("Disconnecting");
            self.state = ConnectionState::Disconnected;
            self.emit(ConnectionStatus::Disconnected);
        }
    }
}

impl FrameSink for ConnectionManager {
    fn send(&mut self, frame: &OutboundFrame) -> bool {
        if !self.is_open() {
            warn!("Dropping {} frame: transport not open", frame.action());
            return false;
        }
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {} frame: {}", frame.action(), e);
                return false;
            }
        };
        let Some(writer) = &self.writer else {
            return false;
        };
        match writer.send(text) {
            Ok(()) => {
                debug!("Sent {} frame", frame.action());
                true
            }
            Err(_) => {
                warn!("Dropping {} frame: writer task has stopped", frame.action());
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(budget: u32) -> ConnectionManager {
        ConnectionManager::new(RetryPolicy {
            budget,
            base_interval: Duration::from_secs(1),
            reconnect_after_established: false,
        })
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut conn = manager(3);
        assert_eq!(conn.connect("ws://x").as_deref(), Some("ws://x"));
        assert!(conn.connect("ws://x").is_none());
        let (tx, _rx) = mpsc::unbounded_channel();
        conn.on_open(tx);
        assert!(conn.connect("ws://x").is_none());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_backoff_scales_linearly() {
        let mut conn = manager(3);
        let t0 = Instant::now();
        conn.connect("ws://x");
        conn.on_close(t0, "refused");
        assert_eq!(conn.next_retry_at(), Some(t0 + Duration::from_secs(1)));

        assert!(conn.poll_retry(t0).is_none());
        let t1 = t0 + Duration::from_secs(1);
        assert!(conn.poll_retry(t1).is_some());
        conn.on_close(t1, "refused");
        assert_eq!(conn.next_retry_at(), Some(t1 + Duration::from_secs(2)));
    }

    #[test]
    fn test_send_drops_when_closed() {
        let mut conn = manager(3);
        assert!(!conn.send(&OutboundFrame::Ping));

        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.connect("ws://x");
        conn.on_open(tx);
        assert!(conn.send(&OutboundFrame::Ping));
        assert_eq!(rx.try_recv().unwrap(), r#"{"action":"ping"}"#);
    }

    #[test]
    fn test_disconnect_twice_is_safe() {
        let mut conn = manager(3);
        let mut status = conn.subscribe_status();
        conn.connect("ws://x");
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(status.try_recv().unwrap(), ConnectionStatus::Connecting);
        assert_eq!(status.try_recv().unwrap(), ConnectionStatus::Disconnected);
        assert!(status.try_recv().is_err());
    }
}
