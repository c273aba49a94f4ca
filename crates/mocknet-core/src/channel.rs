//! Shared log channel between node supervisors and the monitor.
//!
//! Many producers (one per node) push labelled output lines; a single
//! consumer pops them with a timeout. The channel is bounded, and a full or
//! released channel drops lines instead of stalling a node's output pipe.
//!
//! # Invariants
//!
//! - Lines pushed by one producer are popped in the order they were pushed.
//! - [`LogChannel::push`] never waits.
//! - [`LogChannel::pop`] returns `None` after at most `timeout` instead of
//!   failing, which lets the consumer re-check its stop condition on every
//!   tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

/// Default channel capacity.
pub const DEFAULT_LOG_CAPACITY: usize = 65_536;

/// One line of node output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Label of the node that produced the line, e.g. `Node 3`.
    pub node_id: String,
    /// Text handed to the monitor, prefixed with the node label.
    pub raw_text: String,
    /// When the line was read from the node.
    pub received_at: SystemTime,
}

impl LogLine {
    /// Create a line stamped with the current time.
    #[must_use]
    pub fn new(node_id: impl Into<String>, raw_text: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            raw_text: raw_text.into(),
            received_at: SystemTime::now(),
        }
    }
}

/// Bounded multi-producer, single-consumer queue of [`LogLine`]s.
#[derive(Debug)]
pub struct LogChannel {
    tx: mpsc::Sender<LogLine>,
    rx: Mutex<Option<mpsc::Receiver<LogLine>>>,
    dropped: AtomicU64,
}

impl Default for LogChannel {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogChannel {
    /// Create a channel holding at most `capacity` unread lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a line without waiting.
    ///
    /// Returns `false` if the line was dropped because the channel is full
    /// or the consumer side has been released.
    pub fn push(&self, line: LogLine) -> bool {
        match self.tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(line)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if should_warn(dropped) {
                    warn!(
                        node = %line.node_id,
                        dropped,
                        "log channel full, dropping line"
                    );
                } else {
                    debug!(node = %line.node_id, dropped, "log channel full, dropping line");
                }
                false
            },
            Err(mpsc::error::TrySendError::Closed(line)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(node = %line.node_id, "log channel released, dropping line");
                false
            },
        }
    }

    /// Wait up to `timeout` for the next line.
    ///
    /// Returns `None` when nothing arrived in time or the consumer side was
    /// released.
    pub async fn pop(&self, timeout: Duration) -> Option<LogLine> {
        let mut rx = self.rx.lock().await;
        let rx = rx.as_mut()?;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Drop the consumer side.
    ///
    /// Unread lines are discarded and later pushes are dropped, so nothing
    /// keeps the process alive waiting for a reader.
    pub async fn release_consumer(&self) {
        if let Some(mut rx) = self.rx.lock().await.take() {
            rx.close();
            let mut discarded = 0_u64;
            while rx.try_recv().is_ok() {
                discarded += 1;
            }
            if discarded > 0 {
                debug!(discarded, "discarded unread log lines");
            }
        }
    }

    /// Number of lines dropped on overflow or after release.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Overflow drops logged at warn level: the 1st, 2nd, 4th, 8th, ...
const fn should_warn(dropped: u64) -> bool {
    dropped.is_power_of_two()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    const TICK: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let channel = LogChannel::new(4);
        let started = std::time::Instant::now();
        assert!(channel.pop(TICK).await.is_none());
        assert!(started.elapsed() >= TICK);
    }

    #[tokio::test]
    async fn preserves_per_producer_order() {
        let channel = LogChannel::new(16);
        for i in 0..5 {
            assert!(channel.push(LogLine::new("Node 0", format!("Node 0 | line {i}"))));
        }
        for i in 0..5 {
            let line = channel.pop(TICK).await.unwrap();
            assert_eq!(line.raw_text, format!("Node 0 | line {i}"));
        }
    }

    #[test]
    fn drop_warnings_back_off() {
        let warned: Vec<u64> = (1..=20).filter(|n| should_warn(*n)).collect();
        assert_eq!(warned, vec![1, 2, 4, 8, 16]);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let channel = LogChannel::new(2);
        assert!(channel.push(LogLine::new("Node 0", "a")));
        assert!(channel.push(LogLine::new("Node 0", "b")));
        assert!(!channel.push(LogLine::new("Node 0", "c")));
        assert_eq!(channel.dropped(), 1);

        assert_eq!(channel.pop(TICK).await.unwrap().raw_text, "a");
        assert_eq!(channel.pop(TICK).await.unwrap().raw_text, "b");
        assert!(channel.pop(TICK).await.is_none());
    }

    #[tokio::test]
    async fn release_discards_and_rejects() {
        let channel = LogChannel::new(8);
        channel.push(LogLine::new("Node 1", "pending"));
        channel.release_consumer().await;

        assert!(channel.pop(TICK).await.is_none());
        assert!(!channel.push(LogLine::new("Node 1", "late")));
        assert_eq!(channel.dropped(), 1);

        // Releasing twice is harmless.
        channel.release_consumer().await;
    }

    #[tokio::test]
    async fn many_producers_one_consumer() {
        let channel = Arc::new(LogChannel::new(1024));
        let mut producers = Vec::new();
        for node in 0..4 {
            let channel = Arc::clone(&channel);
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    channel.push(LogLine::new(format!("Node{node:2}"), format!("{node}:{i}")));
                }
            }));
        }
        for producer in producers {
            producer.await.unwrap();
        }

        let mut last_seen = [None::<u32>; 4];
        let mut total = 0;
        while let Some(line) = channel.pop(TICK).await {
            let (node, seq) = line.raw_text.split_once(':').unwrap();
            let node: usize = node.parse().unwrap();
            let seq: u32 = seq.parse().unwrap();
            if let Some(prev) = last_seen[node] {
                assert!(seq > prev, "lines from one node arrived out of order");
            }
            last_seen[node] = Some(seq);
            total += 1;
        }
        assert_eq!(total, 200);
    }
}
