//! Per-shard client quota manager.
//!
//! Tracks per-client byte rates over a one-second window and computes the
//! throttle delay a handler should apply before replying. Accounting is
//! shard-local; a client connected to two shards gets two windows, which is
//! the accepted per-core quota model.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::error::NodeError;
use crate::types::ShardId;

const WINDOW: Duration = Duration::from_secs(1);

struct ClientWindow {
    window_start: Instant,
    bytes: u64,
}

/// Byte-rate quota accounting for one shard.
pub struct QuotaManager {
    shard: ShardId,
    target_bytes_per_sec: u64,
    windows: DashMap<String, ClientWindow>,
    started: AtomicBool,
}

impl QuotaManager {
    pub fn new(shard: ShardId, target_bytes_per_sec: u64) -> Self {
        Self {
            shard,
            target_bytes_per_sec,
            windows: DashMap::new(),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        debug!(shard = self.shard, clients = self.windows.len(), "Quota manager stopped");
        self.windows.clear();
        Ok(())
    }

    /// Record `bytes` against `client_id` and return the delay to apply.
    ///
    /// Zero when the client is within its rate; otherwise proportional to the
    /// overage within the current window.
    pub fn record_and_throttle(&self, client_id: &str, bytes: u64) -> Duration {
        if self.target_bytes_per_sec == 0 {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let mut window = self
            .windows
            .entry(client_id.to_string())
            .or_insert(ClientWindow {
                window_start: now,
                bytes: 0,
            });

        if now.duration_since(window.window_start) >= WINDOW {
            window.window_start = now;
            window.bytes = 0;
        }
        window.bytes += bytes;

        if window.bytes <= self.target_bytes_per_sec {
            return Duration::ZERO;
        }
        let overage = window.bytes - self.target_bytes_per_sec;
        Duration::from_millis(overage * 1000 / self.target_bytes_per_sec)
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}
