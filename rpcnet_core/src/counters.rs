//! Lightweight atomic counters for conditions the error taxonomy calls out
//! as "count, don't just log" (§7: replay detections, decrypt failures).
//! Kept separate from `tracing` metrics since these are read back
//! programmatically by tests and the conformance runner, not just emitted.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Counters {
    pub replay_detected: AtomicU64,
    pub decrypt_failed: AtomicU64,
    pub handshake_timeouts: AtomicU64,
    pub requests_timed_out: AtomicU64,
    pub unauthorized: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            replay_detected: self.replay_detected.load(Ordering::Relaxed),
            decrypt_failed: self.decrypt_failed.load(Ordering::Relaxed),
            handshake_timeouts: self.handshake_timeouts.load(Ordering::Relaxed),
            requests_timed_out: self.requests_timed_out.load(Ordering::Relaxed),
            unauthorized: self.unauthorized.load(Ordering::Relaxed),
        }
    }

    pub fn record(&self, error: &crate::error::RpcError) {
        use crate::error::RpcError;
        match error {
            RpcError::ReplayDetected => {
                self.replay_detected.fetch_add(1, Ordering::Relaxed);
            }
            RpcError::DecryptFailed => {
                self.decrypt_failed.fetch_add(1, Ordering::Relaxed);
            }
            RpcError::HandshakeTimeout => {
                self.handshake_timeouts.fetch_add(1, Ordering::Relaxed);
            }
            RpcError::RequestTimeout => {
                self.requests_timed_out.fetch_add(1, Ordering::Relaxed);
            }
            RpcError::Unauthorized(_) => {
                self.unauthorized.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub replay_detected: u64,
    pub decrypt_failed: u64,
    pub handshake_timeouts: u64,
    pub requests_timed_out: u64,
    pub unauthorized: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    #[test]
    fn record_increments_matching_counter_only() {
        let counters = Counters::default();
        counters.record(&RpcError::ReplayDetected);
        counters.record(&RpcError::ReplayDetected);
        counters.record(&RpcError::DecryptFailed);
        let snap = counters.snapshot();
        assert_eq!(snap.replay_detected, 2);
        assert_eq!(snap.decrypt_failed, 1);
        assert_eq!(snap.handshake_timeouts, 0);
    }
}
