//! Process-wide request and channel counters.
//!
//! One `Counters` value is created by the server and handed by `Arc` to every
//! subsystem that records activity. Counters only go up; the sampler drains
//! the rate counters with get-and-reset. `active_channels` is the exception:
//! it is a gauge maintained by the connection guard.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic activity counters.
#[derive(Debug, Default)]
pub struct Counters {
    hits: AtomicU64,
    biz_hits: AtomicU64,
    ping_hits: AtomicU64,
    sent: AtomicU64,
    active_channels: AtomicU64,
    total_channels: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a decoded request. Returns the running hit number.
    pub fn hit(&self) -> u64 {
        self.hits.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a request that reached the business callback.
    pub fn biz_hit(&self) {
        self.biz_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request answered by the ping handler.
    pub fn ping_hit(&self) {
        self.ping_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a response handed to the codec.
    pub fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_opened(&self) {
        self.active_channels.fetch_add(1, Ordering::Relaxed);
        self.total_channels.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_closed(&self) {
        // saturating: a reset between open and close must not wrap
        let _ = self
            .active_channels
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn biz_hits(&self) -> u64 {
        self.biz_hits.load(Ordering::Relaxed)
    }

    pub fn ping_hits(&self) -> u64 {
        self.ping_hits.load(Ordering::Relaxed)
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn active_channels(&self) -> u64 {
        self.active_channels.load(Ordering::Relaxed)
    }

    pub fn total_channels(&self) -> u64 {
        self.total_channels.load(Ordering::Relaxed)
    }

    /// Drain the hit counter.
    pub fn take_hits(&self) -> u64 {
        self.hits.swap(0, Ordering::Relaxed)
    }

    /// Drain the sent counter.
    pub fn take_sent(&self) -> u64 {
        self.sent.swap(0, Ordering::Relaxed)
    }

    /// Zero every counter.
    pub fn reset(&self) {
        for c in [
            &self.hits,
            &self.biz_hits,
            &self.ping_hits,
            &self.sent,
            &self.active_channels,
            &self.total_channels,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_drains() {
        let c = Counters::new();
        c.hit();
        c.hit();
        c.sent();
        assert_eq!(c.take_hits(), 2);
        assert_eq!(c.take_hits(), 0);
        assert_eq!(c.take_sent(), 1);
    }

    #[test]
    fn channels_track_open_and_close() {
        let c = Counters::new();
        c.channel_opened();
        c.channel_opened();
        c.channel_closed();
        assert_eq!(c.active_channels(), 1);
        assert_eq!(c.total_channels(), 2);

        c.reset();
        c.channel_closed();
        assert_eq!(c.active_channels(), 0);
    }
}
