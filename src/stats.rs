use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

use crate::rules::RouteVerdict;

#[derive(Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub direct: AtomicU64,
    pub proxied: AtomicU64,
    pub failed: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_route(&self, verdict: RouteVerdict) {
        match verdict {
            RouteVerdict::Direct => self.direct.fetch_add(1, Ordering::Relaxed),
            RouteVerdict::Proxied => self.proxied.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_transfer(&self, sent: u64, received: u64) {
        self.bytes_out.fetch_add(sent, Ordering::Relaxed);
        self.bytes_in.fetch_add(received, Ordering::Relaxed);
    }

    pub fn print(&self) {
        info!(
            "📊 total={} active={} direct={} proxied={} failed={} in={}MB out={}MB",
            self.total.load(Ordering::Relaxed),
            self.active.load(Ordering::Relaxed),
            self.direct.load(Ordering::Relaxed),
            self.proxied.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.bytes_in.load(Ordering::Relaxed) / 1_000_000,
            self.bytes_out.load(Ordering::Relaxed) / 1_000_000,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_initialization() {
        let stats = Stats::new();
        assert_eq!(stats.total.load(Ordering::Relaxed), 0);
        assert_eq!(stats.active.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_route_and_transfer() {
        let stats = Stats::new();
        stats.record_route(RouteVerdict::Direct);
        stats.record_route(RouteVerdict::Proxied);
        stats.record_route(RouteVerdict::Proxied);
        stats.record_transfer(10, 20);

        assert_eq!(stats.direct.load(Ordering::Relaxed), 1);
        assert_eq!(stats.proxied.load(Ordering::Relaxed), 2);
        assert_eq!(stats.bytes_out.load(Ordering::Relaxed), 10);
        assert_eq!(stats.bytes_in.load(Ordering::Relaxed), 20);
    }
}
