use std::sync::atomic::{AtomicU64, Ordering};

/// Aggregate traffic counters of one port.
///
/// Writers are disjoint per direction: the Rx monitor increments `rx_*`, the
/// Tx monitor or the transmitter increments `tx_*`. Readers see eventually
/// consistent values.
#[derive(Debug, Default)]
pub struct PortStats {
    rx_pkts: AtomicU64,
    rx_bytes: AtomicU64,
    tx_pkts: AtomicU64,
    tx_bytes: AtomicU64,
}

impl PortStats {
    pub fn record_rx(&self, pkts: u64, bytes: u64) {
        self.rx_pkts.fetch_add(pkts, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_tx(&self, pkts: u64, bytes: u64) {
        self.tx_pkts.fetch_add(pkts, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rx_pkts: self.rx_pkts.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_pkts: self.tx_pkts.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub rx_pkts: u64,
    pub rx_bytes: u64,
    pub tx_pkts: u64,
    pub tx_bytes: u64,
}
