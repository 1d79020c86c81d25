use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pcap::{Active, Capture};

use crate::link::{open_live, OpenCaps, SharedCapture};
use crate::stats::PortStats;
use crate::worker::StopFlag;

const MONITOR_SNAPLEN: i32 = 64;
const MONITOR_TIMEOUT_MS: i32 = 1000;
const SHARED_POLL: Duration = Duration::from_millis(1);

/// Traffic direction a monitor is restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Rx,
    Tx,
}

enum MonitorHandle {
    /// Owned outright; reads block up to the handle timeout.
    Exclusive(Capture<Active>),
    /// Lent to the transmitter as well; non-blocking reads under a short
    /// lock so a paced send never waits behind a blocked read.
    Shared(SharedCapture),
}

/// Counts packets observed in one direction of a device.
///
/// The Rx monitor's handle doubles as the transmit handle (see
/// [`PortMonitor::lend_handle`]); its loop therefore polls non-blocking
/// reads instead of parking inside the packet layer.
pub struct PortMonitor {
    device: String,
    direction: PortDirection,
    stats: Arc<PortStats>,
    stop: StopFlag,
    handle: Option<MonitorHandle>,
    lendable: Option<SharedCapture>,
    is_promiscuous: bool,
    is_directional: bool,
    thread: Option<JoinHandle<()>>,
}

impl PortMonitor {
    /// Open the monitor's handle, walking the capability fallback chain and
    /// attempting direction restriction. A monitor that cannot open at all
    /// reports `handle_ok() == false`; the port is then unusable.
    pub fn new(device: &str, direction: PortDirection, stats: Arc<PortStats>) -> PortMonitor {
        let mut is_promiscuous = true;
        let mut is_directional = true;
        let mut handle = None;
        let mut lendable = None;

        match open_live(device, MONITOR_SNAPLEN, MONITOR_TIMEOUT_MS, OpenCaps::full()) {
            Ok((cap, caps)) => {
                is_promiscuous = caps.promiscuous;
                let wanted = match direction {
                    PortDirection::Rx => pcap::Direction::In,
                    PortDirection::Tx => pcap::Direction::Out,
                };
                if let Err(e) = cap.direction(wanted) {
                    log::debug!("cannot restrict {device} to {direction:?}: {e}");
                    is_directional = false;
                }
                match direction {
                    PortDirection::Rx => match cap.setnonblock() {
                        Ok(cap) => {
                            let shared = Arc::new(Mutex::new(cap));
                            lendable = Some(Arc::clone(&shared));
                            handle = Some(MonitorHandle::Shared(shared));
                        }
                        Err(e) => {
                            log::warn!("cannot set {device} non-blocking: {e}");
                        }
                    },
                    PortDirection::Tx => {
                        handle = Some(MonitorHandle::Exclusive(cap));
                    }
                }
            }
            Err(e) => {
                log::error!("error opening port {device}: {e}");
            }
        }

        PortMonitor {
            device: device.to_owned(),
            direction,
            stats,
            stop: StopFlag::default(),
            handle,
            lendable,
            is_promiscuous,
            is_directional,
            thread: None,
        }
    }

    pub fn handle_ok(&self) -> bool {
        self.handle.is_some() || self.thread.is_some()
    }

    pub fn is_promiscuous(&self) -> bool {
        self.is_promiscuous
    }

    pub fn is_directional(&self) -> bool {
        self.is_directional
    }

    pub fn direction(&self) -> PortDirection {
        self.direction
    }

    /// Lend the monitor's handle for transmission. Only the Rx monitor
    /// offers one; the lender keeps reading on it.
    pub fn lend_handle(&self) -> Option<SharedCapture> {
        self.lendable.as_ref().map(Arc::clone)
    }

    pub fn start(&mut self) {
        let Some(handle) = self.handle.take() else {
            log::warn!("monitor {:?} on {} has no handle, not starting", self.direction, self.device);
            return;
        };
        let direction = self.direction;
        let is_directional = self.is_directional;
        let stats = Arc::clone(&self.stats);
        let stop = self.stop.clone();
        let builder =
            thread::Builder::new().name(format!("monitor-{:?}-{}", direction, self.device));
        self.thread = Some(
            builder
                .spawn(move || match handle {
                    MonitorHandle::Exclusive(cap) => {
                        run_exclusive(cap, direction, is_directional, &stats, &stop)
                    }
                    MonitorHandle::Shared(cap) => {
                        run_shared(&cap, direction, is_directional, &stats, &stop)
                    }
                })
                .unwrap(),
        );
    }

    /// Request the loop to exit; observed within one read timeout (or poll
    /// interval on a shared handle). Safe to call from any thread and
    /// idempotent.
    pub fn stop(&self) {
        self.stop.request();
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
    }
}

impl Drop for PortMonitor {
    fn drop(&mut self) {
        self.stop();
        self.join();
    }
}

/// Update the counters for one observed packet.
///
/// A non-directional Tx handle sees both directions, so its counts would be
/// wrong; the transmitter takes over `tx_*` accounting in that case.
fn count_packet(
    direction: PortDirection,
    is_directional: bool,
    wire_len: u32,
    stats: &PortStats,
) {
    match direction {
        PortDirection::Rx => stats.record_rx(1, wire_len as u64),
        PortDirection::Tx => {
            if is_directional {
                stats.record_tx(1, wire_len as u64);
            }
        }
    }
}

fn run_exclusive(
    mut cap: Capture<Active>,
    direction: PortDirection,
    is_directional: bool,
    stats: &PortStats,
    stop: &StopFlag,
) {
    while !stop.is_requested() {
        match cap.next_packet() {
            Ok(pkt) => count_packet(direction, is_directional, pkt.header.len, stats),
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(e) => {
                log::warn!("{direction:?} monitor: error reading packet: {e}");
                // Keep observing, but do not spin if the handle went bad.
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

fn run_shared(
    cap: &SharedCapture,
    direction: PortDirection,
    is_directional: bool,
    stats: &PortStats,
    stop: &StopFlag,
) {
    while !stop.is_requested() {
        let outcome = {
            let mut guard = cap.lock().unwrap();
            match guard.next_packet() {
                Ok(pkt) => Ok(pkt.header.len),
                Err(e) => Err(e),
            }
        };
        match outcome {
            Ok(len) => count_packet(direction, is_directional, len, stats),
            Err(pcap::Error::TimeoutExpired) => thread::sleep(SHARED_POLL),
            Err(e) => {
                log::warn!("{direction:?} monitor: error reading packet: {e}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_counts_regardless_of_directionality() {
        let stats = PortStats::default();
        count_packet(PortDirection::Rx, true, 64, &stats);
        count_packet(PortDirection::Rx, false, 100, &stats);
        let snap = stats.snapshot();
        assert_eq!(snap.rx_pkts, 2);
        assert_eq!(snap.rx_bytes, 164);
        assert_eq!(snap.tx_pkts, 0);
    }

    #[test]
    fn tx_counts_only_when_directional() {
        let stats = PortStats::default();
        count_packet(PortDirection::Tx, true, 64, &stats);
        assert_eq!(stats.snapshot().tx_pkts, 1);

        let degraded = PortStats::default();
        count_packet(PortDirection::Tx, false, 64, &degraded);
        assert_eq!(degraded.snapshot().tx_pkts, 0);
        assert_eq!(degraded.snapshot().tx_bytes, 0);
    }
}
