use std::path::Path;
use std::sync::Arc;

use crate::capturer::PortCapturer;
use crate::emulation::{DeviceManager, EmulationTransceiver};
use crate::link::{lookup_device, LinkError, PcapTxLink};
use crate::monitor::{PortDirection, PortMonitor};
use crate::pacing::RateAccuracy;
use crate::stats::{PortStats, StatsSnapshot};
use crate::transmitter::{PortTransmitter, TransmitError};

/// One port of the engine: an interface name, a shared counter block and
/// four workers over it.
///
/// Construction opens the handles; [`Port::init`] wires stats and handle
/// indirection and starts the monitors. Teardown stops every worker and
/// joins it before the handles go away.
pub struct Port {
    name: String,
    description: String,
    stats: Arc<PortStats>,
    monitor_rx: PortMonitor,
    monitor_tx: PortMonitor,
    transmitter: PortTransmitter,
    capturer: PortCapturer,
    emul_xcvr: EmulationTransceiver,
    notes: String,
    is_usable: bool,
    has_exclusive_control: bool,
}

impl Port {
    pub fn new(device: &str, manager: Arc<dyn DeviceManager>) -> Port {
        let stats = Arc::new(PortStats::default());
        let monitor_rx = PortMonitor::new(device, PortDirection::Rx, Arc::clone(&stats));
        let monitor_tx = PortMonitor::new(device, PortDirection::Tx, Arc::clone(&stats));
        let transmitter = PortTransmitter::new(device);
        let capturer = PortCapturer::new(device);
        let emul_xcvr = EmulationTransceiver::new(device, manager);

        let is_usable = monitor_rx.handle_ok() && monitor_tx.handle_ok();
        let (name, description) = match lookup_device(device) {
            Some(dev) => (dev.name, dev.desc.unwrap_or_default()),
            None => (device.to_owned(), String::new()),
        };

        Port {
            name,
            description,
            stats,
            monitor_rx,
            monitor_tx,
            transmitter,
            capturer,
            emul_xcvr,
            notes: String::new(),
            is_usable,
            has_exclusive_control: false,
        }
    }

    /// Wire the workers together and start the monitors.
    ///
    /// When the Tx monitor cannot restrict its direction it refuses to
    /// count, so the transmitter takes over `tx_*` accounting on the shared
    /// block. The transmitter also sends on the Rx monitor's handle so its
    /// own frames stay observable on the receive side.
    pub fn init(&mut self) {
        if !self.monitor_tx.is_directional() {
            self.transmitter.use_external_stats(Arc::clone(&self.stats));
        }
        if let Some(handle) = self.monitor_rx.lend_handle() {
            self.transmitter.set_link(Box::new(PcapTxLink::Shared(handle)));
        }
        self.update_notes();
        self.monitor_rx.start();
        self.monitor_tx.start();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Human-readable limitations of this port's counting, for display.
    pub fn notes(&self) -> &str {
        &self.notes
    }

    pub fn is_usable(&self) -> bool {
        self.is_usable
    }

    pub fn has_exclusive_control(&self) -> bool {
        self.has_exclusive_control
    }

    pub fn set_exclusive_control(&mut self, exclusive: bool) {
        self.has_exclusive_control = exclusive;
        self.update_notes();
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn set_rate_accuracy(&mut self, accuracy: RateAccuracy) -> bool {
        self.transmitter.set_rate_accuracy(accuracy)
    }

    /// The upstream seam: the stream compiler fills the packet list through
    /// this accessor.
    pub fn transmitter(&mut self) -> &mut PortTransmitter {
        &mut self.transmitter
    }

    pub fn start_transmit(&mut self) -> Result<(), TransmitError> {
        self.transmitter.start()
    }

    pub fn stop_transmit(&mut self) {
        self.transmitter.stop()
    }

    pub fn is_transmit_on(&self) -> bool {
        self.transmitter.is_running()
    }

    pub fn start_capture(&mut self, filter: &str) {
        self.capturer.start(filter)
    }

    pub fn stop_capture(&mut self) {
        self.capturer.stop()
    }

    pub fn is_capture_on(&self) -> bool {
        self.capturer.is_running()
    }

    pub fn capture_file(&self) -> &Path {
        self.capturer.capture_file()
    }

    pub fn start_device_emulation(&mut self) {
        self.emul_xcvr.start()
    }

    pub fn stop_device_emulation(&mut self) {
        self.emul_xcvr.stop()
    }

    /// Inject a control-plane packet on behalf of the device manager.
    pub fn send_emulation_packet(&self, data: &[u8]) -> Result<(), LinkError> {
        self.emul_xcvr.transmit_packet(data)
    }

    fn update_notes(&mut self) {
        self.notes = synthesize_notes(
            self.monitor_rx.is_promiscuous() && self.monitor_tx.is_promiscuous(),
            self.monitor_rx.is_directional(),
            self.monitor_tx.is_directional(),
            self.has_exclusive_control,
        );
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        log::debug!("tearing down port {}", self.name);
        // Request every stop first, then join: a worker joined while
        // another still owns its handle can wedge inside a read call.
        self.monitor_rx.stop();
        self.monitor_tx.stop();
        if self.transmitter.is_running() {
            self.transmitter.stop();
        }
        if self.capturer.is_running() {
            self.capturer.stop();
        }
        if self.emul_xcvr.is_running() {
            self.emul_xcvr.stop();
        }
        self.monitor_rx.join();
        self.monitor_tx.join();
    }
}

/// Derive the user-facing limitation notes from the monitors' capabilities.
fn synthesize_notes(
    promiscuous: bool,
    rx_directional: bool,
    tx_directional: bool,
    exclusive: bool,
) -> String {
    let mut lines = Vec::new();
    if !promiscuous {
        lines.push("Non promiscuous mode".to_owned());
    }
    if !rx_directional && !exclusive {
        lines.push(
            "Rx frames/bytes: include frames transmitted by this port".to_owned(),
        );
    }
    if !tx_directional && !exclusive {
        lines.push(
            "Tx frames/bytes: only frames transmitted by this port \
             (frames sent by others are not included)"
                .to_owned(),
        );
    }
    if lines.is_empty() {
        String::new()
    } else {
        let mut notes = String::from("Limitation(s):\n");
        for line in &lines {
            notes.push_str("- ");
            notes.push_str(line);
            notes.push('\n');
        }
        notes.push_str("Rx/Tx rates are also subject to the above limitation(s)");
        notes
    }
}
