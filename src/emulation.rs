use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use pcap::{Active, Capture};

use crate::link::LinkError;
use crate::worker::{StateCell, StopFlag, WorkerState};

const EMULATION_SNAPLEN: i32 = 65535;
const EMULATION_TIMEOUT_MS: i32 = 100;

/// Control-plane traffic of interest: ARP/NDP and ICMPv4/v6, tagged or not.
///
/// A `vlan` keyword in a capture filter shifts the decoding offsets for the
/// rest of the expression, so the stacked-tag clauses repeat a single `vlan`
/// instead of nesting them; this matches up to four stacked tags on a
/// best-effort basis.
const EMULATION_FILTER: &str = "arp or icmp or icmp6 or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6)) or \
     (vlan and (arp or icmp or icmp6))";

/// A received packet lent to the device manager.
///
/// The bytes live only for the duration of the `receive_packet` call; a
/// manager that needs them longer must copy.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuffer<'a> {
    data: &'a [u8],
}

impl<'a> PacketBuffer<'a> {
    pub fn new(data: &'a [u8]) -> PacketBuffer<'a> {
        PacketBuffer { data }
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// The device-emulator side of the port.
///
/// Packets matching the control-plane filter are handed over synchronously;
/// the manager replies by calling back into
/// [`EmulationTransceiver::transmit_packet`] from within the delivery.
pub trait DeviceManager: Send + Sync {
    fn receive_packet(&self, pkt: PacketBuffer<'_>);
}

/// Single bidirectional handle for control-plane packets exchanged with the
/// device emulator.
pub struct EmulationTransceiver {
    device: String,
    manager: Arc<dyn DeviceManager>,
    handle: Arc<Mutex<Option<Capture<Active>>>>,
    state: Arc<StateCell>,
    stop: StopFlag,
    thread: Option<JoinHandle<()>>,
}

impl EmulationTransceiver {
    pub fn new(device: &str, manager: Arc<dyn DeviceManager>) -> EmulationTransceiver {
        EmulationTransceiver {
            device: device.to_owned(),
            manager,
            handle: Arc::new(Mutex::new(None)),
            state: StateCell::new(),
            stop: StopFlag::default(),
            thread: None,
        }
    }

    pub fn start(&mut self) {
        if self.state.is_running() {
            log::warn!("receive start requested but it is already running");
            return;
        }
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
        self.state.set(WorkerState::NotStarted);
        self.stop.clear();
        let device = self.device.clone();
        let manager = Arc::clone(&self.manager);
        let shared = Arc::clone(&self.handle);
        let state = Arc::clone(&self.state);
        let stop = self.stop.clone();
        let builder = thread::Builder::new().name(format!("emul-{}", self.device));
        self.thread = Some(
            builder
                .spawn(move || run_receiver(&device, manager.as_ref(), &shared, &state, &stop))
                .unwrap(),
        );
        self.state.wait_while(|s| s == WorkerState::NotStarted);
    }

    pub fn stop(&mut self) {
        if !self.state.is_running() {
            log::warn!("receive stop requested but it is not running");
            return;
        }
        self.stop.request();
        self.state.wait_while(|s| s == WorkerState::Running);
        if let Some(handle) = self.thread.take() {
            handle.join().unwrap();
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    /// Inject a packet through the emulation handle. Called synchronously
    /// by the device manager in response to a received packet; there is no
    /// queue. May wait up to one read timeout for the receive loop to
    /// release the handle.
    pub fn transmit_packet(&self, data: &[u8]) -> Result<(), LinkError> {
        let mut guard = self.handle.lock().unwrap();
        match guard.as_mut() {
            Some(cap) => {
                cap.sendpacket(data)?;
                Ok(())
            }
            None => Err(LinkError::NotOpen),
        }
    }
}

impl Drop for EmulationTransceiver {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// Open the emulation handle. A promiscuous refusal is final here: without
/// promiscuous mode the emulated devices would never see their traffic.
fn open_emulation(device: &str) -> Option<Capture<Active>> {
    let mut no_local = true;
    loop {
        let attempt = Capture::from_device(device)
            .and_then(|c| {
                c.promisc(true)
                    .snaplen(EMULATION_SNAPLEN)
                    .timeout(EMULATION_TIMEOUT_MS)
                    .open()
            });
        match attempt {
            Ok(cap) => return Some(cap),
            Err(e) => {
                let text = e.to_string();
                if text.contains("promiscuous") {
                    log::error!(
                        "unable to set promiscuous mode on {device}: \
                         device emulation will not work"
                    );
                    return None;
                }
                if no_local && text.contains("loopback") {
                    log::debug!("cannot set no local capture mode on {device}");
                    no_local = false;
                    continue;
                }
                log::error!("unable to open {device} ({e}): device emulation will not work");
                return None;
            }
        }
    }
}

fn run_receiver(
    device: &str,
    manager: &dyn DeviceManager,
    shared: &Mutex<Option<Capture<Active>>>,
    state: &StateCell,
    stop: &StopFlag,
) {
    let mut cap = match open_emulation(device) {
        Some(cap) => cap,
        None => {
            state.set(WorkerState::Finished);
            return;
        }
    };

    // A filter failure is not fatal: run unfiltered and let the manager
    // discard what it does not understand.
    if let Err(e) = cap.filter(EMULATION_FILTER, true) {
        log::warn!("{device}: error applying emulation filter: {e}");
    }

    *shared.lock().unwrap() = Some(cap);
    state.set(WorkerState::Running);

    let mut scratch: Vec<u8> = Vec::with_capacity(EMULATION_SNAPLEN as usize);
    loop {
        // Read under the lock, then deliver outside it: the manager replies
        // synchronously through transmit_packet, which takes the same lock.
        let received = {
            let mut guard = shared.lock().unwrap();
            let cap = guard.as_mut().expect("handle installed above");
            match cap.next_packet() {
                Ok(pkt) => {
                    scratch.clear();
                    scratch.extend_from_slice(pkt.data);
                    Ok(true)
                }
                Err(pcap::Error::TimeoutExpired) => Ok(false),
                Err(e) => Err(e),
            }
        };
        match received {
            Ok(true) => manager.receive_packet(PacketBuffer::new(&scratch)),
            Ok(false) => {}
            Err(pcap::Error::NoMorePackets) => {
                log::error!("{device}: emulation handle closed, receiver exiting");
                break;
            }
            Err(e) => log::warn!("{device}: error reading packet: {e}"),
        }
        if stop.is_requested() {
            log::debug!("emulation receiver stop requested");
            break;
        }
    }

    *shared.lock().unwrap() = None;
    stop.clear();
    state.set(WorkerState::Finished);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingManager {
        seen: StdMutex<Vec<Vec<u8>>>,
    }

    impl DeviceManager for RecordingManager {
        fn receive_packet(&self, pkt: PacketBuffer<'_>) {
            self.seen.lock().unwrap().push(pkt.data().to_vec());
        }
    }

    #[test]
    fn delivery_lends_the_exact_bytes() {
        let manager = RecordingManager {
            seen: StdMutex::new(Vec::new()),
        };
        let frame = [0xffu8, 0xff, 0xff, 0xff, 0xff, 0xff, 0, 1, 2, 3, 4, 5, 0x08, 0x06];
        manager.receive_packet(PacketBuffer::new(&frame));
        let seen = manager.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], frame);
    }

    #[test]
    fn filter_covers_bare_and_stacked_vlan_clauses() {
        assert!(EMULATION_FILTER.starts_with("arp or icmp or icmp6"));
        assert_eq!(EMULATION_FILTER.matches("vlan").count(), 4);
        assert_eq!(
            EMULATION_FILTER.matches("(arp or icmp or icmp6)").count(),
            4
        );
    }

    #[test]
    fn transmit_without_a_session_reports_not_open() {
        let manager = Arc::new(RecordingManager {
            seen: StdMutex::new(Vec::new()),
        });
        let xcvr = EmulationTransceiver::new("test0", manager);
        assert!(matches!(
            xcvr.transmit_packet(&[0; 60]),
            Err(LinkError::NotOpen)
        ));
    }
}
