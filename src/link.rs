use std::sync::{Arc, Mutex};

use pcap::{Active, Capture, Device};
use thiserror::Error;

use crate::sequence::PacketSequence;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("packet send failed: {0}")]
    Send(String),
    #[error("no open handle to send on")]
    NotOpen,
}

impl From<pcap::Error> for LinkError {
    fn from(e: pcap::Error) -> LinkError {
        LinkError::Send(e.to_string())
    }
}

/// Capabilities requested when opening a live handle.
///
/// Opening retries with degraded capabilities when the packet layer refuses
/// one of them; the surviving set is reported back so the caller can record
/// what it actually got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenCaps {
    pub promiscuous: bool,
    pub no_local_capture: bool,
}

impl OpenCaps {
    pub fn full() -> OpenCaps {
        OpenCaps {
            promiscuous: true,
            no_local_capture: true,
        }
    }

    /// Decide which capability to drop after a failed open, based on the
    /// error text of the packet layer. Returns `None` when nothing is left
    /// to drop.
    pub fn degrade_for(&self, err: &str) -> Option<OpenCaps> {
        if self.promiscuous && err.contains("promiscuous") {
            return Some(OpenCaps {
                promiscuous: false,
                ..*self
            });
        }
        if self.no_local_capture && err.contains("loopback") {
            return Some(OpenCaps {
                no_local_capture: false,
                ..*self
            });
        }
        None
    }
}

/// Open a live handle, walking down the capability fallback chain.
///
/// The no-local-capture open flag is not an option on this pcap binding; the
/// axis survives only to classify the loopback fallback.
pub fn open_live(
    device: &str,
    snaplen: i32,
    timeout_ms: i32,
    want: OpenCaps,
) -> Result<(Capture<Active>, OpenCaps), pcap::Error> {
    let mut caps = want;
    loop {
        let attempt = Capture::from_device(device)?
            .promisc(caps.promiscuous)
            .snaplen(snaplen)
            .timeout(timeout_ms)
            .open();
        match attempt {
            Ok(cap) => return Ok((cap, caps)),
            Err(e) => match caps.degrade_for(&e.to_string()) {
                Some(degraded) => {
                    log::debug!("cannot open {device} with {caps:?} ({e}), retrying degraded");
                    caps = degraded;
                }
                None => return Err(e),
            },
        }
    }
}

/// Look a device up by name for its description.
pub fn lookup_device(name: &str) -> Option<Device> {
    match Device::list() {
        Ok(devices) => devices.into_iter().find(|d| d.name == name),
        Err(e) => {
            log::warn!("cannot list devices: {e}");
            None
        }
    }
}

/// A live handle lent across threads.
///
/// The lender keeps reading on it while the borrower sends; both sides take
/// the lock only for the duration of one packet-layer call.
pub type SharedCapture = Arc<Mutex<Capture<Active>>>;

/// The transmit scheduler's emission target.
pub trait TxLink: Send {
    fn send(&mut self, pkt: &[u8]) -> Result<(), LinkError>;

    /// Submit a whole sequence in one synchronous call, where the platform
    /// offers a native bulk transmit. `None` means the capability is absent
    /// and the caller must walk the sequence itself.
    fn send_sequence(&mut self, _seq: &PacketSequence) -> Option<Result<(), LinkError>> {
        None
    }
}

/// Pcap-backed transmit link.
///
/// `Internal` owns the handle and closes it on drop; `Shared` borrows the
/// Rx monitor's handle so self-sent packets stay observable on the receive
/// side when direction restriction is unavailable.
pub enum PcapTxLink {
    Internal(Capture<Active>),
    Shared(SharedCapture),
}

impl PcapTxLink {
    /// Open an internally owned handle on `device`.
    pub fn open_internal(device: &str) -> Option<PcapTxLink> {
        match Capture::from_device(device)
            .and_then(|c| c.promisc(false).snaplen(64).timeout(1000).open())
        {
            Ok(cap) => Some(PcapTxLink::Internal(cap)),
            Err(e) => {
                log::warn!("cannot open transmit handle on {device}: {e}");
                None
            }
        }
    }
}

impl TxLink for PcapTxLink {
    fn send(&mut self, pkt: &[u8]) -> Result<(), LinkError> {
        match self {
            PcapTxLink::Internal(cap) => cap.sendpacket(pkt)?,
            PcapTxLink::Shared(cap) => cap.lock().unwrap().sendpacket(pkt)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_drops_promiscuous_first() {
        let caps = OpenCaps::full();
        let next = caps
            .degrade_for("failed to set hardware filter to promiscuous mode")
            .unwrap();
        assert!(!next.promiscuous);
        assert!(next.no_local_capture);
    }

    #[test]
    fn degrade_drops_no_local_on_loopback() {
        let caps = OpenCaps {
            promiscuous: false,
            no_local_capture: true,
        };
        let next = caps.degrade_for("that device doesn't support loopback mode").unwrap();
        assert!(!next.no_local_capture);
    }

    #[test]
    fn degrade_gives_up_when_nothing_matches() {
        assert_eq!(OpenCaps::full().degrade_for("no such device"), None);
        let bare = OpenCaps {
            promiscuous: false,
            no_local_capture: false,
        };
        assert_eq!(bare.degrade_for("promiscuous"), None);
        assert_eq!(bare.degrade_for("loopback"), None);
    }

    #[test]
    fn degrade_walks_both_axes_in_order() {
        let caps = OpenCaps::full();
        let after_promisc = caps.degrade_for("promiscuous").unwrap();
        let after_loopback = after_promisc.degrade_for("loopback").unwrap();
        assert_eq!(
            after_loopback,
            OpenCaps {
                promiscuous: false,
                no_local_capture: false
            }
        );
        assert_eq!(after_loopback.degrade_for("promiscuous"), None);
    }
}
