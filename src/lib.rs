//! Per-port packet engine for a traffic generator/analyzer.
//!
//! A [`Port`] binds to a network interface and runs four independent workers
//! over it: two direction-aware monitors feeding a shared counter block, a
//! transmit scheduler that replays a pre-built packet list with microsecond
//! pacing, a filtered capturer streaming into a pcap dump file, and a
//! transceiver exchanging control-plane packets with a device emulator.

/// Filtered live capture into a pcap dump file
pub mod capturer;
/// Control-plane packet exchange with a device emulator
pub mod emulation;
/// Live handle opening, capability fallback and the transmit link seam
pub mod link;
/// Direction-aware packet counting
pub mod monitor;
/// Microsecond delay primitives and overhead settlement
pub mod pacing;
/// Aggregation of the per-port workers
pub mod port;
/// Packet sequences and the transmit packet list
pub mod sequence;
/// Shared traffic counters
pub mod stats;
/// The transmit scheduler
pub mod transmitter;
/// Worker lifecycle primitives
pub mod worker;

pub use capturer::PortCapturer;
pub use emulation::{DeviceManager, EmulationTransceiver, PacketBuffer};
pub use link::{LinkError, OpenCaps, PcapTxLink, TxLink};
pub use monitor::{PortDirection, PortMonitor};
pub use pacing::{BusyWait, OsSleep, Pacer, RateAccuracy};
pub use port::Port;
pub use sequence::{PacketList, PacketSequence};
pub use stats::{PortStats, StatsSnapshot};
pub use transmitter::{PortTransmitter, TransmitError};
