use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{bounded, tick, Receiver};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use pcap_file::pcap::PcapReader;
use pnet_packet::ethernet::{EtherTypes, EthernetPacket};

use wireport::emulation::{DeviceManager, PacketBuffer};
use wireport::{Port, PortCapturer, PortTransmitter, RateAccuracy};

mod cmd;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = cmd::Args::parse();

    // Bridge ctrl+C into a cooperative shutdown signal.
    let (tx_sig, rx_sig) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = tx_sig.try_send(());
    })
    .expect("Error setting Ctrl-C handler");

    match args.command {
        cmd::Command::Transmit {
            interface,
            file,
            repeat,
            repeat_delay,
            accuracy,
        } => transmit(&interface, &file, repeat, &repeat_delay, accuracy, rx_sig),
        cmd::Command::Monitor {
            interface,
            interval,
        } => monitor(&interface, &interval, rx_sig),
        cmd::Command::Capture {
            interface,
            filter,
            outfile,
        } => capture(&interface, &filter, outfile.as_deref(), rx_sig),
        cmd::Command::Emulate { interface } => emulate(&interface, rx_sig),
    }
}

/// Load a pcap file into the transmitter's packet list and replay it.
fn transmit(
    interface: &str,
    file: &str,
    repeat: bool,
    repeat_delay: &str,
    accuracy: cmd::Accuracy,
    rx_sig: Receiver<()>,
) -> anyhow::Result<()> {
    let repeat_delay =
        humantime::parse_duration(repeat_delay).context("Repeat delay could not be parsed")?;

    let mut transmitter = PortTransmitter::new(interface);
    transmitter.set_rate_accuracy(match accuracy {
        cmd::Accuracy::High => RateAccuracy::High,
        cmd::Accuracy::Low => RateAccuracy::Low,
    });

    let reader = File::open(file).with_context(|| format!("Cannot open {file}"))?;
    let mut reader = PcapReader::new(reader).context("Not a readable pcap file")?;
    let mut loaded: u64 = 0;
    while let Some(pkt) = reader.next_packet() {
        let pkt = pkt.context("Corrupt packet record")?;
        if !transmitter.append_to_packet_list(pkt.timestamp, &pkt.data, pkt.orig_len) {
            log::warn!("packet {loaded} was not appended, skipping");
        }
        loaded += 1;
    }
    anyhow::ensure!(loaded > 0, "{file} contains no packets");
    log::info!("{loaded} packets loaded from {file}");

    transmitter.set_packet_list_loop_mode(repeat, repeat_delay);
    transmitter.start()?;

    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} Transmitting {msg}").unwrap(),
    );

    let start = Instant::now();
    let ticker = tick(Duration::from_millis(200));
    while transmitter.is_running() {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                let snap = transmitter.stats();
                let secs = start.elapsed().as_secs_f64();
                let throughput = if secs > 0.0 { snap.tx_bytes as f64 / secs } else { 0.0 };
                progress.set_message(format!(
                    "{} pkts [{}/s]",
                    snap.tx_pkts,
                    HumanBytes(throughput as u64)
                ));
                progress.tick();
            }
            recv(rx_sig) -> _ => {
                log::info!("stopping transmit");
                transmitter.stop();
            }
        }
    }
    progress.finish_and_clear();

    let snap = transmitter.stats();
    log::info!(
        "transmit done: {} packets, {} bytes",
        snap.tx_pkts,
        snap.tx_bytes
    );
    Ok(())
}

/// Run the full port (both monitors) and report the counters periodically.
fn monitor(interface: &str, interval: &str, rx_sig: Receiver<()>) -> anyhow::Result<()> {
    let interval = humantime::parse_duration(interval).context("Interval could not be parsed")?;

    let mut port = Port::new(interface, Arc::new(SilentManager));
    anyhow::ensure!(port.is_usable(), "Port {interface} is not usable");
    port.init();
    if !port.notes().is_empty() {
        log::warn!("{}", port.notes());
    }

    let ticker = tick(interval);
    loop {
        crossbeam_channel::select! {
            recv(ticker) -> _ => {
                let s = port.stats();
                log::info!(
                    "rx {} pkts / {} bytes | tx {} pkts / {} bytes",
                    s.rx_pkts, s.rx_bytes, s.tx_pkts, s.tx_bytes
                );
            }
            recv(rx_sig) -> _ => break,
        }
    }
    Ok(())
}

/// Capture filtered traffic until interrupted, then surface the dump file.
fn capture(
    interface: &str,
    filter: &str,
    outfile: Option<&str>,
    rx_sig: Receiver<()>,
) -> anyhow::Result<()> {
    let mut capturer = PortCapturer::new(interface);
    capturer.start(filter);
    anyhow::ensure!(
        capturer.is_running(),
        "Capture did not start (bad filter or interface?)"
    );
    log::info!("capturing into {}", capturer.capture_file().display());

    let _ = rx_sig.recv();
    capturer.stop();

    if let Some(outfile) = outfile {
        std::fs::copy(capturer.capture_file(), outfile)
            .with_context(|| format!("Cannot copy the dump file to {outfile}"))?;
        log::info!("capture saved to {outfile}");
    } else {
        log::info!("capture left in {}", capturer.capture_file().display());
    }
    Ok(())
}

/// Run the emulation transceiver with a manager that logs what it sees.
fn emulate(interface: &str, rx_sig: Receiver<()>) -> anyhow::Result<()> {
    let mut port = Port::new(interface, Arc::new(LoggingManager));
    anyhow::ensure!(port.is_usable(), "Port {interface} is not usable");
    port.init();
    port.start_device_emulation();

    let _ = rx_sig.recv();
    port.stop_device_emulation();
    Ok(())
}

/// Device manager that ignores everything; the monitor subcommand only
/// needs the counters.
struct SilentManager;

impl DeviceManager for SilentManager {
    fn receive_packet(&self, _pkt: PacketBuffer<'_>) {}
}

/// Device manager that classifies and logs incoming control-plane packets.
struct LoggingManager;

impl DeviceManager for LoggingManager {
    fn receive_packet(&self, pkt: PacketBuffer<'_>) {
        let Some(eth) = EthernetPacket::new(pkt.data()) else {
            log::debug!("runt frame of {} bytes", pkt.len());
            return;
        };
        let kind = match eth.get_ethertype() {
            EtherTypes::Arp => "ARP",
            EtherTypes::Ipv4 => "ICMPv4",
            EtherTypes::Ipv6 => "ICMPv6/NDP",
            EtherTypes::Vlan => "VLAN-tagged",
            other => {
                log::debug!("unexpected ethertype {other}");
                return;
            }
        };
        log::info!(
            "{kind} packet, {} bytes, {} -> {}",
            pkt.len(),
            eth.get_source(),
            eth.get_destination()
        );
    }
}
