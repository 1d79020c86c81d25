use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum Accuracy {
    /// Busy-wait pacing, accurate to a few microseconds
    High,
    /// OS sleep pacing, cheap but scheduler-limited
    Low,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay a pcap file onto an interface with its original timing
    Transmit {
        #[arg(short, long, help = "Interface to transmit on")]
        interface: String,
        #[arg(short, long, help = "Pcap file with the packets to send")]
        file: String,
        #[arg(
            long,
            default_value_t = false,
            help = "Replay the whole list again once it is exhausted"
        )]
        repeat: bool,
        #[arg(
            long,
            default_value = "0s",
            help = "Delay before each replay in human-friendly time, such as \"20ms\""
        )]
        repeat_delay: String,
        #[arg(
            short,
            long,
            value_enum,
            default_value_t = Accuracy::Low,
            help = "Pacing accuracy of inter-packet delays"
        )]
        accuracy: Accuracy,
    },
    /// Count packets per direction on an interface
    Monitor {
        #[arg(short, long, help = "Interface to observe")]
        interface: String,
        #[arg(
            long,
            default_value = "1s",
            help = "Interval between counter reports"
        )]
        interval: String,
    },
    /// Capture filtered traffic into a pcap dump file
    Capture {
        #[arg(short, long, help = "Interface to capture on")]
        interface: String,
        #[arg(
            short,
            long,
            default_value = "",
            help = "BPF filter; empty captures everything"
        )]
        filter: String,
        #[arg(short, long, default_value = None, help = "Copy the dump file here on exit")]
        outfile: Option<String>,
    },
    /// Answer-log control-plane packets the way a device emulator would see them
    Emulate {
        #[arg(short, long, help = "Interface to exchange control-plane packets on")]
        interface: String,
    },
}
