//! RIST Receiver
//!
//! Receives a RIST stream from one or more peers and writes the payloads to
//! stdout, a file, or a UDP/RTP output.

use anyhow::Context as _;
use clap::Parser;
use rist::{
    parse_udp_address, ConnectionEvent, Context, DataBlock, LoggingSettings, PeerId, Role,
    UdpConfig,
};
use rist_cli::{config, logging, stats, Config, ProfileName, ReceiverConfig};
use rist_io::{BindOptions, RistSocket};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// MPEG-TS payload type, used when the URL leaves rtp-ptype unset
const DEFAULT_RTP_PTYPE: u8 = 33;

#[derive(Parser, Debug)]
#[command(name = "rist-receiver")]
#[command(about = "RIST stream receiver", long_about = None)]
struct Args {
    /// Input peers as rist:// URLs (repeatable)
    #[arg(short, long)]
    input: Vec<String>,

    /// Output: file path, '-' for stdout, or udp://host:port / rtp://host:port
    #[arg(short, long)]
    output: Option<String>,

    /// Profile: simple, main or advanced
    #[arg(short, long)]
    profile: Option<ProfileName>,

    /// Statistics interval in milliseconds, 0 disables
    #[arg(short, long)]
    stats: Option<u64>,

    /// TOML configuration file with a [receiver] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RIST log level (-1, 3-7, 100)
    #[arg(short, long, allow_negative_numbers = true)]
    verbose_level: Option<i32>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<ReceiverConfig> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?
                .receiver
                .with_context(|| format!("{} has no [receiver] section", path.display()))?,
            None => ReceiverConfig::default(),
        };
        config.peers.extend(self.input);
        if let Some(output) = self.output {
            config.output = output;
        }
        if let Some(profile) = self.profile {
            config.profile = profile;
        }
        if let Some(stats) = self.stats {
            config.stats_interval_ms = stats;
        }
        Ok(config)
    }
}

/// UDP or RTP output
struct UdpOutput {
    socket: RistSocket,
    target: SocketAddr,
    config: UdpConfig,
    rtp_seq: u16,
}

impl UdpOutput {
    fn open(url: &str) -> anyhow::Result<Self> {
        let config = parse_udp_address(url)?;
        let target = config
            .address
            .to_socket_addrs()?
            .next()
            .with_context(|| format!("cannot resolve {}", config.address))?;
        let local: IpAddr = match target {
            SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let options = BindOptions {
            miface: Some(config.miface.clone()).filter(|m| !m.is_empty()),
            ..Default::default()
        };
        let socket = RistSocket::bind(SocketAddr::new(local, 0), &options)?;
        tracing::info!("Relaying to {}{}", target, if config.rtp { " (rtp)" } else { "" });
        Ok(UdpOutput {
            socket,
            target,
            config,
            rtp_seq: 0,
        })
    }

    fn write_block(&mut self, block: &DataBlock) -> anyhow::Result<()> {
        if self.config.stream_id != 0 && block.virt_dst_port != self.config.stream_id {
            return Ok(());
        }
        if !self.config.rtp {
            self.socket.send_to(&block.payload, self.target)?;
            return Ok(());
        }

        let seq = if self.config.rtp_sequence {
            block.seq as u16
        } else {
            self.rtp_seq = self.rtp_seq.wrapping_add(1);
            self.rtp_seq
        };
        let mut datagram = rtp_header(&self.config, seq, block.ts_ntp, block.flow_id).to_vec();
        datagram.extend_from_slice(&block.payload);
        self.socket.send_to(&datagram, self.target)?;
        Ok(())
    }
}

/// 12-byte RTP header; the timestamp is the NTP time on a 90 kHz clock
fn rtp_header(config: &UdpConfig, seq: u16, ts_ntp: u64, ssrc: u32) -> [u8; 12] {
    let ptype = if config.rtp_ptype == 0 {
        DEFAULT_RTP_PTYPE
    } else {
        config.rtp_ptype
    };
    let ts = if config.rtp_timestamp {
        ((ts_ntp as u128 * 90_000) >> 32) as u32
    } else {
        0
    };

    let mut header = [0u8; 12];
    header[0] = 0x80;
    header[1] = ptype & 0x7f;
    header[2..4].copy_from_slice(&seq.to_be_bytes());
    header[4..8].copy_from_slice(&ts.to_be_bytes());
    header[8..12].copy_from_slice(&ssrc.to_be_bytes());
    header
}

enum Output {
    Stream(Box<dyn Write>),
    Udp(UdpOutput),
}

impl Output {
    fn open(output: &str) -> anyhow::Result<Self> {
        if output == "-" {
            tracing::info!("Writing to stdout");
            return Ok(Output::Stream(Box::new(io::stdout())));
        }
        if output.starts_with("udp://") || output.starts_with("rtp://") {
            return Ok(Output::Udp(UdpOutput::open(output)?));
        }
        tracing::info!("Writing to file {}", output);
        let file = File::create(output).with_context(|| format!("cannot create '{output}'"))?;
        Ok(Output::Stream(Box::new(BufWriter::new(file))))
    }

    fn write_block(&mut self, block: &DataBlock) -> anyhow::Result<()> {
        match self {
            Output::Stream(writer) => Ok(writer.write_all(&block.payload)?),
            Output::Udp(udp) => udp.write_block(block),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Output::Stream(writer) => writer.flush(),
            Output::Udp(_) => Ok(()),
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = logging::log_level(args.verbose_level);
    logging::init(level);

    let config = args.into_config()?;
    let peers = config::parse_peers(&config.peers)?;
    let mut output = Output::open(&config.output)?;

    let ctx = Context::create(
        Role::Receiver,
        config.profile.into(),
        0,
        LoggingSettings::new(level),
    )?;
    ctx.set_output_fifo_size(config.fifo_size)?;
    ctx.set_connection_status_callback(|peer: PeerId, event: ConnectionEvent| {
        tracing::info!("{}: {}", peer, event);
    })?;
    if let Some(interval) = config.stats_interval() {
        ctx.set_stats_callback(interval, |snapshot| stats::display_snapshot(&snapshot))?;
    }
    for (url, peer) in config.peers.iter().zip(&peers) {
        let id = ctx.peer_create(peer)?;
        tracing::info!("Added {} as {}", url, id);
    }
    ctx.start()?;

    let mut discontinuities = 0u64;
    loop {
        let Some(block) = ctx.read_data(READ_TIMEOUT)? else {
            output.flush()?;
            continue;
        };
        if block.is_discontinuous() {
            discontinuities += 1;
            tracing::debug!(
                "Discontinuity before seq {} ({} so far)",
                block.seq,
                discontinuities
            );
        }
        output.write_block(&block)?;
    }
}
