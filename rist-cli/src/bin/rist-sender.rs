//! RIST Sender
//!
//! Reads from stdin, a file, or a UDP input and sends the stream to one or
//! more RIST peers.

use anyhow::Context as _;
use bytes::Bytes;
use clap::Parser;
use rist::{
    parse_udp_address, ConnectionEvent, Context, DataBlock, LoggingSettings, PeerId, Role,
};
use rist_cli::{config, logging, stats, Config, ProfileName, SenderConfig};
use rist_io::{BindOptions, RistSocket};
use std::fs::File;
use std::io::{self, BufReader, ErrorKind, Read};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Time left for retransmissions after the input ends
const LINGER: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "rist-sender")]
#[command(about = "RIST stream sender", long_about = None)]
struct Args {
    /// Input: file path, '-' for stdin, or udp://[@]host:port
    #[arg(short, long)]
    input: Option<String>,

    /// Output peers as rist:// URLs (repeatable)
    #[arg(short, long)]
    output: Vec<String>,

    /// Profile: simple, main or advanced
    #[arg(short, long)]
    profile: Option<ProfileName>,

    /// Statistics interval in milliseconds, 0 disables
    #[arg(short, long)]
    stats: Option<u64>,

    /// TOML configuration file with a [sender] section
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// RIST log level (-1, 3-7, 100)
    #[arg(short, long, allow_negative_numbers = true)]
    verbose_level: Option<i32>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<SenderConfig> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?
                .sender
                .with_context(|| format!("{} has no [sender] section", path.display()))?,
            None => SenderConfig::default(),
        };
        if let Some(input) = self.input {
            config.input = input;
        }
        config.peers.extend(self.output);
        if let Some(profile) = self.profile {
            config.profile = profile;
        }
        if let Some(stats) = self.stats {
            config.stats_interval_ms = stats;
        }
        Ok(config)
    }
}

enum Input {
    Stream(Box<dyn Read + Send>),
    Udp(RistSocket),
}

fn open_input(input: &str) -> anyhow::Result<Input> {
    if input == "-" {
        tracing::info!("Reading from stdin");
        return Ok(Input::Stream(Box::new(io::stdin())));
    }
    if input.starts_with("udp://") || input.starts_with("rtp://") {
        let udp = parse_udp_address(input)?;
        let addr: SocketAddr = udp
            .address
            .to_socket_addrs()?
            .next()
            .with_context(|| format!("cannot resolve {}", udp.address))?;
        let options = BindOptions {
            miface: Some(udp.miface).filter(|m| !m.is_empty()),
            ..Default::default()
        };
        let socket = RistSocket::bind(addr, &options)?;
        tracing::info!("Reading datagrams from {}", addr);
        return Ok(Input::Udp(socket));
    }
    tracing::info!("Reading from file {}", input);
    let file = File::open(input).with_context(|| format!("cannot open '{input}'"))?;
    Ok(Input::Stream(Box::new(BufReader::new(file))))
}

/// Fill `buf` from `reader`; short only at end of input
fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let level = logging::log_level(args.verbose_level);
    logging::init(level);

    let config = args.into_config()?;
    let peers = config::parse_peers(&config.peers)?;

    let ctx = Context::create(
        Role::Sender,
        config.profile.into(),
        0,
        LoggingSettings::new(level),
    )?;
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
    tracing::info!("Sending flow {}", ctx.flow_id()?);

    let mut total_bytes = 0u64;
    let mut blocks = 0u64;
    match open_input(&config.input)? {
        Input::Stream(mut reader) => {
            let mut chunk = vec![0u8; config.chunk_size.max(1)];
            loop {
                let n = read_chunk(reader.as_mut(), &mut chunk)?;
                if n == 0 {
                    tracing::info!("End of input reached");
                    break;
                }
                let block = DataBlock::new(Bytes::copy_from_slice(&chunk[..n]));
                total_bytes += ctx.write_data(block)? as u64;
                blocks += 1;
            }
        }
        Input::Udp(socket) => {
            let mut buf = vec![0u8; 65536];
            loop {
                let Some((n, _from)) = socket.recv_from(&mut buf, Duration::from_secs(1))? else {
                    continue;
                };
                if n == 0 {
                    continue;
                }
                let block = DataBlock::new(Bytes::copy_from_slice(&buf[..n]));
                total_bytes += ctx.write_data(block)? as u64;
                blocks += 1;
            }
        }
    }

    tracing::info!(
        "Wrote {} blocks ({}), lingering for retransmissions",
        blocks,
        stats::format_bytes(total_bytes)
    );
    thread::sleep(LINGER);
    ctx.destroy()?;
    Ok(())
}
