//! st2110-cli - ST 2110 media streaming over a userspace NIC
//!
//! Sends and receives uncompressed video (ST 2110-20), PCM audio
//! (ST 2110-30) and ancillary data (ST 2110-40) with ST 2110-21 pacing.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use st2110::app::{
    producer::BufFormat, AncLogger, AudioSink, FileProducer, ScratchFileConsumer,
    TestToneProducer, TimecodeAncProducer,
};
use st2110::config::StreamConfig;
use st2110::streaming::format::{
    AncFormat, AudioFormat, FrameRate, LinkSpeed, PacerType, PktFmt, VideoFormat, Vscan,
};
use st2110::streaming::nic::{NicPort, UdpFallbackPort};
use st2110::streaming::ptp::{
    AddrMode, MasterChooseMode, PtpClock, PtpConfig, PtpEngine, StepMode,
};
use st2110::streaming::session::{BindAddr, DeviceConfig, RxDevice, TxDevice};

#[derive(Parser)]
#[command(name = "st2110-cli")]
#[command(about = "ST 2110 media streaming engine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Read defaults from this TOML file instead of the default path
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Args, Clone)]
struct StreamArgs {
    /// Destination IPv4 (multicast group or unicast receiver)
    #[arg(long)]
    dst_ip: Option<Ipv4Addr>,

    /// Source IPv4 the port binds
    #[arg(long)]
    src_ip: Option<Ipv4Addr>,

    /// Destination MAC for unicast flows (aa:bb:cc:dd:ee:ff)
    #[arg(long)]
    dst_mac: Option<String>,

    /// UDP base port; session i uses port + i
    #[arg(long, default_value = "10000")]
    udp_port: u16,

    /// Format index: 0=720p 1=1080p 2=2160p (Intel), 3..5 other-vendor
    #[arg(short, long)]
    fmt_index: Option<u32>,

    /// Interlaced scan
    #[arg(long)]
    interlaced: bool,

    /// Frame rate: 25, 29, 50 or 59
    #[arg(short, long)]
    rate: Option<u32>,

    /// Video session count
    #[arg(short, long)]
    sessions: Option<u32>,

    /// Audio session count
    #[arg(long, default_value = "0")]
    audio_sessions: u32,

    /// Ancillary session count
    #[arg(long, default_value = "0")]
    anc_sessions: u32,

    /// Pacer type: tpn, tpnl or tpw
    #[arg(long)]
    pacer: Option<String>,

    /// Link speed the pacing tables assume, in Gbps
    #[arg(long)]
    nic_speed: Option<u32>,

    /// SSRC of the first session; session i uses ssid + i
    #[arg(long, default_value = "0x123450", value_parser = parse_hex_u32)]
    ssid: u32,

    /// PTP master clock id (8 hex bytes), locks master selection
    #[arg(long)]
    ptp_clock_id: Option<String>,

    /// PTP address mode: u (unicast) or m (multicast)
    #[arg(long, default_value = "m")]
    ptp_addr_mode: String,

    /// PTP step mode: o (one-step) or t (two-step)
    #[arg(long, default_value = "t")]
    ptp_step_mode: String,

    /// Run the EBU compliance monitor on received streams
    #[arg(long)]
    ebu_check: bool,

    /// Source buffer format: yuv10be or rgba
    #[arg(long, default_value = "yuv10be")]
    buf_format: String,

    /// Mark media flows with DSCP expedited forwarding
    #[arg(long)]
    dscp_expedited: bool,

    /// Source video file; a test pattern is generated when absent
    #[arg(long)]
    video_file: Option<PathBuf>,

    /// Stop after this many frames per session
    #[arg(long)]
    frames: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Transmit sessions
    Tx(StreamArgs),

    /// Receive sessions
    Rx(StreamArgs),

    /// Transmit and receive on the same host (loop test)
    Rxtx(StreamArgs),

    /// Write the given options as the default configuration
    SaveConfig(StreamArgs),
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    let s = s.trim_start_matches("0x");
    u32::from_str_radix(s, 16).map_err(|e| e.to_string())
}

/// Merged CLI + config-file parameters.
struct Params {
    dst_ip: Ipv4Addr,
    src_ip: Ipv4Addr,
    dst_mac: Option<[u8; 6]>,
    udp_port: u16,
    fmt: VideoFormat,
    rate: FrameRate,
    sessions: u32,
    audio_sessions: u32,
    anc_sessions: u32,
    pacer: PacerType,
    nic_speed: LinkSpeed,
    ssid: u32,
    ptp: PtpConfig,
    ebu_check: bool,
    buf_format: BufFormat,
    dscp_expedited: bool,
    video_file: Option<PathBuf>,
    frames: Option<u64>,
}

impl Params {
    fn resolve(args: &StreamArgs, file: &StreamConfig) -> Result<Params> {
        let rate_n = args.rate.or(file.rate).unwrap_or(29);
        let rate = FrameRate::from_cli(rate_n)?;
        let fmt_index = args.fmt_index.or(file.fmt_index).unwrap_or(1);
        let interlaced = args.interlaced || file.interlaced.unwrap_or(false);
        let vscan = match (fmt_index % 3, interlaced) {
            (0, false) => Vscan::P720,
            (1, false) => Vscan::P1080,
            (2, false) => Vscan::P2160,
            (0, true) => Vscan::I720,
            (1, true) => Vscan::I1080,
            _ => Vscan::I2160,
        };
        // interlaced scans only stream in the generic single-line form
        let pkt_fmt = match fmt_index {
            0..=2 if interlaced => PktFmt::OtherSingleLine,
            0..=2 => PktFmt::IntelSingleLine,
            _ => PktFmt::OtherSingleLine,
        };
        let fmt = VideoFormat::new(vscan, pkt_fmt, rate)?;

        let pacer = match args
            .pacer
            .as_deref()
            .or(file.pacer.as_deref())
            .unwrap_or("tpn")
        {
            "tpn" => PacerType::Tpn,
            "tpnl" => PacerType::Tpnl,
            "tpw" => PacerType::Tpw,
            other => bail!("unknown pacer type {other}"),
        };

        let nic_speed = LinkSpeed::from_gbps(
            args.nic_speed.or(file.nic_speed).unwrap_or(10),
        )?;

        let dst_ip = args
            .dst_ip
            .or_else(|| file.dst_ip.as_deref().and_then(|s| s.parse().ok()))
            .unwrap_or(Ipv4Addr::new(239, 0, 0, 1));
        let src_ip = args
            .src_ip
            .or_else(|| file.src_ip.as_deref().and_then(|s| s.parse().ok()))
            .unwrap_or(Ipv4Addr::new(0, 0, 0, 0));
        let dst_mac = match args.dst_mac.as_deref().or(file.dst_mac.as_deref()) {
            Some(s) => Some(StreamConfig::parse_mac(s)?),
            None => None,
        };

        let ptp = PtpConfig {
            addr_mode: match args.ptp_addr_mode.as_str() {
                "u" => AddrMode::Unicast,
                _ => AddrMode::Multicast,
            },
            step_mode: match args.ptp_step_mode.as_str() {
                "o" => StepMode::OneStep,
                _ => StepMode::TwoStep,
            },
            master_choose: if args.ptp_clock_id.is_some() {
                MasterChooseMode::UserSet
            } else {
                MasterChooseMode::FirstKnown
            },
            master_clock_id: match args
                .ptp_clock_id
                .as_deref()
                .or(file.ptp_clock_id.as_deref())
            {
                Some(s) => Some(StreamConfig::parse_clock_id(s)?),
                None => None,
            },
        };

        Ok(Params {
            dst_ip,
            src_ip,
            dst_mac,
            udp_port: args.udp_port,
            fmt,
            rate,
            sessions: args.sessions.or(file.sessions).unwrap_or(1),
            audio_sessions: args.audio_sessions,
            anc_sessions: args.anc_sessions,
            pacer,
            nic_speed,
            ssid: args.ssid,
            ptp,
            ebu_check: args.ebu_check || file.ebu_check.unwrap_or(false),
            buf_format: BufFormat::from_cli(
                args.buf_format.as_str(),
            )?,
            dscp_expedited: args.dscp_expedited || file.dscp_expedited.unwrap_or(false),
            video_file: args.video_file.clone(),
            frames: args.frames,
        })
    }

    fn device_config(&self) -> DeviceConfig {
        let mut cfg = DeviceConfig::new(self.rate, self.pacer);
        cfg.max_st21_sessions = Some(self.sessions.max(1));
        cfg.dscp_expedited = self.dscp_expedited;
        cfg.ebu_check = self.ebu_check;
        cfg
    }

    fn bind_addr(&self, index: u16) -> BindAddr {
        BindAddr {
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
            src_port: self.udp_port + index,
            dst_port: self.udp_port + index,
            dst_mac: self.dst_mac,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let file_cfg = StreamConfig::load(cli.config.as_deref())?;

    let result = match cli.command {
        Commands::Tx(args) => {
            let params = Params::resolve(&args, &file_cfg)?;
            run_tx(params).await
        }
        Commands::Rx(args) => {
            let params = Params::resolve(&args, &file_cfg)?;
            run_rx(params).await
        }
        Commands::Rxtx(args) => {
            let params = Params::resolve(&args, &file_cfg)?;
            run_rxtx(params).await
        }
        Commands::SaveConfig(args) => {
            let params = Params::resolve(&args, &file_cfg)?;
            let cfg = StreamConfig {
                dst_ip: Some(params.dst_ip.to_string()),
                src_ip: Some(params.src_ip.to_string()),
                udp_port: Some(params.udp_port),
                rate: args.rate,
                sessions: args.sessions,
                pacer: args.pacer.clone(),
                nic_speed: args.nic_speed,
                ebu_check: Some(params.ebu_check),
                ..Default::default()
            };
            cfg.save()?;
            tracing::info!("configuration saved");
            Ok(())
        }
    };

    // initialisation failures (bad port, no timeslot, mmap) exit 127
    if let Err(e) = result {
        tracing::error!("{e:#}");
        std::process::exit(127);
    }
    Ok(())
}

fn make_port(params: &Params, bind_port: u16) -> Result<Arc<UdpFallbackPort>> {
    let port = UdpFallbackPort::bind(
        SocketAddrV4::new(params.src_ip, bind_port),
        params.nic_speed,
    )
    .context("cannot bind the host-UDP fallback port")?;
    if st2110::streaming::net::is_multicast(params.dst_ip) {
        // join so the kernel delivers the group locally too
        let _ = port.join_multicast(params.dst_ip);
    }
    Ok(Arc::new(port))
}

fn build_tx(params: &Params, port: Arc<dyn NicPort>, clock: Arc<PtpClock>) -> Result<TxDevice> {
    let mut dev = TxDevice::create(port, clock, params.device_config(), params.fmt.vscan)?;

    for i in 0..params.sessions {
        let producer: Box<FileProducer> = match &params.video_file {
            Some(path) => Box::new(
                FileProducer::from_file(path, &params.fmt, params.buf_format)?
                    .with_limit(params.frames),
            ),
            None => Box::new(
                FileProducer::test_pattern(&params.fmt, 4).with_limit(params.frames),
            ),
        };
        let sn = dev.create_video_session(params.fmt.clone(), params.ssid + i, producer)?;
        dev.bind_video(sn.timeslot, &params.bind_addr(i as u16))?;
    }
    for i in 0..params.audio_sessions {
        let fmt = AudioFormat::new(8, 3);
        let sn = dev.create_audio_session(
            fmt,
            params.ssid + 0x100 + i,
            Box::new(TestToneProducer::new(8, 3, 16)),
        )?;
        dev.bind_audio(sn.timeslot, &params.bind_addr(0x100 + i as u16))?;
    }
    for i in 0..params.anc_sessions {
        let fmt = AncFormat::new(params.rate);
        let sn = dev.create_anc_session(
            fmt,
            params.ssid + 0x200 + i,
            Box::new(TimecodeAncProducer::new(params.frames)),
        )?;
        dev.bind_anc(sn.timeslot, &params.bind_addr(0x200 + i as u16))?;
    }
    Ok(dev)
}

fn build_rx(
    params: &Params,
    ports: Vec<Arc<dyn NicPort>>,
    clock: Arc<PtpClock>,
) -> Result<RxDevice> {
    let redundant = ports.len() > 1;
    let mut dev = RxDevice::create(ports, clock, params.device_config(), params.fmt.vscan)?;
    for i in 0..params.sessions {
        let consumer = ScratchFileConsumer::create(&format!("session{i}"), &params.fmt)?;
        let sn =
            dev.create_video_session(params.fmt.clone(), params.ssid + i, Box::new(consumer))?;
        dev.bind_video(sn.timeslot, &params.bind_addr(i as u16))?;
    }
    for i in 0..params.audio_sessions {
        let fmt = AudioFormat::new(8, 3);
        let buf_size = fmt.payload_size() * 48;
        let sn = dev.create_audio_session(
            fmt,
            params.ssid + 0x100 + i,
            buf_size,
            redundant,
            Box::new(AudioSink::new()),
        )?;
        dev.bind_audio(sn.timeslot, &params.bind_addr(0x100 + i as u16))?;
    }
    for i in 0..params.anc_sessions {
        let sn = dev.create_anc_session(
            AncFormat::new(params.rate),
            params.ssid + 0x200 + i,
            redundant,
            Box::new(AncLogger::new()),
        )?;
        dev.bind_anc(sn.timeslot, &params.bind_addr(0x200 + i as u16))?;
    }
    Ok(dev)
}

async fn run_tx(params: Params) -> Result<()> {
    let clock = PtpClock::new();
    let port = make_port(&params, 0)?;
    let ptp = PtpEngine::new(port.clone(), clock.clone(), params.ptp.clone());
    let dev = build_tx(&params, port, clock)?;
    let handle = dev.start(Some(ptp.clone()))?;
    tracing::info!("transmitting {} video session(s)", params.sessions);

    stats_loop(&handle.sessions).await;

    ptp.stop();
    handle.shutdown();
    Ok(())
}

async fn run_rx(params: Params) -> Result<()> {
    let clock = PtpClock::new();
    let port = make_port(&params, params.udp_port)?;
    let ptp = PtpEngine::new(port.clone(), clock.clone(), params.ptp.clone());
    let dyn_port: Arc<dyn NicPort> = port;
    let dev = build_rx(&params, vec![dyn_port], clock)?;
    let handle = dev.start(Some(ptp.clone()))?;
    tracing::info!("receiving {} video session(s)", params.sessions);

    stats_loop(&handle.sessions).await;

    ptp.stop();
    handle.shutdown();
    Ok(())
}

async fn run_rxtx(params: Params) -> Result<()> {
    let clock = PtpClock::new();
    let rx_port = make_port(&params, params.udp_port)?;
    let tx_port = make_port(&params, 0)?;

    let rx_dyn: Arc<dyn NicPort> = rx_port;
    let rx_dev = build_rx(&params, vec![rx_dyn], clock.clone())?;
    let rx_handle = rx_dev.start(None)?;

    let tx_dev = build_tx(&params, tx_port, clock)?;
    let tx_handle = tx_dev.start(None)?;
    tracing::info!("loop test running");

    let mut all = tx_handle.sessions.clone();
    all.extend(rx_handle.sessions.iter().cloned());
    stats_loop(&all).await;

    tx_handle.shutdown();
    rx_handle.shutdown();
    Ok(())
}

/// Housekeeping: periodic counters until ctrl-c.
async fn stats_loop(sessions: &[Arc<st2110::streaming::session::SessionShared>]) {
    let mut tick = tokio::time::interval(Duration::from_millis(100));
    let mut rounds = 0u64;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return;
            }
            _ = tick.tick() => {
                rounds += 1;
                if rounds % 10 != 0 {
                    continue;
                }
                for s in sessions {
                    let sent = s.stats.pkts_send.load(Ordering::Relaxed);
                    let recv = s.stats.pkts_recv.load(Ordering::Relaxed);
                    if sent > 0 {
                        tracing::info!(
                            "sn {} tx: pkts {} frames {}",
                            s.timeslot,
                            sent,
                            s.stats.frms_send.load(Ordering::Relaxed)
                        );
                    }
                    if recv > 0 {
                        tracing::info!(
                            "sn {} rx: pkts {} frames {} fixed {} dropped {}",
                            s.timeslot,
                            recv,
                            s.stats.frms_recv.load(Ordering::Relaxed),
                            s.stats.frms_fixed.load(Ordering::Relaxed),
                            s.stats.pkts_drop_total.load(Ordering::Relaxed)
                        );
                    }
                }
            }
        }
    }
}
