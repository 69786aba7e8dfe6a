//! CLI entry point for kepco-list
//!
//! Provides command-line access to:
//! - Subnet discovery (`scan`)
//! - Device identification (`idn`)
//! - Waveform upload and playback (`upload`)
//! - Stopping a running list (`stop`) and forcing the output safe (`interlock`)
//!
//! Every subcommand that talks to a device ends with the interlock
//! (`VOLT 0`, `CURR 0`, `OUTP OFF`), including on error and Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! kepco-list scan --subnet 192.168.1.0
//! kepco-list upload --host 192.168.1.50 --shape sine --frequency 10 --amplitude 2 --run
//! kepco-list upload --host 192.168.1.50 --samples profile.txt --dwell-us 1000
//! kepco-list interlock --host 192.168.1.50
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kepco_list::discovery::Scanner;
use kepco_list::limits::{MAX_CHUNK_POINTS, TELNET_PORT};
use kepco_list::upload::ListMode;
use kepco_list::waveform::{from_samples, DwellPolicy, Shape, Waveform};
use kepco_list::{logging, DeviceEndpoint, KepcoError, ProtocolMode, Session, SessionConfig, Settings};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kepco-list")]
#[command(about = "Verified LIST uploads for Kepco BIT 802E power supplies", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(long, global = true, default_value = kepco_list::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan a /24 subnet for devices
    Scan {
        /// Any address in the subnet (defaults to this host's)
        #[arg(long)]
        subnet: Option<Ipv4Addr>,
    },

    /// Print the device identity
    Idn(Target),

    /// Upload a waveform, optionally running it
    Upload {
        #[command(flatten)]
        target: Target,

        #[command(flatten)]
        source: Source,

        /// Quantity the list drives
        #[arg(long, value_enum, default_value_t = ListArg::Volt)]
        list: ListArg,

        /// Start playback after a successful upload
        #[arg(long)]
        run: bool,

        /// Repeat playback until Ctrl+C
        #[arg(long = "loop", requires = "run")]
        looping: bool,
    },

    /// Stop list playback
    Stop(Target),

    /// Zero both setpoints and disable the output
    Interlock(Target),
}

#[derive(Args, Clone)]
struct Target {
    /// Device address
    #[arg(long)]
    host: IpAddr,

    /// Port (tries 5024 then 5025 when omitted)
    #[arg(long)]
    port: Option<u16>,

    /// Framing for an explicit port
    #[arg(long, value_enum, requires = "port")]
    mode: Option<ModeArg>,
}

#[derive(Args)]
struct Source {
    /// Generated shape
    #[arg(long, conflicts_with = "samples")]
    shape: Option<Shape>,

    /// Frequency of the generated period in Hz
    #[arg(long, default_value_t = 1.0)]
    frequency: f64,

    /// Requested points per period
    #[arg(long, default_value_t = MAX_CHUNK_POINTS)]
    points: usize,

    /// Peak amplitude
    #[arg(long, default_value_t = 1.0)]
    amplitude: f64,

    /// DC offset
    #[arg(long, default_value_t = 0.0)]
    offset: f64,

    /// File with one value per line (`#` starts a comment)
    #[arg(long)]
    samples: Option<PathBuf>,

    /// Dwell per imported sample in microseconds
    #[arg(long, default_value_t = 1000)]
    dwell_us: u64,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Line,
    Raw,
}

impl From<ModeArg> for ProtocolMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Line => ProtocolMode::Line,
            ModeArg::Raw => ProtocolMode::Raw,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ListArg {
    Volt,
    Curr,
}

impl From<ListArg> for ListMode {
    fn from(list: ListArg) -> Self {
        match list {
            ListArg::Volt => ListMode::Voltage,
            ListArg::Curr => ListMode::Current,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        settings.application.log_level = level;
    }
    settings.validate().map_err(anyhow::Error::msg)?;
    logging::init_from_settings(&settings).map_err(anyhow::Error::msg)?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, shutting down");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Scan { subnet } => scan(&settings, subnet, &cancel).await,
        Commands::Idn(target) => {
            with_session(&settings, &target, |session| {
                Box::pin(async move {
                    let idn = session.channel()?.identity().await?;
                    println!("{}", idn);
                    Ok(())
                })
            })
            .await
        }
        Commands::Upload {
            target,
            source,
            list,
            run,
            looping,
        } => {
            let waveform = build_waveform(&source)?;
            let mut config = settings.session_config();
            config.upload.mode = list.into();
            upload(config, &target, waveform, run, looping, &cancel).await
        }
        Commands::Stop(target) => {
            with_session(&settings, &target, |session| {
                Box::pin(async move {
                    session.stop().await?;
                    println!("stopped");
                    Ok(())
                })
            })
            .await
        }
        Commands::Interlock(target) => {
            // Disconnecting is the interlock.
            let session = open(settings.session_config(), &target).await?;
            finish(session).await?;
            println!("output disabled");
            Ok(())
        }
    }
}

async fn scan(settings: &Settings, subnet: Option<Ipv4Addr>, cancel: &CancellationToken) -> Result<()> {
    let base = match subnet {
        Some(base) => base,
        None => local_ipv4().await.context("cannot determine local subnet, pass --subnet")?,
    };
    println!("Scanning {}/24 ...", base);

    let found = Scanner::new(base, settings.discovery_config()).collect(cancel).await;
    if found.is_empty() {
        println!("No devices found");
    }
    for endpoint in found {
        println!(
            "{}  {:?}  {}",
            endpoint,
            endpoint.latency,
            endpoint.identity.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn upload(
    config: SessionConfig,
    target: &Target,
    waveform: Waveform,
    run: bool,
    looping: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut session = open(config, target).await?;
    let outcome = upload_and_run(&mut session, &waveform, run, looping, cancel).await;
    finish(session).await?;
    outcome
}

async fn upload_and_run(
    session: &mut Session,
    waveform: &Waveform,
    run: bool,
    looping: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    println!(
        "Uploading {} points ({:?} per period)",
        waveform.len(),
        waveform.total_duration()
    );
    let result = session.prepare_and_upload(waveform, cancel).await?;
    let result = result.into_result()?;
    println!(
        "Verified {} points in {} chunk(s)",
        result.points_verified, result.chunks_sent
    );

    if !run {
        return Ok(());
    }

    let single_chunk = waveform.len() <= session.config().upload.chunk_size;
    match session.run(looping, cancel).await {
        Ok(()) => {}
        Err(KepcoError::Cancelled) if looping => {
            session.stop().await?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    // A single-chunk list plays on the device after `run` returns.
    if single_chunk {
        println!("List running");
        let playback = waveform.total_duration() + session.config().run_margin;
        tokio::select! {
            _ = tokio::time::sleep(playback), if !looping => {}
            _ = cancel.cancelled() => {}
        }
        session.stop().await?;
    }
    Ok(())
}

async fn with_session<F>(settings: &Settings, target: &Target, f: F) -> Result<()>
where
    F: for<'s> FnOnce(&'s mut Session) -> futures::future::BoxFuture<'s, kepco_list::AppResult<()>>,
{
    let mut session = open(settings.session_config(), target).await?;
    let outcome = f(&mut session).await;
    finish(session).await?;
    Ok(outcome?)
}

async fn open(config: SessionConfig, target: &Target) -> Result<Session> {
    let session = match target.port {
        Some(port) => {
            let mode = target.mode.map_or_else(
                || {
                    if port == TELNET_PORT {
                        ProtocolMode::Line
                    } else {
                        ProtocolMode::Raw
                    }
                },
                ProtocolMode::from,
            );
            Session::connect(&DeviceEndpoint::new(target.host, port, mode), config).await?
        }
        None => Session::connect_host(&target.host.to_string(), config).await?,
    };
    Ok(session)
}

async fn finish(mut session: Session) -> Result<()> {
    let report = session.disconnect().await;
    if !report.is_clean() {
        bail!("interlock incomplete: {:?}", report.failed);
    }
    Ok(())
}

fn build_waveform(source: &Source) -> Result<Waveform> {
    if let Some(path) = &source.samples {
        let values = read_samples(path)?;
        let import = from_samples(&values, DwellPolicy::Uniform(Duration::from_micros(source.dwell_us)))?;
        if import.truncated {
            println!(
                "Sample file has {} values, only the first {} are used",
                import.original_len,
                import.waveform.len()
            );
        }
        return Ok(import.waveform);
    }

    let shape = source.shape.unwrap_or(Shape::Sine);
    let (waveform, timing) = Waveform::periodic(
        shape,
        source.frequency,
        source.points,
        source.amplitude,
        source.offset,
    )?;
    for warning in &timing.warnings {
        println!("note: {}", warning);
    }
    Ok(waveform)
}

fn read_samples(path: &Path) -> Result<Vec<f64>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    text.lines()
        .enumerate()
        .map(|(n, line)| (n, line.split('#').next().unwrap_or("").trim()))
        .filter(|(_, line)| !line.is_empty())
        .map(|(n, line)| {
            line.parse::<f64>()
                .with_context(|| format!("{}:{}: not a number: {}", path.display(), n + 1, line))
        })
        .collect()
}

/// Address of the interface that routes to the outside world.
async fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = tokio::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).await?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
        other => bail!("no IPv4 route (local address {})", other),
    }
}
