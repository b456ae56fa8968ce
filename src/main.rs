use anyhow::{Context, Result, bail};
use chrono::NaiveDateTime;
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use fs5000::{
    AlertMode, DoseUnit, Fs5000, Fs5000Service, Language, MockTransport, PowerMode, RateUnit, ServiceConfig,
    SessionConfig, Transport, discovery,
};
use std::fs::File;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Command line tool for the FS5000 radiation dose meter.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial port of the meter. Found by USB id when omitted.
    #[arg(short, long, env = "FS5000_PORT", global = true)]
    port: Option<String>,
    /// Talk to a simulated meter instead of real hardware.
    #[arg(long, env = "FS5000_USE_MOCK", global = true, action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    mock: bool,
    /// Per-read timeout in milliseconds.
    #[arg(long, default_value_t = 2000, global = true)]
    timeout_ms: u64,
    /// Also write logs to this file.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Keep the meter streaming and print every relayed sample as JSON.
    Serve {
        /// Delay before restarting after a link failure, in milliseconds.
        #[arg(long, default_value_t = 1000)]
        retry_ms: u64,
        /// Interval between status log lines, in seconds.
        #[arg(long, default_value_t = 30)]
        status_secs: u64,
    },
    /// Print live samples as `timestamp;NAME:VALUE;...` lines.
    Read {
        /// Stop after this many samples.
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
    /// Set the meter clock (`YYYY-MM-DD HH:MM:SS`, default now).
    SetTime { time: Option<String> },
    /// Show the accumulated dose.
    GetDose,
    /// Show the firmware version.
    Version,
    /// Reset the accumulated dose.
    ClearDose,
    /// Dump the alarm history.
    Alarms {
        /// Print records as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Dump the dose history.
    DoseLog,
    /// Dump the dose-rate history.
    RateLog,
    /// Set the dose-rate alarm threshold, e.g. `2.50 uSvh`.
    SetRateLimit {
        value: String,
        #[arg(default_value = "uSvh")]
        unit: RateUnit,
    },
    /// Set the accumulated-dose alarm threshold, e.g. `0.50 mSv`.
    SetDoseLimit {
        value: String,
        #[arg(default_value = "uSv")]
        unit: DoseUnit,
    },
    /// Choose alarm signals: a comma list of lamp, sound, vibrate, click, or `none`.
    SetAlert { mode: AlertMode },
    /// Screen brightness (0-5) and screen-off timeout in seconds (0-9999).
    SetDisplay { brightness: u8, timeout: u16 },
    /// `normal` or `long-endurance`.
    SetMode { mode: PowerMode },
    /// `english` or `chinese`.
    SetLanguage { language: Language },
    /// Show the timed-dose period.
    GetDuration,
    /// Set the timed-dose period in seconds.
    SetDuration { seconds: u32 },
    /// List serial ports and mark the ones that look like an FS5000.
    ListPorts,
}

fn setup_logging(log_file_path: Option<&PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);

    let (file_layer, guard) = if let Some(path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {path:?}"))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.as_ref(), &cli.verbose)?;

    if let Err(e) = run(cli).await {
        error!("{e:?}");
        process::exit(1);
    }
    Ok(())
}

/// Where to find the meter and how to talk to it.
struct Target {
    port: Option<String>,
    mock: bool,
    config: SessionConfig,
}

impl Target {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            port: cli.port.clone(),
            mock: cli.mock,
            config: SessionConfig {
                read_timeout: Duration::from_millis(cli.timeout_ms),
                ..SessionConfig::default()
            },
        }
    }

    async fn connect(self) -> Result<Fs5000> {
        if self.mock {
            warn!("Using a simulated FS5000");
            let transport: Box<dyn Transport> = Box::new(MockTransport::new());
            return Ok(Fs5000::with_config(transport, self.config));
        }
        Fs5000::open(self.port.as_deref(), self.config)
            .await
            .context("Failed to connect to the FS5000")
    }
}

async fn run(cli: Cli) -> Result<()> {
    let target = Target::from_cli(&cli);
    match cli.command {
        Commands::ListPorts => list_ports(),
        Commands::Serve { retry_ms, status_secs } => {
            let config = ServiceConfig {
                retry_delay: Duration::from_millis(retry_ms),
                ..ServiceConfig::default()
            };
            serve(target.connect().await?, config, Duration::from_secs(status_secs.max(1))).await
        }
        Commands::Read { count } => read(target.connect().await?, count).await,
        command => {
            let mut device = target.connect().await?;
            execute(&mut device, command).await?;
            device.close().await?;
            Ok(())
        }
    }
}

/// Run a single request/response command.
async fn execute(device: &mut Fs5000, command: Commands) -> Result<()> {
    match command {
        Commands::SetTime { time } => {
            let time = time
                .map(|t| NaiveDateTime::parse_from_str(&t, "%Y-%m-%d %H:%M:%S"))
                .transpose()
                .context("Time must look like 2025-08-13 14:22:10")?;
            device.set_time(time).await?;
        }
        Commands::GetDose => {
            let reading = device.get_dose().await?;
            println!("{:.2} μSv since {}", reading.dose_usv, reading.since);
        }
        Commands::Version => {
            let version = device.get_version().await?;
            println!("{}", version.fields.join(" "));
        }
        Commands::ClearDose => {
            let at = device.clear_dose().await?;
            println!("Dose cleared at {at}");
        }
        Commands::Alarms { json } => {
            for alarm in device.read_alarms().await? {
                if json {
                    println!("{}", serde_json::to_string(&alarm)?);
                } else {
                    println!("{alarm}");
                }
            }
        }
        Commands::DoseLog => {
            for record in device.read_dose_log().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::RateLog => {
            for record in device.read_rate_log().await? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Commands::SetRateLimit { value, unit } => device.set_rate_limit(&value, unit).await?,
        Commands::SetDoseLimit { value, unit } => device.set_dose_limit(&value, unit).await?,
        Commands::SetAlert { mode } => device.set_alert(mode).await?,
        Commands::SetDisplay { brightness, timeout } => device.set_display(brightness, timeout).await?,
        Commands::SetMode { mode } => device.set_mode(mode).await?,
        Commands::SetLanguage { language } => device.set_language(language).await?,
        Commands::GetDuration => {
            let seconds = device.get_timer_duration().await?;
            println!("{seconds} s");
        }
        Commands::SetDuration { seconds } => device.set_timer_duration(seconds).await?,
        Commands::Serve { .. } | Commands::Read { .. } | Commands::ListPorts => {
            bail!("{command:?} is not a single exchange")
        }
    }
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = discovery::list_ports()?;
    if ports.is_empty() {
        info!("No serial ports found.");
    }
    for port in ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!("{vid:04x}:{pid:04x}"),
            _ => "-".to_string(),
        };
        let marker = if port.is_fs5000 { "  <- FS5000" } else { "" };
        println!(
            "{:<20} {ids:<10} {}{marker}",
            port.name,
            port.product.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn read(device: Fs5000, count: Option<u64>) -> Result<()> {
    let mut stream = device.into_stream();
    let mut seen = 0u64;
    let mut failure = None;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, stopping continuous read.");
                break;
            }
            item = stream.next() => match item {
                Some(Ok(sample)) => {
                    println!("{sample}");
                    seen += 1;
                    if count.is_some_and(|n| seen >= n) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }
    }
    let device = stream.close().await.context("Failed to stop continuous read")?;
    device.close().await?;
    match failure {
        Some(e) => Err(e).context("Continuous read failed"),
        None => Ok(()),
    }
}

async fn serve(device: Fs5000, config: ServiceConfig, status_every: Duration) -> Result<()> {
    let service = Fs5000Service::spawn(device, config);
    let mut subscription = service.subscribe();
    let mut ticker = tokio::time::interval(status_every);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down gracefully.");
                break;
            }
            sample = subscription.recv() => match sample {
                Some(sample) => println!("{}", serde_json::to_string(&*sample)?),
                None => break,
            },
            _ = ticker.tick() => {
                let status = service.status();
                info!(
                    link = %status.link,
                    samples = status.samples,
                    recoveries = status.recoveries,
                    subscribers = status.subscribers,
                    last_error = status.last_error.as_deref().unwrap_or("-"),
                    "Service status"
                );
            }
        }
    }

    let device = service.shutdown().await?;
    device.close().await?;
    Ok(())
}
