//! HJ/T212 Uplink - radiation-source telemetry uploader.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, bail};
use chrono::{Local, Timelike};
use clap::{Parser, Subcommand, ValueEnum};
use hj212_uplink as app;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use app::config::{AppConfig, ConfigLoadResult, LoggingConfig};
use app::hj212::{FrameVariant, classify, encode};
use app::models::Reading;
use app::upload::{UploadOptions, UploadService};

/// Upload radiation-source telemetry to an HJ/T212 collection server.
#[derive(Parser)]
#[command(name = "hj212-uplink", version)]
struct Cli {
    /// Use config.toml from current directory (dev mode)
    #[arg(long, global = true)]
    dev: bool,

    /// Explicit config file path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one reading and report the server's verdict
    Upload {
        #[command(flatten)]
        reading: ReadingArgs,

        /// Primary frame variant (overrides config)
        #[arg(long, value_enum)]
        variant: Option<VariantArg>,

        /// Do not retry with the alternate frame variant
        #[arg(long)]
        no_fallback: bool,

        /// Print the upload result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the encoded frame without connecting
    Frame {
        #[command(flatten)]
        reading: ReadingArgs,

        #[arg(long, value_enum, default_value = "with-length")]
        variant: VariantArg,
    },
    /// Classify captured response bytes given as hex
    Classify {
        /// Hex bytes, whitespace allowed (e.g. "43 4D 01 00 00 00 00 00 00")
        #[arg(required = true)]
        hex: Vec<String>,
    },
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args)]
struct ReadingArgs {
    /// Measured dose rate
    #[arg(long, default_value_t = 0.0)]
    dose_rate: f64,

    /// Battery voltage
    #[arg(long, default_value_t = 0.0)]
    battery: f64,

    /// Alert type code
    #[arg(long, default_value_t = 0)]
    alert_type: u8,

    /// Mark the GPS fix as invalid
    #[arg(long)]
    gps_invalid: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum VariantArg {
    WithLength,
    NoLength,
}

impl From<VariantArg> for FrameVariant {
    fn from(arg: VariantArg) -> Self {
        match arg {
            VariantArg::WithLength => FrameVariant::WithLength,
            VariantArg::NoLength => FrameVariant::NoLength,
        }
    }
}

impl ReadingArgs {
    fn to_reading(&self) -> Reading {
        let now = Local::now().naive_local();
        Reading {
            data_time: now.with_nanosecond(0).unwrap_or(now),
            dose_rate: self.dose_rate,
            battery: self.battery,
            alert_type: self.alert_type,
            gps_valid: !self.gps_invalid,
            longitude: None,
            latitude: None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Determine config path based on mode
    let config_path = match (&cli.config, cli.dev) {
        (Some(path), _) => path.clone(),
        (None, true) => PathBuf::from("config.toml"),
        (None, false) => AppConfig::default_path(),
    };

    if let Command::Init { force } = cli.command {
        return init_config(&config_path, force);
    }

    let loaded = AppConfig::try_load(&config_path);
    let logging = match &loaded {
        ConfigLoadResult::Loaded(config) => config.logging.clone(),
        _ => LoggingConfig::default(),
    };
    let _guard = init_logging(&logging)?;

    tracing::info!("HJ/T212 Uplink starting...");
    tracing::info!("Config path: {:?}", config_path);

    let config = match loaded {
        ConfigLoadResult::Loaded(config) => {
            tracing::info!("Config loaded successfully");
            config
        }
        ConfigLoadResult::Missing => {
            if matches!(cli.command, Command::Upload { .. }) {
                bail!("Config file {} not found, run `hj212-uplink init` first", config_path.display());
            }
            tracing::warn!("Config missing, using defaults");
            AppConfig::default()
        }
        ConfigLoadResult::Invalid(e) => {
            bail!("Config invalid: {e}");
        }
    };

    match cli.command {
        Command::Upload {
            reading,
            variant,
            no_fallback,
            json,
        } => {
            let service = UploadService::with_system_clock(config);
            let options = UploadOptions {
                variant: variant.map(FrameVariant::from),
                disable_fallback: no_fallback,
            };
            let result = service.upload_with(&reading.to_reading(), options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("{}", result.summary());
            }
            Ok(if result.is_accepted() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Frame { reading, variant } => {
            let service = UploadService::with_system_clock(config);
            let envelope = service.envelope_builder(&reading.to_reading())?.build();
            let frame = encode(&envelope, variant.into());
            let wire = String::from_utf8_lossy(&frame.to_bytes()).into_owned();

            println!("{}", wire.trim_end());
            println!("Length: {}, CRC: {}", frame.declared_length(), frame.checksum);
            Ok(ExitCode::SUCCESS)
        }
        Command::Classify { hex } => {
            let bytes = parse_hex(&hex.concat())?;
            println!("{}", classify(&bytes));
            Ok(ExitCode::SUCCESS)
        }
        Command::Init { force } => init_config(&config_path, force),
    }
}

/// Write the default config, refusing to clobber an existing file.
fn init_config(path: &Path, force: bool) -> anyhow::Result<ExitCode> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    AppConfig::default()
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    println!("Wrote default config to {}", path.display());
    Ok(ExitCode::SUCCESS)
}

/// Initialize logging: console always, daily rolling file when a directory is configured.
fn init_logging(logging: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let level: tracing::Level = logging.level.parse().unwrap_or(tracing::Level::INFO);
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("Failed to create log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "hj212-uplink.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    Ok(guard)
}

fn parse_hex(text: &str) -> anyhow::Result<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if !digits.is_ascii() || digits.len() % 2 != 0 {
        bail!("Hex input must be an even number of ASCII hex digits");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).with_context(|| format!("Invalid hex byte {:?}", &digits[i..i + 2]))
        })
        .collect()
}
