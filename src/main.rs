use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use wastescan::app::{manual_scan_failure, render_prediction};
use wastescan::{ScannerApp, ShutdownReason, WastescanConfig};

#[derive(Parser, Debug)]
#[command(name = "wastescan")]
#[command(about = "Live waste classification from a camera feed")]
#[command(version)]
#[command(long_about = "Captures stills from a camera, classifies them as biodegradable, \
non-biodegradable or toxic with a remote service, a local ONNX model or a sandboxed runtime, \
and prints disposal advice. Scanning runs as a rate-limited loop or as single manual scans.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wastescan.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the scanner")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<String>,

    /// Run a single scan, print the result and exit
    #[arg(long)]
    once: bool,

    /// Enable terminal key bindings (SPACE scan, s start/stop, r retry, q quit)
    #[arg(short, long)]
    keyboard: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    let log_guard = init_logging(&args)?;

    info!("Starting wastescan v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let mut config = match WastescanConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        if args.validate_config {
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
        return Err(e.into());
    }
    if args.validate_config {
        println!("✓ Configuration is valid");
        return Ok(());
    }

    if args.once {
        config.scan.auto_start = false;
        let exit_code = scan_once(config).await?;
        drop(log_guard);
        std::process::exit(exit_code);
    }

    let mut app = ScannerApp::new(config).map_err(|e| {
        error!("Failed to build scanner: {}", e);
        e
    })?;
    app.set_keyboard_enabled(args.keyboard);

    app.initialize().await.map_err(|e| {
        error!("Failed to initialize scanner: {}", e);
        e
    })?;

    let exit_code = app.run().await.map_err(|e| {
        error!("Scanner error during execution: {}", e);
        e
    })?;

    info!("Wastescan exited with code: {}", exit_code);
    // Flush the file appender; `exit` skips destructors
    drop(log_guard);
    std::process::exit(exit_code);
}

async fn scan_once(config: WastescanConfig) -> Result<i32> {
    let mut app = ScannerApp::new(config)?;
    app.initialize().await?;

    let result = app.run_once().await;
    let reason = match &result {
        Ok(_) => ShutdownReason::UserRequest,
        Err(e) => ShutdownReason::Error(e.to_string()),
    };
    let exit_code = app.shutdown(reason).await?;

    match result {
        Ok(prediction) => println!("{}", render_prediction(&prediction)),
        Err(e) => eprintln!("✗ {}", manual_scan_failure(&e)),
    }
    Ok(exit_code)
}

fn init_logging(args: &Args) -> Result<Option<WorkerGuard>> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("wastescan={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    let (file_layer, guard) = match &args.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "wastescan.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(file_layer)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}

fn print_default_config() -> Result<()> {
    println!("# Wastescan Configuration File");
    println!("# Defaults for every option; environment overrides use WASTESCAN_<SECTION>__<KEY>");
    println!();
    println!("{}", toml::to_string_pretty(&WastescanConfig::default())?);
    Ok(())
}
