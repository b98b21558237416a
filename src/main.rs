//! convoy CLI - Host-side test invocation orchestrator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use convoy::config::{self, RunMode};
use convoy::delegate::{connect_reporter, report_port_from_env, StreamingListener, DONE_MARKER};
use convoy::invoker::{StopHandle, StubDeviceAllocator, TestInvocation};
use convoy::results::{ConsoleListener, JunitListener, ListenerSet};

#[derive(Parser)]
#[command(name = "convoy")]
#[command(about = "Host-side test invocation orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "convoy.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an invocation
    Run {
        /// Write result events to numbered files in this directory instead
        /// of the console. Used when running as a remote delegation worker.
        #[arg(long)]
        event_dir: Option<PathBuf>,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { event_dir } => run_invocation(&cli.config, event_dir, cli.verbose).await,
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

async fn run_invocation(
    config_path: &Path,
    event_dir: Option<PathBuf>,
    verbose: bool,
) -> Result<()> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let file = config::load_config_str(&content)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Loaded configuration from {}", config_path.display());

    let mut configuration = config::build_configuration(&file);
    configuration.source = Some(content);
    configuration.command_line = Some(std::env::args().collect::<Vec<_>>().join(" "));

    let stop = StopHandle::default();
    let ctrl_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_stop.request_stop("interrupted by user");
        }
    });

    // When a parent process delegated to us, every result goes out over the
    // socket it opened instead of the local console.
    if let Some(port) = report_port_from_env() {
        let reporter = connect_reporter(port)
            .await
            .with_context(|| format!("Failed to connect result stream on port {}", port))?;
        let listeners = ListenerSet::new().with_listener(reporter);

        let invocation = TestInvocation::new(configuration, stop);
        let exit = invocation.invoke(&StubDeviceAllocator, listeners).await;
        std::process::exit(exit as i32);
    }

    // Remote delegation workers write their events to numbered files that
    // the delegating host pulls back, then touch the done marker.
    if let Some(dir) = event_dir {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create event dir {}", dir.display()))?;
        let events = tokio::fs::File::create(dir.join("events_0.bin"))
            .await
            .context("Failed to create event file")?;
        let listeners = ListenerSet::new().with_listener(StreamingListener::new(events));

        let invocation = TestInvocation::new(configuration, stop);
        let exit = invocation.invoke(&StubDeviceAllocator, listeners).await;
        std::fs::write(dir.join(DONE_MARKER), b"")
            .context("Failed to write done marker")?;
        std::process::exit(exit as i32);
    }

    let listeners = create_listeners(&file, verbose)?;
    let invocation = TestInvocation::new(configuration, stop);
    let exit = invocation.invoke(&StubDeviceAllocator, listeners).await;
    std::process::exit(exit as i32);
}

fn create_listeners(file: &config::ConfigFile, verbose: bool) -> Result<ListenerSet> {
    let mut listeners = ListenerSet::new().with_listener(ConsoleListener::new(verbose));

    if file.report.junit {
        std::fs::create_dir_all(&file.report.output_dir).with_context(|| {
            format!(
                "Failed to create report dir {}",
                file.report.output_dir.display()
            )
        })?;
        let junit_path = file.report.output_dir.join(&file.report.junit_file);
        listeners = listeners.with_listener(JunitListener::new(junit_path));
    }

    Ok(listeners)
}

fn validate_config(config_path: &Path) -> Result<()> {
    match config::load_config(config_path) {
        Ok(file) => {
            println!("Configuration is valid!");
            println!();
            println!("Settings:");
            println!("  Test tag: {}", file.invocation.test_tag);
            println!("  Tests: {}", file.tests.len());
            println!("  Max attempts: {}", file.retry.max_attempts);

            let mode = match file.delegation.mode {
                RunMode::Regular => "regular",
                RunMode::Subprocess => "subprocess",
                RunMode::Remote => "remote",
            };
            println!("  Run mode: {}", mode);

            if let Some(count) = file.invocation.shard_count {
                match file.invocation.shard_index {
                    Some(index) => println!("  Shard: {} of {}", index, count),
                    None => println!("  Shards: {}", count),
                }
            }

            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

fn init_config() -> Result<()> {
    let config = r#"# convoy configuration file

[invocation]
test_tag = "smoke"
bugreport_on_failure = true

[retry]
strategy = "retry_until_pass"
max_attempts = 3

[report]
output_dir = "invocation-results"
junit = true
junit_file = "junit.xml"

[[tests]]
name = "smoke"

[tests.cases]
hello = "echo hello"
"#;

    let path = PathBuf::from("convoy.toml");
    if path.exists() {
        eprintln!("convoy.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, config)?;
    println!("Created convoy.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  convoy run");

    Ok(())
}
