//! multiping - headless multi-target ping monitor.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multiping::events::{SupervisorEvent, EVENT_BUFFER};
use multiping::preset::{self, JsonFileStore};
use multiping::probe::{
    CommandInvoker, CycleInvoker, ProbeConfig, ProbeInvoker, ResultParser, TcpConnectInvoker,
    DEFAULT_FAILURE_PATTERNS, DEFAULT_TIME_MARKERS,
};
use multiping::session::{SessionContext, SessionLogger, SessionState};
use multiping::{AppConfig, SessionSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// One continuous ping process per host
    Stream,
    /// One single-shot ping per interval
    Cycle,
    /// TCP connect per interval instead of ICMP
    Tcp,
}

#[derive(Debug, Parser)]
#[command(name = "multiping", version, about = "Ping several hosts side by side")]
struct Cli {
    /// Hosts or IP addresses, one per slot
    addresses: Vec<String>,

    /// Milliseconds between probes
    #[arg(short, long, default_value_t = 500)]
    interval: u64,

    /// Probes per host; 0 runs until interrupted
    #[arg(short, long, default_value_t = 0)]
    count: u32,

    #[arg(short, long, value_enum, default_value_t = Mode::Stream)]
    mode: Mode,

    /// Port used by the tcp mode
    #[arg(long, default_value_t = 80)]
    port: u16,

    /// Load slots and settings from a saved preset
    #[arg(long, value_name = "NAME")]
    preset: Option<String>,

    /// Save the resulting slots and settings as a preset
    #[arg(long, value_name = "NAME")]
    save_preset: Option<String>,

    #[arg(long)]
    list_presets: bool,

    #[arg(long, value_name = "NAME")]
    delete_preset: Option<String>,

    /// Milliseconds between status refreshes
    #[arg(long, default_value_t = 1000)]
    refresh: u64,

    /// Extra failure phrase (regex), e.g. for a localized ping
    #[arg(long = "failure-pattern", value_name = "REGEX")]
    failure_patterns: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("multiping=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = AppConfig::load();
    let mut store = JsonFileStore::open(&cfg.preset_file)?;

    if cli.list_presets {
        for name in preset::list_presets(&store) {
            println!("{}", name);
        }
        return Ok(());
    }

    if let Some(name) = &cli.delete_preset {
        if preset::delete_preset(&mut store, name)? {
            println!("Deleted preset {}", name);
        } else {
            println!("No preset named {}", name);
        }
        return Ok(());
    }

    let parser = if cli.failure_patterns.is_empty() {
        ResultParser::default()
    } else {
        let mut patterns: Vec<String> =
            DEFAULT_FAILURE_PATTERNS.iter().map(|p| p.to_string()).collect();
        patterns.extend(cli.failure_patterns.iter().cloned());
        ResultParser::new(DEFAULT_TIME_MARKERS, &patterns)?
    };
    let parser = Arc::new(parser);

    let invoker: Arc<dyn ProbeInvoker> = match cli.mode {
        Mode::Stream => Arc::new(CommandInvoker::new()),
        Mode::Cycle => Arc::new(CycleInvoker::new().with_parser(parser.clone())),
        Mode::Tcp => Arc::new(TcpConnectInvoker::new(cli.port)),
    };

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let mut ctx = SessionContext::new(invoker, events);
    ctx.parser = parser;
    ctx.logger = Some(SessionLogger::new(&cfg.log_dir));
    ctx.stop_grace = cfg.stop_grace;
    ctx.history_lines = cfg.history_lines;

    let supervisor = Arc::new(SessionSupervisor::with_config(
        ctx,
        ProbeConfig::new(cli.interval, cli.count),
    ));

    if let Some(name) = &cli.preset {
        match preset::load_preset(&store, name) {
            Some(p) => {
                supervisor.apply_preset(&p).await;
            }
            None => tracing::warn!("No usable preset named {}", name),
        }
    }

    if !cli.addresses.is_empty() {
        supervisor.set_slot_count(cli.addresses.len()).await;
        for (i, address) in cli.addresses.iter().enumerate() {
            supervisor.set_address(i + 1, address).await?;
        }
        if cli.preset.is_some() {
            supervisor
                .set_probe_config(ProbeConfig::new(cli.interval, cli.count))
                .await;
        }
    }

    if supervisor.slot_count().await == 0 {
        return Err("no addresses given; pass hosts or --preset".into());
    }

    if let Some(name) = &cli.save_preset {
        let captured = supervisor.capture_preset(name).await;
        preset::save_preset(&mut store, &captured)?;
    }

    tracing::info!(
        "Monitoring {} slots, logs under {}",
        supervisor.slot_count().await,
        cfg.log_dir.display()
    );

    tokio::spawn(report_events(supervisor.subscribe()));

    for (slot, e) in supervisor.start_all().await {
        tracing::error!(slot, "Failed to start: {}", e);
    }

    let mut refresh = tokio::time::interval(Duration::from_millis(cli.refresh.max(100)));
    refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping all sessions");
                break;
            }
            _ = refresh.tick() => {
                let snapshots = supervisor.snapshots().await;
                for snapshot in &snapshots {
                    println!("{}", snapshot);
                }
                let active = snapshots
                    .iter()
                    .any(|s| matches!(s.state, SessionState::Running | SessionState::Stopping));
                if !active {
                    break;
                }
            }
        }
    }

    for (slot, e) in supervisor.stop_all().await {
        tracing::warn!(slot, "{}", e);
    }
    for snapshot in supervisor.snapshots().await {
        println!("{}", snapshot);
    }

    Ok(())
}

/// Surface failures that would otherwise only show up in a status line.
async fn report_events(mut events: broadcast::Receiver<SupervisorEvent>) {
    loop {
        match events.recv().await {
            Ok(SupervisorEvent::InvocationFailed { slot, error }) => {
                eprintln!("Ping {}: {}", slot, error);
            }
            Ok(SupervisorEvent::ReleaseTimeout { slot }) => {
                eprintln!("Ping {}: probe did not shut down cleanly", slot);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
