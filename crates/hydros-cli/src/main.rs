//! `hydros-cli` – Hydros operator console
//!
//! This binary is the entry point for a grow unit's control engine.  It:
//!
//! 1. Initialises tracing (optionally exporting spans over OTLP).
//! 2. Loads `~/.hydros/config.toml`, writing defaults on first run.
//! 3. Opens the SQLite database and provisions the stock control set.
//! 4. Drops the operator into an interactive console.
//! 5. Intercepts **Ctrl-C** to run an emergency stop before exiting.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{error, info, warn};

use hydros_kernel::{ControlOrchestrator, InterlockEvaluator};
use hydros_memory::{Database, SqliteControlLog, SqliteControlStore, SqliteSensorHistory};
use hydros_middleware::{EventBus, Topic};
use hydros_registry::{ControlRegistry, Provisioning};

fn main() {
    let _telemetry = telemetry::init_tracing("hydros");

    print_banner();

    let cfg = load_or_create_config();

    // Created after tracing so the simple OTLP exporter needs no runtime.
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start Tokio runtime");
            std::process::exit(1);
        }
    };

    let console = match runtime.block_on(boot(&cfg, runtime.handle().clone())) {
        Ok(console) => console,
        Err(e) => {
            println!("{}: {}", "Startup failed".red().bold(), e);
            std::process::exit(1);
        }
    };

    runtime.spawn(watch_safety_alerts(console.bus.clone()));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let orchestrator = console.orchestrator.clone();
    let handle = runtime.handle().clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – running emergency stop …".yellow().bold());
        match handle.block_on(orchestrator.emergency_stop()) {
            Ok(report) => repl::print_emergency_report(&report),
            Err(e) => println!("{}: {}", "Emergency stop failed".red().bold(), e),
        }
        println!("{}", "  ✓ Exiting Hydros.".green());
        std::process::exit(130);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will not trigger an emergency stop");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&console, shutdown);
}

/// Open storage, provision controls and wire the orchestrator.
async fn boot(cfg: &config::Config, runtime: tokio::runtime::Handle) -> Result<repl::Console, String> {
    if let Some(parent) = cfg.database_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    print!("  Opening {} … ", cfg.database_path.display().to_string().bold());
    std::io::stdout().flush().ok();
    let db = Database::open(&cfg.database_path)
        .map_err(|e| e.to_string())?
        .with_timeout(cfg.storage_timeout());
    println!("{}", "OK".green());

    let registry = ControlRegistry::new(Arc::new(SqliteControlStore::new(db.clone())))
        .with_timeouts(cfg.lock_timeout(), cfg.storage_timeout());
    let created = Provisioning::builder()
        .with_stock_controls()
        .apply(&registry)
        .await
        .map_err(|e| e.to_string())?;
    if created > 0 {
        println!("  Provisioned {} control(s)", created.to_string().bold());
    }

    let history = SqliteSensorHistory::new(db.clone());
    let bus = EventBus::new(cfg.bus_capacity());
    let orchestrator = ControlOrchestrator::new(
        registry,
        Arc::new(SqliteControlLog::new(db)),
        Arc::new(history.clone()),
    )
    .with_evaluator(InterlockEvaluator::standard(cfg.interlock()))
    .with_config(cfg.orchestrator())
    .with_event_bus(bus.clone());

    info!(
        database = %cfg.database_path.display(),
        min_water_level = cfg.min_water_level,
        require_sensor_reading = cfg.require_sensor_reading,
        "control engine ready"
    );

    Ok(repl::Console {
        orchestrator,
        history,
        bus,
        runtime,
    })
}

/// Trace every safety alert, whoever caused it.
async fn watch_safety_alerts(bus: EventBus) {
    let mut alerts = bus.subscribe_to(Topic::SafetyAlerts);
    loop {
        match alerts.recv().await {
            Ok(event) => info!(source = %event.source, payload = ?event.payload, "safety alert"),
            // The receiver already traced the gap.
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn load_or_create_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   __ __        __         "#.bold().green());
    println!("{}", r#"  / // /_ _____/ /______  ___"#.bold().green());
    println!("{}", r#" / _  / // / _  / __/ _ \(_-<"#.bold().green());
    println!("{}", r#"/_//_/\_, /\_,_/_/  \___/___/"#.bold().green());
    println!("{}", r#"     /___/                   "#.bold().green());
    println!();
    println!(
        "  {} {}",
        "Hydros".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Hydroponic actuator control & safety interlocks");
    println!();
}
