//! REPL – operator console for the Hydros control engine.
//!
//! Supported slash-commands:
//!   /help                     – show this list
//!   /status                   – every control with state, mode and lock
//!   /sensors                  – latest sensor reading
//!   /reading key=value …      – record a manual sensor reading
//!   /on <name> | /off <name>  – toggle a control
//!   /mode <manual|auto|schedule>
//!   /lock <name> [reason] | /unlock <name>
//!   /set <name> key=value …   – merge control settings
//!   /log [n]                  – recent control log entries
//!   /estop                    – emergency stop
//!   /quit | /exit             – leave the console

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use hydros_kernel::{ControlOrchestrator, EmergencyStopReport, ToggleOutcome};
use hydros_memory::SqliteSensorHistory;
use hydros_middleware::EventBus;
use hydros_types::{
    Control, ControlMode, Event, EventPayload, HydroError, SensorSnapshot, SettingValue, Settings,
    Trigger,
};
use tokio::runtime::Handle;
use tracing::debug;

const DEFAULT_LOG_LINES: usize = 10;

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Sensors,
    Reading(Vec<(String, f64)>),
    Toggle { name: String, on: bool },
    Mode(ControlMode),
    Lock { name: String, reason: Option<String> },
    Unlock(String),
    Set { name: String, settings: Settings },
    Log(usize),
    EmergencyStop,
    Quit,
}

/// Parse one input line.  `Err` carries an operator-facing message.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".into());
    };
    let rest: Vec<&str> = words.collect();

    match head {
        "/help" => Ok(Command::Help),
        "/status" => Ok(Command::Status),
        "/sensors" => Ok(Command::Sensors),
        "/reading" => {
            let pairs = parse_pairs(&rest)?;
            let mut readings = Vec::with_capacity(pairs.len());
            for (key, raw) in pairs {
                if !SensorSnapshot::FIELDS.contains(&key.as_str()) {
                    return Err(format!(
                        "unknown sensor field '{key}' (one of: {})",
                        SensorSnapshot::FIELDS.join(", ")
                    ));
                }
                let value = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| format!("'{raw}' is not a finite number"))?;
                readings.push((key, value));
            }
            Ok(Command::Reading(readings))
        }
        "/on" | "/off" => Ok(Command::Toggle {
            name: single_name(head, &rest)?,
            on: head == "/on",
        }),
        "/mode" => match rest.as_slice() {
            [mode] => mode.parse().map(Command::Mode).map_err(|e: HydroError| e.to_string()),
            _ => Err("usage: /mode <manual|auto|schedule>".into()),
        },
        "/lock" => match rest.split_first() {
            Some((name, reason)) => Ok(Command::Lock {
                name: name.to_string(),
                reason: (!reason.is_empty()).then(|| reason.join(" ")),
            }),
            None => Err("usage: /lock <name> [reason]".into()),
        },
        "/unlock" => single_name(head, &rest).map(Command::Unlock),
        "/set" => match rest.split_first() {
            Some((name, pairs)) => {
                let settings: Settings = parse_pairs(pairs)?
                    .into_iter()
                    .map(|(k, v)| (k, SettingValue::parse(&v)))
                    .collect();
                Ok(Command::Set {
                    name: name.to_string(),
                    settings,
                })
            }
            None => Err("usage: /set <name> key=value …".into()),
        },
        "/log" => match rest.as_slice() {
            [] => Ok(Command::Log(DEFAULT_LOG_LINES)),
            [n] => n
                .parse()
                .map(Command::Log)
                .map_err(|_| format!("'{n}' is not a count")),
            _ => Err("usage: /log [n]".into()),
        },
        "/estop" => Ok(Command::EmergencyStop),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

fn single_name(head: &str, rest: &[&str]) -> Result<String, String> {
    match rest {
        [name] => Ok(name.to_string()),
        _ => Err(format!("usage: {head} <name>")),
    }
}

fn parse_pairs(words: &[&str]) -> Result<Vec<(String, String)>, String> {
    if words.is_empty() {
        return Err("expected at least one key=value pair".into());
    }
    words
        .iter()
        .map(|w| match w.split_once('=') {
            Some((k, v)) if !k.is_empty() && !v.is_empty() => Ok((k.to_string(), v.to_string())),
            _ => Err(format!("'{w}' is not key=value")),
        })
        .collect()
}

/// Everything the console drives.
pub struct Console {
    pub orchestrator: ControlOrchestrator,
    pub history: SqliteSensorHistory,
    pub bus: EventBus,
    pub runtime: Handle,
}

/// Run the console until `/quit`, EOF, or `shutdown` is set.
pub fn run(console: &Console, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "hydros>".bold().green());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_command(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(Command::Help) => cmd_help(),
            Ok(cmd) => {
                if let Err(e) = console.runtime.block_on(console.execute(cmd)) {
                    println!("{} {}", "✗".red().bold(), e.to_string().red());
                }
            }
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "Hydros Commands".bold().underline());
    let rows = [
        ("/status", "all controls"),
        ("/sensors", "latest sensor reading"),
        ("/reading key=value …", "record a manual reading (e.g. water_level=40 ph=6.1)"),
        ("/on <name>  /off <name>", "switch a control"),
        ("/mode <manual|auto|schedule>", "set the mode of every control"),
        ("/lock <name> [reason]", "block a control from switching on"),
        ("/unlock <name>", "clear a lock"),
        ("/set <name> key=value …", "update control settings"),
        ("/log [n]", "recent control log entries"),
        ("/estop", "emergency stop: switch everything off"),
        ("/quit  /exit", "exit the console"),
    ];
    for (cmd, what) in rows {
        println!("  {:<30} {}", cmd.bold().cyan(), what);
    }
    println!();
}

impl Console {
    async fn execute(&self, cmd: Command) -> Result<(), HydroError> {
        match cmd {
            Command::Status => {
                let controls = self.orchestrator.controls().await?;
                println!("{}", "Controls".bold().underline());
                for c in &controls {
                    print_control(c);
                }
            }
            Command::Sensors => match self.orchestrator.latest_sensor().await? {
                Some(s) => print_snapshot(&s),
                None => println!("  {}", "no sensor reading recorded".dimmed()),
            },
            Command::Reading(values) => {
                let mut snapshot = SensorSnapshot::new();
                for (field, value) in &values {
                    snapshot.set(field, *value)?;
                }
                self.history.record(&snapshot).await?;
                if let Err(e) = self.bus.publish(Event::new(
                    "hydros-cli",
                    EventPayload::SensorReading(snapshot.clone()),
                )) {
                    debug!(error = %e, "sensor reading not delivered");
                }
                println!("{} reading recorded", "✓".green().bold());
                print_snapshot(&snapshot);
            }
            Command::Toggle { name, on } => {
                match self.orchestrator.toggle(&name, on, Trigger::Manual).await? {
                    ToggleOutcome::Applied {
                        control,
                        log_error,
                        ..
                    } => {
                        print_control(&control);
                        if let Some(e) = log_error {
                            println!("  {} {}", "log not written:".yellow(), e);
                        }
                    }
                    ToggleOutcome::Denied { reason, .. } => {
                        println!("{} {}", "⛔".red(), reason.red().bold());
                    }
                }
            }
            Command::Mode(mode) => {
                let report = self.orchestrator.set_all_modes(mode).await?;
                println!(
                    "{} mode set to {} on {}/{} controls",
                    "✓".green().bold(),
                    mode.to_string().bold(),
                    report.updated,
                    report.total
                );
            }
            Command::Lock { name, reason } => {
                let control = self.orchestrator.set_lock(&name, true, reason).await?;
                print_control(&control);
            }
            Command::Unlock(name) => {
                let control = self.orchestrator.set_lock(&name, false, None).await?;
                print_control(&control);
            }
            Command::Set { name, settings } => {
                let control = self.orchestrator.update_settings(&name, settings).await?;
                print_control(&control);
                for (k, v) in &control.settings {
                    println!("      {k} = {v}");
                }
            }
            Command::Log(limit) => {
                let entries = self.orchestrator.recent_log(limit).await?;
                if entries.is_empty() {
                    println!("  {}", "control log is empty".dimmed());
                }
                for e in entries {
                    println!(
                        "  {} {:<20} {:<3} {:<9} {}",
                        e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                        e.control_name.bold(),
                        e.action,
                        e.trigger,
                        e.details.unwrap_or_default().dimmed()
                    );
                }
            }
            Command::EmergencyStop => {
                let report = self.orchestrator.emergency_stop().await?;
                print_emergency_report(&report);
            }
            Command::Help | Command::Quit => {}
        }
        Ok(())
    }
}

pub fn print_emergency_report(report: &EmergencyStopReport) {
    println!(
        "{} {} control(s) stopped",
        "⚠  EMERGENCY STOP".red().bold(),
        report.stopped
    );
    if !report.failed.is_empty() {
        println!("  {} {}", "could not stop:".red(), report.failed.join(", ").bold());
    }
    if !report.log_failures.is_empty() {
        println!(
            "  {} {}",
            "stopped, but log not written:".yellow(),
            report.log_failures.join(", ").bold()
        );
    }
}

fn print_control(c: &Control) {
    let state = if c.is_on { "ON ".green().bold() } else { "OFF".dimmed() };
    let lock = if c.locked {
        format!(
            "locked ({})",
            c.locked_reason.as_deref().unwrap_or("no reason given")
        )
        .yellow()
        .to_string()
    } else {
        String::new()
    };
    println!("  {:<20} {} {:<8} {}", c.name.bold(), state, c.mode.to_string(), lock);
}

fn print_snapshot(s: &SensorSnapshot) {
    println!(
        "  {} {}",
        "reading at".dimmed(),
        s.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let numeric = [
        ("temperature", s.temperature),
        ("humidity", s.humidity),
        ("ph", s.ph),
        ("tds", s.tds),
        ("n_val", s.n_val),
        ("p_val", s.p_val),
        ("k_val", s.k_val),
        ("water_temp", s.water_temp),
        ("water_level", s.water_level),
        ("light_intensity", s.light_intensity),
        ("cpu_temp", s.cpu_temp),
    ];
    for (name, value) in numeric {
        if let Some(v) = value {
            println!("    {name:<16} {v}");
        }
    }
    if let Some(gas) = s.gas_detected {
        let shown = if gas { "yes".red().bold() } else { "no".normal() };
        println!("    {:<16} {}", "gas_detected", shown);
    }
}
