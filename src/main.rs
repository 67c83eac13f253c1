//! Volt Hub CLI
//!
//! A command-line interface (CLI) application for Volt battery inverters
//! connected via Modbus RTU (serial) or Modbus TCP.
//!
//! This tool allows users to:
//! - Read and decode all registers of the inverter once.
//! - Write setpoints and select options of enumerated registers and switches.
//! - Run in a continuous daemon mode that keeps polling the inverter and
//!   periodically prints the current values to the console.
//! - List the register map of a model or of a custom YAML map.
//!
//! The CLI leverages the `volt_hub_lib` crate for the register catalog and the
//! polling engine.

use anyhow::{bail, Context, Result};
use clap::Parser;
use dialoguer::Confirm;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{panic, time::Duration};
use volt_hub_lib::{
    catalog::{Catalog, RegisterDef},
    engine::{EngineConfig, EngineHandle, Pass, PollingEngine},
    planner::{self, Block},
    store::Snapshot,
    tokio_common::{Endpoint, ModbusTransport},
};

mod commandline;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause_str = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at '{}': {}:{} - Cause: {}",
            std::thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause_str
        );
    }));
    Ok(log_handle)
}

/// Calculates the minimum recommended delay for Modbus RTU based on baud rate.
/// This is typically 3.5 character times.
fn minimum_rtu_delay(baud_rate: u32) -> Duration {
    // Modbus assumes 11 bits per character for silent intervals.
    let bits_per_char = 11.0;
    let rate = f64::from(baud_rate);
    if rate == 0.0 {
        return Duration::from_millis(16);
    }

    let char_time_secs = bits_per_char / rate;
    let inter_frame_delay_secs = 3.5 * char_time_secs;
    let delay_micros = (inter_frame_delay_secs * 1_000_000.0) as u64;

    // Fixed 1.75 ms silence for rates above 19200 baud.
    const PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS: u64 = 1_750;
    Duration::from_micros(delay_micros.max(PRACTICAL_MIN_INTER_FRAME_DELAY_MICROS))
}

/// Checks if the user-provided RTU delay is sufficient; if not, uses the calculated minimum.
fn check_rtu_delay(user_delay: Duration, baud_rate: u32) -> Duration {
    let min_rtu_delay = minimum_rtu_delay(baud_rate);
    if user_delay < min_rtu_delay {
        warn!(
            "User-defined RTU delay of {user_delay:?} is below the recommended minimum of {min_rtu_delay:?} for {baud_rate} baud. Using minimum."
        );
        min_rtu_delay
    } else {
        user_delay
    }
}

/// Loads the register map: the file given on the command line or the model's built-in map.
fn load_catalog(args: &commandline::CliArgs) -> Result<Catalog> {
    let catalog = match &args.catalog {
        Some(path) => Catalog::from_yaml_file(path)
            .with_context(|| format!("Cannot load register map {}", path.display()))?,
        None => args
            .model
            .catalog()
            .with_context(|| format!("Cannot load register map of {}", args.model.name()))?,
    };
    Ok(catalog.with_default_interval(args.default_interval))
}

/// Builds the transport and engine configuration from the command-line arguments.
fn create_engine(
    args: &commandline::CliArgs,
    catalog: Catalog,
) -> Result<PollingEngine<ModbusTransport>> {
    let mut config = EngineConfig {
        max_span: args.max_span,
        quiet_period: args.delay,
        reconnect_backoff: args.backoff,
        operation_timeout: args.timeout,
        ..Default::default()
    };
    let endpoint = match &args.connection {
        commandline::CliConnection::Tcp {
            address, unit_id, ..
        } => {
            let socket_addr = address
                .parse()
                .with_context(|| format!("Invalid TCP address format: '{address}'"))?;
            config.unit_id = unit_id.unwrap_or(args.model.default_unit_id());
            Endpoint::Tcp(socket_addr)
        }
        commandline::CliConnection::Rtu {
            device,
            baud_rate,
            unit_id,
            ..
        } => {
            let baud_rate = baud_rate.unwrap_or(args.model.default_baud_rate());
            config.unit_id = unit_id.unwrap_or(args.model.default_unit_id());
            config.quiet_period = check_rtu_delay(args.delay, baud_rate);
            Endpoint::Rtu {
                device: device.clone(),
                baud_rate,
            }
        }
    };
    info!(
        "Using {} (unit id {}) with {} registers",
        endpoint,
        config.unit_id,
        catalog.len()
    );
    PollingEngine::new(catalog, ModbusTransport::new(endpoint), config)
        .context("Invalid engine configuration")
}

/// Whether a register is printed; internal registers start with an underscore.
fn is_visible(key: &str, all: bool) -> bool {
    all || !key.starts_with('_')
}

fn format_value(catalog: &Catalog, snapshot: &Snapshot, def: &RegisterDef) -> String {
    let key = def.key();
    if let Some(label) = snapshot.option_label(catalog, key) {
        return label.to_string();
    }
    match snapshot.display_value(catalog, key) {
        Some(value) => match def.unit() {
            Some(unit) => format!("{value} {unit}"),
            None => value.to_string(),
        },
        None => "unknown".to_string(),
    }
}

fn print_snapshot(catalog: &Catalog, snapshot: &Snapshot, keys: &[String], all: bool) {
    for def in catalog.iter() {
        let key = def.key();
        let selected = if keys.is_empty() {
            is_visible(key, all)
        } else {
            keys.iter().any(|k| k == key)
        };
        if selected {
            println!("{key}: {}", format_value(catalog, snapshot, def));
        }
    }
    if !snapshot.last_update_succeeded() {
        println!("(last update incomplete)");
    }
}

fn print_catalog(catalog: &Catalog) {
    for def in catalog.iter() {
        match def {
            RegisterDef::Primitive(def) => {
                let mut line = format!(
                    "{} {} {}{}",
                    def.key,
                    def.kind,
                    def.address,
                    if def.length == 2 { " (32-bit)" } else { "" }
                );
                line.push_str(&format!(
                    " every {}",
                    humantime::format_duration(catalog.interval_of(def))
                ));
                if let Some(unit) = &def.unit {
                    line.push_str(&format!(" [{unit}]"));
                }
                if def.writable {
                    line.push_str(" writable");
                }
                if !def.options.is_empty() {
                    let options: Vec<&str> = def.options.values().map(String::as_str).collect();
                    line.push_str(&format!(" options: {}", options.join(", ")));
                }
                println!("{line}");
            }
            RegisterDef::Composite(def) => {
                let sources: Vec<String> = def
                    .sources
                    .iter()
                    .map(|source| format!("{} * {}", source.key, source.factor))
                    .collect();
                println!("{} = {}", def.key, sources.join(" + "));
            }
        }
    }
}

fn print_blocks(blocks: &[Block]) {
    for block in blocks {
        let keys: Vec<&str> = block.members.iter().map(|m| m.key.as_str()).collect();
        println!(
            "{} {}..{} every {}: {}",
            block.kind,
            block.start,
            u32::from(block.start) + u32::from(block.length),
            humantime::format_duration(block.interval),
            keys.join(", ")
        );
    }
}

fn confirm_write(key: &str, value: &str) -> Result<bool> {
    Confirm::new()
        .with_prompt(format!("Write {value} to {key}?"))
        .default(false)
        .show_default(true)
        .interact()
        .context("Failed to get user confirmation.")
}

/// Waits until the engine published a snapshot with a refreshed value of `key`.
async fn wait_for_reread(handle: &EngineHandle, key: &str, timeout: Duration) -> Option<f64> {
    match tokio::time::timeout(timeout, handle.wait_for_read(key)).await {
        Ok(value) => value,
        Err(_) => {
            debug!("No fresh value of {key} within {timeout:?}");
            None
        }
    }
}

async fn run_daemon(
    handle: &EngineHandle,
    print_interval: Duration,
    all: bool,
) -> Result<()> {
    let mut ticker = tokio::time::interval(print_interval);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Cannot listen for Ctrl-C")?;
                info!("Shutdown requested");
                return Ok(());
            }
            _ = ticker.tick() => {
                let snapshot = handle.snapshot();
                if snapshot.updated_at().is_none() {
                    debug!("Daemon: no values yet");
                    continue;
                }
                print_snapshot(handle.catalog(), &snapshot, &[], all);
                println!();
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;
    info!(
        "Volt Hub CLI started. Log level: {}",
        args.verbose.log_level_filter()
    );

    let catalog = load_catalog(&args)?;

    match args.connection.command().clone() {
        commandline::CliCommands::List => {
            info!("Executing: List registers of {}", args.model.name());
            print_catalog(&catalog);
            println!();
            print_blocks(&planner::plan(&catalog, args.max_span));
        }
        commandline::CliCommands::Read { keys, all } => {
            info!("Executing: Read registers");
            if let Some(key) = keys.iter().find(|key| catalog.get(key).is_none()) {
                bail!("Unknown register '{key}'");
            }
            let mut engine = create_engine(&args, catalog)?;
            let pass = engine.poll_once().await;
            if pass == Pass::Reconnecting {
                bail!("Cannot connect to the inverter");
            }
            print_snapshot(engine.catalog(), &engine.snapshot(), &keys, all);
        }
        commandline::CliCommands::Write { key, value, yes } => {
            info!("Executing: Write {value} to {key}");
            if !yes && !confirm_write(&key, &value.to_string())? {
                info!("Write aborted by user.");
                return Ok(());
            }
            let handle = create_engine(&args, catalog)?.start();
            let result = handle
                .write(&key, value)
                .await
                .with_context(|| format!("Failed to write {value} to {key}"));
            if result.is_ok() {
                let reread = wait_for_reread(&handle, &key, args.timeout * 4).await;
                println!("{key} set to {value}, device reports {reread:?}");
            }
            handle.stop().await;
            result?;
        }
        commandline::CliCommands::Select { key, option, yes } => {
            info!("Executing: Select {option} for {key}");
            if !yes && !confirm_write(&key, &option)? {
                info!("Select aborted by user.");
                return Ok(());
            }
            let handle = create_engine(&args, catalog)?.start();
            let result = handle
                .write_option(&key, &option)
                .await
                .with_context(|| format!("Failed to select {option} for {key}"));
            if result.is_ok() {
                wait_for_reread(&handle, &key, args.timeout * 4).await;
                let label = handle.snapshot().option_label(handle.catalog(), &key).map(str::to_string);
                println!("{key} set to {option}, device reports {label:?}");
            }
            handle.stop().await;
            result?;
        }
        commandline::CliCommands::Daemon {
            print_interval,
            all,
        } => {
            info!("Starting daemon mode: interval={print_interval:?}");
            let handle = create_engine(&args, catalog)?.start();
            let result = run_daemon(&handle, print_interval, all).await;
            handle.stop().await;
            result?;
        }
    }

    Ok(())
}
