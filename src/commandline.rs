use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use std::path::PathBuf;
use std::time::Duration;
use volt_hub_lib::model::Model;

fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

fn parse_unit_id(s: &str) -> Result<u8, String> {
    let unit_id = clap_num::maybe_hex::<u8>(s).map_err(|e| format!("Invalid unit id format: {e}"))?;
    if (1..=247).contains(&unit_id) {
        Ok(unit_id)
    } else {
        Err(format!("Unit id {unit_id} is outside 1..=247"))
    }
}

fn parse_baud_rate(s: &str) -> Result<u32, String> {
    let rate = s
        .parse::<u32>()
        .map_err(|e| format!("Invalid baud rate number format: {e}"))?;
    match rate {
        1200 | 2400 | 4800 | 9600 | 19200 | 38400 | 57600 | 115200 => Ok(rate),
        _ => Err(format!("Unsupported baud rate {rate}")),
    }
}

fn parse_max_span(s: &str) -> Result<u16, String> {
    clap_num::number_range(s, 2, volt_hub_lib::protocol::MAX_READ_SPAN)
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliConnection {
    /// Connect to the inverter through a Modbus TCP gateway.
    Tcp {
        /// The IP address and port of the Modbus TCP gateway.
        /// Example: "192.168.1.100:502".
        #[arg(verbatim_doc_comment)]
        address: String,

        /// The Modbus unit id of the inverter behind the gateway.
        /// Defaults to the factory unit id of the selected model.
        #[arg(short, long, value_parser = parse_unit_id, verbatim_doc_comment)]
        unit_id: Option<u8>,

        #[command(subcommand)]
        command: CliCommands,
    },
    /// Connect to the inverter via Modbus RTU (RS485).
    Rtu {
        /// Serial port device name.
        /// Examples: "/dev/ttyUSB0" (Linux), "COM3" (Windows).
        #[arg(short, long, default_value_t = default_device_name(), verbatim_doc_comment)]
        device: String,

        /// Baud rate for serial communication.
        /// Defaults to the factory baud rate of the selected model.
        #[arg(short, long, value_parser = parse_baud_rate, verbatim_doc_comment)]
        baud_rate: Option<u32>,

        /// The Modbus unit id of the inverter (1 to 247).
        /// Can be specified in decimal or hexadecimal (e.g., "0x04").
        /// Defaults to the factory unit id of the selected model.
        #[arg(short, long, value_parser = parse_unit_id, verbatim_doc_comment)]
        unit_id: Option<u8>,

        #[command(subcommand)]
        command: CliCommands,
    },
}

impl CliConnection {
    pub fn command(&self) -> &CliCommands {
        match self {
            CliConnection::Tcp { command, .. } | CliConnection::Rtu { command, .. } => command,
        }
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode: keep polling and print all values at a fixed interval.
    Daemon {
        /// Interval for printing the current values (e.g., "10s", "1m").
        #[arg(value_parser = humantime::parse_duration, short, long, default_value = "10s")]
        print_interval: Duration,

        /// Also print the internal registers composites are built from.
        #[arg(short, long)]
        all: bool,
    },

    /// Read all registers once and print their values.
    Read {
        /// Only print these registers.
        keys: Vec<String>,

        /// Also print the internal registers composites are built from.
        #[arg(short, long)]
        all: bool,
    },

    /// Write a physical value (e.g., a voltage setpoint) to a writable register.
    Write {
        /// Register key, see the `list` command.
        key: String,
        /// Value in the register's unit, e.g. "230" for 230 V.
        #[arg(allow_hyphen_values = true)]
        value: f64,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// Select an option of an enumerated register or toggle a switch ("ON"/"OFF").
    Select {
        /// Register key, see the `list` command.
        key: String,
        /// Option label, e.g. "Solar Battery Grid".
        option: String,
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },

    /// List the register map without connecting to the device.
    List,
}

const fn about_text() -> &'static str {
    "Volt Hub CLI - Poll, decode and control Volt battery inverters via Modbus RTU/TCP."
}

#[derive(Parser, Debug)]
#[command(name="volthub", author, version, about=about_text(), long_about = None, propagate_version = true)]
pub struct CliArgs {
    /// Configure verbosity of logging output.
    /// -v for info, -vv for debug, -vvv for trace. Default is warnings only.
    #[command(flatten)]
    pub verbose: Verbosity<WarnLevel>,

    /// Specifies the connection method and the command to execute.
    #[command(subcommand)]
    pub connection: CliConnection,

    /// Inverter model; selects the built-in register map and factory defaults.
    #[arg(global = true, long, default_value_t = Model::default())]
    pub model: Model,

    /// Register map file (YAML) replacing the built-in map of the model.
    #[arg(global = true, long)]
    pub catalog: Option<PathBuf>,

    /// Refresh interval of registers that do not define their own.
    #[arg(global = true, long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub default_interval: Duration,

    /// Largest number of registers fetched with one request (2 to 125).
    #[arg(global = true, long, default_value_t = volt_hub_lib::protocol::MAX_READ_SPAN, value_parser = parse_max_span)]
    pub max_span: u16,

    /// Modbus I/O timeout for connect, read and write operations.
    /// Examples: "1s", "500ms".
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub timeout: Duration,

    /// Quiet period after every Modbus frame.
    /// Important for Modbus RTU, especially with USB-to-RS485 converters that need time
    /// to switch between transmitting (TX) and receiving (RX) modes.
    /// Examples: "30ms", "50ms".
    #[arg(global = true, long, default_value = "30ms", value_parser = humantime::parse_duration, verbatim_doc_comment)]
    pub delay: Duration,

    /// Pause after a failed connection attempt before retrying.
    #[arg(global = true, long, default_value = "1s", value_parser = humantime::parse_duration)]
    pub backoff: Duration,
}
