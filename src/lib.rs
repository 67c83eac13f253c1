//! A library for polling and controlling Volt battery inverters via Modbus.
//!
//! The inverter exposes its state as a sparse set of 16-bit registers. This
//! crate turns a register map into a continuously refreshed, typed snapshot:
//!
//! 1.  **Register catalog**: the validated register map of a device, either
//!     built in (see [`model::Model`]) or loaded from YAML (see [`catalog`]).
//! 2.  **Block planning**: registers are grouped into contiguous read blocks
//!     so one request fetches many values (see [`planner`]).
//! 3.  **Decoding**: raw words become signed or unsigned, 16 or 32-bit, scaled
//!     physical values (see [`protocol`]). Composite values such as split
//!     energy counters are derived afterwards (see [`composite`]).
//! 4.  **Polling engine**: a single worker owns the connection, refreshes each
//!     block at its own interval, reconnects on failure and executes writes
//!     (see [`engine`]).
//!
//! ## Features
//!
//! - **Per-register refresh intervals** with a configurable default.
//! - **Failure isolation**: a failing block never stops the others.
//! - **Validated writes**: range checks and option labels before any I/O.
//! - **Transport independence**: the engine only needs a [`transport::Transport`];
//!   a `tokio-modbus` RTU/TCP implementation is behind the `tokio-rtu` and
//!   `tokio-tcp` features.
//!
//! ## Quick Start
//!
//! ```no_run
//! use volt_hub_lib::{
//!     engine::{EngineConfig, PollingEngine},
//!     model::Model,
//!     tokio_common::{Endpoint, ModbusTransport},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Model::VoltSinusProUltra6000;
//!     let transport = ModbusTransport::new(Endpoint::Rtu {
//!         device: "/dev/ttyUSB0".to_string(),
//!         baud_rate: model.default_baud_rate(),
//!     });
//!     let config = EngineConfig {
//!         unit_id: model.default_unit_id(),
//!         ..Default::default()
//!     };
//!
//!     let handle = PollingEngine::new(model.catalog()?, transport, config)?.start();
//!
//!     let mut updates = handle.subscribe();
//!     updates.changed().await?;
//!     println!("Battery voltage: {:?} V", handle.get("volt_battery_voltage"));
//!
//!     handle.write_option("volt_energy_use_mode", "Solar Battery Grid").await?;
//!     handle.stop().await;
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod composite;
pub mod engine;
pub mod error;
pub mod model;
pub mod planner;
pub mod protocol;
pub mod store;
pub mod transport;

#[cfg_attr(docsrs, doc(cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))))]
#[cfg(any(feature = "tokio-rtu", feature = "tokio-tcp"))]
pub mod tokio_common;

pub use catalog::Catalog;
pub use engine::{EngineConfig, EngineHandle, PollingEngine};
pub use error::{CatalogError, ConfigError, WriteError};
