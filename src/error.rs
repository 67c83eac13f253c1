//! Error types surfaced by the register catalog, the engine configuration and
//! the write path.
//!
//! Word-level codec errors live in [`crate::protocol`] and transport failures
//! in [`crate::transport`], next to the code that raises them.

use crate::{protocol::EncodeError, transport::TransportError};

/// Rejection of a register catalog. Always fatal: the engine is never built
/// from a catalog that fails validation.
#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    /// Two definitions share the same key.
    #[error("Duplicate register key '{0}'")]
    DuplicateKey(String),

    /// A composite references a key that is not defined in the catalog.
    #[error("Composite '{key}' references unknown register '{source_key}'")]
    DanglingCompositeSource { key: String, source_key: String },

    /// Composite dependencies form a cycle that includes `key`.
    #[error("Composite '{0}' depends on itself")]
    CompositeCycle(String),

    /// A definition carries both an address and composite sources.
    #[error("Register '{0}' defines both an address and composite sources")]
    ConflictingDefinition(String),

    /// A definition carries neither an address nor composite sources.
    #[error("Register '{0}' has neither an address nor composite sources")]
    MissingAddress(String),

    /// A composite without any source.
    #[error("Composite '{0}' has no sources")]
    EmptyComposite(String),

    /// Word length other than 1 (16-bit) or 2 (32-bit).
    #[error("Register '{key}' has unsupported length {length}")]
    InvalidLength { key: String, length: u8 },

    /// Scale factor is zero, NaN or infinite.
    #[error("Register '{key}' has invalid scale {scale}")]
    InvalidScale { key: String, scale: f64 },

    /// The register's words run past the end of the address space.
    #[error("Register '{0}' extends beyond address 0xFFFF")]
    AddressOutOfRange(String),

    /// Two registers of the same function kind cover a common word.
    #[error("Register '{key}' overlaps register '{other}'")]
    AddressOverlap { key: String, other: String },

    /// A 32-bit register marked writable; writes are single-register only.
    #[error("Register '{0}' is 32-bit and cannot be writable")]
    WideWritable(String),

    /// An input register marked writable; function 04 registers are read-only.
    #[error("Input register '{0}' cannot be writable")]
    WritableInput(String),

    /// The YAML register map could not be parsed.
    #[error("Cannot parse register map: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The register map file could not be read.
    #[error("Cannot read register map: {0}")]
    Io(#[from] std::io::Error),
}

/// Rejection of an engine configuration.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Maximum block span {0} is outside 2..={max}", max = crate::protocol::MAX_READ_SPAN)]
    MaxSpan(u16),

    #[error("Operation timeout must be greater than zero")]
    ZeroTimeout,
}

/// Failure of a write request, reported synchronously to the caller.
#[derive(thiserror::Error, Debug)]
pub enum WriteError {
    #[error("Unknown register '{0}'")]
    UnknownKey(String),

    #[error("Register '{0}' is not writable")]
    NotWritable(String),

    #[error("Register '{key}' has no option '{option}'")]
    UnknownOption { key: String, option: String },

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The polling worker is no longer running.
    #[error("Polling engine is stopped")]
    EngineStopped,
}
