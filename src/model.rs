//! Built-in register maps of supported inverter models.

use crate::{catalog::Catalog, error::CatalogError};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Model {
    /// Volt Sinus PRO ULTRA 6000, 24 V with 60 A MPPT charger.
    #[default]
    VoltSinusProUltra6000,
}

impl Model {
    pub const ALL: &'static [Model] = &[Model::VoltSinusProUltra6000];

    /// Identifier used on the command line and in configuration files.
    pub fn id(&self) -> &'static str {
        match self {
            Model::VoltSinusProUltra6000 => "volt_sinus_pro_ultra_6000",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Model::VoltSinusProUltra6000 => "Volt Sinus PRO ULTRA 6000 (24V, 60A MPPT)",
        }
    }

    /// Factory Modbus unit id.
    pub fn default_unit_id(&self) -> u8 {
        match self {
            Model::VoltSinusProUltra6000 => 4,
        }
    }

    pub fn default_baud_rate(&self) -> u32 {
        match self {
            Model::VoltSinusProUltra6000 => 19200,
        }
    }

    fn register_map(&self) -> &'static str {
        match self {
            Model::VoltSinusProUltra6000 => {
                include_str!("../registers/volt_sinus_pro_ultra_6000.yaml")
            }
        }
    }

    /// The validated register catalog of this model.
    pub fn catalog(&self) -> Result<Catalog, CatalogError> {
        Catalog::from_yaml_str(self.register_map())
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Unknown model '{0}'")]
pub struct UnknownModel(pub String);

impl FromStr for Model {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Model::ALL
            .iter()
            .find(|model| model.id() == s)
            .copied()
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}
