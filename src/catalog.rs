//! Register definitions and their validation.
//!
//! A [`Catalog`] is the validated, immutable register map of one device. It is
//! usually loaded from YAML:
//!
//! ```yaml
//! registers:
//!   - key: battery_voltage
//!     address: 25205
//!     scale: 0.1
//!     precision: 2
//!     unit: V
//!   - key: battery_power
//!     address: 25273
//!     interval: 5s
//!   - key: charger_energy
//!     precision: 3
//!     sources:
//!       - { key: charger_energy_h, factor: 1 }
//!       - { key: charger_energy_l, factor: 0.001 }
//! ```
//!
//! Entries with an `address` are primitive registers read from the device;
//! entries with `sources` are composites derived from other registers.

use crate::{error::CatalogError, protocol::DEFAULT_INTERVAL};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

/// The Modbus table a register lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionKind {
    /// Read with function code 0x03, writable with 0x06.
    #[default]
    Holding,
    /// Read with function code 0x04, read-only.
    Input,
}

impl std::fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FunctionKind::Holding => write!(f, "holding"),
            FunctionKind::Input => write!(f, "input"),
        }
    }
}

/// A register read directly from the device.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    pub key: String,
    pub address: u16,
    /// Number of 16-bit words: 1 or 2.
    pub length: u8,
    /// Two's-complement interpretation of the raw value.
    pub signed: bool,
    /// Multiplied into the raw integer to get the physical value.
    pub scale: f64,
    /// Refresh interval; the catalog default applies when absent.
    pub interval: Option<Duration>,
    pub kind: FunctionKind,
    pub writable: bool,
    /// Rounding digits for presentation.
    pub precision: Option<u8>,
    pub unit: Option<String>,
    /// Lower write bound in physical units.
    pub min: Option<f64>,
    /// Upper write bound in physical units.
    pub max: Option<f64>,
    /// Labels of an enumerated register, keyed by raw value.
    pub options: BTreeMap<i64, String>,
}

impl Primitive {
    /// A 16-bit signed holding register with scale 1 and no metadata.
    pub fn new(key: impl Into<String>, address: u16) -> Self {
        Self {
            key: key.into(),
            address,
            length: 1,
            signed: true,
            scale: 1.0,
            interval: None,
            kind: FunctionKind::Holding,
            writable: false,
            precision: None,
            unit: None,
            min: None,
            max: None,
            options: BTreeMap::new(),
        }
    }

    /// First address past this register.
    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length)
    }
}

/// One weighted term of a composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSource {
    pub key: String,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

fn default_factor() -> f64 {
    1.0
}

/// A value derived from other registers: `sum(source * factor)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub key: String,
    pub sources: Vec<CompositeSource>,
    pub precision: Option<u8>,
    pub unit: Option<String>,
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterDef {
    Primitive(Primitive),
    Composite(Composite),
}

impl RegisterDef {
    pub fn key(&self) -> &str {
        match self {
            RegisterDef::Primitive(def) => &def.key,
            RegisterDef::Composite(def) => &def.key,
        }
    }

    pub fn precision(&self) -> Option<u8> {
        match self {
            RegisterDef::Primitive(def) => def.precision,
            RegisterDef::Composite(def) => def.precision,
        }
    }

    pub fn unit(&self) -> Option<&str> {
        match self {
            RegisterDef::Primitive(def) => def.unit.as_deref(),
            RegisterDef::Composite(def) => def.unit.as_deref(),
        }
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match self {
            RegisterDef::Primitive(def) => Some(def),
            RegisterDef::Composite(_) => None,
        }
    }
}

/// The YAML shape of an entry, before it is sorted into a [`RegisterDef`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRegisterDef {
    key: String,
    address: Option<u16>,
    #[serde(default = "default_length")]
    length: u8,
    #[serde(default = "default_signed")]
    signed: bool,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default, with = "humantime_serde")]
    interval: Option<Duration>,
    #[serde(default)]
    kind: FunctionKind,
    #[serde(default)]
    writable: bool,
    precision: Option<u8>,
    unit: Option<String>,
    min: Option<f64>,
    max: Option<f64>,
    #[serde(default)]
    options: BTreeMap<i64, String>,
    sources: Option<Vec<CompositeSource>>,
}

fn default_length() -> u8 {
    1
}

fn default_signed() -> bool {
    true
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegisterMap {
    registers: Vec<RawRegisterDef>,
}

impl TryFrom<RawRegisterDef> for RegisterDef {
    type Error = CatalogError;

    fn try_from(raw: RawRegisterDef) -> Result<Self, Self::Error> {
        match (raw.address, raw.sources) {
            (Some(_), Some(_)) => Err(CatalogError::ConflictingDefinition(raw.key)),
            (None, None) => Err(CatalogError::MissingAddress(raw.key)),
            (None, Some(sources)) => Ok(RegisterDef::Composite(Composite {
                key: raw.key,
                sources,
                precision: raw.precision,
                unit: raw.unit,
            })),
            (Some(address), None) => Ok(RegisterDef::Primitive(Primitive {
                key: raw.key,
                address,
                length: raw.length,
                signed: raw.signed,
                scale: raw.scale,
                interval: raw.interval,
                kind: raw.kind,
                writable: raw.writable,
                precision: raw.precision,
                unit: raw.unit,
                min: raw.min,
                max: raw.max,
                options: raw.options,
            })),
        }
    }
}

/// A composite ready for evaluation: its sources resolved to catalog indices.
#[derive(Debug, Clone)]
pub(crate) struct CompositeStep {
    pub index: usize,
    pub sources: Vec<(usize, f64)>,
    pub precision: Option<u8>,
}

/// Validated register map.
#[derive(Debug, Clone)]
pub struct Catalog {
    defs: Vec<RegisterDef>,
    index: HashMap<String, usize>,
    composite_order: Vec<CompositeStep>,
    default_interval: Duration,
}

impl Catalog {
    /// Validates `defs` and builds the catalog.
    ///
    /// Composites are put in dependency order so that every composite is
    /// evaluated after all of its sources.
    pub fn validate(defs: Vec<RegisterDef>) -> Result<Self, CatalogError> {
        let mut index = HashMap::with_capacity(defs.len());
        for (position, def) in defs.iter().enumerate() {
            if index.insert(def.key().to_string(), position).is_some() {
                return Err(CatalogError::DuplicateKey(def.key().to_string()));
            }
        }

        for def in &defs {
            match def {
                RegisterDef::Primitive(def) => check_primitive(def)?,
                RegisterDef::Composite(def) => {
                    if def.sources.is_empty() {
                        return Err(CatalogError::EmptyComposite(def.key.clone()));
                    }
                    if let Some(source) = def.sources.iter().find(|s| !index.contains_key(&s.key)) {
                        return Err(CatalogError::DanglingCompositeSource {
                            key: def.key.clone(),
                            source_key: source.key.clone(),
                        });
                    }
                }
            }
        }

        check_overlaps(&defs)?;
        let composite_order = composite_order(&defs, &index)?;

        Ok(Self {
            defs,
            index,
            composite_order,
            default_interval: DEFAULT_INTERVAL,
        })
    }

    /// Parses and validates a YAML register map.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, CatalogError> {
        let map: RegisterMap = serde_yaml::from_str(yaml)?;
        let defs = map
            .registers
            .into_iter()
            .map(RegisterDef::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::validate(defs)
    }

    /// Reads, parses and validates a YAML register map file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    /// Overrides the interval used by definitions without their own.
    pub fn with_default_interval(mut self, interval: Duration) -> Self {
        self.default_interval = interval;
        self
    }

    pub fn default_interval(&self) -> Duration {
        self.default_interval
    }

    /// Effective refresh interval of a primitive.
    pub fn interval_of(&self, def: &Primitive) -> Duration {
        def.interval.unwrap_or(self.default_interval)
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Definitions in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDef> {
        self.defs.iter()
    }

    pub fn get(&self, key: &str) -> Option<&RegisterDef> {
        self.index_of(key).and_then(|index| self.defs.get(index))
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn def(&self, index: usize) -> Option<&RegisterDef> {
        self.defs.get(index)
    }

    pub(crate) fn composite_order(&self) -> &[CompositeStep] {
        &self.composite_order
    }
}

fn check_primitive(def: &Primitive) -> Result<(), CatalogError> {
    if !matches!(def.length, 1 | 2) {
        return Err(CatalogError::InvalidLength {
            key: def.key.clone(),
            length: def.length,
        });
    }
    if def.scale == 0.0 || !def.scale.is_finite() {
        return Err(CatalogError::InvalidScale {
            key: def.key.clone(),
            scale: def.scale,
        });
    }
    if def.end() > 0x1_0000 {
        return Err(CatalogError::AddressOutOfRange(def.key.clone()));
    }
    if def.writable && def.length == 2 {
        return Err(CatalogError::WideWritable(def.key.clone()));
    }
    if def.writable && def.kind == FunctionKind::Input {
        return Err(CatalogError::WritableInput(def.key.clone()));
    }
    Ok(())
}

fn check_overlaps(defs: &[RegisterDef]) -> Result<(), CatalogError> {
    let mut primitives: Vec<&Primitive> = defs.iter().filter_map(RegisterDef::as_primitive).collect();
    primitives.sort_by_key(|def| (def.kind, def.address));
    for pair in primitives.windows(2) {
        let (previous, current) = (pair[0], pair[1]);
        if previous.kind == current.kind && previous.end() > u32::from(current.address) {
            return Err(CatalogError::AddressOverlap {
                key: current.key.clone(),
                other: previous.key.clone(),
            });
        }
    }
    Ok(())
}

/// Kahn's algorithm over the composite-to-composite edges.
fn composite_order(
    defs: &[RegisterDef],
    index: &HashMap<String, usize>,
) -> Result<Vec<CompositeStep>, CatalogError> {
    let mut steps: HashMap<usize, CompositeStep> = HashMap::new();
    let mut pending: HashMap<usize, usize> = HashMap::new();
    let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();

    for (position, def) in defs.iter().enumerate() {
        let RegisterDef::Composite(composite) = def else {
            continue;
        };
        let mut sources = Vec::with_capacity(composite.sources.len());
        let mut waiting_on = HashSet::new();
        for source in &composite.sources {
            let Some(&source_index) = index.get(&source.key) else {
                return Err(CatalogError::DanglingCompositeSource {
                    key: composite.key.clone(),
                    source_key: source.key.clone(),
                });
            };
            sources.push((source_index, source.factor));
            if matches!(defs.get(source_index), Some(RegisterDef::Composite(_))) && waiting_on.insert(source_index) {
                dependents.entry(source_index).or_default().push(position);
            }
        }
        pending.insert(position, waiting_on.len());
        steps.insert(
            position,
            CompositeStep {
                index: position,
                sources,
                precision: composite.precision,
            },
        );
    }

    // Seed in declaration order so the evaluation order is deterministic.
    let mut ready: Vec<usize> = (0..defs.len())
        .filter(|position| pending.get(position) == Some(&0))
        .rev()
        .collect();
    let mut order = Vec::with_capacity(steps.len());
    while let Some(position) = ready.pop() {
        if let Some(step) = steps.remove(&position) {
            order.push(step);
        }
        for dependent in dependents.remove(&position).unwrap_or_default() {
            if let Some(count) = pending.get_mut(&dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.push(dependent);
                }
            }
        }
    }

    match steps.keys().min() {
        Some(&stuck) => Err(CatalogError::CompositeCycle(defs[stuck].key().to_string())),
        None => Ok(order),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn composite(key: &str, sources: &[(&str, f64)]) -> RegisterDef {
        RegisterDef::Composite(Composite {
            key: key.to_string(),
            sources: sources
                .iter()
                .map(|(key, factor)| CompositeSource {
                    key: key.to_string(),
                    factor: *factor,
                })
                .collect(),
            precision: None,
            unit: None,
        })
    }

    fn primitive(key: &str, address: u16) -> RegisterDef {
        RegisterDef::Primitive(Primitive::new(key, address))
    }

    #[test]
    fn duplicate_key() {
        let result = Catalog::validate(vec![primitive("a", 1), primitive("a", 2)]);
        assert_matches!(result, Err(CatalogError::DuplicateKey(key)) if key == "a");
    }

    #[test]
    fn dangling_source() {
        let result = Catalog::validate(vec![primitive("a", 1), composite("c", &[("a", 1.0), ("b", 1.0)])]);
        assert_matches!(
            result,
            Err(CatalogError::DanglingCompositeSource { key, source_key }) if key == "c" && source_key == "b"
        );
    }

    #[test]
    fn two_composite_cycle() {
        let result = Catalog::validate(vec![composite("a", &[("b", 1.0)]), composite("b", &[("a", 1.0)])]);
        assert_matches!(result, Err(CatalogError::CompositeCycle(_)));
    }

    #[test]
    fn self_referencing_composite() {
        let result = Catalog::validate(vec![primitive("p", 1), composite("a", &[("p", 1.0), ("a", 1.0)])]);
        assert_matches!(result, Err(CatalogError::CompositeCycle(key)) if key == "a");
    }

    #[test]
    fn composite_chain_is_ordered_by_dependency() {
        // Declared in reverse dependency order on purpose.
        let catalog = Catalog::validate(vec![
            composite("total", &[("sub", 1.0), ("p", 2.0)]),
            composite("sub", &[("p", 1.0)]),
            primitive("p", 10),
        ])
        .unwrap();
        let order: Vec<&str> = catalog
            .composite_order()
            .iter()
            .map(|step| catalog.def(step.index).unwrap().key())
            .collect();
        assert_eq!(order, ["sub", "total"]);
    }

    #[test]
    fn primitive_checks() {
        let mut wide = Primitive::new("wide", 1);
        wide.length = 3;
        assert_matches!(
            Catalog::validate(vec![RegisterDef::Primitive(wide)]),
            Err(CatalogError::InvalidLength { length: 3, .. })
        );

        let mut unscaled = Primitive::new("unscaled", 1);
        unscaled.scale = 0.0;
        assert_matches!(
            Catalog::validate(vec![RegisterDef::Primitive(unscaled)]),
            Err(CatalogError::InvalidScale { .. })
        );

        let mut last = Primitive::new("last", 0xFFFF);
        last.length = 2;
        assert_matches!(
            Catalog::validate(vec![RegisterDef::Primitive(last)]),
            Err(CatalogError::AddressOutOfRange(_))
        );

        let mut setpoint = Primitive::new("setpoint", 1);
        setpoint.length = 2;
        setpoint.writable = true;
        assert_matches!(
            Catalog::validate(vec![RegisterDef::Primitive(setpoint)]),
            Err(CatalogError::WideWritable(_))
        );
    }

    #[test]
    fn input_registers_are_read_only() {
        let mut reading = Primitive::new("reading", 300);
        reading.kind = FunctionKind::Input;
        reading.writable = true;
        let setpoint = Primitive {
            writable: true,
            ..Primitive::new("setpoint", 300)
        };
        assert_matches!(
            Catalog::validate(vec![
                RegisterDef::Primitive(reading),
                RegisterDef::Primitive(setpoint.clone()),
            ]),
            Err(CatalogError::WritableInput(key)) if key == "reading"
        );

        let result = Catalog::from_yaml_str(
            r#"
registers:
  - key: reading
    address: 300
    kind: input
    writable: true
"#,
        );
        assert_matches!(result, Err(CatalogError::WritableInput(_)));

        let catalog = Catalog::validate(vec![RegisterDef::Primitive(setpoint)]).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn overlapping_addresses() {
        let mut energy = Primitive::new("energy", 100);
        energy.length = 2;
        let result = Catalog::validate(vec![RegisterDef::Primitive(energy), primitive("power", 101)]);
        assert_matches!(result, Err(CatalogError::AddressOverlap { key, other }) if key == "power" && other == "energy");

        // Same address in different tables is fine.
        let mut input = Primitive::new("input", 100);
        input.kind = FunctionKind::Input;
        assert!(Catalog::validate(vec![RegisterDef::Primitive(input), primitive("holding", 100)]).is_ok());
    }

    #[test]
    fn yaml_loading() {
        let catalog = Catalog::from_yaml_str(
            r#"
registers:
  - key: voltage
    address: 25205
    scale: 0.1
    precision: 2
    unit: V
  - key: power
    address: 25273
    kind: input
    signed: false
    interval: 5s
  - key: mode
    address: 20109
    writable: true
    options:
      0: "Solar"
      3: "Grid"
  - key: doubled
    sources:
      - { key: voltage }
      - { key: voltage, factor: 1 }
"#,
        )
        .unwrap();

        assert_eq!(catalog.len(), 4);
        let Some(RegisterDef::Primitive(power)) = catalog.get("power") else {
            panic!("power is not a primitive");
        };
        assert_eq!(power.kind, FunctionKind::Input);
        assert!(!power.signed);
        assert_eq!(catalog.interval_of(power), Duration::from_secs(5));

        let Some(RegisterDef::Primitive(mode)) = catalog.get("mode") else {
            panic!("mode is not a primitive");
        };
        assert!(mode.writable);
        assert_eq!(mode.options.get(&3).map(String::as_str), Some("Grid"));
        assert_eq!(catalog.interval_of(mode), DEFAULT_INTERVAL);

        let mode = mode.clone();
        let catalog = catalog.with_default_interval(Duration::from_secs(30));
        assert_eq!(catalog.interval_of(&mode), Duration::from_secs(30));
    }

    #[test]
    fn yaml_address_and_sources() {
        let result = Catalog::from_yaml_str(
            r#"
registers:
  - key: a
    address: 1
  - key: b
    address: 2
    sources: [{ key: a }]
"#,
        );
        assert_matches!(result, Err(CatalogError::ConflictingDefinition(key)) if key == "b");

        let result = Catalog::from_yaml_str("registers:\n  - key: alias\n");
        assert_matches!(result, Err(CatalogError::MissingAddress(key)) if key == "alias");

        let result = Catalog::from_yaml_str("registers:\n  - key: a\n    adress: 1\n");
        assert_matches!(result, Err(CatalogError::Yaml(_)));
    }
}
