//! Current register values and the snapshots handed out to consumers.

use crate::catalog::{Catalog, RegisterDef};
use crate::protocol::round_to;
use std::collections::BTreeMap;
use tokio::time::Instant;

/// Values and read timestamps, indexed like the catalog.
///
/// Only the polling worker mutates a store. Everyone else sees [`Snapshot`]s.
#[derive(Debug, Clone)]
pub struct StateStore {
    values: Vec<Option<f64>>,
    last_read: Vec<Option<Instant>>,
}

impl StateStore {
    /// A store with every register unknown and never read.
    pub fn new(catalog: &Catalog) -> Self {
        Self {
            values: vec![None; catalog.len()],
            last_read: vec![None; catalog.len()],
        }
    }

    pub fn value(&self, index: usize) -> Option<f64> {
        self.values.get(index).copied().flatten()
    }

    /// Time of the last successful read; always `None` for composites.
    pub fn last_read(&self, index: usize) -> Option<Instant> {
        self.last_read.get(index).copied().flatten()
    }

    pub(crate) fn record_read(&mut self, index: usize, value: f64, at: Instant) {
        if let (Some(slot), Some(read)) = (self.values.get_mut(index), self.last_read.get_mut(index)) {
            *slot = Some(value);
            *read = Some(at);
        }
    }

    pub(crate) fn set_composite(&mut self, index: usize, value: Option<f64>) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    /// Makes the register due on the next scan. The value is kept.
    pub(crate) fn invalidate_last_read(&mut self, index: usize) {
        if let Some(read) = self.last_read.get_mut(index) {
            *read = None;
        }
    }

    /// Point-in-time copy keyed by register name.
    pub fn snapshot(&self, catalog: &Catalog, last_update_succeeded: bool, updated_at: Option<Instant>) -> Snapshot {
        let values = catalog
            .iter()
            .enumerate()
            .map(|(index, def)| (def.key().to_string(), self.value(index)))
            .collect();
        let last_read = catalog
            .iter()
            .enumerate()
            .filter_map(|(index, def)| Some((def.key().to_string(), self.last_read(index)?)))
            .collect();
        Snapshot {
            values,
            last_read,
            last_update_succeeded,
            updated_at,
        }
    }
}

/// Immutable view of all register values at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    values: BTreeMap<String, Option<f64>>,
    last_read: BTreeMap<String, Instant>,
    last_update_succeeded: bool,
    updated_at: Option<Instant>,
}

impl Snapshot {
    /// `None` both for unknown keys and registers that were never read.
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied().flatten()
    }

    /// Time of the last successful read of a register. Cleared by a write
    /// until the register is read back; always `None` for composites.
    pub fn last_read(&self, key: &str) -> Option<Instant> {
        self.last_read.get(key).copied()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// All registers in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<f64>)> {
        self.values.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every block attempted in the last scan was read successfully.
    pub fn last_update_succeeded(&self) -> bool {
        self.last_update_succeeded
    }

    pub fn updated_at(&self) -> Option<Instant> {
        self.updated_at
    }

    /// Value rounded to the register's precision.
    pub fn display_value(&self, catalog: &Catalog, key: &str) -> Option<f64> {
        let value = self.get(key)?;
        match catalog.get(key).and_then(RegisterDef::precision) {
            Some(digits) => Some(round_to(value, digits)),
            None => Some(value),
        }
    }

    /// Label of the current value of an enumerated register.
    pub fn option_label<'a>(&self, catalog: &'a Catalog, key: &str) -> Option<&'a str> {
        let def = catalog.get(key)?.as_primitive()?;
        let value = self.get(key)?;
        let raw = (value / def.scale).round() as i64;
        def.options.get(&raw).map(String::as_str)
    }

    /// Switch state: on is exactly 1, every other value is off.
    pub fn is_on(&self, key: &str) -> Option<bool> {
        self.get(key).map(|value| value == 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Primitive;
    use std::collections::BTreeMap;

    fn catalog() -> Catalog {
        let mut voltage = Primitive::new("voltage", 1);
        voltage.scale = 0.1;
        voltage.precision = Some(1);
        let mut mode = Primitive::new("mode", 2);
        mode.writable = true;
        mode.options = BTreeMap::from([(0, "Solar".to_string()), (3, "Grid".to_string())]);
        let switch = Primitive::new("switch", 3);
        Catalog::validate(vec![
            RegisterDef::Primitive(voltage),
            RegisterDef::Primitive(mode),
            RegisterDef::Primitive(switch),
        ])
        .unwrap()
    }

    #[test]
    fn starts_unknown() {
        let catalog = catalog();
        let store = StateStore::new(&catalog);
        let snapshot = store.snapshot(&catalog, false, None);
        assert_eq!(snapshot.len(), 3);
        assert!(snapshot.contains_key("voltage"));
        assert_eq!(snapshot.get("voltage"), None);
        assert_eq!(snapshot.get("missing"), None);
        assert!(snapshot.iter().all(|(_, value)| value.is_none()));
        assert_eq!(store.last_read(0), None);
    }

    #[test]
    fn presentation_helpers() {
        let catalog = catalog();
        let mut store = StateStore::new(&catalog);
        let now = Instant::now();
        store.record_read(0, 2301.0 * 0.1 + 0.04, now);
        store.record_read(1, 3.0, now);
        store.record_read(2, 1.0, now);

        let snapshot = store.snapshot(&catalog, true, Some(now));
        assert!(snapshot.last_update_succeeded());
        assert_eq!(snapshot.display_value(&catalog, "voltage"), Some(230.1));
        assert_eq!(snapshot.option_label(&catalog, "mode"), Some("Grid"));
        assert_eq!(snapshot.option_label(&catalog, "switch"), None);
        assert_eq!(snapshot.is_on("switch"), Some(true));
        assert_eq!(snapshot.is_on("missing"), None);
        assert_eq!(store.last_read(1), Some(now));
        assert_eq!(snapshot.last_read("mode"), Some(now));
    }

    #[test]
    fn switch_is_on_only_at_one() {
        let catalog = catalog();
        let mut store = StateStore::new(&catalog);
        let now = Instant::now();
        for (raw, on) in [(0.0, false), (1.0, true), (2.0, false), (255.0, false)] {
            store.record_read(2, raw, now);
            assert_eq!(store.snapshot(&catalog, true, Some(now)).is_on("switch"), Some(on), "raw {raw}");
        }
    }

    #[test]
    fn invalidation_keeps_the_value() {
        let catalog = catalog();
        let mut store = StateStore::new(&catalog);
        store.record_read(2, 0.0, Instant::now());
        store.invalidate_last_read(2);
        assert_eq!(store.last_read(2), None);
        assert_eq!(store.value(2), Some(0.0));

        let snapshot = store.snapshot(&catalog, true, None);
        assert_eq!(snapshot.last_read("switch"), None);
        assert_eq!(snapshot.get("switch"), Some(0.0));
    }
}
