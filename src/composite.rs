//! Evaluation of composite registers.

use crate::catalog::Catalog;
use crate::protocol::round_to;
use crate::store::StateStore;

/// Recomputes every composite from the current store values.
///
/// Composites are visited in dependency order, so a composite built from
/// other composites always sees their fresh values. A composite with any
/// unknown source becomes unknown itself; a stale value is never kept.
pub fn resolve(store: &mut StateStore, catalog: &Catalog) {
    for step in catalog.composite_order() {
        let sum = step
            .sources
            .iter()
            .map(|(index, factor)| store.value(*index).map(|value| value * factor))
            .sum::<Option<f64>>();
        let value = match (sum, step.precision) {
            (Some(sum), Some(digits)) => Some(round_to(sum, digits)),
            (sum, _) => sum,
        };
        store.set_composite(step.index, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Composite, CompositeSource, Primitive, RegisterDef};
    use tokio::time::Instant;

    fn source(key: &str, factor: f64) -> CompositeSource {
        CompositeSource {
            key: key.to_string(),
            factor,
        }
    }

    fn catalog() -> Catalog {
        Catalog::validate(vec![
            RegisterDef::Composite(Composite {
                key: "doubled".to_string(),
                sources: vec![source("energy", 2.0)],
                precision: None,
                unit: None,
            }),
            RegisterDef::Primitive(Primitive::new("energy_h", 1)),
            RegisterDef::Primitive(Primitive::new("energy_l", 2)),
            RegisterDef::Composite(Composite {
                key: "energy".to_string(),
                sources: vec![source("energy_h", 1.0), source("energy_l", 0.001)],
                precision: Some(3),
                unit: Some("kWh".to_string()),
            }),
        ])
        .unwrap()
    }

    #[test]
    fn weighted_sum() {
        let catalog = catalog();
        let mut store = StateStore::new(&catalog);
        let now = Instant::now();
        store.record_read(1, 1000.0, now);
        store.record_read(2, 100.0, now);
        resolve(&mut store, &catalog);
        assert_eq!(store.value(3), Some(1000.1));
        assert_eq!(store.value(0), Some(2000.2));
    }

    #[test]
    fn unknown_source_makes_unknown() {
        let catalog = catalog();
        let mut store = StateStore::new(&catalog);
        store.record_read(1, 1000.0, Instant::now());
        resolve(&mut store, &catalog);
        assert_eq!(store.value(3), None);
        assert_eq!(store.value(0), None);
    }
}
