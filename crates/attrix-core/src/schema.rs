//! Schema registry: the ordered set of attribute definitions every job's
//! result must conform to.
//!
//! Snapshots are immutable `Arc`s; mutation swaps in a new snapshot so a
//! scheduler run holding an older one is never affected mid-flight.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::models::SchemaItem;

/// Immutable, cheaply clonable view of the schema at one point in time.
pub type SchemaSnapshot = Arc<Vec<SchemaItem>>;

/// Thread-safe holder of the active schema.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    current: Arc<RwLock<SchemaSnapshot>>,
}

impl SchemaRegistry {
    /// Create a registry from a validated item list.
    pub fn new(items: Vec<SchemaItem>) -> Result<Self> {
        validate_schema(&items)?;
        Ok(Self {
            current: Arc::new(RwLock::new(Arc::new(items))),
        })
    }

    /// Registry seeded with [`default_schema`].
    pub fn with_defaults() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(default_schema()))),
        }
    }

    /// Current snapshot.
    pub fn get(&self) -> SchemaSnapshot {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Append `value` to the allowed values of the select item `key`.
    ///
    /// Idempotent: if the value is already present (exact match) the current
    /// snapshot is returned unchanged.
    pub fn add_allowed_value(&self, key: &str, value: &str) -> Result<SchemaSnapshot> {
        let value = value.trim();
        if value.is_empty() {
            return Err(Error::InvalidInput("allowed value cannot be empty".into()));
        }

        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let idx = guard
            .iter()
            .position(|item| item.key == key && item.is_select())
            .ok_or_else(|| Error::UnknownKey(key.to_string()))?;

        if guard[idx].allowed_values.iter().any(|v| v == value) {
            debug!(schema_key = key, value, "Allowed value already present");
            return Ok(guard.clone());
        }

        let mut next = guard.as_ref().clone();
        next[idx].allowed_values.push(value.to_string());
        *guard = Arc::new(next);

        info!(schema_key = key, value, "Added allowed value");
        Ok(guard.clone())
    }

    /// Replace the whole schema (e.g. with a persisted snapshot).
    pub fn replace(&self, items: Vec<SchemaItem>) -> Result<SchemaSnapshot> {
        validate_schema(&items)?;
        let snapshot = Arc::new(items);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        Ok(snapshot)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Check schema invariants: non-empty unique keys, no duplicate allowed
/// values within an item.
pub fn validate_schema(items: &[SchemaItem]) -> Result<()> {
    let mut keys = HashSet::new();
    for item in items {
        if item.key.trim().is_empty() {
            return Err(Error::InvalidInput("schema key cannot be empty".into()));
        }
        if !keys.insert(item.key.as_str()) {
            return Err(Error::InvalidInput(format!(
                "duplicate schema key: {}",
                item.key
            )));
        }
        let mut seen = HashSet::new();
        for value in &item.allowed_values {
            if !seen.insert(value.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate allowed value '{}' for key {}",
                    value, item.key
                )));
            }
        }
    }
    Ok(())
}

/// Schema used when nothing has been persisted yet: a generic apparel
/// catalogue attribute set.
pub fn default_schema() -> Vec<SchemaItem> {
    vec![
        SchemaItem::select(
            "category",
            "Category",
            ["Top", "Bottom", "Dress", "Outerwear", "Footwear", "Accessory"],
        )
        .with_required(true),
        SchemaItem::select(
            "color",
            "Color",
            [
                "BLACK", "WHITE", "GREY", "RED", "BLUE", "GREEN", "YELLOW", "BROWN", "PINK",
                "MULTI",
            ],
        )
        .with_required(true),
        SchemaItem::select(
            "pattern",
            "Pattern",
            ["Solid", "Striped", "Checked", "Floral", "Graphic"],
        ),
        SchemaItem::text("material", "Material"),
        SchemaItem::text("brand", "Brand"),
        SchemaItem::number("size_count", "Sizes Shown"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(vec![
            SchemaItem::select("color", "Color", ["RED", "BLUE"]),
            SchemaItem::text("material", "Material"),
        ])
        .unwrap()
    }

    #[test]
    fn test_get_preserves_order() {
        let snapshot = registry().get();
        let keys: Vec<_> = snapshot.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["color", "material"]);
    }

    #[test]
    fn test_add_allowed_value_appends() {
        let reg = registry();
        let snapshot = reg.add_allowed_value("color", "TEAL").unwrap();
        assert_eq!(snapshot[0].allowed_values, vec!["RED", "BLUE", "TEAL"]);
        assert_eq!(reg.get()[0].allowed_values, vec!["RED", "BLUE", "TEAL"]);
    }

    #[test]
    fn test_add_allowed_value_idempotent() {
        let once = registry();
        once.add_allowed_value("color", "TEAL").unwrap();

        let twice = registry();
        twice.add_allowed_value("color", "TEAL").unwrap();
        twice.add_allowed_value("color", "TEAL").unwrap();

        assert_eq!(once.get()[0].allowed_values, twice.get()[0].allowed_values);
    }

    #[test]
    fn test_add_allowed_value_unknown_key() {
        let err = registry().add_allowed_value("size", "XL").unwrap_err();
        assert!(matches!(err, Error::UnknownKey(k) if k == "size"));
    }

    #[test]
    fn test_add_allowed_value_rejects_non_select() {
        let err = registry().add_allowed_value("material", "wool").unwrap_err();
        assert!(matches!(err, Error::UnknownKey(_)));
    }

    #[test]
    fn test_old_snapshot_unaffected_by_mutation() {
        let reg = registry();
        let before = reg.get();
        reg.add_allowed_value("color", "TEAL").unwrap();
        assert_eq!(before[0].allowed_values, vec!["RED", "BLUE"]);
    }

    #[test]
    fn test_validate_rejects_duplicate_keys() {
        let err = SchemaRegistry::new(vec![
            SchemaItem::text("color", "Color"),
            SchemaItem::text("color", "Colour"),
        ])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_validate_rejects_duplicate_allowed_values() {
        let err = SchemaRegistry::new(vec![SchemaItem::select(
            "color",
            "Color",
            ["RED", "RED"],
        )])
        .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_default_schema_is_valid() {
        assert!(validate_schema(&default_schema()).is_ok());
        assert!(!SchemaRegistry::with_defaults().get().is_empty());
    }
}
