//! Per-field type definitions, resolved once per field name and memoized.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::errors::{Result, StageOrigin};
use crate::fault::invoke;
use crate::item::{Item, ItemType, Value};

/// Caller-supplied resolver: field name -> (type, output format).
pub type TypeDefiner = Arc<dyn Fn(&str) -> anyhow::Result<(ItemType, String)> + Send + Sync>;

/// Resolved definition for one field name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub item_type: ItemType,
    #[serde(default)]
    pub format: String,
}

impl TypeDefinition {
    pub fn new(item_type: ItemType, format: impl Into<String>) -> Self {
        Self {
            item_type,
            format: format.into(),
        }
    }

    /// Parse external text according to this definition.
    pub fn parse(&self, text: &str) -> Value {
        Value::parse(text, self.item_type, &self.format)
    }

    /// Construct an item for `key` from external text.
    pub fn create_item(&self, key: &str, text: &str) -> Item {
        Item::new(key, self.parse(text), self.format.as_str())
    }

    /// Construct an item for `key` from an already typed value.
    pub fn create_typed_item(&self, key: &str, value: Value) -> Item {
        Item::new(key, value, self.format.as_str())
    }
}

impl Default for TypeDefinition {
    fn default() -> Self {
        Self::new(ItemType::String, "")
    }
}

/// A seeded field definition as it appears in settings files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldTypeSpec {
    pub field: String,
    pub item_type: ItemType,
    #[serde(default)]
    pub format: String,
}

/// Thread-safe memo table of [`TypeDefinition`]s keyed by field name.
///
/// Racing first lookups for the same field may both call the resolver; the
/// resolver is expected to be pure, so whichever insert lands last is equivalent.
pub struct TypeDefinitions {
    definer: Option<TypeDefiner>,
    cache: RwLock<HashMap<String, TypeDefinition>>,
}

impl TypeDefinitions {
    pub fn new(definer: Option<TypeDefiner>, seed: impl IntoIterator<Item = FieldTypeSpec>) -> Self {
        let cache = seed
            .into_iter()
            .map(|entry| (entry.field, TypeDefinition::new(entry.item_type, entry.format)))
            .collect();
        Self {
            definer,
            cache: RwLock::new(cache),
        }
    }

    /// Every field is a string with no format.
    pub fn untyped() -> Self {
        Self::new(None, Vec::new())
    }

    /// Look up (or resolve and memoize) the definition for `field`.
    ///
    /// A failing or panicking resolver is reported as a caller fault attributed to
    /// `origin`, the stage that triggered the lookup.
    pub fn get(&self, field: &str, origin: StageOrigin) -> Result<TypeDefinition> {
        if let Some(found) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(field)
        {
            return Ok(found.clone());
        }

        let definition = match &self.definer {
            None => TypeDefinition::default(),
            Some(definer) => {
                let (item_type, format) = invoke(
                    origin,
                    || format!("defining type of field '{}'", field),
                    || definer(field),
                )?;
                TypeDefinition::new(item_type, format)
            },
        };

        tracing::trace!(field, item_type = ?definition.item_type, "type definition resolved");
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field.to_string(), definition.clone());
        Ok(definition)
    }

    /// Number of memoized definitions.
    pub fn len(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TypeDefinitions {
    fn default() -> Self {
        Self::untyped()
    }
}

impl std::fmt::Debug for TypeDefinitions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDefinitions")
            .field("has_definer", &self.definer.is_some())
            .field("memoized", &self.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::errors::PipelineError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_untyped_defaults_to_string() {
        let types = TypeDefinitions::untyped();
        let def = types.get("NAME", StageOrigin::LineParsing).unwrap();
        assert_eq!(def, TypeDefinition::new(ItemType::String, ""));
        assert_eq!(types.len(), 1);
    }

    #[test]
    fn test_definer_is_called_once_per_field() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let definer: TypeDefiner = Arc::new(move |field| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(if field == "NUM" {
                (ItemType::Int, String::new())
            } else {
                (ItemType::String, String::new())
            })
        });
        let types = TypeDefinitions::new(Some(definer), Vec::new());

        for _ in 0..5 {
            assert_eq!(
                types.get("NUM", StageOrigin::LineParsing).unwrap().item_type,
                ItemType::Int
            );
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_seed_wins_over_definer() {
        let definer: TypeDefiner = Arc::new(|_| Ok((ItemType::Bool, String::new())));
        let seed = vec![FieldTypeSpec {
            field: "AMT".to_string(),
            item_type: ItemType::Decimal,
            format: "2".to_string(),
        }];
        let types = TypeDefinitions::new(Some(definer), seed);

        let def = types.get("AMT", StageOrigin::LineParsing).unwrap();
        assert_eq!(def.item_type, ItemType::Decimal);
        assert_eq!(def.create_item("AMT", "3").string_value(), "3.00");
    }

    #[test]
    fn test_failing_definer_is_caller_fault() {
        let definer: TypeDefiner = Arc::new(|f| anyhow::bail!("no type for {}", f));
        let types = TypeDefinitions::new(Some(definer), Vec::new());

        let err = types.get("X", StageOrigin::Transforming).unwrap_err();
        match err {
            PipelineError::CallerFault { origin, .. } => {
                assert_eq!(origin, StageOrigin::Transforming)
            },
            other => panic!("unexpected error: {other}"),
        }
        assert!(types.is_empty());
    }

    #[test]
    fn test_panicking_definer_is_caller_fault() {
        let definer: TypeDefiner = Arc::new(|_: &str| -> anyhow::Result<(ItemType, String)> {
            panic!("definer bug")
        });
        let types = TypeDefinitions::new(Some(definer), Vec::new());

        let err = types.get("WHEN", StageOrigin::LineParsing).unwrap_err();
        assert_eq!(
            err.to_string(),
            "line parsing block failed defining type of field 'WHEN': panicked: definer bug"
        );
        assert!(types.is_empty());
    }

    #[test]
    fn test_concurrent_lookups_agree() {
        let definer: TypeDefiner = Arc::new(|_| Ok((ItemType::Int, "4".to_string())));
        let types = Arc::new(TypeDefinitions::new(Some(definer), Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let types = types.clone();
                std::thread::spawn(move || types.get("QTY", StageOrigin::Transforming).unwrap())
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), TypeDefinition::new(ItemType::Int, "4"));
        }
        assert_eq!(types.len(), 1);
    }
}
