//! Records: ordered, key-unique collections of items.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::errors::{PipelineError, Result, StageOrigin};
use crate::global_cache::GlobalCache;
use crate::item::{Item, Value};
use crate::readonly::{ReadOnlyMode, ReadOnlyRecord};
use crate::types::TypeDefinitions;

/// Mutable caller bookkeeping attached to a record or cluster.
pub type PropertyBin = HashMap<String, serde_json::Value>;

/// Read-only trace data, set at most once per record.
pub type TraceBin = BTreeMap<String, serde_json::Value>;

static VOID: Value = Value::Void;

/// What to do when a record is built from items that repeat a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateKeyPolicy {
    /// First occurrence wins; later ones are logged and skipped.
    #[default]
    IgnoreItem,
    /// Last occurrence wins; earlier ones are logged and replaced.
    ReplaceItem,
    /// The whole record is dropped and an error is logged.
    ExcludeRecord,
    /// Reserved; not implemented.
    AssignDefaultKey,
}

/// Which entities carry a [`PropertyBin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PropertyBinEntities {
    pub records: bool,
    pub clusters: bool,
}

/// Outcome of a field-set mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemChange {
    Applied,
    NotFound,
    AlreadyExists,
    /// Transformations may not alter the field set in this run.
    Disallowed,
    /// Swallowed by a read-only projection.
    Ignored,
}

impl ItemChange {
    pub fn is_applied(self) -> bool {
        self == ItemChange::Applied
    }
}

/// Field names seen so far, in first-seen order.
#[derive(Debug, Default)]
pub struct FieldRegistry {
    fields: RwLock<IndexSet<String>>,
}

impl FieldRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &str) {
        if self.contains(key) {
            return;
        }
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }
}

/// Run-wide services and policies shared by every record and cluster.
#[derive(Debug)]
pub struct RecordContext {
    pub types: Arc<TypeDefinitions>,
    pub global_cache: Arc<GlobalCache>,
    pub fields: Arc<FieldRegistry>,
    pub allow_alter_fields: bool,
    pub duplicate_policy: DuplicateKeyPolicy,
    pub bins: PropertyBinEntities,
}

impl RecordContext {
    pub fn new(
        types: Arc<TypeDefinitions>,
        global_cache: Arc<GlobalCache>,
        allow_alter_fields: bool,
        duplicate_policy: DuplicateKeyPolicy,
        bins: PropertyBinEntities,
    ) -> Self {
        Self {
            types,
            global_cache,
            fields: Arc::new(FieldRegistry::new()),
            allow_alter_fields,
            duplicate_policy,
            bins,
        }
    }
}

/// A single data row.
#[derive(Debug, Clone)]
pub struct Record {
    items: IndexMap<String, Item>,
    rec_no: i64,
    source_no: usize,
    target_no: usize,
    clstr_no: u64,
    trace_bin: Option<Arc<TraceBin>>,
    property_bin: Option<PropertyBin>,
    ctx: Arc<RecordContext>,
}

impl Record {
    /// Build a record, resolving repeated keys with the context's
    /// [`DuplicateKeyPolicy`]. Returns `Ok(None)` when the policy excludes it.
    pub fn new(
        items: impl IntoIterator<Item = Item>,
        rec_no: i64,
        source_no: usize,
        ctx: Arc<RecordContext>,
    ) -> Result<Option<Record>> {
        let mut map: IndexMap<String, Item> = IndexMap::new();
        for item in items {
            if item.is_void() {
                continue;
            }
            if !map.contains_key(item.key()) {
                map.insert(item.key().to_string(), item);
                continue;
            }
            match ctx.duplicate_policy {
                DuplicateKeyPolicy::IgnoreItem => {
                    tracing::warn!(rec_no, key = item.key(), "duplicate key ignored");
                },
                DuplicateKeyPolicy::ReplaceItem => {
                    tracing::warn!(rec_no, key = item.key(), "duplicate key replaced");
                    map.insert(item.key().to_string(), item);
                },
                DuplicateKeyPolicy::ExcludeRecord => {
                    tracing::error!(rec_no, key = item.key(), "record excluded due to duplicate key");
                    return Ok(None);
                },
                DuplicateKeyPolicy::AssignDefaultKey => {
                    return Err(PipelineError::NotImplemented(
                        "AssignDefaultKey duplicate key policy",
                    ));
                },
            }
        }

        let property_bin = ctx.bins.records.then(PropertyBin::new);
        Ok(Some(Record {
            items: map,
            rec_no,
            source_no,
            target_no: 0,
            clstr_no: 0,
            trace_bin: None,
            property_bin,
            ctx,
        }))
    }

    /// The item for `key`, or the void sentinel when the key is absent.
    pub fn get(&self, key: &str) -> Item {
        self.items
            .get(key)
            .cloned()
            .unwrap_or_else(|| Item::void(key))
    }

    pub fn item(&self, key: &str) -> Option<&Item> {
        self.items.get(key)
    }

    pub fn item_at(&self, index: usize) -> Option<&Item> {
        self.items.get_index(index).map(|(_, item)| item)
    }

    /// The value for `key`; [`Value::Void`] when absent.
    pub fn value(&self, key: &str) -> &Value {
        self.items.get(key).map(Item::value).unwrap_or(&VOID)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.items.keys().map(String::as_str)
    }

    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the value of an existing key, keeping its position and format.
    /// Returns `false` if the key is absent.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> bool {
        match self.items.get_mut(key) {
            Some(item) => {
                *item = item.with_value(value);
                true
            },
            None => false,
        }
    }

    /// Append a new item; its format comes from the field's type definition.
    pub fn add_item(&mut self, key: &str, value: impl Into<Value>) -> Result<ItemChange> {
        if !self.ctx.allow_alter_fields {
            return Ok(ItemChange::Disallowed);
        }
        if self.items.contains_key(key) {
            return Ok(ItemChange::AlreadyExists);
        }
        let definition = self.ctx.types.get(key, StageOrigin::Transforming)?;
        self.items
            .insert(key.to_string(), definition.create_typed_item(key, value.into()));
        self.ctx.fields.register(key);
        Ok(ItemChange::Applied)
    }

    /// Append a new item parsed from text per the field's type definition.
    pub fn add_item_from_text(&mut self, key: &str, text: &str) -> Result<ItemChange> {
        if !self.ctx.allow_alter_fields {
            return Ok(ItemChange::Disallowed);
        }
        let definition = self.ctx.types.get(key, StageOrigin::Transforming)?;
        self.add_item(key, definition.parse(text))
    }

    pub fn remove_item(&mut self, key: &str) -> ItemChange {
        if !self.ctx.allow_alter_fields {
            return ItemChange::Disallowed;
        }
        match self.items.shift_remove(key) {
            Some(_) => ItemChange::Applied,
            None => ItemChange::NotFound,
        }
    }

    /// 1-based intake sequence number.
    pub fn rec_no(&self) -> i64 {
        self.rec_no
    }

    pub fn source_no(&self) -> usize {
        self.source_no
    }

    /// Output target; 0 until routed.
    pub fn target_no(&self) -> usize {
        self.target_no
    }

    pub fn set_target_no(&mut self, target_no: usize) {
        self.target_no = target_no;
    }

    pub fn clstr_no(&self) -> u64 {
        self.clstr_no
    }

    pub(crate) fn assign_clstr_no(&mut self, clstr_no: u64) {
        self.clstr_no = clstr_no;
    }

    pub fn trace_bin(&self) -> Option<&TraceBin> {
        self.trace_bin.as_deref()
    }

    /// Attach trace data. Returns `false` if this record already has some.
    pub fn init_trace_bin(&mut self, bin: TraceBin) -> bool {
        if self.trace_bin.is_some() {
            return false;
        }
        self.trace_bin = Some(Arc::new(bin));
        true
    }

    /// `None` unless property bins are enabled for records.
    pub fn property_bin(&self) -> Option<&PropertyBin> {
        self.property_bin.as_ref()
    }

    pub fn property_bin_mut(&mut self) -> Option<&mut PropertyBin> {
        self.property_bin.as_mut()
    }

    /// A record with the same numbers and bins but no items.
    ///
    /// When the run forbids altering fields, the result can never gain items.
    pub fn get_empty_clone(&self) -> Record {
        if !self.ctx.allow_alter_fields {
            tracing::warn!(
                rec_no = self.rec_no,
                "empty clone created while fields may not be altered; it cannot be populated"
            );
        }
        Record {
            items: IndexMap::new(),
            rec_no: self.rec_no,
            source_no: self.source_no,
            target_no: self.target_no,
            clstr_no: self.clstr_no,
            trace_bin: self.trace_bin.clone(),
            property_bin: self.property_bin.clone(),
            ctx: self.ctx.clone(),
        }
    }

    pub fn global_cache(&self) -> &GlobalCache {
        &self.ctx.global_cache
    }

    pub fn context(&self) -> &Arc<RecordContext> {
        &self.ctx
    }

    pub fn read_only(&self, mode: ReadOnlyMode) -> ReadOnlyRecord<'_> {
        ReadOnlyRecord::new(self, mode)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::time::Duration;

    pub(crate) fn context(allow_alter: bool, policy: DuplicateKeyPolicy) -> Arc<RecordContext> {
        Arc::new(RecordContext::new(
            Arc::new(TypeDefinitions::untyped()),
            Arc::new(GlobalCache::new(Vec::new(), Duration::from_millis(1))),
            allow_alter,
            policy,
            PropertyBinEntities {
                records: true,
                clusters: true,
            },
        ))
    }

    pub(crate) fn record(pairs: &[(&str, &str)], rec_no: i64, ctx: &Arc<RecordContext>) -> Record {
        let items = pairs.iter().map(|(k, v)| Item::new(*k, *v, ""));
        match Record::new(items, rec_no, 1, ctx.clone()) {
            Ok(Some(record)) => record,
            other => panic!("test record not built: {:?}", other.map(|r| r.is_some())),
        }
    }
}
