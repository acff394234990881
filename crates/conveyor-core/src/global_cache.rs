//! Process-lifetime shared key/value store plus signals for cross-stage
//! synchronization.
//!
//! The key set is fixed at construction. Values change only through
//! compare-and-swap or the helpers built on it. Waiting on signals and
//! conditions polls at the configured interval instead of using condition
//! variables, so a wait never holds a lock another stage needs; the price is
//! up to one interval of extra latency.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tokio::runtime::{Handle, RuntimeFlavor};

use crate::errors::{PipelineError, Result};
use crate::item::parse_datetime;

/// A value held in the [`GlobalCache`].
#[derive(Clone)]
pub enum CacheValue {
    Int(i64),
    Decimal(Decimal),
    DateTime(NaiveDateTime),
    String(String),
    /// Opaque caller object; equality is identity.
    Object(Arc<dyn Any + Send + Sync>),
}

impl CacheValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            CacheValue::Int(_) => "int",
            CacheValue::Decimal(_) => "decimal",
            CacheValue::DateTime(_) => "datetime",
            CacheValue::String(_) => "string",
            CacheValue::Object(_) => "object",
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CacheValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            CacheValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CacheValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            CacheValue::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    pub fn downcast_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            CacheValue::Object(obj) => obj.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Parse a settings element of the form `key|value`.
    ///
    /// The value is read as an int, then a decimal, then a date/time, and
    /// otherwise kept as a string. A missing value yields an empty string.
    pub fn parse_element(element: &str) -> Result<(String, CacheValue)> {
        let (key, raw) = match element.split_once('|') {
            Some((key, raw)) => (key.trim(), Some(raw)),
            None => (element.trim(), None),
        };
        if key.is_empty() {
            return Err(PipelineError::Config(format!(
                "global cache element '{}' has no key",
                element
            )));
        }

        let value = match raw {
            None => CacheValue::String(String::new()),
            Some(raw) => {
                let trimmed = raw.trim();
                if let Ok(i) = trimmed.parse::<i64>() {
                    CacheValue::Int(i)
                } else if let Ok(d) = Decimal::from_str(trimmed) {
                    CacheValue::Decimal(d)
                } else if let Some(dt) = parse_datetime(trimmed, "") {
                    CacheValue::DateTime(dt)
                } else {
                    CacheValue::String(raw.to_string())
                }
            },
        };
        Ok((key.to_string(), value))
    }
}

impl PartialEq for CacheValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CacheValue::Int(a), CacheValue::Int(b)) => a == b,
            (CacheValue::Decimal(a), CacheValue::Decimal(b)) => a == b,
            (CacheValue::DateTime(a), CacheValue::DateTime(b)) => a == b,
            (CacheValue::String(a), CacheValue::String(b)) => a == b,
            (CacheValue::Object(a), CacheValue::Object(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl std::fmt::Debug for CacheValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheValue::Int(i) => write!(f, "Int({})", i),
            CacheValue::Decimal(d) => write!(f, "Decimal({})", d),
            CacheValue::DateTime(dt) => write!(f, "DateTime({})", dt),
            CacheValue::String(s) => write!(f, "String({:?})", s),
            CacheValue::Object(_) => f.write_str("Object(..)"),
        }
    }
}

impl From<i64> for CacheValue {
    fn from(i: i64) -> Self {
        CacheValue::Int(i)
    }
}

impl From<Decimal> for CacheValue {
    fn from(d: Decimal) -> Self {
        CacheValue::Decimal(d)
    }
}

impl From<&str> for CacheValue {
    fn from(s: &str) -> Self {
        CacheValue::String(s.to_string())
    }
}

impl From<String> for CacheValue {
    fn from(s: String) -> Self {
        CacheValue::String(s)
    }
}

impl From<NaiveDateTime> for CacheValue {
    fn from(dt: NaiveDateTime) -> Self {
        CacheValue::DateTime(dt)
    }
}

/// Shared key/value store with a fixed key set.
pub struct GlobalCache {
    entries: HashMap<String, Mutex<CacheValue>>,
    signals: RwLock<HashSet<String>>,
    poll_interval: Duration,
}

impl GlobalCache {
    pub fn new(
        elements: impl IntoIterator<Item = (String, CacheValue)>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            entries: elements
                .into_iter()
                .map(|(key, value)| (key, Mutex::new(value)))
                .collect(),
            signals: RwLock::new(HashSet::new()),
            poll_interval,
        }
    }

    /// Build from `key|value` settings elements.
    pub fn from_elements(elements: &[String], poll_interval: Duration) -> Result<Self> {
        let parsed = elements
            .iter()
            .map(|e| CacheValue::parse_element(e))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(parsed, poll_interval))
    }

    fn entry(&self, key: &str) -> Result<&Mutex<CacheValue>> {
        self.entries
            .get(key)
            .ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))
    }

    /// Current value of `key`, or `None` if the key was never declared.
    pub fn get(&self, key: &str) -> Option<CacheValue> {
        self.entries
            .get(key)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Replace the value of `key` with `new_value` if it still equals `expected`.
    pub fn compare_and_swap(
        &self,
        key: &str,
        new_value: CacheValue,
        expected: &CacheValue,
    ) -> Result<bool> {
        let mut current = self
            .entry(key)?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if &*current == expected {
            *current = new_value;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Apply `formula` to the current value until the swap succeeds. Returns the
    /// value that was stored. `formula` may run more than once under contention.
    pub fn replace_via_formula(
        &self,
        key: &str,
        formula: impl Fn(&CacheValue) -> CacheValue,
    ) -> Result<CacheValue> {
        loop {
            let current = self.get(key).ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))?;
            let proposed = formula(&current);
            if self.compare_and_swap(key, proposed.clone(), &current)? {
                return Ok(proposed);
            }
        }
    }

    /// Add `delta` to an integer entry and return the new value.
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        loop {
            let current = self.get(key).ok_or_else(|| PipelineError::KeyNotFound(key.to_string()))?;
            let Some(old) = current.as_int() else {
                return Err(PipelineError::TypeMismatch {
                    key: key.to_string(),
                    expected: "int",
                });
            };
            let new = old.wrapping_add(delta);
            if self.compare_and_swap(key, CacheValue::Int(new), &current)? {
                return Ok(new);
            }
        }
    }

    /// Raise a signal. Raising twice is harmless.
    pub fn raise_signal(&self, name: &str) {
        let newly = self
            .signals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string());
        if newly {
            tracing::debug!(signal = name, "global cache signal raised");
        }
    }

    pub fn is_signal_raised(&self, name: &str) -> bool {
        self.signals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }

    /// Block the current thread until `name` is raised.
    ///
    /// Meant for synchronous callbacks such as cluster markers. On a
    /// multi-threaded tokio worker the wait is moved off the worker with
    /// `block_in_place`; on a current-thread runtime it blocks the runtime,
    /// so async code should use [`await_signal_async`](Self::await_signal_async).
    pub fn await_signal(&self, name: &str) {
        self.block_until(|cache| cache.is_signal_raised(name));
    }

    pub async fn await_signal_async(&self, name: &str) {
        while !self.is_signal_raised(name) {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Block the current thread until `condition(self)` holds. Blocks like
    /// [`await_signal`](Self::await_signal).
    pub fn await_condition(&self, condition: impl Fn(&GlobalCache) -> bool) {
        self.block_until(condition);
    }

    fn block_until(&self, condition: impl Fn(&GlobalCache) -> bool) {
        let poll = || {
            while !condition(self) {
                std::thread::sleep(self.poll_interval);
            }
        };
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(poll)
            },
            _ => poll(),
        }
    }

    pub async fn await_condition_async(&self, condition: impl Fn(&GlobalCache) -> bool) {
        while !condition(self) {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> BTreeMap<String, CacheValue> {
        self.entries
            .iter()
            .map(|(key, slot)| {
                (
                    key.clone(),
                    slot.lock().unwrap_or_else(PoisonError::into_inner).clone(),
                )
            })
            .collect()
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl std::fmt::Debug for GlobalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalCache")
            .field("entries", &self.snapshot())
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cache() -> GlobalCache {
        GlobalCache::from_elements(
            &[
                "Count|0".to_string(),
                "Total|0.5".to_string(),
                "Label|abc".to_string(),
                "Since|2020-01-31".to_string(),
                "Empty".to_string(),
            ],
            Duration::from_millis(5),
        )
        .unwrap()
    }

    #[test]
    fn test_parse_elements_infers_types() {
        let cache = cache();
        assert_eq!(cache.get("Count"), Some(CacheValue::Int(0)));
        assert_eq!(cache.get("Total"), Some(CacheValue::Decimal(Decimal::new(5, 1))));
        assert_eq!(cache.get("Label"), Some(CacheValue::String("abc".into())));
        assert_eq!(cache.get("Since").unwrap().type_name(), "datetime");
        assert_eq!(cache.get("Empty"), Some(CacheValue::String(String::new())));
        assert!(CacheValue::parse_element("|5").is_err());
    }

    #[test]
    fn test_unknown_keys_are_never_created() {
        let cache = cache();
        assert_eq!(cache.get("Nope"), None);
        assert!(matches!(
            cache.compare_and_swap("Nope", 1.into(), &0.into()),
            Err(PipelineError::KeyNotFound(_))
        ));
        assert!(matches!(cache.increment("Nope", 1), Err(PipelineError::KeyNotFound(_))));
        assert!(!cache.contains_key("Nope"));
    }

    #[test]
    fn test_compare_and_swap_requires_expected_value() {
        let cache = cache();
        assert!(!cache.compare_and_swap("Count", 5.into(), &1.into()).unwrap());
        assert!(cache.compare_and_swap("Count", 5.into(), &0.into()).unwrap());
        assert_eq!(cache.get("Count").unwrap().as_int(), Some(5));
    }

    #[test]
    fn test_increment_rejects_non_integer() {
        let cache = cache();
        assert!(matches!(
            cache.increment("Label", 1),
            Err(PipelineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_replace_via_formula() {
        let cache = cache();
        let stored = cache
            .replace_via_formula("Label", |old| {
                CacheValue::String(format!("{}-x", old.as_str().unwrap_or_default()))
            })
            .unwrap();
        assert_eq!(stored.as_str(), Some("abc-x"));
    }

    #[test]
    fn test_object_equality_is_identity() {
        let obj: Arc<dyn Any + Send + Sync> = Arc::new(vec![1, 2, 3]);
        let cache = GlobalCache::new(
            vec![("Obj".to_string(), CacheValue::Object(obj.clone()))],
            Duration::from_millis(1),
        );
        let other: Arc<dyn Any + Send + Sync> = Arc::new(vec![1, 2, 3]);
        assert!(!cache
            .compare_and_swap("Obj", 1.into(), &CacheValue::Object(other))
            .unwrap());
        let held = cache.get("Obj").unwrap().downcast_object::<Vec<i32>>().unwrap();
        assert_eq!(*held, vec![1, 2, 3]);
    }

    #[test]
    fn test_signals_wait_until_raised() {
        let cache = Arc::new(cache());
        let raiser = cache.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            raiser.raise_signal("ready");
        });
        cache.await_signal("ready");
        assert!(cache.is_signal_raised("ready"));
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_await_condition_async() {
        let cache = Arc::new(cache());
        let writer = cache.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
                writer.increment("Count", 1).unwrap();
            }
        });
        cache
            .await_condition_async(|c| c.get("Count").and_then(|v| v.as_int()) == Some(3))
            .await;
        assert_eq!(cache.snapshot()["Count"], CacheValue::Int(3));
    }
}
