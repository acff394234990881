//! Read-only projections of records and clusters.
//!
//! Predicates and routers receive these instead of the real entities. Reads
//! pass through via `Deref`; each mutating method either does nothing or fails,
//! depending on the [`ReadOnlyMode`].

use std::ops::Deref;

use crate::cluster::Cluster;
use crate::errors::{PipelineError, Result};
use crate::item::Value;
use crate::record::{ItemChange, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadOnlyMode {
    /// Mutations are silently dropped.
    Ignore,
    /// Mutations return [`PipelineError::UnsupportedOperation`].
    #[default]
    Fail,
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOnlyRecord<'a> {
    inner: &'a Record,
    mode: ReadOnlyMode,
}

impl<'a> ReadOnlyRecord<'a> {
    pub fn new(inner: &'a Record, mode: ReadOnlyMode) -> Self {
        Self { inner, mode }
    }

    fn refuse<T>(&self, ignored: T) -> Result<T> {
        match self.mode {
            ReadOnlyMode::Ignore => Ok(ignored),
            ReadOnlyMode::Fail => Err(PipelineError::UnsupportedOperation("record")),
        }
    }

    pub fn set(&self, _key: &str, _value: impl Into<Value>) -> Result<bool> {
        self.refuse(false)
    }

    pub fn add_item(&self, _key: &str, _value: impl Into<Value>) -> Result<ItemChange> {
        self.refuse(ItemChange::Ignored)
    }

    pub fn remove_item(&self, _key: &str) -> Result<ItemChange> {
        self.refuse(ItemChange::Ignored)
    }

    pub fn set_target_no(&self, _target_no: usize) -> Result<()> {
        self.refuse(())
    }

    /// An owned, mutable copy of the underlying record.
    pub fn to_record(&self) -> Record {
        self.inner.clone()
    }
}

impl Deref for ReadOnlyRecord<'_> {
    type Target = Record;

    fn deref(&self) -> &Record {
        self.inner
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOnlyCluster<'a> {
    inner: &'a Cluster,
    mode: ReadOnlyMode,
}

impl<'a> ReadOnlyCluster<'a> {
    pub fn new(inner: &'a Cluster, mode: ReadOnlyMode) -> Self {
        Self { inner, mode }
    }

    fn refuse<T>(&self, ignored: T) -> Result<T> {
        match self.mode {
            ReadOnlyMode::Ignore => Ok(ignored),
            ReadOnlyMode::Fail => Err(PipelineError::UnsupportedOperation("cluster")),
        }
    }

    /// Records of this cluster, projected with the same mode.
    pub fn read_only_records(&self) -> impl Iterator<Item = ReadOnlyRecord<'a>> + 'a {
        let mode = self.mode;
        self.inner
            .records()
            .iter()
            .map(move |r| ReadOnlyRecord::new(r, mode))
    }

    pub fn read_only_record(&self, index: usize) -> Option<ReadOnlyRecord<'a>> {
        self.inner
            .record(index)
            .map(|r| ReadOnlyRecord::new(r, self.mode))
    }

    pub fn add_record(&self, _record: Record) -> Result<()> {
        self.refuse(())
    }

    pub fn remove_record(&self, _index: usize) -> Result<Option<Record>> {
        self.refuse(None)
    }

    pub fn to_cluster(&self) -> Cluster {
        self.inner.clone()
    }
}

impl Deref for ReadOnlyCluster<'_> {
    type Target = Cluster;

    fn deref(&self) -> &Cluster {
        self.inner
    }
}
