//! Clusters: ordered groups of records processed as one unit of work.

use std::sync::Arc;

use crate::global_cache::GlobalCache;
use crate::readonly::{ReadOnlyCluster, ReadOnlyMode};
use crate::record::{PropertyBin, Record, RecordContext};

/// `start_rec_no` of the synthetic head cluster.
pub const HEAD_START_REC_NO: i64 = 0;
/// `start_rec_no` of the synthetic foot cluster.
pub const FOOT_START_REC_NO: i64 = -1;

#[derive(Debug, Clone)]
pub struct Cluster {
    records: Vec<Record>,
    clstr_no: u64,
    start_rec_no: i64,
    end_rec_no: i64,
    start_source_no: usize,
    property_bin: Option<PropertyBin>,
    ctx: Arc<RecordContext>,
}

impl Cluster {
    /// Group `records` under `clstr_no`, stamping each record with it.
    pub fn new(mut records: Vec<Record>, clstr_no: u64, ctx: Arc<RecordContext>) -> Self {
        for record in &mut records {
            record.assign_clstr_no(clstr_no);
        }
        let start_rec_no = records.first().map(Record::rec_no).unwrap_or_default();
        let end_rec_no = records.last().map(Record::rec_no).unwrap_or_default();
        let start_source_no = records.first().map(Record::source_no).unwrap_or(1);
        let property_bin = ctx.bins.clusters.then(PropertyBin::new);
        Self {
            records,
            clstr_no,
            start_rec_no,
            end_rec_no,
            start_source_no,
            property_bin,
            ctx,
        }
    }

    /// The empty cluster injected before any intake cluster.
    pub(crate) fn head(ctx: Arc<RecordContext>) -> Self {
        let mut cluster = Self::new(Vec::new(), 0, ctx);
        cluster.start_rec_no = HEAD_START_REC_NO;
        cluster.end_rec_no = HEAD_START_REC_NO;
        cluster
    }

    /// The empty cluster injected after the last intake cluster.
    /// Carries the last record number seen on intake.
    pub(crate) fn foot(clstr_no: u64, last_rec_no: i64, last_source_no: usize, ctx: Arc<RecordContext>) -> Self {
        let mut cluster = Self::new(Vec::new(), clstr_no, ctx);
        cluster.start_rec_no = FOOT_START_REC_NO;
        cluster.end_rec_no = last_rec_no;
        cluster.start_source_no = last_source_no;
        cluster
    }

    pub fn is_head(&self) -> bool {
        self.start_rec_no == HEAD_START_REC_NO && self.clstr_no == 0
    }

    pub fn is_foot(&self) -> bool {
        self.start_rec_no == FOOT_START_REC_NO
    }

    pub fn is_synthetic(&self) -> bool {
        self.is_head() || self.is_foot()
    }

    pub fn clstr_no(&self) -> u64 {
        self.clstr_no
    }

    pub fn start_rec_no(&self) -> i64 {
        self.start_rec_no
    }

    pub fn end_rec_no(&self) -> i64 {
        self.end_rec_no
    }

    pub fn start_source_no(&self) -> usize {
        self.start_source_no
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    pub fn record_mut(&mut self, index: usize) -> Option<&mut Record> {
        self.records.get_mut(index)
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut Record> {
        self.records.iter_mut()
    }

    pub fn add_record(&mut self, record: Record) {
        self.records.push(record);
    }

    pub fn remove_record(&mut self, index: usize) -> Option<Record> {
        (index < self.records.len()).then(|| self.records.remove(index))
    }

    /// Keep only the records for which `keep` returns `true`.
    pub fn retain_records(&mut self, keep: impl FnMut(&Record) -> bool) {
        self.records.retain(keep);
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    /// A cluster with the same numbers and bin but no records.
    pub fn get_empty_clone(&self) -> Cluster {
        Cluster {
            records: Vec::new(),
            clstr_no: self.clstr_no,
            start_rec_no: self.start_rec_no,
            end_rec_no: self.end_rec_no,
            start_source_no: self.start_source_no,
            property_bin: self.property_bin.clone(),
            ctx: self.ctx.clone(),
        }
    }

    pub fn property_bin(&self) -> Option<&PropertyBin> {
        self.property_bin.as_ref()
    }

    pub fn property_bin_mut(&mut self) -> Option<&mut PropertyBin> {
        self.property_bin.as_mut()
    }

    pub fn global_cache(&self) -> &GlobalCache {
        &self.ctx.global_cache
    }

    pub fn context(&self) -> &Arc<RecordContext> {
        &self.ctx
    }

    pub fn read_only(&self, mode: ReadOnlyMode) -> ReadOnlyCluster<'_> {
        ReadOnlyCluster::new(self, mode)
    }
}
