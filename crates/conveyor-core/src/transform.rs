//! Transformer shapes applied by the transform stage.
//!
//! Every shape is reduced to `cluster -> Vec<cluster>` by [`Transformer::apply`].
//! Record-level shapes (`Recordbound`, `RecordFilter`) leave the head and foot
//! clusters alone and drop a regular cluster once all of its records are gone.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::errors::{Result, StageOrigin};
use crate::fault::invoke;
use crate::readonly::{ReadOnlyCluster, ReadOnlyMode, ReadOnlyRecord};
use crate::record::Record;

pub type UniversalFn = Arc<dyn Fn(Cluster) -> anyhow::Result<Vec<Cluster>> + Send + Sync>;
pub type ClusterboundFn = Arc<dyn Fn(Cluster) -> anyhow::Result<Option<Cluster>> + Send + Sync>;
pub type RecordboundFn = Arc<dyn Fn(Record) -> anyhow::Result<Option<Record>> + Send + Sync>;
pub type ClusterFilterFn = Arc<dyn Fn(ReadOnlyCluster<'_>) -> anyhow::Result<bool> + Send + Sync>;
pub type RecordFilterFn = Arc<dyn Fn(ReadOnlyRecord<'_>) -> anyhow::Result<bool> + Send + Sync>;

/// Caller transformation logic, in one of five shapes.
#[derive(Clone, Default)]
pub enum Transformer {
    /// Clusters pass unchanged.
    #[default]
    PassThrough,
    /// One cluster in, any number out.
    Universal(UniversalFn),
    /// One cluster in, at most one out.
    Clusterbound(ClusterboundFn),
    /// One record in, at most one out.
    Recordbound(RecordboundFn),
    ClusterFilter(ClusterFilterFn),
    RecordFilter(RecordFilterFn),
}

impl Transformer {
    pub fn universal(
        f: impl Fn(Cluster) -> anyhow::Result<Vec<Cluster>> + Send + Sync + 'static,
    ) -> Self {
        Transformer::Universal(Arc::new(f))
    }

    pub fn clusterbound(
        f: impl Fn(Cluster) -> anyhow::Result<Option<Cluster>> + Send + Sync + 'static,
    ) -> Self {
        Transformer::Clusterbound(Arc::new(f))
    }

    pub fn recordbound(
        f: impl Fn(Record) -> anyhow::Result<Option<Record>> + Send + Sync + 'static,
    ) -> Self {
        Transformer::Recordbound(Arc::new(f))
    }

    pub fn cluster_filter(
        f: impl Fn(ReadOnlyCluster<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Transformer::ClusterFilter(Arc::new(f))
    }

    pub fn record_filter(
        f: impl Fn(ReadOnlyRecord<'_>) -> anyhow::Result<bool> + Send + Sync + 'static,
    ) -> Self {
        Transformer::RecordFilter(Arc::new(f))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transformer::PassThrough => "pass-through",
            Transformer::Universal(_) => "universal",
            Transformer::Clusterbound(_) => "clusterbound",
            Transformer::Recordbound(_) => "recordbound",
            Transformer::ClusterFilter(_) => "cluster filter",
            Transformer::RecordFilter(_) => "record filter",
        }
    }

    /// Apply this transformer to one cluster.
    pub fn apply(&self, cluster: Cluster) -> Result<Vec<Cluster>> {
        let clstr_no = cluster.clstr_no();
        let at_cluster = move || format!("at cluster #{}", clstr_no);

        match self {
            Transformer::PassThrough => Ok(vec![cluster]),
            Transformer::Universal(f) => invoke(StageOrigin::Transforming, at_cluster, || f(cluster)),
            Transformer::Clusterbound(f) => {
                let out = invoke(StageOrigin::Transforming, at_cluster, || f(cluster))?;
                Ok(out.into_iter().collect())
            },
            Transformer::ClusterFilter(f) => {
                let keep = invoke(StageOrigin::Transforming, at_cluster, || {
                    f(cluster.read_only(ReadOnlyMode::Fail))
                })?;
                Ok(if keep { vec![cluster] } else { Vec::new() })
            },
            Transformer::Recordbound(f) => {
                if cluster.is_synthetic() {
                    return Ok(vec![cluster]);
                }
                let mut out = cluster.get_empty_clone();
                for record in cluster.into_records() {
                    let rec_no = record.rec_no();
                    let at_record = move || format!("at record #{}", rec_no);
                    if let Some(kept) = invoke(StageOrigin::Transforming, at_record, || f(record))? {
                        out.add_record(kept);
                    }
                }
                Ok(keep_unless_emptied(out))
            },
            Transformer::RecordFilter(f) => {
                if cluster.is_synthetic() {
                    return Ok(vec![cluster]);
                }
                let mut out = cluster.get_empty_clone();
                for record in cluster.into_records() {
                    let rec_no = record.rec_no();
                    let at_record = move || format!("at record #{}", rec_no);
                    let keep = invoke(StageOrigin::Transforming, at_record, || {
                        f(record.read_only(ReadOnlyMode::Fail))
                    })?;
                    if keep {
                        out.add_record(record);
                    }
                }
                Ok(keep_unless_emptied(out))
            },
        }
    }
}

fn keep_unless_emptied(cluster: Cluster) -> Vec<Cluster> {
    if cluster.is_empty() {
        Vec::new()
    } else {
        vec![cluster]
    }
}

impl std::fmt::Debug for Transformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Transformer").field(&self.name()).finish()
    }
}
