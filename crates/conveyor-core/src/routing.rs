//! Assignment of output targets to records.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::errors::{Result, StageOrigin};
use crate::fault::invoke;
use crate::readonly::{ReadOnlyCluster, ReadOnlyMode, ReadOnlyRecord};

pub type ClusterRouteFn = Arc<dyn Fn(ReadOnlyCluster<'_>) -> anyhow::Result<usize> + Send + Sync>;
pub type RecordRouteFn = Arc<dyn Fn(ReadOnlyRecord<'_>) -> anyhow::Result<usize> + Send + Sync>;

/// Decides the 1-based `target_no` of every record leaving the pipeline.
#[derive(Clone, Default)]
pub enum Router {
    /// Everything goes to target 1.
    #[default]
    SingleTarget,
    /// Each record goes to the target numbered like its source.
    SourceToTarget,
    /// One decision per cluster, applied to all its records.
    PerCluster(ClusterRouteFn),
    PerRecord(RecordRouteFn),
}

impl Router {
    pub fn per_cluster(
        f: impl Fn(ReadOnlyCluster<'_>) -> anyhow::Result<usize> + Send + Sync + 'static,
    ) -> Self {
        Router::PerCluster(Arc::new(f))
    }

    pub fn per_record(
        f: impl Fn(ReadOnlyRecord<'_>) -> anyhow::Result<usize> + Send + Sync + 'static,
    ) -> Self {
        Router::PerRecord(Arc::new(f))
    }

    /// Stamp a target number on every record of `cluster`.
    pub fn route(&self, cluster: &mut Cluster) -> Result<()> {
        match self {
            Router::SingleTarget => {
                for record in cluster.records_mut() {
                    record.set_target_no(1);
                }
            },
            Router::SourceToTarget => {
                for record in cluster.records_mut() {
                    let source_no = record.source_no();
                    record.set_target_no(source_no);
                }
            },
            Router::PerCluster(f) => {
                let clstr_no = cluster.clstr_no();
                let target = invoke(
                    StageOrigin::Unclustering,
                    || format!("routing cluster #{}", clstr_no),
                    || f(cluster.read_only(ReadOnlyMode::Fail)),
                )?;
                for record in cluster.records_mut() {
                    record.set_target_no(target);
                }
            },
            Router::PerRecord(f) => {
                for record in cluster.records_mut() {
                    let rec_no = record.rec_no();
                    let target = invoke(
                        StageOrigin::Unclustering,
                        || format!("routing record #{}", rec_no),
                        || f(record.read_only(ReadOnlyMode::Fail)),
                    )?;
                    record.set_target_no(target);
                }
            },
        }
        Ok(())
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Router::SingleTarget => "SingleTarget",
            Router::SourceToTarget => "SourceToTarget",
            Router::PerCluster(_) => "PerCluster",
            Router::PerRecord(_) => "PerRecord",
        })
    }
}
