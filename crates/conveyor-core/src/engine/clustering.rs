//! Cluster boundary detection.

use std::sync::Arc;

use crate::cluster::Cluster;
use crate::config::ClusterMarker;
use crate::errors::{Result, StageOrigin};
use crate::fault::invoke;
use crate::readonly::ReadOnlyMode;
use crate::record::{Record, RecordContext};

/// Turns a record stream into a cluster stream.
///
/// Cluster numbers start at 1 and follow intake order. Head and foot clusters
/// are built on request and are not numbered from the same counter: the head
/// is always 0 and the foot takes the number after the last regular cluster.
pub(crate) struct Clusterer {
    marker: Option<ClusterMarker>,
    marker_starts_cluster: bool,
    accumulator: Vec<Record>,
    /// Last record of the previous cluster, kept so the marker can see it.
    carried: Option<Record>,
    next_clstr_no: u64,
    last_rec_no: i64,
    last_source_no: usize,
    ctx: Arc<RecordContext>,
}

impl Clusterer {
    pub(crate) fn new(
        marker: Option<ClusterMarker>,
        marker_starts_cluster: bool,
        ctx: Arc<RecordContext>,
    ) -> Self {
        Self {
            marker,
            marker_starts_cluster,
            accumulator: Vec::new(),
            carried: None,
            next_clstr_no: 1,
            last_rec_no: 0,
            last_source_no: 1,
            ctx,
        }
    }

    fn is_marked(&self, current: &Record, previous: Option<&Record>, count: usize) -> Result<bool> {
        let Some(marker) = &self.marker else {
            return Ok(true);
        };
        let rec_no = current.rec_no();
        invoke(
            StageOrigin::Clustering,
            || format!("at record #{}", rec_no),
            || {
                marker(
                    current.read_only(ReadOnlyMode::Fail),
                    previous.map(|p| p.read_only(ReadOnlyMode::Fail)),
                    count,
                )
            },
        )
    }

    fn close(&mut self) -> Option<Cluster> {
        if self.accumulator.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.accumulator);
        let clstr_no = self.next_clstr_no;
        self.next_clstr_no += 1;
        Some(Cluster::new(records, clstr_no, self.ctx.clone()))
    }

    /// Feed one record; returns the cluster it completed, if any.
    pub(crate) fn push(&mut self, record: Record) -> Result<Option<Cluster>> {
        self.last_rec_no = record.rec_no();
        self.last_source_no = record.source_no();

        if self.marker_starts_cluster {
            let previous = self.accumulator.last().or(self.carried.as_ref());
            let marked = self.is_marked(&record, previous, self.accumulator.len())?;
            let completed = if marked { self.close() } else { None };
            self.accumulator.push(record);
            return Ok(completed);
        }

        self.accumulator.push(record);
        let count = self.accumulator.len();
        let (current, earlier) = match self.accumulator.split_last() {
            Some(split) => split,
            None => return Ok(None),
        };
        let previous = earlier.last().or(self.carried.as_ref());
        if !self.is_marked(current, previous, count)? {
            return Ok(None);
        }
        self.carried = Some(current.clone());
        Ok(self.close())
    }

    /// Flush the records still accumulated once the stream has ended.
    pub(crate) fn finish(&mut self) -> Option<Cluster> {
        self.close()
    }

    pub(crate) fn head(&self) -> Cluster {
        Cluster::head(self.ctx.clone())
    }

    pub(crate) fn foot(&self) -> Cluster {
        Cluster::foot(
            self.next_clstr_no,
            self.last_rec_no,
            self.last_source_no,
            self.ctx.clone(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::test_support::{context, record};
    use crate::record::DuplicateKeyPolicy;
    use crate::readonly::ReadOnlyRecord;
    use proptest::prelude::*;

    fn as_marker(
        f: impl Fn(ReadOnlyRecord<'_>, Option<ReadOnlyRecord<'_>>, usize) -> anyhow::Result<bool>
            + Send
            + Sync
            + 'static,
    ) -> ClusterMarker {
        Arc::new(f)
    }

    fn rectype_marker(wanted: &'static str) -> ClusterMarker {
        as_marker(move |current, _previous, _count| {
            Ok(current.value("RECTYPE").as_str() == Some(wanted))
        })
    }

    fn run(clusterer: &mut Clusterer, types: &[&str]) -> Vec<Cluster> {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let mut out = Vec::new();
        for (i, t) in types.iter().enumerate() {
            let rec = record(&[("RECTYPE", *t)], i as i64 + 1, &ctx);
            out.extend(clusterer.push(rec).unwrap());
        }
        out.extend(clusterer.finish());
        out
    }

    fn sizes(clusters: &[Cluster]) -> Vec<usize> {
        clusters.iter().map(Cluster::count).collect()
    }

    #[test]
    fn test_marker_starts_cluster() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let mut c = Clusterer::new(Some(rectype_marker("XYZ")), true, ctx);
        let clusters = run(&mut c, &["XYZ", "A", "A", "A", "XYZ", "A", "A", "A", "A", "EOF"]);
        assert_eq!(sizes(&clusters), vec![4, 6]);
        assert_eq!(clusters[1].clstr_no(), 2);
        assert_eq!(clusters[1].start_rec_no(), 5);
    }

    #[test]
    fn test_marker_ends_cluster() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let mut c = Clusterer::new(Some(rectype_marker("END")), false, ctx);
        let clusters = run(&mut c, &["A", "END", "A", "A", "END", "A"]);
        assert_eq!(sizes(&clusters), vec![2, 3, 1]);
    }

    #[test]
    fn test_previous_record_spans_cluster_boundaries() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let marker = as_marker(|current, previous, _| {
            Ok(previous.map(|p| p.value("RECTYPE") != current.value("RECTYPE")).unwrap_or(false))
        });
        let mut c = Clusterer::new(Some(marker), true, ctx);
        let clusters = run(&mut c, &["A", "A", "B", "B", "B", "A"]);
        assert_eq!(sizes(&clusters), vec![2, 3, 1]);
    }

    #[test]
    fn test_no_marker_means_single_record_clusters() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let mut c = Clusterer::new(None, true, ctx);
        assert_eq!(sizes(&run(&mut c, &["A", "B", "C"])), vec![1, 1, 1]);
    }

    #[test]
    fn test_foot_follows_last_cluster() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let mut c = Clusterer::new(None, true, ctx);
        run(&mut c, &["A", "B"]);
        let foot = c.foot();
        assert!(foot.is_foot());
        assert_eq!(foot.clstr_no(), 3);
        assert_eq!(foot.end_rec_no(), 2);
        assert!(c.head().is_head());
    }

    #[test]
    fn test_marker_failure_is_clustering_fault() {
        let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
        let marker = as_marker(|_, _, _| anyhow::bail!("bad marker"));
        let mut c = Clusterer::new(Some(marker), true, ctx.clone());
        let err = c.push(record(&[("A", "1")], 1, &ctx)).unwrap_err();
        assert_eq!(err.to_string(), "clustering block failed at record #1: bad marker");
    }

    proptest! {
        #[test]
        fn prop_every_record_lands_in_exactly_one_cluster(
            marks in proptest::collection::vec(any::<bool>(), 0..60),
            starts in any::<bool>(),
        ) {
            let ctx = context(true, DuplicateKeyPolicy::IgnoreItem);
            let marker = as_marker(|current, _, _| Ok(current.value("M").as_str() == Some("1")));
            let mut c = Clusterer::new(Some(marker), starts, ctx.clone());

            let mut clusters = Vec::new();
            for (i, mark) in marks.iter().enumerate() {
                let rec = record(&[("M", if *mark { "1" } else { "0" })], i as i64 + 1, &ctx);
                clusters.extend(c.push(rec).unwrap());
            }
            clusters.extend(c.finish());

            let rec_nos: Vec<i64> = clusters
                .iter()
                .flat_map(|cl| cl.records().iter().map(|r| r.rec_no()))
                .collect();
            let expected: Vec<i64> = (1..=marks.len() as i64).collect();
            prop_assert_eq!(rec_nos, expected);
            prop_assert!(clusters.iter().all(|cl| !cl.is_empty()));
            for (i, cl) in clusters.iter().enumerate() {
                prop_assert_eq!(cl.clstr_no(), i as u64 + 1);
                prop_assert!(cl.records().iter().all(|r| r.clstr_no() == cl.clstr_no()));
            }
        }
    }
}
