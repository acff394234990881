//! Stage bodies. Each returns when its upstream is exhausted, or with an
//! error once cancellation or a fault is observed; the orchestrator settles
//! the result before the stage's outbound link is dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::instrument::WithSubscriber;

use super::channel::{Gate, StageReceiver, StageSender};
use super::clustering::Clusterer;
use super::{OutputLink, Shared};
use crate::cluster::Cluster;
use crate::config::{DeferTransformation, RecordInitiator};
use crate::errors::{PipelineError, Result, StageOrigin};
use crate::fault::{invoke, invoke_async};
use crate::item::{Item, Value};
use crate::providers::{ExternalLine, IntakeProvider, OutputProvider};
use crate::readonly::ReadOnlyMode;
use crate::record::Record;
use crate::routing::Router;
use crate::transform::Transformer;

/// Records of one cluster after routing.
#[derive(Debug)]
pub(crate) struct RoutedCluster {
    pub(crate) clstr_no: u64,
    pub(crate) records: Vec<Record>,
}

#[derive(Debug)]
pub(crate) struct FormattedLine {
    pub(crate) rec_no: i64,
    pub(crate) target_no: usize,
    pub(crate) text: String,
}

#[derive(Debug)]
pub(crate) struct FormattedCluster {
    pub(crate) clstr_no: u64,
    pub(crate) lines: Vec<FormattedLine>,
}

/// Gates the intake stages may open.
#[derive(Debug, Clone)]
pub(crate) struct IntakeLinks {
    pub(crate) defer: DeferTransformation,
    pub(crate) transform_gate: Gate,
    pub(crate) output_link: OutputLink,
    pub(crate) output_gate: Gate,
}

impl IntakeLinks {
    fn open_transform_after_intake(&self) {
        if matches!(
            self.defer,
            DeferTransformation::UntilRecordInitiation | DeferTransformation::UntilIntakeCompletion
        ) {
            self.transform_gate.open();
        }
    }
}

fn build_record(
    shared: &Shared,
    intake: &mut dyn IntakeProvider,
    line: &ExternalLine,
    rec_no: i64,
) -> Result<Option<Record>> {
    let at_line = || format!("at line #{}", rec_no);
    let tokens = invoke(StageOrigin::LineParsing, at_line, || Ok(intake.tokenize(&line.text)))?;

    let mut items = Vec::with_capacity(tokens.len());
    for (index, token) in tokens.iter().enumerate() {
        let raw = invoke(StageOrigin::LineParsing, at_line, || {
            intake.item_from_token(token, index + 1)
        })?;
        let Some(raw) = raw else {
            continue;
        };
        let definition = shared.ctx.types.get(&raw.key, StageOrigin::LineParsing)?;
        items.push(match raw.text {
            Some(text) => definition.create_item(&raw.key, &text),
            None => Item::new(raw.key, Value::Null, definition.format),
        });
    }

    let record = Record::new(items, rec_no, line.source_no, shared.ctx.clone())?;
    if let Some(record) = &record {
        for key in record.keys() {
            shared.ctx.fields.register(key);
        }
    }
    Ok(record)
}

/// Hand a header line to the provider. It names fields; it is not data.
fn read_header_line(intake: &mut dyn IntakeProvider, line: &ExternalLine) -> Result<()> {
    let in_header = || "reading the header row".to_string();
    let tokens = invoke(StageOrigin::LineParsing, in_header, || Ok(intake.tokenize(&line.text)))?;
    for (index, token) in tokens.iter().enumerate() {
        invoke(StageOrigin::LineParsing, in_header, || {
            intake.item_from_token(token, index + 1)
        })?;
    }
    Ok(())
}

/// The header row is complete: its fields are final, so output may link.
fn header_row_read(shared: &Shared, intake: &dyn IntakeProvider, links: &IntakeLinks) {
    let fields = intake.fields_in_use();
    tracing::debug!(?fields, "header row read");
    for field in &fields {
        shared.ctx.fields.register(field);
    }
    if links.output_link == OutputLink::AfterHeaderRow {
        links.output_gate.open();
    }
}

/// Read lines and turn them into records.
pub(crate) async fn parse_lines(
    shared: &Shared,
    intake: &mut dyn IntakeProvider,
    initiator: Option<&RecordInitiator>,
    links: &IntakeLinks,
    tx: &StageSender<Record>,
) -> Result<()> {
    let limit = shared.settings.intake_record_limit;
    let mut awaiting_initiation = links.defer == DeferTransformation::UntilRecordInitiation;
    let mut header_pending = intake.has_header_row();
    let mut rec_no: i64 = 0;

    for field in intake.fields_in_use() {
        shared.ctx.fields.register(&field);
    }

    loop {
        if header_pending && intake.header_row_complete() {
            header_pending = false;
            header_row_read(shared, intake, links);
        }

        if limit.is_some_and(|limit| shared.intake.snapshot().record_count >= limit) {
            shared.limit_reached.store(true, Ordering::SeqCst);
            tracing::info!(limit = limit.unwrap_or_default(), "intake record limit reached");
            break;
        }

        let next = rec_no + 1;
        let line = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(PipelineError::Canceled),
            line = invoke_async(
                StageOrigin::LineParsing,
                || format!("reading line #{}", next),
                intake.get_line(),
            ) => line?,
        };
        let Some(line) = line else {
            break;
        };
        if header_pending {
            read_header_line(intake, &line)?;
            continue;
        }
        rec_no = next;

        let Some(record) = build_record(shared, intake, &line, rec_no)? else {
            continue;
        };
        shared.advance(&shared.intake, 1, 0);

        if awaiting_initiation {
            if let Some(initiator) = initiator {
                let initiated = invoke(
                    StageOrigin::LineParsing,
                    || format!("initiating at record #{}", rec_no),
                    || initiator(record.read_only(ReadOnlyMode::Fail)),
                )?;
                if initiated {
                    tracing::debug!(rec_no, "record initiation reached");
                    awaiting_initiation = false;
                    links.transform_gate.open();
                }
            }
        }

        tx.send(record, &shared.cancel).await?;
    }

    tracing::debug!(records = rec_no, "intake depleted");
    if header_pending && intake.header_row_complete() {
        header_row_read(shared, intake, links);
    }
    if links.defer == DeferTransformation::UntilRecordInitiation {
        links.transform_gate.open();
    }
    if matches!(
        links.output_link,
        OutputLink::AfterHeaderRow | OutputLink::AfterIntakeParsing
    ) {
        links.output_gate.open();
    }
    Ok(())
}

/// Group records into clusters, adding head and foot clusters when configured.
pub(crate) async fn cluster_records(
    shared: &Shared,
    mut clusterer: Clusterer,
    links: &IntakeLinks,
    rx: &mut StageReceiver<Record>,
    tx: &StageSender<Cluster>,
) -> Result<()> {
    if shared.settings.prepend_head_cluster {
        tx.send(clusterer.head(), &shared.cancel).await?;
    }

    while let Some(record) = rx.next(&shared.cancel).await? {
        if let Some(cluster) = clusterer.push(record)? {
            shared.advance(&shared.intake, 0, 1);
            tx.send(cluster, &shared.cancel).await?;
        }
    }

    if let Some(cluster) = clusterer.finish() {
        shared.advance(&shared.intake, 0, 1);
        tx.send(cluster, &shared.cancel).await?;
    }
    if shared.settings.append_foot_cluster {
        tx.send(clusterer.foot(), &shared.cancel).await?;
    }

    shared.complete(&shared.intake);
    links.open_transform_after_intake();
    Ok(())
}

/// Receipt order of clusters pulled by the transform workers.
#[derive(Debug, Default)]
struct ClusterOrder {
    received: AtomicU64,
}

/// Run the transformer over every cluster with `concurrency_level` workers.
pub(crate) async fn transform_clusters(
    shared: Arc<Shared>,
    transformer: Transformer,
    gate: Gate,
    output_link: OutputLink,
    output_gate: Gate,
    rx: StageReceiver<Cluster>,
    tx: &StageSender<Cluster>,
) -> Result<()> {
    gate.wait(&shared.cancel).await?;
    let workers = shared.settings.concurrency_level;
    tracing::debug!(workers, transformer = transformer.name(), "transform linked");

    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let order = Arc::new(ClusterOrder::default());
    let mut pool = JoinSet::new();
    for worker in 0..workers {
        let shared = shared.clone();
        let transformer = transformer.clone();
        let rx = rx.clone();
        let tx = tx.clone();
        let order = order.clone();
        let dispatch = shared.dispatch.clone();
        pool.spawn(
            async move {
                let result = transform_worker(&shared, &transformer, &rx, &tx, &order).await;
                let ok = result.is_ok();
                shared.settle(StageOrigin::Transforming, result);
                drop(tx);
                tracing::trace!(worker, ok, "transform worker exited");
                ok
            }
            .with_subscriber(dispatch),
        );
    }

    let mut all_ok = true;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(ok) => all_ok &= ok,
            Err(join_err) => {
                all_ok = false;
                shared.fail(
                    StageOrigin::Transforming,
                    PipelineError::caller_fault(
                        StageOrigin::Transforming,
                        "in transform worker",
                        anyhow::anyhow!("{join_err}"),
                    ),
                );
            },
        }
    }
    if !all_ok {
        return Err(PipelineError::Canceled);
    }

    shared.complete(&shared.transform);
    if output_link == OutputLink::AfterTransformCompletion {
        output_gate.open();
    }
    Ok(())
}

/// Poll until `ready` holds. Keeps head clusters first and foot clusters last
/// when several workers run.
async fn wait_for_turn(shared: &Shared, ready: impl Fn() -> bool) -> Result<()> {
    let interval = shared.settings.cluster_sync_interval();
    while !ready() {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(PipelineError::Canceled),
            _ = tokio::time::sleep(interval) => {},
        }
    }
    Ok(())
}

async fn transform_worker(
    shared: &Arc<Shared>,
    transformer: &Transformer,
    rx: &tokio::sync::Mutex<StageReceiver<Cluster>>,
    tx: &StageSender<Cluster>,
    order: &ClusterOrder,
) -> Result<()> {
    let head_expected = shared.settings.prepend_head_cluster;
    loop {
        let (cluster, seq) = {
            let mut rx = tokio::select! {
                biased;
                _ = shared.cancel.cancelled() => return Err(PipelineError::Canceled),
                guard = rx.lock() => guard,
            };
            match rx.next(&shared.cancel).await? {
                Some(cluster) => (cluster, order.received.fetch_add(1, Ordering::SeqCst) + 1),
                None => return Ok(()),
            }
        };

        if cluster.is_foot() {
            wait_for_turn(shared, || shared.transform.snapshot().cluster_count + 1 >= seq).await?;
        } else if head_expected && !cluster.is_head() {
            wait_for_turn(shared, || shared.transform.snapshot().cluster_count >= 1).await?;
        }

        let clstr_no = cluster.clstr_no();
        let records = cluster.count() as u64;
        let transformer = transformer.clone();
        let dispatch = shared.dispatch.clone();
        let outputs = tokio::task::spawn_blocking(move || {
            tracing::dispatcher::with_default(&dispatch, || transformer.apply(cluster))
        })
        .await
        .map_err(|join_err| {
            PipelineError::caller_fault(
                StageOrigin::Transforming,
                format!("at cluster #{}", clstr_no),
                anyhow::anyhow!("{join_err}"),
            )
        })??;

        for out in outputs {
            tx.send(out, &shared.cancel).await?;
        }
        shared.advance(&shared.transform, records, 1);
    }
}

/// Buffer transformed clusters until output is linked.
pub(crate) async fn hold_clusters(
    shared: &Shared,
    output_gate: &Gate,
    rx: &mut StageReceiver<Cluster>,
    tx: &StageSender<Cluster>,
) -> Result<()> {
    let mut held: VecDeque<Cluster> = VecDeque::new();
    let mut linked = false;
    let mut upstream_done = false;

    loop {
        if linked {
            if !held.is_empty() {
                tracing::trace!(clusters = held.len(), "releasing held clusters");
            }
            while let Some(cluster) = held.pop_front() {
                tx.send(cluster, &shared.cancel).await?;
            }
        }
        if upstream_done {
            if linked {
                return Ok(());
            }
            output_gate.wait(&shared.cancel).await?;
            linked = true;
            continue;
        }

        tokio::select! {
            biased;
            opened = output_gate.wait(&shared.cancel), if !linked => {
                opened?;
                linked = true;
            },
            next = rx.next(&shared.cancel) => match next? {
                Some(cluster) => held.push_back(cluster),
                None => upstream_done = true,
            },
        }
    }
}

/// Fix the output fields, then route each cluster and split it into records.
pub(crate) async fn uncluster(
    shared: &Shared,
    router: &Router,
    output: &dyn OutputProvider,
    output_gate: &Gate,
    rx: &mut StageReceiver<Cluster>,
    tx: &StageSender<RoutedCluster>,
) -> Result<()> {
    output_gate.wait(&shared.cancel).await?;

    let fields = if !shared.settings.output_fields.is_empty() {
        Some(shared.settings.output_fields.clone())
    } else if output.requires_fields_up_front() {
        Some(shared.ctx.fields.snapshot())
    } else {
        None
    };
    if let Some(fields) = &fields {
        tracing::debug!(?fields, "output fields fixed");
        invoke(
            StageOrigin::Unclustering,
            || "setting output fields".to_string(),
            || {
                output.set_fields_to_use(fields);
                Ok(())
            },
        )?;
    }
    // Set exactly once per run, before anything reaches the formatter.
    let _ = shared.fields_to_use.set(fields);

    while let Some(mut cluster) = rx.next(&shared.cancel).await? {
        router.route(&mut cluster)?;
        let routed = RoutedCluster {
            clstr_no: cluster.clstr_no(),
            records: cluster.into_records(),
        };
        tx.send(routed, &shared.cancel).await?;
    }
    Ok(())
}

fn format_record(output: &dyn OutputProvider, fields: Option<&[String]>, record: &Record) -> anyhow::Result<String> {
    let tokens = match fields {
        Some(fields) => fields
            .iter()
            .map(|key| output.token_from_item(&record.get(key)))
            .collect::<anyhow::Result<Vec<_>>>()?,
        None => record
            .items()
            .map(|item| output.token_from_item(item))
            .collect::<anyhow::Result<Vec<_>>>()?,
    };
    output.join_tokens(tokens)
}

/// Render records into output lines.
pub(crate) async fn format_records(
    shared: &Shared,
    output: &dyn OutputProvider,
    rx: &mut StageReceiver<RoutedCluster>,
    tx: &StageSender<FormattedCluster>,
) -> Result<()> {
    while let Some(routed) = rx.next(&shared.cancel).await? {
        let fields = shared.fields_to_use.get().and_then(|f| f.as_deref());
        let mut lines = Vec::with_capacity(routed.records.len());
        for record in &routed.records {
            let rec_no = record.rec_no();
            let text = invoke(
                StageOrigin::Formatting,
                || format!("at record #{}", rec_no),
                || format_record(output, fields, record),
            )?;
            lines.push(FormattedLine {
                rec_no,
                target_no: record.target_no(),
                text,
            });
        }
        let formatted = FormattedCluster {
            clstr_no: routed.clstr_no,
            lines,
        };
        tx.send(formatted, &shared.cancel).await?;
    }
    Ok(())
}

/// Deliver lines to their targets, then complete the output provider.
pub(crate) async fn write_lines(
    shared: &Shared,
    output: &dyn OutputProvider,
    rx: &mut StageReceiver<FormattedCluster>,
) -> Result<()> {
    while let Some(formatted) = rx.next(&shared.cancel).await? {
        let rows = formatted.lines.len() as u64;
        for line in formatted.lines {
            let rec_no = line.rec_no;
            invoke_async(
                StageOrigin::Output,
                || format!("at record #{}", rec_no),
                output.send_line(line.text, line.target_no),
            )
            .await?;
        }
        tracing::trace!(clstr_no = formatted.clstr_no, rows, "cluster written");
        shared.advance(&shared.output, rows, u64::from(rows > 0));
    }

    invoke_async(
        StageOrigin::Output,
        || "completing output".to_string(),
        output.complete(),
    )
    .await?;
    shared.complete(&shared.output);
    Ok(())
}
