//! Pipelines over keyword files on disk

mod common;

use common::*;
use conveyor_core::providers::{KeywordFormat, KeywordIntake, KeywordOutput};
use conveyor_core::{CompletionStatus, PipelineSettings, Router, Transformer};

#[tokio::test(flavor = "multi_thread")]
async fn test_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.kw");
    let output = dir.path().join("output.kw");
    std::fs::write(&input, FIXTURE.join("\n") + "\n").unwrap();

    let result = orchestrator(
        PipelineSettings::default(),
        clustered_by_rectype(),
        KeywordIntake::new(vec![input], KeywordFormat::default()),
        KeywordOutput::new(vec![output.clone()], KeywordFormat::default()),
    )
    .execute()
    .await;

    assert_eq!(result.status, CompletionStatus::IntakeDepleted);
    let written = std::fs::read_to_string(&output).unwrap();
    assert_eq!(written.lines().collect::<Vec<_>>(), FIXTURE.to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sources_split_to_matching_targets() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = [dir.path().join("a.kw"), dir.path().join("b.kw")];
    let outputs = [dir.path().join("a.out"), dir.path().join("b.out")];
    std::fs::write(&inputs[0], FIXTURE[..4].join("\n")).unwrap();
    // Blank lines are skipped.
    std::fs::write(&inputs[1], format!("\n{}\n\n", FIXTURE[4..].join("\n"))).unwrap();

    let functions = clustered_by_rectype()
        .with_router(Router::SourceToTarget)
        .with_transformer(Transformer::record_filter(|record| Ok(!record.contains_key("EOF"))));
    let result = orchestrator(
        PipelineSettings::default(),
        functions,
        KeywordIntake::new(inputs.to_vec(), KeywordFormat::default()),
        KeywordOutput::new(outputs.to_vec(), KeywordFormat::default()),
    )
    .execute()
    .await;

    assert_eq!(result.status, CompletionStatus::IntakeDepleted);
    assert_eq!(result.rows_read, 10);
    assert_eq!(result.rows_written, 9);
    let first = std::fs::read_to_string(&outputs[0]).unwrap();
    let second = std::fs::read_to_string(&outputs[1]).unwrap();
    assert_eq!(first.lines().count(), 4);
    assert_eq!(second.lines().collect::<Vec<_>>(), FIXTURE[4..9].to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_route_to_missing_target_fails() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.kw");
    std::fs::write(&input, FIXTURE.join("\n")).unwrap();

    let functions = clustered_by_rectype().with_router(Router::per_record(|_| Ok(3)));
    let result = orchestrator(
        PipelineSettings::default(),
        functions,
        KeywordIntake::new(vec![input], KeywordFormat::default()),
        KeywordOutput::new(vec![dir.path().join("only.out")], KeywordFormat::default()),
    )
    .execute()
    .await;

    assert_eq!(result.status, CompletionStatus::Failed);
    let error = result.error.unwrap();
    assert!(error.starts_with("output block failed at record #1"), "{error}");
    assert!(error.contains("No output target #3"), "{error}");
}
