//! End-to-end tests for pipeline execution.

use super::*;
use crate::classify::Classifier;
use crate::config::Config;
use crate::core::{AttemptOutcome, CompletionToken, PipelineStatus};
use crate::enrich::Enricher;
use crate::events::CollectingEventSink;
use crate::jobs;
use crate::records::{BatchStore, Category, Detection, RawRecord};
use crate::stages::{CommandSpec, CommandStage, ExitResult, FnStage, Stage};
use crate::testing::{RecordingStage, ScriptedStage, StaticDetector};
use crate::warehouse::Warehouse;
use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new()
        .with_max_attempts(max_attempts)
        .with_base_delay_ms(1)
}

#[tokio::test]
async fn test_retry_then_success_completes_pipeline() {
    let flaky = Arc::new(ScriptedStage::fail_then_succeed("enrich", 1));
    let pipeline = PipelineBuilder::new("retry")
        .stage(StageSpec::new("enrich", flaky.clone()).with_retry(fast_retry(2)))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();

    assert_eq!(result.status, PipelineStatus::Succeeded);
    assert_eq!(flaky.calls(), 2);
    let outcomes: Vec<AttemptOutcome> = result.runs.iter().map(|r| r.exit_status).collect();
    assert_eq!(outcomes, vec![AttemptOutcome::Failure, AttemptOutcome::Success]);
    assert_eq!(result.materializations[0].metadata["attempts"], "2");
}

#[tokio::test]
async fn test_abort_halts_downstream_stages() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let downstream = Arc::new(RecordingStage::new("load_raw", log.clone()));
    let sink = Arc::new(CollectingEventSink::new());

    let pipeline = PipelineBuilder::new("halt")
        .with_event_sink(sink.clone())
        .stage(
            StageSpec::new("extract", Arc::new(ScriptedStage::failing("extract")))
                .with_retry(RetryPolicy::no_retry()),
        )
        .unwrap()
        .stage(StageSpec::new("load_raw", downstream.clone()))
        .unwrap()
        .build()
        .unwrap();

    let failure = pipeline.run().await.unwrap_err();

    assert!(failure.failure.is_fatal());
    assert_eq!(failure.failure.stage(), "extract");
    assert_eq!(failure.failure.output_tail(), "boom");
    assert_eq!(failure.result.status, PipelineStatus::Failed);
    assert_eq!(failure.result.failed_stage.as_deref(), Some("extract"));
    assert!(failure.result.materializations.is_empty());
    assert!(log.lock().is_empty());
    assert!(downstream.inputs().is_empty());
    assert_eq!(
        sink.event_types(),
        vec![
            "pipeline.started",
            "stage.started",
            "stage.attempt_failed",
            "stage.aborted",
            "pipeline.failed",
        ]
    );
}

#[tokio::test]
async fn test_tokens_flow_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let stages: Vec<Arc<RecordingStage>> = [EXTRACT, LOAD_RAW, TRANSFORM]
        .iter()
        .map(|name| Arc::new(RecordingStage::new(*name, log.clone())))
        .collect();

    let mut builder = PipelineBuilder::new("tokens");
    for stage in &stages {
        builder = builder
            .stage(StageSpec::new(stage.name(), stage.clone()))
            .unwrap();
    }
    let result = builder.build().unwrap().run().await.unwrap();

    assert_eq!(*log.lock(), vec![EXTRACT, LOAD_RAW, TRANSFORM]);
    assert_eq!(stages[0].inputs(), vec![None]);
    assert_eq!(stages[1].inputs(), vec![Some(EXTRACT.to_string())]);
    assert_eq!(stages[2].inputs(), vec![Some(LOAD_RAW.to_string())]);
    assert_eq!(result.succeeded_stages(), vec![EXTRACT, LOAD_RAW, TRANSFORM]);
}

#[tokio::test]
async fn test_failure_after_partial_success_keeps_earlier_materializations() {
    let pipeline = PipelineBuilder::new("partial")
        .stage(StageSpec::new(EXTRACT, Arc::new(ScriptedStage::succeeding(EXTRACT))))
        .unwrap()
        .stage(
            StageSpec::new(LOAD_RAW, Arc::new(ScriptedStage::failing(LOAD_RAW)))
                .with_retry(fast_retry(3)),
        )
        .unwrap()
        .build()
        .unwrap();

    let failure = pipeline.run().await.unwrap_err();

    assert_eq!(failure.result.succeeded_stages(), vec![EXTRACT]);
    assert_eq!(failure.result.runs_for(LOAD_RAW).len(), 3);
    assert_eq!(failure.result.runs.len(), 4);
}

#[tokio::test]
async fn test_warnings_do_not_fail_stage() {
    let stage = ScriptedStage::new(
        TRANSFORM,
        vec![ExitResult::success("built 4 models")
            .with_warning("test failed: 1 of 12")
            .with_metadata("test_status", "failed")],
    );
    let pipeline = PipelineBuilder::new("warn")
        .stage(StageSpec::new(TRANSFORM, Arc::new(stage)))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.run().await.unwrap();
    let metadata = &result.materializations[0].metadata;

    assert_eq!(metadata["test_status"], "failed");
    assert_eq!(metadata["warnings"], "test failed: 1 of 12");
    assert_eq!(metadata["output_tail"], "built 4 models");
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_stages_with_tail_limit() {
    let quiet = CommandStage::new("quiet", CommandSpec::new("sh").args(["-c", "true"]));
    let noisy = CommandStage::new(
        "noisy",
        CommandSpec::new("sh").args(["-c", "printf 'abcdefghij'; exit 3"]),
    );
    let pipeline = PipelineBuilder::new("commands")
        .with_tail_limit(4)
        .stage(StageSpec::new("quiet", Arc::new(quiet)))
        .unwrap()
        .stage(StageSpec::new("noisy", Arc::new(noisy)).with_retry(RetryPolicy::no_retry()))
        .unwrap()
        .build()
        .unwrap();

    let failure = pipeline.run().await.unwrap_err();

    assert_eq!(failure.failure.stage(), "noisy");
    assert_eq!(failure.failure.output_tail(), "ghij");
    assert_eq!(failure.result.succeeded_stages(), vec!["quiet"]);
}

#[derive(Debug)]
struct EnrichStage {
    config: Config,
    enricher: Enricher,
}

#[async_trait]
impl Stage for EnrichStage {
    fn name(&self) -> &str {
        ENRICH
    }

    async fn execute(&self, _input: Option<&CompletionToken>) -> ExitResult {
        match self
            .enricher
            .run(
                &self.config.images_dir(),
                &self.config.base_dir,
                &self.config.snapshot_path(),
            )
            .await
        {
            Ok(report) => ExitResult::success(format!("{} images", report.processed)),
            Err(e) => ExitResult::error(e.to_string()),
        }
    }
}

fn job_result<T>(outcome: Result<T, crate::errors::MediaflowError>) -> ExitResult {
    match outcome {
        Ok(_) => ExitResult::success("done"),
        Err(e) => ExitResult::error(e.to_string()),
    }
}

fn local_pipeline(config: &Config, detector: StaticDetector) -> Pipeline {
    let raw_config = config.clone();
    let detection_config = config.clone();
    let enrich = EnrichStage {
        config: config.clone(),
        enricher: Enricher::new(Arc::new(detector), Classifier::default(), 2),
    };

    PipelineBuilder::new("local")
        .stage(StageSpec::new(
            LOAD_RAW,
            Arc::new(FnStage::new(LOAD_RAW, move |_: Option<&CompletionToken>| {
                job_result(jobs::load_raw(&raw_config))
            })),
        ))
        .unwrap()
        .stage(StageSpec::new(ENRICH, Arc::new(enrich)).with_retry(fast_retry(2)))
        .unwrap()
        .stage(StageSpec::new(
            LOAD_ENRICHMENT,
            Arc::new(FnStage::new(LOAD_ENRICHMENT, move |_: Option<&CompletionToken>| {
                job_result(jobs::load_detections(&detection_config))
            })),
        ))
        .unwrap()
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_end_to_end_reload_and_enrichment() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let store = BatchStore::new(config.raw_dir());
    let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let record = |text: &str| RawRecord {
        record_id: Some(1),
        text: Some(text.to_string()),
        ..RawRecord::default()
    };

    let image_dir = config.images_dir().join("x");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::write(image_dir.join("1.jpg"), b"img").unwrap();
    let detector = || {
        StaticDetector::new().with_answer(
            "1.jpg",
            vec![
                Detection::new(0, "person", 0.9),
                Detection::new(39, "bottle", 0.5),
            ],
        )
    };

    store.write("x", day, &[record("hello")]).unwrap();
    local_pipeline(&config, detector()).run().await.unwrap();

    store.write("x", day, &[record("hello world")]).unwrap();
    let result = local_pipeline(&config, detector()).run().await.unwrap();
    assert_eq!(result.succeeded_stages(), vec![LOAD_RAW, ENRICH, LOAD_ENRICHMENT]);

    let warehouse = Warehouse::open(&config.warehouse_path()).unwrap();
    assert_eq!(warehouse.row_count(crate::warehouse::RAW_RECORDS_TABLE).unwrap(), 1);
    let row = warehouse.fetch_record(1, "x").unwrap().unwrap();
    assert_eq!(row.text.as_deref(), Some("hello world"));

    let detections = warehouse.fetch_detections().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].category, Category::Promotional);
    assert_eq!(
        detections[0].confidence_map.clone().into_iter().collect::<Vec<_>>(),
        vec![(0, 0.9), (39, 0.5)]
    );
}

#[tokio::test]
async fn test_detector_outage_keeps_loaded_detections() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let store = BatchStore::new(config.raw_dir());
    let day = NaiveDate::from_ymd_opt(2024, 5, 2).unwrap();
    store
        .write(
            "x",
            day,
            &[RawRecord {
                record_id: Some(1),
                ..RawRecord::default()
            }],
        )
        .unwrap();

    let image_dir = config.images_dir().join("x");
    std::fs::create_dir_all(&image_dir).unwrap();
    std::fs::write(image_dir.join("1.jpg"), b"img").unwrap();

    let healthy = StaticDetector::new().with_answer("1.jpg", vec![Detection::new(0, "person", 0.8)]);
    local_pipeline(&config, healthy).run().await.unwrap();

    let broken = StaticDetector::new().with_failure("1.jpg");
    let failure = local_pipeline(&config, broken).run().await.unwrap_err();

    assert_eq!(failure.failure.stage(), ENRICH);
    assert!(failure.failure.is_fatal());
    assert_eq!(failure.result.succeeded_stages(), vec![LOAD_RAW]);

    let warehouse = Warehouse::open(&config.warehouse_path()).unwrap();
    let detections = warehouse.fetch_detections().unwrap();
    assert_eq!(detections.len(), 1);
    assert_eq!(detections[0].category, Category::Lifestyle);
}
