//! End-to-end driver tests: mock origin, local staging, in-memory destination

mod common;

use common::{
    float_trips, int_trips, local_store, parquet_bytes, sample_config, sample_group, string_trips, MemoryDestination,
};
use std::sync::Arc;
use tripload_ingest::config::Span;
use tripload_ingest::destination::Destination;
use tripload_ingest::driver::PipelineDriver;
use tripload_ingest::error::IngestError;
use tripload_ingest::fetcher::FetchOutcome;
use tripload_ingest::loader::LoadOutcome;
use tripload_ingest::reconcile::{ReconcileReport, StageOutcome};
use tripload_ingest::report::{AccessOutcome, Stage};
use tripload_ingest::schema::ColumnType;
use tripload_ingest::staging::StagingStore;
use tripload_ingest::{ArtifactRef, StagingVariant};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn serve(server: &MockServer, file_name: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(format!("/{}", file_name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_clean_and_drifted_artifacts_load_as_float() {
    let server = MockServer::start().await;
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(4))).await;
    serve(&server, "sample_tripdata_2021-02.parquet", parquet_bytes(int_trips(6))).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = MemoryDestination::new();
    let config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 2)));
    let driver = PipelineDriver::new(config, local_store(dir.path()), destination.clone()).unwrap();

    let report = driver.run(&["sample".to_string()]).await.unwrap();

    let a = report.get(&ArtifactRef::new("sample", 2021, 1)).unwrap();
    assert_eq!(a.reconcile, Some(StageOutcome::Staged(ReconcileReport::Clean)));
    assert_eq!(a.load, Some(LoadOutcome::Succeeded { rows: 4 }));

    let b = report.get(&ArtifactRef::new("sample", 2021, 2)).unwrap();
    assert!(matches!(
        b.reconcile,
        Some(StageOutcome::Staged(ReconcileReport::Rewritten { .. }))
    ));
    assert_eq!(b.load, Some(LoadOutcome::Succeeded { rows: 6 }));

    let group = report.group("sample").unwrap();
    assert_eq!(group.final_row_count, Some(10));
    assert!(!report.has_failures());

    let schema = destination.table_schema("sample_trips").unwrap();
    assert_eq!(schema.column("PULocationID").unwrap().column_type, ColumnType::Float64);
}

#[tokio::test]
async fn test_fetch_failure_does_not_stop_later_artifacts() {
    let server = MockServer::start().await;
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(3))).await;
    Mock::given(method("GET"))
        .and(path("/sample_tripdata_2021-02.parquet"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    serve(&server, "sample_tripdata_2021-03.parquet", parquet_bytes(float_trips(5))).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = MemoryDestination::new();
    let config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 3)));
    let driver = PipelineDriver::new(config, local_store(dir.path()), destination.clone()).unwrap();

    let report = driver.run(&[]).await.unwrap();

    let missing = report.get(&ArtifactRef::new("sample", 2021, 2)).unwrap();
    let error = missing.error.as_ref().unwrap();
    assert_eq!(error.stage, Stage::Fetch);
    assert_eq!(error.kind, "fetch_failed");
    assert!(missing.load.is_none());

    let last = report.get(&ArtifactRef::new("sample", 2021, 3)).unwrap();
    assert_eq!(last.load, Some(LoadOutcome::Succeeded { rows: 5 }));

    assert_eq!(report.group("sample").unwrap().final_row_count, Some(8));
    assert_eq!(report.failed(), 1);
    assert!(report.has_failures());
}

#[tokio::test]
async fn test_rerun_resumes_from_staging() {
    let server = MockServer::start().await;
    // Each file may be transferred once across both runs
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(2))).await;
    serve(&server, "sample_tripdata_2021-02.parquet", parquet_bytes(int_trips(2))).await;

    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());
    let destination = MemoryDestination::new();
    let config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 2)));
    let driver = PipelineDriver::new(config, store.clone(), destination.clone()).unwrap();

    driver.run(&[]).await.unwrap();
    let second = driver.run(&[]).await.unwrap();

    for entry in second.entries() {
        assert_eq!(entry.fetch, Some(FetchOutcome::AlreadyStaged));
        assert_eq!(entry.reconcile, Some(StageOutcome::AlreadyStaged));
    }
    assert_eq!(second.group("sample").unwrap().final_row_count, Some(4));

    let reconciled = ArtifactRef::new("sample", 2021, 2).staging_key(StagingVariant::Reconciled);
    assert!(store.exists(&reconciled).await.unwrap());
}

#[tokio::test]
async fn test_raw_group_skips_reconciliation() {
    let server = MockServer::start().await;
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(int_trips(3))).await;

    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());
    let destination = MemoryDestination::new();
    let group = sample_group(Span::new(1, 1)).with_variant(StagingVariant::Raw);
    let config = sample_config(&server.uri(), dir.path(), group);
    let driver = PipelineDriver::new(config, store.clone(), destination.clone()).unwrap();

    let report = driver.run(&[]).await.unwrap();

    let entry = report.get(&ArtifactRef::new("sample", 2021, 1)).unwrap();
    assert!(entry.reconcile.is_none());
    assert_eq!(entry.load, Some(LoadOutcome::Succeeded { rows: 3 }));

    let reconciled = ArtifactRef::new("sample", 2021, 1).staging_key(StagingVariant::Reconciled);
    assert!(!store.exists(&reconciled).await.unwrap());
}

#[tokio::test]
async fn test_unknown_group_fails_before_any_io() {
    let server = MockServer::start().await;

    let dir = tempfile::tempdir().unwrap();
    let destination = MemoryDestination::new();
    let config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 12)));
    let driver = PipelineDriver::new(config, local_store(dir.path()), destination.clone()).unwrap();

    let err = driver
        .run(&["sample".to_string(), "purple".to_string()])
        .await
        .unwrap_err();

    assert!(matches!(err, IngestError::Config(_)));
    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(destination.calls().is_empty());
}

#[tokio::test]
async fn test_reader_grant_is_idempotent() {
    let server = MockServer::start().await;
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(1))).await;

    let dir = tempfile::tempdir().unwrap();
    let destination = MemoryDestination::new();
    let mut config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 1)));
    config.pipeline.reader_identity = Some("dbt_reader".to_string());
    let driver = PipelineDriver::new(config, local_store(dir.path()), destination.clone()).unwrap();

    let first = driver.run(&[]).await.unwrap();
    let second = driver.run(&[]).await.unwrap();

    assert_eq!(
        first.access,
        Some(AccessOutcome::Granted {
            entity_id: "dbt_reader".to_string()
        })
    );
    assert_eq!(
        second.access,
        Some(AccessOutcome::AlreadyGranted {
            entity_id: "dbt_reader".to_string()
        })
    );
    assert_eq!(destination.access_updates(), 1);
}

#[tokio::test]
async fn test_concurrent_staging_keeps_artifact_order() {
    let server = MockServer::start().await;
    for month in 1..=4 {
        serve(
            &server,
            &format!("sample_tripdata_2021-{:02}.parquet", month),
            parquet_bytes(int_trips(month)),
        )
        .await;
    }

    let dir = tempfile::tempdir().unwrap();
    let destination = MemoryDestination::new();
    let mut config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 4)));
    config.pipeline.fetch_concurrency = 3;
    let driver = PipelineDriver::new(config, local_store(dir.path()), destination.clone()).unwrap();

    let report = driver.run(&[]).await.unwrap();

    let months: Vec<u32> = report.entries().map(|e| e.artifact.month()).collect();
    assert_eq!(months, vec![1, 2, 3, 4]);
    assert_eq!(report.group("sample").unwrap().final_row_count, Some(10));

    let files: Vec<String> = destination.calls().iter().map(|c| c.files[0].clone()).collect();
    assert_eq!(
        files,
        (1..=4)
            .map(|m| format!("sample__reconciled__sample_tripdata_2021-{:02}.parquet", m))
            .collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn test_driver_rejects_invalid_config() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = sample_config("http://localhost:1", dir.path(), sample_group(Span::new(1, 1)));
    config.pipeline.fetch_concurrency = 0;

    let destination: Arc<MemoryDestination> = MemoryDestination::new();
    let result = PipelineDriver::new(config, local_store(dir.path()), destination);
    assert!(matches!(result, Err(IngestError::Config(_))));
}

#[tokio::test]
async fn test_cast_failure_is_isolated_to_its_artifact() {
    let server = MockServer::start().await;
    serve(&server, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(3))).await;
    serve(&server, "sample_tripdata_2021-02.parquet", parquet_bytes(string_trips(4))).await;
    serve(&server, "sample_tripdata_2021-03.parquet", parquet_bytes(int_trips(5))).await;

    let dir = tempfile::tempdir().unwrap();
    let store = local_store(dir.path());
    let destination = MemoryDestination::new();
    let config = sample_config(&server.uri(), dir.path(), sample_group(Span::new(1, 3)));
    let driver = PipelineDriver::new(config, store.clone(), destination.clone()).unwrap();

    let report = driver.run(&[]).await.unwrap();

    let bad = ArtifactRef::new("sample", 2021, 2);
    let entry = report.get(&bad).unwrap();
    let error = entry.error.as_ref().unwrap();
    assert_eq!(error.stage, Stage::Reconcile);
    assert_eq!(error.kind, "cast_failed");
    assert!(error.message.contains("PULocationID"));
    assert!(entry.load.is_none());
    assert!(!store.exists(&bad.staging_key(StagingVariant::Reconciled)).await.unwrap());

    let last = report.get(&ArtifactRef::new("sample", 2021, 3)).unwrap();
    assert_eq!(last.load, Some(LoadOutcome::Succeeded { rows: 5 }));
    assert_eq!(report.group("sample").unwrap().final_row_count, Some(8));
    assert_eq!(report.failed(), 1);

    let calls = destination.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| !c.files[0].contains("2021-02")));
}

#[tokio::test]
async fn test_group_with_nothing_staged_still_drops_table() {
    let first_origin = MockServer::start().await;
    serve(&first_origin, "sample_tripdata_2021-01.parquet", parquet_bytes(float_trips(5))).await;

    let destination = MemoryDestination::new();
    let first_dir = tempfile::tempdir().unwrap();
    let config = sample_config(&first_origin.uri(), first_dir.path(), sample_group(Span::new(1, 1)));
    let driver = PipelineDriver::new(config, local_store(first_dir.path()), destination.clone()).unwrap();
    driver.run(&[]).await.unwrap();
    assert_eq!(destination.get_table("sample_trips").await.unwrap().row_count, 5);

    // Fresh staging and an origin that no longer has the file
    let empty_origin = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&empty_origin)
        .await;
    let second_dir = tempfile::tempdir().unwrap();
    let config = sample_config(&empty_origin.uri(), second_dir.path(), sample_group(Span::new(1, 1)));
    let driver = PipelineDriver::new(config, local_store(second_dir.path()), destination.clone()).unwrap();

    let report = driver.run(&[]).await.unwrap();

    assert_eq!(report.failed(), 1);
    assert_eq!(report.group("sample").unwrap().final_row_count, None);
    assert!(!destination.table_exists("sample_trips").await.unwrap());
    assert!(destination.calls().iter().all(|c| c.succeeded));
}
