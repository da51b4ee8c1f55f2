//! Batch coordinator tests: failure isolation, cancellation, duplicates and
//! reprocessing of records left unmaterialized.

mod common;

use anyhow::Result;
use common::{components, daily_type, refdate, StubTransport, TestEngine};
use marketcache_engine::batch::BatchItemStatus;
use marketcache_engine::params::{DateRange, ParamGrid};
use marketcache_engine::{AlreadySatisfied, BatchMode};
use tokio_util::sync::CancellationToken;

fn week() -> ParamGrid {
    let days = DateRange::new(refdate(2023, 5, 6), refdate(2023, 5, 14)).weekdays();
    ParamGrid::new().many("refdate", days)
}

#[tokio::test]
async fn test_batch_isolates_failing_item() -> Result<()> {
    let transport = StubTransport::failing_on(refdate(2023, 5, 10));
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;

    let report = env
        .engine
        .run_batch("daily", &week(), BatchMode::Full, &CancellationToken::new())
        .await?;

    assert_eq!(report.items.len(), 5);
    assert_eq!(report.succeeded().count(), 4);
    assert_eq!(report.failed().count(), 1);
    assert!(!report.is_clean());

    let failed = &report.items[2];
    assert_eq!(failed.params["refdate"].as_date(), Some(refdate(2023, 5, 10)));
    assert!(matches!(failed.status, BatchItemStatus::Failed { fatal: false, .. }));

    for item in report.succeeded() {
        let BatchItemStatus::Materialized(rows) = &item.status else {
            panic!("expected materialized, got {:?}", item.status);
        };
        assert_eq!(rows.get("data"), Some(&1));
    }

    assert!(env.dataset_file("datasets/daily/2023-05-09.parquet").exists());
    assert!(!env.dataset_file("datasets/daily/2023-05-10.parquet").exists());
    assert_eq!(env.raw_folders("daily").len(), 4);
    assert_eq!(transport.calls(), 5);
    Ok(())
}

#[tokio::test]
async fn test_second_batch_is_served_from_cache() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;
    let cancel = CancellationToken::new();

    let first = env.engine.run_batch("daily", &week(), BatchMode::Download, &cancel).await?;
    assert!(first.items.iter().all(|item| item.status == BatchItemStatus::Fetched));

    let second = env.engine.run_batch("daily", &week(), BatchMode::Download, &cancel).await?;
    assert!(second
        .items
        .iter()
        .all(|item| item.status == BatchItemStatus::AlreadySatisfied(AlreadySatisfied::Cached)));
    assert_eq!(transport.calls(), 5);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_batch_starts_nothing() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = env.engine.run_batch("daily", &week(), BatchMode::Full, &cancel).await?;

    assert_eq!(report.cancelled().count(), 5);
    assert_eq!(transport.calls(), 0);
    assert!(env.raw_folders("daily").is_empty());
    Ok(())
}

#[tokio::test]
async fn test_duplicate_requests_are_skipped() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;
    let day = refdate(2023, 5, 10);
    let grid = ParamGrid::new().many("refdate", [day, day]);

    let report = env
        .engine
        .run_batch("daily", &grid, BatchMode::Download, &CancellationToken::new())
        .await?;

    assert_eq!(report.items[0].status, BatchItemStatus::Fetched);
    assert_eq!(report.items[1].status, BatchItemStatus::Skipped);
    assert_eq!(report.items[0].fingerprint, report.items[1].fingerprint);
    assert_eq!(transport.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_configuration_error_fails_whole_batch() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;
    let grid = week().one("typo", "x");

    let err = env
        .engine
        .run_batch("daily", &grid, BatchMode::Download, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(transport.calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_reprocess_pending_isolates_parser_failures() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "failing")], components(transport)).await?;
    let cancel = CancellationToken::new();

    let report = env.engine.run_batch("daily", &week(), BatchMode::Full, &cancel).await?;
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.succeeded().count(), 4);

    let pending = env.engine.metadata().list_unmaterialized("daily").await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].params["refdate"].as_date(), Some(refdate(2023, 5, 11)));
    assert!(pending[0].processing_error.is_some());

    let again = env.engine.reprocess_pending("daily", &cancel).await?;
    assert_eq!(again.items.len(), 1);
    assert!(again.items[0].status.is_failure());
    assert_eq!(env.engine.metadata().list_unmaterialized("daily").await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_reprocess_pending_materializes_downloads() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport)).await?;
    let cancel = CancellationToken::new();

    env.engine.run_batch("daily", &week(), BatchMode::Download, &cancel).await?;
    assert_eq!(env.engine.metadata().list_unmaterialized("daily").await?.len(), 5);

    let report = env.engine.reprocess_pending("daily", &cancel).await?;
    assert!(report.is_clean());
    assert_eq!(report.items.len(), 5);
    assert!(env.engine.metadata().list_unmaterialized("daily").await?.is_empty());
    assert!(env.dataset_file("datasets/daily/2023-05-12.parquet").exists());
    Ok(())
}
