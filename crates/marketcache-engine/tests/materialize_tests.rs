//! Materialization tests
//!
//! Partition naming, empty-table handling, recorded parser failures and
//! multi-output folders, driven through the engine facade.

mod common;

use anyhow::Result;
use arrow_array::cast::AsArray;
use chrono::{TimeZone, Utc};
use common::{components, daily_type, refdate, refdate_params, StubTransport, TestEngine};
use marketcache_common::Params;
use marketcache_engine::artifact_type::{ParserSpec, TransportSpec};
use marketcache_engine::{fingerprint, ArtifactMetadata, EngineError, Reprocess};

#[tokio::test]
async fn test_request_date_names_partition() -> Result<()> {
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(StubTransport::daily_csv())).await?;
    let params = refdate_params(refdate(2023, 5, 10));

    let meta = env.engine.fetch("daily", &params).await?.into_result()?;
    let report = env.engine.materialize(&meta.fingerprint).await?;
    assert_eq!(report.total_rows(), 1);

    let stored = env.engine.metadata().load(&meta.fingerprint).await?.unwrap();
    assert_eq!(stored.outputs["data"], "datasets/daily/2023-05-10.parquet");
    assert!(stored.processing_error.is_none());
    assert!(env.dataset_file("datasets/daily/2023-05-10.parquet").is_file());
    Ok(())
}

#[tokio::test]
async fn test_checksum_key_gets_part_prefix() -> Result<()> {
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(StubTransport::daily_csv())).await?;

    let raw = env.engine.raw();
    let location = raw.path("daily", "abc123");
    let file = raw.write(&location, "downloaded.csv", b"symbol,close\nPETR4,27.10\nVALE3,68.20\n")?;
    let file = raw.compress(&file)?;

    let fp = fingerprint("daily", &Params::new(), "");
    let mut meta = ArtifactMetadata::new(
        fp.clone(),
        "daily",
        Params::new(),
        "",
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
    );
    meta.content_checksum = Some("abc123".to_string());
    meta.raw_files = vec![file];
    env.engine.metadata().save(&meta).await?;

    let report = env.engine.materialize(&fp).await?;
    assert_eq!(report.rows["data"], 2);
    assert!(env.dataset_file("datasets/daily/part-abc123.parquet").is_file());
    Ok(())
}

#[tokio::test]
async fn test_date_with_symbol_key_gets_part_prefix() -> Result<()> {
    let mut config = daily_type("company", "csv");
    config.transport = TransportSpec::new("stub").required("issuingCompany");
    config.parser = ParserSpec::new("csv").with_key_params(["issuingCompany"]);
    let transport = StubTransport::fixed(b"refdate,symbol,close\n2024-01-02,ABEV3,12.50\n".to_vec());
    let env = TestEngine::start(vec![config], components(transport)).await?;

    let mut params = Params::new();
    params.insert("issuingCompany".to_string(), "ABEV".into());
    let meta = env.engine.fetch("company", &params).await?.into_result()?;
    env.engine.materialize(&meta.fingerprint).await?;

    let stored = env.engine.metadata().load(&meta.fingerprint).await?.unwrap();
    assert_eq!(stored.outputs["data"], "datasets/company/part-2024-01-02-ABEV.parquet");
    assert!(env.dataset_file("datasets/company/part-2024-01-02-ABEV.parquet").is_file());
    assert!(!env.dataset_file("datasets/company/2024-01-02-ABEV.parquet").exists());
    Ok(())
}

#[tokio::test]
async fn test_empty_table_writes_nothing() -> Result<()> {
    let env = TestEngine::start(vec![daily_type("daily", "empty")], components(StubTransport::daily_csv())).await?;
    let meta = env
        .engine
        .fetch("daily", &refdate_params(refdate(2023, 5, 10)))
        .await?
        .into_result()?;

    let report = env.engine.materialize(&meta.fingerprint).await?;
    assert!(report.rows.is_empty());
    assert_eq!(report.skipped_empty, vec!["data".to_string()]);
    assert!(!env.dataset_file("datasets/daily").exists());

    let stored = env.engine.metadata().load(&meta.fingerprint).await?.unwrap();
    assert!(stored.outputs.is_empty());
    assert!(stored.processing_error.is_none());
    Ok(())
}

#[tokio::test]
async fn test_parser_failure_is_recorded() -> Result<()> {
    let env = TestEngine::start(vec![daily_type("daily", "failing")], components(StubTransport::daily_csv())).await?;
    let meta = env
        .engine
        .fetch("daily", &refdate_params(refdate(2023, 5, 11)))
        .await?
        .into_result()?;

    let err = env.engine.materialize(&meta.fingerprint).await.unwrap_err();
    assert!(matches!(err, EngineError::Materialization(_)));

    let stored = env.engine.metadata().load(&meta.fingerprint).await?.unwrap();
    assert!(stored.outputs.is_empty());
    assert!(stored.processing_error.unwrap().contains("malformed record"));
    // the download itself stays usable
    assert!(env.engine.raw().files_exist(&stored.raw_files));
    Ok(())
}

#[tokio::test]
async fn test_multi_output_folders() -> Result<()> {
    let mut config = daily_type("composition", "multi");
    config.parser = ParserSpec::new("multi").with_output("Indexes", "indexes");
    let env = TestEngine::start(vec![config], components(StubTransport::daily_csv())).await?;

    let datasets = env
        .engine
        .get("composition", &refdate_params(refdate(2023, 5, 10)), Reprocess::None)
        .await?;

    assert_eq!(datasets.keys().collect::<Vec<_>>(), vec!["Indexes"]);
    assert_eq!(datasets["Indexes"][0].num_rows(), 2);
    assert!(env
        .dataset_file("datasets/composition-indexes/2023-05-10.parquet")
        .is_file());
    assert!(!env.dataset_file("datasets/composition-Stocks").exists());
    Ok(())
}

#[tokio::test]
async fn test_get_returns_parsed_rows() -> Result<()> {
    let transport = StubTransport::daily_csv();
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(transport.clone())).await?;
    let params = refdate_params(refdate(2023, 5, 10));

    let datasets = env.engine.get("daily", &params, Reprocess::None).await?;
    let batch = &datasets["data"][0];
    assert_eq!(batch.num_rows(), 1);
    assert_eq!(batch.column_by_name("symbol").unwrap().as_string::<i32>().value(0), "PETR4");

    // cached outputs are read back without parsing again
    let path = env.dataset_file("datasets/daily/2023-05-10.parquet");
    let modified = std::fs::metadata(&path)?.modified()?;
    env.engine.get("daily", &params, Reprocess::None).await?;
    assert_eq!(std::fs::metadata(&path)?.modified()?, modified);

    env.engine.get("daily", &params, Reprocess::Parse).await?;
    assert_eq!(transport.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_materialize_unknown_fingerprint() -> Result<()> {
    let env = TestEngine::start(vec![daily_type("daily", "csv")], components(StubTransport::daily_csv())).await?;
    let err = env
        .engine
        .materialize(&fingerprint("daily", &Params::new(), ""))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MetadataNotFound(_)));
    Ok(())
}
