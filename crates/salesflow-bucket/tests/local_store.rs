use anyhow::Result;
use bytes::Bytes;
use salesflow_bucket::{BucketError, BucketStore, LocalBucketStore};

#[tokio::test]
async fn put_replaces_existing_object() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LocalBucketStore::new(dir.path());

    store
        .put_object("proj/ds/table.parquet", Bytes::from_static(b"first"), "application/octet-stream")
        .await?;
    store
        .put_object("proj/ds/table.parquet", Bytes::from_static(b"second"), "application/octet-stream")
        .await?;

    let stored = store.get_object("proj/ds/table.parquet").await?;
    assert_eq!(stored.as_ref(), b"second");

    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("proj/ds"))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
        .collect();
    assert!(leftovers.is_empty(), "staging file should be renamed away");
    Ok(())
}

#[tokio::test]
async fn missing_object_reports_not_found() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LocalBucketStore::new(dir.path());

    let err = store.get_object("nope.parquet").await.unwrap_err();
    assert!(matches!(err, BucketError::NotFound(key) if key == "nope.parquet"));
    Ok(())
}

#[tokio::test]
async fn rejects_keys_escaping_the_root() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = LocalBucketStore::new(dir.path());

    let err = store
        .put_object("../outside.parquet", Bytes::from_static(b"x"), "application/octet-stream")
        .await
        .unwrap_err();
    assert!(matches!(err, BucketError::Configuration(_)));
    Ok(())
}
