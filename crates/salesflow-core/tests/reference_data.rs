use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use polars::prelude::*;
use salesflow_core::reference_data::{
    DimensionFiles, RefreshCause, ReferenceDataLoader, ReferenceError,
};
use salesflow_core::reference_store::{
    MemoryTableStore, PgTableStore, ReferenceStoreClient, ReferenceStoreSettings, StoreError,
    TableStore, WriteMode, PRODUCTS_TABLE, STORES_TABLE,
};
use salesflow_core::secrets::{InjectedCredential, SecretRef, SecretResolver};

fn settings() -> ReferenceStoreSettings {
    ReferenceStoreSettings {
        host: "10.0.0.5".into(),
        port: 5432,
        database: "sales".into(),
        user: "etl".into(),
    }
}

fn resolver(password: Option<&str>) -> Arc<SecretResolver> {
    Arc::new(SecretResolver::new(
        SecretRef::new("sql-password", "acme-analytics"),
        vec![Box::new(InjectedCredential::new(password.map(str::to_string)))],
    ))
}

fn client(store: Arc<dyn TableStore>) -> Arc<ReferenceStoreClient> {
    Arc::new(ReferenceStoreClient::new(settings(), resolver(Some("pw")), store))
}

fn write_dimensions(root: &Path, products: &str, stores: &str) -> Result<DimensionFiles> {
    let files = DimensionFiles::under(root);
    std::fs::create_dir_all(root.join("reference_data"))?;
    std::fs::write(&files.products, products)?;
    std::fs::write(&files.stores, stores)?;
    Ok(files)
}

fn column_values(frame: &DataFrame, name: &str) -> Result<Vec<Option<String>>> {
    Ok(frame
        .column(name)?
        .str()?
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect())
}

#[tokio::test]
async fn refresh_overwrites_and_drops_removed_products() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryTableStore::new());
    let loader = ReferenceDataLoader::new(client(store.clone()));

    let files = write_dimensions(
        dir.path(),
        "product_id,product_name,category\np1,Widget,Tools\np2,Gadget,Toys\n",
        "store_id,store_name,store_location\ns1,North,Oslo\n",
    )?;
    let summary = loader.refresh(&files).await?;
    assert_eq!(summary.products_rows, 2);
    assert_eq!(summary.stores_rows, 1);

    write_dimensions(
        dir.path(),
        "product_id,product_name,category\np1,Widget,Tools\n",
        "store_id,store_name,store_location\ns1,North,Oslo\ns2,South,Bergen\n",
    )?;
    loader.refresh(&files).await?;

    let tables = loader.read_back().await?;
    assert_eq!(column_values(&tables.products, "product_id")?, vec![Some("p1".into())]);
    assert_eq!(tables.stores.height(), 2);
    assert_eq!(store.committed_writes(), 4);
    Ok(())
}

#[tokio::test]
async fn dimension_values_stay_text_and_duplicates_are_kept_verbatim() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryTableStore::new());
    let loader = ReferenceDataLoader::new(client(store.clone()));

    let files = write_dimensions(
        dir.path(),
        "product_id,product_name,category,unit_price\n007,Old,Tools,1.50\n007,New,Tools,2.00\n",
        "store_id,store_name,store_location\n01,North,Oslo\n",
    )?;
    loader.refresh(&files).await?;

    let products = store.table(PRODUCTS_TABLE).expect("products table");
    assert_eq!(products.height(), 2, "the store mirrors the file exactly");
    assert_eq!(products.column("unit_price")?.dtype(), &DataType::String);
    assert_eq!(
        column_values(&products, "product_id")?,
        vec![Some("007".into()), Some("007".into())]
    );
    Ok(())
}

#[tokio::test]
async fn crash_mid_write_keeps_previous_table() -> Result<()> {
    let store = Arc::new(MemoryTableStore::new());
    let client = client(store.clone());

    let original = df!("product_id" => ["p1", "p2"], "product_name" => ["Widget", "Gadget"])?;
    client
        .bulk_write(PRODUCTS_TABLE, &original, WriteMode::Overwrite)
        .await?;

    let replacement = df!(
        "product_id" => ["p3", "p4", "p5"],
        "product_name" => ["A", "B", "C"],
    )?;
    store.fail_next_write_after(2);
    let err = client
        .bulk_write(PRODUCTS_TABLE, &replacement, WriteMode::Overwrite)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::WriteAborted { rows_written: 2, .. }));

    let visible = client.bulk_read(PRODUCTS_TABLE).await?;
    assert!(visible.equals_missing(&original));
    Ok(())
}

#[tokio::test]
async fn failed_refresh_names_the_table() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = Arc::new(MemoryTableStore::new());
    let loader = ReferenceDataLoader::new(client(store.clone()));

    let files = DimensionFiles::under(dir.path());
    std::fs::create_dir_all(dir.path().join("reference_data"))?;
    std::fs::write(&files.products, "product_id,product_name,category\np1,Widget,Tools\n")?;

    match loader.refresh(&files).await {
        Err(ReferenceError::RefreshFailed { table, source }) => {
            assert_eq!(table, STORES_TABLE);
            assert!(matches!(source, RefreshCause::Open { .. }));
        }
        other => panic!("expected RefreshFailed, got {other:?}"),
    }
    assert!(store.table(PRODUCTS_TABLE).is_some());
    Ok(())
}

#[tokio::test]
async fn reading_an_unloaded_table_fails() -> Result<()> {
    let loader = ReferenceDataLoader::new(client(Arc::new(MemoryTableStore::new())));
    assert!(matches!(
        loader.read_back().await,
        Err(ReferenceError::ReadFailed { ref table, .. }) if table == PRODUCTS_TABLE
    ));
    Ok(())
}

#[tokio::test]
async fn health_check_reports_incomplete_parameters() -> Result<()> {
    let store: Arc<dyn TableStore> = Arc::new(MemoryTableStore::new());

    let healthy = ReferenceStoreClient::new(settings(), resolver(Some("pw")), store.clone());
    assert!(healthy.health_check().await?);

    let mut missing_host = settings();
    missing_host.host = String::new();
    let client = ReferenceStoreClient::new(missing_host, resolver(Some("pw")), store.clone());
    assert!(!client.health_check().await?);
    assert!(matches!(
        client.build_connection_descriptor().await,
        Err(StoreError::ConnectionParameterInvalid(message)) if message.contains("host")
    ));

    let no_credential = ReferenceStoreClient::new(settings(), resolver(None), store);
    assert!(!no_credential.health_check().await?);
    Ok(())
}

#[tokio::test]
async fn descriptor_carries_fixed_driver_tuning() -> Result<()> {
    let client = client(Arc::new(MemoryTableStore::new()));
    let descriptor = client.build_connection_descriptor().await?;

    assert_eq!(descriptor.endpoint(), "10.0.0.5:5432");
    assert_eq!(descriptor.url(), "postgres://10.0.0.5:5432/sales");
    assert_eq!(descriptor.credential.expose(), "pw");
    assert!(!format!("{descriptor:?}").contains("\"pw\""));
    assert_eq!(descriptor.driver.login_timeout.as_secs(), 30);
    Ok(())
}

#[tokio::test]
async fn unsafe_table_names_are_rejected() -> Result<()> {
    let client = client(Arc::new(MemoryTableStore::new()));
    let frame = df!("product_id" => ["p1"])?;
    let err = client
        .bulk_write("products; DROP TABLE stores", &frame, WriteMode::Overwrite)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ConnectionParameterInvalid(_)));
    Ok(())
}

#[tokio::test]
async fn postgres_replace_is_atomic() -> Result<()> {
    let database_url = match env::var("SALESFLOW_TEST_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping postgres_replace_is_atomic because SALESFLOW_TEST_DATABASE_URL is not set");
            return Ok(());
        }
    };

    let pool = sqlx::PgPool::connect(&database_url).await?;
    let store = Arc::new(PgTableStore::with_pool(pool));
    let client = client(store.clone());
    let table = "salesflow_test_products";

    let original = df!("product_id" => ["p1", "p2"], "product_name" => ["Widget", "Gadget"])?;
    client.bulk_write(table, &original, WriteMode::Overwrite).await?;

    // Postgres rejects NUL bytes in TEXT, so the insert fails after DROP and CREATE ran.
    let broken = df!("product_id" => ["p9"], "product_name" => ["bad\u{0}name"])?;
    assert!(client
        .bulk_write(table, &broken, WriteMode::Overwrite)
        .await
        .is_err());

    let visible = client.bulk_read(table).await?;
    assert_eq!(column_values(&visible, "product_id")?, vec![Some("p1".into()), Some("p2".into())]);

    let cleanup = sqlx::PgPool::connect(&database_url).await?;
    sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
        .execute(&cleanup)
        .await?;
    store.release().await;
    Ok(())
}
