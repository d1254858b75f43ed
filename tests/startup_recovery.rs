#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use groombook_lib::db::health::DbHealthStatus;
use groombook_lib::db::Store;
use groombook_lib::repo;
use groombook_lib::startup::{prepare_store, UNRECOVERABLE_CODE};

use util::{add_client, backup_manager, book, corrupt, hm, temp_store, ymd};

#[tokio::test]
async fn fresh_install_starts_and_writes_auto_backup() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join(util::DB_FILE));
    let manager = backup_manager(dir.path(), &store);

    let report = prepare_store(&manager).await.expect("startup");
    assert_eq!(report.health.status, DbHealthStatus::Ok);
    assert!(report.restored_from.is_none());
    assert!(report.auto_backup_refreshed);
    assert!(manager.auto_backup_path().exists());
}

#[tokio::test]
async fn corrupted_store_is_restored_at_startup() {
    let (dir, store) = temp_store().await;
    let client = add_client(&store, "Vidal", "Eva", "Nala").await;
    book(&store, client, ymd(2024, 9, 12), hm(16, 0)).await;
    let manager = backup_manager(dir.path(), &store);
    prepare_store(&manager).await.expect("first start");

    corrupt(store.db_path());
    let report = prepare_store(&manager).await.expect("recovered start");
    assert!(report.restored_from.is_some());
    assert!(report.health.is_healthy());

    let rows = repo::appointments_on(&store, ymd(2024, 9, 12)).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].dog_name, "Nala");
}

#[tokio::test]
async fn corruption_without_backup_is_fatal() {
    let (dir, store) = temp_store().await;
    let manager = backup_manager(dir.path(), &store);
    corrupt(store.db_path());

    let err = prepare_store(&manager).await.expect_err("unrecoverable");
    assert_eq!(err.code(), UNRECOVERABLE_CODE);
    assert!(err.cause().is_some());
}
