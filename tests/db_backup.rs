#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use std::time::{Duration, Instant};

use anyhow::Result;
use groombook_lib::db::backup::{
    NO_AUTO_BACKUP_CODE, RESERVED_NAME_CODE, SOURCE_MISSING_CODE,
};
use groombook_lib::db::health::verify_integrity;
use groombook_lib::db::Store;
use groombook_lib::repo;

use util::{add_client, backup_manager, book, corrupt, hm, temp_store, ymd};

#[tokio::test]
async fn backup_then_restore_is_byte_identical() -> Result<()> {
    let (dir, store) = temp_store().await;
    let client = add_client(&store, "García", "Ana", "Toby").await;
    book(&store, client, ymd(2024, 3, 5), hm(10, 0)).await;
    let manager = backup_manager(dir.path(), &store);

    let backup_path = dir.path().join("monday.sqlite3");
    manager.backup(store.db_path(), &backup_path).await?;
    let restored_path = dir.path().join("restored.sqlite3");
    manager.restore(&backup_path, &restored_path).await?;

    let live = std::fs::read(store.db_path())?;
    assert_eq!(std::fs::read(&backup_path)?, live);
    assert_eq!(std::fs::read(&restored_path)?, live);

    let copy = Store::new(&restored_path);
    let rows = repo::appointments_on(&copy, ymd(2024, 3, 5)).await?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].client_display_name(), "García Ana");
    Ok(())
}

#[tokio::test]
async fn restore_over_live_store_brings_back_old_rows() -> Result<()> {
    let (dir, store) = temp_store().await;
    let client = add_client(&store, "Ruiz", "Marta", "Kira").await;
    book(&store, client, ymd(2024, 3, 5), hm(10, 0)).await;
    let manager = backup_manager(dir.path(), &store);

    let backup_path = dir.path().join("before.sqlite3");
    manager.backup(store.db_path(), &backup_path).await?;
    book(&store, client, ymd(2024, 3, 5), hm(11, 0)).await;
    assert_eq!(repo::appointments_on(&store, ymd(2024, 3, 5)).await?.len(), 2);

    manager.restore(&backup_path, store.db_path()).await?;
    assert_eq!(repo::appointments_on(&store, ymd(2024, 3, 5)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn reserved_destination_is_rejected_before_touching_disk() {
    let (dir, store) = temp_store().await;
    let manager = backup_manager(dir.path(), &store);

    let missing_dir = dir.path().join("not-created");
    let err = manager
        .backup(
            &dir.path().join("nothing-here.sqlite3"),
            &missing_dir.join(util::DB_FILE),
        )
        .await
        .expect_err("reserved name");
    assert_eq!(err.code(), RESERVED_NAME_CODE);
    assert!(!missing_dir.exists());
    assert!(!store.maintenance().is_active());
}

#[tokio::test]
async fn reserved_source_is_rejected_even_if_missing() {
    let (dir, store) = temp_store().await;
    let manager = backup_manager(dir.path(), &store);
    let before = std::fs::read(store.db_path()).unwrap();

    let err = manager
        .restore(&dir.path().join("elsewhere").join(util::DB_FILE), store.db_path())
        .await
        .expect_err("reserved name");
    assert_eq!(err.code(), RESERVED_NAME_CODE);
    assert_eq!(std::fs::read(store.db_path()).unwrap(), before);
}

#[tokio::test]
async fn restore_from_missing_file_keeps_live_store() {
    let (dir, store) = temp_store().await;
    let manager = backup_manager(dir.path(), &store);
    let before = std::fs::read(store.db_path()).unwrap();

    let err = manager
        .restore(&dir.path().join("gone.sqlite3"), store.db_path())
        .await
        .expect_err("missing source");
    assert_eq!(err.code(), SOURCE_MISSING_CODE);
    assert_eq!(std::fs::read(store.db_path()).unwrap(), before);
}

#[tokio::test]
async fn retry_restore_without_auto_backup_fails_fast() {
    let (dir, store) = temp_store().await;
    let manager = backup_manager(dir.path(), &store);

    let started = Instant::now();
    let err = manager
        .try_restore_database(3, Duration::from_secs(10))
        .await
        .expect_err("no auto-backup");
    assert_eq!(err.code(), NO_AUTO_BACKUP_CODE);
    assert!(started.elapsed() < Duration::from_secs(2), "slept between attempts");
}

#[tokio::test]
async fn auto_backup_recovers_a_corrupted_store() -> Result<()> {
    let (dir, store) = temp_store().await;
    let client = add_client(&store, "Pérez", "Luis", "Rocky").await;
    book(&store, client, ymd(2024, 6, 1), hm(9, 30)).await;
    let manager = backup_manager(dir.path(), &store);

    assert!(manager.create_auto_backup().await);
    assert!(manager.auto_backup_path().exists());

    corrupt(store.db_path());
    let record = manager
        .try_restore_database(3, Duration::from_millis(10))
        .await?;
    assert_eq!(record.path, manager.auto_backup_path());

    let report = verify_integrity(&store).await?;
    assert!(report.is_healthy());
    assert_eq!(repo::appointments_on(&store, ymd(2024, 6, 1)).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn auto_backup_failure_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new(dir.path().join(util::DB_FILE));
    let manager = backup_manager(dir.path(), &store);
    assert!(!manager.create_auto_backup().await, "nothing to back up yet");
    assert!(!manager.auto_backup_path().exists());
}
