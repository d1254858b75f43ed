#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::path::Path;

use anyhow::Result;
use assert_cmd::Command;
use serde_json::Value;
use tempfile::tempdir;

fn groombook(appdata: &Path) -> Result<Command> {
    let mut cmd = Command::cargo_bin("groombook")?;
    cmd.env("GROOMBOOK_FAKE_APPDATA", appdata)
        .env("GROOMBOOK_LOG", "off")
        .env("GROOMBOOK_RESTORE_DELAY_MS", "10");
    Ok(cmd)
}

fn stdout_json(output: &std::process::Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("json on stdout")
}

#[test]
fn db_status_reports_ok_on_fresh_install() -> Result<()> {
    let tmp = tempdir()?;
    let output = groombook(tmp.path())?.args(["db", "status", "--json"]).output()?;
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let report = stdout_json(&output);
    assert_eq!(report["status"], "ok");
    assert!(tmp.path().join("groombook.sqlite3").exists());
    Ok(())
}

#[test]
fn db_status_fails_on_unreadable_database() -> Result<()> {
    let tmp = tempdir()?;
    std::fs::write(tmp.path().join("groombook.sqlite3"), vec![0x5a_u8; 8192])?;
    let output = groombook(tmp.path())?.args(["db", "status"]).output()?;
    assert_eq!(output.status.code(), Some(1));
    Ok(())
}

#[test]
fn backup_to_reserved_name_exits_with_rejection() -> Result<()> {
    let tmp = tempdir()?;
    let target = tmp.path().join("elsewhere").join("groombook.sqlite3");
    let output = groombook(tmp.path())?
        .args(["db", "backup"])
        .arg(&target)
        .output()?;
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("BACKUP/RESERVED_NAME"));
    assert!(!target.parent().unwrap().exists());
    Ok(())
}

#[test]
fn restore_auto_without_backup_fails() -> Result<()> {
    let tmp = tempdir()?;
    let output = groombook(tmp.path())?.args(["db", "restore-auto"]).output()?;
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("BACKUP/NO_AUTO_BACKUP"));
    Ok(())
}

#[test]
fn booked_appointment_shows_in_agenda_and_month() -> Result<()> {
    let tmp = tempdir()?;
    let output = groombook(tmp.path())?
        .args(["client", "add", "--lastname", "García", "--name", "Ana", "--dog", "Toby"])
        .output()?;
    assert!(output.status.success());
    let client = stdout_json(&output)["id"].as_i64().unwrap();

    let output = groombook(tmp.path())?
        .args(["appointment", "add", "--client", &client.to_string()])
        .args(["--date", "2024-05-05", "--time", "10:30", "--confirmed"])
        .output()?;
    assert!(output.status.success());

    let output = groombook(tmp.path())?
        .args(["agenda", "--date", "2024-05-05", "--json"])
        .output()?;
    assert!(output.status.success());
    let rows = stdout_json(&output);
    assert_eq!(rows.as_array().map(Vec::len), Some(1));
    assert_eq!(rows[0]["time"], "10:30:00");
    assert_eq!(rows[0]["dog_name"], "Toby");
    assert_eq!(rows[0]["confirmed"], true);

    let output = groombook(tmp.path())?
        .args(["month", "--month", "2024-05", "--json"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(stdout_json(&output)["counts"]["5"], 1);
    Ok(())
}

#[test]
fn manual_backup_and_restore_round_trip() -> Result<()> {
    let tmp = tempdir()?;
    let backup = tmp.path().join("saved.sqlite3");
    groombook(tmp.path())?
        .args(["client", "add", "--lastname", "Ruiz", "--name", "Eva", "--dog", "Nala"])
        .assert()
        .success();
    groombook(tmp.path())?
        .args(["db", "backup"])
        .arg(&backup)
        .assert()
        .success();
    assert!(backup.exists());

    groombook(tmp.path())?
        .args(["db", "restore"])
        .arg(&backup)
        .assert()
        .success();
    Ok(())
}
