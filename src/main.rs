use std::cell::Cell;
use std::path::PathBuf;
use std::process;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use serde_json::json;

use groombook_lib::change_detector::compute_snapshot;
use groombook_lib::config::{AppPaths, BackupConfig, SchedulerConfig};
use groombook_lib::db::backup::{BackupManager, RESERVED_NAME_CODE};
use groombook_lib::db::health::{self, DbHealthReport, DbHealthStatus};
use groombook_lib::db::Store;
use groombook_lib::repo::{self, AppointmentRow, NewAppointment, NewClient};
use groombook_lib::snapshot::YearMonth;
use groombook_lib::task_manager::{PollerCallbacks, TaskManager};
use groombook_lib::upcoming::UpcomingAppointmentView;
use groombook_lib::{startup, AppError};

const EXIT_OK: i32 = 0;
const EXIT_FAILURE: i32 = 1;
const EXIT_REJECTED: i32 = 2;
const DISPATCH_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Parser)]
#[command(name = "groombook", about = "Pet-grooming appointment book", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify the database, start background tasks and print notifications
    /// until interrupted.
    Run,
    /// List the appointments of one day.
    Agenda {
        /// Day to list (YYYY-MM-DD). Defaults to today.
        #[arg(long, value_parser = parse_date)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
    /// Show how many appointments each day of a month has.
    Month {
        /// Month to summarise (YYYY-MM). Defaults to the current month.
        #[arg(long, value_parser = parse_year_month)]
        month: Option<YearMonth>,
        #[arg(long)]
        json: bool,
    },
    /// Client records.
    #[command(subcommand)]
    Client(ClientCommand),
    /// Appointment records.
    #[command(subcommand)]
    Appointment(AppointmentCommand),
    /// Database maintenance and inspection commands.
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum ClientCommand {
    /// Register a client and their dog.
    Add {
        #[arg(long)]
        lastname: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        dog: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        breed: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum AppointmentCommand {
    /// Book an appointment for an existing client.
    Add {
        #[arg(long)]
        client: i64,
        #[arg(long, value_parser = parse_date)]
        date: NaiveDate,
        /// Time of day, HH:MM or HH:MM:SS.
        #[arg(long, value_parser = parse_time)]
        time: NaiveTime,
        #[arg(long)]
        confirmed: bool,
    },
    /// Cancel an appointment.
    Remove { id: i64 },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Run the integrity checks and report their status.
    Status {
        /// Emit the raw JSON health report instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Copy the live database to DEST.
    Backup { dest: PathBuf },
    /// Replace the live database with SOURCE.
    Restore { source: PathBuf },
    /// Replace the live database with the automatic backup.
    RestoreAuto,
}

fn main() {
    let cli = Cli::parse();
    let paths = match AppPaths::resolve() {
        Ok(paths) => paths,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(EXIT_FAILURE);
        }
    };

    let logs_dir = paths.logs_dir();
    let log_target = matches!(cli.command, Commands::Run).then_some(logs_dir.as_path());
    if let Err(err) = groombook_lib::init_logging(log_target) {
        eprintln!("Warning: file logging unavailable: {err:#}");
    }

    match handle_cli(cli.command, &paths) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(EXIT_FAILURE);
        }
    }
}

fn build_runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")
}

fn handle_cli(command: Commands, paths: &AppPaths) -> Result<i32> {
    let runtime = build_runtime()?;
    let store = Store::new(paths.db_path());
    match command {
        Commands::Run => run_app(&runtime, store, paths),
        Commands::Agenda { date, json } => {
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            runtime.block_on(store.initialize())?;
            let rows = runtime.block_on(repo::appointments_on(&store, date))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows).context("serialize agenda")?);
            } else {
                print_agenda(date, &rows);
            }
            Ok(EXIT_OK)
        }
        Commands::Month { month, json } => {
            let month = month.unwrap_or_else(|| YearMonth::of(Local::now().date_naive()));
            runtime.block_on(store.initialize())?;
            let snapshot = runtime.block_on(compute_snapshot(&store, month));
            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot).context("serialize month")?);
            } else {
                println!("Appointments in {month}: {}", snapshot.total());
                for (day, count) in snapshot.counts() {
                    println!("  {day:>2}: {count}");
                }
            }
            Ok(EXIT_OK)
        }
        Commands::Client(ClientCommand::Add {
            lastname,
            name,
            dog,
            phone,
            breed,
        }) => {
            runtime.block_on(store.initialize())?;
            let client = NewClient {
                lastname,
                name,
                dog_name: dog,
                phone,
                breed,
                ..NewClient::default()
            };
            let id = runtime.block_on(repo::insert_client(&store, &client))?;
            println!("{}", json!({ "id": id }));
            Ok(EXIT_OK)
        }
        Commands::Appointment(AppointmentCommand::Add {
            client,
            date,
            time,
            confirmed,
        }) => {
            runtime.block_on(store.initialize())?;
            let mut appointment = NewAppointment::new(client, date, time);
            appointment.confirmed = confirmed;
            let id = runtime.block_on(repo::insert_appointment(&store, &appointment))?;
            println!("{}", json!({ "id": id }));
            Ok(EXIT_OK)
        }
        Commands::Appointment(AppointmentCommand::Remove { id }) => {
            runtime.block_on(store.initialize())?;
            if runtime.block_on(repo::delete_appointment(&store, id))? {
                println!("Appointment {id} removed.");
                Ok(EXIT_OK)
            } else {
                eprintln!("No appointment with id {id}.");
                Ok(EXIT_FAILURE)
            }
        }
        Commands::Db(db) => handle_db_command(&runtime, store, paths, db),
    }
}

fn handle_db_command(
    runtime: &tokio::runtime::Runtime,
    store: Store,
    paths: &AppPaths,
    command: DbCommand,
) -> Result<i32> {
    let backups = BackupManager::from_paths(store.clone(), paths, BackupConfig::load());
    match command {
        DbCommand::Status { json } => {
            let report = match runtime.block_on(health::verify_integrity(&store)) {
                Ok(report) => report,
                Err(err) => return Ok(report_error(&err)),
            };
            if json {
                print_report_json(&report)?;
            } else {
                print_report_table(&report);
            }
            Ok(match report.status {
                DbHealthStatus::Ok => EXIT_OK,
                DbHealthStatus::Error => EXIT_FAILURE,
            })
        }
        DbCommand::Backup { dest } => {
            match runtime.block_on(backups.backup(store.db_path(), &dest)) {
                Ok(bytes) => {
                    println!("Backup stored at {} ({bytes} bytes)", dest.display());
                    Ok(EXIT_OK)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
        DbCommand::Restore { source } => {
            if let Err(err) = runtime.block_on(backups.restore(&source, store.db_path())) {
                return Ok(report_error(&err));
            }
            println!("Database restored from {}", source.display());
            verify_after_restore(runtime, &store)
        }
        DbCommand::RestoreAuto => {
            let config = backups.config().clone();
            match runtime.block_on(
                backups.try_restore_database(config.restore_attempts, config.restore_delay),
            ) {
                Ok(record) => {
                    println!(
                        "Database restored from the automatic backup taken {}",
                        record.created_at.to_rfc3339()
                    );
                    verify_after_restore(runtime, &store)
                }
                Err(err) => Ok(report_error(&err)),
            }
        }
    }
}

fn verify_after_restore(runtime: &tokio::runtime::Runtime, store: &Store) -> Result<i32> {
    match runtime.block_on(health::verify_integrity(store)) {
        Ok(report) if report.is_healthy() => Ok(EXIT_OK),
        Ok(report) => {
            print_report_table(&report);
            Ok(EXIT_FAILURE)
        }
        Err(err) => Ok(report_error(&err)),
    }
}

fn report_error(err: &AppError) -> i32 {
    eprintln!("Error: {} ({})", err.message(), err.code());
    let mut cause = err.cause();
    while let Some(inner) = cause {
        eprintln!("  caused by: {} ({})", inner.message(), inner.code());
        cause = inner.cause();
    }
    if err.code() == RESERVED_NAME_CODE {
        EXIT_REJECTED
    } else {
        EXIT_FAILURE
    }
}

fn run_app(runtime: &tokio::runtime::Runtime, store: Store, paths: &AppPaths) -> Result<i32> {
    let backups = BackupManager::from_paths(store.clone(), paths, BackupConfig::load());
    let report = match runtime.block_on(startup::prepare_store(&backups)) {
        Ok(report) => report,
        Err(err) => {
            eprintln!("The appointment book cannot start.");
            return Ok(report_error(&err));
        }
    };
    if let Some(taken) = report.restored_from {
        println!(
            "The database was damaged and has been restored from the automatic backup taken {}.",
            taken.to_rfc3339()
        );
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.store(true, Ordering::SeqCst);
        }
    });

    let config = SchedulerConfig::load();
    let refresh_needed = Rc::new(Cell::new(false));
    let on_change = refresh_needed.clone();
    let callbacks = PollerCallbacks::new(print_upcoming, move || on_change.set(true));

    let mut manager = TaskManager::new(store.clone(), config.clone());
    manager.start(callbacks)?;

    let mut shown_day = Local::now().date_naive();
    show_agenda(runtime, &store, shown_day);
    let mut last_refresh = Instant::now();

    while !interrupted.load(Ordering::SeqCst) {
        manager.wait_and_dispatch(DISPATCH_TICK);
        let today = Local::now().date_naive();
        if refresh_needed.replace(false)
            || today != shown_day
            || last_refresh.elapsed() >= config.refresh_interval
        {
            shown_day = today;
            show_agenda(runtime, &store, shown_day);
            last_refresh = Instant::now();
        }
    }

    manager.stop();
    println!("Goodbye.");
    Ok(EXIT_OK)
}

fn show_agenda(runtime: &tokio::runtime::Runtime, store: &Store, date: NaiveDate) {
    match runtime.block_on(repo::appointments_on(store, date)) {
        Ok(rows) => print_agenda(date, &rows),
        Err(err) => err.log_with_event("agenda_refresh_failed"),
    }
}

fn print_upcoming(list: &[UpcomingAppointmentView]) {
    println!("Upcoming appointments:");
    for view in list {
        let confirmed = if view.confirmed { "confirmed" } else { "not confirmed" };
        println!(
            "  {}  {} ({})  {}  [{confirmed}]",
            view.time.format("%H:%M"),
            view.client,
            view.pet,
            view.phone.as_deref().unwrap_or("-"),
        );
    }
}

fn print_agenda(date: NaiveDate, rows: &[AppointmentRow]) {
    println!("Agenda for {date}");
    if rows.is_empty() {
        println!("  (no appointments)");
        return;
    }
    for row in rows {
        let confirmed = if row.confirmed { "yes" } else { "no" };
        println!(
            "  {:>5}  {:<5}  {:<28} {:<14} confirmed: {confirmed}",
            row.id,
            row.time.format("%H:%M"),
            row.client_display_name(),
            row.dog_name,
        );
    }
}

fn print_report_json(report: &DbHealthReport) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("serialize health report")?;
    println!("{json}");
    Ok(())
}

fn print_report_table(report: &DbHealthReport) {
    println!("Database health report");
    println!("Status       : {}", status_label(&report.status));
    println!("Tables       : {}", report.tables_scanned);
    println!("Rows         : {}", report.rows_scanned);
    println!("App version  : {}", report.app_version);
    println!("Generated at : {}", report.generated_at);

    println!("\nChecks:");
    println!(
        "{:<24} {:<7} {:>13}  Details",
        "Check", "Passed", "Duration (ms)"
    );
    for check in &report.checks {
        let passed = match (check.passed, check.advisory) {
            (true, _) => "yes",
            (false, true) => "warn",
            (false, false) => "no",
        };
        let details = check
            .details
            .as_deref()
            .map(|value| value.replace('\n', " "))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<7} {:>13}  {}",
            check.name, passed, check.duration_ms, details
        );
    }
}

fn status_label(status: &DbHealthStatus) -> &'static str {
    match status {
        DbHealthStatus::Ok => "ok",
        DbHealthStatus::Error => "error",
    }
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|err| format!("expected YYYY-MM-DD: {err}"))
}

fn parse_time(raw: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|err| format!("expected HH:MM or HH:MM:SS: {err}"))
}

fn parse_year_month(raw: &str) -> std::result::Result<YearMonth, String> {
    let (year, month) = raw
        .split_once('-')
        .ok_or_else(|| "expected YYYY-MM".to_string())?;
    let year: i32 = year.parse().map_err(|_| format!("bad year in {raw}"))?;
    let month: u32 = month.parse().map_err(|_| format!("bad month in {raw}"))?;
    YearMonth::new(year, month).ok_or_else(|| format!("month out of range in {raw}"))
}
