use regex::Regex;
use sha2::{Digest, Sha256};
use sqlx::{Connection, Row, SqliteConnection};
use std::collections::HashMap;

use tracing::{error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    if trimmed.len() > 160 {
        let mut end = 160;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &trimmed[..end])
    } else {
        trimmed.to_string()
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202501150900_initial.sql",
        include_str!("../migrations/202501150900_initial.sql"),
    ),
    (
        "202502031200_appointments_repeat_monthly.sql",
        include_str!("../migrations/202502031200_appointments_repeat_monthly.sql"),
    ),
];

const INITIAL_BREEDS: &[&str] = &[
    "Labrador",
    "Golden Retriever",
    "Pastor Alemán",
    "Bulldog",
    "Poodle",
    "Beagle",
    "Chihuahua",
    "Boxer",
    "Salchicha (Dachshund)",
    "Husky Siberiano",
    "Yorkshire Terrier",
    "Rottweiler",
    "Doberman",
    "Gran Danés",
    "Schnauzer",
    "Shih Tzu",
    "Pomerania",
    "Cocker Spaniel",
    "Bulldog Francés",
    "Caniche",
    "Mastín",
    "Galgo",
    "Collie",
    "Basset Hound",
    "Pug",
    "Chow Chow",
    "Bichón Frisé",
    "Akita Inu",
    "Setter Irlandés",
    "Dálmata",
    "Terranova",
    "Shar Pei",
    "Weimaraner",
    "Bullmastiff",
    "Pointer",
    "Samoyedo",
    "Alaskan Malamute",
    "Bloodhound",
    "Cane Corso",
    "Bernés de la Montaña",
    "Cavalier King Charles Spaniel",
    "Corgi",
    "Whippet",
    "Bull Terrier",
    "Papillón",
    "Pinscher Miniatura",
    "Vizsla",
    "Airedale Terrier",
];

fn clean_sql(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Bring the schema up to date and seed reference data. Idempotent.
pub async fn apply_migrations(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .execute(&mut *conn)
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(&mut *conn)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        if let (Ok(v), Ok(c)) = (
            r.try_get::<String, _>("version"),
            r.try_get::<String, _>("checksum"),
        ) {
            applied.insert(v, c);
        }
    }
    let add_col_re = Regex::new(r"(?i)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+COLUMN\s+(\w+)")?;

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = clean_sql(raw_sql);
        let digest = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &digest {
                anyhow::bail!("migration {} edited after application", filename);
            }
            info!(target: "groombook", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = conn.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            if let Some(caps) = add_col_re.captures(s) {
                let (Some(table), Some(col)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                let exists: Option<i64> = sqlx::query_scalar(&format!(
                    "SELECT 1 FROM pragma_table_info('{}') WHERE name='{}'",
                    table.as_str(),
                    col.as_str()
                ))
                .fetch_optional(&mut *tx)
                .await?;
                if exists.is_some() {
                    info!(target: "groombook", event = "migration_stmt_skip", file = %filename, sql = %preview(s));
                    continue;
                }
            }
            info!(target: "groombook", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "groombook", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(e.into());
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(chrono::Utc::now().timestamp_millis())
        .bind(&digest)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "groombook", event = "migration_file_applied", file = %filename);
    }

    seed_breeds(conn).await?;

    Ok(())
}

async fn seed_breeds(conn: &mut SqliteConnection) -> anyhow::Result<()> {
    let mut tx = conn.begin().await?;
    let mut inserted = 0_u64;
    for name in INITIAL_BREEDS {
        let result = sqlx::query("INSERT OR IGNORE INTO breeds (name) VALUES (?1)")
            .bind(*name)
            .execute(&mut *tx)
            .await?;
        inserted += result.rows_affected();
    }
    tx.commit().await?;
    if inserted > 0 {
        info!(target: "groombook", event = "breeds_seeded", inserted);
    }
    Ok(())
}
