//! Schema bootstrap.
//!
//! Each backend carries two ordered script series: one for the registry and
//! one applied to every namespace. Scripts are embedded in the binary, carry
//! their version in the `NNN_` filename prefix, and are recorded in a
//! `schema_migrations` tracking table so re-running is a no-op. A script at
//! version `v` is applied iff `v` is greater than every version already
//! recorded.
//!
//! Namespace scripts for Postgres contain a `{{schema}}` placeholder that is
//! substituted with the namespace's schema name before execution. Each
//! script runs inside a transaction together with its tracking row, so a
//! failed script leaves the tracking table consistent with what actually
//! committed.

use sqlx::{Executor, PgPool, SqlitePool};
use tracing::debug;

use crate::{Error, Result};

/// One versioned DDL script.
#[derive(Clone, Copy, Debug)]
pub struct Migration {
    /// Original filename, e.g. `001_messages.sql`.
    pub name: &'static str,
    /// Script body.
    pub sql: &'static str,
}

impl Migration {
    /// Version parsed from the filename prefix.
    pub fn version(&self) -> Result<i64> {
        let digits = self.name.split('_').next().unwrap_or("");
        digits.parse().map_err(|_| Error::Decode {
            expected: "migration version prefix",
        })
    }
}

/// Registry scripts for the SQLite backend.
pub const SQLITE_REGISTRY: &[Migration] = &[Migration {
    name: "001_namespaces.sql",
    sql: include_str!("../../migrations/sqlite/registry/001_namespaces.sql"),
}];

/// Per-namespace scripts for the SQLite backend.
pub const SQLITE_NAMESPACE: &[Migration] = &[Migration {
    name: "001_messages.sql",
    sql: include_str!("../../migrations/sqlite/namespace/001_messages.sql"),
}];

/// Registry scripts for the Postgres backend.
pub const POSTGRES_REGISTRY: &[Migration] = &[Migration {
    name: "001_namespaces.sql",
    sql: include_str!("../../migrations/postgres/registry/001_namespaces.sql"),
}];

/// Per-namespace scripts for the Postgres backend.
pub const POSTGRES_NAMESPACE: &[Migration] = &[Migration {
    name: "001_messages.sql",
    sql: include_str!("../../migrations/postgres/namespace/001_messages.sql"),
}];

/// Applies pending scripts to a SQLite database.
pub async fn run_sqlite(pool: &SqlitePool, scripts: &[Migration]) -> Result<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TEXT NOT NULL
         )",
    )
    .await?;

    let applied: Option<i64> = sqlx::query_scalar("SELECT max(version) FROM schema_migrations")
        .fetch_one(pool)
        .await?;
    let applied = applied.unwrap_or(0);

    for script in scripts {
        let version = script.version()?;
        if version <= applied {
            continue;
        }

        let mut tx = pool.begin().await?;
        tx.execute(script.sql).await?;
        sqlx::query("INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)")
            .bind(version)
            .bind(script.name)
            .bind(crate::message::format_time(&chrono::Utc::now()))
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        debug!(name = script.name, version, "applied migration");
    }

    Ok(())
}

/// Applies pending scripts to a Postgres schema, substituting `{{schema}}`.
///
/// The tracking table lives inside the target schema, so every namespace
/// schema migrates independently of the registry and of its siblings.
pub async fn run_postgres(pool: &PgPool, schema: &str, scripts: &[Migration]) -> Result<()> {
    pool.execute(format!("CREATE SCHEMA IF NOT EXISTS {schema}").as_str())
        .await?;
    pool.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.schema_migrations (
                version    BIGINT PRIMARY KEY,
                name       TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL
             )"
        )
        .as_str(),
    )
    .await?;

    let applied: Option<i64> =
        sqlx::query_scalar(&format!("SELECT max(version) FROM {schema}.schema_migrations"))
            .fetch_one(pool)
            .await?;
    let applied = applied.unwrap_or(0);

    for script in scripts {
        let version = script.version()?;
        if version <= applied {
            continue;
        }

        let sql = script.sql.replace("{{schema}}", schema);
        let mut tx = pool.begin().await?;
        tx.execute(sql.as_str()).await?;
        sqlx::query(&format!(
            "INSERT INTO {schema}.schema_migrations (version, name, applied_at) VALUES ($1, $2, now())"
        ))
        .bind(version)
        .bind(script.name)
        .execute(&mut tx)
        .await?;
        tx.commit().await?;
        debug!(name = script.name, version, schema, "applied migration");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn versions_parse_from_filename_prefixes() {
        let m = Migration {
            name: "007_add_index.sql",
            sql: "",
        };
        assert_eq!(m.version().unwrap(), 7);

        let bad = Migration {
            name: "no_prefix.sql",
            sql: "",
        };
        assert!(bad.version().is_err());
    }

    #[test]
    fn embedded_series_are_strictly_increasing() {
        for series in [
            SQLITE_REGISTRY,
            SQLITE_NAMESPACE,
            POSTGRES_REGISTRY,
            POSTGRES_NAMESPACE,
        ] {
            let versions: Vec<i64> = series.iter().map(|m| m.version().unwrap()).collect();
            let mut sorted = versions.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(versions, sorted);
        }
    }
}
