//! Database pool and migrations

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create the Postgres pool used for regular queries
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await
}

/// Apply the embedded migrations in `crates/shared/migrations`
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    const INITIAL: &str = include_str!("../migrations/20250301000000_initial.sql");
    const AUDIT_TRIGGER: &str =
        include_str!("../migrations/20250301000200_audit_logs_strict_immutability.sql");

    /// Column names of `audit_logs` as declared in the initial migration
    fn audit_log_columns() -> Vec<String> {
        let start = INITIAL
            .find("CREATE TABLE audit_logs (")
            .expect("audit_logs table");
        let body = &INITIAL[start..];
        let end = body.find(");").expect("end of audit_logs table");
        body[..end]
            .lines()
            .skip(1)
            .filter_map(|line| line.split_whitespace().next())
            .map(|name| name.trim_end_matches(',').to_string())
            .collect()
    }

    #[test]
    fn test_audit_trigger_pins_every_other_column() {
        let columns = audit_log_columns();
        assert!(columns.len() >= 10, "parsed columns: {columns:?}");

        for column in columns.iter().filter(|c| c.as_str() != "organization_id") {
            assert!(
                AUDIT_TRIGGER.contains(&format!("NEW.{column}"))
                    && AUDIT_TRIGGER.contains(&format!("OLD.{column}")),
                "trigger lets audit_logs.{column} change"
            );
        }
    }

    #[test]
    fn test_audit_trigger_compares_null_safely() {
        assert!(AUDIT_TRIGGER.contains("IS NOT DISTINCT FROM"));
        assert!(AUDIT_TRIGGER.contains("CREATE OR REPLACE FUNCTION audit_logs_immutable()"));
    }
}
