use anyhow::Result;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::error::Error;

/// Embedded migration scripts, keyed by file name
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "001_create_violation_records.sql",
        include_str!("sql/001_create_violation_records.sql"),
    ),
    (
        "002_add_violation_indexes.sql",
        include_str!("sql/002_add_violation_indexes.sql"),
    ),
];

/// Numeric prefix of a migration file name; unnumbered files run last
fn get_order_value(name: &str) -> usize {
    name.split('_')
        .next()
        .and_then(|prefix| prefix.parse::<usize>().ok())
        .unwrap_or(usize::MAX)
}

fn ordered_migrations() -> Vec<(&'static str, &'static str)> {
    let mut entries = MIGRATIONS.to_vec();
    entries.sort_by_key(|(name, _)| get_order_value(name));
    entries
}

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for (name, sql) in ordered_migrations() {
        pool.execute(sql)
            .await
            .map_err(|e| Error::Database(format!("Migration {} failed: {}", name, e)))?;
        info!("Applied migration: {}", name);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_run_in_numeric_order() {
        let names: Vec<&str> = ordered_migrations().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            vec!["001_create_violation_records.sql", "002_add_violation_indexes.sql"]
        );
        assert_eq!(get_order_value("add_foreign_keys.sql"), usize::MAX);
    }
}
