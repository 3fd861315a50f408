// catalogtool/src/utils/sequence_reset.rs
use anyhow::{Context, Result};
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Moves every serial/identity sequence owned by `table` past the table's current
/// maximum, so inserts after a restore do not collide with restored ids.
pub async fn reset_table_sequences(db_pool: &Pool<Postgres>, table: &str) -> Result<u32> {
    // Columns of the table that own a sequence
    let sequences_query = r#"
        SELECT
            attr.attname::text AS column_name,
            pg_get_serial_sequence(quote_ident($1), attr.attname)::text AS sequence_name
        FROM
            pg_attribute attr
        JOIN
            pg_class tab ON attr.attrelid = tab.oid
        JOIN
            pg_namespace nsp ON tab.relnamespace = nsp.oid
        WHERE
            tab.relname = $1
            AND nsp.nspname = 'public'
            AND attr.attnum > 0
            AND NOT attr.attisdropped
            AND pg_get_serial_sequence(quote_ident($1), attr.attname) IS NOT NULL
    "#;

    let sequences = sqlx::query(sequences_query)
        .bind(table)
        .fetch_all(db_pool)
        .await
        .with_context(|| format!("Failed to fetch sequence information for {}", table))?;

    if sequences.is_empty() {
        debug!(table, "No sequences owned by table");
        return Ok(0);
    }

    let mut reset_count = 0;
    for row in sequences {
        let column_name: String = row.try_get("column_name")?;
        let sequence_name: String = row.try_get("sequence_name")?;

        let max_value_query = format!(
            "SELECT COALESCE(MAX(\"{}\"), 0)::BIGINT AS max_val FROM \"{}\"",
            column_name.replace('"', "\"\""),
            table.replace('"', "\"\"")
        );
        let max_val: i64 = match sqlx::query(&max_value_query).fetch_one(db_pool).await {
            Ok(row) => row.try_get("max_val")?,
            Err(e) => {
                warn!(table, column = %column_name, error = %e, "Failed to get max value");
                continue;
            }
        };

        let next_val = max_val + 1;
        match sqlx::query("SELECT setval($1::regclass, $2, false)")
            .bind(&sequence_name)
            .bind(next_val)
            .execute(db_pool)
            .await
        {
            Ok(_) => {
                debug!("✓ Reset sequence {} to {} (table: {}, column: {})", sequence_name, next_val, table, column_name);
                reset_count += 1;
            }
            Err(e) => {
                warn!(sequence = %sequence_name, error = %e, "Failed to reset sequence");
            }
        }
    }

    info!(table, reset_count, "Sequence reset completed");
    Ok(reset_count)
}

/// Runs [`reset_table_sequences`] under a five minute timeout.
pub async fn reset_sequences_with_timeout(db_pool: &Pool<Postgres>, table: &str) -> Result<u32> {
    let timeout_duration = Duration::from_secs(300);

    match timeout(timeout_duration, reset_table_sequences(db_pool, table)).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "Sequence reset operation timed out after {} seconds for table: {}",
            timeout_duration.as_secs(),
            table
        )),
    }
}
