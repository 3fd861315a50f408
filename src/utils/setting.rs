// Connection checks
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

/// Strips the password from a connection URL so it can be logged.
pub fn redact_url(db_url: &str) -> String {
    match Url::parse(db_url) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => "<unparseable database url>".to_string(),
    }
}

pub async fn check_db_connection(db_url: &str) -> bool {
    let result = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(db_url)
        .await;
    match result {
        Ok(pool) => {
            pool.close().await;
            info!("✅ Successfully connected to {}", redact_url(db_url));
            true
        }
        Err(e) => {
            error!("❌ Failed to connect to {}: {}", redact_url(db_url), e);
            false
        }
    }
}
