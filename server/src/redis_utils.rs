use std::time::Duration;

use anyhow::{Context, Result};
use redis::Client;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};

/// Creates a ConnectionManager with standardized configuration for the
/// application: bounded reconnect attempts with exponential backoff capped at
/// five seconds, and request/connect timeouts so store operations respect
/// their deadlines.
pub async fn create_connection_manager(client: Client) -> Result<ConnectionManager> {
    let config = ConnectionManagerConfig::new()
        .set_connection_timeout(Duration::from_secs(10))
        .set_response_timeout(Duration::from_secs(10))
        .set_number_of_retries(5)
        .set_exponent_base(2)
        .set_factor(100)
        .set_max_delay(5_000);

    ConnectionManager::new_with_config(client, config)
        .await
        .context("Failed to create Redis connection manager with config")
}
