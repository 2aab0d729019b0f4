use reqwest::Client;
use std::time::Duration;

/// Shared client for remote stage calls and PostgREST. Request timeouts are
/// set per call; only the connect timeout lives on the client.
pub fn build_client() -> Client {
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .connect_timeout(Duration::from_secs(connect))
        .user_agent(concat!("relist-pipeline/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new())
}
