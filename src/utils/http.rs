//! Blocking HTTP helpers for probes and webhooks.

use reqwest::blocking::Client;
use std::time::Duration;

use crate::error::{Error, Result};

const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(format!("hubctl/{}", VERSION))
        .timeout(Duration::from_secs(timeout_secs.max(1)))
        .build()
        .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))
}

/// GET `url` and return the status code; transport failures are errors.
pub fn get_status(client: &Client, url: &str) -> std::result::Result<u16, String> {
    client
        .get(url)
        .send()
        .map(|response| response.status().as_u16())
        .map_err(|e| e.to_string())
}

pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// Join a base URL and a path with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}
