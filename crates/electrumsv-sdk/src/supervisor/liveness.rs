//! HTTP liveness polling

use std::time::Duration;

use reqwest::Url;
use tracing::debug;

use crate::error::NetworkError;

/// Retry policy for [`is_running_http`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub retries: u32,
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            retries: 6,
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(500),
        }
    }
}

impl LivenessConfig {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound on how long a check can take
    pub fn budget(&self) -> Duration {
        (self.interval + self.timeout) * self.retries
    }
}

/// Split credentials out of `endpoint` so they travel as basic auth
fn parse_endpoint(endpoint: &str) -> Result<(Url, Option<(String, String)>), NetworkError> {
    let mut url =
        Url::parse(endpoint).map_err(|_| NetworkError::InvalidEndpoint(endpoint.to_string()))?;
    let credentials = if url.username().is_empty() {
        None
    } else {
        Some((
            url.username().to_string(),
            url.password().unwrap_or_default().to_string(),
        ))
    };
    // Url setters only fail for cannot-be-a-base urls, which cannot carry credentials
    let _ = url.set_username("");
    let _ = url.set_password(None);
    Ok((url, credentials))
}

async fn probe(client: &reqwest::Client, url: &Url, credentials: Option<&(String, String)>) -> Result<(), NetworkError> {
    let mut request = client.get(url.clone());
    if let Some((user, password)) = credentials {
        request = request.basic_auth(user, Some(password));
    }
    request.send().await?.error_for_status()?;
    Ok(())
}

/// Poll `endpoint` until it answers with a success status or retries run out
pub async fn is_running_http(endpoint: &str, config: &LivenessConfig) -> bool {
    let (url, credentials) = match parse_endpoint(endpoint) {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!("{}", e);
            return false;
        }
    };
    let client = match reqwest::Client::builder().timeout(config.timeout).build() {
        Ok(client) => client,
        Err(e) => {
            debug!("Cannot build HTTP client: {}", e);
            return false;
        }
    };

    for attempt in 1..=config.retries {
        match probe(&client, &url, credentials.as_ref()).await {
            Ok(()) => return true,
            Err(e) => debug!(attempt, url = %url, "Liveness probe failed: {}", e),
        }
        if attempt < config.retries {
            tokio::time::sleep(config.interval).await;
        }
    }
    false
}
