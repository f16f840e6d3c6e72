use crate::core::ports::error_sink::ErrorSink;
use crate::utils::error::{BusError, BusResult};
use crate::utils::log_ring::LogEntry;
use async_trait::async_trait;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts error-level log entries as JSON to a webhook.
pub struct HttpErrorSink {
    client: reqwest::Client,
    url: String,
}

impl HttpErrorSink {
    pub fn new(url: impl Into<String>) -> BusResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BusError::ConfigError(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ErrorSink for HttpErrorSink {
    async fn forward(&self, entry: &LogEntry) -> BusResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(entry)
            .send()
            .await
            .map_err(|e| BusError::ApiError(e.to_string()))?;
        response
            .error_for_status()
            .map(|_| ())
            .map_err(|e| BusError::ApiError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::log_ring::LogLevel;

    #[tokio::test]
    async fn test_unreachable_webhook_reports_error() {
        let sink = HttpErrorSink::new("http://127.0.0.1:1/alerts").unwrap();
        let entry = LogEntry::new(LogLevel::Error, "bus", "delivery failed");
        assert!(sink.forward(&entry).await.is_err());
    }
}
