use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Connect and response limits for one delivery attempt. Both are bounded so
/// a stalled receiver cannot starve the control loop beyond this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One delivery attempt toward the upload receiver. Success means the receiver
/// acknowledged with a 2xx; connection failures, timeouts, and malformed
/// addresses all collapse into an error.
#[async_trait]
pub trait DumpSink {
    async fn deliver(
        &self,
        url: &str,
        device_name: &str,
        id: u32,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()>;
}

/// POSTs the raw dump as a tab-separated-values body. The receiver identifies
/// the dump from the headers and writes the body out verbatim.
pub struct HttpSink {
    client: reqwest::Client,
}

impl HttpSink {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build upload client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DumpSink for HttpSink {
    async fn deliver(
        &self,
        url: &str,
        device_name: &str,
        id: u32,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "text/tab-separated-values")
            .header("X-Device-Name", device_name)
            .header("X-Timestamp", timestamp)
            .header("X-Dump-Id", id.to_string())
            .body(payload.to_vec())
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        if !status.is_success() {
            bail!("receiver returned {status}");
        }
        Ok(())
    }
}
