use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::mpsc,
};
use weighbridge::upload::DumpSink;
use weighbridge::AppConfig;

/// Builds a configuration rooted in a temp directory so tests never touch the
/// deployment paths.
pub fn test_config(root: &Path) -> AppConfig {
    AppConfig {
        device_name: "test-gateway".to_string(),
        log_level: "info".to_string(),
        serial_port: None,
        baud_rate: 9600,
        silence_timeout_ms: 2000,
        max_dump_bytes: 50_000,
        preview_lines: 3,
        state_directory: root.join("state").to_string_lossy().to_string(),
        queue_directory: root.join("queue").to_string_lossy().to_string(),
        max_queued_dumps: 10,
        retry_base_ms: 30_000,
        retry_cap_ms: 300_000,
        ap_ssid: "weighbridge-setup".to_string(),
        hostname: "weighbridge".to_string(),
        connect_timeout_ms: 15_000,
        max_connect_attempts: 3,
        reconnect_base_ms: 5_000,
        reconnect_cap_ms: 60_000,
        tick_ms: 50,
    }
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub url: String,
    pub device_name: String,
    pub id: u32,
    pub timestamp: String,
    pub payload: Vec<u8>,
}

/// Sink with scripted per-attempt outcomes. Once the script runs out, every
/// further attempt gets `default_outcome`. Records all deliveries in order.
pub struct ScriptedSink {
    script: Mutex<VecDeque<bool>>,
    default_outcome: bool,
    pub deliveries: Mutex<Vec<Delivery>>,
}

impl ScriptedSink {
    pub fn new(script: Vec<bool>, default_outcome: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            default_outcome,
            deliveries: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(Vec::new(), true)
    }

    pub fn failing() -> Self {
        Self::new(Vec::new(), false)
    }

    pub fn delivered_ids(&self) -> Vec<u32> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.id)
            .collect()
    }

    pub fn attempts(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl DumpSink for ScriptedSink {
    async fn deliver(
        &self,
        url: &str,
        device_name: &str,
        id: u32,
        timestamp: &str,
        payload: &[u8],
    ) -> Result<()> {
        self.deliveries.lock().unwrap().push(Delivery {
            url: url.to_string(),
            device_name: device_name.to_string(),
            id,
            timestamp: timestamp.to_string(),
            payload: payload.to_vec(),
        });
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_outcome);
        if outcome {
            Ok(())
        } else {
            bail!("scripted failure");
        }
    }
}

#[derive(Debug)]
pub struct StubRequest {
    pub headers: String,
    pub body: Vec<u8>,
}

impl StubRequest {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.headers
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with(&prefix))
            .map(|line| line[prefix.len()..].trim().to_string())
    }
}

/// Minimal HTTP receiver standing in for the upload sink: accepts POSTs,
/// replies 200, and forwards each request to the test for inspection.
pub async fn spawn_stub_receiver() -> (SocketAddr, mpsc::UnboundedReceiver<StubRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub receiver");
    let addr = listener.local_addr().expect("stub addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let header_end = loop {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            buf.extend_from_slice(&chunk[..n]);
                            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                                break pos + 4;
                            }
                        }
                    }
                };

                let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        line.to_ascii_lowercase()
                            .strip_prefix("content-length:")
                            .map(str::to_string)
                    })
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);

                while buf.len() < header_end + content_length {
                    match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }

                let body = buf[header_end..header_end + content_length].to_vec();
                let _ = tx.send(StubRequest { headers, body });
                let _ = sock
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
                let _ = sock.shutdown().await;
            });
        }
    });

    (addr, rx)
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
