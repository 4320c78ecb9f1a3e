use async_trait::async_trait;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::store::Namespace;

/// Boundary to the physical wireless link. The concrete radio (or the host
/// OS network stack) lives behind this trait; the state machine above it only
/// deals in commands and a link-up signal.
#[async_trait]
pub trait RadioControl {
    async fn start_station(&mut self, ssid: &str, password: &str) -> Result<()>;
    async fn stop_station(&mut self) -> Result<()>;
    async fn start_access_point(&mut self, ssid: &str) -> Result<()>;
    async fn stop_access_point(&mut self) -> Result<()>;
    fn link_up(&self) -> bool;
    fn address(&self) -> String;
    /// Advertises a discoverable service name once connected (mDNS-style).
    async fn announce(&mut self, hostname: &str) -> Result<()>;
    /// Polls the wall-clock synchronization once; true when the clock is
    /// trusted. Called repeatedly until it succeeds.
    async fn poll_time_sync(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Connecting,
    Connected,
    AccessPoint,
    Disconnected,
}

impl LinkMode {
    pub fn as_str(self) -> &'static str {
        match self {
            LinkMode::Connecting => "connecting",
            LinkMode::Connected => "connected",
            LinkMode::AccessPoint => "ap_mode",
            LinkMode::Disconnected => "disconnected",
        }
    }
}

/// Saved station credentials; an empty SSID means none.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

impl Credentials {
    fn is_set(&self) -> bool {
        !self.ssid.is_empty()
    }
}

/// Owns the wireless link lifecycle: station connection with per-attempt
/// deadlines, exponential-backoff reconnects, access-point fallback after
/// repeated failures (hybrid: the AP serves the local dashboard while station
/// retries continue), and wall-clock synchronization once connected.
pub struct ConnectivityManager<R> {
    radio: R,
    mode: LinkMode,
    creds: Namespace<Credentials>,
    ap_ssid: String,
    hostname: String,
    connect_timeout_ms: u64,
    max_connect_attempts: u32,
    reconnect_base_ms: u64,
    reconnect_cap_ms: u64,
    attempt_started_ms: u64,
    connect_attempts: u32,
    reconnect_interval_ms: u64,
    last_attempt_ms: u64,
    /// AP brought up as a fallback while station retries continue in the
    /// background. False for the no-credentials AP, which never exits on its
    /// own.
    hybrid_ap: bool,
    time_synced: bool,
}

impl<R: RadioControl> ConnectivityManager<R> {
    pub async fn new(config: &AppConfig, radio: R) -> Self {
        let creds: Namespace<Credentials> = Namespace::open(&config.state_directory, "wifi").await;
        Self {
            radio,
            mode: LinkMode::Disconnected,
            creds,
            ap_ssid: config.ap_ssid.clone(),
            hostname: config.hostname.clone(),
            connect_timeout_ms: config.connect_timeout_ms,
            max_connect_attempts: config.max_connect_attempts,
            reconnect_base_ms: config.reconnect_base_ms,
            reconnect_cap_ms: config.reconnect_cap_ms,
            attempt_started_ms: 0,
            connect_attempts: 0,
            reconnect_interval_ms: config.reconnect_base_ms,
            last_attempt_ms: 0,
            hybrid_ap: false,
            time_synced: false,
        }
    }

    /// Starts station connection when credentials are saved, else the
    /// configuration access point.
    pub async fn begin(&mut self, now_ms: u64) {
        if self.creds.get().is_set() {
            let ssid = self.creds.get().ssid.clone();
            tracing::info!(ssid = %ssid, "saved network found, connecting");
            self.start_station(now_ms).await;
        } else {
            tracing::info!("no saved credentials, starting access point");
            self.start_access_point(false).await;
        }
    }

    /// Advances the state machine one step. Called once per control-loop tick;
    /// never blocks beyond the radio's own bounded calls.
    pub async fn update(&mut self, now_ms: u64) {
        match self.mode {
            LinkMode::Connecting => {
                if self.radio.link_up() {
                    self.on_connected().await;
                } else if now_ms.saturating_sub(self.attempt_started_ms) > self.connect_timeout_ms {
                    self.connect_attempts += 1;
                    if self.connect_attempts >= self.max_connect_attempts {
                        tracing::warn!(
                            attempts = self.connect_attempts,
                            "station connection failing, bringing up access point alongside retries"
                        );
                        self.start_access_point(true).await;
                        self.last_attempt_ms = now_ms;
                    } else {
                        tracing::info!(
                            attempt = self.connect_attempts + 1,
                            of = self.max_connect_attempts,
                            "station attempt timed out, retrying"
                        );
                        self.start_station(now_ms).await;
                    }
                }
            }
            LinkMode::Connected => {
                if !self.radio.link_up() {
                    tracing::warn!("link lost");
                    self.mode = LinkMode::Disconnected;
                    self.last_attempt_ms = now_ms;
                    return;
                }
                if !self.time_synced && self.radio.poll_time_sync().await {
                    self.time_synced = true;
                    tracing::info!(timestamp = %self.timestamp(now_ms), "wall clock synchronized");
                }
            }
            LinkMode::AccessPoint => {
                // The fallback AP keeps retrying the saved network in the
                // background; the bare configuration AP waits for credentials.
                if !self.hybrid_ap || !self.creds.get().is_set() {
                    return;
                }
                if self.radio.link_up() {
                    self.on_connected().await;
                } else if now_ms.saturating_sub(self.last_attempt_ms) >= self.reconnect_interval_ms
                {
                    let creds = self.creds.get().clone();
                    tracing::info!(ssid = %creds.ssid, "background station retry");
                    if let Err(err) = self.radio.start_station(&creds.ssid, &creds.password).await {
                        tracing::warn!(error = %err, "station start failed");
                    }
                    self.last_attempt_ms = now_ms;
                    self.reconnect_interval_ms = self
                        .reconnect_interval_ms
                        .saturating_mul(2)
                        .min(self.reconnect_cap_ms);
                }
            }
            LinkMode::Disconnected => {
                if !self.creds.get().is_set() {
                    return;
                }
                if now_ms.saturating_sub(self.last_attempt_ms) >= self.reconnect_interval_ms {
                    tracing::info!(
                        interval_ms = self.reconnect_interval_ms,
                        "attempting reconnect"
                    );
                    self.start_station(now_ms).await;
                    self.last_attempt_ms = now_ms;
                    self.reconnect_interval_ms = self
                        .reconnect_interval_ms
                        .saturating_mul(2)
                        .min(self.reconnect_cap_ms);
                }
            }
        }
    }

    /// Persists new credentials and starts a fresh station attempt, tearing
    /// down any access point first.
    pub async fn set_credentials(&mut self, ssid: String, password: String, now_ms: u64) {
        tracing::info!(ssid = %ssid, "credentials saved");
        self.creds.save(Credentials { ssid, password }).await;
        self.connect_attempts = 0;
        self.reconnect_interval_ms = self.reconnect_base_ms;
        if self.mode == LinkMode::AccessPoint || self.hybrid_ap {
            if let Err(err) = self.radio.stop_access_point().await {
                tracing::warn!(error = %err, "access point stop failed");
            }
            self.hybrid_ap = false;
        }
        self.start_station(now_ms).await;
    }

    /// Forgets the saved network and drops to the configuration access point;
    /// only new credentials leave that state.
    pub async fn clear_credentials(&mut self) {
        tracing::info!("credentials cleared");
        self.creds.save(Credentials::default()).await;
        // Hybrid AP included: a background station attempt may be in flight
        // toward the network being forgotten.
        if let Err(err) = self.radio.stop_station().await {
            tracing::warn!(error = %err, "station stop failed");
        }
        if self.mode != LinkMode::AccessPoint {
            self.start_access_point(false).await;
        } else {
            self.hybrid_ap = false;
        }
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn is_connected(&self) -> bool {
        self.mode == LinkMode::Connected
    }

    pub fn is_time_synced(&self) -> bool {
        self.time_synced
    }

    pub fn address(&self) -> String {
        self.radio.address()
    }

    /// Network name an operator can reach the device on: the AP SSID whenever
    /// the access point is up (hybrid included), else the saved station SSID.
    pub fn ssid(&self) -> String {
        if self.mode == LinkMode::AccessPoint {
            self.ap_ssid.clone()
        } else {
            self.creds.get().ssid.clone()
        }
    }

    /// Wall-clock timestamp once synchronized, otherwise a relative marker so
    /// dumps captured before sync still carry usable ordering information.
    pub fn timestamp(&self, now_ms: u64) -> String {
        if self.time_synced {
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string()
        } else {
            format!("boot+{}s", now_ms / 1000)
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    async fn start_station(&mut self, now_ms: u64) {
        let creds = self.creds.get().clone();
        tracing::info!(ssid = %creds.ssid, "connecting");
        if let Err(err) = self.radio.start_station(&creds.ssid, &creds.password).await {
            tracing::warn!(error = %err, "station start failed");
        }
        self.mode = LinkMode::Connecting;
        self.attempt_started_ms = now_ms;
    }

    async fn start_access_point(&mut self, hybrid: bool) {
        if let Err(err) = self.radio.start_access_point(&self.ap_ssid).await {
            tracing::error!(error = %err, "access point start failed");
        }
        self.mode = LinkMode::AccessPoint;
        self.hybrid_ap = hybrid;
        tracing::info!(ssid = %self.ap_ssid, hybrid, "access point up");
    }

    async fn on_connected(&mut self) {
        self.mode = LinkMode::Connected;
        self.connect_attempts = 0;
        self.reconnect_interval_ms = self.reconnect_base_ms;
        if self.hybrid_ap {
            if let Err(err) = self.radio.stop_access_point().await {
                tracing::warn!(error = %err, "access point stop failed");
            }
            self.hybrid_ap = false;
        }
        tracing::info!(address = %self.radio.address(), "connected");
        if let Err(err) = self.radio.announce(&self.hostname).await {
            tracing::warn!(error = %err, "service announce failed");
        }
    }
}

/// Radio backend for hosts whose operating system owns the physical link.
/// Station "connection" reports up immediately, access-point mode is
/// announce-only, and the host clock is treated as already disciplined.
pub struct OsManagedLink {
    station_up: bool,
}

impl OsManagedLink {
    pub fn new() -> Self {
        Self { station_up: false }
    }
}

impl Default for OsManagedLink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RadioControl for OsManagedLink {
    async fn start_station(&mut self, ssid: &str, _password: &str) -> Result<()> {
        tracing::debug!(ssid = %ssid, "host OS manages the physical link");
        self.station_up = true;
        Ok(())
    }

    async fn stop_station(&mut self) -> Result<()> {
        self.station_up = false;
        Ok(())
    }

    async fn start_access_point(&mut self, ssid: &str) -> Result<()> {
        tracing::info!(ssid = %ssid, "access-point mode requested; configure the host hotspot manually");
        Ok(())
    }

    async fn stop_access_point(&mut self) -> Result<()> {
        Ok(())
    }

    fn link_up(&self) -> bool {
        self.station_up
    }

    fn address(&self) -> String {
        // Routing-table trick: no packet is sent, the kernel just picks the
        // outbound interface address.
        std::net::UdpSocket::bind("0.0.0.0:0")
            .and_then(|sock| {
                sock.connect("8.8.8.8:53")?;
                sock.local_addr()
            })
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|_| "0.0.0.0".to_string())
    }

    async fn announce(&mut self, hostname: &str) -> Result<()> {
        tracing::info!(hostname = %hostname, "service name announced");
        Ok(())
    }

    async fn poll_time_sync(&mut self) -> bool {
        true
    }
}
