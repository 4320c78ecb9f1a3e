use anyhow::Result;
use std::sync::Arc;
use std::time::Instant;
use tokio::{
    signal,
    sync::{mpsc, watch},
    time::{interval, sleep, Duration},
};

use crate::capture::SerialCapture;
use crate::config::AppConfig;
use crate::connectivity::{ConnectivityManager, OsManagedLink};
use crate::queue::UploadQueue;
use crate::serial::ByteSource;
use crate::simulator;
use crate::status::StatusSnapshot;
use crate::upload::HttpSink;

/// Commands accepted from the control surface (dashboard, CLI).
#[derive(Debug)]
pub enum Command {
    SetReceiverUrl(String),
    SetCredentials { ssid: String, password: String },
    ClearCredentials,
    InjectTestDump,
}

/// External face of a running service: a command inlet and the live status
/// snapshot.
#[derive(Clone)]
pub struct ServiceHandle {
    pub commands: mpsc::Sender<Command>,
    pub status: watch::Receiver<StatusSnapshot>,
}

pub struct Service {
    config: AppConfig,
    commands_tx: mpsc::Sender<Command>,
    commands_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<StatusSnapshot>,
    status_rx: watch::Receiver<StatusSnapshot>,
}

impl Service {
    pub fn new(config: AppConfig) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(16);
        let (status_tx, status_rx) = watch::channel(StatusSnapshot::default());
        Self {
            config,
            commands_tx,
            commands_rx,
            status_tx,
            status_rx,
        }
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            commands: self.commands_tx.clone(),
            status: self.status_rx.clone(),
        }
    }

    /// Runs the cooperative control loop until ctrl-c. One iteration drains
    /// available serial bytes into the capture machine, advances the
    /// connectivity state machine, forwards completed dumps into the queue,
    /// and advances the queue's retry logic. All persisted state is touched
    /// only from this task.
    pub async fn run(self) -> Result<()> {
        let Service {
            config,
            commands_tx,
            mut commands_rx,
            status_tx,
            status_rx,
        } = self;

        let device_name = Arc::new(config.device_name.clone());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(());

        let heartbeat_handle = tokio::spawn(heartbeat(
            device_name.clone(),
            status_rx.clone(),
            shutdown_rx.clone(),
        ));

        let worker_future = {
            let device_name = device_name.clone();
            async move {
                // The sender is parked here so command recv never reports a
                // closed channel while the loop runs.
                let _command_keepalive = commands_tx;

                let sink = HttpSink::new()?;
                let mut queue = UploadQueue::open(&config, sink).await;
                let mut connectivity =
                    ConnectivityManager::new(&config, OsManagedLink::new()).await;
                let mut capture =
                    SerialCapture::new(config.silence_timeout_ms, config.max_dump_bytes);

                let mut source = match &config.serial_port {
                    Some(port) => match ByteSource::connect(port, config.baud_rate).await {
                        Ok(source) => {
                            tracing::info!(
                                service = %device_name,
                                port = %port,
                                baud = config.baud_rate,
                                "serial capture starting"
                            );
                            Some(source)
                        }
                        Err(err) => {
                            tracing::error!(
                                service = %device_name,
                                port = %port,
                                error = %err,
                                "serial source unavailable, running without capture"
                            );
                            None
                        }
                    },
                    None => {
                        tracing::info!(service = %device_name, "no serial port configured");
                        None
                    }
                };

                let start = Instant::now();
                let now_ms = move || start.elapsed().as_millis() as u64;

                connectivity.begin(now_ms()).await;

                let mut ticker = interval(Duration::from_millis(config.tick_ms));
                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            tracing::info!(service = %device_name, "shutdown requested");
                            break;
                        }
                        cmd = commands_rx.recv() => {
                            let now = now_ms();
                            match cmd {
                                Some(Command::SetReceiverUrl(url)) => {
                                    queue.set_receiver_url(url).await;
                                }
                                Some(Command::SetCredentials { ssid, password }) => {
                                    connectivity.set_credentials(ssid, password, now).await;
                                }
                                Some(Command::ClearCredentials) => {
                                    connectivity.clear_credentials().await;
                                }
                                Some(Command::InjectTestDump) => {
                                    tracing::info!(service = %device_name, "simulating dump");
                                    let ts = connectivity.timestamp(now);
                                    queue.submit(simulator::TEST_DUMP, &ts).await;
                                }
                                None => {}
                            }
                        }
                        chunk = next_chunk(&mut source) => {
                            match chunk {
                                Ok(Some(bytes)) => {
                                    capture.feed_slice(&bytes, now_ms());
                                }
                                Ok(None) => {
                                    tracing::warn!(service = %device_name, "serial source closed");
                                    source = None;
                                }
                                Err(err) => {
                                    tracing::warn!(
                                        service = %device_name,
                                        error = %err,
                                        "serial read failed"
                                    );
                                    sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                        _ = ticker.tick() => {
                            let now = now_ms();
                            connectivity.update(now).await;
                            if let Some(dump) = capture.poll(now) {
                                let ts = connectivity.timestamp(now);
                                queue.submit(&dump, &ts).await;
                            }
                            queue.poll(now, connectivity.is_connected()).await;
                            status_tx.send_replace(build_snapshot(
                                now,
                                &capture,
                                &queue,
                                &connectivity,
                            ));
                        }
                    }
                }
                Ok(())
            }
        };

        let shutdown_signal = {
            let device_name = device_name.clone();
            let shutdown_tx = shutdown_tx.clone();
            async move {
                signal::ctrl_c().await.ok();
                tracing::info!(service = %device_name, "ctrl-c received, requesting shutdown");
                shutdown_tx.send(()).ok();
            }
        };

        let worker_result = tokio::select! {
            res = worker_future => res,
            _ = shutdown_signal => Ok(()),
        };

        shutdown_tx.send(()).ok();
        heartbeat_handle.await??;

        worker_result
    }
}

async fn next_chunk(source: &mut Option<ByteSource>) -> Result<Option<Vec<u8>>> {
    match source {
        Some(reader) => reader.read_chunk().await,
        None => std::future::pending().await,
    }
}

fn build_snapshot<S, R>(
    now_ms: u64,
    capture: &SerialCapture,
    queue: &UploadQueue<S>,
    connectivity: &ConnectivityManager<R>,
) -> StatusSnapshot
where
    S: crate::upload::DumpSink,
    R: crate::connectivity::RadioControl,
{
    let stats = queue.stats();
    StatusSnapshot {
        wifi_mode: connectivity.mode().as_str().to_string(),
        address: connectivity.address(),
        ssid: connectivity.ssid(),
        time_synced: connectivity.is_time_synced(),
        uptime_seconds: now_ms / 1000,
        dump_count: capture.dump_count(),
        upload_success: stats.total_success,
        upload_failed: stats.total_failed,
        queue_depth: stats.queue_depth,
        last_upload_time: stats.last_upload_time.clone(),
        receiver_url: stats.receiver_url.clone(),
        last_dump: queue.last_dump().cloned(),
    }
}

/// Periodic operational log line, reporting the same counters the snapshot
/// carries so a headless deployment still leaves a trace.
async fn heartbeat(
    device_name: Arc<String>,
    status: watch::Receiver<StatusSnapshot>,
    mut shutdown: watch::Receiver<()>,
) -> Result<()> {
    let mut ticker = interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let snapshot = status.borrow().clone();
                tracing::info!(
                    service = %device_name,
                    mode = %snapshot.wifi_mode,
                    dumps = snapshot.dump_count,
                    upload_success = snapshot.upload_success,
                    upload_failed = snapshot.upload_failed,
                    queue_depth = snapshot.queue_depth,
                    "health heartbeat"
                );
            }
        }
    }
    Ok(())
}
