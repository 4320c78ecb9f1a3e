use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;

use crate::capture::SerialCapture;
use crate::queue::UploadQueue;
use crate::upload::HttpSink;
use crate::AppConfig;

/// Canned indicator print output, in the 920i's tab-separated layout. Used by
/// the diagnostic inject command so the pipeline can be exercised without the
/// machine attached.
pub const TEST_DUMP: &[u8] = b"920i Print Output\r\n\
Date: 2026-02-18\r\n\
Time: 10:30:00\r\n\
\r\n\
ID\tGross\tTare\tNet\tUnit\r\n\
1\t1250.5\t120.0\t1130.5\tlb\r\n\
2\t2340.0\t120.0\t2220.0\tlb\r\n\
3\t985.5\t120.0\t865.5\tlb\r\n\
4\t3100.0\t120.0\t2980.0\tlb\r\n\
5\t1875.0\t120.0\t1755.0\tlb\r\n";

/// Feeds a capture file through the framing machine and submits the resulting
/// dump exactly as a live capture would be, then reports the outcome. Runs
/// with a synthetic clock, so the silence gap completes instantly.
pub async fn inject_file(path: impl AsRef<Path>, config: &AppConfig) -> Result<()> {
    let raw = fs::read(path.as_ref())
        .await
        .with_context(|| format!("open capture file {}", path.as_ref().display()))?;
    inject_bytes(&raw, config).await
}

async fn inject_bytes(raw: &[u8], config: &AppConfig) -> Result<()> {
    let sink = HttpSink::new()?;
    let mut queue = UploadQueue::open(config, sink).await;
    let mut capture = SerialCapture::new(config.silence_timeout_ms, config.max_dump_bytes);

    capture.feed_slice(raw, 0);
    let dump = capture
        .poll(config.silence_timeout_ms)
        .context("capture produced no dump")?;

    let record = queue.submit(&dump, "injected").await;
    tracing::info!(
        id = record.id,
        bytes = record.size,
        uploaded = record.uploaded,
        queue_depth = queue.stats().queue_depth,
        "injection completed"
    );
    Ok(())
}
