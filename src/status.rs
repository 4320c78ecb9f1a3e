use serde::Serialize;

use crate::queue::DumpRecord;

/// Read-only snapshot consumed by the dashboard layer. Published on a watch
/// channel each control-loop tick; consumers never touch the live state.
#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSnapshot {
    pub wifi_mode: String,
    pub address: String,
    pub ssid: String,
    pub time_synced: bool,
    pub uptime_seconds: u64,
    pub dump_count: u32,
    pub upload_success: u64,
    pub upload_failed: u64,
    pub queue_depth: usize,
    pub last_upload_time: String,
    pub receiver_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dump: Option<DumpRecord>,
}
