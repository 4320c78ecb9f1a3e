use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// One durable key-value namespace, held as a JSON document on disk with the
/// current value cached in memory.
///
/// Writes go through a temp file and a rename so a power cut mid-write leaves
/// the previous document intact. If the state directory cannot be prepared
/// the namespace degrades to memory-only operation: the service keeps running
/// and values are lost on restart, which is logged once rather than hidden.
pub struct Namespace<T> {
    path: Option<PathBuf>,
    value: T,
}

impl<T> Namespace<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub async fn open(state_dir: impl AsRef<Path>, name: &str) -> Self {
        let dir = state_dir.as_ref();
        if let Err(err) = fs::create_dir_all(dir).await {
            tracing::error!(
                namespace = name,
                dir = %dir.display(),
                error = %err,
                "state directory unavailable, running memory-only"
            );
            return Self {
                path: None,
                value: T::default(),
            };
        }

        let path = dir.join(format!("{name}.json"));
        let value = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(err) => {
                    tracing::warn!(
                        namespace = name,
                        error = %err,
                        "stored state unreadable, starting fresh"
                    );
                    T::default()
                }
            },
            Err(_) => T::default(),
        };

        Self {
            path: Some(path),
            value,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replaces the value and persists it. Storage failures are absorbed: the
    /// in-memory value is updated regardless, so the running session stays
    /// coherent even when the write is lost.
    pub async fn save(&mut self, value: T) {
        self.value = value;
        let Some(path) = &self.path else { return };
        if let Err(err) = write_atomic(path, &self.value).await {
            tracing::error!(path = %path.display(), error = %err, "state write failed");
        }
    }
}

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let raw = serde_json::to_vec_pretty(value).context("serialize state")?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, &raw)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
