use anyhow::{Context, Result};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

#[cfg(unix)]
use std::os::unix::fs::FileTypeExt;

enum ReaderSource {
    Serial(SerialStream),
    File(File),
}

/// Raw-byte reader over the RS-232 source. The indicator's dumps carry no
/// framing, so this reads whatever chunk is available and leaves delimiting
/// to the silence-based capture machine. A FIFO or regular file stands in for
/// the port during bench runs.
pub struct ByteSource {
    reader: ReaderSource,
    buffer: [u8; 512],
}

impl ByteSource {
    pub async fn connect(port: &str, baud_rate: u32) -> Result<Self> {
        let _metadata = std::fs::metadata(port)?;

        let is_fifo_or_file = {
            #[cfg(unix)]
            {
                _metadata.file_type().is_fifo() || _metadata.is_file()
            }
            #[cfg(not(unix))]
            {
                _metadata.is_file()
            }
        };

        let reader = if is_fifo_or_file {
            let file = File::open(port)
                .await
                .with_context(|| format!("failed to open FIFO/file {}", port))?;
            ReaderSource::File(file)
        } else {
            let builder = tokio_serial::new(port, baud_rate);
            let stream = builder
                .open_native_async()
                .with_context(|| format!("failed to open serial port {}", port))?;
            ReaderSource::Serial(stream)
        };
        Ok(Self {
            reader,
            buffer: [0u8; 512],
        })
    }

    /// Returns the next available chunk, or `None` at end of stream.
    pub async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let read = match &mut self.reader {
            ReaderSource::Serial(r) => r.read(&mut self.buffer).await?,
            ReaderSource::File(r) => r.read(&mut self.buffer).await?,
        };
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(self.buffer[..read].to_vec()))
    }
}
