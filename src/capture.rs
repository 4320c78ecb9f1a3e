/// Silence-based framing of the RS-232 print stream.
///
/// The indicator emits print dumps with no end-of-message marker; the only
/// reliable delimiter is inter-message silence. At 9600 baud a character takes
/// about a millisecond, so a two-second gap cannot occur inside a dump but
/// always follows one.
///
/// Time is passed in as monotonic milliseconds rather than read from a clock,
/// so the machine is deterministic under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Receiving,
}

pub struct SerialCapture {
    state: CaptureState,
    buffer: Vec<u8>,
    max_bytes: usize,
    silence_ms: u64,
    last_byte_ms: u64,
    truncated: u64,
    dump_count: u32,
}

impl SerialCapture {
    pub fn new(silence_ms: u64, max_bytes: usize) -> Self {
        Self {
            state: CaptureState::Idle,
            buffer: Vec::new(),
            max_bytes,
            silence_ms,
            last_byte_ms: 0,
            truncated: 0,
            dump_count: 0,
        }
    }

    /// Ingests one byte. The silence timer advances even for bytes discarded
    /// by the size bound, so an oversized dump still completes on schedule.
    pub fn feed(&mut self, byte: u8, now_ms: u64) {
        self.last_byte_ms = now_ms;

        if self.state == CaptureState::Idle {
            self.state = CaptureState::Receiving;
            self.buffer.clear();
            self.truncated = 0;
            tracing::debug!("receiving data");
        }

        if self.buffer.len() < self.max_bytes {
            self.buffer.push(byte);
        } else {
            self.truncated += 1;
        }
    }

    pub fn feed_slice(&mut self, bytes: &[u8], now_ms: u64) {
        for &byte in bytes {
            self.feed(byte, now_ms);
        }
    }

    /// Checks for frame completion. Returns the finished dump once the silence
    /// threshold has elapsed since the last byte; Idle never times out, so no
    /// empty or partial frame is ever produced.
    pub fn poll(&mut self, now_ms: u64) -> Option<Vec<u8>> {
        if self.state != CaptureState::Receiving {
            return None;
        }
        if now_ms.saturating_sub(self.last_byte_ms) < self.silence_ms {
            return None;
        }

        self.state = CaptureState::Idle;
        self.dump_count += 1;
        let dump = std::mem::take(&mut self.buffer);

        if self.truncated > 0 {
            tracing::warn!(
                dump = self.dump_count,
                bytes = dump.len(),
                discarded = self.truncated,
                "dump exceeded buffer, tail discarded"
            );
        } else {
            tracing::info!(dump = self.dump_count, bytes = dump.len(), "dump complete");
        }

        Some(dump)
    }

    pub fn state(&self) -> CaptureState {
        self.state
    }

    /// Dumps completed this session. Volatile, reset at process start.
    pub fn dump_count(&self) -> u32 {
        self.dump_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_never_times_out() {
        let mut cap = SerialCapture::new(2000, 100);
        assert_eq!(cap.poll(1_000_000), None);
        assert_eq!(cap.state(), CaptureState::Idle);
        assert_eq!(cap.dump_count(), 0);
    }

    #[test]
    fn frames_on_silence_gap() {
        // Bytes A, B, C, then a 3 s gap and a 2.5 s gap: exactly one dump of
        // three bytes fires after the first gap.
        let mut cap = SerialCapture::new(2000, 100);
        cap.feed(b'A', 0);
        cap.feed(b'B', 10);
        cap.feed(b'C', 20);
        assert_eq!(cap.poll(1000), None);

        let dump = cap.poll(3020).expect("dump after 3s gap");
        assert_eq!(dump, b"ABC");
        assert_eq!(cap.dump_count(), 1);

        // Nothing arrived since, so the further 2.5 s of silence is inert.
        assert_eq!(cap.poll(5520), None);
        assert_eq!(cap.dump_count(), 1);
    }

    #[test]
    fn sub_threshold_gaps_do_not_split() {
        let mut cap = SerialCapture::new(2000, 100);
        cap.feed(b'x', 0);
        assert_eq!(cap.poll(1999), None);
        cap.feed(b'y', 1999);
        assert_eq!(cap.poll(3000), None);
        let dump = cap.poll(3999).expect("single dump");
        assert_eq!(dump, b"xy");
        assert_eq!(cap.dump_count(), 1);
    }

    #[test]
    fn consecutive_dumps() {
        let mut cap = SerialCapture::new(2000, 100);
        cap.feed_slice(b"one", 0);
        assert_eq!(cap.poll(2000).as_deref(), Some(b"one".as_ref()));
        cap.feed_slice(b"two", 5000);
        assert_eq!(cap.poll(7000).as_deref(), Some(b"two".as_ref()));
        assert_eq!(cap.dump_count(), 2);
    }

    #[test]
    fn overflow_truncates_but_timer_advances() {
        let mut cap = SerialCapture::new(2000, 4);
        cap.feed_slice(b"abcd", 0);
        // Past the bound: discarded, but each byte renews the silence timer.
        cap.feed(b'e', 1500);
        cap.feed(b'f', 3000);
        assert_eq!(cap.poll(3500), None);
        let dump = cap.poll(5000).expect("truncated dump");
        assert_eq!(dump, b"abcd");
    }

    #[test]
    fn buffer_reset_between_dumps() {
        let mut cap = SerialCapture::new(2000, 4);
        cap.feed_slice(b"abcdef", 0);
        assert_eq!(cap.poll(2000).as_deref(), Some(b"abcd".as_ref()));
        cap.feed_slice(b"gh", 4000);
        assert_eq!(cap.poll(6000).as_deref(), Some(b"gh".as_ref()));
    }
}
