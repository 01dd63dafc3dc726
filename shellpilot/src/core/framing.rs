//! Request/response framing over an interactive shell's byte stream.
//!
//! Every command is followed by a trailer that captures `$?` and echoes two
//! random markers. The reader accumulates bytes until both markers appear and
//! then splits the buffer into output, exit code text, and leftover bytes that
//! belong to the next call.
//!
//! [`FrameScanner`] does the marker search incrementally: each read only scans
//! the new bytes plus a marker-sized overlap, and command output past a limit
//! is dropped while it streams in.

use rand::Rng;

/// Marker pair for a single framed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    pub exit: String,
    pub end: String,
}

impl Markers {
    /// Generate a fresh pair with independent 64-bit tokens.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            exit: format!("__EXIT_{:016x}__", rng.r#gen::<u64>()),
            end: format!("__END_{:016x}__", rng.r#gen::<u64>()),
        }
    }
}

/// Sentinel echoed once during startup to prove the shell reads input.
pub fn ready_sentinel() -> String {
    format!("__READY_{:016x}__", rand::thread_rng().r#gen::<u64>())
}

/// Build the byte sequence written to the shell for `command`.
pub fn frame_command(command: &str, markers: &Markers) -> String {
    format!(
        "{command}\nEC=$?\necho '{exit}'\necho $EC\necho '{end}'\n",
        exit = markers.exit,
        end = markers.end,
    )
}

/// A buffer split on a marker pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    /// Raw bytes emitted before the exit marker.
    pub output: Vec<u8>,
    /// Trimmed text between the markers.
    pub exit_code_text: String,
    /// Bytes after the end marker, carried into the next call.
    pub leftover: Vec<u8>,
}

/// Incremental search for one marker in a buffer that grows at the end.
#[derive(Debug, Clone)]
struct MarkerScan {
    marker: Vec<u8>,
    /// Offset where the next search starts.
    from: usize,
}

impl MarkerScan {
    fn new(marker: &str) -> Self {
        Self {
            marker: marker.as_bytes().to_vec(),
            from: 0,
        }
    }

    fn find(&mut self, buffer: &[u8]) -> Option<usize> {
        let start = self.from.min(buffer.len());
        if let Some(at) = find(&buffer[start..], &self.marker) {
            return Some(start + at);
        }
        // A marker may be cut in half by the read boundary.
        self.from = buffer.len().saturating_sub(self.overlap());
        None
    }

    fn overlap(&self) -> usize {
        self.marker.len().saturating_sub(1)
    }
}

/// Drop bytes after the first `keep` until only a marker-sized tail remains.
/// Returns how many bytes were dropped.
fn shrink(buffer: &mut Vec<u8>, scan: &mut MarkerScan, keep: usize) -> usize {
    let Some(tail_at) = buffer.len().checked_sub(scan.overlap()) else {
        return 0;
    };
    if tail_at <= keep {
        return 0;
    }
    buffer.drain(keep..tail_at);
    scan.from = keep;
    tail_at - keep
}

/// Marker state of one framed call while its output streams in.
///
/// Feed it the read buffer after every read with [`FrameScanner::advance`].
/// When a previous call was abandoned, everything up to and including its end
/// marker is discarded first. Output before the exit marker is capped at
/// `limit` bytes; the excess is counted in [`FrameScanner::truncated`].
#[derive(Debug, Clone)]
pub struct FrameScanner {
    stale: Option<MarkerScan>,
    exit: MarkerScan,
    end: MarkerScan,
    exit_at: Option<usize>,
    end_at: Option<usize>,
    limit: usize,
    truncated: usize,
}

impl FrameScanner {
    pub fn new(markers: &Markers, stale_end: Option<&str>, limit: usize) -> Self {
        Self {
            stale: stale_end.map(MarkerScan::new),
            exit: MarkerScan::new(&markers.exit),
            end: MarkerScan::new(&markers.end),
            exit_at: None,
            end_at: None,
            limit,
            truncated: 0,
        }
    }

    /// Scan bytes appended since the last call. Returns `true` once both markers are in.
    ///
    /// May remove bytes from `buffer`: the abandoned call's trailer and output
    /// beyond the limit.
    pub fn advance(&mut self, buffer: &mut Vec<u8>) -> bool {
        if self.end_at.is_some() {
            return true;
        }
        if let Some(stale) = self.stale.as_mut() {
            match stale.find(buffer) {
                Some(at) => {
                    let through = at + stale.marker.len();
                    buffer.drain(..through);
                    self.stale = None;
                }
                None => {
                    // Nothing before the stale marker belongs to this call.
                    shrink(buffer, stale, 0);
                    return false;
                }
            }
        }
        if self.exit_at.is_none() {
            let Some(at) = self.exit.find(buffer) else {
                self.truncated += shrink(buffer, &mut self.exit, self.limit);
                return false;
            };
            self.exit_at = Some(at);
            self.end.from = at + self.exit.marker.len();
        }
        self.end_at = self.end.find(buffer);
        self.end_at.is_some()
    }

    /// Whether the abandoned call's end marker is still outstanding.
    pub fn stale_pending(&self) -> bool {
        self.stale.is_some()
    }

    /// Bytes of command output dropped because of the limit.
    pub fn truncated(&self) -> usize {
        self.truncated
    }

    /// Split `buffer` once [`FrameScanner::advance`] has returned `true`.
    pub fn split(&self, buffer: &[u8]) -> Option<Framed> {
        let (exit_at, end_at) = (self.exit_at?, self.end_at?);
        let after_exit = exit_at + self.exit.marker.len();
        let after_end = end_at + self.end.marker.len();
        if after_end > buffer.len() {
            return None;
        }
        Some(Framed {
            output: buffer[..exit_at].to_vec(),
            exit_code_text: String::from_utf8_lossy(&buffer[after_exit..end_at])
                .trim()
                .to_string(),
            leftover: buffer[after_end..].to_vec(),
        })
    }

    /// Output of this call seen so far, for a call that will not complete.
    pub fn partial_output<'a>(&self, buffer: &'a [u8]) -> &'a [u8] {
        if self.stale.is_some() {
            return &[];
        }
        let end = self.exit_at.unwrap_or(buffer.len()).min(buffer.len());
        &buffer[..end]
    }
}

/// Parse the captured exit code text. `None` means it was not an integer.
pub fn parse_exit_code(text: &str) -> Option<i32> {
    text.trim().parse::<i32>().ok()
}

/// Drop everything up to and including `marker`. Returns whether it was found.
pub fn discard_through(buffer: &mut Vec<u8>, marker: &str) -> bool {
    match find(buffer, marker.as_bytes()) {
        Some(at) => {
            buffer.drain(..at + marker.len());
            true
        }
        None => false,
    }
}

/// Byte offset of the first occurrence of `needle` in `haystack`.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
