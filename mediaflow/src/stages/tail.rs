//! Bounded capture of process output.

/// Default number of characters kept from a stage's output.
pub const DEFAULT_TAIL_LIMIT: usize = 500;

/// Returns the last `limit` characters of `text`.
#[must_use]
pub fn tail_chars(text: &str, limit: usize) -> &str {
    if limit == 0 {
        return "";
    }
    match text.char_indices().rev().nth(limit - 1) {
        Some((start, _)) => &text[start..],
        None => text,
    }
}

/// Append-only buffer that keeps only the last `limit` characters.
#[derive(Debug, Clone)]
pub struct OutputTail {
    limit: usize,
    buf: String,
    pending: Vec<u8>,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::new(DEFAULT_TAIL_LIMIT)
    }
}

impl OutputTail {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            buf: String::new(),
            pending: Vec::new(),
        }
    }

    /// Appends text, discarding the oldest characters past the limit.
    pub fn push_str(&mut self, text: &str) {
        self.buf.push_str(text);
        if self.buf.len() > self.limit {
            let keep = tail_chars(&self.buf, self.limit).len();
            let cut = self.buf.len() - keep;
            self.buf.drain(..cut);
        }
    }

    /// Appends a chunk of raw process output, replacing invalid UTF-8.
    ///
    /// A multi-byte character split across chunks is held back until the
    /// next chunk completes it.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);
        let complete = match std::str::from_utf8(&data) {
            Err(e) if e.error_len().is_none() => e.valid_up_to(),
            _ => data.len(),
        };
        self.pending = data.split_off(complete);
        self.push_str(&String::from_utf8_lossy(&data));
    }

    /// Returns the retained text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// Consumes the buffer, flushing any incomplete trailing bytes.
    #[must_use]
    pub fn into_string(mut self) -> String {
        if !self.pending.is_empty() {
            let pending = std::mem::take(&mut self.pending);
            self.push_str(&String::from_utf8_lossy(&pending));
        }
        self.buf
    }
}
