/// Append-only record of everything one process wrote to its stdout.
///
/// Bytes are kept raw; text views decode lossily so a chunk boundary that splits a
/// UTF-8 sequence, or a kernel printing garbage, never turns into an error.
#[derive(Debug, Default, Clone)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    read_pos: usize,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 decoding of every byte appended so far.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn contains(&self, pattern: &[u8]) -> bool {
        if pattern.is_empty() {
            return true;
        }
        self.bytes.windows(pattern.len()).any(|w| w == pattern)
    }

    /// Bytes appended since the previous call.
    pub fn take_new(&mut self) -> &[u8] {
        let start = self.read_pos;
        self.read_pos = self.bytes.len();
        &self.bytes[start..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
