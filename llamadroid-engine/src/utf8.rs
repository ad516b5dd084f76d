//! UTF-8 boundary handling for streamed token pieces
//!
//! A tokenizer may split one code point across several tokens (byte-level BPE
//! emits `<0xE3>`, `<0x81>`, `<0x82>` for "あ"). The assembler buffers such
//! partial pieces so the caller only ever sees complete text.

/// Classify a byte buffer as complete UTF-8 by lead/continuation bit patterns.
///
/// Permissive: overlong encodings, surrogates and values above U+10FFFF are
/// accepted as long as the bit layout is well formed.
pub fn is_valid_utf8(bytes: &[u8]) -> bool {
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        let width = if lead & 0x80 == 0x00 {
            1
        } else if lead & 0xE0 == 0xC0 {
            2
        } else if lead & 0xF0 == 0xE0 {
            3
        } else if lead & 0xF8 == 0xF0 {
            4
        } else {
            return false;
        };

        if i + width > bytes.len() {
            return false;
        }
        if bytes[i + 1..i + width].iter().any(|&b| b & 0xC0 != 0x80) {
            return false;
        }
        i += width;
    }
    true
}

/// Accumulates raw token pieces until they form valid UTF-8.
#[derive(Debug, Default, Clone)]
pub struct FragmentAssembler {
    pending: Vec<u8>,
}

impl FragmentAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one detokenized piece. Returns the text that became complete,
    /// or an empty string while a code point is still incomplete.
    pub fn absorb(&mut self, piece: &[u8]) -> String {
        if self.pending.is_empty() {
            if is_valid_utf8(piece) {
                return bytes_to_string(piece.to_vec());
            }
            self.pending.extend_from_slice(piece);
            return String::new();
        }

        self.pending.extend_from_slice(piece);
        if is_valid_utf8(&self.pending) {
            return bytes_to_string(std::mem::take(&mut self.pending));
        }
        String::new()
    }

    /// Drop any buffered partial sequence.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Bytes that pass the bit-pattern check but not `str::from_utf8`
/// (surrogates, overlong forms) are replaced rather than dropped.
fn bytes_to_string(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}
