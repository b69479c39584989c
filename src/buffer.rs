//! Growable byte buffer backing every code generator.

/// A little-endian byte sequence under construction, with helpers for
/// emitting the fixed-width fields (32-bit displacements, 64-bit
/// immediates) the encoder needs. Branch and call displacements are
/// patched later, after the buffer has been consumed into a plain
/// `Vec<u8>` (see `crate::driver`).
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> CodeBuffer {
        CodeBuffer { bytes: Vec::new() }
    }

    /// Current length in bytes; also the offset the next emitted byte
    /// will land at.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// `true` if nothing has been emitted yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Appends one byte.
    pub fn push_u8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Appends a little-endian 32-bit immediate or displacement.
    pub fn push_i32(&mut self, value: i32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a little-endian 64-bit immediate (used only for
    /// `mov rax, imm64` absolute-call sequences).
    pub fn push_i64(&mut self, value: i64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Borrows the emitted bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// Consumes the buffer, returning the emitted bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushes_accumulate_in_order() {
        let mut buf = CodeBuffer::new();
        buf.push_u8(0xE9);
        buf.push_i32(-5);
        buf.push_i64(0x1122_3344_5566_7788);
        assert_eq!(buf.len(), 13);
        assert!(!buf.is_empty());
        assert_eq!(buf.as_slice()[0], 0xE9);
        assert_eq!(&buf.as_slice()[1..5], &(-5i32).to_le_bytes());
        assert_eq!(buf.into_bytes().len(), 13);
    }
}
