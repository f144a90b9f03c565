//! Bounded FIFO byte window used for both handshake frames and relayed
//! traffic (`spec.md` §4.a).
//!
//! A `Buffer` never reallocates and never auto-compacts: callers must
//! drain (`advance_read` back to the write cursor) before the next
//! `reset`. This mirrors the original C `fbuffer.h` macros
//! (`FBUF_DATA_AT`, `FBUF_WRITE_AT`, `FBUF_COMMIT_READ`,
//! `FBUF_COMMIT_WRITE`, `FBUF_REST`) one to one.

/// Default capacity for the steady-state relay buffers.
pub const BUFSIZE: usize = 8192;

/// Size of the L→R handshake frame; also used as the scratch buffer
/// capacity while assembling that frame.
pub const HANDSHAKE_SIZE: usize = 1024;

/// Size of the R→L handshake response frame.
pub const HANDSHAKE_REPLY_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Unread data, from `read_pos` to `write_pos`.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Writable tail, from `write_pos` to `capacity`.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.write_pos..]
    }

    /// Mutable view of the unread range, for in-place transforms (the
    /// crypto engine XORs a keystream over already-committed bytes
    /// without moving either cursor).
    pub fn readable_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.read_pos..self.write_pos]
    }

    /// Bytes of unread data.
    pub fn data_len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Free space remaining for a write.
    pub fn writable_len(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Advance the write cursor after writing `n` bytes into
    /// `writable_mut()`. A commit that would exceed capacity is a
    /// programming error (`spec.md` §3 invariant iv); debug builds assert,
    /// release builds clamp defensively so a buggy caller cannot corrupt
    /// the cursor invariant `read_pos <= write_pos <= capacity`.
    pub fn advance_write(&mut self, n: usize) {
        debug_assert!(self.write_pos + n <= self.data.len());
        self.write_pos = (self.write_pos + n).min(self.data.len());
    }

    /// Advance the read cursor after consuming `n` bytes of `readable()`.
    pub fn advance_read(&mut self, n: usize) {
        debug_assert!(self.read_pos + n <= self.write_pos);
        self.read_pos = (self.read_pos + n).min(self.write_pos);
    }

    /// Zero both cursors. Only valid when no unread data remains; used
    /// after the handshake buffers are fully drained so they can be
    /// reused as the first relay buffers (`spec.md` §4.g resolution).
    pub fn reset(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_roundtrip() {
        let mut buf = Buffer::with_capacity(16);
        let data = b"hello world";
        buf.writable_mut()[..data.len()].copy_from_slice(data);
        buf.advance_write(data.len());

        assert_eq!(buf.data_len(), data.len());
        assert_eq!(buf.readable(), data);

        buf.advance_read(data.len());
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_drain_then_refill() {
        let mut buf = Buffer::with_capacity(16);
        buf.writable_mut()[..4].copy_from_slice(b"abcd");
        buf.advance_write(4);
        buf.advance_read(2);
        assert_eq!(buf.readable(), b"cd");

        buf.writable_mut()[..2].copy_from_slice(b"ef");
        buf.advance_write(2);
        assert_eq!(buf.readable(), b"cdef");
    }

    #[test]
    fn reset_after_full_drain() {
        let mut buf = Buffer::with_capacity(8);
        buf.writable_mut()[..3].copy_from_slice(b"abc");
        buf.advance_write(3);
        buf.advance_read(3);
        buf.reset();
        assert_eq!(buf.writable_len(), 8);
        assert_eq!(buf.data_len(), 0);
    }
}
