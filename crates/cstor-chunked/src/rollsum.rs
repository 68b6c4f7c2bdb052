//! Rolling checksum for content-defined chunking.
//!
//! This is the bup rollsum: two running sums over a fixed window, where `s1`
//! is the plain sum of the window and `s2` the sum of the prefix sums. Every
//! byte is offset by a constant so that runs of zero still move the digest.
//! A chunk ends where the low bits of the digest are all zero, so boundaries
//! depend on content only and survive insertions earlier in the file.

const CHAR_OFFSET: u32 = 31;

/// Rolling checksum over the last `window` bytes.
#[derive(Debug, Clone)]
pub struct RollSum {
    s1: u32,
    s2: u32,
    window: Vec<u8>,
    pos: usize,
    split_mask: u32,
}

impl RollSum {
    /// Create a checksum with a window of `window` bytes that splits when the
    /// low `bits` bits of the digest are zero.
    pub fn new(window: usize, bits: u32) -> Self {
        let window = window.max(1);
        let w = window as u32;
        let split_mask = if bits >= 32 {
            u32::MAX
        } else {
            (1u32 << bits) - 1
        };
        Self {
            s1: w.wrapping_mul(CHAR_OFFSET),
            s2: w.wrapping_mul(w.wrapping_sub(1)).wrapping_mul(CHAR_OFFSET),
            window: vec![0; window],
            pos: 0,
            split_mask,
        }
    }

    fn add(&mut self, drop: u8, add: u8) {
        let w = self.window.len() as u32;
        self.s1 = self.s1.wrapping_add(add as u32).wrapping_sub(drop as u32);
        self.s2 = self
            .s2
            .wrapping_add(self.s1)
            .wrapping_sub(w.wrapping_mul(drop as u32 + CHAR_OFFSET));
    }

    /// Push one byte into the window.
    pub fn roll(&mut self, ch: u8) {
        let drop = self.window[self.pos];
        self.add(drop, ch);
        self.window[self.pos] = ch;
        self.pos = (self.pos + 1) % self.window.len();
    }

    /// Current digest.
    pub fn digest(&self) -> u32 {
        (self.s1 << 16) | (self.s2 & 0xffff)
    }

    /// Whether the current position is a chunk boundary.
    pub fn on_split(&self) -> bool {
        self.digest() & self.split_mask == 0
    }
}
