// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal runtime support for the earliest boot code.
//!
//! Nothing in here allocates or can fail. It is what the console logger, the
//! panic handler and the C glue use to turn `format_args!` output and Rust
//! strings into bytes before (or without) a heap.

use core::fmt;

/// A formatting sink over a fixed stack buffer.
///
/// Output that does not fit is dropped and remembered in `truncated`. The
/// last byte of the buffer is always kept free so that the contents can be
/// handed to C as a NUL-terminated string.
pub struct FixedBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
    truncated: bool,
}

impl<const N: usize> FixedBuf<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            len: 0,
            truncated: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Contents as text. Truncation can split a multi-byte character, in
    /// which case the partial character is left out.
    pub fn as_str(&self) -> &str {
        match core::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(e) => {
                // `valid_up_to` is a char boundary by definition.
                let valid = &self.buf[..e.valid_up_to()];
                core::str::from_utf8(valid).unwrap_or("")
            }
        }
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.truncated = false;
    }

    /// Pointer to the contents followed by a NUL, for passing to C.
    pub fn as_c_ptr(&mut self) -> *const u8 {
        // `write_str` never fills the final byte.
        if let Some(terminator) = self.buf.get_mut(self.len) {
            *terminator = 0;
        }
        self.buf.as_ptr()
    }

    /// Builds a NUL-terminated copy of `s`. Strings that do not fit come back
    /// truncated, which the caller must check if it matters.
    pub fn c_str(s: &str) -> Self {
        let mut out = Self::new();
        let _ = fmt::Write::write_str(&mut out, s);
        out.as_c_ptr();
        out
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Write for FixedBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N.saturating_sub(1).saturating_sub(self.len);
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            self.truncated = true;
        }
        // Never report an error: a short message beats a formatting panic
        // this early in boot.
        Ok(())
    }
}

/// Formats `args` into a fresh fixed buffer.
pub fn format_fixed<const N: usize>(args: fmt::Arguments<'_>) -> FixedBuf<N> {
    let mut out = FixedBuf::new();
    let _ = fmt::write(&mut out, args);
    out
}

/// Copies `src` into a fixed-size, NUL-padded byte field, always leaving room
/// for a terminator. Returns the number of bytes copied.
pub fn copy_c_field(dest: &mut [u8], src: &[u8]) -> usize {
    dest.fill(0);
    let take = src.len().min(dest.len().saturating_sub(1));
    dest[..take].copy_from_slice(&src[..take]);
    take
}

/// The bytes of a NUL-padded field, up to (not including) the first NUL.
pub fn c_field(src: &[u8]) -> &[u8] {
    let end = src.iter().position(|&b| b == 0).unwrap_or(src.len());
    &src[..end]
}
