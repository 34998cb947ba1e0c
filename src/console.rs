//! Bounded line buffer for the host-facing serial protocol.
//!
//! Command replies and engine diagnostics are pipe-delimited ASCII records,
//! one per line. `ConsoleLine` is the fixed-capacity owned form that travels
//! through the console queue; formatting that would overflow the buffer is
//! truncated rather than failed, since a clipped diagnostic is still more
//! useful than a dropped one.

use core::fmt;

use crate::CONSOLE_LINE_SIZE;

/// One record of the line-oriented host protocol, without the trailing newline.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct ConsoleLine {
    buffer: [u8; CONSOLE_LINE_SIZE],
    length: usize,
}

impl ConsoleLine {
    pub(crate) const fn new() -> Self {
        ConsoleLine {
            buffer: [0u8; CONSOLE_LINE_SIZE],
            length: 0,
        }
    }

    /// Copies a line into an owned buffer. Returns `None` when the input
    /// exceeds the line capacity.
    pub fn from_str(line: &str) -> Option<Self> {
        if line.len() > CONSOLE_LINE_SIZE {
            return None;
        }
        let mut out = ConsoleLine::new();
        out.buffer[..line.len()].copy_from_slice(line.as_bytes());
        out.length = line.len();
        Some(out)
    }

    pub fn as_str(&self) -> &str {
        // The buffer is only ever filled through write_str, so it holds
        // valid UTF-8 up to length.
        core::str::from_utf8(&self.buffer[..self.length]).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl fmt::Write for ConsoleLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let available = CONSOLE_LINE_SIZE - self.length;
        if available == 0 {
            return Ok(());
        }
        let mut take = s.len().min(available);
        // Back off to a character boundary when clipping mid-string.
        while take > 0 && !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buffer[self.length..self.length + take].copy_from_slice(&s.as_bytes()[..take]);
        self.length += take;
        Ok(())
    }
}

/// Renders one formatted record into an owned line.
pub(crate) fn line(args: fmt::Arguments<'_>) -> ConsoleLine {
    let mut out = ConsoleLine::new();
    let _ = fmt::Write::write_fmt(&mut out, args);
    out
}
