//! Bounded "terminal-like" capture of a child process's combined output.
//!
//! The executor tees stdout and stderr into one of these so that, when a
//! command fails, the error message can show what the user would have
//! seen in a terminal. This is diagnostics only; the full streams are
//! captured separately.

/// Keep at most `cap` bytes of the most recent output.
#[derive(Debug)]
pub(crate) struct TailBuffer {
    cap: usize,
    buf: Vec<u8>,
}

impl TailBuffer {
    pub(crate) fn new(cap: usize) -> Self {
        Self { cap, buf: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.cap {
            self.buf.clear();
            self.buf.extend_from_slice(&chunk[chunk.len() - self.cap..]);
            return;
        }
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.cap {
            let excess = self.buf.len() - self.cap;
            self.buf.drain(..excess);
        }
    }

    /// The captured tail as text, with `\r`-erased progress lines
    /// collapsed to their final state.
    pub(crate) fn contents(&self) -> String {
        collapse_progress_lines(&String::from_utf8_lossy(&self.buf))
    }
}

/// Git redraws progress ("Receiving objects: 42%...") by emitting `\r`
/// and overwriting the current line. Keep only what survives on screen:
/// the content after the last `\r` of each line.
pub(crate) fn collapse_progress_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for (ix, line) in text.split('\n').enumerate() {
        if ix > 0 {
            out.push('\n');
        }
        match line.rfind('\r') {
            Some(pos) => out.push_str(&line[pos + 1..]),
            None => out.push_str(line),
        }
    }
    out
}

/// The last `max` bytes of `text`, nudged forward to a char boundary.
pub(crate) fn tail_str(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
