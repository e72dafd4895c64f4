//! Bounded two-pass JSON rendering
//!
//! [`render_json`] writes an error chain as nested objects into a caller
//! buffer and returns the size the complete document needs, terminator
//! included. An empty buffer only measures. Output is truncated (and still
//! NUL-terminated) when the buffer is short; the return value does not change.
//!
//! ```text
//! {"domain":"POLICY","code":"POLICY_VIOLATION","flags":["PERMANENT"],
//!  "message":"...","file":"...","line":12,"func":"...",
//!  "cause":{ ...same shape... }}
//! ```
//!
//! Nesting is driven by an explicit frame stack, never recursion. Chains
//! deeper than [`MAX_DEPTH`] end with `"cause":{"truncated":true}`.

use gitledger_core::constants::{JSON_STATIC_STACK_DEPTH, MAX_DEPTH};

use crate::error::LedgerError;

// ── Sink ──────────────────────────────────────────────────────────

/// Counts every byte offered and copies what fits, reserving one byte for
/// the terminator. Once a write is cut short nothing more is copied, so the
/// output is always a prefix of the full document.
struct Sink<'b> {
    buf: &'b mut [u8],
    len: usize,
    required: usize,
    full: bool,
}

impl<'b> Sink<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        if let Some(first) = buf.first_mut() {
            *first = 0;
        }
        Sink { buf, len: 0, required: 0, full: false }
    }

    fn push(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.required = self.required.saturating_add(bytes.len());
        if self.full || self.buf.is_empty() {
            return;
        }
        let avail = self.buf.len() - 1 - self.len;
        let n = avail.min(bytes.len());
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        if n < bytes.len() {
            self.full = true;
        }
    }

    #[inline]
    fn push_byte(&mut self, b: u8) {
        self.push(&[b]);
    }

    /// String contents escaped per RFC 8259; quotes are the caller's.
    fn push_escaped(&mut self, text: &[u8]) {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut run = 0;
        for (i, &b) in text.iter().enumerate() {
            let short: &[u8] = match b {
                b'"' => b"\\\"",
                b'\\' => b"\\\\",
                b'\n' => b"\\n",
                b'\r' => b"\\r",
                b'\t' => b"\\t",
                0x08 => b"\\b",
                0x0C => b"\\f",
                0x00..=0x1F => b"",
                _ => continue,
            };
            self.push(&text[run..i]);
            if short.is_empty() {
                let hi = HEX[(b >> 4) as usize];
                let lo = HEX[(b & 0xF) as usize];
                self.push(&[b'\\', b'u', b'0', b'0', hi, lo]);
            } else {
                self.push(short);
            }
            run = i + 1;
        }
        self.push(&text[run..]);
    }

    fn push_u32(&mut self, mut v: u32) {
        let mut digits = [0u8; 10];
        let mut at = digits.len();
        loop {
            at -= 1;
            digits[at] = b'0' + (v % 10) as u8;
            v /= 10;
            if v == 0 {
                break;
            }
        }
        self.push(&digits[at..]);
    }

    /// Terminate and report the full size.
    fn finish(self) -> usize {
        if !self.buf.is_empty() {
            let at = self.len.min(self.buf.len() - 1);
            self.buf[at] = 0;
        }
        self.required.saturating_add(1)
    }
}

// ── Fields ────────────────────────────────────────────────────────

fn push_string_field(sink: &mut Sink<'_>, key: &[u8], value: &[u8]) {
    sink.push(key);
    sink.push_byte(b'"');
    sink.push_escaped(value);
    sink.push_byte(b'"');
}

fn write_fields(sink: &mut Sink<'_>, err: &LedgerError) {
    push_string_field(sink, b"\"domain\":", err.domain().name().as_bytes());
    push_string_field(sink, b",\"code\":", err.code().name().as_bytes());

    sink.push(b",\"flags\":[");
    for (i, name) in err.flags().names().enumerate() {
        if i > 0 {
            sink.push_byte(b',');
        }
        sink.push_byte(b'"');
        sink.push(name.as_bytes());
        sink.push_byte(b'"');
    }
    sink.push_byte(b']');

    push_string_field(sink, b",\"message\":", err.message().as_bytes());

    if let Some(loc) = err.location() {
        push_string_field(sink, b",\"file\":", loc.file.as_bytes());
        sink.push(b",\"line\":");
        sink.push_u32(loc.line);
        if let Some(func) = loc.func {
            push_string_field(sink, b",\"func\":", func.as_bytes());
        }
    }
}

// ── Chain ─────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
struct Frame<'e> {
    err: &'e LedgerError,
    opened: bool,
}

/// Chain length up to `MAX_DEPTH`, and whether links remain beyond it.
fn measure_depth(top: &LedgerError) -> (usize, bool) {
    let mut depth = 0;
    let mut cursor = Some(top);
    while let Some(err) = cursor {
        if depth == MAX_DEPTH {
            break;
        }
        depth += 1;
        cursor = err.cause();
    }
    (depth, cursor.is_some())
}

/// Emit `top` and its causes. Returns true if the chain was cut short.
fn write_chain(sink: &mut Sink<'_>, top: &LedgerError) -> bool {
    write_chain_with(sink, top, |heap, depth| heap.try_reserve_exact(depth).is_ok())
}

/// [`write_chain`] with the heap reservation supplied by the caller. When
/// `reserve` fails, the inline stack is used and the chain is cut where it
/// fills.
fn write_chain_with<'e, R>(sink: &mut Sink<'_>, top: &'e LedgerError, reserve: R) -> bool
where
    R: FnOnce(&mut Vec<Option<Frame<'e>>>, usize) -> bool,
{
    let (depth, mut truncated) = measure_depth(top);

    let mut inline: [Option<Frame<'e>>; JSON_STATIC_STACK_DEPTH] =
        [None; JSON_STATIC_STACK_DEPTH];
    let mut heap: Vec<Option<Frame<'e>>> = Vec::new();
    let frames: &mut [Option<Frame<'e>>] = if depth <= JSON_STATIC_STACK_DEPTH {
        &mut inline
    } else if reserve(&mut heap, depth) {
        heap.resize(depth, None);
        &mut heap
    } else {
        truncated = true;
        &mut inline
    };
    let capacity = frames.len();

    frames[0] = Some(Frame { err: top, opened: false });
    let mut len = 1;
    while len > 0 {
        if let Some(frame) = frames[len - 1].as_mut() {
            if !frame.opened {
                frame.opened = true;
                let err = frame.err;
                sink.push_byte(b'{');
                write_fields(sink, err);
                if let Some(cause) = err.cause() {
                    sink.push(b",\"cause\":");
                    if len < capacity {
                        frames[len] = Some(Frame { err: cause, opened: false });
                        len += 1;
                        continue;
                    }
                    truncated = true;
                    sink.push(b"{\"truncated\":true}");
                }
            }
        }
        sink.push_byte(b'}');
        len -= 1;
        frames[len] = None;
    }
    truncated
}

/// Render `err` (or `{}` for `None`) into `buf`.
///
/// Returns the byte count the complete document needs, including the
/// terminator. `usize::MAX` means the size overflowed.
///
/// `None` deliberately renders as `{}` and reports 3 rather than an empty
/// string of size 1, so every output parses as JSON.
pub fn render_json(err: Option<&LedgerError>, buf: &mut [u8]) -> usize {
    let mut sink = Sink::new(buf);
    match err {
        Some(err) => {
            write_chain(&mut sink, err);
        }
        None => sink.push(b"{}"),
    }
    sink.finish()
}

impl LedgerError {
    /// Render this chain into `buf`. See [`render_json`].
    pub fn render_json(&self, buf: &mut [u8]) -> usize {
        render_json(Some(self), buf)
    }

    /// Render this chain into a fresh `String` on the global heap.
    pub fn to_json_string(&self) -> String {
        let required = self.render_json(&mut []);
        if required == usize::MAX {
            return String::from("{}");
        }
        let mut buf = vec![0u8; required];
        self.render_json(&mut buf);
        buf.truncate(required - 1);
        String::from_utf8(buf).unwrap_or_else(|_| String::from("{}"))
    }
}
