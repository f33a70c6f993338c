//! Host header rewriting for bytes flowing from the relay to the local service.
//!
//! # Responsibilities
//! - Locate the first `Host:` header line in a request byte stream
//! - Replace its value with the configured host
//! - Pass every other byte through untouched, whatever the chunking
//!
//! # Design Decisions
//! - Line oriented state machine, no regex
//! - Only a line that may still turn out to be `Host:` is held back
//! - Single shot: once a Host line was rewritten the rewriter is a pass-through,
//!   so later requests on a keep-alive connection keep their Host header

use bytes::BytesMut;

/// Longest candidate Host line that is held back before giving up.
pub const MAX_HOST_LINE: usize = 8 * 1024;

const HOST_PREFIX: &[u8] = b"host:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// At the start of a line, comparing against `host:`.
    LineStart,
    /// The current line is not a Host header.
    SkipLine,
    /// The current line is a Host header and is being collected.
    HostLine,
    /// Pass-through.
    Done,
}

/// Rewrites the first Host header of a byte stream.
#[derive(Debug)]
pub struct HostRewriter {
    host: Vec<u8>,
    state: State,
    held: Vec<u8>,
}

impl HostRewriter {
    /// Create a rewriter that sets the Host header to `host`.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into().into_bytes(),
            state: State::LineStart,
            held: Vec::with_capacity(HOST_PREFIX.len()),
        }
    }

    /// True once the rewriter no longer inspects bytes.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Feed one chunk, appending the transformed bytes to `out`.
    pub fn transform(&mut self, chunk: &[u8], out: &mut BytesMut) {
        let mut i = 0;
        while i < chunk.len() {
            match self.state {
                State::Done => {
                    out.extend_from_slice(&chunk[i..]);
                    return;
                }
                State::SkipLine => match find_newline(&chunk[i..]) {
                    Some(pos) => {
                        out.extend_from_slice(&chunk[i..=i + pos]);
                        i += pos + 1;
                        self.state = State::LineStart;
                    }
                    None => {
                        out.extend_from_slice(&chunk[i..]);
                        return;
                    }
                },
                State::LineStart => {
                    let byte = chunk[i];
                    if byte.to_ascii_lowercase() == HOST_PREFIX[self.held.len()] {
                        self.held.push(byte);
                        i += 1;
                        if self.held.len() == HOST_PREFIX.len() {
                            self.state = State::HostLine;
                        }
                    } else {
                        // `byte` is left for SkipLine, it may itself end the line.
                        out.extend_from_slice(&self.held);
                        self.held.clear();
                        self.state = State::SkipLine;
                    }
                }
                State::HostLine => match find_newline(&chunk[i..]) {
                    Some(pos) => {
                        self.held.extend_from_slice(&chunk[i..=i + pos]);
                        i += pos + 1;
                        self.emit_rewritten(out);
                    }
                    None => {
                        self.held.extend_from_slice(&chunk[i..]);
                        if self.held.len() > MAX_HOST_LINE {
                            tracing::debug!(len = self.held.len(), "Host line too long, not rewriting");
                            out.extend_from_slice(&self.held);
                            self.held = Vec::new();
                            self.state = State::Done;
                        }
                        return;
                    }
                },
            }
        }
    }

    /// Flush anything still held back at end of stream.
    pub fn finish(&mut self, out: &mut BytesMut) {
        out.extend_from_slice(&self.held);
        self.held = Vec::new();
        self.state = State::Done;
    }

    fn emit_rewritten(&mut self, out: &mut BytesMut) {
        let line = std::mem::take(&mut self.held);

        let mut value_start = HOST_PREFIX.len();
        while value_start < line.len() && (line[value_start] == b' ' || line[value_start] == b'\t') {
            value_start += 1;
        }

        let mut value_end = line.len();
        if value_end > 0 && line[value_end - 1] == b'\n' {
            value_end -= 1;
        }
        if value_end > 0 && line[value_end - 1] == b'\r' {
            value_end -= 1;
        }
        let value_end = value_end.max(value_start);

        out.extend_from_slice(&line[..value_start]);
        out.extend_from_slice(&self.host);
        out.extend_from_slice(&line[value_end..]);

        self.state = State::Done;
    }
}

fn find_newline(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == b'\n')
}
