//! Line protocol codec.
//!
//! ```text
//! Server:  ?>
//! Client:  cat face\r\n
//! Server:  U+1F431\t🐱\tCAT FACE\r\n
//!          ...
//!          5 matches for 'cat face'\r\n
//!          ?>
//! ```
//!
//! A line whose first character is a control character (code point below
//! 32), or that is not valid UTF-8, ends the session.

use crate::loader::QueryResult;
use bytes::BytesMut;

/// Prompt written before each read.
pub const PROMPT: &[u8] = b"?> ";

/// Line terminator for everything the server writes.
pub const CRLF: &[u8] = b"\r\n";

/// Stand-in for a line that failed UTF-8 decoding.
const UNDECODABLE: &str = "\0";

/// A decoded client line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    /// Blank line; the client just gets a new prompt.
    Empty,
    /// Control character or undecodable bytes; close the connection.
    Terminate,
    /// Text to look up.
    Lookup(String),
}

impl Query {
    /// Decode and classify one raw input line (terminator included or not).
    pub fn decode(raw: &[u8]) -> Self {
        let text = std::str::from_utf8(raw).unwrap_or(UNDECODABLE);
        Self::classify(text.trim())
    }

    fn classify(text: &str) -> Self {
        match text.chars().next() {
            None => Query::Empty,
            Some(first) if (first as u32) < 32 => Query::Terminate,
            Some(_) => Query::Lookup(text.to_string()),
        }
    }
}

/// Encode result lines followed by the status line, each CRLF-terminated.
pub fn encode_response(result: &QueryResult) -> BytesMut {
    let size = result
        .lines
        .iter()
        .map(|line| line.len() + CRLF.len())
        .sum::<usize>()
        + result.status.len()
        + CRLF.len();

    let mut out = BytesMut::with_capacity(size);
    for line in &result.lines {
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(CRLF);
    }
    out.extend_from_slice(result.status.as_bytes());
    out.extend_from_slice(CRLF);
    out
}
