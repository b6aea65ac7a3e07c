//! Line-framed request/response protocol spoken between probe and server.
//!
//! ```text
//! Request:  CALL <token>\r\n
//!           QUIT\r\n
//!
//! Response: OK <length>\r\n<body of length bytes>\r\n
//!           ERROR <code> <length>\r\n<message of length bytes>\r\n
//! ```
//!
//! Example:
//!
//! ```text
//! Request:  CALL errLength=5\r\n
//! Response: ERROR 9 5\r\nthis \r\n
//! ```
//!
//! An error frame's header line and message together form its "header
//! list", the part a client bounds with its header size limit.

use crate::status::{Code, Status};
use bytes::{Bytes, BytesMut};
use std::str;

/// Maximum length of a request or response header line
pub const MAX_LINE_LENGTH: usize = 1024;

const CRLF: &[u8] = b"\r\n";

/// Parsed client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Invoke the error method with a request token
    Call { token: String },
    /// Close the connection
    Quit,
}

impl Request {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Request::Call { token } => {
                out.reserve(5 + token.len() + CRLF.len());
                out.extend_from_slice(b"CALL ");
                out.extend_from_slice(token.as_bytes());
            }
            Request::Quit => out.extend_from_slice(b"QUIT"),
        }
        out.extend_from_slice(CRLF);
    }
}

/// Parsed server response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Successful call with its reply body
    Ok(Bytes),
    /// Failed call
    Error(Status),
}

impl Response {
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Response::Ok(body) => {
                let header = format!("OK {}\r\n", body.len());
                out.reserve(header.len() + body.len() + CRLF.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(body);
            }
            Response::Error(status) => {
                let message = status.message().as_bytes();
                let header = error_header(status.code(), message.len());
                out.reserve(header.len() + message.len() + CRLF.len());
                out.extend_from_slice(header.as_bytes());
                out.extend_from_slice(message);
            }
        }
        out.extend_from_slice(CRLF);
    }
}

/// Header line of a response, parsed before its body arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub code: Code,
    /// Body or message length in bytes
    pub length: usize,
    /// Bytes used by the header line including its terminator
    pub header_len: usize,
}

impl ResponseHeader {
    /// Size of the whole frame on the wire.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.length + CRLF.len()
    }

    /// Header line plus message.
    pub fn header_list_size(&self) -> usize {
        self.header_len + self.length
    }
}

/// Exact wire size of an error frame carrying `length` message bytes.
pub fn error_frame_len(code: Code, length: usize) -> usize {
    error_header(code, length).len() + length + CRLF.len()
}

fn error_header(code: Code, length: usize) -> String {
    format!("ERROR {} {}\r\n", code.as_u32(), length)
}

/// Protocol parsing errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Request line does not start with a known command
    UnknownCommand(String),
    /// Header line is not well formed
    InvalidHeader(String),
    /// Length field is not a number
    InvalidLength(String),
    /// Body is not followed by \r\n
    MissingTerminator,
    /// No line terminator within the allowed line length
    LineTooLong(usize),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::UnknownCommand(cmd) => write!(f, "unknown command: {}", cmd),
            ParseError::InvalidHeader(msg) => write!(f, "invalid header: {}", msg),
            ParseError::InvalidLength(len) => write!(f, "invalid length: {}", len),
            ParseError::MissingTerminator => write!(f, "frame body is not terminated by CRLF"),
            ParseError::LineTooLong(len) => {
                write!(f, "line of {} bytes exceeds limit {}", len, MAX_LINE_LENGTH)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse result
#[derive(Debug)]
pub enum ParseResult<T> {
    /// Successfully parsed value with bytes consumed
    Complete(T, usize),
    /// Need more data
    Incomplete,
    /// Protocol error
    Error(ParseError),
}

/// Parse a request from the input buffer.
pub fn parse_request(input: &[u8]) -> ParseResult<Request> {
    let line = match read_line(input) {
        Ok(Some(line)) => line,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };
    let consumed = line.len() + CRLF.len();

    if line.eq_ignore_ascii_case("QUIT") {
        return ParseResult::Complete(Request::Quit, consumed);
    }

    let (command, token) = line.split_once(' ').unwrap_or((line, ""));
    if command.eq_ignore_ascii_case("CALL") {
        let request = Request::Call {
            token: token.to_string(),
        };
        ParseResult::Complete(request, consumed)
    } else {
        ParseResult::Error(ParseError::UnknownCommand(command.to_string()))
    }
}

/// Parse only the header line of a response.
///
/// Lets a reader decide whether it is willing to buffer the body before
/// reading it.
pub fn parse_response_header(input: &[u8]) -> ParseResult<ResponseHeader> {
    let line = match read_line(input) {
        Ok(Some(line)) => line,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };
    let header_len = line.len() + CRLF.len();

    let parts: Vec<&str> = line.split(' ').collect();
    let (code, length) = match parts.as_slice() {
        ["OK", length] => (Code::Ok, *length),
        ["ERROR", code, length] => match code.parse::<u32>() {
            Ok(0) => {
                return ParseResult::Error(ParseError::InvalidHeader(
                    "error frame with OK code".to_string(),
                ))
            }
            Ok(code) => (Code::from_u32(code), *length),
            Err(_) => {
                return ParseResult::Error(ParseError::InvalidHeader(format!(
                    "invalid code: {}",
                    code
                )))
            }
        },
        _ => return ParseResult::Error(ParseError::InvalidHeader(line.to_string())),
    };

    // The whole frame size must be representable
    let length = match length.parse::<usize>() {
        Ok(n) if header_len.checked_add(n).and_then(|n| n.checked_add(CRLF.len())).is_some() => n,
        _ => return ParseResult::Error(ParseError::InvalidLength(length.to_string())),
    };

    ParseResult::Complete(
        ResponseHeader {
            code,
            length,
            header_len,
        },
        header_len,
    )
}

/// Parse a complete response frame.
pub fn parse_response(input: &[u8]) -> ParseResult<Response> {
    let header = match parse_response_header(input) {
        ParseResult::Complete(header, _) => header,
        ParseResult::Incomplete => return ParseResult::Incomplete,
        ParseResult::Error(e) => return ParseResult::Error(e),
    };

    let frame_len = header.frame_len();
    if input.len() < frame_len {
        return ParseResult::Incomplete;
    }

    let body_end = header.header_len + header.length;
    if &input[body_end..frame_len] != CRLF {
        return ParseResult::Error(ParseError::MissingTerminator);
    }

    let body = &input[header.header_len..body_end];
    let response = match header.code {
        Code::Ok => Response::Ok(Bytes::copy_from_slice(body)),
        code => Response::Error(Status::new(code, String::from_utf8_lossy(body))),
    };

    ParseResult::Complete(response, frame_len)
}

/// Find the first line, excluding its terminator.
fn read_line(input: &[u8]) -> Result<Option<&str>, ParseError> {
    let line_end = match find_crlf(input) {
        Some(pos) => pos,
        None if input.len() > MAX_LINE_LENGTH => return Err(ParseError::LineTooLong(input.len())),
        None => return Ok(None),
    };

    if line_end > MAX_LINE_LENGTH {
        return Err(ParseError::LineTooLong(line_end));
    }

    str::from_utf8(&input[..line_end])
        .map(Some)
        .map_err(|_| ParseError::InvalidHeader("invalid UTF-8 in line".to_string()))
}

/// Find \r\n within the first `MAX_LINE_LENGTH` bytes of a line, returning
/// the position of \r.
pub fn find_crlf(buffer: &[u8]) -> Option<usize> {
    let window = &buffer[..buffer.len().min(MAX_LINE_LENGTH + CRLF.len())];
    window.windows(2).position(|w| w == CRLF)
}
