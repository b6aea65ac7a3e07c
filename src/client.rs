//! Client side of the error protocol.
//!
//! A [`Client`] owns at most one connection and runs one call at a time on
//! it. Transport failures drop the connection; the next call dials again.

use crate::protocol::{self, ParseResult, Request, Response};
use crate::status::{Code, Status};
use bytes::{Buf, Bytes, BytesMut};
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Header list limit used when none is configured (16 MB)
pub const DEFAULT_MAX_HEADER_LIST_SIZE: usize = 16 << 20;

/// Largest reply body accepted from the server (4 MB)
pub const MAX_BODY_SIZE: usize = 4 << 20;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// How a client establishes and uses its connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    /// Connect while dialing instead of on the first call
    pub with_block: bool,
    /// Bound on each connection attempt
    pub dial_timeout: Option<Duration>,
    /// TCP keepalive idle time
    pub keepalive_time: Option<Duration>,
    /// Largest error frame header list accepted from the server
    pub max_header_list_size: Option<usize>,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            with_block: true,
            dial_timeout: Some(Duration::from_secs(60)),
            keepalive_time: None,
            max_header_list_size: None,
        }
    }
}

impl DialOptions {
    /// Effective header list limit
    pub fn header_limit(&self) -> usize {
        self.max_header_list_size
            .unwrap_or(DEFAULT_MAX_HEADER_LIST_SIZE)
    }
}

struct Connection {
    stream: TcpStream,
    buffer: BytesMut,
}

impl Connection {
    /// Read more data into the buffer, failing on EOF.
    async fn fill(&mut self) -> io::Result<()> {
        self.buffer.reserve(BUFFER_SIZE);
        let n = self.stream.read_buf(&mut self.buffer).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ));
        }
        Ok(())
    }
}

/// Why a call ended without a server response
enum CallFailure {
    Io(io::Error),
    Rejected(Status),
}

impl From<io::Error> for CallFailure {
    fn from(e: io::Error) -> Self {
        CallFailure::Io(e)
    }
}

/// Connection to one server address
pub struct Client {
    addr: String,
    options: DialOptions,
    conn: Mutex<Option<Connection>>,
    /// Set once a dial succeeds, cleared when the connection goes away
    connected: AtomicBool,
}

impl Client {
    /// Create a client that connects on first use.
    pub fn new(addr: &str, options: DialOptions) -> Self {
        Client {
            addr: addr.to_string(),
            options,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    /// Create a client, connecting right away when `with_block` is set.
    pub async fn dial(addr: &str, options: DialOptions) -> io::Result<Self> {
        let client = Client::new(addr, options);
        if client.options.with_block {
            client.connect().await?;
        }
        Ok(client)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// Establish the connection if there is none.
    pub async fn connect(&self) -> io::Result<()> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.open().await?);
            self.connected.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Whether an open connection is available, without waiting.
    ///
    /// A connection busy with a call counts as ready, a dial in progress does
    /// not. A connection the server has closed is discarded.
    pub fn is_ready(&self) -> bool {
        let mut guard = match self.conn.try_lock() {
            Ok(guard) => guard,
            Err(_) => return self.connected.load(Ordering::Acquire),
        };

        let open = match guard.as_mut() {
            None => return false,
            Some(conn) => match conn.stream.try_read_buf(&mut conn.buffer) {
                Ok(0) => false,
                Ok(_) => true,
                Err(e) => e.kind() == io::ErrorKind::WouldBlock,
            },
        };

        if !open {
            debug!(addr = %self.addr, "Connection closed");
            *guard = None;
            self.connected.store(false, Ordering::Release);
        }
        open
    }

    /// Send one request token.
    ///
    /// Returns the reply body on success, the server's status when the call
    /// fails remotely, `Internal` for a malformed or oversized error frame,
    /// `ResourceExhausted` for an oversized reply body, and `Unavailable` (or
    /// `DeadlineExceeded` for dial timeouts) on transport errors.
    pub async fn call(&self, token: &str) -> Result<Bytes, Status> {
        if token.contains(['\r', '\n']) {
            return Err(Status::new(
                Code::InvalidArgument,
                "request token must not contain line breaks",
            ));
        }

        let mut guard = self.conn.lock().await;
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => {
                let conn = self.open().await.map_err(|e| transport_status(&e))?;
                self.connected.store(true, Ordering::Release);
                conn
            }
        };

        let result = exchange(&mut conn, token, self.options.header_limit()).await;
        if result.is_err() {
            self.connected.store(false, Ordering::Release);
        }
        match result {
            Ok(response) => {
                *guard = Some(conn);
                match response {
                    Response::Ok(body) => Ok(body),
                    Response::Error(status) => Err(status),
                }
            }
            Err(CallFailure::Io(e)) => {
                debug!(addr = %self.addr, error = %e, "Dropping connection");
                Err(transport_status(&e))
            }
            Err(CallFailure::Rejected(status)) => {
                debug!(addr = %self.addr, %status, "Dropping connection");
                Err(status)
            }
        }
    }

    /// Say goodbye to the server and shut the connection down.
    pub async fn close(&self) -> io::Result<()> {
        let conn = self.conn.lock().await.take();
        self.connected.store(false, Ordering::Release);
        if let Some(mut conn) = conn {
            let mut out = BytesMut::new();
            Request::Quit.encode(&mut out);
            conn.stream.write_all(&out).await?;
            conn.stream.shutdown().await?;
        }
        Ok(())
    }

    async fn open(&self) -> io::Result<Connection> {
        let connect = TcpStream::connect(self.addr.as_str());
        let stream = match self.options.dial_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("dial {} timed out after {:?}", self.addr, timeout),
                    )
                })??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;

        if let Some(time) = self.options.keepalive_time {
            let keepalive = TcpKeepalive::new().with_time(time);
            SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        debug!(addr = %self.addr, "Connected");
        Ok(Connection {
            stream,
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        })
    }
}

/// Write one call and read its response.
async fn exchange(
    conn: &mut Connection,
    token: &str,
    header_limit: usize,
) -> Result<Response, CallFailure> {
    let mut out = BytesMut::new();
    Request::Call {
        token: token.to_string(),
    }
    .encode(&mut out);
    conn.stream.write_all(&out).await?;

    let header = loop {
        match protocol::parse_response_header(&conn.buffer) {
            ParseResult::Complete(header, _) => break header,
            ParseResult::Incomplete => conn.fill().await?,
            ParseResult::Error(e) => return Err(malformed(e)),
        }
    };
    trace!(code = %header.code, length = header.length, "Response header");

    // Error messages travel in the header list, reply bodies do not
    if header.code != Code::Ok && header.header_list_size() > header_limit {
        return Err(CallFailure::Rejected(Status::new(
            Code::Internal,
            format!(
                "peer header list size {} exceeded limit {}",
                header.header_list_size(),
                header_limit
            ),
        )));
    }
    if header.code == Code::Ok && header.length > MAX_BODY_SIZE {
        return Err(CallFailure::Rejected(Status::new(
            Code::ResourceExhausted,
            format!(
                "received message larger than max ({} vs. {})",
                header.length, MAX_BODY_SIZE
            ),
        )));
    }

    while conn.buffer.len() < header.frame_len() {
        conn.fill().await?;
    }

    match protocol::parse_response(&conn.buffer) {
        ParseResult::Complete(response, consumed) => {
            conn.buffer.advance(consumed);
            Ok(response)
        }
        ParseResult::Incomplete => Err(CallFailure::Rejected(Status::new(
            Code::Internal,
            "truncated response",
        ))),
        ParseResult::Error(e) => Err(malformed(e)),
    }
}

fn malformed(e: protocol::ParseError) -> CallFailure {
    CallFailure::Rejected(Status::new(
        Code::Internal,
        format!("malformed response: {}", e),
    ))
}

fn transport_status(e: &io::Error) -> Status {
    let code = match e.kind() {
        io::ErrorKind::TimedOut => Code::DeadlineExceeded,
        _ => Code::Unavailable,
    };
    Status::new(code, format!("connection error: {}", e))
}
