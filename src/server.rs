//! TCP server answering every call with an error of the requested size.
//!
//! Handles incoming connections, parses requests, and turns each request
//! token into an error frame.

use crate::config::ServerSettings;
use crate::errrequest;
use crate::protocol::{self, ParseError, ParseResult, Request, Response};
use crate::status::{Code, Status};
use bytes::{Buf, BytesMut};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn};

/// Read buffer size
const BUFFER_SIZE: usize = 4 * 1024;

const LISTEN_BACKLOG: i32 = 1024;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server instance
pub struct Server {
    settings: Arc<ServerSettings>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(settings: ServerSettings) -> Self {
        let connection_limit = Arc::new(Semaphore::new(settings.max_connections));

        Server {
            settings: Arc::new(settings),
            connection_limit,
        }
    }

    /// Bind the configured listen address.
    pub fn bind(&self) -> io::Result<TcpListener> {
        bind_listener(&self.settings.listen)
    }

    /// Bind and begin accepting connections
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = self.bind()?;
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let local_addr = listener.local_addr()?;
        info!(
            address = %local_addr,
            response_sleep_ms = self.settings.response_sleep.as_millis() as u64,
            max_error_length = self.settings.max_error_length,
            "Server listening"
        );

        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let settings = Arc::clone(&self.settings);

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, settings).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Bind a listening socket with address reuse enabled.
pub fn bind_listener(listen: &str) -> io::Result<TcpListener> {
    let addr: SocketAddr = listen.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {}", listen),
        )
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    TcpListener::from_std(socket.into())
}

/// Build the response for one call token.
///
/// Decode failures become `InvalidArgument`, lengths above the server limit
/// become `ResourceExhausted`, everything else fails with
/// `FailedPrecondition` carrying the generated message.
pub fn respond(token: &str, max_error_length: usize) -> Response {
    let err_length = match errrequest::parse(token) {
        Ok(err_length) => err_length,
        Err(e) => {
            debug!(error = %e, "Rejecting request token");
            return Response::Error(Status::new(Code::InvalidArgument, e.to_string()));
        }
    };

    if err_length > max_error_length {
        warn!(err_length, max_error_length, "Requested error length over limit");
        return Response::Error(Status::new(
            Code::ResourceExhausted,
            format!(
                "error length {} exceeds server limit {}",
                err_length, max_error_length
            ),
        ));
    }

    let message = errrequest::fill(err_length);
    info!(len = message.len(), "Returning error");
    Response::Error(Status::new(Code::FailedPrecondition, message))
}

/// Handle a single client connection
async fn handle_connection<S>(mut stream: S, settings: Arc<ServerSettings>) -> Result<(), BoxError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);
    let mut out = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        match protocol::parse_request(&buffer) {
            ParseResult::Complete(Request::Call { token }, consumed) => {
                buffer.advance(consumed);
                trace!(%token, "Processing call");

                if !settings.response_sleep.is_zero() {
                    tokio::time::sleep(settings.response_sleep).await;
                }

                out.clear();
                respond(&token, settings.max_error_length).encode(&mut out);
                stream.write_all(&out).await?;
            }

            ParseResult::Complete(Request::Quit, _) => {
                trace!("Client quit");
                return Ok(());
            }

            ParseResult::Incomplete => {
                let n = stream.read_buf(&mut buffer).await?;
                if n == 0 {
                    trace!("Connection closed by client");
                    return Ok(());
                }
            }

            ParseResult::Error(e) => {
                warn!(error = %e, "Parse error");
                let code = match e {
                    ParseError::UnknownCommand(_) => Code::Unimplemented,
                    _ => Code::InvalidArgument,
                };
                out.clear();
                Response::Error(Status::new(code, e.to_string())).encode(&mut out);
                stream.write_all(&out).await?;

                // An unterminated line leaves nothing to resynchronize on
                match find_recovery_point(&buffer) {
                    Some(pos) if !matches!(e, ParseError::LineTooLong(_)) => buffer.advance(pos),
                    _ => return Ok(()),
                }
            }
        }
    }
}

/// Find a recovery point after a parse error (next \r\n)
fn find_recovery_point(buffer: &[u8]) -> Option<usize> {
    protocol::find_crlf(buffer).map(|pos| pos + 2)
}

/// Bind a loopback server on an ephemeral port and serve it in the background.
#[cfg(test)]
pub(crate) fn spawn_test_server(max_error_length: usize) -> String {
    let server = Server::new(ServerSettings {
        listen: "127.0.0.1:0".to_string(),
        response_sleep: std::time::Duration::ZERO,
        max_error_length,
        max_connections: 64,
    });
    let listener = server.bind().unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::io::Builder;

    fn settings() -> Arc<ServerSettings> {
        Arc::new(ServerSettings {
            listen: "127.0.0.1:0".to_string(),
            response_sleep: Duration::ZERO,
            max_error_length: 1024,
            max_connections: 1,
        })
    }

    fn frame(code: Code, message: &str) -> Vec<u8> {
        let mut out = BytesMut::new();
        Response::Error(Status::new(code, message)).encode(&mut out);
        out.to_vec()
    }

    #[test]
    fn test_respond_generates_error() {
        match respond("errLength=70", 1024) {
            Response::Error(status) => {
                assert_eq!(status.code(), Code::FailedPrecondition);
                assert_eq!(status.message(), &errrequest::FILLER[..70]);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_respond_invalid_token() {
        for token in ["garbage", "errLength=", "errLength=0", "errLength=-5", "errLength=abc"] {
            match respond(token, 1024) {
                Response::Error(status) => {
                    assert_eq!(status.code(), Code::InvalidArgument);
                    assert_eq!(
                        status.message(),
                        errrequest::parse(token).unwrap_err().to_string()
                    );
                }
                other => panic!("unexpected: {:?}", other),
            }
        }
    }

    #[test]
    fn test_respond_over_limit() {
        match respond("errLength=1025", 1024) {
            Response::Error(status) => {
                assert_eq!(status.code(), Code::ResourceExhausted);
                assert_eq!(status.message(), "error length 1025 exceeds server limit 1024");
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            respond("errLength=1024", 1024),
            Response::Error(status) if status.message().len() == 1024
        ));
    }

    #[test]
    fn test_find_recovery_point() {
        let buffer = b"garbage\r\nnext command\r\n";
        assert_eq!(find_recovery_point(buffer), Some(9));

        let buffer = b"no crlf here";
        assert_eq!(find_recovery_point(buffer), None);

        let mut buffer = vec![b'x'; protocol::MAX_LINE_LENGTH + 10];
        buffer.extend_from_slice(b"\r\n");
        assert_eq!(find_recovery_point(&buffer), None);
    }

    #[tokio::test]
    async fn test_handle_calls() {
        let stream = Builder::new()
            .read(b"CALL errLength=1\r\nCALL errLength=0\r\n")
            .write(b"ERROR 9 1\r\nt\r\n")
            .write(b"ERROR 3 17\r\ninvalid length: 0\r\n")
            .build();

        handle_connection(stream, settings()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_split_request() {
        let stream = Builder::new()
            .read(b"CALL errLen")
            .read(b"gth=5\r\n")
            .write(&frame(Code::FailedPrecondition, "this "))
            .build();

        handle_connection(stream, settings()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_unknown_command_then_quit() {
        let stream = Builder::new()
            .read(b"PING\r\nQUIT\r\nCALL errLength=1\r\n")
            .write(&frame(Code::Unimplemented, "unknown command: PING"))
            .build();

        handle_connection(stream, settings()).await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_line_too_long() {
        let line = vec![b'x'; 1100];
        let stream = Builder::new()
            .read(&line)
            .write(&frame(
                Code::InvalidArgument,
                "line of 1100 bytes exceeds limit 1024",
            ))
            .build();

        handle_connection(stream, settings()).await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_listener() {
        let listener = bind_listener("127.0.0.1:0").unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);

        assert!(bind_listener("not an address").is_err());
    }
}
