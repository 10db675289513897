/*!
 * HTTP transport for REST devices.
 *
 * The request frame is text: `METHOD PATH\n` followed by an optional
 * form-encoded body. The request runs on `send`; the response body is
 * buffered, with line breaks folded into spaces and a single `\n` appended,
 * so that `receive_until(Delimiter::Byte(b'\n'))` returns exactly one body.
 */
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{Client, Method};
use tracing::trace;

use super::{take_frame, Delimiter, Transport};
use crate::error::{ConnectError, TimeoutError, TransportError};

/// Terminator appended to each buffered response body
pub const BODY_END: u8 = b'\n';

/// An HTTP endpoint reached with reqwest
#[derive(Debug)]
pub struct HttpTransport {
    base: String,
    client: Option<Client>,
    timeout: Duration,
    buffer: BytesMut,
}

impl HttpTransport {
    /// Create a transport for `http://host:port`
    pub fn new(host: &str, port: u16, timeout: Duration) -> Result<Self, ConnectError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConnectError::NotFound(format!("{}:{}: {}", host, port, e)))?;

        Ok(Self {
            base: format!("http://{}:{}", host, port),
            client: Some(client),
            timeout,
            buffer: BytesMut::new(),
        })
    }
}

/// Split a request frame into method, path and body
fn parse_request(frame: &[u8]) -> Result<(Method, &str, &str), TransportError> {
    let text = std::str::from_utf8(frame)
        .map_err(|_| TransportError::Unsupported("request frame is not UTF-8".to_string()))?;
    let (line, body) = text.split_once('\n').unwrap_or((text, ""));
    let (method, path) = line
        .split_once(' ')
        .ok_or_else(|| TransportError::Unsupported(format!("bad request line: {}", line)))?;
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| TransportError::Unsupported(format!("bad method: {}", method)))?;
    Ok((method, path.trim(), body))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let client = self.client.as_ref().ok_or(TransportError::Closed)?;
        let (method, path, body) = parse_request(bytes)?;
        let url = format!("{}{}", self.base, path);

        let mut request = client.request(method, &url);
        if !body.is_empty() {
            request = request
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(body.to_string());
        }

        let response = request.send().await.map_err(|e| self.map_error(e))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| self.map_error(e))?;
        trace!("{} -> {}", url, status);

        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        let folded: String = text
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();
        self.buffer.extend_from_slice(folded.trim().as_bytes());
        self.buffer.extend_from_slice(&[BODY_END]);
        Ok(())
    }

    async fn receive_until(
        &mut self,
        delimiter: Delimiter,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.client.is_none() {
            return Err(TransportError::Closed);
        }
        take_frame(&mut self.buffer, delimiter).ok_or_else(|| {
            TransportError::Timeout(TimeoutError {
                waited: timeout,
                partial: self.buffer.split().to_vec(),
            })
        })
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.buffer.clear();
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.client = None;
        Ok(())
    }

    fn describe(&self) -> String {
        self.base.clone()
    }
}

impl HttpTransport {
    fn map_error(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(TimeoutError {
                waited: self.timeout,
                partial: Vec::new(),
            })
        } else {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                err.to_string(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::error::DriverError;

    /// Answer one request with a fixed status line and body
    async fn serve_once(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            let reply = format!(
                "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(reply.as_bytes()).await.unwrap();
        });
        port
    }

    #[test]
    fn test_parse_request() {
        let (method, path, body) =
            parse_request(b"PUT /api/v1/telescope/0/park\nClientID=1&ClientTransactionID=4")
                .unwrap();
        assert_eq!(method, Method::PUT);
        assert_eq!(path, "/api/v1/telescope/0/park");
        assert_eq!(body, "ClientID=1&ClientTransactionID=4");

        let (method, _, body) = parse_request(b"GET /api/v1/telescope/0/atpark?ClientID=1").unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(body, "");

        assert!(parse_request(b"nonsense").is_err());
    }

    #[tokio::test]
    async fn test_error_status_classes() {
        let port = serve_once("400 Bad Request", "Declination 95 out of range").await;
        let mut transport = HttpTransport::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let err = transport
            .send(b"GET /api/v1/telescope/0/declination?ClientID=1\n")
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Http { status: 400, .. }));
        assert!(matches!(DriverError::from(err), DriverError::Rejected(_)));

        let port = serve_once("500 Internal Server Error", "driver crashed").await;
        let mut transport = HttpTransport::new("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        let err = transport
            .send(b"GET /api/v1/telescope/0/declination?ClientID=1\n")
            .await
            .unwrap_err();
        assert!(matches!(
            DriverError::from(err),
            DriverError::Transport(TransportError::Http { status: 500, .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_without_request_times_out() {
        let mut transport = HttpTransport::new("127.0.0.1", 11111, Duration::from_secs(1)).unwrap();
        let err = transport
            .receive_until(Delimiter::Byte(BODY_END), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));

        transport.close().await.unwrap();
        assert!(matches!(
            transport.send(b"GET /x\n").await,
            Err(TransportError::Closed)
        ));
    }
}
