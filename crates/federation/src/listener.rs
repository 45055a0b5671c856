//! Local HTTP callback listener.
//!
//! Browser-based flows redirect the identity provider back to a loopback
//! listener. The listener binds a configured port (0 = ephemeral), exposes a
//! single fixed redirect path, hands the parameters of the first matching
//! request to the waiting flow over a oneshot channel, and is always stopped
//! after a result or timeout — the accept task is aborted on every exit path.

use crate::core::{FederationError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// The only path the listener answers with a result.
pub const CALLBACK_PATH: &str = "/wharf/callback";

/// Upper bound on request head (request line + headers).
const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Upper bound on a form-encoded callback body.
const MAX_BODY_BYTES: usize = 64 * 1024;

const RESPONSE_OK: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n\
<html><body><h2>Sign-in complete.</h2><p>You can close this window and return to your application.</p></body></html>";
const RESPONSE_NOT_FOUND: &str =
    "HTTP/1.1 404 Not Found\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// A bound callback listener awaiting one redirect.
pub struct CallbackListener {
    port: u16,
    rx: Option<oneshot::Receiver<HashMap<String, String>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl CallbackListener {
    /// Bind the loopback listener; `port` 0 picks an ephemeral port.
    pub async fn bind(port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let port = listener.local_addr()?.port();
        let (tx, rx) = oneshot::channel();

        let handle = tokio::spawn(accept_loop(listener, tx));
        debug!(port, "callback listener bound");

        Ok(Self {
            port,
            rx: Some(rx),
            handle,
        })
    }

    /// The bound port (for composing the redirect URI).
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Block until the callback arrives or `timeout` elapses.
    ///
    /// The accept task is stopped regardless of outcome.
    pub async fn wait(mut self, timeout: Duration) -> Result<HashMap<String, String>> {
        let Some(rx) = self.rx.take() else {
            return Err(FederationError::Unexpected(
                "callback listener already consumed".into(),
            ));
        };
        let result = tokio::time::timeout(timeout, rx).await;

        match result {
            Ok(Ok(params)) => Ok(params),
            Ok(Err(_)) => Err(FederationError::Unexpected(
                "callback listener stopped before a callback arrived".into(),
            )),
            Err(_) => Err(FederationError::Timeout(
                "identity provider callback".into(),
            )),
        }
    }
}

// The accept task must not outlive the flow that bound the port, even when
// the flow errors out before calling `wait`.
impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn accept_loop(listener: TcpListener, tx: oneshot::Sender<HashMap<String, String>>) {
    let mut tx = Some(tx);
    loop {
        let Ok((stream, peer)) = listener.accept().await else {
            return;
        };
        debug!(%peer, "callback connection accepted");

        match handle_connection(stream).await {
            Ok(Some(params)) => {
                if let Some(tx) = tx.take() {
                    let _ = tx.send(params);
                }
                return;
            }
            Ok(None) => {} // wrong path, keep accepting
            Err(e) => warn!(error = %e, "discarding malformed callback request"),
        }
    }
}

/// Parse one HTTP/1.1 request; `Some(params)` when it hit the callback path.
async fn handle_connection(stream: TcpStream) -> Result<Option<HashMap<String, String>>> {
    let mut reader = BufReader::new(stream);

    let mut head = Vec::with_capacity(1024);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_BYTES {
            return Err(FederationError::ProtocolParse(
                "callback request head too large".into(),
            ));
        }
        if reader.read(&mut byte).await? == 0 {
            return Err(FederationError::ProtocolParse(
                "callback connection closed mid-request".into(),
            ));
        }
        head.push(byte[0]);
    }

    let head_text = String::from_utf8_lossy(&head);
    let mut lines = head_text.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target.as_str(), None),
    };

    if path != CALLBACK_PATH {
        let mut stream = reader.into_inner();
        let _ = stream.write_all(RESPONSE_NOT_FOUND.as_bytes()).await;
        return Ok(None);
    }

    let params = match method.as_str() {
        "GET" => parse_params(query.unwrap_or_default()),
        "POST" => {
            if content_length > MAX_BODY_BYTES {
                return Err(FederationError::ProtocolParse(
                    "callback body too large".into(),
                ));
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).await?;
            parse_params(&String::from_utf8_lossy(&body))
        }
        other => {
            return Err(FederationError::ProtocolParse(format!(
                "unsupported callback method {other}"
            )));
        }
    };

    let mut stream = reader.into_inner();
    let _ = stream.write_all(RESPONSE_OK.as_bytes()).await;
    let _ = stream.shutdown().await;

    Ok(Some(params))
}

fn parse_params(encoded: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(encoded.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    async fn send_raw(port: u16, request: &str) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        // Read the response so the listener finishes its write.
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
    }

    #[tokio::test]
    async fn get_callback_query_parameters() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let port = listener.port();

        tokio::spawn(async move {
            send_raw(
                port,
                "GET /wharf/callback?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n",
            )
            .await;
        });

        let params = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(params.get("code").map(String::as_str), Some("abc123"));
        assert_eq!(params.get("state").map(String::as_str), Some("xyz"));
    }

    #[tokio::test]
    async fn post_callback_form_body() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let port = listener.port();

        let body = "SAMLResponse=PHNhbWw%2BZm9vPC9zYW1sPg%3D%3D";
        let request = format!(
            "POST /wharf/callback HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        tokio::spawn(async move { send_raw(port, &request).await });

        let params = listener.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            params.get("SAMLResponse").map(String::as_str),
            Some("PHNhbWw+Zm9vPC9zYW1sPg==")
        );
    }

    #[tokio::test]
    async fn wrong_path_keeps_listening_until_timeout() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let port = listener.port();

        tokio::spawn(async move {
            send_raw(port, "GET /favicon.ico HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        });

        let err = listener.wait(Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, FederationError::Timeout(_)));
    }

    #[tokio::test]
    async fn dropping_the_listener_releases_the_port() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let port = listener.port();
        drop(listener);

        // Abort is asynchronous; the port must refuse connections shortly.
        for _ in 0..50 {
            if TcpStream::connect(("127.0.0.1", port)).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("accept task kept the port open after drop");
    }

    #[tokio::test]
    async fn timeout_without_any_request() {
        let listener = CallbackListener::bind(0).await.unwrap();
        let err = listener.wait(Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, FederationError::Timeout(_)));
    }
}
