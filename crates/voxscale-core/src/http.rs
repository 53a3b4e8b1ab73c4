//! Minimal HTTP/1 JSON client for collaborator endpoints.
//!
//! Queue, telemetry, fleet, and fallback collaborators all speak plain
//! JSON over HTTP/1.1. Each call opens a fresh connection and is bounded
//! by the caller's timeout.

use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("connect to {address} failed: {reason}")]
    Connect { address: String, reason: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("{uri} returned status {status}")]
    Status { uri: String, status: u16 },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

/// GET `path` and decode the JSON response.
pub async fn get_json<T: DeserializeOwned>(
    address: &str,
    path: &str,
    timeout: Duration,
) -> Result<T, HttpError> {
    let body = send(Method::GET, address, path, None, timeout).await?;
    serde_json::from_slice(&body).map_err(|e| HttpError::Decode(e.to_string()))
}

/// POST a JSON body and return the raw response body.
pub async fn post_json<B: Serialize>(
    address: &str,
    path: &str,
    body: &B,
    timeout: Duration,
) -> Result<Bytes, HttpError> {
    let payload = serde_json::to_vec(body).map_err(|e| HttpError::Request(e.to_string()))?;
    send(Method::POST, address, path, Some(payload), timeout).await
}

/// Send a request and return the body of a 2xx response.
pub async fn send(
    method: Method,
    address: &str,
    path: &str,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<Bytes, HttpError> {
    let uri = format!("http://{address}{path}");
    let request_uri = uri.clone();

    let exchange = async move {
        let uri = request_uri;
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| HttpError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "voxscale/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| HttpError::Request(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %uri, "collaborator returned non-2xx");
            return Err(HttpError::Status {
                uri: uri.clone(),
                status: status.as_u16(),
            });
        }

        let collected = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        Ok(collected.to_bytes())
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%uri, "collaborator request timed out");
            Err(HttpError::Timeout(timeout))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_port_is_connect_error() {
        let result = send(
            Method::GET,
            "127.0.0.1:1",
            "/queues/q",
            None,
            Duration::from_millis(200),
        )
        .await;
        assert!(matches!(
            result,
            Err(HttpError::Connect { .. }) | Err(HttpError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn get_json_decodes_response() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            let body = r#"{"depth":7}"#;
            let resp = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(resp.as_bytes()).await.unwrap();
        });

        let value: serde_json::Value =
            get_json(&addr.to_string(), "/queues/q", Duration::from_secs(2))
                .await
                .unwrap();
        assert_eq!(value["depth"], 7);
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await.unwrap();
            socket
                .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let result = send(
            Method::GET,
            &addr.to_string(),
            "/queues/q",
            None,
            Duration::from_secs(2),
        )
        .await;
        assert!(matches!(result, Err(HttpError::Status { status: 503, .. })));
    }
}
