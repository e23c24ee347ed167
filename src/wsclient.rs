//! Outbound WebSocket plumbing shared by the publisher and the attach
//! client: endpoint normalization, dialing with bearer or share-token
//! credentials, and frame read/write over the socket.

use anyhow::{bail, Context, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::config::WRITE_TIMEOUT;
use crate::protocol::wire::{decode_frame, encode_frame};
use crate::protocol::Frame;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
pub type WsSink = SplitSink<WsStream, Message>;
pub type WsSource = SplitStream<WsStream>;

/// Map an `http(s)`/`ws(s)` endpoint to its WebSocket base URL.
pub fn ws_base(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).context("endpoint must be a valid URL")?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => bail!("unsupported scheme {other:?}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("failed to set scheme"))?;
    Ok(url)
}

/// The matching HTTP base for REST calls against the same endpoint.
pub fn http_base(endpoint: &str) -> Result<Url> {
    let mut url = Url::parse(endpoint).context("endpoint must be a valid URL")?;
    let scheme = match url.scheme() {
        "https" | "wss" => "https",
        "http" | "ws" => "http",
        other => bail!("unsupported scheme {other:?}"),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow::anyhow!("failed to set scheme"))?;
    Ok(url)
}

pub enum Credentials<'a> {
    Bearer(&'a str),
    ShareToken(&'a str),
}

/// Dial `path` under the endpoint's WebSocket base.
pub async fn connect(endpoint: &str, path: &str, credentials: Credentials<'_>) -> Result<WsStream> {
    let mut url = ws_base(endpoint)?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| anyhow::anyhow!("endpoint cannot be a base URL"))?;
        segments.pop_if_empty();
        for segment in path.trim_matches('/').split('/') {
            segments.push(segment);
        }
    }
    let mut request = match credentials {
        Credentials::Bearer(token) => {
            let mut request = url.as_str().into_client_request()?;
            request.headers_mut().insert(
                axum::http::header::AUTHORIZATION,
                format!("Bearer {token}").parse()?,
            );
            request
        }
        Credentials::ShareToken(token) => {
            url.query_pairs_mut().append_pair("token", token);
            url.as_str().into_client_request()?
        }
    };
    request
        .headers_mut()
        .insert("User-Agent", "cove".parse()?);
    let (stream, _) = connect_async(request)
        .await
        .with_context(|| format!("failed to connect to {endpoint}"))?;
    Ok(stream)
}

/// Write one frame with the standard deadline.
pub async fn write_frame(sink: &mut WsSink, frame: &Frame) -> Result<()> {
    let bytes = encode_frame(frame);
    tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Binary(bytes)))
        .await
        .context("frame write timed out")?
        .context("frame write failed")?;
    Ok(())
}

/// Next decodable frame, skipping unknown payload tags and control messages.
/// `None` means the stream ended or turned unusable.
pub async fn next_frame(stream: &mut WsSource) -> Option<Frame> {
    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                debug!(error = %err, "websocket read failed");
                return None;
            }
        };
        match message {
            Message::Binary(data) => match decode_frame(&data) {
                Ok(frame) => return Some(frame),
                Err(err) if err.is_skippable() => {
                    debug!(error = %err, "skipping unknown frame");
                }
                Err(err) => {
                    debug!(error = %err, "malformed frame");
                    return None;
                }
            },
            Message::Close(_) => return None,
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_scheme_mapping() {
        assert_eq!(ws_base("https://relay.example").unwrap().scheme(), "wss");
        assert_eq!(ws_base("http://relay.example:8080").unwrap().scheme(), "ws");
        assert_eq!(ws_base("ws://relay.example").unwrap().scheme(), "ws");
        assert_eq!(http_base("wss://relay.example").unwrap().scheme(), "https");
        assert!(ws_base("ftp://relay.example").is_err());
        assert!(ws_base("not a url").is_err());
    }
}
