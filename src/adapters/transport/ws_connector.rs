use crate::core::domain::connection::Station;
use crate::core::domain::delivery::ClientMessage;
use crate::core::ports::connector::{ClientChannel, StreamConnector};
use crate::utils::error::{BusError, BusResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

const REPLY_BUFFER: usize = 64;

/// Identity headers presented when opening the push stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamIdentity {
    pub user_id: String,
    pub tenant_id: String,
    pub station: Station,
    pub api_key: Option<String>,
}

/// [`StreamConnector`] that opens the server's WebSocket push stream.
///
/// Each text message is one frame line. Acknowledgments and heartbeats written to
/// the channel's `replies` are serialized as JSON text messages by a writer task
/// that ends together with the socket.
pub struct WsConnector {
    url: Url,
    identity: StreamIdentity,
}

impl WsConnector {
    pub fn new(url: &str, identity: StreamIdentity) -> BusResult<Self> {
        let url = Url::parse(url).map_err(|e| BusError::ConfigError(format!("invalid stream url: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url, identity }),
            other => Err(BusError::ConfigError(format!(
                "unsupported stream url scheme: {other}"
            ))),
        }
    }

    fn header(value: &str) -> BusResult<HeaderValue> {
        HeaderValue::from_str(value).map_err(|e| BusError::ConfigError(e.to_string()))
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self) -> BusResult<ClientChannel> {
        let transport_error = |reason: String| BusError::TransientTransport {
            connection_id: self.url.to_string(),
            reason,
        };

        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| transport_error(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert("X-User-Id", Self::header(&self.identity.user_id)?);
        headers.insert("X-Tenant-Id", Self::header(&self.identity.tenant_id)?);
        headers.insert("X-Station", Self::header(self.identity.station.as_str())?);
        if let Some(api_key) = &self.identity.api_key {
            headers.insert("X-API-KEY", Self::header(api_key)?);
        }

        let (socket, _) = connect_async(request)
            .await
            .map_err(|e| transport_error(e.to_string()))?;
        debug!(url = %self.url, "push stream opened");
        let (mut writer, reader) = socket.split();

        let (replies, mut outgoing) = mpsc::channel::<ClientMessage>(REPLY_BUFFER);
        tokio::spawn(async move {
            while let Some(message) = outgoing.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("failed to encode client message: {e}");
                        continue;
                    }
                };
                if writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let url = self.url.to_string();
        let frames = reader.filter_map(move |message| {
            let url = url.clone();
            async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(Message::Binary(bytes)) => Some(
                        String::from_utf8(bytes).map_err(|e| BusError::TransientTransport {
                            connection_id: url,
                            reason: e.to_string(),
                        }),
                    ),
                    Ok(_) => None,
                    Err(e) => Some(Err(BusError::TransientTransport {
                        connection_id: url,
                        reason: e.to_string(),
                    })),
                }
            }
        });

        Ok(ClientChannel {
            frames: Box::pin(frames),
            replies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> StreamIdentity {
        StreamIdentity {
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            station: Station::new("cassa"),
            api_key: None,
        }
    }

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(WsConnector::new("http://localhost/events/stream", identity()).is_err());
        assert!(WsConnector::new("not a url", identity()).is_err());
        assert!(WsConnector::new("ws://localhost:3000/events/stream", identity()).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_transport_error() {
        let connector = WsConnector::new("ws://127.0.0.1:1/events/stream", identity()).unwrap();
        assert!(matches!(
            connector.connect().await,
            Err(BusError::TransientTransport { .. })
        ));
    }
}
