use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::transport::{Transport, TransportFailure, TransportLink, namespace_url};
use crate::model::Namespace;

/// WebSocket transport: one socket per namespace at `<endpoint>/<namespace>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(
        &self,
        endpoint: &str,
        namespace: Namespace,
    ) -> Result<TransportLink, TransportFailure> {
        let url = namespace_url(endpoint, namespace);
        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportFailure::network(format!("connect to {} failed: {}", url, e)))?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(pump_socket(ws_stream, outbound_rx, inbound_tx, namespace));

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

/// Forward frames both ways until either side closes.
///
/// Dropping the inbound sender on exit is what signals link loss upstream.
async fn pump_socket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    namespace: Namespace,
) {
    let (mut sink, mut stream) = ws_stream.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(text) => {
                        if sink.send(Message::text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        // Owner dropped the link; best-effort close frame
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if inbound.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary, ping and pong frames carry nothing for us
                    }
                    Some(Err(e)) => {
                        tracing::debug!(namespace = %namespace, error = %e, "websocket read failed");
                        break;
                    }
                }
            }
        }
    }

    tracing::debug!(namespace = %namespace, "websocket pump stopped");
}
