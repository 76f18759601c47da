//! WebSocket transport: bridges a socket to a [`PeerChannel`].
//!
//! Peer ids are `host:port` addresses of the peer's listener. An outbound
//! connection dials `ws://<peer id>`; an inbound one is identified by the
//! `peerId` of the first frame it sends, which must be a handshake.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use loom_protocol::{ConnectionRegistry, Connector, Error as ProtocolError, PeerChannel, PeerMessage};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message, WebSocketStream};

/// How long an inbound socket may take to introduce itself
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct WsConnector {
    connect_timeout: Duration,
}

impl WsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, peer_id: &str) -> loom_protocol::Result<PeerChannel> {
        let url = format!("ws://{peer_id}");
        let failed = |reason: String| ProtocolError::ConnectFailed {
            peer: peer_id.to_string(),
            reason,
        };
        let (ws, _resp) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| failed("timed out".into()))?
            .map_err(|e| failed(e.to_string()))?;
        Ok(bridge(ws, peer_id.to_string(), None))
    }
}

/// Spawns the reader and writer tasks for one socket. `first` is a message
/// already read off the socket that must be delivered before anything else.
fn bridge<S>(ws: WebSocketStream<S>, peer_id: String, first: Option<PeerMessage>) -> PeerChannel
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<PeerMessage>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<PeerMessage>();

    if let Some(message) = first {
        let _ = in_tx.send(message);
    }

    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(peer = %writer_peer, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(text)).await {
                tracing::debug!(peer = %writer_peer, error = %e, "Socket write failed");
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<PeerMessage>(&text) {
                    Ok(message) => {
                        if in_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(peer = %peer_id, error = %e, "Ignoring malformed frame"),
                },
                Ok(Message::Close(_)) => break,
                // tungstenite answers pings itself
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(peer = %peer_id, error = %e, "Socket read failed");
                    break;
                }
            }
        }
        // dropping in_tx tells the registry the link is gone
    });

    PeerChannel {
        outbound: out_tx,
        inbound: in_rx,
    }
}

/// Accepts peer sockets on `addr` until the task is dropped.
pub async fn listen(addr: SocketAddr, registry: ConnectionRegistry) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind peer listener on {addr}"))?;
    tracing::info!(addr = %addr, "🔌 Listening for peers");

    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "Accept failed");
                continue;
            }
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = adopt(stream, registry).await {
                tracing::warn!(remote = %remote, error = %e, "Inbound peer rejected");
            }
        });
    }
}

async fn adopt(stream: tokio::net::TcpStream, registry: ConnectionRegistry) -> Result<()> {
    let mut ws = accept_async(stream).await.context("WebSocket upgrade failed")?;

    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .context("Peer did not introduce itself")?;
    let handshake = match first {
        Some(Ok(Message::Text(text))) => serde_json::from_str::<PeerMessage>(&text)
            .context("First frame is not a peer message")?,
        Some(Ok(other)) => bail!("Unexpected first frame: {other:?}"),
        Some(Err(e)) => return Err(e).context("Socket error before handshake"),
        None => bail!("Socket closed before handshake"),
    };
    let PeerMessage::Handshake(hs) = &handshake else {
        bail!("First frame must be a handshake, got {}", handshake.label());
    };

    let peer_id = hs.peer_id.clone();
    let channel = bridge(ws, peer_id.clone(), Some(handshake));
    if !registry.accept(&peer_id, channel).await {
        tracing::info!(peer = %peer_id, "Dropped duplicate inbound socket");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_protocol::{BuiltinProvider, Node, NodeConfig};
    use std::sync::Arc;

    async fn free_addr() -> SocketAddr {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        probe.local_addr().unwrap()
    }

    fn node(addr: SocketAddr) -> Node {
        let config = NodeConfig { node_id: addr.to_string(), ..Default::default() };
        let connector: Arc<dyn Connector> = Arc::new(WsConnector::new(Duration::from_secs(2)));
        Node::new(config, Arc::new(BuiltinProvider), Some(connector))
    }

    #[tokio::test]
    async fn test_peers_connect_over_websocket() {
        let addr_a = free_addr().await;
        let addr_b = free_addr().await;
        let a = node(addr_a);
        let b = node(addr_b);
        let listener = tokio::spawn(listen(addr_b, b.registry.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        a.registry.connect(&addr_b.to_string()).await.unwrap();

        let mut connected = false;
        for _ in 0..100 {
            if b.registry.is_connected(&addr_a.to_string()).await {
                connected = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(connected);
        listener.abort();
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let addr = free_addr().await;
        let connector = WsConnector::new(Duration::from_secs(1));
        let err = connector.open(&addr.to_string()).await.err();
        assert!(matches!(err, Some(ProtocolError::ConnectFailed { .. })));
    }
}
