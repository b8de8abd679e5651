//! Viewer-count side-channel: a text WebSocket that emits the room's
//! current connection count as ASCII decimal. Updates are driven by peer
//! set membership changes rather than a polling tick.

use std::sync::Arc;

use crate::peer_set::PeerSet;
use crate::ws::{Opcode, WebSocket};

/// Streams the connection count to one viewer socket until the client goes
/// away or the write fails.
pub async fn viewer_conn(socket: Arc<WebSocket>, peers: PeerSet) {
    let mut count_rx = peers.watch_connections();
    loop {
        let count = *count_rx.borrow_and_update();
        if let Err(err) = socket.write_message(Opcode::Text, count.to_string().as_bytes()).await {
            tracing::debug!("viewer connection ended: {}", err);
            return;
        }
        if count_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment, IceConfig};
    use crate::peer_set::PeerConn;
    use crate::signaling::SignalingSocket;
    use crate::ws::Role;

    #[tokio::test]
    async fn viewer_sees_membership_changes() {
        let peers = PeerSet::new();
        let (viewer_io, server_io) = tokio::io::duplex(1 << 16);
        let viewer = WebSocket::new(viewer_io, Role::Client);
        let server = Arc::new(WebSocket::new(server_io, Role::Server));

        tokio::spawn({
            let peers = peers.clone();
            async move { viewer_conn(server, peers).await }
        });

        let first = viewer.read_message().await.unwrap();
        assert_eq!(first.data, b"0");

        let config = Config {
            listen_port: 0,
            environment: Environment::Development,
            ice: IceConfig {
                stun_url: String::new(),
                turn_url: None,
                turn_username: String::new(),
                turn_credential: String::new(),
            },
        };
        let (peer_io, _keepalive) = tokio::io::duplex(1 << 16);
        let peer = PeerConn {
            peer_connection: config.new_peer_connection().await.unwrap(),
            socket: SignalingSocket::new(Arc::new(WebSocket::new(peer_io, Role::Server))),
        };
        peers.register(peer).await;

        let second = viewer.read_message().await.unwrap();
        assert_eq!(second.data, b"1");
    }
}
