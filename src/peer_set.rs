//! The room's authoritative set of peer connections and forwarded tracks,
//! and the engine that keeps every peer's sender list in sync with it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use derivative::Derivative;
use tokio::sync::{mpsc, watch, Mutex};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::signaling::{SignalingMessage, SignalingSocket};

/// Reconciliation attempts per call before the engine re-arms itself.
const SYNC_ATTEMPT_LIMIT: usize = 25;
/// Back-off before a re-armed reconciliation runs.
const SIGNAL_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Result of one reconciliation attempt.
enum SyncOutcome {
    /// Every surviving peer holds the full sender set and got an offer.
    Settled,
    /// The snapshot was invalidated mid-flight; take a fresh one.
    Retry,
    /// A failure retrying cannot fix.
    Abort,
}

/// A registered peer: the WebRTC connection plus the single-writer shim
/// around its signaling socket.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct PeerConn {
    #[derivative(Debug = "ignore")]
    pub peer_connection: Arc<RTCPeerConnection>,
    pub socket: SignalingSocket,
}

#[derive(Default)]
struct PeerSetInner {
    connections: Vec<PeerConn>,
    track_locals: HashMap<String, Arc<TrackLocalStaticRTP>>,
}

/// Shared peer set for one room. Cloning shares the same state; mutations
/// and reconciliation attempts are serialized by one lock, deliberately held
/// across each attempt's offer writes so that no two reconciliation
/// attempts can interleave for the same set.
#[derive(Derivative, Clone)]
#[derivative(Debug)]
pub struct PeerSet {
    #[derivative(Debug = "ignore")]
    inner: Arc<Mutex<PeerSetInner>>,
    #[derivative(Debug = "ignore")]
    count_tx: Arc<watch::Sender<usize>>,
    retry_tx: mpsc::UnboundedSender<()>,
}

impl PeerSet {
    pub fn new() -> PeerSet {
        let (count_tx, _count_rx) = watch::channel(0);
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<()>();
        let set = PeerSet {
            inner: Arc::new(Mutex::new(PeerSetInner::default())),
            count_tx: Arc::new(count_tx),
            retry_tx,
        };

        // Re-armed reconciliations land here instead of recursing.
        {
            let set = set.clone();
            tokio::spawn(async move {
                while retry_rx.recv().await.is_some() {
                    set.signal_peer_connections().await;
                }
            });
        }

        set
    }

    /// Adds a peer to the set. The caller follows up with
    /// [`PeerSet::signal_peer_connections`] once its callbacks are wired.
    pub async fn register(&self, peer: PeerConn) {
        let mut inner = self.inner.lock().await;
        inner.connections.push(peer);
        self.count_tx.send_replace(inner.connections.len());
    }

    /// Creates the fan-out counterpart of a published track, keyed by the
    /// remote track's id and carrying the same codec and stream id, then
    /// renegotiates every peer.
    pub async fn add_track(&self, remote: &Arc<TrackRemote>) -> Arc<TrackLocalStaticRTP> {
        let local = {
            let mut inner = self.inner.lock().await;
            let local = Arc::new(TrackLocalStaticRTP::new(
                remote.codec().capability,
                remote.id(),
                remote.stream_id(),
            ));
            inner.track_locals.insert(remote.id(), Arc::clone(&local));
            tracing::debug!("track {} added, {} forwarded", remote.id(), inner.track_locals.len());
            local
        };
        self.signal_peer_connections().await;
        local
    }

    /// Drops a fan-out track and renegotiates every peer.
    pub async fn remove_track(&self, local: &Arc<TrackLocalStaticRTP>) {
        {
            let mut inner = self.inner.lock().await;
            inner.track_locals.remove(local.id());
            tracing::debug!("track {} removed, {} forwarded", local.id(), inner.track_locals.len());
        }
        self.signal_peer_connections().await;
    }

    /// Reconciles every peer's senders with the track map and pushes a fresh
    /// offer to each. Each attempt runs atomically under the set lock; on a
    /// retry the lock is released and the task yields so pending track and
    /// close events can drain first. After [`SYNC_ATTEMPT_LIMIT`] tries the
    /// engine re-arms itself instead of livelocking. A keyframe dispatch
    /// follows every run so late joiners render immediately.
    pub async fn signal_peer_connections(&self) {
        for attempt in 0.. {
            if attempt == SYNC_ATTEMPT_LIMIT {
                let retry_tx = self.retry_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(SIGNAL_RETRY_DELAY).await;
                    let _ = retry_tx.send(());
                });
                break;
            }
            let outcome = {
                let mut inner = self.inner.lock().await;
                self.attempt_sync(&mut inner).await
            };
            match outcome {
                SyncOutcome::Settled | SyncOutcome::Abort => break,
                SyncOutcome::Retry => tokio::task::yield_now().await,
            }
        }
        self.dispatch_key_frame().await;
    }

    /// One atomic reconciliation pass over every peer.
    async fn attempt_sync(&self, inner: &mut PeerSetInner) -> SyncOutcome {
        // Closed peers leave the set first.
        let before = inner.connections.len();
        inner
            .connections
            .retain(|peer| peer.peer_connection.connection_state() != RTCPeerConnectionState::Closed);
        if inner.connections.len() != before {
            self.count_tx.send_replace(inner.connections.len());
            return SyncOutcome::Retry;
        }

        for peer in &inner.connections {
            let peer_connection = &peer.peer_connection;

            // Track ids this peer already covers, so nothing is double-sent.
            let mut covered: HashSet<String> = HashSet::new();
            for sender in peer_connection.get_senders().await {
                let Some(track) = sender.track().await else { continue };
                let id = track.id().to_owned();
                let stale = !inner.track_locals.contains_key(&id);
                covered.insert(id);
                if stale {
                    if let Err(err) = peer_connection.remove_track(&sender).await {
                        tracing::debug!("failed to remove stale sender: {}", err);
                        return SyncOutcome::Retry;
                    }
                }
            }

            // A peer's own publications count as covered: no loopback.
            for receiver in peer_connection.get_receivers().await {
                if let Some(track) = receiver.tracks().await.into_iter().next() {
                    covered.insert(track.id());
                }
            }

            for (id, local) in &inner.track_locals {
                if covered.contains(id) {
                    continue;
                }
                let track = Arc::clone(local) as Arc<dyn TrackLocal + Send + Sync>;
                if let Err(err) = peer_connection.add_track(track).await {
                    tracing::debug!("failed to add track {}: {}", id, err);
                    return SyncOutcome::Retry;
                }
            }

            let offer = match peer_connection.create_offer(None).await {
                Ok(offer) => offer,
                Err(err) => {
                    tracing::debug!("failed to create offer: {}", err);
                    return SyncOutcome::Retry;
                }
            };
            if let Err(err) = peer_connection.set_local_description(offer.clone()).await {
                tracing::debug!("failed to set local description: {}", err);
                return SyncOutcome::Retry;
            }
            let data = match serde_json::to_string(&offer) {
                Ok(data) => data,
                // Not a transient failure; retrying cannot fix it.
                Err(err) => {
                    tracing::error!("failed to encode offer: {}", err);
                    return SyncOutcome::Abort;
                }
            };
            if let Err(err) = peer.socket.send(&SignalingMessage::offer(data)).await {
                tracing::debug!("failed to push offer: {}", err);
                return SyncOutcome::Retry;
            }
        }

        SyncOutcome::Settled
    }

    /// Asks every publisher for a keyframe by writing a PLI against each
    /// received track's SSRC.
    pub async fn dispatch_key_frame(&self) {
        let inner = self.inner.lock().await;
        for peer in &inner.connections {
            let peer_connection = &peer.peer_connection;
            for receiver in peer_connection.get_receivers().await {
                let Some(track) = receiver.tracks().await.into_iter().next() else { continue };
                let pli = PictureLossIndication { sender_ssrc: 0, media_ssrc: track.ssrc() };
                if let Err(err) = peer_connection.write_rtcp(&[Box::new(pli)]).await {
                    tracing::error!("failed to send PLI for ssrc={}: {}", track.ssrc(), err);
                }
            }
        }
    }

    /// Live view of the number of registered peers, updated on every
    /// membership change.
    pub fn watch_connections(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.lock().await.connections.len()
    }

    pub async fn track_count(&self) -> usize {
        self.inner.lock().await.track_locals.len()
    }

    /// Whether two handles refer to the same underlying set.
    pub fn same_set(&self, other: &PeerSet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for PeerSet {
    fn default() -> PeerSet {
        PeerSet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Environment, IceConfig};
    use crate::signaling::EVENT_OFFER;
    use crate::ws::{Role, WebSocket};

    fn dev_config() -> Config {
        Config {
            listen_port: 0,
            environment: Environment::Development,
            ice: IceConfig {
                stun_url: String::new(),
                turn_url: None,
                turn_username: String::new(),
                turn_credential: String::new(),
            },
        }
    }

    async fn peer_with_socket(config: &Config) -> (PeerConn, WebSocket) {
        use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
        use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
        use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

        let (client_io, server_io) = tokio::io::duplex(1 << 20);
        let client = WebSocket::new(client_io, Role::Client);
        let server = Arc::new(WebSocket::new(server_io, Role::Server));
        let peer_connection = config.new_peer_connection().await.unwrap();
        peer_connection
            .add_transceiver_from_kind(
                RTPCodecType::Audio,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .unwrap();
        let peer = PeerConn { peer_connection, socket: SignalingSocket::new(server) };
        (peer, client)
    }

    #[tokio::test]
    async fn registration_updates_the_connection_watch() {
        let peers = PeerSet::new();
        let mut watch = peers.watch_connections();
        assert_eq!(*watch.borrow_and_update(), 0);

        let config = dev_config();
        let (peer, _client) = peer_with_socket(&config).await;
        peers.register(peer).await;

        watch.changed().await.unwrap();
        assert_eq!(*watch.borrow_and_update(), 1);
        assert_eq!(peers.connection_count().await, 1);
    }

    #[tokio::test]
    async fn reconciliation_pushes_an_offer_to_each_peer() {
        let peers = PeerSet::new();
        let config = dev_config();
        let (peer, client) = peer_with_socket(&config).await;
        peers.register(peer).await;

        peers.signal_peer_connections().await;

        let message = client.read_message().await.unwrap();
        let parsed: SignalingMessage = serde_json::from_slice(&message.data).unwrap();
        assert_eq!(parsed.event, EVENT_OFFER);
        assert!(parsed.data.contains("\"sdp\""));
    }

    #[tokio::test]
    async fn closed_peers_are_dropped_during_reconciliation() {
        let peers = PeerSet::new();
        let config = dev_config();
        let (peer, _client) = peer_with_socket(&config).await;
        let peer_connection = Arc::clone(&peer.peer_connection);
        peers.register(peer).await;
        assert_eq!(peers.connection_count().await, 1);

        peer_connection.close().await.unwrap();
        peers.signal_peer_connections().await;

        assert_eq!(peers.connection_count().await, 0);
    }
}
