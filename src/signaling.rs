//! Per-peer signaling over a WebSocket: the event-typed message format, the
//! single-writer socket shim, and the connection handlers for the `room`
//! and `stream` endpoints.

use std::sync::Arc;

use enclose::enc;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::track::track_local::TrackLocal as _;
use webrtc::track::track_local::TrackLocalWriter as _;
use webrtc::track::track_remote::TrackRemote;

use crate::config::Config;
use crate::error::Error;
use crate::peer_set::{PeerConn, PeerSet};
use crate::ws::{self, Opcode, WebSocket};

pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_CANDIDATE: &str = "candidate";

/// Wire envelope for signaling: `data` is itself a JSON-encoded string whose
/// schema depends on `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub event: String,
    pub data: String,
}

impl SignalingMessage {
    pub fn offer(data: String) -> SignalingMessage {
        SignalingMessage { event: EVENT_OFFER.to_owned(), data }
    }

    pub fn candidate(data: String) -> SignalingMessage {
        SignalingMessage { event: EVENT_CANDIDATE.to_owned(), data }
    }
}

/// Single-writer shim around a signaling WebSocket. Each message goes out as
/// one text frame under the socket's writer token, so candidate emission and
/// renegotiation offers never interleave on the wire.
#[derive(Debug, Clone)]
pub struct SignalingSocket {
    socket: Arc<WebSocket>,
}

impl SignalingSocket {
    pub fn new(socket: Arc<WebSocket>) -> SignalingSocket {
        SignalingSocket { socket }
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<(), Error> {
        let payload = serde_json::to_vec(message)?;
        self.socket.write_message(Opcode::Text, &payload).await?;
        Ok(())
    }
}

/// Handles a participant socket: the peer publishes audio/video into the
/// room and receives every other participant's tracks.
pub async fn room_conn(socket: Arc<WebSocket>, peers: PeerSet, config: &Config) -> Result<(), Error> {
    connect(socket, peers, config, true).await
}

/// Handles a stream-viewer socket: identical session setup, but published
/// media is not forwarded back into the room.
pub async fn stream_conn(socket: Arc<WebSocket>, peers: PeerSet, config: &Config) -> Result<(), Error> {
    connect(socket, peers, config, false).await
}

async fn connect(
    socket: Arc<WebSocket>,
    peers: PeerSet,
    config: &Config,
    relay_media: bool,
) -> Result<(), Error> {
    let peer_connection = config.new_peer_connection().await?;

    // The server only receives on the publisher side; outbound tracks are
    // added later by the peer set.
    for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
        peer_connection
            .add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
    }

    let signaling = SignalingSocket::new(Arc::clone(&socket));
    peers
        .register(PeerConn {
            peer_connection: Arc::clone(&peer_connection),
            socket: signaling.clone(),
        })
        .await;

    emit_candidates(&peer_connection, &signaling);
    monitor_connection_state(&peer_connection, &peers);
    if relay_media {
        forward_media(&peer_connection, &peers);
    }

    // The newcomer may need to see tracks that already exist.
    peers.signal_peer_connections().await;

    let result = read_loop(&socket, &peer_connection).await;
    if let Err(err) = peer_connection.close().await {
        tracing::error!("failed to close peer connection: {}", err);
    }
    result
}

/// Trickle ICE: every non-nil local candidate goes straight to the client.
fn emit_candidates(peer_connection: &Arc<RTCPeerConnection>, signaling: &SignalingSocket) {
    let signaling = signaling.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        Box::pin(enc!((signaling) async move {
            let Some(candidate) = candidate else { return };
            let init = match candidate.to_json() {
                Ok(init) => init,
                Err(err) => {
                    tracing::error!("failed to serialize ICE candidate: {}", err);
                    return;
                }
            };
            let data = match serde_json::to_string(&init) {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!("failed to encode ICE candidate: {}", err);
                    return;
                }
            };
            if let Err(err) = signaling.send(&SignalingMessage::candidate(data)).await {
                tracing::error!("failed to send ICE candidate: {}", err);
            }
        }))
    }));
}

/// `Failed` closes the connection; the resulting `Closed` transition lets
/// the peer set reconcile the survivors.
fn monitor_connection_state(peer_connection: &Arc<RTCPeerConnection>, peers: &PeerSet) {
    let weak_pc = Arc::downgrade(peer_connection);
    let peers = peers.clone();
    peer_connection.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let weak_pc = weak_pc.clone();
        Box::pin(enc!((peers) async move {
            match state {
                RTCPeerConnectionState::Failed => {
                    let Some(peer_connection) = weak_pc.upgrade() else { return };
                    if let Err(err) = peer_connection.close().await {
                        tracing::error!("failed to close failed peer connection: {}", err);
                    }
                }
                RTCPeerConnectionState::Closed => {
                    peers.signal_peer_connections().await;
                }
                state => {
                    tracing::debug!("peer connection state changed: {}", state);
                }
            }
        }))
    }));
}

/// Fans a published track out to the room: create the local counterpart,
/// copy RTP until either side fails, then drop it and renegotiate.
fn forward_media(peer_connection: &Arc<RTCPeerConnection>, peers: &PeerSet) {
    let peers = peers.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _transceiver: Arc<RTCRtpTransceiver>| {
            Box::pin(enc!((peers) async move {
                tokio::spawn(async move {
                    let local = peers.add_track(&track).await;
                    tracing::debug!(
                        "forwarding track id={} ssrc={} mime={}",
                        track.id(),
                        track.ssrc(),
                        track.codec().capability.mime_type
                    );
                    loop {
                        match track.read_rtp().await {
                            Ok((packet, _attributes)) => {
                                if let Err(err) = local.write_rtp(&packet).await {
                                    tracing::debug!("fan-out for track {} ended: {}", local.id(), err);
                                    break;
                                }
                            }
                            Err(err) => {
                                tracing::debug!("rtp read for track {} ended: {}", track.id(), err);
                                break;
                            }
                        }
                    }
                    peers.remove_track(&local).await;
                });
            }))
        },
    ));
}

async fn read_loop(socket: &WebSocket, peer_connection: &Arc<RTCPeerConnection>) -> Result<(), Error> {
    loop {
        let message = match socket.read_message().await {
            Ok(message) => message,
            Err(ws::Error::Closed { .. }) => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        let request: SignalingMessage = serde_json::from_slice(&message.data)?;
        match request.event.as_str() {
            EVENT_CANDIDATE => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&request.data)?;
                peer_connection.add_ice_candidate(candidate).await?;
            }
            EVENT_ANSWER => {
                let answer: RTCSessionDescription = serde_json::from_str(&request.data)?;
                peer_connection.set_remote_description(answer).await?;
            }
            event => {
                tracing::debug!("ignoring unknown signaling event {:?}", event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_message_wire_shape() {
        let message = SignalingMessage::candidate("{\"candidate\":\"foo\"}".to_owned());
        let encoded = serde_json::to_string(&message).unwrap();
        assert!(encoded.starts_with("{\"event\":\"candidate\""));

        let decoded: SignalingMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.event, EVENT_CANDIDATE);
        assert_eq!(decoded.data, message.data);
    }

    #[test]
    fn answer_payload_is_nested_json() {
        // `data` carries a JSON document as a string, not an inline object.
        let raw = r#"{"event":"answer","data":"{\"type\":\"answer\",\"sdp\":\"v=0\\r\\n\"}"}"#;
        let message: SignalingMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(message.event, EVENT_ANSWER);
        let description: RTCSessionDescription = serde_json::from_str(&message.data).unwrap();
        assert_eq!(description.sdp, "v=0\r\n");
    }
}
