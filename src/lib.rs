#![deny(missing_debug_implementations)]
//! # Roomcast
//! Roomcast is a WebRTC Selective Forwarding Unit for many-to-many video
//! rooms and one-to-many public streams. Browsers establish a single peer
//! connection to the server; the server receives each publisher's tracks
//! once and fans them out to every other participant of the same room,
//! renegotiating sessions whenever the set of tracks changes. Signaling,
//! in-room chat, and the viewer counter all run over the WebSocket stack
//! implemented in [`ws`].

/// Per-room text chat bus with bounded subscriber queues.
pub mod chat;
/// Server configuration and the [`webrtc::peer_connection::RTCPeerConnection`] factory.
pub mod config;
pub mod error;
/// The room's peer connections, forwarded tracks, and the renegotiation engine.
pub mod peer_set;
/// Room registry: maps room ids and stream aliases to the same room.
pub mod registry;
/// Signaling protocol and the per-peer connection handlers.
pub mod signaling;
/// Viewer-count side-channel.
pub mod viewer;
/// RFC 6455 WebSocket framing and the server upgrade handshake.
pub mod ws;
