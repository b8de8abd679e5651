//! Server-side upgrade handshake.
//!
//! The handshake itself is plain HTTP: validate the `Upgrade` header and the
//! client key, answer `101 Switching Protocols` with the derived accept key,
//! and then take ownership of the raw byte stream once hyper has flushed the
//! response.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::{header, Request, Response, StatusCode};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use sha1::{Digest, Sha1};

use super::{Error, Role, WebSocket};

/// Fixed GUID from RFC 6455 section 1.3, appended to the client key before
/// hashing.
const WS_KEY_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` value for a client `Sec-WebSocket-Key`.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_KEY_GUID);
    BASE64.encode(sha.finalize())
}

/// Validates the upgrade request and builds the `101 Switching Protocols`
/// response. Does not touch the underlying connection; see [`upgrade`] for
/// the full hijack.
pub fn handshake<B>(req: &Request<B>) -> Result<Response<()>, Error> {
    let upgradable = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
    if !upgradable {
        return Err(Error::Handshake("missing Upgrade: websocket header".to_owned()));
    }

    let key = req
        .headers()
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| Error::Handshake("missing Sec-WebSocket-Key header".to_owned()))?;

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept_key(key))
        .body(())
        .map_err(|err| Error::Handshake(err.to_string()))
}

/// Performs the handshake and claims the connection's [`OnUpgrade`] handle.
/// The returned response must be sent back through the HTTP server; the
/// [`PendingWebSocket`] resolves once hyper hands over the raw stream.
pub fn upgrade<B>(req: &mut Request<B>) -> Result<(Response<()>, PendingWebSocket), Error> {
    let response = handshake(req)?;
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or_else(|| Error::Handshake("connection is not upgradable".to_owned()))?;
    Ok((response, PendingWebSocket { on_upgrade }))
}

/// A claimed upgrade that has not completed yet.
#[derive(Debug)]
pub struct PendingWebSocket {
    on_upgrade: OnUpgrade,
}

impl PendingWebSocket {
    /// Waits for the 101 response to be flushed and wraps the hijacked
    /// stream in a server-role [`WebSocket`].
    pub async fn into_socket(self) -> Result<WebSocket, Error> {
        let upgraded = self
            .on_upgrade
            .await
            .map_err(|err| Error::Handshake(err.to_string()))?;
        Ok(WebSocket::new(TokioIo::new(upgraded), Role::Server))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_example() {
        // The sample nonce from RFC 6455 section 1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_switches_protocols() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .header(header::CONNECTION, "Upgrade")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();

        let response = handshake(&req).unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()[header::UPGRADE], "websocket");
        assert_eq!(response.headers()[header::CONNECTION], "Upgrade");
        assert_eq!(
            response.headers()[header::SEC_WEBSOCKET_ACCEPT],
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn handshake_rejects_missing_key() {
        let req = Request::builder()
            .header(header::UPGRADE, "websocket")
            .body(())
            .unwrap();
        assert!(matches!(handshake(&req), Err(Error::Handshake(_))));
    }

    #[test]
    fn handshake_rejects_plain_request() {
        let req = Request::builder().body(()).unwrap();
        assert!(matches!(handshake(&req), Err(Error::Handshake(_))));
    }

    #[test]
    fn upgrade_header_is_case_insensitive() {
        let req = Request::builder()
            .header(header::UPGRADE, "WebSocket")
            .header(header::SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .body(())
            .unwrap();
        assert!(handshake(&req).is_ok());
    }
}
