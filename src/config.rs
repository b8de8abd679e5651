//! Environment-driven server configuration and the
//! [`webrtc::peer_connection::RTCPeerConnection`] factory.

use std::env;
use std::sync::Arc;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::Error;

/// Gates whether TURN credentials are offered to peers. Development peers
/// run with library defaults; production peers get the configured relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_port: u16,
    pub environment: Environment,
    pub ice: IceConfig,
}

#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_url: String,
    pub turn_url: Option<String>,
    pub turn_username: String,
    pub turn_credential: String,
}

impl Config {
    pub fn from_env() -> Config {
        let listen_port = env::var("PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(8080);
        let environment = match env::var("ENVIRONMENT").as_deref() {
            Ok("PRODUCTION") => Environment::Production,
            _ => Environment::Development,
        };
        Config {
            listen_port,
            environment,
            ice: IceConfig {
                stun_url: env::var("STUN_URL")
                    .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_owned()),
                turn_url: env::var("TURN_URL").ok(),
                turn_username: env::var("TURN_USERNAME").unwrap_or_default(),
                turn_credential: env::var("TURN_CREDENTIAL").unwrap_or_default(),
            },
        }
    }

    /// ICE server set for a new peer. Empty in development, STUN plus the
    /// configured TURN relay in production.
    pub fn rtc_configuration(&self) -> RTCConfiguration {
        match self.environment {
            Environment::Development => RTCConfiguration::default(),
            Environment::Production => {
                let mut ice_servers = vec![RTCIceServer {
                    urls: vec![self.ice.stun_url.clone()],
                    ..Default::default()
                }];
                if let Some(turn_url) = &self.ice.turn_url {
                    ice_servers.push(RTCIceServer {
                        urls: vec![turn_url.clone()],
                        username: self.ice.turn_username.clone(),
                        credential: self.ice.turn_credential.clone(),
                        ..Default::default()
                    });
                }
                RTCConfiguration { ice_servers, ..Default::default() }
            }
        }
    }

    /// Builds a peer connection with the default codec set and interceptor
    /// chain (NACK, RTCP reports, TWCC).
    pub async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let peer_connection = api.new_peer_connection(self.rtc_configuration()).await?;
        Ok(Arc::new(peer_connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(environment: Environment) -> Config {
        Config {
            listen_port: 8080,
            environment,
            ice: IceConfig {
                stun_url: "stun:stun.example.com:3478".to_owned(),
                turn_url: Some("turn:turn.example.com:3478".to_owned()),
                turn_username: "user".to_owned(),
                turn_credential: "secret".to_owned(),
            },
        }
    }

    #[test]
    fn development_uses_library_defaults() {
        let config = test_config(Environment::Development);
        assert!(config.rtc_configuration().ice_servers.is_empty());
    }

    #[test]
    fn production_includes_turn_credentials() {
        let config = test_config(Environment::Production);
        let servers = config.rtc_configuration().ice_servers;
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.com:3478"]);
        assert_eq!(servers[1].username, "user");
        assert_eq!(servers[1].credential, "secret");
    }

    #[tokio::test]
    async fn peer_connection_factory_builds() {
        let config = test_config(Environment::Development);
        let peer_connection = config.new_peer_connection().await.unwrap();
        peer_connection.close().await.unwrap();
    }
}
