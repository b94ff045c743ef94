use std::time::Duration;

use huddle::mesh::ParticipantId;
use serde::{Deserialize, Serialize};
use url::Url;

pub const DEFAULT_STUN_SERVERS: [&str; 4] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
];

pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Brokering service the peers exchange offers, answers and candidates through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingServer {
    host: String,
    port: u16,
    path: String,
    key: String,
    secure: bool,
    heartbeat_interval: Duration,
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self {
            host: "0.peerjs.com".into(),
            port: 443,
            path: "/".into(),
            key: "peerjs".into(),
            secure: true,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl SignalingServer {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
            ..Default::default()
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    /// Interval between heartbeats, clamped to [`MIN_HEARTBEAT_INTERVAL`]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval.max(MIN_HEARTBEAT_INTERVAL)
    }

    pub fn host_mut(&mut self) -> &mut String {
        &mut self.host
    }

    pub fn port_mut(&mut self) -> &mut u16 {
        &mut self.port
    }

    pub fn path_mut(&mut self) -> &mut String {
        &mut self.path
    }

    pub fn key_mut(&mut self) -> &mut String {
        &mut self.key
    }

    pub fn secure_mut(&mut self) -> &mut bool {
        &mut self.secure
    }

    pub fn heartbeat_interval_mut(&mut self) -> &mut Duration {
        &mut self.heartbeat_interval
    }

    /// Websocket endpoint for `id`. `token` identifies this session so the
    /// service can tell a reconnect from an id collision
    pub fn websocket_url(&self, id: &ParticipantId, token: &str) -> Result<Url, url::ParseError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        let mut path = self.path.clone();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        if !path.ends_with('/') {
            path.push('/');
        }

        let mut url = Url::parse(&format!(
            "{scheme}://{}:{}{path}peerjs",
            self.host, self.port
        ))?;
        url.query_pairs_mut()
            .append_pair("key", &self.key)
            .append_pair("id", id.as_str())
            .append_pair("token", token);
        Ok(url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrtcConfig {
    ice_servers: Vec<String>,
    signaling: SignalingServer,
}

impl Default for WrtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            signaling: SignalingServer::default(),
        }
    }
}

impl WrtcConfig {
    /// Plain websocket against a brokering service on this machine
    pub fn development() -> Self {
        Self {
            signaling: SignalingServer::new("127.0.0.1", 9000, false),
            ..Default::default()
        }
    }

    pub fn ice_servers(&self) -> &[String] {
        &self.ice_servers
    }

    pub fn signaling(&self) -> &SignalingServer {
        &self.signaling
    }

    pub fn ice_servers_mut(&mut self) -> &mut Vec<String> {
        &mut self.ice_servers
    }

    pub fn signaling_mut(&mut self) -> &mut SignalingServer {
        &mut self.signaling
    }
}
