use serde::{Deserialize, Serialize};

/// Where the signaling relay lives and how this participant authenticates
/// to it. The link is only brought up while a token is present.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayConfig {
    pub url: String,
    pub token: Option<String>,
}

/// Configuration of one ICE server ('stun' or 'turn').
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IceServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    /// TURN entries need credentials; everything needs a URL.
    pub fn is_valid(&self) -> bool {
        if self.url.is_empty() {
            return false;
        }
        if self.r#type == "turn" && (self.username.is_none() || self.credential.is_none()) {
            return false;
        }
        true
    }
}

/// Public STUN servers used when the application configures nothing else.
pub fn default_ice_servers() -> Vec<IceServerConfig> {
    vec![
        IceServerConfig {
            id: "default-stun-0".into(),
            r#type: "stun".into(),
            url: "stun:stun.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
        IceServerConfig {
            id: "default-stun-1".into(),
            r#type: "stun".into(),
            url: "stun:stun1.l.google.com:19302".into(),
            username: None,
            credential: None,
        },
    ]
}

/// Everything one participant needs to negotiate calls.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub relay: RelayConfig,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServerConfig>,
}

impl Config {
    pub fn new(relay_url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            relay: RelayConfig {
                url: relay_url.into(),
                token,
            },
            ice_servers: default_ice_servers(),
        }
    }
}
