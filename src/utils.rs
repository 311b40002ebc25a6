use crate::config::IceServerConfig;
use rand::Rng;

/// Stable random identity for this participant. Besides labelling outgoing
/// descriptions, it is the tie-breaker for simultaneous offers.
pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prepends the matching scheme to an ICE server URL when it is missing.
pub fn add_ice_url_scheme(config: &IceServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(kind: &str, url: &str) -> IceServerConfig {
        IceServerConfig {
            id: "t".into(),
            r#type: kind.into(),
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    #[test]
    fn scheme_added_only_when_missing() {
        assert_eq!(
            add_ice_url_scheme(&server("stun", "stun.example.org:3478")),
            "stun:stun.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("turn", "turn.example.org:3478")),
            "turn:turn.example.org:3478"
        );
        assert_eq!(
            add_ice_url_scheme(&server("turn", "turn:already.example.org")),
            "turn:already.example.org"
        );
    }

    #[test]
    fn identities_differ() {
        assert_ne!(random_id(), random_id());
        assert_eq!(random_id().len(), 16);
    }
}
