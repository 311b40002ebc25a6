//! Wire protocol spoken with the signaling relay.
//!
//! The relay forwards these envelopes verbatim to the other member of the
//! room and never looks inside `offer`/`answer`/`candidate`.

use crate::peer::types::{DescriptionPayload, IceCandidate};
use serde::{Deserialize, Serialize};

/// Events this peer sends to the relay.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinChat {
        #[serde(rename = "chatId")]
        chat_id: String,
    },
    Offer {
        #[serde(rename = "chatId")]
        chat_id: String,
        offer: DescriptionPayload,
    },
    Answer {
        #[serde(rename = "chatId")]
        chat_id: String,
        answer: DescriptionPayload,
    },
    IceCandidate {
        #[serde(rename = "chatId")]
        chat_id: String,
        candidate: IceCandidate,
    },
}

/// Events the relay forwards from the other room member.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Offer { offer: DescriptionPayload },
    Answer { answer: DescriptionPayload },
    IceCandidate { candidate: IceCandidate },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{SdpKind, SessionDescription};

    fn payload() -> DescriptionPayload {
        DescriptionPayload {
            description: SessionDescription {
                kind: SdpKind::Offer,
                sdp: "v=0\r\n".into(),
            },
            peer_id: "a1b2".into(),
            ts: 1_700_000_000,
        }
    }

    #[test]
    fn join_chat_wire_shape() {
        let json = serde_json::to_value(ClientEvent::JoinChat {
            chat_id: "r1".into(),
        })
        .unwrap();
        assert_eq!(json["event"], "join_chat");
        assert_eq!(json["chatId"], "r1");
    }

    #[test]
    fn offer_wire_shape() {
        let json = serde_json::to_value(ClientEvent::Offer {
            chat_id: "r1".into(),
            offer: payload(),
        })
        .unwrap();
        assert_eq!(json["event"], "offer");
        assert_eq!(json["chatId"], "r1");
        assert_eq!(json["offer"]["peer_id"], "a1b2");
        assert_eq!(json["offer"]["description"]["kind"], "offer");
    }

    #[test]
    fn candidate_roundtrip() {
        let event = ServerEvent::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 1 192.0.2.1 50000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        match back {
            ServerEvent::IceCandidate { candidate } => {
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
