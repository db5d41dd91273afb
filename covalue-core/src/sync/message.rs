//! Sync protocol messages
//!
//! Four messages per value, all keyed by value id:
//!
//! - `load`: "this is what I have, send me what I lack"
//! - `known`: "this is what I have now"; with `isCorrection` the receiver
//!   must replace its estimate instead of merging
//! - `content`: header and/or verifiable session pieces
//! - `done`: the sender has nothing further for the value

use crate::core_value::{CoValueId, KnownState, NewContent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    Load(KnownState),
    #[serde(rename_all = "camelCase")]
    Known {
        #[serde(flatten)]
        known: KnownState,
        #[serde(default)]
        is_correction: bool,
    },
    Content(NewContent),
    Done { id: CoValueId },
}

impl SyncMessage {
    pub fn known(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: false,
        }
    }

    pub fn correction(known: KnownState) -> Self {
        SyncMessage::Known {
            known,
            is_correction: true,
        }
    }

    pub fn id(&self) -> &CoValueId {
        match self {
            SyncMessage::Load(known) | SyncMessage::Known { known, .. } => &known.id,
            SyncMessage::Content(content) => &content.id,
            SyncMessage::Done { id } => id,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            SyncMessage::Load(_) => "load",
            SyncMessage::Known { .. } => "known",
            SyncMessage::Content(_) => "content",
            SyncMessage::Done { .. } => "done",
        }
    }

    /// Wire encoding
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_value::{ActorId, AgentId, SessionId};

    fn known_state() -> KnownState {
        let id = CoValueId::from_digest(&[7u8; 32]);
        let actor = ActorId::Agent(AgentId::from_public_keys(&[1u8; 32], &[2u8; 32]));
        let mut known = KnownState::empty(id);
        known.header = true;
        known.set(SessionId::new(&actor, "salt"), 3);
        known
    }

    #[test]
    fn test_known_message_wire_shape() {
        let msg = SyncMessage::correction(known_state());
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["action"], "known");
        assert_eq!(json["isCorrection"], true);
        assert_eq!(json["header"], true);
        assert!(json["id"].as_str().unwrap().starts_with("co_z"));
    }

    #[test]
    fn test_messages_survive_the_wire() {
        let known = known_state();
        let messages = vec![
            SyncMessage::Load(known.clone()),
            SyncMessage::known(known.clone()),
            SyncMessage::Done { id: known.id.clone() },
        ];
        for msg in messages {
            let decoded = SyncMessage::from_json(&msg.to_json().unwrap()).unwrap();
            assert_eq!(decoded, msg);
            assert_eq!(decoded.id(), &known.id);
        }
    }

    #[test]
    fn test_known_without_correction_flag_defaults_false() {
        let id = CoValueId::from_digest(&[9u8; 32]);
        let raw = format!(r#"{{"action":"known","id":"{}","header":false,"sessions":{{}}}}"#, id);
        match SyncMessage::from_json(&raw).unwrap() {
            SyncMessage::Known { is_correction, known } => {
                assert!(!is_correction);
                assert!(!known.header);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
