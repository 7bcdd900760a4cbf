use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalingError;

const TARGET_KEY: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description in the browser's `RTCSessionDescriptionInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Trickled candidate in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    Join,
    Rejoin,
    Offer,
    Answer,
    Ice,
    Leave,
}

/// Raw wire form: `{type, sender, data?}`. The broker relays exactly those
/// three fields, so a directed message carries its target as `data.target`.
/// A top-level `target` is still accepted from peers that send one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: SignalType,
    sender: String,
    #[serde(default, skip_serializing)]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// Presence announce. `reply_to` is set when answering someone else's
    /// announce so the newcomer learns about us.
    Join { reply_to: Option<String> },
    /// Announce after a reconnect; receivers renegotiate from scratch.
    Rejoin,
    Offer(SessionDescription),
    Answer(SessionDescription),
    Ice(IceCandidate),
    Leave,
}

impl Signal {
    pub fn kind(&self) -> SignalType {
        match self {
            Signal::Join { .. } => SignalType::Join,
            Signal::Rejoin => SignalType::Rejoin,
            Signal::Offer(_) => SignalType::Offer,
            Signal::Answer(_) => SignalType::Answer,
            Signal::Ice(_) => SignalType::Ice,
            Signal::Leave => SignalType::Leave,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub sender: String,
    /// Directed messages are dropped by everyone but the target.
    pub target: Option<String>,
    pub signal: Signal,
}

impl SignalingMessage {
    pub fn new(sender: impl Into<String>, signal: Signal) -> Self {
        Self {
            sender: sender.into(),
            target: None,
            signal,
        }
    }

    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn is_for(&self, local_id: &str) -> bool {
        self.target.as_deref().is_none_or(|target| target == local_id)
    }

    pub fn encode(&self) -> Result<Bytes, SignalingError> {
        let data = match &self.signal {
            Signal::Join { reply_to: None } | Signal::Rejoin | Signal::Leave => None,
            Signal::Join { reply_to } => Some(to_value(&JoinData {
                reply_to: reply_to.clone(),
            })?),
            Signal::Offer(desc) | Signal::Answer(desc) => Some(to_value(desc)?),
            Signal::Ice(candidate) => Some(to_value(candidate)?),
        };
        let data = match &self.target {
            Some(target) => Some(with_target(data, target)?),
            None => data,
        };
        let wire = WireMessage {
            kind: self.signal.kind(),
            sender: self.sender.clone(),
            target: None,
            data,
        };
        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|err| SignalingError::Malformed(err.to_string()))
    }

    pub fn decode(payload: &[u8]) -> Result<Self, SignalingError> {
        let wire: WireMessage = serde_json::from_slice(payload)
            .map_err(|err| SignalingError::Malformed(err.to_string()))?;
        if wire.sender.is_empty() {
            return Err(SignalingError::Malformed("empty sender".into()));
        }
        let target = match wire.target {
            Some(target) => Some(target),
            None => embedded_target(wire.data.as_ref())?,
        };
        let signal = match wire.kind {
            SignalType::Join => {
                let data: JoinData = match wire.data {
                    Some(Value::Null) | None => JoinData::default(),
                    Some(value) => from_value(value)?,
                };
                Signal::Join {
                    reply_to: data.reply_to,
                }
            }
            SignalType::Rejoin => Signal::Rejoin,
            SignalType::Leave => Signal::Leave,
            SignalType::Offer => Signal::Offer(description(wire.data, SdpKind::Offer)?),
            SignalType::Answer => Signal::Answer(description(wire.data, SdpKind::Answer)?),
            SignalType::Ice => Signal::Ice(from_value(required(wire.data, "ice")?)?),
        };
        Ok(Self {
            sender: wire.sender,
            target,
            signal,
        })
    }
}

fn with_target(data: Option<Value>, target: &str) -> Result<Value, SignalingError> {
    let mut object = match data {
        Some(Value::Object(object)) => object,
        None | Some(Value::Null) => serde_json::Map::new(),
        Some(_) => return Err(SignalingError::Malformed("signal data is not an object".into())),
    };
    object.insert(TARGET_KEY.to_string(), Value::String(target.to_string()));
    Ok(Value::Object(object))
}

fn embedded_target(data: Option<&Value>) -> Result<Option<String>, SignalingError> {
    match data.and_then(|data| data.get(TARGET_KEY)) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(target)) if !target.is_empty() => Ok(Some(target.clone())),
        Some(other) => Err(SignalingError::Malformed(format!("invalid target: {other}"))),
    }
}

fn description(data: Option<Value>, expected: SdpKind) -> Result<SessionDescription, SignalingError> {
    let desc: SessionDescription = from_value(required(data, "session description")?)?;
    if desc.kind != expected {
        return Err(SignalingError::Malformed(format!(
            "expected {expected:?} description, got {:?}",
            desc.kind
        )));
    }
    Ok(desc)
}

fn required(data: Option<Value>, what: &str) -> Result<Value, SignalingError> {
    match data {
        Some(Value::Null) | None => Err(SignalingError::Malformed(format!("missing {what} data"))),
        Some(value) => Ok(value),
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(value).map_err(|err| SignalingError::Malformed(err.to_string()))
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, SignalingError> {
    serde_json::from_value(value).map_err(|err| SignalingError::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn browser_shaped_offer_decodes() {
        let raw = json!({
            "type": "offer",
            "sender": "alice",
            "data": {"type": "offer", "sdp": "v=0"}
        });
        let message = SignalingMessage::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(message.sender, "alice");
        assert_eq!(message.target, None);
        assert_eq!(message.signal, Signal::Offer(SessionDescription::offer("v=0")));
    }

    #[test]
    fn ice_wire_shape_matches_browser_candidate() {
        let message = SignalingMessage::new(
            "bob",
            Signal::Ice(IceCandidate {
                candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            }),
        )
        .to("alice");
        let value: Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(value["type"], "ice");
        assert!(value.get("target").is_none());
        assert_eq!(value["data"]["target"], "alice");
        assert_eq!(value["data"]["sdpMid"], "0");
        assert_eq!(value["data"]["sdpMLineIndex"], 0);
        assert!(value["data"].get("usernameFragment").is_none());
    }

    #[test]
    fn join_reply_carries_reply_to() {
        let plain = SignalingMessage::new("a", Signal::Join { reply_to: None });
        let value: Value = serde_json::from_slice(&plain.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"type": "join", "sender": "a"}));

        let reply = SignalingMessage::new("a", Signal::Join { reply_to: Some("b".into()) });
        let decoded = SignalingMessage::decode(&reply.encode().unwrap()).unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        for raw in [
            r#"{"type":"offer","sender":"a"}"#,
            r#"{"type":"offer","sender":"a","data":{"type":"answer","sdp":"x"}}"#,
            r#"{"type":"wave","sender":"a"}"#,
            r#"{"type":"join","sender":""}"#,
            r#"not json"#,
        ] {
            assert!(
                matches!(SignalingMessage::decode(raw.as_bytes()), Err(SignalingError::Malformed(_))),
                "{raw} should be rejected"
            );
        }
    }

    /// Re-serializes the way the broker does: only `type`, `sender` and
    /// `data` survive the hop.
    fn relay(encoded: &[u8]) -> Vec<u8> {
        let value: Value = serde_json::from_slice(encoded).unwrap();
        let relayed = json!({
            "type": value["type"],
            "sender": value["sender"],
            "data": value.get("data").cloned().unwrap_or(Value::Null),
        });
        serde_json::to_vec(&relayed).unwrap()
    }

    #[test]
    fn target_survives_broker_relay() {
        let messages = [
            SignalingMessage::new("a", Signal::Join { reply_to: Some("b".into()) }).to("b"),
            SignalingMessage::new("a", Signal::Offer(SessionDescription::offer("v=0"))).to("b"),
            SignalingMessage::new("a", Signal::Answer(SessionDescription::answer("v=0"))).to("b"),
            SignalingMessage::new(
                "a",
                Signal::Ice(IceCandidate {
                    candidate: "candidate:1".into(),
                    sdp_mid: None,
                    sdp_mline_index: None,
                    username_fragment: None,
                }),
            )
            .to("b"),
            SignalingMessage::new("a", Signal::Leave).to("b"),
            SignalingMessage::new("a", Signal::Rejoin),
        ];
        for message in messages {
            let relayed = SignalingMessage::decode(&relay(&message.encode().unwrap())).unwrap();
            assert_eq!(relayed, message);
            if message.target.is_some() {
                assert!(!relayed.is_for("c"), "{:?} leaked to a bystander", message.signal);
            }
        }
    }

    #[test]
    fn top_level_target_still_accepted() {
        let raw = json!({
            "type": "answer",
            "sender": "b",
            "target": "a",
            "data": {"type": "answer", "sdp": "v=0"}
        });
        let message = SignalingMessage::decode(raw.to_string().as_bytes()).unwrap();
        assert_eq!(message.target.as_deref(), Some("a"));

        let bad = json!({"type": "leave", "sender": "b", "data": {"target": 7}});
        assert!(SignalingMessage::decode(bad.to_string().as_bytes()).is_err());
    }

    #[test]
    fn targeting() {
        let open = SignalingMessage::new("a", Signal::Leave);
        assert!(open.is_for("anyone"));
        let directed = open.to("b");
        assert!(directed.is_for("b"));
        assert!(!directed.is_for("c"));
    }
}
