use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Message types carried between the coordinator and provers. `Register`,
/// `Proof` and `Error` travel prover to coordinator, `BlockTrace` travels the
/// other way; the direction is enforced by the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MsgType {
    Error,
    Register,
    BlockTrace,
    Proof,
}

/// Outer frame exchanged on a prover connection. The payload is an opaque
/// JSON-encoded blob whose shape depends on `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Msg {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    pub payload: Vec<u8>,
}

impl Msg {
    pub fn new<T: Serialize>(msg_type: MsgType, payload: &T) -> anyhow::Result<Self> {
        Ok(Msg {
            msg_type,
            payload: serde_json::to_vec(payload)?,
        })
    }

    pub fn from_json(raw: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_json(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Handshake payload presented by a prover when its connection is opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterMsg {
    pub public_key: String,
    pub name: String,
}

/// Work assignment sent by the coordinator. `id` is the block number the
/// traces belong to and doubles as the proof session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTraceMsg {
    pub id: u64,
    pub traces: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofStatus {
    Ok,
    Error,
}

/// Proof submission for a session. `error` is only meaningful when `status`
/// is `Error`; `proof` and `final_pair` only when it is `Ok`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofMsg {
    pub id: u64,
    pub status: ProofStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub proof: Vec<u8>,
    #[serde(default)]
    pub final_pair: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_uses_type_tag() {
        let msg = Msg::new(
            MsgType::BlockTrace,
            &BlockTraceMsg {
                id: 42,
                traces: vec![1, 2, 3],
            },
        )
        .unwrap();
        let raw = msg.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["type"], "BlockTrace");

        let decoded = Msg::from_json(&raw).unwrap();
        assert_eq!(decoded.msg_type, MsgType::BlockTrace);
        let traces: BlockTraceMsg = decoded.decode_payload().unwrap();
        assert_eq!(traces.id, 42);
    }

    #[test]
    fn test_proof_msg_optional_fields_default() {
        let raw = br#"{"id":7,"status":"Error","error":"oom"}"#;
        let msg: ProofMsg = serde_json::from_slice(raw).unwrap();
        assert_eq!(msg.status, ProofStatus::Error);
        assert_eq!(msg.error.as_deref(), Some("oom"));
        assert!(msg.proof.is_empty());
        assert!(msg.final_pair.is_empty());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let raw = br#"{"type":"Gossip","payload":[]}"#;
        assert!(Msg::from_json(raw).is_err());
    }
}
