// crates/trimatrix-p2p/src/envelope.rs
//
// Wire codec: `{"type": ..., "payload": ...}` JSON envelopes, one per line.
//
// The message set is closed, but decoding keeps the raw type string around
// so unknown types can be answered with an ERROR envelope instead of
// dropping the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trimatrix_core::{MatrixError, MatrixMetadata, Triad};

/// Tag a protocol label must contain to be preferred during negotiation.
pub const PROTOCOL_TAG: &str = "trimatrix";

/// Label used when a peer offers nothing usable.
pub const DEFAULT_PROTOCOL: &str = "trimatrix/1.0";

/// Raw wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

/// HANDSHAKE payload: the sender's advertised address and offered labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub address: String,
    pub protocols: Vec<String>,
}

/// PEERS payload: addresses the recipient may dial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersPayload {
    pub addresses: Vec<String>,
}

/// SYNC_LEDGER payload: an opaque batch of ledger entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLedgerPayload {
    pub entries: Vec<Value>,
}

/// SYNC_LEDGER_CONFIRMATION payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatusPayload {
    pub status: String,
}

/// ERROR payload: informational, never fatal to the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

/// A decoded peer message.
#[derive(Debug, Clone)]
pub enum Message {
    Handshake(HandshakePayload),
    Discovery,
    Peers(PeersPayload),
    NewTriad(Triad),
    ValidateTriad(Triad),
    ValidatedConfirmation(Triad),
    GetStatus,
    StatusUpdate(MatrixMetadata),
    SyncLedger(SyncLedgerPayload),
    SyncLedgerConfirmation(SyncStatusPayload),
    Error(ErrorPayload),
}

/// Why a wire line failed to decode.
#[derive(Debug)]
pub enum DecodeError {
    /// Well-formed envelope with a type outside the protocol set.
    UnknownType(String),
    /// Unparseable envelope or payload.
    Malformed(String),
}

impl Message {
    /// Wire type string for this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake(_) => "HANDSHAKE",
            Message::Discovery => "DISCOVERY",
            Message::Peers(_) => "PEERS",
            Message::NewTriad(_) => "NEW_TRIAD",
            Message::ValidateTriad(_) => "VALIDATE_TRIAD",
            Message::ValidatedConfirmation(_) => "TRIAD_VALIDATED_CONFIRMATION",
            Message::GetStatus => "GET_STATUS",
            Message::StatusUpdate(_) => "STATUS_UPDATE",
            Message::SyncLedger(_) => "SYNC_LEDGER",
            Message::SyncLedgerConfirmation(_) => "SYNC_LEDGER_CONFIRMATION",
            Message::Error(_) => "ERROR",
        }
    }

    /// Encode as a single JSON line (without the trailing newline).
    pub fn encode(&self) -> Result<String, MatrixError> {
        let payload = match self {
            Message::Handshake(p) => serde_json::to_value(p)?,
            Message::Discovery | Message::GetStatus => Value::Object(Default::default()),
            Message::Peers(p) => serde_json::to_value(p)?,
            Message::NewTriad(t)
            | Message::ValidateTriad(t)
            | Message::ValidatedConfirmation(t) => serde_json::to_value(t)?,
            Message::StatusUpdate(m) => serde_json::to_value(m)?,
            Message::SyncLedger(p) => serde_json::to_value(p)?,
            Message::SyncLedgerConfirmation(p) => serde_json::to_value(p)?,
            Message::Error(p) => serde_json::to_value(p)?,
        };

        let envelope = Envelope {
            kind: self.kind().to_string(),
            payload,
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    /// Decode a wire line.
    pub fn decode(line: &str) -> Result<Message, DecodeError> {
        let envelope: Envelope = serde_json::from_str(line)
            .map_err(|e| DecodeError::Malformed(format!("bad envelope: {}", e)))?;

        fn payload<T: serde::de::DeserializeOwned>(
            kind: &str,
            value: Value,
        ) -> Result<T, DecodeError> {
            serde_json::from_value(value)
                .map_err(|e| DecodeError::Malformed(format!("bad {} payload: {}", kind, e)))
        }

        match envelope.kind.as_str() {
            "HANDSHAKE" => Ok(Message::Handshake(payload("HANDSHAKE", envelope.payload)?)),
            "DISCOVERY" => Ok(Message::Discovery),
            "PEERS" => Ok(Message::Peers(payload("PEERS", envelope.payload)?)),
            "NEW_TRIAD" => Ok(Message::NewTriad(payload("NEW_TRIAD", envelope.payload)?)),
            "VALIDATE_TRIAD" => Ok(Message::ValidateTriad(payload(
                "VALIDATE_TRIAD",
                envelope.payload,
            )?)),
            "TRIAD_VALIDATED_CONFIRMATION" => Ok(Message::ValidatedConfirmation(payload(
                "TRIAD_VALIDATED_CONFIRMATION",
                envelope.payload,
            )?)),
            "GET_STATUS" => Ok(Message::GetStatus),
            "STATUS_UPDATE" => Ok(Message::StatusUpdate(payload(
                "STATUS_UPDATE",
                envelope.payload,
            )?)),
            "SYNC_LEDGER" => Ok(Message::SyncLedger(payload("SYNC_LEDGER", envelope.payload)?)),
            "SYNC_LEDGER_CONFIRMATION" => Ok(Message::SyncLedgerConfirmation(payload(
                "SYNC_LEDGER_CONFIRMATION",
                envelope.payload,
            )?)),
            "ERROR" => Ok(Message::Error(payload("ERROR", envelope.payload)?)),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }
}

/// Permissive protocol-label negotiation.
///
/// Accept any offered label containing our tag, otherwise fall back to the
/// first offered label, otherwise the default. This is not a security
/// boundary.
pub fn negotiate_protocol(offered: &[String]) -> String {
    offered
        .iter()
        .find(|label| label.contains(PROTOCOL_TAG))
        .or_else(|| offered.first())
        .cloned()
        .unwrap_or_else(|| DEFAULT_PROTOCOL.to_string())
}
