//! Transactions, messages and their execution results.

use crate::error::Result;
use crate::events::Event;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A message dispatched to a module handler.
pub trait Msg: Send + Sync + fmt::Debug {
    /// Fully qualified type name; the key of the message service router.
    fn type_url(&self) -> &str;

    /// Stateless well-formedness check, run before the ante phase.
    fn validate_basic(&self) -> Result<()> {
        Ok(())
    }

    /// Route of the legacy string-keyed router, if the message has one.
    fn route(&self) -> Option<&str> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// A decoded transaction: an ordered list of messages.
pub trait Tx: Send + Sync + fmt::Debug {
    fn msgs(&self) -> &[Box<dyn Msg>];

    fn as_any(&self) -> &dyn Any;
}

pub type TxDecoder = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn Tx>> + Send + Sync>;

/// SHA-256 of the raw transaction bytes.
pub fn tx_checksum(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// One transaction of a block in canonical order.
#[derive(Clone)]
pub struct TxEntry {
    /// Absolute index in the block.
    pub index: usize,
    pub bytes: Arc<[u8]>,
    /// Decoded transaction, or the reason decoding failed.
    pub tx: Result<Arc<dyn Tx>>,
    pub checksum: [u8; 32],
}

impl TxEntry {
    pub fn decode(index: usize, bytes: &[u8], decoder: &TxDecoder) -> Self {
        Self {
            index,
            bytes: Arc::from(bytes),
            tx: decoder(bytes),
            checksum: tx_checksum(bytes),
        }
    }

    pub fn decoded(&self) -> Result<&Arc<dyn Tx>> {
        self.tx.as_ref().map_err(Clone::clone)
    }
}

impl fmt::Debug for TxEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TxEntry")
            .field("index", &self.index)
            .field("checksum", &hex::encode(self.checksum))
            .field("decoded", &self.tx.is_ok())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GasInfo {
    pub gas_wanted: u64,
    pub gas_used: u64,
}

/// What a message handler returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgResult {
    pub data: Vec<u8>,
    pub log: String,
    pub events: Vec<Event>,
}

/// Response data of one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgData {
    pub msg_type: String,
    pub data: Vec<u8>,
}

/// Log entry of one message, rendered as JSON into the transaction log.
#[derive(Debug, Clone, Serialize)]
pub struct MessageLog {
    pub msg_index: usize,
    pub log: String,
    pub events: Vec<Event>,
}

/// Aggregated result of all messages of a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxResult {
    pub data: Vec<u8>,
    pub log: String,
    pub events: Vec<Event>,
    pub msg_responses: Vec<MsgData>,
}

/// Length-prefixed concatenation of `(type, data)` pairs.
pub fn encode_msg_data(msg_data: &[MsgData]) -> Vec<u8> {
    let mut out = Vec::new();
    for item in msg_data {
        for part in [item.msg_type.as_bytes(), item.data.as_slice()] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
    }
    out
}

pub fn render_logs(logs: &[MessageLog]) -> String {
    serde_json::to_string(logs).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_checksum_is_sha256() {
        assert_eq!(
            hex::encode(tx_checksum(b"")),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_decode_failure_is_kept() {
        let decoder: TxDecoder = Arc::new(|_| Err(Error::TxDecode("bad bytes".into())));
        let entry = TxEntry::decode(3, b"\x01", &decoder);
        assert_eq!(entry.index, 3);
        assert!(matches!(entry.decoded(), Err(Error::TxDecode(_))));
    }

    #[test]
    fn test_encode_msg_data() {
        let encoded = encode_msg_data(&[MsgData {
            msg_type: "a".into(),
            data: vec![7],
        }]);
        assert_eq!(encoded, vec![0, 0, 0, 1, b'a', 0, 0, 0, 1, 7]);
    }
}
