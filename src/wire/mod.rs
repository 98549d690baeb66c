//! Wire protocol message schemas and CBOR encoding.
//!
//! Three messages cross the network during reconfiguration: migration
//! batches, migration completes, and topology-change requests. The
//! persisted topology value shares this codec (see [`value`]).

pub mod value;

use std::convert::Infallible;

use minicbor::{Decoder, Encoder};
use thiserror::Error;

use crate::core::{Topology, TxnFrame, TxnId, VarIdPos, VarUuid};
use crate::core::Positions;
use bytes::Bytes;

pub const PROTOCOL_VERSION_V1: u32 = 1;

/// Decode guards; a peer cannot make us allocate without bound.
#[derive(Clone, Copy, Debug)]
pub struct WireLimits {
    pub max_list_len: u64,
    pub max_value_bytes: u64,
    pub max_text_bytes: u64,
}

impl Default for WireLimits {
    fn default() -> Self {
        WireLimits {
            max_list_len: 1 << 16,
            max_value_bytes: 1 << 26,
            max_text_bytes: 1 << 12,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub version: u32,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Migration(Migration),
    MigrationComplete(MigrationComplete),
    TopologyChangeRequest(TopologyChangeRequest),
}

/// A batch of variables and the transactions that last wrote them,
/// shipped to a peer that the in-progress topology places them on.
#[derive(Clone, Debug, PartialEq)]
pub struct Migration {
    pub version: u32,
    pub txns: Vec<TxnFrame>,
    pub vars: Vec<MigratedVar>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigratedVar {
    pub uuid: VarUuid,
    pub positions: Positions,
    pub value: Bytes,
    pub refs: Vec<VarIdPos>,
    pub write_txn: TxnId,
}

/// Terminal marker: the sender has emitted every batch for `version`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MigrationComplete {
    pub version: u32,
}

/// A node that cannot drive a configuration change itself asks the
/// current quorum to drive it.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologyChangeRequest {
    pub config: Topology,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Migration,
    MigrationComplete,
    TopologyChangeRequest,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Migration => "MIGRATION",
            MessageType::MigrationComplete => "MIGRATION_COMPLETE",
            MessageType::TopologyChangeRequest => "TOPOLOGY_CHANGE_REQUEST",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "MIGRATION" => Some(MessageType::Migration),
            "MIGRATION_COMPLETE" => Some(MessageType::MigrationComplete),
            "TOPOLOGY_CHANGE_REQUEST" => Some(MessageType::TopologyChangeRequest),
            _ => None,
        }
    }
}

impl Message {
    fn message_type(&self) -> MessageType {
        match self {
            Message::Migration(_) => MessageType::Migration,
            Message::MigrationComplete(_) => MessageType::MigrationComplete,
            Message::TopologyChangeRequest(_) => MessageType::TopologyChangeRequest,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<Infallible>),
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    encode_message_body(&mut enc, &envelope.message)?;
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8], limits: &WireLimits) -> Result<Envelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = value::decode_map_len(&mut dec, limits)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = value::decode_text(&mut dec, limits)?;
        match key.as_str() {
            "v" => version = Some(value::decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = value::decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(&raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => dec.skip()?,
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    let body_bytes = &bytes[start..end];

    let message = decode_message_body(message_type, body_bytes, limits)?;
    Ok(Envelope { version, message })
}

fn encode_message_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    message: &Message,
) -> Result<(), ProtoEncodeError> {
    match message {
        Message::Migration(msg) => encode_migration(enc, msg),
        Message::MigrationComplete(msg) => {
            enc.map(1)?;
            enc.str("version")?;
            enc.u32(msg.version)?;
            Ok(())
        }
        Message::TopologyChangeRequest(msg) => {
            enc.map(1)?;
            enc.str("config")?;
            value::encode_topology(enc, &msg.config)?;
            Ok(())
        }
    }
}

fn decode_message_body(
    message_type: MessageType,
    bytes: &[u8],
    limits: &WireLimits,
) -> Result<Message, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let message = match message_type {
        MessageType::Migration => Message::Migration(decode_migration(&mut dec, limits)?),
        MessageType::MigrationComplete => {
            let map_len = value::decode_map_len(&mut dec, limits)?;
            let mut version = None;
            for _ in 0..map_len {
                match value::decode_text(&mut dec, limits)?.as_str() {
                    "version" => version = Some(value::decode_u32(&mut dec, "version")?),
                    _ => dec.skip()?,
                }
            }
            Message::MigrationComplete(MigrationComplete {
                version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
            })
        }
        MessageType::TopologyChangeRequest => {
            let map_len = value::decode_map_len(&mut dec, limits)?;
            let mut config = None;
            for _ in 0..map_len {
                match value::decode_text(&mut dec, limits)?.as_str() {
                    "config" => config = Some(value::decode_topology(&mut dec, limits)?),
                    _ => dec.skip()?,
                }
            }
            Message::TopologyChangeRequest(TopologyChangeRequest {
                config: config.ok_or(ProtoDecodeError::MissingField("config"))?,
            })
        }
    };

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    Ok(message)
}

fn encode_migration(
    enc: &mut Encoder<&mut Vec<u8>>,
    msg: &Migration,
) -> Result<(), ProtoEncodeError> {
    enc.map(3)?;
    enc.str("version")?;
    enc.u32(msg.version)?;
    enc.str("txns")?;
    enc.array(msg.txns.len() as u64)?;
    for txn in &msg.txns {
        value::encode_txn_frame(enc, txn)?;
    }
    enc.str("vars")?;
    enc.array(msg.vars.len() as u64)?;
    for var in &msg.vars {
        encode_migrated_var(enc, var)?;
    }
    Ok(())
}

fn decode_migration(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Migration, ProtoDecodeError> {
    let map_len = value::decode_map_len(dec, limits)?;
    let mut version = None;
    let mut txns = None;
    let mut vars = None;
    for _ in 0..map_len {
        match value::decode_text(dec, limits)?.as_str() {
            "version" => version = Some(value::decode_u32(dec, "version")?),
            "txns" => {
                let len = value::decode_array_len(dec, limits)?;
                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    out.push(value::decode_txn_frame(dec, limits)?);
                }
                txns = Some(out);
            }
            "vars" => {
                let len = value::decode_array_len(dec, limits)?;
                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    out.push(decode_migrated_var(dec, limits)?);
                }
                vars = Some(out);
            }
            _ => dec.skip()?,
        }
    }
    Ok(Migration {
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        txns: txns.ok_or(ProtoDecodeError::MissingField("txns"))?,
        vars: vars.ok_or(ProtoDecodeError::MissingField("vars"))?,
    })
}

fn encode_migrated_var(
    enc: &mut Encoder<&mut Vec<u8>>,
    var: &MigratedVar,
) -> Result<(), ProtoEncodeError> {
    enc.map(5)?;
    enc.str("uuid")?;
    enc.bytes(var.uuid.as_bytes())?;
    enc.str("positions")?;
    enc.bytes(var.positions.as_bytes())?;
    enc.str("value")?;
    enc.bytes(&var.value)?;
    enc.str("refs")?;
    value::encode_refs(enc, &var.refs)?;
    enc.str("write_txn")?;
    enc.bytes(var.write_txn.as_bytes())?;
    Ok(())
}

fn decode_migrated_var(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<MigratedVar, ProtoDecodeError> {
    let map_len = value::decode_map_len(dec, limits)?;
    let mut uuid = None;
    let mut positions = None;
    let mut val = None;
    let mut refs = None;
    let mut write_txn = None;
    for _ in 0..map_len {
        match value::decode_text(dec, limits)?.as_str() {
            "uuid" => uuid = Some(value::decode_var_uuid(dec)?),
            "positions" => positions = Some(value::decode_positions(dec, limits)?),
            "value" => val = Some(value::decode_value_bytes(dec, limits)?),
            "refs" => refs = Some(value::decode_refs(dec, limits)?),
            "write_txn" => write_txn = Some(value::decode_txn_id(dec)?),
            _ => dec.skip()?,
        }
    }
    Ok(MigratedVar {
        uuid: uuid.ok_or(ProtoDecodeError::MissingField("uuid"))?,
        positions: positions.ok_or(ProtoDecodeError::MissingField("positions"))?,
        value: val.ok_or(ProtoDecodeError::MissingField("value"))?,
        refs: refs.ok_or(ProtoDecodeError::MissingField("refs"))?,
        write_txn: write_txn.ok_or(ProtoDecodeError::MissingField("write_txn"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Action, Allocation, RmId};

    fn roundtrip(message: Message) -> Message {
        let envelope = Envelope {
            version: PROTOCOL_VERSION_V1,
            message,
        };
        let bytes = encode_envelope(&envelope).expect("encode");
        let decoded = decode_envelope(&bytes, &WireLimits::default()).expect("decode");
        assert_eq!(decoded.version, PROTOCOL_VERSION_V1);
        decoded.message
    }

    #[test]
    fn migration_complete_roundtrips() {
        let message = Message::MigrationComplete(MigrationComplete { version: 9 });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn migration_roundtrips() {
        let txn = TxnFrame {
            id: Some(TxnId::new(11, RmId(2), 3)),
            submitter: RmId(2),
            submitter_boot_count: 3,
            actions: vec![(
                VarUuid([7u8; 16]),
                Action::Write {
                    value: Bytes::from_static(b"payload"),
                    refs: vec![VarIdPos {
                        var: VarUuid([8u8; 16]),
                        positions: Positions::new(vec![0, 1, 2]),
                    }],
                },
            )],
            allocations: vec![Allocation {
                rm_id: RmId(2),
                active_boot_count: 3,
                action_indices: vec![0],
            }],
            f_inc: 1,
            topology_version: 4,
        };
        let var = MigratedVar {
            uuid: VarUuid([7u8; 16]),
            positions: Positions::new(vec![0, 1, 2]),
            value: Bytes::from_static(b"payload"),
            refs: Vec::new(),
            write_txn: TxnId::new(11, RmId(2), 3),
        };
        let message = Message::Migration(Migration {
            version: 2,
            txns: vec![txn],
            vars: vec![var],
        });
        assert_eq!(roundtrip(message.clone()), message);
    }

    #[test]
    fn unknown_message_type_is_rejected() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf);
        enc.map(3).unwrap();
        enc.str("v").unwrap();
        enc.u32(1).unwrap();
        enc.str("type").unwrap();
        enc.str("GOSSIP").unwrap();
        enc.str("body").unwrap();
        enc.map(0).unwrap();
        assert!(matches!(
            decode_envelope(&buf, &WireLimits::default()),
            Err(ProtoDecodeError::UnknownMessageType(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let envelope = Envelope {
            version: PROTOCOL_VERSION_V1,
            message: Message::MigrationComplete(MigrationComplete { version: 1 }),
        };
        let mut bytes = encode_envelope(&envelope).unwrap();
        bytes.push(0x00);
        assert!(matches!(
            decode_envelope(&bytes, &WireLimits::default()),
            Err(ProtoDecodeError::TrailingBytes)
        ));
    }
}
