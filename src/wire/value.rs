//! CBOR encode/decode for the values that cross the wire or land in the
//! store: topology, placement conditions, and transaction frames.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use minicbor::{Decoder, Encoder};

use crate::core::{
    Action, Allocation, Cond, Generator, NextInfo, PendingMigration, Positions, RmId, Root,
    Topology, TxnFrame, TxnId, VarIdPos, VarUuid, VERSION_ZERO,
};
use crate::wire::{ProtoDecodeError, ProtoEncodeError, WireLimits};

// ---------------------------------------------------------------------------
// primitive helpers

pub(crate) fn decode_map_len(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<u64, ProtoDecodeError> {
    let len = dec.map()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if len > limits.max_list_len {
        return Err(ProtoDecodeError::DecodeLimit("map length"));
    }
    Ok(len)
}

pub(crate) fn decode_array_len(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<u64, ProtoDecodeError> {
    let len = dec.array()?.ok_or(ProtoDecodeError::IndefiniteLength)?;
    if len > limits.max_list_len {
        return Err(ProtoDecodeError::DecodeLimit("array length"));
    }
    Ok(len)
}

pub(crate) fn decode_text(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<String, ProtoDecodeError> {
    let text = dec.str()?;
    if text.len() as u64 > limits.max_text_bytes {
        return Err(ProtoDecodeError::DecodeLimit("text length"));
    }
    Ok(text.to_string())
}

pub(crate) fn decode_u32(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<u32, ProtoDecodeError> {
    dec.u32().map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

pub(crate) fn decode_u8(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<u8, ProtoDecodeError> {
    dec.u8().map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

pub(crate) fn decode_bool(
    dec: &mut Decoder<'_>,
    field: &'static str,
) -> Result<bool, ProtoDecodeError> {
    dec.bool().map_err(|err| ProtoDecodeError::InvalidField {
        field,
        reason: err.to_string(),
    })
}

pub(crate) fn decode_var_uuid(dec: &mut Decoder<'_>) -> Result<VarUuid, ProtoDecodeError> {
    let bytes = dec.bytes()?;
    VarUuid::from_slice(bytes).ok_or(ProtoDecodeError::InvalidField {
        field: "uuid",
        reason: format!("expected 16 bytes, got {}", bytes.len()),
    })
}

pub(crate) fn decode_txn_id(dec: &mut Decoder<'_>) -> Result<TxnId, ProtoDecodeError> {
    let bytes = dec.bytes()?;
    TxnId::from_slice(bytes).ok_or(ProtoDecodeError::InvalidField {
        field: "txn id",
        reason: format!("expected 16 bytes, got {}", bytes.len()),
    })
}

pub(crate) fn decode_positions(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Positions, ProtoDecodeError> {
    let bytes = dec.bytes()?;
    if bytes.len() as u64 > limits.max_list_len {
        return Err(ProtoDecodeError::DecodeLimit("positions length"));
    }
    Ok(Positions::new(bytes.to_vec()))
}

pub(crate) fn decode_value_bytes(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Bytes, ProtoDecodeError> {
    let bytes = dec.bytes()?;
    if bytes.len() as u64 > limits.max_value_bytes {
        return Err(ProtoDecodeError::DecodeLimit("value length"));
    }
    Ok(Bytes::copy_from_slice(bytes))
}

fn encode_text_list(
    enc: &mut Encoder<&mut Vec<u8>>,
    items: &[String],
) -> Result<(), ProtoEncodeError> {
    enc.array(items.len() as u64)?;
    for item in items {
        enc.str(item)?;
    }
    Ok(())
}

fn decode_text_list(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Vec<String>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits)?;
    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        out.push(decode_text(dec, limits)?);
    }
    Ok(out)
}

fn encode_rm_list(enc: &mut Encoder<&mut Vec<u8>>, items: &[RmId]) -> Result<(), ProtoEncodeError> {
    enc.array(items.len() as u64)?;
    for rm in items {
        enc.u32(rm.0)?;
    }
    Ok(())
}

fn decode_rm_list(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Vec<RmId>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits)?;
    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        out.push(RmId(decode_u32(dec, "rm id")?));
    }
    Ok(out)
}

pub(crate) fn encode_refs(
    enc: &mut Encoder<&mut Vec<u8>>,
    refs: &[VarIdPos],
) -> Result<(), ProtoEncodeError> {
    enc.array(refs.len() as u64)?;
    for var_ref in refs {
        enc.map(2)?;
        enc.str("var")?;
        enc.bytes(var_ref.var.as_bytes())?;
        enc.str("positions")?;
        enc.bytes(var_ref.positions.as_bytes())?;
    }
    Ok(())
}

pub(crate) fn decode_refs(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Vec<VarIdPos>, ProtoDecodeError> {
    let len = decode_array_len(dec, limits)?;
    let mut out = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let map_len = decode_map_len(dec, limits)?;
        let mut var = None;
        let mut positions = None;
        for _ in 0..map_len {
            match decode_text(dec, limits)?.as_str() {
                "var" => var = Some(decode_var_uuid(dec)?),
                "positions" => positions = Some(decode_positions(dec, limits)?),
                _ => dec.skip()?,
            }
        }
        out.push(VarIdPos {
            var: var.ok_or(ProtoDecodeError::MissingField("var"))?,
            positions: positions.ok_or(ProtoDecodeError::MissingField("positions"))?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// conditions

pub fn encode_cond(enc: &mut Encoder<&mut Vec<u8>>, cond: &Cond) -> Result<(), ProtoEncodeError> {
    match cond {
        Cond::Generator(gen) => {
            enc.map(7)?;
            enc.str("kind")?;
            enc.str("gen")?;
            enc.str("rm")?;
            enc.u32(gen.rm_id.0)?;
            enc.str("perm_len")?;
            enc.u32(gen.perm_len as u32)?;
            enc.str("start")?;
            enc.u32(gen.start as u32)?;
            enc.str("len")?;
            enc.u32(gen.len as u32)?;
            enc.str("len_adjust")?;
            encode_rm_list(enc, &gen.len_adjust_intersect)?;
            enc.str("includes")?;
            enc.bool(gen.includes)?;
        }
        Cond::And { left, right } => {
            enc.map(3)?;
            enc.str("kind")?;
            enc.str("and")?;
            enc.str("left")?;
            encode_cond(enc, left)?;
            enc.str("right")?;
            encode_cond(enc, right)?;
        }
        Cond::Or { left, right } => {
            enc.map(3)?;
            enc.str("kind")?;
            enc.str("or")?;
            enc.str("left")?;
            encode_cond(enc, left)?;
            enc.str("right")?;
            encode_cond(enc, right)?;
        }
    }
    Ok(())
}

pub fn decode_cond(dec: &mut Decoder<'_>, limits: &WireLimits) -> Result<Cond, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut kind = None;
    let mut rm = None;
    let mut perm_len = None;
    let mut start = None;
    let mut len = None;
    let mut len_adjust = None;
    let mut includes = None;
    let mut left = None;
    let mut right = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "kind" => kind = Some(decode_text(dec, limits)?),
            "rm" => rm = Some(RmId(decode_u32(dec, "rm")?)),
            "perm_len" => perm_len = Some(decode_u32(dec, "perm_len")? as usize),
            "start" => start = Some(decode_u32(dec, "start")? as usize),
            "len" => len = Some(decode_u32(dec, "len")? as usize),
            "len_adjust" => len_adjust = Some(decode_rm_list(dec, limits)?),
            "includes" => includes = Some(decode_bool(dec, "includes")?),
            "left" => left = Some(decode_cond(dec, limits)?),
            "right" => right = Some(decode_cond(dec, limits)?),
            _ => dec.skip()?,
        }
    }
    match kind.as_deref() {
        Some("gen") => Ok(Cond::Generator(Generator {
            rm_id: rm.ok_or(ProtoDecodeError::MissingField("rm"))?,
            perm_len: perm_len.ok_or(ProtoDecodeError::MissingField("perm_len"))?,
            start: start.ok_or(ProtoDecodeError::MissingField("start"))?,
            len: len.ok_or(ProtoDecodeError::MissingField("len"))?,
            len_adjust_intersect: len_adjust.unwrap_or_default(),
            includes: includes.ok_or(ProtoDecodeError::MissingField("includes"))?,
        })),
        Some("and") => Ok(Cond::And {
            left: Box::new(left.ok_or(ProtoDecodeError::MissingField("left"))?),
            right: Box::new(right.ok_or(ProtoDecodeError::MissingField("right"))?),
        }),
        Some("or") => Ok(Cond::Or {
            left: Box::new(left.ok_or(ProtoDecodeError::MissingField("left"))?),
            right: Box::new(right.ok_or(ProtoDecodeError::MissingField("right"))?),
        }),
        Some(other) => Err(ProtoDecodeError::InvalidField {
            field: "kind",
            reason: format!("unknown condition kind '{other}'"),
        }),
        None => Err(ProtoDecodeError::MissingField("kind")),
    }
}

// ---------------------------------------------------------------------------
// topology

pub fn encode_topology(
    enc: &mut Encoder<&mut Vec<u8>>,
    topology: &Topology,
) -> Result<(), ProtoEncodeError> {
    let mut len = 7;
    if topology.root.is_some() {
        len += 1;
    }
    if topology.next.is_some() {
        len += 1;
    }
    enc.map(len)?;

    enc.str("cluster_id")?;
    enc.str(&topology.cluster_id)?;
    enc.str("version")?;
    enc.u32(topology.version)?;
    enc.str("hosts")?;
    encode_text_list(enc, &topology.hosts)?;
    enc.str("f")?;
    enc.u8(topology.f)?;
    enc.str("max_rm_count")?;
    enc.u8(topology.max_rm_count)?;
    enc.str("rms")?;
    encode_rm_list(enc, &topology.rms)?;
    enc.str("rms_removed")?;
    let removed: Vec<RmId> = topology.rms_removed.iter().copied().collect();
    encode_rm_list(enc, &removed)?;

    if let Some(root) = &topology.root {
        enc.str("root")?;
        enc.map(2)?;
        enc.str("var")?;
        enc.bytes(root.var.as_bytes())?;
        enc.str("positions")?;
        enc.bytes(root.positions.as_bytes())?;
    }

    if let Some(next) = &topology.next {
        enc.str("next")?;
        encode_next(enc, next)?;
    }
    Ok(())
}

pub fn decode_topology(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Topology, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut cluster_id = None;
    let mut version = None;
    let mut hosts = None;
    let mut f = None;
    let mut max_rm_count = None;
    let mut rms = None;
    let mut rms_removed = None;
    let mut root = None;
    let mut next = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "cluster_id" => cluster_id = Some(decode_text(dec, limits)?),
            "version" => version = Some(decode_u32(dec, "version")?),
            "hosts" => hosts = Some(decode_text_list(dec, limits)?),
            "f" => f = Some(decode_u8(dec, "f")?),
            "max_rm_count" => max_rm_count = Some(decode_u8(dec, "max_rm_count")?),
            "rms" => rms = Some(decode_rm_list(dec, limits)?),
            "rms_removed" => {
                rms_removed = Some(decode_rm_list(dec, limits)?.into_iter().collect::<BTreeSet<_>>())
            }
            "root" => {
                let root_len = decode_map_len(dec, limits)?;
                let mut var = None;
                let mut positions = None;
                for _ in 0..root_len {
                    match decode_text(dec, limits)?.as_str() {
                        "var" => var = Some(decode_var_uuid(dec)?),
                        "positions" => positions = Some(decode_positions(dec, limits)?),
                        _ => dec.skip()?,
                    }
                }
                root = Some(Root {
                    var: var.ok_or(ProtoDecodeError::MissingField("root var"))?,
                    positions: positions.ok_or(ProtoDecodeError::MissingField("root positions"))?,
                });
            }
            "next" => next = Some(decode_next(dec, limits)?),
            _ => dec.skip()?,
        }
    }

    Ok(Topology {
        cluster_id: cluster_id.ok_or(ProtoDecodeError::MissingField("cluster_id"))?,
        version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        hosts: hosts.ok_or(ProtoDecodeError::MissingField("hosts"))?,
        f: f.ok_or(ProtoDecodeError::MissingField("f"))?,
        max_rm_count: max_rm_count.ok_or(ProtoDecodeError::MissingField("max_rm_count"))?,
        rms: rms.ok_or(ProtoDecodeError::MissingField("rms"))?,
        rms_removed: rms_removed.unwrap_or_default(),
        root,
        db_version: VERSION_ZERO,
        next,
    })
}

fn encode_next(enc: &mut Encoder<&mut Vec<u8>>, next: &NextInfo) -> Result<(), ProtoEncodeError> {
    enc.map(7)?;
    enc.str("target")?;
    encode_topology(enc, &next.target)?;
    enc.str("all_hosts")?;
    encode_text_list(enc, &next.all_hosts)?;
    enc.str("new_rm_ids")?;
    encode_rm_list(enc, &next.new_rm_ids)?;
    enc.str("surviving_rm_ids")?;
    encode_rm_list(enc, &next.surviving_rm_ids)?;
    enc.str("lost_rm_ids")?;
    encode_rm_list(enc, &next.lost_rm_ids)?;
    enc.str("install_pending")?;
    encode_rm_list(enc, &next.install_pending)?;
    enc.str("pending")?;
    enc.map(next.pending.len() as u64)?;
    for (rm, migration) in &next.pending {
        enc.u32(rm.0)?;
        enc.map(2)?;
        enc.str("cond")?;
        encode_cond(enc, &migration.cond)?;
        enc.str("received")?;
        let received: Vec<RmId> = migration.received.iter().copied().collect();
        encode_rm_list(enc, &received)?;
    }
    Ok(())
}

fn decode_next(dec: &mut Decoder<'_>, limits: &WireLimits) -> Result<NextInfo, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut target = None;
    let mut all_hosts = None;
    let mut new_rm_ids = None;
    let mut surviving_rm_ids = None;
    let mut lost_rm_ids = None;
    let mut install_pending = None;
    let mut pending = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "target" => target = Some(decode_topology(dec, limits)?),
            "all_hosts" => all_hosts = Some(decode_text_list(dec, limits)?),
            "new_rm_ids" => new_rm_ids = Some(decode_rm_list(dec, limits)?),
            "surviving_rm_ids" => surviving_rm_ids = Some(decode_rm_list(dec, limits)?),
            "lost_rm_ids" => lost_rm_ids = Some(decode_rm_list(dec, limits)?),
            "install_pending" => install_pending = Some(decode_rm_list(dec, limits)?),
            "pending" => {
                let pending_len = decode_map_len(dec, limits)?;
                let mut out = BTreeMap::new();
                for _ in 0..pending_len {
                    let rm = RmId(decode_u32(dec, "pending rm")?);
                    let entry_len = decode_map_len(dec, limits)?;
                    let mut cond = None;
                    let mut received = None;
                    for _ in 0..entry_len {
                        match decode_text(dec, limits)?.as_str() {
                            "cond" => cond = Some(decode_cond(dec, limits)?),
                            "received" => {
                                received = Some(
                                    decode_rm_list(dec, limits)?
                                        .into_iter()
                                        .collect::<BTreeSet<_>>(),
                                )
                            }
                            _ => dec.skip()?,
                        }
                    }
                    out.insert(
                        rm,
                        PendingMigration {
                            cond: cond.ok_or(ProtoDecodeError::MissingField("cond"))?,
                            received: received.unwrap_or_default(),
                        },
                    );
                }
                pending = Some(out);
            }
            _ => dec.skip()?,
        }
    }

    Ok(NextInfo {
        target: Box::new(target.ok_or(ProtoDecodeError::MissingField("target"))?),
        all_hosts: all_hosts.unwrap_or_default(),
        new_rm_ids: new_rm_ids.unwrap_or_default(),
        surviving_rm_ids: surviving_rm_ids.unwrap_or_default(),
        lost_rm_ids: lost_rm_ids.unwrap_or_default(),
        install_pending: install_pending.unwrap_or_default(),
        pending: pending.unwrap_or_default(),
    })
}

/// Serializes a topology as it is written into the topology variable.
pub fn topology_to_bytes(topology: &Topology) -> Result<Bytes, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    encode_topology(&mut enc, topology)?;
    Ok(Bytes::from(buf))
}

/// Reads a topology value back, attaching the writing transaction as the
/// compare-and-swap witness.
pub fn topology_from_bytes(
    bytes: &[u8],
    db_version: TxnId,
    root: Option<Root>,
    limits: &WireLimits,
) -> Result<Topology, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let mut topology = decode_topology(&mut dec, limits)?;
    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }
    topology.db_version = db_version;
    // The root reference travels beside the value, not inside it: it is
    // the variable's first reference.
    if root.is_some() {
        topology.root = root;
    }
    Ok(topology)
}

// ---------------------------------------------------------------------------
// transaction frames

pub fn encode_txn_frame(
    enc: &mut Encoder<&mut Vec<u8>>,
    txn: &TxnFrame,
) -> Result<(), ProtoEncodeError> {
    let mut len = 6;
    if txn.id.is_some() {
        len += 1;
    }
    enc.map(len)?;
    if let Some(id) = &txn.id {
        enc.str("id")?;
        enc.bytes(id.as_bytes())?;
    }
    enc.str("submitter")?;
    enc.u32(txn.submitter.0)?;
    enc.str("boot_count")?;
    enc.u32(txn.submitter_boot_count)?;
    enc.str("actions")?;
    enc.array(txn.actions.len() as u64)?;
    for (var, action) in &txn.actions {
        encode_action(enc, var, action)?;
    }
    enc.str("allocations")?;
    enc.array(txn.allocations.len() as u64)?;
    for alloc in &txn.allocations {
        enc.map(3)?;
        enc.str("rm")?;
        enc.u32(alloc.rm_id.0)?;
        enc.str("active")?;
        enc.u32(alloc.active_boot_count)?;
        enc.str("indices")?;
        enc.array(alloc.action_indices.len() as u64)?;
        for idx in &alloc.action_indices {
            enc.u16(*idx)?;
        }
    }
    enc.str("f_inc")?;
    enc.u8(txn.f_inc)?;
    enc.str("topology_version")?;
    enc.u32(txn.topology_version)?;
    Ok(())
}

fn encode_action(
    enc: &mut Encoder<&mut Vec<u8>>,
    var: &VarUuid,
    action: &Action,
) -> Result<(), ProtoEncodeError> {
    match action {
        Action::Read { version } => {
            enc.map(3)?;
            enc.str("var")?;
            enc.bytes(var.as_bytes())?;
            enc.str("kind")?;
            enc.str("read")?;
            enc.str("version")?;
            enc.bytes(version.as_bytes())?;
        }
        Action::Write { value, refs } => {
            enc.map(4)?;
            enc.str("var")?;
            enc.bytes(var.as_bytes())?;
            enc.str("kind")?;
            enc.str("write")?;
            enc.str("value")?;
            enc.bytes(value)?;
            enc.str("refs")?;
            encode_refs(enc, refs)?;
        }
        Action::ReadWrite {
            version,
            value,
            refs,
        } => {
            enc.map(5)?;
            enc.str("var")?;
            enc.bytes(var.as_bytes())?;
            enc.str("kind")?;
            enc.str("readwrite")?;
            enc.str("version")?;
            enc.bytes(version.as_bytes())?;
            enc.str("value")?;
            enc.bytes(value)?;
            enc.str("refs")?;
            encode_refs(enc, refs)?;
        }
        Action::Create {
            value,
            positions,
            refs,
        } => {
            enc.map(5)?;
            enc.str("var")?;
            enc.bytes(var.as_bytes())?;
            enc.str("kind")?;
            enc.str("create")?;
            enc.str("value")?;
            enc.bytes(value)?;
            enc.str("positions")?;
            enc.bytes(positions.as_bytes())?;
            enc.str("refs")?;
            encode_refs(enc, refs)?;
        }
        Action::Roll {
            version,
            value,
            refs,
        } => {
            enc.map(5)?;
            enc.str("var")?;
            enc.bytes(var.as_bytes())?;
            enc.str("kind")?;
            enc.str("roll")?;
            enc.str("version")?;
            enc.bytes(version.as_bytes())?;
            enc.str("value")?;
            enc.bytes(value)?;
            enc.str("refs")?;
            encode_refs(enc, refs)?;
        }
    }
    Ok(())
}

pub fn decode_txn_frame(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<TxnFrame, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut id = None;
    let mut submitter = None;
    let mut boot_count = None;
    let mut actions = None;
    let mut allocations = None;
    let mut f_inc = None;
    let mut topology_version = None;

    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "id" => id = Some(decode_txn_id(dec)?),
            "submitter" => submitter = Some(RmId(decode_u32(dec, "submitter")?)),
            "boot_count" => boot_count = Some(decode_u32(dec, "boot_count")?),
            "actions" => {
                let len = decode_array_len(dec, limits)?;
                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    out.push(decode_action(dec, limits)?);
                }
                actions = Some(out);
            }
            "allocations" => {
                let len = decode_array_len(dec, limits)?;
                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    out.push(decode_allocation(dec, limits)?);
                }
                allocations = Some(out);
            }
            "f_inc" => f_inc = Some(decode_u8(dec, "f_inc")?),
            "topology_version" => {
                topology_version = Some(decode_u32(dec, "topology_version")?)
            }
            _ => dec.skip()?,
        }
    }

    Ok(TxnFrame {
        id,
        submitter: submitter.ok_or(ProtoDecodeError::MissingField("submitter"))?,
        submitter_boot_count: boot_count.ok_or(ProtoDecodeError::MissingField("boot_count"))?,
        actions: actions.ok_or(ProtoDecodeError::MissingField("actions"))?,
        allocations: allocations.ok_or(ProtoDecodeError::MissingField("allocations"))?,
        f_inc: f_inc.ok_or(ProtoDecodeError::MissingField("f_inc"))?,
        topology_version: topology_version
            .ok_or(ProtoDecodeError::MissingField("topology_version"))?,
    })
}

fn decode_action(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<(VarUuid, Action), ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut var = None;
    let mut kind = None;
    let mut version = None;
    let mut val = None;
    let mut positions = None;
    let mut refs = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "var" => var = Some(decode_var_uuid(dec)?),
            "kind" => kind = Some(decode_text(dec, limits)?),
            "version" => version = Some(decode_txn_id(dec)?),
            "value" => val = Some(decode_value_bytes(dec, limits)?),
            "positions" => positions = Some(decode_positions(dec, limits)?),
            "refs" => refs = Some(decode_refs(dec, limits)?),
            _ => dec.skip()?,
        }
    }
    let var = var.ok_or(ProtoDecodeError::MissingField("var"))?;
    let action = match kind.as_deref() {
        Some("read") => Action::Read {
            version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
        },
        Some("write") => Action::Write {
            value: val.ok_or(ProtoDecodeError::MissingField("value"))?,
            refs: refs.unwrap_or_default(),
        },
        Some("readwrite") => Action::ReadWrite {
            version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
            value: val.ok_or(ProtoDecodeError::MissingField("value"))?,
            refs: refs.unwrap_or_default(),
        },
        Some("create") => Action::Create {
            value: val.ok_or(ProtoDecodeError::MissingField("value"))?,
            positions: positions.ok_or(ProtoDecodeError::MissingField("positions"))?,
            refs: refs.unwrap_or_default(),
        },
        Some("roll") => Action::Roll {
            version: version.ok_or(ProtoDecodeError::MissingField("version"))?,
            value: val.ok_or(ProtoDecodeError::MissingField("value"))?,
            refs: refs.unwrap_or_default(),
        },
        Some(other) => {
            return Err(ProtoDecodeError::InvalidField {
                field: "kind",
                reason: format!("unknown action kind '{other}'"),
            })
        }
        None => return Err(ProtoDecodeError::MissingField("kind")),
    };
    Ok((var, action))
}

fn decode_allocation(
    dec: &mut Decoder<'_>,
    limits: &WireLimits,
) -> Result<Allocation, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits)?;
    let mut rm = None;
    let mut active = None;
    let mut indices = None;
    for _ in 0..map_len {
        match decode_text(dec, limits)?.as_str() {
            "rm" => rm = Some(RmId(decode_u32(dec, "rm")?)),
            "active" => active = Some(decode_u32(dec, "active")?),
            "indices" => {
                let len = decode_array_len(dec, limits)?;
                let mut out = Vec::with_capacity(len as usize);
                for _ in 0..len {
                    out.push(dec.u16()?);
                }
                indices = Some(out);
            }
            _ => dec.skip()?,
        }
    }
    Ok(Allocation {
        rm_id: rm.ok_or(ProtoDecodeError::MissingField("rm"))?,
        active_boot_count: active.ok_or(ProtoDecodeError::MissingField("active"))?,
        action_indices: indices.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ids::TOPOLOGY_VAR_UUID;

    fn sample_topology() -> Topology {
        let mut target = Topology::goal(
            "c".to_string(),
            2,
            vec!["h1:7894".to_string(), "h2:7894".to_string(), "h3:7894".to_string()],
            1,
            5,
        );
        target.rms = vec![RmId(1), RmId(2), RmId(3)];

        let mut pending = BTreeMap::new();
        pending.insert(
            RmId(3),
            PendingMigration {
                cond: Cond::Generator(Generator {
                    rm_id: RmId(3),
                    perm_len: 3,
                    start: 0,
                    len: 3,
                    len_adjust_intersect: vec![RmId(9)],
                    includes: true,
                })
                .or(Cond::Generator(Generator {
                    rm_id: RmId(3),
                    perm_len: 2,
                    start: 1,
                    len: 1,
                    len_adjust_intersect: Vec::new(),
                    includes: false,
                })),
                received: [RmId(1)].into_iter().collect(),
            },
        );

        let mut topology = Topology::goal(
            "c".to_string(),
            1,
            vec!["h1:7894".to_string(), "h2:7894".to_string()],
            1,
            5,
        );
        topology.rms = vec![RmId(1), RmId(2)];
        topology.rms_removed = [RmId(9)].into_iter().collect();
        topology.root = Some(Root {
            var: VarUuid([4u8; 16]),
            positions: Positions::identity(5),
        });
        topology.next = Some(NextInfo {
            target: Box::new(target),
            all_hosts: vec![
                "h1:7894".to_string(),
                "h2:7894".to_string(),
                "h3:7894".to_string(),
            ],
            new_rm_ids: vec![RmId(3)],
            surviving_rm_ids: vec![RmId(1), RmId(2)],
            lost_rm_ids: vec![RmId(9)],
            install_pending: vec![RmId(3)],
            pending,
        });
        topology
    }

    #[test]
    fn topology_roundtrips() {
        let topology = sample_topology();
        let bytes = topology_to_bytes(&topology).expect("encode");
        let decoded = topology_from_bytes(
            &bytes,
            VERSION_ZERO,
            topology.root.clone(),
            &WireLimits::default(),
        )
        .expect("decode");
        assert_eq!(decoded, topology);
    }

    #[test]
    fn blank_topology_roundtrips() {
        let topology = Topology::blank("fresh".to_string(), 5);
        let bytes = topology_to_bytes(&topology).expect("encode");
        let decoded =
            topology_from_bytes(&bytes, VERSION_ZERO, None, &WireLimits::default()).expect("decode");
        assert_eq!(decoded, topology);
    }

    #[test]
    fn db_version_is_attached_not_serialized() {
        let topology = sample_topology();
        let bytes = topology_to_bytes(&topology).expect("encode");
        let witness = TxnId::new(42, RmId(1), 1);
        let decoded = topology_from_bytes(
            &bytes,
            witness,
            topology.root.clone(),
            &WireLimits::default(),
        )
        .expect("decode");
        assert_eq!(decoded.db_version, witness);
    }

    #[test]
    fn topology_var_uuid_is_distinguished() {
        assert_eq!(TOPOLOGY_VAR_UUID.as_bytes(), &[0u8; 16]);
    }
}
