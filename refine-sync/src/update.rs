//! Helpers over the yrs v1 update encoding.
//!
//! Everything in the engine that touches raw update bytes goes through this
//! module: validation, merging, diffing against a state vector, and reading
//! the identity of an update's leading struct for content addressing.

use std::collections::{HashMap, HashSet};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Options, ReadTxn, StateVector, Transact, Update};

use crate::error::{SyncError, SyncResult};

/// Encoding of an update that carries no structs and no deletions.
pub const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Whether `update` is the canonical empty update (or zero-length bytes).
pub fn is_empty(update: &[u8]) -> bool {
    update.is_empty() || update == EMPTY_UPDATE
}

/// Create a document with a fixed guid.
pub fn new_doc(guid: &str) -> Doc {
    Doc::with_options(Options {
        guid: guid.into(),
        ..Options::default()
    })
}

/// Decode `update`, mapping failures to [`SyncError::MalformedUpdate`].
pub fn decode(update: &[u8]) -> SyncResult<Update> {
    Update::decode_v1(update).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

/// Check that `update` is a well-formed v1 update envelope.
pub fn validate(update: &[u8]) -> SyncResult<()> {
    decode(update).map(|_| ())
}

pub fn decode_state_vector(sv: &[u8]) -> SyncResult<StateVector> {
    StateVector::decode_v1(sv).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

/// Merge a sequence of updates into one, without materializing a document.
///
/// Structs the inputs cannot explain are kept, so merging is lossless even
/// when the log itself has causal holes.
pub fn merge_updates<T: AsRef<[u8]>>(updates: &[T]) -> SyncResult<Vec<u8>> {
    match updates {
        [] => Ok(EMPTY_UPDATE.to_vec()),
        [single] => {
            validate(single.as_ref())?;
            Ok(single.as_ref().to_vec())
        }
        _ => {
            let refs: Vec<&[u8]> = updates.iter().map(|u| u.as_ref()).collect();
            yrs::merge_updates_v1(&refs).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
        }
    }
}

/// Reduce `update` to what a peer with state vector `sv` is missing.
pub fn diff_update(update: &[u8], sv: &[u8]) -> SyncResult<Vec<u8>> {
    yrs::diff_updates_v1(update, sv).map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

/// The upper state vector implied by an update, v1-encoded.
pub fn state_vector_from_update(update: &[u8]) -> SyncResult<Vec<u8>> {
    yrs::encode_state_vector_from_update_v1(update)
        .map_err(|e| SyncError::MalformedUpdate(e.to_string()))
}

/// Full document state as a single update.
pub fn encode_full_state(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.encode_state_as_update_v1(&StateVector::default())
}

/// Current state vector of `doc`, v1-encoded.
pub fn encode_state_vector(doc: &Doc) -> Vec<u8> {
    let txn = doc.transact();
    txn.state_vector().encode_v1()
}

/// Client id and clock of the first struct in a v1 update.
///
/// The v1 layout starts with the number of client groups, then for the first
/// group its struct count, client id and starting clock, each a LEB128
/// varint. Returns `None` for updates without structs (pure deletions or
/// the empty update).
pub fn leading_struct_id(update: &[u8]) -> SyncResult<Option<(u64, u64)>> {
    let mut pos = 0usize;
    let clients = read_var_u64(update, &mut pos)?;
    if clients == 0 {
        return Ok(None);
    }
    let structs = read_var_u64(update, &mut pos)?;
    let client = read_var_u64(update, &mut pos)?;
    let clock = read_var_u64(update, &mut pos)?;
    if structs == 0 {
        return Ok(None);
    }
    Ok(Some((client, clock)))
}

fn read_var_u64(buf: &[u8], pos: &mut usize) -> SyncResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| SyncError::MalformedUpdate("unexpected end of update".into()))?;
        *pos += 1;
        if shift >= 64 {
            return Err(SyncError::MalformedUpdate("varint overflow".into()));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Snapshot a document tree as `guid → full state`.
///
/// Sub-documents are visited once each, so a cyclic reference in
/// application data cannot loop.
pub fn dump_doc(doc: &Doc) -> HashMap<String, Vec<u8>> {
    let mut out = HashMap::new();
    let mut visited = HashSet::new();
    dump_into(doc, &mut out, &mut visited);
    out
}

fn dump_into(doc: &Doc, out: &mut HashMap<String, Vec<u8>>, visited: &mut HashSet<String>) {
    let guid = doc.guid().to_string();
    if !visited.insert(guid.clone()) {
        return;
    }
    out.insert(guid, encode_full_state(doc));
    let subdocs: Vec<Doc> = {
        let txn = doc.transact();
        txn.subdocs().cloned().collect()
    };
    for sub in &subdocs {
        dump_into(sub, out, visited);
    }
}
