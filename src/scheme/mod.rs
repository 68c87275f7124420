//! Meta-revision encoding scheme.
//!
//! Every value stored through the proxy carries an 8-byte little-endian
//! meta-revision suffix, written atomically with the put. This module owns
//! the suffix codec, the clock-key reading rules, and the transaction-shape
//! validation that keeps a txn on a single member.
//!
//! Values shorter than 8 bytes are treated as foreign (written around the
//! proxy) and passed through untouched.

use crate::core::error::ProxyError;
use crate::proto::{
    self, compare, request_op, Compare, KeyValue, RequestOp, ResponseHeader, TxnRequest,
    TxnResponse,
};

/// Key holding the meta-clock. Present on the coordinator (authoritative)
/// and mirrored on every member by each write transaction. The leading NUL
/// keeps it below any client key.
pub const CLOCK_KEY: &[u8] = b"\x00trellis/clock";

/// Key the clock reconstitution mutex is hosted under on the coordinator.
pub const CLOCK_LOCK_KEY: &[u8] = b"\x00trellis/clock-lock";

/// Width of the meta-revision suffix.
pub const META_REV_LEN: usize = 8;

/// Encode a meta-revision as the 8-byte suffix. Wrapping two's-complement,
/// so `encode_meta_rev(t - 1)` round-trips even when `t` is 0.
pub fn encode_meta_rev(rev: i64) -> [u8; META_REV_LEN] {
    (rev as u64).to_le_bytes()
}

/// Decode a meta-revision from the trailing 8 bytes of a value.
///
/// Returns `None` when the value is too short to carry a suffix.
pub fn decode_meta_rev(value: &[u8]) -> Option<i64> {
    if value.len() < META_REV_LEN {
        return None;
    }
    let tail: [u8; META_REV_LEN] = value[value.len() - META_REV_LEN..].try_into().ok()?;
    Some(u64::from_le_bytes(tail) as i64)
}

/// Append the meta-rev suffix to every put operation in `ops`.
///
/// Applied to both the success and failure branches of a transaction so the
/// suffix is present along every outcome path.
pub fn append_meta_rev_to_ops(buf: &[u8; META_REV_LEN], ops: &mut [RequestOp]) {
    for op in ops {
        if let Some(request_op::Request::RequestPut(put)) = &mut op.request {
            put.value.extend_from_slice(buf);
        }
    }
}

/// Overwrite `mod_revision` with the embedded meta-rev and strip the suffix.
pub fn resolve_mod_rev(kv: &mut KeyValue) {
    if let Some(rev) = decode_meta_rev(&kv.value) {
        kv.mod_revision = rev;
        kv.value.truncate(kv.value.len() - META_REV_LEN);
    }
}

/// As [`resolve_mod_rev`], returning the resolved meta-rev.
pub fn resolve_meta_rev(kv: &mut KeyValue) -> i64 {
    resolve_mod_rev(kv);
    kv.mod_revision
}

/// Read the meta-revision out of the coordinator's clock key.
///
/// The stored value is the recovery base (`t - 1` at reconstitution time)
/// and every tick advances the key's `version` by one via an ignore-value
/// put, so the clock reading is `base + version`. Unlike the raw
/// mod-revision this is immune to unrelated writes on the coordinator.
pub fn clock_meta_rev(kv: &KeyValue) -> Result<i64, ProxyError> {
    let base = decode_meta_rev(&kv.value).ok_or_else(|| ProxyError::Internal {
        message: format!("clock key value is {} bytes, want 8", kv.value.len()),
    })?;
    Ok(base + kv.version)
}

fn check_anchor(anchor: &mut Option<Vec<u8>>, key: &[u8]) -> Result<(), ProxyError> {
    match anchor {
        Some(a) if a.as_slice() == key => Ok(()),
        Some(_) => Err(ProxyError::CrossShardTxn),
        None => {
            *anchor = Some(key.to_vec());
            Ok(())
        }
    }
}

/// Verify that every key a transaction references is the same single key,
/// and return it. Ranged ops cannot be proven to stay on one member, so a
/// non-empty `range_end` anywhere in the txn is rejected. An empty txn has
/// nothing to route by and is invalid.
pub fn txn_anchor(req: &TxnRequest) -> Result<Vec<u8>, ProxyError> {
    let mut anchor: Option<Vec<u8>> = None;

    for cmp in &req.compare {
        if !cmp.range_end.is_empty() {
            return Err(ProxyError::CrossShardTxn);
        }
        check_anchor(&mut anchor, &cmp.key)?;
    }
    for op in req.success.iter().chain(req.failure.iter()) {
        let (key, range_end): (&[u8], &[u8]) = match &op.request {
            Some(request_op::Request::RequestRange(r)) => (&r.key, &r.range_end),
            Some(request_op::Request::RequestPut(p)) => (&p.key, &[]),
            Some(request_op::Request::RequestDeleteRange(d)) => (&d.key, &d.range_end),
            None => continue,
        };
        if !range_end.is_empty() {
            return Err(ProxyError::CrossShardTxn);
        }
        check_anchor(&mut anchor, key)?;
    }

    anchor.ok_or_else(|| ProxyError::InvalidRequest {
        message: "txn references no keys".to_string(),
    })
}

fn compare_holds(result: compare::CompareResult, actual: i64, target: i64) -> bool {
    match result {
        compare::CompareResult::Equal => actual == target,
        compare::CompareResult::Greater => actual > target,
        compare::CompareResult::Less => actual < target,
        compare::CompareResult::NotEqual => actual != target,
    }
}

/// Evaluate a transaction's mod-revision comparisons against the anchor
/// key's current state before the clock is advanced.
///
/// `current` is the member's live kv for the anchor key, with the meta-rev
/// suffix still attached. Returns the kv's embedded meta-rev and, when any
/// comparison is provably false, a synthesized failure response carrying
/// `meta_rev` as its header revision. A provable failure means the member
/// never sees the transaction and the clock never ticks for it.
pub fn preflight_txn(
    meta_rev: i64,
    req: &TxnRequest,
    current: &KeyValue,
) -> (i64, Option<TxnResponse>) {
    let mod_meta_rev = decode_meta_rev(&current.value).unwrap_or(0);

    for cmp in &req.compare {
        let Some(compare::TargetUnion::ModRevision(target)) = cmp.target_union else {
            continue;
        };
        if target == 0 {
            continue;
        }
        let result = compare::CompareResult::try_from(cmp.result)
            .unwrap_or(compare::CompareResult::Equal);
        if !compare_holds(result, mod_meta_rev, target) {
            let resp = TxnResponse {
                header: Some(ResponseHeader {
                    revision: meta_rev,
                    ..Default::default()
                }),
                succeeded: false,
                responses: Vec::new(),
            };
            return (mod_meta_rev, Some(resp));
        }
    }

    (mod_meta_rev, None)
}

/// The put appended to both txn branches that mirrors the meta-rev onto the
/// member's clock key.
pub fn clock_write_op(buf: &[u8; META_REV_LEN]) -> RequestOp {
    proto::put_op(proto::PutRequest {
        key: CLOCK_KEY.to_vec(),
        value: buf.to_vec(),
        ..Default::default()
    })
}

/// True for comparisons the translation layer must rewrite from meta-revs
/// to member-local revisions.
pub fn is_mod_rev_comparison(cmp: &Compare) -> bool {
    matches!(
        cmp.target_union,
        Some(compare::TargetUnion::ModRevision(rev)) if rev != 0
    )
}
