//! Garbage collection.
//!
//! Snapshot deletion is the only way an object can become unreachable,
//! and unreachable objects are only ever removed here. The collector
//! approximates the unreachable set with a Bloom filter: one read-only
//! recursive walk from the snapshot roots fills the filter, then a sweep
//! over the whole object table yields everything the filter has never
//! seen. Memory stays around 9.6 bits per object, and a reachable object
//! can never be yielded; false positives only make some garbage survive
//! the pass.
//!
//! The filter salts are drawn fresh from the OS RNG on every run and
//! never persisted. Each run therefore retains a different false-positive
//! subset, so repeated runs collect the leftovers of earlier ones.
//!
//! Deletion order per garbage object is row first, remote second. An
//! orphaned remote key only wastes space; a row without remote bytes
//! would poison every future backup that deduplicates against it.

use std::sync::Arc;

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{debug, info, instrument, warn};

use crate::digests::{ObjId, OBJID_LEN};
use crate::meta::{queries, MetaStore};
use crate::remote::Remote;
use crate::Error;

/// Target false-positive rate of the filter. Keeps at least ~95% of the
/// garbage collectable per pass at ~9.6 bits of memory per object.
const TARGET_FP_RATE: f64 = 0.05;

/// Below this many objects the filter parameters degenerate and exact
/// enumeration is cheap anyway.
const EXACT_THRESHOLD: u64 = 4096;

const SWEEP_PAGE_SIZE: u64 = 4096;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub objects: u64,
    pub garbage: u64,
}

/// Enumerates objects that are certainly unreachable from every snapshot
/// root. With Bloom filtering, an unreachable object is reported with
/// probability about `1 - TARGET_FP_RATE` per run.
///
/// Runs synchronously; async callers schedule it onto the blocking
/// thread pool, as [collect] does.
#[instrument(skip_all)]
pub fn find_unreachable(meta: &MetaStore) -> Result<Vec<ObjId>, Error> {
    find_unreachable_impl(meta, EXACT_THRESHOLD)
}

pub(crate) fn find_unreachable_impl(
    meta: &MetaStore,
    exact_threshold: u64,
) -> Result<Vec<ObjId>, Error> {
    let num_objects = meta.with_conn_blocking(|conn| Ok(queries::object_count(conn)?))?;
    if num_objects == 0 {
        return Ok(Vec::new());
    }

    if num_objects < exact_threshold {
        debug!(num_objects, "small object table, enumerating exactly");
        let mut reachable = std::collections::HashSet::new();
        meta.with_conn_blocking(|conn| {
            queries::reachable_objids(conn, |objid| {
                reachable.insert(objid);
            })?;
            Ok(())
        })?;
        return sweep(meta, |objid| !reachable.contains(objid));
    }

    let mut bloom = BloomFilter::for_capacity(num_objects, TARGET_FP_RATE);
    debug!(
        num_objects,
        bits = bloom.bit_count(),
        hashes = bloom.hash_count(),
        "filling reachability filter"
    );
    meta.with_conn_blocking(|conn| {
        queries::reachable_objids(conn, |objid| bloom.insert(&objid))?;
        Ok(())
    })?;
    sweep(meta, |objid| !bloom.contains(objid))
}

/// Pages through the whole object table and collects the ids matching
/// `is_garbage`.
fn sweep(meta: &MetaStore, is_garbage: impl Fn(&ObjId) -> bool) -> Result<Vec<ObjId>, Error> {
    let mut garbage = Vec::new();
    let mut after: Option<ObjId> = None;
    loop {
        let page = meta.with_conn_blocking(|conn| {
            Ok(queries::object_ids_page(conn, after.as_ref(), SWEEP_PAGE_SIZE)?)
        })?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.clone());
        garbage.extend(page.into_iter().filter(|objid| is_garbage(objid)));
    }
    Ok(garbage)
}

/// Finds unreachable objects and deletes them, row first, then the
/// remote bytes. Remote deletion failures are logged and skipped; the
/// orphaned key is harmless and a later run can retry it.
#[instrument(skip_all)]
pub async fn collect(meta: &Arc<MetaStore>, remote: &Remote) -> Result<GcStats, Error> {
    let objects = meta
        .with_conn(|conn| Ok(queries::object_count(conn)?))
        .await?;
    let garbage = {
        let meta = meta.clone();
        tokio::task::spawn_blocking(move || find_unreachable(&meta)).await??
    };
    info!(objects, garbage = garbage.len(), "collecting garbage");

    for objid in &garbage {
        let objid_del = objid.clone();
        meta.with_txn(move |txn| Ok(queries::object_delete(txn, &objid_del)?))
            .await?;
        if let Err(e) = remote.delete_object(objid).await {
            warn!(object.objid = %objid, error = %e, "leaving orphaned remote object");
        }
    }

    meta.analyze().await?;

    Ok(GcStats {
        objects,
        garbage: garbage.len() as u64,
    })
}

/// A plain bit-array Bloom filter. The `k` hash functions are random
/// 256-bit salts XORed into the objid, reduced modulo the bit count.
pub(crate) struct BloomFilter {
    bits: Vec<u8>,
    m: u64,
    salts: Vec<[u8; OBJID_LEN]>,
}

impl BloomFilter {
    /// Sizes the filter for `n` members at false-positive rate `p`:
    /// `m = ceil(n * ln p / ln(1 / 2^(ln 2)))` bits and
    /// `k = round(ln 2 * m / n)` hashes, clamped to at least one.
    pub(crate) fn for_capacity(n: u64, p: f64) -> Self {
        let ln2 = std::f64::consts::LN_2;
        let m = ((n as f64 * p.ln()) / (1.0 / 2f64.powf(ln2)).ln()).ceil() as u64;
        let m = m.max(8);
        let k = ((ln2 * m as f64 / n as f64).round() as usize).max(1);

        let mut rng = OsRng;
        let salts = (0..k)
            .map(|_| {
                let mut salt = [0u8; OBJID_LEN];
                rng.fill_bytes(&mut salt);
                salt
            })
            .collect();

        Self {
            bits: vec![0u8; m.div_ceil(8) as usize],
            m,
            salts,
        }
    }

    pub(crate) fn bit_count(&self) -> u64 {
        self.m
    }

    pub(crate) fn hash_count(&self) -> usize {
        self.salts.len()
    }

    pub(crate) fn insert(&mut self, objid: &ObjId) {
        for i in 0..self.salts.len() {
            let pos = self.position(i, objid);
            self.bits[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }

    pub(crate) fn contains(&self, objid: &ObjId) -> bool {
        (0..self.salts.len()).all(|i| {
            let pos = self.position(i, objid);
            self.bits[(pos / 8) as usize] & (1 << (pos % 8)) != 0
        })
    }

    fn position(&self, salt_index: usize, objid: &ObjId) -> u64 {
        let salt = &self.salts[salt_index];
        let mut mixed = [0u8; OBJID_LEN];
        for (out, (a, b)) in mixed.iter_mut().zip(salt.iter().zip(objid.as_slice())) {
            *out = a ^ b;
        }
        // The mix is a 256-bit little-endian integer; reduce it mod m one
        // byte at a time, most significant first.
        let mut rem: u64 = 0;
        for byte in mixed.iter().rev() {
            rem = ((u128::from(rem) << 8 | u128::from(*byte)) % u128::from(self.m)) as u64;
        }
        rem
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_objid() -> ObjId {
        let mut raw = [0u8; OBJID_LEN];
        OsRng.fill_bytes(&mut raw);
        ObjId::from(&raw)
    }

    #[test]
    fn inserted_members_are_always_found() {
        let mut bloom = BloomFilter::for_capacity(1000, 0.05);
        let members: Vec<ObjId> = (0..1000).map(|_| random_objid()).collect();
        for objid in &members {
            bloom.insert(objid);
        }
        for objid in &members {
            assert!(bloom.contains(objid), "false negative for {objid}");
        }
    }

    #[test]
    fn false_positive_rate_is_roughly_as_configured() {
        let mut bloom = BloomFilter::for_capacity(10_000, 0.05);
        for _ in 0..10_000 {
            bloom.insert(&random_objid());
        }
        let hits = (0..10_000)
            .filter(|_| bloom.contains(&random_objid()))
            .count();
        // ~500 expected; stay far away from the boundary to keep this
        // deterministic in practice.
        assert!(hits < 1500, "false positive rate way off: {hits} / 10000");
    }

    #[test]
    fn parameters_follow_the_sizing_formulas() {
        let bloom = BloomFilter::for_capacity(1_000_000, 0.05);
        // About 6.24 bits per member, four hashes at p = 0.05.
        assert_eq!(bloom.hash_count(), 4);
        let bits_per_member = bloom.bit_count() as f64 / 1_000_000.0;
        assert!((6.0..6.5).contains(&bits_per_member));
    }

    #[test]
    fn tiny_capacity_still_gets_a_hash() {
        let bloom = BloomFilter::for_capacity(1, 0.05);
        assert!(bloom.hash_count() >= 1);
        assert!(bloom.bit_count() >= 8);
    }
}
