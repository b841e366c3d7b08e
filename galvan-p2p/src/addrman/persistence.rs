//! Address manager persistence.
//!
//! The whole table serializes into one versioned binary blob: magic,
//! format version, the instance secret key, entry counts, entries,
//! and a trailing 4-byte SHA-256d checksum. Because bucket placement
//! is a pure function of the key, only new-table bucket indices need
//! to ride along; positions are recomputed on load. An unknown
//! version is an [`P2pError::InvalidAddrManVersion`]; any damage is
//! [`P2pError::AddrManCorrupted`].

use std::fs;
use std::io::Write;
use std::path::Path;

use galvan_core::crypto::hashing::sha256d;
use galvan_core::{Decoder, Encoder};

use crate::addrman::{AddrInfo, AddrMan, NEW_BUCKET_COUNT};
use crate::error::{P2pError, P2pResult};
use crate::protocol::NetAddress;

/// File magic: "GVAM".
const MAGIC: [u8; 4] = [0x47, 0x56, 0x41, 0x4d];

/// Current serialization format version.
const FORMAT_VERSION: u8 = 1;

impl AddrMan {
    /// Serialize the full table.
    pub fn serialize(&self) -> Vec<u8> {
        // Collect each new entry's bucket list in one sweep.
        let mut bucket_lists: std::collections::HashMap<usize, Vec<u16>> =
            std::collections::HashMap::new();
        for (bucket, slots) in self.new_buckets.iter().enumerate() {
            for slot in slots.iter().flatten() {
                bucket_lists.entry(*slot).or_default().push(bucket as u16);
            }
        }

        let mut enc = Encoder::new();
        enc.write_bytes(&MAGIC);
        enc.write_u8(FORMAT_VERSION);
        enc.write_bytes(self.secret_key());

        let live: Vec<usize> = self.live_slot_ids();
        enc.write_u32_le(live.len() as u32);
        for id in live {
            let info = self.slot(id);
            info.address.encode_v2(&mut enc);
            enc.write_compact_size(info.services);
            enc.write_i64_le(info.last_seen);
            enc.write_i64_le(info.last_try);
            enc.write_i64_le(info.last_success);
            enc.write_u32_le(info.attempts);
            enc.write_var_bytes(&info.source_group);
            enc.write_u8(info.in_tried as u8);
            let buckets = bucket_lists.remove(&id).unwrap_or_default();
            enc.write_compact_size(buckets.len() as u64);
            for bucket in buckets {
                enc.write_u16_le(bucket);
            }
        }

        let mut bytes = enc.into_inner();
        let checksum = sha256d(&bytes);
        bytes.extend_from_slice(&checksum[..4]);
        bytes
    }

    /// Rebuild a table from serialized bytes.
    pub fn deserialize(bytes: &[u8]) -> P2pResult<Self> {
        if bytes.len() < 4 + 1 + 32 + 4 + 4 {
            return Err(P2pError::AddrManCorrupted);
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 4);
        if sha256d(body)[..4] != *checksum {
            return Err(P2pError::AddrManCorrupted);
        }

        let mut dec = Decoder::new(body);
        let magic: [u8; 4] = dec.read_fixed().map_err(|_| P2pError::AddrManCorrupted)?;
        if magic != MAGIC {
            return Err(P2pError::AddrManCorrupted);
        }
        let version = dec.read_u8().map_err(|_| P2pError::AddrManCorrupted)?;
        if version != FORMAT_VERSION {
            return Err(P2pError::InvalidAddrManVersion(version));
        }
        let key: [u8; 32] = dec.read_fixed().map_err(|_| P2pError::AddrManCorrupted)?;

        let mut addrman = AddrMan::with_key(key, rand::SeedableRng::from_entropy());
        let count = dec.read_u32_le().map_err(|_| P2pError::AddrManCorrupted)?;
        for _ in 0..count {
            let address = NetAddress::decode_v2(&mut dec)?;
            let services = dec.read_compact_size()?;
            let last_seen = dec.read_i64_le()?;
            let last_try = dec.read_i64_le()?;
            let last_success = dec.read_i64_le()?;
            let attempts = dec.read_u32_le()?;
            let source_group = dec.read_var_bytes()?.to_vec();
            let in_tried = dec.read_u8()? != 0;
            let bucket_count = dec.read_size()?;
            let mut buckets = Vec::with_capacity(bucket_count.min(8));
            for _ in 0..bucket_count {
                buckets.push(dec.read_u16_le()?);
            }

            addrman.restore_entry(
                AddrInfo {
                    address,
                    services,
                    source_group,
                    last_seen,
                    last_try,
                    last_success,
                    attempts,
                    ref_count: 0,
                    in_tried: false,
                    random_pos: 0,
                },
                in_tried,
                &buckets,
            );
        }
        dec.finish().map_err(|_| P2pError::AddrManCorrupted)?;
        Ok(addrman)
    }

    /// Write the table to disk atomically (temp file + rename).
    pub fn save_to_file(&self, path: &Path) -> P2pResult<()> {
        let bytes = self.serialize();
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)?;
        tracing::debug!(count = self.size(), path = ?path, "saved address table");
        Ok(())
    }

    /// Load a table previously written with [`Self::save_to_file`].
    pub fn load_from_file(path: &Path) -> P2pResult<Self> {
        let bytes = fs::read(path)?;
        let addrman = Self::deserialize(&bytes)?;
        tracing::info!(count = addrman.size(), path = ?path, "loaded address table");
        Ok(addrman)
    }
}

// Crate-internal restore hooks, kept here so the main module's
// invariant-preserving API stays minimal.
impl AddrMan {
    fn live_slot_ids(&self) -> Vec<usize> {
        self.slots_iter().collect()
    }

    pub(super) fn slot(&self, id: usize) -> &AddrInfo {
        self.slots_get(id)
    }

    /// Re-place a deserialized entry into its recorded buckets.
    pub(super) fn restore_entry(&mut self, info: AddrInfo, in_tried: bool, new_buckets: &[u16]) {
        let identity = info.address.identity_key();
        if self.contains_identity(&identity) {
            return;
        }
        let id = self.create_slot(info);
        if in_tried {
            self.restore_tried(id);
            return;
        }
        let mut placed = false;
        for &bucket in new_buckets {
            if (bucket as usize) < NEW_BUCKET_COUNT
                && self.restore_new_ref(id, bucket as usize)
            {
                placed = true;
            }
        }
        if !placed {
            // Recorded buckets were unusable (e.g. collisions after a
            // partial load); place by the normal rule instead.
            self.restore_fresh(id);
        }
    }
}
