//! Bucket-tree storages.
//!
//! Sparse, Indirect, AesCtrEx and Compressed layers all share the same
//! two-level on-disk shape: one index node holding the first virtual
//! offset of every bucket, then the buckets themselves, each a 0x4000
//! node carrying sorted entries. Only the entry payload differs per
//! variant, so a single tagged implementation covers all four.

use std::sync::{Arc, Mutex};

use binrw::BinReaderExt;

use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage};

use super::BucketInfo;
use super::section::NcaFsSection;

pub const NODE_SIZE: usize = 0x4000;
pub const BKTR_MAGIC: &[u8; 4] = b"BKTR";

const NODE_HEADER_SIZE: usize = 0x10;

/// Which payload shape a tree carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketVariant {
    Sparse,
    Indirect,
    AesCtrEx,
    Compressed,
}

impl BucketVariant {
    fn entry_size(self) -> usize {
        match self {
            BucketVariant::Sparse | BucketVariant::Indirect => 0x14,
            BucketVariant::AesCtrEx => 0x10,
            BucketVariant::Compressed => 0x18,
        }
    }
}

/// Chunk compression methods used by Compressed storages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionType {
    None,
    Zeros,
    Lz4,
    Unknown(u8),
}

impl From<u8> for CompressionType {
    fn from(value: u8) -> Self {
        match value {
            0 => CompressionType::None,
            1 => CompressionType::Zeros,
            3 => CompressionType::Lz4,
            other => CompressionType::Unknown(other),
        }
    }
}

/// Per-variant entry payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Sparse and Indirect entries relocate a virtual span to one of two
    /// substorages (sparse: index 1 means unwritten zeroes).
    Indirect {
        physical_offset: u64,
        storage_index: u32,
    },
    /// AesCtrEx entries assign a counter generation to a physical span.
    AesCtrEx { size: u32, generation: u32 },
    /// Compressed entries describe one chunk of the hash-target layer.
    Compressed {
        physical_offset: i64,
        compression: CompressionType,
        physical_size: u32,
    },
}

#[derive(Debug, Clone)]
pub struct Entry {
    /// Start of the span this entry covers (physical offset for
    /// AesCtrEx trees, virtual offset for everything else).
    pub virtual_offset: u64,
    pub payload: Payload,
}

#[derive(Debug, Clone)]
struct Bucket {
    first_virtual: u64,
    end_offset: u64,
    entries: Vec<Entry>,
}

/// A parsed bucket tree plus its wired substorages.
pub struct BucketTree {
    variant: BucketVariant,
    buckets: Vec<Bucket>,
    /// Total size of the virtual space the tree covers.
    virtual_size: u64,
    /// Substorage 0 (and 1 for Indirect trees).
    substorages: [Option<SharedStorage>; 2],
    /// Section handle used by AesCtrEx trees for counter-generation
    /// reads.
    section: Option<Arc<Mutex<NcaFsSection>>>,
}

impl BucketTree {
    /// Loads a tree from its on-disk region inside a section.
    pub fn load(
        section: &mut NcaFsSection,
        variant: BucketVariant,
        info: &BucketInfo,
    ) -> Result<Self> {
        if !info.is_present() {
            return Err(Error::CorruptHeader(
                HeaderKind::Bucket,
                format!("{variant:?} bucket info is empty"),
            ));
        }
        if info.magic != *BKTR_MAGIC {
            return Err(Error::CorruptHeader(
                HeaderKind::Bucket,
                format!("bad bucket magic {:02X?}", info.magic),
            ));
        }

        let mut raw = vec![0u8; info.size as usize];
        section.read_at(info.offset, &mut raw)?;
        Self::parse(&raw, variant, info.entry_count)
    }

    /// Parses a raw tree region: index node + buckets.
    pub fn parse(raw: &[u8], variant: BucketVariant, expected_entries: u32) -> Result<Self> {
        if raw.len() < NODE_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Bucket,
                "bucket tree region shorter than one node".to_string(),
            ));
        }

        let mut cursor = binrw::io::Cursor::new(raw);
        let _index: u32 = cursor.read_le()?;
        let bucket_count: u32 = cursor.read_le()?;
        let virtual_size: u64 = cursor.read_le()?;

        let mut first_offsets = Vec::with_capacity(bucket_count as usize);
        for _ in 0..bucket_count {
            first_offsets.push(cursor.read_le::<u64>()?);
        }

        if raw.len() < NODE_SIZE * (1 + bucket_count as usize) {
            return Err(Error::CorruptHeader(
                HeaderKind::Bucket,
                "bucket tree region truncated".to_string(),
            ));
        }

        let entry_size = variant.entry_size();
        let mut buckets = Vec::with_capacity(bucket_count as usize);
        let mut total_entries = 0u32;
        let mut last_virtual: Option<u64> = None;

        for bucket_idx in 0..bucket_count as usize {
            let node = &raw[NODE_SIZE * (1 + bucket_idx)..NODE_SIZE * (2 + bucket_idx)];
            let mut cursor = binrw::io::Cursor::new(node);
            let _index: u32 = cursor.read_le()?;
            let entry_count: u32 = cursor.read_le()?;
            let end_offset: u64 = cursor.read_le()?;

            if NODE_HEADER_SIZE + entry_count as usize * entry_size > NODE_SIZE {
                return Err(Error::CorruptHeader(
                    HeaderKind::Bucket,
                    format!("bucket #{bucket_idx} entry count out of range"),
                ));
            }

            let mut entries = Vec::with_capacity(entry_count as usize);
            for _ in 0..entry_count {
                let virtual_offset: u64 = cursor.read_le()?;
                let payload = match variant {
                    BucketVariant::Sparse | BucketVariant::Indirect => Payload::Indirect {
                        physical_offset: cursor.read_le()?,
                        storage_index: cursor.read_le()?,
                    },
                    BucketVariant::AesCtrEx => Payload::AesCtrEx {
                        size: cursor.read_le()?,
                        generation: cursor.read_le()?,
                    },
                    BucketVariant::Compressed => {
                        let physical_offset: i64 = cursor.read_le()?;
                        let compression_raw: u8 = cursor.read_le()?;
                        let _pad: [u8; 3] = cursor.read_le()?;
                        let physical_size: u32 = cursor.read_le()?;
                        Payload::Compressed {
                            physical_offset,
                            compression: CompressionType::from(compression_raw),
                            physical_size,
                        }
                    }
                };

                // Virtual offsets must grow strictly across the tree.
                if let Some(last) = last_virtual
                    && virtual_offset <= last
                {
                    return Err(Error::CorruptHeader(
                        HeaderKind::Bucket,
                        format!("non-monotonic virtual offset 0x{virtual_offset:X}"),
                    ));
                }
                last_virtual = Some(virtual_offset);

                entries.push(Entry {
                    virtual_offset,
                    payload,
                });
            }

            total_entries += entry_count;
            buckets.push(Bucket {
                first_virtual: first_offsets[bucket_idx],
                end_offset,
                entries,
            });
        }

        if total_entries != expected_entries {
            return Err(Error::CorruptHeader(
                HeaderKind::Bucket,
                format!(
                    "entry count mismatch: header says {expected_entries}, nodes hold {total_entries}"
                ),
            ));
        }

        Ok(Self {
            variant,
            buckets,
            virtual_size,
            substorages: [None, None],
            section: None,
        })
    }

    pub fn variant(&self) -> BucketVariant {
        self.variant
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    /// Wires substorage `index` (0 = original/base, 1 = patch data).
    pub fn set_substorage(&mut self, index: usize, storage: SharedStorage) {
        self.substorages[index] = Some(storage);
    }

    /// Wires the section handle used for AesCtrEx counter reads.
    pub fn set_section(&mut self, section: Arc<Mutex<NcaFsSection>>) {
        self.section = Some(section);
    }

    /// Finds the entry covering `offset` and the end of its segment.
    pub fn find(&self, offset: u64) -> Result<(&Entry, u64)> {
        if offset >= self.virtual_size {
            return Err(Error::InvalidArgument(format!(
                "bucket lookup past end (offset 0x{offset:X}, size 0x{:X})",
                self.virtual_size
            )));
        }

        // Binary-search the index for the bucket, then scan inside.
        let bucket_idx = match self
            .buckets
            .binary_search_by(|b| b.first_virtual.cmp(&offset))
        {
            Ok(idx) => idx,
            Err(0) => {
                return Err(Error::CorruptHeader(
                    HeaderKind::Bucket,
                    "offset precedes first bucket".to_string(),
                ));
            }
            Err(idx) => idx - 1,
        };
        let bucket = &self.buckets[bucket_idx];

        let entry_idx = match bucket
            .entries
            .binary_search_by(|e| e.virtual_offset.cmp(&offset))
        {
            Ok(idx) => idx,
            Err(0) => {
                return Err(Error::CorruptHeader(
                    HeaderKind::Bucket,
                    "offset precedes first entry".to_string(),
                ));
            }
            Err(idx) => idx - 1,
        };

        let segment_end = bucket
            .entries
            .get(entry_idx + 1)
            .map(|e| e.virtual_offset)
            .unwrap_or(bucket.end_offset);

        Ok((&bucket.entries[entry_idx], segment_end))
    }

    /// True when any part of `[offset, offset + size)` is covered by an
    /// indirect entry pointing at substorage 1 (the patch data).
    pub fn is_block_within_indirect_range(&self, offset: u64, size: u64) -> Result<bool> {
        if self.variant != BucketVariant::Indirect {
            return Err(Error::InvalidState(
                "indirect range query on a non-indirect tree".to_string(),
            ));
        }
        let end = (offset + size).min(self.virtual_size);
        let mut pos = offset;
        while pos < end {
            let (entry, segment_end) = self.find(pos)?;
            if let Payload::Indirect { storage_index, .. } = entry.payload
                && storage_index == 1
            {
                return Ok(true);
            }
            pos = segment_end;
        }
        Ok(false)
    }

    /// Reads `buf.len()` bytes of the tree's virtual space at `offset`.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.virtual_size {
            return Err(Error::InvalidArgument(format!(
                "bucket read out of bounds (offset 0x{offset:X}, len 0x{:X})",
                buf.len()
            )));
        }

        let mut pos = offset;
        let mut done = 0usize;
        while done < buf.len() {
            let (entry, segment_end) = self.find(pos)?;
            let entry = entry.clone();
            let chunk = ((segment_end - pos) as usize).min(buf.len() - done);
            let out = &mut buf[done..done + chunk];

            match (self.variant, entry.payload) {
                (
                    BucketVariant::Sparse,
                    Payload::Indirect {
                        physical_offset,
                        storage_index,
                    },
                ) => {
                    if storage_index == 1 {
                        out.fill(0);
                    } else {
                        let sub = self.substorage(0)?;
                        sub.lock()
                            .unwrap()
                            .read_at(physical_offset + (pos - entry.virtual_offset), out)?;
                    }
                }
                (
                    BucketVariant::Indirect,
                    Payload::Indirect {
                        physical_offset,
                        storage_index,
                    },
                ) => {
                    let sub = self.substorage(storage_index as usize)?;
                    sub.lock()
                        .unwrap()
                        .read_at(physical_offset + (pos - entry.virtual_offset), out)?;
                }
                (BucketVariant::AesCtrEx, Payload::AesCtrEx { generation, .. }) => {
                    let section = self.section.as_ref().ok_or_else(|| {
                        Error::InvalidState("AesCtrEx tree without a section".to_string())
                    })?;
                    section.lock().unwrap().read_with_ctr_ex(pos, generation, out)?;
                }
                (
                    BucketVariant::Compressed,
                    Payload::Compressed {
                        physical_offset,
                        compression,
                        physical_size,
                    },
                ) => {
                    self.read_compressed_chunk(
                        &entry,
                        segment_end,
                        physical_offset,
                        compression,
                        physical_size,
                        pos,
                        out,
                    )?;
                }
                _ => {
                    return Err(Error::CorruptHeader(
                        HeaderKind::Bucket,
                        "payload does not match tree variant".to_string(),
                    ));
                }
            }

            pos += chunk as u64;
            done += chunk;
        }
        Ok(())
    }

    fn substorage(&self, index: usize) -> Result<&SharedStorage> {
        self.substorages
            .get(index)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| {
                Error::InvalidState(format!("bucket substorage #{index} is not wired"))
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn read_compressed_chunk(
        &self,
        entry: &Entry,
        segment_end: u64,
        physical_offset: i64,
        compression: CompressionType,
        physical_size: u32,
        pos: u64,
        out: &mut [u8],
    ) -> Result<()> {
        let in_chunk = (pos - entry.virtual_offset) as usize;
        match compression {
            CompressionType::Zeros => {
                out.fill(0);
                Ok(())
            }
            CompressionType::None => {
                let sub = self.substorage(0)?;
                sub.lock()
                    .unwrap()
                    .read_at(physical_offset as u64 + in_chunk as u64, out)
            }
            CompressionType::Lz4 => {
                let decompressed_size = (segment_end - entry.virtual_offset) as usize;
                let mut compressed = vec![0u8; physical_size as usize];
                {
                    let sub = self.substorage(0)?;
                    sub.lock().unwrap().read_at(physical_offset as u64, &mut compressed)?;
                }
                let plain = lz4_flex::block::decompress(&compressed, decompressed_size)
                    .map_err(|e| Error::CryptoFailure(format!("LZ4 chunk decode failed: {e}")))?;
                if plain.len() < in_chunk + out.len() {
                    return Err(Error::CorruptHeader(
                        HeaderKind::Bucket,
                        "LZ4 chunk shorter than advertised".to_string(),
                    ));
                }
                out.copy_from_slice(&plain[in_chunk..in_chunk + out.len()]);
                Ok(())
            }
            CompressionType::Unknown(value) => Err(Error::UnsupportedVariant(format!(
                "compression type {value}"
            ))),
        }
    }
}

/// Exposes a bucket tree as a composable [`VirtualStorage`].
pub struct BucketTreeStorage {
    tree: Arc<Mutex<BucketTree>>,
}

impl BucketTreeStorage {
    pub fn new(tree: Arc<Mutex<BucketTree>>) -> Self {
        Self { tree }
    }
}

impl VirtualStorage for BucketTreeStorage {
    fn len(&self) -> u64 {
        self.tree.lock().unwrap().virtual_size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.tree.lock().unwrap().read_at(offset, buf)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::MemoryStorage;

    /// Serializes a single-index-node tree with the given buckets.
    /// `buckets` holds `(first_virtual, end_offset, entries)`.
    pub(crate) fn build_tree_bytes(
        variant: BucketVariant,
        virtual_size: u64,
        buckets: &[(u64, u64, Vec<(u64, Payload)>)],
    ) -> (Vec<u8>, u32) {
        let mut raw = vec![0u8; NODE_SIZE * (1 + buckets.len())];
        raw[0..4].copy_from_slice(&0u32.to_le_bytes());
        raw[4..8].copy_from_slice(&(buckets.len() as u32).to_le_bytes());
        raw[8..16].copy_from_slice(&virtual_size.to_le_bytes());
        for (i, (first, _, _)) in buckets.iter().enumerate() {
            raw[16 + i * 8..24 + i * 8].copy_from_slice(&first.to_le_bytes());
        }

        let mut total = 0u32;
        for (bucket_idx, (_, end_offset, entries)) in buckets.iter().enumerate() {
            let base = NODE_SIZE * (1 + bucket_idx);
            raw[base..base + 4].copy_from_slice(&(bucket_idx as u32).to_le_bytes());
            raw[base + 4..base + 8].copy_from_slice(&(entries.len() as u32).to_le_bytes());
            raw[base + 8..base + 16].copy_from_slice(&end_offset.to_le_bytes());

            let mut pos = base + NODE_HEADER_SIZE;
            for (virtual_offset, payload) in entries {
                raw[pos..pos + 8].copy_from_slice(&virtual_offset.to_le_bytes());
                pos += 8;
                match payload {
                    Payload::Indirect {
                        physical_offset,
                        storage_index,
                    } => {
                        raw[pos..pos + 8].copy_from_slice(&physical_offset.to_le_bytes());
                        raw[pos + 8..pos + 12].copy_from_slice(&storage_index.to_le_bytes());
                        pos += 12;
                    }
                    Payload::AesCtrEx { size, generation } => {
                        raw[pos..pos + 4].copy_from_slice(&size.to_le_bytes());
                        raw[pos + 4..pos + 8].copy_from_slice(&generation.to_le_bytes());
                        pos += 8;
                    }
                    Payload::Compressed {
                        physical_offset,
                        compression,
                        physical_size,
                    } => {
                        raw[pos..pos + 8].copy_from_slice(&physical_offset.to_le_bytes());
                        raw[pos + 8] = match compression {
                            CompressionType::None => 0,
                            CompressionType::Zeros => 1,
                            CompressionType::Lz4 => 3,
                            CompressionType::Unknown(v) => *v,
                        };
                        raw[pos + 12..pos + 16].copy_from_slice(&physical_size.to_le_bytes());
                        pos += 16;
                    }
                }
                total += 1;
            }
        }
        (raw, total)
    }

    fn shared(data: Vec<u8>) -> SharedStorage {
        Arc::new(Mutex::new(MemoryStorage::new(data)))
    }

    #[test]
    fn test_find_covers_every_offset() {
        let entries = vec![
            (
                0u64,
                Payload::Indirect {
                    physical_offset: 0,
                    storage_index: 0,
                },
            ),
            (
                0x100,
                Payload::Indirect {
                    physical_offset: 0x1000,
                    storage_index: 1,
                },
            ),
            (
                0x180,
                Payload::Indirect {
                    physical_offset: 0x100,
                    storage_index: 0,
                },
            ),
        ];
        let (raw, count) =
            build_tree_bytes(BucketVariant::Indirect, 0x200, &[(0, 0x200, entries)]);
        let tree = BucketTree::parse(&raw, BucketVariant::Indirect, count).unwrap();

        for q in 0..0x200u64 {
            let (entry, end) = tree.find(q).unwrap();
            assert!(entry.virtual_offset <= q && q < end, "offset 0x{q:X}");
        }
        assert!(tree.find(0x200).is_err());
    }

    #[test]
    fn test_monotonicity_enforced() {
        let entries = vec![
            (
                0x100u64,
                Payload::Indirect {
                    physical_offset: 0,
                    storage_index: 0,
                },
            ),
            (
                0x80,
                Payload::Indirect {
                    physical_offset: 0,
                    storage_index: 0,
                },
            ),
        ];
        let (raw, count) =
            build_tree_bytes(BucketVariant::Indirect, 0x200, &[(0x100, 0x200, entries)]);
        assert!(BucketTree::parse(&raw, BucketVariant::Indirect, count).is_err());
    }

    #[test]
    fn test_entry_count_mismatch_rejected() {
        let entries = vec![(
            0u64,
            Payload::Indirect {
                physical_offset: 0,
                storage_index: 0,
            },
        )];
        let (raw, count) = build_tree_bytes(BucketVariant::Indirect, 0x100, &[(0, 0x100, entries)]);
        assert!(BucketTree::parse(&raw, BucketVariant::Indirect, count + 1).is_err());
    }

    #[test]
    fn test_indirect_read_dispatch() {
        // Base bytes 0xAA, patch bytes 0xBB; virtual space alternates.
        let entries = vec![
            (
                0u64,
                Payload::Indirect {
                    physical_offset: 0x10,
                    storage_index: 0,
                },
            ),
            (
                0x20,
                Payload::Indirect {
                    physical_offset: 0x40,
                    storage_index: 1,
                },
            ),
            (
                0x30,
                Payload::Indirect {
                    physical_offset: 0x30,
                    storage_index: 0,
                },
            ),
        ];
        let (raw, count) = build_tree_bytes(BucketVariant::Indirect, 0x40, &[(0, 0x40, entries)]);
        let mut tree = BucketTree::parse(&raw, BucketVariant::Indirect, count).unwrap();

        let base: Vec<u8> = (0..0x80u32).map(|i| i as u8).collect();
        let patch: Vec<u8> = (0..0x80u32).map(|i| 0x80 + i as u8).collect();
        tree.set_substorage(0, shared(base));
        tree.set_substorage(1, shared(patch));

        let mut buf = vec![0u8; 0x40];
        tree.read_at(0, &mut buf).unwrap();

        // [0, 0x20) base@0x10, [0x20, 0x30) patch@0x40, [0x30, 0x40) base@0x30.
        assert_eq!(&buf[..0x20], &(0x10..0x30).map(|i| i as u8).collect::<Vec<_>>()[..]);
        assert_eq!(
            &buf[0x20..0x30],
            &(0x40..0x50).map(|i| (0x80 + i) as u8).collect::<Vec<_>>()[..]
        );
        assert_eq!(&buf[0x30..0x40], &(0x30..0x40).map(|i| i as u8).collect::<Vec<_>>()[..]);

        // Patch range queries.
        assert!(tree.is_block_within_indirect_range(0x20, 0x8).unwrap());
        assert!(tree.is_block_within_indirect_range(0x10, 0x20).unwrap());
        assert!(!tree.is_block_within_indirect_range(0, 0x20).unwrap());
        assert!(!tree.is_block_within_indirect_range(0x30, 0x10).unwrap());
    }

    #[test]
    fn test_sparse_zero_runs() {
        let entries = vec![
            (
                0u64,
                Payload::Indirect {
                    physical_offset: 0,
                    storage_index: 0,
                },
            ),
            (
                0x10,
                Payload::Indirect {
                    physical_offset: 0,
                    storage_index: 1,
                },
            ),
            (
                0x30,
                Payload::Indirect {
                    physical_offset: 0x10,
                    storage_index: 0,
                },
            ),
        ];
        let (raw, count) = build_tree_bytes(BucketVariant::Sparse, 0x40, &[(0, 0x40, entries)]);
        let mut tree = BucketTree::parse(&raw, BucketVariant::Sparse, count).unwrap();
        tree.set_substorage(0, shared(vec![0x77u8; 0x40]));

        let mut buf = vec![0u8; 0x40];
        tree.read_at(0, &mut buf).unwrap();
        assert!(buf[..0x10].iter().all(|&b| b == 0x77));
        assert!(buf[0x10..0x30].iter().all(|&b| b == 0));
        assert!(buf[0x30..].iter().all(|&b| b == 0x77));
    }

    #[test]
    fn test_cross_bucket_lookup() {
        let bucket0 = vec![(
            0u64,
            Payload::Indirect {
                physical_offset: 0,
                storage_index: 0,
            },
        )];
        let bucket1 = vec![(
            0x100u64,
            Payload::Indirect {
                physical_offset: 0x100,
                storage_index: 0,
            },
        )];
        let (raw, count) = build_tree_bytes(
            BucketVariant::Indirect,
            0x200,
            &[(0, 0x100, bucket0), (0x100, 0x200, bucket1)],
        );
        let mut tree = BucketTree::parse(&raw, BucketVariant::Indirect, count).unwrap();
        let data: Vec<u8> = (0..0x200u32).map(|i| (i & 0xFF) as u8).collect();
        tree.set_substorage(0, shared(data.clone()));

        // A read spanning the bucket boundary stitches seamlessly.
        let mut buf = vec![0u8; 0x40];
        tree.read_at(0xE0, &mut buf).unwrap();
        assert_eq!(&buf, &data[0xE0..0x120]);
    }

    #[test]
    fn test_compressed_chunks() {
        let plain: Vec<u8> = (0..0x100u32).map(|i| (i * 7) as u8).collect();
        let compressed = lz4_flex::block::compress(&plain);

        // Physical layout: plain chunk at 0, compressed chunk after it.
        let mut physical = vec![0u8; 0x40];
        for (i, b) in physical.iter_mut().enumerate() {
            *b = i as u8;
        }
        let lz4_offset = physical.len() as i64;
        physical.extend_from_slice(&compressed);

        let entries = vec![
            (
                0u64,
                Payload::Compressed {
                    physical_offset: 0,
                    compression: CompressionType::None,
                    physical_size: 0x40,
                },
            ),
            (
                0x40,
                Payload::Compressed {
                    physical_offset: 0,
                    compression: CompressionType::Zeros,
                    physical_size: 0,
                },
            ),
            (
                0x80,
                Payload::Compressed {
                    physical_offset: lz4_offset,
                    compression: CompressionType::Lz4,
                    physical_size: compressed.len() as u32,
                },
            ),
        ];
        let (raw, count) =
            build_tree_bytes(BucketVariant::Compressed, 0x180, &[(0, 0x180, entries)]);
        let mut tree = BucketTree::parse(&raw, BucketVariant::Compressed, count).unwrap();
        tree.set_substorage(0, shared(physical.clone()));

        let mut buf = vec![0u8; 0x180];
        tree.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..0x40], &physical[..0x40]);
        assert!(buf[0x40..0x80].iter().all(|&b| b == 0));
        assert_eq!(&buf[0x80..], &plain[..]);

        // Interior window inside the LZ4 chunk.
        let mut window = vec![0u8; 0x20];
        tree.read_at(0x80 + 0x13, &mut window).unwrap();
        assert_eq!(&window, &plain[0x13..0x33]);
    }

    #[test]
    fn test_unknown_compression_is_an_error() {
        let entries = vec![(
            0u64,
            Payload::Compressed {
                physical_offset: 0,
                compression: CompressionType::Unknown(2),
                physical_size: 0x10,
            },
        )];
        let (raw, count) =
            build_tree_bytes(BucketVariant::Compressed, 0x10, &[(0, 0x10, entries)]);
        let mut tree = BucketTree::parse(&raw, BucketVariant::Compressed, count).unwrap();
        tree.set_substorage(0, shared(vec![0u8; 0x10]));

        let mut buf = vec![0u8; 0x10];
        assert!(matches!(
            tree.read_at(0, &mut buf).unwrap_err(),
            Error::UnsupportedVariant(_)
        ));
    }
}
