//! Decrypted access to a single NCA FS section.
//!
//! An [`NcaFsSection`] is the "Regular" storage of the composition stack:
//! it turns raw NCA bytes into decrypted section-relative reads, knows the
//! section's hash-target extents, and verifies both hash-tree flavours.

use std::sync::{Arc, Mutex};

use crate::crypto;
use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage, align_down, align_up};

use super::{FsHeader, FsSectionType, HashData, Nca};

const AES_ALIGN: u64 = 0x10;
const XTS_SECTOR: u64 = 0x200;

#[derive(Clone)]
enum SectionCrypt {
    None,
    Ctr {
        key: [u8; 0x10],
        seed: u64,
    },
    Xts {
        key0: [u8; 0x10],
        key1: [u8; 0x10],
    },
}

/// One FS section of an NCA, with transparent decryption.
pub struct NcaFsSection {
    storage: SharedStorage,
    pub header: FsHeader,
    pub section_index: usize,
    pub section_type: FsSectionType,
    /// Section start, absolute within the NCA.
    section_offset: u64,
    section_size: u64,
    crypt: SectionCrypt,
}

impl NcaFsSection {
    /// Opens section `idx` of `nca`.
    pub fn open(nca: &Nca, idx: usize) -> Result<Self> {
        let header = nca
            .fs_headers
            .get(idx)
            .and_then(|h| h.clone())
            .ok_or_else(|| Error::NotFound(format!("NCA FS section {idx}")))?;

        let section_offset = nca.section_offset(idx).unwrap();
        let section_size = nca.section_size(idx).unwrap();
        let is_nca0 = nca.header.nca_version.is_nca0();
        let section_type = header.section_type(is_nca0);

        let crypt = match header.encryption_type {
            super::EncryptionType::None => SectionCrypt::None,
            super::EncryptionType::AesXts => {
                let (key0, key1) = nca.section_xts_keys()?;
                SectionCrypt::Xts { key0, key1 }
            }
            super::EncryptionType::Auto
            | super::EncryptionType::AesCtr
            | super::EncryptionType::AesCtrEx
            | super::EncryptionType::AesCtrSkipLayerHash
            | super::EncryptionType::AesCtrExSkipLayerHash => SectionCrypt::Ctr {
                key: nca.section_content_key()?,
                seed: header.ctr,
            },
        };

        tracing::trace!(
            section = idx,
            section_type = ?section_type,
            encryption_type = ?header.encryption_type,
            offset = format_args!("0x{section_offset:X}"),
            size = format_args!("0x{section_size:X}"),
            "opening NCA FS section"
        );

        Ok(Self {
            storage: nca.storage(),
            header,
            section_index: idx,
            section_type,
            section_offset,
            section_size,
            crypt,
        })
    }

    pub fn size(&self) -> u64 {
        self.section_size
    }

    /// Extent of the hash-target layer, relative to the section start.
    pub fn hash_target_extents(&self) -> (u64, u64) {
        self.header
            .hash_data
            .hash_target_extents()
            .unwrap_or((0, self.section_size))
    }

    fn check_bounds(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.section_size {
            return Err(Error::InvalidArgument(format!(
                "section read out of bounds (offset 0x{offset:X}, len 0x{len:X})"
            )));
        }
        Ok(())
    }

    /// Decrypted read; `offset` is relative to the section start.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_bounds(offset, buf.len())?;

        match self.crypt.clone() {
            SectionCrypt::None => self.storage.read_at(self.section_offset + offset, buf),
            SectionCrypt::Ctr { key, seed } => self.read_ctr(offset, buf, &key, seed, None),
            SectionCrypt::Xts { key0, key1 } => self.read_xts(offset, buf, &key0, &key1),
        }
    }

    /// Raw (still encrypted) read; used by layers that apply their own
    /// counter composition.
    pub fn read_raw_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.check_bounds(offset, buf.len())?;
        self.storage.read_at(self.section_offset + offset, buf)
    }

    /// AES-CTR-EX read: like a regular CTR read, but the entry generation
    /// replaces the low seed bytes of the counter.
    pub fn read_with_ctr_ex(&mut self, offset: u64, generation: u32, buf: &mut [u8]) -> Result<()> {
        let SectionCrypt::Ctr { key, seed } = self.crypt.clone() else {
            return Err(Error::InvalidState(
                "AesCtrEx read on a non-CTR section".to_string(),
            ));
        };
        self.check_bounds(offset, buf.len())?;
        self.read_ctr(offset, buf, &key, seed, Some(generation))
    }

    fn read_ctr(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        key: &[u8; 0x10],
        seed: u64,
        generation: Option<u32>,
    ) -> Result<()> {
        // The counter advances with the absolute NCA offset, so reads are
        // widened to the enclosing 16-byte block range.
        let abs = self.section_offset + offset;
        let aligned = align_down(abs, AES_ALIGN);
        let lead = (abs - aligned) as usize;
        let span = align_up(lead as u64 + buf.len() as u64, AES_ALIGN) as usize;

        let mut scratch = vec![0u8; span];
        self.storage.read_at(aligned, &mut scratch)?;

        let iv = match generation {
            Some(generation) => crypto::aes_ctr_ex_iv(seed, generation, aligned),
            None => crypto::nca_section_iv(seed, aligned),
        };
        crypto::aes128_ctr_crypt(key, &iv, &mut scratch);

        buf.copy_from_slice(&scratch[lead..lead + buf.len()]);
        Ok(())
    }

    fn read_xts(
        &mut self,
        offset: u64,
        buf: &mut [u8],
        key0: &[u8; 0x10],
        key1: &[u8; 0x10],
    ) -> Result<()> {
        let abs = self.section_offset + offset;
        let aligned = align_down(abs, XTS_SECTOR);
        let lead = (abs - aligned) as usize;
        let span = align_up(lead as u64 + buf.len() as u64, XTS_SECTOR) as usize;

        let mut scratch = vec![0u8; span];
        self.storage.read_at(aligned, &mut scratch)?;

        // NCA0 sectors are numbered by in-file offset past the header.
        let sector = (aligned - super::NCA_HEADER_SIZE as u64) >> 9;
        crypto::xts128_nintendo_decrypt(
            key0,
            key1,
            &mut scratch,
            XTS_SECTOR as usize,
            sector as u128,
        )?;

        buf.copy_from_slice(&scratch[lead..lead + buf.len()]);
        Ok(())
    }

    /// Reads from the hash-target layer, verifying every touched block
    /// against the section's hash tree.
    pub fn read_hash_target_verified(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let (_, target_size) = self.hash_target_extents();
        if offset + buf.len() as u64 > target_size {
            return Err(Error::InvalidArgument(
                "verified read out of hash-target bounds".to_string(),
            ));
        }

        let levels = self.hash_levels()?;
        let data_level = levels.len() - 1;

        let mut done = 0usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            let block_size = levels[data_level].block_size;
            let block_index = pos / block_size;
            let block_start = block_index * block_size;
            let in_block = (pos - block_start) as usize;

            let real_block = block_size.min(target_size - block_start) as usize;
            let mut block = vec![0u8; real_block];
            self.read_level_verified(&levels, data_level, block_index, &mut block)?;

            let copy = (real_block - in_block).min(buf.len() - done);
            buf[done..done + copy].copy_from_slice(&block[in_block..in_block + copy]);
            done += copy;
        }

        Ok(())
    }

    fn hash_levels(&self) -> Result<Vec<HashLevel>> {
        match &self.header.hash_data {
            HashData::HierarchicalSha256 {
                master_hash,
                hash_block_size,
                hash_table_offset,
                hash_table_size,
                pfs_offset,
                pfs_size,
                ..
            } => Ok(vec![
                HashLevel {
                    offset: *hash_table_offset,
                    size: *hash_table_size,
                    block_size: *hash_table_size,
                    master_hash: Some(*master_hash),
                },
                HashLevel {
                    offset: *pfs_offset,
                    size: *pfs_size,
                    block_size: *hash_block_size as u64,
                    master_hash: None,
                },
            ]),
            HashData::HierarchicalIntegrity {
                info_level_hash,
                master_hash,
                ..
            } => {
                let mut levels = Vec::new();
                for (i, info) in info_level_hash.levels.iter().enumerate() {
                    levels.push(HashLevel {
                        offset: info.logical_offset,
                        size: info.hash_data_size,
                        block_size: 1u64 << info.block_size_log2,
                        master_hash: (i == 0).then_some(*master_hash),
                    });
                }
                if levels.is_empty() {
                    return Err(Error::CorruptHeader(
                        HeaderKind::Nca,
                        "integrity info without levels".to_string(),
                    ));
                }
                Ok(levels)
            }
            HashData::Raw { .. } => Err(Error::UnsupportedVariant(
                "verified reads require a hash tree".to_string(),
            )),
        }
    }

    /// Reads one block of a hash level and verifies it against its hash
    /// one level up (or the master hash for level 0).
    fn read_level_verified(
        &mut self,
        levels: &[HashLevel],
        level: usize,
        block_index: u64,
        block: &mut [u8],
    ) -> Result<()> {
        let info = &levels[level];
        let block_start = block_index * info.block_size;
        self.read_at(info.offset + block_start, block)?;

        let computed = crypto::sha256(block);

        let expected = if let Some(master) = info.master_hash {
            // Level 0 is covered by the master hash as a whole.
            let mut whole = vec![0u8; info.size as usize];
            self.read_at(info.offset, &mut whole)?;
            if crypto::sha256(&whole) != master {
                return Err(Error::HashMismatch {
                    layer: "hash-tree-master",
                    offset: info.offset,
                });
            }
            // The block itself is part of the verified whole.
            return Ok(());
        } else {
            let parent = &levels[level - 1];
            let hash_pos = block_index * 0x20;
            let parent_block_index = hash_pos / parent.block_size;
            let parent_block_size =
                parent.block_size.min(parent.size - parent_block_index * parent.block_size);

            let mut parent_block = vec![0u8; parent_block_size as usize];
            self.read_level_verified(levels, level - 1, parent_block_index, &mut parent_block)?;

            let in_parent = (hash_pos - parent_block_index * parent.block_size) as usize;
            let mut hash = [0u8; 0x20];
            hash.copy_from_slice(&parent_block[in_parent..in_parent + 0x20]);
            hash
        };

        if computed != expected {
            return Err(Error::HashMismatch {
                layer: "hash-tree-block",
                offset: info.offset + block_start,
            });
        }
        Ok(())
    }

    /// Computes the patch regions needed to overlay `data` at
    /// `target_offset` of the hash-target layer while keeping the hash
    /// tree self-consistent.
    ///
    /// Regions are expressed in the decrypted section domain; applying
    /// them is the writer's concern.
    pub fn generate_hash_layer_patch(
        &mut self,
        data: &[u8],
        target_offset: u64,
    ) -> Result<SectionPatch> {
        let levels = self.hash_levels()?;
        let data_level = levels.len() - 1;
        let (_, target_size) = self.hash_target_extents();
        if target_offset + data.len() as u64 > target_size {
            return Err(Error::InvalidArgument(
                "patch exceeds hash-target bounds".to_string(),
            ));
        }

        let mut patch = SectionPatch::default();

        // Rebuild the touched data-level blocks first.
        let info = &levels[data_level];
        let first_block = target_offset / info.block_size;
        let last_block = (target_offset + data.len() as u64 - 1) / info.block_size;

        let mut level_dirty: Vec<(u64, Vec<u8>)> = Vec::new();
        for block_index in first_block..=last_block {
            let block_start = block_index * info.block_size;
            let real_block = info.block_size.min(info.size - block_start) as usize;
            let mut block = vec![0u8; real_block];
            self.read_at(info.offset + block_start, &mut block)?;

            let overlay_start = target_offset.max(block_start);
            let overlay_end =
                (target_offset + data.len() as u64).min(block_start + real_block as u64);
            let src = &data[(overlay_start - target_offset) as usize
                ..(overlay_end - target_offset) as usize];
            block[(overlay_start - block_start) as usize..(overlay_end - block_start) as usize]
                .copy_from_slice(src);

            level_dirty.push((block_index, block));
        }

        // Walk up the tree, replacing hashes and collecting the dirty
        // blocks of each level.
        for level in (0..=data_level).rev() {
            let info = &levels[level];
            for (block_index, block) in &level_dirty {
                patch.regions.push((
                    info.offset + block_index * info.block_size,
                    block.clone(),
                ));
            }

            if level == 0 {
                // The new level-0 content feeds the master hash.
                let mut whole = vec![0u8; info.size as usize];
                self.read_at(info.offset, &mut whole)?;
                for (block_index, block) in &level_dirty {
                    let start = (block_index * info.block_size) as usize;
                    whole[start..start + block.len()].copy_from_slice(block);
                }
                patch.master_hash = Some(crypto::sha256(&whole));
                break;
            }

            let parent = &levels[level - 1];
            let mut parent_dirty: Vec<(u64, Vec<u8>)> = Vec::new();
            for (block_index, block) in &level_dirty {
                let hash = crypto::sha256(block);
                let hash_pos = block_index * 0x20;
                let parent_block_index = hash_pos / parent.block_size;

                let entry_idx = match parent_dirty
                    .iter()
                    .position(|(idx, _)| *idx == parent_block_index)
                {
                    Some(pos) => pos,
                    None => {
                        let block_start = parent_block_index * parent.block_size;
                        let real_block =
                            parent.block_size.min(parent.size - block_start) as usize;
                        let mut bytes = vec![0u8; real_block];
                        self.read_at(parent.offset + block_start, &mut bytes)?;
                        parent_dirty.push((parent_block_index, bytes));
                        parent_dirty.len() - 1
                    }
                };

                let in_parent = (hash_pos - parent_block_index * parent.block_size) as usize;
                parent_dirty[entry_idx].1[in_parent..in_parent + 0x20].copy_from_slice(&hash);
            }
            level_dirty = parent_dirty;
        }

        Ok(patch)
    }
}

struct HashLevel {
    /// Level offset, relative to the section start.
    offset: u64,
    size: u64,
    block_size: u64,
    master_hash: Option<[u8; 0x20]>,
}

/// In-memory patch produced by [`NcaFsSection::generate_hash_layer_patch`].
#[derive(Default, Clone)]
pub struct SectionPatch {
    /// (section-relative offset, replacement bytes) pairs.
    pub regions: Vec<(u64, Vec<u8>)>,
    /// Replacement master hash for the section header, when level 0
    /// changed.
    pub master_hash: Option<[u8; 0x20]>,
}

/// Wraps a section as a [`VirtualStorage`] over its full decrypted range.
pub struct SectionStorage {
    section: Arc<Mutex<NcaFsSection>>,
}

impl SectionStorage {
    pub fn new(section: Arc<Mutex<NcaFsSection>>) -> Self {
        Self { section }
    }
}

impl VirtualStorage for SectionStorage {
    fn len(&self) -> u64 {
        self.section.lock().unwrap().size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.section.lock().unwrap().read_at(offset, buf)
    }
}
