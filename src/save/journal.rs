//! Journal storage: block-level virtual-to-physical indirection over the
//! data remap.
//!
//! The journal map table assigns each virtual main-data block a physical
//! block inside the journaled region. Entries are stored as packed u32
//! pairs; the physical index lives in the first word.

use crate::error::{Error, HeaderKind, Result};

use super::remap::RemapStorage;

#[derive(Debug, Clone)]
pub struct JournalStorage {
    /// Physical block index per virtual block.
    physical_blocks: Vec<u32>,
    block_size: u64,
    /// Journal data region offset within the data remap space.
    journal_data_offset: u64,
    /// Main data length (total size minus the journal area).
    length: u64,
}

impl JournalStorage {
    pub fn new(
        map_storage: &[u8],
        main_data_block_count: u32,
        block_size: u64,
        journal_data_offset: u64,
        length: u64,
    ) -> Result<Self> {
        if map_storage.len() < main_data_block_count as usize * 8 {
            return Err(Error::CorruptHeader(
                HeaderKind::Save,
                "journal map table truncated".to_string(),
            ));
        }
        let mut physical_blocks = Vec::with_capacity(main_data_block_count as usize);
        for i in 0..main_data_block_count as usize {
            let word = u32::from_le_bytes(map_storage[i * 8..i * 8 + 4].try_into().unwrap());
            physical_blocks.push(word & 0x7FFF_FFFF);
        }
        Ok(Self {
            physical_blocks,
            block_size,
            journal_data_offset,
            length,
        })
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Reads main data, translating block by block through the map.
    pub fn read(
        &self,
        data_remap: &mut RemapStorage,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.length {
            return Err(Error::InvalidArgument(format!(
                "journal read out of bounds (offset 0x{offset:X}, len 0x{:X})",
                buf.len()
            )));
        }

        let mut in_pos = offset;
        let mut out_pos = 0usize;
        while out_pos < buf.len() {
            let block = in_pos / self.block_size;
            let block_pos = in_pos % self.block_size;
            let physical = self.physical_blocks.get(block as usize).ok_or_else(|| {
                Error::CorruptHeader(
                    HeaderKind::Save,
                    format!("no journal map entry for block {block}"),
                )
            })?;
            let physical_offset = *physical as u64 * self.block_size + block_pos;
            let chunk = ((self.block_size - block_pos) as usize).min(buf.len() - out_pos);

            data_remap.read(
                self.journal_data_offset + physical_offset,
                &mut buf[out_pos..out_pos + chunk],
            )?;

            in_pos += chunk as u64;
            out_pos += chunk;
        }
        Ok(())
    }
}
