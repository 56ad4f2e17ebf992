//! Remap storage: virtual-to-physical extent translation.
//!
//! A remap table is a list of `{virtual_offset, physical_offset, size}`
//! entries. Entries whose virtual extents touch are grouped into
//! segments; the segment for an offset is selected by the top
//! `segment_bits` of the offset, then entries are scanned linearly.

use binrw::prelude::*;

use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage};

use super::duplex::DuplexStorage;

pub const REMAP_ENTRY_SIZE: usize = 0x20;

#[binrw]
#[brw(little, magic = b"RMAP")]
#[derive(Debug, Clone)]
pub struct RemapHeader {
    pub version: u32,
    pub map_entry_count: u32,
    pub map_segment_count: u32,
    pub segment_bits: u32,
    pub _reserved: [u8; 0x2C],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct RawRemapEntry {
    pub virtual_offset: u64,
    pub physical_offset: u64,
    pub size: u64,
    pub alignment: u32,
    pub _reserved: u32,
}

#[derive(Debug, Clone)]
struct RemapEntry {
    virtual_offset: u64,
    physical_offset: u64,
    virtual_offset_end: u64,
}

#[derive(Debug, Clone)]
struct RemapSegment {
    entries: Vec<RemapEntry>,
}

/// What a remap storage translates into.
pub enum RemapBacking {
    /// Raw savefile reads (data remap).
    File(SharedStorage),
    /// Duplex storage reads (meta remap).
    Duplex(DuplexStorage),
}

pub struct RemapStorage {
    segments: Vec<RemapSegment>,
    segment_bits: u32,
    backing: RemapBacking,
    /// Added to every physical offset (the data remap bases physical
    /// offsets at the file-map data area).
    base_storage_offset: u64,
}

impl RemapStorage {
    /// Builds a remap storage from raw entry-table bytes.
    pub fn new(
        header: &RemapHeader,
        entry_table: &[u8],
        backing: RemapBacking,
        base_storage_offset: u64,
    ) -> Result<Self> {
        if header.segment_bits == 0 || header.segment_bits > 63 {
            return Err(Error::CorruptHeader(
                HeaderKind::Save,
                format!("invalid remap segment bits {}", header.segment_bits),
            ));
        }
        if entry_table.len() < header.map_entry_count as usize * REMAP_ENTRY_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Save,
                "remap entry table truncated".to_string(),
            ));
        }

        let mut entries = Vec::with_capacity(header.map_entry_count as usize);
        let mut cursor = binrw::io::Cursor::new(entry_table);
        for _ in 0..header.map_entry_count {
            let raw: RawRemapEntry = cursor.read_le()?;
            entries.push(RemapEntry {
                virtual_offset: raw.virtual_offset,
                physical_offset: raw.physical_offset,
                virtual_offset_end: raw.virtual_offset + raw.size,
            });
        }

        // Group entries into segments by virtual-extent contiguity.
        let mut segments: Vec<RemapSegment> = Vec::with_capacity(header.map_segment_count as usize);
        let mut iter = entries.into_iter().peekable();
        for _ in 0..header.map_segment_count {
            let Some(first) = iter.next() else {
                return Err(Error::CorruptHeader(
                    HeaderKind::Save,
                    "remap segment without entries".to_string(),
                ));
            };
            let mut segment = RemapSegment {
                entries: vec![first],
            };
            while let Some(next) = iter.peek() {
                if segment.entries.last().unwrap().virtual_offset_end != next.virtual_offset {
                    break;
                }
                segment.entries.push(iter.next().unwrap());
            }
            segments.push(segment);
        }

        Ok(Self {
            segments,
            segment_bits: header.segment_bits,
            backing,
            base_storage_offset,
        })
    }

    fn entry_for(&self, offset: u64) -> Result<(usize, usize)> {
        let segment_idx = (offset >> (64 - self.segment_bits)) as usize;
        let segment = self.segments.get(segment_idx).ok_or_else(|| {
            Error::CorruptHeader(
                HeaderKind::Save,
                format!("no remap segment for offset 0x{offset:X}"),
            )
        })?;
        for (i, entry) in segment.entries.iter().enumerate() {
            if entry.virtual_offset_end > offset {
                return Ok((segment_idx, i));
            }
        }
        Err(Error::CorruptHeader(
            HeaderKind::Save,
            format!("no remap entry for offset 0x{offset:X}"),
        ))
    }

    /// Reads from the remapped virtual space.
    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }

        let (segment_idx, mut entry_idx) = self.entry_for(offset)?;
        let mut in_pos = offset;
        let mut out_pos = 0usize;

        while out_pos < buf.len() {
            let entry = self.segments[segment_idx]
                .entries
                .get(entry_idx)
                .ok_or_else(|| {
                    Error::CorruptHeader(
                        HeaderKind::Save,
                        "remap read ran past the segment".to_string(),
                    )
                })?
                .clone();

            let entry_pos = in_pos - entry.virtual_offset;
            let chunk =
                ((entry.virtual_offset_end - in_pos) as usize).min(buf.len() - out_pos);
            let physical = self.base_storage_offset + entry.physical_offset + entry_pos;

            match &mut self.backing {
                RemapBacking::File(storage) => {
                    storage.read_at(physical, &mut buf[out_pos..out_pos + chunk])?
                }
                RemapBacking::Duplex(duplex) => {
                    duplex.read(physical, &mut buf[out_pos..out_pos + chunk])?
                }
            }

            in_pos += chunk as u64;
            out_pos += chunk;
            if in_pos >= entry.virtual_offset_end {
                entry_idx += 1;
            }
        }
        Ok(())
    }
}
