//! HFS0 (hashed filesystem) partitions, the container format used by
//! gamecards.
//!
//! The root partition names the child partitions (`update`, `logo`,
//! `normal`, `secure`); each child holds the actual content files. Every
//! partition header carries a SHA-256 hash per entry, and the header
//! itself is verified against a hash stored one level up (the signed
//! gamecard header for the root, the root entry for children).

use binrw::prelude::*;

use crate::crypto;
use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage, align_up};

use super::header::GAMECARD_PAGE_SIZE;

pub const HFS0_MAGIC: &[u8; 4] = b"HFS0";
pub const HFS0_HEADER_SIZE: u64 = 0x10;
pub const HFS0_ENTRY_SIZE: u64 = 0x40;

/// Known Hash FS partitions on a gamecard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HfsPartitionType {
    Root,
    Update,
    Logo,
    Normal,
    Secure,
    Boot,
}

impl HfsPartitionType {
    pub fn name(self) -> &'static str {
        match self {
            HfsPartitionType::Root => "root",
            HfsPartitionType::Update => "update",
            HfsPartitionType::Logo => "logo",
            HfsPartitionType::Normal => "normal",
            HfsPartitionType::Secure => "secure",
            HfsPartitionType::Boot => "boot",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "root" => Some(HfsPartitionType::Root),
            "update" => Some(HfsPartitionType::Update),
            "logo" => Some(HfsPartitionType::Logo),
            "normal" => Some(HfsPartitionType::Normal),
            "secure" => Some(HfsPartitionType::Secure),
            "boot" => Some(HfsPartitionType::Boot),
            _ => None,
        }
    }
}

#[binrw]
#[brw(little, magic = b"HFS0")]
#[derive(Debug, Clone)]
struct RawHfsHeader {
    entry_count: u32,
    name_table_size: u32,
    _reserved: [u8; 4],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawHfsEntry {
    offset: u64,
    size: u64,
    name_offset: u32,
    hash_target_size: u32,
    hash_target_offset: u64,
    hash: [u8; 0x20],
}

/// A single named entry inside a Hash FS partition.
#[derive(Debug, Clone)]
pub struct HfsEntry {
    pub name: String,
    /// Offset relative to the end of the partition header.
    pub offset: u64,
    pub size: u64,
    /// Extent of this entry's data covered by `hash`.
    pub hash_target_offset: u64,
    pub hash_target_size: u32,
    pub hash: [u8; 0x20],
}

/// A parsed Hash FS partition bound to its backing storage.
pub struct HashFs {
    partition_type: HfsPartitionType,
    /// Partition offset, absolute within the backing storage.
    offset: u64,
    /// Partition size (header included).
    size: u64,
    /// Full header size, page aligned.
    header_size: u64,
    entries: Vec<HfsEntry>,
    storage: SharedStorage,
}

impl std::fmt::Debug for HashFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashFs")
            .field("partition_type", &self.partition_type)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("header_size", &self.header_size)
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl HashFs {
    /// Parses a Hash FS partition at `offset` in `storage`.
    ///
    /// When `expected_hash` is present the header region
    /// `[hash_target_offset, hash_target_offset + hash_target_size)` is
    /// hashed (with the optional 1-byte compatibility salt appended) and
    /// compared against it. The root partition passes `size == 0` and gets
    /// its size derived from its last entry.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        mut storage: SharedStorage,
        partition_type: HfsPartitionType,
        offset: u64,
        size: u64,
        expected_hash: Option<&[u8; 0x20]>,
        hash_target_offset: u64,
        hash_target_size: u32,
        salt: Option<u8>,
    ) -> Result<Self> {
        // Partial header first: magic + counts.
        let mut partial = [0u8; HFS0_HEADER_SIZE as usize];
        storage.read_at(offset, &mut partial)?;

        let raw: RawHfsHeader =
            binrw::io::Cursor::new(partial.as_slice())
                .read_le()
                .map_err(|e| {
                    Error::CorruptHeader(HeaderKind::HashFs, format!("bad HFS0 header: {e}"))
                })?;

        if partition_type == HfsPartitionType::Root && raw.entry_count == 0 {
            return Err(Error::CorruptHeader(
                HeaderKind::HashFs,
                "root partition with no entries".to_string(),
            ));
        }
        if raw.name_table_size == 0 {
            return Err(Error::CorruptHeader(
                HeaderKind::HashFs,
                "empty name table".to_string(),
            ));
        }

        let header_size = align_up(
            HFS0_HEADER_SIZE + raw.entry_count as u64 * HFS0_ENTRY_SIZE + raw.name_table_size as u64,
            GAMECARD_PAGE_SIZE,
        );

        let mut header = vec![0u8; header_size as usize];
        storage.read_at(offset, &mut header)?;

        // Verify the header before trusting any of its entries.
        if let Some(expected) = expected_hash {
            let end = hash_target_offset
                .checked_add(hash_target_size as u64)
                .filter(|end| *end <= header_size)
                .ok_or_else(|| {
                    Error::CorruptHeader(
                        HeaderKind::HashFs,
                        "hash target exceeds header".to_string(),
                    )
                })?;

            let mut target = header[hash_target_offset as usize..end as usize].to_vec();
            if let Some(salt) = salt {
                target.push(salt);
            }

            if crypto::sha256(&target) != *expected {
                return Err(Error::HashMismatch {
                    layer: "hfs-header",
                    offset,
                });
            }
        }

        // Entry table and name table.
        let name_table_start =
            (HFS0_HEADER_SIZE + raw.entry_count as u64 * HFS0_ENTRY_SIZE) as usize;
        let name_table =
            &header[name_table_start..name_table_start + raw.name_table_size as usize];

        let mut cursor = binrw::io::Cursor::new(&header[HFS0_HEADER_SIZE as usize..]);
        let mut entries = Vec::with_capacity(raw.entry_count as usize);
        let mut data_end = 0u64;

        for i in 0..raw.entry_count {
            let raw_entry: RawHfsEntry = cursor.read_le().map_err(|e| {
                Error::CorruptHeader(HeaderKind::HashFs, format!("bad HFS0 entry #{i}: {e}"))
            })?;

            if raw_entry.name_offset >= raw.name_table_size {
                return Err(Error::CorruptHeader(
                    HeaderKind::HashFs,
                    format!("entry #{i} name offset out of range"),
                ));
            }
            let name_bytes = &name_table[raw_entry.name_offset as usize..];
            let name_end = name_bytes.iter().position(|&b| b == 0).ok_or_else(|| {
                Error::CorruptHeader(HeaderKind::HashFs, format!("entry #{i} name unterminated"))
            })?;
            if name_end == 0 {
                return Err(Error::CorruptHeader(
                    HeaderKind::HashFs,
                    format!("entry #{i} has an empty name"),
                ));
            }
            let name = std::str::from_utf8(&name_bytes[..name_end])?.to_string();

            data_end = data_end.max(raw_entry.offset + raw_entry.size);

            entries.push(HfsEntry {
                name,
                offset: raw_entry.offset,
                size: raw_entry.size,
                hash_target_offset: raw_entry.hash_target_offset,
                hash_target_size: raw_entry.hash_target_size,
                hash: raw_entry.hash,
            });
        }

        let size = if size != 0 {
            size
        } else {
            header_size + data_end
        };

        for (i, entry) in entries.iter().enumerate() {
            if header_size + entry.offset + entry.size > size {
                return Err(Error::CorruptHeader(
                    HeaderKind::HashFs,
                    format!("entry #{i} exceeds partition bounds"),
                ));
            }
        }

        tracing::debug!(
            partition = partition_type.name(),
            offset = format_args!("0x{offset:X}"),
            size = format_args!("0x{size:X}"),
            entries = entries.len(),
            "Hash FS partition opened"
        );

        Ok(Self {
            partition_type,
            offset,
            size,
            header_size,
            entries,
            storage,
        })
    }

    pub fn partition_type(&self) -> HfsPartitionType {
        self.partition_type
    }

    /// Partition offset, absolute within the backing storage.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn header_size(&self) -> u64 {
        self.header_size
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[HfsEntry] {
        &self.entries
    }

    pub fn entry_by_index(&self, index: usize) -> Option<&HfsEntry> {
        self.entries.get(index)
    }

    pub fn entry_by_name(&self, name: &str) -> Result<&HfsEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "entry \"{name}\" in {} partition",
                    self.partition_type.name()
                ))
            })
    }

    /// Absolute offset and size of a named entry within the backing
    /// storage.
    pub fn entry_info(&self, name: &str) -> Result<(u64, u64)> {
        let entry = self.entry_by_name(name)?;
        Ok((self.offset + self.header_size + entry.offset, entry.size))
    }

    /// Reads entry data; `offset` is relative to the entry start.
    pub fn read_entry(&mut self, entry_index: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let entry = self.entries.get(entry_index).ok_or_else(|| {
            Error::NotFound(format!("HFS entry index {entry_index}"))
        })?;
        if offset + buf.len() as u64 > entry.size {
            return Err(Error::InvalidArgument(format!(
                "read past end of entry \"{}\"",
                entry.name
            )));
        }
        let abs = self.offset + self.header_size + entry.offset + offset;
        self.storage.read_at(abs, buf)
    }

    /// Sum of all entry sizes.
    pub fn total_data_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::ReaderStorage;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    /// Builds a raw HFS0 partition image: header + entries + names,
    /// page-padded, followed by entry data. Returns the raw bytes and the
    /// header hash over `[0, hash_target_size)`.
    pub(crate) fn build_partition(
        files: &[(&str, &[u8])],
        salt: Option<u8>,
    ) -> (Vec<u8>, [u8; 0x20], u32) {
        let mut names = Vec::new();
        let mut name_offsets = Vec::new();
        for (name, _) in files {
            name_offsets.push(names.len() as u32);
            names.extend_from_slice(name.as_bytes());
            names.push(0);
        }

        let header_size = align_up(
            HFS0_HEADER_SIZE + files.len() as u64 * HFS0_ENTRY_SIZE + names.len() as u64,
            GAMECARD_PAGE_SIZE,
        );

        let mut raw = Vec::new();
        raw.extend_from_slice(HFS0_MAGIC);
        raw.extend_from_slice(&(files.len() as u32).to_le_bytes());
        raw.extend_from_slice(&(names.len() as u32).to_le_bytes());
        raw.extend_from_slice(&[0u8; 4]);

        let mut data_offset = 0u64;
        for (i, (_, data)) in files.iter().enumerate() {
            raw.extend_from_slice(&data_offset.to_le_bytes());
            raw.extend_from_slice(&(data.len() as u64).to_le_bytes());
            raw.extend_from_slice(&name_offsets[i].to_le_bytes());
            raw.extend_from_slice(&(data.len() as u32).to_le_bytes()); // hash_target_size
            raw.extend_from_slice(&0u64.to_le_bytes()); // hash_target_offset
            raw.extend_from_slice(&crypto::sha256(data));
            data_offset += data.len() as u64;
        }
        raw.extend_from_slice(&names);
        raw.resize(header_size as usize, 0);

        for (_, data) in files {
            raw.extend_from_slice(data);
        }

        let hash_target_size = header_size as u32;
        let mut target = raw[..header_size as usize].to_vec();
        if let Some(salt) = salt {
            target.push(salt);
        }
        (raw, crypto::sha256(&target), hash_target_size)
    }

    fn storage_from(raw: Vec<u8>) -> SharedStorage {
        let len = raw.len() as u64;
        Arc::new(Mutex::new(ReaderStorage::new(Cursor::new(raw), 0, len)))
    }

    #[test]
    fn test_parse_and_read_entries() {
        let files: [(&str, &[u8]); 2] = [("aaa.nca", b"first file"), ("bbb.tik", b"second")];
        let (raw, hash, hash_size) = build_partition(&files, None);
        let storage = storage_from(raw);

        let mut hfs = HashFs::open(
            storage,
            HfsPartitionType::Secure,
            0,
            0,
            Some(&hash),
            0,
            hash_size,
            None,
        )
        .unwrap();

        assert_eq!(hfs.entry_count(), 2);
        assert_eq!(hfs.total_data_size(), 16);

        let (abs, size) = hfs.entry_info("bbb.tik").unwrap();
        assert_eq!(size, 6);
        assert_eq!(abs, hfs.header_size() + 10);

        let mut buf = vec![0u8; 6];
        hfs.read_entry(1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"second");

        // Partial read at an interior offset.
        let mut buf = vec![0u8; 4];
        hfs.read_entry(0, 6, &mut buf).unwrap();
        assert_eq!(&buf, b"file");

        assert!(hfs.entry_by_name("missing").is_err());
    }

    #[test]
    fn test_header_hash_mismatch() {
        let files: [(&str, &[u8]); 1] = [("x", b"data")];
        let (raw, mut hash, hash_size) = build_partition(&files, None);
        hash[0] ^= 0xFF;
        let storage = storage_from(raw);

        let err = HashFs::open(
            storage,
            HfsPartitionType::Normal,
            0,
            0,
            Some(&hash),
            0,
            hash_size,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, Error::HashMismatch { layer: "hfs-header", .. }));
    }

    #[test]
    fn test_salted_root_hash() {
        let files: [(&str, &[u8]); 1] = [("secure", b"p")];
        let (raw, salted_hash, hash_size) = build_partition(&files, Some(0x01));
        let storage = storage_from(raw.clone());

        // With the salt supplied, the salted hash matches.
        HashFs::open(
            storage,
            HfsPartitionType::Root,
            0,
            0,
            Some(&salted_hash),
            0,
            hash_size,
            Some(0x01),
        )
        .unwrap();

        // Without the salt it must not.
        let storage = storage_from(raw);
        assert!(
            HashFs::open(
                storage,
                HfsPartitionType::Root,
                0,
                0,
                Some(&salted_hash),
                0,
                hash_size,
                None,
            )
            .is_err()
        );
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut raw = vec![0u8; 0x400];
        raw[..4].copy_from_slice(b"PFS0");
        let storage = storage_from(raw);
        assert!(
            HashFs::open(storage, HfsPartitionType::Update, 0, 0x400, None, 0, 0, None).is_err()
        );
    }
}
