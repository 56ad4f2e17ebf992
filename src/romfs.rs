//! RomFS parsing over composed NCA storages.
//!
//! A RomFS is a read-only filesystem with flat directory and file entry
//! tables. Reads go through an [`NcaStorage`], so the same code serves
//! plain sections and BKTR-patched sections; [`BktrRomFs`] wires a base
//! and a patch NCA together and reads the patched view.

use std::collections::HashMap;

use binrw::BinReaderExt;
use binrw::prelude::*;

use crate::error::{Error, HeaderKind, Result};
use crate::io::VirtualStorage;
use crate::nca::section::NcaFsSection;
use crate::nca::storage::NcaStorage;

/// Marks the end of sibling chains and empty child lists.
pub const ROMFS_VOID_ENTRY: u32 = 0xFFFFFFFF;
/// Entry sizes are padded to this alignment past the name.
pub const ROMFS_TABLE_ENTRY_ALIGNMENT: u32 = 4;

pub const ROMFS_OLD_HEADER_SIZE: u64 = 0x28;
pub const ROMFS_HEADER_SIZE: u64 = 0x50;

const DIR_ENTRY_BASE_SIZE: usize = 0x18;
const FILE_ENTRY_BASE_SIZE: usize = 0x20;

/// Normalized RomFS header; the legacy shape stores every field as u32.
#[derive(Debug, Clone, Default)]
pub struct RomFsHeader {
    pub header_size: u64,
    pub dir_hash_table_offset: u64,
    pub dir_hash_table_size: u64,
    pub dir_table_offset: u64,
    pub dir_table_size: u64,
    pub file_hash_table_offset: u64,
    pub file_hash_table_size: u64,
    pub file_table_offset: u64,
    pub file_table_size: u64,
    pub body_offset: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawHeaderOld {
    header_size: u32,
    dir_hash_table_offset: u32,
    dir_hash_table_size: u32,
    dir_table_offset: u32,
    dir_table_size: u32,
    file_hash_table_offset: u32,
    file_hash_table_size: u32,
    file_table_offset: u32,
    file_table_size: u32,
    body_offset: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
struct RawHeaderCurrent {
    header_size: u64,
    dir_hash_table_offset: u64,
    dir_hash_table_size: u64,
    dir_table_offset: u64,
    dir_table_size: u64,
    file_hash_table_offset: u64,
    file_hash_table_size: u64,
    file_table_offset: u64,
    file_table_size: u64,
    body_offset: u64,
}

/// Directory entry structure
#[derive(Debug, Clone)]
pub struct RomFsDirEntry {
    pub table_offset: u32,
    pub parent: u32,
    pub next_sibling: u32,
    pub first_child_dir: u32,
    pub first_child_file: u32,
    pub hash_bucket: u32,
    pub name: String,
}

/// File entry structure
#[derive(Debug, Clone)]
pub struct RomFsFileEntry {
    pub table_offset: u32,
    pub parent: u32,
    pub next_sibling: u32,
    pub data_offset: u64,
    pub data_size: u64,
    pub hash_bucket: u32,
    pub name: String,
}

/// A directory listing entry.
#[derive(Debug, Clone)]
pub struct DirListEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

enum RomFsBacking {
    Nca(NcaStorage),
    Raw(Box<dyn VirtualStorage>),
}

impl RomFsBacking {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self {
            RomFsBacking::Nca(storage) => storage.read_at(offset, buf),
            RomFsBacking::Raw(storage) => storage.read_at(offset, buf),
        }
    }
}

/// RomFS representation
pub struct RomFs {
    backing: RomFsBacking,
    /// RomFS start within the backing storage.
    base_offset: u64,
    /// RomFS size.
    size: u64,
    pub header: RomFsHeader,
    dir_table: Vec<u8>,
    file_table: Vec<u8>,
    cache_dir_entries: HashMap<u32, RomFsDirEntry>,
    cache_file_entries: HashMap<u32, RomFsFileEntry>,
}

impl RomFs {
    /// Opens the RomFS inside a composed section storage, positioned at
    /// the storage's hash-target extents.
    pub fn open(storage: NcaStorage) -> Result<Self> {
        let (base_offset, size) = storage.hash_target_extents();
        Self::open_inner(RomFsBacking::Nca(storage), base_offset, size)
    }

    /// Opens a RomFS from raw storage, for images outside an NCA.
    pub fn from_storage(storage: Box<dyn VirtualStorage>, base_offset: u64) -> Result<Self> {
        let size = storage.len() - base_offset;
        Self::open_inner(RomFsBacking::Raw(storage), base_offset, size)
    }

    fn open_inner(mut backing: RomFsBacking, base_offset: u64, size: u64) -> Result<Self> {
        // Shape is keyed off the leading header-size field.
        let mut size_probe = [0u8; 8];
        backing.read_at(base_offset, &mut size_probe)?;
        let declared = u64::from_le_bytes(size_probe);

        let header = if declared == ROMFS_OLD_HEADER_SIZE
            || (declared & 0xFFFF_FFFF) == ROMFS_OLD_HEADER_SIZE
        {
            let mut raw = vec![0u8; ROMFS_OLD_HEADER_SIZE as usize];
            backing.read_at(base_offset, &mut raw)?;
            let old: RawHeaderOld = binrw::io::Cursor::new(&raw).read_le()?;
            RomFsHeader {
                header_size: old.header_size as u64,
                dir_hash_table_offset: old.dir_hash_table_offset as u64,
                dir_hash_table_size: old.dir_hash_table_size as u64,
                dir_table_offset: old.dir_table_offset as u64,
                dir_table_size: old.dir_table_size as u64,
                file_hash_table_offset: old.file_hash_table_offset as u64,
                file_hash_table_size: old.file_hash_table_size as u64,
                file_table_offset: old.file_table_offset as u64,
                file_table_size: old.file_table_size as u64,
                body_offset: old.body_offset as u64,
            }
        } else if declared == ROMFS_HEADER_SIZE {
            let mut raw = vec![0u8; ROMFS_HEADER_SIZE as usize];
            backing.read_at(base_offset, &mut raw)?;
            let cur: RawHeaderCurrent = binrw::io::Cursor::new(&raw).read_le()?;
            RomFsHeader {
                header_size: cur.header_size,
                dir_hash_table_offset: cur.dir_hash_table_offset,
                dir_hash_table_size: cur.dir_hash_table_size,
                dir_table_offset: cur.dir_table_offset,
                dir_table_size: cur.dir_table_size,
                file_hash_table_offset: cur.file_hash_table_offset,
                file_hash_table_size: cur.file_hash_table_size,
                file_table_offset: cur.file_table_offset,
                file_table_size: cur.file_table_size,
                body_offset: cur.body_offset,
            }
        } else {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                format!("unrecognized RomFS header size 0x{declared:X}"),
            ));
        };

        if header.dir_table_offset + header.dir_table_size > size
            || header.file_table_offset + header.file_table_size > size
            || header.body_offset > size
        {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                "table extents exceed the RomFS image".to_string(),
            ));
        }

        tracing::trace!(
            header_size = header.header_size,
            dir_table_size = header.dir_table_size,
            file_table_size = header.file_table_size,
            body_offset = format_args!("0x{:X}", header.body_offset),
            "RomFS header parsed"
        );

        // Both tables live in memory for the lifetime of the handle.
        let mut dir_table = vec![0u8; header.dir_table_size as usize];
        backing.read_at(base_offset + header.dir_table_offset, &mut dir_table)?;
        let mut file_table = vec![0u8; header.file_table_size as usize];
        backing.read_at(base_offset + header.file_table_offset, &mut file_table)?;

        Ok(Self {
            backing,
            base_offset,
            size,
            header,
            dir_table,
            file_table,
            cache_dir_entries: HashMap::new(),
            cache_file_entries: HashMap::new(),
        })
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read a directory entry from the directory table
    pub fn dir_entry_at(&mut self, offset: u32) -> Result<RomFsDirEntry> {
        if let Some(entry) = self.cache_dir_entries.get(&offset) {
            return Ok(entry.clone());
        }

        let table = &self.dir_table;
        let pos = offset as usize;
        if pos + DIR_ENTRY_BASE_SIZE > table.len() {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                format!("directory entry offset 0x{offset:X} out of range"),
            ));
        }

        let word = |at: usize| u32::from_le_bytes(table[pos + at..pos + at + 4].try_into().unwrap());
        let name_length = word(0x14) as usize;
        if pos + DIR_ENTRY_BASE_SIZE + name_length > table.len() {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                "directory entry name exceeds table".to_string(),
            ));
        }
        let name = std::str::from_utf8(
            &table[pos + DIR_ENTRY_BASE_SIZE..pos + DIR_ENTRY_BASE_SIZE + name_length],
        )?
        .to_string();

        let entry = RomFsDirEntry {
            table_offset: offset,
            parent: word(0x00),
            next_sibling: word(0x04),
            first_child_dir: word(0x08),
            first_child_file: word(0x0C),
            hash_bucket: word(0x10),
            name,
        };
        self.cache_dir_entries.insert(offset, entry.clone());
        Ok(entry)
    }

    /// Read a file entry from the file table
    pub fn file_entry_at(&mut self, offset: u32) -> Result<RomFsFileEntry> {
        if let Some(entry) = self.cache_file_entries.get(&offset) {
            return Ok(entry.clone());
        }

        let table = &self.file_table;
        let pos = offset as usize;
        if pos + FILE_ENTRY_BASE_SIZE > table.len() {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                format!("file entry offset 0x{offset:X} out of range"),
            ));
        }

        let word = |at: usize| u32::from_le_bytes(table[pos + at..pos + at + 4].try_into().unwrap());
        let dword =
            |at: usize| u64::from_le_bytes(table[pos + at..pos + at + 8].try_into().unwrap());
        let name_length = word(0x1C) as usize;
        if pos + FILE_ENTRY_BASE_SIZE + name_length > table.len() {
            return Err(Error::CorruptHeader(
                HeaderKind::Romfs,
                "file entry name exceeds table".to_string(),
            ));
        }
        let name = std::str::from_utf8(
            &table[pos + FILE_ENTRY_BASE_SIZE..pos + FILE_ENTRY_BASE_SIZE + name_length],
        )?
        .to_string();

        let entry = RomFsFileEntry {
            table_offset: offset,
            parent: word(0x00),
            next_sibling: word(0x04),
            data_offset: dword(0x08),
            data_size: dword(0x10),
            hash_bucket: word(0x18),
            name,
        };
        self.cache_file_entries.insert(offset, entry.clone());
        Ok(entry)
    }

    /// Resolves a directory by `/`-separated path.
    pub fn dir_by_path(&mut self, path: &str) -> Result<RomFsDirEntry> {
        let mut current = self.dir_entry_at(0)?;
        for component in path.split('/').filter(|p| !p.is_empty()) {
            let mut cursor = current.first_child_dir;
            let mut found = None;
            while cursor != ROMFS_VOID_ENTRY {
                let entry = self.dir_entry_at(cursor)?;
                if entry.name == component {
                    found = Some(entry);
                    break;
                }
                cursor = entry.next_sibling;
            }
            current = found.ok_or_else(|| {
                Error::NotFound(format!("RomFS directory \"{component}\" in \"{path}\""))
            })?;
        }
        Ok(current)
    }

    /// Resolves a file by `/`-separated path.
    pub fn file_by_path(&mut self, path: &str) -> Result<RomFsFileEntry> {
        let (parent_path, file_name) = match path.rfind('/') {
            Some(split) => (&path[..split], &path[split + 1..]),
            None => ("", path),
        };
        if file_name.is_empty() {
            return Err(Error::InvalidArgument(format!("invalid file path \"{path}\"")));
        }

        let parent = self.dir_by_path(parent_path)?;
        let mut cursor = parent.first_child_file;
        while cursor != ROMFS_VOID_ENTRY {
            let entry = self.file_entry_at(cursor)?;
            if entry.name == file_name {
                return Ok(entry);
            }
            cursor = entry.next_sibling;
        }
        Err(Error::NotFound(format!("RomFS file \"{path}\"")))
    }

    /// Lists one directory: child directories first, then files.
    pub fn list_dir(&mut self, path: &str) -> Result<Vec<DirListEntry>> {
        let dir = self.dir_by_path(path)?;
        let mut out = Vec::new();

        let mut cursor = dir.first_child_dir;
        while cursor != ROMFS_VOID_ENTRY {
            let entry = self.dir_entry_at(cursor)?;
            cursor = entry.next_sibling;
            out.push(DirListEntry {
                name: entry.name,
                is_dir: true,
                size: 0,
            });
        }

        let mut cursor = dir.first_child_file;
        while cursor != ROMFS_VOID_ENTRY {
            let entry = self.file_entry_at(cursor)?;
            cursor = entry.next_sibling;
            out.push(DirListEntry {
                name: entry.name,
                is_dir: false,
                size: entry.data_size,
            });
        }

        Ok(out)
    }

    /// Reads file content; `offset` is relative to the file start.
    pub fn read_file(&mut self, entry: &RomFsFileEntry, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > entry.data_size {
            return Err(Error::InvalidArgument(format!(
                "read past end of \"{}\"",
                entry.name
            )));
        }
        let abs = self.base_offset + self.header.body_offset + entry.data_offset + offset;
        self.backing.read_at(abs, buf)
    }

    /// Sum of all file sizes, walking the file table sequentially.
    pub fn total_data_size(&mut self) -> Result<u64> {
        let mut total = 0u64;
        let mut offset = 0usize;
        while offset + FILE_ENTRY_BASE_SIZE <= self.file_table.len() {
            let entry = self.file_entry_at(offset as u32)?;
            total += entry.data_size;
            let name_padded = (entry.name.len() as u32)
                .next_multiple_of(ROMFS_TABLE_ENTRY_ALIGNMENT) as usize;
            offset += FILE_ENTRY_BASE_SIZE + name_padded;
        }
        Ok(total)
    }

    fn patch_storage(&self) -> Result<&NcaStorage> {
        match &self.backing {
            RomFsBacking::Nca(storage) => Ok(storage),
            RomFsBacking::Raw(_) => Err(Error::InvalidState(
                "patch queries need an NCA-backed RomFS".to_string(),
            )),
        }
    }
}

/// A patched RomFS synthesized from a base NCA section and a patch NCA
/// section.
///
/// The directory and file tables come from the patch (they describe the
/// updated filesystem); reads pull transparently from both NCAs through
/// the indirect storage.
pub struct BktrRomFs {
    romfs: RomFs,
    missing_base: bool,
}

impl BktrRomFs {
    /// Wires the patch section over the base section and opens the
    /// patched RomFS.
    pub fn open(base_section: Option<NcaFsSection>, patch_section: NcaFsSection) -> Result<Self> {
        let missing_base = base_section.is_none();
        let patched = match base_section {
            Some(base_section) => {
                let base = NcaStorage::open(base_section, None)?;
                NcaStorage::open(patch_section, Some(&base))?
            }
            // A patch on a program whose base has no RomFS section at
            // all: the original substorage reads as zeroes.
            None => NcaStorage::open_with_missing_base(patch_section)?,
        };

        Ok(Self {
            romfs: RomFs::open(patched)?,
            missing_base,
        })
    }

    pub fn missing_base(&self) -> bool {
        self.missing_base
    }

    pub fn romfs(&mut self) -> &mut RomFs {
        &mut self.romfs
    }

    pub fn file_by_path(&mut self, path: &str) -> Result<RomFsFileEntry> {
        self.romfs.file_by_path(path)
    }

    pub fn list_dir(&mut self, path: &str) -> Result<Vec<DirListEntry>> {
        self.romfs.list_dir(path)
    }

    pub fn read_file(&mut self, entry: &RomFsFileEntry, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.romfs.read_file(entry, offset, buf)
    }

    /// Whether the patch touches any part of the file's body extent.
    pub fn is_file_updated(&mut self, entry: &RomFsFileEntry) -> Result<bool> {
        let start =
            self.romfs.base_offset + self.romfs.header.body_offset + entry.data_offset;
        self.romfs
            .patch_storage()?
            .is_block_within_patch_range(start, entry.data_size)
    }
}
