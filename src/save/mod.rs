//! Journaled save-file container (the ES ticket and certificate stores).
//!
//! A save is a stack of nested storages in fixed order: raw file →
//! data remap → duplex (three layers) → meta remap → journal → IVFC →
//! FAT → directory/file tables. The save carries two header copies;
//! whichever passes its self-hash is used, and its layout block is
//! authenticated with AES-CMAC.

pub mod duplex;
pub mod fat;
pub mod ivfc;
pub mod journal;
pub mod remap;

use binrw::BinReaderExt;
use binrw::prelude::*;

use crate::crypto;
use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage};

use duplex::DuplexStorage;
use fat::{AllocationTable, FatStorageDesc, fat_read};
use ivfc::{IvfcLevelDesc, IvfcLevelKind, IvfcSaveHeader, IvfcVerify, Validity};
use journal::JournalStorage;
use remap::{REMAP_ENTRY_SIZE, RemapBacking, RemapHeader, RemapStorage};

pub const SAVE_HEADER_SIZE: usize = 0x4000;
pub const SAVE_FS_LIST_ENTRY_SIZE: usize = 0x60;
pub const SAVE_FS_LIST_MAX_NAME_LENGTH: usize = 0x40;

const LAYOUT_OFFSET: usize = 0x100;
const LAYOUT_SIZE: usize = 0x200;
const DUPLEX_HEADER_OFFSET: usize = 0x300;
const DATA_IVFC_OFFSET: usize = 0x344;
const JOURNAL_HEADER_OFFSET: usize = 0x408;
const MAP_HEADER_OFFSET: usize = 0x428;
const SAVE_FS_HEADER_OFFSET: usize = 0x608;
const FAT_HEADER_OFFSET: usize = 0x620;
const MAIN_REMAP_OFFSET: usize = 0x650;
const META_REMAP_OFFSET: usize = 0x690;
const FAT_IVFC_OFFSET: usize = 0xAD8;
const HASHED_REGION_OFFSET: usize = 0x300;
const HASHED_REGION_SIZE: usize = 0x3D00;

/// The DISF layout block: every region offset the stack needs.
#[binrw]
#[brw(little, magic = b"DISF")]
#[derive(Debug, Clone)]
pub struct FsLayout {
    pub version: u32,
    pub hash: [u8; 0x20],
    pub file_map_entry_offset: u64,
    pub file_map_entry_size: u64,
    pub meta_map_entry_offset: u64,
    pub meta_map_entry_size: u64,
    pub file_map_data_offset: u64,
    pub file_map_data_size: u64,
    pub duplex_l1_offset_a: u64,
    pub duplex_l1_offset_b: u64,
    pub duplex_l1_size: u64,
    pub duplex_data_offset_a: u64,
    pub duplex_data_offset_b: u64,
    pub duplex_data_size: u64,
    pub journal_data_offset: u64,
    pub journal_data_size_a: u64,
    pub journal_data_size_b: u64,
    pub journal_size: u64,
    pub duplex_master_offset_a: u64,
    pub duplex_master_offset_b: u64,
    pub duplex_master_size: u64,
    pub ivfc_master_hash_offset_a: u64,
    pub ivfc_master_hash_offset_b: u64,
    pub ivfc_master_hash_size: u64,
    pub journal_map_table_offset: u64,
    pub journal_map_table_size: u64,
    pub journal_physical_bitmap_offset: u64,
    pub journal_physical_bitmap_size: u64,
    pub journal_virtual_bitmap_offset: u64,
    pub journal_virtual_bitmap_size: u64,
    pub journal_free_bitmap_offset: u64,
    pub journal_free_bitmap_size: u64,
    pub ivfc_l1_offset: u64,
    pub ivfc_l1_size: u64,
    pub ivfc_l2_offset: u64,
    pub ivfc_l2_size: u64,
    pub ivfc_l3_offset: u64,
    pub ivfc_l3_size: u64,
    pub fat_offset: u64,
    pub fat_size: u64,
    pub duplex_index: u64,
    pub fat_ivfc_master_hash_a: u64,
    pub fat_ivfc_master_hash_b: u64,
    pub fat_ivfc_l1_offset: u64,
    pub fat_ivfc_l1_size: u64,
    pub fat_ivfc_l2_offset: u64,
    pub fat_ivfc_l2_size: u64,
    #[br(count = 0x70)]
    #[brw(pad_size_to = 0x70)]
    pub _reserved: Vec<u8>,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct DuplexInfo {
    pub offset: u64,
    pub length: u64,
    pub block_size_power: u32,
}

#[binrw]
#[brw(little, magic = b"DPFS")]
#[derive(Debug, Clone)]
pub struct DuplexHeader {
    pub version: u32,
    #[br(count = 3)]
    pub layers: Vec<DuplexInfo>,
}

#[binrw]
#[brw(little, magic = b"JNGL")]
#[derive(Debug, Clone)]
pub struct JournalHeader {
    pub version: u32,
    pub total_size: u64,
    pub journal_size: u64,
    pub block_size: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct JournalMapHeader {
    pub version: u32,
    pub main_data_block_count: u32,
    pub journal_block_count: u32,
    pub _reserved: u32,
}

#[binrw]
#[brw(little, magic = b"SAVE")]
#[derive(Debug, Clone)]
pub struct SaveFsHeader {
    pub version: u32,
    pub block_count: u64,
    pub block_size: u64,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct FatHeader {
    pub block_size: u64,
    pub allocation_table_offset: u64,
    pub allocation_table_block_count: u32,
    pub _reserved_0: u32,
    pub data_offset: u64,
    pub data_block_count: u32,
    pub _reserved_1: u32,
    pub directory_table_block: u32,
    pub file_table_block: u32,
}

/// Parsed save header (one of the two copies).
pub struct SaveHeader {
    pub cmac: [u8; 0x10],
    pub layout: FsLayout,
    pub duplex_header: DuplexHeader,
    pub data_ivfc: IvfcSaveHeader,
    pub journal_header: JournalHeader,
    pub map_header: JournalMapHeader,
    pub save_fs_header: SaveFsHeader,
    pub fat_header: FatHeader,
    pub main_remap: RemapHeader,
    pub meta_remap: RemapHeader,
    pub fat_ivfc: IvfcSaveHeader,
    /// The full raw 0x4000 header bytes (duplex master bitmaps live in
    /// here).
    pub raw: Vec<u8>,
}

impl SaveHeader {
    fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < SAVE_HEADER_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Save,
                "save header shorter than 0x4000 bytes".to_string(),
            ));
        }

        let read_at = |offset: usize, size: usize| &raw[offset..offset + size];
        let corrupt =
            |what: &str| Error::CorruptHeader(HeaderKind::Save, format!("bad {what} block"));

        let mut cmac = [0u8; 0x10];
        cmac.copy_from_slice(&raw[..0x10]);

        let layout: FsLayout = binrw::io::Cursor::new(read_at(LAYOUT_OFFSET, LAYOUT_SIZE))
            .read_le()
            .map_err(|_| corrupt("DISF"))?;
        let duplex_header: DuplexHeader =
            binrw::io::Cursor::new(read_at(DUPLEX_HEADER_OFFSET, 0x44))
                .read_le()
                .map_err(|_| corrupt("DPFS"))?;
        let data_ivfc: IvfcSaveHeader = binrw::io::Cursor::new(read_at(DATA_IVFC_OFFSET, 0xC0))
            .read_le()
            .map_err(|_| corrupt("IVFC"))?;
        let journal_header: JournalHeader =
            binrw::io::Cursor::new(read_at(JOURNAL_HEADER_OFFSET, 0x20))
                .read_le()
                .map_err(|_| corrupt("JNGL"))?;
        let map_header: JournalMapHeader =
            binrw::io::Cursor::new(read_at(MAP_HEADER_OFFSET, 0x10))
                .read_le()
                .map_err(|_| corrupt("journal map"))?;
        let save_fs_header: SaveFsHeader =
            binrw::io::Cursor::new(read_at(SAVE_FS_HEADER_OFFSET, 0x18))
                .read_le()
                .map_err(|_| corrupt("SAVE"))?;
        let fat_header: FatHeader = binrw::io::Cursor::new(read_at(FAT_HEADER_OFFSET, 0x30))
            .read_le()
            .map_err(|_| corrupt("FAT"))?;
        let main_remap: RemapHeader = binrw::io::Cursor::new(read_at(MAIN_REMAP_OFFSET, 0x40))
            .read_le()
            .map_err(|_| corrupt("RMAP"))?;
        let meta_remap: RemapHeader = binrw::io::Cursor::new(read_at(META_REMAP_OFFSET, 0x40))
            .read_le()
            .map_err(|_| corrupt("RMAP"))?;
        let fat_ivfc: IvfcSaveHeader = binrw::io::Cursor::new(read_at(FAT_IVFC_OFFSET, 0xC0))
            .read_le()
            .map_err(|_| corrupt("FAT IVFC"))?;

        Ok(Self {
            cmac,
            layout,
            duplex_header,
            data_ivfc,
            journal_header,
            map_header,
            save_fs_header,
            fat_header,
            main_remap,
            meta_remap,
            fat_ivfc,
            raw,
        })
    }

    /// Self-hash over the duplex-header-onward region.
    fn hash_is_valid(&self) -> bool {
        let computed =
            crypto::sha256(&self.raw[HASHED_REGION_OFFSET..HASHED_REGION_OFFSET + HASHED_REGION_SIZE]);
        computed == self.layout.hash
    }
}

/// A file located inside the save filesystem.
#[derive(Debug, Clone)]
pub struct SaveStoredFile {
    pub desc: FatStorageDesc,
}

impl SaveStoredFile {
    pub fn len(&self) -> u64 {
        self.desc.length
    }

    pub fn is_empty(&self) -> bool {
        self.desc.length == 0
    }
}

/// One 0x60-byte directory/file table record.
#[derive(Debug, Clone)]
pub struct SaveFsListEntry {
    pub parent: u32,
    pub name: String,
    pub next_sibling: u32,
    pub start_block: u32,
    pub length: u64,
    pub next: u32,
}

/// An opened, decoded save container.
pub struct SaveFile {
    storage: SharedStorage,
    pub header: SaveHeader,
    /// CMAC verdict over the layout block; `None` without a MAC key.
    pub cmac_valid: Option<bool>,
    data_remap: RemapStorage,
    meta_remap: RemapStorage,
    journal: JournalStorage,
    data_ivfc: IvfcVerify,
    fat_ivfc: Option<IvfcVerify>,
    fat_table: AllocationTable,
    fs_block_size: u64,
    directory_table: FatStorageDesc,
    file_table: FatStorageDesc,
    verify: bool,
}

impl std::fmt::Debug for SaveFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveFile").finish_non_exhaustive()
    }
}

impl SaveFile {
    /// Opens a save container.
    ///
    /// Header copy A is tried first; if its self-hash fails, copy B at
    /// 0x4000 is used instead. With `verify` set, the full IVFC
    /// hierarchy is validated up front and any invalid block fails the
    /// open with [`Error::SaveCorrupt`].
    pub fn open(
        mut storage: SharedStorage,
        mac_key: Option<[u8; 0x10]>,
        verify: bool,
    ) -> Result<Self> {
        // Header A, then B.
        let mut raw = vec![0u8; SAVE_HEADER_SIZE];
        storage.read_at(0, &mut raw)?;
        let header = match SaveHeader::parse(raw) {
            Ok(header) if header.hash_is_valid() => header,
            _ => {
                tracing::debug!("save header A failed its self-hash, trying header B");
                let mut raw = vec![0u8; SAVE_HEADER_SIZE];
                storage.read_at(SAVE_HEADER_SIZE as u64, &mut raw)?;
                let header = SaveHeader::parse(raw)?;
                if !header.hash_is_valid() {
                    return Err(Error::CorruptHeader(
                        HeaderKind::Save,
                        "both save header copies failed their self-hash".to_string(),
                    ));
                }
                header
            }
        };

        let cmac_valid = mac_key.map(|key| {
            let computed =
                crypto::aes128_cmac(&key, &header.raw[LAYOUT_OFFSET..LAYOUT_OFFSET + LAYOUT_SIZE]);
            computed == header.cmac
        });
        if cmac_valid == Some(false) {
            tracing::warn!("save header CMAC does not validate");
        }

        let layout = header.layout.clone();

        // Data remap over the raw file.
        let mut entry_table =
            vec![0u8; header.main_remap.map_entry_count as usize * REMAP_ENTRY_SIZE];
        storage.read_at(layout.file_map_entry_offset, &mut entry_table)?;
        let mut data_remap = RemapStorage::new(
            &header.main_remap,
            &entry_table,
            RemapBacking::File(storage.clone()),
            layout.file_map_data_offset,
        )?;

        // Three duplex layers: master bitmap (header) -> L1 -> data.
        fn master_range(raw: &[u8], offset: u64, size: u64) -> Result<&[u8]> {
            let start = offset as usize;
            let end = start + size as usize;
            if end > raw.len() {
                return Err(Error::CorruptHeader(
                    HeaderKind::Save,
                    "duplex master bitmap outside header".to_string(),
                ));
            }
            Ok(&raw[start..end])
        }
        let master_offset = if layout.duplex_index == 1 {
            layout.duplex_master_offset_b
        } else {
            layout.duplex_master_offset_a
        };
        let master_bitmap =
            master_range(&header.raw, master_offset, layout.duplex_master_size)?;

        let mut l1_a = vec![0u8; layout.duplex_l1_size as usize];
        data_remap.read(layout.duplex_l1_offset_a, &mut l1_a)?;
        let mut l1_b = vec![0u8; layout.duplex_l1_size as usize];
        data_remap.read(layout.duplex_l1_offset_b, &mut l1_b)?;

        let mut layer0 = DuplexStorage::new(
            l1_a,
            l1_b,
            master_bitmap,
            layout.duplex_master_size,
            header.duplex_header.layers[1].block_size_power,
            layout.duplex_l1_size,
        )?;
        let mut l1_bitmap = vec![0u8; layout.duplex_l1_size as usize];
        layer0.read(0, &mut l1_bitmap)?;

        let mut data_a = vec![0u8; layout.duplex_data_size as usize];
        data_remap.read(layout.duplex_data_offset_a, &mut data_a)?;
        let mut data_b = vec![0u8; layout.duplex_data_size as usize];
        data_remap.read(layout.duplex_data_offset_b, &mut data_b)?;

        let duplex_data = DuplexStorage::new(
            data_a,
            data_b,
            &l1_bitmap,
            layout.duplex_l1_size,
            header.duplex_header.layers[2].block_size_power,
            layout.duplex_data_size,
        )?;

        // Meta remap over the duplex data layer.
        let mut entry_table =
            vec![0u8; header.meta_remap.map_entry_count as usize * REMAP_ENTRY_SIZE];
        storage.read_at(layout.meta_map_entry_offset, &mut entry_table)?;
        let mut meta_remap = RemapStorage::new(
            &header.meta_remap,
            &entry_table,
            RemapBacking::Duplex(duplex_data),
            0,
        )?;

        // Journal map (meta space) and storage (data space).
        let mut map_storage = vec![0u8; layout.journal_map_table_size as usize];
        meta_remap.read(layout.journal_map_table_offset, &mut map_storage)?;
        let journal = JournalStorage::new(
            &map_storage,
            header.map_header.main_data_block_count,
            header.journal_header.block_size,
            layout.journal_data_offset,
            header.journal_header.total_size - header.journal_header.journal_size,
        )?;

        // The main data IVFC always runs five levels on this layout
        // generation.
        let mut data_ivfc_header = header.data_ivfc.clone();
        data_ivfc_header.num_levels = 5;
        let data_ivfc =
            IvfcVerify::build(&data_ivfc_header, layout.ivfc_master_hash_offset_a, true)?;

        // FAT storage bytes: pre-5.0 saves keep the FAT as a plain
        // meta-remapped region; 5.0+ wraps it in its own IVFC.
        let (fat_bytes, fat_ivfc) = if layout.version < 0x50000 {
            let mut fat_bytes = vec![0u8; layout.fat_size as usize];
            meta_remap.read(layout.fat_offset, &mut fat_bytes)?;
            (fat_bytes, None)
        } else {
            let fat_ivfc =
                IvfcVerify::build(&header.fat_ivfc, layout.fat_ivfc_master_hash_a, false)?;
            let data_level = fat_ivfc.data_level().clone();
            let mut fat_bytes = vec![0u8; data_level.data_size as usize];
            meta_remap.read(data_level.data_offset, &mut fat_bytes)?;
            (fat_bytes, Some(fat_ivfc))
        };

        let fat_table =
            AllocationTable::new(fat_bytes, header.fat_header.allocation_table_block_count);

        let fs_block_size = header.save_fs_header.block_size;
        let open_table = |table: &AllocationTable, block: u32| -> Result<FatStorageDesc> {
            let length = table.list_length(block)? as u64 * fs_block_size;
            Ok(FatStorageDesc {
                initial_block: block,
                block_size: fs_block_size,
                length,
            })
        };
        let directory_table = open_table(&fat_table, header.fat_header.directory_table_block)?;
        let file_table = open_table(&fat_table, header.fat_header.file_table_block)?;

        let mut save = Self {
            storage,
            header,
            cmac_valid,
            data_remap,
            meta_remap,
            journal,
            data_ivfc,
            fat_ivfc,
            fat_table,
            fs_block_size,
            directory_table,
            file_table,
            verify,
        };

        if verify {
            save.verify_all()?;
        }
        Ok(save)
    }

    /// Validates every IVFC level; any invalid block is fatal.
    pub fn verify_all(&mut self) -> Result<()> {
        let Self {
            storage,
            data_remap,
            meta_remap,
            journal,
            data_ivfc,
            fat_ivfc,
            ..
        } = self;

        let mut reader = |level: &IvfcLevelDesc, offset: u64, buf: &mut [u8]| -> Result<()> {
            match level.kind {
                IvfcLevelKind::MasterBytes => storage.read_at(level.data_offset + offset, buf),
                IvfcLevelKind::MetaRemap => meta_remap.read(level.data_offset + offset, buf),
                IvfcLevelKind::Journal => {
                    journal.read(data_remap, level.data_offset + offset, buf)
                }
            }
        };

        if data_ivfc.validate(&mut reader)? == Validity::Invalid {
            return Err(Error::SaveCorrupt);
        }
        if let Some(fat_ivfc) = fat_ivfc
            && fat_ivfc.validate(&mut reader)? == Validity::Invalid
        {
            return Err(Error::SaveCorrupt);
        }
        Ok(())
    }

    /// Reads from a FAT-backed stream inside the save filesystem.
    pub fn read_fat_storage(
        &mut self,
        desc: &FatStorageDesc,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let verify = self.verify;
        let Self {
            storage,
            data_remap,
            meta_remap,
            journal,
            data_ivfc,
            fat_table,
            ..
        } = self;

        let mut level_reader = |level: &IvfcLevelDesc, offset: u64, buf: &mut [u8]| -> Result<()> {
            match level.kind {
                IvfcLevelKind::MasterBytes => storage.read_at(level.data_offset + offset, buf),
                IvfcLevelKind::MetaRemap => meta_remap.read(level.data_offset + offset, buf),
                IvfcLevelKind::Journal => {
                    journal.read(data_remap, level.data_offset + offset, buf)
                }
            }
        };
        let mut read_data = |physical: u64, out: &mut [u8]| -> Result<()> {
            data_ivfc.read_data(physical, out, verify, &mut level_reader)
        };

        fat_read(fat_table, desc, offset, buf, &mut read_data)
    }

    fn list_entry(&mut self, table: FatStorageDesc, index: u32) -> Result<SaveFsListEntry> {
        let mut raw = [0u8; SAVE_FS_LIST_ENTRY_SIZE];
        self.read_fat_storage(
            &table,
            index as u64 * SAVE_FS_LIST_ENTRY_SIZE as u64,
            &mut raw,
        )?;

        let name_end = raw[4..4 + SAVE_FS_LIST_MAX_NAME_LENGTH]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(SAVE_FS_LIST_MAX_NAME_LENGTH);
        let name = std::str::from_utf8(&raw[4..4 + name_end])?.to_string();

        Ok(SaveFsListEntry {
            parent: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            name,
            next_sibling: u32::from_le_bytes(raw[0x44..0x48].try_into().unwrap()),
            start_block: u32::from_le_bytes(raw[0x48..0x4C].try_into().unwrap()),
            length: u64::from_le_bytes(raw[0x4C..0x54].try_into().unwrap()),
            next: u32::from_le_bytes(raw[0x5C..0x60].try_into().unwrap()),
        })
    }

    fn list_capacity(&mut self, table: FatStorageDesc) -> Result<u32> {
        let mut raw = [0u8; 4];
        self.read_fat_storage(&table, 4, &mut raw)?;
        Ok(u32::from_le_bytes(raw))
    }

    /// Finds a `(parent, name)` key in a table's used-entry list.
    fn list_index_from_key(
        &mut self,
        table: FatStorageDesc,
        parent: u32,
        name: &str,
    ) -> Result<u32> {
        let capacity = self.list_capacity(table.clone())?;

        let head = self.list_entry(table.clone(), 1)?;
        let mut index = head.next;
        while index != 0 {
            if index > capacity {
                return Err(Error::CorruptHeader(
                    HeaderKind::Save,
                    format!("save entry index {index} out of range"),
                ));
            }
            let entry = self.list_entry(table.clone(), index)?;
            if entry.parent == parent && entry.name == name {
                return Ok(index);
            }
            index = entry.next;
        }
        Err(Error::NotFound(format!("save FS entry \"{name}\"")))
    }

    /// Resolves a file entry by `/`-separated path.
    pub fn file_entry_by_path(&mut self, path: &str) -> Result<SaveFsListEntry> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some((leaf, dirs)) = components.split_last() else {
            return Err(Error::InvalidArgument(format!(
                "invalid save file path \"{path}\""
            )));
        };
        if leaf.len() >= SAVE_FS_LIST_MAX_NAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "save path component \"{leaf}\" too long"
            )));
        }

        let mut parent = 0u32;
        for dir in dirs {
            parent = self.list_index_from_key(self.directory_table.clone(), parent, dir)?;
        }

        let index = self.list_index_from_key(self.file_table.clone(), parent, leaf)?;
        let entry = self.list_entry(self.file_table.clone(), index)?;
        Ok(entry)
    }

    /// Opens a file for FAT-backed reads. Returns the handle and the
    /// file's exact byte length.
    pub fn open_file(&mut self, path: &str) -> Result<(SaveStoredFile, u64)> {
        let entry = self.file_entry_by_path(path)?;
        let chain_length = self.fat_table.list_length(entry.start_block)? as u64;
        let desc = FatStorageDesc {
            initial_block: entry.start_block,
            block_size: self.fs_block_size,
            // The chain bounds the storage; the entry carries the exact
            // file length.
            length: chain_length * self.fs_block_size,
        };
        Ok((SaveStoredFile { desc }, entry.length))
    }

    /// Reads stored-file content.
    pub fn read_file(&mut self, file: &SaveStoredFile, offset: u64, buf: &mut [u8]) -> Result<()> {
        let desc = file.desc.clone();
        self.read_fat_storage(&desc, offset, buf)
    }
}
