//! NCA (Nintendo Content Archive) file format
//!
//! This module provides functionality for reading and processing NCA files,
//! the container format used to store game data, including encrypted
//! content.
//!
//! # Structure
//!
//! An NCA file consists of:
//! - An encrypted header (first 0xC00 bytes)
//!   - Main NCA header (0x400 bytes)
//!   - Section headers (0x200 bytes per section, up to 4 sections)
//! - Content sections containing file data
//!
//! # Encryption
//!
//! NCAs use several encryption mechanisms:
//! - AES-XTS with Nintendo's custom tweak for the header
//! - AES-CTR (or AES-XTS for NCA0) for content sections
//! - Rights management via titlekeys for (most) content
//!
//! The header XTS run differs per NCA version: NCA3 encrypts all six
//! 0x200-byte sectors as one run starting at sector 0; NCA2 encrypts each
//! FS header as its own run starting at sector 0; NCA0 numbers sectors by
//! in-file offset.

pub mod bucket;
pub mod section;
pub mod storage;
mod types;

use binrw::prelude::*;
use tracing::instrument;

use crate::crypto::keyset::KaekIndex;
use crate::crypto::{self, KeySet};
use crate::error::{Error, HeaderKind, Result};
use crate::io::{SharedStorage, VirtualStorage};

pub use types::*;

pub const NCA_FULL_HEADER_SIZE: usize = 0xC00;
pub const NCA_HEADER_SIZE: usize = 0x400;
pub const NCA_FS_HEADER_SIZE: usize = 0x200;
pub const NCA_SECTION_COUNT: usize = 4;
pub const BLOCK_SIZE: usize = 0x200;

/// Calculates the offset in bytes for a block offset
pub fn get_block_offset(offset: u64) -> u64 {
    BLOCK_SIZE as u64 * offset
}

/// Represents the version of an NCA file
///
/// Is essentially a char, but is wrapped in a struct for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
#[binrw]
pub struct NcaVersion(pub u8);

impl NcaVersion {
    pub fn from_char(c: char) -> Self {
        Self(c as u8)
    }

    pub fn as_char(&self) -> char {
        self.0 as char
    }

    pub fn is_nca0(&self) -> bool {
        self.0 == b'0'
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct FsEntry {
    /// StartOffset (in blocks of 0x200 bytes) of the section
    pub start_offset: u32,
    /// EndOffset (in blocks of 0x200 bytes) of the section
    pub end_offset: u32,
    /// Unknown
    pub _reserved: u64,
}

impl FsEntry {
    pub fn is_valid(&self) -> bool {
        self.end_offset > self.start_offset
    }
}

/// NCA Header
///
/// The first 0x400 bytes of an NCA file once the header XTS run has been
/// undone.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaHeader {
    #[brw(pad_size_to = 0x100)]
    pub header_sig: RsaSignature,
    #[brw(pad_size_to = 0x100)]
    pub header_key_sig: RsaSignature,
    #[brw(magic = b"NCA")]
    /// NCA version, extracted from the last byte of the magic number.
    pub nca_version: NcaVersion,
    pub distribution: DistributionType,
    pub content_type: ContentType,
    pub key_generation_old: KeyGenerationOld,
    pub key_area_appkey_index: KeyAreaEncryptionKeyIndex,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub signature_key_generation: u8,
    pub _reserved_e: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    #[br(count = 4)]
    #[brw(pad_size_to = 0x10 * 4)]
    pub fs_entries: Vec<FsEntry>,
    /// SHA-256 hashes over the four FS-section headers.
    #[br(count = 4)]
    #[brw(pad_size_to = 0x20 * 4)]
    pub fs_header_hashes: Vec<[u8; 0x20]>,
    /// Encrypted key area (four key slots).
    pub encrypted_keys: [u8; 0x40],
}

impl NcaHeader {
    /// Parses an already-decrypted 0x400-byte header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header: NcaHeader = binrw::io::Cursor::new(bytes).read_le().map_err(|e| {
            Error::CorruptHeader(HeaderKind::Nca, format!("bad NCA header: {e}"))
        })?;
        Ok(header)
    }

    /// Serializes the header to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        self.write_le(&mut cursor)
            .expect("Failed to serialize header");
        let mut bytes = cursor.into_inner();
        bytes.resize(NCA_HEADER_SIZE, 0);
        bytes
    }

    /// Effective key generation: the larger of the two header fields,
    /// mapped to a key file index (0 and 1 are both master key 0).
    pub fn effective_key_generation(&self) -> u8 {
        let key_gen_old = self.key_generation_old as u8;
        let key_gen = self.key_generation;

        let base_key_gen = key_gen_old.max(key_gen);
        if base_key_gen > 0 {
            base_key_gen - 1
        } else {
            base_key_gen
        }
    }

    pub fn has_rights_id(&self) -> bool {
        !self.rights_id.iter().all(|&b| b == 0)
    }
}

/// A parsed NCA bound to its backing storage.
pub struct Nca {
    storage: SharedStorage,
    pub header: NcaHeader,
    /// FS headers by section index; `None` for absent sections.
    pub fs_headers: Vec<Option<FsHeader>>,
    dec_key_area: [[u8; 0x10]; 4],
    dec_title_key: Option<[u8; 0x10]>,
    key_status: bool,
}

impl std::fmt::Debug for Nca {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Nca")
            .field("header", &self.header)
            .field("fs_headers", &self.fs_headers)
            .field("dec_title_key", &self.dec_title_key)
            .field("key_status", &self.key_status)
            .finish_non_exhaustive()
    }
}

impl Nca {
    /// Opens an NCA from a storage holding its full contents.
    ///
    /// `title_key` must carry the decrypted titlekey when the NCA uses
    /// rights-id crypto; key-area NCAs ignore it.
    #[instrument(level = "trace", skip(storage, keyset, title_key), fields(content_type, nca_version))]
    pub fn from_storage(
        mut storage: SharedStorage,
        keyset: &KeySet,
        title_key: Option<[u8; 0x10]>,
    ) -> Result<Self> {
        let mut raw = vec![0u8; NCA_FULL_HEADER_SIZE];
        storage.read_at(0, &mut raw)?;

        let header_key = keyset.header_key()?;
        let mut key0 = [0u8; 0x10];
        let mut key1 = [0u8; 0x10];
        key0.copy_from_slice(&header_key[..0x10]);
        key1.copy_from_slice(&header_key[0x10..]);

        // Main header first: always a single run over sectors 0 and 1.
        let mut main = raw[..NCA_HEADER_SIZE].to_vec();
        crypto::xts128_nintendo_decrypt(&key0, &key1, &mut main, BLOCK_SIZE, 0)?;
        let header = NcaHeader::from_bytes(&main)?;

        tracing::Span::current()
            .record("content_type", format!("{:?}", header.content_type))
            .record("nca_version", format!("{}", header.nca_version.as_char()));

        tracing::trace!(
            nca_version = %header.nca_version.as_char(),
            content_type = ?header.content_type,
            key_generation_old = ?header.key_generation_old,
            key_generation = header.key_generation,
            key_area_appkey_index = ?header.key_area_appkey_index,
            "NCA header decoded"
        );

        // FS headers, decrypted per the version's sector-numbering rules.
        let mut fs_region = raw[NCA_HEADER_SIZE..].to_vec();
        match header.nca_version.as_char() {
            '3' => {
                crypto::xts128_nintendo_decrypt(&key0, &key1, &mut fs_region, BLOCK_SIZE, 2)?;
            }
            '2' => {
                for chunk in fs_region.chunks_exact_mut(NCA_FS_HEADER_SIZE) {
                    crypto::xts128_nintendo_decrypt(&key0, &key1, chunk, BLOCK_SIZE, 0)?;
                }
            }
            '0' => {
                for (i, chunk) in fs_region.chunks_exact_mut(NCA_FS_HEADER_SIZE).enumerate() {
                    let in_file_offset = (NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE) as u64;
                    let sector = (in_file_offset - NCA_HEADER_SIZE as u64) >> 9;
                    crypto::xts128_nintendo_decrypt(
                        &key0,
                        &key1,
                        chunk,
                        BLOCK_SIZE,
                        sector as u128,
                    )?;
                }
            }
            other => {
                return Err(Error::CorruptHeader(
                    HeaderKind::Nca,
                    format!("unsupported NCA version '{other}'"),
                ));
            }
        }

        let mut fs_headers = Vec::with_capacity(NCA_SECTION_COUNT);
        for (i, entry) in header.fs_entries.iter().enumerate() {
            if !entry.is_valid() {
                fs_headers.push(None);
                continue;
            }

            let fs_bytes = &fs_region[i * NCA_FS_HEADER_SIZE..(i + 1) * NCA_FS_HEADER_SIZE];

            // Each section header is covered by a hash in the main header.
            if crypto::sha256(fs_bytes) != header.fs_header_hashes[i] {
                return Err(Error::HashMismatch {
                    layer: "nca-fs-header",
                    offset: (NCA_HEADER_SIZE + i * NCA_FS_HEADER_SIZE) as u64,
                });
            }

            let fs_header: FsHeader = binrw::io::Cursor::new(fs_bytes).read_le()?;
            tracing::trace!(
                index = i,
                fs_type = ?fs_header.fs_type,
                encryption_type = ?fs_header.encryption_type,
                hash_type = ?fs_header.hash_type,
                "FS header details"
            );
            fs_headers.push(Some(fs_header));
        }

        // Resolve section keys.
        let mut dec_key_area = [[0u8; 0x10]; 4];
        let mut dec_title_key = None;
        let mut key_status = true;
        let key_gen = header.effective_key_generation();

        if header.has_rights_id() {
            let rights_id_hex = hex::encode(header.rights_id).to_uppercase();
            tracing::trace!(rights_id = %rights_id_hex, "NCA requires title key");
            match title_key {
                Some(key) => dec_title_key = Some(key),
                None => {
                    tracing::warn!(
                        rights_id = %rights_id_hex,
                        "NCA requires a title key but none was supplied"
                    );
                    key_status = false;
                }
            }
        } else {
            let index = KaekIndex::from(header.key_area_appkey_index);
            match keyset.decrypt_nca_key_area(index, key_gen, &header.encrypted_keys) {
                Ok(keys) => dec_key_area = keys,
                Err(e) => {
                    tracing::warn!(error = %e, key_gen, "key area could not be decrypted");
                    key_status = false;
                }
            }
        }

        Ok(Self {
            storage,
            header,
            fs_headers,
            dec_key_area,
            dec_title_key,
            key_status,
        })
    }

    /// Get the number of valid filesystems in this NCA
    pub fn filesystem_count(&self) -> usize {
        self.fs_headers.iter().filter(|h| h.is_some()).count()
    }

    /// Start of a section within the NCA, in bytes.
    pub fn section_offset(&self, idx: usize) -> Option<u64> {
        self.header
            .fs_entries
            .get(idx)
            .filter(|e| e.is_valid())
            .map(|e| get_block_offset(e.start_offset as u64))
    }

    /// Size of a section within the NCA, in bytes.
    pub fn section_size(&self, idx: usize) -> Option<u64> {
        self.header
            .fs_entries
            .get(idx)
            .filter(|e| e.is_valid())
            .map(|e| get_block_offset((e.end_offset - e.start_offset) as u64))
    }

    pub fn has_rights_id(&self) -> bool {
        self.header.has_rights_id()
    }

    /// Check if the NCA has valid keys for decryption
    pub fn has_valid_keys(&self) -> bool {
        self.key_status
    }

    /// Verifies the fixed-key RSA-2048-PSS signature over the header body.
    ///
    /// The fixed public modulus is looked up in the keyset
    /// (`nca_hdr_fixed_key_modulus`).
    pub fn verify_header_signature(&self, keyset: &KeySet) -> Result<bool> {
        let modulus: [u8; 0x100] = keyset
            .get_key("nca_hdr_fixed_key_modulus")
            .ok_or_else(|| Error::KeyMissing("nca_hdr_fixed_key_modulus".to_string()))?;

        let body = &self.header.to_bytes()[0x200..];
        let mut signature = Vec::with_capacity(0x100);
        for chunk in self.header.header_sig.signature.iter() {
            signature.extend_from_slice(chunk);
        }
        Ok(crypto::rsa2048_pss_verify_sha256(
            &modulus,
            &[0x01, 0x00, 0x01],
            body,
            &signature,
        ))
    }

    /// The AES key used for this NCA's section content.
    ///
    /// Slot 2 of the key area is the content key; rights-id NCAs use the
    /// decrypted titlekey instead.
    pub fn section_content_key(&self) -> Result<[u8; 0x10]> {
        if self.header.has_rights_id() {
            return self.dec_title_key.ok_or_else(|| {
                Error::KeyMissing(format!(
                    "title key for rights ID {}",
                    hex::encode(self.header.rights_id).to_uppercase()
                ))
            });
        }
        if !self.key_status {
            let index = KaekIndex::from(self.header.key_area_appkey_index);
            return Err(Error::KeyMissing(format!(
                "{}_{:02x}",
                index.key_prefix(),
                self.header.effective_key_generation()
            )));
        }
        Ok(self.dec_key_area[2])
    }

    /// The XTS key pair used by NCA0 sections (key area slots 2 and 3).
    pub fn section_xts_keys(&self) -> Result<([u8; 0x10], [u8; 0x10])> {
        if !self.key_status {
            return Err(Error::KeyMissing("NCA key area".to_string()));
        }
        Ok((self.dec_key_area[2], self.dec_key_area[3]))
    }

    pub(crate) fn storage(&self) -> SharedStorage {
        self.storage.clone()
    }

    /// Opens one FS section for layered reads.
    pub fn fs_section(&self, idx: usize) -> Result<section::NcaFsSection> {
        section::NcaFsSection::open(self, idx)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::io::{MemoryStorage, ReaderStorage};
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    pub(crate) const TEST_KEYS: &str = r#"
    header_key = 000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f
    key_area_key_application_00 = 2b7e151628aed2a6abf7158809cf4f3c
    titlekek_00 = 00112233445566778899aabbccddeeff
    "#;

    pub(crate) fn test_keyset() -> KeySet {
        KeySet::from_reader(Cursor::new(TEST_KEYS)).unwrap()
    }

    pub(crate) fn header_xts_keys(keyset: &KeySet) -> ([u8; 0x10], [u8; 0x10]) {
        let header_key = keyset.header_key().unwrap();
        let mut key0 = [0u8; 0x10];
        let mut key1 = [0u8; 0x10];
        key0.copy_from_slice(&header_key[..0x10]);
        key1.copy_from_slice(&header_key[0x10..]);
        (key0, key1)
    }

    fn test_header(encrypted_keys: [u8; 0x40]) -> NcaHeader {
        NcaHeader {
            header_sig: RsaSignature::default(),
            header_key_sig: RsaSignature::default(),
            nca_version: NcaVersion::from_char('3'),
            distribution: DistributionType::Download,
            content_type: ContentType::Program,
            key_generation_old: KeyGenerationOld::Gen1_0_0,
            key_area_appkey_index: KeyAreaEncryptionKeyIndex::Application,
            content_size: 0,
            program_id: 0x0100_0000_0000_1000,
            content_index: 0,
            sdk_version: 0,
            key_generation: 0,
            signature_key_generation: 0,
            _reserved_e: [0; 0xE],
            rights_id: [0; 0x10],
            fs_entries: vec![FsEntry::default(); 4],
            fs_header_hashes: vec![[0u8; 0x20]; 4],
            encrypted_keys,
        }
    }

    /// Builds a full 0xC00 encrypted NCA3 header region with one valid FS
    /// section header, plus the decrypted content key.
    pub(crate) fn build_nca3_image(
        keyset: &KeySet,
        fs_header_bytes: &[u8],
        section_payload: &[u8],
    ) -> (Vec<u8>, [u8; 0x10]) {
        let (key0, key1) = header_xts_keys(keyset);

        // Key area: content key in slot 2, encrypted with the application
        // KAEK.
        let kaek = keyset
            .kaek(crate::crypto::keyset::KaekIndex::Application, 0)
            .unwrap();
        let content_key = [0x42u8; 0x10];
        let mut key_area = [0u8; 0x40];
        key_area[0x20..0x30].copy_from_slice(&content_key);
        for block in key_area.chunks_exact_mut(0x10) {
            let mut b = [0u8; 0x10];
            b.copy_from_slice(block);
            crate::crypto::aes128_ecb_encrypt_block(&kaek, &mut b);
            block.copy_from_slice(&b);
        }

        let mut header = test_header(key_area);
        // Section 0: starts right after the header region.
        let start_block = (NCA_FULL_HEADER_SIZE / BLOCK_SIZE) as u32;
        let payload_blocks = section_payload.len().div_ceil(BLOCK_SIZE) as u32;
        header.fs_entries[0] = FsEntry {
            start_offset: start_block,
            end_offset: start_block + payload_blocks,
            _reserved: 0,
        };

        let mut fs_padded = fs_header_bytes.to_vec();
        fs_padded.resize(NCA_FS_HEADER_SIZE, 0);
        header.fs_header_hashes[0] = crate::crypto::sha256(&fs_padded);

        let mut raw = vec![0u8; NCA_FULL_HEADER_SIZE];
        raw[..NCA_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        raw[NCA_HEADER_SIZE..NCA_HEADER_SIZE + NCA_FS_HEADER_SIZE].copy_from_slice(&fs_padded);

        crate::crypto::xts128_nintendo_encrypt(&key0, &key1, &mut raw, BLOCK_SIZE, 0).unwrap();

        let mut image = raw;
        image.extend_from_slice(section_payload);
        let pad = image.len().next_multiple_of(BLOCK_SIZE);
        image.resize(pad, 0);
        (image, content_key)
    }

    fn plain_fs_header() -> Vec<u8> {
        // A minimal RomFS-typed section header with no hash layers.
        let mut bytes = vec![0u8; NCA_FS_HEADER_SIZE];
        bytes[0] = 2; // version
        bytes[2] = 0; // fs_type RomFs
        bytes[3] = 1; // hash_type None
        bytes[4] = 1; // encryption None
        bytes
    }

    pub(crate) fn storage_from(bytes: Vec<u8>) -> SharedStorage {
        Arc::new(Mutex::new(MemoryStorage::new(bytes)))
    }

    #[test]
    fn test_nca_header_size() {
        let header = test_header([0u8; 0x40]);
        let header_bytes = header.to_bytes();
        assert_eq!(header_bytes.len(), NCA_HEADER_SIZE);
        assert_eq!(&header_bytes[0x200..0x204], b"NCA3");
    }

    #[test]
    fn test_header_round_trip_through_storage() {
        let keyset = test_keyset();
        let (image, content_key) = build_nca3_image(&keyset, &plain_fs_header(), b"section data");

        let nca = Nca::from_storage(storage_from(image), &keyset, None).unwrap();
        assert_eq!(nca.filesystem_count(), 1);
        assert_eq!(nca.header.program_id, 0x0100_0000_0000_1000);
        assert_eq!(nca.section_offset(0), Some(NCA_FULL_HEADER_SIZE as u64));
        assert!(nca.has_valid_keys());
        assert_eq!(nca.section_content_key().unwrap(), content_key);
    }

    #[test]
    fn test_fs_header_hash_is_checked() {
        let keyset = test_keyset();
        let (mut image, _) = build_nca3_image(&keyset, &plain_fs_header(), b"payload");

        // Corrupt one encrypted FS header byte.
        image[NCA_HEADER_SIZE + 8] ^= 0xFF;
        let err = Nca::from_storage(storage_from(image), &keyset, None).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { layer: "nca-fs-header", .. }));
    }

    #[test]
    fn test_effective_key_generation() {
        let mut header = test_header([0u8; 0x40]);
        header.key_generation_old = KeyGenerationOld::Gen3_0_0;
        header.key_generation = 0;
        assert_eq!(header.effective_key_generation(), 1);

        header.key_generation = 0x0B;
        assert_eq!(header.effective_key_generation(), 0x0A);

        header.key_generation = 0;
        header.key_generation_old = KeyGenerationOld::Gen1_0_0;
        assert_eq!(header.effective_key_generation(), 0);
    }

    #[test]
    fn test_rights_id_requires_title_key() {
        let keyset = test_keyset();
        let (key0, key1) = header_xts_keys(&keyset);

        let mut header = test_header([0u8; 0x40]);
        header.rights_id[0xF] = 0x01;
        let mut raw = vec![0u8; NCA_FULL_HEADER_SIZE];
        raw[..NCA_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        crate::crypto::xts128_nintendo_encrypt(&key0, &key1, &mut raw, BLOCK_SIZE, 0).unwrap();

        let nca = Nca::from_storage(storage_from(raw.clone()), &keyset, None).unwrap();
        assert!(nca.has_rights_id());
        assert!(!nca.has_valid_keys());
        assert!(nca.section_content_key().is_err());

        let titlekey = [0x77u8; 0x10];
        let nca = Nca::from_storage(storage_from(raw), &keyset, Some(titlekey)).unwrap();
        assert_eq!(nca.section_content_key().unwrap(), titlekey);
    }

    #[test]
    fn test_reader_storage_backing() {
        // The same image served through a ReaderStorage window.
        let keyset = test_keyset();
        let (image, _) = build_nca3_image(&keyset, &plain_fs_header(), b"abc");
        let len = image.len() as u64;
        let storage: SharedStorage = Arc::new(Mutex::new(ReaderStorage::new(
            Cursor::new(image),
            0,
            len,
        )));
        assert!(Nca::from_storage(storage, &keyset, None).is_ok());
    }
}
