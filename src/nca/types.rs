use binrw::prelude::*;

#[binrw]
#[brw(little)]
#[derive(Debug, Default, Clone)]
pub struct RsaSignature {
    pub signature: [[u8; 0x20]; 8],
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The source of the content the NCA is for, either downloaded from
/// the CDN or from a game card (cartridge).
pub enum DistributionType {
    /// The content was downloaded from a CDN, such as the eShop.
    Download = 0x00,
    /// The content is from a game card (cartridge).
    GameCard = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The type of content stored in the NCA.
pub enum ContentType {
    /// Program content (executable code).
    Program = 0x00,
    /// Meta content (information about the title).
    Meta = 0x01,
    /// Control content (icon, screenshots, etc.).
    Control = 0x02,
    /// Manual content (digital manual/documentation).
    Manual = 0x03,
    /// Data content (general game data).
    Data = 0x04,
    /// Public data content.
    PublicData = 0x05,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The pre-3.0.0 key generation field.
pub enum KeyGenerationOld {
    /// 1.0.0 key generation
    Gen1_0_0 = 0x00,
    /// Unknown key generation (presumably planned for Horizon 2.0.0 but never used)
    Unused = 0x01,
    /// 3.0.0 key generation
    Gen3_0_0 = 0x02,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// The encryption key index used for the key area in the NCA header.
pub enum KeyAreaEncryptionKeyIndex {
    /// Application key area encryption key.
    Application = 0x00,
    /// Ocean key area encryption key.
    Ocean = 0x01,
    /// System key area encryption key.
    System = 0x02,
}

impl From<KeyAreaEncryptionKeyIndex> for crate::crypto::keyset::KaekIndex {
    fn from(value: KeyAreaEncryptionKeyIndex) -> Self {
        match value {
            KeyAreaEncryptionKeyIndex::Application => Self::Application,
            KeyAreaEncryptionKeyIndex::Ocean => Self::Ocean,
            KeyAreaEncryptionKeyIndex::System => Self::System,
        }
    }
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Filesystem type
pub enum FsType {
    /// RomFS filesystem
    RomFs = 0x00,
    /// Partition filesystem
    PartitionFs = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Hash type used for filesystem verification
pub enum HashType {
    #[default]
    /// Automatically select hash type
    Auto = 0x00,
    /// No hash verification
    None = 0x01,
    /// Hierarchical SHA256 hash
    HierarchicalSha256Hash = 0x02,
    /// Hierarchical integrity hash
    HierarchicalIntegrityHash = 0x03,
    /// [14.0.0+] Automatically select SHA3 hash
    AutoSha3 = 0x04,
    /// [14.0.0+] Hierarchical SHA3-256 hash
    HierarchicalSha3256Hash = 0x05,
    /// [14.0.0+] Hierarchical integrity SHA3 hash
    HierarchicalIntegritySha3Hash = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Encryption type for NCA content
pub enum EncryptionType {
    /// Automatically select encryption type
    Auto = 0x00,
    /// No encryption
    None = 0x01,
    /// AES-XTS encryption
    AesXts = 0x02,
    /// AES-CTR encryption
    AesCtr = 0x03,
    /// AES-CTR extended encryption
    AesCtrEx = 0x04,
    /// [14.0.0+] AES-CTR encryption with skipped layer hash
    AesCtrSkipLayerHash = 0x05,
    /// [14.0.0+] AES-CTR extended encryption with skipped layer hash
    AesCtrExSkipLayerHash = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// [14.0.0+] Hash type for metadata
pub enum MetaDataHashType {
    /// No metadata hash
    None = 0x00,
    /// Hierarchical integrity hash for metadata
    HierarchicalIntegrity = 0x01,
}

/// How reads against a section are composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsSectionType {
    /// PFS0 over HierarchicalSha256.
    PartitionFs,
    /// RomFS over HierarchicalIntegrity.
    RomFs,
    /// RomFS patch section with Indirect + AesCtrEx layers.
    PatchRomFs,
    /// NCA0 RomFS (AES-XTS, HierarchicalSha256).
    Nca0RomFs,
    Invalid,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchicalIntegrityLevelInfo {
    pub logical_offset: u64,
    pub hash_data_size: u64,
    pub block_size_log2: u32,
    pub _reserved: [u8; 0x4],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoLevelHash {
    pub max_layers: u32,
    #[br(count = (max_layers.saturating_sub(1)).min(6))]
    #[brw(pad_size_to = 0x90)]
    pub levels: Vec<HierarchicalIntegrityLevelInfo>,
    pub signature_salt: [u8; 0x20],
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Eq)]
#[br(import(hash_type: HashType))]
pub enum HashData {
    #[br(pre_assert(hash_type == HashType::HierarchicalSha256Hash))]
    HierarchicalSha256 {
        master_hash: [u8; 0x20],
        hash_block_size: u32,
        layer_count: u32,
        hash_table_offset: u64,
        hash_table_size: u64,
        pfs_offset: u64,
        pfs_size: u64,
        #[br(count = 0xA8)]
        #[brw(pad_size_to = 0xA8)]
        _reserved: Vec<u8>,
    },
    #[br(pre_assert(hash_type == HashType::HierarchicalIntegrityHash))]
    HierarchicalIntegrity {
        #[br(magic = b"IVFC")]
        version: u32,
        master_hash_size: u32,
        #[brw(pad_size_to = 0xB4)]
        info_level_hash: InfoLevelHash,
        master_hash: [u8; 0x20],
        #[br(count = 0x18)]
        #[brw(pad_size_to = 0x18)]
        _reserved: Vec<u8>,
    },
    /// Sections without hash layers (and Auto placeholders).
    Raw {
        #[br(count = 0xF8)]
        #[brw(pad_size_to = 0xF8)]
        data: Vec<u8>,
    },
}

impl HashData {
    /// Extent of the hash-target layer (the payload consumers read),
    /// relative to the section start.
    pub fn hash_target_extents(&self) -> Option<(u64, u64)> {
        match self {
            HashData::HierarchicalSha256 {
                pfs_offset,
                pfs_size,
                ..
            } => Some((*pfs_offset, *pfs_size)),
            HashData::HierarchicalIntegrity {
                info_level_hash, ..
            } => info_level_hash
                .levels
                .last()
                .map(|level| (level.logical_offset, level.hash_data_size)),
            HashData::Raw { .. } => None,
        }
    }
}

/// On-disk reference to a bucket tree inside a section.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketInfo {
    /// Tree offset, relative to the section start.
    pub offset: u64,
    /// Tree size in bytes.
    pub size: u64,
    /// Embedded tree header copy.
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: u32,
    pub _reserved: u32,
}

impl BucketInfo {
    pub fn is_present(&self) -> bool {
        self.size != 0
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchInfo {
    pub indirect: BucketInfo,
    pub aes_ctr_ex: BucketInfo,
}

impl PatchInfo {
    pub fn is_present(&self) -> bool {
        self.indirect.is_present() && self.aes_ctr_ex.is_present()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SparseInfo {
    pub bucket: BucketInfo,
    /// Physical offset of the sparse tree data within the NCA.
    pub physical_offset: u64,
    pub generation: u16,
    pub _reserved: [u8; 6],
}

impl SparseInfo {
    pub fn is_present(&self) -> bool {
        self.bucket.is_present()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompressionInfo {
    pub bucket: BucketInfo,
    pub _reserved: u64,
}

impl CompressionInfo {
    pub fn is_present(&self) -> bool {
        self.bucket.is_present()
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
// The FsHeader for each section is at offset 0x400 + (sectionid * 0x200),
// where sectionid corresponds to the index used with the entry/hash tables.
/// NCA filesystem header
pub struct FsHeader {
    /// The filesystem version for the NCA.
    ///
    /// In most cases, this should always be a 2.
    pub version: u16,
    /// The type of filesystem used in this section.
    pub fs_type: FsType,
    /// The hash type used for filesystem verification.
    pub hash_type: HashType,
    /// The encryption type used for the filesystem.
    pub encryption_type: EncryptionType,
    /// Metadata hash type, only used in 14.0.0+ NCAs.
    pub metadata_hash_type: MetaDataHashType,
    pub _reserved: [u8; 0x2],
    #[br(args(hash_type))]
    #[brw(pad_size_to = 0xF8)]
    pub hash_data: HashData,
    #[brw(pad_size_to = 0x40)]
    pub patch_info: PatchInfo,
    /// Section counter seed; the upper half of every CTR IV.
    pub ctr: u64,
    #[brw(pad_size_to = 0x30)]
    pub sparse_info: SparseInfo,
    #[brw(pad_size_to = 0x28)]
    pub compression_info: CompressionInfo,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub metadata_hashdata_info: Vec<u8>,
    #[br(count = 0x30)]
    #[brw(pad_size_to = 0x30)]
    pub _reserved2: Vec<u8>,
}

impl FsHeader {
    /// Classifies the composition this section requires.
    pub fn section_type(&self, is_nca0: bool) -> FsSectionType {
        match (self.fs_type, is_nca0) {
            (FsType::PartitionFs, true) => FsSectionType::Nca0RomFs,
            (FsType::PartitionFs, false) => FsSectionType::PartitionFs,
            (FsType::RomFs, true) => FsSectionType::Nca0RomFs,
            (FsType::RomFs, false) => {
                if self.patch_info.is_present()
                    || matches!(
                        self.encryption_type,
                        EncryptionType::AesCtrEx | EncryptionType::AesCtrExSkipLayerHash
                    )
                {
                    FsSectionType::PatchRomFs
                } else {
                    FsSectionType::RomFs
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use binrw::BinWriterExt;

    fn write_header(header: &FsHeader) -> Vec<u8> {
        let mut cursor = binrw::io::Cursor::new(Vec::new());
        cursor.write_le(header).unwrap();
        let mut bytes = cursor.into_inner();
        bytes.resize(0x200, 0);
        bytes
    }

    fn integrity_hash_data(levels: u32) -> HashData {
        HashData::HierarchicalIntegrity {
            version: 0x20000,
            master_hash_size: 0x20,
            info_level_hash: InfoLevelHash {
                max_layers: levels + 1,
                levels: (0..levels)
                    .map(|i| HierarchicalIntegrityLevelInfo {
                        logical_offset: i as u64 * 0x4000,
                        hash_data_size: 0x4000,
                        block_size_log2: 14,
                        _reserved: [0u8; 4],
                    })
                    .collect(),
                signature_salt: [0u8; 0x20],
            },
            master_hash: [0xAAu8; 0x20],
            _reserved: vec![0u8; 0x18],
        }
    }

    #[test]
    fn test_fs_header_round_trip() {
        let header = FsHeader {
            version: 2,
            fs_type: FsType::RomFs,
            hash_type: HashType::HierarchicalIntegrityHash,
            encryption_type: EncryptionType::AesCtr,
            metadata_hash_type: MetaDataHashType::None,
            _reserved: [0u8; 2],
            hash_data: integrity_hash_data(6),
            patch_info: PatchInfo::default(),
            ctr: 0x0102030405060708,
            sparse_info: SparseInfo::default(),
            compression_info: CompressionInfo::default(),
            metadata_hashdata_info: vec![0u8; 0x30],
            _reserved2: vec![0u8; 0x30],
        };

        let bytes = write_header(&header);
        assert_eq!(bytes.len(), 0x200);
        // ctr sits at fixed offset 0x140.
        assert_eq!(&bytes[0x140..0x148], &0x0102030405060708u64.to_le_bytes());

        let parsed: FsHeader = binrw::io::Cursor::new(&bytes).read_le().unwrap();
        assert_eq!(parsed.fs_type, FsType::RomFs);
        assert_eq!(parsed.ctr, header.ctr);
        let (offset, size) = parsed.hash_data.hash_target_extents().unwrap();
        assert_eq!(offset, 5 * 0x4000);
        assert_eq!(size, 0x4000);
        assert_eq!(parsed.section_type(false), FsSectionType::RomFs);
    }

    #[test]
    fn test_patch_section_classification() {
        let mut patch_info = PatchInfo::default();
        patch_info.indirect = BucketInfo {
            offset: 0x1000,
            size: 0x4000,
            magic: *b"BKTR",
            version: 1,
            entry_count: 2,
            _reserved: 0,
        };
        patch_info.aes_ctr_ex = BucketInfo {
            offset: 0x5000,
            size: 0x4000,
            magic: *b"BKTR",
            version: 1,
            entry_count: 2,
            _reserved: 0,
        };

        let header = FsHeader {
            version: 2,
            fs_type: FsType::RomFs,
            hash_type: HashType::HierarchicalIntegrityHash,
            encryption_type: EncryptionType::AesCtrEx,
            metadata_hash_type: MetaDataHashType::None,
            _reserved: [0u8; 2],
            hash_data: integrity_hash_data(6),
            patch_info,
            ctr: 0,
            sparse_info: SparseInfo::default(),
            compression_info: CompressionInfo::default(),
            metadata_hashdata_info: vec![0u8; 0x30],
            _reserved2: vec![0u8; 0x30],
        };

        let bytes = write_header(&header);
        let parsed: FsHeader = binrw::io::Cursor::new(&bytes).read_le().unwrap();
        assert!(parsed.patch_info.is_present());
        assert_eq!(parsed.section_type(false), FsSectionType::PatchRomFs);
        // patch_info occupies 0x100..0x140.
        assert_eq!(&bytes[0x100..0x108], &0x1000u64.to_le_bytes());
    }

    #[test]
    fn test_sha256_hash_data_extents() {
        let header = FsHeader {
            version: 2,
            fs_type: FsType::PartitionFs,
            hash_type: HashType::HierarchicalSha256Hash,
            encryption_type: EncryptionType::AesCtr,
            metadata_hash_type: MetaDataHashType::None,
            _reserved: [0u8; 2],
            hash_data: HashData::HierarchicalSha256 {
                master_hash: [0x11u8; 0x20],
                hash_block_size: 0x1000,
                layer_count: 2,
                hash_table_offset: 0,
                hash_table_size: 0x400,
                pfs_offset: 0x1000,
                pfs_size: 0x8000,
                _reserved: vec![0u8; 0xA8],
            },
            patch_info: PatchInfo::default(),
            ctr: 0,
            sparse_info: SparseInfo::default(),
            compression_info: CompressionInfo::default(),
            metadata_hashdata_info: vec![0u8; 0x30],
            _reserved2: vec![0u8; 0x30],
        };

        let bytes = write_header(&header);
        let parsed: FsHeader = binrw::io::Cursor::new(&bytes).read_le().unwrap();
        assert_eq!(parsed.hash_data.hash_target_extents(), Some((0x1000, 0x8000)));
        assert_eq!(parsed.section_type(false), FsSectionType::PartitionFs);
    }
}
