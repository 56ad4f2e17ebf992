//! Gamecard on-card data structures.

use binrw::prelude::*;

use crate::crypto;
use crate::error::{Error, HeaderKind, Result};

pub const GAMECARD_PAGE_SIZE: u64 = 0x200;
pub const GAMECARD_HEADER_SIZE: usize = 0x200;
pub const GAMECARD_CERTIFICATE_OFFSET: u64 = 0x7000;
pub const GAMECARD_CERTIFICATE_SIZE: usize = 0x200;
pub const GAMECARD_HEADER2_OFFSET: u64 = 0x200;
pub const GAMECARD_HEADER2_CERT_OFFSET: u64 = 0x400;
pub const GAMECARD_KEY_AREA_SIZE: usize = 0x1000;

pub const LAFW_MAGIC: &[u8; 4] = b"LAFW";
pub const LAFW_BLOB_SIZE: usize = 0x7800;

/// Gamecard storage capacity, derived from the header's rom_size byte.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RomSize {
    Size1GiB = 0xFA,
    Size2GiB = 0xF8,
    Size4GiB = 0xF0,
    Size8GiB = 0xE0,
    Size16GiB = 0xE1,
    Size32GiB = 0xE2,
}

impl RomSize {
    /// ROM capacity in bytes.
    pub fn capacity(self) -> u64 {
        const GIB: u64 = 1024 * 1024 * 1024;
        match self {
            RomSize::Size1GiB => GIB,
            RomSize::Size2GiB => 2 * GIB,
            RomSize::Size4GiB => 4 * GIB,
            RomSize::Size8GiB => 8 * GIB,
            RomSize::Size16GiB => 16 * GIB,
            RomSize::Size32GiB => 32 * GIB,
        }
    }
}

/// Gamecard header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardFlag {
    AutoBoot = 1 << 0,
    HistoryErase = 1 << 1,
    RepairTool = 1 << 2,
    DifferentRegionCupToTerraDevice = 1 << 3,
    DifferentRegionCupToGlobalDevice = 1 << 4,
    HasCa10Certificate = 1 << 7,
}

/// Handheld-only ("Terra") cartridges salt the root partition header hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompatibilityType {
    Normal,
    Terra,
    Other(u8),
}

impl From<u8> for CompatibilityType {
    fn from(value: u8) -> Self {
        match value {
            0 => CompatibilityType::Normal,
            1 => CompatibilityType::Terra,
            other => CompatibilityType::Other(other),
        }
    }
}

/// A packed system version (`major.minor.micro-relstep`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version(pub u32);

impl Version {
    pub fn major(self) -> u32 {
        (self.0 >> 26) & 0x3F
    }

    pub fn minor(self) -> u32 {
        (self.0 >> 20) & 0x3F
    }

    pub fn micro(self) -> u32 {
        (self.0 >> 16) & 0xF
    }

    pub fn relstep(self) -> u32 {
        self.0 & 0xFFFF
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}-{}",
            self.major(),
            self.minor(),
            self.micro(),
            self.relstep()
        )
    }
}

/// Gamecard header, the first 0x200 bytes of the card image.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct GameCardHeader {
    pub signature: [u8; 0x100],
    #[brw(magic = b"HEAD")]
    pub rom_area_start_page_address: u32,
    /// Always 0xFFFFFFFF.
    pub backup_area_start_page_address: u32,
    /// kek_index (low nibble) and titlekey_dec_index (high nibble).
    pub key_index: u8,
    pub rom_size: RomSize,
    pub header_version: u8,
    pub flags: u8,
    /// Used for challenge-response authentication.
    pub package_id: u64,
    /// Trimmed image end, in pages.
    pub valid_data_end_address: u32,
    pub _reserved: [u8; 0x4],
    /// AES-128-CBC IV for the CardInfo area, byte-reversed on card.
    pub card_info_iv: [u8; 0x10],
    /// Root Hash File System header offset.
    pub partition_fs_header_address: u64,
    /// Root Hash File System header size.
    pub partition_fs_header_size: u64,
    pub partition_fs_header_hash: [u8; 0x20],
    pub initial_data_hash: [u8; 0x20],
    pub sel_sec: u32,
    pub sel_t1_key: u32,
    pub sel_key: u32,
    /// Normal area end, in pages.
    pub lim_area: u32,
    /// Encrypted CardInfo block.
    pub card_info: [u8; 0x70],
}

impl GameCardHeader {
    /// Parses and validates a raw 0x200-byte header.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < GAMECARD_HEADER_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Gamecard,
                "header shorter than 0x200 bytes".to_string(),
            ));
        }
        let header: GameCardHeader = binrw::io::Cursor::new(bytes).read_le().map_err(|e| {
            Error::CorruptHeader(HeaderKind::Gamecard, format!("bad gamecard header: {e}"))
        })?;
        Ok(header)
    }

    pub fn has_flag(&self, flag: CardFlag) -> bool {
        self.flags & (flag as u8) != 0
    }

    /// Decrypts the CardInfo block with the CardInfo key.
    ///
    /// The on-card IV is stored byte-reversed.
    pub fn decrypt_card_info(&self, card_info_key: &[u8; 0x10]) -> Result<CardInfo> {
        let mut iv = [0u8; 0x10];
        for (i, b) in self.card_info_iv.iter().rev().enumerate() {
            iv[i] = *b;
        }

        let mut plain = self.card_info;
        crypto::aes128_cbc_decrypt(card_info_key, &iv, &mut plain)?;

        let info: CardInfo = binrw::io::Cursor::new(plain.as_slice())
            .read_le()
            .map_err(|e| {
                Error::CorruptHeader(HeaderKind::Gamecard, format!("bad CardInfo area: {e}"))
            })?;
        Ok(info)
    }

    /// Size in bytes of the trimmed card image.
    pub fn trimmed_size(&self) -> u64 {
        GAMECARD_HEADER_SIZE as u64 + self.valid_data_end_address as u64 * GAMECARD_PAGE_SIZE
    }
}

/// Decrypted CardInfo area.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct CardInfo {
    /// Minimum LAFW version required to read the card.
    pub fw_version: u64,
    pub acc_ctrl_1: u32,
    pub wait_1_time_read: u32,
    pub wait_2_time_read: u32,
    pub wait_1_time_write: u32,
    pub wait_2_time_write: u32,
    pub fw_mode: u32,
    /// Bundled system update version.
    pub upp_version: u32,
    pub compatibility_type: u8,
    pub _reserved_1: [u8; 0x3],
    pub upp_hash: u64,
    /// Must match the system update title id.
    pub upp_id: u64,
    pub _reserved_2: [u8; 0x38],
}

impl CardInfo {
    pub fn compatibility(&self) -> CompatibilityType {
        CompatibilityType::from(self.compatibility_type)
    }

    pub fn bundled_update_version(&self) -> Version {
        Version(self.upp_version)
    }
}

/// Auxiliary signed header present on cards with the CA-10 certificate
/// flag. No retail cartridge is known to carry one.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct GameCardHeader2 {
    pub signature: [u8; 0x100],
    pub body: [u8; 0x100],
}

/// Embedded certificate verifying [`GameCardHeader2`].
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct GameCardHeader2Certificate {
    pub modulus: [u8; 0x100],
    pub exponent: [u8; 0x4],
    pub _reserved: [u8; 0xFC],
}

/// Plaintext Lotus ASIC firmware blob, located in FS program memory.
#[derive(Debug, Clone)]
pub struct LafwBlob {
    pub fw_type: LafwType,
    /// Bitmask-encoded firmware version.
    pub fw_version_mask: u64,
    pub device_type: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LafwType {
    ReadFw,
    ReadDevFw,
    WriterFw,
    RmaFw,
}

impl LafwType {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            0xFF => Some(LafwType::ReadFw),
            0xFFFF => Some(LafwType::ReadDevFw),
            0xFFFFFF => Some(LafwType::WriterFw),
            0xFFFFFFFF => Some(LafwType::RmaFw),
            _ => None,
        }
    }
}

impl LafwBlob {
    /// The LAFW version is the number of set bits in the version mask.
    pub fn version(&self) -> u64 {
        self.fw_version_mask.count_ones() as u64
    }

    /// Scans an FS `.data` segment image for a LAFW blob of the wanted
    /// type.
    pub fn find_in_memory(image: &[u8], dev_unit: bool) -> Result<Self> {
        let wanted = if dev_unit {
            LafwType::ReadDevFw
        } else {
            LafwType::ReadFw
        };

        let mut offset = 0usize;
        while offset + LAFW_BLOB_SIZE <= image.len() {
            if &image[offset + 0x100..offset + 0x104] == LAFW_MAGIC {
                let fw_type_raw = u32::from_le_bytes(
                    image[offset + 0x104..offset + 0x108].try_into().unwrap(),
                );
                if LafwType::from_raw(fw_type_raw) == Some(wanted) {
                    let packed = u64::from_le_bytes(
                        image[offset + 0x110..offset + 0x118].try_into().unwrap(),
                    );
                    return Ok(LafwBlob {
                        fw_type: wanted,
                        fw_version_mask: packed & 0x3FFF_FFFF_FFFF_FFFF,
                        device_type: (packed >> 62) as u8,
                    });
                }
            }
            offset += 1;
        }

        Err(Error::NotFound(format!(
            "LAFW {:?} blob in FS program memory",
            wanted
        )))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a syntactically valid raw gamecard header for tests.
    pub(crate) fn build_test_header(rom_size: RomSize, flags: u8) -> Vec<u8> {
        let mut raw = vec![0u8; GAMECARD_HEADER_SIZE];
        raw[0x100..0x104].copy_from_slice(b"HEAD");
        raw[0x108..0x10C].copy_from_slice(&0xFFFF_FFFFu32.to_le_bytes());
        raw[0x10D] = rom_size as u8;
        raw[0x10F] = flags;
        // package_id
        raw[0x110..0x118].copy_from_slice(&0x1122334455667788u64.to_le_bytes());
        // valid_data_end_address: 0x100 pages
        raw[0x118..0x11C].copy_from_slice(&0x100u32.to_le_bytes());
        // card_info_iv
        for i in 0..0x10 {
            raw[0x120 + i] = i as u8;
        }
        // partition_fs_header_address / size
        raw[0x130..0x138].copy_from_slice(&0xF000u64.to_le_bytes());
        raw[0x138..0x140].copy_from_slice(&0x200u64.to_le_bytes());
        raw
    }

    #[test]
    fn test_header_parse() {
        let raw = build_test_header(RomSize::Size4GiB, 0);
        let header = GameCardHeader::from_bytes(&raw).unwrap();

        assert_eq!(header.rom_size, RomSize::Size4GiB);
        assert_eq!(header.rom_size.capacity(), 4 * 1024 * 1024 * 1024);
        assert_eq!(header.package_id, 0x1122334455667788);
        assert_eq!(header.partition_fs_header_address, 0xF000);
        assert_eq!(header.trimmed_size(), 0x200 + 0x100 * 0x200);
        assert!(!header.has_flag(CardFlag::HasCa10Certificate));
    }

    #[test]
    fn test_header_bad_magic() {
        let mut raw = build_test_header(RomSize::Size1GiB, 0);
        raw[0x100] = b'X';
        assert!(GameCardHeader::from_bytes(&raw).is_err());
    }

    #[test]
    fn test_card_info_round_trip() {
        use aes::cipher::generic_array::GenericArray;
        use cipher::{BlockEncryptMut, KeyIvInit};

        let key = [0x33u8; 0x10];
        let mut raw = build_test_header(RomSize::Size2GiB, 0);

        // Assemble a plaintext CardInfo and encrypt it with the reversed IV
        // the way mastering does.
        let mut info = [0u8; 0x70];
        info[..8].copy_from_slice(&3u64.to_le_bytes()); // fw_version
        info[0x24] = 1; // compatibility_type: Terra

        let mut iv = [0u8; 0x10];
        for (i, b) in raw[0x120..0x130].iter().rev().enumerate() {
            iv[i] = *b;
        }
        let mut enc = cbc::Encryptor::<aes::Aes128>::new_from_slices(&key, &iv).unwrap();
        let mut encrypted = info;
        for block in encrypted.chunks_exact_mut(0x10) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        raw[0x190..0x200].copy_from_slice(&encrypted);

        let header = GameCardHeader::from_bytes(&raw).unwrap();
        let decrypted = header.decrypt_card_info(&key).unwrap();
        assert_eq!(decrypted.fw_version, 3);
        assert_eq!(decrypted.compatibility(), CompatibilityType::Terra);
    }

    #[test]
    fn test_lafw_scan_and_version() {
        let mut image = vec![0u8; LAFW_BLOB_SIZE + 0x100];
        let base = 0x40;
        image[base + 0x100..base + 0x104].copy_from_slice(LAFW_MAGIC);
        image[base + 0x104..base + 0x108].copy_from_slice(&0xFFu32.to_le_bytes());
        // version mask with 5 bits set, device type Prod (2).
        let packed: u64 = 0b11111 | (2u64 << 62);
        image[base + 0x110..base + 0x118].copy_from_slice(&packed.to_le_bytes());

        let blob = LafwBlob::find_in_memory(&image, false).unwrap();
        assert_eq!(blob.version(), 5);
        assert_eq!(blob.device_type, 2);

        // A dev unit must not accept the retail ReadFw blob.
        assert!(LafwBlob::find_in_memory(&image, true).is_err());
    }

    #[test]
    fn test_version_unpacking() {
        let v = Version(0x10000000);
        assert_eq!(v.major(), 4);
        assert_eq!(v.minor(), 0);
        assert_eq!(v.to_string(), "4.0.0-0");
    }
}
