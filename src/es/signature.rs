//! Signature blocks shared by tickets and certificates.
//!
//! A signed blob starts with a 32-bit signature-type tag followed by the
//! signature and fixed padding; the signed payload begins right after
//! the padded block. Certificates store the tag big-endian (a Wii-era
//! holdover), tickets little-endian.

use crate::error::{Error, HeaderKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Rsa4096Sha1,
    Rsa2048Sha1,
    Ecc480Sha1,
    Rsa4096Sha256,
    Rsa2048Sha256,
    Ecc480Sha256,
    Hmac160Sha1,
}

impl SignatureType {
    pub fn from_raw(value: u32) -> Option<Self> {
        match value {
            0x10000 => Some(SignatureType::Rsa4096Sha1),
            0x10001 => Some(SignatureType::Rsa2048Sha1),
            0x10002 => Some(SignatureType::Ecc480Sha1),
            0x10003 => Some(SignatureType::Rsa4096Sha256),
            0x10004 => Some(SignatureType::Rsa2048Sha256),
            0x10005 => Some(SignatureType::Ecc480Sha256),
            0x10006 => Some(SignatureType::Hmac160Sha1),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            SignatureType::Rsa4096Sha1 => 0x10000,
            SignatureType::Rsa2048Sha1 => 0x10001,
            SignatureType::Ecc480Sha1 => 0x10002,
            SignatureType::Rsa4096Sha256 => 0x10003,
            SignatureType::Rsa2048Sha256 => 0x10004,
            SignatureType::Ecc480Sha256 => 0x10005,
            SignatureType::Hmac160Sha1 => 0x10006,
        }
    }

    /// Size of the signature itself.
    pub fn signature_size(self) -> usize {
        match self {
            SignatureType::Rsa4096Sha1 | SignatureType::Rsa4096Sha256 => 0x200,
            SignatureType::Rsa2048Sha1 | SignatureType::Rsa2048Sha256 => 0x100,
            SignatureType::Ecc480Sha1 | SignatureType::Ecc480Sha256 => 0x3C,
            SignatureType::Hmac160Sha1 => 0x14,
        }
    }

    /// Size of the whole signature block (tag + signature + padding);
    /// the signed payload starts here.
    pub fn block_size(self) -> usize {
        match self {
            SignatureType::Rsa4096Sha1 | SignatureType::Rsa4096Sha256 => 0x240,
            SignatureType::Rsa2048Sha1 | SignatureType::Rsa2048Sha256 => 0x140,
            SignatureType::Ecc480Sha1 | SignatureType::Ecc480Sha256 => 0x80,
            SignatureType::Hmac160Sha1 => 0x40,
        }
    }

    /// Reads the tag from the start of a signed blob.
    pub fn from_blob(data: &[u8], big_endian: bool) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                "signed blob shorter than its type tag".to_string(),
            ));
        }
        let raw = if big_endian {
            u32::from_be_bytes(data[..4].try_into().unwrap())
        } else {
            u32::from_le_bytes(data[..4].try_into().unwrap())
        };
        Self::from_raw(raw).ok_or_else(|| {
            Error::CorruptHeader(
                HeaderKind::Ticket,
                format!("unknown signature type 0x{raw:08X}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip() {
        for raw in 0x10000u32..=0x10006 {
            let sig = SignatureType::from_raw(raw).unwrap();
            assert_eq!(sig.raw(), raw);
        }
        assert!(SignatureType::from_raw(0x10007).is_none());
        assert!(SignatureType::from_raw(0).is_none());
    }

    #[test]
    fn test_block_sizes_include_padding() {
        assert_eq!(SignatureType::Rsa2048Sha256.block_size(), 0x140);
        assert_eq!(SignatureType::Rsa2048Sha256.signature_size(), 0x100);
        assert_eq!(SignatureType::Rsa4096Sha256.block_size(), 0x240);
        assert_eq!(SignatureType::Ecc480Sha256.block_size(), 0x80);
        assert_eq!(SignatureType::Hmac160Sha1.block_size(), 0x40);
    }

    #[test]
    fn test_endianness_per_container() {
        // Tickets: little-endian tag.
        let mut tik = vec![0u8; 8];
        tik[..4].copy_from_slice(&0x10004u32.to_le_bytes());
        assert_eq!(
            SignatureType::from_blob(&tik, false).unwrap(),
            SignatureType::Rsa2048Sha256
        );

        // Certificates: big-endian tag.
        let mut cert = vec![0u8; 8];
        cert[..4].copy_from_slice(&0x10003u32.to_be_bytes());
        assert_eq!(
            SignatureType::from_blob(&cert, true).unwrap(),
            SignatureType::Rsa4096Sha256
        );
    }
}
