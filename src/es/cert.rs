//! Certificates and issuer-chain retrieval from the ES certificate
//! save.

use crate::error::{Error, HeaderKind, Result};
use crate::save::SaveFile;

use super::signature::SignatureType;

pub const SIGNED_CERT_MIN_SIZE: usize = 0x140;
pub const SIGNED_CERT_MAX_SIZE: usize = 0x500;

const CERT_SAVE_BASE_PATH: &str = "/certificate/";
const ISSUER_SIZE: usize = 0x40;
const NAME_SIZE: usize = 0x40;

/// Public-key flavor carried by a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertPubKeyType {
    Rsa4096,
    Rsa2048,
    Ecc480,
}

impl CertPubKeyType {
    fn from_raw(value: u32) -> Option<Self> {
        match value {
            0 => Some(CertPubKeyType::Rsa4096),
            1 => Some(CertPubKeyType::Rsa2048),
            2 => Some(CertPubKeyType::Ecc480),
            _ => None,
        }
    }

    /// Size of the public-key block following the common block.
    fn key_block_size(self) -> usize {
        match self {
            CertPubKeyType::Rsa4096 => 0x200 + 4 + 0x34,
            CertPubKeyType::Rsa2048 => 0x100 + 4 + 0x34,
            CertPubKeyType::Ecc480 => 0x3C + 0x3C,
        }
    }

    fn modulus_size(self) -> usize {
        match self {
            CertPubKeyType::Rsa4096 => 0x200,
            CertPubKeyType::Rsa2048 => 0x100,
            CertPubKeyType::Ecc480 => 0x3C,
        }
    }
}

/// A parsed signed certificate.
#[derive(Debug, Clone)]
pub struct Certificate {
    pub raw: Vec<u8>,
    pub signature_type: SignatureType,
    pub pub_key_type: CertPubKeyType,
    pub issuer: String,
    pub name: String,
}

fn read_fixed_string(raw: &[u8]) -> Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(std::str::from_utf8(&raw[..end])?.to_string())
}

impl Certificate {
    /// Parses a signed certificate blob.
    pub fn parse(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < SIGNED_CERT_MIN_SIZE || raw.len() > SIGNED_CERT_MAX_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Certificate,
                format!("certificate size 0x{:X} out of range", raw.len()),
            ));
        }

        let signature_type = SignatureType::from_blob(&raw, true)?;
        let body = signature_type.block_size();
        if raw.len() < body + ISSUER_SIZE + 4 + NAME_SIZE + 4 {
            return Err(Error::CorruptHeader(
                HeaderKind::Certificate,
                "certificate truncated before its common block".to_string(),
            ));
        }

        let issuer = read_fixed_string(&raw[body..body + ISSUER_SIZE])?;
        let pub_key_raw = u32::from_be_bytes(
            raw[body + ISSUER_SIZE..body + ISSUER_SIZE + 4]
                .try_into()
                .unwrap(),
        );
        let pub_key_type = CertPubKeyType::from_raw(pub_key_raw).ok_or_else(|| {
            Error::CorruptHeader(
                HeaderKind::Certificate,
                format!("unknown public key type {pub_key_raw}"),
            )
        })?;
        let name = read_fixed_string(
            &raw[body + ISSUER_SIZE + 4..body + ISSUER_SIZE + 4 + NAME_SIZE],
        )?;

        let key_block_start = body + ISSUER_SIZE + 4 + NAME_SIZE + 4;
        if raw.len() < key_block_start + pub_key_type.key_block_size() {
            return Err(Error::CorruptHeader(
                HeaderKind::Certificate,
                "certificate truncated before its key block".to_string(),
            ));
        }

        Ok(Self {
            raw,
            signature_type,
            pub_key_type,
            issuer,
            name,
        })
    }

    fn key_block_offset(&self) -> usize {
        self.signature_type.block_size() + ISSUER_SIZE + 4 + NAME_SIZE + 4
    }

    /// Public modulus (or ECC point for ECC certificates).
    pub fn modulus(&self) -> &[u8] {
        let start = self.key_block_offset();
        &self.raw[start..start + self.pub_key_type.modulus_size()]
    }

    /// RSA public exponent; ECC certificates have none.
    pub fn public_exponent(&self) -> Option<[u8; 4]> {
        match self.pub_key_type {
            CertPubKeyType::Ecc480 => None,
            _ => {
                let start = self.key_block_offset() + self.pub_key_type.modulus_size();
                Some(self.raw[start..start + 4].try_into().unwrap())
            }
        }
    }
}

/// An ordered certificate chain plus its raw concatenation.
#[derive(Debug, Clone)]
pub struct CertificateChain {
    pub certs: Vec<Certificate>,
}

impl CertificateChain {
    /// The chain as raw bytes, in retrieval order.
    pub fn raw(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for cert in &self.certs {
            out.extend_from_slice(&cert.raw);
        }
        out
    }
}

/// Certificate lookups over the ES certificate system save.
pub struct CertificateStore {
    save: SaveFile,
}

impl CertificateStore {
    pub fn new(save: SaveFile) -> Self {
        Self { save }
    }

    /// Loads `/certificate/<name>` from the save.
    pub fn certificate_by_name(&mut self, name: &str) -> Result<Certificate> {
        let path = format!("{CERT_SAVE_BASE_PATH}{name}");
        let (file, length) = self.save.open_file(&path)?;

        if !(SIGNED_CERT_MIN_SIZE as u64..=SIGNED_CERT_MAX_SIZE as u64).contains(&length) {
            return Err(Error::CorruptHeader(
                HeaderKind::Certificate,
                format!("certificate \"{name}\" has invalid size 0x{length:X}"),
            ));
        }

        let mut raw = vec![0u8; length as usize];
        self.save.read_file(&file, 0, &mut raw)?;
        Certificate::parse(raw)
    }

    /// Assembles the chain named by a signature issuer string.
    ///
    /// The issuer is split on `-`; the leading `Root` is skipped and
    /// each remaining component is loaded by name.
    pub fn chain_for_issuer(&mut self, issuer: &str) -> Result<CertificateChain> {
        let mut components = issuer.split('-');
        if components.next() != Some("Root") {
            return Err(Error::InvalidArgument(format!(
                "issuer \"{issuer}\" does not start with Root-"
            )));
        }

        let mut certs = Vec::new();
        for name in components.filter(|c| !c.is_empty()) {
            certs.push(self.certificate_by_name(name)?);
        }
        if certs.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "issuer \"{issuer}\" names no certificates"
            )));
        }

        Ok(CertificateChain { certs })
    }
}
