use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek};
use std::path::Path;

use hex::FromHex;

use crate::crypto;
use crate::error::{Error, Result};

/// Key-area encryption key category, as indexed by the NCA header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KaekIndex {
    Application,
    Ocean,
    System,
}

impl KaekIndex {
    pub fn key_prefix(self) -> &'static str {
        match self {
            KaekIndex::Application => "key_area_key_application",
            KaekIndex::Ocean => "key_area_key_ocean",
            KaekIndex::System => "key_area_key_system",
        }
    }
}

/// Console-unique RSA-2048 keypair used to unwrap personalized titlekeys.
#[derive(Clone)]
pub struct EticketRsaKeyPair {
    pub private_exponent: [u8; 0x100],
    pub modulus: [u8; 0x100],
    pub public_exponent: [u8; 4],
}

/// Process-wide key material, loaded once at init.
///
/// Keys are parsed from `name = hexvalue` files (`prod.keys` and friends).
/// Lookups fail with [`Error::KeyMissing`] on first use of an absent key,
/// never by handing out zeroed key material.
#[derive(Clone, Default)]
pub struct KeySet {
    raw_keys: HashMap<String, Vec<u8>>,
    header_key_cache: Option<[u8; 0x20]>,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key values stay out of debug output.
        let mut names: Vec<_> = self.raw_keys.keys().collect();
        names.sort();
        f.debug_struct("KeySet")
            .field("total_keys", &self.raw_keys.len())
            .field("names", &names)
            .finish()
    }
}

impl KeySet {
    /// Create a new keyset from a file path
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::from_reader(file)
    }

    /// Parse a key file to extract keys.
    pub fn from_reader(reader: impl Read + Seek) -> Result<Self> {
        let mut keyset = KeySet::default();
        keyset.merge_from_reader(reader)?;
        Ok(keyset)
    }

    /// Merge keys from another reader; later entries override earlier ones.
    ///
    /// Used to layer console-unique key files over the shared key file.
    pub fn merge_from_reader(&mut self, reader: impl Read + Seek) -> Result<()> {
        let lines = BufReader::new(reader).lines();
        let mut keys_loaded = 0;

        for line in lines {
            let line_str = line?;

            // Skip empty lines or comments
            if line_str.trim().is_empty() || line_str.trim().starts_with(';') {
                continue;
            }

            let line_parts: Vec<_> = line_str.split('=').collect();
            if line_parts.len() != 2 {
                continue;
            }

            let key = line_parts[0].trim().to_string();
            let value = line_parts[1].trim().split(';').next().unwrap_or("").trim();

            let key_data = match Vec::from_hex(value) {
                Ok(data) => data,
                Err(_) => {
                    tracing::warn!("Invalid hex value for key {}: {}", key, value);
                    continue;
                }
            };

            self.raw_keys.insert(key, key_data);
            keys_loaded += 1;
        }

        self.update_caches();

        tracing::info!("Loaded {} keys", keys_loaded);

        Ok(())
    }

    fn update_caches(&mut self) {
        if let Some(key_data) = self.raw_keys.get("header_key")
            && key_data.len() == 0x20
        {
            let mut header_key = [0u8; 0x20];
            header_key.copy_from_slice(key_data);
            self.header_key_cache = Some(header_key);
        }
    }

    /// Try to get a fixed-size key by its exact name
    pub fn get_key<const N: usize>(&self, key_name: &str) -> Option<[u8; N]> {
        self.raw_keys.get(key_name).and_then(|data| {
            if data.len() == N {
                let mut result = [0u8; N];
                result.copy_from_slice(data);
                Some(result)
            } else {
                None
            }
        })
    }

    fn require_key<const N: usize>(&self, key_name: &str) -> Result<[u8; N]> {
        self.get_key(key_name)
            .ok_or_else(|| Error::KeyMissing(key_name.to_string()))
    }

    /// NCA header key, split into its two XTS halves at use sites.
    pub fn header_key(&self) -> Result<[u8; 0x20]> {
        self.header_key_cache
            .ok_or_else(|| Error::KeyMissing("header_key".to_string()))
    }

    /// Key-area encryption key for the given category and key generation.
    pub fn kaek(&self, index: KaekIndex, generation: u8) -> Result<[u8; 0x10]> {
        self.require_key(&format!("{}_{:02x}", index.key_prefix(), generation))
    }

    /// Title KEK for the given key generation.
    pub fn titlekek(&self, generation: u8) -> Result<[u8; 0x10]> {
        self.require_key(&format!("titlekek_{:02x}", generation))
    }

    /// Ticket common key for the given key generation.
    ///
    /// Key dumps that don't carry a dedicated `ticket_commonkey` table use
    /// the titlekek table for common tickets.
    pub fn ticket_common_key(&self, generation: u8) -> Result<[u8; 0x10]> {
        let name = format!("ticket_commonkey_{:02x}", generation);
        if let Some(key) = self.get_key(&name) {
            return Ok(key);
        }
        self.titlekek(generation)
    }

    /// AES-128-CBC key for the gamecard CardInfo area.
    pub fn card_info_key(&self) -> Result<[u8; 0x10]> {
        self.require_key("xci_header_key")
    }

    /// AES-128-CMAC key for save headers.
    pub fn save_mac_key(&self) -> Result<[u8; 0x10]> {
        self.require_key("save_mac_key")
    }

    /// Console-unique eticket RSA keypair, stored as the decrypted 0x220
    /// PRODINFO blob: ctr (0x10) | d (0x100) | n (0x100) | e (0x4) | pad.
    pub fn eticket_rsa_keypair(&self) -> Result<EticketRsaKeyPair> {
        let blob = self
            .raw_keys
            .get("eticket_rsa_keypair")
            .ok_or_else(|| Error::KeyMissing("eticket_rsa_keypair".to_string()))?;
        if blob.len() < 0x214 {
            return Err(Error::KeyMissing(
                "eticket_rsa_keypair (truncated)".to_string(),
            ));
        }

        let mut pair = EticketRsaKeyPair {
            private_exponent: [0u8; 0x100],
            modulus: [0u8; 0x100],
            public_exponent: [0u8; 4],
        };
        pair.private_exponent.copy_from_slice(&blob[0x10..0x110]);
        pair.modulus.copy_from_slice(&blob[0x110..0x210]);
        pair.public_exponent.copy_from_slice(&blob[0x210..0x214]);
        Ok(pair)
    }

    /// Decrypts an NCA key area into its four key slots.
    pub fn decrypt_nca_key_area(
        &self,
        index: KaekIndex,
        generation: u8,
        encrypted: &[u8; 0x40],
    ) -> Result<[[u8; 0x10]; 4]> {
        let kaek = self.kaek(index, generation)?;

        let mut area = *encrypted;
        crypto::aes128_ecb_decrypt(&kaek, &mut area)?;

        let mut keys = [[0u8; 0x10]; 4];
        for (i, key) in keys.iter_mut().enumerate() {
            key.copy_from_slice(&area[i * 0x10..(i + 1) * 0x10]);
        }
        Ok(keys)
    }

    /// Unwraps a personalized titlekey block with the console RSA key.
    pub fn unwrap_rsa_oaep_titlekey(&self, wrapped: &[u8; 0x100]) -> Result<[u8; 0x10]> {
        let pair = self.eticket_rsa_keypair()?;
        let label_hash = crypto::sha256(b"");
        let plain =
            crypto::rsa2048_oaep_unwrap(&pair.modulus, &pair.private_exponent, wrapped, &label_hash)?;
        if plain.len() != 0x10 {
            return Err(Error::CryptoFailure(format!(
                "unwrapped titlekey has unexpected length 0x{:X}",
                plain.len()
            )));
        }
        let mut titlekey = [0u8; 0x10];
        titlekey.copy_from_slice(&plain);
        Ok(titlekey)
    }

    /// Check if the keyset has the minimum keys for NCA decryption.
    pub fn has_required_nca_keys(&self) -> bool {
        self.header_key_cache.is_some()
            && self.get_key::<0x10>("key_area_key_application_00").is_some()
            && self.get_key::<0x10>("titlekek_00").is_some()
    }
}
