//! Ticket retrieval and titlekey decryption.
//!
//! Tickets come from the gamecard's secure partition or from the ES
//! system saves. NAND retrieval walks `/ticket_list.bin` for the rights
//! id, then pulls the 0x400-byte record out of `/ticket.bin`; volatile
//! (still-encrypted) records are decrypted with an AES-CTR key pair
//! recovered from ES process memory. Tampered common tickets are
//! repaired in memory, never written back.

use crate::crypto::{self, KeySet};
use crate::error::{Error, HeaderKind, Result};
use crate::gamecard::hfs::HashFs;
use crate::memory::{MemorySegment, SystemMemoryProvider, SystemProgram};
use crate::save::SaveFile;
use std::sync::Arc;

use super::cert::CertificateStore;
use super::signature::SignatureType;

pub const SIGNED_TIK_MIN_SIZE: usize = 0x1C0;
pub const SIGNED_TIK_MAX_SIZE: usize = 0x400;
pub const TIK_COMMON_BLOCK_SIZE: usize = 0x180;

pub const TIK_LIST_STORAGE_PATH: &str = "/ticket_list.bin";
pub const TIK_DB_STORAGE_PATH: &str = "/ticket.bin";
const TIK_LIST_ENTRY_SIZE: usize = 0x20;

const TIK_COMMON_CERT_NAME: &str = "XS00000020";
const TIK_DEV_CERT_ISSUER: &str = "CA00000004";

/// Key generations at or above this carry the generation in the rights
/// id's low byte.
const KEY_GENERATION_SINCE_301: u8 = 3;

const ISSUER_SIZE: usize = 0x40;
const TITLEKEY_BLOCK_SIZE: usize = 0x100;

/// How the ticket's titlekey block is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TitleKeyType {
    Common,
    Personalized,
}

impl TitleKeyType {
    fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(TitleKeyType::Common),
            1 => Some(TitleKeyType::Personalized),
            _ => None,
        }
    }
}

/// Where to retrieve a ticket from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketSource {
    Gamecard,
    Nand,
}

/// A retrieved, decoded ticket.
#[derive(Clone)]
pub struct Ticket {
    /// Raw signed ticket, padded to the maximum signed size.
    pub data: Vec<u8>,
    pub signature_type: SignatureType,
    /// Exact signed size (signature block + common block).
    pub size: usize,
    pub key_generation: u8,
    pub enc_titlekey: [u8; 0x10],
    pub dec_titlekey: [u8; 0x10],
}

impl Ticket {
    /// Validates a raw signed ticket and wraps it.
    pub fn from_raw(mut data: Vec<u8>, key_generation: u8) -> Result<Self> {
        if data.len() < SIGNED_TIK_MIN_SIZE || data.len() > SIGNED_TIK_MAX_SIZE {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                format!("ticket size 0x{:X} out of range", data.len()),
            ));
        }
        let signature_type = SignatureType::from_blob(&data, false)?;
        let size = signature_type.block_size() + TIK_COMMON_BLOCK_SIZE;
        if size > data.len() {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                "signed ticket exceeds its blob".to_string(),
            ));
        }
        data.resize(SIGNED_TIK_MAX_SIZE, 0);

        Ok(Self {
            data,
            signature_type,
            size,
            key_generation,
            enc_titlekey: [0u8; 0x10],
            dec_titlekey: [0u8; 0x10],
        })
    }

    fn common(&self, offset: usize) -> usize {
        self.signature_type.block_size() + offset
    }

    pub fn issuer(&self) -> String {
        let start = self.common(0);
        let raw = &self.data[start..start + ISSUER_SIZE];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    pub fn titlekey_block(&self) -> &[u8] {
        let start = self.common(0x40);
        &self.data[start..start + TITLEKEY_BLOCK_SIZE]
    }

    pub fn titlekey_type(&self) -> Result<TitleKeyType> {
        let raw = self.data[self.common(0x141)];
        TitleKeyType::from_raw(raw).ok_or_else(|| {
            Error::CorruptHeader(HeaderKind::Ticket, format!("bad titlekey type {raw}"))
        })
    }

    pub fn rights_id(&self) -> [u8; 0x10] {
        let start = self.common(0x160);
        self.data[start..start + 0x10].try_into().unwrap()
    }

    pub fn ticket_id(&self) -> u64 {
        let start = self.common(0x150);
        u64::from_le_bytes(self.data[start..start + 8].try_into().unwrap())
    }

    pub fn device_id(&self) -> u64 {
        let start = self.common(0x158);
        u64::from_le_bytes(self.data[start..start + 8].try_into().unwrap())
    }

    pub fn account_id(&self) -> u32 {
        let start = self.common(0x170);
        u32::from_le_bytes(self.data[start..start + 4].try_into().unwrap())
    }

    pub fn sect_hdr_offset(&self) -> u32 {
        let start = self.common(0x178);
        u32::from_le_bytes(self.data[start..start + 4].try_into().unwrap())
    }

    /// The signed ticket bytes (signature block + common block).
    pub fn signed_bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    fn write_common_u8(&mut self, offset: usize, value: u8) {
        let at = self.common(offset);
        self.data[at] = value;
    }

    fn write_common_u16(&mut self, offset: usize, value: u16) {
        let at = self.common(offset);
        self.data[at..at + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_common_u32(&mut self, offset: usize, value: u32) {
        let at = self.common(offset);
        self.data[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_common_u64(&mut self, offset: usize, value: u64) {
        let at = self.common(offset);
        self.data[at..at + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Clears personalization and section fields after a repair or a
    /// conversion; the signed size must already be final.
    fn reset_noncritical_fields(&mut self) {
        self.write_common_u8(0x141, 0); // titlekey type: common
        self.write_common_u8(0x144, 0); // license type: permanent
        self.write_common_u16(0x146, 0); // property mask
        self.write_common_u64(0x150, 0); // ticket id
        self.write_common_u64(0x158, 0); // device id
        self.write_common_u32(0x170, 0); // account id
        self.write_common_u32(0x174, 0); // sect total size
        self.write_common_u32(0x178, self.size as u32);
        self.write_common_u16(0x17C, 0); // sect hdr count
        self.write_common_u16(0x17E, 0); // sect hdr entry size
    }
}

/// 0x20-byte record of `/ticket_list.bin`.
struct TikListEntry {
    rights_id: [u8; 0x10],
}

/// 9.x+ AES-CTR key entry pair layout scanned for in ES `.data`.
const ES_CTR_KEY_ENTRY_SIZE: usize = 0x24;
const ES_CTR_KEY_PATTERN_SIZE: usize = 0x28;

/// Ticket retrieval over the ES saves and the gamecard.
pub struct TicketStore {
    common_save: Option<SaveFile>,
    personalized_save: Option<SaveFile>,
    certs: Option<CertificateStore>,
    memory: Arc<dyn SystemMemoryProvider>,
    keys: Arc<KeySet>,
}

impl TicketStore {
    pub fn new(
        common_save: Option<SaveFile>,
        personalized_save: Option<SaveFile>,
        certs: Option<CertificateStore>,
        memory: Arc<dyn SystemMemoryProvider>,
        keys: Arc<KeySet>,
    ) -> Self {
        Self {
            common_save,
            personalized_save,
            certs,
            memory,
            keys,
        }
    }

    pub fn certificates(&mut self) -> Option<&mut CertificateStore> {
        self.certs.as_mut()
    }

    fn validate_rights_id(rights_id: &[u8; 0x10], key_generation: u8) -> Result<()> {
        let rid_generation = rights_id[0xF];
        let old = key_generation < KEY_GENERATION_SINCE_301;
        if (old && rid_generation != 0) || (!old && rid_generation != key_generation) {
            return Err(Error::InvalidArgument(format!(
                "rights id key generation 0x{rid_generation:02X} does not match 0x{key_generation:02X}"
            )));
        }
        Ok(())
    }

    /// Retrieves and fully decodes a ticket for a rights id.
    pub fn ticket_for(
        &mut self,
        rights_id: &[u8; 0x10],
        key_generation: u8,
        source: TicketSource,
        gamecard_secure: Option<&mut HashFs>,
    ) -> Result<Ticket> {
        Self::validate_rights_id(rights_id, key_generation)?;

        let mut ticket = match source {
            TicketSource::Gamecard => {
                let secure = gamecard_secure.ok_or_else(|| {
                    Error::InvalidArgument(
                        "gamecard ticket retrieval needs the secure partition".to_string(),
                    )
                })?;
                self.ticket_from_gamecard(secure, rights_id, key_generation)?
            }
            TicketSource::Nand => self.ticket_from_nand(rights_id, key_generation)?,
        };

        if ticket.rights_id() != *rights_id {
            return Err(Error::NotFound(format!(
                "ticket for rights id {}",
                hex::encode(rights_id).to_uppercase()
            )));
        }

        self.fix_tampered_common_ticket(&mut ticket)?;
        self.decode_titlekeys(&mut ticket)?;
        Ok(ticket)
    }

    fn ticket_from_gamecard(
        &mut self,
        secure: &mut HashFs,
        rights_id: &[u8; 0x10],
        key_generation: u8,
    ) -> Result<Ticket> {
        let filename = format!("{}.tik", hex::encode(rights_id));
        let entry = secure.entry_by_name(&filename)?.clone();

        if entry.size < SIGNED_TIK_MIN_SIZE as u64 || entry.size > SIGNED_TIK_MAX_SIZE as u64 {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                format!("\"{filename}\" has invalid size 0x{:X}", entry.size),
            ));
        }

        let index = secure
            .entries()
            .iter()
            .position(|e| e.name == filename)
            .unwrap();
        let mut raw = vec![0u8; entry.size as usize];
        secure.read_entry(index, 0, &mut raw)?;
        Ticket::from_raw(raw, key_generation)
    }

    /// Scans a save's ticket list for the rights id; returns the record
    /// offset inside `/ticket.bin`.
    fn locate_in_save(save: &mut SaveFile, rights_id: &[u8; 0x10]) -> Result<Option<u64>> {
        let (list, list_size) = match save.open_file(TIK_LIST_STORAGE_PATH) {
            Ok(opened) => opened,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        if list_size < TIK_LIST_ENTRY_SIZE as u64 || list_size % TIK_LIST_ENTRY_SIZE as u64 != 0 {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                format!("invalid ticket list size 0x{list_size:X}"),
            ));
        }

        let mut offset = 0u64;
        let mut raw = [0u8; TIK_LIST_ENTRY_SIZE];
        while offset < list_size {
            save.read_file(&list, offset, &mut raw)?;
            let entry = TikListEntry {
                rights_id: raw[..0x10].try_into().unwrap(),
            };

            // An all-ones rights id terminates the list.
            if entry.rights_id == [0xFFu8; 0x10] {
                break;
            }
            if entry.rights_id == *rights_id {
                // One 0x400-byte ticket record per 0x20-byte list entry.
                return Ok(Some(offset << 5));
            }
            offset += TIK_LIST_ENTRY_SIZE as u64;
        }
        Ok(None)
    }

    fn ticket_from_nand(
        &mut self,
        rights_id: &[u8; 0x10],
        key_generation: u8,
    ) -> Result<Ticket> {
        // Probe the common store first, then the personalized one.
        let mut located: Option<(bool, u64)> = None;
        if let Some(save) = self.common_save.as_mut()
            && let Some(offset) = Self::locate_in_save(save, rights_id)?
        {
            located = Some((false, offset));
        }
        if located.is_none()
            && let Some(save) = self.personalized_save.as_mut()
            && let Some(offset) = Self::locate_in_save(save, rights_id)?
        {
            located = Some((true, offset));
        }

        let Some((personalized, ticket_offset)) = located else {
            return Err(Error::NotFound(format!(
                "ticket for rights id {}",
                hex::encode(rights_id).to_uppercase()
            )));
        };

        let save = if personalized {
            self.personalized_save.as_mut().unwrap()
        } else {
            self.common_save.as_mut().unwrap()
        };

        let (db, db_size) = save.open_file(TIK_DB_STORAGE_PATH)?;
        if db_size < SIGNED_TIK_MIN_SIZE as u64
            || db_size % SIGNED_TIK_MAX_SIZE as u64 != 0
            || db_size < ticket_offset + SIGNED_TIK_MAX_SIZE as u64
        {
            return Err(Error::CorruptHeader(
                HeaderKind::Ticket,
                format!("invalid ticket database size 0x{db_size:X}"),
            ));
        }

        let mut raw = vec![0u8; SIGNED_TIK_MAX_SIZE];
        save.read_file(&db, ticket_offset, &mut raw)?;

        // Volatile records don't decode to a Root- issuer until
        // decrypted with the in-memory ES key pair.
        let is_volatile = Ticket::from_raw(raw.clone(), key_generation)
            .map(|t| !t.issuer().starts_with("Root-"))
            .unwrap_or(true);
        if is_volatile {
            raw = self.decrypt_volatile_ticket(&raw, ticket_offset)?;
        }

        Ticket::from_raw(raw, key_generation)
    }

    /// Tries every candidate AES-CTR key pair found in ES `.data` until
    /// one decrypts the record to a `Root-` issuer.
    fn decrypt_volatile_ticket(&mut self, raw: &[u8], ticket_offset: u64) -> Result<Vec<u8>> {
        let image = self
            .memory
            .read_program_memory(SystemProgram::Es, MemorySegment::Data)?;

        let mut offset = 0usize;
        while offset + 2 * ES_CTR_KEY_ENTRY_SIZE <= image.len() {
            let window = &image[offset..];

            // Pattern: two adjacent entries with consecutive indices, the
            // second one odd; the key must be set and the counter zero.
            let idx1 = u32::from_le_bytes(window[0..4].try_into().unwrap());
            let idx2 = u32::from_le_bytes(
                window[ES_CTR_KEY_PATTERN_SIZE - 4..ES_CTR_KEY_PATTERN_SIZE]
                    .try_into()
                    .unwrap(),
            );
            if idx2 != idx1.wrapping_add(1) || idx2 & 1 == 0 {
                offset += 1;
                continue;
            }

            let key: [u8; 0x10] = window[4..0x14].try_into().unwrap();
            let ctr: [u8; 0x10] = window[0x14..0x24].try_into().unwrap();
            if key == [0u8; 0x10] || ctr != [0u8; 0x10] {
                offset += 1;
                continue;
            }

            // Counter: the entry counter's first half, then the record
            // offset in 16-byte blocks.
            let mut iv = [0u8; 0x10];
            iv[..8].copy_from_slice(&ctr[..8]);
            iv[8..].copy_from_slice(&(ticket_offset >> 4).to_be_bytes());

            let mut candidate = raw.to_vec();
            crypto::aes128_ctr_crypt(&key, &iv, &mut candidate);

            if let Ok(ticket) = Ticket::from_raw(candidate.clone(), 0)
                && ticket.issuer().starts_with("Root-")
            {
                tracing::debug!(offset, "volatile ticket decrypted with ES memory key");
                return Ok(candidate);
            }

            offset += 1;
        }

        Err(Error::NotFound(
            "ES memory key entry for volatile ticket".to_string(),
        ))
    }

    /// Verifies common RSA-2048+SHA-256 tickets and rebuilds tampered
    /// ones in memory.
    fn fix_tampered_common_ticket(&mut self, ticket: &mut Ticket) -> Result<()> {
        if ticket.titlekey_type()? != TitleKeyType::Common
            || ticket.signature_type != SignatureType::Rsa2048Sha256
        {
            return Ok(());
        }
        if self.verify_rsa2048_sha256_signature(ticket)? {
            return Ok(());
        }

        tracing::debug!("detected tampered common ticket, rebuilding in memory");

        // Old tools used to wipe the key generation and scramble the
        // personalization fields; put the correct values back.
        let sig_size = ticket.signature_type.signature_size();
        ticket.data[4..4 + sig_size].fill(0xFF);
        let key_generation = ticket.key_generation;
        ticket.write_common_u8(0x145, key_generation);
        ticket.reset_noncritical_fields();
        Ok(())
    }

    fn verify_rsa2048_sha256_signature(&mut self, ticket: &Ticket) -> Result<bool> {
        let Some(certs) = self.certs.as_mut() else {
            // Without a certificate store there is nothing to verify
            // against; leave the ticket as-is.
            return Ok(true);
        };

        let issuer = ticket.issuer();
        let Some(cert_name) = issuer.rsplit('-').next().filter(|n| !n.is_empty()) else {
            return Ok(false);
        };
        let cert = match certs.certificate_by_name(cert_name) {
            Ok(cert) => cert,
            Err(Error::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(exponent) = cert.public_exponent() else {
            return Ok(false);
        };

        let hash_area = &ticket.data[ticket.signature_type.block_size()..ticket.size];
        let signature = &ticket.data[4..4 + ticket.signature_type.signature_size()];
        Ok(crypto::rsa2048_pkcs1_verify_sha256(
            cert.modulus(),
            &exponent,
            hash_area,
            signature,
        ))
    }

    /// Extracts the encrypted titlekey and decrypts it.
    fn decode_titlekeys(&mut self, ticket: &mut Ticket) -> Result<()> {
        let enc: [u8; 0x10] = match ticket.titlekey_type()? {
            TitleKeyType::Common => ticket.titlekey_block()[..0x10].try_into().unwrap(),
            TitleKeyType::Personalized => {
                let block: [u8; 0x100] = ticket.titlekey_block().try_into().unwrap();
                self.keys.unwrap_rsa_oaep_titlekey(&block)?
            }
        };

        let common_key = self.keys.ticket_common_key(ticket.key_generation)?;
        let mut dec = enc;
        crypto::aes128_ecb_decrypt_block(&common_key, &mut dec);

        ticket.enc_titlekey = enc;
        ticket.dec_titlekey = dec;
        Ok(())
    }

    /// Converts a personalized ticket into a common one for archival.
    ///
    /// Returns the raw certificate chain for the new issuer.
    pub fn convert_personalized_to_common(&mut self, ticket: &mut Ticket) -> Result<Vec<u8>> {
        if ticket.titlekey_type()? != TitleKeyType::Personalized {
            return Err(Error::InvalidArgument(
                "ticket is not personalized".to_string(),
            ));
        }

        let dev = ticket.issuer().contains(TIK_DEV_CERT_ISSUER);
        let issuer = format!(
            "Root-CA{:08X}-{}",
            if dev { 4 } else { 3 },
            TIK_COMMON_CERT_NAME
        );

        let certs = self.certs.as_mut().ok_or_else(|| {
            Error::InvalidState(
                "personalized conversion needs the certificate store".to_string(),
            )
        })?;
        let chain = certs.chain_for_issuer(&issuer)?.raw();

        // Wipe the signature and switch the issuer.
        let sig_size = ticket.signature_type.signature_size();
        ticket.data[4..4 + sig_size].fill(0xFF);
        let issuer_at = ticket.common(0);
        ticket.data[issuer_at..issuer_at + ISSUER_SIZE].fill(0);
        ticket.data[issuer_at..issuer_at + issuer.len()].copy_from_slice(issuer.as_bytes());

        // The decrypted-from-OAEP titlekey becomes a plain common
        // titlekey block.
        let block_at = ticket.common(0x40);
        ticket.data[block_at..block_at + TITLEKEY_BLOCK_SIZE].fill(0);
        let enc = ticket.enc_titlekey;
        ticket.data[block_at..block_at + 0x10].copy_from_slice(&enc);

        ticket.size = ticket.signature_type.block_size() + TIK_COMMON_BLOCK_SIZE;
        ticket.reset_noncritical_fields();
        let size = ticket.size;
        ticket.data[size..].fill(0);

        Ok(chain)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::es::cert::tests::build_cert;
    use crate::io::MemoryStorage;
    use crate::save::tests::{FixtureFile, build_save_image_with_files, save_storage};
    use crate::memory::StaticMemory;
    use hex_literal::hex;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};

    const COMMON_KEY: [u8; 0x10] = hex!("2b7e151628aed2a6abf7158809cf4f3c");
    const TITLEKEY: [u8; 0x10] = hex!("00112233445566778899aabbccddeeff");

    fn test_keys() -> Arc<KeySet> {
        // titlekek_00 doubles as the generation-0 ticket common key.
        let mut keys = format!("titlekek_00 = {}\n", hex::encode(COMMON_KEY));
        // Identity-exponent RSA keypair for OAEP fixtures.
        let mut blob = vec![0u8; 0x220];
        blob[0x10F] = 0x01; // d = 1
        blob[0x110..0x210].fill(0xFF); // n
        blob[0x210..0x214].copy_from_slice(&hex!("00010001"));
        keys.push_str(&format!("eticket_rsa_keypair = {}\n", hex::encode(blob)));
        Arc::new(KeySet::from_reader(Cursor::new(keys)).unwrap())
    }

    /// Builds a raw common ticket for the given rights id.
    pub(crate) fn build_common_ticket(rights_id: [u8; 0x10], key_generation: u8) -> Vec<u8> {
        let sig_type = SignatureType::Rsa2048Sha256;
        let mut raw = vec![0u8; SIGNED_TIK_MAX_SIZE];
        raw[..4].copy_from_slice(&sig_type.raw().to_le_bytes());
        raw[4..0x104].fill(0x51); // signature (unverifiable)

        let base = sig_type.block_size();
        let issuer = b"Root-CA00000003-XS00000020";
        raw[base..base + issuer.len()].copy_from_slice(issuer);

        // Encrypted titlekey in the first 16 block bytes.
        let mut enc = TITLEKEY;
        crate::crypto::aes128_ecb_encrypt_block(&COMMON_KEY, &mut enc);
        raw[base + 0x40..base + 0x50].copy_from_slice(&enc);

        raw[base + 0x140] = 2; // format version
        raw[base + 0x141] = 0; // common
        raw[base + 0x145] = key_generation;
        raw[base + 0x160..base + 0x170].copy_from_slice(&rights_id);
        raw
    }

    fn list_entry(rights_id: [u8; 0x10]) -> Vec<u8> {
        let mut entry = vec![0u8; TIK_LIST_ENTRY_SIZE];
        entry[..0x10].copy_from_slice(&rights_id);
        entry
    }

    fn sentinel_entry() -> Vec<u8> {
        let mut entry = vec![0u8; TIK_LIST_ENTRY_SIZE];
        entry[..0x10].fill(0xFF);
        entry
    }

    fn ticket_save(list: Vec<u8>, db: Vec<u8>) -> SaveFile {
        let image = build_save_image_with_files(
            &[
                FixtureFile {
                    dir: None,
                    name: "ticket_list.bin",
                    content: list,
                },
                FixtureFile {
                    dir: None,
                    name: "ticket.bin",
                    content: db,
                },
            ],
            false,
        );
        SaveFile::open(save_storage(image), None, false).unwrap()
    }

    fn cert_store() -> CertificateStore {
        let ca = build_cert("Root", "CA00000003", 0xC1);
        let xs = build_cert("Root-CA00000003", "XS00000020", 0xC2);
        let image = build_save_image_with_files(
            &[
                FixtureFile {
                    dir: Some("certificate"),
                    name: "CA00000003",
                    content: ca,
                },
                FixtureFile {
                    dir: Some("certificate"),
                    name: "XS00000020",
                    content: xs,
                },
            ],
            false,
        );
        CertificateStore::new(SaveFile::open(save_storage(image), None, false).unwrap())
    }

    fn store_with(
        common: Option<SaveFile>,
        personalized: Option<SaveFile>,
        certs: Option<CertificateStore>,
        es_data: Vec<u8>,
    ) -> TicketStore {
        TicketStore::new(
            common,
            personalized,
            certs,
            Arc::new(StaticMemory::new().with_es_data(es_data)),
            test_keys(),
        )
    }

    #[test]
    fn test_common_ticket_from_nand() {
        let rights_id = [0x10u8; 0x10];
        let mut rid = rights_id;
        rid[0xF] = 0; // generation 0 leaves the low byte clear
        let ticket = build_common_ticket(rid, 0);

        let list = [list_entry(rid), sentinel_entry()].concat();
        let save = ticket_save(list, ticket.clone());
        let mut store = store_with(Some(save), None, None, Vec::new());

        let decoded = store
            .ticket_for(&rid, 0, TicketSource::Nand, None)
            .unwrap();
        assert_eq!(decoded.titlekey_type().unwrap(), TitleKeyType::Common);
        assert_eq!(decoded.dec_titlekey, TITLEKEY);
        assert_eq!(decoded.signed_bytes(), &ticket[..0x2C0]);

        // Unknown rights ids fail cleanly.
        let missing = [0x77u8; 0x10];
        let mut missing_rid = missing;
        missing_rid[0xF] = 0;
        assert!(matches!(
            store.ticket_for(&missing_rid, 0, TicketSource::Nand, None),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_rights_id_generation_invariant() {
        let mut store = store_with(None, None, None, Vec::new());

        // Modern generation must appear in the low byte.
        let mut rid = [0u8; 0x10];
        rid[0xF] = 0x0A;
        assert!(store.ticket_for(&rid, 0x0B, TicketSource::Nand, None).is_err());

        // Old generations must leave it clear.
        let mut rid = [0u8; 0x10];
        rid[0xF] = 0x02;
        assert!(store.ticket_for(&rid, 2, TicketSource::Nand, None).is_err());
    }

    #[test]
    fn test_tampered_common_ticket_repair() {
        let mut rid = [0x21u8; 0x10];
        rid[0xF] = 0;
        let mut ticket = build_common_ticket(rid, 0);

        // Scramble the fields old tools used to clobber.
        let base = 0x140;
        ticket[4..0x104].fill(0x00); // cleared signature
        ticket[base + 0x145] = 0; // wiped key generation
        ticket[base + 0x170..base + 0x174].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        ticket[base + 0x150..base + 0x158].copy_from_slice(&55u64.to_le_bytes());

        let list = [list_entry(rid), sentinel_entry()].concat();
        let save = ticket_save(list, ticket);
        let mut store = store_with(Some(save), None, Some(cert_store()), Vec::new());

        let repaired = store
            .ticket_for(&rid, 0, TicketSource::Nand, None)
            .unwrap();

        // Repair leaves an exactly 0x2C0-byte signed common ticket with
        // cleared personalization and a 0xFF signature.
        assert_eq!(repaired.size, 0x2C0);
        assert_eq!(repaired.account_id(), 0);
        assert_eq!(repaired.ticket_id(), 0);
        assert_eq!(repaired.sect_hdr_offset(), 0x2C0);
        assert!(repaired.data[4..0x104].iter().all(|&b| b == 0xFF));
        assert_eq!(repaired.dec_titlekey, TITLEKEY);
    }

    #[test]
    fn test_volatile_ticket_decryption() {
        let mut rid = [0x31u8; 0x10];
        rid[0xF] = 0;
        let plain = build_common_ticket(rid, 0);

        // Encrypt the record with a key hidden in the ES image; the
        // record sits at ticket.bin offset 0, so the counter is just the
        // zero prefix.
        let es_key = hex!("a0a1a2a3a4a5a6a7a8a9aaabacadaeaf");
        let mut encrypted = plain.clone();
        crate::crypto::aes128_ctr_crypt(&es_key, &[0u8; 0x10], &mut encrypted);

        let mut es_data = vec![0u8; 0x200];
        // First a decoy pair with an even second index, then the real
        // pair at an odd index boundary.
        es_data[0x80..0x84].copy_from_slice(&0u32.to_le_bytes());
        es_data[0x84..0x94].copy_from_slice(&es_key);
        es_data[0xA4..0xA8].copy_from_slice(&1u32.to_le_bytes());
        es_data[0xA8..0xB8].copy_from_slice(&es_key);

        let list = [list_entry(rid), sentinel_entry()].concat();
        let save = ticket_save(list, encrypted);
        let mut store = store_with(Some(save), None, None, es_data);

        let decoded = store
            .ticket_for(&rid, 0, TicketSource::Nand, None)
            .unwrap();
        assert!(decoded.issuer().starts_with("Root-"));
        assert_eq!(decoded.dec_titlekey, TITLEKEY);
    }

    #[test]
    fn test_personalized_conversion() {
        let mut rid = [0x41u8; 0x10];
        rid[0xF] = 0;

        // Personalized ticket: OAEP-wrapped titlekey with the identity
        // exponent keypair (d = 1 turns modexp into a copy).
        let mut raw = build_common_ticket(rid, 0);
        let base = 0x140;
        raw[base + 0x141] = 1; // personalized
        let issuer = b"Root-CA00000003-XS00000021\0";
        raw[base..base + 0x40].fill(0);
        raw[base..base + issuer.len()].copy_from_slice(issuer);

        let mut enc = TITLEKEY;
        crate::crypto::aes128_ecb_encrypt_block(&COMMON_KEY, &mut enc);
        let label_hash = crate::crypto::sha256(b"");
        let wrapped = oaep_wrap(&label_hash, &enc);
        raw[base + 0x40..base + 0x140].copy_from_slice(&wrapped);
        raw[base + 0x170..base + 0x174].copy_from_slice(&7u32.to_le_bytes()); // account id

        let list = [list_entry(rid), sentinel_entry()].concat();
        let save = ticket_save(list, raw);
        let mut store = store_with(None, Some(save), Some(cert_store()), Vec::new());

        let mut ticket = store
            .ticket_for(&rid, 0, TicketSource::Nand, None)
            .unwrap();
        assert_eq!(ticket.titlekey_type().unwrap(), TitleKeyType::Personalized);
        assert_eq!(ticket.dec_titlekey, TITLEKEY);

        let chain = store.convert_personalized_to_common(&mut ticket).unwrap();
        assert!(!chain.is_empty());
        assert_eq!(ticket.issuer(), "Root-CA00000003-XS00000020");
        assert_eq!(ticket.titlekey_type().unwrap(), TitleKeyType::Common);
        assert_eq!(ticket.size, 0x2C0);
        assert_eq!(ticket.account_id(), 0);
        assert_eq!(&ticket.titlekey_block()[..0x10], &ticket.enc_titlekey);
        assert!(ticket.data[0x2C0..].iter().all(|&b| b == 0));

        // Converting an already-common ticket is rejected.
        assert!(store.convert_personalized_to_common(&mut ticket).is_err());
    }

    /// Forward OAEP encoding used with the identity-exponent keypair.
    fn oaep_wrap(label_hash: &[u8; 0x20], payload: &[u8]) -> [u8; 0x100] {
        use sha2::{Digest, Sha256};

        let mgf1 = |seed: &[u8], len: usize| -> Vec<u8> {
            let mut mask = Vec::new();
            let mut counter = 0u32;
            while mask.len() < len {
                let mut hasher = Sha256::new();
                hasher.update(seed);
                hasher.update(counter.to_be_bytes());
                mask.extend_from_slice(&hasher.finalize());
                counter += 1;
            }
            mask.truncate(len);
            mask
        };

        let seed = [0x5Au8; 0x20];
        let mut db = vec![0u8; 0x100 - 1 - 0x20];
        db[..0x20].copy_from_slice(label_hash);
        let sep = db.len() - payload.len() - 1;
        db[sep] = 0x01;
        db[sep + 1..].copy_from_slice(payload);

        let db_mask = mgf1(&seed, db.len());
        let masked_db: Vec<u8> = db.iter().zip(db_mask.iter()).map(|(a, b)| a ^ b).collect();
        let seed_mask = mgf1(&masked_db, 0x20);
        let masked_seed: Vec<u8> = seed
            .iter()
            .zip(seed_mask.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        let mut em = [0u8; 0x100];
        em[1..0x21].copy_from_slice(&masked_seed);
        em[0x21..].copy_from_slice(&masked_db);
        em
    }

    #[test]
    fn test_gamecard_ticket_lookup() {
        use crate::gamecard::hfs::{HashFs, HfsPartitionType, tests::build_partition};

        let mut rid = [0x55u8; 0x10];
        rid[0xF] = 0;
        let ticket = build_common_ticket(rid, 0);
        let filename = format!("{}.tik", hex::encode(rid));

        let files: [(&str, &[u8]); 1] = [(&filename, &ticket)];
        let (raw, hash, hash_size) = build_partition(&files, None);
        let storage: crate::io::SharedStorage = Arc::new(Mutex::new(MemoryStorage::new(raw)));
        let mut secure = HashFs::open(
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

        let mut store = store_with(None, None, None, Vec::new());
        let decoded = store
            .ticket_for(&rid, 0, TicketSource::Gamecard, Some(&mut secure))
            .unwrap();
        assert_eq!(decoded.dec_titlekey, TITLEKEY);
    }
}
