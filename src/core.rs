//! The crate's pull-style facade.
//!
//! A [`Core`] owns the keyset, the gamecard device, the ES stores and
//! the title index, and hands out seekable handles over card images,
//! NCAs and RomFS trees. All content flows through `read`-shaped calls;
//! transports and writers live outside the crate.

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::crypto::KeySet;
use crate::error::{Error, Result};
use crate::es::{CertificateStore, Ticket, TicketSource, TicketStore};
use crate::gamecard::hfs::HfsPartitionType;
use crate::gamecard::{
    CardInterface, GameCardDevice, GameCardOptions, GameCardStatus, StreamKind,
};
use crate::io::{ReadSeek, ReaderStorage, SharedStorage, StorageReader, SubStorage, VirtualStorage};
use crate::memory::SystemMemoryProvider;
use crate::nca::section::NcaFsSection;
use crate::nca::storage::NcaStorage;
use crate::nca::{FsSectionType, Nca};
use crate::romfs::{DirListEntry, RomFs, RomFsFileEntry};
use crate::save::SaveFile;
use crate::title::{
    ContentMetaProvider, ContentRecordType, ContentStorage, StorageFilter, TitleIndex,
    TitleMetaRecord,
};

/// How much integrity checking the core performs on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyMode {
    Off,
    /// Verify the ES saves only.
    SaveOnly,
    /// Verify saves and sweep NCA hash trees on section open.
    Full,
}

/// Raw byte sources for the ES system saves.
#[derive(Default)]
pub struct SaveSources {
    pub es_cert: Option<SharedStorage>,
    pub es_common_ticket: Option<SharedStorage>,
    pub es_personalized_ticket: Option<SharedStorage>,
}

/// Opens installed content by id (NAND/SD contents live outside the
/// gamecard image).
pub trait ContentReader: Send + Sync {
    fn open_content(
        &self,
        storage: ContentStorage,
        content_id: &[u8; 0x10],
    ) -> Result<Box<dyn ReadSeek + Send>>;
}

pub struct CoreOptions {
    pub keys: KeySet,
    pub verify_mode: VerifyMode,
    pub card: Option<Box<dyn CardInterface>>,
    pub card_options: GameCardOptions,
    pub memory: Arc<dyn SystemMemoryProvider>,
    pub saves: SaveSources,
    pub meta: Option<Box<dyn ContentMetaProvider>>,
    pub content: Option<Box<dyn ContentReader>>,
}

/// An opened NCA.
pub struct NcaHandle {
    pub nca: Nca,
    storage_kind: ContentStorage,
}

/// A composed FS-section storage stack.
pub struct FsSectionHandle {
    storage: NcaStorage,
}

impl FsSectionHandle {
    pub fn section_type(&self) -> FsSectionType {
        self.storage.section_type()
    }

    pub fn storage(&mut self) -> &mut NcaStorage {
        &mut self.storage
    }
}

/// An opened (possibly patched) RomFS.
pub struct RomFsHandle {
    romfs: RomFs,
    patched: bool,
}

pub struct Core {
    keys: Arc<KeySet>,
    verify_mode: VerifyMode,
    device: Option<GameCardDevice>,
    tickets: TicketStore,
    titles: Option<TitleIndex>,
    meta: Option<Box<dyn ContentMetaProvider>>,
    content: Option<Box<dyn ContentReader>>,
}

impl Core {
    /// Initializes the core: loads saves, starts the gamecard detection
    /// thread, and builds the title index.
    pub fn init(opts: CoreOptions) -> Result<Self> {
        let keys = Arc::new(opts.keys);
        let verify_saves = matches!(opts.verify_mode, VerifyMode::SaveOnly | VerifyMode::Full);
        let mac_key = keys.save_mac_key().ok();

        let open_save = |source: Option<SharedStorage>| -> Result<Option<SaveFile>> {
            source
                .map(|storage| SaveFile::open(storage, mac_key, verify_saves))
                .transpose()
        };

        let certs = open_save(opts.saves.es_cert)?.map(CertificateStore::new);
        let common_save = open_save(opts.saves.es_common_ticket)?;
        let personalized_save = open_save(opts.saves.es_personalized_ticket)?;

        let tickets = TicketStore::new(
            common_save,
            personalized_save,
            certs,
            Arc::clone(&opts.memory),
            Arc::clone(&keys),
        );

        let device = opts.card.map(|card| {
            GameCardDevice::start(
                card,
                Arc::clone(&keys),
                Arc::clone(&opts.memory),
                opts.card_options,
            )
        });

        let titles = opts
            .meta
            .as_deref()
            .map(TitleIndex::build)
            .transpose()?;

        Ok(Self {
            keys,
            verify_mode: opts.verify_mode,
            device,
            tickets,
            titles,
            meta: opts.meta,
            content: opts.content,
        })
    }

    fn device(&self) -> Result<&GameCardDevice> {
        self.device.as_ref().ok_or_else(|| {
            Error::InvalidState("no gamecard interface configured".to_string())
        })
    }

    /// Current gamecard slot status.
    pub fn poll_gamecard(&self) -> GameCardStatus {
        self.device
            .as_ref()
            .map(|d| d.status())
            .unwrap_or(GameCardStatus::NotInserted)
    }

    /// Waits for a status transition, rebuilding the title index when
    /// one happens.
    pub fn wait_gamecard_change(&mut self, timeout: Duration) -> Result<GameCardStatus> {
        let status = self.device()?.wait_status_change(timeout);
        self.refresh_titles()?;
        Ok(status)
    }

    /// Re-queries the content-meta provider.
    pub fn refresh_titles(&mut self) -> Result<()> {
        if let Some(meta) = self.meta.as_deref() {
            self.titles = Some(TitleIndex::build(meta)?);
        }
        Ok(())
    }

    /// Opens a seekable stream over gamecard content.
    pub fn open_gamecard_stream(
        &self,
        kind: StreamKind,
    ) -> Result<StorageReader<Box<dyn VirtualStorage>>> {
        self.device()?.open_stream(kind)
    }

    /// Streams gamecard content into a writer, reporting progress.
    ///
    /// The callback receives `(transferred, total)` at every chunk
    /// boundary; returning `true` aborts the dump.
    pub fn dump_stream(
        &self,
        kind: StreamKind,
        writer: &mut dyn Write,
        mut progress: Option<&mut dyn FnMut(u64, u64) -> bool>,
    ) -> Result<u64> {
        use std::io::Read;

        let mut stream = self.open_gamecard_stream(kind)?;
        let mut buffer = vec![0u8; 0x100000];
        let total = {
            use std::io::Seek;
            let end = stream.seek(std::io::SeekFrom::End(0))?;
            stream.seek(std::io::SeekFrom::Start(0))?;
            end
        };

        let mut transferred = 0u64;
        loop {
            let read = stream.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            writer.write_all(&buffer[..read])?;
            transferred += read as u64;

            if let Some(progress) = progress.as_deref_mut()
                && progress(transferred, total)
            {
                return Err(Error::Aborted);
            }
        }
        Ok(transferred)
    }

    /// Titles currently known to the content-meta database.
    pub fn enumerate_titles(&self, filter: StorageFilter) -> Result<Vec<TitleMetaRecord>> {
        let titles = self.titles.as_ref().ok_or_else(|| {
            Error::InvalidState("no content meta provider configured".to_string())
        })?;
        Ok(titles.records(filter).into_iter().cloned().collect())
    }

    pub fn titles(&self) -> Option<&TitleIndex> {
        self.titles.as_ref()
    }

    fn content_storage(&self, record: &TitleMetaRecord, content_id: &[u8; 0x10]) -> Result<SharedStorage> {
        match record.storage {
            ContentStorage::Gamecard => {
                let name = format!("{}.nca", hex::encode(content_id));
                let device = self.device()?;
                let (offset, size) = device.hash_fs_entry_info(HfsPartitionType::Secure, &name)?;
                let image = device.image_storage()?;
                Ok(Arc::new(Mutex::new(SubStorage::new(image, offset, size))))
            }
            storage => {
                use std::io::Seek;

                let mut reader = self
                    .content
                    .as_ref()
                    .ok_or_else(|| {
                        Error::InvalidState("no content reader configured".to_string())
                    })?
                    .open_content(storage, content_id)?;
                let length = reader.seek(std::io::SeekFrom::End(0))?;
                Ok(Arc::new(Mutex::new(ReaderStorage::new(reader, 0, length))))
            }
        }
    }

    /// Opens an NCA belonging to a title, resolving its titlekey through
    /// the ticket subsystem when needed.
    pub fn open_nca(
        &mut self,
        record: &TitleMetaRecord,
        content_type: ContentRecordType,
        id_offset: u8,
    ) -> Result<NcaHandle> {
        let content = record
            .contents
            .iter()
            .find(|c| c.content_type == content_type && c.id_offset == id_offset)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{content_type:?} content (id offset {id_offset}) in {:016X}",
                    record.key.id
                ))
            })?;

        let storage = self.content_storage(record, &content.content_id)?;
        let nca = Nca::from_storage(storage.clone(), &self.keys, None)?;

        let nca = if nca.has_rights_id() && !nca.has_valid_keys() {
            let rights_id = nca.header.rights_id;
            let key_generation = nca.header.effective_key_generation();
            let source = match record.storage {
                ContentStorage::Gamecard => TicketSource::Gamecard,
                _ => TicketSource::Nand,
            };
            let ticket = self.ticket_for(&rights_id, key_generation, source)?;
            Nca::from_storage(storage, &self.keys, Some(ticket.dec_titlekey))?
        } else {
            nca
        };

        Ok(NcaHandle {
            nca,
            storage_kind: record.storage,
        })
    }

    /// Composes one FS section of an NCA, wiring the base NCA's RomFS
    /// section for patch sections.
    pub fn open_fs_section(
        &mut self,
        nca: &NcaHandle,
        section_index: usize,
        base: Option<(&NcaHandle, usize)>,
    ) -> Result<FsSectionHandle> {
        let mut section = nca.nca.fs_section(section_index)?;

        if self.verify_mode == VerifyMode::Full {
            self.sweep_section_hashes(&mut section)?;
        }

        let storage = if section.section_type == FsSectionType::PatchRomFs {
            match base {
                Some((base_nca, base_index)) => {
                    let base_section = base_nca.nca.fs_section(base_index)?;
                    let base_storage = NcaStorage::open(base_section, None)?;
                    NcaStorage::open(section, Some(&base_storage))?
                }
                // A patch whose base program carries no RomFS at all:
                // the original substorage reads as zeroes.
                None => {
                    tracing::warn!("opening patch section without a base RomFS");
                    NcaStorage::open_with_missing_base(section)?
                }
            }
        } else {
            NcaStorage::open(section, None)?
        };

        Ok(FsSectionHandle { storage })
    }

    /// Verifies every hash-target block of a section against its hash
    /// tree.
    fn sweep_section_hashes(&self, section: &mut NcaFsSection) -> Result<()> {
        if section.section_type == FsSectionType::PatchRomFs {
            // Patch payloads are only meaningful through the composed
            // storage; their own tree covers the patched image.
            return Ok(());
        }
        let (_, size) = section.hash_target_extents();
        let mut buffer = vec![0u8; 0x4000];
        let mut offset = 0u64;
        while offset < size {
            let chunk = buffer.len().min((size - offset) as usize);
            match section.read_hash_target_verified(offset, &mut buffer[..chunk]) {
                Ok(()) => {}
                // Sections without hash layers have nothing to sweep.
                Err(Error::UnsupportedVariant(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
            offset += chunk as u64;
        }
        Ok(())
    }

    /// Opens the RomFS inside a composed section.
    pub fn open_romfs(&mut self, section: FsSectionHandle) -> Result<RomFsHandle> {
        let patched = section.storage.section_type() == FsSectionType::PatchRomFs;
        Ok(RomFsHandle {
            romfs: RomFs::open(section.storage)?,
            patched,
        })
    }

    /// Lists a RomFS directory.
    pub fn romfs_list(
        &mut self,
        handle: &mut RomFsHandle,
        path: &str,
    ) -> Result<Vec<DirListEntry>> {
        handle.romfs.list_dir(path)
    }

    /// Looks up a RomFS file entry by path.
    pub fn romfs_entry(
        &mut self,
        handle: &mut RomFsHandle,
        path: &str,
    ) -> Result<RomFsFileEntry> {
        handle.romfs.file_by_path(path)
    }

    /// Reads RomFS file content by path.
    pub fn romfs_read(
        &mut self,
        handle: &mut RomFsHandle,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let entry = handle.romfs.file_by_path(path)?;
        handle.romfs.read_file(&entry, offset, buf)
    }

    /// Retrieves and decodes a ticket for a rights id.
    pub fn ticket_for(
        &mut self,
        rights_id: &[u8; 0x10],
        key_generation: u8,
        source: TicketSource,
    ) -> Result<Ticket> {
        match source {
            TicketSource::Gamecard => {
                let mut secure = self.device()?.hash_fs(HfsPartitionType::Secure)?;
                self.tickets
                    .ticket_for(rights_id, key_generation, source, Some(&mut secure))
            }
            TicketSource::Nand => self.tickets.ticket_for(rights_id, key_generation, source, None),
        }
    }

    /// Raw certificate chain for a signature issuer.
    pub fn cert_chain_for(&mut self, issuer: &str) -> Result<Vec<u8>> {
        let certs = self.tickets.certificates().ok_or_else(|| {
            Error::InvalidState("no certificate save configured".to_string())
        })?;
        Ok(certs.chain_for_issuer(issuer)?.raw())
    }

    pub fn tickets(&mut self) -> &mut TicketStore {
        &mut self.tickets
    }

    pub fn keys(&self) -> &KeySet {
        &self.keys
    }
}

impl NcaHandle {
    pub fn storage_kind(&self) -> ContentStorage {
        self.storage_kind
    }
}

impl RomFsHandle {
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    pub fn romfs(&mut self) -> &mut RomFs {
        &mut self.romfs
    }
}
