//! Gamecard device access.
//!
//! A [`GameCardDevice`] tracks insertion state on a background thread and
//! exposes the inserted card as a single logical byte range spanning the
//! normal and secure storage areas, plus parsed header data and the Hash
//! FS partitions. The OS-facing side (insertion events, storage handles)
//! is abstracted behind [`CardInterface`] so the whole state machine can
//! be driven from tests.

pub mod header;
pub mod hfs;

use std::io::{Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::crypto::KeySet;
use crate::error::{Error, HeaderKind, NotReadyKind, Result};
use crate::io::{MemoryStorage, ReadSeek, SharedStorage, StorageReader, VirtualStorage, align_down, align_up};
use crate::memory::{MemorySegment, SystemMemoryProvider, SystemProgram};

use header::{
    CardFlag, CardInfo, CompatibilityType, GAMECARD_CERTIFICATE_OFFSET,
    GAMECARD_CERTIFICATE_SIZE, GAMECARD_HEADER2_CERT_OFFSET, GAMECARD_HEADER2_OFFSET,
    GAMECARD_HEADER_SIZE, GAMECARD_PAGE_SIZE, GameCardHeader, GameCardHeader2,
    GameCardHeader2Certificate, LafwBlob, Version,
};
use hfs::{HashFs, HfsPartitionType};

use binrw::BinReaderExt;

const READ_BUFFER_SIZE: usize = 0x800000;
const HANDLE_RETRY_COUNT: u32 = 10;

const INITIAL_DATA_SIZE: usize = 0x200;
const SECURITY_INFO_SIZE: usize = 0x800;
const KEY_AREA_SIZE: usize = 0x1000;

/// Gamecard slot status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameCardStatus {
    /// No gamecard is inserted.
    NotInserted,
    /// A gamecard was just inserted and is being settled/probed.
    Processing,
    /// The running firmware blocks gamecard access entirely.
    InsertionPatchBlocked,
    /// The card needs a newer Lotus ASIC firmware than the console has.
    /// Normal-area reads still work.
    LafwUpdateRequired,
    /// Insertion detected but information could not be loaded.
    InsertedInfoNotLoaded,
    /// Card fully probed; reads and partition access are available.
    InsertedInfoLoaded,
}

/// Which physical storage area a handle maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageArea {
    Normal,
    Secure,
}

/// Host-side gamecard slot integration.
pub trait CardInterface: Send + Sync + 'static {
    /// Polls the insertion state.
    fn is_inserted(&self) -> bool;

    /// Opens a storage-area handle. Fails while the OS is still probing
    /// the card, or permanently when gamecard access is patched out.
    fn open_area(&self, area: StorageArea) -> std::io::Result<Box<dyn ReadSeek + Send>>;

    /// Whether this console is a development unit.
    fn is_dev_unit(&self) -> bool {
        false
    }
}

/// Timing knobs for the detection thread.
#[derive(Debug, Clone)]
pub struct GameCardOptions {
    /// Delay between insertion and the first card access.
    pub settle_delay: Duration,
    /// Insertion polling interval.
    pub poll_interval: Duration,
    /// Backoff between storage-handle retries.
    pub handle_retry_backoff: Duration,
}

impl Default for GameCardOptions {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_secs(3),
            poll_interval: Duration::from_millis(50),
            handle_retry_backoff: Duration::from_millis(100),
        }
    }
}

/// Metadata kept for one Hash FS partition discovered at load time.
#[derive(Debug, Clone)]
struct HfsPartitionMeta {
    partition_type: HfsPartitionType,
    offset: u64,
    size: u64,
    hash: [u8; 0x20],
    hash_target_offset: u64,
    hash_target_size: u32,
    salt: Option<u8>,
}

#[derive(Default)]
struct DeviceState {
    status: Option<GameCardStatus>,
    generation: u64,
    header: Option<GameCardHeader>,
    card_info: Option<CardInfo>,
    lafw_version: u64,
    normal_size: u64,
    secure_size: u64,
    total_size: u64,
    capacity: u64,
    partitions: Vec<HfsPartitionMeta>,
    open_area: Option<(StorageArea, Box<dyn ReadSeek + Send>)>,
    read_buffer: Vec<u8>,
}

impl DeviceState {
    fn status(&self) -> GameCardStatus {
        self.status.unwrap_or(GameCardStatus::NotInserted)
    }

    fn reset(&mut self) {
        self.header = None;
        self.card_info = None;
        self.normal_size = 0;
        self.secure_size = 0;
        self.total_size = 0;
        self.capacity = 0;
        self.partitions.clear();
        self.open_area = None;
    }
}

struct DeviceShared {
    card: Box<dyn CardInterface>,
    keys: Arc<KeySet>,
    memory: Arc<dyn SystemMemoryProvider>,
    options: GameCardOptions,
    state: Mutex<DeviceState>,
    status_changed: Condvar,
}

/// The gamecard device, running its own detection thread.
pub struct GameCardDevice {
    shared: Arc<DeviceShared>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl GameCardDevice {
    /// Creates the device and starts the background detection thread.
    pub fn start(
        card: Box<dyn CardInterface>,
        keys: Arc<KeySet>,
        memory: Arc<dyn SystemMemoryProvider>,
        options: GameCardOptions,
    ) -> Self {
        let shared = Arc::new(DeviceShared {
            card,
            keys,
            memory,
            options,
            state: Mutex::new(DeviceState::default()),
            status_changed: Condvar::new(),
        });

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let shared = Arc::clone(&shared);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || detection_thread(shared, stop))
        };

        Self {
            shared,
            stop,
            thread: Some(thread),
        }
    }

    /// Current slot status.
    pub fn status(&self) -> GameCardStatus {
        self.shared.state.lock().unwrap().status()
    }

    /// Blocks until the status changes or the timeout elapses. Returns the
    /// status observed on wakeup.
    pub fn wait_status_change(&self, timeout: Duration) -> GameCardStatus {
        let state = self.shared.state.lock().unwrap();
        let generation = state.generation;
        let (state, _) = self
            .shared
            .status_changed
            .wait_timeout_while(state, timeout, |s| s.generation == generation)
            .unwrap();
        state.status()
    }

    fn loaded_state<T>(&self, f: impl FnOnce(&DeviceState) -> T) -> Result<T> {
        let state = self.shared.state.lock().unwrap();
        match state.status() {
            GameCardStatus::InsertedInfoLoaded => Ok(f(&state)),
            other => Err(status_error(other)),
        }
    }

    /// Parsed gamecard header.
    pub fn header(&self) -> Result<GameCardHeader> {
        self.loaded_state(|s| s.header.clone().unwrap())
    }

    /// Decrypted CardInfo area.
    pub fn plaintext_card_info(&self) -> Result<CardInfo> {
        self.loaded_state(|s| s.card_info.clone().unwrap())
    }

    /// Total logical image size (normal + secure areas).
    pub fn total_size(&self) -> Result<u64> {
        self.loaded_state(|s| s.total_size)
    }

    /// Image size with the secure area trimmed to its valid end.
    pub fn trimmed_size(&self) -> Result<u64> {
        self.loaded_state(|s| s.header.as_ref().unwrap().trimmed_size())
    }

    /// Card ROM capacity per the header rom_size byte.
    pub fn rom_capacity(&self) -> Result<u64> {
        self.loaded_state(|s| s.capacity)
    }

    /// Bundled system-update version from the CardInfo area.
    pub fn bundled_update_version(&self) -> Result<Version> {
        self.loaded_state(|s| s.card_info.as_ref().unwrap().bundled_update_version())
    }

    /// Reads from the logical card image, bridging the normal/secure
    /// boundary transparently.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut state = self.shared.state.lock().unwrap();
        match state.status() {
            GameCardStatus::InsertedInfoLoaded => {}
            other => return Err(status_error(other)),
        }
        read_storage_area(&self.shared, &mut state, offset, buf)
    }

    /// The gamecard certificate at its fixed page offset.
    pub fn certificate(&self) -> Result<[u8; GAMECARD_CERTIFICATE_SIZE]> {
        let mut cert = [0u8; GAMECARD_CERTIFICATE_SIZE];
        self.read(GAMECARD_CERTIFICATE_OFFSET, &mut cert)?;
        Ok(cert)
    }

    /// LAFW blob located in FS program memory.
    pub fn lafw_blob(&self) -> Result<LafwBlob> {
        let image = self
            .shared
            .memory
            .read_program_memory(SystemProgram::Fs, MemorySegment::Data)?;
        LafwBlob::find_in_memory(&image, self.shared.card.is_dev_unit())
    }

    /// Opens the Hash FS partition of the given type, re-verifying its
    /// header against the hash recorded at load time.
    pub fn hash_fs(&self, partition_type: HfsPartitionType) -> Result<HashFs> {
        let meta = self.loaded_state(|s| {
            s.partitions
                .iter()
                .find(|p| p.partition_type == partition_type)
                .cloned()
        })?;
        let meta = meta.ok_or_else(|| {
            Error::NotFound(format!("hash FS partition \"{}\"", partition_type.name()))
        })?;

        HashFs::open(
            self.image_storage()?,
            meta.partition_type,
            meta.offset,
            meta.size,
            Some(&meta.hash),
            meta.hash_target_offset,
            meta.hash_target_size,
            meta.salt,
        )
    }

    /// Offset + size of a named entry inside a Hash FS partition, absolute
    /// within the card image.
    pub fn hash_fs_entry_info(
        &self,
        partition_type: HfsPartitionType,
        name: &str,
    ) -> Result<(u64, u64)> {
        self.hash_fs(partition_type)?.entry_info(name)
    }

    /// The whole logical image as a shareable storage.
    pub fn image_storage(&self) -> Result<SharedStorage> {
        let total = self.total_size()?;
        Ok(Arc::new(Mutex::new(CardImageStorage {
            shared: Arc::clone(&self.shared),
            length: total,
        })))
    }

    /// Locates the security-information block in FS program memory using
    /// the package id and initial-data hash from the header.
    pub fn security_information(&self) -> Result<Vec<u8>> {
        let header = self.header()?;
        let image = self
            .shared
            .memory
            .read_program_memory(SystemProgram::Fs, MemorySegment::Full)?;

        let package_id = header.package_id.to_le_bytes();
        let mut offset = 0usize;
        while offset + INITIAL_DATA_SIZE <= image.len() {
            if image[offset..offset + 8] == package_id
                && crate::crypto::sha256(&image[offset..offset + INITIAL_DATA_SIZE])
                    == header.initial_data_hash
            {
                // The initial data block sits at the end of the security
                // information area.
                let start = (offset + INITIAL_DATA_SIZE).checked_sub(SECURITY_INFO_SIZE);
                if let Some(start) = start {
                    return Ok(image[start..start + SECURITY_INFO_SIZE].to_vec());
                }
            }
            offset += 1;
        }

        Err(Error::NotFound(
            "gamecard security information in FS program memory".to_string(),
        ))
    }

    /// Assembles the 0x1000-byte key area: initial data followed by the
    /// titlekey area and its encryption block (zero on retail cards).
    pub fn key_area(&self) -> Result<Vec<u8>> {
        let security_info = self.security_information()?;
        let mut area = vec![0u8; KEY_AREA_SIZE];
        area[..INITIAL_DATA_SIZE]
            .copy_from_slice(&security_info[SECURITY_INFO_SIZE - INITIAL_DATA_SIZE..]);
        Ok(area)
    }

    /// Opens a pull-style stream over card content.
    pub fn open_stream(&self, kind: StreamKind) -> Result<StorageReader<Box<dyn VirtualStorage>>> {
        let storage: Box<dyn VirtualStorage> = match kind {
            StreamKind::FullXci => Box::new(CardImageStorage {
                shared: Arc::clone(&self.shared),
                length: self.total_size()?,
            }),
            StreamKind::TrimmedXci => Box::new(CardImageStorage {
                shared: Arc::clone(&self.shared),
                length: self.trimmed_size()?,
            }),
            StreamKind::KeyAreaOnly => Box::new(MemoryStorage::new(self.key_area()?)),
            StreamKind::CertificateOnly => {
                Box::new(MemoryStorage::new(self.certificate()?.to_vec()))
            }
            StreamKind::HfsPartition { partition, entry } => {
                let hfs = self.hash_fs(partition)?;
                let (offset, length) = match entry {
                    Some(name) => hfs.entry_info(&name)?,
                    None => (hfs.offset(), hfs.size()),
                };
                Box::new(WindowStorage {
                    inner: CardImageStorage {
                        shared: Arc::clone(&self.shared),
                        length: self.total_size()?,
                    },
                    base: offset,
                    length,
                })
            }
        };
        Ok(StorageReader::new(storage))
    }
}

impl Drop for GameCardDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Stream kinds exposed to consumers.
#[derive(Debug, Clone)]
pub enum StreamKind {
    FullXci,
    TrimmedXci,
    KeyAreaOnly,
    CertificateOnly,
    HfsPartition {
        partition: HfsPartitionType,
        entry: Option<String>,
    },
}

/// The bridged card image as a `VirtualStorage`.
struct CardImageStorage {
    shared: Arc<DeviceShared>,
    length: u64,
}

impl VirtualStorage for CardImageStorage {
    fn len(&self) -> u64 {
        self.length
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        if offset + buf.len() as u64 > self.length {
            return Err(Error::InvalidArgument(format!(
                "card image read out of bounds (offset 0x{offset:X})"
            )));
        }
        let mut state = self.shared.state.lock().unwrap();
        match state.status() {
            GameCardStatus::InsertedInfoLoaded => {}
            other => return Err(status_error(other)),
        }
        read_storage_area(&self.shared, &mut state, offset, buf)
    }
}

/// A fixed window into another storage.
struct WindowStorage {
    inner: CardImageStorage,
    base: u64,
    length: u64,
}

impl VirtualStorage for WindowStorage {
    fn len(&self) -> u64 {
        self.length
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.length {
            return Err(Error::InvalidArgument(
                "window read out of bounds".to_string(),
            ));
        }
        self.inner.read_at(self.base + offset, buf)
    }
}

fn status_error(status: GameCardStatus) -> Error {
    match status {
        GameCardStatus::NotInserted => Error::GamecardNotReady(NotReadyKind::NotInserted),
        GameCardStatus::Processing => Error::GamecardNotReady(NotReadyKind::Processing),
        GameCardStatus::InsertionPatchBlocked => Error::GamecardNotReady(NotReadyKind::NoGcPatch),
        GameCardStatus::LafwUpdateRequired => Error::GamecardNotReady(NotReadyKind::LafwRequired),
        GameCardStatus::InsertedInfoNotLoaded => {
            Error::InvalidState("gamecard information could not be loaded".to_string())
        }
        GameCardStatus::InsertedInfoLoaded => unreachable!(),
    }
}

fn detection_thread(shared: Arc<DeviceShared>, stop: Arc<AtomicBool>) {
    let poll = shared.options.poll_interval;
    let mut last_inserted: Option<bool> = None;

    while !stop.load(Ordering::SeqCst) {
        let inserted = shared.card.is_inserted();
        if last_inserted == Some(inserted) {
            std::thread::sleep(poll);
            continue;
        }
        last_inserted = Some(inserted);

        {
            let mut state = shared.state.lock().unwrap();
            state.reset();
            set_status(
                &shared,
                &mut state,
                if inserted {
                    GameCardStatus::Processing
                } else {
                    GameCardStatus::NotInserted
                },
            );
        }

        if !inserted {
            continue;
        }

        // Let the OS services finish probing the freshly inserted card,
        // bailing out early if it gets pulled again.
        let settle_start = Instant::now();
        let mut still_inserted = true;
        while settle_start.elapsed() < shared.options.settle_delay {
            if stop.load(Ordering::SeqCst) {
                return;
            }
            std::thread::sleep(poll);
            still_inserted = shared.card.is_inserted();
            if !still_inserted {
                break;
            }
        }

        if !still_inserted {
            last_inserted = Some(false);
            let mut state = shared.state.lock().unwrap();
            state.reset();
            set_status(&shared, &mut state, GameCardStatus::NotInserted);
            continue;
        }

        let mut state = shared.state.lock().unwrap();
        load_info(&shared, &mut state);
    }
}

fn set_status(shared: &DeviceShared, state: &mut DeviceState, status: GameCardStatus) {
    if state.status != Some(status) {
        tracing::debug!(?status, "gamecard status change");
    }
    state.status = Some(status);
    state.generation += 1;
    shared.status_changed.notify_all();
}

/// Opens a storage-area handle with retries.
///
/// A persistent failure on the normal area while processing means the
/// running firmware blocks gamecard reads altogether.
fn open_area_handle(
    shared: &DeviceShared,
    state: &mut DeviceState,
    area: StorageArea,
) -> Result<Box<dyn ReadSeek + Send>> {
    let mut last_err: Option<std::io::Error> = None;
    for attempt in 0..HANDLE_RETRY_COUNT {
        if attempt > 0 {
            std::thread::sleep(shared.options.handle_retry_backoff);
        }
        match shared.card.open_area(area) {
            Ok(handle) => return Ok(handle),
            Err(e) => {
                tracing::debug!(?area, attempt, error = %e, "storage handle retry");
                last_err = Some(e);
            }
        }
    }

    if state.status() == GameCardStatus::Processing && area == StorageArea::Normal {
        set_status(shared, state, GameCardStatus::InsertionPatchBlocked);
        return Err(Error::GamecardNotReady(NotReadyKind::NoGcPatch));
    }
    Err(Error::Io(last_err.unwrap_or_else(|| {
        std::io::Error::other("storage handle unavailable")
    })))
}

fn cached_area_handle<'a>(
    shared: &DeviceShared,
    state: &'a mut DeviceState,
    area: StorageArea,
) -> Result<&'a mut Box<dyn ReadSeek + Send>> {
    let reopen = !matches!(&state.open_area, Some((current, _)) if *current == area);
    if reopen {
        let handle = open_area_handle(shared, state, area)?;
        state.open_area = Some((area, handle));
    }
    Ok(&mut state.open_area.as_mut().unwrap().1)
}

/// Raw read against one storage area, page-aligned fast path plus a
/// buffered path for unaligned extents.
fn read_area(
    shared: &DeviceShared,
    state: &mut DeviceState,
    area: StorageArea,
    area_offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    use std::io::Read;

    if area_offset % GAMECARD_PAGE_SIZE == 0 && buf.len() as u64 % GAMECARD_PAGE_SIZE == 0 {
        let handle = cached_area_handle(shared, state, area)?;
        handle.seek(SeekFrom::Start(area_offset))?;
        handle.read_exact(buf)?;
        return Ok(());
    }

    if state.read_buffer.is_empty() {
        state.read_buffer = vec![0u8; READ_BUFFER_SIZE];
    }

    let mut out_pos = 0usize;
    let mut cur = area_offset;
    while out_pos < buf.len() {
        let block_start = align_down(cur, GAMECARD_PAGE_SIZE);
        let want = (buf.len() - out_pos) as u64;
        let block_end = align_up(cur + want, GAMECARD_PAGE_SIZE);
        let block_size = (block_end - block_start).min(READ_BUFFER_SIZE as u64);

        // Split borrows: the handle lives in `open_area`, the scratch
        // buffer in `read_buffer`.
        {
            let reopen = !matches!(&state.open_area, Some((current, _)) if *current == area);
            if reopen {
                let handle = open_area_handle(shared, state, area)?;
                state.open_area = Some((area, handle));
            }
        }
        let (open_area, read_buffer) = (&mut state.open_area, &mut state.read_buffer);
        let handle = &mut open_area.as_mut().unwrap().1;
        handle.seek(SeekFrom::Start(block_start))?;
        handle.read_exact(&mut read_buffer[..block_size as usize])?;

        let data_start = (cur - block_start) as usize;
        let avail = block_size as usize - data_start;
        let copy = avail.min(buf.len() - out_pos);
        buf[out_pos..out_pos + copy]
            .copy_from_slice(&read_buffer[data_start..data_start + copy]);

        out_pos += copy;
        cur += copy as u64;
    }

    Ok(())
}

/// Reads from the logical image, splitting across the area boundary.
fn read_storage_area(
    shared: &DeviceShared,
    state: &mut DeviceState,
    offset: u64,
    buf: &mut [u8],
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    if offset + buf.len() as u64 > state.total_size {
        return Err(Error::InvalidArgument(format!(
            "gamecard read out of bounds (offset 0x{offset:X}, len 0x{:X})",
            buf.len()
        )));
    }

    let normal_size = state.normal_size;
    if offset < normal_size && offset + buf.len() as u64 > normal_size {
        let split = (normal_size - offset) as usize;
        let (head, tail) = buf.split_at_mut(split);
        read_area(shared, state, StorageArea::Normal, offset, head)?;
        return read_area(shared, state, StorageArea::Secure, 0, tail);
    }

    if offset < normal_size {
        read_area(shared, state, StorageArea::Normal, offset, buf)
    } else {
        read_area(shared, state, StorageArea::Secure, offset - normal_size, buf)
    }
}

fn load_info(shared: &DeviceShared, state: &mut DeviceState) {
    match try_load_info(shared, state) {
        Ok(()) => set_status(shared, state, GameCardStatus::InsertedInfoLoaded),
        Err(e) => {
            tracing::warn!(error = %e, "failed to load gamecard information");
            if state.status() == GameCardStatus::Processing {
                set_status(shared, state, GameCardStatus::InsertedInfoNotLoaded);
            }
        }
    }
}

fn try_load_info(shared: &DeviceShared, state: &mut DeviceState) -> Result<()> {
    use std::io::Read;

    // Header comes straight off the normal area, before sizes are known.
    let mut raw_header = [0u8; GAMECARD_HEADER_SIZE];
    {
        let handle = cached_area_handle(shared, state, StorageArea::Normal)?;
        handle.seek(SeekFrom::Start(0))?;
        handle.read_exact(&mut raw_header)?;
    }
    let header = GameCardHeader::from_bytes(&raw_header)?;

    if header.has_flag(CardFlag::HasCa10Certificate) {
        verify_header2(shared, state)?;
        // No retail cartridge has been seen with this flag set; refuse to
        // continue until a confirmed fixture exists.
        return Err(Error::CorruptHeader(
            HeaderKind::Gamecard,
            "cards with a CA-10 certificate are not supported".to_string(),
        ));
    }

    let card_info = header.decrypt_card_info(&shared.keys.card_info_key()?)?;

    // LAFW version gate.
    let fs_data = shared
        .memory
        .read_program_memory(SystemProgram::Fs, MemorySegment::Data)?;
    let lafw = LafwBlob::find_in_memory(&fs_data, shared.card.is_dev_unit())?;
    state.lafw_version = lafw.version();
    if state.lafw_version < card_info.fw_version {
        tracing::warn!(
            lafw = state.lafw_version,
            required = card_info.fw_version,
            "LAFW version below card requirement"
        );
        set_status(shared, state, GameCardStatus::LafwUpdateRequired);
        return Err(Error::GamecardNotReady(NotReadyKind::LafwRequired));
    }

    // Storage area sizes.
    for area in [StorageArea::Normal, StorageArea::Secure] {
        let handle = cached_area_handle(shared, state, area)?;
        let size = handle.seek(SeekFrom::End(0))?;
        match area {
            StorageArea::Normal => state.normal_size = size,
            StorageArea::Secure => state.secure_size = size,
        }
    }
    state.total_size = state.normal_size + state.secure_size;
    state.capacity = header.rom_size.capacity();

    // Root partition, verified against the signed header hash. Non-normal
    // compatibility types salt the hash with the type byte.
    let salt = match card_info.compatibility() {
        CompatibilityType::Normal => None,
        CompatibilityType::Terra => Some(1u8),
        CompatibilityType::Other(v) => Some(v),
    };

    state.card_info = Some(card_info);
    state.header = Some(header.clone());

    // The image storage exposed to consumers re-locks the device state,
    // so during load partition headers are read through plain bounded
    // buffers instead.
    let root = {
        let storage: SharedStorage = Arc::new(Mutex::new(LockedAreaStorage {
            bytes: read_region(
                shared,
                state,
                header.partition_fs_header_address,
                // Upper bound: the root header never exceeds its declared
                // size plus page padding.
                align_up(header.partition_fs_header_size.max(0x200), GAMECARD_PAGE_SIZE),
            )?,
        }));
        HashFs::open(
            storage,
            HfsPartitionType::Root,
            0,
            0,
            Some(&header.partition_fs_header_hash),
            0,
            header.partition_fs_header_size as u32,
            salt,
        )?
    };

    let mut partitions = vec![HfsPartitionMeta {
        partition_type: HfsPartitionType::Root,
        offset: header.partition_fs_header_address,
        size: 0,
        hash: header.partition_fs_header_hash,
        hash_target_offset: 0,
        hash_target_size: header.partition_fs_header_size as u32,
        salt,
    }];

    let root_data_base = header.partition_fs_header_address + root.header_size();
    for entry in root.entries() {
        let Some(partition_type) = HfsPartitionType::from_name(&entry.name) else {
            return Err(Error::CorruptHeader(
                HeaderKind::HashFs,
                format!("unknown root partition entry \"{}\"", entry.name),
            ));
        };
        let child_offset = root_data_base + entry.offset;

        // Verify each child header now so the latched status reflects a
        // fully validated card.
        let child_bytes = read_region(
            shared,
            state,
            child_offset,
            align_up(
                (entry.hash_target_offset + entry.hash_target_size as u64).max(0x200),
                GAMECARD_PAGE_SIZE,
            ),
        )?;
        let child_storage: SharedStorage =
            Arc::new(Mutex::new(LockedAreaStorage { bytes: child_bytes }));
        HashFs::open(
            child_storage,
            partition_type,
            0,
            entry.size,
            Some(&entry.hash),
            entry.hash_target_offset,
            entry.hash_target_size,
            None,
        )?;

        partitions.push(HfsPartitionMeta {
            partition_type,
            offset: child_offset,
            size: entry.size,
            hash: entry.hash,
            hash_target_offset: entry.hash_target_offset,
            hash_target_size: entry.hash_target_size,
            salt: None,
        });
    }

    state.partitions = partitions;
    Ok(())
}

/// Reads a region of the logical image while already holding the state
/// lock.
fn read_region(
    shared: &DeviceShared,
    state: &mut DeviceState,
    offset: u64,
    size: u64,
) -> Result<Vec<u8>> {
    let size = size.min(state.total_size.saturating_sub(offset));
    let mut bytes = vec![0u8; size as usize];
    read_storage_area(shared, state, offset, &mut bytes)?;
    Ok(bytes)
}

/// Byte-buffer storage used during load, when the state lock is held.
struct LockedAreaStorage {
    bytes: Vec<u8>,
}

impl VirtualStorage for LockedAreaStorage {
    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = offset as usize + buf.len();
        if end > self.bytes.len() {
            return Err(Error::InvalidArgument(
                "partition header read out of bounds".to_string(),
            ));
        }
        buf.copy_from_slice(&self.bytes[offset as usize..end]);
        Ok(())
    }
}

fn verify_header2(shared: &DeviceShared, state: &mut DeviceState) -> Result<()> {
    let mut raw2 = [0u8; 0x200];
    let mut raw_cert = [0u8; 0x200];
    {
        let handle = cached_area_handle(shared, state, StorageArea::Normal)?;
        use std::io::Read;
        handle.seek(SeekFrom::Start(GAMECARD_HEADER2_OFFSET))?;
        handle.read_exact(&mut raw2)?;
        handle.seek(SeekFrom::Start(GAMECARD_HEADER2_CERT_OFFSET))?;
        handle.read_exact(&mut raw_cert)?;
    }

    let header2: GameCardHeader2 = binrw::io::Cursor::new(raw2.as_slice()).read_le()?;
    let cert: GameCardHeader2Certificate =
        binrw::io::Cursor::new(raw_cert.as_slice()).read_le()?;

    if !crate::crypto::rsa2048_pkcs1_verify_sha256(
        &cert.modulus,
        &cert.exponent,
        &header2.body,
        &header2.signature,
    ) {
        return Err(Error::CorruptHeader(
            HeaderKind::Gamecard,
            "Header2 signature verification failed".to_string(),
        ));
    }
    Ok(())
}
