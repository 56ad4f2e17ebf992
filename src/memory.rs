//! Access to system-process memory images.
//!
//! Two lookups depend on scanning the memory of running system programs:
//! the Lotus ASIC firmware blob lives in the FS process `.data` segment,
//! and the AES-CTR key pairs for volatile tickets live in the ES process
//! `.data` segment. The host integration supplies those images through
//! [`SystemMemoryProvider`]; tests use [`StaticMemory`] with fixture
//! bytes.

use crate::error::Result;

/// System programs whose memory the core inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemProgram {
    /// The filesystem services process.
    Fs,
    /// The eticket services process.
    Es,
}

/// Memory segments of interest within a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemorySegment {
    Data,
    Full,
}

/// Supplies raw memory images of system programs.
pub trait SystemMemoryProvider: Send + Sync {
    /// Returns a snapshot of the requested segment of the program's
    /// memory. The returned buffer is owned; the scanners walk it freely.
    fn read_program_memory(
        &self,
        program: SystemProgram,
        segment: MemorySegment,
    ) -> Result<Vec<u8>>;
}

/// A provider backed by fixed byte images, for tests and offline use.
#[derive(Default)]
pub struct StaticMemory {
    fs_data: Vec<u8>,
    fs_full: Vec<u8>,
    es_data: Vec<u8>,
}

impl StaticMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fs_data(mut self, data: Vec<u8>) -> Self {
        self.fs_data = data;
        self
    }

    pub fn with_fs_full(mut self, data: Vec<u8>) -> Self {
        self.fs_full = data;
        self
    }

    pub fn with_es_data(mut self, data: Vec<u8>) -> Self {
        self.es_data = data;
        self
    }
}

impl SystemMemoryProvider for StaticMemory {
    fn read_program_memory(
        &self,
        program: SystemProgram,
        segment: MemorySegment,
    ) -> Result<Vec<u8>> {
        let image = match (program, segment) {
            (SystemProgram::Fs, MemorySegment::Data) => &self.fs_data,
            (SystemProgram::Fs, MemorySegment::Full) => &self.fs_full,
            (SystemProgram::Es, _) => &self.es_data,
        };
        Ok(image.clone())
    }
}
