//! Multi-layered reads within a single NCA FS section.
//!
//! `NcaStorage` stacks the optional storage layers in their fixed order:
//! Regular (decrypted section reads), Sparse, Indirect + AesCtrEx for
//! patch sections, and Compressed. Exactly one layer is the top at any
//! time; consumers read through the top and see the section's logical
//! hash-target space.

use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::io::{SharedStorage, VirtualStorage, ZeroStorage};

use super::bucket::{BucketTree, BucketTreeStorage, BucketVariant};
use super::section::{NcaFsSection, SectionStorage};
use super::FsSectionType;

/// Which layer currently tops the storage stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseStorageType {
    Regular,
    Sparse,
    Indirect,
    Compressed,
}

/// Composed storage stack over one NCA FS section.
pub struct NcaStorage {
    base_type: BaseStorageType,
    section: Arc<Mutex<NcaFsSection>>,
    section_type: FsSectionType,
    sparse: Option<Arc<Mutex<BucketTree>>>,
    aes_ctr_ex: Option<Arc<Mutex<BucketTree>>>,
    indirect: Option<Arc<Mutex<BucketTree>>>,
    compressed: Option<Arc<Mutex<BucketTree>>>,
}

impl NcaStorage {
    /// Builds the stack for `section`.
    ///
    /// Patch sections need `base` wired in; it supplies the "original"
    /// substorage of the Indirect layer. Use
    /// [`NcaStorage::open_with_missing_base`] for patches whose base
    /// carries no RomFS at all.
    pub fn open(section: NcaFsSection, base: Option<&NcaStorage>) -> Result<Self> {
        Self::open_inner(section, PatchBase::Storage(base))
    }

    /// Builds a patch stack whose original substorage is all zeroes.
    pub fn open_with_missing_base(section: NcaFsSection) -> Result<Self> {
        Self::open_inner(section, PatchBase::Zero)
    }

    fn open_inner(section: NcaFsSection, base: PatchBase<'_>) -> Result<Self> {
        let section_type = section.section_type;
        let header = section.header.clone();
        let section = Arc::new(Mutex::new(section));

        let mut out = Self {
            base_type: BaseStorageType::Regular,
            section: Arc::clone(&section),
            section_type,
            sparse: None,
            aes_ctr_ex: None,
            indirect: None,
            compressed: None,
        };

        // Sparse layer, over regular section reads.
        if header.sparse_info.is_present() {
            let mut tree = {
                let mut guard = section.lock().unwrap();
                BucketTree::load(&mut guard, BucketVariant::Sparse, &header.sparse_info.bucket)?
            };
            tree.set_substorage(
                0,
                Arc::new(Mutex::new(SectionStorage::new(Arc::clone(&section)))),
            );
            out.sparse = Some(Arc::new(Mutex::new(tree)));
            out.base_type = BaseStorageType::Sparse;
        }

        // Indirect + AesCtrEx layers for patch sections.
        if section_type == FsSectionType::PatchRomFs {
            if !header.patch_info.is_present() {
                return Err(Error::InvalidState(
                    "patch section without patch bucket trees".to_string(),
                ));
            }
            if header.sparse_info.is_present() {
                return Err(Error::InvalidState(
                    "patch section cannot carry its own sparse layer".to_string(),
                ));
            }

            let mut aes_ctr_ex_tree = {
                let mut guard = section.lock().unwrap();
                BucketTree::load(
                    &mut guard,
                    BucketVariant::AesCtrEx,
                    &header.patch_info.aes_ctr_ex,
                )?
            };
            aes_ctr_ex_tree.set_section(Arc::clone(&section));
            let aes_ctr_ex = Arc::new(Mutex::new(aes_ctr_ex_tree));

            let mut indirect_tree = {
                let mut guard = section.lock().unwrap();
                BucketTree::load(
                    &mut guard,
                    BucketVariant::Indirect,
                    &header.patch_info.indirect,
                )?
            };

            // SubStorage #0 is the base NCA's top-of-stack storage.
            let original: SharedStorage = match base {
                PatchBase::Storage(Some(base)) => base.top_storage(),
                PatchBase::Storage(None) => {
                    return Err(Error::InvalidState(
                        "patch section requires a base storage".to_string(),
                    ));
                }
                PatchBase::Zero => {
                    let size = indirect_tree.virtual_size();
                    Arc::new(Mutex::new(ZeroStorage::new(size)))
                }
            };
            indirect_tree.set_substorage(0, original);
            indirect_tree.set_substorage(
                1,
                Arc::new(Mutex::new(BucketTreeStorage::new(Arc::clone(&aes_ctr_ex)))),
            );

            out.aes_ctr_ex = Some(aes_ctr_ex);
            out.indirect = Some(Arc::new(Mutex::new(indirect_tree)));
            out.base_type = BaseStorageType::Indirect;
        }

        // Compression layer, only without a sparse layer: with sparse,
        // the patch's own compressed layer covers base data too.
        if header.compression_info.is_present() && !header.sparse_info.is_present() {
            let mut tree = {
                let mut guard = section.lock().unwrap();
                BucketTree::load(
                    &mut guard,
                    BucketVariant::Compressed,
                    &header.compression_info.bucket,
                )?
            };
            let below: SharedStorage = match out.base_type {
                BaseStorageType::Regular => {
                    Arc::new(Mutex::new(SectionStorage::new(Arc::clone(&section))))
                }
                BaseStorageType::Indirect => Arc::new(Mutex::new(BucketTreeStorage::new(
                    Arc::clone(out.indirect.as_ref().unwrap()),
                ))),
                BaseStorageType::Sparse | BaseStorageType::Compressed => unreachable!(),
            };
            tree.set_substorage(0, below);
            out.compressed = Some(Arc::new(Mutex::new(tree)));
            out.base_type = BaseStorageType::Compressed;
        }

        tracing::trace!(
            base_type = ?out.base_type,
            section_type = ?section_type,
            "NCA storage stack composed"
        );

        Ok(out)
    }

    pub fn base_type(&self) -> BaseStorageType {
        self.base_type
    }

    pub fn section_type(&self) -> FsSectionType {
        self.section_type
    }

    pub fn section(&self) -> Arc<Mutex<NcaFsSection>> {
        Arc::clone(&self.section)
    }

    /// The top of the stack as a shareable storage (what a patch wires as
    /// its original substorage).
    pub fn top_storage(&self) -> SharedStorage {
        match self.base_type {
            BaseStorageType::Regular => {
                Arc::new(Mutex::new(SectionStorage::new(Arc::clone(&self.section))))
            }
            BaseStorageType::Sparse => Arc::new(Mutex::new(BucketTreeStorage::new(Arc::clone(
                self.sparse.as_ref().unwrap(),
            )))),
            BaseStorageType::Indirect => Arc::new(Mutex::new(BucketTreeStorage::new(
                Arc::clone(self.indirect.as_ref().unwrap()),
            ))),
            BaseStorageType::Compressed => Arc::new(Mutex::new(BucketTreeStorage::new(
                Arc::clone(self.compressed.as_ref().unwrap()),
            ))),
        }
    }

    /// Extent of the logical filesystem consumers should read, relative
    /// to this storage.
    pub fn hash_target_extents(&self) -> (u64, u64) {
        match self.base_type {
            BaseStorageType::Compressed => {
                // Compressed storages already expose the hash-target layer.
                let size = self
                    .compressed
                    .as_ref()
                    .map(|t| t.lock().unwrap().virtual_size())
                    .unwrap_or(0);
                (0, size)
            }
            _ => self.section.lock().unwrap().hash_target_extents(),
        }
    }

    /// Whether any part of the block lies inside indirect-covered patch
    /// ranges; decides if a read needs the base NCA at all.
    pub fn is_block_within_patch_range(&self, offset: u64, size: u64) -> Result<bool> {
        if self.section_type != FsSectionType::PatchRomFs {
            return Err(Error::InvalidState(
                "patch range query on a non-patch section".to_string(),
            ));
        }
        let indirect = self.indirect.as_ref().ok_or_else(|| {
            Error::InvalidState("patch storage without an indirect layer".to_string())
        })?;
        indirect.lock().unwrap().is_block_within_indirect_range(offset, size)
    }
}

enum PatchBase<'a> {
    Storage(Option<&'a NcaStorage>),
    Zero,
}

impl VirtualStorage for NcaStorage {
    fn len(&self) -> u64 {
        match self.base_type {
            BaseStorageType::Regular => self.section.lock().unwrap().size(),
            BaseStorageType::Sparse => self.sparse.as_ref().unwrap().lock().unwrap().virtual_size(),
            BaseStorageType::Indirect => {
                self.indirect.as_ref().unwrap().lock().unwrap().virtual_size()
            }
            BaseStorageType::Compressed => {
                self.compressed.as_ref().unwrap().lock().unwrap().virtual_size()
            }
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        match self.base_type {
            BaseStorageType::Regular => self.section.lock().unwrap().read_at(offset, buf),
            BaseStorageType::Sparse => {
                self.sparse.as_ref().unwrap().lock().unwrap().read_at(offset, buf)
            }
            BaseStorageType::Indirect => {
                self.indirect.as_ref().unwrap().lock().unwrap().read_at(offset, buf)
            }
            BaseStorageType::Compressed => {
                self.compressed.as_ref().unwrap().lock().unwrap().read_at(offset, buf)
            }
        }
    }
}
