//! Title enumeration over the content-meta database.
//!
//! The OS-side database is abstracted as [`ContentMetaProvider`]; the
//! index groups its records by application and resolves the arithmetic
//! relations between applications, patches, add-on content and data
//! patches.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// Where a content record is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentStorage {
    Gamecard,
    Nand,
    Sd,
}

/// Storage filter for enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFilter {
    Gamecard,
    Nand,
    Sd,
    All,
}

impl StorageFilter {
    fn matches(self, storage: ContentStorage) -> bool {
        match self {
            StorageFilter::Gamecard => storage == ContentStorage::Gamecard,
            StorageFilter::Nand => storage == ContentStorage::Nand,
            StorageFilter::Sd => storage == ContentStorage::Sd,
            StorageFilter::All => true,
        }
    }
}

/// Content-meta record kinds the index groups by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaType {
    Application,
    Patch,
    AddOnContent,
    DataPatch,
    Other(u8),
}

/// Content kinds within one meta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentRecordType {
    Meta,
    Program,
    Data,
    Control,
    HtmlDocument,
    LegalInformation,
    DeltaFragment,
}

/// Identity of one content-meta record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentMetaKey {
    pub id: u64,
    pub version: u32,
    pub meta_type: MetaType,
}

/// One content file referenced by a meta record.
#[derive(Debug, Clone)]
pub struct ContentInfo {
    pub content_id: [u8; 0x10],
    pub content_type: ContentRecordType,
    pub id_offset: u8,
    pub size: u64,
}

/// A full meta record as supplied by the provider.
#[derive(Debug, Clone)]
pub struct TitleMetaRecord {
    pub key: ContentMetaKey,
    pub storage: ContentStorage,
    pub contents: Vec<ContentInfo>,
    /// Display name, when control data was available.
    pub name: Option<String>,
}

/// Supplies content-meta records from the host.
pub trait ContentMetaProvider: Send + Sync {
    fn enumerate(&self) -> Result<Vec<TitleMetaRecord>>;
}

/// The id of the patch belonging to an application.
pub fn patch_id(application_id: u64) -> u64 {
    application_id + 0x800
}

/// The base id for an application's add-on content.
pub fn add_on_content_base_id(application_id: u64) -> u64 {
    (application_id & !0xFFF) + 0x1000
}

/// Whether `id` is an add-on content id belonging to `application_id`.
pub fn is_add_on_content_of(id: u64, application_id: u64) -> bool {
    let base = add_on_content_base_id(application_id);
    id > base && id <= base + 2000
}

/// The id of the data patch belonging to an add-on content.
pub fn data_patch_id(add_on_content_id: u64) -> u64 {
    add_on_content_id + 0x800
}

/// An application with its related records.
#[derive(Debug, Clone, Default)]
pub struct TitleGroup {
    pub application: Option<TitleMetaRecord>,
    pub patch: Option<TitleMetaRecord>,
    pub add_on_contents: Vec<TitleMetaRecord>,
    pub data_patches: Vec<TitleMetaRecord>,
}

/// Snapshot of the content-meta database.
pub struct TitleIndex {
    records: Vec<TitleMetaRecord>,
    by_key: HashMap<ContentMetaKey, usize>,
}

impl TitleIndex {
    /// Queries the provider and builds the index.
    pub fn build(provider: &dyn ContentMetaProvider) -> Result<Self> {
        let records = provider.enumerate()?;
        let mut by_key = HashMap::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            by_key.insert(record.key, i);
        }
        tracing::debug!(count = records.len(), "title index rebuilt");
        Ok(Self { records, by_key })
    }

    pub fn records(&self, filter: StorageFilter) -> Vec<&TitleMetaRecord> {
        self.records
            .iter()
            .filter(|r| filter.matches(r.storage))
            .collect()
    }

    pub fn record(&self, key: &ContentMetaKey) -> Option<&TitleMetaRecord> {
        self.by_key.get(key).map(|&i| &self.records[i])
    }

    fn record_by_id(&self, id: u64, meta_type: MetaType) -> Option<&TitleMetaRecord> {
        self.records
            .iter()
            .find(|r| r.key.id == id && r.key.meta_type == meta_type)
    }

    /// Resolves the content id for a given content type and id offset
    /// within a meta record.
    pub fn content_by_type(
        &self,
        key: &ContentMetaKey,
        content_type: ContentRecordType,
        id_offset: u8,
    ) -> Result<&ContentInfo> {
        let record = self.record(key).ok_or_else(|| {
            Error::NotFound(format!("content meta record {:016X}", key.id))
        })?;
        record
            .contents
            .iter()
            .find(|c| c.content_type == content_type && c.id_offset == id_offset)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "{content_type:?} content (id offset {id_offset}) in {:016X}",
                    key.id
                ))
            })
    }

    /// Groups an application with its patch, add-on content and data
    /// patches.
    pub fn application_group(&self, application_id: u64) -> TitleGroup {
        let mut group = TitleGroup {
            application: self
                .record_by_id(application_id, MetaType::Application)
                .cloned(),
            patch: self
                .record_by_id(patch_id(application_id), MetaType::Patch)
                .cloned(),
            ..Default::default()
        };

        for record in &self.records {
            match record.key.meta_type {
                MetaType::AddOnContent
                    if is_add_on_content_of(record.key.id, application_id) =>
                {
                    group.add_on_contents.push(record.clone());
                }
                MetaType::DataPatch => {
                    // A data patch belongs here when its base add-on id
                    // falls in this application's range.
                    let aoc_id = record.key.id.wrapping_sub(0x800);
                    if is_add_on_content_of(aoc_id, application_id) {
                        group.data_patches.push(record.clone());
                    }
                }
                _ => {}
            }
        }

        group
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) struct StaticProvider {
        pub records: Vec<TitleMetaRecord>,
    }

    impl ContentMetaProvider for StaticProvider {
        fn enumerate(&self) -> Result<Vec<TitleMetaRecord>> {
            Ok(self.records.clone())
        }
    }

    pub(crate) fn record(
        id: u64,
        meta_type: MetaType,
        storage: ContentStorage,
        contents: Vec<ContentInfo>,
    ) -> TitleMetaRecord {
        TitleMetaRecord {
            key: ContentMetaKey {
                id,
                version: 0x10000,
                meta_type,
            },
            storage,
            contents,
            name: None,
        }
    }

    const APP: u64 = 0x0100_0000_0000_2000;

    #[test]
    fn test_id_arithmetic() {
        assert_eq!(patch_id(APP), APP + 0x800);
        assert_eq!(add_on_content_base_id(APP), APP + 0x1000);
        assert!(is_add_on_content_of(APP + 0x1001, APP));
        assert!(is_add_on_content_of(APP + 0x1000 + 2000, APP));
        assert!(!is_add_on_content_of(APP + 0x1000, APP));
        assert!(!is_add_on_content_of(APP + 0x1000 + 2001, APP));
        assert_eq!(data_patch_id(APP + 0x1001), APP + 0x1801);
    }

    #[test]
    fn test_grouping_and_lookup() {
        let program = ContentInfo {
            content_id: [0xAB; 0x10],
            content_type: ContentRecordType::Program,
            id_offset: 0,
            size: 0x1000,
        };
        let control = ContentInfo {
            content_id: [0xCD; 0x10],
            content_type: ContentRecordType::Control,
            id_offset: 0,
            size: 0x100,
        };

        let provider = StaticProvider {
            records: vec![
                record(
                    APP,
                    MetaType::Application,
                    ContentStorage::Gamecard,
                    vec![program.clone(), control],
                ),
                record(
                    patch_id(APP),
                    MetaType::Patch,
                    ContentStorage::Nand,
                    vec![program.clone()],
                ),
                record(
                    APP + 0x1001,
                    MetaType::AddOnContent,
                    ContentStorage::Sd,
                    vec![],
                ),
                record(
                    data_patch_id(APP + 0x1001),
                    MetaType::DataPatch,
                    ContentStorage::Nand,
                    vec![],
                ),
                // A different application's add-on must not group here.
                record(
                    APP + 0x10_0000 + 0x1001,
                    MetaType::AddOnContent,
                    ContentStorage::Sd,
                    vec![],
                ),
            ],
        };

        let index = TitleIndex::build(&provider).unwrap();
        assert_eq!(index.records(StorageFilter::All).len(), 5);
        assert_eq!(index.records(StorageFilter::Gamecard).len(), 1);
        assert_eq!(index.records(StorageFilter::Nand).len(), 2);

        let group = index.application_group(APP);
        assert!(group.application.is_some());
        assert_eq!(group.patch.unwrap().key.id, patch_id(APP));
        assert_eq!(group.add_on_contents.len(), 1);
        assert_eq!(group.data_patches.len(), 1);

        let key = ContentMetaKey {
            id: APP,
            version: 0x10000,
            meta_type: MetaType::Application,
        };
        let content = index
            .content_by_type(&key, ContentRecordType::Program, 0)
            .unwrap();
        assert_eq!(content.content_id, [0xAB; 0x10]);
        assert!(
            index
                .content_by_type(&key, ContentRecordType::LegalInformation, 0)
                .is_err()
        );
    }
}
