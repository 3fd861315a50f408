mod logic;
pub mod snapshot;

use std::sync::Arc;

use crate::config::BackupSettings;
use crate::storage::BlobStore;
use crate::store::{CatalogStore, MetadataStore};

pub use logic::{BackupListing, BulkDeleteResult};

/// Point-in-time snapshots of the protected tables, stored as blobs and
/// described by `BackupRecord` rows. Restore and verification live in
/// `crate::restore` as further `impl` blocks on this type.
pub struct BackupManager {
    pub(crate) store: Arc<dyn CatalogStore>,
    pub(crate) metadata: Arc<dyn MetadataStore>,
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) settings: BackupSettings,
}

impl BackupManager {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        metadata: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        settings: BackupSettings,
    ) -> Self {
        Self { store, metadata, blobs, settings }
    }

    pub fn protected_tables(&self) -> &[String] {
        &self.settings.tables
    }
}
