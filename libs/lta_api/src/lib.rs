#![deny(unsafe_code)]

/// Public API types
pub mod models;

/// Target archive size when a TransferRequest does not say otherwise: 100 GiB.
pub const DEFAULT_IDEAL_BUNDLE_SIZE: u64 = 100 * (1 << 30);

/// Page size used against the File Catalog and the LTA DB Metadata table.
pub const DEFAULT_FILE_CATALOG_PAGE_SIZE: usize = 1000;

/// Maximum number of file uuids per Metadata bulk_create call.
pub const METADATA_CHUNK_SIZE: usize = 1000;

/// Version stamped into the first line of every bundle manifest.
pub const MANIFEST_VERSION: u32 = 3;
