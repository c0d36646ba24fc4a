//! Tunable knobs for [`crate::repository::Repository`] and the higher
//! components built on it. Every field has a sensible default; callers
//! only override what they need to.

use std::time::Duration;

/// Constructs a [`backup_castore::backend::Backend`] from a URL scheme:
/// `file://` and `memory://` are handled directly by this crate;
/// anything else is handed to `object_store`'s own URL parsing (`s3://`,
/// `gs://`, `az://`, `http(s)://`). Backends without a bundled network
/// client (SFTP, B2, Swift, a bespoke REST API) are registered by
/// implementing [`backup_castore::backend::Backend`] and adding a scheme
/// match arm here.
pub fn backend_for_url(
    url: &url::Url,
) -> backup_castore::Result<std::sync::Arc<dyn backup_castore::backend::Backend>> {
    match url.scheme() {
        "file" => Ok(std::sync::Arc::new(backup_castore::backend::LocalBackend::new(
            url.path(),
        ))),
        _ => Ok(std::sync::Arc::new(
            backup_castore::backend::ObjectStoreBackend::parse_url(url)?,
        )),
    }
}

#[derive(Debug, Clone)]
pub struct RepositoryOptions {
    /// Key object to try unlocking first ("key hint").
    pub key_hint: Option<backup_castore::id::Id>,
    /// Per-backend-call timeout; `None` means no timeout is enforced
    /// beyond what the backend itself imposes.
    pub backend_timeout: Option<Duration>,
    /// Packer pool cap.
    pub packer_pool_cap: usize,
    /// Packer low-water mark, in bytes.
    pub packer_low_water_mark: usize,
    /// Archiver per-file worker count: kept small by
    /// default to bound disk seek contention on spinning media.
    pub archiver_workers: usize,
    /// Restorer downloader worker count.
    pub restorer_workers: usize,
    /// Pack cache byte budget for the restorer.
    pub pack_cache_bytes: u64,
    /// Bounded fan-out for index file loading.
    pub index_load_concurrency: usize,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            key_hint: None,
            backend_timeout: Some(Duration::from_secs(60)),
            packer_pool_cap: crate::packer::POOL_CAP,
            packer_low_water_mark: crate::packer::LOW_WATER_MARK,
            archiver_workers: 2,
            restorer_workers: 8,
            pack_cache_bytes: 256 * 1024 * 1024,
            index_load_concurrency: 20,
        }
    }
}
