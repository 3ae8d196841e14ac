//! Process-wide mount configuration, read by nodes at call time.

/// Tuning knobs for one mounted volume. Injected through
/// [`crate::fs::FsCore`] rather than read from global state, so several
/// mounts can coexist in one process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Permission bits applied to every node (the backend stores no mode).
    pub default_mode: u32,
    pub default_uid: u32,
    pub default_gid: u32,
    /// Reported filesystem block size; also the reported size of directories.
    pub block_size: u32,
    /// Byte threshold above which a write stream is split into segments.
    pub segment_size: u64,
    /// Upper bound on concurrent HEAD requests issued by readdir enrichment.
    pub lister_concurrency: usize,
    /// Fetch full headers for every listed entry and honor mtime overrides.
    pub extra_attr: bool,
    /// Plumb stream-cipher nonces and origin sizes through object headers.
    pub encryption: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_mode: 0o700,
            default_uid: 0,
            default_gid: 0,
            block_size: 4096,
            segment_size: 256 * 1024 * 1024,
            lister_concurrency: 20,
            extra_attr: false,
            encryption: false,
        }
    }
}
