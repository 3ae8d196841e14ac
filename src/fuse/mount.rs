//! Mount helpers for starting/stopping FUSE.
//!
//! Linux-only; unprivileged mounting goes through fusermount3. Thin wrappers
//! over the rfuse3 raw Session API.

use std::path::Path;

use rfuse3::MountOptions;

use super::adapter::ObjFuse;

fn default_mount_options() -> MountOptions {
    let mut options = MountOptions::default();
    options.fs_name("objfs");
    options
}

/// Mount a volume at the given empty directory without requiring root.
#[cfg(target_os = "linux")]
pub async fn mount_unprivileged(
    fs: ObjFuse,
    mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    let mut options = default_mount_options();
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    options.uid(uid).gid(gid);

    let session = rfuse3::raw::Session::new(options);
    session.mount_with_unprivileged(fs, mount_point.as_ref()).await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_unprivileged(
    _fs: ObjFuse,
    _mount_point: impl AsRef<Path>,
) -> std::io::Result<rfuse3::raw::MountHandle> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
