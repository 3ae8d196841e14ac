//! FUSE adapter and request handling.
//!
//! - `adapter`: glue that implements the rfuse3 callbacks and translates
//!   requests into node operations.
//! - `mount`: mount/unmount helpers and CLI plumbing.

pub mod adapter;
pub mod mount;

pub use adapter::ObjFuse;
pub use mount::mount_unprivileged;
