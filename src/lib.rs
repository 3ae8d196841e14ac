//! objfs: mount a flat object-store namespace as a POSIX-like filesystem.
//!
//! Containers hold slash-named objects; this crate synthesizes a hierarchy
//! from them, streams large writes into segment objects stitched together by
//! a manifest, and exposes the result over FUSE.

pub mod config;
pub mod fs;
pub mod fuse;
pub mod store;
