mod config;
mod fs;
mod fuse;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use config::Config;
use fs::ObjFs;
use fuse::ObjFuse;
use store::MemStore;

/// Mount an object-store volume. This binary wires the in-memory demo
/// backend; production transports plug in through the ObjectStore trait.
#[derive(Parser, Debug)]
#[command(name = "objfs", version, about)]
struct Args {
    /// Empty directory to mount at (created if missing).
    mount_point: PathBuf,

    /// Data container: the user-visible keyspace.
    #[arg(long, default_value = "data")]
    container: String,

    /// Container holding large-object segments.
    #[arg(long, default_value = "segments")]
    segments_container: String,

    /// Split write streams into segments of this many bytes.
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    segment_size: u64,

    /// Concurrent HEAD requests during directory listing.
    #[arg(long, default_value_t = 20)]
    lister_concurrency: usize,

    /// Fetch full metadata for every listed entry; honors mtime overrides.
    #[arg(long)]
    extra_attr: bool,

    /// Plumb stream-cipher nonces through object headers.
    #[arg(long)]
    encryption: bool,

    /// Permission bits for every node, in octal.
    #[arg(long, default_value = "700")]
    mode: String,

    /// Reported filesystem block size.
    #[arg(long, default_value_t = 4096)]
    block_size: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let default_mode =
        u32::from_str_radix(&args.mode, 8).context("--mode must be octal permission bits")?;
    let config = Config {
        default_mode,
        default_uid: unsafe { libc::getuid() },
        default_gid: unsafe { libc::getgid() },
        block_size: args.block_size,
        segment_size: args.segment_size,
        lister_concurrency: args.lister_concurrency,
        extra_attr: args.extra_attr,
        encryption: args.encryption,
    };

    let store = Arc::new(MemStore::new([
        args.container.as_str(),
        args.segments_container.as_str(),
    ]));
    let volume = ObjFs::new(store, config, &args.container, &args.segments_container);

    std::fs::create_dir_all(&args.mount_point).context("creating mount point")?;
    println!(
        "Mounting {} (segments: {}) at {} ...",
        args.container,
        args.segments_container,
        args.mount_point.display()
    );
    println!("Press Ctrl+C to unmount and exit.");

    let handle = fuse::mount_unprivileged(ObjFuse::new(volume), &args.mount_point)
        .await
        .context("mount failed; ensure FUSE (fusermount3) is available")?;

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;

    println!("Unmounting...");
    handle.unmount().await.context("unmount failed")?;
    Ok(())
}
