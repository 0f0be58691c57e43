use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use bfoxide::device::DeviceGeometry;
use bfoxide::dump;
use bfoxide::fs::Fs;
use bfoxide::options::Options;

/// Bring up, inspect, or repair a filesystem built on this crate's
/// btree/journal/allocator engine.
///
/// Each available block device in the filesystem should be specified
/// on the command line.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about)]
struct Params {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Lay down a fresh filesystem across one or more empty devices.
    Format {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        #[clap(long, default_value_t = 4096)]
        block_size: u32,
        #[clap(long, default_value_t = 512 * 1024)]
        bucket_size: u32,
        #[clap(long, default_value_t = 1024)]
        nbuckets: u64,
    },
    /// Open an existing filesystem and print its superblock and space usage.
    Usage {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
    },
    /// Open an existing filesystem and check its allocation bookkeeping.
    Fsck {
        #[clap(required = true)]
        paths: Vec<PathBuf>,
        #[clap(long)]
        repair: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Params::parse();

    match args.command {
        Command::Format {
            paths,
            block_size,
            bucket_size,
            nbuckets,
        } => {
            let geometry = DeviceGeometry {
                block_size,
                bucket_size,
                nbuckets,
            };
            let specs: Vec<_> = paths.into_iter().map(|p| (p, geometry)).collect();
            let fs = Fs::format(&specs, Options::default())?;
            dump::dump_fs(&fs);
            fs.stop()?;
        }
        Command::Usage { paths } => {
            let fs = Fs::open(&paths, Options::default())?;
            dump::dump_fs(&fs);
            fs.stop()?;
        }
        Command::Fsck { paths, repair } => {
            let fs = Fs::open(&paths, Options::default())?;
            let report = fs.fsck(repair)?;
            dump::dump_fsck_report(&report);
            fs.stop()?;
        }
    }

    Ok(())
}
