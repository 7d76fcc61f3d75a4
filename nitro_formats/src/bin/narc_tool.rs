// List, extract, and pack NARC archives.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use nitro_formats::{File, Filesystem, Narc};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(about = "Work with NARC archives", version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every file path in an archive
    List {
        /// Archive to list
        #[arg(value_name = "NARC")]
        archive: PathBuf,
    },
    /// Extract an archive into a directory
    Extract {
        /// Archive to extract
        #[arg(value_name = "NARC")]
        archive: PathBuf,

        /// Destination directory
        #[arg(long, value_name = "DIR", default_value = "extracted")]
        dest: PathBuf,
    },
    /// Pack a directory tree into a new archive
    Pack {
        /// Directory whose contents become the archive root
        #[arg(value_name = "DIR")]
        root: PathBuf,

        /// Output archive path
        #[arg(long, value_name = "NARC")]
        output: PathBuf,

        /// Store files without directory records
        #[arg(long)]
        flat: bool,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    match Args::parse().command {
        Command::List { archive } => {
            let narc = Narc::open(&archive)?;
            narc.filesystem().traverse(
                &mut |folder| {
                    if !folder.name.is_empty() {
                        println!("{}/", folder.name);
                    }
                },
                &mut |file| println!("  {} ({} bytes)", file.name, file.size()),
            );
            println!("{} files", narc.file_count());
        }
        Command::Extract { archive, dest } => {
            let narc = Narc::open(&archive)?;
            narc.dump(&dest)
                .with_context(|| format!("extracting into {}", dest.display()))?;
            println!("extracted {} files to {}", narc.file_count(), dest.display());
        }
        Command::Pack { root, output, flat } => {
            if !root.is_dir() {
                bail!("{} is not a directory", root.display());
            }
            let fs = if flat {
                collect_flat(&root)?
            } else {
                collect_tree(&root)?
            };
            let mut narc = Narc::from_filesystem(fs);
            narc.save(&output)?;
            println!("packed {} files into {}", narc.file_count(), output.display());
        }
    }
    Ok(())
}

/// Walk `root` depth-first (names sorted) and rebuild it as a filesystem
/// tree. The walk order fixes the on-disk file id order.
fn collect_tree(root: &Path) -> Result<Filesystem> {
    let mut fs = Filesystem::new_tree();
    let Some(root_id) = fs.root() else {
        bail!("tree filesystem has no root");
    };
    let mut stack = vec![root_id];

    for entry in WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry?;
        stack.truncate(entry.depth());
        let Some(&parent) = stack.last() else {
            bail!("walk produced an entry with no parent folder");
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().is_dir() {
            let id = fs.add_folder(parent, name);
            stack.push(id);
        } else if entry.file_type().is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            fs.add_file(parent, File::new(name, data));
        }
    }
    Ok(fs)
}

fn collect_flat(root: &Path) -> Result<Filesystem> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
    {
        let entry = entry?;
        if entry.file_type().is_file() {
            let data = fs::read(entry.path())
                .with_context(|| format!("reading {}", entry.path().display()))?;
            files.push(File::new(
                entry.file_name().to_string_lossy().into_owned(),
                data,
            ));
        }
    }
    Ok(Filesystem::new_flat(files))
}
