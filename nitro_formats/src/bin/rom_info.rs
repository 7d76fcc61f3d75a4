// Inspect a cartridge ROM image: header, banner titles, overlay tables,
// filesystem tree.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use nitro_formats::rom::BANNER_LANGUAGES;
use nitro_formats::{Folder, Processor, Rom};

#[derive(Parser, Debug)]
#[command(about = "Inspect Nitro ROM images", version)]
struct Args {
    /// ROM image to inspect
    #[arg(long, value_name = "PATH")]
    rom: PathBuf,

    /// Print the localized banner titles
    #[arg(long)]
    titles: bool,

    /// Print both overlay tables
    #[arg(long)]
    overlays: bool,

    /// Print the filesystem tree
    #[arg(long)]
    tree: bool,

    /// Extract executables and the filesystem tree into a directory
    #[arg(long, value_name = "DIR")]
    extract: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let rom = Rom::open(&args.rom)?;

    println!("title        : {}", rom.header.title());
    println!("game code    : {:#010x}", rom.header.game_code);
    println!(
        "capacity     : {} KiB (class {})",
        (0x20000u64 << rom.header.device_capacity) / 1024,
        rom.header.device_capacity
    );
    println!("arm9         : {} bytes", rom.arm9.size());
    println!("arm7         : {} bytes", rom.arm7.size());
    println!("files        : {}", rom.filesystem().file_count());
    println!(
        "overlays     : {} arm9, {} arm7",
        rom.overlays9.len(),
        rom.overlays7.len()
    );

    if args.titles {
        for (index, language) in BANNER_LANGUAGES.iter().enumerate() {
            if let Some(title) = rom.banner.title(index) {
                println!("title[{language}]: {}", title.replace('\n', " / "));
            }
        }
    }

    if args.overlays {
        for (proc, overlays) in [
            (Processor::Arm9, &rom.overlays9),
            (Processor::Arm7, &rom.overlays7),
        ] {
            for overlay in overlays {
                let size = rom
                    .overlay_file(proc, overlay.id)
                    .map_or(0, |file| file.size());
                println!(
                    "{proc:?} overlay {:4}  ram {:#010x}+{:#x}  file {} ({} bytes)",
                    overlay.id, overlay.ram_address, overlay.ram_size, overlay.file_id, size
                );
            }
        }
    }

    if args.tree {
        let mut on_folder = |folder: &Folder| println!("{}/", folder.name);
        let mut on_file = |file: &nitro_formats::File| {
            println!("  {} ({} bytes)", file.name, file.size());
        };
        rom.filesystem().traverse(&mut on_folder, &mut on_file);
    }

    if let Some(dest) = args.extract {
        rom.dump(&dest)?;
        println!("extracted to {}", dest.display());
    }

    Ok(())
}
