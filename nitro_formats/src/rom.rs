// Cartridge ROM images: fixed header, icon/banner block, two processor
// executables, per-processor overlay tables, and an embedded Nitro
// filesystem. Saving re-lays the image from scratch and backpatches the
// header and FAT once the data offsets are known. Checksum fields are
// written as stored, never computed.

use std::fs::File as OsFile;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapOptions;

use crate::error::NitroError;
use crate::fs::{File, Filesystem};
use crate::util::{cv5_to_8, pad};

const HEADER_LEN: usize = 0x200;
const HEADER_REGION: u32 = 0x4000;
const SECTION_ALIGN: u32 = 0x200;
const BANNER_LEN: usize = 0x840;
const OVERLAY_ENTRY_LEN: usize = 0x20;

#[derive(Debug, Clone)]
pub struct RomHeader {
    pub game_title: [u8; 12],
    pub game_code: u32,
    pub maker_code: [u8; 2],
    pub unit_code: u8,
    pub encryption_seed_select: u8,
    pub device_capacity: u8,
    pub reserved: [u8; 7],
    pub reserved_dsi: u8,
    pub region: u8,
    pub version: u8,
    pub flags: u8,

    pub arm9_rom_offset: u32,
    pub arm9_entry_address: u32,
    pub arm9_load_address: u32,
    pub arm9_size: u32,
    pub arm7_rom_offset: u32,
    pub arm7_entry_address: u32,
    pub arm7_load_address: u32,
    pub arm7_size: u32,

    pub fnt_offset: u32,
    pub fnt_size: u32,
    pub fat_offset: u32,
    pub fat_size: u32,

    pub arm9_overlay_offset: u32,
    pub arm9_overlay_size: u32,
    pub arm7_overlay_offset: u32,
    pub arm7_overlay_size: u32,

    pub normal_cc_settings: u32,
    pub secure_cc_settings: u32,

    pub icon_banner_offset: u32,
    pub secure_area_crc: u16,
    pub secure_transfer_timeout: u16,

    pub arm9_autoload: u32,
    pub arm7_autoload: u32,

    pub secure_disable: u64,
    pub total_used_rom: u32,
    pub header_size: u32,
    pub reserved2: [u8; 0x38],
    pub logo: [u8; 0x9C],
    pub logo_checksum: u16,
    pub header_checksum: u16,
    pub debug_rom_offset: u32,
    pub debug_rom_size: u32,
    pub debug_ram_address: u32,
    pub reserved3: u32,
    pub reserved4: [u8; 0x90],
}

impl Default for RomHeader {
    fn default() -> Self {
        RomHeader {
            game_title: [0; 12],
            game_code: 0,
            maker_code: [0; 2],
            unit_code: 0,
            encryption_seed_select: 0,
            device_capacity: 0,
            reserved: [0; 7],
            reserved_dsi: 0,
            region: 0,
            version: 0,
            flags: 0,
            arm9_rom_offset: 0,
            arm9_entry_address: 0,
            arm9_load_address: 0,
            arm9_size: 0,
            arm7_rom_offset: 0,
            arm7_entry_address: 0,
            arm7_load_address: 0,
            arm7_size: 0,
            fnt_offset: 0,
            fnt_size: 0,
            fat_offset: 0,
            fat_size: 0,
            arm9_overlay_offset: 0,
            arm9_overlay_size: 0,
            arm7_overlay_offset: 0,
            arm7_overlay_size: 0,
            normal_cc_settings: 0,
            secure_cc_settings: 0,
            icon_banner_offset: 0,
            secure_area_crc: 0,
            secure_transfer_timeout: 0,
            arm9_autoload: 0,
            arm7_autoload: 0,
            secure_disable: 0,
            total_used_rom: 0,
            header_size: HEADER_REGION,
            reserved2: [0; 0x38],
            logo: [0; 0x9C],
            logo_checksum: 0,
            header_checksum: 0,
            debug_rom_offset: 0,
            debug_rom_size: 0,
            debug_ram_address: 0,
            reserved3: 0,
            reserved4: [0; 0x90],
        }
    }
}

impl RomHeader {
    pub fn parse<R: Read>(r: &mut R) -> Result<Self> {
        let mut h = RomHeader::default();
        r.read_exact(&mut h.game_title)?;
        h.game_code = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut h.maker_code)?;
        h.unit_code = r.read_u8()?;
        h.encryption_seed_select = r.read_u8()?;
        h.device_capacity = r.read_u8()?;
        r.read_exact(&mut h.reserved)?;
        h.reserved_dsi = r.read_u8()?;
        h.region = r.read_u8()?;
        h.version = r.read_u8()?;
        h.flags = r.read_u8()?;

        h.arm9_rom_offset = r.read_u32::<LittleEndian>()?;
        h.arm9_entry_address = r.read_u32::<LittleEndian>()?;
        h.arm9_load_address = r.read_u32::<LittleEndian>()?;
        h.arm9_size = r.read_u32::<LittleEndian>()?;
        h.arm7_rom_offset = r.read_u32::<LittleEndian>()?;
        h.arm7_entry_address = r.read_u32::<LittleEndian>()?;
        h.arm7_load_address = r.read_u32::<LittleEndian>()?;
        h.arm7_size = r.read_u32::<LittleEndian>()?;

        h.fnt_offset = r.read_u32::<LittleEndian>()?;
        h.fnt_size = r.read_u32::<LittleEndian>()?;
        h.fat_offset = r.read_u32::<LittleEndian>()?;
        h.fat_size = r.read_u32::<LittleEndian>()?;

        h.arm9_overlay_offset = r.read_u32::<LittleEndian>()?;
        h.arm9_overlay_size = r.read_u32::<LittleEndian>()?;
        h.arm7_overlay_offset = r.read_u32::<LittleEndian>()?;
        h.arm7_overlay_size = r.read_u32::<LittleEndian>()?;

        h.normal_cc_settings = r.read_u32::<LittleEndian>()?;
        h.secure_cc_settings = r.read_u32::<LittleEndian>()?;

        h.icon_banner_offset = r.read_u32::<LittleEndian>()?;
        h.secure_area_crc = r.read_u16::<LittleEndian>()?;
        h.secure_transfer_timeout = r.read_u16::<LittleEndian>()?;

        h.arm9_autoload = r.read_u32::<LittleEndian>()?;
        h.arm7_autoload = r.read_u32::<LittleEndian>()?;

        h.secure_disable = r.read_u64::<LittleEndian>()?;
        h.total_used_rom = r.read_u32::<LittleEndian>()?;
        h.header_size = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut h.reserved2)?;
        r.read_exact(&mut h.logo)?;
        h.logo_checksum = r.read_u16::<LittleEndian>()?;
        h.header_checksum = r.read_u16::<LittleEndian>()?;
        h.debug_rom_offset = r.read_u32::<LittleEndian>()?;
        h.debug_rom_size = r.read_u32::<LittleEndian>()?;
        h.debug_ram_address = r.read_u32::<LittleEndian>()?;
        h.reserved3 = r.read_u32::<LittleEndian>()?;
        r.read_exact(&mut h.reserved4)?;
        Ok(h)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.game_title)?;
        w.write_u32::<LittleEndian>(self.game_code)?;
        w.write_all(&self.maker_code)?;
        w.write_u8(self.unit_code)?;
        w.write_u8(self.encryption_seed_select)?;
        w.write_u8(self.device_capacity)?;
        w.write_all(&self.reserved)?;
        w.write_u8(self.reserved_dsi)?;
        w.write_u8(self.region)?;
        w.write_u8(self.version)?;
        w.write_u8(self.flags)?;

        w.write_u32::<LittleEndian>(self.arm9_rom_offset)?;
        w.write_u32::<LittleEndian>(self.arm9_entry_address)?;
        w.write_u32::<LittleEndian>(self.arm9_load_address)?;
        w.write_u32::<LittleEndian>(self.arm9_size)?;
        w.write_u32::<LittleEndian>(self.arm7_rom_offset)?;
        w.write_u32::<LittleEndian>(self.arm7_entry_address)?;
        w.write_u32::<LittleEndian>(self.arm7_load_address)?;
        w.write_u32::<LittleEndian>(self.arm7_size)?;

        w.write_u32::<LittleEndian>(self.fnt_offset)?;
        w.write_u32::<LittleEndian>(self.fnt_size)?;
        w.write_u32::<LittleEndian>(self.fat_offset)?;
        w.write_u32::<LittleEndian>(self.fat_size)?;

        w.write_u32::<LittleEndian>(self.arm9_overlay_offset)?;
        w.write_u32::<LittleEndian>(self.arm9_overlay_size)?;
        w.write_u32::<LittleEndian>(self.arm7_overlay_offset)?;
        w.write_u32::<LittleEndian>(self.arm7_overlay_size)?;

        w.write_u32::<LittleEndian>(self.normal_cc_settings)?;
        w.write_u32::<LittleEndian>(self.secure_cc_settings)?;

        w.write_u32::<LittleEndian>(self.icon_banner_offset)?;
        w.write_u16::<LittleEndian>(self.secure_area_crc)?;
        w.write_u16::<LittleEndian>(self.secure_transfer_timeout)?;

        w.write_u32::<LittleEndian>(self.arm9_autoload)?;
        w.write_u32::<LittleEndian>(self.arm7_autoload)?;

        w.write_u64::<LittleEndian>(self.secure_disable)?;
        w.write_u32::<LittleEndian>(self.total_used_rom)?;
        w.write_u32::<LittleEndian>(self.header_size)?;
        w.write_all(&self.reserved2)?;
        w.write_all(&self.logo)?;
        w.write_u16::<LittleEndian>(self.logo_checksum)?;
        w.write_u16::<LittleEndian>(self.header_checksum)?;
        w.write_u32::<LittleEndian>(self.debug_rom_offset)?;
        w.write_u32::<LittleEndian>(self.debug_rom_size)?;
        w.write_u32::<LittleEndian>(self.debug_ram_address)?;
        w.write_u32::<LittleEndian>(self.reserved3)?;
        w.write_all(&self.reserved4)?;
        Ok(())
    }

    pub fn title(&self) -> String {
        let end = self
            .game_title
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.game_title.len());
        String::from_utf8_lossy(&self.game_title[..end])
            .trim_end()
            .to_string()
    }
}

// on-disk order
pub const BANNER_LANGUAGES: [&str; 6] = [
    "japanese", "english", "french", "german", "italian", "spanish",
];

// Version, CRC slots, a 32x32 4bpp icon with a 16-color palette, and six
// localized titles.
#[derive(Debug, Clone)]
pub struct Banner {
    pub version: u16,
    pub crc: [u16; 4],
    pub reserved: [u8; 0x16],
    pub icon_bitmap: [u8; 0x200],
    pub icon_palette: [u16; 16],
    pub titles: [[u8; 0x100]; 6],
}

impl Default for Banner {
    fn default() -> Self {
        Banner {
            version: 1,
            crc: [0; 4],
            reserved: [0; 0x16],
            icon_bitmap: [0; 0x200],
            icon_palette: [0; 16],
            titles: [[0; 0x100]; 6],
        }
    }
}

impl Banner {
    pub fn parse<R: Read>(r: &mut R) -> Result<Self> {
        let mut b = Banner::default();
        b.version = r.read_u16::<LittleEndian>()?;
        for slot in &mut b.crc {
            *slot = r.read_u16::<LittleEndian>()?;
        }
        r.read_exact(&mut b.reserved)?;
        r.read_exact(&mut b.icon_bitmap)?;
        for entry in &mut b.icon_palette {
            *entry = r.read_u16::<LittleEndian>()?;
        }
        for title in &mut b.titles {
            r.read_exact(title)?;
        }
        Ok(b)
    }

    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u16::<LittleEndian>(self.version)?;
        for &slot in &self.crc {
            w.write_u16::<LittleEndian>(slot)?;
        }
        w.write_all(&self.reserved)?;
        w.write_all(&self.icon_bitmap)?;
        for &entry in &self.icon_palette {
            w.write_u16::<LittleEndian>(entry)?;
        }
        for title in &self.titles {
            w.write_all(title)?;
        }
        Ok(())
    }

    // UTF-16LE on disk, indexed per BANNER_LANGUAGES.
    pub fn title(&self, language: usize) -> Option<String> {
        let raw = self.titles.get(language)?;
        let units: Vec<u16> = raw
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        Some(String::from_utf16_lossy(&units))
    }

    pub fn set_title(&mut self, language: usize, text: &str) {
        if let Some(raw) = self.titles.get_mut(language) {
            raw.fill(0);
            for (chunk, unit) in raw.chunks_exact_mut(2).zip(text.encode_utf16()) {
                chunk.copy_from_slice(&unit.to_le_bytes());
            }
        }
    }

    // Palette slot 0 is transparent.
    pub fn icon_rgba(&self) -> Vec<u8> {
        let mut palette = [[0u8; 4]; 16];
        for (i, color) in palette.iter_mut().enumerate() {
            let raw = self.icon_palette[i];
            *color = [
                cv5_to_8((raw & 0x1F) as u8),
                cv5_to_8(((raw >> 5) & 0x1F) as u8),
                cv5_to_8(((raw >> 10) & 0x1F) as u8),
                if i == 0 { 0x00 } else { 0xFF },
            ];
        }

        // 4bpp indices, stored as 8x8 tiles in a 4x4 grid.
        let mut indices = [0u8; 0x400];
        for (i, &byte) in self.icon_bitmap.iter().enumerate() {
            indices[i * 2] = byte & 0x0F;
            indices[i * 2 + 1] = byte >> 4;
        }

        let mut out = vec![0u8; 32 * 32 * 4];
        let mut pixel = 0;
        for tile_y in 0..4 {
            for tile_x in 0..4 {
                for y in 0..8 {
                    for x in 0..8 {
                        let dst = (((tile_y * 8) + y) * 32 + (tile_x * 8) + x) * 4;
                        out[dst..dst + 4].copy_from_slice(&palette[indices[pixel] as usize]);
                        pixel += 1;
                    }
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processor {
    Arm9,
    Arm7,
}

// The backing payload lives in the ROM's attachment list for the processor,
// paired by canonical name; file_id is the non-owning link.
#[derive(Debug, Clone, Default)]
pub struct Overlay {
    pub id: u32,
    pub ram_address: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub static_init_start: u32,
    pub static_init_end: u32,
    pub file_id: u32,
    pub compressed_size: u32,
    pub flags: u8,
}

impl Overlay {
    fn parse<R: Read>(r: &mut R) -> Result<Self> {
        let id = r.read_u32::<LittleEndian>()?;
        let ram_address = r.read_u32::<LittleEndian>()?;
        let ram_size = r.read_u32::<LittleEndian>()?;
        let bss_size = r.read_u32::<LittleEndian>()?;
        let static_init_start = r.read_u32::<LittleEndian>()?;
        let static_init_end = r.read_u32::<LittleEndian>()?;
        let file_id = r.read_u32::<LittleEndian>()?;
        let packed = r.read_u32::<LittleEndian>()?;
        Ok(Overlay {
            id,
            ram_address,
            ram_size,
            bss_size,
            static_init_start,
            static_init_end,
            file_id,
            compressed_size: packed & 0x00FF_FFFF,
            flags: (packed >> 24) as u8,
        })
    }

    fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        w.write_u32::<LittleEndian>(self.id)?;
        w.write_u32::<LittleEndian>(self.ram_address)?;
        w.write_u32::<LittleEndian>(self.ram_size)?;
        w.write_u32::<LittleEndian>(self.bss_size)?;
        w.write_u32::<LittleEndian>(self.static_init_start)?;
        w.write_u32::<LittleEndian>(self.static_init_end)?;
        w.write_u32::<LittleEndian>(self.file_id)?;
        w.write_u32::<LittleEndian>(
            (self.compressed_size & 0x00FF_FFFF) | ((self.flags as u32) << 24),
        )?;
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Rom {
    pub header: RomHeader,
    pub banner: Banner,
    fs: Filesystem,
    pub arm9: File,
    pub arm7: File,
    pub overlays9: Vec<Overlay>,
    pub overlays7: Vec<Overlay>,
    /// Overlay payloads, outside the FNT tree.
    pub overlay_files9: Vec<File>,
    pub overlay_files7: Vec<File>,
}

impl Rom {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path)
            .with_context(|| format!("opening ROM image at {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("memory-mapping ROM image {}", path.display()))?;
        Self::from_bytes(&mmap).with_context(|| format!("parsing ROM image {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        ensure!(
            bytes.len() >= HEADER_LEN,
            NitroError::MalformedContainer("ROM image shorter than its header")
        );
        let mut cursor = Cursor::new(bytes);
        let header = RomHeader::parse(&mut cursor)?;

        cursor.seek(SeekFrom::Start(header.icon_banner_offset as u64))?;
        let banner = Banner::parse(&mut cursor).context("reading icon/banner block")?;

        cursor.seek(SeekFrom::Start(header.fat_offset as u64))?;
        let fat = Filesystem::parse_fat(&mut cursor, header.fat_size as usize / 8)?;
        let mut files = Vec::with_capacity(fat.len());
        for (id, &(start, end)) in fat.iter().enumerate() {
            let data = bytes
                .get(start as usize..end as usize)
                .context("FAT entry extends beyond the image")?
                .to_vec();
            let mut file = File::new(format!("{id}.bin"), data);
            file.id = id as u16;
            files.push(file);
        }

        cursor.seek(SeekFrom::Start(header.fnt_offset as u64))?;
        let (fs, mut leftover) =
            Filesystem::from_fnt_with_leftovers_stream(&mut cursor, header.fnt_size as usize, files)?;

        let slice_file = |offset: u32, size: u32, name: &str| -> Result<File> {
            let start = offset as usize;
            let data = bytes
                .get(start..start + size as usize)
                .with_context(|| format!("{name} extends beyond the image"))?
                .to_vec();
            Ok(File::new(name, data))
        };
        let arm9 = slice_file(header.arm9_rom_offset, header.arm9_size, "arm9.bin")?;
        let arm7 = slice_file(header.arm7_rom_offset, header.arm7_size, "arm7.bin")?;

        let mut read_overlays = |offset: u32, size: u32, proc: Processor| -> Result<(Vec<Overlay>, Vec<File>)> {
            let start = offset as usize;
            let mut cursor = Cursor::new(
                bytes
                    .get(start..start + size as usize)
                    .context("overlay table extends beyond the image")?,
            );
            let mut overlays = Vec::new();
            let mut payloads = Vec::new();
            for _ in 0..size as usize / OVERLAY_ENTRY_LEN {
                let overlay = Overlay::parse(&mut cursor)?;
                let slot = leftover
                    .iter()
                    .position(|f| f.id as u32 == overlay.file_id);
                match slot {
                    Some(index) => {
                        let mut file = leftover.remove(index);
                        let tag = match proc {
                            Processor::Arm9 => 9,
                            Processor::Arm7 => 7,
                        };
                        file.name = payload_name(tag, overlay.id);
                        payloads.push(file);
                    }
                    None => log::warn!(
                        "overlay {} references missing file id {}",
                        overlay.id,
                        overlay.file_id
                    ),
                }
                overlays.push(overlay);
            }
            Ok((overlays, payloads))
        };
        let (overlays9, overlay_files9) = read_overlays(
            header.arm9_overlay_offset,
            header.arm9_overlay_size,
            Processor::Arm9,
        )?;
        let (overlays7, overlay_files7) = read_overlays(
            header.arm7_overlay_offset,
            header.arm7_overlay_size,
            Processor::Arm7,
        )?;

        if !leftover.is_empty() {
            log::warn!(
                "{} FAT entries are referenced by neither the FNT nor an overlay table",
                leftover.len()
            );
        }

        Ok(Rom {
            header,
            banner,
            fs,
            arm9,
            arm7,
            overlays9,
            overlays7,
            overlay_files9,
            overlay_files7,
        })
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    pub fn filesystem_mut(&mut self) -> &mut Filesystem {
        &mut self.fs
    }

    pub fn set_filesystem(&mut self, fs: Filesystem) {
        self.fs = fs;
    }

    // Merged view: the filesystem tree plus the synthetic overlays9/ and
    // overlays7/ attachment folders.
    pub fn get_file(&self, path: &str) -> Option<&File> {
        if let Some(name) = path.strip_prefix("overlays9/") {
            return self.overlay_files9.iter().find(|f| f.name == name);
        }
        if let Some(name) = path.strip_prefix("overlays7/") {
            return self.overlay_files7.iter().find(|f| f.name == name);
        }
        self.fs.get_file(path)
    }

    pub fn overlay_file(&self, proc: Processor, overlay_id: u32) -> Option<&File> {
        let (overlays, files, tag) = match proc {
            Processor::Arm9 => (&self.overlays9, &self.overlay_files9, 9),
            Processor::Arm7 => (&self.overlays7, &self.overlay_files7, 7),
        };
        overlays.iter().find(|o| o.id == overlay_id)?;
        let name = payload_name(tag, overlay_id);
        files.iter().find(|f| f.name == name)
    }

    // Undoes the tail compression when the table entry flags it.
    pub fn overlay_payload(&self, proc: Processor, overlay_id: u32) -> Result<Option<Vec<u8>>> {
        let overlays = match proc {
            Processor::Arm9 => &self.overlays9,
            Processor::Arm7 => &self.overlays7,
        };
        let Some(overlay) = overlays.iter().find(|o| o.id == overlay_id) else {
            return Ok(None);
        };
        let Some(file) = self.overlay_file(proc, overlay_id) else {
            return Ok(None);
        };
        if overlay.flags & 0x01 != 0 {
            let data = crate::blz::decompress(&file.data)
                .with_context(|| format!("decompressing overlay {overlay_id}"))?;
            Ok(Some(data))
        } else {
            Ok(Some(file.data.clone()))
        }
    }

    pub fn dump(&self, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join(&self.arm9.name), &self.arm9.data)?;
        std::fs::write(dest.join(&self.arm7.name), &self.arm7.data)?;
        self.fs.dump(dest)
    }

    // The FNT is rebuilt before the FAT so the file id assignment matches
    // the FAT layout order.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        // Overlay payloads occupy the low file ids, in table order. An entry
        // whose payload went missing at load gets an out-of-range file id so
        // the saved table cannot point at an unrelated file.
        let mut next_id: u16 = 0;
        let mut assign = |overlays: &mut [Overlay], files: &mut [File], tag: u32| {
            for overlay in overlays.iter_mut() {
                let name = payload_name(tag, overlay.id);
                match files.iter_mut().find(|f| f.name == name) {
                    Some(file) => {
                        overlay.file_id = next_id as u32;
                        file.id = next_id;
                        next_id += 1;
                    }
                    None => {
                        overlay.file_id = u32::MAX;
                        log::warn!(
                            "overlay {} has no payload, writing an unresolved file id",
                            overlay.id
                        );
                    }
                }
            }
        };
        assign(&mut self.overlays9, &mut self.overlay_files9, 9);
        assign(&mut self.overlays7, &mut self.overlay_files7, 7);
        let first_ordinary = next_id;
        self.fs.reindex(first_ordinary);
        let fnt = self.fs.write_fnt(first_ordinary);

        let overlay_count = self.overlay_files9.len() + self.overlay_files7.len();
        let file_count = overlay_count + self.fs.file_count();
        let mut ranges = vec![(0u32, 0u32); file_count];

        let mut out: Vec<u8> = Vec::new();
        let align_to = |out: &mut Vec<u8>, boundary: u32| {
            out.resize(pad(out.len() as u32, boundary) as usize, 0);
        };

        // Header region.
        out.resize(HEADER_REGION as usize, 0);

        self.header.arm9_rom_offset = out.len() as u32;
        self.header.arm9_size = self.arm9.data.len() as u32;
        out.extend_from_slice(&self.arm9.data);
        align_to(&mut out, SECTION_ALIGN);

        let write_overlay_section =
            |out: &mut Vec<u8>,
             ranges: &mut Vec<(u32, u32)>,
             overlays: &[Overlay],
             payloads: &[File]|
             -> Result<(u32, u32)> {
                if overlays.is_empty() {
                    return Ok((0, 0));
                }
                let table_offset = out.len() as u32;
                let mut table = Cursor::new(Vec::new());
                for overlay in overlays {
                    overlay.write(&mut table)?;
                }
                out.extend_from_slice(table.get_ref());
                let table_size = (overlays.len() * OVERLAY_ENTRY_LEN) as u32;
                out.resize(pad(out.len() as u32, SECTION_ALIGN) as usize, 0);
                for file in payloads {
                    let start = out.len() as u32;
                    out.extend_from_slice(&file.data);
                    ranges[file.id as usize] = (start, start + file.data.len() as u32);
                    out.resize(pad(out.len() as u32, SECTION_ALIGN) as usize, 0);
                }
                Ok((table_offset, table_size))
            };

        let (ov9_offset, ov9_size) =
            write_overlay_section(&mut out, &mut ranges, &self.overlays9, &self.overlay_files9)?;
        self.header.arm9_overlay_offset = ov9_offset;
        self.header.arm9_overlay_size = ov9_size;

        self.header.arm7_rom_offset = out.len() as u32;
        self.header.arm7_size = self.arm7.data.len() as u32;
        out.extend_from_slice(&self.arm7.data);
        align_to(&mut out, SECTION_ALIGN);

        let (ov7_offset, ov7_size) =
            write_overlay_section(&mut out, &mut ranges, &self.overlays7, &self.overlay_files7)?;
        self.header.arm7_overlay_offset = ov7_offset;
        self.header.arm7_overlay_size = ov7_size;

        self.header.fnt_offset = out.len() as u32;
        self.header.fnt_size = fnt.len() as u32;
        out.extend_from_slice(&fnt);
        align_to(&mut out, SECTION_ALIGN);

        // FAT placeholder, backpatched below.
        self.header.fat_offset = out.len() as u32;
        self.header.fat_size = (file_count * 8) as u32;
        out.resize(out.len() + file_count * 8, 0);
        align_to(&mut out, SECTION_ALIGN);

        self.header.icon_banner_offset = out.len() as u32;
        let mut banner = Cursor::new(Vec::with_capacity(BANNER_LEN));
        self.banner.write(&mut banner)?;
        out.extend_from_slice(banner.get_ref());
        align_to(&mut out, SECTION_ALIGN);

        for file in self.fs.files_in_order() {
            let start = out.len() as u32;
            out.extend_from_slice(&file.data);
            ranges[file.id as usize] = (start, start + file.data.len() as u32);
            out.resize(pad(out.len() as u32, SECTION_ALIGN) as usize, 0);
        }

        // Backpatch the FAT.
        let fat_at = self.header.fat_offset as usize;
        for (index, &(start, end)) in ranges.iter().enumerate() {
            let slot = fat_at + index * 8;
            out[slot..slot + 4].copy_from_slice(&start.to_le_bytes());
            out[slot + 4..slot + 8].copy_from_slice(&end.to_le_bytes());
        }

        // Backpatch header totals; checksums stay as stored.
        self.header.total_used_rom = out.len() as u32;
        self.header.header_size = HEADER_REGION;
        self.header.device_capacity = device_capacity_for(out.len() as u32);
        let mut header = Cursor::new(Vec::with_capacity(HEADER_LEN));
        self.header.write(&mut header)?;
        out[..HEADER_LEN].copy_from_slice(header.get_ref());

        Ok(out)
    }

    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), bytes)
            .with_context(|| format!("writing ROM image {}", path.as_ref().display()))
    }
}

fn payload_name(tag: u32, overlay_id: u32) -> String {
    format!("overlay{tag}_{overlay_id:04}.bin")
}

// smallest n with 128KiB << n covering the image
fn device_capacity_for(total: u32) -> u8 {
    let mut n = 0u8;
    while (0x20000u64 << n) < total as u64 {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rom() -> Rom {
        let mut fs = Filesystem::new_tree();
        let root = fs.root().unwrap();
        fs.add_file(root, File::new("common.bin", vec![0x11; 6]));
        let data = fs.add_folder(root, "data");
        fs.add_file(data, File::new("field.narc", vec![0x22; 10]));

        let mut rom = Rom::default();
        rom.set_filesystem(fs);
        rom.header.game_title[..6].copy_from_slice(b"SAMPLE");
        rom.header.game_code = 0x41444141;
        rom.arm9 = File::new("arm9.bin", vec![0x99; 0x40]);
        rom.arm7 = File::new("arm7.bin", vec![0x77; 0x20]);
        rom.overlays9.push(Overlay {
            id: 0,
            ram_address: 0x0200_0000,
            ram_size: 0x100,
            bss_size: 0x10,
            static_init_start: 0x0200_0040,
            static_init_end: 0x0200_0080,
            file_id: 0,
            compressed_size: 0,
            flags: 0,
        });
        rom.overlay_files9.push(File::new("overlay9_0000.bin", vec![0xEE; 0x30]));
        rom.banner.set_title(1, "Sample Game");
        rom
    }

    #[test]
    fn save_then_load_round_trips_tree_and_payloads() {
        let mut rom = sample_rom();
        let bytes = rom.to_bytes().unwrap();

        let loaded = Rom::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.header.title(), "SAMPLE");
        assert_eq!(loaded.banner.title(1).as_deref(), Some("Sample Game"));
        assert_eq!(loaded.arm9.data, vec![0x99; 0x40]);
        assert_eq!(loaded.arm7.data, vec![0x77; 0x20]);
        assert_eq!(loaded.get_file("common.bin").unwrap().data, vec![0x11; 6]);
        assert_eq!(
            loaded.get_file("data/field.narc").unwrap().data,
            vec![0x22; 10]
        );
        assert_eq!(loaded.overlays9.len(), 1);
        assert_eq!(loaded.overlays9[0].ram_size, 0x100);
        assert_eq!(
            loaded.overlay_file(Processor::Arm9, 0).unwrap().data,
            vec![0xEE; 0x30]
        );
        assert_eq!(
            loaded.get_file("overlays9/overlay9_0000.bin").unwrap().data,
            vec![0xEE; 0x30]
        );
        assert!(loaded.overlays7.is_empty());
    }

    #[test]
    fn header_fields_are_backpatched() {
        let mut rom = sample_rom();
        let bytes = rom.to_bytes().unwrap();
        let loaded = Rom::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.header.arm9_rom_offset, HEADER_REGION);
        assert_eq!(loaded.header.total_used_rom, bytes.len() as u32);
        assert_eq!(loaded.header.header_size, HEADER_REGION);
        // Checksums are a known gap: written as stored, never computed.
        assert_eq!(loaded.header.header_checksum, 0);
    }

    #[test]
    fn overlay_payload_honors_compression_flag() {
        let mut rom = sample_rom();
        let plain = rom
            .overlay_payload(Processor::Arm9, 0)
            .unwrap()
            .expect("overlay 0 present");
        assert_eq!(plain, vec![0xEE; 0x30]);
        assert!(rom.overlay_payload(Processor::Arm9, 9).unwrap().is_none());

        // Flagged compressed with a zero extra-size footer: pass-through.
        rom.overlays9[0].flags = 0x01;
        let mut data = vec![0xAB; 8];
        data.extend_from_slice(&8u32.to_le_bytes()); // footer: header/compressed size
        data.extend_from_slice(&0u32.to_le_bytes()); // extra size 0
        rom.overlay_files9[0].data = data.clone();
        let payload = rom.overlay_payload(Processor::Arm9, 0).unwrap().unwrap();
        assert_eq!(payload, data);
    }

    #[test]
    fn overflowing_header_offsets_are_errors_not_panics() {
        let mut rom = sample_rom();
        let base = rom.to_bytes().unwrap();

        let mut bytes = base.clone();
        bytes[0x20..0x24].copy_from_slice(&u32::MAX.to_le_bytes()); // arm9 offset
        assert!(Rom::from_bytes(&bytes).is_err());

        let mut bytes = base;
        bytes[0x50..0x54].copy_from_slice(&u32::MAX.to_le_bytes()); // arm9 overlay table offset
        assert!(Rom::from_bytes(&bytes).is_err());
    }

    #[test]
    fn missing_overlay_payload_saves_an_unresolved_file_id() {
        let mut rom = sample_rom();
        rom.overlays9.insert(
            0,
            Overlay {
                id: 1,
                ..Overlay::default()
            },
        );

        let bytes = rom.to_bytes().unwrap();
        assert_eq!(rom.overlays9[0].file_id, u32::MAX);
        assert_eq!(rom.overlays9[1].file_id, 0);

        let loaded = Rom::from_bytes(&bytes).unwrap();
        assert_eq!(loaded.overlays9.len(), 2);
        assert!(loaded.overlay_file(Processor::Arm9, 1).is_none());
        assert_eq!(
            loaded.overlay_file(Processor::Arm9, 0).unwrap().data,
            vec![0xEE; 0x30]
        );
    }

    #[test]
    fn banner_titles_encode_as_utf16() {
        let mut banner = Banner::default();
        banner.set_title(0, "ポケモン");
        assert_eq!(banner.title(0).as_deref(), Some("ポケモン"));
    }

    #[test]
    fn icon_decodes_palette_zero_as_transparent() {
        let mut banner = Banner::default();
        banner.icon_palette[1] = 0x7FFF; // white
        banner.icon_bitmap[0] = 0x10; // pixel 0 -> index 0, pixel 1 -> index 1
        let rgba = banner.icon_rgba();
        assert_eq!(&rgba[0..4], &[0, 0, 0, 0]);
        assert_eq!(&rgba[4..8], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn device_capacity_covers_image_size() {
        assert_eq!(device_capacity_for(0x20000), 0);
        assert_eq!(device_capacity_for(0x20001), 1);
        assert_eq!(device_capacity_for(0x0100_0000), 7);
    }
}
