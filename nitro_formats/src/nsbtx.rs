// TEX0 texture/palette sections and the standalone BTX0 container. Textures
// decode to one packed sample per pixel; RGBA conversion takes the palette at
// call time because the texture/palette pairing is a by-name material
// reference, not part of the section. Palette records carry no length field;
// the color count is inferred from the next distinct palette offset in
// dictionary order, falling back to the end of the data region.

use std::collections::HashMap;
use std::fs::File as OsFile;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt};
use memmap2::MmapOptions;
use serde::Serialize;

use crate::dict::{ResourceDict, read_dict};
use crate::error::NitroError;
use crate::util::{cv3_to_8, cv5_to_8, s3tc_blend};

// 3-bit format tag from the texture parameter word
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TextureFormat {
    /// Format 0 carries no pixel data this decoder understands.
    None,
    /// 3-bit alpha plus 5-bit palette index per byte.
    A3I5,
    Palette2bpp,
    Palette4bpp,
    Palette8bpp,
    /// 4x4 texel blocks, 2 bits per texel plus a 16-bit color-table
    /// descriptor per block.
    Compressed4x4,
    /// 5-bit alpha plus 3-bit palette index per byte.
    A5I3,
    /// Direct RGB555, one 16-bit sample per pixel.
    Direct,
}

impl TextureFormat {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => TextureFormat::A3I5,
            2 => TextureFormat::Palette2bpp,
            3 => TextureFormat::Palette4bpp,
            4 => TextureFormat::Palette8bpp,
            5 => TextureFormat::Compressed4x4,
            6 => TextureFormat::A5I3,
            7 => TextureFormat::Direct,
            _ => TextureFormat::None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Texture {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    pub color0_transparent: bool,
    #[serde(skip)]
    samples: Vec<u32>,
}

impl Texture {
    pub fn new(
        format: TextureFormat,
        width: u32,
        height: u32,
        color0_transparent: bool,
        samples: Vec<u32>,
    ) -> Self {
        Texture {
            format,
            width,
            height,
            color0_transparent,
            samples,
        }
    }

    // One dictionary item: the parameter word, then the pixel data it points
    // at, restoring the cursor afterwards.
    pub(crate) fn parse(cursor: &mut Cursor<&[u8]>, data_base: u64) -> Result<Self> {
        let params = cursor.read_u32::<LittleEndian>()?;
        let format = TextureFormat::from_bits((params >> 26) as u8);
        let width = 8u32 << ((params >> 20) & 0x07);
        let height = 8u32 << ((params >> 23) & 0x07);
        let color0_transparent = (params >> 29) & 0x01 != 0;
        let data_offset = ((params & 0xFFFF) << 3) as u64;

        let here = cursor.position();
        cursor.seek(SeekFrom::Start(data_base + data_offset))?;
        let samples = decode_samples(format, width, height, cursor)
            .context("decoding texture pixel data")?;
        cursor.seek(SeekFrom::Start(here))?;

        Ok(Texture {
            format,
            width,
            height,
            color0_transparent,
            samples,
        })
    }

    pub fn samples(&self) -> &[u32] {
        &self.samples
    }

    // The palette is mutable for the 4x4 format's color-table cache.
    pub fn to_rgba(&self, palette: &mut Palette) -> Vec<u8> {
        let mut out = vec![0u8; self.samples.len() * 4];
        for (pixel, &sample) in self.samples.iter().enumerate() {
            let dst = pixel * 4;
            match self.format {
                TextureFormat::Palette2bpp
                | TextureFormat::Palette4bpp
                | TextureFormat::Palette8bpp => {
                    let index = sample as usize;
                    let [r, g, b] = palette.color(index);
                    let alpha = if index == 0 && self.color0_transparent {
                        0x00
                    } else {
                        0xFF
                    };
                    out[dst..dst + 4].copy_from_slice(&[r, g, b, alpha]);
                }
                TextureFormat::A3I5 | TextureFormat::A5I3 => {
                    let [r, g, b] = palette.color((sample >> 16) as usize);
                    out[dst..dst + 4].copy_from_slice(&[r, g, b, (sample & 0xFF) as u8]);
                }
                TextureFormat::Compressed4x4 => {
                    let table = palette.color_table(sample as u16);
                    out[dst..dst + 4].copy_from_slice(&table[(sample >> 16) as usize & 0x03]);
                }
                TextureFormat::Direct => {
                    out[dst..dst + 4].copy_from_slice(&[
                        cv5_to_8((sample & 0x1F) as u8),
                        cv5_to_8(((sample >> 5) & 0x1F) as u8),
                        cv5_to_8(((sample >> 10) & 0x1F) as u8),
                        0xFF,
                    ]);
                }
                TextureFormat::None => {}
            }
        }
        out
    }
}

// Sample packing: indexed formats store the raw index; A3I5/A5I3 store
// index << 16 | alpha8; 4x4 blocks store texel_index << 16 | descriptor;
// direct stores the RGB555 word.
fn decode_samples(
    format: TextureFormat,
    width: u32,
    height: u32,
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<u32>> {
    let pixels = (width * height) as usize;
    let mut samples = vec![0u32; pixels];
    match format {
        TextureFormat::None => {
            log::warn!("{}, leaving pixels zeroed", NitroError::UnsupportedFormat(0));
        }
        TextureFormat::Palette2bpp => {
            for chunk in samples.chunks_mut(4) {
                let mut byte = cursor.read_u8()?;
                for sample in chunk {
                    *sample = (byte & 0x03) as u32;
                    byte >>= 2;
                }
            }
        }
        TextureFormat::Palette4bpp => {
            for chunk in samples.chunks_mut(2) {
                let byte = cursor.read_u8()?;
                chunk[0] = (byte & 0x0F) as u32;
                chunk[1] = (byte >> 4) as u32;
            }
        }
        TextureFormat::Palette8bpp => {
            for sample in &mut samples {
                *sample = cursor.read_u8()? as u32;
            }
        }
        TextureFormat::A3I5 => {
            for sample in &mut samples {
                let byte = cursor.read_u8()?;
                *sample = (((byte & 0x1F) as u32) << 16) | cv3_to_8(byte >> 5) as u32;
            }
        }
        TextureFormat::A5I3 => {
            for sample in &mut samples {
                let byte = cursor.read_u8()?;
                *sample = (((byte & 0x07) as u32) << 16) | cv5_to_8(byte >> 3) as u32;
            }
        }
        TextureFormat::Compressed4x4 => {
            for block_y in (0..height).step_by(4) {
                for block_x in (0..width).step_by(4) {
                    let mut texels = cursor.read_u32::<LittleEndian>()?;
                    let descriptor = cursor.read_u16::<LittleEndian>()? as u32;
                    for y in 0..4 {
                        for x in 0..4 {
                            let dst = ((block_y + y) * width + block_x + x) as usize;
                            samples[dst] = ((texels & 0x03) << 16) | descriptor;
                            texels >>= 2;
                        }
                    }
                }
            }
        }
        TextureFormat::Direct => {
            for sample in &mut samples {
                *sample = cursor.read_u16::<LittleEndian>()? as u32;
            }
        }
    }
    Ok(samples)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Palette {
    colors: Vec<[u8; 3]>,
    #[serde(skip)]
    color_tables: HashMap<u16, [[u8; 4]; 4]>,
}

impl Palette {
    pub fn from_colors(colors: Vec<[u8; 3]>) -> Self {
        Palette {
            colors,
            color_tables: HashMap::new(),
        }
    }

    pub fn colors(&self) -> &[[u8; 3]] {
        &self.colors
    }

    fn color(&self, index: usize) -> [u8; 3] {
        self.colors.get(index).copied().unwrap_or([0, 0, 0])
    }

    // The descriptor's high 2 bits select how entries 2 and 3 derive from
    // the base colors; the low 14 bits index the first base color.
    pub fn color_table(&mut self, descriptor: u16) -> [[u8; 4]; 4] {
        if let Some(table) = self.color_tables.get(&descriptor) {
            return *table;
        }
        let mode = descriptor >> 14;
        let base = (descriptor & 0x3FFF) as usize;

        let c0 = self.color(base);
        let c1 = self.color(base + 1);
        let opaque = |c: [u8; 3]| [c[0], c[1], c[2], 0xFF];

        let mut table = [opaque(c0), opaque(c1), [0, 0, 0, 0], [0, 0, 0, 0]];
        match mode {
            0 => table[2] = opaque(self.color(base + 2)),
            1 => {
                table[2] = [
                    ((c0[0] as u16 + c1[0] as u16) >> 1) as u8,
                    ((c0[1] as u16 + c1[1] as u16) >> 1) as u8,
                    ((c0[2] as u16 + c1[2] as u16) >> 1) as u8,
                    0xFF,
                ];
            }
            2 => {
                table[2] = opaque(self.color(base + 2));
                table[3] = opaque(self.color(base + 3));
            }
            _ => {
                table[2] = [
                    s3tc_blend(c1[0], c0[0]),
                    s3tc_blend(c1[1], c0[1]),
                    s3tc_blend(c1[2], c0[2]),
                    0xFF,
                ];
                table[3] = [
                    s3tc_blend(c0[0], c1[0]),
                    s3tc_blend(c0[1], c1[1]),
                    s3tc_blend(c0[2], c1[2]),
                    0xFF,
                ];
            }
        }

        self.color_tables.insert(descriptor, table);
        table
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tex0 {
    pub textures: ResourceDict<Texture>,
    pub palettes: ResourceDict<Palette>,
}

impl Tex0 {
    // The cursor sits just past the stamp; section_offset is the stamp's
    // absolute position, the base for every header-declared offset.
    pub(crate) fn parse(cursor: &mut Cursor<&[u8]>, section_offset: u32) -> Result<Self> {
        cursor.read_u32::<LittleEndian>()?; // section size
        cursor.seek(SeekFrom::Current(4))?;

        cursor.read_u16::<LittleEndian>()?; // texture data size
        let texture_list_offset = cursor.read_u16::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?;
        let texture_data_offset = cursor.read_u32::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?;

        // Compressed-texture region fields, declared but not consumed here.
        cursor.read_u16::<LittleEndian>()?;
        cursor.read_u16::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?;
        cursor.read_u32::<LittleEndian>()?;
        cursor.read_u32::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(4))?;

        let palette_data_size = cursor.read_u32::<LittleEndian>()? << 3;
        let palette_dict_offset = cursor.read_u16::<LittleEndian>()?;
        cursor.seek(SeekFrom::Current(2))?;
        let palette_data_offset = cursor.read_u32::<LittleEndian>()?;

        cursor.seek(SeekFrom::Start(
            section_offset as u64 + palette_dict_offset as u64,
        ))?;
        let descriptors = read_dict(cursor, |cursor| {
            let offset = cursor.read_u16::<LittleEndian>()?;
            cursor.read_u16::<LittleEndian>()?; // padding
            Ok(offset)
        })?;

        let region_start = (section_offset + palette_data_offset) as usize;
        let region = cursor
            .get_ref()
            .get(region_start..(region_start + palette_data_size as usize).min(cursor.get_ref().len()))
            .unwrap_or(&[]);
        let offsets: Vec<u16> = descriptors.iter().map(|entry| entry.1).collect();
        let spans = palette_spans(&offsets, region.len() as u32);
        let mut palettes = ResourceDict::default();
        for ((name, _), (start, count)) in descriptors.iter().zip(spans) {
            palettes.push(name.clone(), read_palette(region, start, count));
        }

        cursor.seek(SeekFrom::Start(
            section_offset as u64 + texture_list_offset as u64,
        ))?;
        let data_base = section_offset as u64 + texture_data_offset as u64;
        let textures = read_dict(cursor, |cursor| {
            let texture = Texture::parse(cursor, data_base)?;
            cursor.read_u32::<LittleEndian>()?; // trailing unused word
            Ok(texture)
        })?;

        Ok(Tex0 { textures, palettes })
    }
}

// A descriptor stores only a start offset (in 8-byte units); its extent runs
// to the next distinct descriptor offset, or the region end when that offset
// is out of range or there is none.
fn palette_spans(offsets: &[u16], region_size: u32) -> Vec<(u32, u32)> {
    offsets
        .iter()
        .enumerate()
        .map(|(i, &raw)| {
            let start = (raw as u32) << 3;
            let end = offsets[i + 1..]
                .iter()
                .map(|&next| (next as u32) << 3)
                .find(|&next| next != start)
                .filter(|&next| next <= region_size && next > start)
                .unwrap_or(region_size);
            let count = (end.saturating_sub(start)) / 2;
            (start, count)
        })
        .collect()
}

fn read_palette(region: &[u8], start: u32, count: u32) -> Palette {
    let mut colors = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = start as usize + i * 2;
        let Some(raw) = region.get(at..at + 2) else {
            break;
        };
        let entry = u16::from_le_bytes([raw[0], raw[1]]);
        colors.push([
            cv5_to_8((entry & 0x1F) as u8),
            cv5_to_8(((entry >> 5) & 0x1F) as u8),
            cv5_to_8(((entry >> 10) & 0x1F) as u8),
        ]);
    }
    Palette::from_colors(colors)
}

#[derive(Debug, Clone, Default)]
pub struct Btx0 {
    pub textures: ResourceDict<Texture>,
    pub palettes: ResourceDict<Palette>,
}

impl Btx0 {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path)
            .with_context(|| format!("opening texture container at {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("memory-mapping {}", path.display()))?;
        Self::from_bytes(&mmap)
            .with_context(|| format!("parsing texture container {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let mut stamp = [0u8; 4];
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"BTX0",
            NitroError::MalformedContainer("missing BTX0 stamp")
        );
        cursor.read_u16::<LittleEndian>()?; // byte-order marker
        cursor.read_u16::<LittleEndian>()?; // version
        cursor.read_u32::<LittleEndian>()?; // file size
        cursor.read_u16::<LittleEndian>()?; // header size
        let section_count = cursor.read_u16::<LittleEndian>()?;

        let mut container = Btx0::default();
        for _ in 0..section_count {
            let section_offset = cursor.read_u32::<LittleEndian>()?;
            let next_entry = cursor.position();

            cursor.seek(SeekFrom::Start(section_offset as u64))?;
            cursor.read_exact(&mut stamp)?;
            match &stamp {
                b"TEX0" => {
                    let tex0 = Tex0::parse(&mut cursor, section_offset)?;
                    for (name, texture) in tex0.textures.iter() {
                        container.textures.push(name.clone(), texture.clone());
                    }
                    for (name, palette) in tex0.palettes.iter() {
                        container.palettes.push(name.clone(), palette.clone());
                    }
                }
                other => log::warn!(
                    "skipping unrecognized section {:?}",
                    String::from_utf8_lossy(other)
                ),
            }
            cursor.seek(SeekFrom::Start(next_entry))?;
        }
        Ok(container)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn palette_spans_divide_neighbor_gaps() {
        // Offsets in 8-byte units: 0 and 4 -> byte offsets 0 and 32.
        let spans = palette_spans(&[0, 4], 48);
        assert_eq!(spans, vec![(0, 16), (32, 8)]);
    }

    #[test]
    fn palette_spans_skip_duplicate_offsets() {
        let spans = palette_spans(&[0, 0, 4], 48);
        assert_eq!(spans, vec![(0, 16), (0, 16), (32, 8)]);
    }

    #[test]
    fn palette_spans_clamp_out_of_range_neighbors() {
        let spans = palette_spans(&[0, 0x2000], 32);
        assert_eq!(spans, vec![(0, 16), (0x10000, 0)]);
    }

    #[test]
    fn four_bpp_decode_is_low_nibble_first() {
        let data = [0x21u8, 0x43].repeat(16);
        let mut cursor = Cursor::new(&data[..]);
        let samples = decode_samples(TextureFormat::Palette4bpp, 8, 8, &mut cursor).unwrap();
        assert_eq!(samples.len(), 64);
        assert_eq!(&samples[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn decode_is_deterministic() {
        let data: Vec<u8> = (0..64).collect();
        let mut a = Cursor::new(&data[..]);
        let mut b = Cursor::new(&data[..]);
        let first = decode_samples(TextureFormat::Palette8bpp, 8, 8, &mut a).unwrap();
        let second = decode_samples(TextureFormat::Palette8bpp, 8, 8, &mut b).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn alpha_index_formats_split_their_byte() {
        let data = [0xFFu8].repeat(64);
        let mut cursor = Cursor::new(&data[..]);
        let samples = decode_samples(TextureFormat::A3I5, 8, 8, &mut cursor).unwrap();
        // Index 0x1F, alpha 0b111 expanded to 8 bits.
        assert_eq!(samples[0], (0x1F << 16) | cv3_to_8(0x07) as u32);

        let mut cursor = Cursor::new(&data[..]);
        let samples = decode_samples(TextureFormat::A5I3, 8, 8, &mut cursor).unwrap();
        assert_eq!(samples[0], (0x07 << 16) | cv5_to_8(0x1F) as u32);
    }

    #[test]
    fn color_zero_transparency_honors_the_flag() {
        let mut palette = Palette::from_colors(vec![[8, 8, 8], [16, 16, 16]]);
        let texture = Texture {
            format: TextureFormat::Palette4bpp,
            width: 8,
            height: 8,
            color0_transparent: true,
            samples: vec![0; 64],
        };
        let rgba = texture.to_rgba(&mut palette);
        assert_eq!(&rgba[..4], &[8, 8, 8, 0x00]);

        let opaque = Texture {
            color0_transparent: false,
            ..texture
        };
        let rgba = opaque.to_rgba(&mut palette);
        assert_eq!(&rgba[..4], &[8, 8, 8, 0xFF]);
    }

    #[test]
    fn block_color_tables_blend_and_cache() {
        let mut palette = Palette::from_colors(vec![[8, 0, 0], [80, 0, 0]]);
        // Mode 3, base color 0.
        let descriptor = 0b11 << 14;
        let table = palette.color_table(descriptor);
        assert_eq!(table[0], [8, 0, 0, 0xFF]);
        assert_eq!(table[1], [80, 0, 0, 0xFF]);
        assert_eq!(table[2][0], s3tc_blend(80, 8));
        assert_eq!(table[3][0], s3tc_blend(8, 80));
        assert!(palette.color_tables.contains_key(&descriptor));
        assert_eq!(palette.color_table(descriptor), table);
    }

    #[test]
    fn direct_format_expands_rgb555() {
        let mut palette = Palette::default();
        let texture = Texture {
            format: TextureFormat::Direct,
            width: 8,
            height: 8,
            color0_transparent: false,
            samples: vec![0x7FFF; 64],
        };
        let rgba = texture.to_rgba(&mut palette);
        assert_eq!(&rgba[..4], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    fn dict_block(items: &[&[u8]], names: &[&str]) -> Vec<u8> {
        let count = items.len() as u8;
        let mut out = vec![0u8, count];
        out.extend_from_slice(&0u16.to_le_bytes());
        out.resize(out.len() + 8 + 4 * count as usize, 0);
        out.extend_from_slice(&(items.first().map_or(0, |i| i.len()) as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        for item in items {
            out.extend_from_slice(item);
        }
        for name in names {
            let mut fixed = [0u8; 16];
            fixed[..name.len()].copy_from_slice(name.as_bytes());
            out.extend_from_slice(&fixed);
        }
        out
    }

    #[test]
    fn container_round_trip_decodes_a_texture() {
        // One 8x8 4bpp texture and one 4-color palette, framed as a minimal
        // BTX0 container with a single TEX0 section.
        let section_offset = 0x14u32;
        let palette_dict_offset = 0x3Cu16;
        let texture_list_offset = 0x64u16;
        let texture_data_offset = 0x90u32;
        let palette_data_offset = 0xB0u32;

        let mut section = Vec::new();
        section.extend_from_slice(b"TEX0");
        section.extend_from_slice(&0xB8u32.to_le_bytes()); // section size
        section.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&16u16.to_le_bytes()); // texture data size
        section.extend_from_slice(&texture_list_offset.to_le_bytes());
        section.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&texture_data_offset.to_le_bytes());
        section.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&[0; 4]); // compressed size + info offset
        section.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&[0; 8]); // compressed data offsets
        section.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&1u32.to_le_bytes()); // palette size, x8 = 8
        section.extend_from_slice(&palette_dict_offset.to_le_bytes());
        section.extend_from_slice(&[0; 2]);
        section.extend_from_slice(&palette_data_offset.to_le_bytes());
        assert_eq!(section.len(), 0x3C);

        section.extend_from_slice(&dict_block(&[&[0, 0, 0, 0]], &["PAL0"]));
        assert_eq!(section.len(), texture_list_offset as usize);

        let params: u32 = (3 << 26) | (1 << 29); // 4bpp, 8x8, color 0 transparent
        let mut item = params.to_le_bytes().to_vec();
        item.extend_from_slice(&[0; 4]);
        section.extend_from_slice(&dict_block(&[&item], &["TEX0NAME"]));
        assert_eq!(section.len(), texture_data_offset as usize);

        section.extend_from_slice(&[0x10; 32]); // indices alternate 0,1
        assert_eq!(section.len(), palette_data_offset as usize);
        for color in [0x0000u16, 0x7FFF, 0x001F, 0x03E0] {
            section.extend_from_slice(&color.to_le_bytes());
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"BTX0");
        bytes.extend_from_slice(&0xFFFEu16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&0x10u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&section_offset.to_le_bytes());
        assert_eq!(bytes.len(), section_offset as usize);
        bytes.extend_from_slice(&section);

        let container = Btx0::from_bytes(&bytes).unwrap();
        assert_eq!(container.textures.len(), 1);
        assert_eq!(container.palettes.len(), 1);

        let (name, texture) = container.textures.by_index(0).unwrap();
        assert_eq!(name, "TEX0NAME");
        assert_eq!((texture.width, texture.height), (8, 8));
        assert_eq!(texture.format, TextureFormat::Palette4bpp);
        assert!(texture.color0_transparent);
        assert_eq!(&texture.samples[..2], &[0, 1]);

        let palette = container.palettes.get("PAL0").unwrap();
        assert_eq!(palette.colors().len(), 4);
        assert_eq!(palette.colors()[1], [0xFF, 0xFF, 0xFF]);
    }
}
