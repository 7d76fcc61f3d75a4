// NARC archives: a Nitro filesystem wrapped in three tagged, length-prefixed
// chunks (BTAF allocation table, BTNF name table, GMIF file data). FAT byte
// ranges are relative to the start of the data chunk's payload.

use std::fs::File as OsFile;
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::MmapOptions;

use crate::error::NitroError;
use crate::fs::{File, Filesystem};
use crate::util::pad;

const HEADER_SIZE: u32 = 0x10;
const FILE_ALIGN: u32 = 4;

#[derive(Debug, Clone, Default)]
pub struct Narc {
    fs: Filesystem,
}

impl Narc {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OsFile::open(path)
            .with_context(|| format!("opening NARC archive at {}", path.display()))?;
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("memory-mapping NARC archive {}", path.display()))?;
        Self::from_bytes(&mmap).with_context(|| format!("parsing NARC archive {}", path.display()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let mut stamp = [0u8; 4];
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"NARC",
            NitroError::MalformedContainer("missing NARC stamp")
        );

        cursor.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"BTAF",
            NitroError::MalformedContainer("missing BTAF chunk")
        );
        let fat_chunk_size = cursor.read_u32::<LittleEndian>()?;
        let file_count = cursor.read_u32::<LittleEndian>()? as usize;
        let fat = Filesystem::parse_fat(&mut cursor, file_count)?;

        cursor.seek(SeekFrom::Start((HEADER_SIZE + fat_chunk_size) as u64))?;
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"BTNF",
            NitroError::MalformedContainer("missing BTNF chunk")
        );
        let fnt_chunk_size = cursor.read_u32::<LittleEndian>()?;
        let fnt_offset = cursor.position();

        cursor.seek(SeekFrom::Start(
            (HEADER_SIZE + fat_chunk_size + fnt_chunk_size) as u64,
        ))?;
        cursor.read_exact(&mut stamp)?;
        ensure!(
            &stamp == b"GMIF",
            NitroError::MalformedContainer("missing GMIF chunk")
        );
        cursor.read_u32::<LittleEndian>()?; // data chunk size
        let img_offset = cursor.position() as usize;

        let mut files = Vec::with_capacity(file_count);
        for (id, &(start, end)) in fat.iter().enumerate() {
            let range = img_offset + start as usize..img_offset + end as usize;
            let data = bytes
                .get(range)
                .context("NARC file data extends beyond the archive")?
                .to_vec();
            let mut file = File::new(format!("{id}.bin"), data);
            file.id = id as u16;
            files.push(file);
        }

        cursor.seek(SeekFrom::Start(fnt_offset))?;
        let fs = Filesystem::parse_fnt(&mut cursor, fnt_chunk_size as usize - 8, files)?;

        Ok(Narc { fs })
    }

    pub fn from_filesystem(fs: Filesystem) -> Self {
        Narc { fs }
    }

    pub fn filesystem(&self) -> &Filesystem {
        &self.fs
    }

    pub fn filesystem_mut(&mut self) -> &mut Filesystem {
        &mut self.fs
    }

    pub fn file_count(&self) -> usize {
        self.fs.file_count()
    }

    pub fn get_file_by_index(&self, index: usize) -> Option<&File> {
        self.fs.files_in_order().get(index).copied()
    }

    pub fn get_file(&self, path: &str) -> Option<&File> {
        self.fs.get_file(path)
    }

    pub fn dump(&self, dest: &Path) -> Result<()> {
        self.fs.dump(dest)
    }

    // The FNT must be rebuilt before the FAT so both tables agree on the id
    // assignment order.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>> {
        self.fs.reindex(0);
        let fnt = self.fs.write_fnt(0);

        let files = self.fs.files_in_order();
        let mut img: Vec<u8> = Vec::new();
        let mut ranges = Vec::with_capacity(files.len());
        for file in &files {
            let start = pad(img.len() as u32, FILE_ALIGN);
            img.resize(start as usize, 0xFF);
            img.extend_from_slice(&file.data);
            ranges.push((start, start + file.data.len() as u32));
        }
        img.resize(pad(img.len() as u32, FILE_ALIGN) as usize, 0xFF);
        let fat = Filesystem::write_fat(&ranges);

        let fat_chunk_size = 12 + fat.len() as u32;
        let fnt_chunk_size = 8 + fnt.len() as u32;
        let img_chunk_size = 8 + img.len() as u32;
        let total = HEADER_SIZE + fat_chunk_size + fnt_chunk_size + img_chunk_size;

        let mut out = Cursor::new(Vec::with_capacity(total as usize));
        out.write_all(b"NARC")?;
        out.write_u16::<LittleEndian>(0xFFFE)?; // byte order
        out.write_u16::<LittleEndian>(0x0100)?; // version
        out.write_u32::<LittleEndian>(total)?;
        out.write_u16::<LittleEndian>(HEADER_SIZE as u16)?;
        out.write_u16::<LittleEndian>(3)?; // chunk count

        out.write_all(b"BTAF")?;
        out.write_u32::<LittleEndian>(fat_chunk_size)?;
        out.write_u32::<LittleEndian>(ranges.len() as u32)?;
        out.write_all(&fat)?;

        out.write_all(b"BTNF")?;
        out.write_u32::<LittleEndian>(fnt_chunk_size)?;
        out.write_all(&fnt)?;

        out.write_all(b"GMIF")?;
        out.write_u32::<LittleEndian>(img_chunk_size)?;
        out.write_all(&img)?;

        Ok(out.into_inner())
    }

    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path.as_ref(), bytes)
            .with_context(|| format!("writing NARC archive {}", path.as_ref().display()))
    }
}
