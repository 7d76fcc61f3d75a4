// The Nitro embedded filesystem: a File Allocation Table (start/end byte
// ranges) paired with a File Name Table (directory records), shared by ROM
// images and NARC archives. Folders form parent/child cycles on disk, so the
// tree lives in an arena keyed by FolderId. Reindex must run immediately
// before any save, in the same traversal order the FAT is laid out in.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

// marker nibble tagging directory references inside the FNT
const DIR_BIT: u16 = 0xF000;
const TABLE_ALIGN: u32 = 4;

// Arena index, stable across reindexing; the on-disk record id lives in
// Folder::id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FolderId(u16);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct File {
    /// Reassigned on save.
    pub id: u16,
    pub name: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

impl File {
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        File {
            id: 0,
            name: name.into(),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

// Children are owned here; the parent link is a non-owning id.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Folder {
    pub id: u16,
    pub name: String,
    pub parent: Option<FolderId>,
    pub files: Vec<File>,
    pub folders: Vec<FolderId>,
}

// Tree mode (root folder) or flat mode (FAT-ordered file list), selected by
// whether the container carried a usable FNT.
#[derive(Debug, Clone, Default)]
pub struct Filesystem {
    arena: Vec<Folder>,
    root: Option<FolderId>,
    flat: Vec<File>,
    has_fnt: bool,
}

impl Filesystem {
    pub fn new_tree() -> Self {
        let root = Folder {
            id: 0,
            name: String::new(),
            ..Folder::default()
        };
        Filesystem {
            arena: vec![root],
            root: Some(FolderId(0)),
            flat: Vec::new(),
            has_fnt: true,
        }
    }

    pub fn new_flat(files: Vec<File>) -> Self {
        Filesystem {
            arena: Vec::new(),
            root: None,
            flat: files,
            has_fnt: false,
        }
    }

    pub fn has_fnt(&self) -> bool {
        self.has_fnt
    }

    pub fn root(&self) -> Option<FolderId> {
        self.root
    }

    pub fn folder(&self, id: FolderId) -> &Folder {
        &self.arena[id.0 as usize]
    }

    pub fn folder_mut(&mut self, id: FolderId) -> &mut Folder {
        &mut self.arena[id.0 as usize]
    }

    pub fn add_folder(&mut self, parent: FolderId, name: impl Into<String>) -> FolderId {
        let id = FolderId(self.arena.len() as u16);
        self.arena.push(Folder {
            id: 0,
            name: name.into(),
            parent: Some(parent),
            ..Folder::default()
        });
        self.folder_mut(parent).folders.push(id);
        id
    }

    pub fn add_file(&mut self, folder: FolderId, file: File) {
        self.folder_mut(folder).files.push(file);
    }

    // Folders pre-order, files in id-assignment order.
    pub fn traverse(&self, on_folder: &mut dyn FnMut(&Folder), on_file: &mut dyn FnMut(&File)) {
        if !self.has_fnt {
            for file in &self.flat {
                on_file(file);
            }
            return;
        }
        if let Some(root) = self.root {
            self.traverse_from(root, on_folder, on_file);
        }
    }

    fn traverse_from(
        &self,
        id: FolderId,
        on_folder: &mut dyn FnMut(&Folder),
        on_file: &mut dyn FnMut(&File),
    ) {
        let folder = self.folder(id);
        on_folder(folder);
        for file in &folder.files {
            on_file(file);
        }
        for &child in &folder.folders {
            self.traverse_from(child, on_folder, on_file);
        }
    }

    pub fn for_each_file(&self, on_file: &mut dyn FnMut(&File)) {
        self.traverse(&mut |_| {}, on_file);
    }

    pub fn file_count(&self) -> usize {
        let mut count = 0;
        self.for_each_file(&mut |_| count += 1);
        count
    }

    // A path miss is not an error.
    pub fn get_file(&self, path: &str) -> Option<&File> {
        if !self.has_fnt {
            return self.flat.iter().find(|f| f.name == path);
        }
        let mut current = self.root?;
        let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
        while let Some(segment) = segments.next() {
            let folder = self.folder(current);
            if segments.peek().is_none() {
                return folder.files.iter().find(|f| f.name == segment);
            }
            current = *folder
                .folders
                .iter()
                .find(|&&c| self.folder(c).name == segment)?;
        }
        None
    }

    pub fn get_file_by_id(&self, id: u16) -> Option<&File> {
        self.files_in_order().into_iter().find(|f| f.id == id)
    }

    pub fn dump(&self, dest: &Path) -> Result<()> {
        if !self.has_fnt {
            for file in &self.flat {
                std::fs::write(dest.join(&file.name), &file.data)
                    .with_context(|| format!("writing {}", file.name))?;
            }
            return Ok(());
        }
        if let Some(root) = self.root {
            self.dump_folder(root, dest)?;
        }
        Ok(())
    }

    fn dump_folder(&self, id: FolderId, dest: &Path) -> Result<()> {
        let folder = self.folder(id);
        for file in &folder.files {
            std::fs::write(dest.join(&file.name), &file.data)
                .with_context(|| format!("writing {}", file.name))?;
        }
        for &child in &folder.folders {
            let sub = dest.join(&self.folder(child).name);
            std::fs::create_dir_all(&sub)
                .with_context(|| format!("creating {}", sub.display()))?;
            self.dump_folder(child, &sub)?;
        }
        Ok(())
    }

    fn pre_order(&self) -> Vec<FolderId> {
        let mut order = Vec::new();
        if let Some(root) = self.root {
            let mut stack = vec![root];
            while let Some(id) = stack.pop() {
                order.push(id);
                for &child in self.folder(id).folders.iter().rev() {
                    stack.push(child);
                }
            }
        }
        order
    }

    // Reassigns ids in pre-order and returns the id one past the last file.
    // Must run immediately before writing the FNT/FAT pair: the FAT is laid
    // out in exactly this order.
    pub fn reindex(&mut self, first_file_id: u16) -> u16 {
        let mut next_file = first_file_id;
        if !self.has_fnt {
            for file in &mut self.flat {
                file.id = next_file;
                next_file += 1;
            }
            return next_file;
        }
        let order = self.pre_order();
        for (record, &id) in order.iter().enumerate() {
            let folder = self.folder_mut(id);
            folder.id = record as u16;
            for file in &mut folder.files {
                file.id = next_file;
                next_file += 1;
            }
        }
        next_file
    }

    // FAT order; valid after reindex.
    pub fn files_in_order(&self) -> Vec<&File> {
        if !self.has_fnt {
            return self.flat.iter().collect();
        }
        let mut files = Vec::new();
        for id in self.pre_order() {
            files.extend(self.folder(id).files.iter());
        }
        files
    }

    // In flat mode this emits the conventional single-record stub whose data
    // offset points at the end of the table, which parses back as "no FNT".
    pub fn write_fnt(&self, first_file_id: u16) -> Vec<u8> {
        let mut out = Vec::new();
        if !self.has_fnt {
            out.extend_from_slice(&8u32.to_le_bytes());
            out.extend_from_slice(&first_file_id.to_le_bytes());
            out.extend_from_slice(&1u16.to_le_bytes());
            return out;
        }

        let order = self.pre_order();
        let header_len = order.len() * 8;

        // Entry blobs per record, then offsets follow from their sizes.
        let mut blobs = Vec::with_capacity(order.len());
        for &id in &order {
            let folder = self.folder(id);
            let mut blob = Vec::new();
            for &child in &folder.folders {
                let sub = self.folder(child);
                blob.push(0x80 | (sub.name.len() as u8 & 0x7F));
                blob.extend_from_slice(sub.name.as_bytes());
                blob.extend_from_slice(&(DIR_BIT | sub.id).to_le_bytes());
            }
            for file in &folder.files {
                blob.push(file.name.len() as u8 & 0x7F);
                blob.extend_from_slice(file.name.as_bytes());
            }
            blob.push(0x00);
            blobs.push(blob);
        }

        // Header records: data offset, first file id, parent id (dir count
        // for the root).
        let mut next_file = first_file_id;
        let mut data_offset = header_len as u32;
        for (&id, blob) in order.iter().zip(&blobs) {
            let folder = self.folder(id);
            out.extend_from_slice(&data_offset.to_le_bytes());
            out.extend_from_slice(&next_file.to_le_bytes());
            next_file += folder.files.len() as u16;
            match folder.parent {
                None => out.extend_from_slice(&(order.len() as u16).to_le_bytes()),
                Some(parent) => {
                    let parent_id = self.folder(parent).id;
                    out.extend_from_slice(&(DIR_BIT | parent_id).to_le_bytes());
                }
            }
            data_offset += blob.len() as u32;
        }
        for blob in &blobs {
            out.extend_from_slice(blob);
        }

        out.resize(crate::util::pad(out.len() as u32, TABLE_ALIGN) as usize, 0);
        out
    }

    pub fn write_fat(ranges: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::with_capacity(ranges.len() * 8);
        for &(start, end) in ranges {
            out.extend_from_slice(&start.to_le_bytes());
            out.extend_from_slice(&end.to_le_bytes());
        }
        out.resize(crate::util::pad(out.len() as u32, TABLE_ALIGN) as usize, 0);
        out
    }

    pub fn parse_fat<R: Read>(cursor: &mut R, count: usize) -> Result<Vec<(u32, u32)>> {
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let start = cursor.read_u32::<LittleEndian>()?;
            let end = cursor.read_u32::<LittleEndian>()?;
            entries.push((start, end));
        }
        Ok(entries)
    }

    // An empty root selects flat mode.
    pub fn parse_fnt<R: Read>(cursor: &mut R, size: usize, files: Vec<File>) -> Result<Filesystem> {
        let mut fnt = vec![0u8; size];
        cursor
            .read_exact(&mut fnt)
            .context("FNT shorter than its declared size")?;
        Self::from_fnt(&fnt, files)
    }

    pub fn from_fnt_with_leftovers_stream<R: Read>(
        cursor: &mut R,
        size: usize,
        files: Vec<File>,
    ) -> Result<(Filesystem, Vec<File>)> {
        let mut fnt = vec![0u8; size];
        cursor
            .read_exact(&mut fnt)
            .context("FNT shorter than its declared size")?;
        Self::from_fnt_with_leftovers(&fnt, files)
    }

    pub fn from_fnt(fnt: &[u8], files: Vec<File>) -> Result<Filesystem> {
        let (fs, _leftover) = Self::from_fnt_with_leftovers(fnt, files)?;
        Ok(fs)
    }

    pub fn from_fnt_with_leftovers(
        fnt: &[u8],
        files: Vec<File>,
    ) -> Result<(Filesystem, Vec<File>)> {
        let mut slots: Vec<Option<File>> = files.into_iter().map(Some).collect();
        let mut fs = Filesystem {
            arena: Vec::new(),
            root: None,
            flat: Vec::new(),
            has_fnt: true,
        };
        let root = fs.parse_directory(fnt, 0, String::new(), None, &mut slots)?;

        let root_folder = fs.folder(root);
        if root_folder.files.is_empty() && root_folder.folders.is_empty() {
            // No FNT: hand every file back in FAT order.
            let flat: Vec<File> = slots.into_iter().flatten().collect();
            return Ok((Filesystem::new_flat(flat), Vec::new()));
        }

        fs.root = Some(root);
        let leftover = slots.into_iter().flatten().collect();
        Ok((fs, leftover))
    }

    fn parse_directory(
        &mut self,
        fnt: &[u8],
        record: usize,
        name: String,
        parent: Option<FolderId>,
        slots: &mut Vec<Option<File>>,
    ) -> Result<FolderId> {
        ensure!(
            self.arena.len() <= 0x0FFF,
            "FNT directory count exceeds the 12-bit index space"
        );
        let id = FolderId(self.arena.len() as u16);
        self.arena.push(Folder {
            id: (record / 8) as u16,
            name,
            parent,
            ..Folder::default()
        });

        let Some(header) = fnt.get(record..record + 6) else {
            return Ok(id); // record beyond the table: empty directory
        };
        let mut offset = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let mut file_id = u16::from_le_bytes(header[4..6].try_into().unwrap());

        loop {
            let Some(&kind) = fnt.get(offset) else { break };
            offset += 1;
            if kind == 0 {
                break;
            }

            let is_dir = kind & 0x80 != 0;
            let name_len = (kind & 0x7F) as usize;
            let Some(name_bytes) = fnt.get(offset..offset + name_len) else {
                break;
            };
            let entry_name = String::from_utf8_lossy(name_bytes).into_owned();
            offset += name_len;

            if is_dir {
                let Some(raw) = fnt.get(offset..offset + 2) else {
                    break;
                };
                let dir_id = u16::from_le_bytes(raw.try_into().unwrap());
                offset += 2;
                let sub_record = ((dir_id & 0x0FFF) as usize) * 8;
                let child = self.parse_directory(fnt, sub_record, entry_name, Some(id), slots)?;
                self.folder_mut(id).folders.push(child);
            } else {
                if let Some(slot) = slots.get_mut(file_id as usize) {
                    if let Some(mut file) = slot.take() {
                        file.name = entry_name;
                        file.id = file_id;
                        self.folder_mut(id).files.push(file);
                    }
                }
                file_id += 1;
            }
        }

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> Filesystem {
        let mut fs = Filesystem::new_tree();
        let root = fs.root().unwrap();
        fs.add_file(root, File::new("a.bin", vec![1, 2, 3, 4]));
        let data = fs.add_folder(root, "data");
        fs.add_file(data, File::new("b.bin", vec![5; 8]));
        let maps = fs.add_folder(data, "maps");
        fs.add_file(maps, File::new("c.bin", vec![9]));
        fs
    }

    fn shape(fs: &Filesystem) -> (Vec<String>, Vec<(String, Vec<u8>)>) {
        let mut folders = Vec::new();
        let mut files = Vec::new();
        fs.traverse(
            &mut |f| folders.push(f.name.clone()),
            &mut |f| files.push((f.name.clone(), f.data.clone())),
        );
        (folders, files)
    }

    #[test]
    fn fnt_round_trip_preserves_tree_shape() {
        let mut fs = sample_tree();
        fs.reindex(0);
        let fnt = fs.write_fnt(0);
        assert_eq!(fnt.len() % 4, 0);

        let files: Vec<File> = fs.files_in_order().into_iter().cloned().collect();
        let reparsed = Filesystem::from_fnt(&fnt, files).unwrap();
        assert!(reparsed.has_fnt());
        assert_eq!(shape(&reparsed), shape(&fs));
    }

    #[test]
    fn flat_stub_fnt_parses_back_as_flat() {
        let mut fs = Filesystem::new_flat(vec![
            File::new("0.bin", vec![1]),
            File::new("1.bin", vec![2, 2]),
        ]);
        fs.reindex(0);
        let fnt = fs.write_fnt(0);
        let files: Vec<File> = fs.files_in_order().into_iter().cloned().collect();
        let reparsed = Filesystem::from_fnt(&fnt, files).unwrap();
        assert!(!reparsed.has_fnt());
        assert_eq!(reparsed.file_count(), 2);
        assert_eq!(reparsed.get_file("1.bin").unwrap().data, vec![2, 2]);
    }

    #[test]
    fn path_lookup_descends_folders() {
        let fs = sample_tree();
        assert_eq!(fs.get_file("a.bin").unwrap().data, vec![1, 2, 3, 4]);
        assert_eq!(fs.get_file("data/b.bin").unwrap().size(), 8);
        assert_eq!(fs.get_file("data/maps/c.bin").unwrap().data, vec![9]);
        assert!(fs.get_file("data/maps/missing.bin").is_none());
        assert!(fs.get_file("/data/b.bin").is_some());
    }

    #[test]
    fn reindex_assigns_sequential_ids_in_traversal_order() {
        let mut fs = sample_tree();
        let next = fs.reindex(3);
        assert_eq!(next, 6);
        let ids: Vec<u16> = fs.files_in_order().iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
    }

    #[test]
    fn unclaimed_files_are_returned_as_leftovers() {
        let mut fs = Filesystem::new_tree();
        let root = fs.root().unwrap();
        fs.add_file(root, File::new("named.bin", vec![7]));
        fs.reindex(0);
        let fnt = fs.write_fnt(0);

        let files = vec![File::new("named.bin", vec![7]), File::new("", vec![8])];
        let (reparsed, leftover) = Filesystem::from_fnt_with_leftovers(&fnt, files).unwrap();
        assert_eq!(reparsed.file_count(), 1);
        assert_eq!(leftover.len(), 1);
        assert_eq!(leftover[0].data, vec![8]);
    }
}
