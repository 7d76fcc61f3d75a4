// The named-entry table used by every sub-list inside the model container
// (models, meshes, materials, textures, palettes). Items are decoded first,
// names second, zipped positionally. Insertion order is the on-disk order
// and is load-bearing; name lookup is a first-match linear scan because the
// format does not guarantee unique names.

use std::io::{Cursor, Read, Seek, SeekFrom};

use anyhow::Result;
use byteorder::{LittleEndian, ReadBytesExt};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceDict<T> {
    items: Vec<(String, T)>,
}

impl<T> Default for ResourceDict<T> {
    fn default() -> Self {
        ResourceDict { items: Vec::new() }
    }
}

impl<T> ResourceDict<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, item)| item)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.items
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, item)| item)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn by_index_mut(&mut self, index: usize) -> Option<&mut (String, T)> {
        self.items.get_mut(index)
    }

    pub fn by_index(&self, index: usize) -> Option<&(String, T)> {
        self.items.get(index)
    }

    pub fn push(&mut self, name: impl Into<String>, item: T) {
        self.items.push((name.into(), item));
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, T)> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut (String, T)> {
        self.items.iter_mut()
    }

    // Keeps names and order.
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> ResourceDict<U> {
        ResourceDict {
            items: self
                .items
                .iter()
                .map(|(n, item)| (n.clone(), f(item)))
                .collect(),
        }
    }
}

// For count == 0 nothing beyond the fixed header is consumed.
pub fn read_dict<T>(
    cursor: &mut Cursor<&[u8]>,
    mut read_item: impl FnMut(&mut Cursor<&[u8]>) -> Result<T>,
) -> Result<ResourceDict<T>> {
    cursor.read_u8()?; // dummy
    let count = cursor.read_u8()? as usize;
    cursor.read_u16::<LittleEndian>()?; // list size in bytes

    cursor.seek(SeekFrom::Current(8 + 4 * count as i64))?; // unused entry block

    cursor.read_u16::<LittleEndian>()?; // per-item size
    cursor.read_u16::<LittleEndian>()?; // data section size

    let mut items = Vec::with_capacity(count);
    for _ in 0..count {
        items.push(read_item(cursor)?);
    }

    let mut dict = ResourceDict::default();
    for item in items {
        dict.items.push((read_name(cursor)?, item));
    }
    Ok(dict)
}

fn read_name(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let mut raw = [0u8; 16];
    cursor.read_exact(&mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(16);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(count: u8, items: &[u8], names: &[&str]) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(0xFF); // dummy
        data.push(count);
        data.extend_from_slice(&0u16.to_le_bytes()); // list size (unused here)
        data.resize(data.len() + 8 + 4 * count as usize, 0);
        data.extend_from_slice(&4u16.to_le_bytes()); // item size
        data.extend_from_slice(&0u16.to_le_bytes()); // data size
        data.extend_from_slice(items);
        for name in names {
            let mut fixed = [0u8; 16];
            fixed[..name.len()].copy_from_slice(name.as_bytes());
            data.extend_from_slice(&fixed);
        }
        data
    }

    #[test]
    fn zips_names_onto_items_in_order() {
        let mut items = Vec::new();
        items.extend_from_slice(&11u32.to_le_bytes());
        items.extend_from_slice(&22u32.to_le_bytes());
        let data = framed(2, &items, &["first", "second"]);

        let mut cursor = Cursor::new(data.as_slice());
        let dict = read_dict(&mut cursor, |c| Ok(c.read_u32::<LittleEndian>()?)).unwrap();

        assert_eq!(dict.len(), 2);
        assert_eq!(dict.by_index(0).unwrap(), &("first".to_string(), 11));
        assert_eq!(dict.by_index(1).unwrap(), &("second".to_string(), 22));
        assert_eq!(dict.get("second"), Some(&22));
        assert!(dict.get("third").is_none());
    }

    #[test]
    fn empty_dict_consumes_only_the_fixed_header() {
        let data = framed(0, &[], &[]);
        let mut cursor = Cursor::new(data.as_slice());
        let dict = read_dict(&mut cursor, |c| Ok(c.read_u32::<LittleEndian>()?)).unwrap();
        assert!(dict.is_empty());
        assert_eq!(cursor.position(), 16); // 1+1+2+8+2+2
    }

    #[test]
    fn duplicate_names_resolve_to_first_match() {
        let mut dict = ResourceDict::default();
        dict.push("pal", 1u32);
        dict.push("pal", 2u32);
        assert_eq!(dict.get("pal"), Some(&1));
    }
}
