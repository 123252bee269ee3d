// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Cursor};

use bstr::ByteSlice;
use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::warn;

use crate::stream::{ReadFixedSizeExt, ReadStringExt};

pub const FMAP_MAGIC: [u8; 8] = *b"__FMAP__";
pub const FMAP_NAME_LEN: usize = 32;

/// The directory can sit at any 4-byte boundary in the image.
const FMAP_SEARCH_STRIDE: usize = 4;

const FMAP_HEADER_SIZE: usize = 56;
const FMAP_AREA_SIZE: usize = 42;

#[derive(Debug, Error)]
pub enum Error {
    #[error("FmapNotFound: image contains no FMAP directory")]
    NotFound,
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A named region in the image. The name field on disk is fixed-width and
/// not necessarily NUL-terminated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FmapArea {
    pub name: [u8; FMAP_NAME_LEN],
    pub offset: u32,
    pub size: u32,
    pub flags: u16,
}

/// An area's location after clamping against the actual image size.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AreaRange {
    pub offset: usize,
    pub len: usize,
}

impl AreaRange {
    pub fn as_range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

impl FmapArea {
    /// The area name, stopping at the first NUL byte.
    pub fn name_bytes(&self) -> &[u8] {
        match self.name.iter().position(|b| *b == 0) {
            Some(pos) => &self.name[..pos],
            None => &self.name,
        }
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name_bytes() == name.as_bytes()
    }

    /// Clamp the area against the image size. Returns `None` if the area
    /// starts beyond the end of the image; a partially out-of-range area is
    /// truncated.
    pub fn clamp(&self, image_len: usize) -> Option<AreaRange> {
        let offset = self.offset as usize;
        if offset >= image_len {
            return None;
        }

        let mut len = self.size as usize;
        if offset + len > image_len {
            warn!(
                "Area {:?} extends past the end of the image; truncating to {} bytes",
                self.name_bytes().as_bstr(),
                image_len - offset,
            );
            len = image_len - offset;
        }

        Some(AreaRange { offset, len })
    }
}

#[derive(Clone, Debug)]
pub struct Fmap {
    pub ver_major: u8,
    pub ver_minor: u8,
    pub base: u64,
    pub size: u32,
    pub name: String,
    pub areas: Vec<FmapArea>,
    /// Where in the image the directory was found.
    pub offset: usize,
}

impl Fmap {
    /// Scan the image for the FMAP magic and parse the directory at the
    /// first offset where one parses cleanly.
    pub fn find(image: &[u8]) -> Result<Self> {
        let mut offset = 0;

        while offset + FMAP_HEADER_SIZE <= image.len() {
            if image[offset..offset + 8] == FMAP_MAGIC {
                if let Some(fmap) = Self::parse_at(image, offset)? {
                    return Ok(fmap);
                }
            }

            offset += FMAP_SEARCH_STRIDE;
        }

        Err(Error::NotFound)
    }

    fn parse_at(image: &[u8], offset: usize) -> Result<Option<Self>> {
        let mut reader = Cursor::new(&image[offset..]);

        let _magic: [u8; 8] = reader.read_array_exact()?;
        let ver_major = reader.read_u8()?;
        let ver_minor = reader.read_u8()?;
        let base = reader.read_u64::<LittleEndian>()?;
        let size = reader.read_u32::<LittleEndian>()?;
        let name = match reader.read_string_padded(FMAP_NAME_LEN) {
            Ok(n) => n,
            Err(_) => return Ok(None),
        };
        let nareas = reader.read_u16::<LittleEndian>()? as usize;

        if image.len() - offset < FMAP_HEADER_SIZE + nareas * FMAP_AREA_SIZE {
            // A stray magic string; the directory would run off the image.
            return Ok(None);
        }

        let mut areas = Vec::with_capacity(nareas);
        for _ in 0..nareas {
            let area_offset = reader.read_u32::<LittleEndian>()?;
            let area_size = reader.read_u32::<LittleEndian>()?;
            let area_name: [u8; FMAP_NAME_LEN] = reader.read_array_exact()?;
            let flags = reader.read_u16::<LittleEndian>()?;

            areas.push(FmapArea {
                name: area_name,
                offset: area_offset,
                size: area_size,
                flags,
            });
        }

        Ok(Some(Self {
            ver_major,
            ver_minor,
            base,
            size,
            name,
            areas,
            offset,
        }))
    }

    /// Look up an area by name, trying each candidate in order. Duplicate
    /// names are not expected; the first match wins.
    pub fn area(&self, names: &[&str]) -> Option<&FmapArea> {
        names
            .iter()
            .find_map(|name| self.areas.iter().find(|a| a.name_matches(name)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use byteorder::{LittleEndian, WriteBytesExt};

    use crate::stream::WriteStringExt;

    use super::*;

    fn build_directory(areas: &[(&str, u32, u32)]) -> Vec<u8> {
        let mut buf = vec![];
        buf.extend_from_slice(&FMAP_MAGIC);
        buf.write_u8(1).unwrap();
        buf.write_u8(1).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u32::<LittleEndian>(0x800000).unwrap();
        buf.write_string_padded("FMAP", FMAP_NAME_LEN).unwrap();
        buf.write_u16::<LittleEndian>(areas.len() as u16).unwrap();

        for (name, offset, size) in areas {
            buf.write_u32::<LittleEndian>(*offset).unwrap();
            buf.write_u32::<LittleEndian>(*size).unwrap();
            buf.write_string_padded(name, FMAP_NAME_LEN).unwrap();
            buf.write_u16::<LittleEndian>(0).unwrap();
        }

        buf
    }

    #[test]
    fn find_at_unaligned_offset() {
        let directory = build_directory(&[("GBB", 0x1000, 0x1000)]);

        let mut image = vec![0u8; 0x4000];
        image[0x204..0x204 + directory.len()].copy_from_slice(&directory);

        let fmap = Fmap::find(&image).unwrap();
        assert_eq!(fmap.offset, 0x204);
        assert_eq!(fmap.areas.len(), 1);
        assert!(fmap.areas[0].name_matches("GBB"));
    }

    #[test]
    fn missing_directory() {
        assert_matches!(Fmap::find(&[0u8; 0x1000]), Err(Error::NotFound));
    }

    #[test]
    fn legacy_alias_lookup() {
        let directory = build_directory(&[("Firmware A Key", 0x2000, 0x1000)]);

        let mut image = vec![0u8; 0x4000];
        image[..directory.len()].copy_from_slice(&directory);

        let fmap = Fmap::find(&image).unwrap();
        assert!(fmap.area(&["VBLOCK_A"]).is_none());
        assert!(fmap.area(&["VBLOCK_A", "Firmware A Key"]).is_some());
    }

    #[test]
    fn clamp_truncates_and_rejects() {
        let area = FmapArea {
            name: [0u8; FMAP_NAME_LEN],
            offset: 0x1000,
            size: 0x2000,
            flags: 0,
        };

        assert_eq!(
            area.clamp(0x4000),
            Some(AreaRange {
                offset: 0x1000,
                len: 0x2000
            })
        );
        assert_eq!(
            area.clamp(0x2000),
            Some(AreaRange {
                offset: 0x1000,
                len: 0x1000
            })
        );
        assert_eq!(area.clamp(0x1000), None);
    }
}
