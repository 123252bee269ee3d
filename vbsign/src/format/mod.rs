// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod fmap;
pub mod gbb;
pub mod kernel;
pub mod keyblock;
pub mod padding;
pub mod preamble;

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// On-disk signature header: the offset of the signature data (relative to
/// the position of this header), its size, and the number of bytes the
/// signature covers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) struct SignatureInfo {
    pub sig_offset: u64,
    pub sig_size: u64,
    pub data_size: u64,
}

impl SignatureInfo {
    pub const SIZE: usize = 24;

    pub fn read(mut reader: impl Read) -> io::Result<Self> {
        Ok(Self {
            sig_offset: reader.read_u64::<LittleEndian>()?,
            sig_size: reader.read_u64::<LittleEndian>()?,
            data_size: reader.read_u64::<LittleEndian>()?,
        })
    }

    pub fn write(&self, mut writer: impl Write) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.sig_offset)?;
        writer.write_u64::<LittleEndian>(self.sig_size)?;
        writer.write_u64::<LittleEndian>(self.data_size)?;
        Ok(())
    }

    /// Resolve the signature data range against the buffer that contains
    /// this header at `header_offset`.
    pub fn data_range(&self, header_offset: usize, buf_len: usize) -> Option<std::ops::Range<usize>> {
        let start = (header_offset as u64).checked_add(self.sig_offset)?;
        let end = start.checked_add(self.sig_size)?;

        if end > buf_len as u64 {
            return None;
        }

        Some(start as usize..end as usize)
    }
}
