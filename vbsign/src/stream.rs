// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Write};

use crate::util;

/// Extensions for readers to read fixed-size buffers.
pub trait ReadFixedSizeExt {
    /// Read fixed-size array.
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]>;

    /// Read fixed-sized [`Vec`].
    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>>;
}

impl<R: Read> ReadFixedSizeExt for R {
    fn read_array_exact<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_vec_exact(&mut self, size: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; size];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// Extensions for readers to read NUL-padded fixed-size string fields.
pub trait ReadStringExt {
    /// Read a fixed-size field and trim everything from the first NUL byte
    /// onwards. Fails if the remaining data is not UTF-8.
    fn read_string_padded(&mut self, size: usize) -> io::Result<String>;
}

impl<R: Read> ReadStringExt for R {
    fn read_string_padded(&mut self, size: usize) -> io::Result<String> {
        let mut buf = self.read_vec_exact(size)?;
        if let Some(pos) = buf.iter().position(|b| *b == 0) {
            buf.truncate(pos);
        }

        String::from_utf8(buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
}

/// Extensions for writers to write NUL-padded fixed-size string fields.
pub trait WriteStringExt {
    /// Write a string to a fixed-size field, padding the remainder with NUL
    /// bytes. Fails if the string does not fit.
    fn write_string_padded(&mut self, data: &str, size: usize) -> io::Result<()>;
}

impl<W: Write> WriteStringExt for W {
    fn write_string_padded(&mut self, data: &str, size: usize) -> io::Result<()> {
        if data.len() > size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("String {data:?} exceeds {size} bytes"),
            ));
        }

        self.write_all(data.as_bytes())?;
        self.write_zeros_exact((size - data.len()) as u64)?;

        Ok(())
    }
}

/// Extensions for writers to easily write zeros (eg. for padding).
pub trait WriteZerosExt {
    fn write_zeros_exact(&mut self, size: u64) -> io::Result<()>;
}

impl<W: Write> WriteZerosExt for W {
    fn write_zeros_exact(&mut self, mut size: u64) -> io::Result<()> {
        while size > 0 {
            let to_write = size.min(util::ZEROS.len() as u64) as usize;
            self.write_all(&util::ZEROS[..to_write])?;
            size -= to_write as u64;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::{ReadStringExt, WriteStringExt};

    #[test]
    fn string_padded_round_trip() {
        let mut writer = Cursor::new(Vec::new());
        writer.write_string_padded("FW_MAIN_A", 32).unwrap();

        let raw = writer.into_inner();
        assert_eq!(raw.len(), 32);
        assert_eq!(&raw[..9], b"FW_MAIN_A");
        assert!(raw[9..].iter().all(|b| *b == 0));

        let name = Cursor::new(raw).read_string_padded(32).unwrap();
        assert_eq!(name, "FW_MAIN_A");
    }

    #[test]
    fn string_padded_too_long() {
        let mut writer = Cursor::new(Vec::new());
        assert!(writer.write_string_padded("much too long", 4).is_err());
    }
}
