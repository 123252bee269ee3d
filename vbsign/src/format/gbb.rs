// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Cursor};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use thiserror::Error;

use crate::{
    crypto::{self, PublicKey},
    stream::ReadFixedSizeExt,
};

pub const GBB_MAGIC: [u8; 4] = *b"$GBB";
pub const GBB_HEADER_SIZE: usize = 128;
pub const GBB_MAJOR_VERSION: u16 = 1;
/// Minor version 1 added the flags word; version 0 headers predate it.
pub const GBB_MINOR_VERSION: u16 = 1;

const FLAGS_OFFSET: usize = 12;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid GBB signature: {0:?}")]
    InvalidMagic([u8; 4]),
    #[error("Unsupported GBB version: {0}.{1}")]
    UnsupportedVersion(u16, u16),
    #[error("GBB header truncated")]
    Truncated,
    #[error("GBB {0} region is out of bounds")]
    RegionOutOfBounds(&'static str),
    #[error("GBBFull: {0} needs {1} bytes but only {2} are reserved")]
    Full(&'static str, usize, usize),
    #[error("UnsupportedField: GBB version {0}.{1} has no flags field")]
    UnsupportedField(u16, u16),
    #[error("HWID is not NUL-terminated")]
    HwidNotTerminated,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Parsed header of the board metadata region. The header only holds
/// offset/size pairs; the accessors below operate on the backing region so
/// that edits land in place.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Gbb {
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: u32,
    hwid_offset: u32,
    hwid_size: u32,
    rootkey_offset: u32,
    rootkey_size: u32,
    bmpfv_offset: u32,
    bmpfv_size: u32,
    recovery_key_offset: u32,
    recovery_key_size: u32,
}

impl Gbb {
    pub fn parse(region: &[u8]) -> Result<Self> {
        let header = region.get(..GBB_HEADER_SIZE).ok_or(Error::Truncated)?;
        let mut reader = Cursor::new(header);

        let magic: [u8; 4] = reader.read_array_exact()?;
        if magic != GBB_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let major_version = reader.read_u16::<LittleEndian>()?;
        let minor_version = reader.read_u16::<LittleEndian>()?;
        if major_version != GBB_MAJOR_VERSION {
            return Err(Error::UnsupportedVersion(major_version, minor_version));
        }

        let header_size = reader.read_u32::<LittleEndian>()?;
        let flags = reader.read_u32::<LittleEndian>()?;

        Ok(Self {
            major_version,
            minor_version,
            header_size,
            flags,
            hwid_offset: reader.read_u32::<LittleEndian>()?,
            hwid_size: reader.read_u32::<LittleEndian>()?,
            rootkey_offset: reader.read_u32::<LittleEndian>()?,
            rootkey_size: reader.read_u32::<LittleEndian>()?,
            bmpfv_offset: reader.read_u32::<LittleEndian>()?,
            bmpfv_size: reader.read_u32::<LittleEndian>()?,
            recovery_key_offset: reader.read_u32::<LittleEndian>()?,
            recovery_key_size: reader.read_u32::<LittleEndian>()?,
        })
    }

    pub fn has_flags(&self) -> bool {
        self.minor_version >= 1
    }

    fn slot<'a>(&self, region: &'a [u8], name: &'static str, offset: u32, size: u32) -> Result<&'a [u8]> {
        region
            .get(offset as usize..(offset as usize) + size as usize)
            .ok_or(Error::RegionOutOfBounds(name))
    }

    fn slot_mut<'a>(
        &self,
        region: &'a mut [u8],
        name: &'static str,
        offset: u32,
        size: u32,
    ) -> Result<&'a mut [u8]> {
        region
            .get_mut(offset as usize..(offset as usize) + size as usize)
            .ok_or(Error::RegionOutOfBounds(name))
    }

    pub fn hwid(&self, region: &[u8]) -> Result<String> {
        let slot = self.slot(region, "HWID", self.hwid_offset, self.hwid_size)?;
        let end = slot
            .iter()
            .position(|b| *b == 0)
            .ok_or(Error::HwidNotTerminated)?;

        Ok(String::from_utf8_lossy(&slot[..end]).into_owned())
    }

    /// Replace the hardware ID string. The NUL terminator must fit too.
    pub fn set_hwid(&self, region: &mut [u8], hwid: &str) -> Result<()> {
        let slot = self.slot_mut(region, "HWID", self.hwid_offset, self.hwid_size)?;
        if hwid.len() + 1 > slot.len() {
            return Err(Error::Full("HWID", hwid.len() + 1, slot.len()));
        }

        slot.fill(0);
        slot[..hwid.len()].copy_from_slice(hwid.as_bytes());

        Ok(())
    }

    pub fn flags(&self) -> Result<u32> {
        if !self.has_flags() {
            return Err(Error::UnsupportedField(self.major_version, self.minor_version));
        }

        Ok(self.flags)
    }

    pub fn set_flags(&self, region: &mut [u8], flags: u32) -> Result<()> {
        if !self.has_flags() {
            return Err(Error::UnsupportedField(self.major_version, self.minor_version));
        }

        LittleEndian::write_u32(&mut region[FLAGS_OFFSET..FLAGS_OFFSET + 4], flags);

        Ok(())
    }

    pub fn rootkey(&self, region: &[u8]) -> Result<PublicKey> {
        let slot = self.slot(region, "root key", self.rootkey_offset, self.rootkey_size)?;
        Ok(PublicKey::parse(slot)?)
    }

    pub fn set_rootkey(&self, region: &mut [u8], key: &PublicKey) -> Result<()> {
        let slot = self.slot_mut(region, "root key", self.rootkey_offset, self.rootkey_size)?;
        write_key(slot, "root key", key)
    }

    pub fn recovery_key(&self, region: &[u8]) -> Result<PublicKey> {
        let slot = self.slot(
            region,
            "recovery key",
            self.recovery_key_offset,
            self.recovery_key_size,
        )?;
        Ok(PublicKey::parse(slot)?)
    }

    pub fn set_recovery_key(&self, region: &mut [u8], key: &PublicKey) -> Result<()> {
        let slot = self.slot_mut(
            region,
            "recovery key",
            self.recovery_key_offset,
            self.recovery_key_size,
        )?;
        write_key(slot, "recovery key", key)
    }
}

fn write_key(slot: &mut [u8], name: &'static str, key: &PublicKey) -> Result<()> {
    let raw = key.to_bytes();
    if raw.len() > slot.len() {
        return Err(Error::Full(name, raw.len(), slot.len()));
    }

    slot.fill(0);
    slot[..raw.len()].copy_from_slice(&raw);

    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use byteorder::WriteBytesExt;
    use rsa::RsaPrivateKey;

    use crate::crypto::{Algorithm, PrivateKey};

    use super::*;

    pub(super) fn build_region(minor_version: u16, size: usize) -> Vec<u8> {
        let mut header = vec![];
        header.extend_from_slice(&GBB_MAGIC);
        header.write_u16::<LittleEndian>(GBB_MAJOR_VERSION).unwrap();
        header.write_u16::<LittleEndian>(minor_version).unwrap();
        header
            .write_u32::<LittleEndian>(GBB_HEADER_SIZE as u32)
            .unwrap();
        header.write_u32::<LittleEndian>(0).unwrap(); // flags

        // hwid, rootkey, bmpfv, recovery key
        for (offset, slot_size) in [
            (0x100u32, 0x100u32),
            (0x200, 0x500),
            (0x700, 0x100),
            (0x800, 0x500),
        ] {
            header.write_u32::<LittleEndian>(offset).unwrap();
            header.write_u32::<LittleEndian>(slot_size).unwrap();
        }

        header.resize(GBB_HEADER_SIZE, 0);

        let mut region = vec![0u8; size];
        region[..GBB_HEADER_SIZE].copy_from_slice(&header);
        region
    }

    #[test]
    fn hwid_round_trip() {
        let mut region = build_region(GBB_MINOR_VERSION, 0x1000);
        let gbb = Gbb::parse(&region).unwrap();

        gbb.set_hwid(&mut region, "ACME BOARD 1234").unwrap();
        assert_eq!(gbb.hwid(&region).unwrap(), "ACME BOARD 1234");

        let long = "X".repeat(0x100);
        assert_matches!(
            gbb.set_hwid(&mut region, &long),
            Err(Error::Full("HWID", _, _))
        );
    }

    #[test]
    fn flags_round_trip() {
        let mut region = build_region(GBB_MINOR_VERSION, 0x1000);
        let gbb = Gbb::parse(&region).unwrap();

        gbb.set_flags(&mut region, 0x39).unwrap();
        assert_eq!(Gbb::parse(&region).unwrap().flags().unwrap(), 0x39);
    }

    #[test]
    fn legacy_gbb_has_no_flags() {
        let mut region = build_region(0, 0x1000);
        let gbb = Gbb::parse(&region).unwrap();

        assert_matches!(gbb.flags(), Err(Error::UnsupportedField(1, 0)));
        assert_matches!(
            gbb.set_flags(&mut region, 1),
            Err(Error::UnsupportedField(1, 0))
        );
    }

    #[test]
    fn rootkey_round_trip() {
        let mut region = build_region(GBB_MINOR_VERSION, 0x1000);
        let gbb = Gbb::parse(&region).unwrap();

        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let key = PrivateKey::from_rsa(key, Algorithm::Rsa1024Sha256).unwrap();
        let public = key.public_key(1).unwrap();

        gbb.set_rootkey(&mut region, &public).unwrap();
        assert_eq!(gbb.rootkey(&region).unwrap(), public);
    }
}
