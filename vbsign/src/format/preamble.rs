// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::{
    crypto::{self, PublicKey, Signer},
    format::SignatureInfo,
    stream::WriteZerosExt,
};

pub const PREAMBLE_HEADER_VERSION_MAJOR: u32 = 2;
pub const PREAMBLE_HEADER_VERSION_MINOR: u32 = 1;

/// Firmware preamble field offsets. The header is 104 bytes for version 2.0
/// and 108 bytes for 2.1, which appended the flags word.
const FW_HEADER_SIZE_V2_0: usize = 104;
const FW_HEADER_SIZE: usize = 108;
const FW_SIGNATURE_FIELD_OFFSET: usize = 8;
const FW_KERNEL_SUBKEY_FIELD_OFFSET: usize = 48;
const FW_BODY_SIGNATURE_FIELD_OFFSET: usize = 80;

/// Kernel preamble field offsets, same versioning as above.
const KERNEL_HEADER_SIZE_V2_0: usize = 96;
const KERNEL_HEADER_SIZE: usize = 100;
const KERNEL_SIGNATURE_FIELD_OFFSET: usize = 8;
const KERNEL_BODY_SIGNATURE_FIELD_OFFSET: usize = 72;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown preamble header version: {0}.{1}")]
    UnknownHeaderVersion(u32, u32),
    #[error("Preamble {0} does not fit in the buffer")]
    OutOfBounds(&'static str),
    #[error("Keyblock and preamble do not fit in {0} bytes of padding")]
    PaddingTooSmall(u64),
    #[error("BadSignature: preamble is not signed")]
    Unsigned,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A signature over the first `data_size` bytes of a firmware or kernel
/// body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BodySignature {
    pub data_size: u64,
    pub signature: Vec<u8>,
}

impl BodySignature {
    /// Sign the whole of `body` with the data key.
    pub fn over(body: &[u8], signer: &Signer) -> Result<Self> {
        Ok(Self {
            data_size: body.len() as u64,
            signature: signer.sign(body)?,
        })
    }
}

/// The signed header in front of a firmware body: version, kernel subkey,
/// body signature, and flags, all signed by the firmware data key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FirmwarePreamble {
    pub firmware_version: u64,
    pub kernel_subkey: PublicKey,
    pub body_signature: BodySignature,
    /// `None` when parsed from a 2.0 header that predates the flags field.
    pub flags: Option<u32>,
    pub signature: Vec<u8>,
    preamble_size: u64,
}

impl FirmwarePreamble {
    fn header_size(&self) -> usize {
        if self.flags.is_some() {
            FW_HEADER_SIZE
        } else {
            FW_HEADER_SIZE_V2_0
        }
    }

    /// Build and sign a new preamble with the firmware data key.
    pub fn create(
        firmware_version: u64,
        kernel_subkey: PublicKey,
        body_signature: BodySignature,
        flags: u32,
        signer: &Signer,
    ) -> Result<Self> {
        let signed_size =
            FW_HEADER_SIZE + kernel_subkey.key_data().len() + body_signature.signature.len();
        let preamble_size = (signed_size + signer.algorithm().signature_len()) as u64;

        let mut preamble = Self {
            firmware_version,
            kernel_subkey,
            body_signature,
            flags: Some(flags),
            signature: vec![],
            preamble_size,
        };

        preamble.signature = signer.sign(&preamble.signed_region()?)?;

        Ok(preamble)
    }

    /// Parse a preamble from the start of `buf`. Header version 2.0 is
    /// tolerated; it simply has no flags field.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(buf);

        let preamble_size = reader.read_u64::<LittleEndian>()?;
        if preamble_size < FW_HEADER_SIZE_V2_0 as u64 || preamble_size > buf.len() as u64 {
            return Err(Error::OutOfBounds("size"));
        }
        let block = &buf[..preamble_size as usize];

        let signature_info = SignatureInfo::read(&mut reader)?;

        let major = reader.read_u32::<LittleEndian>()?;
        let minor = reader.read_u32::<LittleEndian>()?;
        if major != PREAMBLE_HEADER_VERSION_MAJOR {
            return Err(Error::UnknownHeaderVersion(major, minor));
        }

        let firmware_version = reader.read_u64::<LittleEndian>()?;

        let kernel_subkey = PublicKey::parse_embedded(block, FW_KERNEL_SUBKEY_FIELD_OFFSET)?;

        reader.set_position(FW_BODY_SIGNATURE_FIELD_OFFSET as u64);
        let body_signature_info = SignatureInfo::read(&mut reader)?;
        let body_signature_range = body_signature_info
            .data_range(FW_BODY_SIGNATURE_FIELD_OFFSET, block.len())
            .ok_or(Error::OutOfBounds("body signature"))?;

        let flags = if minor >= 1 {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };

        let signature_range = signature_info
            .data_range(FW_SIGNATURE_FIELD_OFFSET, block.len())
            .ok_or(Error::OutOfBounds("signature"))?;

        Ok(Self {
            firmware_version,
            kernel_subkey,
            body_signature: BodySignature {
                data_size: body_signature_info.data_size,
                signature: block[body_signature_range].to_vec(),
            },
            flags,
            signature: block[signature_range].to_vec(),
            preamble_size,
        })
    }

    pub fn size(&self) -> u64 {
        self.preamble_size
    }

    /// Everything the preamble signature covers: the fixed header, the
    /// kernel subkey data, and the body signature data.
    fn signed_region(&self) -> Result<Vec<u8>> {
        let header_size = self.header_size();
        let subkey_len = self.kernel_subkey.key_data().len();
        let body_sig_len = self.body_signature.signature.len();
        let signed_size = header_size + subkey_len + body_sig_len;

        let mut buf = Vec::with_capacity(signed_size);
        buf.write_u64::<LittleEndian>(self.preamble_size)?;

        SignatureInfo {
            sig_offset: (signed_size - FW_SIGNATURE_FIELD_OFFSET) as u64,
            sig_size: self.preamble_size - signed_size as u64,
            data_size: signed_size as u64,
        }
        .write(&mut buf)?;

        buf.write_u32::<LittleEndian>(PREAMBLE_HEADER_VERSION_MAJOR)?;
        buf.write_u32::<LittleEndian>(if self.flags.is_some() {
            PREAMBLE_HEADER_VERSION_MINOR
        } else {
            0
        })?;
        buf.write_u64::<LittleEndian>(self.firmware_version)?;

        self.kernel_subkey.write_header(
            &mut buf,
            (header_size - FW_KERNEL_SUBKEY_FIELD_OFFSET) as u64,
        )?;

        SignatureInfo {
            sig_offset: (header_size + subkey_len - FW_BODY_SIGNATURE_FIELD_OFFSET) as u64,
            sig_size: body_sig_len as u64,
            data_size: self.body_signature.data_size,
        }
        .write(&mut buf)?;

        if let Some(flags) = self.flags {
            buf.write_u32::<LittleEndian>(flags)?;
        }
        buf.extend_from_slice(self.kernel_subkey.key_data());
        buf.extend_from_slice(&self.body_signature.signature);

        Ok(buf)
    }

    /// Serialize to exactly `preamble_size` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = self.signed_region()?;
        buf.extend_from_slice(&self.signature);
        buf.write_zeros_exact(self.preamble_size - buf.len() as u64)?;

        Ok(buf)
    }

    /// Verify the preamble signature against the firmware data key.
    pub fn verify(&self, data_key: &PublicKey) -> Result<()> {
        if self.signature.is_empty() {
            return Err(Error::Unsigned);
        }

        data_key.verify(&self.signed_region()?, &self.signature)?;

        Ok(())
    }
}

/// The signed header in front of a kernel blob. Unlike the firmware
/// preamble, it carries load addresses and is padded out so that keyblock
/// plus preamble fill the configured vblock padding.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KernelPreamble {
    pub kernel_version: u64,
    pub body_load_address: u64,
    pub bootloader_address: u64,
    pub bootloader_size: u64,
    pub body_signature: BodySignature,
    /// `None` when parsed from a 2.0 header that predates the flags field.
    pub flags: Option<u32>,
    pub signature: Vec<u8>,
    preamble_size: u64,
    signature_size: u64,
}

impl KernelPreamble {
    fn header_size(&self) -> usize {
        if self.flags.is_some() {
            KERNEL_HEADER_SIZE
        } else {
            KERNEL_HEADER_SIZE_V2_0
        }
    }

    /// Build and sign a new preamble, sized so that
    /// `keyblock_size + preamble_size == padding`.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        kernel_version: u64,
        body_load_address: u64,
        bootloader_address: u64,
        bootloader_size: u64,
        body_signature: BodySignature,
        flags: u32,
        signer: &Signer,
        padding: u64,
        keyblock_size: u64,
    ) -> Result<Self> {
        let signature_size = signer.algorithm().signature_len() as u64;
        let min_size =
            (KERNEL_HEADER_SIZE + body_signature.signature.len()) as u64 + signature_size;
        let preamble_size = padding
            .checked_sub(keyblock_size)
            .filter(|s| *s >= min_size)
            .ok_or(Error::PaddingTooSmall(padding))?;

        let mut preamble = Self {
            kernel_version,
            body_load_address,
            bootloader_address,
            bootloader_size,
            body_signature,
            flags: Some(flags),
            signature: vec![],
            preamble_size,
            signature_size,
        };

        preamble.signature = signer.sign(&preamble.signed_region()?)?;

        Ok(preamble)
    }

    /// Parse a preamble from the start of `buf`. Header version 2.0 is
    /// tolerated; it simply has no flags field.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let mut reader = Cursor::new(buf);

        let preamble_size = reader.read_u64::<LittleEndian>()?;
        if preamble_size < KERNEL_HEADER_SIZE_V2_0 as u64 || preamble_size > buf.len() as u64 {
            return Err(Error::OutOfBounds("size"));
        }
        let block = &buf[..preamble_size as usize];

        let signature_info = SignatureInfo::read(&mut reader)?;

        let major = reader.read_u32::<LittleEndian>()?;
        let minor = reader.read_u32::<LittleEndian>()?;
        if major != PREAMBLE_HEADER_VERSION_MAJOR {
            return Err(Error::UnknownHeaderVersion(major, minor));
        }

        let kernel_version = reader.read_u64::<LittleEndian>()?;
        let body_load_address = reader.read_u64::<LittleEndian>()?;
        let bootloader_address = reader.read_u64::<LittleEndian>()?;
        let bootloader_size = reader.read_u64::<LittleEndian>()?;

        let body_signature_info = SignatureInfo::read(&mut reader)?;
        let body_signature_range = body_signature_info
            .data_range(KERNEL_BODY_SIGNATURE_FIELD_OFFSET, block.len())
            .ok_or(Error::OutOfBounds("body signature"))?;

        let flags = if minor >= 1 {
            Some(reader.read_u32::<LittleEndian>()?)
        } else {
            None
        };

        let signature_range = signature_info
            .data_range(KERNEL_SIGNATURE_FIELD_OFFSET, block.len())
            .ok_or(Error::OutOfBounds("signature"))?;

        Ok(Self {
            kernel_version,
            body_load_address,
            bootloader_address,
            bootloader_size,
            body_signature: BodySignature {
                data_size: body_signature_info.data_size,
                signature: block[body_signature_range].to_vec(),
            },
            flags,
            signature: block[signature_range].to_vec(),
            preamble_size,
            signature_size: signature_info.sig_size,
        })
    }

    pub fn size(&self) -> u64 {
        self.preamble_size
    }

    fn signed_region(&self) -> Result<Vec<u8>> {
        let header_size = self.header_size();
        let body_sig_len = self.body_signature.signature.len();
        let signed_size = header_size + body_sig_len;

        let mut buf = Vec::with_capacity(signed_size);
        buf.write_u64::<LittleEndian>(self.preamble_size)?;

        SignatureInfo {
            sig_offset: (signed_size - KERNEL_SIGNATURE_FIELD_OFFSET) as u64,
            sig_size: self.signature_size,
            data_size: signed_size as u64,
        }
        .write(&mut buf)?;

        buf.write_u32::<LittleEndian>(PREAMBLE_HEADER_VERSION_MAJOR)?;
        buf.write_u32::<LittleEndian>(if self.flags.is_some() {
            PREAMBLE_HEADER_VERSION_MINOR
        } else {
            0
        })?;
        buf.write_u64::<LittleEndian>(self.kernel_version)?;
        buf.write_u64::<LittleEndian>(self.body_load_address)?;
        buf.write_u64::<LittleEndian>(self.bootloader_address)?;
        buf.write_u64::<LittleEndian>(self.bootloader_size)?;

        SignatureInfo {
            sig_offset: (header_size + body_sig_len - KERNEL_BODY_SIGNATURE_FIELD_OFFSET) as u64,
            sig_size: body_sig_len as u64,
            data_size: self.body_signature.data_size,
        }
        .write(&mut buf)?;

        if let Some(flags) = self.flags {
            buf.write_u32::<LittleEndian>(flags)?;
        }
        buf.extend_from_slice(&self.body_signature.signature);

        Ok(buf)
    }

    /// Serialize to exactly `preamble_size` bytes, padding with zeros.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = self.signed_region()?;
        buf.extend_from_slice(&self.signature);
        buf.write_zeros_exact(self.preamble_size - buf.len() as u64)?;

        Ok(buf)
    }

    /// Verify the preamble signature against the kernel data key.
    pub fn verify(&self, data_key: &PublicKey) -> Result<()> {
        if self.signature.is_empty() {
            return Err(Error::Unsigned);
        }

        data_key.verify(&self.signed_region()?, &self.signature)?;

        Ok(())
    }
}
