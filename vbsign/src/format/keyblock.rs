// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fmt, fs,
    io::{self, Cursor},
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sha2::{Digest, Sha512};
use thiserror::Error;

use crate::{
    crypto::{self, PublicKey, Signer},
    format::SignatureInfo,
    stream::{ReadFixedSizeExt, WriteZerosExt},
};

pub const KEYBLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";
pub const KEYBLOCK_HEADER_VERSION_MAJOR: u32 = 2;
pub const KEYBLOCK_HEADER_VERSION_MINOR: u32 = 1;

pub const KEYBLOCK_FLAG_DEVELOPER_0: u64 = 0x1;
pub const KEYBLOCK_FLAG_DEVELOPER_1: u64 = 0x2;
pub const KEYBLOCK_FLAG_RECOVERY_0: u64 = 0x4;
pub const KEYBLOCK_FLAG_RECOVERY_1: u64 = 0x8;

/// Fixed header: magic, header version, total size, signature header,
/// checksum header, flags, and the data key header.
const HEADER_SIZE: usize = 112;

/// Field offsets within the fixed header. The wire offsets stored in the
/// signature and key headers are relative to these positions.
const SIGNATURE_FIELD_OFFSET: usize = 24;
const CHECKSUM_FIELD_OFFSET: usize = 48;
const DATA_KEY_FIELD_OFFSET: usize = 80;

const CHECKSUM_SIZE: usize = 64;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read keyblock {0:?}")]
    ReadFile(PathBuf, #[source] io::Error),
    #[error("Invalid keyblock magic: {0:?}")]
    InvalidMagic([u8; 8]),
    #[error("Unknown keyblock header version: {0}.{1}")]
    UnknownHeaderVersion(u32, u32),
    #[error("Keyblock {0} does not fit in the buffer")]
    OutOfBounds(&'static str),
    #[error("Keyblock declares an unexpected {0} layout")]
    UnexpectedLayout(&'static str),
    #[error("BadSignature: keyblock checksum mismatch")]
    ChecksumMismatch,
    #[error("BadSignature: keyblock is not signed")]
    Unsigned,
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A signed wrapper around a public data key plus a flag word. The checksum
/// always covers the header and key data; the signature is produced by a
/// root key and may be absent for unsigned keyblocks.
#[derive(Clone, Eq, PartialEq)]
pub struct Keyblock {
    pub flags: u64,
    pub data_key: PublicKey,
    pub checksum: Vec<u8>,
    pub signature: Vec<u8>,
    total_size: u64,
}

impl fmt::Debug for Keyblock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyblock")
            .field("flags", &self.flags)
            .field("data_key", &self.data_key)
            .field("checksum", &hex::encode(&self.checksum))
            .field("signature", &hex::encode(&self.signature))
            .field("total_size", &self.total_size)
            .finish()
    }
}

impl Keyblock {
    /// Wrap `data_key` into a keyblock. When a signer is supplied, the block
    /// is signed by it; otherwise it carries only the checksum.
    pub fn create(data_key: PublicKey, flags: u64, signer: Option<&Signer>) -> Result<Self> {
        let signature_len = signer.map_or(0, |s| s.algorithm().signature_len());
        let total_size =
            (HEADER_SIZE + data_key.key_data().len() + CHECKSUM_SIZE + signature_len) as u64;

        let mut keyblock = Self {
            flags,
            data_key,
            checksum: vec![],
            signature: vec![],
            total_size,
        };

        let signed_region = keyblock.signed_region()?;
        keyblock.checksum = Sha512::digest(&signed_region).to_vec();
        if let Some(signer) = signer {
            keyblock.signature = signer.sign(&signed_region)?;
        }

        Ok(keyblock)
    }

    /// Parse a keyblock from the start of `buf`, bounds-checking every
    /// length field against the buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let header = buf
            .get(..HEADER_SIZE)
            .ok_or(Error::OutOfBounds("header"))?;
        let mut reader = Cursor::new(header);

        let magic: [u8; 8] = reader.read_array_exact()?;
        if magic != KEYBLOCK_MAGIC {
            return Err(Error::InvalidMagic(magic));
        }

        let major = reader.read_u32::<LittleEndian>()?;
        let minor = reader.read_u32::<LittleEndian>()?;
        if major != KEYBLOCK_HEADER_VERSION_MAJOR {
            return Err(Error::UnknownHeaderVersion(major, minor));
        }

        let total_size = reader.read_u64::<LittleEndian>()?;
        if total_size < HEADER_SIZE as u64 || total_size > buf.len() as u64 {
            return Err(Error::OutOfBounds("total size"));
        }
        let block = &buf[..total_size as usize];

        let signature_info = SignatureInfo::read(&mut reader)?;
        let checksum_info = SignatureInfo::read(&mut reader)?;
        let flags = reader.read_u64::<LittleEndian>()?;

        let data_key = PublicKey::parse_embedded(block, DATA_KEY_FIELD_OFFSET)?;

        let signed_size = (HEADER_SIZE + data_key.key_data().len()) as u64;

        if checksum_info.sig_size != CHECKSUM_SIZE as u64 {
            return Err(Error::UnexpectedLayout("checksum size"));
        }
        if checksum_info.data_size != signed_size {
            return Err(Error::UnexpectedLayout("checksum coverage"));
        }
        let checksum_range = checksum_info
            .data_range(CHECKSUM_FIELD_OFFSET, block.len())
            .ok_or(Error::OutOfBounds("checksum"))?;
        let checksum = block[checksum_range].to_vec();

        let signature = if signature_info.sig_size == 0 {
            vec![]
        } else {
            if signature_info.data_size != signed_size {
                return Err(Error::UnexpectedLayout("signature coverage"));
            }
            let range = signature_info
                .data_range(SIGNATURE_FIELD_OFFSET, block.len())
                .ok_or(Error::OutOfBounds("signature"))?;
            block[range].to_vec()
        };

        Ok(Self {
            flags,
            data_key,
            checksum,
            signature,
            total_size,
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::ReadFile(path.to_owned(), e))?;
        Self::parse(&data)
    }

    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// The bytes covered by both the checksum and the signature: the fixed
    /// header followed by the packed data key.
    fn signed_region(&self) -> Result<Vec<u8>> {
        let key_len = self.data_key.key_data().len();
        let mut buf = Vec::with_capacity(HEADER_SIZE + key_len);

        buf.extend_from_slice(&KEYBLOCK_MAGIC);
        buf.write_u32::<LittleEndian>(KEYBLOCK_HEADER_VERSION_MAJOR)?;
        buf.write_u32::<LittleEndian>(KEYBLOCK_HEADER_VERSION_MINOR)?;
        buf.write_u64::<LittleEndian>(self.total_size)?;

        let checksum_offset = HEADER_SIZE + key_len;
        let signature_offset = checksum_offset + CHECKSUM_SIZE;
        let signed_size = (HEADER_SIZE + key_len) as u64;

        SignatureInfo {
            sig_offset: (signature_offset - SIGNATURE_FIELD_OFFSET) as u64,
            sig_size: self.signature_len() as u64,
            data_size: signed_size,
        }
        .write(&mut buf)?;

        SignatureInfo {
            sig_offset: (checksum_offset - CHECKSUM_FIELD_OFFSET) as u64,
            sig_size: CHECKSUM_SIZE as u64,
            data_size: signed_size,
        }
        .write(&mut buf)?;

        buf.write_u64::<LittleEndian>(self.flags)?;
        self.data_key
            .write_header(&mut buf, (HEADER_SIZE - DATA_KEY_FIELD_OFFSET) as u64)?;
        buf.extend_from_slice(self.data_key.key_data());

        Ok(buf)
    }

    fn signature_len(&self) -> usize {
        if self.signature.is_empty() {
            // An unsigned block still reserves space for a signature so the
            // declared total size stays consistent after parsing.
            (self.total_size as usize)
                .saturating_sub(HEADER_SIZE + self.data_key.key_data().len() + CHECKSUM_SIZE)
        } else {
            self.signature.len()
        }
    }

    /// Serialize to exactly `key_block_size` bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = self.signed_region()?;
        buf.extend_from_slice(&self.checksum);
        buf.extend_from_slice(&self.signature);
        buf.write_zeros_exact(self.total_size - buf.len() as u64)?;

        Ok(buf)
    }

    /// Verify the checksum, and the signature when a trusted root key is
    /// supplied.
    pub fn verify(&self, root: Option<&PublicKey>) -> Result<()> {
        let signed_region = self.signed_region()?;

        if Sha512::digest(&signed_region).as_slice() != self.checksum.as_slice() {
            return Err(Error::ChecksumMismatch);
        }

        if let Some(root) = root {
            if self.signature.is_empty() {
                return Err(Error::Unsigned);
            }
            root.verify(&signed_region, &self.signature)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use rsa::RsaPrivateKey;

    use crate::crypto::{Algorithm, PrivateKey};

    use super::*;

    fn generate_signer(algorithm: Algorithm) -> (Signer, PublicKey) {
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, algorithm.key_bits()).unwrap();
        let key = PrivateKey::from_rsa(key, algorithm).unwrap();
        let public = key.public_key(1).unwrap();

        (Signer::Private(key), public)
    }

    #[test]
    fn round_trip_signed() {
        let (root, root_public) = generate_signer(Algorithm::Rsa1024Sha256);
        let (_, data_public) = generate_signer(Algorithm::Rsa1024Sha256);

        let keyblock = Keyblock::create(
            data_public.clone(),
            KEYBLOCK_FLAG_DEVELOPER_0 | KEYBLOCK_FLAG_RECOVERY_0,
            Some(&root),
        )
        .unwrap();
        let raw = keyblock.to_bytes().unwrap();
        assert_eq!(raw.len() as u64, keyblock.size());

        let parsed = Keyblock::parse(&raw).unwrap();
        assert_eq!(parsed, keyblock);
        assert_eq!(parsed.data_key, data_public);

        parsed.verify(None).unwrap();
        parsed.verify(Some(&root_public)).unwrap();
    }

    #[test]
    fn wrong_root_rejected() {
        let (root, _) = generate_signer(Algorithm::Rsa1024Sha256);
        let (_, other_public) = generate_signer(Algorithm::Rsa1024Sha256);

        let keyblock = Keyblock::create(other_public.clone(), 0, Some(&root)).unwrap();

        assert_matches!(
            keyblock.verify(Some(&other_public)),
            Err(Error::Crypto(crypto::Error::BadSignature(_)))
        );
    }

    #[test]
    fn unsigned_keyblock() {
        let (_, data_public) = generate_signer(Algorithm::Rsa1024Sha256);
        let (_, root_public) = generate_signer(Algorithm::Rsa1024Sha256);

        let keyblock = Keyblock::create(data_public, 0, None).unwrap();
        let parsed = Keyblock::parse(&keyblock.to_bytes().unwrap()).unwrap();

        parsed.verify(None).unwrap();
        assert_matches!(parsed.verify(Some(&root_public)), Err(Error::Unsigned));
    }

    #[test]
    fn corrupted_keyblock() {
        let (root, _) = generate_signer(Algorithm::Rsa1024Sha256);
        let (_, data_public) = generate_signer(Algorithm::Rsa1024Sha256);

        let keyblock = Keyblock::create(data_public, 0, Some(&root)).unwrap();
        let mut raw = keyblock.to_bytes().unwrap();
        raw[72] ^= 1; // flags word

        let parsed = Keyblock::parse(&raw).unwrap();
        assert_matches!(parsed.verify(None), Err(Error::ChecksumMismatch));
    }

    #[test]
    fn truncated_keyblock() {
        let (_, data_public) = generate_signer(Algorithm::Rsa1024Sha256);

        let keyblock = Keyblock::create(data_public, 0, None).unwrap();
        let raw = keyblock.to_bytes().unwrap();

        assert_matches!(
            Keyblock::parse(&raw[..raw.len() - 1]),
            Err(Error::OutOfBounds(_))
        );
        assert_matches!(Keyblock::parse(&raw[..64]), Err(Error::OutOfBounds(_)));
    }
}
