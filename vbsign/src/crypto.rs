/*
 * SPDX-FileCopyrightText: 2024 vbsign contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fmt,
    fs, io,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_bigint_dig::{ModInverse, ToBigInt};
use num_traits::{Pow, ToPrimitive};
use rsa::{
    pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts, BigUint,
    Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

pub const NUM_ALGORITHMS: u64 = 12;

/// Size of the public key header preceding the packed key data.
pub const PUBLIC_KEY_HEADER_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("BadKey: failed to read key file {0:?}")]
    ReadKey(PathBuf, #[source] io::Error),
    #[error("BadKey: unknown algorithm ID {0}")]
    UnknownAlgorithm(u64),
    #[error("BadKey: failed to parse RSA private key")]
    ParsePrivateKey(#[source] rsa::pkcs1::Error),
    #[error("BadKey: failed to parse PEM private key")]
    ParsePemKey(#[source] rsa::pkcs8::Error),
    #[error("BadKey: {0}")]
    InvalidPublicKey(&'static str),
    #[error("BadKey: public key rejected")]
    RsaKey(#[source] rsa::Error),
    #[error("AlgoMismatch: key is {key_bits} bits, but {algorithm:?} requires {expected_bits}")]
    AlgoMismatch {
        algorithm: Algorithm,
        key_bits: usize,
        expected_bits: usize,
    },
    #[error("BadSignature: signature verification failed")]
    BadSignature(#[source] rsa::Error),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] rsa::Error),
    #[error("ExternalSignerFailed: failed to run {0:?}")]
    ExternalSignerSpawn(PathBuf, #[source] io::Error),
    #[error("ExternalSignerFailed: {0:?} exited with {1}")]
    ExternalSignerExit(PathBuf, std::process::ExitStatus),
    #[error("ExternalSignerFailed: expected {expected} signature bytes, got {actual}")]
    ExternalSignerOutput { expected: usize, actual: usize },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Signature algorithm identifiers. The numeric values are stored in key
/// files, keyblocks, and preambles, and select both the RSA modulus size and
/// the message digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Algorithm {
    Rsa1024Sha1,
    Rsa1024Sha256,
    Rsa1024Sha512,
    Rsa2048Sha1,
    Rsa2048Sha256,
    Rsa2048Sha512,
    Rsa4096Sha1,
    Rsa4096Sha256,
    Rsa4096Sha512,
    Rsa8192Sha1,
    Rsa8192Sha256,
    Rsa8192Sha512,
}

impl Algorithm {
    pub fn from_raw(value: u64) -> Result<Self> {
        let algorithm = match value {
            0 => Self::Rsa1024Sha1,
            1 => Self::Rsa1024Sha256,
            2 => Self::Rsa1024Sha512,
            3 => Self::Rsa2048Sha1,
            4 => Self::Rsa2048Sha256,
            5 => Self::Rsa2048Sha512,
            6 => Self::Rsa4096Sha1,
            7 => Self::Rsa4096Sha256,
            8 => Self::Rsa4096Sha512,
            9 => Self::Rsa8192Sha1,
            10 => Self::Rsa8192Sha256,
            11 => Self::Rsa8192Sha512,
            v => return Err(Error::UnknownAlgorithm(v)),
        };

        Ok(algorithm)
    }

    pub fn to_raw(self) -> u64 {
        match self {
            Self::Rsa1024Sha1 => 0,
            Self::Rsa1024Sha256 => 1,
            Self::Rsa1024Sha512 => 2,
            Self::Rsa2048Sha1 => 3,
            Self::Rsa2048Sha256 => 4,
            Self::Rsa2048Sha512 => 5,
            Self::Rsa4096Sha1 => 6,
            Self::Rsa4096Sha256 => 7,
            Self::Rsa4096Sha512 => 8,
            Self::Rsa8192Sha1 => 9,
            Self::Rsa8192Sha256 => 10,
            Self::Rsa8192Sha512 => 11,
        }
    }

    pub fn key_bits(self) -> usize {
        match self {
            Self::Rsa1024Sha1 | Self::Rsa1024Sha256 | Self::Rsa1024Sha512 => 1024,
            Self::Rsa2048Sha1 | Self::Rsa2048Sha256 | Self::Rsa2048Sha512 => 2048,
            Self::Rsa4096Sha1 | Self::Rsa4096Sha256 | Self::Rsa4096Sha512 => 4096,
            Self::Rsa8192Sha1 | Self::Rsa8192Sha256 | Self::Rsa8192Sha512 => 8192,
        }
    }

    /// Signature size in bytes. Equals the modulus size.
    pub fn signature_len(self) -> usize {
        self.key_bits() / 8
    }

    /// Number of 32-bit words in the packed modulus.
    pub fn key_words(self) -> usize {
        self.key_bits() / 32
    }

    /// Size of the packed key data (word count, n0inv, modulus, R^2 mod N).
    pub fn packed_key_len(self) -> usize {
        8 + 2 * 4 * self.key_words()
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Rsa1024Sha1 | Self::Rsa2048Sha1 | Self::Rsa4096Sha1 | Self::Rsa8192Sha1 => {
                Sha1::digest(data).to_vec()
            }
            Self::Rsa1024Sha256
            | Self::Rsa2048Sha256
            | Self::Rsa4096Sha256
            | Self::Rsa8192Sha256 => Sha256::digest(data).to_vec(),
            Self::Rsa1024Sha512
            | Self::Rsa2048Sha512
            | Self::Rsa4096Sha512
            | Self::Rsa8192Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn pkcs1v15(self) -> Pkcs1v15Sign {
        match self {
            Self::Rsa1024Sha1 | Self::Rsa2048Sha1 | Self::Rsa4096Sha1 | Self::Rsa8192Sha1 => {
                Pkcs1v15Sign::new::<Sha1>()
            }
            Self::Rsa1024Sha256
            | Self::Rsa2048Sha256
            | Self::Rsa4096Sha256
            | Self::Rsa8192Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            Self::Rsa1024Sha512
            | Self::Rsa2048Sha512
            | Self::Rsa4096Sha512
            | Self::Rsa8192Sha512 => Pkcs1v15Sign::new::<Sha512>(),
        }
    }

    pub fn sign(self, key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
        key.sign(self.pkcs1v15(), digest).map_err(Error::RsaSign)
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        key.verify(self.pkcs1v15(), digest, signature)
            .map_err(Error::BadSignature)
    }
}

/// A public key in the packed wire format: the 32-byte header (key offset,
/// key size, algorithm, key version) followed by the word count, n0inv, the
/// little-endian modulus, and R^2 mod N. The boot ROM consumes the
/// precomputed montgomery parameters directly, so they are part of the key
/// material rather than derived at verify time.
#[derive(Clone, Eq, PartialEq)]
pub struct PublicKey {
    pub algorithm: Algorithm,
    pub key_version: u64,
    key_data: Vec<u8>,
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("algorithm", &self.algorithm)
            .field("key_version", &self.key_version)
            .field("key_data", &hex::encode(&self.key_data))
            .finish()
    }
}

impl PublicKey {
    /// Pack an RSA public key, precomputing n0inv and R^2 mod N.
    pub fn from_rsa(key: &RsaPublicKey, algorithm: Algorithm, key_version: u64) -> Result<Self> {
        if key.e() != &BigUint::from(65537u32) {
            return Err(Error::InvalidPublicKey("public exponent must be 65537"));
        }

        let key_bytes = algorithm.signature_len();
        if key.size() != key_bytes {
            return Err(Error::AlgoMismatch {
                algorithm,
                key_bits: key.size() * 8,
                expected_bits: algorithm.key_bits(),
            });
        }

        // n0inv = -1 / n[0] (mod 2^32), guaranteed to fit in a u32.
        let b = BigUint::from(2u64.pow(32));
        let n0inv = b.to_bigint().unwrap() - key.n().mod_inverse(&b).unwrap();
        let rr = BigUint::from(2u32)
            .pow(key.n().bits())
            .modpow(&BigUint::from(2u32), key.n());

        let mut key_data = Vec::with_capacity(algorithm.packed_key_len());
        key_data.write_u32::<LittleEndian>(algorithm.key_words() as u32)?;
        key_data.write_u32::<LittleEndian>(n0inv.to_u32().unwrap())?;

        let mut n_raw = key.n().to_bytes_le();
        n_raw.resize(key_bytes, 0);
        key_data.extend_from_slice(&n_raw);

        let mut rr_raw = rr.to_bytes_le();
        rr_raw.resize(key_bytes, 0);
        key_data.extend_from_slice(&rr_raw);

        Ok(Self {
            algorithm,
            key_version,
            key_data,
        })
    }

    /// Parse a standalone public key file (header at offset 0).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        Self::parse_embedded(buf, 0)
    }

    /// Parse a public key header embedded at `header_offset` within `buf`.
    /// The key data offset in the header is relative to the header itself.
    pub fn parse_embedded(buf: &[u8], header_offset: usize) -> Result<Self> {
        let header = buf
            .get(header_offset..header_offset + PUBLIC_KEY_HEADER_SIZE)
            .ok_or(Error::InvalidPublicKey("public key header out of bounds"))?;

        let mut reader = Cursor::new(header);
        let key_offset = reader.read_u64::<LittleEndian>()?;
        let key_size = reader.read_u64::<LittleEndian>()?;
        let algorithm = Algorithm::from_raw(reader.read_u64::<LittleEndian>()?)?;
        let key_version = reader.read_u64::<LittleEndian>()?;

        if key_size != algorithm.packed_key_len() as u64 {
            return Err(Error::InvalidPublicKey("key size does not match algorithm"));
        }

        let data_start = (header_offset as u64)
            .checked_add(key_offset)
            .and_then(|o| o.to_usize())
            .ok_or(Error::InvalidPublicKey("key data offset out of bounds"))?;
        let key_data = buf
            .get(data_start..data_start + key_size as usize)
            .ok_or(Error::InvalidPublicKey("key data out of bounds"))?;

        Ok(Self {
            algorithm,
            key_version,
            key_data: key_data.to_vec(),
        })
    }

    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::ReadKey(path.to_owned(), e))?;
        Self::parse(&data)
    }

    pub fn key_data(&self) -> &[u8] {
        &self.key_data
    }

    /// Total serialized size (header + packed key data).
    pub fn size(&self) -> usize {
        PUBLIC_KEY_HEADER_SIZE + self.key_data.len()
    }

    /// Serialize with the key data immediately following the header.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        self.write_header(&mut buf, PUBLIC_KEY_HEADER_SIZE as u64)
            .unwrap();
        buf.extend_from_slice(&self.key_data);
        buf
    }

    /// Write just the 32-byte header with the given relative key data offset.
    pub(crate) fn write_header(&self, mut writer: impl Write, key_offset: u64) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(key_offset)?;
        writer.write_u64::<LittleEndian>(self.key_data.len() as u64)?;
        writer.write_u64::<LittleEndian>(self.algorithm.to_raw())?;
        writer.write_u64::<LittleEndian>(self.key_version)?;
        Ok(())
    }

    /// Reconstruct the RSA public key from the packed modulus.
    pub fn to_rsa(&self) -> Result<RsaPublicKey> {
        let key_bytes = self.algorithm.signature_len();
        let modulus = BigUint::from_bytes_le(&self.key_data[8..8 + key_bytes]);

        RsaPublicKey::new(modulus, BigUint::from(65537u32)).map_err(Error::RsaKey)
    }

    /// Hash `data` with the key's algorithm and verify `signature` over it.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<()> {
        let digest = self.algorithm.hash(data);
        self.algorithm.verify(&self.to_rsa()?, &digest, signature)
    }
}

/// An RSA private key paired with the algorithm it is meant to sign with.
#[derive(Clone)]
pub struct PrivateKey {
    pub algorithm: Algorithm,
    key: RsaPrivateKey,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    pub fn from_rsa(key: RsaPrivateKey, algorithm: Algorithm) -> Result<Self> {
        if key.size() != algorithm.signature_len() {
            return Err(Error::AlgoMismatch {
                algorithm,
                key_bits: key.size() * 8,
                expected_bits: algorithm.key_bits(),
            });
        }

        Ok(Self { algorithm, key })
    }

    /// Read a private key file: a 64-bit algorithm ID followed by the PKCS#1
    /// DER encoding of the RSA key.
    pub fn read(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| Error::ReadKey(path.to_owned(), e))?;

        let mut reader = Cursor::new(&data);
        let algorithm = Algorithm::from_raw(reader.read_u64::<LittleEndian>()?)?;
        let key = RsaPrivateKey::from_pkcs1_der(&data[8..]).map_err(Error::ParsePrivateKey)?;

        Self::from_rsa(key, algorithm)
    }

    /// Read a PEM private key with an explicitly chosen algorithm. Both the
    /// PKCS#8 and the older PKCS#1 encapsulation are accepted.
    pub fn read_pem(path: &Path, algorithm: Algorithm) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::ReadKey(path.to_owned(), e))?;

        let key = if data.contains("BEGIN RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(&data).map_err(Error::ParsePrivateKey)?
        } else {
            RsaPrivateKey::from_pkcs8_pem(&data).map_err(Error::ParsePemKey)?
        };

        Self::from_rsa(key, algorithm)
    }

    /// Serialize to the private key file format.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use rsa::pkcs1::EncodeRsaPrivateKey;

        let der = self.key.to_pkcs1_der().map_err(Error::ParsePrivateKey)?;

        let mut buf = Vec::with_capacity(8 + der.as_bytes().len());
        buf.write_u64::<LittleEndian>(self.algorithm.to_raw())?;
        buf.extend_from_slice(der.as_bytes());
        Ok(buf)
    }

    /// Hash `data` with the key's algorithm and sign the digest.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = self.algorithm.hash(data);
        self.algorithm.sign(&self.key, &digest)
    }

    /// Pack the corresponding public key.
    pub fn public_key(&self, key_version: u64) -> Result<PublicKey> {
        PublicKey::from_rsa(&self.key.to_public_key(), self.algorithm, key_version)
    }
}

/// Signature producer: either an in-process private key or an external
/// program that is handed the PEM path and the to-be-signed bytes.
pub enum Signer {
    Private(PrivateKey),
    External(ExternalSigner),
}

impl Signer {
    pub fn algorithm(&self) -> Algorithm {
        match self {
            Self::Private(key) => key.algorithm,
            Self::External(signer) => signer.algorithm,
        }
    }

    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Self::Private(key) => key.sign(data),
            Self::External(signer) => signer.sign(data),
        }
    }
}

/// External signing program. The program is invoked with the PEM key path as
/// its only argument, receives the raw to-be-signed bytes on stdin, and must
/// write exactly one signature to stdout.
pub struct ExternalSigner {
    pub program: PathBuf,
    pub pem_path: PathBuf,
    pub algorithm: Algorithm,
}

impl ExternalSigner {
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .arg(&self.pem_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ExternalSignerSpawn(self.program.clone(), e))?;

        // The child only emits the signature after consuming all of its
        // input, so feeding stdin to completion first cannot deadlock.
        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(data)?;

        let mut signature = vec![];
        child
            .stdout
            .take()
            .expect("stdout was piped")
            .read_to_end(&mut signature)?;

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::ExternalSignerExit(self.program.clone(), status));
        }

        if signature.len() != self.algorithm.signature_len() {
            return Err(Error::ExternalSignerOutput {
                expected: self.algorithm.signature_len(),
                actual: signature.len(),
            });
        }

        Ok(signature)
    }
}
