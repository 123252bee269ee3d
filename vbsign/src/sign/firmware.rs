// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use crate::{
    crypto::{self, PublicKey, Signer},
    format::{
        keyblock::{self, Keyblock},
        preamble::{self, BodySignature, FirmwarePreamble},
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Keyblock error")]
    Keyblock(#[from] keyblock::Error),
    #[error("Preamble error")]
    Preamble(#[from] preamble::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

pub struct FirmwareSignOptions<'a> {
    pub signer: &'a Signer,
    pub keyblock: &'a Keyblock,
    pub kernel_subkey: &'a PublicKey,
    pub version: u32,
    pub flags: u32,
}

/// Sign a raw firmware body, producing the bytes of a firmware vblock: the
/// supplied keyblock followed by a freshly built preamble.
pub fn sign_raw_firmware(body: &[u8], options: &FirmwareSignOptions) -> Result<Vec<u8>> {
    let body_signature = BodySignature::over(body, options.signer)?;
    let preamble = FirmwarePreamble::create(
        options.version as u64,
        options.kernel_subkey.clone(),
        body_signature,
        options.flags,
        options.signer,
    )?;

    let mut out = options.keyblock.to_bytes()?;
    out.extend_from_slice(&preamble.to_bytes()?);

    Ok(out)
}

pub struct PubkeySignOptions<'a> {
    /// With no signer the keyblock is emitted unsigned, carrying only its
    /// checksum.
    pub signer: Option<&'a Signer>,
    pub flags: u64,
}

/// Wrap a bare public data key into a keyblock.
pub fn sign_pubkey(data_key: &PublicKey, options: &PubkeySignOptions) -> Result<Vec<u8>> {
    let keyblock = Keyblock::create(data_key.clone(), options.flags, options.signer)?;

    Ok(keyblock.to_bytes()?)
}
