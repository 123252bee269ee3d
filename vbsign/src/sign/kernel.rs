// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;
use tracing::debug;

use crate::{
    crypto::{self, Signer},
    format::{
        kernel::{self, Arch, KernelBlob},
        keyblock::{self, Keyblock},
        preamble::{self, BodySignature, KernelPreamble},
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to unpack kernel partition")]
    UnpackPartition(#[source] kernel::Error),
    #[error("Kernel error")]
    Kernel(#[from] kernel::Error),
    #[error("Keyblock error")]
    Keyblock(#[from] keyblock::Error),
    #[error("Preamble error")]
    Preamble(#[from] preamble::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A freshly signed kernel: the vblock (keyblock plus preamble, padded to
/// the configured vblock size) and the blob it covers.
pub struct SignedKernel {
    pub vblock: Vec<u8>,
    pub blob: Vec<u8>,
}

impl SignedKernel {
    /// The full partition image: vblock followed by the kernel blob.
    pub fn into_partition(mut self) -> Vec<u8> {
        self.vblock.extend_from_slice(&self.blob);
        self.vblock
    }
}

pub struct KernelSignOptions<'a> {
    pub signer: &'a Signer,
    pub keyblock: &'a Keyblock,
    pub version: u32,
    pub flags: u32,
    pub load_address: u32,
    pub padding: u32,
}

/// Build and sign a new kernel partition from a raw kernel image.
pub fn sign_raw_kernel(
    vmlinuz: &[u8],
    arch: Arch,
    cmdline: &[u8],
    bootloader: &[u8],
    options: &KernelSignOptions,
) -> Result<SignedKernel> {
    let blob = KernelBlob::assemble(vmlinuz, arch, options.load_address, cmdline, bootloader)?;
    debug!("Kernel blob is {:#x} bytes", blob.data().len());

    let vblock = sign_blob(
        &blob,
        u64::from(options.version),
        options.flags,
        options.signer,
        options.keyblock,
        options.padding,
    )?;

    Ok(SignedKernel {
        vblock,
        blob: blob.into_data(),
    })
}

pub struct KernelResignOptions<'a> {
    pub signer: &'a Signer,
    /// Replacement keyblock; the existing one is reused when absent.
    pub keyblock: Option<&'a Keyblock>,
    /// New kernel version; the existing one is preserved when absent.
    pub version: Option<u32>,
    /// New preamble flags; the existing ones are preserved when absent.
    pub flags: Option<u32>,
    /// Replacement command line.
    pub cmdline: Option<Vec<u8>>,
    pub padding: u32,
}

/// Re-sign an existing kernel partition.
///
/// The body load address always comes from the existing preamble. The
/// original tooling ignored a changed load address here because the zero
/// page's command-line pointer would go stale, and that behavior is kept.
pub fn resign_kernel_partition(
    partition: &[u8],
    options: &KernelResignOptions,
) -> Result<SignedKernel> {
    let (old_keyblock, old_preamble, blob_data) =
        kernel::unpack_partition(partition, options.padding).map_err(Error::UnpackPartition)?;

    let mut blob = KernelBlob::from_parts(blob_data.to_vec(), &old_preamble);

    if let Some(cmdline) = &options.cmdline {
        blob.replace_cmdline(cmdline)?;
    }

    let version = options
        .version
        .map(u64::from)
        .unwrap_or(old_preamble.kernel_version);
    let flags = options.flags.or(old_preamble.flags).unwrap_or(0);
    let keyblock = options.keyblock.unwrap_or(&old_keyblock);

    let vblock = sign_blob(&blob, version, flags, options.signer, keyblock, options.padding)?;

    Ok(SignedKernel {
        vblock,
        blob: blob.into_data(),
    })
}

/// Sign a kernel blob and emit the vblock bytes, padded out to `padding`.
fn sign_blob(
    blob: &KernelBlob,
    version: u64,
    flags: u32,
    signer: &Signer,
    keyblock: &Keyblock,
    padding: u32,
) -> Result<Vec<u8>> {
    let body_signature = BodySignature::over(blob.data(), signer)?;

    let preamble = KernelPreamble::create(
        version,
        blob.body_load_address,
        blob.bootloader_address,
        blob.bootloader_size,
        body_signature,
        flags,
        signer,
        padding as u64,
        keyblock.size(),
    )?;

    let mut vblock = keyblock.to_bytes()?;
    vblock.extend_from_slice(&preamble.to_bytes()?);
    debug!("Kernel vblock is {:#x} bytes", vblock.len());

    Ok(vblock)
}
