// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, str::FromStr};

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::{
    format::{
        keyblock::{self, Keyblock},
        padding,
        preamble::{self, KernelPreamble},
    },
    util::NumBytes,
};

/// Default RAM address for the 32-bit kernel entry point.
pub const DEFAULT_BODY_LOAD_ADDRESS: u32 = 0x100000;
/// Default vblock padding for kernel partitions.
pub const DEFAULT_PADDING: u32 = 65536;

/// The command-line region inside the blob. The kernel reads it as a
/// NUL-terminated string, so the usable length is one byte less.
pub const CMDLINE_SIZE: usize = 4096;
/// The zero-page / boot params region inside the blob.
pub const PARAMS_SIZE: usize = 4096;
/// All blob components are aligned to this.
const BLOB_ALIGN: usize = 4096;

/// x86 boot protocol offsets within the vmlinuz setup header.
const SETUP_SECTS_OFFSET: usize = 0x1f1;
const BOOT_FLAG_OFFSET: usize = 0x1fe;
const HDRS_MAGIC_OFFSET: usize = 0x202;
const CMD_LINE_PTR_OFFSET: usize = 0x228;
const SETUP_HEADER_END: usize = 0x268;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown architecture: {0:?}")]
    UnknownArch(String),
    #[error("Kernel image is not a bzImage")]
    NotBzImage,
    #[error("Command line is too long ({0} > {1} bytes)")]
    CmdlineTooLong(usize, usize),
    #[error("Kernel partition is smaller than its vblock padding")]
    PartitionTooSmall,
    #[error("Kernel blob layout is inconsistent")]
    BadBlobLayout,
    #[error("Keyblock error")]
    Keyblock(#[from] keyblock::Error),
    #[error("Preamble error")]
    Preamble(#[from] preamble::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Arch {
    X86,
    Arm,
    Mips,
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        // Match the first 3 characters so that x86_64 works too.
        if s.len() >= 3 && s[..3].eq_ignore_ascii_case("x86") || s.eq_ignore_ascii_case("amd64") {
            Ok(Self::X86)
        } else if s.eq_ignore_ascii_case("arm") || s.eq_ignore_ascii_case("aarch64") {
            Ok(Self::Arm)
        } else if s.eq_ignore_ascii_case("mips") {
            Ok(Self::Mips)
        } else {
            Err(Error::UnknownArch(s.to_owned()))
        }
    }
}

/// The packed kernel body that the body signature covers: the kernel image,
/// the command line, the zero page, and the bootloader stub, each aligned to
/// 4 KiB.
#[derive(Clone, Eq, PartialEq)]
pub struct KernelBlob {
    data: Vec<u8>,
    pub body_load_address: u64,
    pub bootloader_address: u64,
    pub bootloader_size: u64,
}

impl fmt::Debug for KernelBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelBlob")
            .field("data", &NumBytes(self.data.len()))
            .field("body_load_address", &self.body_load_address)
            .field("bootloader_address", &self.bootloader_address)
            .field("bootloader_size", &self.bootloader_size)
            .finish()
    }
}

impl KernelBlob {
    /// Pack a raw kernel image, command line, and bootloader stub into the
    /// signable blob layout.
    pub fn assemble(
        vmlinuz: &[u8],
        arch: Arch,
        load_address: u32,
        cmdline: &[u8],
        bootloader: &[u8],
    ) -> Result<Self> {
        if cmdline.len() >= CMDLINE_SIZE {
            return Err(Error::CmdlineTooLong(cmdline.len(), CMDLINE_SIZE - 1));
        }

        // On x86 the 16-bit setup code is stripped; the boot ROM jumps to
        // the 32-bit entry point directly. Other architectures load the
        // image as-is.
        let body = match arch {
            Arch::X86 => {
                if vmlinuz.len() < SETUP_HEADER_END
                    || LittleEndian::read_u16(&vmlinuz[BOOT_FLAG_OFFSET..]) != 0xAA55
                    || &vmlinuz[HDRS_MAGIC_OFFSET..HDRS_MAGIC_OFFSET + 4] != b"HdrS"
                {
                    return Err(Error::NotBzImage);
                }

                let mut setup_sects = vmlinuz[SETUP_SECTS_OFFSET] as usize;
                if setup_sects == 0 {
                    setup_sects = 4;
                }

                let setup_size = (setup_sects + 1) * 512;
                vmlinuz.get(setup_size..).ok_or(Error::NotBzImage)?
            }
            Arch::Arm | Arch::Mips => vmlinuz,
        };

        let body_size = padding::round(body.len(), BLOB_ALIGN).unwrap();
        let cmdline_offset = body_size;
        let params_offset = cmdline_offset + CMDLINE_SIZE;
        let bootloader_offset = params_offset + PARAMS_SIZE;
        let bootloader_size = padding::round(bootloader.len(), BLOB_ALIGN).unwrap();

        let mut data = vec![0u8; bootloader_offset + bootloader_size];
        data[..body.len()].copy_from_slice(body);
        data[cmdline_offset..cmdline_offset + cmdline.len()].copy_from_slice(cmdline);
        data[bootloader_offset..bootloader_offset + bootloader.len()].copy_from_slice(bootloader);

        if arch == Arch::X86 {
            // The zero page carries a copy of the setup header so the kernel
            // can find its command line after the 16-bit code is gone.
            let params = &mut data[params_offset..params_offset + PARAMS_SIZE];
            params[SETUP_SECTS_OFFSET..SETUP_HEADER_END]
                .copy_from_slice(&vmlinuz[SETUP_SECTS_OFFSET..SETUP_HEADER_END]);
            LittleEndian::write_u16(&mut params[BOOT_FLAG_OFFSET..], 0);
            LittleEndian::write_u32(
                &mut params[CMD_LINE_PTR_OFFSET..],
                load_address + cmdline_offset as u32,
            );
        }

        Ok(Self {
            data,
            body_load_address: load_address as u64,
            bootloader_address: load_address as u64 + bootloader_offset as u64,
            bootloader_size: bootloader_size as u64,
        })
    }

    /// Reconstruct the blob from an unpacked kernel partition, taking the
    /// addresses from its preamble.
    pub fn from_parts(data: Vec<u8>, preamble: &KernelPreamble) -> Self {
        Self {
            data,
            body_load_address: preamble.body_load_address,
            bootloader_address: preamble.bootloader_address,
            bootloader_size: preamble.bootloader_size,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// Offset of the command-line region, derived from the addresses the
    /// preamble carries.
    fn cmdline_offset(&self) -> Result<usize> {
        let bootloader_offset = self
            .bootloader_address
            .checked_sub(self.body_load_address)
            .ok_or(Error::BadBlobLayout)? as usize;

        bootloader_offset
            .checked_sub(PARAMS_SIZE + CMDLINE_SIZE)
            .filter(|o| o + CMDLINE_SIZE <= self.data.len())
            .ok_or(Error::BadBlobLayout)
    }

    /// Replace the command line in place.
    pub fn replace_cmdline(&mut self, cmdline: &[u8]) -> Result<()> {
        if cmdline.len() >= CMDLINE_SIZE {
            return Err(Error::CmdlineTooLong(cmdline.len(), CMDLINE_SIZE - 1));
        }

        let offset = self.cmdline_offset()?;
        let slot = &mut self.data[offset..offset + CMDLINE_SIZE];
        slot.fill(0);
        slot[..cmdline.len()].copy_from_slice(cmdline);

        Ok(())
    }

    /// Read the current command line.
    pub fn cmdline(&self) -> Result<Vec<u8>> {
        let offset = self.cmdline_offset()?;
        let slot = &self.data[offset..offset + CMDLINE_SIZE];
        let end = slot.iter().position(|b| *b == 0).unwrap_or(slot.len());

        Ok(slot[..end].to_vec())
    }
}

/// Split an existing kernel partition into its keyblock, preamble, and blob.
/// The blob length is whatever the existing body signature covers.
pub fn unpack_partition(buf: &[u8], padding: u32) -> Result<(Keyblock, KernelPreamble, &[u8])> {
    let keyblock = Keyblock::parse(buf)?;

    let preamble_buf = buf
        .get(keyblock.size() as usize..)
        .ok_or(Error::PartitionTooSmall)?;
    let preamble = KernelPreamble::parse(preamble_buf)?;

    let blob_start = padding as usize;
    if keyblock.size() + preamble.size() > padding as u64 {
        return Err(Error::PartitionTooSmall);
    }

    let blob = buf
        .get(blob_start..blob_start + preamble.body_signature.data_size as usize)
        .ok_or(Error::PartitionTooSmall)?;

    Ok((keyblock, preamble, blob))
}
