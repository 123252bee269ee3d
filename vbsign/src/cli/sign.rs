/*
 * SPDX-FileCopyrightText: 2024 vbsign contributors
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::{
    cli::{status, warning},
    crypto::{Algorithm, ExternalSigner, PrivateKey, PublicKey, Signer, NUM_ALGORITHMS},
    format::{
        fmap::Fmap,
        kernel::{Arch, DEFAULT_BODY_LOAD_ADDRESS, DEFAULT_PADDING},
        keyblock::Keyblock,
        preamble::KernelPreamble,
    },
    image::ImageFile,
    sign::{
        bios::{self, BiosSignOptions, GbbEdits, LoemOptions},
        firmware::{self, FirmwareSignOptions, PubkeySignOptions},
        kernel::{self, KernelResignOptions, KernelSignOptions},
        PlatformVersions,
    },
};

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum FileType {
    /// A bare public key, to be wrapped into a keyblock.
    Pubkey,
    /// A keyblock file. Recognized, but not something that can be signed.
    Keyblock,
    /// A raw firmware body (the contents of FW_MAIN_A/B).
    RawFirmware,
    /// A complete firmware image with an embedded FMAP.
    Bios,
    /// A raw Linux kernel image (vmlinuz).
    RawKernel,
    /// An existing signed kernel partition.
    KernelPartition,
}

/// Parse an integer that may carry a 0x prefix.
fn parse_int(value: &str) -> Result<u32, String> {
    let (digits, radix) = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => (hex, 16),
        None => (value, 10),
    };

    u32::from_str_radix(digits, radix).map_err(|e| e.to_string())
}

/// Sign or re-sign firmware images, kernel partitions, and keys.
///
/// The input type is sniffed from the file contents where possible and
/// otherwise inferred from the supplied options; --type overrides both.
#[derive(Debug, Parser)]
pub struct SignCli {
    /// Private firmware or kernel data key.
    #[arg(short = 's', long, value_name = "FILE")]
    signprivate: Option<PathBuf>,

    /// Keyblock wrapping the matching public data key.
    #[arg(short = 'b', long, value_name = "FILE")]
    keyblock: Option<PathBuf>,

    /// Public kernel subkey.
    #[arg(short = 'k', long, value_name = "FILE")]
    kernelkey: Option<PathBuf>,

    /// Developer-slot private data key (required when FW A and B differ).
    #[arg(short = 'S', long, value_name = "FILE")]
    devsign: Option<PathBuf>,

    /// Keyblock wrapping the developer public data key.
    #[arg(short = 'B', long, value_name = "FILE")]
    devkeyblock: Option<PathBuf>,

    /// Firmware or kernel version number.
    #[arg(short = 'v', long, value_name = "NUM", value_parser = parse_int)]
    version: Option<u32>,

    /// Preamble flags (default: preserve the existing value, or 0).
    #[arg(short = 'f', long, value_name = "NUM", value_parser = parse_int)]
    flags: Option<u32>,

    /// Directory to receive per-OEM vblock files.
    #[arg(short = 'd', long, value_name = "DIR")]
    loemdir: Option<PathBuf>,

    /// Per-OEM vblock filename suffix.
    #[arg(short = 'l', long, value_name = "STRING")]
    loemid: Option<String>,

    /// Raw firmware blob to sign (forces the raw firmware type).
    #[arg(long, value_name = "FILE")]
    fv: Option<PathBuf>,

    /// Input file.
    #[arg(long, value_name = "FILE")]
    infile: Option<PathBuf>,

    /// Alias of --infile.
    #[arg(long, value_name = "FILE")]
    datapubkey: Option<PathBuf>,

    /// Alias of --infile.
    #[arg(long, value_name = "FILE")]
    vmlinuz: Option<PathBuf>,

    /// Output file (default: sign in place).
    #[arg(long, value_name = "FILE")]
    outfile: Option<PathBuf>,

    /// Bootloader stub for new kernel partitions.
    #[arg(long, value_name = "FILE")]
    bootloader: Option<PathBuf>,

    /// Kernel command-line file.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// CPU architecture (x86/amd64, arm/aarch64, mips).
    #[arg(long, value_name = "ARCH")]
    arch: Option<String>,

    /// RAM address to load the kernel body at.
    #[arg(long, value_name = "ADDR", value_parser = parse_int)]
    kloadaddr: Option<u32>,

    /// Kernel vblock padding in bytes.
    #[arg(long, value_name = "NUM", value_parser = parse_int)]
    pad: Option<u32>,

    /// PEM signing key, as an alternative to --signprivate.
    #[arg(long = "pem_signpriv", value_name = "FILE")]
    pem_signpriv: Option<PathBuf>,

    /// Signature algorithm ID to use with --pem_signpriv.
    #[arg(long = "pem_algo", value_name = "NUM")]
    pem_algo: Option<u64>,

    /// External program that computes signatures over stdin.
    #[arg(long = "pem_external", value_name = "PROGRAM")]
    pem_external: Option<PathBuf>,

    /// Emit only the vblock (requires a distinct --outfile).
    #[arg(long)]
    vblockonly: bool,

    /// Force the input file type instead of sniffing it.
    #[arg(long, value_name = "TYPE")]
    r#type: Option<FileType>,

    /// New hardware ID to store in the GBB.
    #[arg(long, value_name = "STRING")]
    hwid: Option<String>,

    /// New root public key to store in the GBB.
    #[arg(long, value_name = "FILE")]
    rootkey: Option<PathBuf>,

    /// New recovery public key to store in the GBB.
    #[arg(long, value_name = "FILE")]
    recoverykey: Option<PathBuf>,

    /// New GBB flags word.
    #[arg(long = "gbb-flags", value_name = "NUM", value_parser = parse_int)]
    gbb_flags: Option<u32>,

    /// Data-key version the platform reported from its anti-rollback
    /// storage; signing a lower version only warns.
    #[arg(long = "tpm_keyver", value_name = "NUM", value_parser = parse_int)]
    tpm_keyver: Option<u32>,

    /// Firmware version the platform reported from its anti-rollback
    /// storage.
    #[arg(long = "tpm_fwver", value_name = "NUM", value_parser = parse_int)]
    tpm_fwver: Option<u32>,

    /// Input file.
    #[arg(value_name = "INFILE")]
    infile_arg: Option<PathBuf>,

    /// Output file.
    #[arg(value_name = "OUTFILE")]
    outfile_arg: Option<PathBuf>,
}

/// Read a kernel command-line file the way the kernel expects it: newlines
/// become spaces and trailing whitespace is dropped.
fn read_config(path: &Path) -> io::Result<Vec<u8>> {
    let mut data = fs::read(path)?;

    for b in &mut data {
        if *b == b'\n' || *b == b'\r' {
            *b = b' ';
        }
    }
    while data.last() == Some(&b' ') {
        data.pop();
    }

    Ok(data)
}

/// Figure out what the input is from its contents alone.
fn sniff_type(data: &[u8]) -> Option<FileType> {
    if Fmap::find(data).is_ok() {
        return Some(FileType::Bios);
    }

    if let Ok(keyblock) = Keyblock::parse(data) {
        if KernelPreamble::parse(&data[keyblock.size() as usize..]).is_ok() {
            return Some(FileType::KernelPartition);
        }
        return Some(FileType::Keyblock);
    }

    if PublicKey::parse(data).is_ok() {
        return Some(FileType::Pubkey);
    }

    None
}

/// Everything loaded and validated from the raw CLI options. Parse errors
/// are accumulated so the operator sees all of them at once; signing itself
/// fails fast later.
struct SignRequest {
    signer: Option<Signer>,
    keyblock: Option<Keyblock>,
    kernel_subkey: Option<PublicKey>,
    dev_signer: Option<Signer>,
    dev_keyblock: Option<Keyblock>,
    bootloader: Option<Vec<u8>>,
    config: Option<Vec<u8>>,
    arch: Option<Arch>,
    gbb: GbbEdits,
    infile: PathBuf,
    outfile: Option<PathBuf>,
    file_type: FileType,
    file_data: Vec<u8>,
}

/// Load something optional, pushing a readable message on failure so that
/// every bad option gets reported in one pass.
fn try_load<T, E: std::fmt::Display>(
    path: Option<&PathBuf>,
    what: &str,
    load: impl FnOnce(&Path) -> Result<T, E>,
    errors: &mut Vec<String>,
) -> Option<T> {
    let path = path?;
    match load(path) {
        Ok(value) => Some(value),
        Err(e) => {
            errors.push(format!("Error reading {what} {path:?}: {e}"));
            None
        }
    }
}

fn build_request(cli: &SignCli, errors: &mut Vec<String>) -> Option<SignRequest> {
    // Signing identity: either a native private key or a PEM key, the
    // latter optionally routed through an external signer program.
    if cli.signprivate.is_some() && cli.pem_signpriv.is_some() {
        errors.push("Only one of --signprivate and --pem_signpriv can be specified".into());
    }
    if (cli.signprivate.is_some() && cli.pem_algo.is_some())
        || (cli.pem_signpriv.is_some() && cli.pem_algo.is_none())
    {
        errors.push("--pem_algo must be used with --pem_signpriv".into());
    }
    if cli.pem_external.is_some() && cli.pem_signpriv.is_none() {
        errors.push("--pem_external must be used with --pem_signpriv".into());
    }

    let pem_algo = match cli.pem_algo {
        Some(raw) if raw >= NUM_ALGORITHMS => {
            errors.push(format!("Invalid --pem_algo {raw}"));
            None
        }
        other => other,
    };

    let signer = if let (Some(pem), Some(raw)) = (&cli.pem_signpriv, pem_algo) {
        let algorithm = Algorithm::from_raw(raw).expect("validated above");

        if let Some(program) = &cli.pem_external {
            Some(Signer::External(ExternalSigner {
                program: program.clone(),
                pem_path: pem.clone(),
                algorithm,
            }))
        } else {
            try_load(
                Some(pem),
                "PEM signing key",
                |p| PrivateKey::read_pem(p, algorithm),
                errors,
            )
            .map(Signer::Private)
        }
    } else {
        try_load(
            cli.signprivate.as_ref(),
            "signing key",
            PrivateKey::read,
            errors,
        )
        .map(Signer::Private)
    };

    let keyblock = try_load(cli.keyblock.as_ref(), "keyblock", Keyblock::read, errors);
    let dev_keyblock = try_load(
        cli.devkeyblock.as_ref(),
        "dev keyblock",
        Keyblock::read,
        errors,
    );
    let kernel_subkey = try_load(cli.kernelkey.as_ref(), "kernel key", PublicKey::read, errors);
    let gbb_rootkey = try_load(cli.rootkey.as_ref(), "root key", PublicKey::read, errors);
    let gbb_recovery_key = try_load(
        cli.recoverykey.as_ref(),
        "recovery key",
        PublicKey::read,
        errors,
    );
    let dev_signer = try_load(cli.devsign.as_ref(), "dev signing key", PrivateKey::read, errors)
        .map(Signer::Private);
    let bootloader = try_load(cli.bootloader.as_ref(), "bootloader file", |p| fs::read(p), errors);
    let config = try_load(cli.config.as_ref(), "config file", read_config, errors);

    let arch = cli.arch.as_ref().and_then(|s| match s.parse::<Arch>() {
        Ok(arch) => Some(arch),
        Err(_) => {
            errors.push(format!("Unknown architecture: {s:?}"));
            None
        }
    });

    // Resolve the input and output paths from the named options and the
    // positional leftovers.
    let named_infile = [&cli.fv, &cli.infile, &cli.datapubkey, &cli.vmlinuz]
        .into_iter()
        .flatten()
        .next();

    let mut positionals = [&cli.infile_arg, &cli.outfile_arg].into_iter().flatten();

    let infile = match named_infile.or_else(|| positionals.next()) {
        Some(path) => path.clone(),
        None => {
            errors.push("Missing input filename".into());
            return None;
        }
    };

    let mut outfile = cli.outfile.clone();
    if outfile.is_none() {
        outfile = positionals.next().cloned();
    }
    if positionals.next().is_some() {
        errors.push("Too many arguments left over".into());
    }

    let file_data = match fs::read(&infile) {
        Ok(data) => data,
        Err(e) => {
            errors.push(format!("Can't read {infile:?}: {e}"));
            return None;
        }
    };

    // What are we looking at? Forced type first, then content sniffing,
    // then inference from which options were supplied.
    let file_type = cli
        .r#type
        .or_else(|| {
            if cli.fv.is_some() {
                Some(FileType::RawFirmware)
            } else {
                None
            }
        })
        .or_else(|| sniff_type(&file_data))
        .or_else(|| {
            if bootloader.is_some() || config.is_some() || arch.is_some() {
                Some(FileType::RawKernel)
            } else if kernel_subkey.is_some() {
                Some(FileType::RawFirmware)
            } else {
                None
            }
        });

    let Some(file_type) = file_type else {
        errors.push(format!("Unable to determine the type of {infile:?}"));
        return None;
    };

    Some(SignRequest {
        signer,
        keyblock,
        kernel_subkey,
        dev_signer,
        dev_keyblock,
        bootloader,
        config,
        arch,
        gbb: GbbEdits {
            hwid: cli.hwid.clone(),
            rootkey: gbb_rootkey,
            recovery_key: gbb_recovery_key,
            flags: cli.gbb_flags,
        },
        infile,
        outfile,
        file_type,
        file_data,
    })
}

/// Check the per-type required options, counting every missing one.
fn validate_request(cli: &SignCli, request: &SignRequest, errors: &mut Vec<String>) {
    let mut require = |present: bool, name: &str| {
        if !present {
            errors.push(format!("Missing --{name} option"));
        }
    };

    match request.file_type {
        FileType::Pubkey => {
            require(request.outfile.is_some(), "outfile");
        }
        FileType::Bios => {
            require(request.signer.is_some(), "signprivate");
            require(request.keyblock.is_some(), "keyblock");
            require(request.kernel_subkey.is_some(), "kernelkey");
        }
        FileType::RawFirmware => {
            require(request.signer.is_some(), "signprivate");
            require(request.keyblock.is_some(), "keyblock");
            require(request.kernel_subkey.is_some(), "kernelkey");
            require(cli.version.is_some(), "version");
            require(request.outfile.is_some(), "outfile");
        }
        FileType::RawKernel => {
            require(request.signer.is_some(), "signprivate");
            require(request.keyblock.is_some(), "keyblock");
            require(cli.version.is_some(), "version");
            require(request.bootloader.is_some(), "bootloader");
            require(request.config.is_some(), "config");
            require(request.arch.is_some(), "arch");
            require(request.outfile.is_some(), "outfile");
        }
        FileType::KernelPartition => {
            require(request.signer.is_some(), "signprivate");

            if cli.vblockonly {
                match &request.outfile {
                    None => errors.push("--vblockonly requires a distinct --outfile".into()),
                    Some(out) if *out == request.infile => {
                        errors.push("--vblockonly requires a distinct --outfile".into());
                    }
                    Some(_) => {}
                }
            }
        }
        FileType::Keyblock => {
            errors.push("Unable to sign a keyblock file".into());
        }
    }
}

pub fn sign_main(cli: &SignCli) -> Result<()> {
    let mut errors = vec![];

    let request = build_request(cli, &mut errors);
    if let Some(request) = &request {
        validate_request(cli, request, &mut errors);
    }

    if !errors.is_empty() {
        for message in &errors {
            eprintln!("ERROR: {message}");
        }
        bail!("BadArgs: {} problem(s) with the arguments", errors.len());
    }

    let request = request.expect("errors would have been reported");
    let version = cli.version.unwrap_or(1);
    let padding = cli.pad.unwrap_or(DEFAULT_PADDING);

    match request.file_type {
        FileType::Pubkey => {
            let data_key =
                PublicKey::parse(&request.file_data).context("Failed to parse public key")?;
            let options = PubkeySignOptions {
                signer: request.signer.as_ref(),
                flags: u64::from(cli.flags.unwrap_or(0)),
            };

            let keyblock = firmware::sign_pubkey(&data_key, &options)
                .context("Failed to create keyblock")?;

            let outfile = request.outfile.as_ref().expect("validated");
            fs::write(outfile, keyblock)
                .with_context(|| format!("Can't write {outfile:?}"))?;
        }
        FileType::RawFirmware => {
            let options = FirmwareSignOptions {
                signer: request.signer.as_ref().expect("validated"),
                keyblock: request.keyblock.as_ref().expect("validated"),
                kernel_subkey: request.kernel_subkey.as_ref().expect("validated"),
                version,
                flags: cli.flags.unwrap_or(0),
            };

            let vblock = firmware::sign_raw_firmware(&request.file_data, &options)
                .context("Failed to sign firmware body")?;

            let outfile = request.outfile.as_ref().expect("validated");
            fs::write(outfile, vblock)
                .with_context(|| format!("Can't write {outfile:?}"))?;
        }
        FileType::Bios => {
            status!("Signing BIOS image {:?}", request.infile);

            let mut image = match &request.outfile {
                Some(outfile) => ImageFile::open_copy(&request.infile, outfile)?,
                None => ImageFile::open_rw(&request.infile)?,
            };

            let options = BiosSignOptions {
                signer: request.signer.as_ref().expect("validated"),
                keyblock: request.keyblock.as_ref().expect("validated"),
                kernel_subkey: request.kernel_subkey.as_ref().expect("validated"),
                dev_signer: request.dev_signer.as_ref(),
                dev_keyblock: request.dev_keyblock.as_ref(),
                version,
                flags: cli.flags,
                loem: cli.loemid.as_ref().map(|id| LoemOptions {
                    dir: cli.loemdir.clone().unwrap_or_else(|| PathBuf::from(".")),
                    id: id.clone(),
                }),
                gbb: request.gbb,
                platform: match (cli.tpm_keyver, cli.tpm_fwver) {
                    (None, None) => None,
                    (keyver, fwver) => Some(PlatformVersions {
                        data_key_version: keyver.unwrap_or(0),
                        firmware_version: fwver.unwrap_or(0),
                    }),
                },
            };

            bios::sign_bios(image.data_mut(), &options)?;
            image.commit()?;
        }
        FileType::RawKernel => {
            let options = KernelSignOptions {
                signer: request.signer.as_ref().expect("validated"),
                keyblock: request.keyblock.as_ref().expect("validated"),
                version,
                flags: cli.flags.unwrap_or(0),
                load_address: cli.kloadaddr.unwrap_or(DEFAULT_BODY_LOAD_ADDRESS),
                padding,
            };

            let signed = kernel::sign_raw_kernel(
                &request.file_data,
                request.arch.expect("validated"),
                request.config.as_deref().expect("validated"),
                request.bootloader.as_deref().expect("validated"),
                &options,
            )
            .context("Failed to sign kernel image")?;

            let outfile = request.outfile.as_ref().expect("validated");
            let out_data = if cli.vblockonly {
                signed.vblock
            } else {
                signed.into_partition()
            };
            fs::write(outfile, out_data)
                .with_context(|| format!("Can't write {outfile:?}"))?;
        }
        FileType::KernelPartition => {
            if cli.kloadaddr.is_some() {
                warning!("--kloadaddr is ignored when re-signing an existing partition");
            }

            let options = KernelResignOptions {
                signer: request.signer.as_ref().expect("validated"),
                keyblock: request.keyblock.as_ref(),
                version: cli.version,
                flags: cli.flags,
                cmdline: request.config.clone(),
                padding,
            };

            let signed = kernel::resign_kernel_partition(&request.file_data, &options)
                .context("Failed to re-sign kernel partition")?;

            if let Some(outfile) = &request.outfile {
                let out_data = if cli.vblockonly {
                    signed.vblock
                } else {
                    signed.into_partition()
                };
                fs::write(outfile, out_data)
                    .with_context(|| format!("Can't write {outfile:?}"))?;
            } else {
                // The blob may have a replaced command line, so both halves
                // go back into the mapped partition.
                let mut image = ImageFile::open_rw(&request.infile)?;
                let start = padding as usize;
                image.data_mut()[..signed.vblock.len()].copy_from_slice(&signed.vblock);
                image.data_mut()[start..start + signed.blob.len()].copy_from_slice(&signed.blob);
                image.commit()?;
            }
        }
        FileType::Keyblock => unreachable!("rejected during validation"),
    }

    Ok(())
}
