// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, io, path::PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    crypto::{self, PublicKey, Signer},
    format::{
        fmap::{self, AreaRange, Fmap},
        gbb::{self, Gbb},
        keyblock::{self, Keyblock},
        preamble::{self, BodySignature, FirmwarePreamble},
    },
    sign::{check_rollback, PlatformVersions},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("LayoutIncomplete: {0} area is missing from the image")]
    LayoutIncomplete(&'static str),
    #[error("DevKeysRequired: FW A and B differ, so developer keys are required")]
    DevKeysRequired,
    #[error("RegionOverrun: {0} says the firmware is larger than {1}")]
    BodyTooLarge(&'static str, &'static str),
    #[error("RegionOverrun: new keyblock and preamble do not fit in {0}")]
    VblockTooSmall(&'static str),
    #[error("IoError: failed to write LOEM vblock {0:?}")]
    WriteLoem(PathBuf, #[source] io::Error),
    #[error("FMAP error")]
    Fmap(#[from] fmap::Error),
    #[error("GBB error")]
    Gbb(#[from] gbb::Error),
    #[error("Keyblock error")]
    Keyblock(#[from] keyblock::Error),
    #[error("Preamble error")]
    Preamble(#[from] preamble::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Emit per-OEM copies of the freshly written vblocks as sidecar files.
pub struct LoemOptions {
    pub dir: PathBuf,
    pub id: String,
}

/// Requested edits to the board metadata region.
#[derive(Default)]
pub struct GbbEdits {
    pub hwid: Option<String>,
    pub rootkey: Option<PublicKey>,
    pub recovery_key: Option<PublicKey>,
    pub flags: Option<u32>,
}

impl GbbEdits {
    pub fn is_empty(&self) -> bool {
        self.hwid.is_none()
            && self.rootkey.is_none()
            && self.recovery_key.is_none()
            && self.flags.is_none()
    }
}

pub struct BiosSignOptions<'a> {
    pub signer: &'a Signer,
    pub keyblock: &'a Keyblock,
    pub kernel_subkey: &'a PublicKey,
    /// Developer-slot identity, required only when the A and B bodies
    /// differ.
    pub dev_signer: Option<&'a Signer>,
    pub dev_keyblock: Option<&'a Keyblock>,
    pub version: u32,
    /// `None` preserves the flags of the existing slot A preamble.
    pub flags: Option<u32>,
    pub loem: Option<LoemOptions>,
    pub gbb: GbbEdits,
    /// Anti-rollback versions reported by the platform, when known.
    pub platform: Option<PlatformVersions>,
}

const FW_MAIN_A_NAMES: [&str; 2] = ["FW_MAIN_A", "Firmware A Data"];
const FW_MAIN_B_NAMES: [&str; 2] = ["FW_MAIN_B", "Firmware B Data"];
const VBLOCK_A_NAMES: [&str; 2] = ["VBLOCK_A", "Firmware A Key"];
const VBLOCK_B_NAMES: [&str; 2] = ["VBLOCK_B", "Firmware B Key"];
const GBB_NAMES: [&str; 2] = ["GBB", "GBB Area"];

/// Re-sign a complete firmware image in place.
///
/// Both vblocks are rebuilt from fresh body signatures over the FW_MAIN
/// regions. When the two bodies differ, slot A gets the developer identity;
/// slot B is always signed with the normal keys. Slot A is fully written
/// before slot B is touched.
pub fn sign_bios(image: &mut [u8], options: &BiosSignOptions) -> Result<()> {
    let fmap = Fmap::find(image)?;
    let image_len = image.len();

    let locate = |names: &[&str], what: &'static str| -> Result<AreaRange> {
        fmap.area(names)
            .and_then(|area| area.clamp(image_len))
            .ok_or(Error::LayoutIncomplete(what))
    };

    let mut fw_a = locate(&FW_MAIN_A_NAMES, "FW_MAIN_A")?;
    let mut fw_b = locate(&FW_MAIN_B_NAMES, "FW_MAIN_B")?;
    let vblock_a = locate(&VBLOCK_A_NAMES, "VBLOCK_A")?;
    let vblock_b = locate(&VBLOCK_B_NAMES, "VBLOCK_B")?;

    // Shrink each body to whatever its existing preamble covered, and pick
    // up the old slot A flags when the caller did not choose any.
    let preserved_flags = examine_vblock(image, vblock_a, &mut fw_a, "VBLOCK_A", "FW_MAIN_A")?;
    examine_vblock(image, vblock_b, &mut fw_b, "VBLOCK_B", "FW_MAIN_B")?;

    let flags = options.flags.or(preserved_flags).unwrap_or(0);

    if let Some(platform) = &options.platform {
        check_rollback(platform, options.keyblock.data_key.key_version as u32);
    }

    let differ = image[fw_a.as_range()] != image[fw_b.as_range()];

    let (signer_a, keyblock_a) = if differ {
        match (options.dev_signer, options.dev_keyblock) {
            (Some(signer), Some(keyblock)) => (signer, keyblock),
            _ => return Err(Error::DevKeysRequired),
        }
    } else {
        (options.signer, options.keyblock)
    };

    write_slot(image, vblock_a, fw_a, "VBLOCK_A", signer_a, keyblock_a, options, flags)?;

    // FW B always gets the normal keys.
    write_slot(
        image,
        vblock_b,
        fw_b,
        "VBLOCK_B",
        options.signer,
        options.keyblock,
        options,
        flags,
    )?;

    apply_gbb_edits(image, &fmap, &options.gbb)?;

    if let Some(loem) = &options.loem {
        write_loem(image, loem, "A", vblock_a)?;
        write_loem(image, loem, "B", vblock_b)?;
    }

    Ok(())
}

/// Check whether an existing keyblock and preamble live in the vblock area.
/// If so, the firmware body length shrinks to what the old body signature
/// covered and the old preamble flags are reported back; otherwise the whole
/// region gets signed.
fn examine_vblock(
    image: &[u8],
    vblock: AreaRange,
    fw: &mut AreaRange,
    vblock_name: &'static str,
    fw_name: &'static str,
) -> Result<Option<u32>> {
    let buf = &image[vblock.as_range()];

    let parsed = Keyblock::parse(buf)
        .ok()
        .filter(|keyblock| keyblock.verify(None).is_ok())
        .and_then(|keyblock| FirmwarePreamble::parse(&buf[keyblock.size() as usize..]).ok());

    let Some(old_preamble) = parsed else {
        warn!("{vblock_name} keyblock is invalid. Signing the entire FW FMAP region");
        return Ok(None);
    };

    let body_size = old_preamble.body_signature.data_size;
    if body_size > fw.len as u64 {
        return Err(Error::BodyTooLarge(vblock_name, fw_name));
    }

    debug!("{fw_name} body covers {body_size:#x} of {:#x} bytes", fw.len);
    fw.len = body_size as usize;

    Ok(old_preamble.flags)
}

#[allow(clippy::too_many_arguments)]
fn write_slot(
    image: &mut [u8],
    vblock: AreaRange,
    fw: AreaRange,
    vblock_name: &'static str,
    signer: &Signer,
    keyblock: &Keyblock,
    options: &BiosSignOptions,
    flags: u32,
) -> Result<()> {
    let body_signature = BodySignature::over(&image[fw.as_range()], signer)?;
    let preamble = FirmwarePreamble::create(
        options.version as u64,
        options.kernel_subkey.clone(),
        body_signature,
        flags,
        signer,
    )?;

    let mut vblock_bytes = keyblock.to_bytes()?;
    vblock_bytes.extend_from_slice(&preamble.to_bytes()?);

    if vblock_bytes.len() > vblock.len {
        return Err(Error::VblockTooSmall(vblock_name));
    }

    // Bytes past the new keyblock and preamble are left as they were.
    image[vblock.offset..vblock.offset + vblock_bytes.len()].copy_from_slice(&vblock_bytes);

    Ok(())
}

fn apply_gbb_edits(image: &mut [u8], fmap: &Fmap, edits: &GbbEdits) -> Result<()> {
    if edits.is_empty() {
        return Ok(());
    }

    let range = fmap
        .area(&GBB_NAMES)
        .and_then(|area| area.clamp(image.len()))
        .ok_or(Error::LayoutIncomplete("GBB"))?;
    let region = &mut image[range.as_range()];

    let gbb = Gbb::parse(region)?;

    if let Some(hwid) = &edits.hwid {
        gbb.set_hwid(region, hwid)?;
    }
    if let Some(key) = &edits.rootkey {
        gbb.set_rootkey(region, key)?;
    }
    if let Some(key) = &edits.recovery_key {
        gbb.set_recovery_key(region, key)?;
    }
    if let Some(flags) = edits.flags {
        // Old GBBs have no flags word; that only costs a warning.
        match gbb.set_flags(region, flags) {
            Err(gbb::Error::UnsupportedField(major, minor)) => {
                warn!("UnsupportedField: GBB {major}.{minor} has no flags; not setting {flags:#x}");
            }
            other => other?,
        }
    }

    Ok(())
}

fn write_loem(image: &[u8], loem: &LoemOptions, slot: &str, vblock: AreaRange) -> Result<()> {
    let path = loem.dir.join(format!("vblock_{}.{}", slot, loem.id));

    fs::write(&path, &image[vblock.as_range()]).map_err(|e| Error::WriteLoem(path, e))
}
