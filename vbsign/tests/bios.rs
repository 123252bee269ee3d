// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use assert_matches::assert_matches;

use vbsign::{
    format::{
        gbb::Gbb,
        keyblock::Keyblock,
        preamble::{BodySignature, FirmwarePreamble},
    },
    sign::{
        bios::{self, BiosSignOptions, Error, GbbEdits, LoemOptions},
        PlatformVersions,
    },
};

use common::*;

fn default_options<'a>(keys: &'a TestKeys) -> BiosSignOptions<'a> {
    BiosSignOptions {
        signer: &keys.signer,
        keyblock: &keys.keyblock,
        kernel_subkey: &keys.kernel_subkey,
        dev_signer: None,
        dev_keyblock: None,
        version: 1,
        flags: None,
        loem: None,
        gbb: GbbEdits::default(),
        platform: None,
    }
}

/// Parse a slot's vblock and check every signature in it, returning the
/// preamble for further assertions.
fn verify_slot(
    image: &[u8],
    keys: &TestKeys,
    vblock_offset: usize,
    fw_offset: usize,
) -> FirmwarePreamble {
    let vblock = &image[vblock_offset..vblock_offset + VBLOCK_LEN];

    let keyblock = Keyblock::parse(vblock).unwrap();
    keyblock.verify(Some(&keys.root_public)).unwrap();

    let preamble = FirmwarePreamble::parse(&vblock[keyblock.size() as usize..]).unwrap();
    preamble.verify(&keyblock.data_key).unwrap();

    let body_size = preamble.body_signature.data_size as usize;
    keyblock
        .data_key
        .verify(
            &image[fw_offset..fw_offset + body_size],
            &preamble.body_signature.signature,
        )
        .unwrap();

    preamble
}

#[test]
fn sign_identical_slots() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);
    let original = image.clone();

    let options = BiosSignOptions {
        flags: Some(1),
        ..default_options(&keys)
    };
    bios::sign_bios(&mut image, &options).unwrap();

    for (vblock_offset, fw_offset) in [
        (VBLOCK_A_OFFSET, FW_A_OFFSET),
        (VBLOCK_B_OFFSET, FW_B_OFFSET),
    ] {
        let preamble = verify_slot(&image, &keys, vblock_offset, fw_offset);
        assert_eq!(preamble.firmware_version, 1);
        assert_eq!(preamble.flags, Some(1));
        assert_eq!(preamble.body_signature.data_size, FW_LEN as u64);
        assert_eq!(preamble.kernel_subkey, keys.kernel_subkey);
    }

    // Nothing outside the two vblocks may change.
    for (i, (old, new)) in original.iter().zip(&image).enumerate() {
        let in_vblocks = (VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + VBLOCK_LEN).contains(&i)
            || (VBLOCK_B_OFFSET..VBLOCK_B_OFFSET + VBLOCK_LEN).contains(&i);
        if !in_vblocks {
            assert_eq!(old, new, "byte {i:#x} changed outside the vblocks");
        }
    }
}

#[test]
fn divergent_slots_require_dev_keys() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);
    image[FW_A_OFFSET + FW_LEN - 1] ^= 0xFF;
    let original = image.clone();

    let err = bios::sign_bios(&mut image, &default_options(&keys)).unwrap_err();
    assert_matches!(err, Error::DevKeysRequired);
    assert!(err.to_string().contains("DevKeysRequired"));

    // Failure must not scribble on the image.
    assert_eq!(original, image);
}

#[test]
fn divergent_slots_use_dev_identity_for_a() {
    let keys = generate_keys();
    let dev_key = generate_private_key();
    let dev_public = dev_key.public_key(1).unwrap();
    let dev_signer = vbsign::crypto::Signer::Private(dev_key);
    let dev_keyblock = Keyblock::create(dev_public.clone(), 0x3, Some(&keys.root_signer)).unwrap();

    let mut image = build_bios_image(0xA5, 0x5A, 1);

    let options = BiosSignOptions {
        dev_signer: Some(&dev_signer),
        dev_keyblock: Some(&dev_keyblock),
        ..default_options(&keys)
    };
    bios::sign_bios(&mut image, &options).unwrap();

    let preamble_a = verify_slot(&image, &keys, VBLOCK_A_OFFSET, FW_A_OFFSET);
    let keyblock_a =
        Keyblock::parse(&image[VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + VBLOCK_LEN]).unwrap();
    assert_eq!(keyblock_a.data_key, dev_public);
    assert_eq!(preamble_a.flags, Some(0));

    // Slot B always gets the normal identity.
    let keyblock_b =
        Keyblock::parse(&image[VBLOCK_B_OFFSET..VBLOCK_B_OFFSET + VBLOCK_LEN]).unwrap();
    assert_eq!(keyblock_b.data_key, keys.data_public);
}

#[test]
fn existing_preamble_shrinks_body_and_preserves_flags() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);

    // Plant valid keyblocks and preambles claiming 0x4000-byte bodies in
    // both slots, with flags 0x2A in slot A.
    for (vblock_offset, fw_offset, flags) in [
        (VBLOCK_A_OFFSET, FW_A_OFFSET, 0x2A),
        (VBLOCK_B_OFFSET, FW_B_OFFSET, 0x55),
    ] {
        let body = &image[fw_offset..fw_offset + 0x4000];
        let body_signature = BodySignature::over(body, &keys.signer).unwrap();
        let preamble = FirmwarePreamble::create(
            9,
            keys.kernel_subkey.clone(),
            body_signature,
            flags,
            &keys.signer,
        )
        .unwrap();

        let mut vblock = keys.keyblock.to_bytes().unwrap();
        vblock.extend_from_slice(&preamble.to_bytes().unwrap());
        image[vblock_offset..vblock_offset + vblock.len()].copy_from_slice(&vblock);
    }

    // Slot B diverges beyond what the old preambles cover; the shrunken
    // bodies still match, so no dev keys are needed.
    image[FW_B_OFFSET + 0x4000..FW_B_OFFSET + FW_LEN].fill(0x77);

    bios::sign_bios(&mut image, &default_options(&keys)).unwrap();

    let preamble_a = verify_slot(&image, &keys, VBLOCK_A_OFFSET, FW_A_OFFSET);
    assert_eq!(preamble_a.body_signature.data_size, 0x4000);
    assert_eq!(preamble_a.flags, Some(0x2A));

    // Slot A's old flags win for both slots when none are specified.
    let preamble_b = verify_slot(&image, &keys, VBLOCK_B_OFFSET, FW_B_OFFSET);
    assert_eq!(preamble_b.body_signature.data_size, 0x4000);
    assert_eq!(preamble_b.flags, Some(0x2A));
}

#[test]
fn explicit_flags_override_preserved_ones() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);

    let body_signature =
        BodySignature::over(&image[FW_A_OFFSET..FW_A_OFFSET + FW_LEN], &keys.signer).unwrap();
    let preamble = FirmwarePreamble::create(
        1,
        keys.kernel_subkey.clone(),
        body_signature,
        0x2A,
        &keys.signer,
    )
    .unwrap();

    let mut vblock = keys.keyblock.to_bytes().unwrap();
    vblock.extend_from_slice(&preamble.to_bytes().unwrap());
    image[VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + vblock.len()].copy_from_slice(&vblock);

    let options = BiosSignOptions {
        flags: Some(7),
        ..default_options(&keys)
    };
    bios::sign_bios(&mut image, &options).unwrap();

    let preamble_a = verify_slot(&image, &keys, VBLOCK_A_OFFSET, FW_A_OFFSET);
    assert_eq!(preamble_a.flags, Some(7));
}

#[test]
fn loem_sidecars_match_vblocks() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);
    let dir = tempfile::tempdir().unwrap();

    let options = BiosSignOptions {
        loem: Some(LoemOptions {
            dir: dir.path().to_owned(),
            id: "acme".to_owned(),
        }),
        ..default_options(&keys)
    };
    bios::sign_bios(&mut image, &options).unwrap();

    let sidecar_a = std::fs::read(dir.path().join("vblock_A.acme")).unwrap();
    let sidecar_b = std::fs::read(dir.path().join("vblock_B.acme")).unwrap();

    assert_eq!(
        sidecar_a,
        &image[VBLOCK_A_OFFSET..VBLOCK_A_OFFSET + VBLOCK_LEN]
    );
    assert_eq!(
        sidecar_b,
        &image[VBLOCK_B_OFFSET..VBLOCK_B_OFFSET + VBLOCK_LEN]
    );
}

#[test]
fn gbb_edits_apply_and_legacy_flags_only_warn() {
    let keys = generate_keys();
    let new_root = generate_private_key().public_key(2).unwrap();

    // A legacy GBB without a flags field.
    let mut image = build_bios_image(0xA5, 0xA5, 0);

    let options = BiosSignOptions {
        gbb: GbbEdits {
            hwid: Some("ACME 1234".to_owned()),
            rootkey: Some(new_root.clone()),
            recovery_key: None,
            flags: Some(0x39),
        },
        ..default_options(&keys)
    };
    bios::sign_bios(&mut image, &options).unwrap();

    let region = &image[GBB_OFFSET..GBB_OFFSET + GBB_LEN];
    let gbb = Gbb::parse(region).unwrap();
    assert_eq!(gbb.hwid(region).unwrap(), "ACME 1234");
    assert_eq!(gbb.rootkey(region).unwrap(), new_root);

    // The missing flags field was only worth a warning, and both slots
    // still got signed.
    assert_matches!(gbb.flags(), Err(vbsign::format::gbb::Error::UnsupportedField(1, 0)));
    verify_slot(&image, &keys, VBLOCK_A_OFFSET, FW_A_OFFSET);
    verify_slot(&image, &keys, VBLOCK_B_OFFSET, FW_B_OFFSET);
}

#[test]
fn rollback_downgrade_still_signs() {
    let keys = generate_keys();
    let mut image = build_bios_image(0xA5, 0xA5, 1);

    let options = BiosSignOptions {
        platform: Some(PlatformVersions {
            data_key_version: 5,
            firmware_version: 3,
        }),
        ..default_options(&keys)
    };

    // The keyblock's data key version (1) is lower than what the platform
    // reported (5); that only warns.
    bios::sign_bios(&mut image, &options).unwrap();
    verify_slot(&image, &keys, VBLOCK_A_OFFSET, FW_A_OFFSET);
}

#[test]
fn missing_region_aborts() {
    let keys = generate_keys();

    // No FMAP at all.
    let mut blank = vec![0u8; 0x10000];
    let err = bios::sign_bios(&mut blank, &default_options(&keys)).unwrap_err();
    assert_matches!(err, Error::Fmap(vbsign::format::fmap::Error::NotFound));
}
