// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

// Not every test binary touches every helper.
#![allow(dead_code)]

use byteorder::{LittleEndian, WriteBytesExt};
use rsa::RsaPrivateKey;

use vbsign::{
    crypto::{Algorithm, PrivateKey, PublicKey, Signer},
    format::{fmap::FMAP_NAME_LEN, keyblock::Keyblock},
    stream::WriteStringExt,
};

pub const ALGORITHM: Algorithm = Algorithm::Rsa1024Sha256;

// Test image layout. Small on purpose so RSA-1024 keeps the suite fast.
pub const GBB_OFFSET: usize = 0x1000;
pub const GBB_LEN: usize = 0x2000;
pub const FW_A_OFFSET: usize = 0x10000;
pub const FW_B_OFFSET: usize = 0x18000;
pub const FW_LEN: usize = 0x8000;
pub const VBLOCK_A_OFFSET: usize = 0x20000;
pub const VBLOCK_B_OFFSET: usize = 0x22000;
pub const VBLOCK_LEN: usize = 0x2000;
pub const IMAGE_LEN: usize = 0x30000;

const FMAP_OFFSET: usize = 0x400;

pub struct TestKeys {
    pub signer: Signer,
    pub data_public: PublicKey,
    pub root_signer: Signer,
    pub root_public: PublicKey,
    pub kernel_subkey: PublicKey,
    pub keyblock: Keyblock,
}

pub fn generate_private_key() -> PrivateKey {
    let mut rng = rand::thread_rng();
    let key = RsaPrivateKey::new(&mut rng, ALGORITHM.key_bits()).unwrap();

    PrivateKey::from_rsa(key, ALGORITHM).unwrap()
}

pub fn generate_keys() -> TestKeys {
    let data_key = generate_private_key();
    let data_public = data_key.public_key(1).unwrap();
    let signer = Signer::Private(data_key);

    let root_key = generate_private_key();
    let root_public = root_key.public_key(1).unwrap();
    let root_signer = Signer::Private(root_key);

    let kernel_subkey = generate_private_key().public_key(1).unwrap();

    let keyblock = Keyblock::create(data_public.clone(), 0xF, Some(&root_signer)).unwrap();

    TestKeys {
        signer,
        data_public,
        root_signer,
        root_public,
        kernel_subkey,
        keyblock,
    }
}

fn build_fmap() -> Vec<u8> {
    let areas: [(&str, u32, u32); 5] = [
        ("GBB", GBB_OFFSET as u32, GBB_LEN as u32),
        ("FW_MAIN_A", FW_A_OFFSET as u32, FW_LEN as u32),
        ("FW_MAIN_B", FW_B_OFFSET as u32, FW_LEN as u32),
        ("VBLOCK_A", VBLOCK_A_OFFSET as u32, VBLOCK_LEN as u32),
        ("VBLOCK_B", VBLOCK_B_OFFSET as u32, VBLOCK_LEN as u32),
    ];

    let mut buf = vec![];
    buf.extend_from_slice(b"__FMAP__");
    buf.write_u8(1).unwrap();
    buf.write_u8(1).unwrap();
    buf.write_u64::<LittleEndian>(0).unwrap();
    buf.write_u32::<LittleEndian>(IMAGE_LEN as u32).unwrap();
    buf.write_string_padded("FMAP", FMAP_NAME_LEN).unwrap();
    buf.write_u16::<LittleEndian>(areas.len() as u16).unwrap();

    for (name, offset, size) in areas {
        buf.write_u32::<LittleEndian>(offset).unwrap();
        buf.write_u32::<LittleEndian>(size).unwrap();
        buf.write_string_padded(name, FMAP_NAME_LEN).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
    }

    buf
}

fn build_gbb(minor_version: u16) -> Vec<u8> {
    let mut header = vec![];
    header.extend_from_slice(b"$GBB");
    header.write_u16::<LittleEndian>(1).unwrap();
    header.write_u16::<LittleEndian>(minor_version).unwrap();
    header.write_u32::<LittleEndian>(128).unwrap();
    header.write_u32::<LittleEndian>(0).unwrap(); // flags

    // hwid, rootkey, bmpfv, recovery key offset/size pairs
    for (offset, size) in [
        (0x100u32, 0x100u32),
        (0x200, 0x500),
        (0x700, 0x100),
        (0x800, 0x500),
    ] {
        header.write_u32::<LittleEndian>(offset).unwrap();
        header.write_u32::<LittleEndian>(size).unwrap();
    }

    header.resize(128, 0);

    let mut region = vec![0u8; GBB_LEN];
    region[..header.len()].copy_from_slice(&header);

    // A plausible starting HWID.
    region[0x100..0x10A].copy_from_slice(b"OLD HWID\0\0");
    region
}

/// Build a firmware image whose A and B bodies carry the given fill bytes.
/// The vblock regions start out as zeros, like a never-signed image.
pub fn build_bios_image(fill_a: u8, fill_b: u8, gbb_minor_version: u16) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_LEN];

    let fmap = build_fmap();
    image[FMAP_OFFSET..FMAP_OFFSET + fmap.len()].copy_from_slice(&fmap);

    let gbb = build_gbb(gbb_minor_version);
    image[GBB_OFFSET..GBB_OFFSET + GBB_LEN].copy_from_slice(&gbb);

    image[FW_A_OFFSET..FW_A_OFFSET + FW_LEN].fill(fill_a);
    image[FW_B_OFFSET..FW_B_OFFSET + FW_LEN].fill(fill_b);

    image
}
