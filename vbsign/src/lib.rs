// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod cli;
pub mod crypto;
pub mod format;
pub mod image;
pub mod sign;
pub mod stream;
pub mod util;
