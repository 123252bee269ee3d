// SPDX-FileCopyrightText: 2024 vbsign contributors
// SPDX-License-Identifier: GPL-3.0-only

pub mod bios;
pub mod firmware;
pub mod kernel;

use tracing::warn;

/// Version numbers the platform reported from its anti-rollback storage.
/// Reading them back is the caller's problem; the policy here only compares.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlatformVersions {
    pub data_key_version: u32,
    pub firmware_version: u32,
}

/// Warn when the new data key version is lower than what the platform has
/// already accepted. The platform will refuse such firmware, but whether to
/// sign it anyway is the caller's decision, so this never fails.
pub fn check_rollback(platform: &PlatformVersions, new_data_key_version: u32) {
    if platform.data_key_version > new_data_key_version {
        warn!(
            "Data key version {} is lower than the platform's version {}; \
             the TPM will reject this firmware",
            new_data_key_version, platform.data_key_version,
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        sync::{Arc, Mutex},
    };

    use super::*;

    #[derive(Clone)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` with a subscriber that buffers everything it logs.
    fn capture_logs(f: impl FnOnce()) -> String {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let writer = Capture(buf.clone());

        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let data = buf.lock().unwrap();
        String::from_utf8_lossy(&data).into_owned()
    }

    #[test]
    fn downgrade_warns() {
        let platform = PlatformVersions {
            data_key_version: 5,
            firmware_version: 3,
        };

        let output = capture_logs(|| check_rollback(&platform, 2));
        assert!(output.contains("lower than the platform's version 5"), "{output}");
    }

    #[test]
    fn same_or_newer_version_is_quiet() {
        let platform = PlatformVersions {
            data_key_version: 2,
            firmware_version: 1,
        };

        assert_eq!(capture_logs(|| check_rollback(&platform, 2)), "");
        assert_eq!(capture_logs(|| check_rollback(&platform, 3)), "");
    }
}
