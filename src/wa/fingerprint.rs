//! Realistic device fingerprints for client registration.
//!
//! Each new client gets one of these browser/OS tuples, chosen at random and
//! passed by value into the factory.

use rand::Rng;
use serde::Serialize;

/// A browser/OS tuple advertised to the server during registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DeviceFingerprint {
    pub os: &'static str,
    pub os_version: &'static str,
    pub browser: &'static str,
    pub browser_version: &'static str,
}

/// The fixed set drawn from. Versions are kept plausible, not current.
pub const KNOWN_FINGERPRINTS: &[DeviceFingerprint] = &[
    DeviceFingerprint {
        os: "Mac OS",
        os_version: "10.15.7",
        browser: "Chrome",
        browser_version: "120.0.6099.109",
    },
    DeviceFingerprint {
        os: "Mac OS",
        os_version: "14.2.1",
        browser: "Safari",
        browser_version: "17.2",
    },
    DeviceFingerprint {
        os: "Windows",
        os_version: "10",
        browser: "Chrome",
        browser_version: "120.0.6099.130",
    },
    DeviceFingerprint {
        os: "Windows",
        os_version: "11",
        browser: "Edge",
        browser_version: "120.0.2210.91",
    },
    DeviceFingerprint {
        os: "Windows",
        os_version: "11",
        browser: "Firefox",
        browser_version: "121.0",
    },
    DeviceFingerprint {
        os: "Linux",
        os_version: "x86_64",
        browser: "Chrome",
        browser_version: "120.0.6099.109",
    },
    DeviceFingerprint {
        os: "Linux",
        os_version: "x86_64",
        browser: "Firefox",
        browser_version: "121.0",
    },
    DeviceFingerprint {
        os: "Ubuntu",
        os_version: "22.04",
        browser: "Chromium",
        browser_version: "119.0.6045.159",
    },
];

impl DeviceFingerprint {
    /// Pick a random fingerprint from the known set.
    pub fn random() -> Self {
        let idx = rand::rng().random_range(0..KNOWN_FINGERPRINTS.len());
        KNOWN_FINGERPRINTS[idx]
    }

    /// Display label, e.g. "Chrome 120.0.6099.109 (Mac OS 10.15.7)".
    pub fn label(&self) -> String {
        format!(
            "{} {} ({} {})",
            self.browser, self.browser_version, self.os, self.os_version
        )
    }
}
