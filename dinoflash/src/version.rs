//! Hardware version burned into the eFuse user block.
//!
//! The version occupies the first three bytes of a 32-byte provisioning
//! record. An all-zero version is reserved: a blank eFuse block reads back
//! as zeros, so `0.0.0` always means "no version burned".

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Size of the eFuse `BLOCK3` user data record.
pub const RECORD_LEN: usize = 32;

/// Version burned by default on the production line.
pub const DEFAULT_HARDWARE_VERSION: HardwareVersion = HardwareVersion::new(1, 9, 1);

/// A `major.minor.patch` hardware revision, one byte per component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareVersion {
    /// Major revision.
    pub major: u8,
    /// Minor revision.
    pub minor: u8,
    /// Patch revision.
    pub patch: u8,
}

impl HardwareVersion {
    /// Create a version from its components.
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Build a version from the three eFuse bytes.
    ///
    /// Returns `None` for the reserved all-zero value.
    pub fn from_bytes(bytes: [u8; 3]) -> Option<Self> {
        let version = Self::new(bytes[0], bytes[1], bytes[2]);
        (!version.is_absent()).then_some(version)
    }

    /// Whether this is the reserved `0.0.0` value.
    pub fn is_absent(&self) -> bool {
        self.major == 0 && self.minor == 0 && self.patch == 0
    }

    /// Encode as the 32-byte provisioning record.
    pub fn to_record(&self) -> [u8; RECORD_LEN] {
        let mut record = [0u8; RECORD_LEN];
        record[0] = self.major;
        record[1] = self.minor;
        record[2] = self.patch;
        record
    }
}

impl fmt::Display for HardwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for HardwareVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());

        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.len() != 3 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 3];
        for (slot, part) in bytes.iter_mut().zip(&parts) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            *slot = part.parse().map_err(|_| invalid())?;
        }

        Ok(Self::new(bytes[0], bytes[1], bytes[2]))
    }
}
