//! Platform capability and security model
//!
//! Every loaded image carries a [`SecurityInfo`]: its secure id, vendor id
//! and the set of platform capabilities it was granted. Servers guard
//! operations with a [`SecurityPolicy`], which is checked against the
//! requesting process's security info.
//!
//! ## Example
//!
//! ```
//! use core_types::{Capability, CapabilitySet, SecurityInfo, SecurityPolicy};
//!
//! let info = SecurityInfo::new(0xE000_0001, 0, CapabilitySet::from_caps(&[Capability::ReadUserData]));
//! let policy = SecurityPolicy::caps(&[Capability::ReadUserData]);
//!
//! let mut missing = SecurityInfo::default();
//! assert!(policy.check(&info, &mut missing));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of platform capabilities
pub const CAP_LIMIT: usize = 20;

/// A single platform capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Capability {
    Tcb = 0,
    CommDd = 1,
    PowerMgmt = 2,
    MultimediaDd = 3,
    ReadDeviceData = 4,
    WriteDeviceData = 5,
    Drm = 6,
    TrustedUi = 7,
    ProtServ = 8,
    DiskAdmin = 9,
    NetworkControl = 10,
    AllFiles = 11,
    SwEvent = 12,
    NetworkServices = 13,
    LocalServices = 14,
    ReadUserData = 15,
    WriteUserData = 16,
    Location = 17,
    SurroundingsDd = 18,
    UserEnvironment = 19,
}

impl Capability {
    const ALL: [Capability; CAP_LIMIT] = [
        Capability::Tcb,
        Capability::CommDd,
        Capability::PowerMgmt,
        Capability::MultimediaDd,
        Capability::ReadDeviceData,
        Capability::WriteDeviceData,
        Capability::Drm,
        Capability::TrustedUi,
        Capability::ProtServ,
        Capability::DiskAdmin,
        Capability::NetworkControl,
        Capability::AllFiles,
        Capability::SwEvent,
        Capability::NetworkServices,
        Capability::LocalServices,
        Capability::ReadUserData,
        Capability::WriteUserData,
        Capability::Location,
        Capability::SurroundingsDd,
        Capability::UserEnvironment,
    ];

    /// Looks a capability up by its bit index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Returns the bit index of this capability
    pub const fn index(&self) -> usize {
        *self as usize
    }

    /// Returns every capability in index order
    pub fn all() -> impl Iterator<Item = Capability> {
        Self::ALL.into_iter()
    }
}

/// Human readable capability name, as printed in capability dumps
pub fn capability_to_string(cap: Capability) -> &'static str {
    match cap {
        Capability::Tcb => "TCB",
        Capability::CommDd => "CommDD",
        Capability::PowerMgmt => "PowerMgmt",
        Capability::MultimediaDd => "MultimediaDD",
        Capability::ReadDeviceData => "ReadDeviceData",
        Capability::WriteDeviceData => "WriteDeviceData",
        Capability::Drm => "DRM",
        Capability::TrustedUi => "TrustedUI",
        Capability::ProtServ => "ProtServ",
        Capability::DiskAdmin => "DiskAdmin",
        Capability::NetworkControl => "NetworkControl",
        Capability::AllFiles => "AllFiles",
        Capability::SwEvent => "SwEvent",
        Capability::NetworkServices => "NetworkServices",
        Capability::LocalServices => "LocalServices",
        Capability::ReadUserData => "ReadUserData",
        Capability::WriteUserData => "WriteUserData",
        Capability::Location => "Location",
        Capability::SurroundingsDd => "SurroundingsDD",
        Capability::UserEnvironment => "UserEnvironment",
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", capability_to_string(*self))
    }
}

/// A set of platform capabilities, stored as a bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates a set from its raw bitmask
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits & ((1 << CAP_LIMIT) - 1))
    }

    /// Creates a set holding exactly the given capabilities
    pub fn from_caps(caps: &[Capability]) -> Self {
        let mut set = Self::empty();
        for cap in caps {
            set.set(*cap, true);
        }
        set
    }

    /// Returns the raw bitmask
    pub const fn bits(&self) -> u32 {
        self.0
    }

    /// Returns true if the capability at `index` is in the set
    pub fn get(&self, index: usize) -> bool {
        index < CAP_LIMIT && self.0 & (1 << index) != 0
    }

    /// Returns true if the capability is in the set
    pub fn contains(&self, cap: Capability) -> bool {
        self.get(cap.index())
    }

    /// Adds or removes a capability
    pub fn set(&mut self, cap: Capability, present: bool) {
        if present {
            self.0 |= 1 << cap.index();
        } else {
            self.0 &= !(1 << cap.index());
        }
    }

    /// Returns true if every capability of `other` is also in this set
    pub fn is_superset_of(&self, other: &CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Capabilities of `other` missing from this set
    pub fn missing_from(&self, other: &CapabilitySet) -> CapabilitySet {
        CapabilitySet(other.0 & !self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterates over the capabilities in index order
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::all().filter(move |cap| self.contains(*cap))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "None");
        }
        let names: Vec<&str> = self.iter().map(capability_to_string).collect();
        write!(f, "{}", names.join(" "))
    }
}

/// Security identity of a loaded image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SecurityInfo {
    pub secure_id: u32,
    pub vendor_id: u32,
    pub caps: CapabilitySet,
}

impl SecurityInfo {
    pub fn new(secure_id: u32, vendor_id: u32, caps: CapabilitySet) -> Self {
        Self {
            secure_id,
            vendor_id,
            caps,
        }
    }

    /// Returns true if every capability of `cap_set` is held
    pub fn has(&self, cap_set: &CapabilitySet) -> bool {
        self.caps.is_superset_of(cap_set)
    }
}

/// A check guarding a protected operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityPolicy {
    /// Every caller passes
    AlwaysPass,
    /// Every caller fails
    AlwaysFail,
    /// The caller must hold all listed capabilities
    Caps(CapabilitySet),
    /// The caller must have the given secure id and hold all listed capabilities
    SecureId { secure_id: u32, caps: CapabilitySet },
    /// The caller must have the given vendor id and hold all listed capabilities
    VendorId { vendor_id: u32, caps: CapabilitySet },
}

impl SecurityPolicy {
    /// Policy requiring the given capabilities
    pub fn caps(caps: &[Capability]) -> Self {
        SecurityPolicy::Caps(CapabilitySet::from_caps(caps))
    }

    /// Checks `info` against this policy
    ///
    /// On failure, `missing` receives what the caller lacks: the missing
    /// capabilities, plus the required secure or vendor id if that did not
    /// match.
    pub fn check(&self, info: &SecurityInfo, missing: &mut SecurityInfo) -> bool {
        *missing = SecurityInfo::default();

        match self {
            SecurityPolicy::AlwaysPass => true,
            SecurityPolicy::AlwaysFail => false,
            SecurityPolicy::Caps(caps) => {
                missing.caps = info.caps.missing_from(caps);
                missing.caps.is_empty()
            }
            SecurityPolicy::SecureId { secure_id, caps } => {
                missing.caps = info.caps.missing_from(caps);
                if info.secure_id != *secure_id {
                    missing.secure_id = *secure_id;
                }
                missing.caps.is_empty() && missing.secure_id == 0
            }
            SecurityPolicy::VendorId { vendor_id, caps } => {
                missing.caps = info.caps.missing_from(caps);
                if info.vendor_id != *vendor_id {
                    missing.vendor_id = *vendor_id;
                }
                missing.caps.is_empty() && missing.vendor_id == 0
            }
        }
    }
}

/// Errors related to capability checks
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    /// The caller does not satisfy the policy
    #[error("Security policy not satisfied, missing capabilities: {missing}")]
    PolicyNotSatisfied { missing: CapabilitySet },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_index_round_trip() {
        for cap in Capability::all() {
            assert_eq!(Capability::from_index(cap.index()), Some(cap));
        }
        assert_eq!(Capability::from_index(CAP_LIMIT), None);
    }

    #[test]
    fn test_capability_set_membership() {
        let mut set = CapabilitySet::empty();
        assert!(set.is_empty());

        set.set(Capability::SwEvent, true);
        assert!(set.contains(Capability::SwEvent));
        assert!(set.get(Capability::SwEvent.index()));
        assert!(!set.contains(Capability::Tcb));

        set.set(Capability::SwEvent, false);
        assert!(set.is_empty());
    }

    #[test]
    fn test_capability_set_display() {
        let set = CapabilitySet::from_caps(&[Capability::ReadUserData, Capability::Tcb]);
        assert_eq!(set.to_string(), "TCB ReadUserData");
        assert_eq!(CapabilitySet::empty().to_string(), "None");
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        let set = CapabilitySet::from_bits(u32::MAX);
        assert_eq!(set.iter().count(), CAP_LIMIT);
    }

    #[test]
    fn test_security_info_has() {
        let info = SecurityInfo::new(
            1,
            0,
            CapabilitySet::from_caps(&[Capability::ReadUserData, Capability::WriteUserData]),
        );
        assert!(info.has(&CapabilitySet::from_caps(&[Capability::ReadUserData])));
        assert!(!info.has(&CapabilitySet::from_caps(&[Capability::AllFiles])));
        assert!(info.has(&CapabilitySet::empty()));
    }

    #[test]
    fn test_policy_caps_reports_missing() {
        let info = SecurityInfo::new(1, 0, CapabilitySet::from_caps(&[Capability::ReadUserData]));
        let policy = SecurityPolicy::caps(&[Capability::ReadUserData, Capability::SwEvent]);

        let mut missing = SecurityInfo::default();
        assert!(!policy.check(&info, &mut missing));
        assert_eq!(
            missing.caps,
            CapabilitySet::from_caps(&[Capability::SwEvent])
        );
    }

    #[test]
    fn test_policy_secure_id_mismatch() {
        let info = SecurityInfo::new(0x1000, 0, CapabilitySet::empty());
        let policy = SecurityPolicy::SecureId {
            secure_id: 0x2000,
            caps: CapabilitySet::empty(),
        };

        let mut missing = SecurityInfo::default();
        assert!(!policy.check(&info, &mut missing));
        assert_eq!(missing.secure_id, 0x2000);
    }

    #[test]
    fn test_policy_vendor_id_match() {
        let info = SecurityInfo::new(0x1000, 0x70000001, CapabilitySet::empty());
        let policy = SecurityPolicy::VendorId {
            vendor_id: 0x70000001,
            caps: CapabilitySet::empty(),
        };

        let mut missing = SecurityInfo::default();
        assert!(policy.check(&info, &mut missing));
    }

    #[test]
    fn test_policy_json_round_trip() {
        let policy = SecurityPolicy::SecureId {
            secure_id: 0x1000_5a22,
            caps: CapabilitySet::from_caps(&[Capability::ProtServ]),
        };
        let json = serde_json::to_string(&policy).unwrap();
        let decoded: SecurityPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn test_always_policies() {
        let info = SecurityInfo::default();
        let mut missing = SecurityInfo::default();
        assert!(SecurityPolicy::AlwaysPass.check(&info, &mut missing));
        assert!(!SecurityPolicy::AlwaysFail.check(&info, &mut missing));
    }
}
