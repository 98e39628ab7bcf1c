//! Class drivers and match scoring
//!
//! A class driver registers a [`MatchSpec`] describing the devices or
//! interfaces it can drive. When a device appears (or a driver registers
//! late), the stack scores every registered driver against the unclaimed
//! device/interfaces and offers the best match first; a driver declines by
//! returning an error from its connect callback, and the match is undone.

use crate::device::{AltSettingModel, Device, DeviceDescriptor};
use crate::stack::HostStack;
use std::sync::Arc;
use usb::{Error, Result};

/// Registry handle for one registered driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DriverId(pub u32);

/// Match criteria: vendor/product identity or a class triple
///
/// `None` fields are wildcards. An identity match outscores any class
/// match, and within one level a more specific spec outscores a less
/// specific one; registration order breaks ties (earlier wins).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchSpec {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
}

impl MatchSpec {
    /// Match any interface of the given class
    pub fn for_class(class: u8) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    /// Match a specific vendor/product identity
    pub fn for_vendor(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id: Some(vendor_id),
            product_id: Some(product_id),
            ..Self::default()
        }
    }

    fn score(&self, identity: Option<(u16, u16)>, triple: (u8, u8, u8)) -> Option<u32> {
        let mut score = 0;

        if let Some(vendor) = self.vendor_id {
            let (vid, _) = identity?;
            if vendor != vid {
                return None;
            }
            score += 8;
        }
        if let Some(product) = self.product_id {
            let (_, pid) = identity?;
            if product != pid {
                return None;
            }
            score += 8;
        }
        if let Some(class) = self.class {
            if class != triple.0 {
                return None;
            }
            score += 4;
        }
        if let Some(subclass) = self.subclass {
            if subclass != triple.1 {
                return None;
            }
            score += 2;
        }
        if let Some(protocol) = self.protocol {
            if protocol != triple.2 {
                return None;
            }
            score += 1;
        }

        // A spec with no criteria matches nothing
        if score == 0 { None } else { Some(score) }
    }

    /// Score against a device descriptor; `None` means no match
    pub fn score_device(&self, descriptor: &DeviceDescriptor) -> Option<u32> {
        self.score(
            Some((descriptor.vendor_id, descriptor.product_id)),
            (
                descriptor.device_class,
                descriptor.device_subclass,
                descriptor.device_protocol,
            ),
        )
    }

    /// Score against an interface alternate setting; `None` means no match
    pub fn score_interface(&self, alt: &AltSettingModel) -> Option<u32> {
        // Interfaces carry no vendor identity; identity-only drivers bind
        // at device level instead.
        self.score(None, (alt.class, alt.subclass, alt.protocol))
    }
}

/// A USB class driver
///
/// Connect callbacks run outside the stack lock on the thread doing the
/// matching sweep; they may use the per-device APIs (claim, set_interface,
/// transfers) freely.
pub trait ClassDriver: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Criteria this driver matches on
    fn match_spec(&self) -> MatchSpec;

    /// Offer an unconfigured/whole device to the driver. Returning an
    /// error declines the offer and the match is undone.
    fn connect_device(&self, stack: &HostStack, device: &Arc<Device>) -> Result<()> {
        let _ = (stack, device);
        Err(Error::NotPresent)
    }

    /// Offer one unclaimed interface of a configured device to the driver.
    /// Returning an error declines the offer and the match is undone.
    fn connect_interface(
        &self,
        stack: &HostStack,
        device: &Arc<Device>,
        interface_index: usize,
    ) -> Result<()> {
        let _ = (stack, device, interface_index);
        Err(Error::NotPresent)
    }

    /// The device (or a claimed interface of it) is going away
    fn disconnect(&self, stack: &HostStack, device: &Arc<Device>) -> Result<()> {
        let _ = (stack, device);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::AltSettingModel;

    fn descriptor(vid: u16, pid: u16, class: u8) -> DeviceDescriptor {
        DeviceDescriptor {
            vendor_id: vid,
            product_id: pid,
            device_class: class,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 64,
            num_configurations: 1,
        }
    }

    fn alt(class: u8, subclass: u8, protocol: u8) -> AltSettingModel {
        AltSettingModel {
            setting: 0,
            class,
            subclass,
            protocol,
            endpoints: Vec::new(),
        }
    }

    #[test]
    fn test_vendor_match_outscores_class_match() {
        let dev = descriptor(0x1234, 0x5678, 0x08);
        let by_identity = MatchSpec::for_vendor(0x1234, 0x5678);
        let by_class = MatchSpec::for_class(0x08);
        assert!(by_identity.score_device(&dev).unwrap() > by_class.score_device(&dev).unwrap());
    }

    #[test]
    fn test_more_specific_triple_scores_higher() {
        let setting = alt(0x08, 0x06, 0x50);
        let class_only = MatchSpec::for_class(0x08);
        let full = MatchSpec {
            class: Some(0x08),
            subclass: Some(0x06),
            protocol: Some(0x50),
            ..MatchSpec::default()
        };
        assert!(full.score_interface(&setting).unwrap() > class_only.score_interface(&setting).unwrap());
    }

    #[test]
    fn test_mismatch_is_none_not_zero() {
        let setting = alt(0x03, 0, 0);
        assert_eq!(MatchSpec::for_class(0x08).score_interface(&setting), None);
        // Empty spec matches nothing rather than everything
        assert_eq!(MatchSpec::default().score_interface(&setting), None);
    }

    #[test]
    fn test_identity_spec_never_matches_interfaces() {
        let setting = alt(0x08, 0x06, 0x50);
        assert_eq!(
            MatchSpec::for_vendor(0x1234, 0x5678).score_interface(&setting),
            None
        );
    }
}
