// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PciAddressParseError {
    #[error("empty device address")]
    Empty,
    #[error("malformed device address {0:?}, expected [ssss:]bb[:dd[.f]]")]
    Malformed(String),
    #[error("device address field out of range in {0:?}")]
    OutOfRange(String),
}

/// A PCI device address in `segment:bus:device.function` form.
///
/// Segment, device and function default to 0 when omitted, so `3b`,
/// `3b:00`, `3b:00.0` and `0000:3b:00.0` all name the same function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    pub segment: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    /// Path of the device in the sysfs PCI bus tree.
    pub fn sysfs_path(&self) -> PathBuf {
        PathBuf::from(format!("/sys/bus/pci/devices/{self}"))
    }

    /// The device name the kernel expects in a group "get device" request.
    pub fn device_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:01x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

impl FromStr for PciAddress {
    type Err = PciAddressParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PciAddressParseError::Empty);
        }

        let malformed = || PciAddressParseError::Malformed(s.to_owned());
        let out_of_range = || PciAddressParseError::OutOfRange(s.to_owned());

        // Leading fields are optional: "bb", "bb:dd", "bb:dd.f" or the full
        // "ssss:bb:dd.f" form.
        let mut fields: Vec<&str> = s.split(':').collect();
        let segment = match fields.len() {
            1 | 2 => 0,
            3 => u16::from_str_radix(fields.remove(0), 16).map_err(|_| malformed())?,
            _ => return Err(malformed()),
        };

        let bus = u8::from_str_radix(fields[0], 16).map_err(|_| malformed())?;

        let (device, function) = match fields.get(1) {
            None => (0, 0),
            Some(devfn) => {
                let mut parts = devfn.splitn(2, '.');
                let device = parts
                    .next()
                    .map(|d| u8::from_str_radix(d, 16))
                    .transpose()
                    .map_err(|_| malformed())?
                    .ok_or_else(malformed)?;
                let function = match parts.next() {
                    None => 0,
                    Some(f) => u8::from_str_radix(f, 16).map_err(|_| malformed())?,
                };
                (device, function)
            }
        };

        // PCI limits: 5 bits of device, 3 bits of function.
        if device > 0x1f || function > 0x7 {
            return Err(out_of_range());
        }

        Ok(PciAddress {
            segment,
            bus,
            device,
            function,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_address() {
        assert_eq!(
            "0000:3b:00.0".parse::<PciAddress>().unwrap(),
            PciAddress {
                segment: 0,
                bus: 0x3b,
                device: 0,
                function: 0
            }
        );
        assert_eq!(
            "00a1:ff:1f.7".parse::<PciAddress>().unwrap(),
            PciAddress {
                segment: 0xa1,
                bus: 0xff,
                device: 0x1f,
                function: 7
            }
        );
    }

    #[test]
    fn test_parse_defaults() {
        // A bare bus number gets segment/device/function 0.
        assert_eq!(
            "3b".parse::<PciAddress>().unwrap(),
            PciAddress {
                segment: 0,
                bus: 0x3b,
                device: 0,
                function: 0
            }
        );
        assert_eq!(
            "3b:02".parse::<PciAddress>().unwrap(),
            PciAddress {
                segment: 0,
                bus: 0x3b,
                device: 2,
                function: 0
            }
        );
        assert_eq!(
            "3b:02.1".parse::<PciAddress>().unwrap(),
            PciAddress {
                segment: 0,
                bus: 0x3b,
                device: 2,
                function: 1
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            "".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::Empty
        );
        assert!(matches!(
            "zz:00.0".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::Malformed(_)
        ));
        assert!(matches!(
            "0000:01:00.0.3".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::Malformed(_)
        ));
        assert!(matches!(
            "0000:01:20.0".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::OutOfRange(_)
        ));
        assert!(matches!(
            "0000:01:00.8".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::OutOfRange(_)
        ));
        assert!(matches!(
            "0:0:0:0".parse::<PciAddress>().unwrap_err(),
            PciAddressParseError::Malformed(_)
        ));
    }

    #[test]
    fn test_display_round_trip() {
        for s in ["0000:3b:00.0", "00a1:ff:1f.7", "0000:00:01.2"] {
            assert_eq!(s.parse::<PciAddress>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_sysfs_path() {
        let addr: PciAddress = "0000:01:00.0".parse().unwrap();
        assert_eq!(
            addr.sysfs_path(),
            PathBuf::from("/sys/bus/pci/devices/0000:01:00.0")
        );
    }
}
