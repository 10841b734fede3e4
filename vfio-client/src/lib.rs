// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

//! Client for the [VFIO](https://www.kernel.org/doc/Documentation/vfio.txt)
//! attachment and teardown protocol.
//!
//! VFIO exposes direct device access to userspace inside an IOMMU-protected
//! address space. The unit of ownership is the *group*, the set of devices
//! the host IOMMU cannot isolate from each other; one or more groups attach
//! to a *container*, which holds the DMA address space and the selected IOMMU
//! backend; *device* descriptors are handed out by an attached group.
//!
//! A well-behaved client walks the protocol in order: open the container,
//! attach at least one viable group, select an IOMMU backend, then request
//! device descriptors. Teardown runs the same ladder backwards: release every
//! device, detach the groups, close the container. This crate enforces that
//! ordering on the client side so that misuse is reported as a typed error
//! instead of a kernel `errno` after the fact:
//!
//! - [`VfioContainer`] refuses to select a backend before a group is
//!   attached, and reports how many device handles were still alive when it
//!   was closed.
//! - [`VfioGroup`] refuses to attach non-viable groups, to attach twice, and
//!   to detach while device handles sourced from it remain open. Detaching
//!   the last group discards the container's backend selection.
//! - [`VfioDevice`] hands out cached metadata, supports region/IRQ
//!   introspection and reset, and rejects every operation after `release`.

mod address;
mod container;
mod device;
mod group;
mod ioctls;

use std::io;
use std::mem::size_of;
use std::path::PathBuf;

use thiserror::Error;

pub use crate::address::{PciAddress, PciAddressParseError};
pub use crate::container::{IommuType, VfioContainer};
pub use crate::device::{DeviceInfo, IrqInfo, RegionInfo, SparseMmapArea, VfioDevice};
pub use crate::group::{GroupStatus, VfioGroup};

/// Errors reported by the container, group and device managers.
///
/// Every error is reported synchronously by the call that detects it; the
/// crate never retries on behalf of the caller.
#[derive(Debug, Error)]
pub enum VfioError {
    #[error("failed to open /dev/vfio/vfio container: {0}")]
    OpenContainer(#[source] io::Error),
    #[error("kernel reports VFIO API version {0}, expected {1}")]
    ApiVersion(i32, u32),
    #[error("container does not support the {0} IOMMU backend")]
    UnsupportedIommuType(IommuType),
    #[error("no group attached to the container, cannot select an IOMMU backend")]
    NoGroupAttached,
    #[error("failed to select the {0} IOMMU backend: {1}")]
    SetIommu(IommuType, #[source] io::Error),
    #[error("container closed with {0} device handles still open under its groups")]
    ContainerBusy(u32),
    #[error("no PCI device at {0}")]
    DeviceNotFound(PciAddress),
    #[error("no iommu_group link for device {0}: {1}")]
    NoIommuGroup(PciAddress, #[source] io::Error),
    #[error("cannot parse an IOMMU group id out of {0}")]
    ParseGroupId(PathBuf),
    #[error("failed to open /dev/vfio/{0} group: {1}")]
    OpenGroup(u32, #[source] io::Error),
    #[error("failed to get status of group {0}: {1}")]
    GetGroupStatus(u32, #[source] io::Error),
    #[error("group {0} is not viable, are all member devices bound to vfio?")]
    GroupNotViable(u32),
    #[error("group {0} is already attached to a container")]
    GroupAlreadyAttached(u32),
    #[error("failed to attach group {0} to the container: {1}")]
    GroupSetContainer(u32, #[source] io::Error),
    #[error("failed to detach group {0} from the container: {1}")]
    GroupUnsetContainer(u32, #[source] io::Error),
    #[error("group {0} still has {1} open device handles")]
    GroupBusy(u32, u32),
    #[error("group {0} is not attached to a container")]
    GroupNotAttached(u32),
    #[error("container has no IOMMU backend selected")]
    IommuNotSet,
    #[error("device name {0:?} is not a valid C string")]
    InvalidDeviceName(String),
    #[error("failed to get a descriptor for device {1} from group {0}: {2}")]
    GetDeviceFd(u32, String, #[source] io::Error),
    #[error("failed to get device info: {0}")]
    GetDeviceInfo(#[source] io::Error),
    #[error("failed to get info for region {0}: {1}")]
    GetRegionInfo(u32, #[source] io::Error),
    #[error("failed to get info for IRQ index {0}: {1}")]
    GetIrqInfo(u32, #[source] io::Error),
    #[error("IRQ index {0} supports {1} interrupts, {2} eventfds supplied")]
    IrqCountMismatch(u32, u32, usize),
    #[error("failed to set IRQs for index {0}: {1}")]
    SetIrqs(u32, #[source] io::Error),
    #[error("device does not support reset")]
    ResetUnsupported,
    #[error("device reset failed: {0}")]
    Reset(#[source] io::Error),
    #[error("device handle already released")]
    DeviceReleased,
    #[error("failed to map DMA region iova 0x{0:x} size 0x{1:x}: {2}")]
    IommuDmaMap(u64, u64, #[source] io::Error),
    #[error("failed to unmap DMA region iova 0x{0:x} size 0x{1:x}: {2}")]
    IommuDmaUnmap(u64, u64, #[source] io::Error),
}

pub type Result<T> = std::result::Result<T, VfioError>;

// Returns a `Vec<T>` with a size in bytes at least as large as `size_in_bytes`.
fn vec_with_size_in_bytes<T: Default>(size_in_bytes: usize) -> Vec<T> {
    let rounded_size = size_in_bytes.div_ceil(size_of::<T>());
    let mut v = Vec::with_capacity(rounded_size);
    for _ in 0..rounded_size {
        v.push(T::default())
    }
    v
}

// The VFIO API has many structs that end in a flexible array member. To
// allocate one of those, `size_of::<Foo>()` would be too small because it
// does not include any space for the trailing entries. A `Vec<Foo>` is
// created instead, large enough for `count` entries of type `F` contiguous
// with the head struct; only element 0 is used as a `Foo`.
pub(crate) fn vec_with_array_field<T: Default, F>(count: usize) -> Vec<T> {
    let element_space = count * size_of::<F>();
    let vec_size_bytes = size_of::<T>() + element_space;
    vec_with_size_in_bytes(vec_size_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_with_array_field_sizing() {
        #[repr(C)]
        #[derive(Default)]
        struct Head {
            argsz: u32,
            flags: u32,
        }

        let v = vec_with_array_field::<Head, u32>(0);
        assert_eq!(v.len(), 1);

        // 5 trailing u32 entries need 20 extra bytes, rounded up to 4 heads.
        let v = vec_with_array_field::<Head, u32>(5);
        assert!(v.len() * size_of::<Head>() >= size_of::<Head>() + 5 * size_of::<u32>());
        assert_eq!(v.len(), 4);
    }
}
