// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use vfio_bindings::bindings::vfio::*;
use vmm_sys_util::eventfd::EventFd;
use vmm_sys_util::ioctl::{ioctl, ioctl_with_mut_ref, ioctl_with_ref};

use crate::group::VfioGroup;
use crate::ioctls::*;
use crate::{vec_with_array_field, Result, VfioError};

/// Metadata fetched once when the device descriptor is acquired. Immutable
/// for the handle's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub num_regions: u32,
    pub num_irqs: u32,
    pub reset_capable: bool,
    pub is_pci: bool,
}

/// One mmap'able area inside a region, from the sparse-mmap capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SparseMmapArea {
    pub offset: u64,
    pub size: u64,
}

/// Result of a region-info query.
#[derive(Clone, Debug)]
pub struct RegionInfo {
    pub index: u32,
    pub flags: u32,
    pub size: u64,
    pub offset: u64,
    pub sparse_areas: Vec<SparseMmapArea>,
}

/// Result of an IRQ-info query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IrqInfo {
    pub index: u32,
    pub flags: u32,
    pub count: u32,
}

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Debug, Default)]
struct vfio_region_info_with_cap {
    region_info: vfio_region_info,
    cap_info: __IncompleteArrayField<u8>,
}

/// Descriptor for an individual hardware function, sourced from an attached
/// group.
///
/// The handle walks `Open -> Released` exactly once: [`release`]
/// (VfioDevice::release) closes the descriptor (the operation whose latency
/// the bench measures) and every later operation, including a second
/// release, reports [`VfioError::DeviceReleased`]. Releasing distinct
/// handles from concurrent execution units is safe; no lock is shared
/// across unrelated handles.
pub struct VfioDevice {
    device: Option<File>,
    group: Arc<VfioGroup>,
    info: DeviceInfo,
}

impl VfioDevice {
    pub(crate) fn new(device: File, group: Arc<VfioGroup>) -> Result<Self> {
        let mut dev_info = vfio_device_info {
            argsz: mem::size_of::<vfio_device_info>() as u32,
            flags: 0,
            num_regions: 0,
            num_irqs: 0,
        };
        // SAFETY: we own the device fd and dev_info is a properly sized
        // struct the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(&device, VFIO_DEVICE_GET_INFO(), &mut dev_info) };
        if ret < 0 {
            return Err(VfioError::GetDeviceInfo(io::Error::last_os_error()));
        }

        debug!(
            "device on group {}: flags 0x{:x}, {} regions, {} irqs",
            group.id(),
            dev_info.flags,
            dev_info.num_regions,
            dev_info.num_irqs
        );

        Ok(VfioDevice {
            device: Some(device),
            group,
            info: DeviceInfo {
                num_regions: dev_info.num_regions,
                num_irqs: dev_info.num_irqs,
                reset_capable: dev_info.flags & VFIO_DEVICE_FLAGS_RESET != 0,
                is_pci: dev_info.flags & VFIO_DEVICE_FLAGS_PCI != 0,
            },
        })
    }

    fn fd(&self) -> Result<&File> {
        self.device.as_ref().ok_or(VfioError::DeviceReleased)
    }

    /// Cached device metadata.
    pub fn info(&self) -> Result<DeviceInfo> {
        self.fd()?;
        Ok(self.info)
    }

    /// The group this descriptor was sourced from.
    pub fn group_id(&self) -> u32 {
        self.group.id()
    }

    /// Queries one region, following the grow-and-retry convention for
    /// capability chains: the kernel may report a larger required `argsz`,
    /// in which case the query is reissued with a buffer of that size and
    /// the sparse-mmap capability, when present, is decoded from the tail.
    pub fn region_info(&self, index: u32) -> Result<RegionInfo> {
        let device = self.fd()?;
        let argsz = mem::size_of::<vfio_region_info>() as u32;

        let mut reg_info = vfio_region_info {
            argsz,
            flags: 0,
            index,
            cap_offset: 0,
            size: 0,
            offset: 0,
        };
        // SAFETY: we own the device fd and reg_info is a properly sized
        // struct the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(device, VFIO_DEVICE_GET_REGION_INFO(), &mut reg_info) };
        if ret < 0 {
            return Err(VfioError::GetRegionInfo(index, io::Error::last_os_error()));
        }

        let mut region = RegionInfo {
            index,
            flags: reg_info.flags,
            size: reg_info.size,
            offset: reg_info.offset,
            sparse_areas: Vec::new(),
        };

        if reg_info.flags & VFIO_REGION_INFO_FLAG_CAPS != 0 && reg_info.argsz > argsz {
            let cap_len = (reg_info.argsz - argsz) as usize;
            let mut region_with_cap = vec_with_array_field::<vfio_region_info_with_cap, u8>(cap_len);
            region_with_cap[0].region_info.argsz = reg_info.argsz;
            region_with_cap[0].region_info.index = index;
            // SAFETY: the buffer was sized for the argsz the kernel reported
            // and the return value is checked.
            let ret = unsafe {
                ioctl_with_mut_ref(
                    device,
                    VFIO_DEVICE_GET_REGION_INFO(),
                    &mut (region_with_cap[0].region_info),
                )
            };
            if ret < 0 {
                return Err(VfioError::GetRegionInfo(index, io::Error::last_os_error()));
            }

            region.flags = region_with_cap[0].region_info.flags;
            region.size = region_with_cap[0].region_info.size;
            region.offset = region_with_cap[0].region_info.offset;
            region.sparse_areas = Self::decode_sparse_caps(&region_with_cap);
        }

        Ok(region)
    }

    fn decode_sparse_caps(region_with_cap: &[vfio_region_info_with_cap]) -> Vec<SparseMmapArea> {
        let mut areas = Vec::new();
        let info_ptr = region_with_cap.as_ptr() as *const u8;
        let mut next = region_with_cap[0].region_info.cap_offset as usize;

        while next != 0 {
            // SAFETY: cap_offset and every `next` link point inside the
            // buffer the kernel just filled, and each capability begins with
            // a vfio_info_cap_header.
            let header = unsafe { &*(info_ptr.add(next) as *const vfio_info_cap_header) };
            if u32::from(header.id) == VFIO_REGION_INFO_CAP_SPARSE_MMAP {
                // SAFETY: a sparse-mmap capability is guaranteed to hold
                // nr_areas entries contiguous with its header.
                let sparse = unsafe {
                    &*(info_ptr.add(next) as *const vfio_region_info_cap_sparse_mmap)
                };
                let mmap_areas =
                    unsafe { std::slice::from_raw_parts(sparse.areas.as_ptr(), sparse.nr_areas as usize) };
                for area in mmap_areas {
                    areas.push(SparseMmapArea {
                        offset: area.offset,
                        size: area.size,
                    });
                }
            }
            next = header.next as usize;
        }

        areas
    }

    /// Queries one IRQ index.
    pub fn irq_info(&self, index: u32) -> Result<IrqInfo> {
        let device = self.fd()?;
        let mut irq_info = vfio_irq_info {
            argsz: mem::size_of::<vfio_irq_info>() as u32,
            flags: 0,
            index,
            count: 0,
        };
        // SAFETY: we own the device fd and irq_info is a properly sized
        // struct the kernel fills in.
        let ret = unsafe { ioctl_with_mut_ref(device, VFIO_DEVICE_GET_IRQ_INFO(), &mut irq_info) };
        if ret < 0 {
            return Err(VfioError::GetIrqInfo(index, io::Error::last_os_error()));
        }

        Ok(IrqInfo {
            index,
            flags: irq_info.flags,
            count: irq_info.count,
        })
    }

    /// Binds one eventfd per interrupt vector of the given index. The kernel
    /// signals the matching eventfd whenever the device raises that vector.
    pub fn enable_irq(&self, index: u32, event_fds: Vec<&EventFd>) -> Result<()> {
        let device = self.fd()?;
        let irq = self.irq_info(index)?;
        if irq.count == 0 || (irq.count as usize) < event_fds.len() {
            return Err(VfioError::IrqCountMismatch(index, irq.count, event_fds.len()));
        }

        let fds_bytes = event_fds.len() * mem::size_of::<u32>();
        let mut irq_set = vec_with_array_field::<vfio_irq_set, u32>(event_fds.len());
        irq_set[0].argsz = (mem::size_of::<vfio_irq_set>() + fds_bytes) as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = event_fds.len() as u32;

        // SAFETY: vec_with_array_field reserved fds_bytes right after the
        // header struct.
        let data = unsafe { irq_set[0].data.as_mut_slice(fds_bytes) };
        for (i, event_fd) in event_fds.iter().enumerate() {
            let start = i * mem::size_of::<u32>();
            LittleEndian::write_u32(
                &mut data[start..start + mem::size_of::<u32>()],
                event_fd.as_raw_fd() as u32,
            );
        }

        // SAFETY: we own the device fd, irq_set was built above, and the
        // return value is checked.
        let ret = unsafe { ioctl_with_ref(device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(VfioError::SetIrqs(index, io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Disables every interrupt of the given index.
    pub fn disable_irq(&self, index: u32) -> Result<()> {
        let device = self.fd()?;
        let mut irq_set = vec_with_array_field::<vfio_irq_set, u32>(0);
        irq_set[0].argsz = mem::size_of::<vfio_irq_set>() as u32;
        irq_set[0].flags = VFIO_IRQ_SET_DATA_NONE | VFIO_IRQ_SET_ACTION_TRIGGER;
        irq_set[0].index = index;
        irq_set[0].start = 0;
        irq_set[0].count = 0;

        // SAFETY: we own the device fd, irq_set was built above, and the
        // return value is checked.
        let ret = unsafe { ioctl_with_ref(device, VFIO_DEVICE_SET_IRQS(), &irq_set[0]) };
        if ret < 0 {
            return Err(VfioError::SetIrqs(index, io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Resets the device, if it advertised the capability.
    pub fn reset(&self) -> Result<()> {
        let device = self.fd()?;
        if !self.info.reset_capable {
            return Err(VfioError::ResetUnsupported);
        }

        // SAFETY: we own the device fd and the ioctl carries no data.
        let ret = unsafe { ioctl(device, VFIO_DEVICE_RESET()) };
        if ret < 0 {
            return Err(VfioError::Reset(io::Error::last_os_error()));
        }

        Ok(())
    }

    /// Closes the device descriptor and returns once the kernel-side
    /// teardown has completed. This is the timed operation of the bench.
    ///
    /// Exactly one release per handle: a second call reports
    /// [`VfioError::DeviceReleased`] instead of silently succeeding, so a
    /// double release in the caller is caught rather than hidden. Errors
    /// from the underlying close are ignored, matching descriptor-drop
    /// semantics; once invoked the call runs to completion, there is no
    /// cancellation.
    pub fn release(&mut self) -> Result<()> {
        let device = self.device.take().ok_or(VfioError::DeviceReleased)?;
        drop(device);

        if let Some(container) = self.group.container() {
            container.device_released(self.group.id());
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fabricate(device: File, group: Arc<VfioGroup>, info: DeviceInfo) -> Self {
        VfioDevice {
            device: Some(device),
            group,
            info,
        }
    }
}

impl Drop for VfioDevice {
    fn drop(&mut self) {
        if self.device.is_some() {
            let _ = self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{IommuType, VfioContainer};
    use vmm_sys_util::tempfile::TempFile;

    fn test_file() -> File {
        TempFile::new().unwrap().as_file().try_clone().unwrap()
    }

    fn test_info(reset_capable: bool) -> DeviceInfo {
        DeviceInfo {
            num_regions: 9,
            num_irqs: 3,
            reset_capable,
            is_pci: true,
        }
    }

    fn attached_device(reset_capable: bool) -> (Arc<VfioContainer>, VfioDevice) {
        let container = Arc::new(VfioContainer::with_file(test_file()));
        let group = Arc::new(VfioGroup::fabricate(12, test_file()));
        group.force_attach(&container);
        container.force_iommu(IommuType::Type1);
        container.device_acquired(12);
        let device = VfioDevice::fabricate(test_file(), group, test_info(reset_capable));
        (container, device)
    }

    #[test]
    fn test_release_rejects_double_release() {
        let (container, mut device) = attached_device(false);
        assert_eq!(container.open_devices_in(12), 1);

        device.release().unwrap();
        assert_eq!(container.open_devices_in(12), 0);

        assert!(matches!(device.release(), Err(VfioError::DeviceReleased)));
        assert_eq!(container.open_devices_in(12), 0);
    }

    #[test]
    fn test_released_handle_rejects_operations() {
        let (_container, mut device) = attached_device(true);
        device.release().unwrap();

        assert!(matches!(device.info(), Err(VfioError::DeviceReleased)));
        assert!(matches!(device.reset(), Err(VfioError::DeviceReleased)));
        assert!(matches!(
            device.region_info(0),
            Err(VfioError::DeviceReleased)
        ));
        assert!(matches!(device.irq_info(0), Err(VfioError::DeviceReleased)));
        assert!(matches!(
            device.disable_irq(0),
            Err(VfioError::DeviceReleased)
        ));
    }

    #[test]
    fn test_reset_requires_capability() {
        let (_container, device) = attached_device(false);
        assert!(matches!(device.reset(), Err(VfioError::ResetUnsupported)));
    }

    #[test]
    fn test_drop_fixes_accounting() {
        let (container, device) = attached_device(false);
        assert_eq!(container.open_devices_in(12), 1);
        drop(device);
        assert_eq!(container.open_devices_in(12), 0);
    }

    #[test]
    fn test_cached_info() {
        let (_container, device) = attached_device(true);
        let info = device.info().unwrap();
        assert_eq!(info, test_info(true));
        // Cached values do not change between queries.
        assert_eq!(device.info().unwrap(), info);
    }
}
