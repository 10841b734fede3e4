// Copyright © 2024 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use vfio_bindings::bindings::vfio::*;
use vmm_sys_util::ioctl::{ioctl_with_mut_ref, ioctl_with_ptr, ioctl_with_ref};

use crate::address::PciAddress;
use crate::container::VfioContainer;
use crate::device::VfioDevice;
use crate::ioctls::*;
use crate::{Result, VfioError};

/// Snapshot of a group's kernel-side state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupStatus {
    /// All member devices are bound to the passthrough subsystem.
    pub viable: bool,
    /// The group is currently attached to some container.
    pub container_set: bool,
}

/// Handle on an IOMMU isolation group, opened from `/dev/vfio/<id>`.
///
/// A group attaches to at most one container at a time and hands out device
/// descriptors only while attached with an IOMMU backend selected.
pub struct VfioGroup {
    id: u32,
    group: File,
    container: Mutex<Option<Arc<VfioContainer>>>,
}

impl VfioGroup {
    /// Maps a PCI device address to its isolation-group id by following the
    /// device's `iommu_group` topology link.
    pub fn resolve(address: &PciAddress) -> Result<u32> {
        let sysfs_path = address.sysfs_path();
        if !sysfs_path.exists() {
            return Err(VfioError::DeviceNotFound(*address));
        }

        let link = sysfs_path.join("iommu_group");
        let target = link
            .read_link()
            .map_err(|e| VfioError::NoIommuGroup(*address, e))?;
        target
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.parse::<u32>().ok())
            .ok_or(VfioError::ParseGroupId(target))
    }

    /// Opens the group's control node.
    pub fn open(id: u32) -> Result<Self> {
        let group_path = Path::new("/dev/vfio").join(id.to_string());
        let group = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&group_path)
            .map_err(|e| VfioError::OpenGroup(id, e))?;

        Ok(VfioGroup {
            id,
            group,
            container: Mutex::new(None),
        })
    }

    /// The platform-assigned group id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queries the group's viability and attachment flags.
    pub fn status(&self) -> Result<GroupStatus> {
        let mut group_status = vfio_group_status {
            argsz: mem::size_of::<vfio_group_status>() as u32,
            flags: 0,
        };
        // SAFETY: we own the group fd and group_status is a properly sized
        // struct the kernel fills in.
        let ret =
            unsafe { ioctl_with_mut_ref(&self.group, VFIO_GROUP_GET_STATUS(), &mut group_status) };
        if ret < 0 {
            return Err(VfioError::GetGroupStatus(self.id, io::Error::last_os_error()));
        }

        Ok(GroupStatus {
            viable: group_status.flags & VFIO_GROUP_FLAGS_VIABLE != 0,
            container_set: group_status.flags & VFIO_GROUP_FLAGS_CONTAINER_SET != 0,
        })
    }

    /// Attaches this group to `container`.
    ///
    /// Refused while the group is not viable or already attached; a group
    /// belongs to exactly one container and re-attachment requires a prior
    /// [`detach`](VfioGroup::detach).
    pub fn attach(&self, container: &Arc<VfioContainer>) -> Result<()> {
        let status = self.status()?;
        if !status.viable {
            return Err(VfioError::GroupNotViable(self.id));
        }

        let mut slot = self.container.lock().unwrap();
        if slot.is_some() || status.container_set {
            return Err(VfioError::GroupAlreadyAttached(self.id));
        }

        let container_raw_fd = container.as_raw_fd();
        // SAFETY: we own the group fd, the container fd outlives the call,
        // and the return value is checked.
        let ret =
            unsafe { ioctl_with_ref(&self.group, VFIO_GROUP_SET_CONTAINER(), &container_raw_fd) };
        if ret < 0 {
            return Err(VfioError::GroupSetContainer(
                self.id,
                io::Error::last_os_error(),
            ));
        }

        container.group_attached(self.id);
        *slot = Some(Arc::clone(container));
        debug!("group {} attached to container", self.id);
        Ok(())
    }

    /// Detaches this group from its container.
    ///
    /// Refused while device handles sourced from this group remain open.
    /// If this was the container's last attached group, the container's
    /// IOMMU backend selection is discarded along with all address-space
    /// state; callers must not assume the backend persists across group
    /// churn.
    pub fn detach(&self) -> Result<()> {
        let mut slot = self.container.lock().unwrap();
        let container = slot.as_ref().ok_or(VfioError::GroupNotAttached(self.id))?;

        let open = container.open_devices_in(self.id);
        if open > 0 {
            return Err(VfioError::GroupBusy(self.id, open));
        }

        let container_raw_fd = container.as_raw_fd();
        // SAFETY: we own the group fd, the container fd outlives the call,
        // and the return value is checked.
        let ret =
            unsafe { ioctl_with_ref(&self.group, VFIO_GROUP_UNSET_CONTAINER(), &container_raw_fd) };
        if ret < 0 {
            return Err(VfioError::GroupUnsetContainer(
                self.id,
                io::Error::last_os_error(),
            ));
        }

        container.group_detached(self.id);
        *slot = None;
        debug!("group {} detached from container", self.id);
        Ok(())
    }

    /// Requests a fresh device descriptor for `name` from this group.
    ///
    /// The group must be attached to a container with an IOMMU backend
    /// already selected. Each call returns an independent handle; whether a
    /// second acquisition of the same device succeeds is up to the
    /// underlying resource, which reports busy through the descriptor
    /// request itself.
    pub fn get_device(self: &Arc<Self>, name: &str) -> Result<VfioDevice> {
        let slot = self.container.lock().unwrap();
        let container = slot.as_ref().ok_or(VfioError::GroupNotAttached(self.id))?;
        if container.iommu_type().is_none() {
            return Err(VfioError::IommuNotSet);
        }

        let path = CString::new(name.as_bytes())
            .map_err(|_| VfioError::InvalidDeviceName(name.to_owned()))?;
        // SAFETY: we own the group fd and the name pointer is valid for the
        // duration of the call.
        let fd = unsafe { ioctl_with_ptr(&self.group, VFIO_GROUP_GET_DEVICE_FD(), path.as_ptr()) };
        if fd < 0 {
            return Err(VfioError::GetDeviceFd(
                self.id,
                name.to_owned(),
                io::Error::last_os_error(),
            ));
        }

        // SAFETY: the kernel just handed us this fd and nothing else owns it.
        let device = unsafe { File::from_raw_fd(fd) };

        let device = VfioDevice::new(device, Arc::clone(self))?;
        container.device_acquired(self.id);
        Ok(device)
    }

    pub(crate) fn container(&self) -> Option<Arc<VfioContainer>> {
        self.container.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn fabricate(id: u32, group: File) -> Self {
        VfioGroup {
            id,
            group,
            container: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn force_attach(&self, container: &Arc<VfioContainer>) {
        container.group_attached(self.id);
        *self.container.lock().unwrap() = Some(Arc::clone(container));
    }
}

impl AsRawFd for VfioGroup {
    fn as_raw_fd(&self) -> RawFd {
        self.group.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::IommuType;
    use vmm_sys_util::tempfile::TempFile;

    fn test_file() -> File {
        TempFile::new().unwrap().as_file().try_clone().unwrap()
    }

    fn test_container() -> Arc<VfioContainer> {
        Arc::new(VfioContainer::with_file(test_file()))
    }

    #[test]
    fn test_resolve_unknown_device() {
        let address: PciAddress = "ffff:ff:1f.7".parse().unwrap();
        assert!(matches!(
            VfioGroup::resolve(&address),
            Err(VfioError::DeviceNotFound(a)) if a == address
        ));
    }

    #[test]
    fn test_get_device_requires_attachment() {
        let group = Arc::new(VfioGroup::fabricate(12, test_file()));
        assert!(matches!(
            group.get_device("0000:01:00.0"),
            Err(VfioError::GroupNotAttached(12))
        ));
    }

    #[test]
    fn test_get_device_requires_backend() {
        let group = Arc::new(VfioGroup::fabricate(12, test_file()));
        let container = test_container();
        group.force_attach(&container);
        assert!(matches!(
            group.get_device("0000:01:00.0"),
            Err(VfioError::IommuNotSet)
        ));
    }

    #[test]
    fn test_detach_refused_while_devices_open() {
        let group = Arc::new(VfioGroup::fabricate(12, test_file()));
        let container = test_container();
        group.force_attach(&container);
        container.device_acquired(12);

        assert!(matches!(
            group.detach(),
            Err(VfioError::GroupBusy(12, 1))
        ));

        // The busy check is client side; the handle count going to zero is
        // what unblocks the detach path (the ioctl itself then needs a real
        // group fd, which a fabricated file cannot provide).
        container.device_released(12);
        assert_eq!(container.open_devices_in(12), 0);
    }

    #[test]
    fn test_detach_without_attachment() {
        let group = VfioGroup::fabricate(12, test_file());
        assert!(matches!(
            group.detach(),
            Err(VfioError::GroupNotAttached(12))
        ));
    }

    #[test]
    fn test_device_name_validation() {
        let group = Arc::new(VfioGroup::fabricate(12, test_file()));
        let container = test_container();
        group.force_attach(&container);
        container.force_iommu(IommuType::Type1);

        assert!(matches!(
            group.get_device("bad\0name"),
            Err(VfioError::InvalidDeviceName(_))
        ));
    }
}
