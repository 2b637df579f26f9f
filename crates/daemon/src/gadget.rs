//! configfs gadget provisioning and FunctionFS mounting
//!
//! Each piece of kernel state is owned by a guard that undoes it on drop:
//! [`Gadget`] removes the configfs tree, [`UdcBinding`] unbinds the UDC and
//! [`FunctionFsMount`] unmounts. Drop them in reverse order of creation.
//!
//! Removal goes through [`ConfigFs`]. configfs drops attribute files and
//! default groups together with their directory, which a plain filesystem
//! does not, so tests substitute a double that behaves like configfs.

use crate::config::GadgetSettings;
use crate::error::{DaemonError, Result};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Filesystem type passed to mount(2)
pub const FUNCTIONFS_TYPE: &str = "functionfs";

const LANG_DIR: &str = "0x409";
const CONFIG_DIR: &str = "c.1";

fn gadget_err(path: &Path) -> impl FnOnce(io::Error) -> DaemonError + '_ {
    move |source| DaemonError::Gadget {
        path: path.to_path_buf(),
        source,
    }
}

fn write_attr(dir: &Path, name: &str, value: &str) -> Result<()> {
    let path = dir.join(name);
    debug!("{} <- {}", path.display(), value);
    fs::write(&path, value).map_err(gadget_err(&path))
}

fn make_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(gadget_err(path))
}

/// Removal primitives for a configfs tree
pub trait ConfigFs {
    /// Remove a symlink between groups
    fn remove_link(&self, path: &Path) -> io::Result<()>;

    /// Remove a group directory
    fn remove_dir(&self, path: &Path) -> io::Result<()>;
}

/// The kernel's configfs mount
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelConfigFs;

impl ConfigFs for KernelConfigFs {
    fn remove_link(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir(path)
    }
}

/// A composite gadget with one FunctionFS function in one configuration
#[derive(Debug)]
pub struct Gadget<F: ConfigFs = KernelConfigFs> {
    dir: PathBuf,
    instance: String,
    configfs: F,
}

impl Gadget {
    /// Create the gadget tree under `<configfs_root>/usb_gadget/<name>`
    ///
    /// A leftover gadget of the same name is removed first.
    pub fn create(settings: &GadgetSettings) -> Result<Self> {
        Self::create_with(settings, KernelConfigFs)
    }
}

impl<F: ConfigFs> Gadget<F> {
    pub fn create_with(settings: &GadgetSettings, configfs: F) -> Result<Self> {
        let dir = settings
            .configfs_root
            .join("usb_gadget")
            .join(&settings.name);

        if dir.exists() {
            warn!("Removing stale gadget at {}", dir.display());
            remove_gadget_tree(&configfs, &dir).map_err(gadget_err(&dir))?;
        }

        info!("Creating gadget at {}", dir.display());
        make_dir(&dir)?;

        // Own the directory from here on so a failure below tears it down.
        let gadget = Self {
            dir,
            instance: settings.name.clone(),
            configfs,
        };
        gadget.populate(settings)?;
        Ok(gadget)
    }

    fn populate(&self, settings: &GadgetSettings) -> Result<()> {
        let dir = &self.dir;
        write_attr(dir, "idVendor", &format!("{:#06x}", settings.vendor_id))?;
        write_attr(dir, "idProduct", &format!("{:#06x}", settings.product_id))?;
        write_attr(dir, "bcdUSB", &format!("{:#06x}", settings.bcd_usb))?;
        write_attr(dir, "bcdDevice", &format!("{:#06x}", settings.bcd_device))?;
        write_attr(dir, "bMaxPacketSize0", &settings.max_packet_size0.to_string())?;

        let strings = dir.join("strings").join(LANG_DIR);
        make_dir(&strings)?;
        write_attr(&strings, "serialnumber", &settings.serial_number)?;
        write_attr(&strings, "manufacturer", &settings.manufacturer)?;
        write_attr(&strings, "product", &settings.product)?;

        let function = self.function_dir();
        make_dir(&function)?;

        let config = dir.join("configs").join(CONFIG_DIR);
        let config_strings = config.join("strings").join(LANG_DIR);
        make_dir(&config_strings)?;
        write_attr(&config_strings, "configuration", &settings.configuration)?;

        let link = config.join(self.function_name());
        symlink(&function, &link).map_err(gadget_err(&link))?;

        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Instance name given to mount(2) as the FunctionFS source
    pub fn function_instance(&self) -> &str {
        &self.instance
    }

    fn function_name(&self) -> String {
        format!("ffs.{}", self.instance)
    }

    fn function_dir(&self) -> PathBuf {
        self.dir.join("functions").join(self.function_name())
    }

    /// Bind the gadget to a USB device controller
    ///
    /// Only valid once descriptors have been written to ep0, otherwise the
    /// kernel refuses the bind.
    pub fn enable(&self, udc: &str) -> Result<UdcBinding> {
        let path = self.dir.join("UDC");
        info!("Binding gadget to UDC {}", udc);
        fs::write(&path, udc).map_err(gadget_err(&path))?;
        Ok(UdcBinding { path })
    }
}

impl<F: ConfigFs> Drop for Gadget<F> {
    fn drop(&mut self) {
        debug!("Removing gadget at {}", self.dir.display());
        if let Err(e) = remove_gadget_tree(&self.configfs, &self.dir) {
            warn!("Failed to remove gadget {}: {}", self.dir.display(), e);
        }
    }
}

/// Tear down a gadget tree in the order configfs requires
///
/// Links first, then configurations, functions, strings and the gadget
/// itself. Attribute files and default groups vanish with their directory,
/// so only user-created groups and symlinks are removed.
pub fn remove_gadget_tree<F: ConfigFs>(configfs: &F, dir: &Path) -> io::Result<()> {
    let udc = dir.join("UDC");
    if udc.exists() {
        let _ = fs::write(&udc, "");
    }

    for config in subdirs(&dir.join("configs"))? {
        for entry in fs::read_dir(&config)? {
            let path = entry?.path();
            if path.is_symlink() {
                configfs.remove_link(&path)?;
            }
        }
        for lang in subdirs(&config.join("strings"))? {
            configfs.remove_dir(&lang)?;
        }
        configfs.remove_dir(&config)?;
    }

    for function in subdirs(&dir.join("functions"))? {
        configfs.remove_dir(&function)?;
    }

    for lang in subdirs(&dir.join("strings"))? {
        configfs.remove_dir(&lang)?;
    }

    configfs.remove_dir(dir)
}

fn subdirs(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() && !path.is_symlink() {
            dirs.push(path);
        }
    }
    Ok(dirs)
}

/// Gadget bound to a UDC; unbinds on drop
#[derive(Debug)]
pub struct UdcBinding {
    path: PathBuf,
}

impl Drop for UdcBinding {
    fn drop(&mut self) {
        info!("Unbinding gadget from UDC");
        if let Err(e) = fs::write(&self.path, "") {
            warn!("Failed to unbind UDC: {}", e);
        }
    }
}

/// A mounted FunctionFS instance; unmounts on drop
#[derive(Debug)]
pub struct FunctionFsMount {
    target: PathBuf,
    created_dir: bool,
}

impl FunctionFsMount {
    /// Mount FunctionFS instance `instance` at `target`, creating the
    /// directory if needed
    pub fn mount(instance: &str, target: &Path) -> Result<Self> {
        let mount_err = |source: io::Error| DaemonError::Mount {
            path: target.to_path_buf(),
            source,
        };

        let created_dir = match fs::create_dir(target) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => false,
            Err(e) => return Err(mount_err(e)),
        };

        debug!("Mounting functionfs {} at {}", instance, target.display());
        if let Err(errno) = mount(
            Some(instance),
            target,
            Some(FUNCTIONFS_TYPE),
            MsFlags::empty(),
            None::<&str>,
        ) {
            if created_dir {
                let _ = fs::remove_dir(target);
            }
            return Err(mount_err(io::Error::from(errno)));
        }

        Ok(Self {
            target: target.to_path_buf(),
            created_dir,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }
}

impl Drop for FunctionFsMount {
    fn drop(&mut self) {
        debug!("Unmounting {}", self.target.display());
        if let Err(e) = umount2(&self.target, MntFlags::empty()) {
            debug!("Unmount failed, trying lazy unmount: {}", e);
            if let Err(e) = umount2(&self.target, MntFlags::MNT_DETACH) {
                warn!("Failed to unmount {}: {}", self.target.display(), e);
                return;
            }
        }

        if self.created_dir {
            let _ = fs::remove_dir(&self.target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingConfigFs, Removal};
    use tempfile::TempDir;

    fn settings(root: &Path) -> GadgetSettings {
        GadgetSettings {
            configfs_root: root.to_path_buf(),
            ..GadgetSettings::default()
        }
    }

    fn read(path: PathBuf) -> String {
        fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_create_writes_identity() {
        let root = TempDir::new().unwrap();
        let configfs = RecordingConfigFs::new();
        let gadget = Gadget::create_with(&settings(root.path()), configfs.clone()).unwrap();
        let dir = gadget.dir().to_path_buf();

        assert_eq!(dir, root.path().join("usb_gadget/usbpipe"));
        assert_eq!(read(dir.join("idVendor")), "0x0456");
        assert_eq!(read(dir.join("idProduct")), "0xb672");
        assert_eq!(read(dir.join("bcdUSB")), "0x0200");
        assert_eq!(read(dir.join("bMaxPacketSize0")), "64");
        assert_eq!(read(dir.join("strings/0x409/product")), "M2K");
        assert_eq!(
            read(dir.join("configs/c.1/strings/0x409/configuration")),
            "M2K IIO"
        );

        let link = dir.join("configs/c.1/ffs.usbpipe");
        assert!(link.is_symlink());
        assert_eq!(
            fs::read_link(&link).unwrap(),
            dir.join("functions/ffs.usbpipe")
        );
        assert_eq!(gadget.function_instance(), "usbpipe");
        assert!(configfs.removals().is_empty());

        drop(gadget);
        assert!(!dir.exists());
        assert_eq!(
            configfs.removals(),
            vec![
                Removal::Link(link),
                Removal::Dir(dir.join("configs/c.1/strings/0x409")),
                Removal::Dir(dir.join("configs/c.1")),
                Removal::Dir(dir.join("functions/ffs.usbpipe")),
                Removal::Dir(dir.join("strings/0x409")),
                Removal::Dir(dir.clone()),
            ]
        );
    }

    #[test]
    fn test_enable_writes_udc() {
        let root = TempDir::new().unwrap();
        let configfs = RecordingConfigFs::new();
        let gadget = Gadget::create_with(&settings(root.path()), configfs.clone()).unwrap();
        let dir = gadget.dir().to_path_buf();
        let udc = dir.join("UDC");

        let binding = gadget.enable("musb-hdrc.0").unwrap();
        assert_eq!(read(udc.clone()), "musb-hdrc.0");

        drop(binding);
        assert_eq!(read(udc), "");

        drop(gadget);
        assert!(!dir.exists());
        assert_eq!(configfs.removals().last(), Some(&Removal::Dir(dir)));
    }

    #[test]
    fn test_create_replaces_stale_gadget() {
        let root = TempDir::new().unwrap();
        let configfs = RecordingConfigFs::new();
        let stale = Gadget::create_with(&settings(root.path()), configfs.clone()).unwrap();
        fs::write(stale.dir().join("idVendor"), "0xdead").unwrap();
        // Simulates a previous run that died without tearing down
        std::mem::forget(stale);

        let gadget = Gadget::create_with(&settings(root.path()), configfs.clone()).unwrap();
        assert_eq!(read(gadget.dir().join("idVendor")), "0x0456");
        assert_eq!(configfs.removals().len(), 6);
    }

    #[test]
    fn test_config_with_link_cannot_be_removed() {
        let root = TempDir::new().unwrap();
        let configfs = RecordingConfigFs::new();
        let gadget = Gadget::create_with(&settings(root.path()), configfs.clone()).unwrap();
        let config = gadget.dir().join("configs/c.1");

        let err = configfs.remove_dir(&config).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::DirectoryNotEmpty);
        assert!(config.is_dir());
    }
}
