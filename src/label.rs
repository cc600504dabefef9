// Copyright 2026 The zpool-bootmount Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Vdev label reader. Every member disk of a pool carries four copies of
//! its label for redundancy, two at the front of the device and two at
//! the end. Each label embeds a native-encoded configuration descriptor
//! describing the pool and this disk's top-level vdev. We read all four
//! copies of every device and hand the decoded candidates to the
//! reconstructor, which arbitrates between them by transaction group.

use std::alloc::{self, Layout};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::slice;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use log::warn;

use crate::nvlist::NvList;
use crate::pool::CONFIG_POOL_TXG;

pub const VDEV_LABELS: usize = 4;
pub const VDEV_LABEL_SIZE: u64 = 256 << 10;

const VDEV_PAD_SIZE: usize = 8 << 10;
const VDEV_BOOTENV_SIZE: usize = 8 << 10;
const VDEV_PHYS_OFFSET: usize = VDEV_PAD_SIZE + VDEV_BOOTENV_SIZE;
const VDEV_PHYS_SIZE: usize = 112 << 10;

/// Embedded-checksum trailer at the end of the phys region: 8-byte magic
/// followed by a 256-bit checksum.
const ZEC_SIZE: usize = 40;
const ZEC_MAGIC: u64 = 0x0210da7ab10c7a11;

/// Smallest device that can be a vdev.
pub const SPA_MINDEVSIZE: u64 = 64 << 20;

/// One decoded label copy.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelConfig {
    pub txg: u64,
    pub config: NvList,
}

/// All valid label copies found on one member device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLabels {
    pub path: PathBuf,
    pub configs: Vec<LabelConfig>,
}

/// Read the labels of every member device, overlapping the per-device
/// I/O. Any I/O failure is fatal to the whole import; the failing run
/// still joins every in-flight read and closes every device before
/// returning.
pub fn read_all_labels(paths: &[PathBuf]) -> Result<Vec<DeviceLabels>> {
    thread::scope(|s| {
        let handles = paths
            .iter()
            .map(|path| (path, s.spawn(move || read_labels(path))))
            .collect::<Vec<_>>();

        let mut devices = Vec::with_capacity(paths.len());
        let mut first_err = None;
        for (path, handle) in handles {
            match handle.join() {
                Ok(Ok(configs)) => devices.push(DeviceLabels {
                    path: path.clone(),
                    configs,
                }),
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    if first_err.is_none() {
                        first_err = Some(anyhow!("label reader for {} panicked", path.display()));
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(devices),
        }
    })
}

/// Read and decode the up to four label copies of a single device. The
/// result may be empty if no copy is valid.
pub fn read_labels(path: &Path) -> Result<Vec<LabelConfig>> {
    let file = open_device(path)?;
    let size = device_size(&file, path)? & !(VDEV_LABEL_SIZE - 1);
    if size < SPA_MINDEVSIZE {
        bail!(
            "device {} is smaller than the {} byte vdev minimum",
            path.display(),
            SPA_MINDEVSIZE
        );
    }

    // Two reads cover all four labels: one for the leading pair, one for
    // the trailing pair.
    let region = 2 * VDEV_LABEL_SIZE as usize;
    let mut buf = AlignedBuf::new(2 * region)?;
    let (front, back) = buf.as_mut_slice().split_at_mut(region);
    file.read_exact_at(front, 0)
        .with_context(|| format!("reading leading labels of {}", path.display()))?;
    file.read_exact_at(back, size - region as u64)
        .with_context(|| format!("reading trailing labels of {}", path.display()))?;

    let mut configs = Vec::new();
    for index in 0..VDEV_LABELS {
        let base = index * VDEV_LABEL_SIZE as usize;
        let phys = &buf.as_slice()[base + VDEV_PHYS_OFFSET..base + VDEV_PHYS_OFFSET + VDEV_PHYS_SIZE];
        let trailer = &phys[VDEV_PHYS_SIZE - ZEC_SIZE..];
        let magic = u64::from_le_bytes(trailer[..8].try_into().unwrap());
        if magic != ZEC_MAGIC {
            continue;
        }

        // TODO: verify the trailer checksum and demote mismatches

        let config = match NvList::unpack(&phys[..VDEV_PHYS_SIZE - ZEC_SIZE]) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let txg = config.get_u64(CONFIG_POOL_TXG).with_context(|| {
            format!("label {} on {} has no pool_txg", index, path.display())
        })?;
        configs.push(LabelConfig { txg, config });
    }

    if configs.is_empty() {
        warn!("no valid vdev label found on {}", path.display());
    }
    Ok(configs)
}

fn open_device(path: &Path) -> Result<File> {
    // Prefer direct I/O; fall back to the page cache where the kernel
    // rejects it.
    match OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_DIRECT | libc::O_CLOEXEC)
        .open(path)
    {
        Ok(f) => Ok(f),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .with_context(|| format!("opening {}", path.display())),
        Err(e) => Err(e).with_context(|| format!("opening {}", path.display())),
    }
}

fn device_size(file: &File, path: &Path) -> Result<u64> {
    let meta = file
        .metadata()
        .with_context(|| format!("getting metadata for {}", path.display()))?;
    let file_type = meta.file_type();
    if file_type.is_file() {
        return Ok(meta.len());
    }
    if !std::os::unix::fs::FileTypeExt::is_block_device(&file_type) {
        bail!("{} is not a block device or regular file", path.display());
    }

    let fd = file.as_raw_fd();
    let mut size: libc::size_t = 0;
    match unsafe { ioctl::blkgetsize64(fd, &mut size) } {
        Ok(_) => Ok(size as u64),
        Err(e) => {
            Err(anyhow!(e)).with_context(|| format!("getting size of {}", path.display()))
        }
    }
}

// create unsafe ioctl wrappers
#[allow(clippy::missing_safety_doc)]
mod ioctl {
    use nix::ioctl_read;
    ioctl_read!(blkgetsize64, 0x12, 114, libc::size_t);
}

/// Page-aligned read buffer; direct I/O requires sector alignment of the
/// memory as well as the file offset.
struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(len: usize) -> Result<Self> {
        let align = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            n if n > 0 => n as usize,
            _ => 4096,
        };
        let layout = Layout::from_size_align(len, align)
            .map_err(|e| anyhow!("label buffer layout: {}", e))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            bail!("failed to allocate {} byte label buffer", len);
        }
        Ok(Self { ptr, layout })
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.ptr, self.layout.size()) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr, self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEV_SIZE: u64 = SPA_MINDEVSIZE;

    fn label_offset(index: usize, dev_size: u64) -> u64 {
        if index < 2 {
            index as u64 * VDEV_LABEL_SIZE
        } else {
            dev_size - (VDEV_LABELS - index) as u64 * VDEV_LABEL_SIZE
        }
    }

    fn sample_config(txg: u64) -> NvList {
        let mut tree = NvList::new();
        tree.add_string("type", "disk");
        tree.add_u64("id", 0);
        tree.add_u64("guid", 42);
        let mut config = NvList::new();
        config.add_u64("version", 5000);
        config.add_string("name", "tank");
        config.add_u64("pool_guid", 7);
        config.add_u64("pool_txg", txg);
        config.add_u64("state", 1);
        config.add_u64("vdev_children", 1);
        config.add_list("vdev_tree", tree);
        config
    }

    fn write_label(file: &File, index: usize, config: Option<&NvList>) {
        let base = label_offset(index, DEV_SIZE);
        if let Some(config) = config {
            let packed = config.pack_native();
            file.write_all_at(&packed, base + VDEV_PHYS_OFFSET as u64)
                .unwrap();
        }
        let magic_off = base + (VDEV_PHYS_OFFSET + VDEV_PHYS_SIZE - ZEC_SIZE) as u64;
        file.write_all_at(&ZEC_MAGIC.to_le_bytes(), magic_off).unwrap();
    }

    fn scratch_device() -> tempfile::NamedTempFile {
        let f = tempfile::NamedTempFile::new().unwrap();
        f.as_file().set_len(DEV_SIZE).unwrap();
        f
    }

    #[test]
    fn reads_valid_copies() {
        let dev = scratch_device();
        write_label(dev.as_file(), 0, Some(&sample_config(100)));
        write_label(dev.as_file(), 3, Some(&sample_config(50)));

        let configs = read_labels(dev.path()).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].txg, 100);
        assert_eq!(configs[1].txg, 50);
        assert_eq!(configs[0].config.get_string("name"), Some("tank"));
    }

    #[test]
    fn ignores_bad_magic_and_garbage() {
        let dev = scratch_device();
        // copy 0: no magic at all
        // copy 1: magic but undecodable descriptor
        let base = label_offset(1, DEV_SIZE);
        dev.as_file()
            .write_all_at(&[0xff; 64], base + VDEV_PHYS_OFFSET as u64)
            .unwrap();
        write_label(dev.as_file(), 1, None);

        let configs = read_labels(dev.path()).unwrap();
        assert!(configs.is_empty());
    }

    #[test]
    fn rejects_small_device() {
        let dev = tempfile::NamedTempFile::new().unwrap();
        dev.as_file().set_len(SPA_MINDEVSIZE / 2).unwrap();
        assert!(read_labels(dev.path()).is_err());
    }

    #[test]
    fn missing_txg_is_fatal() {
        let dev = scratch_device();
        let mut config = sample_config(1);
        config.remove("pool_txg");
        write_label(dev.as_file(), 0, Some(&config));
        assert!(read_labels(dev.path()).is_err());
    }

    #[test]
    fn gathers_all_devices() {
        let a = scratch_device();
        let b = scratch_device();
        write_label(a.as_file(), 0, Some(&sample_config(10)));
        write_label(b.as_file(), 2, Some(&sample_config(20)));

        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let devices = read_all_labels(&paths).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].path, paths[0]);
        assert_eq!(devices[0].configs[0].txg, 10);
        assert_eq!(devices[1].configs[0].txg, 20);
    }

    #[test]
    fn open_failure_is_fatal_for_the_batch() {
        let a = scratch_device();
        write_label(a.as_file(), 0, Some(&sample_config(10)));
        let paths = vec![
            a.path().to_path_buf(),
            PathBuf::from("/nonexistent/vdev"),
        ];
        assert!(read_all_labels(&paths).is_err());
    }
}
