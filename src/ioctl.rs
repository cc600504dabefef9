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

//! The ioctl surface of the kernel ZFS driver. The command envelope is
//! the driver's fixed-layout `zfs_cmd` structure; only the name, guid,
//! cookie, objset-stats and packed-descriptor fields matter to the
//! import engine, but the legacy tail has to be present bit-exact for
//! the kernel's copy-in to land on the right offsets.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;

pub const ZFS_DEV: &str = "/dev/zfs";

/// Floor for kernel-filled descriptor buffers.
pub const CONFIG_BUF_MINSIZE: usize = 262144;

/// Bound on the grow-and-retry loop; the kernel reports the required
/// size on ENOMEM, so one retry normally suffices.
const MAX_GROW_RETRIES: usize = 8;

const MAXPATHLEN: usize = 4096;
const MAXNAMELEN: usize = 256;

const ZFS_IOC_FIRST: libc::c_ulong = (b'Z' as libc::c_ulong) << 8;

/// The driver commands the import engine issues, by their offset in the
/// kernel's linear ioctl enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZfsIoc {
    PoolImport,
    PoolTryimport,
    ObjsetStats,
    DatasetListNext,
    LoadKey,
}

impl ZfsIoc {
    fn request(self) -> libc::c_ulong {
        let offset = match self {
            ZfsIoc::PoolImport => 2,
            ZfsIoc::PoolTryimport => 6,
            ZfsIoc::ObjsetStats => 18,
            ZfsIoc::DatasetListNext => 20,
            ZfsIoc::LoadKey => 73,
        };
        ZFS_IOC_FIRST + offset
    }
}

#[repr(C)]
pub struct ZfsShare {
    pub z_exportdata: u64,
    pub z_sharedata: u64,
    pub z_sharetype: u64,
    pub z_sharemax: u64,
}

#[repr(C)]
pub struct DmuObjsetStats {
    pub dds_num_clones: u64,
    pub dds_creation_txg: u64,
    pub dds_guid: u64,
    pub dds_type: i32,
    pub dds_is_snapshot: u8,
    pub dds_inconsistent: u8,
    pub dds_redacted: u8,
    pub dds_origin: [u8; MAXNAMELEN],
}

#[repr(C)]
pub struct DrrBegin {
    pub drr_magic: u64,
    pub drr_versioninfo: u64,
    pub drr_creation_time: u64,
    pub drr_type: i32,
    pub drr_flags: u32,
    pub drr_toguid: u64,
    pub drr_fromguid: u64,
    pub drr_toname: [u8; MAXNAMELEN],
}

#[repr(C)]
pub struct ZinjectRecord {
    pub zi_objset: u64,
    pub zi_object: u64,
    pub zi_start: u64,
    pub zi_end: u64,
    pub zi_guid: u64,
    pub zi_level: u32,
    pub zi_error: u32,
    pub zi_type: u64,
    pub zi_freq: u32,
    pub zi_failfast: u32,
    pub zi_func: [u8; MAXNAMELEN],
    pub zi_iotype: u32,
    pub zi_duration: i32,
    pub zi_timer: u64,
    pub zi_nlanes: u64,
    pub zi_cmd: u32,
    pub zi_dvas: u32,
}

#[repr(C)]
pub struct ZfsStat {
    pub zs_gen: u64,
    pub zs_mode: u64,
    pub zs_links: u64,
    pub zs_ctime: [u64; 2],
}

/// `zfs_cmd`, the envelope of every legacy-style driver ioctl. Pointer
/// fields are u64 regardless of word size.
#[repr(C)]
pub struct ZfsCmd {
    pub zc_name: [u8; MAXPATHLEN],
    pub zc_nvlist_src: u64,
    pub zc_nvlist_src_size: u64,
    pub zc_nvlist_dst: u64,
    pub zc_nvlist_dst_size: u64,
    pub zc_nvlist_dst_filled: i32,
    pub zc_pad2: i32,
    pub zc_history: u64,
    pub zc_value: [u8; 2 * MAXPATHLEN],
    pub zc_string: [u8; MAXNAMELEN],
    pub zc_guid: u64,
    pub zc_nvlist_conf: u64,
    pub zc_nvlist_conf_size: u64,
    pub zc_cookie: u64,
    pub zc_objset_type: u64,
    pub zc_perm_action: u64,
    pub zc_history_len: u64,
    pub zc_history_offset: u64,
    pub zc_obj: u64,
    pub zc_iflags: u64,
    pub zc_share: ZfsShare,
    pub zc_objset_stats: DmuObjsetStats,
    pub zc_begin_record: DrrBegin,
    pub zc_inject_record: ZinjectRecord,
    pub zc_defer_destroy: u32,
    pub zc_flags: u32,
    pub zc_action_handle: u64,
    pub zc_cleanup_fd: i32,
    pub zc_simple: u8,
    pub zc_pad: [u8; 3],
    pub zc_sendobj: u64,
    pub zc_fromobj: u64,
    pub zc_createtxg: u64,
    pub zc_stat: ZfsStat,
    pub zc_zoneid: u64,
}

impl ZfsCmd {
    /// A zero-initialised envelope. Boxed; the structure is ~14 KiB.
    pub fn new() -> Box<Self> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    pub fn set_name(&mut self, name: &str) -> Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() >= MAXPATHLEN {
            bail!("name \"{}\" does not fit the command envelope", name);
        }
        self.zc_name[..bytes.len()].copy_from_slice(bytes);
        self.zc_name[bytes.len()..].fill(0);
        Ok(())
    }

    /// The current name field; the kernel rewrites it with the child
    /// name during dataset iteration.
    pub fn name(&self) -> Result<&str> {
        let nul = match self.zc_name.iter().position(|b| *b == 0) {
            Some(p) => p,
            None => bail!("unterminated name in command envelope"),
        };
        std::str::from_utf8(&self.zc_name[..nul]).context("envelope name is not UTF-8")
    }

    /// Cut the name back to a saved parent length after a descent.
    pub fn truncate_name(&mut self, len: usize) {
        if len < MAXPATHLEN {
            self.zc_name[len] = 0;
        }
    }

    pub fn reset_objset_stats(&mut self) {
        self.zc_objset_stats = unsafe { std::mem::zeroed() };
    }
}

/// Kernel-filled output buffer attached to an envelope's dst fields. The
/// allocation survives across calls and only grows.
pub struct DstBuf {
    buf: Vec<u8>,
}

impl DstBuf {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The leading `len` bytes, as reported back by the kernel.
    pub fn bytes(&self, len: u64) -> &[u8] {
        &self.buf[..(len as usize).min(self.buf.len())]
    }

    fn attach(&mut self, zc: &mut ZfsCmd) {
        zc.zc_nvlist_dst = self.buf.as_mut_ptr() as u64;
        zc.zc_nvlist_dst_size = self.buf.len() as u64;
    }

    fn grow(&mut self, size: usize) {
        self.buf = vec![0; size.max(self.buf.len())];
    }
}

/// Exclusive handle on the kernel ZFS control device.
pub struct ZfsHandle {
    dev: File,
}

impl ZfsHandle {
    pub fn open() -> Result<Self> {
        let dev = OpenOptions::new()
            .read(true)
            .write(true)
            .open(ZFS_DEV)
            .with_context(|| format!("opening {}", ZFS_DEV))?;
        Ok(Self { dev })
    }

    /// Issue a command, reporting failure as the raw errno value. The
    /// driver extends the errno space past the named constants (e.g. for
    /// crypto errors), so the value must not be folded into `Errno`.
    pub fn raw_command(&self, ioc: ZfsIoc, zc: &mut ZfsCmd) -> std::result::Result<(), i32> {
        let res = unsafe { libc::ioctl(self.dev.as_raw_fd(), ioc.request(), zc as *mut ZfsCmd) };
        if res == -1 {
            Err(std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO))
        } else {
            Ok(())
        }
    }

    pub fn command(&self, ioc: ZfsIoc, zc: &mut ZfsCmd) -> std::result::Result<(), Errno> {
        self.raw_command(ioc, zc).map_err(Errno::from_i32)
    }

    /// Issue a command whose output descriptor lands in `dst`, growing
    /// the buffer to the kernel-reported size on ENOMEM. `restore` puts
    /// envelope fields the kernel may already have rewritten (iterator
    /// name and cookie) back before the retry.
    pub fn command_resizing(
        &self,
        ioc: ZfsIoc,
        zc: &mut ZfsCmd,
        dst: &mut DstBuf,
        restore: impl FnMut(&mut ZfsCmd),
    ) -> std::result::Result<(), Errno> {
        resize_loop(zc, dst, |zc| self.command(ioc, zc), restore)
    }
}

pub(crate) fn resize_loop<C, R>(
    zc: &mut ZfsCmd,
    dst: &mut DstBuf,
    mut call: C,
    mut restore: R,
) -> std::result::Result<(), Errno>
where
    C: FnMut(&mut ZfsCmd) -> std::result::Result<(), Errno>,
    R: FnMut(&mut ZfsCmd),
{
    for _ in 0..MAX_GROW_RETRIES {
        dst.attach(zc);
        match call(zc) {
            Err(Errno::ENOMEM) => {
                // the kernel wrote the required size into the envelope
                let required = zc.zc_nvlist_dst_size as usize;
                dst.grow(required);
                restore(zc);
            }
            other => return other,
        }
    }
    Err(Errno::ENOMEM)
}
