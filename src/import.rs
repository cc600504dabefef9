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

//! Two-phase import handshake. Try-import hands the reconstructed
//! descriptor to the kernel for validation and gets back an enriched
//! copy carrying `load_info`; after checking the pool version, the
//! recorded hostid and the MMP state locally, the enriched descriptor is
//! committed with the import call. Between the phases the kernel does
//! not yet own the pool, so aborting here leaves no state behind.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use log::info;

use crate::ioctl::{DstBuf, ZfsCmd, ZfsHandle, ZfsIoc, CONFIG_BUF_MINSIZE};
use crate::label::read_all_labels;
use crate::nvlist::NvList;
use crate::pool::{
    reconstruct_pool_config, CONFIG_HOSTID, CONFIG_LOAD_INFO, CONFIG_MMP_STATE, CONFIG_POOL_STATE,
    CONFIG_VERSION, POOL_STATE_EXPORTED,
};

pub const SPA_VERSION_BEFORE_FEATURES: u64 = 28;
pub const SPA_VERSION_FEATURES: u64 = 5000;

pub const MMP_STATE_ACTIVE: u64 = 0;
pub const MMP_STATE_INACTIVE: u64 = 1;
pub const MMP_STATE_NO_HOSTID: u64 = 2;

const HOSTID_PATH: &str = "/proc/sys/kernel/spl/hostid";

/// Read the labels of the given member devices, reconstruct the pool
/// configuration and import the pool. After success the kernel owns the
/// pool.
pub fn import_pool(
    zfs: &ZfsHandle,
    vdevs: &[PathBuf],
    pool_name: &str,
    pool_guid: u64,
) -> Result<()> {
    let devices = read_all_labels(vdevs)?;
    let config = reconstruct_pool_config(devices, pool_name, pool_guid)?;
    let packed = config.pack_native();

    let mut zc = ZfsCmd::new();
    zc.zc_nvlist_conf = packed.as_ptr() as u64;
    zc.zc_nvlist_conf_size = packed.len() as u64;
    let mut dst = DstBuf::new(CONFIG_BUF_MINSIZE.max(packed.len() * 32));

    zfs.command_resizing(ZfsIoc::PoolTryimport, &mut zc, &mut dst, |_| {})
        .map_err(|e| anyhow!("try-import of pool \"{}\" failed: {}", pool_name, e))?;
    let enriched = NvList::unpack(dst.bytes(zc.zc_nvlist_dst_size))
        .context("unpacking try-imported pool configuration")?;
    drop(packed);

    validate_loaded_config(&enriched, pool_name, read_hostid)?;

    // the enriched descriptor replaces the reconstruction for the commit
    let packed = enriched.pack_native();
    zc.zc_nvlist_conf = packed.as_ptr() as u64;
    zc.zc_nvlist_conf_size = packed.len() as u64;
    zc.zc_guid = pool_guid;
    zc.set_name(pool_name)?;

    zfs.command_resizing(ZfsIoc::PoolImport, &mut zc, &mut dst, |_| {})
        .map_err(|e| anyhow!("import of pool \"{}\" failed: {}", pool_name, e))?;
    info!("pool \"{}\" imported", pool_name);
    Ok(())
}

fn version_supported(version: u64) -> bool {
    (1..=SPA_VERSION_BEFORE_FEATURES).contains(&version) || version == SPA_VERSION_FEATURES
}

/// Local checks on the enriched descriptor returned by try-import. The
/// hostid is only consulted for exported pools, so `local_hostid` is
/// called lazily.
pub(crate) fn validate_loaded_config<F>(
    config: &NvList,
    pool_name: &str,
    local_hostid: F,
) -> Result<()>
where
    F: FnOnce() -> Result<u64>,
{
    let version = config
        .get_u64(CONFIG_VERSION)
        .context("imported configuration has no version")?;
    if !version_supported(version) {
        bail!(
            "cannot import \"{}\": pool is formatted using unsupported version {}",
            pool_name,
            version
        );
    }

    let load_info = config
        .get_list(CONFIG_LOAD_INFO)
        .context("imported configuration has no load_info")?;
    let state = config
        .get_u64(CONFIG_POOL_STATE)
        .context("imported configuration has no state")?;
    if state == POOL_STATE_EXPORTED {
        // load_info carries the hostid from the object-set label; older
        // kernels only fill the top-level copy.
        let hostid = match load_info.get_u64(CONFIG_HOSTID) {
            Some(id) => id,
            None => config
                .get_u64(CONFIG_HOSTID)
                .context("imported configuration has no hostid")?,
        };
        let local = local_hostid()?;
        if hostid != local {
            bail!(
                "pool \"{}\" was exported on host {:#010x}, not this host ({:#010x}); \
                 use the zpool tool to import it",
                pool_name,
                hostid,
                local
            );
        }
    }

    if let Some(mmp) = load_info.get_u64(CONFIG_MMP_STATE) {
        if mmp != MMP_STATE_INACTIVE {
            bail!(
                "pool \"{}\" has Multi-Modifier Protection enabled, which this importer \
                 does not support",
                pool_name
            );
        }
    }
    Ok(())
}

pub fn read_hostid() -> Result<u64> {
    let text = fs::read_to_string(HOSTID_PATH)
        .with_context(|| format!("reading {}", HOSTID_PATH))?;
    parse_hostid(&text).with_context(|| format!("parsing {}", HOSTID_PATH))
}

fn parse_hostid(text: &str) -> Result<u64> {
    let id = u64::from_str_radix(text.trim(), 16).context("not a hexadecimal hostid")?;
    if id == 0 {
        bail!("hostid is not set");
    }
    Ok(id)
}
