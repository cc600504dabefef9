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

//! The mount launcher. Everything identifying the pool is baked in at
//! build time; the binary takes no arguments, logs to the daemon
//! facility and exits non-zero on the first failure. The token helper
//! that talks to the smartcard leaves the 32-byte KEK at a well-known
//! path, which is consumed (and removed) on startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{anyhow, bail, Context, Result};
use log::error;

use libbootmount::import::import_pool;
use libbootmount::ioctl::ZfsHandle;
use libbootmount::key::load_key;
use libbootmount::keywrap::{unwrap_key, Block256};
use libbootmount::logger;
use libbootmount::mount::mount_pool;

// Compiled-in pool identity, from the build environment.
const POOL_NAME: Option<&str> = option_env!("POOL_NAME");
const POOL_GUID: Option<&str> = option_env!("POOL_GUID");
const POOL_VDEVS: Option<&str> = option_env!("POOL_VDEVS");
const POOL_KEYS: Option<&str> = option_env!("POOL_KEYS");
const KEK_PATH: Option<&str> = option_env!("KEK_PATH");

const DEFAULT_KEK_PATH: &str = "/run/zpool-bootmount/kek";

struct LauncherConfig {
    pool_name: String,
    pool_guid: u64,
    vdevs: Vec<PathBuf>,
    /// Encryption roots with their wrapped keys, in load order.
    keys: Vec<(String, Block256)>,
    kek_path: PathBuf,
}

impl LauncherConfig {
    fn from_build() -> Result<Self> {
        let pool_name = POOL_NAME
            .context("POOL_NAME was not compiled in")?
            .to_string();
        let pool_guid = parse_guid(POOL_GUID.context("POOL_GUID was not compiled in")?)?;
        let vdevs = parse_vdev_list(POOL_VDEVS.context("POOL_VDEVS was not compiled in")?)?;
        let keys = parse_wrapped_keys(POOL_KEYS.unwrap_or(""))?;
        Ok(Self {
            pool_name,
            pool_guid,
            vdevs,
            keys,
            kek_path: PathBuf::from(KEK_PATH.unwrap_or(DEFAULT_KEK_PATH)),
        })
    }
}

fn parse_guid(text: &str) -> Result<u64> {
    let text = text.trim();
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    }
    .with_context(|| format!("POOL_GUID \"{}\" is not a valid pool guid", text))
}

/// The vdev list is separated like PATH; NUL separators from the C-era
/// build scripts are accepted too.
fn parse_vdev_list(text: &str) -> Result<Vec<PathBuf>> {
    let vdevs: Vec<PathBuf> = text
        .split(|c| c == ':' || c == '\0')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    if vdevs.is_empty() {
        bail!("POOL_VDEVS lists no devices");
    }
    Ok(vdevs)
}

/// `dataset=<64 hex digits>`, comma separated.
fn parse_wrapped_keys(text: &str) -> Result<Vec<(String, Block256)>> {
    let mut keys = Vec::new();
    for entry in text.split(',').filter(|e| !e.is_empty()) {
        let (dataset, wrapped) = entry
            .split_once('=')
            .with_context(|| format!("malformed wrapped-key entry \"{}\"", entry))?;
        let bytes = hex::decode(wrapped)
            .with_context(|| format!("wrapped key for \"{}\" is not valid hex", dataset))?;
        let wrapped: Block256 = bytes.as_slice().try_into().map_err(|_| {
            anyhow!(
                "wrapped key for \"{}\" must be 32 bytes, got {}",
                dataset,
                bytes.len()
            )
        })?;
        keys.push((dataset.to_string(), wrapped));
    }
    Ok(keys)
}

/// Fixed contract with the out-of-process token helper: it derives the
/// KEK from the smartcard and leaves the raw 32 bytes at `path`. The
/// handoff file is consumed so the KEK does not outlive the import.
fn acquire_kek(path: &Path) -> Result<Block256> {
    let bytes =
        fs::read(path).with_context(|| format!("reading KEK from {}", path.display()))?;
    let kek: Block256 = bytes.as_slice().try_into().map_err(|_| {
        anyhow!(
            "KEK at {} must be 32 bytes, got {}",
            path.display(),
            bytes.len()
        )
    })?;
    if let Err(e) = fs::remove_file(path) {
        log::warn!("failed to remove KEK file {}: {}", path.display(), e);
    }
    Ok(kek)
}

fn run() -> Result<()> {
    let config = LauncherConfig::from_build()?;
    let kek = acquire_kek(&config.kek_path)?;

    let zfs = ZfsHandle::open()?;
    import_pool(&zfs, &config.vdevs, &config.pool_name, config.pool_guid)?;
    for (dataset, wrapped) in &config.keys {
        let key = unwrap_key(wrapped, &kek);
        load_key(&zfs, dataset, &key)?;
    }
    mount_pool(&zfs, &config.pool_name, None)?;
    Ok(())
}

fn main() {
    if logger::init().is_err() {
        eprintln!("failed to install syslog logger");
    }
    if let Err(e) = run() {
        error!("{:#}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guid_accepts_decimal_and_hex() {
        assert_eq!(parse_guid("123456789").unwrap(), 123456789);
        assert_eq!(parse_guid("0xdeadbeef").unwrap(), 0xdeadbeef);
        assert!(parse_guid("tank").is_err());
        assert!(parse_guid("").is_err());
    }

    #[test]
    fn vdev_list_separators() {
        assert_eq!(
            parse_vdev_list("/dev/sda1:/dev/sdb1").unwrap(),
            vec![PathBuf::from("/dev/sda1"), PathBuf::from("/dev/sdb1")]
        );
        assert_eq!(
            parse_vdev_list("/dev/sda1\0/dev/sdb1\0").unwrap(),
            vec![PathBuf::from("/dev/sda1"), PathBuf::from("/dev/sdb1")]
        );
        assert!(parse_vdev_list("").is_err());
        assert!(parse_vdev_list("::").is_err());
    }

    #[test]
    fn wrapped_key_parsing() {
        let hex64 = "00".repeat(32);
        let keys = parse_wrapped_keys(&format!("tank={},tank/home={}", hex64, hex64)).unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0].0, "tank");
        assert_eq!(keys[1].0, "tank/home");
        assert_eq!(parse_wrapped_keys("").unwrap(), vec![]);

        assert!(parse_wrapped_keys("tank").is_err());
        assert!(parse_wrapped_keys("tank=xyz").is_err());
        assert!(parse_wrapped_keys("tank=00ff").is_err());
    }

    #[test]
    fn kek_handoff_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kek");
        fs::write(&path, [7u8; 32]).unwrap();
        assert_eq!(acquire_kek(&path).unwrap(), [7u8; 32]);
        assert!(!path.exists());
        assert!(acquire_kek(&path).is_err());

        fs::write(&path, [7u8; 16]).unwrap();
        assert!(acquire_kek(&path).is_err());
    }
}
