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

//! Recursive dataset mounter. The kernel's list-next iterator is cookie
//! driven and rewrites the envelope's name field with each child it
//! returns, so the walk snapshots the parent name length and cookie
//! before descending and restores both for the next-sibling request.
//! Anything mounted before a failure stays mounted, matching Unix mount
//! semantics; there is no rollback.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::info;
use nix::errno::Errno;
use nix::mount::{self, MsFlags};
use nix::sys::stat::Mode;
use nix::unistd;

use crate::ioctl::{DstBuf, ZfsCmd, ZfsHandle, ZfsIoc, CONFIG_BUF_MINSIZE};
use crate::nvlist::NvList;

const MNTTYPE_ZFS: &str = "zfs";

const ZFS_KEYSTATUS_UNAVAILABLE: u64 = 1;
const ZFS_CANMOUNT_OFF: u64 = 0;

const PROP_KEYSTATUS: &str = "keystatus";
const PROP_CANMOUNT: &str = "canmount";
const PROP_REDACTED: &str = "redacted";
const PROP_ZONED: &str = "zoned";
const PROP_MOUNTPOINT: &str = "mountpoint";
const PROP_VALUE: &str = "value";
const PROP_SOURCE: &str = "source";

/// Source marker of properties set by a received stream.
const SOURCE_RECEIVED: &str = "$recvd";

const MOUNTPOINT_NONE: &str = "none";
const MOUNTPOINT_LEGACY: &str = "legacy";

/// What the property check decided for one dataset. Children are walked
/// either way.
#[derive(Debug, PartialEq, Eq)]
enum MountAction {
    Mount(PathBuf),
    Skip,
}

/// Mount the pool's root dataset and every mountable descendant,
/// depth-first.
pub fn mount_pool(zfs: &ZfsHandle, pool: &str, alt_root: Option<&str>) -> Result<()> {
    let mut zc = ZfsCmd::new();
    let mut dst = DstBuf::new(CONFIG_BUF_MINSIZE);
    zc.set_name(pool)?;

    // Reload the root dataset stats so the freshly loaded key state is
    // observed.
    let stats = load_stats(zfs, ZfsIoc::ObjsetStats, &mut zc, &mut dst, pool.len())?
        .with_context(|| format!("dataset \"{}\" does not exist", pool))?;
    apply(pool, &stats, alt_root)?;

    mount_children(zfs, &mut zc, &mut dst, pool.len(), alt_root)
}

fn apply(dataset: &str, stats: &NvList, alt_root: Option<&str>) -> Result<()> {
    match plan_dataset(dataset, stats, alt_root)? {
        MountAction::Mount(mountpoint) => {
            prepare_mountpoint(&mountpoint)?;
            mount_dataset(dataset, &mountpoint)
        }
        MountAction::Skip => Ok(()),
    }
}

fn mount_children(
    zfs: &ZfsHandle,
    zc: &mut ZfsCmd,
    dst: &mut DstBuf,
    parent_len: usize,
    alt_root: Option<&str>,
) -> Result<()> {
    while let Some(stats) = load_stats(zfs, ZfsIoc::DatasetListNext, zc, dst, parent_len)? {
        let dataset = zc.name()?.to_string();
        apply(&dataset, &stats, alt_root)?;

        // descend with a fresh cookie, then restore this level's
        // iterator state for the next sibling
        let cookie = zc.zc_cookie;
        zc.zc_cookie = 0;
        mount_children(zfs, zc, dst, dataset.len(), alt_root)?;
        zc.zc_cookie = cookie;
        zc.truncate_name(parent_len);
    }
    Ok(())
}

/// One iterator step. `Ok(None)` is the normal end of a parent's child
/// list. On ENOMEM the kernel has already advanced the envelope, so the
/// retry restores the parent name and the sibling cookie first.
fn load_stats(
    zfs: &ZfsHandle,
    ioc: ZfsIoc,
    zc: &mut ZfsCmd,
    dst: &mut DstBuf,
    parent_len: usize,
) -> Result<Option<NvList>> {
    let cookie = zc.zc_cookie;
    zc.reset_objset_stats();
    let result = zfs.command_resizing(ioc, zc, dst, |zc| {
        zc.zc_cookie = cookie;
        zc.truncate_name(parent_len);
    });
    match result {
        Ok(()) => {
            let stats = NvList::unpack(dst.bytes(zc.zc_nvlist_dst_size))
                .context("unpacking dataset stats")?;
            Ok(Some(stats))
        }
        Err(Errno::ESRCH) => Ok(None),
        Err(Errno::ENOENT) => bail!("listing datasets: the underlying dataset has been removed"),
        Err(e) => bail!("listing datasets: {}", e),
    }
}

/// Decide whether a dataset gets mounted and where. The checks run in a
/// fixed order so the most specific refusal wins.
fn plan_dataset(dataset: &str, stats: &NvList, alt_root: Option<&str>) -> Result<MountAction> {
    let keystatus = stats
        .get_list(PROP_KEYSTATUS)
        .with_context(|| format!("dataset \"{}\" has no keystatus property", dataset))?;
    let keystatus = keystatus
        .get_u64(PROP_VALUE)
        .with_context(|| format!("dataset \"{}\" has no keystatus value", dataset))?;
    if keystatus == ZFS_KEYSTATUS_UNAVAILABLE {
        bail!("dataset \"{}\" requires a key that isn't loaded", dataset);
    }

    if let Some(canmount) = stats.get_list(PROP_CANMOUNT) {
        let canmount = canmount
            .get_u64(PROP_VALUE)
            .with_context(|| format!("dataset \"{}\" has no canmount value", dataset))?;
        if canmount == ZFS_CANMOUNT_OFF {
            return Ok(MountAction::Skip);
        }
    }

    if stats.contains(PROP_REDACTED) {
        bail!(
            "dataset \"{}\" is redacted, which this importer does not support",
            dataset
        );
    }

    if let Some(zoned) = stats.get_list(PROP_ZONED) {
        let zoned = zoned
            .get_u64(PROP_VALUE)
            .with_context(|| format!("dataset \"{}\" has no zoned value", dataset))?;
        if zoned != 0 {
            bail!(
                "dataset \"{}\" is zoned, which this importer does not support",
                dataset
            );
        }
    }

    let mountpoint = stats
        .get_list(PROP_MOUNTPOINT)
        .with_context(|| format!("dataset \"{}\" has no mountpoint property", dataset))?;
    let value = mountpoint
        .get_string(PROP_VALUE)
        .with_context(|| format!("dataset \"{}\" has no mountpoint value", dataset))?;
    if value == MOUNTPOINT_NONE {
        return Ok(MountAction::Skip);
    }
    if value == MOUNTPOINT_LEGACY {
        bail!(
            "dataset \"{}\" uses the unsupported \"legacy\" mountpoint",
            dataset
        );
    }
    let source = mountpoint
        .get_string(PROP_SOURCE)
        .with_context(|| format!("dataset \"{}\" has no mountpoint source", dataset))?;
    if source == SOURCE_RECEIVED {
        bail!(
            "dataset \"{}\" has a received mountpoint, which this importer does not support",
            dataset
        );
    }

    // the mountpoint is inherited from `source`; the rest of the dataset
    // name maps below it
    let suffix = match dataset.strip_prefix(source) {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => bail!(
            "mountpoint source \"{}\" for dataset \"{}\" is corrupted",
            source,
            dataset
        ),
    };
    let mut path = String::with_capacity(value.len() + suffix.len());
    if let Some(alt_root) = alt_root {
        path.push_str(alt_root);
    }
    path.push_str(value);
    path.push_str(suffix);
    Ok(MountAction::Mount(PathBuf::from(path)))
}

/// Create the mountpoint directory, mode 0755, parents included. A
/// pre-existing directory must be empty.
fn prepare_mountpoint(path: &Path) -> Result<()> {
    let mode = Mode::from_bits_truncate(0o755);
    let mut prefix = PathBuf::new();
    let mut created = false;
    for component in path.components() {
        prefix.push(component);
        if matches!(component, Component::RootDir | Component::CurDir) {
            continue;
        }
        created = match unistd::mkdir(&prefix, mode) {
            Ok(()) => true,
            Err(Errno::EEXIST) => false,
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("creating mount directory {}", prefix.display()))
            }
        };
    }
    if !created {
        let mut entries = fs::read_dir(path)
            .with_context(|| format!("checking mount directory {}", path.display()))?;
        if entries.next().is_some() {
            bail!("mount directory {} is not empty", path.display());
        }
    }
    Ok(())
}

fn mount_dataset(dataset: &str, mountpoint: &Path) -> Result<()> {
    mount::mount::<str, Path, str, str>(
        Some(dataset),
        mountpoint,
        Some(MNTTYPE_ZFS),
        MsFlags::empty(),
        None,
    )
    .with_context(|| format!("mounting dataset \"{}\" on {}", dataset, mountpoint.display()))?;
    info!("dataset \"{}\" mounted at {}", dataset, mountpoint.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvlist::NvValue;

    fn envelope(value: NvValue, source: &str) -> NvList {
        let mut env = NvList::new();
        env.add(PROP_VALUE, value);
        env.add_string(PROP_SOURCE, source);
        env
    }

    /// Stats for a healthy mountable dataset inheriting from pool "p".
    fn stats() -> NvList {
        let mut stats = NvList::new();
        stats.add_list(PROP_KEYSTATUS, envelope(NvValue::Uint64(2), "p"));
        stats.add_list(PROP_CANMOUNT, envelope(NvValue::Uint64(1), "p"));
        stats.add_list(PROP_ZONED, envelope(NvValue::Uint64(0), "p"));
        stats.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String("/mnt/p".into()), "p"),
        );
        stats
    }

    #[test]
    fn inherited_mountpoint_maps_the_suffix() {
        assert_eq!(
            plan_dataset("p", &stats(), None).unwrap(),
            MountAction::Mount(PathBuf::from("/mnt/p"))
        );
        assert_eq!(
            plan_dataset("p/a/x", &stats(), None).unwrap(),
            MountAction::Mount(PathBuf::from("/mnt/p/a/x"))
        );
    }

    #[test]
    fn alternate_root_is_prepended() {
        assert_eq!(
            plan_dataset("p/a", &stats(), Some("/sysroot")).unwrap(),
            MountAction::Mount(PathBuf::from("/sysroot/mnt/p/a"))
        );
    }

    #[test]
    fn local_mountpoint_ignores_the_prefix() {
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String("/var/data".into()), "p/a"),
        );
        assert_eq!(
            plan_dataset("p/a", &s, None).unwrap(),
            MountAction::Mount(PathBuf::from("/var/data"))
        );
    }

    #[test]
    fn canmount_off_skips_but_is_not_fatal() {
        let mut s = stats();
        s.add_list(PROP_CANMOUNT, envelope(NvValue::Uint64(ZFS_CANMOUNT_OFF), "p"));
        assert_eq!(plan_dataset("p/a", &s, None).unwrap(), MountAction::Skip);
    }

    #[test]
    fn unavailable_key_is_fatal() {
        let mut s = stats();
        s.add_list(
            PROP_KEYSTATUS,
            envelope(NvValue::Uint64(ZFS_KEYSTATUS_UNAVAILABLE), "p"),
        );
        assert!(plan_dataset("p/a", &s, None).is_err());
    }

    #[test]
    fn missing_keystatus_is_fatal() {
        let mut s = stats();
        s.remove(PROP_KEYSTATUS);
        assert!(plan_dataset("p/a", &s, None).is_err());
    }

    #[test]
    fn redacted_and_zoned_are_fatal() {
        let mut s = stats();
        s.add_list(PROP_REDACTED, NvList::new());
        assert!(plan_dataset("p/a", &s, None).is_err());

        let mut s = stats();
        s.add_list(PROP_ZONED, envelope(NvValue::Uint64(1), "p"));
        assert!(plan_dataset("p/a", &s, None).is_err());
    }

    #[test]
    fn mountpoint_none_skips() {
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String(MOUNTPOINT_NONE.into()), "p"),
        );
        assert_eq!(plan_dataset("p/a", &s, None).unwrap(), MountAction::Skip);
    }

    #[test]
    fn mountpoint_legacy_is_fatal() {
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String(MOUNTPOINT_LEGACY.into()), "p"),
        );
        assert!(plan_dataset("p/a", &s, None).is_err());
    }

    #[test]
    fn received_mountpoint_is_fatal() {
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String("/mnt/p".into()), SOURCE_RECEIVED),
        );
        assert!(plan_dataset("p/a", &s, None).is_err());
    }

    #[test]
    fn corrupt_inheritance_source_is_fatal() {
        // not a prefix at all
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String("/mnt/q".into()), "q"),
        );
        assert!(plan_dataset("p/a", &s, None).is_err());

        // prefix, but not on a component boundary
        let mut s = stats();
        s.add_list(
            PROP_MOUNTPOINT,
            envelope(NvValue::String("/mnt".into()), "p/ab"),
        );
        assert!(plan_dataset("p/abc", &s, None).is_err());
    }

    #[test]
    fn prepare_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        prepare_mountpoint(&target).unwrap();
        assert!(target.is_dir());
        // created directories are empty, so preparing again still works
        prepare_mountpoint(&target).unwrap();
    }

    #[test]
    fn prepare_rejects_populated_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("stale"), b"x").unwrap();
        assert!(prepare_mountpoint(&target).is_err());
    }

    #[test]
    fn prepare_accepts_existing_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("mnt");
        fs::create_dir(&target).unwrap();
        prepare_mountpoint(&target).unwrap();
    }
}
