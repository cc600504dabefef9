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

//! Pool configuration reconstructor. The label copies collected from the
//! member disks each describe one top-level vdev slot plus the pool-wide
//! scalars as of the transaction group the copy was written in. This
//! module arbitrates between the redundant copies (highest txg wins per
//! slot, so a stale disk re-inserted after a txg-advancing event can
//! never outvote a fresher one), fills declared hole slots and absent
//! slots with placeholders, and synthesizes the single descriptor the
//! kernel's try-import call expects.

use anyhow::{anyhow, bail, Context, Result};
use log::warn;

use crate::label::DeviceLabels;
use crate::nvlist::{NvList, NvValue};

pub const POOL_STATE_ACTIVE: u64 = 0;
pub const POOL_STATE_EXPORTED: u64 = 1;
pub const POOL_STATE_SPARE: u64 = 3;
pub const POOL_STATE_L2CACHE: u64 = 4;

pub const VDEV_TYPE_ROOT: &str = "root";
pub const VDEV_TYPE_HOLE: &str = "hole";
pub const VDEV_TYPE_MISSING: &str = "missing";

pub const CONFIG_VERSION: &str = "version";
pub const CONFIG_POOL_GUID: &str = "pool_guid";
pub const CONFIG_POOL_NAME: &str = "name";
pub const CONFIG_POOL_STATE: &str = "state";
pub const CONFIG_POOL_TXG: &str = "pool_txg";
pub const CONFIG_HOSTID: &str = "hostid";
pub const CONFIG_HOSTNAME: &str = "hostname";
pub const CONFIG_VDEV_CHILDREN: &str = "vdev_children";
pub const CONFIG_HOLE_ARRAY: &str = "hole_array";
pub const CONFIG_VDEV_TREE: &str = "vdev_tree";
pub const CONFIG_COMMENT: &str = "comment";
pub const CONFIG_COMPATIBILITY: &str = "compatibility";
pub const CONFIG_LOAD_INFO: &str = "load_info";
pub const CONFIG_MMP_STATE: &str = "mmp_state";
pub const CONFIG_ID: &str = "id";
pub const CONFIG_GUID: &str = "guid";
pub const CONFIG_CHILDREN: &str = "children";
pub const CONFIG_TYPE: &str = "type";

/// Upper bound on slot indices we are willing to materialize; anything
/// beyond this is label corruption, not a real pool.
const MAX_VDEV_CHILDREN: u64 = 1 << 16;

struct SlotCandidate {
    txg: u64,
    tree: NvList,
}

/// Synthesize the pool descriptor for the try-import call from the label
/// candidates of all member devices. Fails if any surviving copy is a
/// spare or cache member or belongs to a different pool.
pub fn reconstruct_pool_config(
    devices: Vec<DeviceLabels>,
    pool_name: &str,
    pool_guid: u64,
) -> Result<NvList> {
    // Slot table, keyed by top-level vdev id. The full descriptor with
    // the highest txg overall becomes the template for pool-wide scalars.
    let mut slots: Vec<Option<SlotCandidate>> = Vec::new();
    let mut template: Option<(u64, NvList)> = None;

    for device in devices {
        let path = device.path;
        for candidate in device.configs {
            let txg = candidate.txg;
            let mut config = candidate.config;

            let state = config
                .get_u64(CONFIG_POOL_STATE)
                .with_context(|| format!("label on {} has no pool state", path.display()))?;
            if state == POOL_STATE_SPARE || state == POOL_STATE_L2CACHE {
                bail!(
                    "device {} is a spare or level-2 cache member, not a pool vdev",
                    path.display()
                );
            }
            let name = config
                .get_string(CONFIG_POOL_NAME)
                .with_context(|| format!("label on {} has no pool name", path.display()))?;
            if name != pool_name {
                bail!(
                    "device {} is a member of pool \"{}\", not \"{}\"",
                    path.display(),
                    name,
                    pool_name
                );
            }
            let guid = config
                .get_u64(CONFIG_POOL_GUID)
                .with_context(|| format!("label on {} has no pool guid", path.display()))?;
            if guid != pool_guid {
                bail!(
                    "device {} is a member of pool {:#018x}, not {:#018x}",
                    path.display(),
                    guid,
                    pool_guid
                );
            }

            let tree = match config.remove(CONFIG_VDEV_TREE) {
                Some(NvValue::List(tree)) => tree,
                _ => bail!("label on {} has no vdev tree", path.display()),
            };
            let id = tree
                .get_u64(CONFIG_ID)
                .with_context(|| format!("vdev tree on {} has no slot id", path.display()))?;
            if id >= MAX_VDEV_CHILDREN {
                bail!("vdev slot id {} on {} is out of range", id, path.display());
            }
            let id = id as usize;

            if slots.len() <= id {
                slots.resize_with(id + 1, || None);
            }
            let fresher = match &slots[id] {
                Some(current) => txg > current.txg,
                None => true,
            };
            if fresher {
                slots[id] = Some(SlotCandidate { txg, tree });
            }
            let newest = match &template {
                Some((best, _)) => txg > *best,
                None => true,
            };
            if newest {
                template = Some((txg, config));
            }
        }
    }

    let (_, template) = template
        .ok_or_else(|| anyhow!("no usable vdev label found for pool \"{}\"", pool_name))?;

    let mut pool = NvList::new();
    let version = template
        .get_u64(CONFIG_VERSION)
        .context("newest label has no pool version")?;
    pool.add_u64(CONFIG_VERSION, version);
    pool.add_u64(CONFIG_POOL_GUID, pool_guid);
    pool.add_string(CONFIG_POOL_NAME, pool_name);
    if let Some(comment) = template.get_string(CONFIG_COMMENT) {
        pool.add_string(CONFIG_COMMENT, comment);
    }
    if let Some(compatibility) = template.get_string(CONFIG_COMPATIBILITY) {
        pool.add_string(CONFIG_COMPATIBILITY, compatibility);
    }
    let state = template
        .get_u64(CONFIG_POOL_STATE)
        .context("newest label has no pool state")?;
    pool.add_u64(CONFIG_POOL_STATE, state);
    if let Some(hostid) = template.get_u64(CONFIG_HOSTID) {
        pool.add_u64(CONFIG_HOSTID, hostid);
    }
    if let Some(hostname) = template.get_string(CONFIG_HOSTNAME) {
        pool.add_string(CONFIG_HOSTNAME, hostname);
    }
    let holes = template
        .get_u64_array(CONFIG_HOLE_ARRAY)
        .map(<[u64]>::to_vec)
        .unwrap_or_default();
    if !holes.is_empty() {
        pool.add_u64_array(CONFIG_HOLE_ARRAY, &holes);
    }
    let vdev_children = template
        .get_u64(CONFIG_VDEV_CHILDREN)
        .context("newest label has no vdev_children")?;
    if vdev_children == 0 || vdev_children > MAX_VDEV_CHILDREN {
        bail!("implausible vdev_children {}", vdev_children);
    }
    pool.add_u64(CONFIG_VDEV_CHILDREN, vdev_children);
    let vdev_children = vdev_children as usize;
    if slots.len() < vdev_children {
        slots.resize_with(vdev_children, || None);
    }

    // Hole slots keep their index so vdev arithmetic stays stable; each
    // one gets its own placeholder carrying its own id.
    for &hole in &holes {
        if hole >= vdev_children as u64 {
            bail!(
                "hole_array entry {} exceeds vdev_children {}",
                hole,
                vdev_children
            );
        }
        let mut placeholder = NvList::new();
        placeholder.add_string(CONFIG_TYPE, VDEV_TYPE_HOLE);
        placeholder.add_u64(CONFIG_GUID, 0);
        placeholder.add_u64(CONFIG_ID, hole);
        slots[hole as usize] = Some(SlotCandidate {
            txg: 0,
            tree: placeholder,
        });
    }

    // Slots with no surviving disk open the pool degraded, at the
    // operator's risk.
    let mut num_missing = 0;
    let mut children = Vec::with_capacity(vdev_children);
    for slot in slots.drain(..).take(vdev_children) {
        match slot {
            Some(candidate) => children.push(candidate.tree),
            None => {
                num_missing += 1;
                let mut placeholder = NvList::new();
                placeholder.add_string(CONFIG_TYPE, VDEV_TYPE_MISSING);
                placeholder.add_u64(CONFIG_GUID, 0);
                children.push(placeholder);
            }
        }
    }
    if num_missing > 0 {
        warn!(
            "{} top-level vdevs of pool \"{}\" are missing",
            num_missing, pool_name
        );
    }

    let mut root = NvList::new();
    root.add_list_array(CONFIG_CHILDREN, children);
    root.add_string(CONFIG_TYPE, VDEV_TYPE_ROOT);
    root.add_u64(CONFIG_ID, 0);
    root.add_u64(CONFIG_GUID, pool_guid);
    pool.add_list(CONFIG_VDEV_TREE, root);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::LabelConfig;
    use std::path::PathBuf;

    const POOL: &str = "tank";
    const GUID: u64 = 0xdeadbeefcafef00d;

    fn label(txg: u64, slot: u64, vdev_guid: u64, vdev_children: u64) -> LabelConfig {
        let mut tree = NvList::new();
        tree.add_string(CONFIG_TYPE, "disk");
        tree.add_u64(CONFIG_ID, slot);
        tree.add_u64(CONFIG_GUID, vdev_guid);
        let mut config = NvList::new();
        config.add_u64(CONFIG_VERSION, 5000);
        config.add_string(CONFIG_POOL_NAME, POOL);
        config.add_u64(CONFIG_POOL_GUID, GUID);
        config.add_u64(CONFIG_POOL_TXG, txg);
        config.add_u64(CONFIG_POOL_STATE, POOL_STATE_ACTIVE);
        config.add_u64(CONFIG_VDEV_CHILDREN, vdev_children);
        config.add_list(CONFIG_VDEV_TREE, tree);
        LabelConfig { txg, config }
    }

    fn device(name: &str, configs: Vec<LabelConfig>) -> DeviceLabels {
        DeviceLabels {
            path: PathBuf::from(name),
            configs,
        }
    }

    fn child_types(pool: &NvList) -> Vec<String> {
        pool.get_list(CONFIG_VDEV_TREE)
            .unwrap()
            .get_list_array(CONFIG_CHILDREN)
            .unwrap()
            .iter()
            .map(|c| c.get_string(CONFIG_TYPE).unwrap().to_string())
            .collect()
    }

    #[test]
    fn two_disk_mirror_with_stale_copies() {
        let a = device(
            "/dev/a",
            (0..4).map(|_| label(100, 0, 0xa, 2)).collect(),
        );
        let b = device(
            "/dev/b",
            vec![
                label(100, 1, 0xb1, 2),
                label(100, 1, 0xb1, 2),
                label(50, 1, 0xb0, 2),
                label(50, 1, 0xb0, 2),
            ],
        );
        let pool = reconstruct_pool_config(vec![a, b], POOL, GUID).unwrap();

        let tree = pool.get_list(CONFIG_VDEV_TREE).unwrap();
        let children = tree.get_list_array(CONFIG_CHILDREN).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].get_u64(CONFIG_GUID), Some(0xa));
        // the stale txg-50 copies must not win slot 1
        assert_eq!(children[1].get_u64(CONFIG_GUID), Some(0xb1));
        assert!(!child_types(&pool).iter().any(|t| t == VDEV_TYPE_MISSING));
    }

    #[test]
    fn hole_slot_preserved() {
        let mut l0 = label(10, 0, 0xa, 3);
        l0.config.add_u64_array(CONFIG_HOLE_ARRAY, &[1]);
        let mut l2 = label(9, 2, 0xc, 3);
        l2.config.add_u64_array(CONFIG_HOLE_ARRAY, &[1]);
        let pool =
            reconstruct_pool_config(vec![device("/dev/a", vec![l0]), device("/dev/c", vec![l2])], POOL, GUID)
                .unwrap();

        assert_eq!(child_types(&pool), vec!["disk", "hole", "disk"]);
        let hole = &pool
            .get_list(CONFIG_VDEV_TREE)
            .unwrap()
            .get_list_array(CONFIG_CHILDREN)
            .unwrap()[1];
        assert_eq!(hole.get_u64(CONFIG_GUID), Some(0));
        assert_eq!(hole.get_u64(CONFIG_ID), Some(1));
        assert_eq!(pool.get_u64_array(CONFIG_HOLE_ARRAY), Some(&[1u64][..]));
    }

    #[test]
    fn slot_arbitration_picks_highest_txg() {
        let configs = vec![
            label(5, 0, 0x5, 1),
            label(9, 0, 0x9, 1),
            label(7, 0, 0x7, 1),
        ];
        let pool = reconstruct_pool_config(vec![device("/dev/a", configs)], POOL, GUID).unwrap();
        let children = pool
            .get_list(CONFIG_VDEV_TREE)
            .unwrap()
            .get_list_array(CONFIG_CHILDREN)
            .unwrap();
        assert_eq!(children[0].get_u64(CONFIG_GUID), Some(0x9));
    }

    #[test]
    fn slot_arbitration_tie_keeps_first() {
        let configs = vec![label(5, 0, 0xaa, 1), label(5, 0, 0xbb, 1)];
        let pool = reconstruct_pool_config(vec![device("/dev/a", configs)], POOL, GUID).unwrap();
        let children = pool
            .get_list(CONFIG_VDEV_TREE)
            .unwrap()
            .get_list_array(CONFIG_CHILDREN)
            .unwrap();
        assert_eq!(children[0].get_u64(CONFIG_GUID), Some(0xaa));
    }

    #[test]
    fn spare_and_cache_members_abort() {
        for state in [POOL_STATE_SPARE, POOL_STATE_L2CACHE] {
            let mut l = label(1, 0, 0xa, 1);
            l.config.add_u64(CONFIG_POOL_STATE, state);
            assert!(reconstruct_pool_config(vec![device("/dev/a", vec![l])], POOL, GUID).is_err());
        }
    }

    #[test]
    fn foreign_members_abort() {
        let mut wrong_name = label(1, 0, 0xa, 1);
        wrong_name.config.add_string(CONFIG_POOL_NAME, "other");
        assert!(
            reconstruct_pool_config(vec![device("/dev/a", vec![wrong_name])], POOL, GUID).is_err()
        );

        let mut wrong_guid = label(1, 0, 0xa, 1);
        wrong_guid.config.add_u64(CONFIG_POOL_GUID, GUID + 1);
        assert!(
            reconstruct_pool_config(vec![device("/dev/a", vec![wrong_guid])], POOL, GUID).is_err()
        );
    }

    #[test]
    fn absent_slot_becomes_missing_placeholder() {
        let pool =
            reconstruct_pool_config(vec![device("/dev/a", vec![label(3, 0, 0xa, 2)])], POOL, GUID)
                .unwrap();
        let children = pool
            .get_list(CONFIG_VDEV_TREE)
            .unwrap()
            .get_list_array(CONFIG_CHILDREN)
            .unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[1].get_string(CONFIG_TYPE), Some(VDEV_TYPE_MISSING));
        assert_eq!(children[1].get_u64(CONFIG_GUID), Some(0));
    }

    #[test]
    fn every_slot_has_a_type() {
        let mut l = label(3, 4, 0xa, 6);
        l.config.add_u64_array(CONFIG_HOLE_ARRAY, &[2]);
        let pool = reconstruct_pool_config(vec![device("/dev/a", vec![l])], POOL, GUID).unwrap();
        let types = child_types(&pool);
        assert_eq!(types.len(), 6);
        assert_eq!(types[2], VDEV_TYPE_HOLE);
        assert_eq!(types[4], "disk");
        assert!(types.iter().all(|t| !t.is_empty()));
    }

    #[test]
    fn pool_scalars_come_from_newest_label() {
        let mut old = label(10, 0, 0xa, 2);
        old.config.add_string(CONFIG_HOSTNAME, "old-host");
        let mut new = label(20, 1, 0xb, 2);
        new.config.add_string(CONFIG_HOSTNAME, "new-host");
        new.config.add_string(CONFIG_COMMENT, "rack 3");
        new.config.add_u64(CONFIG_HOSTID, 0x1234);

        let pool = reconstruct_pool_config(
            vec![device("/dev/a", vec![old]), device("/dev/b", vec![new])],
            POOL,
            GUID,
        )
        .unwrap();
        assert_eq!(pool.get_string(CONFIG_HOSTNAME), Some("new-host"));
        assert_eq!(pool.get_string(CONFIG_COMMENT), Some("rack 3"));
        assert_eq!(pool.get_u64(CONFIG_HOSTID), Some(0x1234));
        assert_eq!(pool.get_u64(CONFIG_POOL_GUID), Some(GUID));
        assert_eq!(pool.get_string(CONFIG_POOL_NAME), Some(POOL));
        assert_eq!(pool.get_u64(CONFIG_VERSION), Some(5000));
    }

    #[test]
    fn root_node_shape() {
        let pool =
            reconstruct_pool_config(vec![device("/dev/a", vec![label(1, 0, 0xa, 1)])], POOL, GUID)
                .unwrap();
        let root = pool.get_list(CONFIG_VDEV_TREE).unwrap();
        assert_eq!(root.get_string(CONFIG_TYPE), Some(VDEV_TYPE_ROOT));
        assert_eq!(root.get_u64(CONFIG_ID), Some(0));
        assert_eq!(root.get_u64(CONFIG_GUID), Some(GUID));
    }

    #[test]
    fn no_labels_at_all_aborts() {
        assert!(reconstruct_pool_config(vec![device("/dev/a", vec![])], POOL, GUID).is_err());
    }

    #[test]
    fn corrupt_hole_array_aborts() {
        let mut l = label(1, 0, 0xa, 1);
        l.config.add_u64_array(CONFIG_HOLE_ARRAY, &[5]);
        assert!(reconstruct_pool_config(vec![device("/dev/a", vec![l])], POOL, GUID).is_err());
    }

    #[test]
    fn missing_version_aborts() {
        let mut l = label(1, 0, 0xa, 1);
        l.config.remove(CONFIG_VERSION);
        assert!(reconstruct_pool_config(vec![device("/dev/a", vec![l])], POOL, GUID).is_err());
    }
}
