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

//! Dataset key loader. Hands an unwrapped 32-byte key to the kernel for
//! an encryption root; descendants inherit it unless they define their
//! own.

use anyhow::{Context, Result};
use log::info;
use thiserror::Error;

use crate::ioctl::{ZfsCmd, ZfsHandle, ZfsIoc};
use crate::nvlist::NvList;

/// Driver errno for an unsupported encryption suite, from the extended
/// error range past the system constants.
pub const ZFS_ERR_CRYPTO_NOTSUP: i32 = 1048;

/// Why the kernel refused a key, one distinct reason per driver code.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid parameters provided")]
    InvalidParameters,
    #[error("key already loaded")]
    AlreadyLoaded,
    #[error("dataset is busy")]
    Busy,
    #[error("incorrect key provided")]
    IncorrectKey,
    #[error("dataset uses an unsupported encryption suite")]
    UnsupportedSuite,
    #[error("unknown error {0}")]
    Unknown(i32),
}

impl KeyError {
    pub fn from_code(code: i32) -> Self {
        match code {
            libc::EPERM => KeyError::PermissionDenied,
            libc::EINVAL => KeyError::InvalidParameters,
            libc::EEXIST => KeyError::AlreadyLoaded,
            libc::EBUSY => KeyError::Busy,
            libc::EACCES => KeyError::IncorrectKey,
            ZFS_ERR_CRYPTO_NOTSUP => KeyError::UnsupportedSuite,
            other => KeyError::Unknown(other),
        }
    }
}

/// Load the key for an encryption-root dataset.
pub fn load_key(zfs: &ZfsHandle, encryption_root: &str, key: &[u8; 32]) -> Result<()> {
    let mut hidden = NvList::new();
    hidden.add_u8_array("wkeydata", key);
    let mut args = NvList::new();
    args.add_list("hidden_args", hidden);
    let packed = args.pack_native();

    let mut zc = ZfsCmd::new();
    zc.set_name(encryption_root)?;
    zc.zc_nvlist_src = packed.as_ptr() as u64;
    zc.zc_nvlist_src_size = packed.len() as u64;

    zfs.raw_command(ZfsIoc::LoadKey, &mut zc)
        .map_err(KeyError::from_code)
        .with_context(|| format!("loading key for encryption root \"{}\"", encryption_root))?;
    info!("key loaded for encryption root \"{}\"", encryption_root);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use std::collections::HashSet;

    #[test]
    fn every_code_has_its_own_reason() {
        let cases = hashmap! {
            libc::EPERM => "permission denied",
            libc::EINVAL => "invalid parameters provided",
            libc::EEXIST => "key already loaded",
            libc::EBUSY => "dataset is busy",
            libc::EACCES => "incorrect key provided",
            ZFS_ERR_CRYPTO_NOTSUP => "dataset uses an unsupported encryption suite",
        };
        for (code, reason) in &cases {
            assert_eq!(KeyError::from_code(*code).to_string(), *reason);
        }
        let reasons: HashSet<&str> = cases.values().copied().collect();
        assert_eq!(reasons.len(), cases.len());
    }

    #[test]
    fn unknown_codes_keep_their_number() {
        assert_eq!(
            KeyError::from_code(libc::EIO).to_string(),
            format!("unknown error {}", libc::EIO)
        );
        assert_eq!(KeyError::from_code(ZFS_ERR_CRYPTO_NOTSUP), KeyError::UnsupportedSuite);
    }
}
