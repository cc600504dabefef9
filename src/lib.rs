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

//! Boot-time import engine for an encrypted ZFS pool.
//!
//! The library reads the redundant vdev labels off the pool's block
//! devices, reconstructs a coherent pool configuration from them,
//! negotiates the two-phase try-import/import handshake with the kernel
//! driver, loads the dataset encryption keys, and recursively mounts the
//! dataset tree. The hardware-token dance that produces the key
//! encryption key stays outside; callers hand in the 32-byte KEK.

pub mod import;
pub mod ioctl;
pub mod key;
pub mod keywrap;
pub mod label;
pub mod logger;
pub mod mount;
pub mod nvlist;
pub mod pool;
