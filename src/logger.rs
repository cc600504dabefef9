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

//! Syslog backend for the `log` facade. The launcher runs from early
//! boot where stderr goes nowhere useful, so diagnostics are routed to
//! the daemon facility.

use std::ffi::CString;

use log::{Level, LevelFilter, Log, Metadata, Record, SetLoggerError};

static IDENT: &[u8] = b"zpool-bootmount\0";
static LOGGER: Syslog = Syslog;

pub struct Syslog;

/// Open the log and install the facade. Call once, before any import
/// work starts.
pub fn init() -> Result<(), SetLoggerError> {
    unsafe {
        libc::openlog(
            IDENT.as_ptr() as *const libc::c_char,
            libc::LOG_CONS,
            libc::LOG_DAEMON,
        )
    };
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

fn priority(level: Level) -> libc::c_int {
    match level {
        Level::Error => libc::LOG_ERR,
        Level::Warn => libc::LOG_WARNING,
        _ => libc::LOG_INFO,
    }
}

impl Log for Syslog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Info
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = CString::new(record.args().to_string())
            .unwrap_or_else(|_| CString::new("log message contained NUL").unwrap());
        unsafe {
            libc::syslog(
                priority(record.level()),
                b"%s\0".as_ptr() as *const libc::c_char,
                message.as_ptr(),
            )
        };
    }

    fn flush(&self) {}
}
