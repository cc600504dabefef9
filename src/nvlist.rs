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

//! Minimal name/value-list codec for the ZFS native encoding. This is not
//! a comprehensive nvlist implementation; it models the pair types that
//! appear in vdev labels, pool configurations and dataset stats, which is
//! everything the import engine exchanges with the kernel driver.
//!
//! The native encoding is a flattened copy of the in-kernel structures:
//! a 4-byte stream header, then per list a 24-byte nvlist struct, a
//! sequence of 8-aligned nvpair records and a 4-byte zero terminator.
//! Embedded lists leave a zeroed placeholder struct in the pair's value
//! area and append their own stream right after the record. Pointers are
//! meaningless in the packed form and are written as zeros.

use std::fmt;

use anyhow::{bail, Result};

const NV_ENCODE_NATIVE: u8 = 0;
const NV_LITTLE_ENDIAN: u8 = 1;
const NV_VERSION: i32 = 0;
const NV_UNIQUE_NAME: u32 = 0x1;

/// sizeof (nvlist_t): version, nvflag, priv, flag, pad.
const NVLIST_STRUCT_SIZE: usize = 24;
/// sizeof (nvpair_t): size, name_sz, reserve, value_elem, type.
const NVPAIR_HEADER_SIZE: usize = 16;

const DATA_TYPE_BOOLEAN: i32 = 1;
const DATA_TYPE_UINT64: i32 = 8;
const DATA_TYPE_STRING: i32 = 9;
const DATA_TYPE_UINT64_ARRAY: i32 = 16;
const DATA_TYPE_NVLIST: i32 = 19;
const DATA_TYPE_NVLIST_ARRAY: i32 = 20;
const DATA_TYPE_BOOLEAN_VALUE: i32 = 21;
const DATA_TYPE_UINT8_ARRAY: i32 = 26;

/// A single typed value held by an [`NvList`] pair.
#[derive(Clone, Debug, PartialEq)]
pub enum NvValue {
    /// Presence flag without a value.
    Boolean,
    BooleanValue(bool),
    Uint64(u64),
    String(String),
    Uint64Array(Vec<u64>),
    Uint8Array(Vec<u8>),
    List(NvList),
    ListArray(Vec<NvList>),
}

/// An ordered name/value tree with unique names, the configuration
/// descriptor exchanged with the kernel and stored in vdev labels.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct NvList {
    pairs: Vec<(String, NvValue)>,
}

impl NvList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NvValue)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NvValue> {
        self.pairs.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_u64(&self, name: &str) -> Option<u64> {
        match self.get(name) {
            Some(NvValue::Uint64(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn get_string(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(NvValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_u64_array(&self, name: &str) -> Option<&[u64]> {
        match self.get(name) {
            Some(NvValue::Uint64Array(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn get_list(&self, name: &str) -> Option<&NvList> {
        match self.get(name) {
            Some(NvValue::List(l)) => Some(l),
            _ => None,
        }
    }

    pub fn get_list_array(&self, name: &str) -> Option<&[NvList]> {
        match self.get(name) {
            Some(NvValue::ListArray(v)) => Some(v.as_slice()),
            _ => None,
        }
    }

    /// Insert a pair, replacing any existing pair of the same name.
    pub fn add(&mut self, name: &str, value: NvValue) {
        match self.pairs.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.pairs.push((name.to_string(), value)),
        }
    }

    pub fn add_boolean(&mut self, name: &str) {
        self.add(name, NvValue::Boolean);
    }

    pub fn add_u64(&mut self, name: &str, value: u64) {
        self.add(name, NvValue::Uint64(value));
    }

    pub fn add_string(&mut self, name: &str, value: &str) {
        self.add(name, NvValue::String(value.to_string()));
    }

    pub fn add_u64_array(&mut self, name: &str, value: &[u64]) {
        self.add(name, NvValue::Uint64Array(value.to_vec()));
    }

    pub fn add_u8_array(&mut self, name: &str, value: &[u8]) {
        self.add(name, NvValue::Uint8Array(value.to_vec()));
    }

    pub fn add_list(&mut self, name: &str, value: NvList) {
        self.add(name, NvValue::List(value));
    }

    pub fn add_list_array(&mut self, name: &str, value: Vec<NvList>) {
        self.add(name, NvValue::ListArray(value));
    }

    pub fn remove(&mut self, name: &str) -> Option<NvValue> {
        let idx = self.pairs.iter().position(|(n, _)| n == name)?;
        Some(self.pairs.remove(idx).1)
    }

    /// Serialize into the native encoding.
    pub fn pack_native(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1024);
        buf.extend_from_slice(&[NV_ENCODE_NATIVE, NV_LITTLE_ENDIAN, 0, 0]);
        self.encode_into(&mut buf);
        buf
    }

    /// Deserialize a native-encoded stream. Trailing bytes beyond the
    /// outer list terminator are ignored (kernel buffers are sized
    /// generously).
    pub fn unpack(data: &[u8]) -> Result<NvList> {
        let mut cur = Cursor::new(data);
        let encoding = cur.u8()?;
        let endian = cur.u8()?;
        cur.skip(2)?;
        if encoding != NV_ENCODE_NATIVE {
            bail!("unsupported nvlist encoding {}", encoding);
        }
        if endian != NV_LITTLE_ENDIAN {
            bail!("unsupported nvlist endianness {}", endian);
        }
        decode_list(&mut cur)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_embedded_struct(buf);
        for (name, value) in &self.pairs {
            encode_pair(buf, name, value);
        }
        put_i32(buf, 0);
    }
}

impl fmt::Display for NvList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indent(f, 0)
    }
}

impl NvList {
    fn fmt_indent(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = "\t".repeat(indent);
        for (name, value) in self.iter() {
            match value {
                NvValue::Boolean => writeln!(f, "{}{}", pad, name)?,
                NvValue::BooleanValue(v) => writeln!(f, "{}{} = {}", pad, name, v)?,
                NvValue::Uint64(v) => writeln!(f, "{}{} = {}", pad, name, v)?,
                NvValue::String(s) => writeln!(f, "{}{} = \"{}\"", pad, name, s)?,
                NvValue::Uint64Array(v) => writeln!(f, "{}{} = {:?}", pad, name, v)?,
                NvValue::Uint8Array(v) => writeln!(f, "{}{} = {:02x?}", pad, name, v)?,
                NvValue::List(l) => {
                    writeln!(f, "{}{} = {{", pad, name)?;
                    l.fmt_indent(f, indent + 1)?;
                    writeln!(f, "{}}}", pad)?;
                }
                NvValue::ListArray(ls) => {
                    writeln!(f, "{}{} = [", pad, name)?;
                    for l in ls {
                        writeln!(f, "{}\t{{", pad)?;
                        l.fmt_indent(f, indent + 2)?;
                        writeln!(f, "{}\t}}", pad)?;
                    }
                    writeln!(f, "{}]", pad)?;
                }
            }
        }
        Ok(())
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn put_i16(buf: &mut Vec<u8>, v: i16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_zeros(buf: &mut Vec<u8>, n: usize) {
    buf.resize(buf.len() + n, 0);
}

/// Flattened nvlist struct: pointers zeroed, unique-name flag set.
fn put_embedded_struct(buf: &mut Vec<u8>) {
    put_i32(buf, NV_VERSION);
    put_u32(buf, NV_UNIQUE_NAME);
    put_u64(buf, 0); // nvl_priv
    put_u32(buf, 0); // nvl_flag
    put_i32(buf, 0); // nvl_pad
}

fn encode_pair(buf: &mut Vec<u8>, name: &str, value: &NvValue) {
    debug_assert!(name.len() + 1 <= i16::MAX as usize);
    let name_sz = name.len() + 1;
    let header_sz = align8(NVPAIR_HEADER_SIZE + name_sz);
    let (dtype, nelem, value_sz) = match value {
        NvValue::Boolean => (DATA_TYPE_BOOLEAN, 0, 0),
        NvValue::BooleanValue(_) => (DATA_TYPE_BOOLEAN_VALUE, 1, 4),
        NvValue::Uint64(_) => (DATA_TYPE_UINT64, 1, 8),
        NvValue::String(s) => (DATA_TYPE_STRING, 1, 8 + s.len() + 1),
        NvValue::Uint64Array(v) => (DATA_TYPE_UINT64_ARRAY, v.len(), 8 * v.len()),
        NvValue::Uint8Array(v) => (DATA_TYPE_UINT8_ARRAY, v.len(), v.len()),
        NvValue::List(_) => (DATA_TYPE_NVLIST, 1, NVLIST_STRUCT_SIZE),
        NvValue::ListArray(v) => (
            DATA_TYPE_NVLIST_ARRAY,
            v.len(),
            v.len() * 8 + v.len() * NVLIST_STRUCT_SIZE,
        ),
    };
    let size = header_sz + align8(value_sz);

    put_i32(buf, size as i32);
    put_i16(buf, name_sz as i16);
    put_i16(buf, 0); // nvp_reserve
    put_i32(buf, nelem as i32);
    put_i32(buf, dtype);
    buf.extend_from_slice(name.as_bytes());
    put_zeros(buf, header_sz - NVPAIR_HEADER_SIZE - name.len());

    let value_start = buf.len();
    match value {
        NvValue::Boolean => (),
        NvValue::BooleanValue(v) => put_i32(buf, *v as i32),
        NvValue::Uint64(v) => put_u64(buf, *v),
        NvValue::String(s) => {
            put_u64(buf, 0); // flattened char pointer
            buf.extend_from_slice(s.as_bytes());
            buf.push(0);
        }
        NvValue::Uint64Array(v) => {
            for e in v {
                put_u64(buf, *e);
            }
        }
        NvValue::Uint8Array(v) => buf.extend_from_slice(v),
        NvValue::List(_) => put_embedded_struct(buf),
        NvValue::ListArray(v) => {
            put_zeros(buf, v.len() * 8); // flattened nvlist pointers
            for _ in v {
                put_embedded_struct(buf);
            }
        }
    }
    put_zeros(buf, align8(value_sz) - (buf.len() - value_start));

    // child streams follow the record
    match value {
        NvValue::List(l) => l.encode_into(buf),
        NvValue::ListArray(ls) => {
            for l in ls {
                l.encode_into(buf);
            }
        }
        _ => (),
    }
}

fn decode_list(cur: &mut Cursor) -> Result<NvList> {
    let version = cur.i32()?;
    if version != NV_VERSION {
        bail!("unsupported nvlist version {}", version);
    }
    let _nvflag = cur.u32()?;
    cur.skip(NVLIST_STRUCT_SIZE - 8)?;

    let mut list = NvList::new();
    loop {
        let size = cur.i32()?;
        if size == 0 {
            return Ok(list);
        }
        if size < NVPAIR_HEADER_SIZE as i32 || size % 8 != 0 {
            bail!("malformed nvpair size {}", size);
        }
        // the size field is part of the record
        let rec = cur.take(size as usize - 4)?;
        let name_sz = i16::from_le_bytes([rec[0], rec[1]]);
        let nelem = i32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]);
        let dtype = i32::from_le_bytes([rec[8], rec[9], rec[10], rec[11]]);
        if name_sz <= 0 || nelem < 0 {
            bail!("malformed nvpair header");
        }
        let name_sz = name_sz as usize;
        let nelem = nelem as usize;
        let name_end = 12 + name_sz;
        let value_off = align8(NVPAIR_HEADER_SIZE + name_sz) - 4;
        if name_end > rec.len() || value_off > rec.len() || rec[name_end - 1] != 0 {
            bail!("malformed nvpair name");
        }
        let name = match std::str::from_utf8(&rec[12..name_end - 1]) {
            Ok(s) => s,
            Err(_) => bail!("nvpair name is not UTF-8"),
        };
        let val = &rec[value_off..];

        let value = match dtype {
            DATA_TYPE_BOOLEAN => NvValue::Boolean,
            DATA_TYPE_BOOLEAN_VALUE => {
                NvValue::BooleanValue(i32::from_le_bytes(take4(val, name)?) != 0)
            }
            DATA_TYPE_UINT64 => NvValue::Uint64(u64::from_le_bytes(take8(val, 0, name)?)),
            DATA_TYPE_STRING => {
                // flattened pointer, then the characters
                if val.len() < 8 {
                    bail!("truncated string value for \"{}\"", name);
                }
                let chars = &val[8..];
                let nul = match chars.iter().position(|b| *b == 0) {
                    Some(p) => p,
                    None => bail!("unterminated string value for \"{}\"", name),
                };
                match std::str::from_utf8(&chars[..nul]) {
                    Ok(s) => NvValue::String(s.to_string()),
                    Err(_) => bail!("string value for \"{}\" is not UTF-8", name),
                }
            }
            DATA_TYPE_UINT64_ARRAY => {
                let need = nelem.checked_mul(8).unwrap_or(usize::MAX);
                if val.len() < need {
                    bail!("truncated array value for \"{}\"", name);
                }
                NvValue::Uint64Array(
                    val[..need]
                        .chunks_exact(8)
                        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                        .collect(),
                )
            }
            DATA_TYPE_UINT8_ARRAY => {
                if val.len() < nelem {
                    bail!("truncated byte array for \"{}\"", name);
                }
                NvValue::Uint8Array(val[..nelem].to_vec())
            }
            DATA_TYPE_NVLIST => NvValue::List(decode_list(cur)?),
            DATA_TYPE_NVLIST_ARRAY => {
                // the value area holds a pointer and a placeholder
                // struct per element, bounding the element count
                let need = nelem
                    .checked_mul(8 + NVLIST_STRUCT_SIZE)
                    .unwrap_or(usize::MAX);
                if val.len() < need {
                    bail!("truncated list array for \"{}\"", name);
                }
                let mut v = Vec::with_capacity(nelem);
                for _ in 0..nelem {
                    v.push(decode_list(cur)?);
                }
                NvValue::ListArray(v)
            }
            // Stats lists carry pair types the import engine never
            // consumes; none of them embed child streams, so the record
            // length is enough to step over them.
            _ => continue,
        };
        list.add(name, value);
    }
}

fn take4(val: &[u8], name: &str) -> Result<[u8; 4]> {
    if val.len() < 4 {
        bail!("truncated value for \"{}\"", name);
    }
    Ok([val[0], val[1], val[2], val[3]])
}

fn take8(val: &[u8], off: usize, name: &str) -> Result<[u8; 8]> {
    match val.get(off..off + 8) {
        Some(b) => Ok(b.try_into().unwrap()),
        None => bail!("truncated value for \"{}\"", name),
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        match self.buf.get(self.pos..self.pos + n) {
            Some(s) => {
                self.pos += n;
                Ok(s)
            }
            None => bail!("truncated nvlist stream at offset {}", self.pos),
        }
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}
