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

//! Key unwrapping: single-block Rijndael encryption with a 256-bit state
//! and a 256-bit key. This is the wider-state sibling of AES, not AES
//! itself: the state has eight columns, rows shift by {0, 1, 3, 4}, and
//! the key schedule runs through fourteen round constants. The wrapped
//! dataset keys compiled into the launcher decrypt to the real keys by
//! being encrypted once under the token-derived KEK.
//!
//! The S-box is constructed from the GF(2^8) inverse and the affine map
//! rather than transcribed, and checked against the published table in
//! the tests.

/// 256-bit block, the unit the key wrapper works in.
pub type Block256 = [u8; 32];

/// Columns in the 256-bit state.
const NB: usize = 8;
/// 32-bit words in the key.
const NK: usize = 8;
/// Rounds for 256-bit key and 256-bit block.
const NR: usize = 14;

/// Row rotations for the 256-bit state; rows 2 and 3 shift one further
/// than in AES.
const ROW_SHIFTS: [usize; 4] = [0, 1, 3, 4];

const RCON: [u8; 14] = [
    0x01, 0x02, 0x04, 0x08, 0x10, 0x20, 0x40, 0x80, 0x1b, 0x36, 0x6c, 0xd8, 0xab, 0x4d,
];

const fn gmul(mut a: u8, mut b: u8) -> u8 {
    let mut p = 0u8;
    let mut i = 0;
    while i < 8 {
        if b & 1 != 0 {
            p ^= a;
        }
        let carry = a & 0x80;
        a <<= 1;
        if carry != 0 {
            a ^= 0x1b;
        }
        b >>= 1;
        i += 1;
    }
    p
}

const fn build_sbox() -> [u8; 256] {
    // field inverse via log/antilog tables over the generator 0x03
    let mut exp = [0u8; 255];
    let mut log = [0u8; 256];
    let mut p: u8 = 1;
    let mut i = 0;
    while i < 255 {
        exp[i] = p;
        log[p as usize] = i as u8;
        p = gmul(p, 3);
        i += 1;
    }

    let mut sbox = [0u8; 256];
    sbox[0] = 0x63;
    let mut x = 1;
    while x < 256 {
        let b = exp[(255 - log[x] as usize) % 255];
        sbox[x] =
            b ^ b.rotate_left(1) ^ b.rotate_left(2) ^ b.rotate_left(3) ^ b.rotate_left(4) ^ 0x63;
        x += 1;
    }
    sbox
}

static SBOX: [u8; 256] = build_sbox();

fn xtime(a: u8) -> u8 {
    (a << 1) ^ if a & 0x80 != 0 { 0x1b } else { 0 }
}

/// 120 round-key words: NB per round, NR + 1 rounds.
fn expand_key(key: &Block256) -> [[u8; 4]; NB * (NR + 1)] {
    let mut w = [[0u8; 4]; NB * (NR + 1)];
    for (i, word) in w.iter_mut().take(NK).enumerate() {
        word.copy_from_slice(&key[4 * i..4 * i + 4]);
    }
    for i in NK..NB * (NR + 1) {
        let mut t = w[i - 1];
        if i % NK == 0 {
            t = [
                SBOX[t[1] as usize] ^ RCON[i / NK - 1],
                SBOX[t[2] as usize],
                SBOX[t[3] as usize],
                SBOX[t[0] as usize],
            ];
        } else if i % NK == 4 {
            t = [
                SBOX[t[0] as usize],
                SBOX[t[1] as usize],
                SBOX[t[2] as usize],
                SBOX[t[3] as usize],
            ];
        }
        for j in 0..4 {
            w[i][j] = w[i - NK][j] ^ t[j];
        }
    }
    w
}

// state layout: byte r + 4c is row r of column c

fn sub_bytes(state: &mut Block256) {
    for b in state.iter_mut() {
        *b = SBOX[*b as usize];
    }
}

fn shift_rows(state: &mut Block256) {
    let old = *state;
    for r in 1..4 {
        for c in 0..NB {
            state[r + 4 * c] = old[r + 4 * ((c + ROW_SHIFTS[r]) % NB)];
        }
    }
}

fn mix_columns(state: &mut Block256) {
    for c in 0..NB {
        let col = [
            state[4 * c],
            state[4 * c + 1],
            state[4 * c + 2],
            state[4 * c + 3],
        ];
        state[4 * c] = xtime(col[0]) ^ (xtime(col[1]) ^ col[1]) ^ col[2] ^ col[3];
        state[4 * c + 1] = col[0] ^ xtime(col[1]) ^ (xtime(col[2]) ^ col[2]) ^ col[3];
        state[4 * c + 2] = col[0] ^ col[1] ^ xtime(col[2]) ^ (xtime(col[3]) ^ col[3]);
        state[4 * c + 3] = (xtime(col[0]) ^ col[0]) ^ col[1] ^ col[2] ^ xtime(col[3]);
    }
}

fn add_round_key(state: &mut Block256, w: &[[u8; 4]], round: usize) {
    for c in 0..NB {
        let word = w[round * NB + c];
        for r in 0..4 {
            state[r + 4 * c] ^= word[r];
        }
    }
}

fn encrypt_block(block: &Block256, key: &Block256) -> Block256 {
    let w = expand_key(key);
    let mut state = *block;
    add_round_key(&mut state, &w, 0);
    for round in 1..NR {
        sub_bytes(&mut state);
        shift_rows(&mut state);
        mix_columns(&mut state);
        add_round_key(&mut state, &w, round);
    }
    sub_bytes(&mut state);
    shift_rows(&mut state);
    add_round_key(&mut state, &w, NR);
    state
}

/// Recover a 32-byte dataset key from its compiled-in wrapped form.
pub fn unwrap_key(wrapped: &Block256, kek: &Block256) -> Block256 {
    encrypt_block(wrapped, kek)
}
