// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use byteorder::ByteOrder;
use byteorder::LittleEndian;

/// Rounds `value` up to the next multiple of `alignment`, which must be non-zero.
pub fn align_up(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

/// Rounds `value` up to a power of two if `pot` is set, returns it unchanged otherwise.
pub fn maybe_pot(value: u32, pot: bool) -> u32 {
    if pot {
        value.next_power_of_two()
    } else {
        value
    }
}

/// Writes `src` as little-endian 16-bit words at the start of `dst`.
pub fn write_i16_le(dst: &mut [u8], src: &[i16]) {
    LittleEndian::write_i16_into(src, &mut dst[..src.len() * 2]);
}

/// Reads `dst.len()` little-endian 16-bit words from the start of `src`.
pub fn read_i16_le(src: &[u8], dst: &mut [i16]) {
    LittleEndian::read_i16_into(&src[..dst.len() * 2], dst);
}

/// Reads `dst.len()` little-endian floats from the start of `src`.
pub fn read_f32_le(src: &[u8], dst: &mut [f32]) {
    LittleEndian::read_f32_into(&src[..dst.len() * 4], dst);
}
