// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! GPU-accelerated MPEG-2 macroblock decoding.
//!
//! This crate turns the macroblock records produced by an MPEG-2 bitstream parser into draw calls
//! against an abstract graphics backend ([`backend::PipeContext`]). The inverse DCT and the motion
//! compensation stages both run as shader programs: coefficients are uploaded into plane textures,
//! transformed by a two-pass render-to-texture IDCT, and then combined with the reference pictures
//! by one draw per macroblock class.
//!
//! The entry point is [`mc_renderer::McRenderer`]. The [`compositor::Compositor`] blits a decoded
//! surface to a display target with color space conversion.

pub mod backend;
pub mod compositor;
pub mod idct;
pub mod macroblock;
pub mod mc_renderer;
pub mod shader;
pub mod surface;
pub mod utils;
pub mod vertex_buffer;
pub mod ycbcr_buffer;

/// Width of a macroblock, in luma samples.
pub const MACROBLOCK_WIDTH: u32 = 16;
/// Height of a macroblock, in luma samples.
pub const MACROBLOCK_HEIGHT: u32 = 16;
/// Width of a coefficient block.
pub const BLOCK_WIDTH: u32 = 8;
/// Height of a coefficient block.
pub const BLOCK_HEIGHT: u32 = 8;
/// Number of coefficients in a block.
pub const BLOCK_SIZE: usize = (BLOCK_WIDTH * BLOCK_HEIGHT) as usize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Number of macroblock columns and rows needed to cover this resolution.
    pub fn in_macroblocks(&self) -> (u32, u32) {
        (
            utils::align_up(self.width, MACROBLOCK_WIDTH) / MACROBLOCK_WIDTH,
            utils::align_up(self.height, MACROBLOCK_HEIGHT) / MACROBLOCK_HEIGHT,
        )
    }

    /// Returns this resolution with both dimensions rounded up to the next power of two.
    pub fn next_power_of_two(&self) -> Self {
        Self {
            width: self.width.next_power_of_two(),
            height: self.height.next_power_of_two(),
        }
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// Chroma subsampling of the decoded picture.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

impl ChromaFormat {
    /// Size of one chroma plane for a picture of `luma` size.
    pub fn chroma_size(&self, luma: Resolution) -> Resolution {
        match self {
            ChromaFormat::Yuv420 => Resolution::from((luma.width / 2, luma.height / 2)),
            // 4:2:2 planes are stored full width and half height.
            ChromaFormat::Yuv422 => Resolution::from((luma.width, luma.height / 2)),
            ChromaFormat::Yuv444 => luma,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macroblock_grid() {
        assert_eq!(Resolution::from((720, 576)).in_macroblocks(), (45, 36));
        assert_eq!(Resolution::from((721, 577)).in_macroblocks(), (46, 37));
        assert_eq!(Resolution::from((16, 16)).in_macroblocks(), (1, 1));
    }

    #[test]
    fn chroma_plane_sizes() {
        let luma = Resolution::from((64, 32));
        assert_eq!(ChromaFormat::Yuv420.chroma_size(luma), Resolution::from((32, 16)));
        assert_eq!(ChromaFormat::Yuv422.chroma_size(luma), Resolution::from((64, 16)));
        assert_eq!(ChromaFormat::Yuv444.chroma_size(luma), luma);
    }

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(
            Resolution::from((720, 576)).next_power_of_two(),
            Resolution::from((1024, 1024))
        );
        assert_eq!(Resolution::from((64, 32)).next_power_of_two(), Resolution::from((64, 32)));
    }
}
