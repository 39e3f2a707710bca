// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Macroblock records as produced by the MPEG-2 slice parser, and their classification.

use enumn::N;
use thiserror::Error;

use crate::BLOCK_SIZE;

#[derive(N, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MacroblockType {
    Intra = 0,
    Fwd = 1,
    Bkwd = 2,
    Bi = 3,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MotionType {
    #[default]
    Frame = 0,
    Field = 1,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DctType {
    #[default]
    Frame = 0,
    Field = 1,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MacroblockError {
    #[error("invalid macroblock type {0}")]
    InvalidMacroblockType(u8),
    #[error("invalid motion type {0}")]
    InvalidMotionType(u8),
    #[error("invalid DCT type {0}")]
    InvalidDctType(u8),
    #[error("invalid coded block pattern {0:#x}")]
    InvalidCodedBlockPattern(u8),
    #[error("coded block pattern announces {expected} coefficients, got {actual}")]
    BlockCountMismatch { expected: usize, actual: usize },
}

impl TryFrom<u8> for MacroblockType {
    type Error = MacroblockError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::n(value).ok_or(MacroblockError::InvalidMacroblockType(value))
    }
}

impl TryFrom<u8> for MotionType {
    type Error = MacroblockError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::n(value).ok_or(MacroblockError::InvalidMotionType(value))
    }
}

impl TryFrom<u8> for DctType {
    type Error = MacroblockError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::n(value).ok_or(MacroblockError::InvalidDctType(value))
    }
}

/// Half-pel motion vectors, indexed by `[vector slot][direction][x|y]`. Direction 0 is forward
/// (towards the past reference), direction 1 backward (towards the future reference).
pub type MotionVectors = [[[i16; 2]; 2]; 2];

/// Mask of the coded block pattern bits that can be set.
pub const CBP_MASK: u8 = 0x3f;

/// Whether luma block (`x`, `y`) of a macroblock (each 0 or 1) is present in `cbp`.
pub fn luma_block_coded(cbp: u8, x: u32, y: u32) -> bool {
    cbp & (1 << (5 - (x + y * 2))) != 0
}

/// Whether the Cb block of a macroblock is present in `cbp`.
pub fn cb_block_coded(cbp: u8) -> bool {
    cbp & 0b10 != 0
}

/// Whether the Cr block of a macroblock is present in `cbp`.
pub fn cr_block_coded(cbp: u8) -> bool {
    cbp & 0b01 != 0
}

/// The seven kinds of macroblock the renderer draws separately, in draw order.
///
/// Each class has its own vertex layout, shader pair and reference texture bindings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MacroblockClass {
    Intra,
    FwdFrame,
    FwdField,
    BkwdFrame,
    BkwdField,
    BiFrame,
    BiField,
}

impl MacroblockClass {
    pub const COUNT: usize = 7;

    /// All classes, in the order their draws are issued.
    pub const ALL: [MacroblockClass; Self::COUNT] = [
        MacroblockClass::Intra,
        MacroblockClass::FwdFrame,
        MacroblockClass::FwdField,
        MacroblockClass::BkwdFrame,
        MacroblockClass::BkwdField,
        MacroblockClass::BiFrame,
        MacroblockClass::BiField,
    ];

    /// Intra macroblocks have no motion, so their motion type is ignored.
    pub fn classify(mb_type: MacroblockType, mo_type: MotionType) -> Self {
        match (mb_type, mo_type) {
            (MacroblockType::Intra, _) => MacroblockClass::Intra,
            (MacroblockType::Fwd, MotionType::Frame) => MacroblockClass::FwdFrame,
            (MacroblockType::Fwd, MotionType::Field) => MacroblockClass::FwdField,
            (MacroblockType::Bkwd, MotionType::Frame) => MacroblockClass::BkwdFrame,
            (MacroblockType::Bkwd, MotionType::Field) => MacroblockClass::BkwdField,
            (MacroblockType::Bi, MotionType::Frame) => MacroblockClass::BiFrame,
            (MacroblockType::Bi, MotionType::Field) => MacroblockClass::BiField,
        }
    }

    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Number of reference pictures sampled by this class.
    pub fn ref_frames(&self) -> usize {
        match self {
            MacroblockClass::Intra => 0,
            MacroblockClass::FwdFrame
            | MacroblockClass::FwdField
            | MacroblockClass::BkwdFrame
            | MacroblockClass::BkwdField => 1,
            MacroblockClass::BiFrame | MacroblockClass::BiField => 2,
        }
    }

    /// Number of motion vectors per reference picture: one for frame prediction, one per field
    /// for field prediction.
    pub fn mv_per_frame(&self) -> usize {
        match self {
            MacroblockClass::Intra => 0,
            MacroblockClass::FwdFrame | MacroblockClass::BkwdFrame | MacroblockClass::BiFrame => 1,
            MacroblockClass::FwdField | MacroblockClass::BkwdField | MacroblockClass::BiField => 2,
        }
    }

    pub fn uses_past(&self) -> bool {
        matches!(
            self,
            MacroblockClass::FwdFrame
                | MacroblockClass::FwdField
                | MacroblockClass::BiFrame
                | MacroblockClass::BiField
        )
    }

    pub fn uses_future(&self) -> bool {
        matches!(
            self,
            MacroblockClass::BkwdFrame
                | MacroblockClass::BkwdField
                | MacroblockClass::BiFrame
                | MacroblockClass::BiField
        )
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MotionVector {
    pub x: i16,
    pub y: i16,
}

/// The vectors used to sample one reference picture. Frame prediction uses the same vector for
/// both fields.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PredictionVectors {
    pub top: MotionVector,
    pub bottom: MotionVector,
}

/// One macroblock worth of decode work.
#[derive(Clone, Debug)]
pub struct Macroblock<'a> {
    /// Column of the macroblock, in macroblock units.
    pub mbx: u32,
    /// Row of the macroblock, in macroblock units.
    pub mby: u32,
    pub mb_type: MacroblockType,
    pub mo_type: MotionType,
    pub dct_type: DctType,
    pub pmv: MotionVectors,
    /// Motion vertical field select, indexed by `[vector slot][direction]`. Set when the vector
    /// refers to the bottom field of the reference.
    pub mvfs: [[bool; 2]; 2],
    /// Coded block pattern. Bits 5 to 2 are luma blocks 0 to 3, bit 1 is Cb and bit 0 is Cr.
    pub cbp: u8,
    /// Coefficients of the coded blocks, 64 per block, in the order of `cbp` from the most
    /// significant bit.
    pub blocks: &'a [i16],
}

impl<'a> Macroblock<'a> {
    pub fn class(&self) -> MacroblockClass {
        MacroblockClass::classify(self.mb_type, self.mo_type)
    }

    pub fn num_coded_blocks(&self) -> usize {
        (self.cbp & CBP_MASK).count_ones() as usize
    }

    /// Checks that the record is self-consistent.
    pub fn validate(&self) -> Result<(), MacroblockError> {
        if self.cbp & !CBP_MASK != 0 {
            return Err(MacroblockError::InvalidCodedBlockPattern(self.cbp));
        }

        let expected = self.num_coded_blocks() * BLOCK_SIZE;
        if self.blocks.len() != expected {
            return Err(MacroblockError::BlockCountMismatch {
                expected,
                actual: self.blocks.len(),
            });
        }

        Ok(())
    }

    /// Returns the vectors for each reference stream of this macroblock.
    ///
    /// Stream 0 samples the past picture, or the future one for backward-only prediction. Stream 1
    /// is only used by bidirectional prediction and samples the future picture. Unused streams are
    /// left zeroed.
    pub fn reference_vectors(&self) -> [PredictionVectors; 2] {
        let mut vectors = [PredictionVectors::default(); 2];

        match self.mb_type {
            MacroblockType::Intra => (),
            MacroblockType::Fwd => vectors[0] = self.prediction_vectors(0),
            MacroblockType::Bkwd => vectors[0] = self.prediction_vectors(1),
            MacroblockType::Bi => {
                vectors[0] = self.prediction_vectors(0);
                vectors[1] = self.prediction_vectors(1);
            }
        }

        vectors
    }

    fn prediction_vectors(&self, direction: usize) -> PredictionVectors {
        let vector = |slot: usize| MotionVector {
            x: self.pmv[slot][direction][0],
            y: self.pmv[slot][direction][1],
        };

        match self.mo_type {
            MotionType::Frame => PredictionVectors {
                top: vector(0),
                bottom: vector(0),
            },
            MotionType::Field => {
                // Field vectors address every other line: drop the vertical part that does not
                // land on a line of the selected field, then move to the selected field.
                let mut top = vector(0);
                top.y -= top.y % 4;
                if self.mvfs[0][direction] {
                    top.y += 2;
                }

                let mut bottom = vector(1);
                bottom.y -= bottom.y % 4;
                if !self.mvfs[1][direction] {
                    bottom.y -= 2;
                }

                PredictionVectors { top, bottom }
            }
        }
    }
}

/// The part of a [`Macroblock`] kept in a batch once its coefficients have been uploaded.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BatchedMacroblock {
    pub mbx: u32,
    pub mby: u32,
    pub class: MacroblockClass,
    pub dct_type: DctType,
    pub cbp: u8,
    pub vectors: [PredictionVectors; 2],
}

impl<'a> From<&Macroblock<'a>> for BatchedMacroblock {
    fn from(mb: &Macroblock<'a>) -> Self {
        Self {
            mbx: mb.mbx,
            mby: mb.mby,
            class: mb.class(),
            dct_type: mb.dct_type,
            cbp: mb.cbp,
            vectors: mb.reference_vectors(),
        }
    }
}
