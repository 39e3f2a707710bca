// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Assembler for the shader programs used by the pipeline.
//!
//! Programs are written in a TGSI-like text form that backends compile with
//! [`crate::backend::PipeContext::create_shader`]. [`ShaderBuilder`] takes care of register
//! allocation, immediates and instruction numbering, so the code generating programs reads like the
//! instruction list it produces.

use std::fmt;
use std::fmt::Write;

pub use crate::backend::ShaderStage;

pub const WRITEMASK_X: u8 = 0b0001;
pub const WRITEMASK_Y: u8 = 0b0010;
pub const WRITEMASK_Z: u8 = 0b0100;
pub const WRITEMASK_W: u8 = 0b1000;
pub const WRITEMASK_XY: u8 = WRITEMASK_X | WRITEMASK_Y;
pub const WRITEMASK_ZW: u8 = WRITEMASK_Z | WRITEMASK_W;
pub const WRITEMASK_XYZW: u8 = WRITEMASK_XY | WRITEMASK_ZW;

const SWIZZLE_CHARS: [char; 4] = ['x', 'y', 'z', 'w'];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RegisterFile {
    Input,
    Output,
    Temp,
    Constant,
    Sampler,
    Immediate,
}

impl fmt::Display for RegisterFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RegisterFile::Input => "IN",
            RegisterFile::Output => "OUT",
            RegisterFile::Temp => "TEMP",
            RegisterFile::Constant => "CONST",
            RegisterFile::Sampler => "SAMP",
            RegisterFile::Immediate => "IMM",
        };
        f.write_str(name)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Semantic {
    Position,
    Color,
    Generic,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Constant,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureKind {
    Texture2D,
    Texture3D,
}

/// Source operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Src {
    file: RegisterFile,
    index: u32,
    swizzle: [u8; 4],
    negate: bool,
}

impl Src {
    fn new(file: RegisterFile, index: u32) -> Self {
        Self {
            file,
            index,
            swizzle: [0, 1, 2, 3],
            negate: false,
        }
    }

    pub fn swizzle(self, x: u8, y: u8, z: u8, w: u8) -> Self {
        let s = self.swizzle;
        Self {
            swizzle: [s[x as usize], s[y as usize], s[z as usize], s[w as usize]],
            ..self
        }
    }

    /// Replicates component `c` (0 to 3) over all four channels.
    pub fn scalar(self, c: u8) -> Self {
        self.swizzle(c, c, c, c)
    }

    pub fn negate(self) -> Self {
        Self {
            negate: !self.negate,
            ..self
        }
    }
}

impl fmt::Display for Src {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negate {
            f.write_char('-')?;
        }
        write!(f, "{}[{}]", self.file, self.index)?;
        if self.swizzle != [0, 1, 2, 3] {
            f.write_char('.')?;
            for c in self.swizzle {
                f.write_char(SWIZZLE_CHARS[c as usize])?;
            }
        }
        Ok(())
    }
}

/// Destination operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Dst {
    file: RegisterFile,
    index: u32,
    writemask: u8,
}

impl Dst {
    pub fn writemask(self, writemask: u8) -> Self {
        Self { writemask, ..self }
    }

    /// Reads back this register as a source operand.
    pub fn src(self) -> Src {
        Src::new(self.file, self.index)
    }
}

impl fmt::Display for Dst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.file, self.index)?;
        if self.writemask != WRITEMASK_XYZW {
            f.write_char('.')?;
            for (i, c) in SWIZZLE_CHARS.iter().enumerate() {
                if self.writemask & (1 << i) != 0 {
                    f.write_char(*c)?;
                }
            }
        }
        Ok(())
    }
}

/// A program ready to be compiled by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderProgram {
    pub stage: ShaderStage,
    pub text: String,
    pub num_inputs: u32,
    pub num_outputs: u32,
}

pub struct ShaderBuilder {
    stage: ShaderStage,
    declarations: Vec<String>,
    instructions: Vec<String>,
    immediates: Vec<[f32; 4]>,
    num_inputs: u32,
    num_outputs: u32,
    num_temps: u32,
    /// Nesting level of IF blocks, used for indentation and balance checking.
    depth: usize,
}

impl ShaderBuilder {
    pub fn new(stage: ShaderStage) -> Self {
        Self {
            stage,
            declarations: Vec::new(),
            instructions: Vec::new(),
            immediates: Vec::new(),
            num_inputs: 0,
            num_outputs: 0,
            num_temps: 0,
            depth: 0,
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.stage
    }

    /// Declares vertex shader input `index`, fed from vertex element `index`.
    pub fn decl_vs_input(&mut self, index: u32) -> Src {
        debug_assert_eq!(self.stage, ShaderStage::Vertex);
        self.declarations.push(format!("DCL IN[{}]", index));
        self.num_inputs = self.num_inputs.max(index + 1);
        Src::new(RegisterFile::Input, index)
    }

    /// Declares a fragment shader input, matching the vertex output with the same `index`.
    pub fn decl_fs_input(&mut self, index: u32, interpolation: Interpolation) -> Src {
        debug_assert_eq!(self.stage, ShaderStage::Fragment);
        let interp = match interpolation {
            Interpolation::Constant => "CONSTANT",
            Interpolation::Linear => "LINEAR",
        };
        self.declarations
            .push(format!("DCL IN[{}], GENERIC[{}], {}", index, index, interp));
        self.num_inputs = self.num_inputs.max(index + 1);
        Src::new(RegisterFile::Input, index)
    }

    pub fn decl_output(&mut self, semantic: Semantic, index: u32) -> Dst {
        let semantic = match semantic {
            Semantic::Position => "POSITION".to_string(),
            Semantic::Color => format!("COLOR[{}]", index),
            Semantic::Generic => format!("GENERIC[{}]", index),
        };
        self.declarations
            .push(format!("DCL OUT[{}], {}", self.num_outputs, semantic));
        let dst = Dst {
            file: RegisterFile::Output,
            index: self.num_outputs,
            writemask: WRITEMASK_XYZW,
        };
        self.num_outputs += 1;
        dst
    }

    pub fn decl_temporary(&mut self) -> Dst {
        let index = self.num_temps;
        self.num_temps += 1;
        self.declarations.push(format!("DCL TEMP[{}]", index));
        Dst {
            file: RegisterFile::Temp,
            index,
            writemask: WRITEMASK_XYZW,
        }
    }

    pub fn decl_constant(&mut self, index: u32) -> Src {
        self.declarations.push(format!("DCL CONST[{}]", index));
        Src::new(RegisterFile::Constant, index)
    }

    pub fn decl_sampler(&mut self, index: u32) -> Src {
        self.declarations.push(format!("DCL SAMP[{}]", index));
        Src::new(RegisterFile::Sampler, index)
    }

    /// Returns an immediate holding `values`, reusing an existing one if possible.
    pub fn imm4f(&mut self, values: [f32; 4]) -> Src {
        let index = match self.immediates.iter().position(|v| *v == values) {
            Some(index) => index,
            None => {
                self.immediates.push(values);
                self.immediates.len() - 1
            }
        };
        Src::new(RegisterFile::Immediate, index as u32)
    }

    pub fn imm2f(&mut self, x: f32, y: f32) -> Src {
        self.imm4f([x, y, x, y])
    }

    pub fn imm1f(&mut self, x: f32) -> Src {
        self.imm4f([x; 4])
    }

    fn emit(&mut self, opcode: &str, dst: Option<Dst>, srcs: &[Src]) {
        let mut line = format!("{:indent$}{}", "", opcode, indent = self.depth * 2);
        let mut operands = dst.map(|d| d.to_string()).into_iter().chain(srcs.iter().map(Src::to_string));
        if let Some(first) = operands.next() {
            let _ = write!(line, " {}", first);
            for operand in operands {
                let _ = write!(line, ", {}", operand);
            }
        }
        self.instructions.push(line);
    }

    pub fn mov(&mut self, dst: Dst, src: Src) {
        self.emit("MOV", Some(dst), &[src]);
    }

    pub fn add(&mut self, dst: Dst, a: Src, b: Src) {
        self.emit("ADD", Some(dst), &[a, b]);
    }

    pub fn mul(&mut self, dst: Dst, a: Src, b: Src) {
        self.emit("MUL", Some(dst), &[a, b]);
    }

    /// `dst = a * b + c`
    pub fn mad(&mut self, dst: Dst, a: Src, b: Src, c: Src) {
        self.emit("MAD", Some(dst), &[a, b, c]);
    }

    pub fn dp4(&mut self, dst: Dst, a: Src, b: Src) {
        self.emit("DP4", Some(dst), &[a, b]);
    }

    pub fn frc(&mut self, dst: Dst, src: Src) {
        self.emit("FRC", Some(dst), &[src]);
    }

    pub fn flr(&mut self, dst: Dst, src: Src) {
        self.emit("FLR", Some(dst), &[src]);
    }

    /// `dst = a >= b ? 1.0 : 0.0`
    pub fn sge(&mut self, dst: Dst, a: Src, b: Src) {
        self.emit("SGE", Some(dst), &[a, b]);
    }

    /// `dst = cond < 0.0 ? a : b`
    pub fn cmp(&mut self, dst: Dst, cond: Src, a: Src, b: Src) {
        self.emit("CMP", Some(dst), &[cond, a, b]);
    }

    /// `dst = t * a + (1 - t) * b`
    pub fn lrp(&mut self, dst: Dst, t: Src, a: Src, b: Src) {
        self.emit("LRP", Some(dst), &[t, a, b]);
    }

    pub fn tex(&mut self, dst: Dst, kind: TextureKind, coord: Src, sampler: Src) {
        let opcode = match kind {
            TextureKind::Texture2D => "TEX 2D",
            TextureKind::Texture3D => "TEX 3D",
        };
        self.emit(opcode, Some(dst), &[coord, sampler]);
    }

    pub fn if_(&mut self, cond: Src) {
        self.emit("IF", None, &[cond]);
        self.depth += 1;
    }

    pub fn else_(&mut self) {
        debug_assert!(self.depth > 0, "ELSE outside of IF");
        self.depth = self.depth.saturating_sub(1);
        self.emit("ELSE", None, &[]);
        self.depth += 1;
    }

    pub fn endif(&mut self) {
        debug_assert!(self.depth > 0, "ENDIF outside of IF");
        self.depth = self.depth.saturating_sub(1);
        self.emit("ENDIF", None, &[]);
    }

    /// Terminates the program and returns its text.
    pub fn build(mut self) -> ShaderProgram {
        debug_assert_eq!(self.depth, 0, "unterminated IF block");
        self.emit("END", None, &[]);

        let mut text = String::new();
        text.push_str(match self.stage {
            ShaderStage::Vertex => "VERT\n",
            ShaderStage::Fragment => "FRAG\n",
        });
        for declaration in &self.declarations {
            text.push_str(declaration);
            text.push('\n');
        }
        for (i, imm) in self.immediates.iter().enumerate() {
            let _ = writeln!(
                text,
                "IMM[{}] FLT32 {{ {:.6}, {:.6}, {:.6}, {:.6} }}",
                i, imm[0], imm[1], imm[2], imm[3]
            );
        }
        for (i, instruction) in self.instructions.iter().enumerate() {
            let _ = writeln!(text, "{:3}: {}", i, instruction);
        }

        ShaderProgram {
            stage: self.stage,
            text,
            num_inputs: self.num_inputs,
            num_outputs: self.num_outputs,
        }
    }
}
