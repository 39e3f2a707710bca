// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Batched motion compensation renderer.
//!
//! [`McRenderer::submit`] uploads the coefficients of each macroblock into the planes of the
//! current buffer set as soon as it receives it, and records the macroblock in a [`BatchState`].
//! When the batch is full, when another surface is submitted or when [`McRenderer::flush`] is
//! called, the batch is rendered:
//!
//! 1. the geometry of every macroblock is generated and uploaded, grouped by class,
//! 2. the planes are unmapped and their coefficients transformed by the IDCT,
//! 3. one draw is issued per non-empty [`MacroblockClass`], in class order, adding the residuals
//!    to the prediction fetched from the reference surfaces,
//! 4. the work is flushed to the backend and the next buffer set of the ring is used.
//!
//! Each macroblock is drawn as four quads, one per 8x8 quadrant, of two triangles each. This lets
//! every quadrant fetch its luma residual from a different place, which is needed when empty blocks
//! share a single block of zeros.

use std::collections::HashMap;
use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use log::trace;
use log::warn;
use thiserror::Error;

use crate::backend::object::map_all;
use crate::backend::object::PipeObject;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::BufferDesc;
use crate::backend::Filter;
use crate::backend::FramebufferState;
use crate::backend::PipeContext;
use crate::backend::PrimitiveType;
use crate::backend::RawHandle;
use crate::backend::ResourceUsage;
use crate::backend::SamplerDesc;
use crate::backend::ShaderStage;
use crate::backend::Viewport;
use crate::idct::Idct;
use crate::idct::IdctError;
use crate::idct::IdctFormats;
use crate::idct::IdctMatrix;
use crate::macroblock::cb_block_coded;
use crate::macroblock::cr_block_coded;
use crate::macroblock::luma_block_coded;
use crate::macroblock::BatchedMacroblock;
use crate::macroblock::DctType;
use crate::macroblock::Macroblock;
use crate::macroblock::MacroblockClass;
use crate::macroblock::MacroblockError;
use crate::macroblock::PredictionVectors;
use crate::shader::Interpolation;
use crate::shader::Semantic;
use crate::shader::ShaderBuilder;
use crate::shader::ShaderProgram;
use crate::shader::TextureKind;
use crate::shader::WRITEMASK_X;
use crate::shader::WRITEMASK_XY;
use crate::shader::WRITEMASK_Y;
use crate::shader::WRITEMASK_ZW;
use crate::surface::DecodeSurface;
use crate::utils::maybe_pot;
use crate::vertex_buffer::write_vertices;
use crate::vertex_buffer::MotionVertex;
use crate::vertex_buffer::Vertex2f;
use crate::vertex_buffer::VertexBuffer;
use crate::vertex_buffer::VertexStream;
use crate::vertex_buffer::YCbCrVertex;
use crate::ycbcr_buffer::BlockPos;
use crate::ycbcr_buffer::Plane;
use crate::ycbcr_buffer::YCbCrBuffer;
use crate::ChromaFormat;
use crate::Resolution;
use crate::BLOCK_HEIGHT;
use crate::BLOCK_SIZE;
use crate::BLOCK_WIDTH;
use crate::MACROBLOCK_HEIGHT;
use crate::MACROBLOCK_WIDTH;

/// Vertices generated per macroblock: two triangles for each of the four quadrants.
pub const VERTICES_PER_MACROBLOCK: usize = 24;

/// Corners of the two triangles of a quadrant, in half-quadrant units.
const QUADRANT_CORNERS: [(u32, u32); 6] = [(0, 0), (0, 1), (1, 0), (1, 0), (0, 1), (1, 1)];

/// How many macroblocks are rendered at once.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BufferMode {
    /// One batch covers a whole picture.
    #[default]
    PerPicture,
    /// One batch covers one row of macroblocks.
    PerSlice,
}

/// What to do with the blocks a macroblock does not code.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum EmptyBlockPolicy {
    /// Upload and transform a block of zeros for every empty block.
    #[default]
    ZeroUpload,
    /// Upload one block of zeros per plane and batch, and point every other empty block of the
    /// batch at it.
    SharedZeroBlock,
    /// Leave empty blocks untouched and skip their fetch in the fragment program. Not supported.
    ConditionalFetch,
}

#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Size of the decoded pictures.
    pub picture: Resolution,
    pub chroma_format: ChromaFormat,
    pub buffer_mode: BufferMode,
    pub empty_block_policy: EmptyBlockPolicy,
    /// Number of buffer sets used in turn, so a batch can be filled while the previous ones are
    /// still being rendered. 0 is the same as 1.
    pub num_buffer_sets: usize,
    /// Whether textures must have power of two dimensions.
    pub pot_buffers: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            picture: Resolution::from((720, 576)),
            chroma_format: ChromaFormat::Yuv420,
            buffer_mode: BufferMode::PerPicture,
            empty_block_policy: EmptyBlockPolicy::ZeroUpload,
            num_buffer_sets: 4,
            pot_buffers: true,
        }
    }
}

impl RendererConfig {
    /// Number of macroblocks rendered by one batch.
    pub fn macroblocks_per_batch(&self) -> usize {
        let (width, height) = self.picture.in_macroblocks();
        match self.buffer_mode {
            BufferMode::PerPicture => (width * height) as usize,
            BufferMode::PerSlice => width as usize,
        }
    }

    /// Size the decode surfaces must have.
    pub fn target_size(&self) -> Resolution {
        Resolution::from((
            maybe_pot(self.picture.width, self.pot_buffers),
            maybe_pot(self.picture.height, self.pot_buffers),
        ))
    }

    /// Size of the luma planes, which cover whole macroblocks.
    pub fn luma_size(&self) -> Resolution {
        let (width, height) = self.picture.in_macroblocks();
        Resolution::from((
            maybe_pot(width * MACROBLOCK_WIDTH, self.pot_buffers),
            maybe_pot(height * MACROBLOCK_HEIGHT, self.pot_buffers),
        ))
    }

    pub fn chroma_size(&self) -> Resolution {
        let (width, height) = self.picture.in_macroblocks();
        let chroma = self
            .chroma_format
            .chroma_size(Resolution::from((width * MACROBLOCK_WIDTH, height * MACROBLOCK_HEIGHT)));
        Resolution::from((
            maybe_pot(chroma.width, self.pot_buffers),
            maybe_pot(chroma.height, self.pot_buffers),
        ))
    }
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("reference surfaces changed without changing the target surface")]
    ReferenceMismatch,
    #[error("no reference surface for a {0:?} macroblock")]
    MissingReference(MacroblockClass),
    #[error("macroblock ({mbx}, {mby}) is outside of the picture")]
    OutOfBounds { mbx: u32, mby: u32 },
    #[error(transparent)]
    Macroblock(#[from] MacroblockError),
    #[error("surface size does not match the configured picture")]
    SurfaceSizeMismatch,
    #[error("empty block policy {0:?} is not supported")]
    UnsupportedPolicy(EmptyBlockPolicy),
    #[error("chroma format {0:?} is not supported")]
    UnsupportedChromaFormat(ChromaFormat),
    #[error(transparent)]
    Idct(#[from] IdctError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Macroblocks accumulated for the next flush, with their per class counts.
#[derive(Debug)]
pub struct BatchState {
    capacity: usize,
    counts: [usize; MacroblockClass::COUNT],
    macroblocks: Vec<BatchedMacroblock>,
}

impl BatchState {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            counts: [0; MacroblockClass::COUNT],
            macroblocks: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.macroblocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macroblocks.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.macroblocks.len() >= self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.macroblocks.len()
    }

    pub fn count(&self, class: MacroblockClass) -> usize {
        self.counts[class.index()]
    }

    pub fn counts(&self) -> &[usize; MacroblockClass::COUNT] {
        &self.counts
    }

    /// Macroblocks in submission order.
    pub fn macroblocks(&self) -> &[BatchedMacroblock] {
        &self.macroblocks
    }

    pub fn push(&mut self, mb: BatchedMacroblock) {
        debug_assert!(!self.is_full(), "batch overflow");
        self.counts[mb.class.index()] += 1;
        self.macroblocks.push(mb);
    }

    /// Macroblocks of `class`, in submission order.
    pub fn iter_class(&self, class: MacroblockClass) -> impl Iterator<Item = &BatchedMacroblock> {
        self.macroblocks.iter().filter(move |mb| mb.class == class)
    }

    /// The draws of this batch: for each non-empty class, in class order, the index of its first
    /// vertex and its vertex count.
    pub fn draw_ranges(&self) -> Vec<(MacroblockClass, u32, u32)> {
        let mut start = 0;
        MacroblockClass::ALL
            .iter()
            .filter(|class| self.count(**class) > 0)
            .map(|class| {
                let count = (self.count(*class) * VERTICES_PER_MACROBLOCK) as u32;
                let range = (*class, start, count);
                start += count;
                range
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.counts = [0; MacroblockClass::COUNT];
        self.macroblocks.clear();
    }
}

/// Everything [`gen_macroblock_verts`] needs to know about the textures of a batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MacroblockLayout {
    pub target: Resolution,
    pub luma: Resolution,
    pub chroma: Resolution,
    /// Block of zeros of each plane that empty blocks are redirected to, if any.
    pub zero_blocks: [Option<BlockPos>; 3],
}

fn normalize(x: u32, y: u32, size: Resolution) -> Vertex2f {
    Vertex2f::new(x as f32 / size.width as f32, y as f32 / size.height as f32)
}

fn motion_offset(vectors: &PredictionVectors, size: Resolution) -> MotionVertex {
    let (w, h) = (size.width as f32, size.height as f32);
    MotionVertex {
        top: Vertex2f::new(
            vectors.top.x as f32 * 0.5 / w,
            vectors.top.y as f32 * 0.5 / h,
        ),
        bottom: Vertex2f::new(
            vectors.bottom.x as f32 * 0.5 / w,
            vectors.bottom.y as f32 * 0.5 / h,
        ),
    }
}

/// Appends the 24 vertices of `mb` to `ycbcr`, and its reference offsets to both `motion`
/// streams. Streams the class of `mb` does not use get zero offsets.
pub fn gen_macroblock_verts(
    mb: &BatchedMacroblock,
    layout: &MacroblockLayout,
    ycbcr: &mut VertexStream<YCbCrVertex>,
    motion: &mut [VertexStream<MotionVertex>; 2],
) {
    let interlaced = mb.dct_type == DctType::Field;
    let half_mb = MACROBLOCK_WIDTH / 2;
    let half_block = BLOCK_WIDTH / 2;

    let chroma_block = |coded: bool, zero_block: Option<BlockPos>| match zero_block {
        Some(zb) if !coded => zb,
        _ => BlockPos::new(mb.mbx, mb.mby),
    };
    let cb_block = chroma_block(cb_block_coded(mb.cbp), layout.zero_blocks[Plane::Cb.index()]);
    let cr_block = chroma_block(cr_block_coded(mb.cbp), layout.zero_blocks[Plane::Cr.index()]);

    for qy in 0..2 {
        for qx in 0..2 {
            let luma_block = match layout.zero_blocks[Plane::Y.index()] {
                Some(zb) if !interlaced && !luma_block_coded(mb.cbp, qx, qy) => zb,
                _ => BlockPos::new(mb.mbx * 2 + qx, mb.mby * 2 + qy),
            };

            for (cx, cy) in QUADRANT_CORNERS {
                // Offset of the corner within the macroblock, in luma samples.
                let x = qx * half_mb + cx * half_mb;
                let y = qy * half_mb + cy * half_mb;

                let pos = normalize(
                    mb.mbx * MACROBLOCK_WIDTH + x,
                    mb.mby * MACROBLOCK_HEIGHT + y,
                    layout.target,
                );

                // Field coded luma is fetched from the top field half of the macroblock. The
                // fragment program moves odd lines to the bottom field half.
                let luma_tc = if interlaced {
                    normalize(
                        mb.mbx * MACROBLOCK_WIDTH + x,
                        mb.mby * MACROBLOCK_HEIGHT + y / 2,
                        layout.luma,
                    )
                } else {
                    normalize(
                        luma_block.bx * BLOCK_WIDTH + cx * BLOCK_WIDTH,
                        luma_block.by * BLOCK_HEIGHT + cy * BLOCK_HEIGHT,
                        layout.luma,
                    )
                };

                let chroma_tc = |block: BlockPos| {
                    normalize(
                        block.bx * BLOCK_WIDTH + qx * half_block + cx * half_block,
                        block.by * BLOCK_HEIGHT + qy * half_block + cy * half_block,
                        layout.chroma,
                    )
                };

                ycbcr.push(YCbCrVertex {
                    pos,
                    luma_tc,
                    cb_tc: chroma_tc(cb_block),
                    cr_tc: chroma_tc(cr_block),
                    interlaced: if interlaced { 1.0 } else { 0.0 },
                });
            }
        }
    }

    for (i, stream) in motion.iter_mut().enumerate() {
        let offset = if i < mb.class.ref_frames() {
            motion_offset(&mb.vectors[i], layout.target)
        } else {
            MotionVertex::default()
        };
        for _ in 0..VERTICES_PER_MACROBLOCK {
            stream.push(offset);
        }
    }
}

/// Vertex inputs of the motion compensation programs.
const VS_I_POS: u32 = 0;
const VS_I_TEX0: u32 = 1;
const VS_I_INTERLACED: u32 = 4;
const VS_I_MV0: u32 = 5;

/// Vertex outputs, fragment inputs.
const VS_O_TEX0: u32 = 1;
const VS_O_INTERLACED: u32 = 4;
const VS_O_LINE: u32 = 5;
const VS_O_MV0: u32 = 6;

/// Sampler units of the reference surfaces.
const SAMPLER_REF0: u32 = 3;

fn create_vert_shader(ref_frames: usize, mv_per_frame: usize) -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Vertex);

    let norm = shader.decl_constant(0);
    let pos = shader.decl_vs_input(VS_I_POS);
    let tex: Vec<_> = (0..3).map(|i| shader.decl_vs_input(VS_I_TEX0 + i)).collect();
    let interlaced = shader.decl_vs_input(VS_I_INTERLACED);
    let count = (ref_frames * mv_per_frame) as u32;
    let mv: Vec<_> = (0..count).map(|i| shader.decl_vs_input(VS_I_MV0 + i)).collect();

    let o_pos = shader.decl_output(Semantic::Position, 0);
    let o_tex: Vec<_> = (0..3)
        .map(|i| shader.decl_output(Semantic::Generic, VS_O_TEX0 + i))
        .collect();
    let o_interlaced = shader.decl_output(Semantic::Generic, VS_O_INTERLACED);
    let o_line = shader.decl_output(Semantic::Generic, VS_O_LINE);
    let o_mv: Vec<_> = (0..count)
        .map(|i| shader.decl_output(Semantic::Generic, VS_O_MV0 + i))
        .collect();

    let zero_one = shader.imm4f([0.0, 0.0, 0.0, 1.0]);

    /*
     * o_pos.xy = pos
     * o_pos.zw = (0, 1)
     * o_tex[0..2] = tex[0..2]
     * o_interlaced = interlaced
     * o_line.xy = pos * surface size
     * o_mv[0..count].xy = pos + mv[0..count]
     */
    shader.mov(o_pos.writemask(WRITEMASK_XY), pos);
    shader.mov(o_pos.writemask(WRITEMASK_ZW), zero_one);
    for (o, i) in o_tex.iter().zip(&tex) {
        shader.mov(o.writemask(WRITEMASK_XY), *i);
    }
    shader.mov(o_interlaced, interlaced);
    shader.mul(o_line.writemask(WRITEMASK_XY), pos, norm.swizzle(2, 3, 2, 3));
    for (o, v) in o_mv.iter().zip(&mv) {
        shader.add(o.writemask(WRITEMASK_XY), pos, *v);
    }

    shader.build()
}

/// `field_offset` is the height of a field half of a macroblock in the luma texture, normalized.
fn create_frag_shader(ref_frames: usize, mv_per_frame: usize, field_offset: f32) -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Fragment);

    let tex: Vec<_> = (0..3)
        .map(|i| shader.decl_fs_input(VS_O_TEX0 + i, Interpolation::Linear))
        .collect();
    let interlaced = shader.decl_fs_input(VS_O_INTERLACED, Interpolation::Constant);
    let line = shader.decl_fs_input(VS_O_LINE, Interpolation::Linear);
    let mv: Vec<_> = (0..(ref_frames * mv_per_frame) as u32)
        .map(|i| shader.decl_fs_input(VS_O_MV0 + i, Interpolation::Linear))
        .collect();

    let residuals: Vec<_> = (0..3).map(|i| shader.decl_sampler(i)).collect();
    let refs: Vec<_> = (0..ref_frames as u32)
        .map(|i| shader.decl_sampler(SAMPLER_REF0 + i))
        .collect();

    let fragment = shader.decl_output(Semantic::Color, 0);

    let field = shader.decl_temporary();
    let t_tc = shader.decl_temporary();
    let tmp = shader.decl_temporary();
    let texel = shader.decl_temporary();
    let result = shader.decl_temporary();

    let half = shader.imm1f(0.5);
    let zero = shader.imm1f(0.0);
    let offset = shader.imm1f(field_offset);

    /*
     * field.x = fract(line.y / 2) >= 0.5       bottom field line
     * t_tc = tex[0]
     * t_tc.y += field.x * interlaced * offset
     */
    shader.mul(field.writemask(WRITEMASK_X), line.scalar(1), half);
    shader.frc(field.writemask(WRITEMASK_X), field.src());
    shader.sge(field.writemask(WRITEMASK_X), field.src(), half);
    shader.mul(field.writemask(WRITEMASK_Y), field.src().scalar(0), interlaced.scalar(0));
    shader.mov(t_tc, tex[0]);
    shader.mad(
        t_tc.writemask(WRITEMASK_Y),
        field.src().scalar(1),
        offset,
        tex[0].scalar(1),
    );

    /*
     * texel.x = tex(t_tc, residuals[0]).x
     * texel.y = tex(tex[1], residuals[1]).x
     * texel.z = tex(tex[2], residuals[2]).x
     */
    shader.mov(texel, zero);
    let coords = [t_tc.src(), tex[1], tex[2]];
    for (i, (coord, sampler)) in coords.iter().zip(&residuals).enumerate() {
        shader.tex(tmp, TextureKind::Texture2D, *coord, *sampler);
        shader.mov(texel.writemask(WRITEMASK_X << i), tmp.src().scalar(0));
    }

    /*
     * One vector per reference:  result = tex(mv[i], refs[i])
     * Two vectors per reference: result = tex(field.x ? mv[2i + 1] : mv[2i], refs[i])
     * Two references:            result = lerp(0.5, ref[0], ref[1])
     * No reference:              result = 0.5
     */
    let fetched: Vec<_> = refs
        .iter()
        .enumerate()
        .map(|(i, sampler)| {
            let dst = if ref_frames == 1 { result } else { shader.decl_temporary() };
            if mv_per_frame == 1 {
                shader.tex(dst, TextureKind::Texture2D, mv[i], *sampler);
            } else {
                shader.cmp(
                    t_tc.writemask(WRITEMASK_XY),
                    field.src().scalar(0).negate(),
                    mv[2 * i + 1],
                    mv[2 * i],
                );
                shader.tex(dst, TextureKind::Texture2D, t_tc.src(), *sampler);
            }
            dst
        })
        .collect();

    match fetched.as_slice() {
        [] => shader.mov(result, half),
        [_] => (),
        [past, future, ..] => shader.lrp(result, half, past.src(), future.src()),
    }

    /*
     * fragment = texel + result
     */
    shader.add(fragment, texel.src(), result.src());

    shader.build()
}

/// Programs and vertex layout used to draw one class.
struct ClassHandler<P: PipeContext> {
    vs: Rc<PipeObject<P>>,
    fs: Rc<PipeObject<P>>,
    vertex_elems: Rc<PipeObject<P>>,
}

impl<P: PipeContext> ClassHandler<P> {
    fn new(ctx: &Rc<P>, class: MacroblockClass, field_offset: f32) -> BackendResult<Self> {
        let (ref_frames, mv_per_frame) = (class.ref_frames(), class.mv_per_frame());

        let mut elements = YCbCrVertex::elements(0).to_vec();
        for i in 0..ref_frames {
            elements.extend(MotionVertex::elements(1 + i as u32, mv_per_frame));
        }

        Ok(Self {
            vs: Rc::new(PipeObject::shader(
                ctx,
                &create_vert_shader(ref_frames, mv_per_frame),
            )?),
            fs: Rc::new(PipeObject::shader(
                ctx,
                &create_frag_shader(ref_frames, mv_per_frame, field_offset),
            )?),
            vertex_elems: Rc::new(PipeObject::vertex_elements(ctx, &elements)?),
        })
    }
}

impl<P: PipeContext> Clone for ClassHandler<P> {
    fn clone(&self) -> Self {
        Self {
            vs: Rc::clone(&self.vs),
            fs: Rc::clone(&self.fs),
            vertex_elems: Rc::clone(&self.vertex_elems),
        }
    }
}

/// Resources a batch is built into.
struct BufferSet<P: PipeContext> {
    planes: YCbCrBuffer<P>,
    ycbcr_vb: VertexBuffer<P>,
    motion_vbs: [VertexBuffer<P>; 2],
}

impl<P: PipeContext> BufferSet<P> {
    fn new(
        ctx: &Rc<P>,
        config: &RendererConfig,
        luma_idct: &Idct<P>,
        chroma_idct: &Idct<P>,
    ) -> Result<Self, RenderError> {
        let vertices = config.macroblocks_per_batch() * VERTICES_PER_MACROBLOCK;

        let planes = YCbCrBuffer::new(
            ctx,
            luma_idct,
            chroma_idct,
            config.luma_size(),
            config.chroma_size(),
        )?;
        let ycbcr_vb = VertexBuffer::for_vertices::<YCbCrVertex>(ctx, vertices)?;
        let motion_vbs = [
            VertexBuffer::for_vertices::<MotionVertex>(ctx, vertices)?,
            VertexBuffer::for_vertices::<MotionVertex>(ctx, vertices)?,
        ];

        Ok(Self {
            planes,
            ycbcr_vb,
            motion_vbs,
        })
    }
}

/// The surfaces of the batch being built.
struct OpenSurface<P: PipeContext> {
    target: Rc<DecodeSurface<P>>,
    past: Option<Rc<DecodeSurface<P>>>,
    future: Option<Rc<DecodeSurface<P>>>,
}

fn same_surface<P: PipeContext>(
    a: Option<&Rc<DecodeSurface<P>>>,
    b: Option<&Rc<DecodeSurface<P>>>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

pub struct McRenderer<P: PipeContext> {
    ctx: Rc<P>,
    config: RendererConfig,
    target_size: Resolution,

    batch: BatchState,
    open: Option<OpenSurface<P>>,
    buffer_sets: Vec<BufferSet<P>>,
    current: usize,

    fb_state: FramebufferState,
    viewport: Viewport,
    handlers: Vec<ClassHandler<P>>,
    /// Residual samplers for Y, Cb and Cr, then the two reference samplers.
    samplers: Vec<PipeObject<P>>,
    vs_consts: PipeObject<P>,

    luma_idct: Idct<P>,
    chroma_idct: Idct<P>,
}

impl<P: PipeContext> McRenderer<P> {
    /// Creates a renderer with its own IDCT basis texture.
    pub fn new(ctx: &Rc<P>, config: RendererConfig) -> Result<Self, RenderError> {
        let matrix = IdctMatrix::upload(ctx)?;
        Self::with_idct_matrix(ctx, config, matrix)
    }

    /// Creates a renderer using an IDCT basis texture shared with other renderers.
    ///
    /// Every object created is released if construction fails.
    pub fn with_idct_matrix(
        ctx: &Rc<P>,
        config: RendererConfig,
        matrix: Rc<IdctMatrix<P>>,
    ) -> Result<Self, RenderError> {
        if config.empty_block_policy == EmptyBlockPolicy::ConditionalFetch {
            return Err(RenderError::UnsupportedPolicy(config.empty_block_policy));
        }
        if config.chroma_format != ChromaFormat::Yuv420 {
            return Err(RenderError::UnsupportedChromaFormat(config.chroma_format));
        }

        let luma_size = config.luma_size();
        let chroma_size = config.chroma_size();
        let formats = IdctFormats::negotiate(ctx.as_ref())?;

        let luma_idct = Idct::init(
            ctx,
            formats,
            luma_size.width,
            luma_size.height,
            luma_size.width / BLOCK_WIDTH,
            luma_size.height / BLOCK_HEIGHT,
            Rc::clone(&matrix),
        )?;
        let chroma_idct = Idct::init(
            ctx,
            formats,
            chroma_size.width,
            chroma_size.height,
            chroma_size.width / BLOCK_WIDTH,
            chroma_size.height / BLOCK_HEIGHT,
            matrix,
        )?;

        let mut samplers = Vec::with_capacity(5);
        for filter in [
            Filter::Nearest,
            Filter::Nearest,
            Filter::Nearest,
            Filter::Linear,
            Filter::Linear,
        ] {
            samplers.push(PipeObject::sampler_state(ctx, &SamplerDesc::clamped(filter))?);
        }

        // Classes with the same number of references and vectors share their programs.
        let field_offset = BLOCK_HEIGHT as f32 / luma_size.height as f32;
        let mut shared: HashMap<(usize, usize), ClassHandler<P>> = HashMap::new();
        let mut handlers = Vec::with_capacity(MacroblockClass::COUNT);
        for class in MacroblockClass::ALL {
            let key = (class.ref_frames(), class.mv_per_frame());
            let handler = match shared.get(&key) {
                Some(handler) => handler.clone(),
                None => {
                    let handler = ClassHandler::new(ctx, class, field_offset)?;
                    shared.insert(key, handler.clone());
                    handler
                }
            };
            handlers.push(handler);
        }

        let vs_consts = PipeObject::buffer(
            ctx,
            &BufferDesc {
                size: 16,
                bind: BindFlags::CONSTANT_BUFFER,
                usage: ResourceUsage::Dynamic,
            },
        )?;

        let num_buffer_sets = config.num_buffer_sets.max(1);
        let mut buffer_sets = Vec::with_capacity(num_buffer_sets);
        for _ in 0..num_buffer_sets {
            buffer_sets.push(BufferSet::new(ctx, &config, &luma_idct, &chroma_idct)?);
        }

        debug!(
            "MC renderer for {}x{}: {} macroblocks per batch, {} buffer sets, {:?}",
            config.picture.width,
            config.picture.height,
            config.macroblocks_per_batch(),
            num_buffer_sets,
            config.empty_block_policy
        );

        Ok(Self {
            ctx: Rc::clone(ctx),
            target_size: config.target_size(),
            batch: BatchState::new(config.macroblocks_per_batch()),
            config,
            open: None,
            buffer_sets,
            current: 0,
            fb_state: Default::default(),
            viewport: Default::default(),
            handlers,
            samplers,
            vs_consts,
            luma_idct,
            chroma_idct,
        })
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    pub fn batch(&self) -> &BatchState {
        &self.batch
    }

    /// Size the decode surfaces must have.
    pub fn target_size(&self) -> Resolution {
        self.target_size
    }

    /// Index of the buffer set the current batch is built into.
    pub fn current_buffer_set(&self) -> usize {
        self.current
    }

    fn layout(&self) -> MacroblockLayout {
        let planes = &self.buffer_sets[self.current].planes;
        let zero_blocks = match self.config.empty_block_policy {
            EmptyBlockPolicy::SharedZeroBlock => Plane::ALL.map(|p| planes.zero_block(p)),
            _ => [None; 3],
        };

        MacroblockLayout {
            target: self.target_size,
            luma: planes.plane_size(Plane::Y),
            chroma: planes.plane_size(Plane::Cb),
            zero_blocks,
        }
    }

    /// Zero block of `plane` in the current batch, if one has been written.
    pub fn zero_block(&self, plane: Plane) -> Option<BlockPos> {
        self.buffer_sets[self.current].planes.zero_block(plane)
    }

    /// Decodes `macroblocks` into `target`, predicting from `past` and `future`.
    ///
    /// Submitting to another surface than the one of the current batch flushes that batch first.
    /// Macroblocks are checked before anything is done with them, so an error leaves the batch as
    /// it was. If the flush of a full batch fails, the macroblocks submitted until then stay in the
    /// batch and the next call retries the flush before adding to it.
    pub fn submit(
        &mut self,
        target: &Rc<DecodeSurface<P>>,
        past: Option<&Rc<DecodeSurface<P>>>,
        future: Option<&Rc<DecodeSurface<P>>>,
        macroblocks: &[Macroblock],
    ) -> Result<(), RenderError> {
        if target.size() != self.target_size {
            return Err(RenderError::SurfaceSizeMismatch);
        }

        let (width, height) = self.config.picture.in_macroblocks();
        for mb in macroblocks {
            mb.validate()?;
            if mb.mbx >= width || mb.mby >= height {
                return Err(RenderError::OutOfBounds {
                    mbx: mb.mbx,
                    mby: mb.mby,
                });
            }
            let class = mb.class();
            if (class.uses_past() && past.is_none()) || (class.uses_future() && future.is_none()) {
                return Err(RenderError::MissingReference(class));
            }
        }

        if let Some(open) = &self.open {
            if !Rc::ptr_eq(&open.target, target) {
                debug!("target surface changed, flushing");
                self.flush()?;
            } else if !same_surface(open.past.as_ref(), past)
                || !same_surface(open.future.as_ref(), future)
            {
                return Err(RenderError::ReferenceMismatch);
            }
        }

        for mb in macroblocks {
            if self.batch.is_full() {
                self.flush()?;
            }
            if self.open.is_none() {
                self.open_surface(target, past, future)?;
            }

            self.buffer_sets[self.current].planes.map()?;
            self.grab_blocks(mb);
            self.batch.push(BatchedMacroblock::from(mb));

            if self.batch.is_full() {
                self.flush()?;
            }
        }

        Ok(())
    }

    fn open_surface(
        &mut self,
        target: &Rc<DecodeSurface<P>>,
        past: Option<&Rc<DecodeSurface<P>>>,
        future: Option<&Rc<DecodeSurface<P>>>,
    ) -> BackendResult<()> {
        let size = target.size();

        let mut transfer = self.vs_consts.map(true)?;
        LittleEndian::write_f32_into(
            &[
                1.0 / size.width as f32,
                1.0 / size.height as f32,
                size.width as f32,
                size.height as f32,
            ],
            &mut transfer.data[..16],
        );
        self.ctx.transfer_unmap(transfer);

        self.fb_state = FramebufferState {
            width: size.width,
            height: size.height,
            cbufs: vec![target.render_target()],
        };
        self.viewport = Viewport::for_target(size.width, size.height);
        self.buffer_sets[self.current].planes.reset_zero_blocks();
        self.open = Some(OpenSurface {
            target: Rc::clone(target),
            past: past.cloned(),
            future: future.cloned(),
        });

        trace!("opened surface {}", target.render_target());
        Ok(())
    }

    /// Writes the blocks of `mb` into the planes, applying the empty block policy to the blocks
    /// it does not code.
    fn grab_blocks(&mut self, mb: &Macroblock) {
        let policy = self.config.empty_block_policy;
        let planes = &mut self.buffer_sets[self.current].planes;
        let mut blocks = mb.blocks.chunks_exact(BLOCK_SIZE);

        // Field coded luma blocks are interleaved, so they cannot be replaced by another block.
        let luma_shareable = mb.dct_type == DctType::Frame;

        for y in 0..2 {
            for x in 0..2 {
                let pos = BlockPos::new(mb.mbx * 2 + x, mb.mby * 2 + y);
                if luma_block_coded(mb.cbp, x, y) {
                    planes.write_block(Plane::Y, pos, blocks.next());
                } else {
                    empty_block(planes, policy, Plane::Y, pos, luma_shareable);
                }
            }
        }

        let pos = BlockPos::new(mb.mbx, mb.mby);
        for (plane, coded) in [
            (Plane::Cb, cb_block_coded(mb.cbp)),
            (Plane::Cr, cr_block_coded(mb.cbp)),
        ] {
            if coded {
                planes.write_block(plane, pos, blocks.next());
            } else {
                empty_block(planes, policy, plane, pos, true);
            }
        }
    }

    /// Renders the current batch, if any.
    ///
    /// If the vertex buffers cannot be mapped, the error is returned and the batch is kept so the
    /// flush can be retried.
    pub fn flush(&mut self) -> Result<(), RenderError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let Some(open) = self.open.as_ref() else {
            return Ok(());
        };

        let layout = self.layout();
        let ranges = self.batch.draw_ranges();
        let num_vertices = self.batch.len() * VERTICES_PER_MACROBLOCK;

        let mut ycbcr = VertexStream::new(num_vertices);
        let mut motion = [
            VertexStream::new(num_vertices),
            VertexStream::new(num_vertices),
        ];
        for (class, _, _) in &ranges {
            for mb in self.batch.iter_class(*class) {
                gen_macroblock_verts(mb, &layout, &mut ycbcr, &mut motion);
            }
        }

        let set = &mut self.buffer_sets[self.current];
        let mut resources = vec![
            set.ycbcr_vb.resource(),
            set.motion_vbs[0].resource(),
            set.motion_vbs[1].resource(),
        ];
        resources.extend(Plane::ALL.map(|p| set.planes.instance_buffer(p)));

        let mut transfers = map_all(self.ctx.as_ref(), &resources, true)?;
        ycbcr.upload(&mut transfers[0], 0);
        motion[0].upload(&mut transfers[1], 0);
        motion[1].upload(&mut transfers[2], 0);
        for (plane, transfer) in Plane::ALL.iter().zip(transfers[3..].iter_mut()) {
            write_vertices(transfer, 0, set.planes.instances(*plane).vertices());
        }
        for transfer in transfers {
            self.ctx.transfer_unmap(transfer);
        }

        set.planes.unmap();
        set.planes.flush_idct(Plane::Y, &self.luma_idct);
        set.planes.flush_idct(Plane::Cb, &self.chroma_idct);
        set.planes.flush_idct(Plane::Cr, &self.chroma_idct);

        let ctx = &self.ctx;
        ctx.set_framebuffer_state(&self.fb_state);
        ctx.set_viewport_state(&self.viewport);
        ctx.set_constant_buffer(ShaderStage::Vertex, 0, Some(self.vs_consts.handle()));

        let vertex_buffers = [
            set.ycbcr_vb.binding(),
            set.motion_vbs[0].binding(),
            set.motion_vbs[1].binding(),
        ];
        let samplers: Vec<RawHandle> = self.samplers.iter().map(|s| s.handle()).collect();

        for (class, start, count) in &ranges {
            let handler = &self.handlers[class.index()];
            let ref_frames = class.ref_frames();

            let mut views = vec![
                set.planes.residual_view(Plane::Y),
                set.planes.residual_view(Plane::Cb),
                set.planes.residual_view(Plane::Cr),
            ];
            match (class.uses_past(), class.uses_future()) {
                (true, true) => views.extend(
                    [open.past.as_ref(), open.future.as_ref()]
                        .into_iter()
                        .flatten()
                        .map(|s| s.view()),
                ),
                (true, false) => views.extend(open.past.as_ref().map(|s| s.view())),
                (false, true) => views.extend(open.future.as_ref().map(|s| s.view())),
                (false, false) => (),
            }

            ctx.set_vertex_buffers(&vertex_buffers[..1 + ref_frames]);
            ctx.bind_vertex_elements_state(handler.vertex_elems.handle());
            ctx.set_fragment_sampler_views(&views);
            ctx.bind_fragment_sampler_states(&samplers[..3 + ref_frames]);
            ctx.bind_vs_state(handler.vs.handle());
            ctx.bind_fs_state(handler.fs.handle());
            ctx.draw_arrays(PrimitiveType::Triangles, *start, *count);

            trace!("drew {} {:?} vertices from {}", count, class, start);
        }

        let fence = ctx.flush();
        debug!(
            "flushed {} macroblocks into surface {} ({:?})",
            self.batch.len(),
            open.target.render_target(),
            self.batch.counts()
        );

        if let Ok(fence) = &fence {
            open.target.set_fence(*fence);
        }

        set.planes.clear_instances();
        set.planes.reset_zero_blocks();
        self.batch.clear();
        self.open = None;
        self.current = (self.current + 1) % self.buffer_sets.len();

        fence?;
        Ok(())
    }
}

/// Applies `policy` to the empty block at `pos`. `shareable` is false for blocks that must keep
/// their own location.
fn empty_block<P: PipeContext>(
    planes: &mut YCbCrBuffer<P>,
    policy: EmptyBlockPolicy,
    plane: Plane,
    pos: BlockPos,
    shareable: bool,
) {
    if policy != EmptyBlockPolicy::SharedZeroBlock || !shareable {
        planes.write_block(plane, pos, None);
        return;
    }

    match planes.zero_block(plane) {
        Some(_) => planes.skip_block(plane, pos),
        None => {
            planes.write_block(plane, pos, None);
            planes.set_zero_block(plane, pos);
        }
    }
}

impl<P: PipeContext> Drop for McRenderer<P> {
    fn drop(&mut self) {
        if !self.batch.is_empty() {
            warn!(
                "dropping MC renderer with {} macroblocks not rendered",
                self.batch.len()
            );
        }
    }
}
