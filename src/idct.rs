// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Two-pass inverse DCT running on the GPU.
//!
//! The transform of a block of coefficients `X` is computed as `Bᵗ · X · B`, where `B` is the 8x8
//! orthonormal DCT basis (`B[u][x] = c(u) · cos((2x + 1)uπ / 16)`). With `M = Bᵗ` uploaded as a
//! 2x8 RGBA32F texture, each output value is a dot product of two 8-wide rows, computed in a
//! fragment program as two `DP4` of texture fetches:
//!
//! 1. The matrix stage computes `T[y][u] = dot(X[u], M[y])`, the row transform of `X` stored
//!    transposed, into a 3D intermediate texture. Several rows are written per fragment using
//!    multiple render targets: row `y` of a block lands in layer `y % n`.
//! 2. The transpose stage computes `F[r][c] = dot(M[r], T[c])` into the residual plane texture.
//!
//! Both stages draw one instance of a unit quad per block. Blocks whose instance is flagged empty
//! are moved off-screen by the vertex program.
//!
//! Coefficients are uploaded in an RGBA16 texture a quarter of the plane width wide: block
//! (`bx`, `by`) covers texels `[2bx, 2bx + 2) x [8by, 8by + 8)`, each texel holding four
//! horizontally adjacent coefficients of a row. In memory this is the same as a plane-sized image
//! of 16-bit samples.

use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;
use thiserror::Error;

use crate::backend::object::PipeObject;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::BufferDesc;
use crate::backend::Filter;
use crate::backend::Format;
use crate::backend::FramebufferState;
use crate::backend::PipeContext;
use crate::backend::PrimitiveType;
use crate::backend::RawHandle;
use crate::backend::ResourceUsage;
use crate::backend::SamplerDesc;
use crate::backend::ShaderStage;
use crate::backend::TextureDesc;
use crate::backend::TextureTarget;
use crate::backend::Viewport;
use crate::shader::Interpolation;
use crate::shader::Semantic;
use crate::shader::ShaderBuilder;
use crate::shader::ShaderProgram;
use crate::shader::TextureKind;
use crate::shader::WRITEMASK_W;
use crate::shader::WRITEMASK_X;
use crate::shader::WRITEMASK_XY;
use crate::shader::WRITEMASK_Y;
use crate::shader::WRITEMASK_Z;
use crate::shader::WRITEMASK_ZW;
use crate::vertex_buffer::upload_quad;
use crate::vertex_buffer::IdctInstance;
use crate::vertex_buffer::VertexBuffer;
use crate::BLOCK_HEIGHT;
use crate::BLOCK_WIDTH;

/// Scale applied when coefficients are sampled from a snorm texture, which returns them divided
/// by 32767.
pub const SCALE_FACTOR_SNORM: f32 = 32768.0 / 256.0;
/// Scale applied when coefficients are sampled from a sscaled texture, which returns them as is.
pub const SCALE_FACTOR_SSCALED: f32 = 1.0 / 256.0;

/// Coefficient texture formats, by order of preference.
const SOURCE_FORMATS: [Format; 2] = [Format::R16G16B16A16Snorm, Format::R16G16B16A16Sscaled];

/// Intermediate texture formats, by order of preference.
const INTERMEDIATE_FORMATS: [Format; 4] = [
    Format::R16G16B16A16Float,
    Format::R16G16B16A16Snorm,
    Format::R16G16B16A16Sscaled,
    Format::R32G32B32A32Float,
];

/// Format of the residual planes written by the transpose stage.
pub const RESIDUAL_FORMAT: Format = Format::R16Snorm;

/// More than four render targets would not reduce the number of fetches any further.
const MAX_RENDER_TARGETS: u32 = 4;

#[derive(Error, Debug)]
pub enum IdctError {
    #[error("no supported format for the IDCT {0} texture")]
    NoSupportedFormat(&'static str),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Returns the DCT basis `B[u][x]`.
pub fn basis_matrix() -> [[f32; 8]; 8] {
    let mut b = [[0f32; 8]; 8];

    for (u, row) in b.iter_mut().enumerate() {
        let c = if u == 0 { (1.0f64 / 8.0).sqrt() } else { 0.5 };
        for (x, value) in row.iter_mut().enumerate() {
            let angle = ((2 * x + 1) * u) as f64 * std::f64::consts::PI / 16.0;
            *value = (c * angle.cos()) as f32;
        }
    }

    b
}

/// Returns the texels of the 2x8 matrix texture, row by row. Texel (`c`, `r`) holds
/// `M[r][4c..4c + 4]` with `M[y][v] = B[v][y]`.
pub fn matrix_texels() -> [[f32; 4]; 16] {
    let b = basis_matrix();
    let mut texels = [[0f32; 4]; 16];

    for (i, texel) in texels.iter_mut().enumerate() {
        let (r, c) = (i / 2, i % 2);
        for (j, value) in texel.iter_mut().enumerate() {
            *value = b[4 * c + j][r];
        }
    }

    texels
}

/// Texture formats and scale factors chosen for a given backend.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct IdctFormats {
    pub source: Format,
    pub intermediate: Format,
    /// Number of layers written at once by the matrix stage: 1, 2 or 4.
    pub num_render_targets: u32,
    pub matrix_scale: f32,
    pub transpose_scale: f32,
}

impl IdctFormats {
    /// Picks the first supported formats, and the scale factors that go with them.
    pub fn negotiate<P: PipeContext>(ctx: &P) -> Result<Self, IdctError> {
        let source = SOURCE_FORMATS
            .iter()
            .copied()
            .find(|f| ctx.is_format_supported(*f, TextureTarget::Texture2D, BindFlags::SAMPLER_VIEW))
            .ok_or(IdctError::NoSupportedFormat("source"))?;

        let intermediate = INTERMEDIATE_FORMATS
            .iter()
            .copied()
            .find(|f| {
                ctx.is_format_supported(
                    *f,
                    TextureTarget::Texture3D,
                    BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
                )
            })
            .ok_or(IdctError::NoSupportedFormat("intermediate"))?;

        let num_render_targets = match ctx.max_render_targets().min(MAX_RENDER_TARGETS) {
            4 => 4,
            2 | 3 => 2,
            _ => 1,
        };

        let mut matrix_scale = match source {
            Format::R16G16B16A16Sscaled => SCALE_FACTOR_SSCALED,
            _ => SCALE_FACTOR_SNORM,
        };

        // Non-float intermediates would clip the row transform, so split the scale evenly.
        let transpose_scale = if intermediate.is_float() {
            1.0
        } else {
            matrix_scale = matrix_scale.sqrt();
            matrix_scale
        };

        let formats = Self {
            source,
            intermediate,
            num_render_targets,
            matrix_scale,
            transpose_scale,
        };
        debug!("IDCT formats: {:?}", formats);

        Ok(formats)
    }
}

/// The basis matrix texture, shared by all the IDCT engines of a context.
pub struct IdctMatrix<P: PipeContext> {
    view: PipeObject<P>,
    _texture: PipeObject<P>,
}

impl<P: PipeContext> IdctMatrix<P> {
    pub fn upload(ctx: &Rc<P>) -> BackendResult<Rc<Self>> {
        let texture = PipeObject::texture(
            ctx,
            &TextureDesc {
                target: TextureTarget::Texture2D,
                format: Format::R32G32B32A32Float,
                width: 2,
                height: 8,
                depth: 1,
                bind: BindFlags::SAMPLER_VIEW,
                usage: ResourceUsage::Static,
            },
        )?;

        let mut transfer = texture.map(true)?;
        for (i, texel) in matrix_texels().iter().enumerate() {
            let row = i / 2;
            let offset = row * transfer.stride + (i % 2) * 16;
            LittleEndian::write_f32_into(texel, &mut transfer.data[offset..offset + 16]);
        }
        ctx.transfer_unmap(transfer);

        let view = PipeObject::sampler_view(ctx, &texture)?;

        Ok(Rc::new(Self {
            view,
            _texture: texture,
        }))
    }

    pub fn view(&self) -> RawHandle {
        self.view.handle()
    }
}

/// Sampler view slots of an [`IdctBuffer`].
const SLOT_MATRIX: usize = 0;
const SLOT_SOURCE: usize = 1;
const SLOT_TRANSPOSE: usize = 2;
const SLOT_INTERMEDIATE: usize = 3;

/// Per decode buffer state of the IDCT: the intermediate texture, and the framebuffers and
/// sampler views of both stages.
pub struct IdctBuffer<P: PipeContext> {
    _source_view: PipeObject<P>,
    _destination_surface: PipeObject<P>,
    _intermediate_surfaces: Vec<PipeObject<P>>,
    _intermediate_view: PipeObject<P>,
    intermediate: PipeObject<P>,
    instances: VertexBuffer<P>,
    _matrix: Rc<IdctMatrix<P>>,

    sampler_views: [RawHandle; 4],
    fb_state: [FramebufferState; 2],
    viewport: [Viewport; 2],
}

impl<P: PipeContext> IdctBuffer<P> {
    /// Buffer receiving one [`IdctInstance`] per block to transform.
    pub fn instances(&self) -> &VertexBuffer<P> {
        &self.instances
    }

    pub fn intermediate(&self) -> &PipeObject<P> {
        &self.intermediate
    }

    /// Framebuffer of the matrix stage (index 0) or transpose stage (index 1).
    pub fn framebuffer(&self, stage: usize) -> &FramebufferState {
        &self.fb_state[stage]
    }

    pub fn sampler_views(&self) -> &[RawHandle; 4] {
        &self.sampler_views
    }
}

/// IDCT engine for planes of one size.
pub struct Idct<P: PipeContext> {
    ctx: Rc<P>,
    formats: IdctFormats,
    buffer_width: u32,
    buffer_height: u32,
    max_blocks: usize,

    vs_matrix: PipeObject<P>,
    fs_matrix: PipeObject<P>,
    vs_transpose: PipeObject<P>,
    fs_transpose: PipeObject<P>,
    samplers: [PipeObject<P>; 2],
    vertex_elems: PipeObject<P>,
    quad: VertexBuffer<P>,
    consts: PipeObject<P>,
    matrix: Rc<IdctMatrix<P>>,
}

impl<P: PipeContext> Idct<P> {
    /// Creates the programs and states to transform `blocks_x` by `blocks_y` blocks of planes of
    /// `buffer_width` by `buffer_height` samples.
    ///
    /// Everything created so far is released if any creation fails.
    pub fn init(
        ctx: &Rc<P>,
        formats: IdctFormats,
        buffer_width: u32,
        buffer_height: u32,
        blocks_x: u32,
        blocks_y: u32,
        matrix: Rc<IdctMatrix<P>>,
    ) -> Result<Self, IdctError> {
        debug_assert_eq!(buffer_width % BLOCK_WIDTH, 0);
        debug_assert_eq!(buffer_height % BLOCK_HEIGHT, 0);

        let nr_rt = formats.num_render_targets;

        let samplers = [
            PipeObject::sampler_state(ctx, &SamplerDesc::clamped(Filter::Nearest))?,
            PipeObject::sampler_state(ctx, &SamplerDesc::clamped(Filter::Nearest))?,
        ];

        let vs_matrix = PipeObject::shader(ctx, &create_vert_shader(true, nr_rt))?;
        let fs_matrix = PipeObject::shader(ctx, &create_matrix_frag_shader(nr_rt))?;
        let vs_transpose = PipeObject::shader(ctx, &create_vert_shader(false, nr_rt))?;
        let fs_transpose = PipeObject::shader(ctx, &create_transpose_frag_shader(nr_rt))?;

        let vertex_elems = PipeObject::vertex_elements(ctx, &IdctInstance::elements(0, 1))?;
        let quad = upload_quad(ctx)?;

        let consts = PipeObject::buffer(
            ctx,
            &BufferDesc {
                size: 48,
                bind: BindFlags::CONSTANT_BUFFER,
                usage: ResourceUsage::Static,
            },
        )?;
        let (w, h) = (buffer_width as f32, buffer_height as f32);
        let mut transfer = consts.map(true)?;
        LittleEndian::write_f32_into(
            &[
                BLOCK_WIDTH as f32 / w,
                BLOCK_HEIGHT as f32 / h,
                0.0,
                0.0,
                4.0 / w,
                1.0 / h,
                nr_rt as f32 / h,
                1.0 / nr_rt as f32,
                formats.matrix_scale,
                formats.transpose_scale,
                0.0,
                0.0,
            ],
            &mut transfer.data[..48],
        );
        ctx.transfer_unmap(transfer);

        debug!(
            "IDCT initialized for {}x{} ({}x{} blocks, {} render targets)",
            buffer_width, buffer_height, blocks_x, blocks_y, nr_rt
        );

        Ok(Self {
            ctx: Rc::clone(ctx),
            formats,
            buffer_width,
            buffer_height,
            max_blocks: (blocks_x * blocks_y) as usize,
            vs_matrix,
            fs_matrix,
            vs_transpose,
            fs_transpose,
            samplers,
            vertex_elems,
            quad,
            consts,
            matrix,
        })
    }

    pub fn formats(&self) -> &IdctFormats {
        &self.formats
    }

    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Creates the per-buffer state transforming the coefficients of `source` into `destination`.
    ///
    /// Everything created so far is released if any creation fails.
    pub fn init_buffer(
        &self,
        source: &PipeObject<P>,
        destination: &PipeObject<P>,
    ) -> Result<IdctBuffer<P>, IdctError> {
        let ctx = &self.ctx;
        let nr_rt = self.formats.num_render_targets;
        let inter_width = self.buffer_width / 4;
        let inter_height = self.buffer_height / nr_rt;

        let intermediate = PipeObject::texture(
            ctx,
            &TextureDesc {
                target: TextureTarget::Texture3D,
                format: self.formats.intermediate,
                width: inter_width,
                height: inter_height,
                depth: nr_rt,
                bind: BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
                usage: ResourceUsage::Static,
            },
        )?;
        let intermediate_view = PipeObject::sampler_view(ctx, &intermediate)?;
        let intermediate_surfaces = (0..nr_rt)
            .map(|layer| PipeObject::surface(ctx, &intermediate, layer))
            .collect::<BackendResult<Vec<_>>>()?;

        let source_view = PipeObject::sampler_view(ctx, source)?;
        let destination_surface = PipeObject::surface(ctx, destination, 0)?;
        let instances = VertexBuffer::for_vertices::<IdctInstance>(ctx, self.max_blocks)?;

        let fb_state = [
            FramebufferState {
                width: inter_width,
                height: inter_height,
                cbufs: intermediate_surfaces.iter().map(|s| s.handle()).collect(),
            },
            FramebufferState {
                width: self.buffer_width,
                height: self.buffer_height,
                cbufs: vec![destination_surface.handle()],
            },
        ];
        let viewport = [
            Viewport::for_target(inter_width, inter_height),
            Viewport::for_target(self.buffer_width, self.buffer_height),
        ];

        let mut sampler_views = [RawHandle(0); 4];
        sampler_views[SLOT_MATRIX] = self.matrix.view();
        sampler_views[SLOT_SOURCE] = source_view.handle();
        sampler_views[SLOT_TRANSPOSE] = self.matrix.view();
        sampler_views[SLOT_INTERMEDIATE] = intermediate_view.handle();

        Ok(IdctBuffer {
            _source_view: source_view,
            _destination_surface: destination_surface,
            _intermediate_surfaces: intermediate_surfaces,
            _intermediate_view: intermediate_view,
            intermediate,
            instances,
            _matrix: Rc::clone(&self.matrix),
            sampler_views,
            fb_state,
            viewport,
        })
    }

    /// Transforms the first `instance_count` blocks listed in the instance buffer of `buffer`.
    ///
    /// Does nothing if `instance_count` is 0.
    pub fn flush(&self, buffer: &IdctBuffer<P>, instance_count: u32) {
        if instance_count == 0 {
            return;
        }

        let ctx = &self.ctx;
        let vertex_buffers = [self.quad.binding(), buffer.instances.binding()];
        let samplers = [self.samplers[0].handle(), self.samplers[1].handle()];

        ctx.set_vertex_buffers(&vertex_buffers);
        ctx.bind_vertex_elements_state(self.vertex_elems.handle());
        ctx.set_constant_buffer(ShaderStage::Vertex, 0, Some(self.consts.handle()));
        ctx.set_constant_buffer(ShaderStage::Fragment, 0, Some(self.consts.handle()));
        ctx.bind_fragment_sampler_states(&samplers);

        // Matrix stage.
        ctx.set_framebuffer_state(&buffer.fb_state[0]);
        ctx.set_viewport_state(&buffer.viewport[0]);
        ctx.set_fragment_sampler_views(&buffer.sampler_views[SLOT_MATRIX..=SLOT_SOURCE]);
        ctx.bind_vs_state(self.vs_matrix.handle());
        ctx.bind_fs_state(self.fs_matrix.handle());
        ctx.draw_arrays_instanced(PrimitiveType::Quads, 0, 4, 0, instance_count);

        // Transpose stage.
        ctx.set_framebuffer_state(&buffer.fb_state[1]);
        ctx.set_viewport_state(&buffer.viewport[1]);
        ctx.set_fragment_sampler_views(&buffer.sampler_views[SLOT_TRANSPOSE..=SLOT_INTERMEDIATE]);
        ctx.bind_vs_state(self.vs_transpose.handle());
        ctx.bind_fs_state(self.fs_transpose.handle());
        ctx.draw_arrays_instanced(PrimitiveType::Quads, 0, 4, 0, instance_count);
    }
}

/// Vertex inputs.
const VS_I_RECT: u32 = 0;
const VS_I_BLOCK: u32 = 1;
const VS_I_EMPTY: u32 = 2;

/// Outputs of the vertex program, inputs of the fragment programs.
const VS_O_LOCAL: u32 = 1;
const VS_O_ORIGIN: u32 = 2;

/// Both stages share this program. It places the unit quad over the block, culls empty blocks and
/// outputs the position of the current fragment within the block, along with the first texel of
/// the block in the texture read by the stage: the coefficients for the matrix stage, the
/// intermediate result for the transpose stage.
fn create_vert_shader(matrix_stage: bool, nr_rt: u32) -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Vertex);

    let rect = shader.decl_vs_input(VS_I_RECT);
    let block = shader.decl_vs_input(VS_I_BLOCK);
    let empty = shader.decl_vs_input(VS_I_EMPTY);
    let block_size = shader.decl_constant(0);

    let o_pos = shader.decl_output(Semantic::Position, 0);
    let o_local = shader.decl_output(Semantic::Generic, VS_O_LOCAL);
    let o_origin = shader.decl_output(Semantic::Generic, VS_O_ORIGIN);

    let t_pos = shader.decl_temporary();

    /*
     * o_pos.xy = (block + rect) * block_size
     * o_pos.zw = (0, 1)
     * if (empty)
     *    o_pos = (-1, -1, 0, 1)
     * o_local.xy = rect * 8
     * o_origin.xy = block * texels per block
     */
    let zero_one = shader.imm4f([0.0, 0.0, 0.0, 1.0]);
    let offscreen = shader.imm4f([-1.0, -1.0, 0.0, 1.0]);
    let eight = shader.imm2f(BLOCK_WIDTH as f32, BLOCK_HEIGHT as f32);
    let texels_per_block = if matrix_stage {
        shader.imm2f(2.0, BLOCK_HEIGHT as f32)
    } else {
        shader.imm2f(2.0, (BLOCK_HEIGHT / nr_rt) as f32)
    };

    shader.add(t_pos.writemask(WRITEMASK_XY), block, rect);
    shader.mul(o_pos.writemask(WRITEMASK_XY), t_pos.src(), block_size);
    shader.mov(o_pos.writemask(WRITEMASK_ZW), zero_one);

    shader.if_(empty.scalar(0));
    shader.mov(o_pos, offscreen);
    shader.endif();

    shader.mul(o_local.writemask(WRITEMASK_XY), rect, eight);
    shader.mul(o_origin.writemask(WRITEMASK_XY), block, texels_per_block);

    shader.build()
}

/// Row transform: each fragment produces four values of `nr_rt` rows of the transposed result, one
/// per render target.
fn create_matrix_frag_shader(nr_rt: u32) -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Fragment);

    let local = shader.decl_fs_input(VS_O_LOCAL, Interpolation::Linear);
    let origin = shader.decl_fs_input(VS_O_ORIGIN, Interpolation::Constant);
    let texel_size = shader.decl_constant(1);
    let scale = shader.decl_constant(2);
    let matrix = shader.decl_sampler(0);
    let source = shader.decl_sampler(1);

    let outputs: Vec<_> = (0..nr_rt)
        .map(|l| shader.decl_output(Semantic::Color, l))
        .collect();

    let t_pos = shader.decl_temporary();
    let t_tc = shader.decl_temporary();
    let m = [shader.decl_temporary(), shader.decl_temporary()];
    let x = [shader.decl_temporary(), shader.decl_temporary()];
    let acc = shader.decl_temporary();
    let t_out = shader.decl_temporary();

    let four = shader.imm1f(4.0);
    let split = shader.imm2f(0.25, 1.0 / nr_rt as f32);
    let rows_per_rt = shader.imm1f(nr_rt as f32);
    let matrix_row = shader.imm2f(1.0 / 8.0, 1.0 / 16.0);
    let matrix_cols = shader.imm2f(0.25, 0.75);

    /*
     * t_pos.x = floor(local.x / 4) * 4     first coefficient row u of this texel
     * t_pos.y = floor(local.y / nr_rt)     texel row within the layer
     */
    shader.mul(t_pos.writemask(WRITEMASK_XY), local, split);
    shader.flr(t_pos.writemask(WRITEMASK_XY), t_pos.src());
    shader.mul(t_pos.writemask(WRITEMASK_X), t_pos.src(), four);

    for (l, output) in outputs.iter().enumerate() {
        let layer = shader.imm1f(l as f32);

        /*
         * y = t_pos.y * nr_rt + l
         * m[0..1] = tex(matrix, ((0.25, 0.75), (y + 0.5) / 8))
         */
        shader.mad(t_pos.writemask(WRITEMASK_Z), t_pos.src().scalar(1), rows_per_rt, layer);
        shader.mad(
            t_tc.writemask(WRITEMASK_Y),
            t_pos.src().scalar(2),
            matrix_row.scalar(0),
            matrix_row.scalar(1),
        );
        for (c, m) in m.iter().enumerate() {
            shader.mov(t_tc.writemask(WRITEMASK_X), matrix_cols.scalar(c as u8));
            shader.tex(*m, TextureKind::Texture2D, t_tc.src(), matrix);
        }

        for j in 0..4u8 {
            /*
             * row = origin.y + t_pos.x + j + 0.5
             * x[0..1] = tex(source, ((origin.x + 0.5 + (0, 1)), row) * texel_size)
             * output[j] = dot(x[0], m[0]) + dot(x[1], m[1])
             */
            let offset = shader.imm1f(j as f32 + 0.5);
            shader.add(t_tc.writemask(WRITEMASK_Y), origin.scalar(1), t_pos.src().scalar(0));
            shader.add(t_tc.writemask(WRITEMASK_Y), t_tc.src(), offset);
            shader.mul(t_tc.writemask(WRITEMASK_Y), t_tc.src(), texel_size.scalar(1));
            for (c, x) in x.iter().enumerate() {
                let col = shader.imm1f(c as f32 + 0.5);
                shader.add(t_tc.writemask(WRITEMASK_X), origin.scalar(0), col);
                shader.mul(t_tc.writemask(WRITEMASK_X), t_tc.src(), texel_size.scalar(0));
                shader.tex(*x, TextureKind::Texture2D, t_tc.src(), source);
            }

            shader.dp4(acc.writemask(WRITEMASK_X), x[0].src(), m[0].src());
            shader.dp4(acc.writemask(WRITEMASK_Y), x[1].src(), m[1].src());
            shader.add(
                t_out.writemask(1 << j),
                acc.src().scalar(0),
                acc.src().scalar(1),
            );
        }

        shader.mul(*output, t_out.src(), scale.scalar(0));
    }

    shader.build()
}

/// Column transform: each fragment produces one residual sample.
fn create_transpose_frag_shader(nr_rt: u32) -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Fragment);

    let local = shader.decl_fs_input(VS_O_LOCAL, Interpolation::Linear);
    let origin = shader.decl_fs_input(VS_O_ORIGIN, Interpolation::Constant);
    let texel_size = shader.decl_constant(1);
    let scale = shader.decl_constant(2);
    let transpose = shader.decl_sampler(0);
    let intermediate = shader.decl_sampler(1);
    let fragment = shader.decl_output(Semantic::Color, 0);

    let t_pos = shader.decl_temporary();
    let t_tc = shader.decl_temporary();
    let m = [shader.decl_temporary(), shader.decl_temporary()];
    let t = [shader.decl_temporary(), shader.decl_temporary()];
    let acc = shader.decl_temporary();

    let half = shader.imm1f(0.5);
    let matrix_row = shader.imm2f(1.0 / 8.0, 1.0 / 16.0);
    let matrix_cols = shader.imm2f(0.25, 0.75);
    let inv_rt = shader.imm1f(1.0 / nr_rt as f32);
    let layer_center = shader.imm1f(0.5 / nr_rt as f32);

    /*
     * t_pos.xy = floor(local)              column c and row r of the sample
     * m[0..1] = tex(transpose, ((0.25, 0.75), (r + 0.5) / 8))
     */
    shader.flr(t_pos.writemask(WRITEMASK_XY), local);
    shader.mad(
        t_tc.writemask(WRITEMASK_Y),
        t_pos.src().scalar(1),
        matrix_row.scalar(0),
        matrix_row.scalar(1),
    );
    for (c, m) in m.iter().enumerate() {
        shader.mov(t_tc.writemask(WRITEMASK_X), matrix_cols.scalar(c as u8));
        shader.tex(*m, TextureKind::Texture2D, t_tc.src(), transpose);
    }

    /*
     * Row c of the intermediate result is in layer c % nr_rt, row c / nr_rt of the block.
     *
     * t_pos.z = fract(c / nr_rt)           normalized layer
     * t_pos.w = floor(c / nr_rt)
     * t_tc.y = (origin.y + t_pos.w + 0.5) * texel_size.z
     * t_tc.z = t_pos.z + 0.5 / nr_rt
     * t[0..1] = tex(intermediate, ((origin.x + 0.5 + (0, 1)) * texel_size.x, t_tc.yz))
     */
    shader.mul(t_pos.writemask(WRITEMASK_Z), t_pos.src().scalar(0), inv_rt);
    shader.flr(t_pos.writemask(WRITEMASK_W), t_pos.src().scalar(2));
    shader.frc(t_pos.writemask(WRITEMASK_Z), t_pos.src().scalar(2));
    shader.add(t_tc.writemask(WRITEMASK_Y), origin.scalar(1), t_pos.src().scalar(3));
    shader.add(t_tc.writemask(WRITEMASK_Y), t_tc.src(), half);
    shader.mul(t_tc.writemask(WRITEMASK_Y), t_tc.src(), texel_size.scalar(2));
    shader.add(t_tc.writemask(WRITEMASK_Z), t_pos.src().scalar(2), layer_center);
    for (c, t) in t.iter().enumerate() {
        let col = shader.imm1f(c as f32 + 0.5);
        shader.add(t_tc.writemask(WRITEMASK_X), origin.scalar(0), col);
        shader.mul(t_tc.writemask(WRITEMASK_X), t_tc.src(), texel_size.scalar(0));
        shader.tex(*t, TextureKind::Texture3D, t_tc.src(), intermediate);
    }

    /*
     * fragment.x = (dot(m[0], t[0]) + dot(m[1], t[1])) * scale.y
     */
    shader.dp4(acc.writemask(WRITEMASK_X), m[0].src(), t[0].src());
    shader.dp4(acc.writemask(WRITEMASK_Y), m[1].src(), t[1].src());
    shader.add(acc.writemask(WRITEMASK_X), acc.src().scalar(0), acc.src().scalar(1));
    shader.mul(fragment.writemask(WRITEMASK_X), acc.src().scalar(0), scale.scalar(1));

    shader.build()
}
