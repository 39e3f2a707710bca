// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Color conversion blit of decoded surfaces.

use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use log::debug;

use crate::backend::object::PipeObject;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::BufferDesc;
use crate::backend::Fence;
use crate::backend::Filter;
use crate::backend::Format;
use crate::backend::FramebufferState;
use crate::backend::PipeContext;
use crate::backend::PrimitiveType;
use crate::backend::ResourceUsage;
use crate::backend::SamplerDesc;
use crate::backend::ShaderStage;
use crate::backend::VertexElement;
use crate::backend::Viewport;
use crate::shader::Interpolation;
use crate::shader::Semantic;
use crate::shader::ShaderBuilder;
use crate::shader::ShaderProgram;
use crate::shader::TextureKind;
use crate::shader::WRITEMASK_W;
use crate::shader::WRITEMASK_X;
use crate::surface::DecodeSurface;
use crate::vertex_buffer::write_vertices;
use crate::vertex_buffer::Vertex;
use crate::vertex_buffer::Vertex2f;
use crate::vertex_buffer::VertexBuffer;
use crate::Resolution;

/// Color matrix the Y, Cb and Cr samples of a surface were encoded with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorStandard {
    /// Samples are copied to R, G and B unchanged.
    Identity,
    #[default]
    Bt601,
    Bt709,
}

impl ColorStandard {
    /// Luma weights of red and blue.
    fn kr_kb(&self) -> Option<(f32, f32)> {
        match self {
            ColorStandard::Identity => None,
            ColorStandard::Bt601 => Some((0.299, 0.114)),
            ColorStandard::Bt709 => Some((0.2126, 0.0722)),
        }
    }
}

/// Returns the matrix converting `(Y, Cb, Cr, 1)` into R, G and B, one row per output channel.
///
/// Inputs are normalized samples. If `full_range` is not set, luma is expected in `[16, 235]` and
/// chroma in `[16, 240]`, in 8-bit units.
pub fn csc_matrix(standard: ColorStandard, full_range: bool) -> [[f32; 4]; 3] {
    let Some((kr, kb)) = standard.kr_kb() else {
        return [
            [1.0, 0.0, 0.0, 0.0],
            [0.0, 1.0, 0.0, 0.0],
            [0.0, 0.0, 1.0, 0.0],
        ];
    };
    let kg = 1.0 - kr - kb;

    let (y_scale, y_offset, c_scale) = if full_range {
        (1.0, 0.0, 1.0)
    } else {
        (255.0 / 219.0, 16.0 / 255.0, 255.0 / 224.0)
    };
    let c_offset = 128.0 / 255.0;

    // Chroma contributions for unit Cb and Cr.
    let r_cr = 2.0 * (1.0 - kr);
    let g_cb = -2.0 * kb * (1.0 - kb) / kg;
    let g_cr = -2.0 * kr * (1.0 - kr) / kg;
    let b_cb = 2.0 * (1.0 - kb);

    let row = |cb: f32, cr: f32| {
        [
            y_scale,
            cb * c_scale,
            cr * c_scale,
            -y_scale * y_offset - (cb + cr) * c_scale * c_offset,
        ]
    };

    [row(0.0, r_cr), row(g_cb, g_cr), row(b_cb, 0.0)]
}

/// A rectangle of a surface, in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole of a surface of `size`.
    pub fn full(size: Resolution) -> Self {
        Self::new(0, 0, size.width, size.height)
    }

    /// Corners of this rectangle in the normalized space of a surface of `size`, in the order the
    /// `Quads` primitive expects.
    fn corners(&self, size: Resolution) -> [Vertex2f; 4] {
        let (w, h) = (size.width as f32, size.height as f32);
        let x0 = self.x as f32 / w;
        let y0 = self.y as f32 / h;
        let x1 = (self.x + self.width) as f32 / w;
        let y1 = (self.y + self.height) as f32 / h;

        [
            Vertex2f::new(x0, y0),
            Vertex2f::new(x1, y0),
            Vertex2f::new(x1, y1),
            Vertex2f::new(x0, y1),
        ]
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
struct BlitVertex {
    pos: Vertex2f,
    tc: Vertex2f,
}

impl Vertex for BlitVertex {
    const STRIDE: u32 = 16;

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_f32_into(
            &[self.pos.x, self.pos.y, self.tc.x, self.tc.y],
            &mut out[..Self::STRIDE as usize],
        );
    }
}

const BLIT_ELEMENTS: [VertexElement; 2] = [
    VertexElement {
        src_offset: 0,
        instance_divisor: 0,
        vertex_buffer_index: 0,
        src_format: Format::R32G32Float,
    },
    VertexElement {
        src_offset: 8,
        instance_divisor: 0,
        vertex_buffer_index: 0,
        src_format: Format::R32G32Float,
    },
];

fn create_vert_shader() -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Vertex);

    let pos = shader.decl_vs_input(0);
    let tc = shader.decl_vs_input(1);
    let o_pos = shader.decl_output(Semantic::Position, 0);
    let o_tc = shader.decl_output(Semantic::Generic, 1);

    shader.mov(o_pos, pos);
    shader.mov(o_tc, tc);

    shader.build()
}

fn create_frag_shader() -> ShaderProgram {
    let mut shader = ShaderBuilder::new(ShaderStage::Fragment);

    let tc = shader.decl_fs_input(1, Interpolation::Linear);
    let csc: Vec<_> = (0..3).map(|i| shader.decl_constant(i)).collect();
    let sampler = shader.decl_sampler(0);
    let fragment = shader.decl_output(Semantic::Color, 0);
    let texel = shader.decl_temporary();
    let one = shader.imm1f(1.0);

    /*
     * texel.xyz = tex(tc, sampler).xyz
     * texel.w = 1
     * fragment.xyz = csc * texel
     * fragment.w = 1
     */
    shader.tex(texel, TextureKind::Texture2D, tc, sampler);
    shader.mov(texel.writemask(WRITEMASK_W), one);
    for (i, row) in csc.iter().enumerate() {
        shader.dp4(fragment.writemask(WRITEMASK_X << i), texel.src(), *row);
    }
    shader.mov(fragment.writemask(WRITEMASK_W), one);

    shader.build()
}

/// Blits decoded surfaces to a display surface, converting them to RGB on the way.
pub struct Compositor<P: PipeContext> {
    ctx: Rc<P>,
    vs: PipeObject<P>,
    fs: PipeObject<P>,
    vertex_elems: PipeObject<P>,
    sampler: PipeObject<P>,
    vertices: VertexBuffer<P>,
    consts: PipeObject<P>,
}

impl<P: PipeContext> Compositor<P> {
    pub fn new(ctx: &Rc<P>) -> BackendResult<Self> {
        Ok(Self {
            ctx: Rc::clone(ctx),
            vs: PipeObject::shader(ctx, &create_vert_shader())?,
            fs: PipeObject::shader(ctx, &create_frag_shader())?,
            vertex_elems: PipeObject::vertex_elements(ctx, &BLIT_ELEMENTS)?,
            sampler: PipeObject::sampler_state(ctx, &SamplerDesc::clamped(Filter::Linear))?,
            vertices: VertexBuffer::new(ctx, BlitVertex::STRIDE, 4, ResourceUsage::Stream)?,
            consts: PipeObject::buffer(
                ctx,
                &BufferDesc {
                    size: 48,
                    bind: BindFlags::CONSTANT_BUFFER,
                    usage: ResourceUsage::Dynamic,
                },
            )?,
        })
    }

    /// Draws `src_rect` of `source` into `dst_rect` of `destination`, converting with `csc` (as
    /// returned by [`csc_matrix`]). Returns the fence of the blit, which is also recorded in
    /// `destination`.
    pub fn render(
        &self,
        source: &DecodeSurface<P>,
        src_rect: Rect,
        destination: &DecodeSurface<P>,
        dst_rect: Rect,
        csc: &[[f32; 4]; 3],
    ) -> BackendResult<Fence> {
        let positions = dst_rect.corners(destination.size());
        let tcs = src_rect.corners(source.size());
        let mut vertices = [BlitVertex::default(); 4];
        for (vertex, (pos, tc)) in vertices.iter_mut().zip(positions.into_iter().zip(tcs)) {
            *vertex = BlitVertex { pos, tc };
        }

        let mut transfer = self.vertices.resource().map(true)?;
        write_vertices(&mut transfer, 0, &vertices);
        self.ctx.transfer_unmap(transfer);

        let mut transfer = self.consts.map(true)?;
        let csc: Vec<f32> = csc.iter().flatten().copied().collect();
        LittleEndian::write_f32_into(&csc, &mut transfer.data[..48]);
        self.ctx.transfer_unmap(transfer);

        let size = destination.size();
        let ctx = &self.ctx;
        ctx.set_framebuffer_state(&FramebufferState {
            width: size.width,
            height: size.height,
            cbufs: vec![destination.render_target()],
        });
        ctx.set_viewport_state(&Viewport::for_target(size.width, size.height));
        ctx.set_vertex_buffers(&[self.vertices.binding()]);
        ctx.bind_vertex_elements_state(self.vertex_elems.handle());
        ctx.set_fragment_sampler_views(&[source.view()]);
        ctx.bind_fragment_sampler_states(&[self.sampler.handle()]);
        ctx.bind_vs_state(self.vs.handle());
        ctx.bind_fs_state(self.fs.handle());
        ctx.set_constant_buffer(ShaderStage::Fragment, 0, Some(self.consts.handle()));
        ctx.draw_arrays(PrimitiveType::Quads, 0, 4);

        let fence = ctx.flush()?;
        destination.set_fence(fence);
        debug!(
            "composited {:?} of {} into {:?} of {}",
            src_rect,
            source.render_target(),
            dst_rect,
            destination.render_target()
        );

        Ok(fence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::Command;
    use crate::backend::dummy::DummyContext;
    use crate::utils::read_f32_le;

    fn convert(csc: &[[f32; 4]; 3], ycbcr: [f32; 3]) -> [f32; 3] {
        let input = [ycbcr[0], ycbcr[1], ycbcr[2], 1.0];
        csc.map(|row| row.iter().zip(input).map(|(a, b)| a * b).sum())
    }

    fn assert_close(actual: [f32; 3], expected: [f32; 3]) {
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-4, "{:?} != {:?}", actual, expected);
        }
    }

    #[test]
    fn limited_range_white_and_black() {
        for standard in [ColorStandard::Bt601, ColorStandard::Bt709] {
            let csc = csc_matrix(standard, false);
            assert_close(
                convert(&csc, [235.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]),
                [1.0; 3],
            );
            assert_close(
                convert(&csc, [16.0 / 255.0, 128.0 / 255.0, 128.0 / 255.0]),
                [0.0; 3],
            );
        }
    }

    #[test]
    fn full_range_primaries() {
        let csc = csc_matrix(ColorStandard::Bt601, true);
        let c = 128.0 / 255.0;
        assert_close(convert(&csc, [1.0, c, c]), [1.0; 3]);

        // Pure red in BT.601.
        let cb = c - 0.299 / (2.0 * (1.0 - 0.114));
        let cr = c + 0.5;
        assert_close(convert(&csc, [0.299, cb, cr]), [1.0, 0.0, 0.0]);
    }

    #[test]
    fn identity_copies_samples() {
        let csc = csc_matrix(ColorStandard::Identity, false);
        assert_eq!(convert(&csc, [0.25, 0.5, 0.75]), [0.25, 0.5, 0.75]);
    }

    #[test]
    fn render_issues_one_quad() {
        let ctx = Rc::new(DummyContext::new());
        let compositor = Compositor::new(&ctx).unwrap();
        let source = DecodeSurface::new(&ctx, Resolution::from((64, 32))).unwrap();
        let destination = DecodeSurface::new(&ctx, Resolution::from((128, 128))).unwrap();
        ctx.take_commands();

        let csc = csc_matrix(ColorStandard::Bt709, false);
        let fence = compositor
            .render(
                &source,
                Rect::new(0, 0, 32, 32),
                &destination,
                Rect::full(destination.size()),
                &csc,
            )
            .unwrap();

        let commands = ctx.take_commands();
        let draws: Vec<_> = commands
            .iter()
            .filter(|c| matches!(c, Command::Draw { .. } | Command::DrawInstanced { .. }))
            .collect();
        assert_eq!(
            draws,
            vec![&Command::Draw {
                prim: PrimitiveType::Quads,
                start: 0,
                count: 4,
            }]
        );
        assert!(commands.contains(&Command::SetSamplerViews(vec![source.view()])));
        assert_eq!(commands.last(), Some(&Command::Flush(fence)));
        assert_eq!(destination.fence(), Some(fence));

        let mut floats = [0f32; 16];
        read_f32_le(&ctx.resource_data(compositor.vertices.resource().handle()), &mut floats);
        assert_eq!(&floats[..4], &[0.0, 0.0, 0.0, 0.0]);
        assert_eq!(&floats[8..12], &[1.0, 1.0, 0.5, 1.0]);

        let mut consts = [0f32; 12];
        read_f32_le(&ctx.resource_data(compositor.consts.handle()), &mut consts);
        assert_eq!(&consts[..4], &csc[0]);
    }
}
