// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Vertex formats and vertex buffers.
//!
//! Geometry is accumulated on the CPU into [`VertexStream`]s while macroblocks are submitted, and
//! copied into mapped [`VertexBuffer`]s right before the draws that consume them.

use std::rc::Rc;

use byteorder::ByteOrder;
use byteorder::LittleEndian;

use crate::backend::object::PipeObject;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::BufferDesc;
use crate::backend::Format;
use crate::backend::PipeContext;
use crate::backend::ResourceUsage;
use crate::backend::Transfer;
use crate::backend::VertexBufferBinding;
use crate::backend::VertexElement;

/// A vertex attribute layout that can be serialized into a vertex buffer.
pub trait Vertex: Copy {
    /// Size in bytes of one vertex.
    const STRIDE: u32;

    /// Writes this vertex at the start of `out`, which is at least `STRIDE` bytes long.
    fn write_to(&self, out: &mut [u8]);
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Vertex2f {
    pub x: f32,
    pub y: f32,
}

impl Vertex2f {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Add for Vertex2f {
    type Output = Vertex2f;

    fn add(self, rhs: Self) -> Self::Output {
        Vertex2f::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl Vertex for Vertex2f {
    const STRIDE: u32 = 8;

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_f32_into(&[self.x, self.y], &mut out[..8]);
    }
}

/// Per-vertex data of the motion compensation draws.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct YCbCrVertex {
    /// Position in the destination surface, normalized.
    pub pos: Vertex2f,
    /// Where to fetch the luma residual, normalized to the luma texture.
    pub luma_tc: Vertex2f,
    pub cb_tc: Vertex2f,
    pub cr_tc: Vertex2f,
    /// 1.0 if the macroblock is field coded, 0.0 otherwise.
    pub interlaced: f32,
}

impl YCbCrVertex {
    pub fn elements(vertex_buffer_index: u32) -> [VertexElement; 5] {
        let element = |src_offset, src_format| VertexElement {
            src_offset,
            instance_divisor: 0,
            vertex_buffer_index,
            src_format,
        };

        [
            element(0, Format::R32G32Float),
            element(8, Format::R32G32Float),
            element(16, Format::R32G32Float),
            element(24, Format::R32G32Float),
            element(32, Format::R32Float),
        ]
    }
}

impl Vertex for YCbCrVertex {
    const STRIDE: u32 = 36;

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_f32_into(
            &[
                self.pos.x,
                self.pos.y,
                self.luma_tc.x,
                self.luma_tc.y,
                self.cb_tc.x,
                self.cb_tc.y,
                self.cr_tc.x,
                self.cr_tc.y,
                self.interlaced,
            ],
            &mut out[..Self::STRIDE as usize],
        );
    }
}

/// Reference texture offsets of one vertex, in normalized texture units.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct MotionVertex {
    pub top: Vertex2f,
    pub bottom: Vertex2f,
}

impl MotionVertex {
    /// Elements for a class using `mv_per_frame` vectors (1 or 2) per reference.
    pub fn elements(vertex_buffer_index: u32, mv_per_frame: usize) -> Vec<VertexElement> {
        (0..mv_per_frame as u32)
            .map(|i| VertexElement {
                src_offset: i * 8,
                instance_divisor: 0,
                vertex_buffer_index,
                src_format: Format::R32G32Float,
            })
            .collect()
    }
}

impl Vertex for MotionVertex {
    const STRIDE: u32 = 16;

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_f32_into(
            &[self.top.x, self.top.y, self.bottom.x, self.bottom.y],
            &mut out[..Self::STRIDE as usize],
        );
    }
}

/// One block to transform, drawn as an instance of the unit quad.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct IdctInstance {
    /// Block coordinates, in blocks.
    pub pos: Vertex2f,
    /// Non-zero if the block must not be drawn.
    pub empty: f32,
}

impl IdctInstance {
    /// Elements for the instanced IDCT draws: the unit quad from `quad_index` and the per-block
    /// data from `instance_index`.
    pub fn elements(quad_index: u32, instance_index: u32) -> [VertexElement; 3] {
        [
            VertexElement {
                src_offset: 0,
                instance_divisor: 0,
                vertex_buffer_index: quad_index,
                src_format: Format::R32G32Float,
            },
            VertexElement {
                src_offset: 0,
                instance_divisor: 1,
                vertex_buffer_index: instance_index,
                src_format: Format::R32G32Float,
            },
            VertexElement {
                src_offset: 8,
                instance_divisor: 1,
                vertex_buffer_index: instance_index,
                src_format: Format::R32Float,
            },
        ]
    }
}

impl Vertex for IdctInstance {
    const STRIDE: u32 = 12;

    fn write_to(&self, out: &mut [u8]) {
        LittleEndian::write_f32_into(
            &[self.pos.x, self.pos.y, self.empty],
            &mut out[..Self::STRIDE as usize],
        );
    }
}

/// CPU-side accumulator of vertices, bounded by the capacity of the buffer it is uploaded to.
#[derive(Debug)]
pub struct VertexStream<V: Vertex> {
    vertices: Vec<V>,
    capacity: usize,
}

impl<V: Vertex> VertexStream<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            vertices: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, vertex: V) {
        debug_assert!(self.vertices.len() < self.capacity, "vertex stream overflow");
        self.vertices.push(vertex);
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn vertices(&self) -> &[V] {
        &self.vertices
    }

    pub fn clear(&mut self) {
        self.vertices.clear();
    }

    /// Serializes the stream into `transfer`, starting at vertex `first`. Returns the number of
    /// vertices written.
    pub fn upload(&self, transfer: &mut Transfer, first: usize) -> usize {
        write_vertices(transfer, first, &self.vertices)
    }
}

/// Serializes `vertices` into `transfer`, starting at vertex `first`.
pub fn write_vertices<V: Vertex>(transfer: &mut Transfer, first: usize, vertices: &[V]) -> usize {
    let stride = V::STRIDE as usize;
    let start = first * stride;
    let out = &mut transfer.data[start..start + vertices.len() * stride];

    for (vertex, chunk) in vertices.iter().zip(out.chunks_exact_mut(stride)) {
        vertex.write_to(chunk);
    }

    vertices.len()
}

/// A GPU buffer holding up to `capacity` vertices of `stride` bytes.
pub struct VertexBuffer<P: PipeContext> {
    buffer: PipeObject<P>,
    stride: u32,
    capacity: usize,
}

impl<P: PipeContext> VertexBuffer<P> {
    pub fn new(ctx: &Rc<P>, stride: u32, capacity: usize, usage: ResourceUsage) -> BackendResult<Self> {
        let buffer = PipeObject::buffer(
            ctx,
            &BufferDesc {
                size: stride as usize * capacity.max(1),
                bind: BindFlags::VERTEX_BUFFER,
                usage,
            },
        )?;

        Ok(Self {
            buffer,
            stride,
            capacity,
        })
    }

    /// Creates a buffer for `capacity` vertices of type `V`.
    pub fn for_vertices<V: Vertex>(ctx: &Rc<P>, capacity: usize) -> BackendResult<Self> {
        Self::new(ctx, V::STRIDE, capacity, ResourceUsage::Stream)
    }

    pub fn binding(&self) -> VertexBufferBinding {
        VertexBufferBinding {
            buffer: self.buffer.handle(),
            stride: self.stride,
            offset: 0,
        }
    }

    pub fn resource(&self) -> &PipeObject<P> {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Creates and fills the unit quad instanced by the IDCT draws, as `Quads` vertices.
pub fn upload_quad<P: PipeContext>(ctx: &Rc<P>) -> BackendResult<VertexBuffer<P>> {
    const QUAD: [Vertex2f; 4] = [
        Vertex2f { x: 0.0, y: 0.0 },
        Vertex2f { x: 1.0, y: 0.0 },
        Vertex2f { x: 1.0, y: 1.0 },
        Vertex2f { x: 0.0, y: 1.0 },
    ];

    let quad = VertexBuffer::new(ctx, Vertex2f::STRIDE, QUAD.len(), ResourceUsage::Static)?;
    let mut transfer = quad.resource().map(true)?;
    write_vertices(&mut transfer, 0, &QUAD);
    ctx.transfer_unmap(transfer);

    Ok(quad)
}
