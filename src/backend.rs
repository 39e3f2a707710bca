// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Graphics backend abstraction.
//!
//! A backend is a provider of GPU resources and draw calls, most likely a hardware driver exposing
//! a Gallium-like context. The decode pipeline only ever talks to the backend through the
//! [`PipeContext`] trait, which exposes exactly the operations the pipeline needs: resource
//! creation, CPU mapping, state binding, drawing and flushing.
//!
//! Objects created through the context are identified by a [`RawHandle`]. Code in this crate never
//! manipulates raw handles directly for lifetime purposes, but wraps them into an
//! [`object::PipeObject`] that returns the object to the backend when dropped.

#[cfg(test)]
pub(crate) mod dummy;
pub mod object;

use std::fmt;
use std::ops::BitOr;

use bytes::BytesMut;
use thiserror::Error;

use crate::shader::ShaderProgram;

/// Backend-side identifier of an object created through a [`PipeContext`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawHandle(pub u32);

impl fmt::Display for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The different kinds of objects a backend can create.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Texture,
    Buffer,
    SamplerView,
    Surface,
    SamplerState,
    VertexElements,
    VertexShader,
    FragmentShader,
}

/// Pixel and vertex attribute formats understood by the backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    R8G8B8A8Unorm,
    R16Snorm,
    R16Sscaled,
    R16G16B16A16Snorm,
    R16G16B16A16Sscaled,
    R16G16B16A16Float,
    R32Float,
    R32G32Float,
    R32G32B32A32Float,
}

impl Format {
    pub fn bytes_per_texel(&self) -> usize {
        match self {
            Format::R16Snorm | Format::R16Sscaled => 2,
            Format::R8G8B8A8Unorm | Format::R32Float => 4,
            Format::R16G16B16A16Snorm
            | Format::R16G16B16A16Sscaled
            | Format::R16G16B16A16Float
            | Format::R32G32Float => 8,
            Format::R32G32B32A32Float => 16,
        }
    }

    pub fn num_components(&self) -> usize {
        match self {
            Format::R16Snorm | Format::R16Sscaled | Format::R32Float => 1,
            Format::R32G32Float => 2,
            Format::R8G8B8A8Unorm
            | Format::R16G16B16A16Snorm
            | Format::R16G16B16A16Sscaled
            | Format::R16G16B16A16Float
            | Format::R32G32B32A32Float => 4,
        }
    }

    /// Whether values of this format are stored as floating point.
    pub fn is_float(&self) -> bool {
        matches!(
            self,
            Format::R16G16B16A16Float
                | Format::R32Float
                | Format::R32G32Float
                | Format::R32G32B32A32Float
        )
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Texture2D,
    Texture3D,
}

/// Ways a resource can be bound to the pipeline.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BindFlags(u32);

impl BindFlags {
    pub const SAMPLER_VIEW: BindFlags = BindFlags(1 << 0);
    pub const RENDER_TARGET: BindFlags = BindFlags(1 << 1);
    pub const VERTEX_BUFFER: BindFlags = BindFlags(1 << 2);
    pub const CONSTANT_BUFFER: BindFlags = BindFlags(1 << 3);

    pub fn contains(&self, other: BindFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BindFlags {
    type Output = BindFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        BindFlags(self.0 | rhs.0)
    }
}

/// Expected CPU access pattern of a resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ResourceUsage {
    /// Written once, then only read by the GPU.
    #[default]
    Static,
    /// Rewritten by the CPU for every batch.
    Dynamic,
    /// Rewritten by the CPU for every draw.
    Stream,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextureDesc {
    pub target: TextureTarget,
    pub format: Format,
    pub width: u32,
    pub height: u32,
    /// Number of layers for 3D textures, 1 otherwise.
    pub depth: u32,
    pub bind: BindFlags,
    pub usage: ResourceUsage,
}

impl TextureDesc {
    /// Size in bytes of one row of texels.
    pub fn stride(&self) -> usize {
        self.width as usize * self.format.bytes_per_texel()
    }

    /// Size in bytes of one layer of the texture.
    pub fn layer_stride(&self) -> usize {
        self.stride() * self.height as usize
    }

    pub fn size(&self) -> usize {
        self.layer_stride() * self.depth as usize
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: usize,
    pub bind: BindFlags,
    pub usage: ResourceUsage,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Wrap {
    Repeat,
    ClampToEdge,
    ClampToBorder,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDesc {
    pub wrap: [Wrap; 3],
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub normalized_coords: bool,
    pub border_color: [f32; 4],
}

impl SamplerDesc {
    /// Sampler clamping to the texture edge, with the same `filter` for minification and
    /// magnification.
    pub fn clamped(filter: Filter) -> Self {
        Self {
            wrap: [Wrap::ClampToEdge, Wrap::ClampToEdge, Wrap::ClampToBorder],
            min_filter: filter,
            mag_filter: filter,
            normalized_coords: true,
            border_color: [0.0; 4],
        }
    }
}

/// Describes where one vertex shader input is fetched from.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexElement {
    /// Offset of the attribute within a vertex, in bytes.
    pub src_offset: u32,
    /// 0 to advance per vertex, N to advance every N instances.
    pub instance_divisor: u32,
    /// Index into the array passed to [`PipeContext::set_vertex_buffers`].
    pub vertex_buffer_index: u32,
    pub src_format: Format,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: RawHandle,
    pub stride: u32,
    pub offset: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Viewport {
    pub scale: [f32; 4],
    pub translate: [f32; 4],
}

impl Viewport {
    /// Viewport mapping normalized [0, 1] coordinates to a `width`x`height` target.
    pub fn for_target(width: u32, height: u32) -> Self {
        Self {
            scale: [width as f32, height as f32, 1.0, 1.0],
            translate: [0.0; 4],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FramebufferState {
    pub width: u32,
    pub height: u32,
    /// Color buffers, as returned by [`PipeContext::create_surface`].
    pub cbufs: Vec<RawHandle>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveType {
    Triangles,
    Quads,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

/// Marker returned by [`PipeContext::flush`], signaled once all previously submitted work
/// completes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fence(pub u64);

/// CPU mapping of a texture or buffer.
///
/// The mapping owns a staging copy of the resource data. Writes become visible to the GPU once the
/// transfer is handed back to [`PipeContext::transfer_unmap`].
#[derive(Debug)]
pub struct Transfer {
    pub resource: RawHandle,
    /// Size in bytes of one row of the mapped resource.
    pub stride: usize,
    /// Size in bytes of one layer of the mapped resource.
    pub layer_stride: usize,
    pub data: BytesMut,
}

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend failed to create a {0:?} object")]
    CreationFailed(ObjectKind),
    #[error("backend failed to map resource {0}")]
    MapFailed(RawHandle),
    #[error("format {0:?} is not supported by the backend")]
    UnsupportedFormat(Format),
    #[error("no object with handle {0}")]
    InvalidHandle(RawHandle),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Trait for a graphics context able to run the decode pipeline.
///
/// All methods take `&self`: contexts are shared between the components of the pipeline through
/// `Rc` and are expected to use interior mutability for their bookkeeping. Calls are issued from a
/// single thread and are executed by the GPU in submission order.
pub trait PipeContext {
    /// Maximum number of color buffers a framebuffer can have.
    fn max_render_targets(&self) -> u32;
    /// Whether `format` can be used for a texture of `target` with the `bind` usages.
    fn is_format_supported(&self, format: Format, target: TextureTarget, bind: BindFlags) -> bool;

    fn create_texture(&self, desc: &TextureDesc) -> BackendResult<RawHandle>;
    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<RawHandle>;
    /// Creates a view of all of `texture` using the texture's own format.
    fn create_sampler_view(&self, texture: RawHandle) -> BackendResult<RawHandle>;
    /// Creates a render target for layer `layer` of `texture`.
    fn create_surface(&self, texture: RawHandle, layer: u32) -> BackendResult<RawHandle>;
    fn create_sampler_state(&self, desc: &SamplerDesc) -> BackendResult<RawHandle>;
    fn create_vertex_elements_state(&self, elements: &[VertexElement]) -> BackendResult<RawHandle>;
    /// Compiles `program`. The returned handle is destroyed as an [`ObjectKind::VertexShader`] or
    /// [`ObjectKind::FragmentShader`] depending on the program's stage.
    fn create_shader(&self, program: &ShaderProgram) -> BackendResult<RawHandle>;
    fn destroy_object(&self, kind: ObjectKind, handle: RawHandle);

    /// Maps `resource` for CPU access. If `discard` is set the previous contents need not be
    /// preserved. May block until the GPU is done with the resource.
    fn transfer_map(&self, resource: RawHandle, discard: bool) -> BackendResult<Transfer>;
    fn transfer_unmap(&self, transfer: Transfer);

    fn set_framebuffer_state(&self, state: &FramebufferState);
    fn set_viewport_state(&self, viewport: &Viewport);
    fn set_vertex_buffers(&self, buffers: &[VertexBufferBinding]);
    fn bind_vertex_elements_state(&self, state: RawHandle);
    fn set_fragment_sampler_views(&self, views: &[RawHandle]);
    fn bind_fragment_sampler_states(&self, samplers: &[RawHandle]);
    fn bind_vs_state(&self, shader: RawHandle);
    fn bind_fs_state(&self, shader: RawHandle);
    fn set_constant_buffer(&self, stage: ShaderStage, index: u32, buffer: Option<RawHandle>);

    fn draw_arrays(&self, prim: PrimitiveType, start: u32, count: u32);
    fn draw_arrays_instanced(
        &self,
        prim: PrimitiveType,
        start: u32,
        count: u32,
        start_instance: u32,
        instance_count: u32,
    );
    /// Submits all pending work and returns a fence signaled when it completes.
    fn flush(&self) -> BackendResult<Fence>;
}
