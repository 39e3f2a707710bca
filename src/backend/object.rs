// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::rc::Rc;

use log::trace;

use crate::backend::BackendResult;
use crate::backend::BufferDesc;
use crate::backend::ObjectKind;
use crate::backend::PipeContext;
use crate::backend::RawHandle;
use crate::backend::SamplerDesc;
use crate::backend::ShaderStage;
use crate::backend::TextureDesc;
use crate::backend::Transfer;
use crate::backend::VertexElement;
use crate::shader::ShaderProgram;

/// An object created by a [`PipeContext`], destroyed when this handle is dropped.
///
/// Objects that depend on each other (e.g. a sampler view and its texture) are stored next to each
/// other by their owner, which is responsible for declaring the dependent one first so it is
/// dropped first.
pub struct PipeObject<P: PipeContext> {
    ctx: Rc<P>,
    kind: ObjectKind,
    handle: RawHandle,
}

impl<P: PipeContext> PipeObject<P> {
    fn new(ctx: &Rc<P>, kind: ObjectKind, handle: RawHandle) -> Self {
        trace!("created {:?} {}", kind, handle);
        Self {
            ctx: Rc::clone(ctx),
            kind,
            handle,
        }
    }

    pub fn texture(ctx: &Rc<P>, desc: &TextureDesc) -> BackendResult<Self> {
        let handle = ctx.create_texture(desc)?;
        Ok(Self::new(ctx, ObjectKind::Texture, handle))
    }

    pub fn buffer(ctx: &Rc<P>, desc: &BufferDesc) -> BackendResult<Self> {
        let handle = ctx.create_buffer(desc)?;
        Ok(Self::new(ctx, ObjectKind::Buffer, handle))
    }

    pub fn sampler_view(ctx: &Rc<P>, texture: &PipeObject<P>) -> BackendResult<Self> {
        let handle = ctx.create_sampler_view(texture.handle())?;
        Ok(Self::new(ctx, ObjectKind::SamplerView, handle))
    }

    pub fn surface(ctx: &Rc<P>, texture: &PipeObject<P>, layer: u32) -> BackendResult<Self> {
        let handle = ctx.create_surface(texture.handle(), layer)?;
        Ok(Self::new(ctx, ObjectKind::Surface, handle))
    }

    pub fn sampler_state(ctx: &Rc<P>, desc: &SamplerDesc) -> BackendResult<Self> {
        let handle = ctx.create_sampler_state(desc)?;
        Ok(Self::new(ctx, ObjectKind::SamplerState, handle))
    }

    pub fn vertex_elements(ctx: &Rc<P>, elements: &[VertexElement]) -> BackendResult<Self> {
        let handle = ctx.create_vertex_elements_state(elements)?;
        Ok(Self::new(ctx, ObjectKind::VertexElements, handle))
    }

    pub fn shader(ctx: &Rc<P>, program: &ShaderProgram) -> BackendResult<Self> {
        let handle = ctx.create_shader(program)?;
        let kind = match program.stage {
            ShaderStage::Vertex => ObjectKind::VertexShader,
            ShaderStage::Fragment => ObjectKind::FragmentShader,
        };
        Ok(Self::new(ctx, kind, handle))
    }

    pub fn handle(&self) -> RawHandle {
        self.handle
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn context(&self) -> &Rc<P> {
        &self.ctx
    }

    /// Maps this texture or buffer for CPU access.
    pub fn map(&self, discard: bool) -> BackendResult<Transfer> {
        self.ctx.transfer_map(self.handle, discard)
    }
}

impl<P: PipeContext> fmt::Debug for PipeObject<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeObject")
            .field("kind", &self.kind)
            .field("handle", &self.handle)
            .finish()
    }
}

impl<P: PipeContext> Drop for PipeObject<P> {
    fn drop(&mut self) {
        trace!("destroying {:?} {}", self.kind, self.handle);
        self.ctx.destroy_object(self.kind, self.handle);
    }
}

/// Maps every resource of `resources`, or none of them.
///
/// If mapping any resource fails, the ones already mapped are unmapped before the error is
/// returned.
pub fn map_all<P: PipeContext>(
    ctx: &P,
    resources: &[&PipeObject<P>],
    discard: bool,
) -> BackendResult<Vec<Transfer>> {
    let mut transfers = Vec::with_capacity(resources.len());

    for resource in resources {
        match ctx.transfer_map(resource.handle(), discard) {
            Ok(transfer) => transfers.push(transfer),
            Err(e) => {
                log::warn!("failed to map {}, rolling back: {}", resource.handle(), e);
                for transfer in transfers {
                    ctx.transfer_unmap(transfer);
                }
                return Err(e);
            }
        }
    }

    Ok(transfers)
}
