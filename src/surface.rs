// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::cell::Cell;
use std::rc::Rc;

use crate::backend::object::PipeObject;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::Fence;
use crate::backend::Format;
use crate::backend::PipeContext;
use crate::backend::RawHandle;
use crate::backend::ResourceUsage;
use crate::backend::TextureDesc;
use crate::backend::TextureTarget;
use crate::Resolution;

/// Format of decoded pictures: Y, Cb and Cr in the red, green and blue channels.
pub const DECODE_FORMAT: Format = Format::R8G8B8A8Unorm;

/// A decoded picture, used both as a motion compensation target and as a reference.
///
/// Surfaces are shared through `Rc`: the renderer keeps clones of the target and references of
/// the batch it is building until that batch is flushed.
pub struct DecodeSurface<P: PipeContext> {
    surface: PipeObject<P>,
    view: PipeObject<P>,
    texture: PipeObject<P>,
    size: Resolution,
    /// Fence of the last batch rendered into this surface.
    fence: Cell<Option<Fence>>,
}

impl<P: PipeContext> DecodeSurface<P> {
    pub fn new(ctx: &Rc<P>, size: Resolution) -> BackendResult<Rc<Self>> {
        let texture = PipeObject::texture(
            ctx,
            &TextureDesc {
                target: TextureTarget::Texture2D,
                format: DECODE_FORMAT,
                width: size.width,
                height: size.height,
                depth: 1,
                bind: BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
                usage: ResourceUsage::Static,
            },
        )?;
        let view = PipeObject::sampler_view(ctx, &texture)?;
        let surface = PipeObject::surface(ctx, &texture, 0)?;

        Ok(Rc::new(Self {
            surface,
            view,
            texture,
            size,
            fence: Cell::new(None),
        }))
    }

    pub fn size(&self) -> Resolution {
        self.size
    }

    pub fn texture(&self) -> &PipeObject<P> {
        &self.texture
    }

    /// Sampler view used when this surface is a reference or composited.
    pub fn view(&self) -> RawHandle {
        self.view.handle()
    }

    /// Render target used when this surface is decoded into.
    pub fn render_target(&self) -> RawHandle {
        self.surface.handle()
    }

    /// Fence to wait on before reading the contents of this surface, if it has been rendered to.
    pub fn fence(&self) -> Option<Fence> {
        self.fence.get()
    }

    pub(crate) fn set_fence(&self, fence: Fence) {
        self.fence.set(Some(fence));
    }
}
