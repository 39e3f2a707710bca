// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Coefficient and residual planes of one decode buffer.
//!
//! Each plane has a coefficient texture the CPU writes blocks into while it is mapped, the list of
//! IDCT instances to run over it, and the residual texture the IDCT writes and motion compensation
//! samples.

use std::rc::Rc;

use log::debug;

use crate::backend::object::map_all;
use crate::backend::object::PipeObject;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::PipeContext;
use crate::backend::RawHandle;
use crate::backend::ResourceUsage;
use crate::backend::TextureDesc;
use crate::backend::TextureTarget;
use crate::backend::Transfer;
use crate::idct::Idct;
use crate::idct::IdctBuffer;
use crate::idct::IdctError;
use crate::idct::RESIDUAL_FORMAT;
use crate::utils::write_i16_le;
use crate::vertex_buffer::IdctInstance;
use crate::vertex_buffer::Vertex2f;
use crate::vertex_buffer::VertexStream;
use crate::Resolution;
use crate::BLOCK_HEIGHT;
use crate::BLOCK_SIZE;
use crate::BLOCK_WIDTH;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Plane {
    Y,
    Cb,
    Cr,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Y, Plane::Cb, Plane::Cr];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Position of a block in a plane, in blocks.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockPos {
    pub bx: u32,
    pub by: u32,
}

impl BlockPos {
    pub fn new(bx: u32, by: u32) -> Self {
        Self { bx, by }
    }
}

const ZERO_BLOCK: [i16; BLOCK_SIZE] = [0; BLOCK_SIZE];

struct PlaneBuffer<P: PipeContext> {
    idct: IdctBuffer<P>,
    residual_view: PipeObject<P>,
    residual: PipeObject<P>,
    source: PipeObject<P>,

    size: Resolution,
    instances: VertexStream<IdctInstance>,
    transfer: Option<Transfer>,
    zero_block: Option<BlockPos>,
}

impl<P: PipeContext> PlaneBuffer<P> {
    fn new(ctx: &Rc<P>, idct: &Idct<P>, size: Resolution) -> Result<Self, IdctError> {
        let source = PipeObject::texture(
            ctx,
            &TextureDesc {
                target: TextureTarget::Texture2D,
                format: idct.formats().source,
                width: size.width / 4,
                height: size.height,
                depth: 1,
                bind: BindFlags::SAMPLER_VIEW,
                usage: ResourceUsage::Dynamic,
            },
        )?;
        let residual = PipeObject::texture(
            ctx,
            &TextureDesc {
                target: TextureTarget::Texture2D,
                format: RESIDUAL_FORMAT,
                width: size.width,
                height: size.height,
                depth: 1,
                bind: BindFlags::SAMPLER_VIEW | BindFlags::RENDER_TARGET,
                usage: ResourceUsage::Static,
            },
        )?;
        let residual_view = PipeObject::sampler_view(ctx, &residual)?;
        let idct = idct.init_buffer(&source, &residual)?;

        Ok(Self {
            idct,
            residual_view,
            residual,
            source,
            size,
            instances: VertexStream::new(idct_capacity(size)),
            transfer: None,
            zero_block: None,
        })
    }

    fn write_block(&mut self, pos: BlockPos, coefficients: &[i16]) {
        let Some(transfer) = self.transfer.as_mut() else {
            debug_assert!(false, "writing to an unmapped plane");
            return;
        };

        for (r, row) in coefficients.chunks_exact(BLOCK_WIDTH as usize).enumerate() {
            let y = (pos.by * BLOCK_HEIGHT) as usize + r;
            let offset = y * transfer.stride + (pos.bx * BLOCK_WIDTH) as usize * 2;
            write_i16_le(&mut transfer.data[offset..], row);
        }

        self.instances.push(IdctInstance {
            pos: Vertex2f::new(pos.bx as f32, pos.by as f32),
            empty: 0.0,
        });
    }

    fn skip_block(&mut self, pos: BlockPos) {
        self.instances.push(IdctInstance {
            pos: Vertex2f::new(pos.bx as f32, pos.by as f32),
            empty: 1.0,
        });
    }
}

/// Number of blocks in a plane of `size` samples.
fn idct_capacity(size: Resolution) -> usize {
    ((size.width / BLOCK_WIDTH) * (size.height / BLOCK_HEIGHT)) as usize
}

/// The three planes of a decode buffer.
pub struct YCbCrBuffer<P: PipeContext> {
    ctx: Rc<P>,
    planes: [PlaneBuffer<P>; 3],
}

impl<P: PipeContext> YCbCrBuffer<P> {
    /// Creates the planes of a buffer. The luma plane is transformed by `luma_idct`, both chroma
    /// planes by `chroma_idct`.
    pub fn new(
        ctx: &Rc<P>,
        luma_idct: &Idct<P>,
        chroma_idct: &Idct<P>,
        luma_size: Resolution,
        chroma_size: Resolution,
    ) -> Result<Self, IdctError> {
        let y = PlaneBuffer::new(ctx, luma_idct, luma_size)?;
        let cb = PlaneBuffer::new(ctx, chroma_idct, chroma_size)?;
        let cr = PlaneBuffer::new(ctx, chroma_idct, chroma_size)?;

        debug!(
            "created YCbCr buffer, luma {}x{}, chroma {}x{}",
            luma_size.width, luma_size.height, chroma_size.width, chroma_size.height
        );

        Ok(Self {
            ctx: Rc::clone(ctx),
            planes: [y, cb, cr],
        })
    }

    fn plane(&self, plane: Plane) -> &PlaneBuffer<P> {
        &self.planes[plane.index()]
    }

    fn plane_mut(&mut self, plane: Plane) -> &mut PlaneBuffer<P> {
        &mut self.planes[plane.index()]
    }

    pub fn is_mapped(&self) -> bool {
        self.planes[0].transfer.is_some()
    }

    /// Maps the coefficient textures of all three planes, or none of them. Does nothing if they
    /// are already mapped.
    pub fn map(&mut self) -> BackendResult<()> {
        if self.is_mapped() {
            return Ok(());
        }

        let sources: Vec<_> = self.planes.iter().map(|p| &p.source).collect();
        let transfers = map_all(self.ctx.as_ref(), &sources, true)?;
        for (plane, transfer) in self.planes.iter_mut().zip(transfers) {
            plane.transfer = Some(transfer);
        }

        Ok(())
    }

    /// Hands the written coefficients over to the GPU.
    pub fn unmap(&mut self) {
        for plane in self.planes.iter_mut() {
            if let Some(transfer) = plane.transfer.take() {
                self.ctx.transfer_unmap(transfer);
            }
        }
    }

    /// Writes a block of coefficients at `pos` and queues its transform. Zeros are written if
    /// `coefficients` is `None`.
    ///
    /// The plane must be mapped.
    pub fn write_block(&mut self, plane: Plane, pos: BlockPos, coefficients: Option<&[i16]>) {
        let coefficients = coefficients.unwrap_or(&ZERO_BLOCK);
        debug_assert_eq!(coefficients.len(), BLOCK_SIZE);
        self.plane_mut(plane).write_block(pos, coefficients);
    }

    /// Queues a culled transform for the block at `pos`, which leaves its residual untouched.
    pub fn skip_block(&mut self, plane: Plane, pos: BlockPos) {
        self.plane_mut(plane).skip_block(pos);
    }

    /// Location of the block of zeros shared by the empty blocks of `plane` in the current batch.
    pub fn zero_block(&self, plane: Plane) -> Option<BlockPos> {
        self.plane(plane).zero_block
    }

    pub fn set_zero_block(&mut self, plane: Plane, pos: BlockPos) {
        self.plane_mut(plane).zero_block = Some(pos);
    }

    pub fn reset_zero_blocks(&mut self) {
        for plane in self.planes.iter_mut() {
            plane.zero_block = None;
        }
    }

    pub fn plane_size(&self, plane: Plane) -> Resolution {
        self.plane(plane).size
    }

    /// Number of transforms queued for `plane`, culled ones included.
    pub fn num_instances(&self, plane: Plane) -> usize {
        self.plane(plane).instances.len()
    }

    pub fn instances(&self, plane: Plane) -> &VertexStream<IdctInstance> {
        &self.plane(plane).instances
    }

    /// GPU buffer the instances of `plane` must be uploaded to before [`Self::flush_idct`].
    pub fn instance_buffer(&self, plane: Plane) -> &PipeObject<P> {
        self.plane(plane).idct.instances().resource()
    }

    pub fn clear_instances(&mut self) {
        for plane in self.planes.iter_mut() {
            plane.instances.clear();
        }
    }

    pub fn residual_view(&self, plane: Plane) -> RawHandle {
        self.plane(plane).residual_view.handle()
    }

    pub fn residual(&self, plane: Plane) -> &PipeObject<P> {
        &self.plane(plane).residual
    }

    pub fn source(&self, plane: Plane) -> &PipeObject<P> {
        &self.plane(plane).source
    }

    /// Runs the queued transforms of `plane`.
    pub fn flush_idct(&self, plane: Plane, idct: &Idct<P>) {
        let plane = self.plane(plane);
        idct.flush(&plane.idct, plane.instances.len() as u32);
    }
}

impl<P: PipeContext> Drop for YCbCrBuffer<P> {
    fn drop(&mut self) {
        self.unmap();
    }
}
