// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the pipeline run so we can test
//! it in isolation.
//!
//! The dummy context does not render anything. It keeps the contents of textures and buffers so
//! uploads can be inspected, records every state and draw call as a [`Command`], and can be told to
//! fail object creation or mapping.
//!
//! Shader programs can be run on the CPU with a [`ShaderInterpreter`], sampling [`Texels`] decoded
//! from the textures of the context.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;

use byteorder::ByteOrder;
use byteorder::LittleEndian;
use bytes::BytesMut;

use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::BindFlags;
use crate::backend::BufferDesc;
use crate::backend::Fence;
use crate::backend::Format;
use crate::backend::FramebufferState;
use crate::backend::ObjectKind;
use crate::backend::PipeContext;
use crate::backend::PrimitiveType;
use crate::backend::RawHandle;
use crate::backend::SamplerDesc;
use crate::backend::ShaderStage;
use crate::backend::TextureDesc;
use crate::backend::TextureTarget;
use crate::backend::Transfer;
use crate::backend::VertexBufferBinding;
use crate::backend::VertexElement;
use crate::backend::Viewport;
use crate::shader::RegisterFile;
use crate::shader::ShaderProgram;
use crate::shader::TextureKind;

/// A call recorded by the [`DummyContext`].
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Command {
    SetFramebuffer(FramebufferState),
    SetViewport(Viewport),
    SetVertexBuffers(Vec<VertexBufferBinding>),
    BindVertexElements(RawHandle),
    SetSamplerViews(Vec<RawHandle>),
    BindSamplers(Vec<RawHandle>),
    BindVs(RawHandle),
    BindFs(RawHandle),
    SetConstantBuffer {
        stage: ShaderStage,
        index: u32,
        buffer: Option<RawHandle>,
    },
    Draw {
        prim: PrimitiveType,
        start: u32,
        count: u32,
    },
    DrawInstanced {
        prim: PrimitiveType,
        start: u32,
        count: u32,
        start_instance: u32,
        instance_count: u32,
    },
    Flush(Fence),
}

#[derive(Debug)]
pub(crate) enum ObjectInfo {
    Texture(TextureDesc),
    Buffer(BufferDesc),
    /// Sampler views and surfaces remember the texture (and layer) they were created from.
    SamplerView(RawHandle),
    Surface(RawHandle, u32),
    SamplerState(SamplerDesc),
    VertexElements(Vec<VertexElement>),
    Shader(ShaderProgram),
}

struct DummyObject {
    kind: ObjectKind,
    info: ObjectInfo,
    data: Vec<u8>,
}

/// Dummy context that can be used to test any part of the pipeline.
pub(crate) struct DummyContext {
    objects: RefCell<BTreeMap<RawHandle, DummyObject>>,
    next_handle: Cell<u32>,
    commands: RefCell<Vec<Command>>,
    mapped: RefCell<BTreeSet<RawHandle>>,
    max_render_targets: Cell<u32>,
    unsupported_formats: RefCell<HashSet<Format>>,
    creations_left: Cell<Option<usize>>,
    fail_next_map: Cell<bool>,
    failing_maps: RefCell<HashSet<RawHandle>>,
    next_fence: Cell<u64>,
}

impl DummyContext {
    pub(crate) fn new() -> Self {
        let _ = env_logger::try_init();

        Self {
            objects: Default::default(),
            next_handle: Cell::new(1),
            commands: Default::default(),
            mapped: Default::default(),
            max_render_targets: Cell::new(8),
            unsupported_formats: Default::default(),
            creations_left: Cell::new(None),
            fail_next_map: Cell::new(false),
            failing_maps: Default::default(),
            next_fence: Cell::new(1),
        }
    }

    pub(crate) fn set_max_render_targets(&self, max: u32) {
        self.max_render_targets.set(max);
    }

    pub(crate) fn set_format_unsupported(&self, format: Format) {
        self.unsupported_formats.borrow_mut().insert(format);
    }

    /// Lets `n` more objects be created, then makes every creation fail.
    pub(crate) fn fail_creation_after(&self, n: usize) {
        self.creations_left.set(Some(n));
    }

    pub(crate) fn clear_creation_failure(&self) {
        self.creations_left.set(None);
    }

    /// Makes the next call to `transfer_map` fail.
    pub(crate) fn fail_next_map(&self) {
        self.fail_next_map.set(true);
    }

    /// Makes the next attempt to map `resource` fail.
    pub(crate) fn fail_map_of(&self, resource: RawHandle) {
        self.failing_maps.borrow_mut().insert(resource);
    }

    /// Number of objects created and not destroyed yet.
    pub(crate) fn live_objects(&self) -> usize {
        self.objects.borrow().len()
    }

    pub(crate) fn live_objects_of(&self, kind: ObjectKind) -> usize {
        self.objects
            .borrow()
            .values()
            .filter(|o| o.kind == kind)
            .count()
    }

    /// Number of objects created since the context was created.
    pub(crate) fn created_objects(&self) -> usize {
        self.next_handle.get() as usize - 1
    }

    pub(crate) fn mapped_resources(&self) -> usize {
        self.mapped.borrow().len()
    }

    pub(crate) fn is_mapped(&self, resource: RawHandle) -> bool {
        self.mapped.borrow().contains(&resource)
    }

    pub(crate) fn commands(&self) -> Vec<Command> {
        self.commands.borrow().clone()
    }

    pub(crate) fn take_commands(&self) -> Vec<Command> {
        std::mem::take(&mut self.commands.borrow_mut())
    }

    /// Returns the current contents of a texture or buffer.
    pub(crate) fn resource_data(&self, resource: RawHandle) -> Vec<u8> {
        self.objects
            .borrow()
            .get(&resource)
            .map(|o| o.data.clone())
            .unwrap_or_default()
    }

    pub(crate) fn checksum(&self, resource: RawHandle) -> u32 {
        crc32fast::hash(&self.resource_data(resource))
    }

    /// Runs `f` on the creation information of `handle`.
    pub(crate) fn with_info<R>(&self, handle: RawHandle, f: impl FnOnce(&ObjectInfo) -> R) -> R {
        let objects = self.objects.borrow();
        f(&objects.get(&handle).expect("no such object").info)
    }

    /// Returns the texture a sampler view or surface was created from.
    pub(crate) fn texture_of(&self, handle: RawHandle) -> RawHandle {
        self.with_info(handle, |info| match info {
            ObjectInfo::SamplerView(texture) | ObjectInfo::Surface(texture, _) => *texture,
            other => panic!("{:?} is not a view", other),
        })
    }

    pub(crate) fn texture_desc(&self, handle: RawHandle) -> TextureDesc {
        self.with_info(handle, |info| match info {
            ObjectInfo::Texture(desc) => desc.clone(),
            other => panic!("{:?} is not a texture", other),
        })
    }

    pub(crate) fn shader_text(&self, handle: RawHandle) -> String {
        self.with_info(handle, |info| match info {
            ObjectInfo::Shader(program) => program.text.clone(),
            other => panic!("{:?} is not a shader", other),
        })
    }

    /// Returns an interpreter for the program of shader `handle`.
    pub(crate) fn interpreter(&self, handle: RawHandle) -> ShaderInterpreter {
        self.with_info(handle, |info| match info {
            ObjectInfo::Shader(program) => ShaderInterpreter::new(program),
            other => panic!("{:?} is not a shader", other),
        })
    }

    /// Decodes the texels of a texture, or of the texture behind a sampler view.
    pub(crate) fn texels(&self, handle: RawHandle) -> Texels {
        let is_view = self.with_info(handle, |info| matches!(info, ObjectInfo::SamplerView(_)));
        let texture = if is_view { self.texture_of(handle) } else { handle };
        let desc = self.texture_desc(texture);
        let data = self.resource_data(texture);

        let mut texels = Texels::new(&desc);
        let components = desc.format.num_components();
        for (texel, bytes) in texels
            .texels
            .iter_mut()
            .zip(data.chunks_exact(desc.format.bytes_per_texel()))
        {
            for (c, value) in texel.iter_mut().take(components).enumerate() {
                *value = decode(desc.format, bytes, c);
            }
        }

        texels
    }

    /// Reads back a constant buffer as a list of vectors.
    pub(crate) fn constants(&self, buffer: RawHandle) -> Vec<[f32; 4]> {
        self.resource_data(buffer)
            .chunks_exact(16)
            .map(|chunk| {
                let mut vector = [0f32; 4];
                LittleEndian::read_f32_into(chunk, &mut vector);
                vector
            })
            .collect()
    }

    fn insert(&self, kind: ObjectKind, info: ObjectInfo, size: usize) -> BackendResult<RawHandle> {
        if let Some(left) = self.creations_left.get() {
            if left == 0 {
                return Err(BackendError::CreationFailed(kind));
            }
            self.creations_left.set(Some(left - 1));
        }

        let handle = RawHandle(self.next_handle.get());
        self.next_handle.set(handle.0 + 1);
        self.objects.borrow_mut().insert(
            handle,
            DummyObject {
                kind,
                info,
                data: vec![0; size],
            },
        );

        Ok(handle)
    }

    fn check_exists(&self, handle: RawHandle) -> BackendResult<()> {
        if self.objects.borrow().contains_key(&handle) {
            Ok(())
        } else {
            Err(BackendError::InvalidHandle(handle))
        }
    }

    fn record(&self, command: Command) {
        self.commands.borrow_mut().push(command);
    }
}

impl PipeContext for DummyContext {
    fn max_render_targets(&self) -> u32 {
        self.max_render_targets.get()
    }

    fn is_format_supported(&self, format: Format, _: TextureTarget, _: BindFlags) -> bool {
        !self.unsupported_formats.borrow().contains(&format)
    }

    fn create_texture(&self, desc: &TextureDesc) -> BackendResult<RawHandle> {
        if !self.is_format_supported(desc.format, desc.target, desc.bind) {
            return Err(BackendError::UnsupportedFormat(desc.format));
        }

        self.insert(ObjectKind::Texture, ObjectInfo::Texture(desc.clone()), desc.size())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> BackendResult<RawHandle> {
        self.insert(ObjectKind::Buffer, ObjectInfo::Buffer(desc.clone()), desc.size)
    }

    fn create_sampler_view(&self, texture: RawHandle) -> BackendResult<RawHandle> {
        self.check_exists(texture)?;
        self.insert(ObjectKind::SamplerView, ObjectInfo::SamplerView(texture), 0)
    }

    fn create_surface(&self, texture: RawHandle, layer: u32) -> BackendResult<RawHandle> {
        self.check_exists(texture)?;
        self.insert(ObjectKind::Surface, ObjectInfo::Surface(texture, layer), 0)
    }

    fn create_sampler_state(&self, desc: &SamplerDesc) -> BackendResult<RawHandle> {
        self.insert(ObjectKind::SamplerState, ObjectInfo::SamplerState(desc.clone()), 0)
    }

    fn create_vertex_elements_state(&self, elements: &[VertexElement]) -> BackendResult<RawHandle> {
        self.insert(
            ObjectKind::VertexElements,
            ObjectInfo::VertexElements(elements.to_vec()),
            0,
        )
    }

    fn create_shader(&self, program: &ShaderProgram) -> BackendResult<RawHandle> {
        let kind = match program.stage {
            ShaderStage::Vertex => ObjectKind::VertexShader,
            ShaderStage::Fragment => ObjectKind::FragmentShader,
        };
        self.insert(kind, ObjectInfo::Shader(program.clone()), 0)
    }

    fn destroy_object(&self, kind: ObjectKind, handle: RawHandle) {
        let removed = self.objects.borrow_mut().remove(&handle);
        match removed {
            Some(object) => assert_eq!(object.kind, kind, "destroying {} with wrong kind", handle),
            None => panic!("double destruction of {:?} {}", kind, handle),
        }
        self.mapped.borrow_mut().remove(&handle);
    }

    fn transfer_map(&self, resource: RawHandle, _discard: bool) -> BackendResult<Transfer> {
        if self.fail_next_map.replace(false) || self.failing_maps.borrow_mut().remove(&resource) {
            return Err(BackendError::MapFailed(resource));
        }

        let objects = self.objects.borrow();
        let object = objects
            .get(&resource)
            .ok_or(BackendError::InvalidHandle(resource))?;

        let (stride, layer_stride) = match &object.info {
            ObjectInfo::Texture(desc) => (desc.stride(), desc.layer_stride()),
            ObjectInfo::Buffer(desc) => (desc.size, desc.size),
            _ => return Err(BackendError::MapFailed(resource)),
        };

        assert!(
            self.mapped.borrow_mut().insert(resource),
            "{} mapped twice",
            resource
        );

        Ok(Transfer {
            resource,
            stride,
            layer_stride,
            data: BytesMut::from(&object.data[..]),
        })
    }

    fn transfer_unmap(&self, transfer: Transfer) {
        assert!(
            self.mapped.borrow_mut().remove(&transfer.resource),
            "{} was not mapped",
            transfer.resource
        );

        if let Some(object) = self.objects.borrow_mut().get_mut(&transfer.resource) {
            let len = object.data.len();
            object.data.copy_from_slice(&transfer.data[..len]);
        }
    }

    fn set_framebuffer_state(&self, state: &FramebufferState) {
        self.record(Command::SetFramebuffer(state.clone()));
    }

    fn set_viewport_state(&self, viewport: &Viewport) {
        self.record(Command::SetViewport(*viewport));
    }

    fn set_vertex_buffers(&self, buffers: &[VertexBufferBinding]) {
        self.record(Command::SetVertexBuffers(buffers.to_vec()));
    }

    fn bind_vertex_elements_state(&self, state: RawHandle) {
        self.record(Command::BindVertexElements(state));
    }

    fn set_fragment_sampler_views(&self, views: &[RawHandle]) {
        self.record(Command::SetSamplerViews(views.to_vec()));
    }

    fn bind_fragment_sampler_states(&self, samplers: &[RawHandle]) {
        self.record(Command::BindSamplers(samplers.to_vec()));
    }

    fn bind_vs_state(&self, shader: RawHandle) {
        self.record(Command::BindVs(shader));
    }

    fn bind_fs_state(&self, shader: RawHandle) {
        self.record(Command::BindFs(shader));
    }

    fn set_constant_buffer(&self, stage: ShaderStage, index: u32, buffer: Option<RawHandle>) {
        self.record(Command::SetConstantBuffer {
            stage,
            index,
            buffer,
        });
    }

    fn draw_arrays(&self, prim: PrimitiveType, start: u32, count: u32) {
        self.record(Command::Draw { prim, start, count });
    }

    fn draw_arrays_instanced(
        &self,
        prim: PrimitiveType,
        start: u32,
        count: u32,
        start_instance: u32,
        instance_count: u32,
    ) {
        self.record(Command::DrawInstanced {
            prim,
            start,
            count,
            start_instance,
            instance_count,
        });
    }

    fn flush(&self) -> BackendResult<Fence> {
        let fence = Fence(self.next_fence.get());
        self.next_fence.set(fence.0 + 1);
        self.record(Command::Flush(fence));
        Ok(fence)
    }
}

/// Value of component `c` of a texel of `format` stored in `bytes`, as returned by a sampler.
fn decode(format: Format, bytes: &[u8], c: usize) -> f32 {
    match format {
        Format::R8G8B8A8Unorm => bytes[c] as f32 / 255.0,
        Format::R16Snorm | Format::R16G16B16A16Snorm => {
            (LittleEndian::read_i16(&bytes[2 * c..]) as f32 / 32767.0).max(-1.0)
        }
        Format::R16Sscaled | Format::R16G16B16A16Sscaled => {
            LittleEndian::read_i16(&bytes[2 * c..]) as f32
        }
        Format::R32Float | Format::R32G32Float | Format::R32G32B32A32Float => {
            LittleEndian::read_f32(&bytes[4 * c..])
        }
        Format::R16G16B16A16Float => panic!("half float texels are not decoded"),
    }
}

/// Value kept by a render target of `format` when `value` is written to it.
fn quantize(format: Format, value: f32) -> f32 {
    match format {
        Format::R8G8B8A8Unorm => (value.clamp(0.0, 1.0) * 255.0).round() / 255.0,
        Format::R16Snorm | Format::R16G16B16A16Snorm => {
            (value.clamp(-1.0, 1.0) * 32767.0).round() / 32767.0
        }
        Format::R16Sscaled | Format::R16G16B16A16Sscaled => value.clamp(-32768.0, 32767.0).round(),
        // Half float rounding is not modelled.
        _ => value,
    }
}

/// Texels of a texture as seen by a nearest sampler, layer by layer and row by row. Missing
/// components read as `(0, 0, 0, 1)`.
#[derive(Clone, Debug)]
pub(crate) struct Texels {
    format: Format,
    width: u32,
    height: u32,
    depth: u32,
    texels: Vec<[f32; 4]>,
}

impl Texels {
    /// Cleared texels for a texture created from `desc`.
    pub(crate) fn new(desc: &TextureDesc) -> Self {
        Self {
            format: desc.format,
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            texels: vec![[0.0, 0.0, 0.0, 1.0]; (desc.width * desc.height * desc.depth) as usize],
        }
    }

    fn index(&self, x: u32, y: u32, z: u32) -> usize {
        assert!(x < self.width && y < self.height && z < self.depth);
        ((z * self.height + y) * self.width + x) as usize
    }

    pub(crate) fn get(&self, x: u32, y: u32, z: u32) -> [f32; 4] {
        self.texels[self.index(x, y, z)]
    }

    /// Writes `color` at (`x`, `y`) of layer `z` like a render target of this format would.
    pub(crate) fn store(&mut self, x: u32, y: u32, z: u32, color: [f32; 4]) {
        let index = self.index(x, y, z);
        let components = self.format.num_components();
        let format = self.format;
        for (c, value) in self.texels[index].iter_mut().take(components).enumerate() {
            *value = quantize(format, color[c]);
        }
    }

    /// Nearest texel to normalized coordinates `coord`, clamped to the edges.
    fn sample(&self, kind: TextureKind, coord: [f32; 4]) -> [f32; 4] {
        let nearest = |c: f32, size: u32| ((c * size as f32).floor().max(0.0) as u32).min(size - 1);
        let z = match kind {
            TextureKind::Texture2D => 0,
            TextureKind::Texture3D => nearest(coord[2], self.depth),
        };
        self.get(nearest(coord[0], self.width), nearest(coord[1], self.height), z)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum Opcode {
    Mov,
    Add,
    Mul,
    Mad,
    Dp4,
    Frc,
    Flr,
    Sge,
    Cmp,
    Lrp,
    Tex(TextureKind),
    If,
    Else,
    Endif,
    End,
}

impl Opcode {
    fn parse(name: &str) -> Self {
        match name {
            "MOV" => Opcode::Mov,
            "ADD" => Opcode::Add,
            "MUL" => Opcode::Mul,
            "MAD" => Opcode::Mad,
            "DP4" => Opcode::Dp4,
            "FRC" => Opcode::Frc,
            "FLR" => Opcode::Flr,
            "SGE" => Opcode::Sge,
            "CMP" => Opcode::Cmp,
            "LRP" => Opcode::Lrp,
            "TEX 2D" => Opcode::Tex(TextureKind::Texture2D),
            "TEX 3D" => Opcode::Tex(TextureKind::Texture3D),
            "IF" => Opcode::If,
            "ELSE" => Opcode::Else,
            "ENDIF" => Opcode::Endif,
            "END" => Opcode::End,
            other => panic!("unknown opcode {}", other),
        }
    }

    fn has_dst(&self) -> bool {
        !matches!(self, Opcode::If | Opcode::Else | Opcode::Endif | Opcode::End)
    }
}

#[derive(Copy, Clone, Debug)]
struct Operand {
    file: RegisterFile,
    index: usize,
    swizzle: [usize; 4],
    writemask: u8,
    negate: bool,
}

impl Operand {
    /// Parses operands such as `-TEMP[2].xxxx` or `OUT[0].xy`.
    fn parse(text: &str) -> Self {
        let (negate, text) = match text.strip_prefix('-') {
            Some(text) => (true, text),
            None => (false, text),
        };
        let (register, suffix) = text.split_once('.').unwrap_or((text, ""));
        let (file, index) = register
            .strip_suffix(']')
            .and_then(|r| r.split_once('['))
            .unwrap_or_else(|| panic!("bad register {}", register));
        let file = match file {
            "IN" => RegisterFile::Input,
            "OUT" => RegisterFile::Output,
            "TEMP" => RegisterFile::Temp,
            "CONST" => RegisterFile::Constant,
            "SAMP" => RegisterFile::Sampler,
            "IMM" => RegisterFile::Immediate,
            other => panic!("unknown register file {}", other),
        };

        let components: Vec<usize> = suffix
            .chars()
            .map(|c| "xyzw".find(c).unwrap_or_else(|| panic!("bad component {}", c)))
            .collect();
        let mut swizzle = [0, 1, 2, 3];
        if components.len() == 4 {
            swizzle.copy_from_slice(&components);
        }
        let writemask = if components.is_empty() {
            0b1111
        } else {
            components.iter().fold(0, |mask, c| mask | (1 << c))
        };

        Self {
            file,
            index: index.parse().unwrap_or_else(|_| panic!("bad index {}", index)),
            swizzle,
            writemask,
            negate,
        }
    }
}

#[derive(Clone, Debug)]
struct Instruction {
    opcode: Opcode,
    dst: Option<Operand>,
    srcs: Vec<Operand>,
}

/// Registers of one invocation.
struct Registers<'a> {
    inputs: &'a [[f32; 4]],
    constants: &'a [[f32; 4]],
    immediates: &'a [[f32; 4]],
    temps: Vec<[f32; 4]>,
    outputs: Vec<[f32; 4]>,
}

impl Registers<'_> {
    fn read(&self, src: &Operand) -> [f32; 4] {
        let value = match src.file {
            RegisterFile::Input => self.inputs[src.index],
            RegisterFile::Constant => self.constants[src.index],
            RegisterFile::Immediate => self.immediates[src.index],
            RegisterFile::Temp => self.temps[src.index],
            RegisterFile::Output => self.outputs[src.index],
            RegisterFile::Sampler => panic!("samplers cannot be read"),
        };
        let sign = if src.negate { -1.0 } else { 1.0 };
        std::array::from_fn(|c| sign * value[src.swizzle[c]])
    }

    fn write(&mut self, dst: &Operand, value: [f32; 4]) {
        let register = match dst.file {
            RegisterFile::Temp => &mut self.temps[dst.index],
            RegisterFile::Output => &mut self.outputs[dst.index],
            other => panic!("{} cannot be written", other),
        };
        for (c, component) in register.iter_mut().enumerate() {
            if dst.writemask & (1 << c) != 0 {
                *component = value[c];
            }
        }
    }
}

fn componentwise(a: [f32; 4], b: [f32; 4], f: impl Fn(f32, f32) -> f32) -> [f32; 4] {
    std::array::from_fn(|c| f(a[c], b[c]))
}

/// Runs programs produced by [`crate::shader::ShaderBuilder`] on the CPU, one invocation at a time.
pub(crate) struct ShaderInterpreter {
    immediates: Vec<[f32; 4]>,
    instructions: Vec<Instruction>,
    num_temps: usize,
    num_outputs: usize,
}

impl ShaderInterpreter {
    pub(crate) fn new(program: &ShaderProgram) -> Self {
        let mut immediates = Vec::new();
        let mut instructions = Vec::new();
        let mut num_temps = 0;

        for line in program.text.lines() {
            if line.starts_with("IMM[") {
                let values = line
                    .split_once('{')
                    .and_then(|(_, rest)| rest.split_once('}'))
                    .map(|(values, _)| values)
                    .unwrap_or_else(|| panic!("bad immediate {}", line));
                let mut imm = [0f32; 4];
                for (value, text) in imm.iter_mut().zip(values.split(',')) {
                    *value = text.trim().parse().unwrap_or_else(|_| panic!("bad value {}", text));
                }
                immediates.push(imm);
            } else if line.starts_with("DCL TEMP") {
                num_temps += 1;
            } else if let Some((number, text)) = line.split_once(": ") {
                if number.trim().parse::<usize>().is_err() {
                    continue;
                }
                let text = text.trim();
                let (name, operands) = match text.strip_prefix("TEX ") {
                    Some(rest) => {
                        let (kind, operands) = rest.split_once(' ').unwrap_or((rest, ""));
                        (&text[..4 + kind.len()], operands)
                    }
                    None => text.split_once(' ').unwrap_or((text, "")),
                };
                let opcode = Opcode::parse(name);
                let mut operands = operands
                    .split(", ")
                    .filter(|o| !o.is_empty())
                    .map(Operand::parse);
                let dst = if opcode.has_dst() { operands.next() } else { None };
                instructions.push(Instruction {
                    opcode,
                    dst,
                    srcs: operands.collect(),
                });
            }
        }

        Self {
            immediates,
            instructions,
            num_temps,
            num_outputs: program.num_outputs as usize,
        }
    }

    /// Runs the program once and returns its outputs. Inputs and constants are indexed by register
    /// and `textures` by sampler.
    pub(crate) fn run(
        &self,
        inputs: &[[f32; 4]],
        constants: &[[f32; 4]],
        textures: &[&Texels],
    ) -> Vec<[f32; 4]> {
        let mut regs = Registers {
            inputs,
            constants,
            immediates: &self.immediates,
            temps: vec![[0.0; 4]; self.num_temps],
            outputs: vec![[0.0; 4]; self.num_outputs],
        };
        // Whether the enclosing code runs, and the condition, of every open IF block.
        let mut blocks: Vec<(bool, bool)> = Vec::new();
        let mut active = true;

        for instruction in &self.instructions {
            let src = |i: usize| regs.read(&instruction.srcs[i]);
            let value = match instruction.opcode {
                Opcode::If => {
                    let condition = src(0)[0] != 0.0;
                    blocks.push((active, condition));
                    active = active && condition;
                    continue;
                }
                Opcode::Else => {
                    let (outer, condition) = *blocks.last().expect("ELSE outside of IF");
                    active = outer && !condition;
                    continue;
                }
                Opcode::Endif => {
                    let (outer, _) = blocks.pop().expect("ENDIF outside of IF");
                    active = outer;
                    continue;
                }
                Opcode::End => break,
                _ if !active => continue,
                Opcode::Mov => src(0),
                Opcode::Add => componentwise(src(0), src(1), |a, b| a + b),
                Opcode::Mul => componentwise(src(0), src(1), |a, b| a * b),
                Opcode::Mad => {
                    let product = componentwise(src(0), src(1), |a, b| a * b);
                    componentwise(product, src(2), |a, b| a + b)
                }
                Opcode::Dp4 => [componentwise(src(0), src(1), |a, b| a * b).iter().sum::<f32>(); 4],
                Opcode::Frc => src(0).map(|a| a - a.floor()),
                Opcode::Flr => src(0).map(f32::floor),
                Opcode::Sge => componentwise(src(0), src(1), |a, b| if a >= b { 1.0 } else { 0.0 }),
                Opcode::Cmp => {
                    let (a, b) = (src(1), src(2));
                    std::array::from_fn(|c| if src(0)[c] < 0.0 { a[c] } else { b[c] })
                }
                Opcode::Lrp => {
                    let t = src(0);
                    let lerp = componentwise(src(1), src(2), |a, b| a - b);
                    std::array::from_fn(|c| t[c] * lerp[c] + src(2)[c])
                }
                Opcode::Tex(kind) => textures[instruction.srcs[1].index].sample(kind, src(0)),
            };

            let dst = instruction.dst.as_ref().expect("instruction without destination");
            regs.write(dst, value);
        }

        regs.outputs
    }
}

mod tests {
    use super::*;
    use crate::backend::ResourceUsage;
    use crate::shader::Semantic;
    use crate::shader::ShaderBuilder;
    use crate::shader::WRITEMASK_W;
    use crate::shader::WRITEMASK_X;
    use crate::shader::WRITEMASK_Y;
    use crate::shader::WRITEMASK_Z;

    #[test]
    fn interpreter_arithmetic_and_branches() {
        let mut shader = ShaderBuilder::new(ShaderStage::Vertex);
        let a = shader.decl_vs_input(0);
        let flag = shader.decl_vs_input(1);
        let scale = shader.decl_constant(0);
        let out = shader.decl_output(Semantic::Generic, 0);
        let misc = shader.decl_output(Semantic::Generic, 1);
        let tmp = shader.decl_temporary();
        let half = shader.imm1f(0.5);
        let ten = shader.imm1f(10.0);

        // out = flag ? frac(a) * scale : -a
        shader.if_(flag.scalar(0));
        shader.frc(tmp, a);
        shader.mul(out, tmp.src(), scale);
        shader.else_();
        shader.mov(out, a.negate());
        shader.endif();

        shader.cmp(misc.writemask(WRITEMASK_X), a.negate().scalar(0), ten, a.scalar(0));
        shader.lrp(misc.writemask(WRITEMASK_Y), half, a.scalar(1), ten);
        shader.sge(misc.writemask(WRITEMASK_Z), a.scalar(2), half);
        shader.dp4(misc.writemask(WRITEMASK_W), a, a);

        let interpreter = ShaderInterpreter::new(&shader.build());
        let inputs = |flag: f32| [[1.5, 2.25, -0.75, 0.0], [flag, 0.0, 0.0, 0.0]];
        let constants = [[2.0, 4.0, 8.0, 16.0]];

        let outputs = interpreter.run(&inputs(1.0), &constants, &[]);
        assert_eq!(outputs[0], [1.0, 1.0, 2.0, 0.0]);
        assert_eq!(outputs[1], [10.0, 6.125, 0.0, 7.875]);

        let outputs = interpreter.run(&inputs(0.0), &constants, &[]);
        assert_eq!(outputs[0], [-1.5, -2.25, 0.75, 0.0]);
    }

    #[test]
    fn interpreter_samples_nearest_texels() {
        let ctx = DummyContext::new();
        let desc = TextureDesc {
            target: TextureTarget::Texture3D,
            format: Format::R16G16B16A16Sscaled,
            width: 2,
            height: 2,
            depth: 2,
            bind: BindFlags::SAMPLER_VIEW,
            usage: ResourceUsage::Static,
        };
        let texture = ctx.create_texture(&desc).unwrap();
        let mut transfer = ctx.transfer_map(texture, true).unwrap();
        let values: Vec<i16> = (0..32).collect();
        LittleEndian::write_i16_into(&values, &mut transfer.data[..64]);
        ctx.transfer_unmap(transfer);
        let view = ctx.create_sampler_view(texture).unwrap();

        let mut shader = ShaderBuilder::new(ShaderStage::Fragment);
        let coord = shader.decl_constant(0);
        let sampler = shader.decl_sampler(0);
        let out2d = shader.decl_output(Semantic::Color, 0);
        let out3d = shader.decl_output(Semantic::Color, 1);
        shader.tex(out2d, TextureKind::Texture2D, coord, sampler);
        shader.tex(out3d, TextureKind::Texture3D, coord, sampler);
        let program = shader.build();
        let handle = ctx.create_shader(&program).unwrap();

        let texels = ctx.texels(view);
        let interpreter = ctx.interpreter(handle);
        // Texel (1, 0) of layer 1.
        let outputs = interpreter.run(&[], &[[0.75, 0.25, 0.6, 0.0]], &[&texels]);
        assert_eq!(outputs[0], [4.0, 5.0, 6.0, 7.0]);
        assert_eq!(outputs[1], [20.0, 21.0, 22.0, 23.0]);
        // Coordinates are clamped to the edges.
        let outputs = interpreter.run(&[], &[[-1.0, 2.0, 0.0, 0.0]], &[&texels]);
        assert_eq!(outputs[0], [8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn render_targets_quantize() {
        let desc = TextureDesc {
            target: TextureTarget::Texture2D,
            format: Format::R16Snorm,
            width: 1,
            height: 1,
            depth: 1,
            bind: BindFlags::RENDER_TARGET,
            usage: ResourceUsage::Static,
        };
        let mut texels = Texels::new(&desc);
        texels.store(0, 0, 0, [2.0, 5.0, 5.0, 5.0]);
        assert_eq!(texels.get(0, 0, 0), [1.0, 0.0, 0.0, 1.0]);
        texels.store(0, 0, 0, [0.1, 0.0, 0.0, 0.0]);
        assert_eq!(texels.get(0, 0, 0)[0], 3277.0 / 32767.0);
    }
}
