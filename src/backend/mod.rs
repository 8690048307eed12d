//! Backend abstraction layer
//!
//! Provides common traits and types that the wgpu, Vulkan and dummy backends
//! implement, plus the [`Backend`] wrapper the renderer talks to.

pub mod dummy;
pub mod shader;
pub mod traits;
pub mod types;
pub mod vulkan;
pub mod wgpu_backend;

pub use traits::*;
pub use types::*;

use crate::BackendType;
use dummy::DummyBackend;
use std::sync::Arc;
use vulkan::VulkanBackend;
use wgpu_backend::WgpuBackend;
use winit::window::Window as WinitWindow;

/// Backend wrapper to abstract over different backends
pub enum Backend {
    Wgpu(WgpuBackend),
    Vulkan(VulkanBackend),
    Dummy(DummyBackend),
}

impl Backend {
    /// Create a backend presenting to `window`
    pub fn new(window: Arc<WinitWindow>, backend_type: BackendType, vsync: bool) -> BackendResult<Self> {
        match backend_type {
            BackendType::Wgpu => Ok(Backend::Wgpu(WgpuBackend::new(window, vsync)?)),
            BackendType::Vulkan => Ok(Backend::Vulkan(VulkanBackend::new(window, vsync)?)),
            BackendType::Dummy => {
                let size = window.inner_size();
                Ok(Backend::Dummy(DummyBackend::new(size.width, size.height)))
            }
        }
    }

    /// Create a backend rendering into an offscreen target
    pub fn headless(backend_type: BackendType, width: u32, height: u32) -> BackendResult<Self> {
        match backend_type {
            BackendType::Wgpu => Ok(Backend::Wgpu(WgpuBackend::headless(width, height)?)),
            BackendType::Vulkan => Err(BackendError::InitializationFailed(
                "Vulkan backend requires a window".into(),
            )),
            BackendType::Dummy => Ok(Backend::Dummy(DummyBackend::new(width, height))),
        }
    }

    pub fn backend_type(&self) -> BackendType {
        match self {
            Backend::Wgpu(_) => BackendType::Wgpu,
            Backend::Vulkan(_) => BackendType::Vulkan,
            Backend::Dummy(_) => BackendType::Dummy,
        }
    }

    /// Get the wgpu backend if using wgpu
    pub fn as_wgpu(&self) -> Option<&WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }

    /// Get mutable wgpu backend if using wgpu
    pub fn as_wgpu_mut(&mut self) -> Option<&mut WgpuBackend> {
        match self {
            Backend::Wgpu(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dummy(&self) -> Option<&DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_dummy_mut(&mut self) -> Option<&mut DummyBackend> {
        match self {
            Backend::Dummy(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $b:ident => $body:expr) => {
        match $self {
            Backend::Wgpu($b) => $body,
            Backend::Vulkan($b) => $body,
            Backend::Dummy($b) => $body,
        }
    };
}

impl GraphicsBackend for Backend {
    fn name(&self) -> &'static str {
        dispatch!(self, b => b.name())
    }

    fn resize(&mut self, width: u32, height: u32) {
        dispatch!(self, b => b.resize(width, height))
    }

    fn surface_size(&self) -> (u32, u32) {
        dispatch!(self, b => b.surface_size())
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        dispatch!(self, b => b.begin_frame())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        dispatch!(self, b => b.end_frame())
    }

    fn swapchain_format(&self) -> TextureFormat {
        dispatch!(self, b => b.swapchain_format())
    }

    fn wait_idle(&mut self) {
        dispatch!(self, b => b.wait_idle())
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        dispatch!(self, b => b.create_buffer_init(desc, data))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        dispatch!(self, b => b.write_buffer(buffer, offset, data))
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        dispatch!(self, b => b.create_texture(desc))
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        dispatch!(self, b => b.create_texture_view(texture))
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        dispatch!(self, b => b.write_texture(texture, data, width, height))
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        dispatch!(self, b => b.create_sampler(desc))
    }

    fn create_shader_module(&mut self, desc: &ShaderModuleDescriptor) -> BackendResult<ShaderModuleHandle> {
        dispatch!(self, b => b.create_shader_module(desc))
    }

    fn create_bind_group_layout(&mut self, entries: &[BindGroupLayoutEntry]) -> BackendResult<BindGroupLayoutHandle> {
        dispatch!(self, b => b.create_bind_group_layout(entries))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        dispatch!(self, b => b.create_bind_group(layout, entries))
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDescriptor) -> BackendResult<RenderPipelineHandle> {
        dispatch!(self, b => b.create_render_pipeline(desc))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        dispatch!(self, b => b.begin_render_pass(desc))
    }

    fn end_render_pass(&mut self) {
        dispatch!(self, b => b.end_render_pass())
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        dispatch!(self, b => b.set_render_pipeline(pipeline))
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle) {
        dispatch!(self, b => b.set_bind_group(index, bind_group))
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        dispatch!(self, b => b.set_vertex_buffer(slot, buffer, offset))
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        dispatch!(self, b => b.set_index_buffer(buffer, offset, format))
    }

    fn draw(&mut self, vertices: std::ops::Range<u32>, instances: std::ops::Range<u32>) {
        dispatch!(self, b => b.draw(vertices, instances))
    }

    fn draw_indexed(&mut self, indices: std::ops::Range<u32>, base_vertex: i32, instances: std::ops::Range<u32>) {
        dispatch!(self, b => b.draw_indexed(indices, base_vertex, instances))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        dispatch!(self, b => b.destroy_buffer(buffer))
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        dispatch!(self, b => b.destroy_texture(texture))
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        dispatch!(self, b => b.destroy_texture_view(view))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        dispatch!(self, b => b.destroy_sampler(sampler))
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        dispatch!(self, b => b.destroy_shader_module(module))
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        dispatch!(self, b => b.destroy_bind_group_layout(layout))
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        dispatch!(self, b => b.destroy_bind_group(bind_group))
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        dispatch!(self, b => b.destroy_render_pipeline(pipeline))
    }
}
