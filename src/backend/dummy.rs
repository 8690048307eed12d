//! Dummy GPU backend for testing.
//!
//! Performs no GPU work. Every object it hands out is tracked so tests can
//! check what is alive, what a buffer contains and which draws were issued.

use std::collections::HashMap;
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;

/// Kind of backend object, used to query the live set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    ShaderModule,
    BindGroupLayout,
    BindGroup,
    RenderPipeline,
}

#[derive(Debug, Clone)]
struct LiveObject {
    kind: ObjectKind,
    label: Option<String>,
}

/// A draw recorded inside a render pass
#[derive(Debug, Clone, PartialEq)]
pub struct DrawCall {
    pub pipeline: Option<RenderPipelineHandle>,
    pub target: TextureViewHandle,
    pub vertex_buffers: Vec<(u32, BufferHandle)>,
    pub index_buffer: Option<(BufferHandle, IndexFormat)>,
    pub elements: Range<u32>,
    pub instances: Range<u32>,
    pub indexed: bool,
}

#[derive(Debug, Default)]
struct PassState {
    target: Option<TextureViewHandle>,
    pipeline: Option<RenderPipelineHandle>,
    vertex_buffers: Vec<(u32, BufferHandle)>,
    index_buffer: Option<(BufferHandle, IndexFormat)>,
}

/// Dummy GPU backend
#[derive(Debug)]
pub struct DummyBackend {
    next_id: u64,
    live: HashMap<u64, LiveObject>,
    buffer_contents: HashMap<u64, Vec<u8>>,
    width: u32,
    height: u32,
    swapchain_view: Option<TextureViewHandle>,
    frame_open: bool,
    pass: Option<PassState>,
    passes: Vec<RenderPassDescriptor>,
    draws: Vec<DrawCall>,
    frames_presented: u64,
    /// Successful creations left before the injected failure
    fail_countdown: Option<usize>,
}

impl DummyBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            next_id: 1,
            live: HashMap::new(),
            buffer_contents: HashMap::new(),
            width,
            height,
            swapchain_view: None,
            frame_open: false,
            pass: None,
            passes: Vec::new(),
            draws: Vec::new(),
            frames_presented: 0,
            fail_countdown: None,
        }
    }

    fn allocate(&mut self, kind: ObjectKind, label: Option<&str>) -> BackendResult<u64> {
        let fail = match self.fail_countdown {
            Some(0) => {
                self.fail_countdown = None;
                true
            }
            Some(n) => {
                self.fail_countdown = Some(n - 1);
                false
            }
            None => false,
        };
        if fail {
            log::trace!("DummyBackend: failing creation of {kind:?} {label:?}");
            return Err(match kind {
                ObjectKind::Buffer => BackendError::BufferCreationFailed("injected failure".into()),
                ObjectKind::Texture | ObjectKind::TextureView | ObjectKind::Sampler => {
                    BackendError::TextureCreationFailed("injected failure".into())
                }
                ObjectKind::ShaderModule => BackendError::ShaderCreationFailed("injected failure".into()),
                _ => BackendError::PipelineCreationFailed("injected failure".into()),
            });
        }

        let id = self.next_id;
        self.next_id += 1;
        log::trace!("DummyBackend: creating {kind:?} #{id} {label:?}");
        self.live.insert(
            id,
            LiveObject {
                kind,
                label: label.map(str::to_string),
            },
        );
        Ok(id)
    }

    fn free(&mut self, kind: ObjectKind, id: u64) {
        match self.live.remove(&id) {
            Some(object) if object.kind == kind => {
                log::trace!("DummyBackend: destroying {kind:?} #{id}");
            }
            Some(object) => {
                log::warn!("DummyBackend: destroyed #{id} as {kind:?} but it is a {:?}", object.kind);
            }
            None => log::warn!("DummyBackend: double destroy of {kind:?} #{id}"),
        }
        self.buffer_contents.remove(&id);
    }

    /// Make the next object creation fail
    pub fn fail_next_creation(&mut self) {
        self.fail_after(0);
    }

    /// Let `successes` creations through, then fail one
    pub fn fail_after(&mut self, successes: usize) {
        self.fail_countdown = Some(successes);
    }

    /// Number of live objects of `kind`
    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.live.values().filter(|o| o.kind == kind).count()
    }

    /// Number of live objects of any kind
    pub fn live_total(&self) -> usize {
        self.live.len()
    }

    /// Number of objects ever created, destroyed or not
    pub fn created_total(&self) -> usize {
        (self.next_id - 1) as usize
    }

    /// Labels of live objects of `kind`, sorted
    pub fn live_labels(&self, kind: ObjectKind) -> Vec<String> {
        let mut labels: Vec<String> = self
            .live
            .values()
            .filter(|o| o.kind == kind)
            .filter_map(|o| o.label.clone())
            .collect();
        labels.sort();
        labels
    }

    pub fn is_alive(&self, id: u64) -> bool {
        self.live.contains_key(&id)
    }

    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffer_contents.get(&buffer.0).map(Vec::as_slice)
    }

    pub fn draws(&self) -> &[DrawCall] {
        &self.draws
    }

    pub fn passes(&self) -> &[RenderPassDescriptor] {
        &self.passes
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Forget recorded draws and passes
    pub fn clear_history(&mut self) {
        self.draws.clear();
        self.passes.clear();
    }
}

impl GraphicsBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy"
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.width = width.max(1);
        self.height = height.max(1);
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        if self.frame_open {
            return Err(BackendError::AcquireImageFailed("frame already in progress".into()));
        }
        let view = match self.swapchain_view {
            Some(view) => view,
            None => {
                let id = self.allocate(ObjectKind::TextureView, Some("swapchain"))?;
                let view = TextureViewHandle(id);
                self.swapchain_view = Some(view);
                view
            }
        };
        self.frame_open = true;
        Ok(FrameContext {
            swapchain_view: view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if !self.frame_open {
            return Err(BackendError::PresentFailed("no frame in progress".into()));
        }
        if self.pass.is_some() {
            self.end_render_pass();
        }
        self.frame_open = false;
        self.frames_presented += 1;
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn wait_idle(&mut self) {}

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let id = self.allocate(ObjectKind::Buffer, desc.label.as_deref())?;
        let mut contents = vec![0u8; desc.size as usize];
        let len = data.len().min(contents.len());
        contents[..len].copy_from_slice(&data[..len]);
        self.buffer_contents.insert(id, contents);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffer_contents.get_mut(&buffer.0) {
            Some(contents) => {
                let start = offset as usize;
                let end = start + data.len();
                if end > contents.len() {
                    log::warn!("DummyBackend: write past the end of buffer #{}", buffer.0);
                    return;
                }
                contents[start..end].copy_from_slice(data);
            }
            None => log::warn!("DummyBackend: write to unknown buffer #{}", buffer.0),
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        self.allocate(ObjectKind::Texture, desc.label.as_deref())
            .map(TextureHandle)
    }

    fn create_texture_view(&mut self, texture: TextureHandle) -> BackendResult<TextureViewHandle> {
        let label = self.live.get(&texture.0).and_then(|o| o.label.clone());
        self.allocate(ObjectKind::TextureView, label.as_deref())
            .map(TextureViewHandle)
    }

    fn write_texture(&mut self, texture: TextureHandle, data: &[u8], width: u32, height: u32) {
        log::trace!(
            "DummyBackend: writing {} bytes ({width}x{height}) to texture #{}",
            data.len(),
            texture.0
        );
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        self.allocate(ObjectKind::Sampler, desc.label.as_deref())
            .map(SamplerHandle)
    }

    fn create_shader_module(&mut self, desc: &ShaderModuleDescriptor) -> BackendResult<ShaderModuleHandle> {
        self.allocate(ObjectKind::ShaderModule, desc.label.as_deref())
            .map(ShaderModuleHandle)
    }

    fn create_bind_group_layout(&mut self, _entries: &[BindGroupLayoutEntry]) -> BackendResult<BindGroupLayoutHandle> {
        self.allocate(ObjectKind::BindGroupLayout, None)
            .map(BindGroupLayoutHandle)
    }

    fn create_bind_group(
        &mut self,
        _layout: BindGroupLayoutHandle,
        _entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        self.allocate(ObjectKind::BindGroup, None).map(BindGroupHandle)
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineDescriptor) -> BackendResult<RenderPipelineHandle> {
        self.allocate(ObjectKind::RenderPipeline, desc.label.as_deref())
            .map(RenderPipelineHandle)
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        if self.pass.is_some() {
            log::warn!("DummyBackend: render pass begun while another is open");
        }
        self.pass = Some(PassState {
            target: desc.color_attachments.first().map(|a| a.view),
            ..Default::default()
        });
        self.passes.push(desc.clone());
    }

    fn end_render_pass(&mut self) {
        if self.pass.take().is_none() {
            log::warn!("DummyBackend: end_render_pass without an open pass");
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        if let Some(pass) = &mut self.pass {
            pass.pipeline = Some(pipeline);
        }
    }

    fn set_bind_group(&mut self, _index: u32, _bind_group: BindGroupHandle) {}

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, _offset: u64) {
        if let Some(pass) = &mut self.pass {
            pass.vertex_buffers.retain(|(s, _)| *s != slot);
            pass.vertex_buffers.push((slot, buffer));
        }
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, _offset: u64, format: IndexFormat) {
        if let Some(pass) = &mut self.pass {
            pass.index_buffer = Some((buffer, format));
        }
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record_draw(vertices, instances, false);
    }

    fn draw_indexed(&mut self, indices: Range<u32>, _base_vertex: i32, instances: Range<u32>) {
        self.record_draw(indices, instances, true);
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.free(ObjectKind::Buffer, buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.free(ObjectKind::Texture, texture.0);
    }

    fn destroy_texture_view(&mut self, view: TextureViewHandle) {
        self.free(ObjectKind::TextureView, view.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.free(ObjectKind::Sampler, sampler.0);
    }

    fn destroy_shader_module(&mut self, module: ShaderModuleHandle) {
        self.free(ObjectKind::ShaderModule, module.0);
    }

    fn destroy_bind_group_layout(&mut self, layout: BindGroupLayoutHandle) {
        self.free(ObjectKind::BindGroupLayout, layout.0);
    }

    fn destroy_bind_group(&mut self, bind_group: BindGroupHandle) {
        self.free(ObjectKind::BindGroup, bind_group.0);
    }

    fn destroy_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.free(ObjectKind::RenderPipeline, pipeline.0);
    }
}

impl DummyBackend {
    fn record_draw(&mut self, elements: Range<u32>, instances: Range<u32>, indexed: bool) {
        let Some(pass) = &self.pass else {
            log::warn!("DummyBackend: draw outside of a render pass");
            return;
        };
        let Some(target) = pass.target else {
            return;
        };
        let mut vertex_buffers = pass.vertex_buffers.clone();
        vertex_buffers.sort_by_key(|(slot, _)| *slot);
        self.draws.push(DrawCall {
            pipeline: pass.pipeline,
            target,
            vertex_buffers,
            index_buffer: pass.index_buffer,
            elements,
            instances,
            indexed,
        });
    }
}

impl Drop for DummyBackend {
    fn drop(&mut self) {
        if let Some(view) = self.swapchain_view.take() {
            self.live.remove(&view.0);
        }
        if !self.live.is_empty() {
            log::debug!("DummyBackend: dropped with {} live objects", self.live.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_desc(size: u64) -> BufferDescriptor {
        BufferDescriptor {
            label: Some("test".into()),
            size,
            usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
        }
    }

    #[test]
    fn test_buffer_lifecycle() {
        let mut backend = DummyBackend::new(64, 64);
        let buffer = backend.create_buffer_init(&buffer_desc(8), &[1, 2, 3, 4]).unwrap();
        assert_eq!(backend.buffer_contents(buffer), Some(&[1, 2, 3, 4, 0, 0, 0, 0][..]));

        backend.write_buffer(buffer, 4, &[9, 9]);
        assert_eq!(backend.buffer_contents(buffer), Some(&[1, 2, 3, 4, 9, 9, 0, 0][..]));
        assert_eq!(backend.live_labels(ObjectKind::Buffer), vec!["test".to_string()]);

        backend.destroy_buffer(buffer);
        assert_eq!(backend.live_count(ObjectKind::Buffer), 0);
        assert!(backend.buffer_contents(buffer).is_none());
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let mut backend = DummyBackend::new(64, 64);
        backend.fail_next_creation();
        assert!(backend.create_buffer_init(&buffer_desc(4), &[]).is_err());
        assert!(backend.create_buffer_init(&buffer_desc(4), &[]).is_ok());
    }

    #[test]
    fn test_records_draws_in_pass() {
        let mut backend = DummyBackend::new(64, 64);
        let frame = backend.begin_frame().unwrap();
        backend.begin_render_pass(&RenderPassDescriptor {
            label: None,
            color_attachments: vec![ColorAttachment {
                view: frame.swapchain_view,
                load_op: LoadOp::Clear([0.0; 4]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        let buffer = backend.create_buffer_init(&buffer_desc(4), &[]).unwrap();
        backend.set_vertex_buffer(0, buffer, 0);
        backend.draw(0..3, 0..1);
        backend.end_frame().unwrap();

        assert_eq!(backend.draws().len(), 1);
        assert_eq!(backend.draws()[0].vertex_buffers, vec![(0, buffer)]);
        assert_eq!(backend.draws()[0].target, frame.swapchain_view);
        assert_eq!(backend.frames_presented(), 1);
        assert!(backend.end_frame().is_err());
    }
}
