//! Deferred destruction of Vulkan objects.
//!
//! Handlers release resources while a frame is being recorded, so the GPU
//! may still reference them. Retired objects wait until the fence of the
//! frame that could have used them has signaled.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, Allocator};
use parking_lot::Mutex;

pub enum Retired {
    Buffer { buffer: vk::Buffer, allocation: Allocation },
    Image { image: vk::Image, allocation: Allocation },
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    DescriptorSet(vk::DescriptorSet),
    Pipeline { pipeline: vk::Pipeline, layout: vk::PipelineLayout },
}

impl Retired {
    /// # Safety
    ///
    /// The GPU must no longer use the object.
    unsafe fn destroy(self, device: &ash::Device, allocator: &Mutex<Allocator>, pool: vk::DescriptorPool) {
        match self {
            Retired::Buffer { buffer, allocation } => {
                if let Err(e) = allocator.lock().free(allocation) {
                    log::error!("Failed to free buffer allocation: {e}");
                }
                unsafe { device.destroy_buffer(buffer, None) };
            }
            Retired::Image { image, allocation } => {
                if let Err(e) = allocator.lock().free(allocation) {
                    log::error!("Failed to free image allocation: {e}");
                }
                unsafe { device.destroy_image(image, None) };
            }
            Retired::ImageView(view) => unsafe { device.destroy_image_view(view, None) },
            Retired::Sampler(sampler) => unsafe { device.destroy_sampler(sampler, None) },
            Retired::DescriptorSetLayout(layout) => unsafe { device.destroy_descriptor_set_layout(layout, None) },
            Retired::DescriptorSet(set) => {
                if let Err(e) = unsafe { device.free_descriptor_sets(pool, &[set]) } {
                    log::error!("Failed to free descriptor set: {e:?}");
                }
            }
            Retired::Pipeline { pipeline, layout } => unsafe {
                device.destroy_pipeline(pipeline, None);
                device.destroy_pipeline_layout(layout, None);
            },
        }
    }
}

/// Two-stage queue: objects retired while recording frame N are destroyed
/// once frame N's fence has been waited on.
#[derive(Default)]
pub struct DeferredDestructor {
    recording: Vec<Retired>,
    submitted: Vec<Retired>,
}

impl DeferredDestructor {
    pub fn retire(&mut self, object: Retired) {
        self.recording.push(object);
    }

    /// Called after submitting a frame
    pub fn frame_submitted(&mut self) {
        self.submitted.append(&mut self.recording);
    }

    /// Destroy everything retired before the last submitted frame.
    ///
    /// # Safety
    ///
    /// The fence of the last submitted frame must have signaled.
    pub unsafe fn collect(&mut self, device: &ash::Device, allocator: &Mutex<Allocator>, pool: vk::DescriptorPool) {
        for object in self.submitted.drain(..) {
            unsafe { object.destroy(device, allocator, pool) };
        }
    }

    /// Destroy everything.
    ///
    /// # Safety
    ///
    /// The device must be idle.
    pub unsafe fn collect_all(&mut self, device: &ash::Device, allocator: &Mutex<Allocator>, pool: vk::DescriptorPool) {
        self.frame_submitted();
        unsafe { self.collect(device, allocator, pool) };
    }

    pub fn pending(&self) -> usize {
        self.recording.len() + self.submitted.len()
    }
}
