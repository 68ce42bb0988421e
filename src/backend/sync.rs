// Synchronization primitives
//
// Fences gate CPU reuse of per-frame resources; semaphores sequence the
// GPU-side acquire -> draw -> present chain. The images-in-flight map keeps
// two frame slots from submitting against the same swapchain image.

use anyhow::Result;
use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;

/// Frame synchronization - one set per frame in flight
pub struct FrameSync {
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Created signaled so the first wait on this slot passes immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            Ok(Self {
                image_available: device.device.create_semaphore(&semaphore_info, None)?,
                render_finished: device.device.create_semaphore(&semaphore_info, None)?,
                in_flight_fence: device.device.create_fence(&fence_info, None)?,
            })
        }
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_semaphore(self.render_finished, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Tracks which frame slot's fence currently owns each swapchain image.
///
/// Acquire order is driver-controlled, so with N slots and M images an image
/// can come back while a submission from an older slot still targets it.
/// Before reusing an image the frame loop must wait on the fence recorded
/// here, if any.
#[derive(Debug)]
pub struct ImagesInFlight {
    fences: Vec<vk::Fence>,
}

impl ImagesInFlight {
    pub fn new(image_count: usize) -> Self {
        Self {
            fences: vec![vk::Fence::null(); image_count],
        }
    }

    /// Fence of the frame still rendering to `image_index`, if any
    pub fn fence_for(&self, image_index: usize) -> Option<vk::Fence> {
        let fence = self.fences[image_index];
        if fence == vk::Fence::null() {
            None
        } else {
            Some(fence)
        }
    }

    /// Record that the frame slot owning `fence` is now rendering to
    /// `image_index`
    pub fn mark(&mut self, image_index: usize, fence: vk::Fence) {
        self.fences[image_index] = fence;
    }

    /// Drop all associations. Required after swapchain recreation: the old
    /// image indices no longer mean anything.
    pub fn reset(&mut self, image_count: usize) {
        self.fences.clear();
        self.fences.resize(image_count, vk::Fence::null());
    }

    pub fn image_count(&self) -> usize {
        self.fences.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn fence(raw: u64) -> vk::Fence {
        vk::Fence::from_raw(raw)
    }

    #[test]
    fn starts_with_no_images_owned() {
        let map = ImagesInFlight::new(3);
        assert_eq!(map.image_count(), 3);
        for i in 0..3 {
            assert_eq!(map.fence_for(i), None);
        }
    }

    #[test]
    fn marked_image_reports_its_fence() {
        let mut map = ImagesInFlight::new(3);
        map.mark(1, fence(0xA));

        assert_eq!(map.fence_for(0), None);
        assert_eq!(map.fence_for(1), Some(fence(0xA)));
        assert_eq!(map.fence_for(2), None);
    }

    #[test]
    fn remark_replaces_previous_owner() {
        let mut map = ImagesInFlight::new(2);
        map.mark(0, fence(0xA));
        map.mark(0, fence(0xB));

        assert_eq!(map.fence_for(0), Some(fence(0xB)));
    }

    #[test]
    fn reset_clears_owners_and_resizes() {
        let mut map = ImagesInFlight::new(2);
        map.mark(0, fence(0xA));
        map.mark(1, fence(0xB));

        map.reset(4);

        assert_eq!(map.image_count(), 4);
        for i in 0..4 {
            assert_eq!(map.fence_for(i), None);
        }
    }
}
