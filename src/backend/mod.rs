// Backend module - Vulkan abstraction layer
//
// Thin wrappers around ash. The frame loop in main.rs owns the protocol;
// these modules own object lifetimes and negotiation.

pub mod buffer;
pub mod device;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod vertex;

pub use buffer::VertexBuffer;
pub use device::VulkanDevice;
pub use swapchain::{AcquiredImage, PresentOutcome, Swapchain};
pub use sync::{FrameSync, ImagesInFlight};
pub use vertex::Vertex;
