// Shader module loading
//
// SPIR-V binaries are produced by build.rs (glslc) and read at startup,
// so shader edits do not require recompiling the renderer.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

use super::VulkanDevice;

/// Read a SPIR-V file and wrap it in a shader module
pub fn load_shader_module<P: AsRef<Path>>(
    device: &VulkanDevice,
    path: P,
) -> Result<vk::ShaderModule> {
    let path = path.as_ref();

    let mut file = File::open(path)
        .with_context(|| format!("Failed to open shader {:?} (run glslc on shaders/)", path))?;

    // read_spv handles the byte-to-word conversion and alignment
    let code = ash::util::read_spv(&mut file)
        .with_context(|| format!("Shader {:?} is not valid SPIR-V", path))?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

    unsafe {
        device
            .device
            .create_shader_module(&create_info, None)
            .with_context(|| format!("Failed to create shader module from {:?}", path))
    }
}
