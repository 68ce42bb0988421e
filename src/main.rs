// Trigon - a deliberately small Vulkan renderer
//
// Draws one triangle per frame. All of the interesting machinery is in the
// frame loop: N frames in flight gated by fences, per-slot semaphore pairs
// sequencing acquire -> draw -> present, an images-in-flight map guarding
// swapchain images, and a rebuild path for out-of-date surfaces.
//
// FRAME FLOW:
// 1. Wait on the current slot's fence
// 2. Acquire a swapchain image
// 3. Wait out any older frame still using that image
// 4. Submit the pre-recorded commands for the image
// 5. Present, then advance to the next slot

mod backend;
mod config;

use anyhow::{Context, Result};
use ash::vk;
use backend::{
    AcquiredImage, FrameSync, ImagesInFlight, Swapchain, VertexBuffer, VulkanDevice,
};
use config::Config;
use notify::Watcher;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const VERT_SHADER_PATH: &str = "shaders/triangle.vert.spv";
const FRAG_SHADER_PATH: &str = "shaders/triangle.frag.spv";

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting trigon");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen {
            "fullscreen"
        } else {
            "windowed"
        }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== trigon log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

/// Everything whose lifetime is tied to the swapchain.
///
/// Viewport and scissor are static pipeline state and the render pass
/// depends on the surface format, so the whole bundle is rebuilt together
/// whenever the surface changes.
struct SwapchainResources {
    render_pass: vk::RenderPass,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    framebuffers: Vec<vk::Framebuffer>,
    // Dropped last: the swapchain must outlive views of its images
    swapchain: Swapchain,
}

impl SwapchainResources {
    fn destroy(&mut self, device: &VulkanDevice) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.device.destroy_framebuffer(framebuffer, None);
            }
            device.device.destroy_pipeline(self.pipeline, None);
            device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            device.device.destroy_render_pass(self.render_pass, None);
        }
        self.framebuffers.clear();
        // self.swapchain is destroyed by its Drop when this struct goes away
    }
}

/// Main application state.
///
/// Field order matters for teardown: Drop destroys resources in reverse
/// order of creation.
pub struct App {
    config: Config,

    // Window & surface
    window: Option<Arc<Window>>,
    surface: Option<vk::SurfaceKHR>,
    surface_loader: Option<ash::extensions::khr::Surface>,
    is_fullscreen: bool,

    // Vulkan core
    device: Option<Arc<VulkanDevice>>,
    shaders: Option<(vk::ShaderModule, vk::ShaderModule)>,
    vertex_buffer: Option<VertexBuffer>,
    resources: Option<SwapchainResources>,

    // Commands
    command_pool: Option<vk::CommandPool>,
    /// One pre-recorded command buffer per swapchain image
    command_buffers: Vec<vk::CommandBuffer>,

    // Synchronization
    frame_sync: Vec<FrameSync>,
    /// Which in-flight slot the next frame uses
    current_frame: usize,
    images_in_flight: ImagesInFlight,
    wait_stages: [vk::PipelineStageFlags; 1],

    // State flags
    /// Swapchain no longer matches the surface; rebuild before rendering
    needs_rebuild: bool,
    /// Window has a zero-size framebuffer; skip rendering entirely
    is_minimized: bool,

    // Config hot reload
    config_rx: Option<mpsc::Receiver<notify::Result<notify::Event>>>,
    _config_watcher: Option<notify::RecommendedWatcher>,

    // FPS tracking
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    pub fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            window: None,
            surface: None,
            surface_loader: None,
            is_fullscreen,
            device: None,
            shaders: None,
            vertex_buffer: None,
            resources: None,
            command_pool: None,
            command_buffers: Vec::new(),
            frame_sync: Vec::new(),
            current_frame: 0,
            images_in_flight: ImagesInFlight::new(0),
            wait_stages: [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT],
            needs_rebuild: false,
            is_minimized: false,
            config_rx: None,
            _config_watcher: None,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    // =========================================================================
    // Initialization
    // =========================================================================

    fn init_vulkan(&mut self, window: Arc<Window>) -> Result<()> {
        use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};

        log::info!("Initializing Vulkan...");

        let display_handle = window.raw_display_handle();
        let window_handle = window.raw_window_handle();

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device =
            VulkanDevice::new(&self.config.window.title, enable_validation, display_handle)?;

        let surface_loader = ash::extensions::khr::Surface::new(&device.entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(
                &device.entry,
                &device.instance,
                display_handle,
                window_handle,
                None,
            )
            .context("Failed to create window surface")?
        };

        // The graphics queue must also be able to present to this surface
        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        if !surface_support {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        self.surface = Some(surface);
        self.surface_loader = Some(surface_loader);
        // Stored before the remaining fallible steps so a failed init still
        // tears down through Drop
        self.device = Some(device.clone());

        let vert = backend::shader::load_shader_module(&device, VERT_SHADER_PATH)?;
        let frag = backend::shader::load_shader_module(&device, FRAG_SHADER_PATH)?;
        self.shaders = Some((vert, frag));

        self.vertex_buffer = Some(VertexBuffer::new(&device, &backend::vertex::TRIANGLE)?);

        let max_frames = self.config.graphics.max_frames_in_flight.max(1);
        self.frame_sync = (0..max_frames)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        self.create_swapchain_resources(&window)?;

        self.start_config_watcher();

        log::info!(
            "Vulkan initialized ({} frames in flight)",
            self.frame_sync.len()
        );
        Ok(())
    }

    /// (Re)create the swapchain and everything hanging off it.
    ///
    /// Called at startup and again whenever the surface invalidates the
    /// current swapchain.
    fn create_swapchain_resources(&mut self, window: &Window) -> Result<()> {
        let device = self.device.clone().context("Device not initialized")?;
        let surface = self.surface.context("Surface not initialized")?;
        let surface_loader = self
            .surface_loader
            .as_ref()
            .context("Surface loader not initialized")?;

        let size = window.inner_size();

        // A zero-extent swapchain is invalid; wait for a real resize
        if size.width == 0 || size.height == 0 {
            self.is_minimized = true;
            return Ok(());
        }
        self.is_minimized = false;

        // The surface can only have one swapchain at a time
        if let Some(mut old) = self.resources.take() {
            old.destroy(&device);
        }

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            surface_loader,
            size.width,
            size.height,
            self.config.present_mode(),
        )?;

        let render_pass = backend::pipeline::create_render_pass(&device, swapchain.format)?;

        let (vert, frag) = self.shaders.context("Shaders not loaded")?;
        let (pipeline, pipeline_layout) = backend::pipeline::create_graphics_pipeline(
            &device,
            render_pass,
            swapchain.extent,
            vert,
            frag,
        )?;

        let framebuffers = backend::pipeline::create_framebuffers(
            &device,
            &swapchain.image_views,
            render_pass,
            swapchain.extent,
        )?;

        if self.command_pool.is_none() {
            let pool_info = vk::CommandPoolCreateInfo::builder()
                .queue_family_index(device.graphics_queue_family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            let command_pool = unsafe { device.device.create_command_pool(&pool_info, None)? };
            self.command_pool = Some(command_pool);
        }
        let command_pool = self.command_pool.context("Command pool not initialized")?;

        if !self.command_buffers.is_empty() {
            unsafe {
                device
                    .device
                    .free_command_buffers(command_pool, &self.command_buffers);
            }
        }

        let image_count = swapchain.images.len();
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(image_count as u32);

        let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info)? };

        let resources = SwapchainResources {
            render_pass,
            pipeline_layout,
            pipeline,
            framebuffers,
            swapchain,
        };

        self.record_command_buffers(&device, &resources, &command_buffers)?;

        // Old image indices are meaningless against the new swapchain
        self.images_in_flight.reset(image_count);

        self.resources = Some(resources);
        self.command_buffers = command_buffers;
        self.needs_rebuild = false;

        log::info!("Recorded {} command buffers", image_count);

        Ok(())
    }

    fn recreate_swapchain(&mut self) -> Result<()> {
        // Nothing may be in flight while swapchain-dependent objects die
        if let Some(ref device) = self.device {
            device.wait_idle()?;
        }

        let window = self.window.clone();
        if let Some(ref win) = window {
            self.create_swapchain_resources(win)?;
        }

        Ok(())
    }

    // =========================================================================
    // Command recording
    // =========================================================================

    /// Pre-record one command buffer per swapchain image. The triangle is
    /// static, so recording happens only on (re)creation and config reload.
    fn record_command_buffers(
        &self,
        device: &VulkanDevice,
        resources: &SwapchainResources,
        command_buffers: &[vk::CommandBuffer],
    ) -> Result<()> {
        let vertex_buffer = self
            .vertex_buffer
            .as_ref()
            .context("Vertex buffer not initialized")?;

        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.config.graphics.clear_color,
            },
        }];

        for (i, &cmd) in command_buffers.iter().enumerate() {
            unsafe {
                let begin_info = vk::CommandBufferBeginInfo::builder();
                device.device.begin_command_buffer(cmd, &begin_info)?;

                let render_area = vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: resources.swapchain.extent,
                };
                let render_pass_begin = vk::RenderPassBeginInfo::builder()
                    .render_pass(resources.render_pass)
                    .framebuffer(resources.framebuffers[i])
                    .render_area(render_area)
                    .clear_values(&clear_values);

                device.device.cmd_begin_render_pass(
                    cmd,
                    &render_pass_begin,
                    vk::SubpassContents::INLINE,
                );
                device.device.cmd_bind_pipeline(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    resources.pipeline,
                );
                device
                    .device
                    .cmd_bind_vertex_buffers(cmd, 0, &[vertex_buffer.buffer], &[0]);
                device
                    .device
                    .cmd_draw(cmd, vertex_buffer.vertex_count, 1, 0, 0);
                device.device.cmd_end_render_pass(cmd);

                device.device.end_command_buffer(cmd)?;
            }
        }

        Ok(())
    }

    // =========================================================================
    // Render loop
    // =========================================================================

    /// Render a single frame. Returns false when no frame was produced
    /// (minimized, or the swapchain went out of date).
    pub fn render_frame(&mut self) -> Result<bool> {
        if self.is_minimized {
            return Ok(false);
        }

        if self.needs_rebuild {
            self.recreate_swapchain()?;
            if self.is_minimized || self.needs_rebuild {
                return Ok(false);
            }
        }

        let device = self.device.clone().context("Device not initialized")?;
        let sync = &self.frame_sync[self.current_frame];
        let (image_available, render_finished, in_flight_fence) =
            (sync.image_available, sync.render_finished, sync.in_flight_fence);

        // Gate on this slot's previous frame before touching its resources
        unsafe {
            device
                .device
                .wait_for_fences(&[in_flight_fence], true, u64::MAX)?;
        }

        let resources = self.resources.as_ref().context("Swapchain not initialized")?;

        let image_index = match resources
            .swapchain
            .acquire_next_image(u64::MAX, image_available)?
        {
            AcquiredImage::Available { index, suboptimal } => {
                if suboptimal {
                    // Still usable; finish the frame and rebuild afterwards
                    self.needs_rebuild = true;
                }
                index
            }
            AcquiredImage::OutOfDate => {
                // Abandon the frame: the fence stays signaled and the slot
                // is not advanced, so nothing deadlocks
                self.needs_rebuild = true;
                return Ok(false);
            }
        };

        // A frame from another slot may still be rendering to this image
        if let Some(fence) = self.images_in_flight.fence_for(image_index as usize) {
            unsafe {
                device.device.wait_for_fences(&[fence], true, u64::MAX)?;
            }
        }
        self.images_in_flight
            .mark(image_index as usize, in_flight_fence);

        // Reset only after a successful acquire; resetting before an
        // abandoned frame would deadlock the next wait on this slot
        unsafe {
            device.device.reset_fences(&[in_flight_fence])?;
        }

        let wait_semaphores = [image_available];
        let signal_semaphores = [render_finished];
        let command_buffers = [self.command_buffers[image_index as usize]];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&self.wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            device.device.queue_submit(
                device.graphics_queue,
                &[submit_info.build()],
                in_flight_fence,
            )?;
        }

        let resources = self.resources.as_ref().context("Swapchain not initialized")?;
        let outcome = resources.swapchain.present(
            device.graphics_queue,
            image_index,
            &[render_finished],
        )?;
        if outcome.needs_rebuild() {
            self.needs_rebuild = true;
        }

        self.current_frame = (self.current_frame + 1) % self.frame_sync.len();

        Ok(true)
    }

    // =========================================================================
    // Config hot reload
    // =========================================================================

    fn start_config_watcher(&mut self) {
        let (tx, rx) = mpsc::channel();

        let watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let _ = tx.send(event);
        });

        match watcher {
            Ok(mut watcher) => {
                match watcher.watch(Path::new(Config::FILE), notify::RecursiveMode::NonRecursive) {
                    Ok(()) => {
                        log::info!("Watching {} for changes", Config::FILE);
                        self.config_rx = Some(rx);
                        self._config_watcher = Some(watcher);
                    }
                    Err(e) => {
                        // Typically the file just doesn't exist
                        log::debug!("Config hot reload disabled: {}", e);
                    }
                }
            }
            Err(e) => {
                log::debug!("Config hot reload unavailable: {}", e);
            }
        }
    }

    fn poll_config_reload(&mut self) {
        let Some(rx) = &self.config_rx else {
            return;
        };

        let mut changed = false;
        while let Ok(event) = rx.try_recv() {
            if let Ok(event) = event {
                if event.kind.is_modify() || event.kind.is_create() {
                    changed = true;
                }
            }
        }
        if !changed {
            return;
        }

        let fresh = Config::load();

        if fresh.graphics.max_frames_in_flight != self.config.graphics.max_frames_in_flight {
            log::warn!("max_frames_in_flight changes take effect on restart");
        }

        let graphics_changed = fresh.graphics.clear_color != self.config.graphics.clear_color
            || fresh.graphics.present_mode != self.config.graphics.present_mode;

        if graphics_changed {
            log::info!("Graphics config changed, rebuilding swapchain resources");
            self.config.graphics.clear_color = fresh.graphics.clear_color;
            self.config.graphics.present_mode = fresh.graphics.present_mode;
            self.needs_rebuild = true;
        }
    }

    // =========================================================================
    // Fullscreen & FPS
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.needs_rebuild = true;
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        if now.duration_since(self.last_fps_update).as_secs_f32() >= 1.0 {
            let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
            let fps = self.frame_count as f32 / elapsed;

            if let Some(ref window) = self.window {
                let mode = if self.is_fullscreen {
                    "fullscreen"
                } else {
                    "windowed"
                };
                window.set_title(&format!(
                    "{} - {:.0} FPS ({:.2}ms) [{}]",
                    self.config.window.title,
                    fps,
                    frame_time * 1000.0,
                    mode
                ));
            }

            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }
}

// =============================================================================
// Event handling
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_vulkan(window.clone()) {
            log::error!("Failed to initialize Vulkan: {:?}", e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    let _ = device.wait_idle();
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    self.is_minimized = true;
                } else {
                    self.is_minimized = false;
                    self.needs_rebuild = true;
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(rendered) => {
                    if rendered {
                        self.update_fps();
                    }
                }
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => {
                                self.toggle_fullscreen();
                            }
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        self.poll_config_reload();

        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

// =============================================================================
// Cleanup
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");

        if let Some(device) = self.device.clone() {
            let _ = device.wait_idle();

            unsafe {
                for sync in &self.frame_sync {
                    sync.destroy(&device.device);
                }
                self.frame_sync.clear();

                if let Some(pool) = self.command_pool.take() {
                    // Also frees the command buffers
                    device.device.destroy_command_pool(pool, None);
                }

                if let Some(mut resources) = self.resources.take() {
                    resources.destroy(&device);
                }

                if let Some(mut vertex_buffer) = self.vertex_buffer.take() {
                    vertex_buffer.destroy(&device);
                }

                if let Some((vert, frag)) = self.shaders.take() {
                    device.device.destroy_shader_module(vert, None);
                    device.device.destroy_shader_module(frag, None);
                }

                if let (Some(surface), Some(ref loader)) = (self.surface.take(), &self.surface_loader)
                {
                    loader.destroy_surface(surface, None);
                }
            }
        }

        log::info!("Cleanup complete");
    }
}
