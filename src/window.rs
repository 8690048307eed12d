//! Window management using winit
//!
//! The event-loop thread doubles as the rendering thread: frames are drawn on
//! `RedrawRequested`, and [`RenderingEnvironment::trigger_rendering`] requests
//! a redraw from any thread.

use crate::backend::{Backend, BackendError};
use crate::environment::RenderingEnvironment;
use crate::error::RenderResult;
use crate::renderer::Renderer;
use crate::EnvironmentConfig;
use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> RenderResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| BackendError::InitializationFailed(format!("cannot create window: {e}")))?;

        Ok(Self {
            window: Arc::new(window),
            width,
            height,
            resized: false,
            close_requested: false,
        })
    }

    /// Get the raw window for backend initialization
    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    /// Get arc reference to window
    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    /// Get current window dimensions
    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Check if window was resized since last frame
    pub fn was_resized(&self) -> bool {
        self.resized
    }

    /// Clear the resize flag
    pub fn clear_resize_flag(&mut self) {
        self.resized = false;
    }

    /// Check if close was requested
    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    /// Request a redraw
    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

/// Open a window and render `environment` into it until the window closes.
///
/// `on_update` runs once per event-loop iteration, before a frame is
/// triggered; the renderer is released when the loop exits.
pub fn run<F>(config: EnvironmentConfig, environment: RenderingEnvironment, mut on_update: F) -> RenderResult<()>
where
    F: FnMut(&mut Window, &RenderingEnvironment) + 'static,
{
    let event_loop =
        EventLoop::new().map_err(|e| BackendError::InitializationFailed(format!("cannot create event loop: {e}")))?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;

    let backend = Backend::new(window.window_arc(), config.backend, config.vsync)?;
    log::info!("Opened `{}` with the {:?} backend", config.title, config.backend);
    let mut renderer = Some(Renderer::from_config(backend, &config));

    let redraw = window.window_arc();
    environment.set_wake_hook(move || redraw.request_redraw());
    environment.claim_drainer()?;

    event_loop
        .run(move |event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);

                    match event {
                        WindowEvent::CloseRequested => elwt.exit(),
                        WindowEvent::RedrawRequested => {
                            let Some(renderer) = renderer.as_mut() else {
                                return;
                            };
                            if window.was_resized() {
                                let (width, height) = window.dimensions();
                                renderer.resize(width, height);
                                window.clear_resize_flag();
                            }
                            let report = environment.render_frame(renderer);
                            if !report.failures.is_empty() {
                                log::warn!("{} commands failed this frame", report.failures.len());
                            }
                        }
                        _ => {}
                    }
                }
                Event::AboutToWait => {
                    on_update(&mut window, &environment);
                    environment.trigger_rendering();
                }
                Event::LoopExiting => {
                    if let Some(mut renderer) = renderer.take() {
                        let mut report = crate::environment::FrameReport::default();
                        environment.run_tasks(&mut renderer, &mut report);
                        renderer.release_all();
                    }
                    environment.release_drainer();
                }
                _ => {}
            }
        })
        .map_err(|e| BackendError::InitializationFailed(format!("event loop failed: {e}")))?;
    Ok(())
}
