//! render-environment - GPU resource lifecycle and cross-thread rendering
//!
//! Application code describes GPU work with immutable [`resources`]
//! descriptors. Reference-counted [`handler`]s turn them into native
//! resources on one of the backends:
//! - **wgpu**: cross-platform, windowed or headless
//! - **Vulkan**: direct Vulkan API via ash, windowed only
//! - **Dummy**: headless bookkeeping for tests and tools
//!
//! All native work happens on a single rendering thread. Other threads talk
//! to it through a [`RenderingEnvironment`]: one-shot tasks and per-frame
//! command suppliers, drained once per frame.

pub mod backend;
pub mod command;
pub mod environment;
pub mod error;
pub mod geometry;
pub mod handler;
pub mod renderer;
pub mod resources;
pub mod uniform;
pub mod window;

use std::time::Duration;

pub use backend::{Backend, GraphicsBackend};
pub use command::{Command, CommandSupplier};
pub use environment::{FrameReport, RenderThread, RenderingEnvironment, SupplierId};
pub use error::{CollectingReporter, ErrorReporter, HandlerError, LogReporter, RenderError, RenderResult};
pub use renderer::Renderer;
pub use resources::Descriptor;
pub use uniform::UniformValue;
pub use window::Window;

// Re-export wgpu backend for direct access
pub use backend::wgpu_backend::WgpuBackend;

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// wgpu backend - cross-platform, also runs headless
    #[default]
    Wgpu,
    /// Vulkan backend via ash - needs a window
    Vulkan,
    /// No GPU at all, only bookkeeping
    Dummy,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wgpu" => Ok(BackendType::Wgpu),
            "vulkan" | "vk" => Ok(BackendType::Vulkan),
            "dummy" | "none" => Ok(BackendType::Dummy),
            other => Err(format!("unknown backend `{other}` (expected wgpu, vulkan or dummy)")),
        }
    }
}

/// Configuration of a rendering environment and its window
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    /// Enable vsync
    pub vsync: bool,
    /// Color the surface is cleared to every frame
    pub clear_color: [f32; 4],
    /// Render on this interval even without a trigger (render thread only)
    pub frame_interval: Option<Duration>,
    /// Prefix of generated program names
    pub program_name_prefix: String,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            title: "Render Environment".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Wgpu,
            vsync: true,
            clear_color: [0.1, 0.1, 0.15, 1.0],
            frame_interval: None,
            program_name_prefix: "program".to_string(),
        }
    }
}

/// Initialise `env_logger`, honouring `RUST_LOG` and defaulting to `info`.
/// Later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_type_from_str() {
        assert_eq!("wgpu".parse::<BackendType>(), Ok(BackendType::Wgpu));
        assert_eq!("Vulkan".parse::<BackendType>(), Ok(BackendType::Vulkan));
        assert_eq!("dummy".parse::<BackendType>(), Ok(BackendType::Dummy));
        assert!("metal".parse::<BackendType>().is_err());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging();
        init_logging();
    }
}
