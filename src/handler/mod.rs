//! Reference-counted handlers turning descriptors into native GPU resources
//!
//! Every kind has its own handler built on the generic [`Handler`] map.
//! Composite kinds take the handlers of their dependencies as arguments and
//! handle (or release) them alongside themselves.

mod counted;
mod data_buffer;
mod frame_buffer;
mod graphics_object;
mod program;
mod rendered_object;
mod texture;

pub use counted::Handler;
pub use data_buffer::*;
pub use frame_buffer::*;
pub use graphics_object::*;
pub use program::*;
pub use rendered_object::*;
pub use texture::*;

use crate::backend::Backend;
use crate::error::{ErrorReporter, RenderError};

/// What a handler needs to create or destroy native resources
pub struct BackendContext<'a> {
    pub backend: &'a mut Backend,
    pub reporter: &'a dyn ErrorReporter,
}

impl<'a> BackendContext<'a> {
    pub fn new(backend: &'a mut Backend, reporter: &'a dyn ErrorReporter) -> Self {
        Self { backend, reporter }
    }

    /// Send `error` to the reporter and hand it back for returning
    pub fn report(&self, error: RenderError) -> RenderError {
        self.reporter.report(&error);
        error
    }
}
