//! Resource descriptors
//!
//! Descriptors say *what* should exist on the GPU. They carry no lifecycle
//! logic; the handlers in [`crate::handler`] turn them into native resources.
//! Descriptors are shared through [`Descriptor`], which compares by identity:
//! two descriptors built from equal content are two distinct resources.

mod data_buffer;
mod frame_buffer;
mod graphics_object;
mod program;
mod rendered_object;
mod texture;

pub use data_buffer::*;
pub use frame_buffer::*;
pub use graphics_object::*;
pub use program::*;
pub use rendered_object::*;
pub use texture::*;

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// A descriptor kind that handlers can manage
pub trait Resource: Send + Sync + 'static {
    /// Human readable kind, used in logs and errors
    const KIND: &'static str;

    fn label(&self) -> Option<&str>;
}

/// Identity of a live descriptor.
///
/// Stable for as long as any clone of the descriptor is alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorId(usize);

/// Shared, identity-compared reference to an immutable descriptor
pub struct Descriptor<T: Resource> {
    inner: Arc<T>,
}

impl<T: Resource> Descriptor<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(value),
        }
    }

    pub fn id(&self) -> DescriptorId {
        DescriptorId(Arc::as_ptr(&self.inner) as *const () as usize)
    }

    /// Label if one was given, otherwise kind and identity
    pub fn name(&self) -> String {
        match self.inner.label() {
            Some(label) => label.to_string(),
            None => format!("{}#{:x}", T::KIND, self.id().0),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Resource> Clone for Descriptor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Resource> Deref for Descriptor<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Resource> PartialEq for Descriptor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T: Resource> Eq for Descriptor<T> {}

impl<T: Resource> Hash for Descriptor<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl<T: Resource> fmt::Debug for Descriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("kind", &T::KIND)
            .field("name", &self.name())
            .finish()
    }
}

impl<T: Resource> From<T> for Descriptor<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
