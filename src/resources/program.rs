//! Shader programs

use super::Resource;

/// A WGSL shader program with a vertex and an optional fragment entry point
#[derive(Debug, Clone)]
pub struct Program {
    label: Option<String>,
    pub source: String,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
}

impl Program {
    /// Program using the `vs_main` and `fs_main` entry points
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            label: None,
            source: source.into(),
            vertex_entry: "vs_main".to_string(),
            fragment_entry: Some("fs_main".to_string()),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_entry_points(mut self, vertex: impl Into<String>, fragment: Option<&str>) -> Self {
        self.vertex_entry = vertex.into();
        self.fragment_entry = fragment.map(str::to_string);
        self
    }
}

impl Resource for Program {
    const KIND: &'static str = "program";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
