//! WGSL parsing, reflection and SPIR-V translation through naga.
//!
//! Reflection is backend-neutral: the program handler uses it to answer
//! "which location does input `x` live at" and "where does uniform `y` go".
//! Only bind group 0 is supported.

use crate::backend::traits::{BindGroupLayoutEntry, BindingType, ShaderStageFlags, TextureSampleType};
use crate::backend::types::VertexFormat;
use naga::valid::{Capabilities, ModuleInfo, ValidationFlags, Validator};
use naga::{AddressSpace, Binding, ImageClass, Module, ScalarKind, TypeInner, VectorSize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("WGSL parse error: {0}")]
    Parse(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("entry point `{0}` not found")]
    MissingEntryPoint(String),
    #[error("unsupported shader interface: {0}")]
    Unsupported(String),
    #[error("SPIR-V generation error: {0}")]
    Translation(String),
}

/// Vertex shader input reachable through a `@location`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderInput {
    pub name: String,
    pub location: u32,
    pub format: VertexFormat,
}

/// One named value inside a uniform block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformMember {
    pub name: String,
    pub offset: u32,
    pub size: u32,
}

/// A `var<uniform>` global
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformBlock {
    pub name: String,
    pub binding: u32,
    pub size: u32,
    /// Struct members; a block of non-struct type has one member named after the block
    pub members: Vec<UniformMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureSlot {
    pub name: String,
    pub binding: u32,
    pub sample_type: TextureSampleType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerSlot {
    pub name: String,
    pub binding: u32,
    pub comparison: bool,
}

/// Everything the handlers need to know about a program's interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShaderReflection {
    pub inputs: Vec<ShaderInput>,
    pub uniform_blocks: Vec<UniformBlock>,
    pub textures: Vec<TextureSlot>,
    pub samplers: Vec<SamplerSlot>,
}

impl ShaderReflection {
    pub fn input(&self, name: &str) -> Option<&ShaderInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Find a uniform by `member`, `block.member`, or the block name for
    /// non-struct blocks. Returns (block index, member).
    pub fn uniform(&self, name: &str) -> Option<(usize, &UniformMember)> {
        let (block_name, member_name) = match name.split_once('.') {
            Some((block, member)) => (Some(block), member),
            None => (None, name),
        };
        self.uniform_blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| block_name.map_or(true, |b| b == block.name))
            .find_map(|(index, block)| {
                block
                    .members
                    .iter()
                    .find(|m| m.name == member_name)
                    .map(|m| (index, m))
            })
    }

    /// Layout entries for bind group 0, sorted by binding
    pub fn layout_entries(&self) -> Vec<BindGroupLayoutEntry> {
        let mut entries: Vec<BindGroupLayoutEntry> = self
            .uniform_blocks
            .iter()
            .map(|b| (b.binding, BindingType::UniformBuffer))
            .chain(self.textures.iter().map(|t| {
                (
                    t.binding,
                    BindingType::Texture {
                        sample_type: t.sample_type,
                    },
                )
            }))
            .chain(self.samplers.iter().map(|s| {
                (
                    s.binding,
                    BindingType::Sampler {
                        comparison: s.comparison,
                    },
                )
            }))
            .map(|(binding, ty)| BindGroupLayoutEntry {
                binding,
                visibility: ShaderStageFlags::VERTEX_FRAGMENT,
                ty,
            })
            .collect();
        entries.sort_by_key(|e| e.binding);
        entries
    }
}

/// A parsed and validated WGSL module
pub struct ParsedShader {
    pub module: Module,
    pub info: ModuleInfo,
}

impl ParsedShader {
    pub fn parse(source: &str) -> Result<Self, ShaderError> {
        let module = naga::front::wgsl::parse_str(source)
            .map_err(|e| ShaderError::Parse(e.emit_to_string(source)))?;

        let mut validator = Validator::new(ValidationFlags::all(), Capabilities::all());
        let info = validator
            .validate(&module)
            .map_err(|e| ShaderError::Validation(format!("{e}")))?;

        Ok(Self { module, info })
    }

    fn entry_point(&self, name: &str, stage: naga::ShaderStage) -> Result<&naga::EntryPoint, ShaderError> {
        self.module
            .entry_points
            .iter()
            .find(|ep| ep.name == name && ep.stage == stage)
            .ok_or_else(|| ShaderError::MissingEntryPoint(name.to_string()))
    }

    /// Reflect the interface used by `vertex_entry` (and `fragment_entry`)
    pub fn reflect(
        &self,
        vertex_entry: &str,
        fragment_entry: Option<&str>,
    ) -> Result<ShaderReflection, ShaderError> {
        let vertex = self.entry_point(vertex_entry, naga::ShaderStage::Vertex)?;
        if let Some(fragment) = fragment_entry {
            self.entry_point(fragment, naga::ShaderStage::Fragment)?;
        }

        let mut reflection = ShaderReflection::default();

        for argument in &vertex.function.arguments {
            match &argument.binding {
                Some(Binding::Location { location, .. }) => {
                    let name = argument.name.clone().unwrap_or_else(|| format!("location{location}"));
                    reflection.inputs.push(ShaderInput {
                        format: self.vertex_format(argument.ty, &name)?,
                        name,
                        location: *location,
                    });
                }
                Some(Binding::BuiltIn(_)) => {}
                None => {
                    // Struct of inputs
                    if let TypeInner::Struct { members, .. } = &self.module.types[argument.ty].inner {
                        for member in members {
                            if let Some(Binding::Location { location, .. }) = &member.binding {
                                let name = member.name.clone().unwrap_or_else(|| format!("location{location}"));
                                reflection.inputs.push(ShaderInput {
                                    format: self.vertex_format(member.ty, &name)?,
                                    name,
                                    location: *location,
                                });
                            }
                        }
                    }
                }
            }
        }

        for (_, global) in self.module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            let name = global
                .name
                .clone()
                .unwrap_or_else(|| format!("binding{}", binding.binding));
            if binding.group != 0 {
                return Err(ShaderError::Unsupported(format!(
                    "`{name}` uses bind group {}, only group 0 is supported",
                    binding.group
                )));
            }

            let ty = &self.module.types[global.ty];
            match (global.space, &ty.inner) {
                (AddressSpace::Uniform, inner) => {
                    let size = inner.size(self.module.to_ctx());
                    let members = match inner {
                        TypeInner::Struct { members, .. } => members
                            .iter()
                            .enumerate()
                            .map(|(index, m)| UniformMember {
                                name: m.name.clone().unwrap_or_else(|| format!("member{index}")),
                                offset: m.offset,
                                size: self.module.types[m.ty].inner.size(self.module.to_ctx()),
                            })
                            .collect(),
                        _ => vec![UniformMember {
                            name: name.clone(),
                            offset: 0,
                            size,
                        }],
                    };
                    reflection.uniform_blocks.push(UniformBlock {
                        name,
                        binding: binding.binding,
                        size,
                        members,
                    });
                }
                (AddressSpace::Handle, TypeInner::Image { class, .. }) => {
                    let sample_type = match class {
                        ImageClass::Sampled { kind: ScalarKind::Sint, .. } => TextureSampleType::Sint,
                        ImageClass::Sampled { kind: ScalarKind::Uint, .. } => TextureSampleType::Uint,
                        ImageClass::Sampled { .. } => TextureSampleType::Float { filterable: true },
                        ImageClass::Depth { .. } => TextureSampleType::Depth,
                        ImageClass::Storage { .. } => {
                            return Err(ShaderError::Unsupported(format!(
                                "storage texture `{name}`"
                            )))
                        }
                    };
                    reflection.textures.push(TextureSlot {
                        name,
                        binding: binding.binding,
                        sample_type,
                    });
                }
                (AddressSpace::Handle, TypeInner::Sampler { comparison }) => {
                    reflection.samplers.push(SamplerSlot {
                        name,
                        binding: binding.binding,
                        comparison: *comparison,
                    });
                }
                (space, _) => {
                    return Err(ShaderError::Unsupported(format!(
                        "`{name}` in address space {space:?}"
                    )))
                }
            }
        }

        reflection.inputs.sort_by_key(|i| i.location);
        reflection.uniform_blocks.sort_by_key(|b| b.binding);
        Ok(reflection)
    }

    fn vertex_format(&self, ty: naga::Handle<naga::Type>, name: &str) -> Result<VertexFormat, ShaderError> {
        let format = match &self.module.types[ty].inner {
            TypeInner::Scalar(scalar) if scalar.width == 4 => match scalar.kind {
                ScalarKind::Float => Some(VertexFormat::Float32),
                ScalarKind::Uint => Some(VertexFormat::Uint32),
                ScalarKind::Sint => Some(VertexFormat::Sint32),
                _ => None,
            },
            TypeInner::Vector { size, scalar } if scalar.kind == ScalarKind::Float && scalar.width == 4 => {
                match size {
                    VectorSize::Bi => Some(VertexFormat::Float32x2),
                    VectorSize::Tri => Some(VertexFormat::Float32x3),
                    VectorSize::Quad => Some(VertexFormat::Float32x4),
                }
            }
            _ => None,
        };
        format.ok_or_else(|| ShaderError::Unsupported(format!("type of vertex input `{name}`")))
    }

    /// SPIR-V words for one entry point.
    ///
    /// Clip space is left as-is; the Vulkan backend flips Y with a negative viewport.
    pub fn to_spirv(&self, stage: naga::ShaderStage, entry_point: &str) -> Result<Vec<u32>, ShaderError> {
        self.entry_point(entry_point, stage)?;

        let options = naga::back::spv::Options {
            lang_version: (1, 3),
            flags: naga::back::spv::WriterFlags::empty(),
            capabilities: None,
            bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
            binding_map: Default::default(),
            debug_info: None,
            zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
        };
        let pipeline_options = naga::back::spv::PipelineOptions {
            shader_stage: stage,
            entry_point: entry_point.to_string(),
        };

        naga::back::spv::write_vec(&self.module, &self.info, &options, Some(&pipeline_options))
            .map_err(|e| ShaderError::Translation(format!("{e}")))
    }
}
