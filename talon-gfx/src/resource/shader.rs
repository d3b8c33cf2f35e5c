//! Shader modules and the `ShaderCompiler` boundary.
//!
//! Source-to-bytecode compilation is an external collaborator: this crate only ever consumes an
//! opaque SPIR-V blob. [`ShaderCompiler`] is the trait that boundary is expressed as; a
//! `shaderc`-backed implementation is provided because the corpus this design learns from already
//! links `shaderc`, but [`ShaderSource::Bytecode`] lets a caller hand in pre-compiled SPIR-V and
//! skip the trait entirely.

use std::mem::ManuallyDrop;

use hal::{device::Device as _, pso::{EntryPoint, Specialization}};

use crate::{error::Result, types::*};

pub use shaderc::ShaderKind as ShaderStage;

/// Where a shader's SPIR-V comes from.
#[derive(Clone)]
pub enum ShaderSource {
    /// GLSL (or whatever `compiler` accepts) source text, compiled via [`ShaderCompiler`] at
    /// module-creation time.
    Text {
        source: String,
        entry_point: String,
        stage: ShaderStage,
    },
    /// Pre-compiled SPIR-V, consumed as-is.
    Bytecode { spirv: Vec<u32>, entry_point: String },
}

impl ShaderSource {
    pub fn entry_point(&self) -> &str {
        match self {
            ShaderSource::Text { entry_point, .. } => entry_point,
            ShaderSource::Bytecode { entry_point, .. } => entry_point,
        }
    }
}

/// The shader-compiler-front-end boundary: takes source text plus a stage and entry point, and
/// returns SPIR-V bytecode. Implementations are expected to be stateful only for caching/compiler
/// instance reuse purposes — compilation is still logically a pure function of the inputs.
pub trait ShaderCompiler {
    fn compile(&mut self, source: &str, stage: ShaderStage, entry_point: &str) -> Result<Vec<u32>>;
}

/// Default [`ShaderCompiler`] implementation, backed by `shaderc`.
pub struct ShadercCompiler {
    compiler: shaderc::Compiler,
}

impl ShadercCompiler {
    pub fn new() -> Result<Self> {
        let compiler = shaderc::Compiler::new()
            .ok_or_else(|| crate::error::Error::external(anyhow::anyhow!("shaderc unavailable")))?;
        Ok(ShadercCompiler { compiler })
    }
}

impl ShaderCompiler for ShadercCompiler {
    fn compile(&mut self, source: &str, stage: ShaderStage, entry_point: &str) -> Result<Vec<u32>> {
        let artifact = self
            .compiler
            .compile_into_spirv(source, stage, "shader", entry_point, None)
            .map_err(crate::error::Error::external)?;

        Ok(artifact.as_binary().to_vec())
    }
}

/// A shader module resident on the device, created from a [`ShaderSource`] resolved through a
/// [`ShaderCompiler`] when necessary.
pub struct ShaderModule {
    raw: ManuallyDrop<ShaderModuleT>,
    entry_point: String,
}

impl ShaderModule {
    pub fn new(
        device: &DeviceT,
        compiler: &mut dyn ShaderCompiler,
        source: &ShaderSource,
    ) -> Result<Self> {
        let spirv = match source {
            ShaderSource::Text {
                source,
                stage,
                entry_point,
            } => compiler.compile(source, *stage, entry_point)?,
            ShaderSource::Bytecode { spirv, .. } => spirv.clone(),
        };

        let raw = unsafe { device.create_shader_module(&spirv)? };

        Ok(ShaderModule {
            raw: ManuallyDrop::new(raw),
            entry_point: source.entry_point().to_string(),
        })
    }

    pub fn raw(&self) -> &ShaderModuleT {
        &self.raw
    }

    pub fn as_entry_point(&self) -> EntryPoint<'_> {
        EntryPoint {
            entry: &self.entry_point,
            module: &self.raw,
            specialization: Specialization::default(),
        }
    }

    pub fn deactivate(mut self, device: &DeviceT) {
        unsafe { device.destroy_shader_module(ManuallyDrop::take(&mut self.raw)) };
    }
}
