use crate::error::{GfxError, Result};
use crate::pipeline::PipelineKind;
use ash::{util::read_spv, vk, Device};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::debug;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decodes a SPIR-V blob into words, accepting either byte order.
pub fn parse_spirv(spirv_bytes: &[u8]) -> Result<Vec<u32>> {
    let mut cursor = Cursor::new(spirv_bytes);
    let words = read_spv(&mut cursor).map_err(|e| GfxError::ShaderLoading(format!("invalid SPIR-V: {}", e)))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        _ => Err(GfxError::ShaderLoading("missing SPIR-V magic number".to_string())),
    }
}

/// Loads a SPIR-V shader module from a byte slice.
pub fn load_shader_module(device: &Device, spirv_bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = parse_spirv(spirv_bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);
    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}

pub fn shader_path(dir: &Path, kind: PipelineKind, stage: vk::ShaderStageFlags) -> PathBuf {
    let extension = if stage == vk::ShaderStageFlags::VERTEX { "vert.spv" } else { "frag.spv" };
    dir.join(format!("{}.{}", kind.shader_name(), extension))
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderModules {
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
}

/// The vertex and fragment module of every pipeline kind, loaded once per device.
#[derive(Debug, Default)]
pub struct ShaderLibrary {
    modules: Vec<ShaderModules>,
}

impl ShaderLibrary {
    pub fn load(device: &Device, dir: &Path) -> Result<Self> {
        let mut library = Self { modules: Vec::with_capacity(PipelineKind::ALL.len()) };
        for kind in PipelineKind::ALL {
            match Self::load_kind(device, dir, kind) {
                Ok(modules) => library.modules.push(modules),
                Err(e) => {
                    library.destroy(device);
                    return Err(e);
                }
            }
        }
        debug!("Shaders loaded from {}.", dir.display());
        Ok(library)
    }

    fn load_kind(device: &Device, dir: &Path, kind: PipelineKind) -> Result<ShaderModules> {
        let vertex_bytes = std::fs::read(shader_path(dir, kind, vk::ShaderStageFlags::VERTEX))?;
        let fragment_bytes = std::fs::read(shader_path(dir, kind, vk::ShaderStageFlags::FRAGMENT))?;
        let vertex = load_shader_module(device, &vertex_bytes)?;
        let fragment = match load_shader_module(device, &fragment_bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                unsafe { device.destroy_shader_module(vertex, None) };
                return Err(e);
            }
        };
        Ok(ShaderModules { vertex, fragment })
    }

    pub fn get(&self, kind: PipelineKind) -> Option<ShaderModules> {
        self.modules.get(kind.index()).copied()
    }

    pub fn destroy(&mut self, device: &Device) {
        for modules in self.modules.drain(..) {
            unsafe {
                device.destroy_shader_module(modules.vertex, None);
                device.destroy_shader_module(modules.fragment, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spirv_words_are_decoded() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        let words = parse_spirv(&bytes).unwrap();
        assert_eq!(words, vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn byte_swapped_spirv_is_accepted() {
        let bytes = SPIRV_MAGIC.to_be_bytes();
        assert_eq!(parse_spirv(&bytes).unwrap(), vec![SPIRV_MAGIC]);
    }

    #[test]
    fn malformed_spirv_is_rejected() {
        assert!(matches!(parse_spirv(&[1, 2, 3]), Err(GfxError::ShaderLoading(_))));
        assert!(matches!(parse_spirv(&[0, 0, 0, 0]), Err(GfxError::ShaderLoading(_))));
    }

    #[test]
    fn shader_paths_follow_pipeline_names() {
        let dir = Path::new("/opt/shaders");
        assert_eq!(
            shader_path(dir, PipelineKind::Sdf, vk::ShaderStageFlags::VERTEX),
            Path::new("/opt/shaders/sdf.vert.spv")
        );
        assert_eq!(
            shader_path(dir, PipelineKind::ToneMap, vk::ShaderStageFlags::FRAGMENT),
            Path::new("/opt/shaders/tone_mapper.frag.spv")
        );
    }
}
