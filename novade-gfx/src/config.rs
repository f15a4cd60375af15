//! Runtime configuration for the graphics subsystem, loaded from TOML.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GfxConfig {
    pub application_name: String,
    pub engine_name: String,
    /// Installs the Khronos validation layer and the debug messenger.
    pub enable_validation: bool,
    /// Allows float16 surface formats to win device scoring.
    pub allow_hdr: bool,
    /// Requested number of swapchain images, clamped to what the surface supports.
    pub swapchain_image_count: u32,
    /// Directory holding the `<pipeline>.vert.spv`/`<pipeline>.frag.spv` blobs.
    pub shader_dir: PathBuf,
    /// Linear RGBA clear color of the offscreen color attachment.
    pub background_color: [f32; 4],
}

impl Default for GfxConfig {
    fn default() -> Self {
        Self {
            application_name: "NovaDE".to_string(),
            engine_name: "NovaDE Gfx".to_string(),
            enable_validation: cfg!(debug_assertions),
            allow_hdr: true,
            swapchain_image_count: 3,
            shader_dir: PathBuf::from("shaders"),
            background_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl GfxConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!("Loaded graphics configuration from {}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let config = GfxConfig::from_toml_str("").unwrap();
        assert_eq!(config, GfxConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = GfxConfig::from_toml_str(
            r#"
            allow_hdr = false
            swapchain_image_count = 2
            shader_dir = "/opt/novade/shaders"
            "#,
        )
        .unwrap();
        assert!(!config.allow_hdr);
        assert_eq!(config.swapchain_image_count, 2);
        assert_eq!(config.shader_dir, PathBuf::from("/opt/novade/shaders"));
        assert_eq!(config.application_name, "NovaDE");
    }

    #[test]
    fn load_reads_file_and_reports_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "background_color = [0.5, 0.25, 0.0, 1.0]").unwrap();
        let config = GfxConfig::load(file.path()).unwrap();
        assert_eq!(config.background_color, [0.5, 0.25, 0.0, 1.0]);

        let mut broken = tempfile::NamedTempFile::new().unwrap();
        writeln!(broken, "swapchain_image_count = \"three\"").unwrap();
        assert!(matches!(GfxConfig::load(broken.path()), Err(crate::GfxError::Config(_))));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = GfxConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(result, Err(crate::GfxError::Io(_))));
    }
}
