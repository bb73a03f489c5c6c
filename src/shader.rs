//! Compiled shader loading
//!
//! Shaders are compiled to SPIR-V ahead of time; this module only reads the
//! words from disk and checks that they look like a SPIR-V module.

use std::io::ErrorKind;
use std::path::Path;

use crate::error::{RendererError, RendererResult};
use crate::RendererConfig;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Vertex and fragment stages of the fixed instanced pipeline.
#[derive(Debug, Clone)]
pub struct ShaderSet {
    pub vertex: Vec<u32>,
    pub fragment: Vec<u32>,
}

impl ShaderSet {
    /// Load both stages from the paths in `config`.
    pub fn load(config: &RendererConfig) -> RendererResult<Self> {
        Ok(Self {
            vertex: load_spirv(&config.vertex_shader)?,
            fragment: load_spirv(&config.fragment_shader)?,
        })
    }
}

/// Read a SPIR-V binary into host-endian words.
pub fn load_spirv(path: impl AsRef<Path>) -> RendererResult<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => RendererError::ShaderNotFound(path.to_path_buf()),
        _ => RendererError::Io(e),
    })?;

    let words = parse_spirv(&bytes).map_err(|reason| {
        RendererError::InvalidShader(format!("{}: {}", path.display(), reason))
    })?;
    log::debug!("Loaded shader {} ({} words)", path.display(), words.len());
    Ok(words)
}

/// Decode SPIR-V bytes of either endianness.
pub fn parse_spirv(bytes: &[u8]) -> Result<Vec<u32>, &'static str> {
    if bytes.len() < 20 {
        return Err("shorter than a SPIR-V header");
    }
    if bytes.len() % 4 != 0 {
        return Err("length is not a multiple of 4");
    }

    let words = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    let mut words: Vec<u32> = words.collect();

    if words[0] == SPIRV_MAGIC.swap_bytes() {
        for word in &mut words {
            *word = word.swap_bytes();
        }
    }
    if words[0] != SPIRV_MAGIC {
        return Err("missing SPIR-V magic number");
    }
    Ok(words)
}
