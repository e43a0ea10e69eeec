//! Configuration of shadow map rendering and storage.

use crate::gpu::TextureFormat;

/// Filtering scheme used for storing and sampling shadow maps.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShadowMethod {
    /// Exponential shadow maps, stored as a single exponentially warped depth
    /// moment.
    Esm,
    /// Variance shadow maps, stored as two depth moments.
    Vsm,
}

/// Configuration parameters for shadow map rendering.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadowMapConfig {
    /// Width and height in texels of every stored shadow map. Supported
    /// values are 1 to 8192.
    pub resolution: u32,
    /// The filtering scheme for stored shadow maps.
    pub method: ShadowMethod,
    /// Whether to store shadow moments in 32-bit rather than 16-bit float
    /// texels.
    pub high_bit_depth: bool,
}

/// Texture and texel sizes derived from a [`ShadowMapConfig`]. The values
/// only change when the configuration changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadowMapDimensions {
    resolution: u32,
    cube_target_size: u32,
    stored_texel_size: f32,
    cube_texel_size: f32,
}

impl ShadowMethod {
    /// The texel format for stored shadow maps under this method.
    pub fn storage_format(&self, high_bit_depth: bool) -> TextureFormat {
        match (self, high_bit_depth) {
            (Self::Esm, false) => TextureFormat::R16Float,
            (Self::Esm, true) => TextureFormat::R32Float,
            (Self::Vsm, false) => TextureFormat::Rg16Float,
            (Self::Vsm, true) => TextureFormat::Rg32Float,
        }
    }
}

impl Default for ShadowMapConfig {
    fn default() -> Self {
        Self {
            resolution: 1024,
            method: ShadowMethod::Esm,
            high_bit_depth: false,
        }
    }
}

impl ShadowMapDimensions {
    /// Computes the texture and texel sizes for the given configuration.
    ///
    /// # Panics
    /// If the configured resolution is outside the range 1 to 8192.
    pub fn for_config(config: &ShadowMapConfig) -> Self {
        let resolution = config.resolution;
        assert!(
            (1..=8192).contains(&resolution),
            "Shadow map resolution {resolution} is outside the supported range 1 to 8192"
        );

        // Side of a cube face whose six faces together hold roughly the same
        // texel count as a stored map, supersampled by 3x for the filter
        // passes to integrate over
        let cube_target_size =
            ((f64::from(resolution) * f64::from(resolution) / 6.0).sqrt() * 3.0).ceil() as u32;
        let cube_target_size = cube_target_size.clamp(1, 4096);

        Self {
            resolution,
            cube_target_size,
            stored_texel_size: 1.0 / resolution as f32,
            cube_texel_size: 1.0 / cube_target_size as f32,
        }
    }

    /// The width and height in texels of every stored shadow map.
    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// The face size in texels of the cube shadow render target.
    pub fn cube_target_size(&self) -> u32 {
        self.cube_target_size
    }

    /// The size of one texel of a stored shadow map, in texture coordinates.
    pub fn stored_texel_size(&self) -> f32 {
        self.stored_texel_size
    }

    /// The size of one texel of a cube shadow render target face, in texture
    /// coordinates.
    pub fn cube_texel_size(&self) -> f32 {
        self.cube_texel_size
    }
}
