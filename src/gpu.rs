//! Seam between the shadow system and the host renderer's GPU resources.

use crate::{
    cube::CubemapFace,
    light::LightId,
    uniform::{
        LightUniform, ShadowCascadeUniform, ShadowCubeUniform, ShadowRenderUniform, ShadowUniform,
    },
};
use anyhow::Result;

/// Opaque handle to a texture owned through a [`RenderBackend`].
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TextureId(u64);

/// Texel format of a shadow render target or shadow map.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TextureFormat {
    /// 24-bit depth, used for the intermediate shadow render targets.
    Depth24,
    /// Single 16-bit float channel.
    R16Float,
    /// Single 32-bit float channel.
    R32Float,
    /// Two 16-bit float channels.
    Rg16Float,
    /// Two 32-bit float channels.
    Rg32Float,
}

/// Properties of a cube texture to create.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CubeTextureDescriptor {
    /// Width and height in texels of each face.
    pub size: u32,
    pub format: TextureFormat,
    /// Whether the texture will be sampled with linear filtering.
    pub filtered: bool,
}

/// Properties of a 2D array texture to create.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ArrayTextureDescriptor {
    pub width: u32,
    pub height: u32,
    pub layer_count: u32,
    pub format: TextureFormat,
    /// Whether the texture will be sampled with linear filtering.
    pub filtered: bool,
}

/// The face or layer of the destination texture a filter pass writes to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FilterTarget {
    CubeFace(CubemapFace),
    ArrayLayer(u32),
}

/// A single filtering draw reading one shadow texture and writing a face or
/// layer of another.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FilterPass {
    pub source: TextureId,
    /// Face or layer of the source to read. Ignored when the pass samples the
    /// source as a full cube.
    pub source_layer: u32,
    pub destination: TextureId,
    pub target: FilterTarget,
    /// Filter radius in texture coordinates of the source.
    pub filter_size: f32,
}

/// The GPU operations the shadow system requires from the host renderer.
///
/// Rendering methods draw the shadow casting geometry the host has collected
/// for the frame, using the view and projection matrices from the most
/// recently updated render block.
pub trait RenderBackend {
    /// Creates a cube texture with the given properties.
    ///
    /// # Errors
    /// Returns an error if the texture could not be allocated.
    fn create_cube_texture(&mut self, descriptor: CubeTextureDescriptor) -> Result<TextureId>;

    /// Creates a 2D array texture with the given properties.
    ///
    /// # Errors
    /// Returns an error if the texture could not be allocated.
    fn create_array_texture(&mut self, descriptor: ArrayTextureDescriptor) -> Result<TextureId>;

    /// Releases the given texture.
    fn free_texture(&mut self, texture: TextureId);

    /// Replaces the contents of the shadow render uniform block.
    ///
    /// # Errors
    /// Returns an error if the block could not be written.
    fn update_render_block(&mut self, block: &ShadowRenderUniform) -> Result<()>;

    /// Renders the depth of the given light's surroundings into all six faces
    /// of the target cube texture.
    ///
    /// # Errors
    /// Returns an error if the pass could not be issued.
    fn render_cube_faces(&mut self, light: LightId, target: TextureId) -> Result<()>;

    /// Renders the depth of the scene into the first `cascade_count` layers
    /// of the target array texture, one cascade per layer.
    ///
    /// # Errors
    /// Returns an error if the pass could not be issued.
    fn render_cascades(
        &mut self,
        light: LightId,
        cascade_count: usize,
        target: TextureId,
    ) -> Result<()>;

    /// Runs a box filter pass converting rendered depth into shadow moments.
    ///
    /// # Errors
    /// Returns an error if the pass could not be issued.
    fn run_copy_pass(&mut self, pass: &FilterPass) -> Result<()>;

    /// Runs a concentric disk filter pass writing the final shadow map, with
    /// the sample count from the most recently updated render block.
    ///
    /// # Errors
    /// Returns an error if the pass could not be issued.
    fn run_store_pass(&mut self, pass: &FilterPass) -> Result<()>;

    /// Uploads the uniform tables consumed by the shading passes.
    ///
    /// # Errors
    /// Returns an error if the upload failed.
    fn upload_light_tables(
        &mut self,
        lights: &[LightUniform],
        shadows: &[ShadowUniform],
        cubes: &[ShadowCubeUniform],
        cascades: &[ShadowCascadeUniform],
    ) -> Result<()>;
}

impl TextureId {
    /// Wraps the given `u64` as a texture handle.
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64`.
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}
