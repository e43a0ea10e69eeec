//! Dynamic light and shadow map management for real-time rendering.
//!
//! Lights and shadow casting objects are registered anew every frame. Point,
//! spot and area lights render their surroundings into cube shadow maps that
//! are only refreshed when something within range actually changed, while sun
//! lights receive cascaded shadow maps fitted to the camera frustum and
//! refreshed every frame. All shadow maps are filtered into layers of one
//! shared texture array, and the shading parameters for every light and
//! shadow map are maintained in flat, GPU-ready uniform tables.
//!
//! The per-frame call order on [`LightManager`] is [`begin_frame`], any number
//! of [`register_light`] and [`register_caster`] calls, [`finalize_cache`]
//! (which also refreshes all per-light state via [`update_lights`]), then
//! [`render_shadows`].
//!
//! [`begin_frame`]: LightManager::begin_frame
//! [`register_light`]: LightManager::register_light
//! [`register_caster`]: LightManager::register_caster
//! [`finalize_cache`]: LightManager::finalize_cache
//! [`update_lights`]: LightManager::update_lights
//! [`render_shadows`]: LightManager::render_shadows

mod cascade;
mod config;
mod cube;
mod filter;
mod geometry;
mod gpu;
mod light;
mod manager;
mod tracker;
mod uniform;

pub use cascade::CameraFrame;
pub use config::{ShadowMapConfig, ShadowMapDimensions, ShadowMethod};
pub use cube::CubemapFace;
pub use filter::FilterParams;
pub use geometry::AxisAlignedBox;
pub use gpu::{
    ArrayTextureDescriptor, CubeTextureDescriptor, FilterPass, FilterTarget, RenderBackend,
    TextureFormat, TextureId,
};
pub use light::{AreaShape, Light, LightId, LightKind, ShadowSettings};
pub use manager::{CascadeSlot, CubeSlot, LightManager, ShadowSlot};
pub use tracker::{CasterId, ShadowCaster};
pub use uniform::{
    LightUniform, NO_SHADOW, ShadowCascadeUniform, ShadowCubeUniform, ShadowRenderUniform,
    ShadowUniform,
};

/// Maximum number of lights that can be registered for a frame.
pub const MAX_LIGHT: usize = 128;

/// Maximum number of cube shadow maps.
pub const MAX_SHADOW_CUBE: usize = 42;

/// Maximum number of cascaded shadow maps.
pub const MAX_SHADOW_CASCADE: usize = 8;

/// Maximum number of shadow maps of any type.
pub const MAX_SHADOW: usize = MAX_SHADOW_CUBE + MAX_SHADOW_CASCADE;

/// Number of cascades reserved in the shadow pool for each cascaded shadow
/// map.
pub const MAX_CASCADE_COUNT: usize = 4;
