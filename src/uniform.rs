//! GPU-facing uniform data for lights and shadow maps.
//!
//! The structs in this module are laid out for direct upload into uniform
//! buffers: their sizes are multiples of 16 bytes as required for uniforms,
//! and the fields accessed on the GPU are aligned to 16-byte boundaries.
//! Slot indices are stored as `f32` because the consuming shaders index the
//! tables with float-typed values.

use crate::MAX_CASCADE_COUNT;
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Point3, Vector3};

/// Sentinel stored in [`LightUniform::shadow_id`] for lights without a shadow
/// map slot.
pub const NO_SHADOW: f32 = -1.0;

/// Per-light shading parameters, index-aligned with the light registry.
///
/// # Warning
/// The fields must not be reordered, as this ordering is expected by the
/// shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
pub struct LightUniform {
    pub(crate) position: Point3<f32>,
    pub(crate) influence_radius: f32,
    // Color is premultiplied by the normalized power and the light energy
    pub(crate) color: Vector3<f32>,
    pub(crate) kind: f32,
    pub(crate) spot_size_cos: f32,
    pub(crate) spot_blend: f32,
    pub(crate) source_radius: f32,
    pub(crate) shadow_id: f32,
    pub(crate) right: Vector3<f32>,
    pub(crate) size_x: f32,
    pub(crate) up: Vector3<f32>,
    pub(crate) size_y: f32,
    pub(crate) forward: Vector3<f32>,
    // Padding to make size multiple of 16-bytes
    pub(crate) _padding: f32,
}

/// Per-shadow-map parameters shared by cube and cascaded maps, index-aligned
/// with the shadow slot ids.
///
/// # Warning
/// The fields must not be reordered, as this ordering is expected by the
/// shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
pub struct ShadowUniform {
    pub(crate) near: f32,
    pub(crate) far: f32,
    pub(crate) bias: f32,
    pub(crate) exponent: f32,
    // First pool array layer owned by this shadow map
    pub(crate) shadow_start: f32,
    // Index into the per-type data table (cube or cascade)
    pub(crate) data_start: f32,
    pub(crate) multi_shadow_count: f32,
    // Padding to make size multiple of 16-bytes
    pub(crate) _padding: f32,
}

/// Per-cube-shadow data: the shadow sample point. A single sample point is
/// used today; the table shape leaves room for multiple sample points per
/// light as a soft-shadow approximation.
#[repr(C)]
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
pub struct ShadowCubeUniform {
    pub(crate) position: Point3<f32>,
    // Padding to make size multiple of 16-bytes
    pub(crate) _padding: f32,
}

/// Per-cascade-shadow data: the texture-space shadow matrices and the view
/// space split depths for cross-cascade blending.
#[repr(C)]
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
pub struct ShadowCascadeUniform {
    pub(crate) shadow_matrices: [Matrix4<f32>; MAX_CASCADE_COUNT],
    pub(crate) split_start: [f32; MAX_CASCADE_COUNT],
    pub(crate) split_end: [f32; MAX_CASCADE_COUNT],
}

/// Parameters for the shadow pass currently being rendered, re-uploaded
/// before every render and store pass that depends on it.
///
/// Cube passes use all six matrix entries (one per face); cascade passes use
/// the first [`MAX_CASCADE_COUNT`].
///
/// # Warning
/// The fields must not be reordered, as this ordering is expected by the
/// shader.
#[repr(C)]
#[derive(Copy, Clone, Debug, Zeroable, Pod)]
pub struct ShadowRenderUniform {
    pub(crate) view_matrices: [Matrix4<f32>; 6],
    pub(crate) shadow_matrices: [Matrix4<f32>; 6],
    pub(crate) position: Point3<f32>,
    // Padding to obtain 16-byte alignment for next field
    pub(crate) _padding_1: f32,
    pub(crate) cube_texel_size: f32,
    pub(crate) stored_texel_size: f32,
    pub(crate) clip_near: f32,
    pub(crate) clip_far: f32,
    pub(crate) sample_count: u32,
    pub(crate) inverse_sample_count: f32,
    // Padding to make size multiple of 16-bytes
    pub(crate) _padding_2: [f32; 2],
}

impl LightUniform {
    /// The world space position of the light.
    pub fn position(&self) -> &Point3<f32> {
        &self.position
    }

    /// The light color premultiplied by the normalized power.
    pub fn color(&self) -> &Vector3<f32> {
        &self.color
    }

    /// The shadow slot back-reference, or [`NO_SHADOW`].
    pub fn shadow_id(&self) -> f32 {
        self.shadow_id
    }

    /// The light kind discriminant consumed by the shading pass.
    pub fn kind(&self) -> f32 {
        self.kind
    }
}

impl ShadowUniform {
    /// The near clip distance of the shadow projection.
    pub fn near(&self) -> f32 {
        self.near
    }

    /// The far clip distance of the shadow projection.
    pub fn far(&self) -> f32 {
        self.far
    }

    /// The depth comparison bias.
    pub fn bias(&self) -> f32 {
        self.bias
    }

    /// The bleed-control exponent (or bias, for variance maps).
    pub fn exponent(&self) -> f32 {
        self.exponent
    }

    /// The first pool array layer owned by this shadow map.
    pub fn shadow_start(&self) -> f32 {
        self.shadow_start
    }

    /// The index of the first record in the per-type data table.
    pub fn data_start(&self) -> f32 {
        self.data_start
    }
}

impl ShadowCubeUniform {
    /// The shadow sample point.
    pub fn position(&self) -> &Point3<f32> {
        &self.position
    }
}

impl ShadowCascadeUniform {
    /// The texture-space shadow matrix of each cascade.
    pub fn shadow_matrices(&self) -> &[Matrix4<f32>; MAX_CASCADE_COUNT] {
        &self.shadow_matrices
    }

    /// The view space depth where each cascade begins.
    pub fn split_start(&self) -> &[f32; MAX_CASCADE_COUNT] {
        &self.split_start
    }

    /// The view space depth where each cascade ends.
    pub fn split_end(&self) -> &[f32; MAX_CASCADE_COUNT] {
        &self.split_end
    }
}

impl ShadowRenderUniform {
    /// The view matrix of each cube face or cascade.
    pub fn view_matrices(&self) -> &[Matrix4<f32>; 6] {
        &self.view_matrices
    }

    /// The view-projection matrix of each cube face or cascade.
    pub fn shadow_matrices(&self) -> &[Matrix4<f32>; 6] {
        &self.shadow_matrices
    }

    /// The world space position of the light being rendered.
    pub fn position(&self) -> &Point3<f32> {
        &self.position
    }

    /// The number of concentric samples for the store filter pass.
    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::mem;

    #[test]
    fn uniform_sizes_are_multiples_of_16_bytes() {
        assert_eq!(mem::size_of::<LightUniform>(), 96);
        assert_eq!(mem::size_of::<ShadowUniform>(), 32);
        assert_eq!(mem::size_of::<ShadowCubeUniform>(), 16);
        assert_eq!(
            mem::size_of::<ShadowCascadeUniform>(),
            64 * MAX_CASCADE_COUNT + 32
        );
        assert_eq!(mem::size_of::<ShadowRenderUniform>() % 16, 0);
    }
}
