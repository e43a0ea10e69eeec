//! Cube shadow maps for point, spot and area lights.

use crate::{
    config::ShadowMethod,
    light::{Light, ShadowSettings},
    manager::CubeSlot,
    uniform::{LightUniform, ShadowCubeUniform, ShadowRenderUniform, ShadowUniform},
};
use nalgebra::{Matrix4, Perspective3, Point3, Quaternion, UnitQuaternion, vector};
use std::f32::consts::{FRAC_1_SQRT_2, FRAC_PI_2};

/// One of the six faces of a cubemap. The enum value corresponds to the
/// conventional index of the face.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CubemapFace {
    PositiveX = 0,
    NegativeX = 1,
    PositiveY = 2,
    NegativeY = 3,
    PositiveZ = 4,
    NegativeZ = 5,
}

/// Rotations bringing each face direction onto the view forward axis
/// (negative z), one per face in conventional order.
const FACE_VIEW_ROTATIONS: [UnitQuaternion<f32>; 6] = [
    // For the positive x face:
    // UnitQuaternion::from_axis_angle(&Vector3::y_axis(), 0.5 * PI)
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![
        0.0,
        FRAC_1_SQRT_2,
        0.0,
        FRAC_1_SQRT_2
    ])),
    // For the negative x face:
    // UnitQuaternion::from_axis_angle(&Vector3::y_axis(), -0.5 * PI)
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![
        0.0,
        -FRAC_1_SQRT_2,
        0.0,
        FRAC_1_SQRT_2
    ])),
    // For the positive y face:
    // UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -0.5 * PI)
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![
        -FRAC_1_SQRT_2,
        0.0,
        0.0,
        FRAC_1_SQRT_2
    ])),
    // For the negative y face:
    // UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.5 * PI)
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![
        FRAC_1_SQRT_2,
        0.0,
        0.0,
        FRAC_1_SQRT_2
    ])),
    // For the positive z face:
    // UnitQuaternion::from_axis_angle(&Vector3::y_axis(), PI)
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![0.0, 1.0, 0.0, 0.0])),
    // For the negative z face: identity
    UnitQuaternion::new_unchecked(Quaternion::from_vector(vector![0.0, 0.0, 0.0, 1.0])),
];

impl CubemapFace {
    /// Returns an array with each face in the conventional order.
    pub const fn all() -> [Self; 6] {
        [
            Self::PositiveX,
            Self::NegativeX,
            Self::PositiveY,
            Self::NegativeY,
            Self::PositiveZ,
            Self::NegativeZ,
        ]
    }

    /// Returns the index of the face according to the conventional ordering
    /// as a [`u32`].
    pub const fn as_idx_u32(&self) -> u32 {
        *self as u32
    }

    /// Returns the index of the face according to the conventional ordering
    /// as a [`usize`].
    pub const fn as_idx_usize(&self) -> usize {
        *self as usize
    }
}

/// Computes the view matrix for rendering each cube face from the given
/// position, in conventional face order.
pub(crate) fn face_view_matrices(position: &Point3<f32>) -> [Matrix4<f32>; 6] {
    let translation = Matrix4::new_translation(&(-position.coords));
    FACE_VIEW_ROTATIONS.map(|rotation| rotation.to_homogeneous() * translation)
}

/// The perspective projection shared by all six cube faces: a 90 degree
/// frustum with unit aspect ratio.
pub(crate) fn face_projection(clip_start: f32, clip_end: f32) -> Perspective3<f32> {
    Perspective3::new(1.0, FRAC_PI_2, clip_start, clip_end)
}

/// Fills the view and view-projection matrices, position and clip range of
/// the render block for rendering the given light's cube shadow.
pub(crate) fn write_render_block(
    block: &mut ShadowRenderUniform,
    position: &Point3<f32>,
    clip_start: f32,
    clip_end: f32,
) {
    let projection = face_projection(clip_start, clip_end).to_homogeneous();
    let views = face_view_matrices(position);
    for (face, view) in views.into_iter().enumerate() {
        block.view_matrices[face] = view;
        block.shadow_matrices[face] = projection * view;
    }
    block.position = *position;
    block.clip_near = clip_start;
    block.clip_far = clip_end;
}

/// Writes the shading parameters for a light holding a cube shadow slot.
pub(crate) fn setup_cube_shadow(
    light: &Light,
    settings: &ShadowSettings,
    method: ShadowMethod,
    slot: &CubeSlot,
    light_data: &mut LightUniform,
    shadow_data: &mut ShadowUniform,
    cube_data: &mut ShadowCubeUniform,
) {
    // Single sample point today; multiple sample points per light are the
    // planned soft shadow refinement
    cube_data.position = light.position();

    shadow_data.bias = 0.05 * settings.bias;
    shadow_data.near = settings.clip_start;
    shadow_data.far = settings.clip_end;
    shadow_data.exponent = match method {
        ShadowMethod::Vsm => settings.bleed_bias,
        ShadowMethod::Esm => settings.bleed_exponent,
    };
    shadow_data.shadow_start = slot.layer as f32;
    shadow_data.data_start = slot.cube_id as f32;
    shadow_data.multi_shadow_count = 1.0;

    light_data.shadow_id = slot.shadow_id as f32;
}
