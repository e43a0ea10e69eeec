//! Cascaded shadow maps for sun lights.

use crate::{
    MAX_CASCADE_COUNT,
    config::ShadowMethod,
    light::{Light, ShadowSettings},
    manager::CascadeSlot,
    uniform::{LightUniform, ShadowCascadeUniform, ShadowUniform},
};
use nalgebra::{Matrix4, Orthographic3, Point3, Vector2, Vector3, Vector4, vector};

/// The camera state that sun shadow cascades are fitted to.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CameraFrame {
    /// World to view transform of the camera.
    pub view_matrix: Matrix4<f32>,
    /// View to clip transform of the camera.
    pub projection_matrix: Matrix4<f32>,
    /// Whether the projection is perspective rather than orthographic.
    pub is_perspective: bool,
}

impl CameraFrame {
    /// Creates a new camera frame from the given view and projection
    /// matrices.
    pub fn new(
        view_matrix: Matrix4<f32>,
        projection_matrix: Matrix4<f32>,
        is_perspective: bool,
    ) -> Self {
        Self {
            view_matrix,
            projection_matrix,
            is_perspective,
        }
    }

    /// The composed world to clip transform.
    pub fn view_projection(&self) -> Matrix4<f32> {
        self.projection_matrix * self.view_matrix
    }
}

/// View space split depths for each cascade together with the NDC depths of
/// the frustum slice boundaries.
struct CascadeSplits {
    start: [f32; MAX_CASCADE_COUNT],
    end: [f32; MAX_CASCADE_COUNT],
    start_ndc: [f32; MAX_CASCADE_COUNT],
    end_ndc: [f32; MAX_CASCADE_COUNT],
}

/// NDC x and y of the four corners of a frustum cap, in the order the caps
/// are laid out.
const CAP_CORNERS: [(f32, f32); 4] = [(-1.0, -1.0), (1.0, -1.0), (-1.0, 1.0), (1.0, 1.0)];

fn lerp(t: f32, a: f32, b: f32) -> f32 {
    a + t * (b - a)
}

/// The fixed remap from NDC in [-1, 1] to texture space in [0, 1], applied
/// to x, y and z.
fn ndc_to_texture_matrix() -> Matrix4<f32> {
    Matrix4::new_translation(&vector![0.5, 0.5, 0.5]) * Matrix4::new_scaling(0.5)
}

/// Computes the view space depths of the camera's near and far planes by
/// unprojecting the canonical NDC depths through the inverse projection.
fn view_space_depth_range(camera: &CameraFrame) -> (f32, f32) {
    let projection_inverse = camera
        .projection_matrix
        .try_inverse()
        .unwrap_or_else(Matrix4::identity);
    let near = projection_inverse * Vector4::new(0.0, 0.0, -1.0, 1.0);
    let far = projection_inverse * Vector4::new(0.0, 0.0, 1.0, 1.0);
    if camera.is_perspective {
        (near.z / near.w, far.z / far.w)
    } else {
        (near.z, far.z)
    }
}

/// Projects a view space depth through the camera projection and returns the
/// NDC depth.
fn projected_split_depth(camera: &CameraFrame, view_depth: f32) -> f32 {
    let projected = camera.projection_matrix * Vector4::new(1.0, 1.0, view_depth, 1.0);
    if camera.is_perspective {
        projected.z / projected.w
    } else {
        projected.z
    }
}

/// Partitions the visible depth range into `cascade_count` slices.
///
/// Adjacent cascades are made to overlap by the configured fade fraction so
/// that shading can blend across the boundary instead of switching abruptly.
/// The blend interval of the last cascade has no successor slot and is
/// stored in `start[0]`, whose own boundary is fixed at the near plane
/// anyway; its NDC value keeps the unfaded depth.
fn compute_splits(
    camera: &CameraFrame,
    settings: &ShadowSettings,
    cascade_count: usize,
) -> CascadeSplits {
    let (view_near, view_far) = view_space_depth_range(camera);

    let (csm_start, csm_end) = if camera.is_perspective {
        // View space z is negative in front of the camera. The outer clamp
        // guards against a configured distance closer than the near plane.
        (
            view_near,
            view_near.min(view_far.max(-settings.cascade_max_distance)),
        )
    } else {
        (-view_far, view_far)
    };

    let mut start = [csm_end; MAX_CASCADE_COUNT];
    let mut end = [csm_end; MAX_CASCADE_COUNT];
    let mut start_ndc = [0.0; MAX_CASCADE_COUNT];
    let mut end_ndc = [0.0; MAX_CASCADE_COUNT];

    start[0] = csm_start;
    end[cascade_count - 1] = csm_end;
    start_ndc[0] = projected_split_depth(camera, csm_start);
    end_ndc[cascade_count - 1] = projected_split_depth(camera, csm_end);

    for c in 1..cascade_count {
        let progress = c as f32 / cascade_count as f32;
        let linear_split = lerp(progress, csm_start, csm_end);
        start[c] = if camera.is_perspective {
            let exponential_split = csm_start * (csm_end / csm_start).powf(progress);
            lerp(settings.cascade_exponent, linear_split, exponential_split)
        } else {
            linear_split
        };
        end[c - 1] = start[c];

        // Pull the cascade start back into the previous slice by the fade
        // fraction
        let fade_target = if c > 1 { end[c - 2] } else { start[0] };
        start[c] = lerp(settings.cascade_fade, end[c - 1], fade_target);

        start_ndc[c] = projected_split_depth(camera, start[c]);
        end_ndc[c - 1] = projected_split_depth(camera, end[c - 1]);
    }

    // Wrap-around fade of the last cascade, stored in the first slot
    let previous_split = if cascade_count > 1 {
        end[cascade_count - 2]
    } else {
        start[0]
    };
    start[0] = lerp(settings.cascade_fade, end[cascade_count - 1], previous_split);

    CascadeSplits {
        start,
        end,
        start_ndc,
        end_ndc,
    }
}

/// Computes the world space corners of the camera frustum slice between the
/// given NDC depths: corners 0 to 3 form the near cap and corners 4 to 7 the
/// far cap.
fn frustum_corners_world(
    view_projection_inverse: &Matrix4<f32>,
    start_ndc: f32,
    end_ndc: f32,
) -> [Point3<f32>; 8] {
    let mut corners = [Point3::origin(); 8];
    for (slot, corner) in corners.iter_mut().enumerate() {
        let (x, y) = CAP_CORNERS[slot % 4];
        let z = if slot < 4 { start_ndc } else { end_ndc };
        *corner = view_projection_inverse.transform_point(&Point3::new(x, y, z));
    }
    corners
}

/// Computes the light space view matrix as the inverse of the light's world
/// transform with the basis columns re-normalized, so that non-uniform light
/// scale does not distort the shadow frustum.
fn light_view_matrix(light: &Light) -> Matrix4<f32> {
    let mut view = light
        .transform
        .try_inverse()
        .unwrap_or_else(Matrix4::identity);
    for index in 0..3 {
        let column = Vector3::new(view[(0, index)], view[(1, index)], view[(2, index)]);
        let norm = column.norm();
        if norm > 0.0 {
            view[(0, index)] = column.x / norm;
            view[(1, index)] = column.y / norm;
            view[(2, index)] = column.z / norm;
        }
    }
    view
}

/// Fits a bounding sphere around the given frustum slice corners. The center
/// is anchored on the far cap's face diagonal, which keeps the fit unchanged
/// under pure camera rotation, and the radius reaches the farthest corner.
fn far_cap_bounding_sphere(corners: &[Point3<f32>; 8]) -> (Point3<f32>, f32) {
    let center = nalgebra::center(&corners[4], &corners[7]);
    let radius = corners
        .iter()
        .map(|corner| nalgebra::distance(corner, &center))
        .fold(0.0, f32::max);
    (center, radius)
}

/// Snaps the projection center to the nearest shadow map texel, cancelling
/// sub-texel shimmer under camera translation.
fn snap_center_to_texel(center: &mut Point3<f32>, resolution: u32, radius: f32) {
    let texels_per_unit = resolution as f32 / (2.0 * radius);
    let origin = Vector2::new(center.x, center.y) * texels_per_unit;
    let offset = (origin.map(f32::round) - origin) / texels_per_unit;
    center.x += offset.x;
    center.y += offset.y;
}

/// Computes the cascade projections for a sun light holding a cascade shadow
/// slot and writes its shading parameters.
///
/// Cascades follow the camera, so this runs every frame at render time,
/// unlike the cube builder which only runs for lights marked for update.
pub(crate) fn setup_cascade_shadow(
    light: &Light,
    settings: &ShadowSettings,
    method: ShadowMethod,
    camera: &CameraFrame,
    resolution: u32,
    slot: &mut CascadeSlot,
    light_data: &mut LightUniform,
    shadow_data: &mut ShadowUniform,
    cascade_data: &mut ShadowCascadeUniform,
) {
    let cascade_count = settings.cascade_count.clamp(1, MAX_CASCADE_COUNT);
    let splits = compute_splits(camera, settings, cascade_count);

    cascade_data.split_start = splits.start;
    cascade_data.split_end = splits.end;

    let view_projection_inverse = camera
        .view_projection()
        .try_inverse()
        .unwrap_or_else(Matrix4::identity);
    let light_view = light_view_matrix(light);
    let texture_remap = ndc_to_texture_matrix();

    for c in 0..cascade_count {
        let world_corners =
            frustum_corners_world(&view_projection_inverse, splits.start_ndc[c], splits.end_ndc[c]);
        let light_corners = world_corners.map(|corner| light_view.transform_point(&corner));

        let (mut center, radius) = far_cap_bounding_sphere(&light_corners);
        slot.radii[c] = radius;

        snap_center_to_texel(&mut center, resolution, radius);

        // The depth range comes from the light's clip planes, not from the
        // sphere
        let projection = Orthographic3::new(
            center.x - radius,
            center.x + radius,
            center.y - radius,
            center.y + radius,
            settings.clip_start,
            settings.clip_end,
        );

        slot.view_projections[c] = projection.to_homogeneous() * light_view;
        cascade_data.shadow_matrices[c] = texture_remap * slot.view_projections[c];
    }

    shadow_data.bias = 0.05 * settings.bias;
    shadow_data.near = settings.clip_start;
    shadow_data.far = settings.clip_end;
    shadow_data.exponent = match method {
        ShadowMethod::Vsm => settings.bleed_bias,
        ShadowMethod::Esm => settings.bleed_exponent,
    };
    shadow_data.shadow_start = slot.layer as f32;
    shadow_data.data_start = slot.cascade_id as f32;
    shadow_data.multi_shadow_count = 1.0;

    light_data.shadow_id = slot.shadow_id as f32;
}
