//! Selection of shadow softening filter sizes and sample counts.
//!
//! Every shadow map is softened in two stages: a fixed 3x3 box filter applied
//! while copying the rendered depth out of the render target, and a
//! concentric disk filter applied while storing the result into the shadow
//! pool. The disk filter only runs for footprints the box filter cannot
//! cover, with a sample count growing quadratically with the footprint up to
//! a fixed cap. Small hard shadows therefore pay a fixed cheap filter while
//! large soft ones stay bounded.

/// Upper bound on the store filter radius, in stored texels.
const MAX_FILTER_SIZE: f32 = 7.5;

/// Footprint already covered by the box filter ahead of the store pass for
/// cube maps.
const CUBE_BOX_PREFILTER_SIZE: f32 = 9.0;

/// Footprint already covered by the box filter ahead of the store pass for
/// cascades.
const CASCADE_BOX_PREFILTER_SIZE: f32 = 3.2;

const MAX_SAMPLE_COUNT: u32 = 256;

/// Filter sizes and sample count for softening one shadow map.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct FilterParams {
    /// Radius of the box filter copy pass, in source texture coordinates.
    pub copy_filter_size: f32,
    /// Radius of the concentric disk store pass, in source texture
    /// coordinates.
    pub store_filter_size: f32,
    /// Number of concentric samples for the store pass.
    pub sample_count: u32,
}

impl FilterParams {
    /// Selects the filter parameters for a cube shadow map with the given
    /// softness.
    pub(crate) fn for_cube(softness: f32, cube_texel_size: f32) -> Self {
        let footprint_texels = softness * 0.001;
        let footprint_pixels = (footprint_texels / cube_texel_size).ceil();

        let copy_filter_size = cube_texel_size * if footprint_pixels > 1.0 { 1.5 } else { 0.0 };
        let (store_filter_size, sample_count) =
            store_stage(footprint_pixels, cube_texel_size, CUBE_BOX_PREFILTER_SIZE);

        Self {
            copy_filter_size,
            store_filter_size,
            sample_count,
        }
    }

    /// Selects the filter parameters for one cascade of a cascaded shadow
    /// map, given the world space bounding radius the cascade covers.
    pub(crate) fn for_cascade(
        softness: f32,
        stored_texel_size: f32,
        resolution: u32,
        cascade_radius: f32,
    ) -> Self {
        let footprint_texels = softness * 0.01;
        let footprint_pixels = (resolution as f32 * footprint_texels / cascade_radius).ceil();

        let copy_filter_size = stored_texel_size * if footprint_pixels > 1.0 { 1.0 } else { 0.0 };
        let (store_filter_size, sample_count) =
            store_stage(footprint_pixels, stored_texel_size, CASCADE_BOX_PREFILTER_SIZE);

        Self {
            copy_filter_size,
            store_filter_size,
            sample_count,
        }
    }

    /// The reciprocal of the sample count, uploaded alongside the count.
    pub fn inverse_sample_count(&self) -> f32 {
        1.0 / self.sample_count as f32
    }
}

/// Computes the store pass filter size and concentric sample count for the
/// given target footprint. Footprints within the box filter's reach skip the
/// concentric filter.
fn store_stage(footprint_pixels: f32, texel_size: f32, box_prefilter_size: f32) -> (f32, u32) {
    if footprint_pixels > 2.0 {
        let filter_size = texel_size * MAX_FILTER_SIZE * box_prefilter_size;
        let remaining = (footprint_pixels - 3.0).max(0.0);
        let samples = 4.0 + 8.0 * remaining.floor() + 4.0 * (remaining * remaining).floor();
        (filter_size, (samples as u32).min(MAX_SAMPLE_COUNT))
    } else {
        (0.0, 4)
    }
}
