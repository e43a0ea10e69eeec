//! Light sources and their shading parameters.

use crate::uniform::{LightUniform, NO_SHADOW};
use nalgebra::{Matrix4, Point3, Vector3};
use std::{f32::consts::PI, fmt};

/// Identifier for a light source, assigned by the host and stable across
/// frames.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LightId(u64);

/// The footprint of an area light.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AreaShape {
    /// Square footprint whose side is the light's x-extent.
    Square,
    /// Rectangular footprint with independent x- and y-extents.
    Rectangle,
}

/// The kind-specific parameters of a light source.
///
/// Extents and radii are in world units, prior to the scale carried by the
/// light's transform.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LightKind {
    /// Omnidirectional light emitting from a sphere.
    Point {
        /// Radius of the emitting sphere.
        radius: f32,
    },
    /// Directional light infinitely far away.
    Sun {
        /// Apparent radius of the emitting disk.
        radius: f32,
    },
    /// Light emitting from a sphere, restricted to a cone.
    Spot {
        /// Radius of the emitting sphere.
        radius: f32,
        /// Full opening angle of the cone, in radians.
        cone_angle: f32,
        /// Fraction of the cone over which intensity falls off to zero.
        blend: f32,
    },
    /// Light emitting from a flat square or rectangle.
    Area {
        shape: AreaShape,
        /// Extent along the light's local x-axis.
        size_x: f32,
        /// Extent along the light's local y-axis. Ignored for square lights.
        size_y: f32,
    },
}

/// Shadow map parameters of a shadow casting light.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ShadowSettings {
    /// Depth offset applied when comparing against occluder depth.
    pub bias: f32,
    /// Near clip distance of the shadow projection.
    pub clip_start: f32,
    /// Far clip distance of the shadow projection. Also the half-extent of
    /// the volume that shadow casters are tracked against for cube maps.
    pub clip_end: f32,
    /// Occluder separation exponent for exponential shadow maps.
    pub bleed_exponent: f32,
    /// Light bleed reduction factor for variance shadow maps.
    pub bleed_bias: f32,
    /// Shadow softening amount driving filter size and sample count.
    pub softness: f32,
    /// Number of cascades for sun lights, clamped to
    /// 1..=[`MAX_CASCADE_COUNT`](crate::MAX_CASCADE_COUNT).
    pub cascade_count: usize,
    /// Furthest distance from the camera covered by the cascades.
    pub cascade_max_distance: f32,
    /// Blend between linear (0) and exponential (1) cascade distribution.
    /// Only meaningful for perspective cameras.
    pub cascade_exponent: f32,
    /// Fraction of overlap between adjacent cascades.
    pub cascade_fade: f32,
}

/// A light source registered for the current frame.
#[derive(Copy, Clone, Debug)]
pub struct Light {
    /// Host-assigned identifier.
    pub id: LightId,
    pub kind: LightKind,
    /// World transform of the light. Any scale it carries is folded into the
    /// emitted shading parameters.
    pub transform: Matrix4<f32>,
    /// Linear RGB color, before power normalization.
    pub color: Vector3<f32>,
    /// Intensity multiplier.
    pub energy: f32,
    /// Falloff range for point, spot and area lights.
    pub influence_radius: f32,
    /// Shadow parameters, or [`None`] for lights that cast no shadows.
    pub shadow: Option<ShadowSettings>,
    /// Whether the light was moved or edited since the previous frame.
    pub changed: bool,
}

impl LightId {
    /// Wraps the given `u64` as a light identifier.
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

impl fmt::Display for LightId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl LightKind {
    /// The float discriminant identifying the kind in the light table.
    pub(crate) fn discriminant(&self) -> f32 {
        match self {
            Self::Point { .. } => 0.0,
            Self::Sun { .. } => 1.0,
            Self::Spot { .. } => 2.0,
            Self::Area { .. } => 3.0,
        }
    }
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            bias: 1.0,
            clip_start: 0.5,
            clip_end: 40.0,
            bleed_exponent: 2.5,
            bleed_bias: 0.0,
            softness: 3.0,
            cascade_count: 4,
            cascade_max_distance: 1000.0,
            cascade_exponent: 0.8,
            cascade_fade: 0.1,
        }
    }
}

impl Light {
    /// The world space position of the light.
    pub fn position(&self) -> Point3<f32> {
        Point3::new(
            self.transform[(0, 3)],
            self.transform[(1, 3)],
            self.transform[(2, 3)],
        )
    }

    /// Computes the shading parameters for this light.
    ///
    /// The returned record has no shadow map assigned; the shadow builders
    /// overwrite the back-reference for lights holding a shadow slot.
    pub(crate) fn build_uniform(&self) -> LightUniform {
        let (right, scale_x) = normalized_basis_column(&self.transform, 0);
        let (up, scale_y) = normalized_basis_column(&self.transform, 1);
        let (backward, scale_z) = normalized_basis_column(&self.transform, 2);
        let forward = -backward;

        let mut size_x = 0.0;
        let mut size_y = 0.0;
        let mut spot_size_cos = 0.0;
        let mut spot_blend = 0.0;
        let mut source_radius = 0.0;

        match self.kind {
            LightKind::Point { radius } | LightKind::Sun { radius } => {
                source_radius = radius.max(0.001);
            }
            LightKind::Spot {
                radius,
                cone_angle,
                blend,
            } => {
                // Scale ratios correct the cone footprint of non-uniformly
                // scaled spots
                size_x = scale_x / scale_z;
                size_y = scale_y / scale_z;
                spot_size_cos = (cone_angle * 0.5).cos();
                spot_blend = (1.0 - spot_size_cos) * blend;
                source_radius = radius.max(0.001);
            }
            LightKind::Area {
                shape,
                size_x: extent_x,
                size_y: extent_y,
            } => {
                let extent_y = match shape {
                    AreaShape::Rectangle => extent_y,
                    AreaShape::Square => extent_x,
                };
                size_x = (extent_x * scale_x * 0.5).max(0.0001);
                size_y = (extent_y * scale_y * 0.5).max(0.0001);
            }
        }

        // Normalize power so that perceived brightness does not change with
        // the size of the emitter. The trailing constants are empirical fits
        // against an offline-rendered reference.
        let power = match self.kind {
            LightKind::Area { .. } => 1.0 / (size_x * size_y * 4.0 * PI) * 80.0,
            LightKind::Point { .. } | LightKind::Spot { .. } => {
                1.0 / (4.0 * source_radius * source_radius * PI * PI) * (PI * PI * PI * 10.0)
            }
            LightKind::Sun { .. } => 1.0,
        };

        LightUniform {
            position: self.position(),
            influence_radius: self.influence_radius,
            color: self.color * (power * self.energy),
            kind: self.kind.discriminant(),
            spot_size_cos,
            spot_blend,
            source_radius,
            shadow_id: NO_SHADOW,
            right,
            size_x,
            up,
            size_y,
            forward,
            _padding: 0.0,
        }
    }
}

/// Normalizes the given basis column of the transform, returning the unit
/// vector and the extracted scale. Degenerate columns yield a zero vector and
/// zero scale.
fn normalized_basis_column(transform: &Matrix4<f32>, index: usize) -> (Vector3<f32>, f32) {
    let column = Vector3::new(
        transform[(0, index)],
        transform[(1, index)],
        transform[(2, index)],
    );
    let norm_squared = column.norm_squared();
    if norm_squared > 1.0e-35 {
        let norm = norm_squared.sqrt();
        (column / norm, norm)
    } else {
        (Vector3::zeros(), 0.0)
    }
}
