//! Tracking of shadow casters moving through cube shadow volumes.

use crate::{geometry::AxisAlignedBox, light::LightId};
use nalgebra::{Matrix4, Point3};
use std::{collections::HashMap, fmt};

/// Identifier for a shadow casting drawable, assigned by the host and stable
/// across frames.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CasterId(u64);

/// A shadow casting drawable registered for the current frame.
#[derive(Clone, Debug)]
pub struct ShadowCaster {
    /// Host-assigned identifier.
    pub id: CasterId,
    /// Bounds of the drawable in its local space.
    pub bounds: AxisAlignedBox,
    /// World transform of the drawable.
    pub transform: Matrix4<f32>,
    /// Whether the drawable was moved or edited since the previous frame.
    pub changed: bool,
}

/// Per-light shadow state that survives across frames: the re-render flag and
/// the set of casters currently inside the light's shadow volume.
///
/// Each frame the tracked caster sets go through a mark, test, sweep cycle:
/// every entry is marked as a removal candidate, every caster registered for
/// the frame is tested against every cube shadow volume (confirming, adding or
/// removing entries), and surviving candidates are swept out. Any membership
/// change, and any confirmed caster flagged as changed, marks the light for
/// re-render.
#[derive(Debug, Default)]
pub(crate) struct ShadowTracker {
    states: HashMap<LightId, TrackedLight>,
}

#[derive(Debug)]
struct TrackedLight {
    needs_update: bool,
    casters: Vec<TrackedCaster>,
}

#[derive(Debug)]
struct TrackedCaster {
    id: CasterId,
    prune: bool,
}

impl CasterId {
    /// Wraps the given `u64` as a caster identifier.
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

impl fmt::Display for CasterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ShadowCaster {
    /// Whether this caster's bounds intersect the cube of the given
    /// half-extent centered at the given position.
    pub(crate) fn intersects_shadow_volume(
        &self,
        light_position: &Point3<f32>,
        half_extent: f32,
    ) -> bool {
        // In light-local space the shadow volume is an axis-aligned cube
        // around the origin
        let to_light_space = Matrix4::new_translation(&(-light_position.coords)) * self.transform;
        let corners = self
            .bounds
            .all_corners()
            .map(|corner| to_light_space.transform_point(&corner));
        let bounds = AxisAlignedBox::aabb_for_points(&corners);

        (0..3).all(|axis| {
            bounds.lower_corner()[axis] <= half_extent
                && bounds.upper_corner()[axis] >= -half_extent
        })
    }
}

impl ShadowTracker {
    /// Ensures tracking state exists for the given light. Lights tracked for
    /// the first time start out needing a render.
    pub(crate) fn begin_tracking(&mut self, light: LightId) {
        self.states.entry(light).or_insert_with(|| TrackedLight {
            needs_update: true,
            casters: Vec::new(),
        });
    }

    /// Marks the given light's shadow map for re-render.
    pub(crate) fn mark_for_update(&mut self, light: LightId) {
        if let Some(state) = self.states.get_mut(&light) {
            state.needs_update = true;
        }
    }

    /// Marks every caster tracked for the given light as a removal candidate.
    /// Candidates survive only if reconfirmed by [`Self::test_caster`] before
    /// [`Self::sweep_pruned`] runs.
    pub(crate) fn mark_all_for_prune(&mut self, light: LightId) {
        if let Some(state) = self.states.get_mut(&light) {
            for tracked in &mut state.casters {
                tracked.prune = true;
            }
        }
    }

    /// Updates the tracked state of the given caster against the given cube
    /// shadow light, marking the light for re-render on every membership
    /// transition and for confirmed casters that changed this frame.
    pub(crate) fn test_caster(
        &mut self,
        light: LightId,
        light_position: &Point3<f32>,
        half_extent: f32,
        caster: &ShadowCaster,
    ) {
        let Some(state) = self.states.get_mut(&light) else {
            return;
        };
        let intersects = caster.intersects_shadow_volume(light_position, half_extent);
        let position = state
            .casters
            .iter()
            .position(|tracked| tracked.id == caster.id);

        match (position, intersects) {
            (None, true) => {
                state.casters.push(TrackedCaster {
                    id: caster.id,
                    prune: false,
                });
                state.needs_update = true;
            }
            (Some(index), true) => {
                state.casters[index].prune = false;
                if caster.changed {
                    state.needs_update = true;
                }
            }
            (Some(index), false) => {
                state.casters.swap_remove(index);
                state.needs_update = true;
            }
            (None, false) => {}
        }
    }

    /// Removes every caster of the given light still marked as a removal
    /// candidate. Removals mark the light for re-render.
    pub(crate) fn sweep_pruned(&mut self, light: LightId) {
        if let Some(state) = self.states.get_mut(&light) {
            let tracked_count = state.casters.len();
            state.casters.retain(|tracked| !tracked.prune);
            if state.casters.len() != tracked_count {
                state.needs_update = true;
            }
        }
    }

    /// Whether the given light's shadow map needs a re-render.
    pub(crate) fn needs_update(&self, light: LightId) -> bool {
        self.states
            .get(&light)
            .is_some_and(|state| state.needs_update)
    }

    /// Clears the re-render flag of the given light.
    pub(crate) fn clear_needs_update(&mut self, light: LightId) {
        if let Some(state) = self.states.get_mut(&light) {
            state.needs_update = false;
        }
    }

    /// Drops the state of every light the given predicate rejects.
    pub(crate) fn retain_lights(&mut self, mut keep: impl FnMut(LightId) -> bool) {
        self.states.retain(|&light, _| keep(light));
    }

    #[cfg(test)]
    pub(crate) fn tracked_caster_count(&self, light: LightId) -> usize {
        self.states
            .get(&light)
            .map_or(0, |state| state.casters.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nalgebra::{Vector3, point, vector};

    const HALF_EXTENT: f32 = 40.0;

    fn caster(id: u64, position: Vector3<f32>) -> ShadowCaster {
        ShadowCaster {
            id: CasterId::new(id),
            bounds: AxisAlignedBox::new(point![-1.0, -1.0, -1.0], point![1.0, 1.0, 1.0]),
            transform: Matrix4::new_translation(&position),
            changed: false,
        }
    }

    fn run_pass(tracker: &mut ShadowTracker, light: LightId, casters: &[ShadowCaster]) {
        tracker.mark_all_for_prune(light);
        for caster in casters {
            tracker.test_caster(light, &Point3::origin(), HALF_EXTENT, caster);
        }
        tracker.sweep_pruned(light);
    }

    #[test]
    fn newly_tracked_lights_need_an_initial_render() {
        let light = LightId::new(4);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);
        assert!(tracker.needs_update(light));
    }

    #[test]
    fn caster_entering_the_volume_dirties_the_light_once() {
        let light = LightId::new(1);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);
        tracker.clear_needs_update(light);

        let inside = caster(7, vector![5.0, 0.0, 0.0]);

        run_pass(&mut tracker, light, &[inside.clone()]);
        assert!(tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 1);

        tracker.clear_needs_update(light);
        run_pass(&mut tracker, light, &[inside]);
        assert!(!tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 1);
    }

    #[test]
    fn changed_caster_inside_the_volume_dirties_the_light() {
        let light = LightId::new(1);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);

        let mut inside = caster(7, vector![5.0, 0.0, 0.0]);
        run_pass(&mut tracker, light, &[inside.clone()]);
        tracker.clear_needs_update(light);

        inside.changed = true;
        run_pass(&mut tracker, light, &[inside]);
        assert!(tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 1);
    }

    #[test]
    fn caster_moving_out_of_the_volume_is_removed_and_dirties_the_light() {
        let light = LightId::new(1);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);

        run_pass(&mut tracker, light, &[caster(7, vector![5.0, 0.0, 0.0])]);
        tracker.clear_needs_update(light);

        run_pass(&mut tracker, light, &[caster(7, vector![100.0, 0.0, 0.0])]);
        assert!(tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 0);
    }

    #[test]
    fn unregistered_caster_is_swept_and_dirties_the_light() {
        let light = LightId::new(1);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);

        run_pass(&mut tracker, light, &[caster(7, vector![5.0, 0.0, 0.0])]);
        tracker.clear_needs_update(light);

        run_pass(&mut tracker, light, &[]);
        assert!(tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 0);
    }

    #[test]
    fn caster_outside_the_volume_is_never_tracked() {
        let light = LightId::new(1);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(light);
        tracker.clear_needs_update(light);

        run_pass(&mut tracker, light, &[caster(7, vector![100.0, 0.0, 0.0])]);
        assert!(!tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 0);
    }

    #[test]
    fn testing_an_untracked_light_is_a_no_op() {
        let light = LightId::new(9);
        let mut tracker = ShadowTracker::default();
        tracker.test_caster(
            light,
            &Point3::origin(),
            HALF_EXTENT,
            &caster(1, vector![0.0, 0.0, 0.0]),
        );
        assert!(!tracker.needs_update(light));
        assert_eq!(tracker.tracked_caster_count(light), 0);
    }

    #[test]
    fn dropped_lights_lose_their_state() {
        let kept = LightId::new(1);
        let dropped = LightId::new(2);
        let mut tracker = ShadowTracker::default();
        tracker.begin_tracking(kept);
        tracker.begin_tracking(dropped);
        run_pass(&mut tracker, dropped, &[caster(7, vector![0.0, 0.0, 0.0])]);

        tracker.retain_lights(|light| light == kept);

        assert!(tracker.needs_update(kept));
        assert!(!tracker.needs_update(dropped));
        assert_eq!(tracker.tracked_caster_count(dropped), 0);
    }

    #[test]
    fn volume_test_accounts_for_caster_transform() {
        let distant = caster(1, vector![50.0, 0.0, 0.0]);
        assert!(!distant.intersects_shadow_volume(&Point3::origin(), HALF_EXTENT));
        assert!(distant.intersects_shadow_volume(&point![45.0, 0.0, 0.0], HALF_EXTENT));
    }

    #[test]
    fn volume_test_uses_world_space_bounds() {
        let elongated = |transform| ShadowCaster {
            id: CasterId::new(3),
            bounds: AxisAlignedBox::new(point![-10.0, -0.1, -0.1], point![10.0, 0.1, 0.1]),
            transform,
            changed: false,
        };

        // The long local x-extent reaches back into the volume
        let reaching = elongated(Matrix4::new_translation(&vector![45.0, 0.0, 0.0]));
        assert!(reaching.intersects_shadow_volume(&Point3::origin(), HALF_EXTENT));

        // Rotated so the long extent points along world y, the box no longer
        // reaches the volume
        let turned = elongated(
            Matrix4::new_translation(&vector![45.0, 0.0, 0.0])
                * nalgebra::UnitQuaternion::from_axis_angle(
                    &Vector3::z_axis(),
                    std::f32::consts::FRAC_PI_2,
                )
                .to_homogeneous(),
        );
        assert!(!turned.intersects_shadow_volume(&Point3::origin(), HALF_EXTENT));
    }
}
