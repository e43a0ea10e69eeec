//! Frame orchestration of lights, shadow slots and shadow map rendering.

use crate::{
    MAX_CASCADE_COUNT, MAX_LIGHT, MAX_SHADOW, MAX_SHADOW_CASCADE, MAX_SHADOW_CUBE,
    cascade::{self, CameraFrame},
    config::{ShadowMapConfig, ShadowMapDimensions},
    cube::{self, CubemapFace},
    filter::FilterParams,
    gpu::{
        ArrayTextureDescriptor, CubeTextureDescriptor, FilterPass, FilterTarget, RenderBackend,
        TextureFormat, TextureId,
    },
    light::{Light, LightId, LightKind},
    tracker::{ShadowCaster, ShadowTracker},
    uniform::{
        LightUniform, ShadowCascadeUniform, ShadowCubeUniform, ShadowRenderUniform, ShadowUniform,
    },
};
use anyhow::{Result, bail};
use bitflags::bitflags;
use bytemuck::Zeroable;
use nalgebra::Matrix4;

/// The shadow map resources assigned to a registered light for the current
/// frame.
#[derive(Clone, Debug, PartialEq)]
pub enum ShadowSlot {
    /// The light casts no shadow, either by configuration or because the
    /// slot pool ran out.
    None,
    /// A cube shadow map, held by point, spot and area lights.
    Cube(CubeSlot),
    /// A cascaded shadow map, held by sun lights.
    Cascade(Box<CascadeSlot>),
}

/// A claim on one cube shadow map and one layer of the shadow pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CubeSlot {
    pub(crate) light_id: LightId,
    pub(crate) shadow_id: usize,
    pub(crate) cube_id: usize,
    pub(crate) layer: u32,
}

/// A claim on one cascaded shadow map and [`MAX_CASCADE_COUNT`] consecutive
/// layers of the shadow pool.
#[derive(Clone, Debug, PartialEq)]
pub struct CascadeSlot {
    pub(crate) light_id: LightId,
    pub(crate) shadow_id: usize,
    pub(crate) cascade_id: usize,
    pub(crate) layer: u32,
    pub(crate) view_projections: [Matrix4<f32>; MAX_CASCADE_COUNT],
    pub(crate) radii: [f32; MAX_CASCADE_COUNT],
}

impl CubeSlot {
    /// The light holding this slot.
    pub fn light_id(&self) -> LightId {
        self.light_id
    }

    /// Index of the light's record in the shadow table.
    pub fn shadow_id(&self) -> usize {
        self.shadow_id
    }

    /// Index of the light's record in the cube table.
    pub fn cube_id(&self) -> usize {
        self.cube_id
    }

    /// The shadow pool layer holding the filtered map.
    pub fn layer(&self) -> u32 {
        self.layer
    }
}

impl CascadeSlot {
    /// The light holding this slot.
    pub fn light_id(&self) -> LightId {
        self.light_id
    }

    /// Index of the light's record in the shadow table.
    pub fn shadow_id(&self) -> usize {
        self.shadow_id
    }

    /// Index of the light's record in the cascade table.
    pub fn cascade_id(&self) -> usize {
        self.cascade_id
    }

    /// The first of the [`MAX_CASCADE_COUNT`] consecutive shadow pool layers
    /// holding the filtered cascades.
    pub fn layer(&self) -> u32 {
        self.layer
    }

    /// The view-projection matrix each cascade was rendered with. Valid once
    /// the cascades have been rendered for the frame.
    pub fn view_projections(&self) -> &[Matrix4<f32>; MAX_CASCADE_COUNT] {
        &self.view_projections
    }

    /// The bounding radius of the camera frustum slice each cascade covers.
    /// Valid once the cascades have been rendered for the frame.
    pub fn radii(&self) -> &[f32; MAX_CASCADE_COUNT] {
        &self.radii
    }
}

/// A light registered for the current frame together with its shadow slot.
#[derive(Clone, Debug)]
struct RegisteredLight {
    light: Light,
    slot: ShadowSlot,
}

/// Texture handles owned by the manager, present between the first cache
/// finalization and the next configuration change.
#[derive(Default)]
struct ShadowTextures {
    cube_target: Option<TextureId>,
    cube_blur: Option<TextureId>,
    cascade_target: Option<TextureId>,
    cascade_blur: Option<TextureId>,
    pool: Option<TextureId>,
}

impl ShadowTextures {
    fn free_all(&mut self, backend: &mut impl RenderBackend) {
        for texture in [
            self.cube_target.take(),
            self.cube_blur.take(),
            self.cascade_target.take(),
            self.cascade_blur.take(),
            self.pool.take(),
        ]
        .into_iter()
        .flatten()
        {
            backend.free_texture(texture);
        }
    }
}

bitflags! {
    /// Pending invalidations that outlive a single phase.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    struct UpdateFlags: u32 {
        /// Every cube shadow map must be re-rendered because the pool layer
        /// assignment or the backing textures changed.
        const SHADOW_CUBE = 1 << 0;
    }
}

/// The point in the per-frame call sequence the manager is at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FramePhase {
    Idle,
    Collecting,
    Finalized,
}

/// Owner of all light and shadow map state.
///
/// The per-frame call order is [`Self::begin_frame`], any number of
/// [`Self::register_light`] and [`Self::register_caster`] calls,
/// [`Self::finalize_cache`], then [`Self::render_shadows`]. Calls out of
/// order are programming errors checked by debug assertions.
pub struct LightManager {
    config: ShadowMapConfig,
    dimensions: ShadowMapDimensions,
    lights: Vec<RegisteredLight>,
    casters: Vec<ShadowCaster>,
    tracker: ShadowTracker,
    light_table: Vec<LightUniform>,
    shadow_table: Vec<ShadowUniform>,
    cube_table: Vec<ShadowCubeUniform>,
    cascade_table: Vec<ShadowCascadeUniform>,
    render_block: ShadowRenderUniform,
    textures: ShadowTextures,
    layer_count: u32,
    cached_layer_count: u32,
    update_flags: UpdateFlags,
    light_overflow_warned: bool,
    cube_overflow_warned: bool,
    cascade_overflow_warned: bool,
    phase: FramePhase,
}

impl LightManager {
    /// Creates a manager with the given configuration. No GPU resources are
    /// allocated until the first cache finalization.
    ///
    /// # Panics
    /// If the configured resolution is outside the range 1 to 8192.
    pub fn new(config: ShadowMapConfig) -> Self {
        let dimensions = ShadowMapDimensions::for_config(&config);
        Self {
            config,
            dimensions,
            lights: Vec::new(),
            casters: Vec::new(),
            tracker: ShadowTracker::default(),
            light_table: Vec::with_capacity(MAX_LIGHT),
            shadow_table: Vec::with_capacity(MAX_SHADOW),
            cube_table: Vec::with_capacity(MAX_SHADOW_CUBE),
            cascade_table: Vec::with_capacity(MAX_SHADOW_CASCADE),
            render_block: ShadowRenderUniform::zeroed(),
            textures: ShadowTextures::default(),
            layer_count: 0,
            cached_layer_count: 0,
            update_flags: UpdateFlags::empty(),
            light_overflow_warned: false,
            cube_overflow_warned: false,
            cascade_overflow_warned: false,
            phase: FramePhase::Idle,
        }
    }

    /// Applies a new configuration. On any change all shadow textures are
    /// released for recreation at the next cache finalization and every cube
    /// shadow map is marked for re-render; an unchanged configuration keeps
    /// every resource.
    ///
    /// # Panics
    /// If the configured resolution is outside the range 1 to 8192.
    pub fn configure(&mut self, config: ShadowMapConfig, backend: &mut impl RenderBackend) {
        if self.config == config {
            return;
        }
        log::debug!("Shadow map configuration changed; releasing all shadow textures");
        self.dimensions = ShadowMapDimensions::for_config(&config);
        self.config = config;
        self.textures.free_all(backend);
        self.update_flags |= UpdateFlags::SHADOW_CUBE;
    }

    /// The active configuration.
    pub fn config(&self) -> &ShadowMapConfig {
        &self.config
    }

    /// The texture and texel sizes derived from the active configuration.
    pub fn dimensions(&self) -> &ShadowMapDimensions {
        &self.dimensions
    }

    /// Number of lights registered for the current frame.
    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    /// Number of shadow pool layers claimed by the current frame's slots.
    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// The shadow slot assigned to the given light this frame, or [`None`]
    /// if the light is not registered.
    pub fn shadow_slot(&self, light: LightId) -> Option<&ShadowSlot> {
        self.lights
            .iter()
            .find(|entry| entry.light.id == light)
            .map(|entry| &entry.slot)
    }

    /// The per-light shading parameters, index-aligned with registration
    /// order.
    pub fn light_uniforms(&self) -> &[LightUniform] {
        &self.light_table
    }

    /// The per-shadow-map parameters, indexed by `shadow_id`.
    pub fn shadow_uniforms(&self) -> &[ShadowUniform] {
        &self.shadow_table
    }

    /// The per-cube-map parameters, indexed by `cube_id`.
    pub fn cube_uniforms(&self) -> &[ShadowCubeUniform] {
        &self.cube_table
    }

    /// The per-cascade-map parameters, indexed by `cascade_id`.
    pub fn cascade_uniforms(&self) -> &[ShadowCascadeUniform] {
        &self.cascade_table
    }

    /// Starts collecting lights and shadow casters for a new frame,
    /// discarding the previous frame's registry and slot assignments.
    pub fn begin_frame(&mut self) {
        self.lights.clear();
        self.casters.clear();
        self.light_table.clear();
        self.shadow_table.clear();
        self.cube_table.clear();
        self.cascade_table.clear();
        self.layer_count = 0;
        self.light_overflow_warned = false;
        self.cube_overflow_warned = false;
        self.cascade_overflow_warned = false;
        self.phase = FramePhase::Collecting;
    }

    /// Adds a light to the frame's registry, claiming shadow slots while
    /// capacity lasts.
    ///
    /// Lights beyond [`MAX_LIGHT`] are dropped with a warning. Shadowed
    /// lights beyond the cube or cascade slot capacity keep shading but cast
    /// no shadow, also with a warning.
    pub fn register_light(&mut self, light: &Light) {
        debug_assert_eq!(
            self.phase,
            FramePhase::Collecting,
            "light registered outside the collection phase"
        );
        if self.lights.len() >= MAX_LIGHT {
            if !self.light_overflow_warned {
                log::warn!(
                    "Reached the limit of {MAX_LIGHT} lights; ignoring further lights this frame"
                );
                self.light_overflow_warned = true;
            }
            return;
        }

        let slot = if light.shadow.is_some() {
            match light.kind {
                LightKind::Sun { .. } => self.claim_cascade_slot(light.id),
                LightKind::Point { .. } | LightKind::Spot { .. } | LightKind::Area { .. } => {
                    self.claim_cube_slot(light.id)
                }
            }
        } else {
            ShadowSlot::None
        };

        if let ShadowSlot::Cube(_) = slot {
            self.tracker.begin_tracking(light.id);
        }

        self.light_table.push(LightUniform::zeroed());
        self.lights.push(RegisteredLight {
            light: *light,
            slot,
        });
    }

    fn claim_cube_slot(&mut self, light_id: LightId) -> ShadowSlot {
        if self.cube_table.len() >= MAX_SHADOW_CUBE {
            if !self.cube_overflow_warned {
                log::warn!(
                    "Reached the limit of {MAX_SHADOW_CUBE} cube shadow maps; light {light_id} \
                     and later cube shadowed lights cast no shadow this frame"
                );
                self.cube_overflow_warned = true;
            }
            return ShadowSlot::None;
        }

        let slot = CubeSlot {
            light_id,
            shadow_id: self.shadow_table.len(),
            cube_id: self.cube_table.len(),
            layer: self.layer_count,
        };
        self.layer_count += 1;
        self.shadow_table.push(ShadowUniform::zeroed());
        self.cube_table.push(ShadowCubeUniform::zeroed());
        ShadowSlot::Cube(slot)
    }

    fn claim_cascade_slot(&mut self, light_id: LightId) -> ShadowSlot {
        if self.cascade_table.len() >= MAX_SHADOW_CASCADE {
            if !self.cascade_overflow_warned {
                log::warn!(
                    "Reached the limit of {MAX_SHADOW_CASCADE} cascaded shadow maps; light \
                     {light_id} and later sun lights cast no shadow this frame"
                );
                self.cascade_overflow_warned = true;
            }
            return ShadowSlot::None;
        }

        let slot = CascadeSlot {
            light_id,
            shadow_id: self.shadow_table.len(),
            cascade_id: self.cascade_table.len(),
            layer: self.layer_count,
            view_projections: [Matrix4::identity(); MAX_CASCADE_COUNT],
            radii: [0.0; MAX_CASCADE_COUNT],
        };
        // The full layer range is reserved regardless of the configured
        // cascade count, so changing the count does not shift other lights'
        // layers
        self.layer_count += MAX_CASCADE_COUNT as u32;
        self.shadow_table.push(ShadowUniform::zeroed());
        self.cascade_table.push(ShadowCascadeUniform::zeroed());
        ShadowSlot::Cascade(Box::new(slot))
    }

    /// Records a drawable as shadow casting geometry for this frame.
    pub fn register_caster(&mut self, caster: &ShadowCaster) {
        debug_assert_eq!(
            self.phase,
            FramePhase::Collecting,
            "shadow caster registered outside the collection phase"
        );
        self.casters.push(caster.clone());
    }

    /// Ensures the GPU resources matching this frame's slot allocation
    /// exist, then refreshes all per-light state via
    /// [`Self::update_lights`].
    ///
    /// The shadow pool is reallocated when the claimed layer count changed
    /// since the last finalization; every cube shadow map is then marked for
    /// re-render since its layer assignment may have moved.
    ///
    /// # Errors
    /// Returns an error if the backend fails to allocate a texture. Textures
    /// created before the failure are kept; the next finalization allocates
    /// only the ones still missing.
    pub fn finalize_cache(&mut self, backend: &mut impl RenderBackend) -> Result<()> {
        debug_assert_eq!(
            self.phase,
            FramePhase::Collecting,
            "finalize_cache called outside the collection phase"
        );

        if self.layer_count != self.cached_layer_count {
            log::debug!(
                "Shadow pool layer count changed from {} to {}; reallocating",
                self.cached_layer_count,
                self.layer_count
            );
            if let Some(pool) = self.textures.pool.take() {
                backend.free_texture(pool);
            }
            self.cached_layer_count = self.layer_count;
            self.update_flags |= UpdateFlags::SHADOW_CUBE;
        }

        let storage_format = self.config.method.storage_format(self.config.high_bit_depth);
        let resolution = self.dimensions.resolution();
        let cube_size = self.dimensions.cube_target_size();

        // A failed allocation leaves earlier textures in place; the next
        // finalization retries only the ones still missing.
        if self.textures.cube_target.is_none() {
            self.textures.cube_target =
                Some(backend.create_cube_texture(CubeTextureDescriptor {
                    size: cube_size,
                    format: TextureFormat::Depth24,
                    filtered: false,
                })?);
        }

        if self.textures.cube_blur.is_none() {
            self.textures.cube_blur = Some(backend.create_cube_texture(CubeTextureDescriptor {
                size: cube_size,
                format: storage_format,
                filtered: true,
            })?);
        }

        if self.textures.cascade_target.is_none() {
            self.textures.cascade_target =
                Some(backend.create_array_texture(ArrayTextureDescriptor {
                    width: resolution,
                    height: resolution,
                    layer_count: MAX_CASCADE_COUNT as u32,
                    format: TextureFormat::Depth24,
                    filtered: false,
                })?);
        }

        if self.textures.cascade_blur.is_none() {
            self.textures.cascade_blur =
                Some(backend.create_array_texture(ArrayTextureDescriptor {
                    width: resolution,
                    height: resolution,
                    layer_count: MAX_CASCADE_COUNT as u32,
                    format: storage_format,
                    filtered: true,
                })?);
        }

        if self.textures.pool.is_none() {
            self.textures.pool = Some(backend.create_array_texture(ArrayTextureDescriptor {
                width: resolution,
                height: resolution,
                layer_count: self.layer_count.max(1),
                format: storage_format,
                filtered: true,
            })?);
        }

        self.phase = FramePhase::Finalized;
        self.update_lights();
        Ok(())
    }

    /// Runs the caster tracking pass and rebuilds the shading parameters of
    /// every registered light.
    ///
    /// A cube shadowed light is marked for re-render when its tracked caster
    /// set changed, when it was edited this frame, or when the whole layer
    /// assignment moved. Persistent state of lights absent from the registry
    /// is dropped.
    pub fn update_lights(&mut self) {
        debug_assert_eq!(
            self.phase,
            FramePhase::Finalized,
            "update_lights called before finalize_cache"
        );

        let global_update = self.update_flags.contains(UpdateFlags::SHADOW_CUBE);
        for entry in &self.lights {
            let ShadowSlot::Cube(_) = entry.slot else {
                continue;
            };
            if global_update || entry.light.changed {
                self.tracker.mark_for_update(entry.light.id);
            }
            self.tracker.mark_all_for_prune(entry.light.id);
        }

        for caster in &self.casters {
            for entry in &self.lights {
                let (ShadowSlot::Cube(_), Some(settings)) = (&entry.slot, entry.light.shadow)
                else {
                    continue;
                };
                self.tracker.test_caster(
                    entry.light.id,
                    &entry.light.position(),
                    settings.clip_end,
                    caster,
                );
            }
        }

        for (index, entry) in self.lights.iter().enumerate() {
            self.light_table[index] = entry.light.build_uniform();
        }

        for (index, entry) in self.lights.iter().enumerate() {
            let (ShadowSlot::Cube(slot), Some(settings)) = (&entry.slot, entry.light.shadow)
            else {
                continue;
            };
            cube::setup_cube_shadow(
                &entry.light,
                &settings,
                self.config.method,
                slot,
                &mut self.light_table[index],
                &mut self.shadow_table[slot.shadow_id],
                &mut self.cube_table[slot.cube_id],
            );
            self.tracker.sweep_pruned(entry.light.id);
        }

        let lights = &self.lights;
        self.tracker
            .retain_lights(|light| lights.iter().any(|entry| entry.light.id == light));
    }

    /// Renders every shadow map that needs it and uploads the shading
    /// tables.
    ///
    /// Cube shadow maps are re-rendered only for lights marked by the
    /// tracking pass; cascades follow the camera and are re-rendered every
    /// frame. The uniform tables are uploaded once, after all passes.
    ///
    /// # Errors
    /// Returns an error if the backend fails to issue a pass or upload; the
    /// host should skip sampling shadows for this frame.
    pub fn render_shadows(
        &mut self,
        camera: &CameraFrame,
        backend: &mut impl RenderBackend,
    ) -> Result<()> {
        debug_assert_eq!(
            self.phase,
            FramePhase::Finalized,
            "render_shadows called before finalize_cache"
        );
        let (Some(cube_target), Some(cube_blur), Some(cascade_target), Some(cascade_blur), Some(pool)) = (
            self.textures.cube_target,
            self.textures.cube_blur,
            self.textures.cascade_target,
            self.textures.cascade_blur,
            self.textures.pool,
        ) else {
            bail!("shadow textures missing; finalize_cache must succeed before render_shadows");
        };

        self.render_block.cube_texel_size = self.dimensions.cube_texel_size();
        self.render_block.stored_texel_size = self.dimensions.stored_texel_size();

        for entry in &self.lights {
            let (ShadowSlot::Cube(slot), Some(settings)) = (&entry.slot, entry.light.shadow)
            else {
                continue;
            };
            if !self.tracker.needs_update(entry.light.id) {
                continue;
            }

            cube::write_render_block(
                &mut self.render_block,
                &entry.light.position(),
                settings.clip_start,
                settings.clip_end,
            );
            backend.update_render_block(&self.render_block)?;
            backend.render_cube_faces(entry.light.id, cube_target)?;

            let params =
                FilterParams::for_cube(settings.softness, self.dimensions.cube_texel_size());
            for face in CubemapFace::all() {
                backend.run_copy_pass(&FilterPass {
                    source: cube_target,
                    source_layer: face.as_idx_u32(),
                    destination: cube_blur,
                    target: FilterTarget::CubeFace(face),
                    filter_size: params.copy_filter_size,
                })?;
            }

            self.render_block.sample_count = params.sample_count;
            self.render_block.inverse_sample_count = params.inverse_sample_count();
            backend.update_render_block(&self.render_block)?;
            backend.run_store_pass(&FilterPass {
                source: cube_blur,
                source_layer: 0,
                destination: pool,
                target: FilterTarget::ArrayLayer(slot.layer),
                filter_size: params.store_filter_size,
            })?;

            self.tracker.clear_needs_update(entry.light.id);
        }
        self.update_flags.remove(UpdateFlags::SHADOW_CUBE);

        for index in 0..self.lights.len() {
            let entry = &mut self.lights[index];
            let light = entry.light;
            let (ShadowSlot::Cascade(boxed), Some(settings)) = (&mut entry.slot, light.shadow)
            else {
                continue;
            };
            let slot: &mut CascadeSlot = boxed;
            let shadow_id = slot.shadow_id;
            let cascade_id = slot.cascade_id;

            cascade::setup_cascade_shadow(
                &light,
                &settings,
                self.config.method,
                camera,
                self.dimensions.resolution(),
                slot,
                &mut self.light_table[index],
                &mut self.shadow_table[shadow_id],
                &mut self.cascade_table[cascade_id],
            );

            let cascade_count = settings.cascade_count.clamp(1, MAX_CASCADE_COUNT);
            self.render_block.clip_near = settings.clip_start;
            self.render_block.clip_far = settings.clip_end;
            self.render_block.shadow_matrices[..cascade_count]
                .copy_from_slice(&slot.view_projections[..cascade_count]);
            backend.update_render_block(&self.render_block)?;
            backend.render_cascades(light.id, cascade_count, cascade_target)?;

            for c in 0..cascade_count {
                let params = FilterParams::for_cascade(
                    settings.softness,
                    self.dimensions.stored_texel_size(),
                    self.dimensions.resolution(),
                    slot.radii[c],
                );
                backend.run_copy_pass(&FilterPass {
                    source: cascade_target,
                    source_layer: c as u32,
                    destination: cascade_blur,
                    target: FilterTarget::ArrayLayer(c as u32),
                    filter_size: params.copy_filter_size,
                })?;

                self.render_block.sample_count = params.sample_count;
                self.render_block.inverse_sample_count = params.inverse_sample_count();
                backend.update_render_block(&self.render_block)?;
                backend.run_store_pass(&FilterPass {
                    source: cascade_blur,
                    source_layer: c as u32,
                    destination: pool,
                    target: FilterTarget::ArrayLayer(slot.layer + c as u32),
                    filter_size: params.store_filter_size,
                })?;
            }
        }

        // Update all tables at once
        backend.upload_light_tables(
            &self.light_table,
            &self.shadow_table,
            &self.cube_table,
            &self.cascade_table,
        )?;

        self.phase = FramePhase::Idle;
        Ok(())
    }

    /// Releases all GPU resources owned by the manager.
    pub fn shutdown(&mut self, backend: &mut impl RenderBackend) {
        self.textures.free_all(backend);
        self.cached_layer_count = 0;
        self.phase = FramePhase::Idle;
    }
}
