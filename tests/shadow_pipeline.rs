//! End-to-end shadow pipeline tests against a recording GPU backend.

use anyhow::{Result, bail};
use approx::assert_abs_diff_eq;
use nalgebra::{Matrix4, Perspective3, Vector3, point, vector};
use std::f32::consts::FRAC_PI_2;
use std::sync::atomic::{AtomicUsize, Ordering};
use umbra::{
    ArrayTextureDescriptor, AxisAlignedBox, CameraFrame, CasterId, CubeTextureDescriptor,
    FilterPass, FilterTarget, Light, LightId, LightKind, LightManager, LightUniform,
    MAX_CASCADE_COUNT, MAX_LIGHT, MAX_SHADOW_CASCADE, MAX_SHADOW_CUBE, RenderBackend,
    ShadowCascadeUniform, ShadowCaster, ShadowCubeUniform, ShadowMapConfig, ShadowRenderUniform,
    ShadowSettings, ShadowSlot, ShadowUniform, TextureId,
};

/// One request issued to the backend, in issue order.
#[derive(Clone, Debug, PartialEq)]
enum BackendCall {
    CreateCube(CubeTextureDescriptor),
    CreateArray(ArrayTextureDescriptor),
    Free(TextureId),
    UpdateBlock {
        sample_count: u32,
    },
    RenderCubeFaces {
        light: LightId,
        target: TextureId,
    },
    RenderCascades {
        light: LightId,
        cascade_count: usize,
        target: TextureId,
    },
    CopyPass(FilterPass),
    StorePass(FilterPass),
    UploadTables {
        lights: usize,
        shadows: usize,
        cubes: usize,
        cascades: usize,
    },
}

#[derive(Default)]
struct RecordingBackend {
    calls: Vec<BackendCall>,
    next_texture: u64,
}

impl RecordingBackend {
    fn allocate(&mut self) -> TextureId {
        let texture = TextureId::new(self.next_texture);
        self.next_texture += 1;
        texture
    }

    fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls.iter().filter(|call| predicate(call)).count()
    }

    fn created_texture_count(&self) -> usize {
        self.count(|call| {
            matches!(
                call,
                BackendCall::CreateCube(_) | BackendCall::CreateArray(_)
            )
        })
    }

    fn freed_textures(&self) -> Vec<TextureId> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::Free(texture) => Some(*texture),
                _ => None,
            })
            .collect()
    }

    fn cube_render_count(&self) -> usize {
        self.count(|call| matches!(call, BackendCall::RenderCubeFaces { .. }))
    }

    fn store_pass_layers(&self) -> Vec<u32> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::StorePass(pass) => match pass.target {
                    FilterTarget::ArrayLayer(layer) => Some(layer),
                    FilterTarget::CubeFace(_) => None,
                },
                _ => None,
            })
            .collect()
    }

    fn position(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.calls
            .iter()
            .position(|call| predicate(call))
            .expect("expected backend call was never issued")
    }
}

impl RenderBackend for RecordingBackend {
    fn create_cube_texture(&mut self, descriptor: CubeTextureDescriptor) -> Result<TextureId> {
        self.calls.push(BackendCall::CreateCube(descriptor));
        Ok(self.allocate())
    }

    fn create_array_texture(&mut self, descriptor: ArrayTextureDescriptor) -> Result<TextureId> {
        self.calls.push(BackendCall::CreateArray(descriptor));
        Ok(self.allocate())
    }

    fn free_texture(&mut self, texture: TextureId) {
        self.calls.push(BackendCall::Free(texture));
    }

    fn update_render_block(&mut self, block: &ShadowRenderUniform) -> Result<()> {
        self.calls.push(BackendCall::UpdateBlock {
            sample_count: block.sample_count(),
        });
        Ok(())
    }

    fn render_cube_faces(&mut self, light: LightId, target: TextureId) -> Result<()> {
        self.calls.push(BackendCall::RenderCubeFaces { light, target });
        Ok(())
    }

    fn render_cascades(
        &mut self,
        light: LightId,
        cascade_count: usize,
        target: TextureId,
    ) -> Result<()> {
        self.calls.push(BackendCall::RenderCascades {
            light,
            cascade_count,
            target,
        });
        Ok(())
    }

    fn run_copy_pass(&mut self, pass: &FilterPass) -> Result<()> {
        self.calls.push(BackendCall::CopyPass(*pass));
        Ok(())
    }

    fn run_store_pass(&mut self, pass: &FilterPass) -> Result<()> {
        self.calls.push(BackendCall::StorePass(*pass));
        Ok(())
    }

    fn upload_light_tables(
        &mut self,
        lights: &[LightUniform],
        shadows: &[ShadowUniform],
        cubes: &[ShadowCubeUniform],
        cascades: &[ShadowCascadeUniform],
    ) -> Result<()> {
        self.calls.push(BackendCall::UploadTables {
            lights: lights.len(),
            shadows: shadows.len(),
            cubes: cubes.len(),
            cascades: cascades.len(),
        });
        Ok(())
    }
}

/// Backend that rejects one texture creation by ordinal and records the rest.
struct FailingBackend {
    inner: RecordingBackend,
    rejected_creation: usize,
    creations: usize,
}

impl FailingBackend {
    fn rejecting_creation(ordinal: usize) -> Self {
        Self {
            inner: RecordingBackend::default(),
            rejected_creation: ordinal,
            creations: 0,
        }
    }

    fn admit(&mut self) -> Result<()> {
        self.creations += 1;
        if self.creations == self.rejected_creation {
            bail!("texture allocation rejected");
        }
        Ok(())
    }
}

impl RenderBackend for FailingBackend {
    fn create_cube_texture(&mut self, descriptor: CubeTextureDescriptor) -> Result<TextureId> {
        self.admit()?;
        self.inner.create_cube_texture(descriptor)
    }

    fn create_array_texture(&mut self, descriptor: ArrayTextureDescriptor) -> Result<TextureId> {
        self.admit()?;
        self.inner.create_array_texture(descriptor)
    }

    fn free_texture(&mut self, texture: TextureId) {
        self.inner.free_texture(texture);
    }

    fn update_render_block(&mut self, block: &ShadowRenderUniform) -> Result<()> {
        self.inner.update_render_block(block)
    }

    fn render_cube_faces(&mut self, light: LightId, target: TextureId) -> Result<()> {
        self.inner.render_cube_faces(light, target)
    }

    fn render_cascades(
        &mut self,
        light: LightId,
        cascade_count: usize,
        target: TextureId,
    ) -> Result<()> {
        self.inner.render_cascades(light, cascade_count, target)
    }

    fn run_copy_pass(&mut self, pass: &FilterPass) -> Result<()> {
        self.inner.run_copy_pass(pass)
    }

    fn run_store_pass(&mut self, pass: &FilterPass) -> Result<()> {
        self.inner.run_store_pass(pass)
    }

    fn upload_light_tables(
        &mut self,
        lights: &[LightUniform],
        shadows: &[ShadowUniform],
        cubes: &[ShadowCubeUniform],
        cascades: &[ShadowCascadeUniform],
    ) -> Result<()> {
        self.inner.upload_light_tables(lights, shadows, cubes, cascades)
    }
}

static WARNING_COUNT: AtomicUsize = AtomicUsize::new(0);
static WARNING_COUNTER: WarningCounter = WarningCounter;

/// Counts emitted warnings so capacity degradation can be asserted on.
struct WarningCounter;

impl log::Log for WarningCounter {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::Level::Warn
    }

    fn log(&self, record: &log::Record<'_>) {
        if record.level() == log::Level::Warn {
            WARNING_COUNT.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn flush(&self) {}
}

fn install_warning_counter() {
    static INSTALL: std::sync::Once = std::sync::Once::new();
    INSTALL.call_once(|| {
        log::set_logger(&WARNING_COUNTER).expect("no other logger is installed");
        log::set_max_level(log::LevelFilter::Warn);
    });
}

fn camera() -> CameraFrame {
    CameraFrame::new(
        Matrix4::identity(),
        Perspective3::new(1.0, FRAC_PI_2, 0.5, 60.0).to_homogeneous(),
        true,
    )
}

fn light(id: u64, kind: LightKind, shadow: Option<ShadowSettings>) -> Light {
    Light {
        id: LightId::new(id),
        kind,
        transform: Matrix4::identity(),
        color: vector![1.0, 1.0, 1.0],
        energy: 1.0,
        influence_radius: 20.0,
        shadow,
        changed: false,
    }
}

fn point_light(id: u64) -> Light {
    light(
        id,
        LightKind::Point { radius: 0.1 },
        Some(ShadowSettings::default()),
    )
}

fn sun_light(id: u64) -> Light {
    light(
        id,
        LightKind::Sun { radius: 0.1 },
        Some(ShadowSettings::default()),
    )
}

fn caster(id: u64, position: Vector3<f32>) -> ShadowCaster {
    ShadowCaster {
        id: CasterId::new(id),
        bounds: AxisAlignedBox::new(point![-1.0, -1.0, -1.0], point![1.0, 1.0, 1.0]),
        transform: Matrix4::new_translation(&position),
        changed: false,
    }
}

fn run_frame(
    manager: &mut LightManager,
    backend: &mut impl RenderBackend,
    lights: &[Light],
    casters: &[ShadowCaster],
) {
    manager.begin_frame();
    for light in lights {
        manager.register_light(light);
    }
    for caster in casters {
        manager.register_caster(caster);
    }
    manager.finalize_cache(backend).unwrap();
    manager.render_shadows(&camera(), backend).unwrap();
}

#[test]
fn unchanged_configuration_preserves_texture_handles() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();
    let lights = [point_light(1)];

    run_frame(&mut manager, &mut backend, &lights, &[]);
    assert_eq!(backend.created_texture_count(), 5);
    assert!(backend.freed_textures().is_empty());

    run_frame(&mut manager, &mut backend, &lights, &[]);
    assert_eq!(backend.created_texture_count(), 5);
    assert!(backend.freed_textures().is_empty());

    manager.shutdown(&mut backend);
    assert_eq!(backend.freed_textures().len(), 5);
}

#[test]
fn pool_reallocation_frees_only_the_pool_and_redirties_cube_lights() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();

    run_frame(&mut manager, &mut backend, &[point_light(1)], &[]);
    assert_eq!(backend.cube_render_count(), 1);

    // Same allocation: nothing to re-render, nothing reallocated
    run_frame(&mut manager, &mut backend, &[point_light(1)], &[]);
    assert_eq!(backend.cube_render_count(), 1);
    assert_eq!(backend.created_texture_count(), 5);

    // A second cube light grows the pool; both lights must re-render since
    // their layers may have moved
    run_frame(
        &mut manager,
        &mut backend,
        &[point_light(1), point_light(2)],
        &[],
    );
    // Textures are created in finalization order, the pool last
    assert_eq!(backend.freed_textures(), vec![TextureId::new(4)]);
    assert_eq!(backend.created_texture_count(), 6);
    assert_eq!(backend.cube_render_count(), 3);
}

#[test]
fn configuration_change_recreates_every_texture() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();
    let lights = [point_light(1)];

    run_frame(&mut manager, &mut backend, &lights, &[]);
    assert_eq!(backend.created_texture_count(), 5);

    // Reapplying the active configuration is a no-op
    manager.configure(ShadowMapConfig::default(), &mut backend);
    assert!(backend.freed_textures().is_empty());

    let config = ShadowMapConfig {
        resolution: 512,
        ..Default::default()
    };
    manager.configure(config, &mut backend);
    assert_eq!(backend.freed_textures().len(), 5);

    run_frame(&mut manager, &mut backend, &lights, &[]);
    assert_eq!(backend.created_texture_count(), 10);

    // ceil(sqrt(resolution^2 / 6) * 3) texels per cube face
    let cube_creates: Vec<_> = backend
        .calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::CreateCube(descriptor) => Some(descriptor.size),
            _ => None,
        })
        .collect();
    assert_eq!(cube_creates, vec![1255, 1255, 628, 628]);

    let pool_layers: Vec<_> = backend
        .calls
        .iter()
        .filter_map(|call| match call {
            BackendCall::CreateArray(descriptor) => Some((descriptor.width, descriptor.layer_count)),
            _ => None,
        })
        .collect();
    assert_eq!(
        pool_layers,
        vec![
            (1024, MAX_CASCADE_COUNT as u32),
            (1024, MAX_CASCADE_COUNT as u32),
            (1024, 1),
            (512, MAX_CASCADE_COUNT as u32),
            (512, MAX_CASCADE_COUNT as u32),
            (512, 1),
        ]
    );
}

#[test]
fn failed_texture_allocation_recovers_on_the_next_frame() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    // The cube blur is the second texture requested during finalization
    let mut backend = FailingBackend::rejecting_creation(2);
    let lights = [point_light(1), sun_light(2)];

    manager.begin_frame();
    for light in &lights {
        manager.register_light(light);
    }
    assert!(manager.finalize_cache(&mut backend).is_err());
    assert_eq!(backend.inner.created_texture_count(), 1);

    // The next frame allocates only the missing textures and renders through
    run_frame(&mut manager, &mut backend, &lights, &[]);
    assert_eq!(backend.inner.created_texture_count(), 5);
    assert!(backend.inner.freed_textures().is_empty());
    assert_eq!(backend.inner.cube_render_count(), 1);
    assert_eq!(backend.inner.store_pass_layers(), vec![0, 1, 2, 3, 4]);
    assert_eq!(
        backend
            .inner
            .count(|call| matches!(call, BackendCall::UploadTables { .. })),
        1
    );
}

#[test]
fn sun_light_renders_all_cascades_every_frame() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();
    let lights = [sun_light(7)];
    let casters = [caster(1, vector![0.0, 0.0, -10.0])];

    run_frame(&mut manager, &mut backend, &lights, &casters);

    let Some(ShadowSlot::Cascade(slot)) = manager.shadow_slot(LightId::new(7)) else {
        panic!("expected the sun to hold a cascade slot");
    };
    for matrix in slot.view_projections() {
        assert!(matrix.iter().all(|value| value.is_finite()));
        assert_ne!(*matrix, Matrix4::identity());
    }
    for radius in slot.radii() {
        assert!(*radius > 0.0);
    }

    assert_eq!(
        backend.count(|call| matches!(
            call,
            BackendCall::RenderCascades {
                cascade_count: 4,
                ..
            }
        )),
        1
    );
    assert_eq!(backend.store_pass_layers(), vec![0, 1, 2, 3]);

    // Cascades track the camera, so they re-render even without any change
    run_frame(&mut manager, &mut backend, &lights, &casters);
    assert_eq!(backend.store_pass_layers(), vec![0, 1, 2, 3, 0, 1, 2, 3]);
}

#[test]
fn cube_lights_re_render_only_on_tracked_changes() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();
    let lights = [point_light(1)];
    let inside = caster(5, vector![3.0, 0.0, 0.0]);

    // First sight of the light renders its shadow map
    run_frame(&mut manager, &mut backend, &lights, &[inside.clone()]);
    assert_eq!(backend.cube_render_count(), 1);
    assert_eq!(backend.store_pass_layers(), vec![0]);
    assert_eq!(
        backend.count(|call| matches!(call, BackendCall::CopyPass(_))),
        6
    );

    // Nothing changed: the cached map is kept
    run_frame(&mut manager, &mut backend, &lights, &[inside.clone()]);
    assert_eq!(backend.cube_render_count(), 1);

    // An edited caster inside the volume forces a re-render
    let mut edited = inside.clone();
    edited.changed = true;
    run_frame(&mut manager, &mut backend, &lights, &[edited]);
    assert_eq!(backend.cube_render_count(), 2);

    // The caster leaving the volume forces one more
    let outside = caster(5, vector![100.0, 0.0, 0.0]);
    run_frame(&mut manager, &mut backend, &lights, &[outside.clone()]);
    assert_eq!(backend.cube_render_count(), 3);

    // A distant caster keeps the map cached
    run_frame(&mut manager, &mut backend, &lights, &[outside]);
    assert_eq!(backend.cube_render_count(), 3);
}

#[test]
fn tables_upload_once_per_frame_after_all_store_passes() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();

    run_frame(
        &mut manager,
        &mut backend,
        &[sun_light(1), point_light(2)],
        &[],
    );

    assert_eq!(
        backend.count(|call| matches!(call, BackendCall::UploadTables { .. })),
        1
    );
    let upload = backend.position(|call| matches!(call, BackendCall::UploadTables { .. }));
    let last_store = backend
        .calls
        .iter()
        .rposition(|call| matches!(call, BackendCall::StorePass(_)))
        .expect("store passes were issued");
    assert!(upload > last_store);

    assert_eq!(
        backend.calls[upload],
        BackendCall::UploadTables {
            lights: 2,
            shadows: 2,
            cubes: 1,
            cascades: 1,
        }
    );

    // The sun claimed pool layers 0 to 3, the point light layer 4
    let mut layers = backend.store_pass_layers();
    layers.sort_unstable();
    assert_eq!(layers, vec![0, 1, 2, 3, 4]);
}

#[test]
fn store_pass_runs_with_the_selected_sample_count() {
    let config = ShadowMapConfig {
        resolution: 512,
        ..Default::default()
    };
    let mut manager = LightManager::new(config);
    let mut backend = RecordingBackend::default();

    let mut light = point_light(1);
    if let Some(settings) = light.shadow.as_mut() {
        settings.softness = 11.0;
    }
    run_frame(&mut manager, &mut backend, &[light], &[]);

    // An 11-unit softness on the 628-texel cube target needs a 7 texel
    // footprint: 4 + 8*4 + 4*16 concentric samples
    let store = backend.position(|call| matches!(call, BackendCall::StorePass(_)));
    let block_update = backend.calls[..store]
        .iter()
        .rposition(|call| matches!(call, BackendCall::UpdateBlock { .. }))
        .expect("the render block is updated before the store pass");
    assert_eq!(
        backend.calls[block_update],
        BackendCall::UpdateBlock { sample_count: 100 }
    );

    let BackendCall::StorePass(pass) = &backend.calls[store] else {
        unreachable!();
    };
    assert_abs_diff_eq!(pass.filter_size, 7.5 * 9.0 / 628.0, epsilon = 1e-6);
    assert_eq!(pass.source_layer, 0);
}

#[test]
fn capacity_overflow_warns_and_degrades() {
    install_warning_counter();
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();

    // More lights than the registry holds: the excess is dropped, once
    // warned about
    let before = WARNING_COUNT.load(Ordering::SeqCst);
    let unshadowed: Vec<_> = (0..200)
        .map(|id| light(id, LightKind::Point { radius: 0.1 }, None))
        .collect();
    run_frame(&mut manager, &mut backend, &unshadowed, &[]);
    assert_eq!(WARNING_COUNT.load(Ordering::SeqCst), before + 1);
    assert_eq!(manager.light_count(), MAX_LIGHT);
    assert_eq!(
        backend.calls.last(),
        Some(&BackendCall::UploadTables {
            lights: MAX_LIGHT,
            shadows: 0,
            cubes: 0,
            cascades: 0,
        })
    );

    // More cube shadows than slots: the excess keeps shading without shadow
    let before = WARNING_COUNT.load(Ordering::SeqCst);
    let shadowed: Vec<_> = (0..MAX_SHADOW_CUBE as u64 + 3).map(point_light).collect();
    run_frame(&mut manager, &mut backend, &shadowed, &[]);
    assert_eq!(WARNING_COUNT.load(Ordering::SeqCst), before + 1);
    assert_eq!(manager.light_count(), MAX_SHADOW_CUBE + 3);
    assert_eq!(manager.cube_uniforms().len(), MAX_SHADOW_CUBE);
    assert_eq!(
        manager.shadow_slot(LightId::new(MAX_SHADOW_CUBE as u64)),
        Some(&ShadowSlot::None)
    );

    // More suns than cascade slots
    let before = WARNING_COUNT.load(Ordering::SeqCst);
    let suns: Vec<_> = (0..MAX_SHADOW_CASCADE as u64 + 1).map(sun_light).collect();
    run_frame(&mut manager, &mut backend, &suns, &[]);
    assert_eq!(WARNING_COUNT.load(Ordering::SeqCst), before + 1);
    assert_eq!(manager.cascade_uniforms().len(), MAX_SHADOW_CASCADE);
    assert_eq!(
        manager.layer_count(),
        (MAX_SHADOW_CASCADE * MAX_CASCADE_COUNT) as u32
    );
}

#[test]
fn shadow_parameters_reference_the_assigned_slots() {
    let mut manager = LightManager::new(ShadowMapConfig::default());
    let mut backend = RecordingBackend::default();

    run_frame(
        &mut manager,
        &mut backend,
        &[point_light(1), sun_light(2)],
        &[],
    );

    let lights = manager.light_uniforms();
    assert_eq!(lights.len(), 2);
    assert_eq!(lights[0].shadow_id(), 0.0);
    assert_eq!(lights[1].shadow_id(), 1.0);

    let shadows = manager.shadow_uniforms();
    // The cube light stores into pool layer 0 and cube record 0
    assert_eq!(shadows[0].shadow_start(), 0.0);
    assert_eq!(shadows[0].data_start(), 0.0);
    // The sun starts at layer 1 and cascade record 0
    assert_eq!(shadows[1].shadow_start(), 1.0);
    assert_eq!(shadows[1].data_start(), 0.0);

    let cascades = manager.cascade_uniforms();
    assert_eq!(cascades.len(), 1);
    let splits = cascades[0].split_end();
    // The cascades stop at the camera far plane; view space z is negative
    // ahead of the camera
    assert_abs_diff_eq!(splits[3], -60.0, epsilon = 1e-2);
}
