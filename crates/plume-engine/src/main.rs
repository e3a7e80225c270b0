//! # Plume
//!
//! Headless driver for the Plume simulation engine.
//!
//! Simulates a single smoke emitter on the software host and logs what the
//! scene does each second of simulated time. Configuration is read from
//! `plume.toml` in the working directory when present.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use anyhow::Result;
use glam::{UVec3, Vec3};
use plume_engine::{
    Context, EngineConfig, FrameTask, GridKey, GridSnapshot, LightEnvironment, Properties, SceneLight, SubstepClock,
};
use plume_kernel::{EmitParams, GridTextureChannel, ShapeDesc, SoftwareHost, SoftwareHostDesc};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const FRAMES: u64 = 240;
const FRAME_TIME: f32 = 1.0 / 60.0;
const GRID: GridKey = GridKey(1);

/// Main entry point.
fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("plume=info".parse()?))
        .init();

    info!("Plume starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(EngineConfig::load());
    let host = SoftwareHost::new(SoftwareHostDesc {
        dedicated_queue: config.async_compute_allowed(),
        ..SoftwareHostDesc::default()
    });
    let mut context = Context::new(Arc::new(host.clone()), Arc::clone(&config));
    let handle = context.handle();
    let overlay = context.debug_info();

    let mut props = Properties::named("smoke");
    props.async_compute_enabled = true;
    props.grid_desc.virtual_dim = UVec3::splat(64);
    props.grid_desc.resident_scale = 1.0;
    props.render.volume_shadow_enabled = true;
    props.push_emitter(
        ShapeDesc::Sphere { radius: 0.15 },
        EmitParams::sphere(Vec3::new(0.0, -0.5, 0.0), 0.15),
        None,
    );
    let lights = LightEnvironment {
        lights: Vec::new(),
        default_directional: Some(SceneLight::directional(Vec3::new(0.3, -1.0, 0.2))),
    };

    let mut clock = SubstepClock::new(config.substep_size, config.max_substeps);
    for frame in 0..FRAMES {
        let schedule = clock.advance(FRAME_TIME);
        props.version = frame + 1;
        props.substep_size = schedule.substep_size;
        props.num_scheduled_substeps = schedule.num_substeps;

        handle.simulate_frame(FrameTask {
            grids: vec![GridSnapshot::new(GRID, Arc::new(props.clone()))],
            lights: lights.clone(),
        });
        handle.pre_composite();
        handle.render_grid(GRID);
        context.run_pending();

        if (frame + 1) % 60 == 0 {
            let report = context.last_frame();
            if let (Some(stats), Some(export)) = (context.scene_stats(GRID), context.grid_export(GRID)) {
                info!(
                    "Frame {}: v{} visible, {} density blocks, {} substeps run, {} skipped, {} submissions",
                    report.frame,
                    export.version(),
                    export.num_blocks(GridTextureChannel::Density),
                    stats.substeps_run,
                    stats.substeps_skipped,
                    host.submission_count()
                );
            }
            for line in overlay.latest() {
                info!("{line}");
            }
        }
    }

    handle.release_grid(GRID);
    context.run_pending();
    context.release();

    info!("Plume shutdown complete");
    Ok(())
}
