//! Instanced grid demo.
//!
//! Draws a grid of spinning quads and cubes, every one of them an entity in a
//! bevy_ecs `World`, with a single indirect draw per frame.
//!
//! # Usage
//!
//! ```bash
//! # Compile the shaders first
//! glslc shaders/instanced.vert -o shaders/instanced.vert.spv
//! glslc shaders/instanced.frag -o shaders/instanced.frag.spv
//!
//! cargo run --example instanced_grid -- --backend vulkan --grid 40
//!
//! # No GPU: runs the frame loop against the dummy backend
//! cargo run --example instanced_grid -- --backend dummy --max-frames 100
//! ```

use std::time::Instant;

use bevy_ecs::prelude::*;
use clap::Parser;
use glam::{Vec3, Vec4};

use indirect_renderer::scene::{queue_instances, Camera, MeshInstance, Projection, Transform};
use indirect_renderer::window::{self, Window};
use indirect_renderer::{
    BackendType, FrameStatus, Mesh, PresentPolicy, Renderer, RendererConfig, RendererError,
    RendererResult,
};

/// Backend selection for the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Native Vulkan via ash.
    #[default]
    Vulkan,
    /// No GPU work at all; frames complete immediately.
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "instanced_grid", about = "Mesh-batched indirect drawing demo")]
struct Args {
    /// Graphics backend
    #[arg(long, value_enum, default_value_t = CliBackend::Vulkan)]
    backend: CliBackend,

    /// Entities per grid side
    #[arg(long, default_value_t = 32)]
    grid: u32,

    /// Frames the CPU may run ahead of the GPU
    #[arg(long, default_value_t = 2)]
    frames_in_flight: usize,

    /// Prefer mailbox/immediate presentation over vsync
    #[arg(long)]
    low_latency: bool,

    /// Exit after this many presented frames
    #[arg(long)]
    max_frames: Option<u64>,

    #[arg(long, default_value_t = 1280)]
    width: u32,

    #[arg(long, default_value_t = 720)]
    height: u32,
}

impl Args {
    fn config(&self) -> RendererConfig {
        let policy = if self.low_latency {
            PresentPolicy::LowLatency
        } else {
            PresentPolicy::Vsync
        };
        let instances = (self.grid as usize * self.grid as usize).max(1);
        RendererConfig::default()
            .with_title("Instanced Grid")
            .with_size(self.width, self.height)
            .with_backend(self.backend.into())
            .with_present_policy(policy)
            .with_frames_in_flight(self.frames_in_flight)
            .with_clear_color([0.05, 0.05, 0.08, 1.0])
            .with_capacities(16, instances, 16)
    }
}

/// Spin speed in radians per second.
#[derive(Component)]
struct Spin(f32);

struct Demo {
    renderer: Renderer,
    world: World,
    camera: Camera,
    last_frame: Instant,
    max_frames: Option<u64>,
}

impl Demo {
    fn new(window: &Window, config: &RendererConfig, grid: u32) -> RendererResult<Self> {
        let mut renderer = Renderer::new(window, config)?;
        let quad = renderer.upload_mesh(&Mesh::quad())?;
        let cube = renderer.upload_mesh(&Mesh::cube())?;

        let mut world = World::new();
        let half = grid as f32 / 2.0;
        for x in 0..grid {
            for z in 0..grid {
                let mesh = if (x + z) % 2 == 0 { cube } else { quad };
                let color = Vec4::new(x as f32 / grid as f32, 0.5, z as f32 / grid as f32, 1.0);
                let position = Vec3::new(x as f32 - half, 0.0, z as f32 - half) * 2.5;
                world.spawn((
                    Transform::from_position_scale(position, Vec3::splat(0.8)),
                    MeshInstance::new(mesh).with_color(color),
                    Spin(0.5 + (x * 7 + z * 13) as f32 % 10.0 * 0.2),
                ));
            }
        }
        log::info!("Spawned {} entities", grid * grid);

        let (width, height) = window.dimensions();
        let camera = Camera::new(Vec3::new(0.0, half * 2.5, half * 3.5), Vec3::ZERO).with_projection(
            Projection::perspective(60.0, width as f32 / height.max(1) as f32, 0.1, 500.0),
        );

        Ok(Self {
            renderer,
            world,
            camera,
            last_frame: Instant::now(),
            max_frames: None,
        })
    }

    fn frame(&mut self, window: &mut Window) -> RendererResult<()> {
        if window.was_resized() {
            let (width, height) = window.dimensions();
            self.renderer.resize(width, height);
            if height > 0 {
                self.camera
                    .projection
                    .set_aspect(width as f32 / height as f32);
            }
            window.clear_resize_flag();
        }

        let now = Instant::now();
        let dt = (now - self.last_frame).as_secs_f32();
        self.last_frame = now;

        let mut query = self.world.query::<(&mut Transform, &Spin)>();
        for (mut transform, spin) in query.iter_mut(&mut self.world) {
            transform.rotate_axis(Vec3::Y, spin.0 * dt);
        }

        let frame = match self.renderer.begin_frame()? {
            FrameStatus::Ready(frame) => frame,
            FrameStatus::Skipped => return Ok(()),
        };
        self.renderer.set_camera(self.camera.uniform());
        match queue_instances(&mut self.world, &mut self.renderer) {
            Ok(_) => {}
            Err(e @ RendererError::CapacityExceeded { .. }) => {
                log::warn!("Dropping frame: {}", e);
                return self.renderer.abandon_frame(frame);
            }
            Err(e) => return Err(e),
        }
        self.renderer.draw(&frame)?;
        self.renderer.end_frame(frame)?;

        let stats = self.renderer.stats();
        if stats.frames_presented % 600 == 0 {
            log::info!(
                "{} frames, {} instances in {} draws, {} recreations",
                stats.frames_presented,
                stats.last_instance_count,
                stats.last_batch_count,
                stats.recreations
            );
        }
        Ok(())
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    let config = args.config();
    log::info!("indirect-renderer {}", indirect_renderer::VERSION);

    let mut demo: Option<Demo> = None;
    let grid = args.grid;
    let max_frames = args.max_frames;
    let loop_config = config.clone();

    let result = window::run(&config, move |window| {
        if demo.is_none() {
            let mut created = Demo::new(window, &loop_config, grid)?;
            created.max_frames = max_frames;
            demo = Some(created);
        }
        let Some(demo) = demo.as_mut() else {
            return Ok(());
        };
        demo.frame(window)?;

        if let Some(max) = demo.max_frames {
            if demo.renderer.stats().frames_presented >= max {
                log::info!("Presented {} frames, exiting", max);
                demo.renderer.wait_idle()?;
                window.request_close();
            }
        }
        Ok(())
    });

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
