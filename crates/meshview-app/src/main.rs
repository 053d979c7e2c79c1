// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use meshview_core::init_tracing;
use meshview_platform::WinitSurface;
use meshview_render::{PolygonSet, Scale, SurfaceRenderer, Triangulation};
use meshview_render_vk::{Instance, InstanceConfig, RendererConfig, SettingsPreset, VkBackend};
use tracing::{error, info};

use meshview_platform::winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    raw_window_handle::HasDisplayHandle,
    window::{Window, WindowId},
};

mod config;
mod demo;

use config::{load_cfg, AppCfg};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scene and renderer settings
    #[arg(long, default_value = "meshview.toml")]
    config: PathBuf,
    /// Device pixels per canvas unit; defaults to the window's scale factor
    #[arg(long)]
    scale: Option<f64>,
}

type WindowRenderer = SurfaceRenderer<VkBackend, WinitSurface>;

struct App {
    cfg: AppCfg,
    scale: Option<f64>,
    polygons: PolygonSet,
    triangulation: Triangulation,

    // renderer before window, window before instance
    renderer: Option<WindowRenderer>,
    window: Option<Arc<Window>>,
    instance: Option<Arc<Instance>>,

    exiting: bool,
    last_fps_instant: std::time::Instant,
    last_frames: u64,
}

impl App {
    fn instance_config(&self) -> InstanceConfig {
        let mut ic = InstanceConfig::from_env();
        if std::env::var_os("MESHVIEW_VALIDATION").is_none() {
            if let Some(v) = self.cfg.render.validation {
                ic.validation = v;
            }
        }
        ic
    }

    fn start(&mut self, event_loop: &ActiveEventLoop) -> Result<()> {
        let window = Arc::new(
            event_loop.create_window(Window::default_attributes().with_title("meshview"))?,
        );
        let display = window.display_handle()?.as_raw();
        let instance = Instance::init(display, &self.instance_config())?;

        let config = RendererConfig {
            clear_color: self.cfg.render.clear_color,
            preset: SettingsPreset {
                min_image_count: self.cfg.render.min_image_count,
                ..Default::default()
            },
        };
        let backend = VkBackend::new(Arc::clone(&instance), config);
        self.renderer = Some(SurfaceRenderer::new(
            backend,
            WinitSurface::new(Arc::clone(&window)),
        ));
        window.request_redraw();
        self.window = Some(window);
        self.instance = Some(instance);
        Ok(())
    }

    // STRICT ORDER (shutdown): renderer, window, then the instance
    fn shutdown(&mut self) {
        self.exiting = true;
        if let Some(r) = &self.renderer {
            let s = r.stats();
            info!(
                "shutdown after {} frame(s), {} context(s), {} swapchain(s)",
                s.frames, s.contexts, s.swapchains
            );
        }
        self.renderer = None;
        self.window = None;
        if let Some(instance) = self.instance.take() {
            Instance::shutdown(instance);
        }
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            if let Err(e) = self.start(event_loop) {
                error!("startup failed: {e:#}");
                self.shutdown();
                event_loop.exit();
                return;
            }
            info!(
                "scene: {} loop(s), {} triangle(s)",
                self.polygons.polygons.len(),
                self.triangulation.triangles.len()
            );
        }
        event_loop.set_control_flow(ControlFlow::Wait);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(new_size) => {
                info!("Resized → {}x{}", new_size.width, new_size.height);
                if let Some(w) = &self.window {
                    w.request_redraw();
                }
            }

            WindowEvent::RedrawRequested => {
                if self.exiting {
                    return;
                }
                let Some(window) = &self.window else {
                    return;
                };
                let scale = Scale::uniform(self.scale.unwrap_or_else(|| window.scale_factor()));
                if let Some(renderer) = &mut self.renderer {
                    if let Err(e) =
                        renderer.render(&self.polygons, Some(&self.triangulation), scale)
                    {
                        error!("render error: {e:#}");
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.exiting || !self.cfg.render.continuous {
            return;
        }
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = std::time::Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            let frames = self.renderer.as_ref().map_or(0, |r| r.stats().frames);
            info!("fps ~ {}", frames - self.last_frames);
            self.last_frames = frames;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let cfg = load_cfg(&args.config);
    let polygons = demo::polygon_set(&cfg.scene.polygons);
    let triangulation = demo::fan_triangulation(&polygons);

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let mut app = App {
        cfg,
        scale: args.scale,
        polygons,
        triangulation,
        renderer: None,
        window: None,
        instance: None,
        exiting: false,
        last_fps_instant: std::time::Instant::now(),
        last_frames: 0,
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}
