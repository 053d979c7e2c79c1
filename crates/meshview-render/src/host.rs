// SPDX-License-Identifier: CEPL-1.0
//! The renderer handle exposed to hosts.
//!
//! A [`SurfaceRenderer`] pairs one host surface with one GPU backend. Each
//! `render` call locks the host surface, decides from the change report
//! whether the whole target or only its swapchain has to be rebuilt, draws,
//! and unlocks again.
use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::geometry::{PolygonSet, Triangulation};
use crate::surface::{ChangeTracker, HostSurface, SurfaceLock};
use crate::{Renderer, Scale};

/// Creates render targets for native surfaces of one windowing system.
pub trait Backend {
    type Native;
    type Target: Renderer;

    fn create_target(&self, native: &Self::Native) -> Result<Self::Target>;
}

/// Counters for what the handle rebuilt so far.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub contexts: u64,
    pub swapchains: u64,
    pub frames: u64,
}

pub struct SurfaceRenderer<B, H>
where
    B: Backend,
    H: HostSurface<Native = B::Native>,
{
    // must drop before `host`: the target presents into the host's surface
    target: Option<B::Target>,
    swapchain_pending: bool,
    clear_color: Option<[f32; 4]>,
    tracker: ChangeTracker,
    stats: RebuildStats,
    backend: B,
    host: H,
}

impl<B, H> SurfaceRenderer<B, H>
where
    B: Backend,
    H: HostSurface<Native = B::Native>,
{
    /// No GPU work happens here; the first `render` builds the target.
    pub fn new(backend: B, host: H) -> Self {
        Self {
            target: None,
            swapchain_pending: false,
            clear_color: None,
            tracker: ChangeTracker::new(),
            stats: RebuildStats::default(),
            backend,
            host,
        }
    }

    pub fn stats(&self) -> RebuildStats {
        self.stats
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear_color = Some(rgba);
        if let Some(t) = self.target.as_mut() {
            t.set_clear_color(rgba);
        }
    }

    pub fn render(
        &mut self,
        polygons: &PolygonSet,
        triangulation: Option<&Triangulation>,
        scale: Scale,
    ) -> Result<()> {
        let Self {
            target,
            swapchain_pending,
            clear_color,
            tracker,
            stats,
            backend,
            host,
        } = self;

        let lock = SurfaceLock::acquire(host, tracker).context("lock host surface")?;
        let change = lock.change();

        if change.surface_changed || target.is_none() {
            // the old target is gone completely before a new one is built
            *target = None;
            let mut fresh = backend
                .create_target(lock.native())
                .context("create render target")?;
            if let Some(rgba) = *clear_color {
                fresh.set_clear_color(rgba);
            }
            *target = Some(fresh);
            *swapchain_pending = true;
            stats.contexts += 1;
            info!("render target created for {:?}", lock.bounds());
        }
        if change.bounds_changed {
            *swapchain_pending = true;
        }

        if let Some(t) = target.as_mut() {
            if *swapchain_pending {
                debug!("rebuilding swapchain for {:?}", lock.bounds());
                let built = t.rebuild_swapchain().context("rebuild swapchain")?;
                *swapchain_pending = false;
                if built {
                    stats.swapchains += 1;
                }
            }
            t.render(polygons, triangulation, scale)?;
            stats.frames += 1;
        }
        Ok(())
    }
}

impl<B, H> Drop for SurfaceRenderer<B, H>
where
    B: Backend,
    H: HostSurface<Native = B::Native>,
{
    fn drop(&mut self) {
        self.target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::{LockFlags, SurfaceBounds, SurfaceError, SurfaceInfo};
    use anyhow::anyhow;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    struct FakeHost {
        native: u32,
        flags: LockFlags,
        bounds: SurfaceBounds,
        fail_lock: bool,
        locked: bool,
        log: Log,
    }

    impl HostSurface for FakeHost {
        type Native = u32;

        fn lock(&mut self) -> Result<SurfaceInfo<u32>, SurfaceError> {
            if self.fail_lock {
                return Err(SurfaceError::Lock("test".into()));
            }
            self.locked = true;
            self.log.borrow_mut().push("lock".into());
            Ok(SurfaceInfo {
                native: self.native,
                flags: std::mem::take(&mut self.flags),
                bounds: self.bounds,
            })
        }

        fn unlock(&mut self) {
            self.locked = false;
            self.log.borrow_mut().push("unlock".into());
        }
    }

    struct FakeTarget {
        id: u32,
        fail_render: bool,
        zero_area: Rc<Cell<bool>>,
        log: Log,
    }

    impl Renderer for FakeTarget {
        fn rebuild_swapchain(&mut self) -> Result<bool> {
            self.log.borrow_mut().push(format!("swapchain {}", self.id));
            Ok(!self.zero_area.get())
        }

        fn render(&mut self, _: &PolygonSet, _: Option<&Triangulation>, _: Scale) -> Result<()> {
            if self.fail_render {
                return Err(anyhow!("device lost"));
            }
            self.log.borrow_mut().push(format!("render {}", self.id));
            Ok(())
        }

        fn set_clear_color(&mut self, _: [f32; 4]) {}
    }

    impl Drop for FakeTarget {
        fn drop(&mut self) {
            self.log.borrow_mut().push(format!("drop {}", self.id));
        }
    }

    struct FakeBackend {
        fail_render: bool,
        zero_area: Rc<Cell<bool>>,
        log: Log,
    }

    impl Backend for FakeBackend {
        type Native = u32;
        type Target = FakeTarget;

        fn create_target(&self, native: &u32) -> Result<FakeTarget> {
            self.log.borrow_mut().push(format!("create {native}"));
            Ok(FakeTarget {
                id: *native,
                fail_render: self.fail_render,
                zero_area: self.zero_area.clone(),
                log: self.log.clone(),
            })
        }
    }

    fn setup(fail_render: bool) -> (SurfaceRenderer<FakeBackend, FakeHost>, Log) {
        let log: Log = Rc::default();
        let host = FakeHost {
            native: 1,
            flags: LockFlags::SURFACE_CHANGED,
            bounds: SurfaceBounds::new(0, 0, 640, 480),
            fail_lock: false,
            locked: false,
            log: log.clone(),
        };
        let backend = FakeBackend {
            fail_render,
            zero_area: Rc::default(),
            log: log.clone(),
        };
        (SurfaceRenderer::new(backend, host), log)
    }

    fn draw(r: &mut SurfaceRenderer<FakeBackend, FakeHost>) -> Result<()> {
        r.render(&PolygonSet::default(), None, Scale::ONE)
    }

    #[test]
    fn first_render_builds_everything() {
        let (mut r, log) = setup(false);
        draw(&mut r).unwrap();
        assert_eq!(
            r.stats(),
            RebuildStats {
                contexts: 1,
                swapchains: 1,
                frames: 1
            }
        );
        assert_eq!(
            *log.borrow(),
            ["lock", "create 1", "swapchain 1", "render 1", "unlock"]
        );
    }

    #[test]
    fn steady_state_rebuilds_nothing() {
        let (mut r, _log) = setup(false);
        draw(&mut r).unwrap();
        let before = r.stats();
        draw(&mut r).unwrap();
        draw(&mut r).unwrap();
        let after = r.stats();
        assert_eq!(after.contexts, before.contexts);
        assert_eq!(after.swapchains, before.swapchains);
        assert_eq!(after.frames, 3);
    }

    #[test]
    fn resize_rebuilds_only_the_swapchain() {
        let (mut r, _log) = setup(false);
        draw(&mut r).unwrap();
        let before = r.stats();

        // host keeps the flags clear, only the bounds move
        r.host.bounds = SurfaceBounds::new(0, 0, 1024, 768);
        draw(&mut r).unwrap();

        let after = r.stats();
        assert_eq!(after.swapchains - before.swapchains, 1);
        assert_eq!(after.contexts - before.contexts, 0);
    }

    #[test]
    fn paused_rebuild_is_not_counted() {
        let (mut r, log) = setup(false);
        draw(&mut r).unwrap();
        let before = r.stats();

        r.backend.zero_area.set(true);
        r.host.bounds = SurfaceBounds::new(0, 0, 0, 0);
        draw(&mut r).unwrap();
        assert_eq!(r.stats().swapchains, before.swapchains);
        assert!(log.borrow().contains(&"swapchain 1".to_owned()));

        r.backend.zero_area.set(false);
        r.host.bounds = SurfaceBounds::new(0, 0, 800, 600);
        draw(&mut r).unwrap();
        assert_eq!(r.stats().swapchains, before.swapchains + 1);
        assert_eq!(r.stats().contexts, 1);
    }

    #[test]
    fn surface_change_replaces_target_in_order() {
        let (mut r, log) = setup(false);
        draw(&mut r).unwrap();
        log.borrow_mut().clear();

        r.host.native = 2;
        r.host.flags = LockFlags::SURFACE_CHANGED;
        draw(&mut r).unwrap();

        assert_eq!(
            *log.borrow(),
            ["lock", "drop 1", "create 2", "swapchain 2", "render 2", "unlock"]
        );
        assert_eq!(r.stats().contexts, 2);
    }

    #[test]
    fn failing_render_still_unlocks() {
        let (mut r, _log) = setup(true);
        assert!(draw(&mut r).is_err());
        assert!(!r.host.locked);
    }

    #[test]
    fn lock_failure_propagates_without_target() {
        let (mut r, log) = setup(false);
        r.host.fail_lock = true;
        let err = draw(&mut r).unwrap_err();
        assert!(err.downcast_ref::<SurfaceError>().is_some());
        assert!(log.borrow().is_empty());
        assert_eq!(r.stats(), RebuildStats::default());
    }

    #[test]
    fn drop_releases_target_before_host() {
        let (mut r, log) = setup(false);
        draw(&mut r).unwrap();
        log.borrow_mut().clear();
        drop(r);
        assert_eq!(*log.borrow(), ["drop 1"]);
    }
}
