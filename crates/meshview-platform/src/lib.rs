// SPDX-License-Identifier: CEPL-1.0
//! winit as a surface host.
//!
//! A winit window has no lock of its own, so [`WinitSurface`] emulates the
//! host protocol: it reports `SURFACE_CHANGED` the first time and whenever
//! the native handles differ from the previous lock.
use std::sync::Arc;

use meshview_render::{
    HostSurface, LockFlags, NativeWindow, SurfaceBounds, SurfaceError, SurfaceInfo,
};
use raw_window_handle::{HandleError, HasDisplayHandle, HasWindowHandle};
use tracing::debug;
use winit::dpi::PhysicalSize;
use winit::window::Window;

pub use winit;

fn handle_error(e: HandleError) -> SurfaceError {
    match e {
        HandleError::Unavailable => SurfaceError::Unavailable,
        other => SurfaceError::Lock(other.to_string()),
    }
}

/// Raw handles of anything that exposes both.
pub fn native_window<W>(w: &W) -> Result<NativeWindow, SurfaceError>
where
    W: HasWindowHandle + HasDisplayHandle + ?Sized,
{
    Ok(NativeWindow {
        display: w.display_handle().map_err(handle_error)?.as_raw(),
        window: w.window_handle().map_err(handle_error)?.as_raw(),
    })
}

/// Drawing area of a window: its whole client area.
pub fn client_bounds(size: PhysicalSize<u32>) -> SurfaceBounds {
    let clamp = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
    SurfaceBounds::new(0, 0, clamp(size.width), clamp(size.height))
}

/// Tracks native handle identity across locks.
#[derive(Debug, Default)]
struct Identity {
    last: Option<NativeWindow>,
}

impl Identity {
    fn observe(&mut self, native: NativeWindow) -> LockFlags {
        if self.last == Some(native) {
            LockFlags::empty()
        } else {
            self.last = Some(native);
            LockFlags::SURFACE_CHANGED
        }
    }
}

pub struct WinitSurface {
    window: Arc<Window>,
    identity: Identity,
    locked: bool,
}

impl WinitSurface {
    pub fn new(window: Arc<Window>) -> Self {
        Self {
            window,
            identity: Identity::default(),
            locked: false,
        }
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }
}

impl HostSurface for WinitSurface {
    type Native = NativeWindow;

    fn lock(&mut self) -> Result<SurfaceInfo<NativeWindow>, SurfaceError> {
        if self.locked {
            return Err(SurfaceError::Lock("surface is already locked".to_owned()));
        }
        let native = native_window(self.window.as_ref())?;
        let flags = self.identity.observe(native);
        if flags.contains(LockFlags::SURFACE_CHANGED) {
            debug!("window handles changed");
        }
        self.locked = true;
        Ok(SurfaceInfo {
            native,
            flags,
            bounds: client_bounds(self.window.inner_size()),
        })
    }

    fn unlock(&mut self) {
        self.locked = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raw_window_handle::{RawDisplayHandle, RawWindowHandle, WebDisplayHandle, WebWindowHandle};

    fn web(id: u32) -> NativeWindow {
        NativeWindow {
            display: RawDisplayHandle::Web(WebDisplayHandle::new()),
            window: RawWindowHandle::Web(WebWindowHandle::new(id)),
        }
    }

    #[test]
    fn first_lock_reports_a_new_surface() {
        let mut id = Identity::default();
        assert_eq!(id.observe(web(1)), LockFlags::SURFACE_CHANGED);
        assert_eq!(id.observe(web(1)), LockFlags::empty());
    }

    #[test]
    fn new_handles_report_a_new_surface() {
        let mut id = Identity::default();
        id.observe(web(1));
        assert_eq!(id.observe(web(2)), LockFlags::SURFACE_CHANGED);
        assert_eq!(id.observe(web(2)), LockFlags::empty());
    }

    #[test]
    fn bounds_cover_the_client_area() {
        let b = client_bounds(PhysicalSize::new(1280, 720));
        assert_eq!(b, SurfaceBounds::new(0, 0, 1280, 720));
        let huge = client_bounds(PhysicalSize::new(u32::MAX, 0));
        assert_eq!(huge.width, i32::MAX);
        assert_eq!(huge.height, 0);
    }

    #[test]
    fn unavailable_handles_map_to_unavailable() {
        assert!(matches!(
            handle_error(HandleError::Unavailable),
            SurfaceError::Unavailable
        ));
    }
}
