// SPDX-License-Identifier: CEPL-1.0
//! Host surface bridge.
//!
//! The host owns the native drawing surface and only lends it out between a
//! `lock` and an `unlock`. [`SurfaceLock`] scopes that pair so unlock runs
//! on every exit path, and [`ChangeTracker`] turns the host's change flags
//! plus our own bounds comparison into a [`SurfaceChange`].
use bitflags::bitflags;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use thiserror::Error;

bitflags! {
    /// Change flags reported by the host when the surface is locked.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    pub struct LockFlags: u32 {
        const SURFACE_CHANGED = 1 << 0;
        const BOUNDS_CHANGED  = 1 << 1;
    }
}

/// Integer pixel rectangle of the drawing surface, in host coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SurfaceBounds {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl SurfaceBounds {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Platform handles a GPU backend needs to create a presentable surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NativeWindow {
    pub display: RawDisplayHandle,
    pub window: RawWindowHandle,
}

/// What a successful host lock hands back.
#[derive(Clone, Debug)]
pub struct SurfaceInfo<N> {
    pub native: N,
    pub flags: LockFlags,
    pub bounds: SurfaceBounds,
}

#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("host drawing surface is not available")]
    Unavailable,
    #[error("error locking host drawing surface: {0}")]
    Lock(String),
    #[error("host drawing surface info is missing")]
    MissingInfo,
}

/// A foreign surface owner with lock/unlock semantics.
///
/// `lock` must leave the surface unlocked when it returns an error; after a
/// successful `lock` the caller guarantees exactly one `unlock`.
pub trait HostSurface {
    type Native;

    fn lock(&mut self) -> Result<SurfaceInfo<Self::Native>, SurfaceError>;
    fn unlock(&mut self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SurfaceChange {
    pub surface_changed: bool,
    pub bounds_changed: bool,
}

/// Remembers the last observed bounds so a bounds change is noticed even
/// when the host never sets `BOUNDS_CHANGED`.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    last_bounds: SurfaceBounds,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_bounds(&self) -> SurfaceBounds {
        self.last_bounds
    }

    /// Fold one lock result into a change report and record its bounds.
    /// A changed surface always implies changed bounds.
    pub fn observe(&mut self, flags: LockFlags, bounds: SurfaceBounds) -> SurfaceChange {
        let surface_changed = flags.contains(LockFlags::SURFACE_CHANGED);
        let mut bounds_changed = surface_changed || flags.contains(LockFlags::BOUNDS_CHANGED);
        if !bounds_changed && bounds != self.last_bounds {
            tracing::debug!(
                "host kept BOUNDS_CHANGED clear but bounds moved {:?} -> {:?}",
                self.last_bounds,
                bounds
            );
            bounds_changed = true;
        }
        self.last_bounds = bounds;
        SurfaceChange {
            surface_changed,
            bounds_changed,
        }
    }
}

/// Scoped host lock. Dropping it unlocks the host surface.
pub struct SurfaceLock<'a, H: HostSurface> {
    host: &'a mut H,
    info: SurfaceInfo<H::Native>,
    change: SurfaceChange,
}

impl<'a, H: HostSurface> SurfaceLock<'a, H> {
    pub fn acquire(host: &'a mut H, tracker: &mut ChangeTracker) -> Result<Self, SurfaceError> {
        let info = host.lock()?;
        let change = tracker.observe(info.flags, info.bounds);
        Ok(Self { host, info, change })
    }

    pub fn native(&self) -> &H::Native {
        &self.info.native
    }

    pub fn bounds(&self) -> SurfaceBounds {
        self.info.bounds
    }

    pub fn change(&self) -> SurfaceChange {
        self.change
    }
}

impl<H: HostSurface> Drop for SurfaceLock<'_, H> {
    fn drop(&mut self) {
        self.host.unlock();
    }
}
