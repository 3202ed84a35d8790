// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest-visible wrappers around native EGL objects.
//!
//! Contexts and surfaces carry an explicit bound-to edge and may outlive
//! their native handle while still bound; they are deleted only once
//! `disposable()` holds. Images and syncs are plain RAII wrappers.

use std::collections::BTreeMap;

use log::warn;

use crate::driver::{Driver, GlesApi, NativeContext, NativeImage, NativeSurface, NativeSync};

/// Monotonic id allocator plus storage, one per wrapper type. Ids start at 1
/// so 0 stays free as the guest's null object.
pub struct ObjectRegistry<T> {
    next_id: u32,
    map: BTreeMap<u32, T>,
}

impl<T> Default for ObjectRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: 1,
            map: BTreeMap::new(),
        }
    }
}

impl<T> ObjectRegistry<T> {
    pub fn insert(&mut self, object: T) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, object);
        id
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.map.get(&id)
    }

    pub fn get_mut(&mut self, id: u32) -> Option<&mut T> {
        self.map.get_mut(&id)
    }

    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.map.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.map.contains_key(&id)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.map.values_mut()
    }
}

/// Which end of a make-current binding a surface serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceRole {
    Draw,
    Read,
}

pub struct EglContext {
    native: Option<NativeContext>,
    pub api: GlesApi,
    bound_to: Option<u32>,
}

impl EglContext {
    pub fn new(native: NativeContext, api: GlesApi) -> Self {
        Self {
            native: Some(native),
            api,
            bound_to: None,
        }
    }

    pub fn native(&self) -> Option<NativeContext> {
        self.native
    }

    /// Binds to a guest context, returning the handle of the previous owner
    /// (if any) so the caller can release its side of the edge.
    pub fn bind(&mut self, ctx_handle: u32) -> Option<u32> {
        self.bound_to.replace(ctx_handle)
    }

    pub fn unbind(&mut self) {
        self.bound_to = None;
    }

    pub fn bound_to(&self) -> Option<u32> {
        self.bound_to
    }

    pub fn restore_binding(&mut self, binding: Option<u32>) {
        self.bound_to = binding;
    }

    /// Invalidates the native handle; the wrapper lingers while bound.
    pub fn destroy_native(&mut self, driver: &Driver) {
        if let Some(native) = self.native.take() {
            if let Err(e) = driver.destroy_context(native) {
                warn!("native context destroy failed: {e}");
            }
        }
    }

    pub fn disposable(&self) -> bool {
        self.native.is_none() && self.bound_to.is_none()
    }
}

pub struct EglSurface {
    native: Option<NativeSurface>,
    pub width: u32,
    pub height: u32,
    bound_to: Option<(u32, SurfaceRole)>,
}

impl EglSurface {
    pub fn new(native: NativeSurface, width: u32, height: u32) -> Self {
        Self {
            native: Some(native),
            width,
            height,
            bound_to: None,
        }
    }

    pub fn native(&self) -> Option<NativeSurface> {
        self.native
    }

    pub fn bind(&mut self, ctx_handle: u32, role: SurfaceRole) -> Option<(u32, SurfaceRole)> {
        self.bound_to.replace((ctx_handle, role))
    }

    pub fn unbind(&mut self) {
        self.bound_to = None;
    }

    pub fn bound_to(&self) -> Option<(u32, SurfaceRole)> {
        self.bound_to
    }

    pub fn restore_binding(&mut self, binding: Option<(u32, SurfaceRole)>) {
        self.bound_to = binding;
    }

    pub fn destroy_native(&mut self, driver: &Driver) {
        if let Some(native) = self.native.take() {
            if let Err(e) = driver.destroy_surface(native) {
                warn!("native surface destroy failed: {e}");
            }
        }
    }

    pub fn disposable(&self) -> bool {
        self.native.is_none() && self.bound_to.is_none()
    }
}

/// RAII EGLImage wrapper. Dropping it destroys the native image through the
/// serialized driver.
pub struct EglImage {
    native: NativeImage,
    driver: Driver,
}

impl EglImage {
    pub fn new(native: NativeImage, driver: Driver) -> Self {
        Self { native, driver }
    }

    pub fn native(&self) -> NativeImage {
        self.native
    }
}

impl Drop for EglImage {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_image(self.native) {
            warn!("native image destroy failed: {e}");
        }
    }
}

/// RAII EGLSync wrapper, same shape as [`EglImage`].
pub struct EglSync {
    native: NativeSync,
    driver: Driver,
}

impl EglSync {
    pub fn new(native: NativeSync, driver: Driver) -> Self {
        Self { native, driver }
    }

    pub fn native(&self) -> NativeSync {
        self.native
    }
}

impl Drop for EglSync {
    fn drop(&mut self) {
        if let Err(e) = self.driver.destroy_sync(self.native) {
            warn!("native sync destroy failed: {e}");
        }
    }
}

/// The four independent id spaces of the render-control protocol.
#[derive(Default)]
pub struct EglRegistries {
    pub contexts: ObjectRegistry<EglContext>,
    pub surfaces: ObjectRegistry<EglSurface>,
    pub images: ObjectRegistry<EglImage>,
    pub syncs: ObjectRegistry<EglSync>,
}
