// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Call boundary to the host's native EGL/GLES driver.
//!
//! The drivers this backend targets are not thread safe, so every native
//! call, whether issued by a render-control handler or by an external GLES
//! decoder, goes through [`Driver`], which serializes under one global
//! lock. Per-context workers get logical concurrency only.

use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error as ThisError;

#[derive(Debug, ThisError)]
pub enum DriverError {
    #[error("EGL call failed with {0:#x}")]
    Egl(u32),
    #[error("no EGL config matches the request")]
    NoConfig,
    #[error("requested GLES version unavailable")]
    VersionUnavailable,
    #[error("operation not supported by this driver")]
    Unsupported,
}

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeContext(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSurface(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeImage(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeSync(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlesApi {
    Es1,
    Es2,
    Es3,
}

/// The native EGL/GLES operations the backend needs. Implemented over the
/// real host driver in production and by fakes/mocks in tests.
///
/// Implementations are not required to be thread safe; [`Driver`] provides
/// the serialization.
#[cfg_attr(test, mockall::automock)]
pub trait EglDriver: Send {
    /// Sets up the display and configs; returns the EGL (major, minor)
    /// version.
    fn initialize(&self) -> DriverResult<(u32, u32)>;
    fn create_context(
        &self,
        api: GlesApi,
        share: Option<NativeContext>,
    ) -> DriverResult<NativeContext>;
    fn destroy_context(&self, ctx: NativeContext) -> DriverResult<()>;
    fn create_window_surface(&self, width: u32, height: u32) -> DriverResult<NativeSurface>;
    fn destroy_surface(&self, surface: NativeSurface) -> DriverResult<()>;
    fn make_current(
        &self,
        ctx: Option<NativeContext>,
        draw: Option<NativeSurface>,
        read: Option<NativeSurface>,
    ) -> DriverResult<()>;
    fn flush_surface(&self, surface: NativeSurface) -> DriverResult<()>;
    fn create_image(&self, ctx: NativeContext, texture: u32) -> DriverResult<NativeImage>;
    fn destroy_image(&self, image: NativeImage) -> DriverResult<()>;
    fn create_sync(&self) -> DriverResult<NativeSync>;
    fn destroy_sync(&self, sync: NativeSync) -> DriverResult<()>;
    /// Returns the EGL client-wait status word.
    fn client_wait_sync(&self, sync: NativeSync, flags: u32, timeout_ns: u64) -> DriverResult<u32>;
    fn create_texture(&self, width: u32, height: u32, format: u32) -> DriverResult<u32>;
    fn upload_texture(
        &self,
        texture: u32,
        width: u32,
        height: u32,
        format: u32,
        data: &[u8],
    ) -> DriverResult<()>;
    fn delete_texture(&self, texture: u32) -> DriverResult<()>;
    fn gl_string(&self, name: u32) -> DriverResult<String>;
}

/// Serializing handle to the native driver. Cheap to clone; all clones share
/// the one lock.
#[derive(Clone)]
pub struct Driver {
    inner: Arc<Mutex<Box<dyn EglDriver>>>,
}

impl Driver {
    pub fn new(driver: Box<dyn EglDriver>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(driver)),
        }
    }

    /// Takes the global driver lock for the duration of `f`. Used to bracket
    /// calls into external decoders, which issue their own native calls.
    pub fn serialized<T>(&self, f: impl FnOnce(&dyn EglDriver) -> T) -> T {
        let guard = self.lock();
        f(&**guard)
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn EglDriver>> {
        self.inner.lock().unwrap()
    }

    pub fn initialize(&self) -> DriverResult<(u32, u32)> {
        self.lock().initialize()
    }

    pub fn create_context(
        &self,
        api: GlesApi,
        share: Option<NativeContext>,
    ) -> DriverResult<NativeContext> {
        self.lock().create_context(api, share)
    }

    pub fn destroy_context(&self, ctx: NativeContext) -> DriverResult<()> {
        self.lock().destroy_context(ctx)
    }

    pub fn create_window_surface(&self, width: u32, height: u32) -> DriverResult<NativeSurface> {
        self.lock().create_window_surface(width, height)
    }

    pub fn destroy_surface(&self, surface: NativeSurface) -> DriverResult<()> {
        self.lock().destroy_surface(surface)
    }

    pub fn make_current(
        &self,
        ctx: Option<NativeContext>,
        draw: Option<NativeSurface>,
        read: Option<NativeSurface>,
    ) -> DriverResult<()> {
        self.lock().make_current(ctx, draw, read)
    }

    pub fn flush_surface(&self, surface: NativeSurface) -> DriverResult<()> {
        self.lock().flush_surface(surface)
    }

    pub fn create_image(&self, ctx: NativeContext, texture: u32) -> DriverResult<NativeImage> {
        self.lock().create_image(ctx, texture)
    }

    pub fn destroy_image(&self, image: NativeImage) -> DriverResult<()> {
        self.lock().destroy_image(image)
    }

    pub fn create_sync(&self) -> DriverResult<NativeSync> {
        self.lock().create_sync()
    }

    pub fn destroy_sync(&self, sync: NativeSync) -> DriverResult<()> {
        self.lock().destroy_sync(sync)
    }

    pub fn client_wait_sync(
        &self,
        sync: NativeSync,
        flags: u32,
        timeout_ns: u64,
    ) -> DriverResult<u32> {
        self.lock().client_wait_sync(sync, flags, timeout_ns)
    }

    pub fn create_texture(&self, width: u32, height: u32, format: u32) -> DriverResult<u32> {
        self.lock().create_texture(width, height, format)
    }

    pub fn upload_texture(
        &self,
        texture: u32,
        width: u32,
        height: u32,
        format: u32,
        data: &[u8],
    ) -> DriverResult<()> {
        self.lock()
            .upload_texture(texture, width, height, format, data)
    }

    pub fn delete_texture(&self, texture: u32) -> DriverResult<()> {
        self.lock().delete_texture(texture)
    }

    pub fn gl_string(&self, name: u32) -> DriverResult<String> {
        self.lock().gl_string(name)
    }
}
