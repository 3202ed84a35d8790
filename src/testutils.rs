// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Shared helpers for unit tests: a fake EGL driver, fake guest memory, and
//! prebuilt renderer instances.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use libc::c_void;

use crate::driver::{
    Driver, DriverError, DriverResult, EglDriver, GlesApi, NativeContext, NativeImage,
    NativeSurface, NativeSync,
};
use crate::gpu_types::{GpuIovec, ResourceCreateArgs};
use crate::render_control::GlesDecoder;
use crate::{Callbacks, FenceHandler, RendererFlags, VirglRenderer, VirglResult, CALLBACKS_VERSION};

/// Observable state of [`FakeEglDriver`], shared with the test body.
#[derive(Default)]
pub struct FakeState {
    next_handle: AtomicU64,
    pub fail_make_current: AtomicBool,
    pub es3_unavailable: AtomicBool,
    pub texture_unsupported: AtomicBool,
    pub make_current_calls: Mutex<Vec<(Option<u64>, Option<u64>, Option<u64>)>>,
    pub destroyed_contexts: Mutex<Vec<u64>>,
    pub destroyed_surfaces: Mutex<Vec<u64>>,
    pub destroyed_images: Mutex<Vec<u64>>,
    pub destroyed_syncs: Mutex<Vec<u64>>,
    pub destroyed_textures: Mutex<Vec<u32>>,
}

impl FakeState {
    fn fresh(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// In-process stand-in for the host EGL/GLES driver. Hands out fresh
/// handles and records destruction; failure switches let tests exercise the
/// error paths.
pub struct FakeEglDriver(pub Arc<FakeState>);

impl EglDriver for FakeEglDriver {
    fn initialize(&self) -> DriverResult<(u32, u32)> {
        Ok((1, 5))
    }

    fn create_context(
        &self,
        api: GlesApi,
        _share: Option<NativeContext>,
    ) -> DriverResult<NativeContext> {
        if api == GlesApi::Es3 && self.0.es3_unavailable.load(Ordering::Relaxed) {
            return Err(DriverError::VersionUnavailable);
        }
        Ok(NativeContext(self.0.fresh()))
    }

    fn destroy_context(&self, ctx: NativeContext) -> DriverResult<()> {
        self.0.destroyed_contexts.lock().unwrap().push(ctx.0);
        Ok(())
    }

    fn create_window_surface(&self, _width: u32, _height: u32) -> DriverResult<NativeSurface> {
        Ok(NativeSurface(self.0.fresh()))
    }

    fn destroy_surface(&self, surface: NativeSurface) -> DriverResult<()> {
        self.0.destroyed_surfaces.lock().unwrap().push(surface.0);
        Ok(())
    }

    fn make_current(
        &self,
        ctx: Option<NativeContext>,
        draw: Option<NativeSurface>,
        read: Option<NativeSurface>,
    ) -> DriverResult<()> {
        self.0.make_current_calls.lock().unwrap().push((
            ctx.map(|c| c.0),
            draw.map(|s| s.0),
            read.map(|s| s.0),
        ));
        if self.0.fail_make_current.load(Ordering::Relaxed) {
            return Err(DriverError::Egl(0x3006));
        }
        Ok(())
    }

    fn flush_surface(&self, _surface: NativeSurface) -> DriverResult<()> {
        Ok(())
    }

    fn create_image(&self, _ctx: NativeContext, _texture: u32) -> DriverResult<NativeImage> {
        Ok(NativeImage(self.0.fresh()))
    }

    fn destroy_image(&self, image: NativeImage) -> DriverResult<()> {
        self.0.destroyed_images.lock().unwrap().push(image.0);
        Ok(())
    }

    fn create_sync(&self) -> DriverResult<NativeSync> {
        Ok(NativeSync(self.0.fresh()))
    }

    fn destroy_sync(&self, sync: NativeSync) -> DriverResult<()> {
        self.0.destroyed_syncs.lock().unwrap().push(sync.0);
        Ok(())
    }

    fn client_wait_sync(&self, _sync: NativeSync, _flags: u32, _timeout_ns: u64) -> DriverResult<u32> {
        // EGL_CONDITION_SATISFIED_KHR
        Ok(0x30F6)
    }

    fn create_texture(&self, _width: u32, _height: u32, _format: u32) -> DriverResult<u32> {
        if self.0.texture_unsupported.load(Ordering::Relaxed) {
            return Err(DriverError::Unsupported);
        }
        Ok(self.0.fresh() as u32)
    }

    fn upload_texture(
        &self,
        _texture: u32,
        _width: u32,
        _height: u32,
        _format: u32,
        _data: &[u8],
    ) -> DriverResult<()> {
        Ok(())
    }

    fn delete_texture(&self, texture: u32) -> DriverResult<()> {
        self.0.destroyed_textures.lock().unwrap().push(texture);
        Ok(())
    }

    fn gl_string(&self, _name: u32) -> DriverResult<String> {
        Ok("OpenGL ES 3.0 fake".into())
    }
}

/// Honors `RUST_LOG` for test runs. Safe to call from every fixture; only
/// the first call installs the logger.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn fake_driver() -> Driver {
    init_logging();
    Driver::new(Box::new(FakeEglDriver(Arc::default())))
}

/// Fence handler that appends every completed fence to a shared vector.
pub struct FenceRecorder(pub Arc<Mutex<Vec<u32>>>);

impl FenceHandler for FenceRecorder {
    fn write_fence(&self, fence_id: u32) {
        self.0.lock().unwrap().push(fence_id);
    }
}

pub fn recording_callbacks() -> (Callbacks, Arc<Mutex<Vec<u32>>>) {
    let fences = Arc::new(Mutex::new(Vec::new()));
    (
        Callbacks {
            version: CALLBACKS_VERSION,
            handler: Box::new(FenceRecorder(Arc::clone(&fences))),
        },
        fences,
    )
}

/// Decoder owning the opcode range 20000..30000 that only records what it
/// saw, in order.
pub struct RecordingDecoder(pub Arc<Mutex<Vec<(u32, u32)>>>);

impl GlesDecoder for RecordingDecoder {
    fn handles(&self, opcode: u32) -> bool {
        (20000..30000).contains(&opcode)
    }

    fn decode(
        &self,
        ctx_handle: u32,
        opcode: u32,
        _payload: &[u8],
        _response: &mut Vec<u8>,
    ) -> VirglResult<()> {
        self.0.lock().unwrap().push((ctx_handle, opcode));
        Ok(())
    }
}

/// Renderer over the fake driver plus a recording decoder, with handles to
/// everything a test wants to observe.
pub struct TestRenderer {
    pub renderer: VirglRenderer,
    pub fences: Arc<Mutex<Vec<u32>>>,
    pub fake: Arc<FakeState>,
    /// `(ctx_handle, opcode)` pairs seen by the recording decoder.
    pub decoded: Arc<Mutex<Vec<(u32, u32)>>>,
}

pub fn test_renderer() -> TestRenderer {
    init_logging();
    let fake = Arc::new(FakeState::default());
    let (callbacks, fences) = recording_callbacks();
    let decoded = Arc::new(Mutex::new(Vec::new()));
    let renderer = VirglRenderer::init(
        RendererFlags::empty(),
        callbacks,
        Box::new(FakeEglDriver(Arc::clone(&fake))),
        vec![Box::new(RecordingDecoder(Arc::clone(&decoded)))],
    )
    .unwrap();
    TestRenderer {
        renderer,
        fences,
        fake,
        decoded,
    }
}

/// Owned guest memory spans the tests can alias through iovecs. Writes go
/// through raw pointers so the aliasing with [`GpuIovec`] stays sound.
pub struct GuestMem {
    spans: Vec<Box<[u8]>>,
}

impl GuestMem {
    pub fn new(sizes: &[usize]) -> Self {
        Self {
            spans: sizes.iter().map(|s| vec![0u8; *s].into_boxed_slice()).collect(),
        }
    }

    pub fn iovs(&self) -> Vec<GpuIovec> {
        self.spans
            .iter()
            .map(|span| GpuIovec {
                base: span.as_ptr().cast_mut().cast::<c_void>(),
                len: span.len(),
            })
            .collect()
    }

    pub fn write_byte(&self, span: usize, idx: usize, value: u8) {
        assert!(idx < self.spans[span].len());
        // SAFETY: In bounds of an owned span.
        unsafe { self.spans[span].as_ptr().cast_mut().add(idx).write(value) }
    }

    pub fn fill(&self, span: usize, value: u8) {
        for idx in 0..self.spans[span].len() {
            self.write_byte(span, idx, value);
        }
    }

    pub fn read_byte(&self, span: usize, idx: usize) -> u8 {
        assert!(idx < self.spans[span].len());
        // SAFETY: In bounds of an owned span.
        unsafe { self.spans[span].as_ptr().add(idx).read() }
    }
}

pub fn iovs_of(mem: &GuestMem) -> Vec<GpuIovec> {
    mem.iovs()
}

pub fn args_2d(handle: u32, width: u32, height: u32, format: u32) -> ResourceCreateArgs {
    ResourceCreateArgs {
        handle,
        format,
        width,
        height,
        depth: 1,
        ..Default::default()
    }
}

/// Spins until `cond` holds or a generous deadline passes. Worker threads
/// complete fences asynchronously; tests use this instead of bare sleeps.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !cond() {
        assert!(std::time::Instant::now() < deadline, "condition never held");
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
}
