// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! A virtio-gpu rendering backend.
//!
//! The device model hands guest command streams and resource transfers to
//! [`VirglRenderer`]; the backend tracks resources, guest contexts, and EGL
//! objects, executes the embedded render-control protocol itself, routes
//! GLES streams to external decoders, and reports completion through
//! fences.

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::must_use_candidate)]

pub mod context;
pub mod driver;
pub mod egl_objects;
pub mod gpu_types;
pub mod gralloc;
pub mod protocol;
pub mod render_control;
pub mod resource;
#[cfg(test)]
pub(crate) mod testutils;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;
use log::{debug, error};
use thiserror::Error as ThisError;
use vm_memory::ByteValued;

use crate::context::Context;
use crate::driver::{Driver, DriverError, EglDriver, NativeContext};
use crate::egl_objects::EglRegistries;
use crate::gpu_types::{Box3, FenceQueue, GpuIovec, ResourceCreateArgs, ResourceInfo};
use crate::protocol::{
    renderer_caps_v1, virgl_cmd_hdr, CAPSET_RENDERER, CAPSET_RENDERER_VERSION, CMD_HDR_SIZE,
    CMD_OP_HANDSHAKE, MAX_CMD_RESP_BUF_SIZE, VIRTIO_GPU_CMD_SUBMIT_3D,
};
use crate::render_control::GlesDecoder;
use crate::resource::ResourceRegistry;

#[derive(Debug, ThisError)]
pub enum VirglError {
    #[error("renderer flags must be empty")]
    InvalidFlags,
    #[error("unsupported callbacks version {0}")]
    UnsupportedCallbacksVersion(u32),
    #[error("malformed command size")]
    InvalidCommandSize,
    #[error("invalid resource id {0}")]
    InvalidResourceId(u32),
    #[error("invalid context id {0}")]
    InvalidContextId(u32),
    #[error("invalid EGL object id {0}")]
    InvalidEglObject(u32),
    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),
    #[error("transfer geometry out of bounds")]
    OutOfBounds,
    #[error("response channel not established")]
    NoResponseChannel,
    #[error("a command is already pending on this context")]
    CommandSlotBusy,
    #[error("unknown capability set {0}")]
    InvalidCapset(u32),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u32),
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),
}

pub type VirglResult<T> = Result<T, VirglError>;

bitflags! {
    /// Init-time flags word. All bits are reserved for front ends this
    /// backend does not implement; init rejects any set bit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RendererFlags: u32 {
        const USE_EGL = 1 << 0;
        const THREAD_SYNC = 1 << 1;
        const USE_GLX = 1 << 2;
    }
}

/// Completion sink for fences drained by [`VirglRenderer::poll`].
#[cfg_attr(test, mockall::automock)]
pub trait FenceHandler: Send + Sync {
    fn write_fence(&self, fence_id: u32);
}

/// Host callbacks handed to init. Only version 1 exists.
pub struct Callbacks {
    pub version: u32,
    pub handler: Box<dyn FenceHandler>,
}

pub const CALLBACKS_VERSION: u32 = 1;

/// Shared state behind the renderer, reachable from the hypervisor thread
/// and from every context worker.
pub(crate) struct RendererState {
    pub driver: Driver,
    pub resources: Mutex<ResourceRegistry>,
    pub contexts: Mutex<BTreeMap<u32, Arc<Context>>>,
    pub egl: Mutex<EglRegistries>,
    pub fences: Mutex<FenceQueue>,
    /// Context of the most recent submit, consulted by `create_fence`. The
    /// wire protocol carries no context id on the fence path, so this stays
    /// inherently racy across contexts; the lock bounds the race to
    /// ordering.
    pub last_submit: Mutex<Option<u32>>,
    pub decoders: Vec<Box<dyn GlesDecoder>>,
    pub egl_version: (u32, u32),
    pub base_es1: NativeContext,
    pub base_es3: NativeContext,
}

pub struct VirglRenderer {
    state: Arc<RendererState>,
    callbacks: Callbacks,
}

impl VirglRenderer {
    /// Brings up the display and the two base contexts (ES1, and ES3 with
    /// an ES2 fallback) every guest context shares against.
    pub fn init(
        flags: RendererFlags,
        callbacks: Callbacks,
        driver: Box<dyn EglDriver>,
        decoders: Vec<Box<dyn GlesDecoder>>,
    ) -> VirglResult<Self> {
        if !flags.is_empty() {
            return Err(VirglError::InvalidFlags);
        }
        if callbacks.version != CALLBACKS_VERSION {
            return Err(VirglError::UnsupportedCallbacksVersion(callbacks.version));
        }
        let driver = Driver::new(driver);
        let egl_version = driver.initialize()?;
        let (base_es1, _) = render_control::create_native_context(&driver, 1, None)?;
        let (base_es3, _) = match render_control::create_native_context(&driver, 3, None) {
            Ok(ok) => ok,
            Err(e) => {
                // Leave no half-initialized display behind.
                let _ = driver.destroy_context(base_es1);
                return Err(e);
            }
        };
        debug!("renderer up, EGL {}.{}", egl_version.0, egl_version.1);
        Ok(Self {
            state: Arc::new(RendererState {
                driver,
                resources: Mutex::new(ResourceRegistry::default()),
                contexts: Mutex::new(BTreeMap::new()),
                egl: Mutex::new(EglRegistries::default()),
                fences: Mutex::new(FenceQueue::default()),
                last_submit: Mutex::new(None),
                decoders,
                egl_version,
                base_es1,
                base_es3,
            }),
            callbacks,
        })
    }

    /// Drains the fence queue, reporting each completed fence in submission
    /// order.
    pub fn poll(&self) {
        let completed: Vec<u32> = self.state.fences.lock().unwrap().drain().collect();
        for fence_id in completed {
            self.callbacks.handler.write_fence(fence_id);
        }
    }

    /// Validates and stages one guest command buffer. `ndw` counts 32-bit
    /// words, as on the wire.
    pub fn submit_cmd(&self, buffer: &[u8], ctx_id: u32, ndw: u32) -> VirglResult<()> {
        let buf_size = ndw as usize * 4;
        if buf_size < CMD_HDR_SIZE || buf_size > buffer.len() {
            return Err(VirglError::InvalidCommandSize);
        }
        let buffer = &buffer[..buf_size];
        let hdr = virgl_cmd_hdr::from_slice(&buffer[..CMD_HDR_SIZE])
            .ok_or(VirglError::InvalidCommandSize)?;
        if u32::from(hdr.cmd_size) as usize != buf_size {
            return Err(VirglError::InvalidCommandSize);
        }
        let op = u32::from(hdr.op);

        let Some(ctx) = self.state.contexts.lock().unwrap().get(&ctx_id).cloned() else {
            // Submits can race context teardown; not the guest's fault.
            debug!("submit for unknown context {ctx_id} ignored");
            return Ok(());
        };

        if op == CMD_OP_HANDSHAKE {
            return self.handshake(&ctx, &buffer[CMD_HDR_SIZE..]);
        }
        if ctx.cmd_resp().is_none() {
            return Err(VirglError::NoResponseChannel);
        }
        // Stage the response header now so the guest sees a well-formed
        // (empty) response even if processing dies with the batch.
        context::write_response(&self.state, &ctx, op, &[])?;
        ctx.submit_command(buffer.to_vec())?;
        *self.state.last_submit.lock().unwrap() = Some(ctx_id);
        Ok(())
    }

    /// The op 0 handshake: the payload names the resource serving as the
    /// context's response channel. The zero-size ack goes into that very
    /// resource, synchronously and regardless of worker state, even when
    /// the resource did not qualify as a channel.
    fn handshake(&self, ctx: &Arc<Context>, payload: &[u8]) -> VirglResult<()> {
        let handle = u32::from_le_bytes(
            payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(VirglError::InvalidCommandSize)?,
        );
        let mut resources = self.state.resources.lock().unwrap();
        let res = resources.get_mut(handle)?;
        if res.iov_total_len() == MAX_CMD_RESP_BUF_SIZE {
            ctx.set_cmd_resp(handle);
        } else {
            debug!(
                "resource {handle} has {} backing bytes, not a response channel",
                res.iov_total_len()
            );
        }
        if res.linear_size() >= CMD_HDR_SIZE {
            let ack = virgl_cmd_hdr {
                op: CMD_OP_HANDSHAKE.into(),
                cmd_size: (CMD_HDR_SIZE as u32).into(),
            };
            res.linear_mut()[..CMD_HDR_SIZE].copy_from_slice(ack.as_slice());
            res.flush_span(0, CMD_HDR_SIZE);
        }
        Ok(())
    }

    /// Routes a fence to the last-submitting context's queue when the fence
    /// follows a 3D submit, otherwise completes it immediately.
    pub fn create_fence(&self, fence_id: u32, cmd_type: u32) {
        if cmd_type == VIRTIO_GPU_CMD_SUBMIT_3D {
            let last = *self.state.last_submit.lock().unwrap();
            if let Some(ctx_id) = last {
                let ctx = self.state.contexts.lock().unwrap().get(&ctx_id).cloned();
                if let Some(ctx) = ctx {
                    ctx.set_fence(fence_id, &self.state);
                    return;
                }
            }
        }
        self.state.fences.lock().unwrap().push(fence_id);
    }

    pub fn resource_create(
        &self,
        args: ResourceCreateArgs,
        iovs: Vec<GpuIovec>,
    ) -> VirglResult<()> {
        self.state.resources.lock().unwrap().create(args, iovs)
    }

    /// Drops a resource, detaching it from every context first.
    pub fn resource_unref(&self, handle: u32) -> VirglResult<()> {
        let attached = self.state.resources.lock().unwrap().get(handle)?.attached.clone();
        for ctx_id in attached {
            self.ctx_detach_resource(ctx_id, handle)?;
        }
        self.state
            .resources
            .lock()
            .unwrap()
            .remove(handle, &self.state.driver)?;
        Ok(())
    }

    pub fn resource_attach_iov(&self, handle: u32, iovs: Vec<GpuIovec>) -> VirglResult<()> {
        self.state.resources.lock().unwrap().attach_iov(handle, iovs)
    }

    pub fn resource_detach_iov(&self, handle: u32) -> VirglResult<()> {
        self.state.resources.lock().unwrap().detach_iov(handle)
    }

    pub fn resource_get_info(&self, handle: u32) -> VirglResult<ResourceInfo> {
        self.state
            .resources
            .lock()
            .unwrap()
            .get_info(handle, &self.state.driver)
    }

    pub fn context_create(&self, ctx_id: u32, name: String) -> VirglResult<()> {
        let mut contexts = self.state.contexts.lock().unwrap();
        if contexts.contains_key(&ctx_id) {
            return Err(VirglError::InvalidContextId(ctx_id));
        }
        contexts.insert(ctx_id, Context::new(ctx_id, name));
        Ok(())
    }

    /// Tears a context down: joins its worker, releases its EGL bindings,
    /// and detaches its resources.
    pub fn context_destroy(&self, ctx_id: u32) -> VirglResult<()> {
        let ctx = self
            .state
            .contexts
            .lock()
            .unwrap()
            .remove(&ctx_id)
            .ok_or(VirglError::InvalidContextId(ctx_id))?;
        ctx.kill_and_join_worker();

        // The cached binding may be stale: another guest context can have
        // stolen an object through make-current. Release only edges this
        // context still owns.
        let binding = ctx.egl_binding();
        {
            let mut egl = self.state.egl.lock().unwrap();
            for id in [binding.ctx].into_iter().flatten() {
                if let Some(w) = egl.contexts.get_mut(id) {
                    if w.bound_to() == Some(ctx_id) {
                        w.unbind();
                        if w.disposable() {
                            egl.contexts.remove(id);
                        }
                    }
                }
            }
            for id in [binding.draw, binding.read].into_iter().flatten() {
                if let Some(w) = egl.surfaces.get_mut(id) {
                    if w.bound_to().map(|(h, _)| h) == Some(ctx_id) {
                        w.unbind();
                        if w.disposable() {
                            egl.surfaces.remove(id);
                        }
                    }
                }
            }
        }

        for handle in ctx.attached_resources() {
            ctx.detach_resource(handle);
            if let Ok(res) = self.state.resources.lock().unwrap().get_mut(handle) {
                res.attached.remove(&ctx_id);
            }
        }
        let mut last = self.state.last_submit.lock().unwrap();
        if *last == Some(ctx_id) {
            *last = None;
        }
        Ok(())
    }

    pub fn ctx_attach_resource(&self, ctx_id: u32, handle: u32) -> VirglResult<()> {
        let ctx = self.lookup_context(ctx_id)?;
        self.state
            .resources
            .lock()
            .unwrap()
            .get_mut(handle)?
            .attached
            .insert(ctx_id);
        ctx.attach_resource(handle);
        Ok(())
    }

    pub fn ctx_detach_resource(&self, ctx_id: u32, handle: u32) -> VirglResult<()> {
        let ctx = self.lookup_context(ctx_id)?;
        self.state
            .resources
            .lock()
            .unwrap()
            .get_mut(handle)?
            .attached
            .remove(&ctx_id);
        ctx.detach_resource(handle);
        Ok(())
    }

    /// Host-to-guest direction: linear buffer out to the guest's iovecs.
    pub fn transfer_read_iov(
        &self,
        handle: u32,
        offset: u64,
        transfer_box: &Box3,
    ) -> VirglResult<()> {
        self.state
            .resources
            .lock()
            .unwrap()
            .get_mut(handle)?
            .linear_to_iovec(offset, transfer_box)
    }

    /// Guest-to-host direction: iovecs into the linear buffer.
    pub fn transfer_write_iov(
        &self,
        handle: u32,
        offset: u64,
        transfer_box: &Box3,
    ) -> VirglResult<()> {
        self.state
            .resources
            .lock()
            .unwrap()
            .get_mut(handle)?
            .iovec_to_linear(offset, transfer_box)
    }

    /// Reports the size and max version of a capability set.
    pub fn get_cap_set(&self, cap_set: u32) -> VirglResult<(usize, u32)> {
        match cap_set {
            CAPSET_RENDERER => Ok((
                std::mem::size_of::<renderer_caps_v1>(),
                CAPSET_RENDERER_VERSION,
            )),
            other => Err(VirglError::InvalidCapset(other)),
        }
    }

    pub fn fill_caps(&self, cap_set: u32, caps: &mut [u8]) -> VirglResult<()> {
        if cap_set != CAPSET_RENDERER {
            return Err(VirglError::InvalidCapset(cap_set));
        }
        let block = renderer_caps_v1::supported();
        let bytes = block.as_slice();
        if caps.len() < bytes.len() {
            return Err(VirglError::InvalidParameter("caps buffer too small"));
        }
        caps[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn lookup_context(&self, ctx_id: u32) -> VirglResult<Arc<Context>> {
        self.state
            .contexts
            .lock()
            .unwrap()
            .get(&ctx_id)
            .cloned()
            .ok_or(VirglError::InvalidContextId(ctx_id))
    }

    pub(crate) fn state_ref(&self) -> &Arc<RendererState> {
        &self.state
    }
}

impl Drop for VirglRenderer {
    /// Joins every worker, releases remaining host GL objects, and destroys
    /// the base contexts, newest first.
    fn drop(&mut self) {
        let contexts: Vec<_> = self.state.contexts.lock().unwrap().values().cloned().collect();
        for ctx in contexts {
            ctx.kill_and_join_worker();
        }
        {
            // Wrappers may still hold live native handles; images and syncs
            // destroy theirs when the registries drop.
            let mut egl = self.state.egl.lock().unwrap();
            for surface in egl.surfaces.values_mut() {
                surface.destroy_native(&self.state.driver);
            }
            for context in egl.contexts.values_mut() {
                context.destroy_native(&self.state.driver);
            }
        }
        self.state
            .resources
            .lock()
            .unwrap()
            .release_host_objects(&self.state.driver);
        if let Err(e) = self.state.driver.destroy_context(self.state.base_es3) {
            error!("base ES3 context teardown failed: {e}");
        }
        if let Err(e) = self.state.driver.destroy_context(self.state.base_es1) {
            error!("base ES1 context teardown failed: {e}");
        }
    }
}
