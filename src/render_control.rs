// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Handlers for the render-control RPC embedded in command buffers.
//!
//! Each call takes plain little-endian words and appends its results to the
//! batch response. Host-driver failures come back to the guest as EGL_FALSE
//! acks; malformed calls are protocol errors that abort the batch.

use std::sync::Arc;

use log::{debug, warn};

use crate::context::{Context, EglBinding};
use crate::driver::{Driver, DriverError, GlesApi, NativeContext, NativeSurface};
use crate::egl_objects::{EglContext, EglImage, EglSurface, EglSync, SurfaceRole};
use crate::protocol::{
    EGL_FALSE, EGL_TRUE, OP_RC_BIND_RENDERBUFFER, OP_RC_BIND_TEXTURE, OP_RC_CLIENT_WAIT_SYNC,
    OP_RC_CREATE_CLIENT_IMAGE, OP_RC_CREATE_COLOR_BUFFER, OP_RC_CREATE_CONTEXT, OP_RC_CREATE_SYNC,
    OP_RC_CREATE_WINDOW_SURFACE, OP_RC_DESTROY_CLIENT_IMAGE, OP_RC_DESTROY_CONTEXT,
    OP_RC_DESTROY_SYNC, OP_RC_DESTROY_WINDOW_SURFACE, OP_RC_FIRST, OP_RC_FLUSH_WINDOW_COLOR_BUFFER,
    OP_RC_GET_EGL_VERSION, OP_RC_GET_RENDERER_VERSION, OP_RC_LAST, OP_RC_MAKE_CURRENT,
    OP_RC_QUERY_GL_STRING, OP_RC_SET_PUID, RC_COLOR_BUFFER_SENTINEL, RENDERER_VERSION,
};
use crate::{RendererState, VirglError, VirglResult};

/// External decoder for one of the GLES call streams. Instances are invoked
/// under the global driver lock, one call at a time.
#[cfg_attr(test, mockall::automock)]
pub trait GlesDecoder: Send + Sync {
    /// Whether this decoder owns `opcode`.
    fn handles(&self, opcode: u32) -> bool;
    /// Decodes and executes one call, appending result bytes to `response`.
    fn decode(
        &self,
        ctx_handle: u32,
        opcode: u32,
        payload: &[u8],
        response: &mut Vec<u8>,
    ) -> VirglResult<()>;
}

pub fn is_render_control(opcode: u32) -> bool {
    (OP_RC_FIRST..=OP_RC_LAST).contains(&opcode)
}

/// Little-endian word reader over a call payload.
struct Args<'a> {
    buf: &'a [u8],
}

impl<'a> Args<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u32(&mut self) -> VirglResult<u32> {
        let (word, rest) = self
            .buf
            .split_first_chunk::<4>()
            .ok_or(VirglError::InvalidCommandSize)?;
        self.buf = rest;
        Ok(u32::from_le_bytes(*word))
    }

    fn u64(&mut self) -> VirglResult<u64> {
        let lo = self.u32()?;
        let hi = self.u32()?;
        Ok(u64::from(hi) << 32 | u64::from(lo))
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn nonzero(id: u32) -> Option<u32> {
    (id != 0).then_some(id)
}

/// Creates a native context for the requested GLES major version, falling
/// back from ES3 to ES2 on drivers without an ES3 config.
pub(crate) fn create_native_context(
    driver: &Driver,
    gl_version: u32,
    share: Option<NativeContext>,
) -> VirglResult<(NativeContext, GlesApi)> {
    let api = match gl_version {
        1 => GlesApi::Es1,
        2 => GlesApi::Es2,
        _ => GlesApi::Es3,
    };
    match driver.create_context(api, share) {
        Ok(native) => Ok((native, api)),
        Err(DriverError::VersionUnavailable) if api == GlesApi::Es3 => {
            debug!("ES3 unavailable, falling back to ES2");
            Ok((driver.create_context(GlesApi::Es2, share)?, GlesApi::Es2))
        }
        Err(e) => Err(e.into()),
    }
}

/// Routes one render-control call. `ctx` is the guest context the batch was
/// submitted on.
pub(crate) fn dispatch(
    state: &RendererState,
    ctx: &Arc<Context>,
    opcode: u32,
    payload: &[u8],
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let mut args = Args::new(payload);
    match opcode {
        OP_RC_GET_RENDERER_VERSION => put_u32(response, RENDERER_VERSION),
        OP_RC_GET_EGL_VERSION => {
            put_u32(response, state.egl_version.0);
            put_u32(response, state.egl_version.1);
        }
        OP_RC_QUERY_GL_STRING => rc_query_gl_string(state, &mut args, response)?,
        OP_RC_CREATE_CONTEXT => rc_create_context(state, &mut args, response)?,
        OP_RC_DESTROY_CONTEXT => rc_destroy_context(state, args.u32()?)?,
        OP_RC_CREATE_WINDOW_SURFACE => rc_create_window_surface(state, &mut args, response)?,
        OP_RC_DESTROY_WINDOW_SURFACE => rc_destroy_window_surface(state, args.u32()?)?,
        OP_RC_CREATE_COLOR_BUFFER => {
            // Real storage arrives through the resource path; the sentinel
            // tells the guest to treat the window surface as a pbuffer.
            let (_width, _height) = (args.u32()?, args.u32()?);
            put_u32(response, RC_COLOR_BUFFER_SENTINEL);
        }
        OP_RC_FLUSH_WINDOW_COLOR_BUFFER => {
            let ack = rc_flush_window_color_buffer(state, args.u32()?)?;
            put_u32(response, ack);
        }
        OP_RC_MAKE_CURRENT => {
            let (c, d, r) = (args.u32()?, args.u32()?, args.u32()?);
            put_u32(response, rc_make_current(state, ctx, c, d, r)?);
        }
        OP_RC_BIND_TEXTURE | OP_RC_BIND_RENDERBUFFER => {
            put_u32(response, rc_bind_resource_image(state, ctx, args.u32()?)?);
        }
        OP_RC_CREATE_CLIENT_IMAGE => rc_create_client_image(state, &mut args, response)?,
        OP_RC_DESTROY_CLIENT_IMAGE => {
            let id = args.u32()?;
            state
                .egl
                .lock()
                .unwrap()
                .images
                .remove(id)
                .ok_or(VirglError::InvalidEglObject(id))?;
        }
        OP_RC_CREATE_SYNC => rc_create_sync(state, response)?,
        OP_RC_CLIENT_WAIT_SYNC => rc_client_wait_sync(state, &mut args, response)?,
        OP_RC_DESTROY_SYNC => {
            let id = args.u32()?;
            state
                .egl
                .lock()
                .unwrap()
                .syncs
                .remove(id)
                .ok_or(VirglError::InvalidEglObject(id))?;
        }
        OP_RC_SET_PUID => {
            let puid = args.u64()?;
            ctx.set_puid((puid >> 32) as u32, puid as u32);
        }
        _ => return Err(VirglError::UnknownOpcode(opcode)),
    }
    Ok(())
}

fn rc_query_gl_string(
    state: &RendererState,
    args: &mut Args<'_>,
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let name = args.u32()?;
    let buf_size = args.u32()? as usize;
    let value = match state.driver.gl_string(name) {
        Ok(s) => s,
        Err(e) => {
            debug!("glGetString({name:#x}) failed: {e}");
            String::new()
        }
    };
    let needed = value.len() + 1;
    put_u32(response, needed as u32);
    if buf_size > 0 {
        let copied = value.as_bytes().len().min(buf_size - 1);
        response.extend_from_slice(&value.as_bytes()[..copied]);
        response.push(0);
    }
    Ok(())
}

fn rc_create_context(
    state: &RendererState,
    args: &mut Args<'_>,
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let _config = args.u32()?;
    let share_id = args.u32()?;
    let gl_version = args.u32()?;
    let mut egl = state.egl.lock().unwrap();
    let share = match nonzero(share_id) {
        Some(id) => Some(
            egl.contexts
                .get(id)
                .and_then(EglContext::native)
                .ok_or(VirglError::InvalidEglObject(id))?,
        ),
        None => None,
    };
    match create_native_context(&state.driver, gl_version, share) {
        Ok((native, api)) => {
            let id = egl.contexts.insert(EglContext::new(native, api));
            put_u32(response, id);
        }
        Err(VirglError::Driver(e)) => {
            warn!("rcCreateContext failed: {e}");
            put_u32(response, 0);
        }
        Err(e) => return Err(e),
    }
    Ok(())
}

fn rc_destroy_context(state: &RendererState, id: u32) -> VirglResult<()> {
    let mut egl = state.egl.lock().unwrap();
    let wrapper = egl
        .contexts
        .get_mut(id)
        .ok_or(VirglError::InvalidEglObject(id))?;
    wrapper.destroy_native(&state.driver);
    // Still bound contexts linger until make-current releases them.
    if wrapper.disposable() {
        egl.contexts.remove(id);
    }
    Ok(())
}

fn rc_create_window_surface(
    state: &RendererState,
    args: &mut Args<'_>,
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let _config = args.u32()?;
    let width = args.u32()?;
    let height = args.u32()?;
    match state.driver.create_window_surface(width, height) {
        Ok(native) => {
            let id = state
                .egl
                .lock()
                .unwrap()
                .surfaces
                .insert(EglSurface::new(native, width, height));
            put_u32(response, id);
        }
        Err(e) => {
            warn!("rcCreateWindowSurface failed: {e}");
            put_u32(response, 0);
        }
    }
    Ok(())
}

fn rc_destroy_window_surface(state: &RendererState, id: u32) -> VirglResult<()> {
    let mut egl = state.egl.lock().unwrap();
    let wrapper = egl
        .surfaces
        .get_mut(id)
        .ok_or(VirglError::InvalidEglObject(id))?;
    wrapper.destroy_native(&state.driver);
    if wrapper.disposable() {
        egl.surfaces.remove(id);
    }
    Ok(())
}

fn rc_flush_window_color_buffer(state: &RendererState, id: u32) -> VirglResult<u32> {
    let native = {
        let egl = state.egl.lock().unwrap();
        egl.surfaces
            .get(id)
            .and_then(EglSurface::native)
            .ok_or(VirglError::InvalidEglObject(id))?
    };
    Ok(match state.driver.flush_surface(native) {
        Ok(()) => EGL_TRUE,
        Err(e) => {
            warn!("surface flush failed: {e}");
            EGL_FALSE
        }
    })
}

/// The make-current transaction. Binding mutations are applied to the
/// wrappers first; if the native call then fails, the precomputed snapshot
/// is restored so no partial binding survives. On success, wrappers evicted
/// from this guest context are swept if disposable.
fn rc_make_current(
    state: &RendererState,
    ctx: &Arc<Context>,
    ctx_id: u32,
    draw_id: u32,
    read_id: u32,
) -> VirglResult<u32> {
    let new = EglBinding {
        ctx: nonzero(ctx_id),
        draw: nonzero(draw_id),
        read: nonzero(read_id),
    };
    let old = ctx.egl_binding();

    let mut egl = state.egl.lock().unwrap();

    // Resolve natives up front so a bad id is a pure protocol error with no
    // state touched.
    let native_ctx = match new.ctx {
        Some(id) => Some(
            egl.contexts
                .get(id)
                .and_then(EglContext::native)
                .ok_or(VirglError::InvalidEglObject(id))?,
        ),
        None => None,
    };
    let resolve_surface = |egl: &crate::egl_objects::EglRegistries,
                           id: Option<u32>|
     -> VirglResult<Option<NativeSurface>> {
        match id {
            Some(id) => Ok(Some(
                egl.surfaces
                    .get(id)
                    .and_then(EglSurface::native)
                    .ok_or(VirglError::InvalidEglObject(id))?,
            )),
            None => Ok(None),
        }
    };
    let native_draw = resolve_surface(&egl, new.draw)?;
    let native_read = resolve_surface(&egl, new.read)?;

    // Snapshot every wrapper the transaction may touch.
    let ctx_snapshot: Vec<(u32, Option<u32>)> = [old.ctx, new.ctx]
        .into_iter()
        .flatten()
        .filter_map(|id| Some((id, egl.contexts.get(id)?.bound_to())))
        .collect();
    let surf_snapshot: Vec<(u32, Option<(u32, SurfaceRole)>)> =
        [old.draw, new.draw, old.read, new.read]
            .into_iter()
            .flatten()
            .filter_map(|id| Some((id, egl.surfaces.get(id)?.bound_to())))
            .collect();

    // Apply: release the old edges of this guest context, then claim the
    // new ones (evicting any other owner).
    let mut released = Vec::new();
    for id in [old.ctx].into_iter().flatten() {
        if Some(id) != new.ctx {
            if let Some(w) = egl.contexts.get_mut(id) {
                if w.bound_to() == Some(ctx.handle) {
                    w.unbind();
                    released.push((id, true));
                }
            }
        }
    }
    for (id, role) in [(old.draw, SurfaceRole::Draw), (old.read, SurfaceRole::Read)] {
        let Some(id) = id else { continue };
        let still_wanted = (role == SurfaceRole::Draw && new.draw == Some(id))
            || (role == SurfaceRole::Read && new.read == Some(id));
        if !still_wanted {
            if let Some(w) = egl.surfaces.get_mut(id) {
                if w.bound_to().map(|(h, _)| h) == Some(ctx.handle) {
                    w.unbind();
                    released.push((id, false));
                }
            }
        }
    }
    if let Some(id) = new.ctx {
        if let Some(w) = egl.contexts.get_mut(id) {
            w.bind(ctx.handle);
        }
    }
    for (id, role) in [(new.draw, SurfaceRole::Draw), (new.read, SurfaceRole::Read)] {
        if let Some(id) = id {
            if let Some(w) = egl.surfaces.get_mut(id) {
                w.bind(ctx.handle, role);
            }
        }
    }

    if let Err(e) = state.driver.make_current(native_ctx, native_draw, native_read) {
        warn!("eglMakeCurrent failed, rolling back bindings: {e}");
        for (id, binding) in ctx_snapshot {
            if let Some(w) = egl.contexts.get_mut(id) {
                w.restore_binding(binding);
            }
        }
        for (id, binding) in surf_snapshot {
            if let Some(w) = egl.surfaces.get_mut(id) {
                w.restore_binding(binding);
            }
        }
        return Ok(EGL_FALSE);
    }

    ctx.set_egl_binding(new);
    for (id, is_ctx) in released {
        if is_ctx {
            if egl.contexts.get(id).is_some_and(EglContext::disposable) {
                egl.contexts.remove(id);
            }
        } else if egl.surfaces.get(id).is_some_and(EglSurface::disposable) {
            egl.surfaces.remove(id);
        }
    }
    Ok(EGL_TRUE)
}

/// Materializes (once) an EGLImage over a resource's host texture and binds
/// it. The image is owned by the resource and reused on later binds.
fn rc_bind_resource_image(
    state: &RendererState,
    ctx: &Arc<Context>,
    res_handle: u32,
) -> VirglResult<u32> {
    let native_ctx = {
        let egl = state.egl.lock().unwrap();
        ctx.egl_binding()
            .ctx
            .and_then(|id| egl.contexts.get(id).and_then(EglContext::native))
            .unwrap_or(state.base_es3)
    };
    let mut resources = state.resources.lock().unwrap();
    let res = resources.get_mut(res_handle)?;
    if res.image.is_some() {
        return Ok(EGL_TRUE);
    }
    let Some(tex) = res.ensure_texture(&state.driver)? else {
        return Ok(EGL_FALSE);
    };
    match state.driver.create_image(native_ctx, tex) {
        Ok(native) => {
            res.image = Some(EglImage::new(native, state.driver.clone()));
            Ok(EGL_TRUE)
        }
        Err(e) => {
            warn!("image bind for resource {res_handle} failed: {e}");
            Ok(EGL_FALSE)
        }
    }
}

fn rc_create_client_image(
    state: &RendererState,
    args: &mut Args<'_>,
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let ctx_id = args.u32()?;
    let _target = args.u32()?;
    let texture = args.u32()?;
    let mut egl = state.egl.lock().unwrap();
    let native_ctx = egl
        .contexts
        .get(ctx_id)
        .and_then(EglContext::native)
        .ok_or(VirglError::InvalidEglObject(ctx_id))?;
    match state.driver.create_image(native_ctx, texture) {
        Ok(native) => {
            let id = egl.images.insert(EglImage::new(native, state.driver.clone()));
            put_u32(response, id);
        }
        Err(e) => {
            warn!("rcCreateClientImage failed: {e}");
            put_u32(response, 0);
        }
    }
    Ok(())
}

fn rc_create_sync(state: &RendererState, response: &mut Vec<u8>) -> VirglResult<()> {
    match state.driver.create_sync() {
        Ok(native) => {
            let id = state
                .egl
                .lock()
                .unwrap()
                .syncs
                .insert(EglSync::new(native, state.driver.clone()));
            put_u32(response, id);
        }
        Err(e) => {
            warn!("rcCreateSync failed: {e}");
            put_u32(response, 0);
        }
    }
    Ok(())
}

fn rc_client_wait_sync(
    state: &RendererState,
    args: &mut Args<'_>,
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    let id = args.u32()?;
    let flags = args.u32()?;
    let timeout_ns = args.u64()?;
    let native = {
        let egl = state.egl.lock().unwrap();
        egl.syncs
            .get(id)
            .map(EglSync::native)
            .ok_or(VirglError::InvalidEglObject(id))?
    };
    let status = state
        .driver
        .client_wait_sync(native, flags, timeout_ns)
        .unwrap_or(EGL_FALSE);
    put_u32(response, status);
    Ok(())
}
