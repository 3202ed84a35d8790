// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Guest contexts, their worker threads, and command-batch processing.
//!
//! Every context has a single-slot command queue: a new batch cannot be
//! staged while the previous batch's fence is still pending, which gives
//! strict per-context FIFO by construction. The worker is spawned lazily,
//! once the guest has identified itself through rcSetPuid; until then
//! batches are processed inline on the hypervisor thread.

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::{debug, error, trace};
use vm_memory::ByteValued;

use crate::protocol::{virgl_call_hdr, virgl_cmd_hdr, CALL_HDR_SIZE, CMD_HDR_SIZE};
use crate::render_control;
use crate::{RendererState, VirglError, VirglResult};

/// The EGL objects a guest context currently has current, by registry id.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EglBinding {
    pub ctx: Option<u32>,
    pub draw: Option<u32>,
    pub read: Option<u32>,
}

#[derive(Default)]
struct ContextInner {
    pid: u32,
    tid: u32,
    cmd: Option<Vec<u8>>,
    fence: Option<u32>,
    kill_worker: bool,
    cmd_resp: Option<u32>,
    attached: BTreeSet<u32>,
    egl_binding: EglBinding,
}

pub struct Context {
    pub handle: u32,
    pub name: String,
    inner: Mutex<ContextInner>,
    cvar: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Context {
    pub fn new(handle: u32, name: String) -> Arc<Self> {
        Arc::new(Self {
            handle,
            name,
            inner: Mutex::new(ContextInner::default()),
            cvar: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    /// Stages a command batch into the queue slot. The slot stays occupied
    /// until the batch's fence has been processed.
    pub fn submit_command(&self, cmd: Vec<u8>) -> VirglResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.cmd.is_some() || inner.fence.is_some() {
            return Err(VirglError::CommandSlotBusy);
        }
        inner.cmd = Some(cmd);
        Ok(())
    }

    /// Arms the fence for the staged batch. With a live worker this only
    /// wakes it; otherwise the batch runs inline here, after which a worker
    /// may be spawned if the context has identified itself.
    pub fn set_fence(self: &Arc<Self>, fence_id: u32, state: &Arc<RendererState>) {
        let mut worker = self.worker.lock().unwrap();
        let mut inner = self.inner.lock().unwrap();
        if worker.is_some() {
            if inner.cmd.is_none() {
                // No batch staged, so the worker would never wake for this
                // fence; complete it here and keep the slot free.
                drop(inner);
                state.fences.lock().unwrap().push(fence_id);
                return;
            }
            inner.fence = Some(fence_id);
            drop(inner);
            self.cvar.notify_one();
            return;
        }
        inner.fence = Some(fence_id);
        let cmd = inner.cmd.take();
        drop(inner);
        if let Some(cmd) = cmd {
            process_cmd(state, self, &cmd);
        }
        state.fences.lock().unwrap().push(fence_id);
        self.inner.lock().unwrap().fence = None;
        self.spawn_worker_if_identified(&mut worker, state);
    }

    pub fn set_puid(&self, pid: u32, tid: u32) {
        let mut inner = self.inner.lock().unwrap();
        if (inner.pid, inner.tid) != (pid, tid) {
            trace!("context {} identified as pid {pid} tid {tid}", self.handle);
            inner.pid = pid;
            inner.tid = tid;
        }
    }

    fn identified(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.pid != 0 || inner.tid != 0
    }

    fn spawn_worker_if_identified(
        self: &Arc<Self>,
        worker: &mut Option<JoinHandle<()>>,
        state: &Arc<RendererState>,
    ) {
        if worker.is_some() || !self.identified() {
            return;
        }
        let ctx = Arc::clone(self);
        let state = Arc::clone(state);
        match std::thread::Builder::new()
            .name(format!("virgl-ctx-{}", self.handle))
            .spawn(move || worker_loop(&state, &ctx))
        {
            Ok(handle) => *worker = Some(handle),
            Err(e) => error!("worker spawn for context {} failed: {e}", self.handle),
        }
    }

    /// Teardown: signal the worker, wake it, and wait for it to drain any
    /// in-flight batch. Join has no timeout; responses are delivered before
    /// the context goes away.
    pub fn kill_and_join_worker(&self) {
        self.inner.lock().unwrap().kill_worker = true;
        self.cvar.notify_all();
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("worker for context {} panicked", self.handle);
            }
        }
    }

    pub fn cmd_resp(&self) -> Option<u32> {
        self.inner.lock().unwrap().cmd_resp
    }

    /// Binds the response channel. The handshake runs once per context;
    /// later attempts keep the original channel.
    pub fn set_cmd_resp(&self, handle: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cmd_resp.is_none() {
            inner.cmd_resp = Some(handle);
        } else {
            debug!("context {} re-ran the response handshake", self.handle);
        }
    }

    pub fn clear_cmd_resp_if(&self, handle: u32) {
        let mut inner = self.inner.lock().unwrap();
        if inner.cmd_resp == Some(handle) {
            inner.cmd_resp = None;
        }
    }

    pub fn attach_resource(&self, handle: u32) {
        self.inner.lock().unwrap().attached.insert(handle);
    }

    /// Fatal when the edge does not exist: the device model asked to detach
    /// something it never attached.
    pub fn detach_resource(&self, handle: u32) {
        let removed = self.inner.lock().unwrap().attached.remove(&handle);
        assert!(
            removed,
            "detach of resource {handle} never attached to context {}",
            self.handle
        );
        self.clear_cmd_resp_if(handle);
    }

    pub fn attached_resources(&self) -> Vec<u32> {
        self.inner.lock().unwrap().attached.iter().copied().collect()
    }

    pub fn egl_binding(&self) -> EglBinding {
        self.inner.lock().unwrap().egl_binding
    }

    pub fn set_egl_binding(&self, binding: EglBinding) {
        self.inner.lock().unwrap().egl_binding = binding;
    }
}

fn worker_loop(state: &Arc<RendererState>, ctx: &Arc<Context>) {
    trace!("worker for context {} up", ctx.handle);
    loop {
        let (cmd, fence) = {
            let mut inner = ctx.inner.lock().unwrap();
            loop {
                if inner.kill_worker {
                    trace!("worker for context {} exiting", ctx.handle);
                    return;
                }
                if inner.cmd.is_some() && inner.fence.is_some() {
                    break;
                }
                inner = ctx.cvar.wait(inner).unwrap();
            }
            // The fence stays set until processing finishes, keeping the
            // queue slot occupied.
            (inner.cmd.take().unwrap(), inner.fence.unwrap())
        };
        process_cmd(state, ctx, &cmd);
        state.fences.lock().unwrap().push(fence);
        ctx.inner.lock().unwrap().fence = None;
    }
}

/// Decodes and executes one command batch, then flushes the accumulated
/// response through the context's response channel. A malformed batch is
/// dropped after logging; the fence is completed by the caller either way
/// so the guest never waits forever.
pub(crate) fn process_cmd(state: &Arc<RendererState>, ctx: &Arc<Context>, cmd: &[u8]) {
    if cmd.len() < CMD_HDR_SIZE {
        return;
    }
    let Some(hdr) = virgl_cmd_hdr::from_slice(&cmd[..CMD_HDR_SIZE]) else {
        return;
    };
    let op = u32::from(hdr.op);
    let mut response = Vec::new();
    if let Err(e) = run_calls(state, ctx, &cmd[CMD_HDR_SIZE..], &mut response) {
        error!("context {}: dropping malformed batch: {e}", ctx.handle);
        response.clear();
    }
    if let Err(e) = write_response(state, ctx, op, &response) {
        error!("context {}: response delivery failed: {e}", ctx.handle);
    }
}

fn run_calls(
    state: &Arc<RendererState>,
    ctx: &Arc<Context>,
    mut payload: &[u8],
    response: &mut Vec<u8>,
) -> VirglResult<()> {
    while !payload.is_empty() {
        if payload.len() < CALL_HDR_SIZE {
            return Err(VirglError::InvalidCommandSize);
        }
        let hdr =
            virgl_call_hdr::from_slice(&payload[..CALL_HDR_SIZE]).ok_or(VirglError::InvalidCommandSize)?;
        let opcode = u32::from(hdr.opcode);
        let size = u32::from(hdr.size) as usize;
        if size < CALL_HDR_SIZE || size > payload.len() {
            return Err(VirglError::InvalidCommandSize);
        }
        let call_payload = &payload[CALL_HDR_SIZE..size];
        trace!("context {}: call {opcode} size {size}", ctx.handle);
        if render_control::is_render_control(opcode) {
            render_control::dispatch(state, ctx, opcode, call_payload, response)?;
        } else {
            let decoder = state
                .decoders
                .iter()
                .find(|d| d.handles(opcode))
                .ok_or(VirglError::UnknownOpcode(opcode))?;
            // GLES decoders issue native calls themselves; hold the driver
            // lock across the whole call.
            state
                .driver
                .serialized(|_| decoder.decode(ctx.handle, opcode, call_payload, response))?;
        }
        payload = &payload[size..];
    }
    Ok(())
}

/// Stages `op` + response bytes into the response-channel resource and
/// syncs the written span back to the guest.
pub(crate) fn write_response(
    state: &Arc<RendererState>,
    ctx: &Arc<Context>,
    op: u32,
    response: &[u8],
) -> VirglResult<()> {
    let Some(resp_handle) = ctx.cmd_resp() else {
        return Err(VirglError::NoResponseChannel);
    };
    let total = CMD_HDR_SIZE + response.len();
    let mut resources = state.resources.lock().unwrap();
    let res = resources.get_mut(resp_handle)?;
    if total > res.linear_size() {
        return Err(VirglError::OutOfBounds);
    }
    let hdr = virgl_cmd_hdr {
        op: op.into(),
        cmd_size: (total as u32).into(),
    };
    let linear = res.linear_mut();
    linear[..CMD_HDR_SIZE].copy_from_slice(hdr.as_slice());
    linear[CMD_HDR_SIZE..total].copy_from_slice(response);
    res.flush_span(0, total);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn queue_slot_is_single() {
        let ctx = Context::new(1, "test".into());
        ctx.submit_command(vec![0; 8]).unwrap();
        assert_matches!(
            ctx.submit_command(vec![0; 8]),
            Err(VirglError::CommandSlotBusy)
        );
    }

    #[test]
    fn detach_clears_matching_cmd_resp() {
        let ctx = Context::new(1, "test".into());
        ctx.attach_resource(9);
        ctx.set_cmd_resp(9);
        ctx.detach_resource(9);
        assert_eq!(ctx.cmd_resp(), None);
    }

    #[test]
    fn cmd_resp_binds_once() {
        let ctx = Context::new(1, "test".into());
        ctx.set_cmd_resp(5);
        ctx.set_cmd_resp(6);
        assert_eq!(ctx.cmd_resp(), Some(5));
    }

    #[test]
    #[should_panic(expected = "never attached")]
    fn detach_without_attach_is_fatal() {
        let ctx = Context::new(1, "test".into());
        ctx.detach_resource(4);
    }
}
