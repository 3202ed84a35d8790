// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! CPU lock/unlock shim for legacy guest paths that map resources through
//! the gralloc HAL instead of the transfer entry points.

use std::sync::Arc;

use crate::gpu_types::Box3;
use crate::protocol::row_stride;
use crate::{RendererState, VirglRenderer, VirglResult};

/// Handle for gralloc-style CPU access to resource memory.
pub struct Gralloc {
    state: Arc<RendererState>,
}

impl VirglRenderer {
    pub fn gralloc(&self) -> Gralloc {
        Gralloc {
            state: Arc::clone(self.state_ref()),
        }
    }
}

impl Gralloc {
    /// Locks a resource for CPU access: pulls the guest's current bytes
    /// into the linear view, hands `access` the pixels plus the row stride,
    /// then pushes any modification back out. The unlock is implicit in the
    /// closure return, so a buffer can never stay locked.
    pub fn lock<R>(&self, handle: u32, access: impl FnOnce(&mut [u8], u32) -> R) -> VirglResult<R> {
        let mut resources = self.state.resources.lock().unwrap();
        let res = resources.get_mut(handle)?;
        let full = Box3::new_2d(0, 0, res.args.width, res.args.height);
        let stride = row_stride(res.args.width, res.args.format) as u32;
        res.iovec_to_linear(0, &full)?;
        let result = access(res.linear_mut(), stride);
        res.linear_to_iovec(0, &full)?;
        Ok(result)
    }
}
