// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Neutral types shared between the entry points and the registries.

use std::collections::VecDeque;

use libc::c_void;

/// One guest memory span of a scatter-gather list. The base pointer comes
/// from the device model, which guarantees it stays mapped for as long as
/// the span is attached to a resource.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct GpuIovec {
    pub base: *mut c_void,
    pub len: usize,
}

// SAFETY: The span is guest memory owned by the device model; the backend
// only touches it under the owning resource's registry lock.
unsafe impl Send for GpuIovec {}

impl GpuIovec {
    /// # Safety
    ///
    /// The caller must guarantee the span is mapped and not concurrently
    /// written by another host thread for the lifetime of the slice.
    pub(crate) unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base.cast::<u8>(), self.len)
    }

    /// # Safety
    ///
    /// Same contract as [`GpuIovec::as_slice`], plus exclusive access.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.base.cast::<u8>(), self.len)
    }
}

/// An axis aligned box in 3 dimensional space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Box3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
    pub w: u32,
    pub h: u32,
    pub d: u32,
}

impl Box3 {
    /// Constructs a 2 dimensional XY box in 3 dimensional space with unit
    /// depth and zero displacement on the Z axis.
    pub const fn new_2d(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self {
            x,
            y,
            z: 0,
            w,
            h,
            d: 1,
        }
    }

    /// Returns true if this box represents a volume of zero.
    pub const fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0 || self.d == 0
    }
}

/// Arguments of `resource_create`, mirroring the hypervisor-facing create
/// call field for field.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceCreateArgs {
    pub handle: u32,
    pub target: u32,
    pub format: u32,
    pub bind: u32,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub array_size: u32,
    pub last_level: u32,
    pub nr_samples: u32,
    pub flags: u32,
}

/// What `resource_get_info` reports back to the device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceInfo {
    pub stride: u32,
    pub fourcc: u32,
    /// Host GL texture backing the resource, when GL interop materialized
    /// one.
    pub tex_id: Option<u32>,
}

/// FIFO of completed command-batch fences awaiting `poll`.
///
/// Pushed by context workers (and the inline processing path), drained in a
/// batch by the hypervisor thread. Order is submission order.
#[derive(Debug, Default)]
pub struct FenceQueue {
    completed: VecDeque<u32>,
}

impl FenceQueue {
    pub fn push(&mut self, fence_id: u32) {
        self.completed.push_back(fence_id);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = u32> + '_ {
        self.completed.drain(..)
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }
}
