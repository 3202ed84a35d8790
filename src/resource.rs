// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Resources and the linear/iovec synchronizer.
//!
//! A resource is backed by the guest's scatter-gather list. The backend
//! works on a contiguous view of it: with a single span the view aliases
//! guest memory directly, with several spans a host shadow buffer is kept
//! and synchronized on demand.

use std::collections::{BTreeMap, BTreeSet};

use log::{trace, warn};

use crate::driver::{Driver, DriverError};
use crate::egl_objects::EglImage;
use crate::gpu_types::{Box3, GpuIovec, ResourceCreateArgs, ResourceInfo};
use crate::protocol::{
    bytes_per_pixel, format_fourcc, row_stride, PIPE_BIND_CURSOR, VIRGL_FORMAT_B8G8R8A8_UNORM,
};
use crate::{VirglError, VirglResult};

const CURSOR_WIDTH: u32 = 64;
const CURSOR_HEIGHT: u32 = 64;

/// Contiguous view over a resource's backing memory.
enum LinearStore {
    /// No iovecs attached.
    Unbacked,
    /// Single span; the view is the guest memory itself.
    Alias(GpuIovec),
    /// Multiple spans; a host-owned shadow that must be synced explicitly.
    Shadow(Vec<u8>),
}

pub struct Resource {
    pub args: ResourceCreateArgs,
    iovs: Vec<GpuIovec>,
    linear: LinearStore,
    linear_size: usize,
    tex_id: Option<u32>,
    /// GL interop image, materialized lazily on first texture bind.
    pub image: Option<EglImage>,
    /// Handles of the contexts this resource is attached to.
    pub attached: BTreeSet<u32>,
}

impl Resource {
    fn new(args: ResourceCreateArgs, iovs: Vec<GpuIovec>) -> Self {
        let mut res = Self {
            args,
            iovs: Vec::new(),
            linear: LinearStore::Unbacked,
            linear_size: 0,
            tex_id: None,
            image: None,
            attached: BTreeSet::new(),
        };
        res.realloc_linear(iovs);
        res
    }

    pub fn linear_size(&self) -> usize {
        self.linear_size
    }

    pub fn num_iovs(&self) -> usize {
        self.iovs.len()
    }

    pub fn iov_total_len(&self) -> usize {
        self.iovs.iter().map(|iov| iov.len).sum()
    }

    /// Swaps the backing list and re-derives the linear view. Prior shadow
    /// content is carried over so a detach/attach cycle does not wipe data
    /// the guest has not re-sent; a fresh guest span is assumed to hold
    /// junk, so no sync is forced here.
    pub fn realloc_linear(&mut self, iovs: Vec<GpuIovec>) {
        let total = iovs.iter().map(|iov| iov.len).sum::<usize>();
        self.linear = match iovs.len() {
            0 => LinearStore::Unbacked,
            1 => LinearStore::Alias(iovs[0]),
            _ => {
                let mut shadow = vec![0u8; total];
                if let LinearStore::Shadow(old) = &self.linear {
                    let keep = old.len().min(total);
                    shadow[..keep].copy_from_slice(&old[..keep]);
                }
                LinearStore::Shadow(shadow)
            }
        };
        self.linear_size = if iovs.is_empty() { 0 } else { total };
        self.iovs = iovs;
    }

    pub fn linear(&self) -> &[u8] {
        match &self.linear {
            LinearStore::Unbacked => &[],
            // SAFETY: The span is attached guest memory; the registry lock
            // held by our caller excludes concurrent host access.
            LinearStore::Alias(iov) => unsafe { iov.as_slice() },
            LinearStore::Shadow(shadow) => shadow,
        }
    }

    pub fn linear_mut(&mut self) -> &mut [u8] {
        match &mut self.linear {
            LinearStore::Unbacked => &mut [],
            // SAFETY: As in `linear`, plus `&mut self` gives exclusivity on
            // the host side.
            LinearStore::Alias(iov) => unsafe { iov.as_mut_slice() },
            LinearStore::Shadow(shadow) => shadow,
        }
    }

    pub fn owns_shadow(&self) -> bool {
        matches!(self.linear, LinearStore::Shadow(_))
    }

    /// Validates guest-supplied geometry and returns the linear byte span
    /// `(offset, length)` a transfer touches, or `None` when the clipped box
    /// is empty (success no-op).
    fn transfer_span(&self, offset: u64, transfer_box: &Box3) -> VirglResult<Option<(usize, usize)>> {
        if transfer_box.x >= self.args.width || transfer_box.y >= self.args.height {
            return Ok(None);
        }
        let mut b = *transfer_box;
        b.w = b.w.min(self.args.width - b.x);
        b.h = b.h.min(self.args.height - b.y);
        if b.is_empty() {
            return Ok(None);
        }

        let bpp = bytes_per_pixel(self.args.format);
        let stride = row_stride(self.args.width, self.args.format);
        let length = (b.h as usize - 1)
            .checked_mul(stride)
            .and_then(|v| v.checked_add(b.w as usize * bpp))
            .ok_or(VirglError::OutOfBounds)?;
        let offset = usize::try_from(offset).map_err(|_| VirglError::OutOfBounds)?;
        let end = offset.checked_add(length).ok_or(VirglError::OutOfBounds)?;
        if end > self.linear_size {
            return Err(VirglError::OutOfBounds);
        }
        Ok(Some((offset, length)))
    }

    /// Guest iovecs -> linear. The byte copy only happens in shadow mode;
    /// with a single span the linear view already is the guest memory.
    pub fn iovec_to_linear(&mut self, offset: u64, transfer_box: &Box3) -> VirglResult<()> {
        let Some((offset, length)) = self.transfer_span(offset, transfer_box)? else {
            return Ok(());
        };
        let LinearStore::Shadow(shadow) = &mut self.linear else {
            return Ok(());
        };
        trace!("sync iovec->linear offset {offset} length {length}");
        let mut span_base = 0usize;
        for iov in &self.iovs {
            let start = offset.max(span_base);
            let end = (offset + length).min(span_base + iov.len);
            if start < end {
                // SAFETY: The span is attached guest memory and the overlap
                // range lies within its length.
                let src = unsafe { iov.as_slice() };
                shadow[start..end].copy_from_slice(&src[start - span_base..end - span_base]);
            }
            span_base += iov.len;
        }
        Ok(())
    }

    /// Linear -> guest iovecs, the reverse of [`Resource::iovec_to_linear`].
    pub fn linear_to_iovec(&mut self, offset: u64, transfer_box: &Box3) -> VirglResult<()> {
        let Some((offset, length)) = self.transfer_span(offset, transfer_box)? else {
            return Ok(());
        };
        if !self.owns_shadow() {
            return Ok(());
        }
        trace!("sync linear->iovec offset {offset} length {length}");
        self.flush_span(offset, length);
        Ok(())
    }

    /// Returns the host texture backing this resource, creating it on first
    /// use. `None` when the driver has no GL interop.
    pub fn ensure_texture(&mut self, driver: &Driver) -> VirglResult<Option<u32>> {
        if self.tex_id.is_none() {
            match driver.create_texture(self.args.width, self.args.height, self.args.format) {
                Ok(tex) => self.tex_id = Some(tex),
                Err(DriverError::Unsupported) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(self.tex_id)
    }

    /// Releases the host texture, if one was materialized. The caller drops
    /// the interop image first; it wraps this texture.
    pub fn release_texture(&mut self, driver: &Driver) {
        if let Some(tex) = self.tex_id.take() {
            if let Err(e) = driver.delete_texture(tex) {
                warn!("host texture delete failed: {e}");
            }
        }
    }

    /// Pushes a raw linear byte span out to the guest spans. Used by the
    /// response path, which deals in bytes rather than pixel boxes. Caller
    /// has bounds-checked the span.
    pub fn flush_span(&mut self, offset: usize, length: usize) {
        let LinearStore::Shadow(shadow) = &self.linear else {
            return;
        };
        let mut span_base = 0usize;
        for iov in &self.iovs {
            let start = offset.max(span_base);
            let end = (offset + length).min(span_base + iov.len);
            if start < end {
                // SAFETY: The span is attached guest memory and the overlap
                // range lies within its length.
                let dst = unsafe { iov.as_mut_slice() };
                dst[start - span_base..end - span_base].copy_from_slice(&shadow[start..end]);
            }
            span_base += iov.len;
        }
    }
}

/// All live resources, keyed by the guest-assigned handle.
#[derive(Default)]
pub struct ResourceRegistry {
    map: BTreeMap<u32, Resource>,
}

impl ResourceRegistry {
    pub fn create(&mut self, args: ResourceCreateArgs, iovs: Vec<GpuIovec>) -> VirglResult<()> {
        // Handle reuse means the device model lost track of its own
        // allocations; that is not a guest-recoverable condition.
        assert!(
            !self.map.contains_key(&args.handle),
            "duplicate registration of resource {}",
            args.handle
        );
        if args.bind & PIPE_BIND_CURSOR != 0
            && (args.width != CURSOR_WIDTH
                || args.height != CURSOR_HEIGHT
                || args.format != VIRGL_FORMAT_B8G8R8A8_UNORM)
        {
            return Err(VirglError::InvalidParameter("cursor resource geometry"));
        }
        trace!("resource_create handle {} {}x{}", args.handle, args.width, args.height);
        self.map.insert(args.handle, Resource::new(args, iovs));
        Ok(())
    }

    pub fn get(&self, handle: u32) -> VirglResult<&Resource> {
        self.map
            .get(&handle)
            .ok_or(VirglError::InvalidResourceId(handle))
    }

    pub fn get_mut(&mut self, handle: u32) -> VirglResult<&mut Resource> {
        self.map
            .get_mut(&handle)
            .ok_or(VirglError::InvalidResourceId(handle))
    }

    pub fn attach_iov(&mut self, handle: u32, iovs: Vec<GpuIovec>) -> VirglResult<()> {
        self.get_mut(handle)?.realloc_linear(iovs);
        Ok(())
    }

    pub fn detach_iov(&mut self, handle: u32) -> VirglResult<()> {
        self.get_mut(handle)?.realloc_linear(Vec::new());
        Ok(())
    }

    /// Final removal, releasing any host-side GL objects. Detaching from
    /// contexts is the caller's job; arriving here still attached is a
    /// backend bug.
    pub fn remove(&mut self, handle: u32, driver: &Driver) -> VirglResult<Resource> {
        let mut res = self
            .map
            .remove(&handle)
            .ok_or(VirglError::InvalidResourceId(handle))?;
        assert!(
            res.attached.is_empty(),
            "resource {handle} unreferenced while attached to contexts"
        );
        // Interop image before the texture it wraps.
        res.image = None;
        res.release_texture(driver);
        Ok(res)
    }

    /// Teardown path: releases the host-side GL objects of every resource
    /// still registered.
    pub fn release_host_objects(&mut self, driver: &Driver) {
        for res in self.map.values_mut() {
            res.image = None;
            res.release_texture(driver);
        }
    }

    /// Reports stride/fourcc, uploading the CPU copy into a host texture
    /// when the driver supports interop.
    pub fn get_info(&mut self, handle: u32, driver: &Driver) -> VirglResult<ResourceInfo> {
        let res = self.get_mut(handle)?;
        let stride = row_stride(res.args.width, res.args.format) as u32;
        let fourcc = format_fourcc(res.args.format);
        if let Some(tex) = res.ensure_texture(driver)? {
            let data = res.linear().to_vec();
            driver.upload_texture(tex, res.args.width, res.args.height, res.args.format, &data)?;
        }
        Ok(ResourceInfo {
            stride,
            fourcc,
            tex_id: res.tex_id,
        })
    }

    pub fn contains(&self, handle: u32) -> bool {
        self.map.contains_key(&handle)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::protocol::{VIRGL_FORMAT_R8_UNORM, VIRGL_FORMAT_R8G8B8A8_UNORM};
    use crate::testutils::{args_2d, iovs_of, GuestMem};

    #[test]
    fn single_iov_aliases_guest_memory() {
        let mem = GuestMem::new(&[64 * 64 * 4]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 64, 64, VIRGL_FORMAT_B8G8R8A8_UNORM), iovs_of(&mem))
            .unwrap();
        let res = reg.get(1).unwrap();
        assert!(!res.owns_shadow());
        assert_eq!(res.linear_size(), 64 * 64 * 4);
    }

    #[test]
    fn multi_iov_owns_shadow() {
        let mem = GuestMem::new(&[4096, 4096]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 32, 64, VIRGL_FORMAT_B8G8R8A8_UNORM), iovs_of(&mem))
            .unwrap();
        assert!(reg.get(1).unwrap().owns_shadow());
    }

    #[test]
    #[should_panic(expected = "duplicate registration")]
    fn duplicate_handle_is_fatal() {
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(7, 4, 4, VIRGL_FORMAT_R8_UNORM), Vec::new())
            .unwrap();
        let _ = reg.create(args_2d(7, 4, 4, VIRGL_FORMAT_R8_UNORM), Vec::new());
    }

    #[test]
    fn cursor_geometry_is_enforced() {
        let mut reg = ResourceRegistry::default();
        let mut args = args_2d(2, 32, 32, VIRGL_FORMAT_B8G8R8A8_UNORM);
        args.bind |= PIPE_BIND_CURSOR;
        assert_matches!(
            reg.create(args, Vec::new()),
            Err(VirglError::InvalidParameter(_))
        );
        let mut args = args_2d(2, 64, 64, VIRGL_FORMAT_B8G8R8A8_UNORM);
        args.bind |= PIPE_BIND_CURSOR;
        assert_matches!(reg.create(args, Vec::new()), Ok(()));
    }

    #[test]
    fn out_of_bounds_transfer_copies_nothing() {
        let mem = GuestMem::new(&[64, 64]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 8, 8, VIRGL_FORMAT_R8_UNORM), iovs_of(&mem))
            .unwrap();
        mem.fill(0, 0xAA);
        let res = reg.get_mut(1).unwrap();
        let before = res.linear().to_vec();
        // 8 rows at stride 16 starting at offset 16 runs past 128 bytes.
        assert_matches!(
            res.iovec_to_linear(16, &Box3::new_2d(0, 0, 8, 8)),
            Err(VirglError::OutOfBounds)
        );
        assert_eq!(res.linear(), &before[..]);
    }

    #[test]
    fn box_outside_bounds_is_a_noop() {
        let mem = GuestMem::new(&[64, 64]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 8, 8, VIRGL_FORMAT_R8_UNORM), iovs_of(&mem))
            .unwrap();
        let res = reg.get_mut(1).unwrap();
        assert_matches!(res.iovec_to_linear(0, &Box3::new_2d(8, 0, 4, 4)), Ok(()));
        assert_matches!(res.iovec_to_linear(0, &Box3::new_2d(0, 0, 0, 4)), Ok(()));
    }

    #[test]
    fn round_trip_is_idempotent() {
        let mem = GuestMem::new(&[100, 156]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 16, 16, VIRGL_FORMAT_R8_UNORM), iovs_of(&mem))
            .unwrap();
        for i in 0..100 {
            mem.write_byte(0, i, i as u8);
        }
        for i in 0..156 {
            mem.write_byte(1, i, (200 + i) as u8);
        }
        let res = reg.get_mut(1).unwrap();
        let full = Box3::new_2d(0, 0, 16, 16);
        res.iovec_to_linear(0, &full).unwrap();
        let snapshot = res.linear().to_vec();
        res.linear_to_iovec(0, &full).unwrap();
        res.iovec_to_linear(0, &full).unwrap();
        assert_eq!(res.linear(), &snapshot[..]);
    }

    #[test]
    fn pattern_lands_in_shadow_and_detach_clears() {
        // Two spans, write a pattern into the second, sync, observe it in
        // the shadow at the right place, then detach.
        let mem = GuestMem::new(&[128, 128]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(5, 16, 16, VIRGL_FORMAT_R8_UNORM), iovs_of(&mem))
            .unwrap();
        for i in 0..16 {
            mem.write_byte(1, i, 0x5A);
        }
        let res = reg.get_mut(5).unwrap();
        res.iovec_to_linear(0, &Box3::new_2d(0, 0, 16, 16)).unwrap();
        assert_eq!(&res.linear()[128..144], &[0x5A; 16]);
        reg.detach_iov(5).unwrap();
        assert_eq!(reg.get(5).unwrap().linear_size(), 0);
    }

    #[test]
    fn shadow_content_survives_reattach() {
        let mem = GuestMem::new(&[64, 64]);
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(1, 8, 8, VIRGL_FORMAT_R8_UNORM), iovs_of(&mem))
            .unwrap();
        mem.fill(0, 0x11);
        mem.fill(1, 0x22);
        let res = reg.get_mut(1).unwrap();
        res.iovec_to_linear(0, &Box3::new_2d(0, 0, 8, 8)).unwrap();
        let snapshot = res.linear().to_vec();
        let mem2 = GuestMem::new(&[64, 64]);
        reg.attach_iov(1, iovs_of(&mem2)).unwrap();
        assert_eq!(reg.get(1).unwrap().linear(), &snapshot[..]);
    }

    #[test]
    fn remove_unknown_handle_errors() {
        let mut reg = ResourceRegistry::default();
        let driver = crate::testutils::fake_driver();
        assert_matches!(
            reg.remove(9, &driver).err(),
            Some(VirglError::InvalidResourceId(9))
        );
    }

    #[test]
    fn remove_releases_the_host_texture() {
        use crate::testutils::{FakeEglDriver, FakeState};

        let fake = std::sync::Arc::new(FakeState::default());
        let driver = Driver::new(Box::new(FakeEglDriver(std::sync::Arc::clone(&fake))));
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(3, 4, 4, VIRGL_FORMAT_R8G8B8A8_UNORM), Vec::new())
            .unwrap();
        let tex = reg.get_info(3, &driver).unwrap().tex_id.unwrap();
        reg.remove(3, &driver).unwrap();
        assert_eq!(*fake.destroyed_textures.lock().unwrap(), vec![tex]);
    }

    #[test]
    fn get_info_reports_stride_and_fourcc() {
        let mut reg = ResourceRegistry::default();
        reg.create(args_2d(3, 33, 4, VIRGL_FORMAT_R8G8B8A8_UNORM), Vec::new())
            .unwrap();
        let driver = crate::testutils::fake_driver();
        let info = reg.get_info(3, &driver).unwrap();
        assert_eq!(info.stride, 144);
        assert_eq!(info.fourcc, crate::protocol::DRM_FORMAT_ABGR8888);
        assert!(info.tex_id.is_some());
    }
}
