// SPDX-License-Identifier: Apache-2.0 or BSD-3-Clause

//! Wire formats shared with the guest.
//!
//! Two nested layers exist: the outer command buffer submitted through
//! `submit_cmd` (a fixed header followed by an opaque payload) and, inside
//! non-handshake payloads, the embedded render-control stream of
//! `{opcode, size}`-framed calls.

#![allow(non_camel_case_types)]

use std::mem::size_of;

use vm_memory::{ByteValued, Le32};
pub use virtio_bindings::virtio_gpu::{
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_SUBMIT_3D as VIRTIO_GPU_CMD_SUBMIT_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D as VIRTIO_GPU_CMD_TRANSFER_FROM_HOST_3D,
    virtio_gpu_ctrl_type_VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D as VIRTIO_GPU_CMD_TRANSFER_TO_HOST_3D,
};

/// Fixed size of the response channel resource a guest must allocate before
/// it can submit GL commands. The handshake refuses anything else.
pub const MAX_CMD_RESP_BUF_SIZE: usize = 10 * 4096;

/// Outer command op establishing the response channel for a context.
pub const CMD_OP_HANDSHAKE: u32 = 0;

/// Header every submitted command buffer and every response starts with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virgl_cmd_hdr {
    pub op: Le32,
    /// Total byte size of the command (or response), header included.
    pub cmd_size: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virgl_cmd_hdr {}

pub const CMD_HDR_SIZE: usize = size_of::<virgl_cmd_hdr>();

/// Framing of one embedded render-control or GLES call inside a command
/// buffer payload.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct virgl_call_hdr {
    pub opcode: Le32,
    /// Byte size of the call, this header included.
    pub size: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for virgl_call_hdr {}

pub const CALL_HDR_SIZE: usize = size_of::<virgl_call_hdr>();

// Render-control opcodes. The numbering follows the emulated protocol, which
// starts its opcode space at 10000.
pub const OP_RC_GET_RENDERER_VERSION: u32 = 10000;
pub const OP_RC_GET_EGL_VERSION: u32 = 10001;
pub const OP_RC_QUERY_GL_STRING: u32 = 10002;
pub const OP_RC_CREATE_CONTEXT: u32 = 10007;
pub const OP_RC_DESTROY_CONTEXT: u32 = 10008;
pub const OP_RC_CREATE_WINDOW_SURFACE: u32 = 10009;
pub const OP_RC_DESTROY_WINDOW_SURFACE: u32 = 10010;
pub const OP_RC_CREATE_COLOR_BUFFER: u32 = 10011;
pub const OP_RC_FLUSH_WINDOW_COLOR_BUFFER: u32 = 10015;
pub const OP_RC_MAKE_CURRENT: u32 = 10016;
pub const OP_RC_BIND_TEXTURE: u32 = 10019;
pub const OP_RC_BIND_RENDERBUFFER: u32 = 10020;
pub const OP_RC_CREATE_CLIENT_IMAGE: u32 = 10025;
pub const OP_RC_DESTROY_CLIENT_IMAGE: u32 = 10026;
pub const OP_RC_CREATE_SYNC: u32 = 10028;
pub const OP_RC_CLIENT_WAIT_SYNC: u32 = 10029;
pub const OP_RC_DESTROY_SYNC: u32 = 10031;
pub const OP_RC_SET_PUID: u32 = 10032;

/// First and last opcode the built-in render-control dispatcher owns.
pub const OP_RC_FIRST: u32 = OP_RC_GET_RENDERER_VERSION;
pub const OP_RC_LAST: u32 = OP_RC_SET_PUID;

/// Returned by `rcCreateColorBuffer` instead of a real object id; tells the
/// guest that window-surface storage is provided by the resource path and
/// the surface should behave as a pbuffer.
pub const RC_COLOR_BUFFER_SENTINEL: u32 = 0x7FFF_FFFF;

pub const EGL_TRUE: u32 = 1;
pub const EGL_FALSE: u32 = 0;

// Resource formats, following the virgl pipe-format numbering for the subset
// the backend distinguishes.
pub const VIRGL_FORMAT_B8G8R8A8_UNORM: u32 = 1;
pub const VIRGL_FORMAT_B5G6R5_UNORM: u32 = 7;
pub const VIRGL_FORMAT_R8_UNORM: u32 = 64;
pub const VIRGL_FORMAT_R8G8B8A8_UNORM: u32 = 67;

// Bind flags (pipe bind namespace).
pub const PIPE_BIND_RENDER_TARGET: u32 = 1 << 1;
pub const PIPE_BIND_SAMPLER_VIEW: u32 = 1 << 3;
pub const PIPE_BIND_CURSOR: u32 = 1 << 16;

// DRM fourccs reported by `resource_get_info`.
pub const DRM_FORMAT_ARGB8888: u32 = fourcc(b"AR24");
pub const DRM_FORMAT_ABGR8888: u32 = fourcc(b"AB24");
pub const DRM_FORMAT_RGB565: u32 = fourcc(b"RG16");
pub const DRM_FORMAT_R8: u32 = fourcc(b"R8  ");

const fn fourcc(code: &[u8; 4]) -> u32 {
    (code[0] as u32)
        | (code[1] as u32) << 8
        | (code[2] as u32) << 16
        | (code[3] as u32) << 24
}

/// Maps a resource format to the fourcc advertised to the guest.
pub const fn format_fourcc(format: u32) -> u32 {
    match format {
        VIRGL_FORMAT_B8G8R8A8_UNORM => DRM_FORMAT_ARGB8888,
        VIRGL_FORMAT_R8G8B8A8_UNORM => DRM_FORMAT_ABGR8888,
        VIRGL_FORMAT_B5G6R5_UNORM => DRM_FORMAT_RGB565,
        VIRGL_FORMAT_R8_UNORM => DRM_FORMAT_R8,
        _ => DRM_FORMAT_ARGB8888,
    }
}

/// Bytes per pixel for the formats the transfer path distinguishes. All
/// remaining virgl formats the guest may name are 4 bytes wide.
pub const fn bytes_per_pixel(format: u32) -> usize {
    match format {
        VIRGL_FORMAT_R8_UNORM => 1,
        VIRGL_FORMAT_B5G6R5_UNORM => 2,
        _ => 4,
    }
}

/// Row stride used everywhere guest-visible pixel data is laid out.
pub const fn row_stride(width: u32, format: u32) -> usize {
    align_up(width as usize * bytes_per_pixel(format), 16)
}

pub const fn align_up(v: usize, to: usize) -> usize {
    (v + to - 1) / to * to
}

/// Version reported by `rcGetRendererVersion`.
pub const RENDERER_VERSION: u32 = 1;

// Capability sets.
pub const CAPSET_RENDERER: u32 = 1;
pub const CAPSET_RENDERER_VERSION: u32 = 1;

/// Fixed-size capability block returned through `fill_caps`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[repr(C)]
pub struct renderer_caps_v1 {
    pub max_version: Le32,
    /// Bitmask over the distinguished formats, bit = format number % 32 of
    /// `sampler_start + n * 32`; only the four distinguished formats are set.
    pub sampler_formats: [Le32; 4],
    pub render_formats: [Le32; 4],
    pub max_texture_2d_size: Le32,
    pub max_viewport_width: Le32,
    pub max_viewport_height: Le32,
    pub gles1: Le32,
    pub gles3: Le32,
    pub padding: Le32,
}

// SAFETY: The layout of the structure is fixed and can be initialized by
// reading its content from byte array.
unsafe impl ByteValued for renderer_caps_v1 {}

impl renderer_caps_v1 {
    pub fn supported() -> Self {
        let mut caps = Self {
            max_version: CAPSET_RENDERER_VERSION.into(),
            max_texture_2d_size: 16384.into(),
            max_viewport_width: 16384.into(),
            max_viewport_height: 16384.into(),
            gles1: 1.into(),
            gles3: 1.into(),
            ..Self::default()
        };
        for format in [
            VIRGL_FORMAT_B8G8R8A8_UNORM,
            VIRGL_FORMAT_B5G6R5_UNORM,
            VIRGL_FORMAT_R8_UNORM,
            VIRGL_FORMAT_R8G8B8A8_UNORM,
        ] {
            let word = (format / 32) as usize;
            let bit = format % 32;
            let sampler: u32 = caps.sampler_formats[word].into();
            caps.sampler_formats[word] = (sampler | 1 << bit).into();
            let render: u32 = caps.render_formats[word].into();
            caps.render_formats[word] = (render | 1 << bit).into();
        }
        caps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bpp_mapping() {
        assert_eq!(bytes_per_pixel(VIRGL_FORMAT_R8_UNORM), 1);
        assert_eq!(bytes_per_pixel(VIRGL_FORMAT_B5G6R5_UNORM), 2);
        assert_eq!(bytes_per_pixel(VIRGL_FORMAT_B8G8R8A8_UNORM), 4);
        // Anything unrecognized is packed 32-bit.
        assert_eq!(bytes_per_pixel(999), 4);
    }

    #[test]
    fn stride_is_16_byte_aligned() {
        assert_eq!(row_stride(1, VIRGL_FORMAT_R8_UNORM), 16);
        assert_eq!(row_stride(64, VIRGL_FORMAT_B8G8R8A8_UNORM), 256);
        assert_eq!(row_stride(3, VIRGL_FORMAT_B5G6R5_UNORM), 16);
        assert_eq!(row_stride(33, VIRGL_FORMAT_B8G8R8A8_UNORM), 144);
    }

    #[test]
    fn fourcc_mapping() {
        assert_eq!(format_fourcc(VIRGL_FORMAT_B8G8R8A8_UNORM), 0x3432_5241);
        assert_eq!(format_fourcc(VIRGL_FORMAT_R8_UNORM), DRM_FORMAT_R8);
    }

    #[test]
    fn caps_block_reports_formats() {
        let caps = renderer_caps_v1::supported();
        let word: u32 = caps.sampler_formats[(VIRGL_FORMAT_R8_UNORM / 32) as usize].into();
        assert_ne!(word & 1 << (VIRGL_FORMAT_R8_UNORM % 32), 0);
        assert_eq!(u32::from(caps.max_version), CAPSET_RENDERER_VERSION);
    }
}
