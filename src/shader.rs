//! Programmable shader ABI and caller-owned buffer views.
//!
//! Shaders are plain function pointers. The vertex shader receives one
//! vertex's raw input bytes and writes its active attributes; the fragment
//! shader receives attributes interpolated at four pixel centers at once
//! (one quad) and writes four linear RGBA colors.

use glam::{Vec2, Vec3, Vec4};

use crate::config::MAX_VERTEX_ATTRIBUTES;
use crate::sync::SendPtr;

/// Vertex shader: raw vertex input -> clip-space position plus attributes.
pub type VertexShader = fn(vertex_in: &[u8], out: &mut VertexAttributes, constants: &[u8]) -> Vec4;

/// Fragment shader: interpolated quad attributes -> four linear RGBA colors.
pub type FragmentShader =
    fn(attrs: &InterpolatedAttributes, constants: &[u8], out: &mut FragmentOutput);

/// Counts of active vertex attributes per width class.
#[derive(Clone, Copy, Debug, Default)]
pub struct ShaderMetadata {
    pub num_vec4: usize,
    pub num_vec3: usize,
    pub num_vec2: usize,
}

impl ShaderMetadata {
    pub fn new(num_vec4: usize, num_vec3: usize, num_vec2: usize) -> Self {
        Self {
            num_vec4,
            num_vec3,
            num_vec2,
        }
    }

    pub(crate) fn validate(&self) {
        assert!(
            self.num_vec4 <= MAX_VERTEX_ATTRIBUTES
                && self.num_vec3 <= MAX_VERTEX_ATTRIBUTES
                && self.num_vec2 <= MAX_VERTEX_ATTRIBUTES,
            "shader metadata exceeds the {} attributes per width class",
            MAX_VERTEX_ATTRIBUTES
        );
    }
}

/// Post-vertex-shader attribute payload for one vertex.
#[derive(Clone, Copy, Debug, Default)]
pub struct VertexAttributes {
    pub vec4: [Vec4; MAX_VERTEX_ATTRIBUTES],
    pub vec3: [Vec3; MAX_VERTEX_ATTRIBUTES],
    pub vec2: [Vec2; MAX_VERTEX_ATTRIBUTES],
}

/// One attribute component interpolated at the four pixel centers of a quad.
pub type QuadLane = [f32; 4];

/// A vec4 attribute across a quad, one lane array per component.
#[derive(Clone, Copy, Debug, Default)]
pub struct QuadVec4 {
    pub x: QuadLane,
    pub y: QuadLane,
    pub z: QuadLane,
    pub w: QuadLane,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QuadVec3 {
    pub x: QuadLane,
    pub y: QuadLane,
    pub z: QuadLane,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct QuadVec2 {
    pub x: QuadLane,
    pub y: QuadLane,
}

/// Attributes interpolated for the four samples of one quad, SoA layout.
#[derive(Clone, Copy, Debug, Default)]
pub struct InterpolatedAttributes {
    pub vec4: [QuadVec4; MAX_VERTEX_ATTRIBUTES],
    pub vec3: [QuadVec3; MAX_VERTEX_ATTRIBUTES],
    pub vec2: [QuadVec2; MAX_VERTEX_ATTRIBUTES],
}

/// Fragment shader output: linear RGBA in [0, 1] for the quad's four samples.
#[derive(Clone, Copy, Debug, Default)]
pub struct FragmentOutput {
    pub colors: [Vec4; 4],
}

/// View over caller-owned raw vertex data.
///
/// The engine reads `stride`-sized records out of this buffer and hands
/// them to the vertex shader untouched.
#[derive(Clone, Copy)]
pub struct VertexBufferView {
    pub(crate) data: SendPtr<u8>,
    pub(crate) len: usize,
}

impl VertexBufferView {
    /// # Safety
    /// `data..data + len` must stay valid for reads for as long as the
    /// engine holds this binding and any draw may run.
    pub unsafe fn from_raw_parts(data: *const u8, len: usize) -> Self {
        Self {
            data: SendPtr(data as *mut u8),
            len,
        }
    }

    /// Capture a slice. The borrow is not tracked: the caller must keep
    /// the slice's storage alive and unmodified while the engine holds
    /// this binding.
    pub fn from_slice(data: &[u8]) -> Self {
        unsafe { Self::from_raw_parts(data.as_ptr(), data.len()) }
    }

    pub(crate) const fn empty() -> Self {
        Self {
            data: SendPtr::null(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) unsafe fn record(&self, offset: usize, stride: usize) -> &[u8] {
        debug_assert!(offset + stride <= self.len, "vertex fetch out of bounds");
        std::slice::from_raw_parts(self.data.0.add(offset), stride)
    }
}

/// Width of the indices in an index buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    U16,
    U32,
}

/// View over a caller-owned triangle-list index buffer.
#[derive(Clone, Copy)]
pub struct IndexBufferView {
    data: SendPtr<u8>,
    len: usize,
    format: IndexFormat,
}

impl IndexBufferView {
    /// # Safety
    /// The pointed-to storage must stay valid for reads for as long as
    /// the engine holds this binding and any draw may run.
    pub unsafe fn from_raw_parts(data: *const u8, len: usize, format: IndexFormat) -> Self {
        Self {
            data: SendPtr(data as *mut u8),
            len,
            format,
        }
    }

    /// Capture a 16-bit index slice (borrow not tracked; see
    /// [`VertexBufferView::from_slice`]).
    pub fn from_u16(indices: &[u16]) -> Self {
        unsafe { Self::from_raw_parts(indices.as_ptr() as *const u8, indices.len(), IndexFormat::U16) }
    }

    /// Capture a 32-bit index slice (borrow not tracked).
    pub fn from_u32(indices: &[u32]) -> Self {
        unsafe { Self::from_raw_parts(indices.as_ptr() as *const u8, indices.len(), IndexFormat::U32) }
    }

    /// Fetch index `i`, widened to u32.
    #[inline]
    pub(crate) unsafe fn fetch(&self, i: usize) -> u32 {
        debug_assert!(i < self.len, "index fetch out of bounds");
        match self.format {
            IndexFormat::U16 => u32::from(*(self.data.0 as *const u16).add(i)),
            IndexFormat::U32 => *(self.data.0 as *const u32).add(i),
        }
    }
}

/// View over the caller-owned constant buffer blob passed verbatim to both
/// shader stages.
#[derive(Clone, Copy)]
pub struct ConstantBufferView {
    data: SendPtr<u8>,
    len: usize,
}

impl ConstantBufferView {
    /// # Safety
    /// The pointed-to storage must stay valid for reads for as long as
    /// the engine holds this binding and any draw may run.
    pub unsafe fn from_raw_parts(data: *const u8, len: usize) -> Self {
        Self {
            data: SendPtr(data as *mut u8),
            len,
        }
    }

    /// Capture a slice (borrow not tracked).
    pub fn from_slice(data: &[u8]) -> Self {
        unsafe { Self::from_raw_parts(data.as_ptr(), data.len()) }
    }

    pub(crate) const fn empty() -> Self {
        Self {
            data: SendPtr::null(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) unsafe fn bytes(&self) -> &[u8] {
        if self.data.is_null() {
            &[]
        } else {
            std::slice::from_raw_parts(self.data.0, self.len)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_view_widens_u16() {
        let indices: [u16; 4] = [0, 1, 2, 65535];
        let view = IndexBufferView::from_u16(&indices);
        unsafe {
            assert_eq!(view.fetch(0), 0);
            assert_eq!(view.fetch(3), 65535);
        }
    }

    #[test]
    fn index_view_reads_u32() {
        let indices: [u32; 3] = [7, 100_000, 3];
        let view = IndexBufferView::from_u32(&indices);
        unsafe {
            assert_eq!(view.fetch(1), 100_000);
        }
    }

    #[test]
    fn metadata_within_limits_validates() {
        ShaderMetadata::new(4, 4, 4).validate();
    }

    #[test]
    #[should_panic(expected = "shader metadata")]
    fn metadata_over_limit_panics() {
        ShaderMetadata::new(5, 0, 0).validate();
    }
}
