//! Tile-based parallel software rasterizer.
//!
//! Indexed triangle geometry plus programmable vertex/fragment shaders in,
//! RGBA8 color and D32 float depth images out. Rendering is pipelined
//! across long-lived worker threads: each draw iteration runs vertex
//! shading, binning, hierarchical edge-function rasterization
//! (tile -> 8x8 block -> 4-pixel quad) and fragment shading, with two
//! lock-free barriers preserving primitive submission order between the
//! stages.

pub mod config;
pub mod coverage;
pub mod engine;
pub mod framebuffer;
pub mod queue;
pub mod setup;
pub mod shader;

mod quad;
mod sync;
mod worker;

pub use config::{RasterizerConfig, MAX_VERTEX_ATTRIBUTES, PIXEL_BLOCK_SIZE, SIMD_WIDTH};
pub use coverage::{CoverageMask, CoverageMaskKind};
pub use engine::RenderEngine;
pub use framebuffer::Framebuffer;
pub use queue::INVALID_TILE;
pub use shader::{
    ConstantBufferView, FragmentOutput, FragmentShader, IndexBufferView, IndexFormat,
    InterpolatedAttributes, QuadVec2, QuadVec3, QuadVec4, ShaderMetadata, VertexAttributes,
    VertexBufferView, VertexShader,
};
