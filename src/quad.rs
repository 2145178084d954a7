//! 4-wide quad kernels: edge tests, basis functions, interpolation.
//!
//! A quad is one row of four horizontally adjacent pixels, sampled at the
//! pixel centers `(x + lane + 0.5, y + 0.5)`. On x86_64 the edge tests and
//! basis functions run as SSE2 comparison-and-movemask sequences; the
//! scalar versions compile everywhere and double as the oracle in the
//! unit tests.

use glam::Vec3;

use crate::shader::QuadLane;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64::*;

/// Evaluate the three edge functions at the quad's four sample centers and
/// return the combined 4-bit inside mask (bit i = sample `x + i`).
///
/// With `shared_edge_tiebreak` an exact edge hit (`E == 0`) counts as
/// inside only when the edge normal satisfies `a > 0`, or `a == 0` and
/// `b >= 0` — the top-left fill rule generalized to arbitrary edge
/// orientation, so triangles sharing an edge never both claim a sample.
#[inline]
pub(crate) fn edge_quad_mask(edges: &[Vec3; 3], px: f32, py: f32, shared_edge_tiebreak: bool) -> u8 {
    #[cfg(target_arch = "x86_64")]
    return unsafe { edge_quad_mask_sse2(edges, px, py, shared_edge_tiebreak) };

    #[cfg(not(target_arch = "x86_64"))]
    edge_quad_mask_scalar(edges, px, py, shared_edge_tiebreak)
}

/// Perspective basis functions `f0, f1` at the quad's four sample centers:
/// `F_k = a_k x + b_k y + c_k`, `f_k = F_k / (F0 + F1 + F2)`.
/// `f2 = 1 - f0 - f1` is implicit.
#[inline]
pub(crate) fn basis_functions(edges: &[Vec3; 3], px: f32, py: f32) -> (QuadLane, QuadLane) {
    #[cfg(target_arch = "x86_64")]
    return unsafe { basis_functions_sse2(edges, px, py) };

    #[cfg(not(target_arch = "x86_64"))]
    basis_functions_scalar(edges, px, py)
}

/// Reconstruct one attribute component at the four samples from its delta
/// triple: `f0 * d0 + f1 * d1 + d2`.
#[inline(always)]
pub(crate) fn interpolate(delta: Vec3, f0: &QuadLane, f1: &QuadLane) -> QuadLane {
    let mut out = [0.0f32; 4];
    for lane in 0..4 {
        out[lane] = delta.x * f0[lane] + delta.y * f1[lane] + delta.z;
    }
    out
}

/// LESS-OR-EQUAL depth test over a quad; bit i set when `z[i] <= current[i]`.
#[inline(always)]
pub(crate) fn depth_le_mask(z: &QuadLane, current: &QuadLane) -> u8 {
    let mut mask = 0u8;
    for lane in 0..4 {
        if z[lane] <= current[lane] {
            mask |= 1 << lane;
        }
    }
    mask
}

#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
#[inline(always)]
fn edge_inside_scalar(edge: Vec3, x: f32, y: f32, shared_edge_tiebreak: bool) -> bool {
    let f = edge.x * x + edge.y * y + edge.z;
    if shared_edge_tiebreak {
        f > 0.0 || (!(f < 0.0) && (edge.x > 0.0 || (edge.x == 0.0 && edge.y >= 0.0)))
    } else {
        f >= 0.0
    }
}

// On x86_64 the scalar versions serve as the oracle in the unit tests.
#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
pub(crate) fn edge_quad_mask_scalar(
    edges: &[Vec3; 3],
    px: f32,
    py: f32,
    shared_edge_tiebreak: bool,
) -> u8 {
    let y = py + 0.5;
    let mut mask = 0u8;
    for lane in 0..4 {
        let x = px + lane as f32 + 0.5;
        let inside = edges
            .iter()
            .all(|&e| edge_inside_scalar(e, x, y, shared_edge_tiebreak));
        if inside {
            mask |= 1 << lane;
        }
    }
    mask
}

#[cfg_attr(target_arch = "x86_64", allow(dead_code))]
pub(crate) fn basis_functions_scalar(edges: &[Vec3; 3], px: f32, py: f32) -> (QuadLane, QuadLane) {
    let y = py + 0.5;
    let mut f0 = [0.0f32; 4];
    let mut f1 = [0.0f32; 4];
    for lane in 0..4 {
        let x = px + lane as f32 + 0.5;
        let e0 = edges[0].x * x + edges[0].y * y + edges[0].z;
        let e1 = edges[1].x * x + edges[1].y * y + edges[1].z;
        let e2 = edges[2].x * x + edges[2].y * y + edges[2].z;
        let r = 1.0 / (e0 + e1 + e2);
        f0[lane] = e0 * r;
        f1[lane] = e1 * r;
    }
    (f0, f1)
}

#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn sample_positions(px: f32, py: f32) -> (__m128, __m128) {
    let x4 = _mm_setr_ps(px + 0.5, px + 1.5, px + 2.5, px + 3.5);
    let y4 = _mm_set1_ps(py + 0.5);
    (x4, y4)
}

#[cfg(target_arch = "x86_64")]
unsafe fn edge_quad_mask_sse2(
    edges: &[Vec3; 3],
    px: f32,
    py: f32,
    shared_edge_tiebreak: bool,
) -> u8 {
    let (x4, y4) = sample_positions(px, py);
    let zero = _mm_setzero_ps();
    let mut combined = _mm_castsi128_ps(_mm_set1_epi32(-1));

    for &edge in edges.iter() {
        let a = _mm_set1_ps(edge.x);
        let b = _mm_set1_ps(edge.y);
        let c = _mm_set1_ps(edge.z);

        // E(x, y) = a * x + b * y + c
        let func = _mm_add_ps(c, _mm_add_ps(_mm_mul_ps(x4, a), _mm_mul_ps(y4, b)));

        let inside = if shared_edge_tiebreak {
            // E > 0  ||  (!(E < 0) && (a > 0 || (a == 0 && b >= 0)))
            let positive = _mm_cmpgt_ps(func, zero);
            let negative = _mm_cmplt_ps(func, zero);
            let a_positive = _mm_cmpgt_ps(a, zero);
            let b_nonneg_a_zero = _mm_and_ps(_mm_cmpge_ps(b, zero), _mm_cmpeq_ps(a, zero));
            _mm_or_ps(
                positive,
                _mm_andnot_ps(negative, _mm_or_ps(a_positive, b_nonneg_a_zero)),
            )
        } else {
            _mm_cmpge_ps(func, zero)
        };

        combined = _mm_and_ps(combined, inside);
    }

    (_mm_movemask_ps(combined) & 0xF) as u8
}

#[cfg(target_arch = "x86_64")]
unsafe fn basis_functions_sse2(edges: &[Vec3; 3], px: f32, py: f32) -> (QuadLane, QuadLane) {
    let (x4, y4) = sample_positions(px, py);

    let eval = |edge: Vec3| unsafe {
        _mm_add_ps(
            _mm_set1_ps(edge.z),
            _mm_add_ps(
                _mm_mul_ps(x4, _mm_set1_ps(edge.x)),
                _mm_mul_ps(y4, _mm_set1_ps(edge.y)),
            ),
        )
    };

    let f0 = eval(edges[0]);
    let f1 = eval(edges[1]);
    let f2 = eval(edges[2]);

    // Exact reciprocal so this path agrees bit-for-bit with the scalar
    // oracle and the output is worker-count independent.
    let sum = _mm_add_ps(f2, _mm_add_ps(f0, f1));
    let r = _mm_div_ps(_mm_set1_ps(1.0), sum);

    let mut out0 = [0.0f32; 4];
    let mut out1 = [0.0f32; 4];
    _mm_storeu_ps(out0.as_mut_ptr(), _mm_mul_ps(r, f0));
    _mm_storeu_ps(out1.as_mut_ptr(), _mm_mul_ps(r, f1));
    (out0, out1)
}
