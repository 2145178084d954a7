//! Slot-addressed triangle setup scratch.
//!
//! Everything a primitive needs after the geometry stage lives here,
//! indexed by its slot id within the current draw iteration: the three
//! edge-coefficient triples, the screen bounding box, the depth deltas and
//! the per-attribute interpolation deltas. All storage is preallocated for
//! the iteration cap so nothing can reallocate mid-draw, and each slot is
//! written by exactly one worker (the owner of the primitive's slice)
//! before the post-binning barrier and read-only after it.

use glam::Vec3;

use crate::config::MAX_VERTEX_ATTRIBUTES;
use crate::sync::SharedCell;

/// Axis-aligned rectangle in raster space.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect2D {
    pub min_x: f32,
    pub min_y: f32,
    pub max_x: f32,
    pub max_y: f32,
}

impl Rect2D {
    /// Intersect with another rectangle (used to clip a primitive's bbox
    /// to a tile).
    #[inline]
    pub fn intersect(&self, other: &Rect2D) -> Rect2D {
        Rect2D {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        }
    }
}

/// Interpolation deltas `(a0 - a2, a1 - a2, a2)` for one attribute
/// component.
pub(crate) type DeltaTriple = Vec3;

/// Shared setup scratch for one draw iteration.
///
/// # Safety
/// The accessors do no synchronization. Writers may only touch slots they
/// own during the geometry stage; readers may only run after the
/// post-binning barrier (see module docs).
pub(crate) struct SetupBuffers {
    max_prims: usize,
    /// Edge-coefficient triples `(a, b, c)`, three per slot.
    edges: Vec<SharedCell<[Vec3; 3]>>,
    /// Raster-space bounding box per slot, cached at binning.
    bboxes: Vec<SharedCell<Rect2D>>,
    /// `(z0 - z2, z1 - z2, z2)` per slot.
    z_deltas: Vec<SharedCell<DeltaTriple>>,
    /// `[attr][slot * 4 + component]` delta triples for vec4 attributes.
    attr4_deltas: Vec<SharedCell<DeltaTriple>>,
    /// `[attr][slot * 3 + component]` delta triples for vec3 attributes.
    attr3_deltas: Vec<SharedCell<DeltaTriple>>,
    /// `[attr][slot * 2 + component]` delta triples for vec2 attributes.
    attr2_deltas: Vec<SharedCell<DeltaTriple>>,
}

fn zeroed<T: Default>(len: usize) -> Vec<SharedCell<T>> {
    (0..len).map(|_| SharedCell::default()).collect()
}

impl SetupBuffers {
    pub(crate) fn new(max_prims: usize) -> Self {
        Self {
            max_prims,
            edges: zeroed(max_prims),
            bboxes: zeroed(max_prims),
            z_deltas: zeroed(max_prims),
            attr4_deltas: zeroed(MAX_VERTEX_ATTRIBUTES * max_prims * 4),
            attr3_deltas: zeroed(MAX_VERTEX_ATTRIBUTES * max_prims * 3),
            attr2_deltas: zeroed(MAX_VERTEX_ATTRIBUTES * max_prims * 2),
        }
    }

    pub(crate) unsafe fn store_edges(&self, slot: usize, coeffs: [Vec3; 3]) {
        self.edges[slot].write(coeffs);
    }

    pub(crate) unsafe fn edges(&self, slot: usize) -> [Vec3; 3] {
        self.edges[slot].read()
    }

    pub(crate) unsafe fn store_bbox(&self, slot: usize, bbox: Rect2D) {
        self.bboxes[slot].write(bbox);
    }

    pub(crate) unsafe fn bbox(&self, slot: usize) -> Rect2D {
        self.bboxes[slot].read()
    }

    pub(crate) unsafe fn store_z_deltas(&self, slot: usize, deltas: DeltaTriple) {
        self.z_deltas[slot].write(deltas);
    }

    pub(crate) unsafe fn z_deltas(&self, slot: usize) -> DeltaTriple {
        self.z_deltas[slot].read()
    }

    #[inline]
    fn attr_index(&self, attr: usize, slot: usize, component: usize, width: usize) -> usize {
        (attr * self.max_prims + slot) * width + component
    }

    pub(crate) unsafe fn store_attr4_delta(
        &self,
        attr: usize,
        slot: usize,
        component: usize,
        delta: DeltaTriple,
    ) {
        let idx = self.attr_index(attr, slot, component, 4);
        self.attr4_deltas[idx].write(delta);
    }

    pub(crate) unsafe fn attr4_delta(&self, attr: usize, slot: usize, component: usize) -> DeltaTriple {
        self.attr4_deltas[self.attr_index(attr, slot, component, 4)].read()
    }

    pub(crate) unsafe fn store_attr3_delta(
        &self,
        attr: usize,
        slot: usize,
        component: usize,
        delta: DeltaTriple,
    ) {
        let idx = self.attr_index(attr, slot, component, 3);
        self.attr3_deltas[idx].write(delta);
    }

    pub(crate) unsafe fn attr3_delta(&self, attr: usize, slot: usize, component: usize) -> DeltaTriple {
        self.attr3_deltas[self.attr_index(attr, slot, component, 3)].read()
    }

    pub(crate) unsafe fn store_attr2_delta(
        &self,
        attr: usize,
        slot: usize,
        component: usize,
        delta: DeltaTriple,
    ) {
        let idx = self.attr_index(attr, slot, component, 2);
        self.attr2_deltas[idx].write(delta);
    }

    pub(crate) unsafe fn attr2_delta(&self, attr: usize, slot: usize, component: usize) -> DeltaTriple {
        self.attr2_deltas[self.attr_index(attr, slot, component, 2)].read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_intersection_clamps_both_axes() {
        let a = Rect2D {
            min_x: 0.0,
            min_y: 0.0,
            max_x: 64.0,
            max_y: 64.0,
        };
        let b = Rect2D {
            min_x: 32.0,
            min_y: -8.0,
            max_x: 100.0,
            max_y: 40.0,
        };
        let c = a.intersect(&b);
        assert_eq!(
            c,
            Rect2D {
                min_x: 32.0,
                min_y: 0.0,
                max_x: 64.0,
                max_y: 40.0,
            }
        );
    }

    #[test]
    fn slot_storage_roundtrips() {
        let setup = SetupBuffers::new(4);
        let coeffs = [
            Vec3::new(1.0, 2.0, 3.0),
            Vec3::new(4.0, 5.0, 6.0),
            Vec3::new(7.0, 8.0, 9.0),
        ];
        unsafe {
            setup.store_edges(2, coeffs);
            assert_eq!(setup.edges(2), coeffs);

            setup.store_z_deltas(3, Vec3::new(0.1, 0.2, 0.3));
            assert_eq!(setup.z_deltas(3), Vec3::new(0.1, 0.2, 0.3));
        }
    }

    #[test]
    fn attribute_slots_do_not_alias() {
        let setup = SetupBuffers::new(8);
        unsafe {
            setup.store_attr4_delta(0, 0, 0, Vec3::splat(1.0));
            setup.store_attr4_delta(0, 0, 3, Vec3::splat(2.0));
            setup.store_attr4_delta(1, 0, 0, Vec3::splat(3.0));
            setup.store_attr4_delta(0, 7, 0, Vec3::splat(4.0));

            assert_eq!(setup.attr4_delta(0, 0, 0), Vec3::splat(1.0));
            assert_eq!(setup.attr4_delta(0, 0, 3), Vec3::splat(2.0));
            assert_eq!(setup.attr4_delta(1, 0, 0), Vec3::splat(3.0));
            assert_eq!(setup.attr4_delta(0, 7, 0), Vec3::splat(4.0));
        }
    }
}
