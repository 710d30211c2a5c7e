//! Rotation, translation and scale of a cell relative to its parent.
//!
//! All spatial math goes through `glam`. A [`Transform`] is a plain `Copy`
//! value: cloning is a bitwise copy and never aliases another cell's state.

use glam::{Mat4, Quat, Vec3};

use crate::bounds::BoundingVolume;
use crate::config::Composition;

/// Relative tolerance for treating scale components as equal.
const SCALE_TOLERANCE: f32 = 1e-6;

/// A scale-rotate-translate transform. The rotation is kept normalized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    rotation: Quat,
    translation: Vec3,
    scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
        scale: Vec3::ONE,
    };

    /// Build a transform, normalizing `rotation`. A degenerate (zero-length)
    /// quaternion is replaced by the identity rotation.
    pub fn new(rotation: Quat, translation: Vec3, scale: Vec3) -> Self {
        Self {
            rotation: normalize(rotation),
            translation,
            scale,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self {
            translation,
            ..Self::IDENTITY
        }
    }

    pub fn from_rotation(rotation: Quat) -> Self {
        Self::new(rotation, Vec3::ZERO, Vec3::ONE)
    }

    pub fn from_rotation_translation(rotation: Quat, translation: Vec3) -> Self {
        Self::new(rotation, translation, Vec3::ONE)
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale;
        self
    }

    pub fn rotation(&self) -> Quat {
        self.rotation
    }

    pub fn translation(&self) -> Vec3 {
        self.translation
    }

    pub fn scale(&self) -> Vec3 {
        self.scale
    }

    /// Compose `self` (the parent frame) with `child` using standard affine
    /// semantics: the result applies `child` first, then `self`.
    ///
    /// Exact for uniform parent scale. With non-uniform parent scale and a
    /// rotated child the result is the closest TRS approximation, because a
    /// sheared frame cannot be stored in this representation.
    pub fn mul(&self, child: &Transform) -> Transform {
        Self {
            rotation: normalize(self.rotation * child.rotation),
            translation: self.translation + self.rotation * (self.scale * child.translation),
            scale: self.scale * child.scale,
        }
    }

    /// The simplified composition kept for compatibility: translations are
    /// summed without rotating and the parent's scale passes through.
    pub fn mul_legacy(&self, child: &Transform) -> Transform {
        Self {
            rotation: normalize(self.rotation * child.rotation),
            translation: self.translation + child.translation,
            scale: self.scale,
        }
    }

    /// Compose `parent` with `child` under the selected semantics.
    pub fn compose(parent: &Transform, child: &Transform, mode: Composition) -> Transform {
        match mode {
            Composition::Affine => parent.mul(child),
            Composition::Legacy => parent.mul_legacy(child),
        }
    }

    /// The local transform that places a cell at `world` when attached under
    /// a parent whose world transform is `parent`. `local_scale` is only
    /// consulted in legacy mode, where scale does not compose.
    ///
    /// Returns `None` in affine mode unless the parent's scale is uniform and
    /// non-zero; any other parent frame would give the child a sheared local
    /// transform.
    pub fn relative_to(
        parent: &Transform,
        world: &Transform,
        local_scale: Vec3,
        mode: Composition,
    ) -> Option<Transform> {
        match mode {
            Composition::Affine if !parent.has_uniform_scale() => None,
            Composition::Affine => parent.inverse().map(|inv| inv.mul(world)),
            Composition::Legacy => Some(Self::new(
                parent.rotation.inverse() * world.rotation,
                world.translation - parent.translation,
                local_scale,
            )),
        }
    }

    /// True when all three scale components are equal.
    pub fn has_uniform_scale(&self) -> bool {
        let s = self.scale;
        let tolerance = SCALE_TOLERANCE * s.abs().max_element().max(1.0);
        (s.x - s.y).abs() <= tolerance && (s.x - s.z).abs() <= tolerance
    }

    /// Inverse transform. `None` if any scale component is zero, or if the
    /// scale is non-uniform under a rotation: that inverse scales along
    /// rotated axes, which no scale-rotate-translate value can express.
    pub fn inverse(&self) -> Option<Transform> {
        if self.scale.cmpeq(Vec3::ZERO).any() {
            return None;
        }
        let unrotated = self.rotation.abs_diff_eq(Quat::IDENTITY, SCALE_TOLERANCE)
            || self.rotation.abs_diff_eq(-Quat::IDENTITY, SCALE_TOLERANCE);
        if !unrotated && !self.has_uniform_scale() {
            return None;
        }
        let rotation = self.rotation.inverse();
        let scale = self.scale.recip();
        Some(Self {
            rotation,
            translation: -(scale * (rotation * self.translation)),
            scale,
        })
    }

    /// Scale, then rotate, then translate `point`.
    pub fn apply_to_point(&self, point: Vec3) -> Vec3 {
        self.translation + self.rotation * (self.scale * point)
    }

    /// Move `volume` into this transform's frame. Boxes are re-enclosed
    /// conservatively since a rotated box is no longer axis aligned.
    pub fn apply_to_volume(&self, volume: &BoundingVolume) -> BoundingVolume {
        volume.transform(self.rotation, self.translation, self.scale)
    }

    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// Component-wise comparison within `max_abs_diff`.
    pub fn abs_diff_eq(&self, other: &Transform, max_abs_diff: f32) -> bool {
        // q and -q are the same rotation.
        let rotation = self.rotation.abs_diff_eq(other.rotation, max_abs_diff)
            || self.rotation.abs_diff_eq(-other.rotation, max_abs_diff);
        rotation
            && self.translation.abs_diff_eq(other.translation, max_abs_diff)
            && self.scale.abs_diff_eq(other.scale, max_abs_diff)
    }
}

fn normalize(rotation: Quat) -> Quat {
    if rotation.length_squared() > f32::EPSILON {
        rotation.normalize()
    } else {
        Quat::IDENTITY
    }
}
