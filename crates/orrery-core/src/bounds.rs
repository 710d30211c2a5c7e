//! Sphere and axis-aligned box bounding volumes.
//!
//! Volumes are plain `Copy` values. Combining two spheres yields a sphere and
//! two boxes yields a box; a mixed pair is widened to boxes first. An empty
//! volume (zero radius, or zero extent on every axis) is the identity for
//! [`BoundingVolume::combine`] and is enclosed by every other volume.

use glam::{Quat, Vec3};

/// Relative slack for containment tests so that a volume computed by
/// `combine` still passes `encloses` after float rounding.
const TOLERANCE: f32 = 1e-4;

fn slack(magnitude: f32) -> f32 {
    TOLERANCE * magnitude.abs().max(1.0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingVolume {
    Sphere { center: Vec3, radius: f32 },
    Aabb { center: Vec3, half_extents: Vec3 },
}

impl Default for BoundingVolume {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl BoundingVolume {
    pub const EMPTY: Self = Self::Sphere {
        center: Vec3::ZERO,
        radius: 0.0,
    };

    /// A sphere. Negative radii are clamped to zero.
    pub fn sphere(center: Vec3, radius: f32) -> Self {
        Self::Sphere {
            center,
            radius: radius.max(0.0),
        }
    }

    /// An axis-aligned box. Negative extents are clamped to zero.
    pub fn aabb(center: Vec3, half_extents: Vec3) -> Self {
        Self::Aabb {
            center,
            half_extents: half_extents.max(Vec3::ZERO),
        }
    }

    pub fn from_min_max(min: Vec3, max: Vec3) -> Self {
        Self::aabb((min + max) * 0.5, (max - min) * 0.5)
    }

    pub fn center(&self) -> Vec3 {
        match *self {
            Self::Sphere { center, .. } | Self::Aabb { center, .. } => center,
        }
    }

    pub fn is_empty(&self) -> bool {
        match *self {
            Self::Sphere { radius, .. } => radius <= 0.0,
            Self::Aabb { half_extents, .. } => half_extents.max_element() <= 0.0,
        }
    }

    /// Half extents of the smallest box holding this volume.
    fn box_half_extents(&self) -> Vec3 {
        match *self {
            Self::Sphere { radius, .. } => Vec3::splat(radius),
            Self::Aabb { half_extents, .. } => half_extents,
        }
    }

    pub fn min(&self) -> Vec3 {
        self.center() - self.box_half_extents()
    }

    pub fn max(&self) -> Vec3 {
        self.center() + self.box_half_extents()
    }

    /// The smallest axis-aligned box holding this volume.
    pub fn to_aabb(&self) -> Self {
        Self::Aabb {
            center: self.center(),
            half_extents: self.box_half_extents(),
        }
    }

    /// Volume after scaling, rotating, then translating. Spheres grow by the
    /// largest scale factor; boxes are re-enclosed along the world axes.
    pub fn transform(&self, rotation: Quat, translation: Vec3, scale: Vec3) -> Self {
        let moved = translation + rotation * (scale * self.center());
        match *self {
            Self::Sphere { radius, .. } => Self::Sphere {
                center: moved,
                radius: radius * scale.abs().max_element(),
            },
            Self::Aabb { half_extents, .. } => {
                let e = scale.abs() * half_extents;
                let x = (rotation * Vec3::X).abs();
                let y = (rotation * Vec3::Y).abs();
                let z = (rotation * Vec3::Z).abs();
                Self::Aabb {
                    center: moved,
                    half_extents: x * e.x + y * e.y + z * e.z,
                }
            }
        }
    }

    /// Smallest volume of the same family holding both operands.
    pub fn combine(&self, other: &Self) -> Self {
        if other.is_empty() {
            return *self;
        }
        if self.is_empty() {
            return *other;
        }
        match (*self, *other) {
            (
                Self::Sphere {
                    center: c1,
                    radius: r1,
                },
                Self::Sphere {
                    center: c2,
                    radius: r2,
                },
            ) => merge_spheres(c1, r1, c2, r2),
            _ => Self::from_min_max(self.min().min(other.min()), self.max().max(other.max())),
        }
    }

    pub fn contains(&self, point: Vec3) -> bool {
        if self.is_empty() {
            return false;
        }
        match *self {
            Self::Sphere { center, radius } => {
                center.distance(point) <= radius + slack(radius)
            }
            Self::Aabb {
                center,
                half_extents,
            } => {
                let tol = Vec3::splat(slack(half_extents.max_element()));
                (point - center).abs().cmple(half_extents + tol).all()
            }
        }
    }

    /// True if every point of `inner` lies within `self`.
    pub fn encloses(&self, inner: &Self) -> bool {
        if inner.is_empty() {
            return true;
        }
        if self.is_empty() {
            return false;
        }
        let offset = inner.center() - self.center();
        match (*self, *inner) {
            (Self::Sphere { radius, .. }, Self::Sphere { radius: r, .. }) => {
                offset.length() + r <= radius + slack(radius)
            }
            (Self::Sphere { radius, .. }, Self::Aabb { half_extents, .. }) => {
                // Farthest corner of the inner box.
                (offset.abs() + half_extents).length() <= radius + slack(radius)
            }
            (Self::Aabb { half_extents, .. }, inner) => {
                let tol = Vec3::splat(slack(half_extents.max_element()));
                (offset.abs() + inner.box_half_extents())
                    .cmple(half_extents + tol)
                    .all()
            }
        }
    }

    /// True if the two volumes share at least one point.
    pub fn intersects(&self, other: &Self) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        match (*self, *other) {
            (
                Self::Sphere {
                    center: c1,
                    radius: r1,
                },
                Self::Sphere {
                    center: c2,
                    radius: r2,
                },
            ) => c1.distance(c2) <= r1 + r2,
            (Self::Sphere { center, radius }, aabb @ Self::Aabb { .. })
            | (aabb @ Self::Aabb { .. }, Self::Sphere { center, radius }) => {
                let closest = center.clamp(aabb.min(), aabb.max());
                closest.distance_squared(center) <= radius * radius
            }
            (a, b) => {
                let reach = a.box_half_extents() + b.box_half_extents();
                (a.center() - b.center()).abs().cmple(reach).all()
            }
        }
    }
}

fn merge_spheres(c1: Vec3, r1: f32, c2: Vec3, r2: f32) -> BoundingVolume {
    let offset = c2 - c1;
    let distance = offset.length();
    if distance + r2 <= r1 {
        return BoundingVolume::sphere(c1, r1);
    }
    if distance + r1 <= r2 {
        return BoundingVolume::sphere(c2, r2);
    }
    // distance > 0 here, otherwise one sphere would hold the other.
    let radius = (distance + r1 + r2) * 0.5;
    let center = c1 + offset * ((radius - r1) / distance);
    BoundingVolume::sphere(center, radius)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::f32::consts::FRAC_PI_4;

    #[test]
    fn sphere_combine_is_smallest_enclosing() {
        let a = BoundingVolume::sphere(Vec3::ZERO, 1.0);
        let b = BoundingVolume::sphere(Vec3::new(4.0, 0.0, 0.0), 1.0);
        let c = a.combine(&b);
        assert_eq!(c.center(), Vec3::new(2.0, 0.0, 0.0));
        assert!(matches!(c, BoundingVolume::Sphere { radius, .. } if (radius - 3.0).abs() < 1e-6));
        assert!(c.encloses(&a));
        assert!(c.encloses(&b));
    }

    #[test]
    fn sphere_combine_keeps_enclosing_operand() {
        let big = BoundingVolume::sphere(Vec3::ZERO, 10.0);
        let small = BoundingVolume::sphere(Vec3::new(1.0, 1.0, 1.0), 2.0);
        assert_eq!(big.combine(&small), big);
        assert_eq!(small.combine(&big), big);
    }

    #[test]
    fn box_combine_is_union() {
        let a = BoundingVolume::from_min_max(Vec3::ZERO, Vec3::ONE);
        let b = BoundingVolume::from_min_max(Vec3::new(2.0, -1.0, 0.0), Vec3::new(3.0, 0.5, 0.5));
        let u = a.combine(&b);
        assert_eq!(u.min(), Vec3::new(0.0, -1.0, 0.0));
        assert_eq!(u.max(), Vec3::new(3.0, 1.0, 1.0));
    }

    #[test]
    fn mixed_combine_widens_to_box() {
        let s = BoundingVolume::sphere(Vec3::ZERO, 1.0);
        let b = BoundingVolume::aabb(Vec3::new(5.0, 0.0, 0.0), Vec3::ONE);
        let u = s.combine(&b);
        assert!(matches!(u, BoundingVolume::Aabb { .. }));
        assert!(u.encloses(&s));
        assert!(u.encloses(&b));
        assert_eq!(b.combine(&s), u);
    }

    #[test]
    fn empty_volumes_are_absorbed() {
        let b = BoundingVolume::aabb(Vec3::new(3.0, 3.0, 3.0), Vec3::ONE);
        let far_point = BoundingVolume::sphere(Vec3::splat(100.0), 0.0);
        assert_eq!(b.combine(&far_point), b);
        assert_eq!(far_point.combine(&b), b);
        assert_eq!(BoundingVolume::EMPTY.combine(&BoundingVolume::EMPTY), BoundingVolume::EMPTY);
        assert!(b.encloses(&far_point));
        assert!(!far_point.encloses(&b));
    }

    #[test]
    fn flat_box_is_not_empty() {
        let floor = BoundingVolume::aabb(Vec3::ZERO, Vec3::new(10.0, 0.0, 10.0));
        assert!(!floor.is_empty());
        assert!(floor.contains(Vec3::new(5.0, 0.0, -5.0)));
    }

    #[test]
    fn encloses_mixed_pairs() {
        let sphere = BoundingVolume::sphere(Vec3::ZERO, 2.0);
        let inside_box = BoundingVolume::aabb(Vec3::ZERO, Vec3::splat(1.0));
        let corner_box = BoundingVolume::aabb(Vec3::ZERO, Vec3::splat(1.5));
        assert!(sphere.encloses(&inside_box));
        // Corner at distance sqrt(3) * 1.5 > 2.
        assert!(!sphere.encloses(&corner_box));

        let outer_box = BoundingVolume::aabb(Vec3::ZERO, Vec3::splat(2.0));
        assert!(outer_box.encloses(&sphere));
        assert!(!inside_box.encloses(&sphere));
    }

    #[test]
    fn contains_points_on_the_boundary() {
        let s = BoundingVolume::sphere(Vec3::ZERO, 5.0);
        assert!(s.contains(Vec3::new(5.0, 0.0, 0.0)));
        assert!(!s.contains(Vec3::new(5.1, 0.0, 0.0)));
        assert!(!BoundingVolume::EMPTY.contains(Vec3::ZERO));
    }

    #[test]
    fn rotated_box_expands() {
        let b = BoundingVolume::aabb(Vec3::ZERO, Vec3::new(1.0, 1.0, 1.0));
        let r = b.transform(Quat::from_rotation_z(FRAC_PI_4), Vec3::ZERO, Vec3::ONE);
        let BoundingVolume::Aabb { half_extents, .. } = r else {
            panic!("box stays a box");
        };
        assert!((half_extents.x - 2.0_f32.sqrt()).abs() < 1e-5);
        assert!((half_extents.z - 1.0).abs() < 1e-5);
        assert!(r.encloses(&b));
    }

    #[test]
    fn sphere_transform_uses_largest_scale() {
        let s = BoundingVolume::sphere(Vec3::X, 1.0);
        let t = s.transform(Quat::IDENTITY, Vec3::new(0.0, 10.0, 0.0), Vec3::new(2.0, 3.0, -4.0));
        assert_eq!(t.center(), Vec3::new(2.0, 10.0, 0.0));
        assert!(matches!(t, BoundingVolume::Sphere { radius, .. } if radius == 4.0));
    }

    #[test]
    fn intersection_tests() {
        let s = BoundingVolume::sphere(Vec3::ZERO, 1.0);
        let near = BoundingVolume::aabb(Vec3::new(1.5, 0.0, 0.0), Vec3::splat(0.6));
        let far = BoundingVolume::aabb(Vec3::new(1.5, 1.5, 0.0), Vec3::splat(0.6));
        assert!(s.intersects(&near));
        assert!(near.intersects(&s));
        assert!(!s.intersects(&far));
        assert!(!near.intersects(&far));
        assert!(far.intersects(&BoundingVolume::aabb(Vec3::new(1.5, 2.0, 0.0), Vec3::ONE)));
        assert!(!s.intersects(&BoundingVolume::EMPTY));
    }
}
