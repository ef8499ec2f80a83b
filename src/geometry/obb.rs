//! Oriented bounding boxes and the separating axis test.

use glam::{Mat4, Vec3};

use super::Aabb;

/// Oriented bounding box: center, three orthonormal axes, half extents along them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Obb {
    pub center: Vec3,
    pub axes: [Vec3; 3],
    pub half_extents: Vec3,
}

impl Obb {
    /// Box aligned with the world axes.
    pub fn from_aabb_world(aabb: &Aabb) -> Self {
        Self {
            center: aabb.center(),
            axes: [Vec3::X, Vec3::Y, Vec3::Z],
            half_extents: aabb.half_extents(),
        }
    }

    /// The local box `aabb` carried into world space by `model`.
    ///
    /// The box is transformed, not re-fit: the axes are the model's basis
    /// columns and each half extent is scaled by that column's length. A
    /// zero-scale column collapses its axis to zero length.
    pub fn from_aabb(aabb: &Aabb, model: &Mat4) -> Self {
        let cols = [
            model.x_axis.truncate(),
            model.y_axis.truncate(),
            model.z_axis.truncate(),
        ];
        let half = aabb.half_extents();
        let scale = Vec3::new(cols[0].length(), cols[1].length(), cols[2].length());
        Self {
            center: model.transform_point3(aabb.center()),
            axes: [
                cols[0].normalize_or_zero(),
                cols[1].normalize_or_zero(),
                cols[2].normalize_or_zero(),
            ],
            half_extents: half * scale,
        }
    }

    pub fn volume(&self) -> f32 {
        8.0 * self.half_extents.x * self.half_extents.y * self.half_extents.z
    }

    /// Projection radius of the box onto `axis`.
    #[inline]
    fn radius_on(&self, axis: Vec3) -> f32 {
        self.half_extents.x * self.axes[0].dot(axis).abs()
            + self.half_extents.y * self.axes[1].dot(axis).abs()
            + self.half_extents.z * self.axes[2].dot(axis).abs()
    }

    /// Separating axis test over the 15 candidate axes.
    ///
    /// Face axes and edge cross products shorter than `epsilon` are skipped
    /// (no separation found on them). Touching boxes intersect: a gap must
    /// exceed `epsilon` scaled by the boxes' size and distance from the
    /// origin, so boxes sharing a face plane survive rounding. The result is
    /// symmetric in its arguments.
    pub fn intersects(&self, other: &Obb, epsilon: f32) -> bool {
        let t = other.center - self.center;

        for axis in self.axes.iter().chain(other.axes.iter()) {
            if axis.length_squared() < epsilon * epsilon {
                continue;
            }
            if separates(self, other, *axis, t, epsilon) {
                return false;
            }
        }

        for a in &self.axes {
            for b in &other.axes {
                let axis = a.cross(*b);
                let len = axis.length();
                if len < epsilon {
                    continue; // parallel edges
                }
                if separates(self, other, axis / len, t, epsilon) {
                    return false;
                }
            }
        }

        true
    }
}

/// True if `axis` separates the two boxes. `t` is the center offset.
#[inline]
fn separates(a: &Obb, b: &Obb, axis: Vec3, t: Vec3, epsilon: f32) -> bool {
    let reach = a.radius_on(axis) + b.radius_on(axis);
    let magnitude = a.center.abs().max_element() + b.center.abs().max_element();
    t.dot(axis).abs() > reach + epsilon * (1.0 + reach + magnitude)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Quat;

    const EPS: f32 = 1e-6;

    fn cube(at: Vec3, rotation: Quat) -> Obb {
        let local = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        Obb::from_aabb(&local, &Mat4::from_rotation_translation(rotation, at))
    }

    #[test]
    fn test_overlapping_boxes() {
        let a = cube(Vec3::ZERO, Quat::IDENTITY);
        let b = cube(Vec3::new(0.5, 0.0, 0.0), Quat::IDENTITY);
        assert!(a.intersects(&b, EPS));
    }

    #[test]
    fn test_separated_boxes() {
        let a = cube(Vec3::ZERO, Quat::IDENTITY);
        let b = cube(Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY);
        assert!(!a.intersects(&b, EPS));
    }

    #[test]
    fn test_touching_faces_intersect() {
        let a = cube(Vec3::ZERO, Quat::IDENTITY);
        let b = cube(Vec3::new(1.0, 0.0, 0.0), Quat::IDENTITY);
        assert!(a.intersects(&b, EPS));
    }

    #[test]
    fn test_coincident_boxes_intersect() {
        let a = cube(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_z(0.3));
        assert!(a.intersects(&a, EPS));
    }

    #[test]
    fn test_shared_face_plane_survives_rotation() {
        let rot = Quat::from_rotation_y(0.3);
        let model = Mat4::from_rotation_translation(rot, Vec3::ONE);
        for step in 0..16 {
            let lo = -0.5 + step as f32 / 16.0;
            let left = Aabb::new(Vec3::new(-0.5, -0.5, -0.5), Vec3::new(lo, 0.5, 0.5));
            let right = Aabb::new(Vec3::new(lo, -0.5, -0.5), Vec3::new(0.5, 0.5, 0.5));
            let a = Obb::from_aabb(&left, &model);
            let b = Obb::from_aabb(&right, &model);
            assert!(a.intersects(&b, EPS));
            assert!(b.intersects(&a, EPS));
        }

        let gap = cube(Vec3::new(1.0 + 1e-3, 0.0, 0.0), Quat::IDENTITY);
        assert!(!cube(Vec3::ZERO, Quat::IDENTITY).intersects(&gap, EPS));
    }

    #[test]
    fn test_rotated_box_near_corner() {
        let a = cube(Vec3::ZERO, Quat::IDENTITY);
        let rot = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4)
            * Quat::from_rotation_x(std::f32::consts::FRAC_PI_4);
        let b = cube(Vec3::new(1.1, 1.1, 0.0), rot);
        let hit_ab = a.intersects(&b, EPS);
        assert_eq!(hit_ab, b.intersects(&a, EPS));
        let far = cube(Vec3::new(1.6, 1.6, 0.0), rot);
        assert!(!a.intersects(&far, EPS));
    }

    #[test]
    fn test_sat_symmetry() {
        let rotations = [
            Quat::IDENTITY,
            Quat::from_rotation_x(0.4),
            Quat::from_rotation_y(1.1) * Quat::from_rotation_z(0.2),
            Quat::from_rotation_z(std::f32::consts::FRAC_PI_2),
        ];
        let offsets = [
            Vec3::new(0.9, 0.0, 0.0),
            Vec3::new(1.05, 0.4, -0.2),
            Vec3::new(0.2, 1.3, 0.7),
            Vec3::new(2.0, 2.0, 2.0),
        ];
        for ra in &rotations {
            for rb in &rotations {
                for off in &offsets {
                    let a = cube(Vec3::ZERO, *ra);
                    let b = cube(*off, *rb);
                    assert_eq!(a.intersects(&b, EPS), b.intersects(&a, EPS));
                }
            }
        }
    }

    #[test]
    fn test_zero_scale_axis_is_skipped() {
        let local = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let flat = Obb::from_aabb(&local, &Mat4::from_scale(Vec3::new(1.0, 0.0, 1.0)));
        assert_eq!(flat.axes[1], Vec3::ZERO);
        let b = cube(Vec3::new(0.2, 0.0, 0.0), Quat::IDENTITY);
        assert!(flat.intersects(&b, EPS));
        assert!(b.intersects(&flat, EPS));
    }

    #[test]
    fn test_from_aabb_scales_extents() {
        let local = Aabb::new(Vec3::ZERO, Vec3::new(2.0, 4.0, 6.0));
        let obb = Obb::from_aabb(&local, &Mat4::from_scale(Vec3::new(2.0, 1.0, 0.5)));
        assert!((obb.center - Vec3::new(2.0, 2.0, 1.5)).length() < 1e-6);
        assert!((obb.half_extents - Vec3::new(2.0, 2.0, 1.5)).length() < 1e-6);
        assert!((obb.volume() - 48.0).abs() < 1e-4);
    }
}
