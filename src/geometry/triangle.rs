//! Triangles and the exact triangle-triangle intersection test.
//!
//! The test follows the interval-overlap method: each triangle is classified
//! against the other's plane, and if both straddle, the two segments cut on
//! the planes' intersection line are compared. Coplanar pairs fall back to a
//! 2D overlap test. `shaders/compute/tri_tri.wgsl` mirrors this file line for
//! line; keep them in sync.

use glam::{Mat4, Vec2, Vec3};

use super::Aabb;

/// Three vertex positions.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Triangle {
    pub vertices: [Vec3; 3],
}

impl Triangle {
    pub fn new(a: Vec3, b: Vec3, c: Vec3) -> Self {
        Self {
            vertices: [a, b, c],
        }
    }

    pub fn centroid(&self) -> Vec3 {
        (self.vertices[0] + self.vertices[1] + self.vertices[2]) / 3.0
    }

    /// Unit face normal (counter-clockwise winding), or zero for a degenerate triangle.
    pub fn normal(&self) -> Vec3 {
        let [a, b, c] = self.vertices;
        (b - a).cross(c - a).normalize_or_zero()
    }

    pub fn aabb(&self) -> Aabb {
        Aabb::from_points(self.vertices)
    }

    pub fn transformed(&self, model: &Mat4) -> Self {
        Self {
            vertices: self.vertices.map(|v| model.transform_point3(v)),
        }
    }
}

/// Exact intersection test between two world-space triangles.
///
/// Signed plane distances with magnitude below `epsilon` are treated as zero
/// and interval overlap is widened by `epsilon`, so touching triangles
/// intersect. Degenerate triangles (corner angle sine below `epsilon`, or a
/// zero-length edge) never intersect.
pub fn triangles_intersect(a: &Triangle, b: &Triangle, epsilon: f32) -> bool {
    let [a0, a1, a2] = a.vertices;
    let [b0, b1, b2] = b.vertices;

    let na = (a1 - a0).cross(a2 - a0);
    let nb = (b1 - b0).cross(b2 - b0);
    if is_degenerate(na, a1 - a0, a2 - a0, epsilon) || is_degenerate(nb, b1 - b0, b2 - b0, epsilon)
    {
        return false;
    }
    let na = na.normalize();
    let nb = nb.normalize();

    // B against A's plane
    let db = plane_distances(na, a0, &b.vertices, epsilon);
    if same_side(db) {
        return false;
    }

    // A against B's plane
    let da = plane_distances(nb, b0, &a.vertices, epsilon);
    if same_side(da) {
        return false;
    }

    // either triangle lying in the other's plane makes the pair coplanar
    if db == [0.0; 3] {
        return coplanar_intersect(na, a, b, epsilon);
    }
    if da == [0.0; 3] {
        return coplanar_intersect(nb, a, b, epsilon);
    }

    let line = na.cross(nb);
    let pa = a.vertices.map(|v| line.dot(v));
    let pb = b.vertices.map(|v| line.dot(v));

    let (a_lo, a_hi) = interval(pa, da);
    let (b_lo, b_hi) = interval(pb, db);

    a_lo.max(b_lo) <= a_hi.min(b_hi) + epsilon
}

/// Edge cross product short relative to the edges themselves: the sine of
/// the corner angle is below `epsilon`, whatever the triangle's scale.
#[inline]
fn is_degenerate(normal: Vec3, e1: Vec3, e2: Vec3, epsilon: f32) -> bool {
    normal.length() <= epsilon * e1.length() * e2.length()
}

fn plane_distances(normal: Vec3, origin: Vec3, points: &[Vec3; 3], epsilon: f32) -> [f32; 3] {
    let offset = normal.dot(origin);
    points.map(|p| {
        let d = normal.dot(p) - offset;
        if d.abs() < epsilon {
            0.0
        } else {
            d
        }
    })
}

#[inline]
fn same_side(d: [f32; 3]) -> bool {
    d[0] * d[1] > 0.0 && d[0] * d[2] > 0.0
}

/// Sorted interval where the triangle crosses the other plane, projected
/// onto the intersection line. `p` are vertex projections, `d` their plane
/// distances (not all zero, not all on one side).
fn interval(p: [f32; 3], d: [f32; 3]) -> (f32, f32) {
    let lone = if d[0] * d[1] > 0.0 {
        2
    } else if d[0] * d[2] > 0.0 {
        1
    } else if d[1] * d[2] > 0.0 || d[0] != 0.0 {
        0
    } else if d[1] != 0.0 {
        1
    } else {
        2
    };
    let (i, j) = match lone {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };
    let k = lone;
    let t1 = p[k] + (p[i] - p[k]) * d[k] / (d[k] - d[i]);
    let t2 = p[k] + (p[j] - p[k]) * d[k] / (d[k] - d[j]);
    if t1 <= t2 {
        (t1, t2)
    } else {
        (t2, t1)
    }
}

/// Both triangles lie in the plane with unit normal `normal`.
fn coplanar_intersect(normal: Vec3, a: &Triangle, b: &Triangle, epsilon: f32) -> bool {
    // drop the dominant axis of the normal
    let n = normal.abs();
    let project = |v: Vec3| -> Vec2 {
        if n.x >= n.y && n.x >= n.z {
            Vec2::new(v.y, v.z)
        } else if n.y >= n.z {
            Vec2::new(v.x, v.z)
        } else {
            Vec2::new(v.x, v.y)
        }
    };
    let pa = a.vertices.map(project);
    let pb = b.vertices.map(project);

    for i in 0..3 {
        for j in 0..3 {
            if segments_intersect(pa[i], pa[(i + 1) % 3], pb[j], pb[(j + 1) % 3], epsilon) {
                return true;
            }
        }
    }

    point_in_triangle(pa[0], &pb, epsilon) || point_in_triangle(pb[0], &pa, epsilon)
}

#[inline]
fn orient(a: Vec2, b: Vec2, c: Vec2) -> f32 {
    (b - a).perp_dot(c - a)
}

#[inline]
fn sign(x: f32, epsilon: f32) -> i32 {
    if x > epsilon {
        1
    } else if x < -epsilon {
        -1
    } else {
        0
    }
}

fn on_segment(a: Vec2, b: Vec2, p: Vec2, epsilon: f32) -> bool {
    p.x >= a.x.min(b.x) - epsilon
        && p.x <= a.x.max(b.x) + epsilon
        && p.y >= a.y.min(b.y) - epsilon
        && p.y <= a.y.max(b.y) + epsilon
}

fn segments_intersect(p1: Vec2, p2: Vec2, q1: Vec2, q2: Vec2, epsilon: f32) -> bool {
    let o1 = sign(orient(p1, p2, q1), epsilon);
    let o2 = sign(orient(p1, p2, q2), epsilon);
    let o3 = sign(orient(q1, q2, p1), epsilon);
    let o4 = sign(orient(q1, q2, p2), epsilon);

    if o1 * o2 < 0 && o3 * o4 < 0 {
        return true;
    }

    (o1 == 0 && on_segment(p1, p2, q1, epsilon))
        || (o2 == 0 && on_segment(p1, p2, q2, epsilon))
        || (o3 == 0 && on_segment(q1, q2, p1, epsilon))
        || (o4 == 0 && on_segment(q1, q2, p2, epsilon))
}

fn point_in_triangle(p: Vec2, tri: &[Vec2; 3], epsilon: f32) -> bool {
    let s0 = sign(orient(tri[0], tri[1], p), epsilon);
    let s1 = sign(orient(tri[1], tri[2], p), epsilon);
    let s2 = sign(orient(tri[2], tri[0], p), epsilon);
    let has_neg = s0 < 0 || s1 < 0 || s2 < 0;
    let has_pos = s0 > 0 || s1 > 0 || s2 > 0;
    !(has_neg && has_pos)
}
