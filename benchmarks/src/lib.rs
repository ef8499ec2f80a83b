//! Shared setup helpers for rein-collide benchmarks.
//!
//! ## Running
//!
//! Wall-clock (criterion):
//!   cargo bench --manifest-path benchmarks/Cargo.toml --bench collision
//!
//! Instruction counts (iai-callgrind, requires valgrind):
//!   cargo install iai-callgrind-runner
//!   cargo bench --manifest-path benchmarks/Cargo.toml --bench collision_iai

use std::sync::Arc;

use glam::{Mat4, Quat, Vec3};
use rein_collide::geometry::Triangle;
use rein_collide::mesh::{BvhStopCriteria, CollisionMesh, MeshGeometry};
use rein_collide::{CollisionConfig, CollisionWorld, Transform, TransformId};

/// Deterministic xorshift so runs are comparable.
pub struct Rng(u32);

impl Rng {
    pub fn new(seed: u32) -> Self {
        Self(seed.max(1))
    }

    /// Uniform in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        (self.0 >> 8) as f32 / (1u32 << 24) as f32
    }

    pub fn range(&mut self, lo: f32, hi: f32) -> f32 {
        lo + (hi - lo) * self.next_f32()
    }

    pub fn vec3(&mut self, extent: f32) -> Vec3 {
        Vec3::new(
            self.range(-extent, extent),
            self.range(-extent, extent),
            self.range(-extent, extent),
        )
    }
}

/// A UV sphere of radius 0.5 with `rings * segments * 2` triangles.
pub fn uv_sphere(rings: u32, segments: u32) -> MeshGeometry {
    let mut positions = Vec::new();
    for r in 0..=rings {
        let phi = std::f32::consts::PI * r as f32 / rings as f32;
        for s in 0..=segments {
            let theta = std::f32::consts::TAU * s as f32 / segments as f32;
            positions.push(
                Vec3::new(
                    phi.sin() * theta.cos(),
                    phi.cos(),
                    phi.sin() * theta.sin(),
                ) * 0.5,
            );
        }
    }
    let stride = segments + 1;
    let mut indices = Vec::new();
    for r in 0..rings {
        for s in 0..segments {
            let i0 = r * stride + s;
            let i1 = i0 + stride;
            indices.push([i0, i1, i0 + 1]);
            indices.push([i0 + 1, i1, i1 + 1]);
        }
    }
    // every index is in range by construction
    match MeshGeometry::new(positions, indices) {
        Ok(mesh) => mesh,
        Err(e) => panic!("uv sphere: {e}"),
    }
}

pub fn sphere_mesh(rings: u32, segments: u32) -> Arc<CollisionMesh> {
    Arc::new(CollisionMesh::new(
        uv_sphere(rings, segments),
        BvhStopCriteria::default(),
    ))
}

/// `n` random triangles inside a cube of half-extent `extent`.
pub fn random_triangles(rng: &mut Rng, n: usize, extent: f32, size: f32) -> Vec<Triangle> {
    (0..n)
        .map(|_| {
            let base = rng.vec3(extent);
            Triangle::new(base, base + rng.vec3(size), base + rng.vec3(size))
        })
        .collect()
}

/// `n` spheres scattered through a cube whose density grows as `extent` shrinks.
pub fn setup_world(
    n: usize,
    extent: f32,
    mesh: &Arc<CollisionMesh>,
) -> anyhow::Result<(CollisionWorld, Vec<TransformId>)> {
    let mut world = CollisionWorld::new(CollisionConfig::default())?;
    let mut rng = Rng::new(0x5eed);
    let mut transforms = Vec::with_capacity(n);
    for _ in 0..n {
        let t = world.add_transform(
            Transform::from_position(rng.vec3(extent))
                .with_rotation(Quat::from_rotation_y(rng.range(0.0, 6.28))),
        )?;
        world.spawn(mesh.clone(), t)?;
        transforms.push(t);
    }
    // settle spawns so benches measure steady-state ticks
    world.tick()?;
    Ok((world, transforms))
}

/// Offset a model matrix by `x` along X.
pub fn shifted(x: f32) -> Mat4 {
    Mat4::from_translation(Vec3::new(x, 0.0, 0.0))
}
