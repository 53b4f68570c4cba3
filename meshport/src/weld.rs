//! Vertex welding. Source documents index position, normal and texcoord
//! streams independently; output faces need one 16-bit index stream, so
//! corners are deduplicated as they arrive.

use std::collections::HashMap;

use glam::{Vec2, Vec3};

use crate::{MeshStatus, VertexData, VolumeFace, vec3_bits};

/// Roll a streaming face over before it can no longer take a whole triangle.
pub const FACE_ROLLOVER_VERTICES: usize = crate::MAX_FACE_VERTICES - 3;

/// Accumulates welded triangles for one face.
///
/// A corner is shared with an existing vertex only when position, normal and
/// texcoord all match bit for bit, and never with another corner of the
/// triangle being built (that would emit a degenerate triangle).
pub struct FaceBuilder {
    positions: Vec<Vec3>,
    normals: Vec<Vec3>,
    tex_coords: Vec<Vec2>,
    has_normals: bool,
    has_tex_coords: bool,
    indices: Vec<u16>,
    // Welded vertices living at each position.
    point_map: HashMap<[u32; 3], Vec<u16>>,
}

impl FaceBuilder {
    pub fn new(has_normals: bool, has_tex_coords: bool) -> Self {
        FaceBuilder {
            positions: Vec::new(),
            normals: Vec::new(),
            tex_coords: Vec::new(),
            has_normals,
            has_tex_coords,
            indices: Vec::new(),
            point_map: HashMap::new(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    fn vertex(&self, index: u16) -> VertexData {
        let i = index as usize;
        VertexData {
            position: self.positions[i],
            normal: if self.has_normals {
                self.normals[i]
            } else {
                Vec3::ZERO
            },
            tex_coord: if self.has_tex_coords {
                self.tex_coords[i]
            } else {
                Vec2::ZERO
            },
        }
    }

    /// Weld one triangle into the face.
    pub fn push_triangle(&mut self, corners: [VertexData; 3]) -> Result<(), MeshStatus> {
        for corner in &corners {
            if !corner.position.is_finite()
                || (self.has_normals && !corner.normal.is_finite())
            {
                return Err(MeshStatus::BadElement);
            }
        }

        let mut tri = [0u16; 3];
        for (slot, corner) in corners.iter().enumerate() {
            let key = vec3_bits(corner.position);
            let shared = self.point_map.get(&key).and_then(|candidates| {
                candidates
                    .iter()
                    .copied()
                    .find(|&idx| {
                        !tri[..slot].contains(&idx) && self.vertex(idx).bits_eq(corner)
                    })
            });

            tri[slot] = match shared {
                Some(idx) => idx,
                None => {
                    if self.positions.len() >= crate::MAX_FACE_VERTICES {
                        return Err(MeshStatus::VertexNumberOverflow);
                    }
                    let idx = self.positions.len() as u16;
                    self.positions.push(corner.position);
                    if self.has_normals {
                        self.normals.push(corner.normal);
                    }
                    if self.has_tex_coords {
                        self.tex_coords.push(corner.tex_coord);
                    }
                    self.point_map.entry(key).or_default().push(idx);
                    idx
                }
            };
        }

        self.indices.extend_from_slice(&tri);
        Ok(())
    }

    /// Finish the face, or `None` when no triangle made it in.
    pub fn finish(self) -> Option<VolumeFace> {
        if self.indices.is_empty() {
            return None;
        }
        let mut face = VolumeFace {
            positions: self.positions,
            normals: self.has_normals.then_some(self.normals),
            tex_coords: self.has_tex_coords.then_some(self.tex_coords),
            indices: self.indices,
            ..VolumeFace::default()
        };
        face.update_extents();
        Some(face)
    }
}

/// Welds a triangle stream into faces, rolling over to a fresh face with the
/// same material whenever the current one approaches the vertex ceiling.
pub struct FaceStream {
    builder: FaceBuilder,
    material: String,
    has_normals: bool,
    has_tex_coords: bool,
    faces: Vec<(VolumeFace, String)>,
}

impl FaceStream {
    pub fn new(material: impl Into<String>, has_normals: bool, has_tex_coords: bool) -> Self {
        FaceStream {
            builder: FaceBuilder::new(has_normals, has_tex_coords),
            material: material.into(),
            has_normals,
            has_tex_coords,
            faces: Vec::new(),
        }
    }

    pub fn push_triangle(&mut self, corners: [VertexData; 3]) -> Result<(), MeshStatus> {
        if self.builder.vertex_count() >= FACE_ROLLOVER_VERTICES {
            let full = std::mem::replace(
                &mut self.builder,
                FaceBuilder::new(self.has_normals, self.has_tex_coords),
            );
            if let Some(face) = full.finish() {
                self.faces.push((face, self.material.clone()));
            }
        }
        self.builder.push_triangle(corners)
    }

    pub fn finish(mut self) -> Vec<(VolumeFace, String)> {
        if let Some(face) = self.builder.finish() {
            self.faces.push((face, self.material));
        }
        self.faces
    }
}

/// Corner index triples for a fan triangulation of an `n`-gon.
pub fn fan_triangles(n: usize) -> impl Iterator<Item = [usize; 3]> {
    (2..n).map(|i| [0, i - 1, i])
}
