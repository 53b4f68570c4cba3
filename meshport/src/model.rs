use std::collections::BTreeMap;
use std::fmt;

use glam::{Mat4, Vec2, Vec3};
use log::warn;

use crate::Error;

/// Hard cap on faces per model. Meshes producing more are split into submodels.
pub const MAX_MODEL_FACES: usize = 8;

/// Largest index a face may carry; 65535 is reserved.
pub const MAX_FACE_INDEX: u16 = u16::MAX - 1;

/// A face holding this many vertices can no longer be indexed.
pub const MAX_FACE_VERTICES: usize = u16::MAX as usize;

/// Outcome of building one mesh. Carried on the model rather than raised as an
/// error so a multi-mesh document can finish loading its healthy parts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum MeshStatus {
    #[default]
    Ok,
    /// Face written without geometry (fewer than three vertices).
    NoGeometry,
    /// A source element was malformed (NaN coordinates, short arrays, bad refs).
    BadElement,
    /// A single primitive exceeded the 16-bit vertex ceiling.
    VertexNumberOverflow,
}

impl fmt::Display for MeshStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MeshStatus::Ok => "ok",
            MeshStatus::NoGeometry => "no geometry",
            MeshStatus::BadElement => "bad element",
            MeshStatus::VertexNumberOverflow => "vertex number overflow",
        };
        f.write_str(name)
    }
}

/// One corner of a triangle before welding.
#[derive(Clone, Copy, Debug, Default)]
pub struct VertexData {
    pub position: Vec3,
    pub normal: Vec3,
    pub tex_coord: Vec2,
}

impl VertexData {
    /// Weld identity: all three channels equal bit for bit. An epsilon here
    /// would merge corners that the source document meant to keep apart.
    pub fn bits_eq(&self, other: &VertexData) -> bool {
        vec3_bits(self.position) == vec3_bits(other.position)
            && vec3_bits(self.normal) == vec3_bits(other.normal)
            && vec2_bits(self.tex_coord) == vec2_bits(other.tex_coord)
    }
}

pub(crate) fn vec3_bits(v: Vec3) -> [u32; 3] {
    [v.x.to_bits(), v.y.to_bits(), v.z.to_bits()]
}

pub(crate) fn vec2_bits(v: Vec2) -> [u32; 2] {
    [v.x.to_bits(), v.y.to_bits()]
}

/// One skin influence on a vertex.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct JointWeight {
    /// Index into [`SkinInfo::joint_names`].
    pub joint: usize,
    pub weight: f32,
}

/// Skin weights keyed by vertex position bits. Welding and serialization both
/// address weights by position, so the map survives re-indexing.
pub type WeightMap = BTreeMap<[u32; 3], Vec<JointWeight>>;

/// Skinning data shared by every face of a model.
#[derive(Clone, Debug)]
pub struct SkinInfo {
    /// Joint names after alias mapping, in buffer order.
    pub joint_names: Vec<String>,
    pub bind_shape_matrix: Mat4,
    pub inverse_bind_matrices: Vec<Mat4>,
    /// Inverse-bind matrices with translation overridden by the asset's joint
    /// node translation; used when joint positions are uploaded.
    pub alternate_bind_matrices: Vec<Mat4>,
    pub pelvis_offset: f32,
}

impl Default for SkinInfo {
    fn default() -> Self {
        SkinInfo {
            joint_names: Vec::new(),
            bind_shape_matrix: Mat4::IDENTITY,
            inverse_bind_matrices: Vec::new(),
            alternate_bind_matrices: Vec::new(),
            pelvis_offset: 0.0,
        }
    }
}

impl SkinInfo {
    pub fn is_rigged(&self) -> bool {
        !self.joint_names.is_empty()
    }

    pub fn joint_index(&self, name: &str) -> Option<usize> {
        self.joint_names.iter().position(|n| n == name)
    }
}

/// Material description recovered from the source document.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportMaterial {
    pub name: String,
    pub diffuse_color: [f32; 4],
    /// File reference of the diffuse texture, if the document names one.
    pub diffuse_map: Option<String>,
    pub fullbright: bool,
}

impl Default for ImportMaterial {
    fn default() -> Self {
        ImportMaterial {
            name: String::new(),
            diffuse_color: [1.0, 1.0, 1.0, 1.0],
            diffuse_map: None,
            fullbright: false,
        }
    }
}

/// A welded, 16-bit indexed triangle primitive.
#[derive(Clone, Debug, Default)]
pub struct VolumeFace {
    pub positions: Vec<Vec3>,
    pub normals: Option<Vec<Vec3>>,
    pub tex_coords: Option<Vec<Vec2>>,
    pub indices: Vec<u16>,
    /// Position bounds: `[min, max]`.
    pub extents: [Vec3; 2],
    /// Texture-coordinate bounds: `[min, max]`.
    pub tex_extents: [Vec2; 2],
}

impl VolumeFace {
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.positions.len() < 3 || self.indices.is_empty()
    }

    /// Recompute position and texcoord bounds from the vertex data.
    pub fn update_extents(&mut self) {
        let mut min = Vec3::splat(f32::MAX);
        let mut max = Vec3::splat(f32::MIN);
        for p in &self.positions {
            min = min.min(*p);
            max = max.max(*p);
        }
        if self.positions.is_empty() {
            min = Vec3::ZERO;
            max = Vec3::ZERO;
        }
        self.extents = [min, max];

        let mut tmin = Vec2::splat(f32::MAX);
        let mut tmax = Vec2::splat(f32::MIN);
        match &self.tex_coords {
            Some(tc) if !tc.is_empty() => {
                for t in tc {
                    tmin = tmin.min(*t);
                    tmax = tmax.max(*t);
                }
            }
            _ => {
                tmin = Vec2::ZERO;
                tmax = Vec2::ZERO;
            }
        }
        self.tex_extents = [tmin, tmax];
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.positions.is_empty() {
            return Err("face has no vertices".into());
        }
        if self.indices.is_empty() {
            return Err("face has no indices".into());
        }
        if self.indices.len() % 3 != 0 {
            return Err(format!(
                "index count {} is not a multiple of 3",
                self.indices.len()
            ));
        }
        let count = self.positions.len();
        for &i in &self.indices {
            if i as usize >= count {
                return Err(format!("index {i} out of range for {count} vertices"));
            }
        }
        if self.normals.as_ref().is_some_and(|n| n.len() != count) {
            return Err("normal count does not match vertex count".into());
        }
        if self.tex_coords.as_ref().is_some_and(|tc| tc.len() != count) {
            return Err("texcoord count does not match vertex count".into());
        }
        Ok(())
    }
}

/// A named group of faces sharing one transform, skin and material list.
#[derive(Clone, Debug, Default)]
pub struct Model {
    pub label: String,
    /// 0 for the primary model, counting up for split-off successors.
    pub submodel_id: u32,
    pub faces: Vec<VolumeFace>,
    /// Material binding name per face, parallel to `faces`.
    pub materials: Vec<String>,
    pub skin: SkinInfo,
    pub weights: WeightMap,
    /// Extent of the model before [`Model::normalize_faces`], recoverable as
    /// `pos * normalized_scale - normalized_translation`.
    pub normalized_scale: Vec3,
    pub normalized_translation: Vec3,
    pub status: MeshStatus,
}

impl Model {
    pub fn new(label: impl Into<String>) -> Self {
        Model {
            label: label.into(),
            normalized_scale: Vec3::ONE,
            ..Model::default()
        }
    }

    /// Combined position bounds over all faces, `None` when nothing has geometry.
    pub fn extents(&self) -> Option<[Vec3; 2]> {
        let mut out: Option<[Vec3; 2]> = None;
        for face in &self.faces {
            if face.positions.is_empty() {
                continue;
            }
            let ext = out.get_or_insert(face.extents);
            ext[0] = ext[0].min(face.extents[0]);
            ext[1] = ext[1].max(face.extents[1]);
        }
        out
    }

    /// Scale and center the model into the unit cube at the origin, recording
    /// the applied scale and translation so the caller can restore world size.
    /// Normals pick up the inverse scale and are renormalized.
    pub fn normalize_faces(&mut self) {
        let Some([min, max]) = self.extents() else {
            return;
        };

        let trans = -0.5 * (min + max);
        let mut size = max - min;
        // A flat axis would blow up the inverse scale.
        if size.x.abs() < f32::EPSILON {
            size.x = 1.0;
        }
        if size.y.abs() < f32::EPSILON {
            size.y = 1.0;
        }
        if size.z.abs() < f32::EPSILON {
            size.z = 1.0;
        }
        let inv_scale = 1.0 / size;

        for face in &mut self.faces {
            for p in &mut face.positions {
                *p = (*p + trans) * inv_scale;
            }
            if let Some(normals) = &mut face.normals {
                for n in normals {
                    let scaled = *n * size;
                    *n = scaled.normalize_or_zero();
                }
            }
            face.update_extents();
        }

        self.normalized_scale = size;
        self.normalized_translation = trans;
    }

    /// Sort faces by material name, case-insensitive, keeping the material
    /// list in step. Submodel splitting relies on this for material locality.
    pub fn sort_faces_by_material(&mut self) {
        debug_assert_eq!(self.faces.len(), self.materials.len());
        let mut order: Vec<usize> = (0..self.faces.len()).collect();
        order.sort_by_key(|&i| self.materials[i].to_lowercase());

        let faces = std::mem::take(&mut self.faces);
        let materials = std::mem::take(&mut self.materials);
        let mut face_slots: Vec<Option<VolumeFace>> = faces.into_iter().map(Some).collect();
        let mut material_slots: Vec<Option<String>> = materials.into_iter().map(Some).collect();
        for &i in &order {
            self.faces.push(face_slots[i].take().unwrap_or_default());
            self.materials.push(material_slots[i].take().unwrap_or_default());
        }
    }

    /// Split off every face past `cap`, returning the remainder with its
    /// material names.
    pub fn trim_faces(&mut self, cap: usize) -> Vec<(VolumeFace, String)> {
        if self.faces.len() <= cap {
            return Vec::new();
        }
        let faces = self.faces.split_off(cap);
        let materials = self.materials.split_off(cap);
        faces.into_iter().zip(materials).collect()
    }

    /// Reorder faces so the material order matches `reference`, padding
    /// materials this model lacks with empty faces. Used to line LOD models up
    /// with their high-detail counterpart. Fails when this model carries a
    /// material the reference does not.
    pub fn match_material_order(&mut self, reference: &Model) -> Result<(), Error> {
        for name in &self.materials {
            if !reference.materials.contains(name) {
                return Err(Error::MaterialMismatch {
                    label: self.label.clone(),
                });
            }
        }

        let mut faces = Vec::with_capacity(reference.materials.len());
        let mut materials = Vec::with_capacity(reference.materials.len());
        for name in &reference.materials {
            match self.materials.iter().position(|m| m == name) {
                Some(i) => {
                    faces.push(self.faces[i].clone());
                    materials.push(self.materials[i].clone());
                }
                None => {
                    faces.push(VolumeFace::default());
                    materials.push(name.clone());
                }
            }
        }
        self.faces = faces;
        self.materials = materials;
        Ok(())
    }

    /// Skin influences for a vertex position. Falls back to the closest
    /// recorded entry when no exact match exists; quantization in the asset
    /// codec jitters positions below float precision.
    pub fn joint_influences(&self, position: Vec3) -> &[JointWeight] {
        if let Some(list) = self.weights.get(&vec3_bits(position)) {
            return list;
        }

        let mut best: Option<(&Vec<JointWeight>, f32)> = None;
        for (key, list) in &self.weights {
            let p = Vec3::new(
                f32::from_bits(key[0]),
                f32::from_bits(key[1]),
                f32::from_bits(key[2]),
            );
            let dist = p.distance_squared(position);
            if best.is_none_or(|(_, d)| dist < d) {
                best = Some((list, dist));
            }
        }
        match best {
            Some((list, _)) => list,
            None => &[],
        }
    }

    /// Rebuild normals by crease-angle smoothing: each vertex accumulates the
    /// normals of triangles touching its position whose deviation from the
    /// vertex's own triangle normals stays under `angle_cutoff` (radians).
    pub fn generate_normals(&mut self, angle_cutoff: f32) {
        let cutoff_cos = angle_cutoff.cos();
        for face in &mut self.faces {
            if face.is_empty() {
                continue;
            }

            let tri_count = face.indices.len() / 3;
            let mut tri_normals = Vec::with_capacity(tri_count);
            for tri in face.indices.chunks_exact(3) {
                let a = face.positions[tri[0] as usize];
                let b = face.positions[tri[1] as usize];
                let c = face.positions[tri[2] as usize];
                tri_normals.push((b - a).cross(c - a).normalize_or_zero());
            }

            // Triangles touching each position, and each vertex's own triangles.
            let mut by_position: BTreeMap<[u32; 3], Vec<usize>> = BTreeMap::new();
            let mut by_vertex: Vec<Vec<usize>> = vec![Vec::new(); face.positions.len()];
            for (t, tri) in face.indices.chunks_exact(3).enumerate() {
                for &i in tri {
                    let i = i as usize;
                    by_position
                        .entry(vec3_bits(face.positions[i]))
                        .or_default()
                        .push(t);
                    by_vertex[i].push(t);
                }
            }

            let mut normals = Vec::with_capacity(face.positions.len());
            for (i, pos) in face.positions.iter().enumerate() {
                let own: Vec3 = by_vertex[i].iter().map(|&t| tri_normals[t]).sum();
                let own = own.normalize_or_zero();
                let mut accum = Vec3::ZERO;
                if let Some(tris) = by_position.get(&vec3_bits(*pos)) {
                    for &t in tris {
                        if tri_normals[t].dot(own) >= cutoff_cos {
                            accum += tri_normals[t];
                        }
                    }
                }
                let n = accum.normalize_or_zero();
                normals.push(if n == Vec3::ZERO { own } else { n });
            }
            face.normals = Some(normals);
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.faces.is_empty() {
            return Err(Error::InvalidModel {
                label: self.label.clone(),
                message: "model has no faces".into(),
            });
        }
        if self.faces.len() != self.materials.len() {
            return Err(Error::InvalidModel {
                label: self.label.clone(),
                message: format!(
                    "{} faces but {} materials",
                    self.faces.len(),
                    self.materials.len()
                ),
            });
        }
        if self.faces.len() > MAX_MODEL_FACES {
            warn!(
                "model '{}' carries {} faces, over the {} face cap",
                self.label,
                self.faces.len(),
                MAX_MODEL_FACES
            );
        }
        for (i, face) in self.faces.iter().enumerate() {
            face.validate().map_err(|message| Error::InvalidModel {
                label: self.label.clone(),
                message: format!("face {i}: {message}"),
            })?;
        }
        Ok(())
    }
}
