//! glTF / GLB frontend. Buffer decoding is delegated to the `gltf` crate; the
//! primitives come out as indexed streams and go through the same welder as
//! the COLLADA path.

use std::collections::{BTreeMap, HashMap};

use glam::{Mat4, Vec2, Vec3};
use log::warn;

use crate::{
    Error, FaceBuilder, ImportMaterial, ImportSession, JointWeight, MAX_FACE_VERTICES, MeshStatus,
    Model, ModelLoader, SkinInfo, UpAxis, VertexData, VolumeFace, WeightMap, base_transform,
    build_alternate_bind, critique_rig, map_joint_name, normalize_weights, split_into_models,
    vec3_bits,
};

/// Emission brighter than this flags the material as fullbright.
const FULLBRIGHT_EMISSION: f32 = 0.25;

#[derive(Default)]
pub struct GltfLoader;

impl ModelLoader for GltfLoader {
    fn parse(&mut self, session: &mut ImportSession, data: &[u8]) -> Result<(), Error> {
        let (document, buffers, _images) =
            gltf::import_slice(data).map_err(|e| Error::GltfParse {
                message: e.to_string(),
            })?;

        // glTF is Y-up with meter units.
        let base = base_transform(UpAxis::Y, 1.0);
        for scene in document.scenes() {
            for node in scene.nodes() {
                process_node(&node, base, &buffers, session, 0);
            }
        }
        Ok(())
    }
}

fn process_node(
    node: &gltf::Node,
    parent: Mat4,
    buffers: &[gltf::buffer::Data],
    session: &mut ImportSession,
    depth: usize,
) {
    if depth > 64 {
        warn!("glTF node nesting too deep, stopping");
        return;
    }
    let transform = parent * Mat4::from_cols_array_2d(&node.transform().matrix());

    if let Some(mesh) = node.mesh() {
        load_mesh_node(node, &mesh, transform, buffers, session);
    }
    for child in node.children() {
        process_node(&child, transform, buffers, session, depth + 1);
    }
}

fn load_mesh_node(
    node: &gltf::Node,
    mesh: &gltf::Mesh,
    transform: Mat4,
    buffers: &[gltf::buffer::Data],
    session: &mut ImportSession,
) {
    let label = mesh
        .name()
        .or(node.name())
        .map(str::to_owned)
        .unwrap_or_else(|| format!("object{}", node.index()));

    let mut faces: Vec<(VolumeFace, String)> = Vec::new();
    let mut materials: BTreeMap<String, ImportMaterial> = BTreeMap::new();
    let mut weights = WeightMap::new();
    let mut status = MeshStatus::Ok;

    for primitive in mesh.primitives() {
        if primitive.mode() != gltf::mesh::Mode::Triangles {
            warn!(
                "mesh '{label}': skipping non-triangle primitive {:?}",
                primitive.mode()
            );
            continue;
        }
        let reader = primitive.reader(|buffer| buffers.get(buffer.index()).map(|d| &d.0[..]));
        let Some(positions) = reader.read_positions() else {
            status = status.max(MeshStatus::BadElement);
            continue;
        };
        let positions: Vec<Vec3> = positions.map(Vec3::from).collect();
        if positions.len() >= MAX_FACE_VERTICES {
            warn!(
                "mesh '{label}': primitive holds {} vertices, over the 16-bit ceiling",
                positions.len()
            );
            status = status.max(MeshStatus::VertexNumberOverflow);
            continue;
        }
        let normals: Option<Vec<Vec3>> = reader
            .read_normals()
            .map(|iter| iter.map(Vec3::from).collect());
        let tex_coords: Option<Vec<Vec2>> = reader
            .read_tex_coords(0)
            .map(|tc| tc.into_f32().map(Vec2::from).collect());
        let indices: Vec<u32> = match reader.read_indices() {
            Some(iter) => iter.into_u32().collect(),
            None => (0..positions.len() as u32).collect(),
        };

        let material = material_binding_name(&primitive);
        materials
            .entry(material.clone())
            .or_insert_with(|| resolve_material(&primitive, &material));

        let mut builder = FaceBuilder::new(normals.is_some(), tex_coords.is_some());
        let mut primitive_status = MeshStatus::Ok;
        for tri in indices.chunks_exact(3) {
            let corner = |i: u32| -> Option<VertexData> {
                let i = i as usize;
                Some(VertexData {
                    position: *positions.get(i)?,
                    normal: normals.as_ref().map_or(Vec3::ZERO, |n| n[i]),
                    tex_coord: tex_coords.as_ref().map_or(Vec2::ZERO, |tc| tc[i]),
                })
            };
            let Some(corners) = corner(tri[0])
                .zip(corner(tri[1]))
                .zip(corner(tri[2]))
                .map(|((a, b), c)| [a, b, c])
            else {
                primitive_status = MeshStatus::BadElement;
                break;
            };
            if let Err(e) = builder.push_triangle(corners) {
                primitive_status = e;
                break;
            }
        }
        if primitive_status != MeshStatus::Ok {
            status = status.max(primitive_status);
            continue;
        }
        if let Some(face) = builder.finish() {
            faces.push((face, material));
        }

        // Skin streams are per primitive; fold them into the position-keyed map.
        if let (Some(joints), Some(vertex_weights)) =
            (reader.read_joints(0), reader.read_weights(0))
        {
            for ((position, joint), weight) in positions
                .iter()
                .zip(joints.into_u16())
                .zip(vertex_weights.into_f32())
            {
                let mut influences: Vec<JointWeight> = joint
                    .iter()
                    .zip(weight)
                    .map(|(&j, w)| JointWeight {
                        joint: j as usize,
                        weight: w,
                    })
                    .collect();
                normalize_weights(&mut influences);
                if !influences.is_empty() {
                    weights.insert(vec3_bits(*position), influences);
                }
            }
        }
    }

    if faces.is_empty() && status == MeshStatus::Ok {
        warn!("mesh '{label}' produced no faces");
        return;
    }

    let skin = node.skin().map(|skin| load_skin(&skin, buffers, session));
    let mut models = if faces.is_empty() {
        let mut stub = Model::new(format!("{label}{}", session.lod.suffix()));
        stub.status = status;
        vec![stub]
    } else {
        split_into_models(&label, session.lod, faces, session.submodel_limit)
    };

    for model in &mut models {
        model.status = model.status.max(status);
        if let Some(skin) = &skin {
            model.skin = skin.clone();
            model.weights = weights.clone();
        }
    }
    for model in models {
        let label = model.label.clone();
        let index = session.add_model(model);
        session.add_instance(index, label, transform, materials.clone());
    }
}

fn load_skin(
    skin: &gltf::Skin,
    buffers: &[gltf::buffer::Data],
    session: &mut ImportSession,
) -> SkinInfo {
    let mut info = SkinInfo::default();
    let mut joint_translations: HashMap<String, Vec3> = HashMap::new();

    for joint in skin.joints() {
        let raw = joint
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("joint{}", joint.index()));
        let name = map_joint_name(&session.joint_aliases, &raw);
        let (translation, _, _) = joint.transform().decomposed();
        joint_translations.insert(name.clone(), Vec3::from(translation));
        info.joint_names.push(name);
    }

    let reader = skin.reader(|buffer| buffers.get(buffer.index()).map(|d| &d.0[..]));
    if let Some(matrices) = reader.read_inverse_bind_matrices() {
        info.inverse_bind_matrices = matrices.map(|m| Mat4::from_cols_array_2d(&m)).collect();
    }

    let flags = critique_rig(&info, &session.skeleton, session.max_joints_per_mesh);
    session.rig.unknown_joint |= flags.unknown_joint;
    session.rig.too_many_joints |= flags.too_many_joints;
    session.rig.no_joints |= flags.no_joints;

    build_alternate_bind(&mut info, &joint_translations);
    info
}

fn material_binding_name(primitive: &gltf::Primitive) -> String {
    match primitive.material().index() {
        Some(i) => format!("mat{i}"),
        None => "mat_default".to_owned(),
    }
}

fn resolve_material(primitive: &gltf::Primitive, binding: &str) -> ImportMaterial {
    let material = primitive.material();
    let pbr = material.pbr_metallic_roughness();

    let diffuse_map = pbr.base_color_texture().and_then(|t| {
        let image = t.texture().source();
        match image.source() {
            gltf::image::Source::Uri { uri, .. } => Some(uri.to_owned()),
            gltf::image::Source::View { .. } => image
                .name()
                .or(t.texture().name())
                .map(str::to_owned),
        }
    });

    let emissive = material.emissive_factor();
    ImportMaterial {
        name: binding.to_owned(),
        diffuse_color: pbr.base_color_factor(),
        diffuse_map,
        fullbright: (emissive[0] + emissive[1] + emissive[2]) / 3.0 > FULLBRIGHT_EMISSION,
    }
}
