//! COLLADA (.dae) frontend.
//!
//! Walks the XML document directly: sources are resolved by URI fragment,
//! primitives are welded through [`FaceStream`], skins land in the model's
//! position-keyed weight map, and the visual scene produces one instance per
//! placed geometry.

use std::collections::{BTreeMap, HashMap};

use glam::{Mat4, Vec2, Vec3};
use log::{debug, warn};
use roxmltree::{Document, Node};

use crate::{
    Error, FaceStream, ImportMaterial, ImportSession, JointWeight, LoadState, MeshStatus, Model,
    ModelLoader, SkinInfo, VertexData, VolumeFace, WeightMap, bind_shape_is_rotated,
    build_alternate_bind, critique_rig, fan_triangles, map_joint_name, normalize_weights,
    split_into_models, vec3_bits,
};
use crate::{UpAxis, base_transform};

/// Bind-shape rotations under this many radians pass without warning.
const BIND_ROTATION_TOLERANCE: f32 = 0.05;

/// Emission brighter than this flags the material as fullbright.
const FULLBRIGHT_EMISSION: f32 = 0.25;

#[derive(Default)]
pub struct DaeLoader;

impl ModelLoader for DaeLoader {
    fn parse(&mut self, session: &mut ImportSession, data: &[u8]) -> Result<(), Error> {
        let text = std::str::from_utf8(data).map_err(|e| Error::DaeParse {
            message: e.to_string(),
        })?;
        // Some exporters put spaces in ids; sanitize them and the references
        // that point at them before the XML parse.
        let text = preprocess_ids(text);
        let doc = Document::parse(&text).map_err(|e| Error::DaeParse {
            message: e.to_string(),
        })?;

        let root = doc.root_element();
        if root.tag_name().name() != "COLLADA" {
            return Err(Error::DaeMissingElement {
                element: "COLLADA".into(),
            });
        }
        match root.attribute("version") {
            Some(v) if v.starts_with("1.4") => debug!("COLLADA version {v}"),
            Some(v) => warn!("unsupported COLLADA version {v}, parsing anyway"),
            None => warn!("COLLADA document carries no version"),
        }

        let by_id: HashMap<&str, Node> = doc
            .descendants()
            .filter_map(|n| n.attribute("id").map(|id| (id, n)))
            .collect();

        let base = document_transform(root);
        let skins = collect_skins(root, &by_id);
        let joint_translations = collect_joint_translations(root, session);

        // Geometries first; the scene walk instances them.
        let geometries = child(root, "library_geometries").ok_or_else(|| {
            Error::DaeMissingElement {
                element: "library_geometries".into(),
            }
        })?;

        let mut models_by_geometry: HashMap<String, Vec<usize>> = HashMap::new();
        for geometry in children(geometries, "geometry") {
            let Some(id) = geometry.attribute("id") else {
                continue;
            };
            let label = geometry.attribute("name").unwrap_or(id).to_owned();
            let Some(mesh) = child(geometry, "mesh") else {
                continue;
            };

            let models = match load_mesh_faces(mesh, &by_id) {
                Ok(faces) if faces.is_empty() => {
                    warn!("geometry '{label}' produced no faces");
                    continue;
                }
                Ok(faces) => split_into_models(&label, session.lod, faces, session.submodel_limit),
                Err(status) => {
                    warn!("geometry '{label}' rejected: {status}");
                    let mut stub = Model::new(format!("{label}{}", session.lod.suffix()));
                    stub.status = status;
                    vec![stub]
                }
            };

            let mut indices = Vec::with_capacity(models.len());
            for mut model in models {
                if let Some(skin) = skins.get(id) {
                    apply_skin(&mut model, skin, mesh, &by_id, session, &joint_translations);
                }
                indices.push(session.add_model(model));
            }
            models_by_geometry.insert(id.to_owned(), indices);
        }

        let scene = find_visual_scene(root, &by_id).ok_or_else(|| Error::DaeMissingElement {
            element: "visual_scene".into(),
        })?;
        for node in children(scene, "node") {
            process_scene_node(node, base, session, &models_by_geometry, &by_id, 0);
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// document plumbing

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn children<'a, 'input>(
    node: Node<'a, 'input>,
    name: &'a str,
) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children()
        .filter(move |c| c.is_element() && c.tag_name().name() == name)
}

fn fragment(url: &str) -> &str {
    url.strip_prefix('#').unwrap_or(url)
}

fn floats(node: Node) -> Vec<f32> {
    node.text()
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect()
}

fn ints(node: Node) -> Vec<i64> {
    node.text()
        .unwrap_or_default()
        .split_whitespace()
        .filter_map(|t| t.parse().ok())
        .collect()
}

/// `<source>` holding a float array, resolved by id.
fn float_source(by_id: &HashMap<&str, Node>, id: &str) -> Option<Vec<f32>> {
    let source = by_id.get(id)?;
    let array = child(*source, "float_array")?;
    Some(floats(array))
}

/// `<source>` holding names (Name_array or IDREF_array), resolved by id.
fn name_source(by_id: &HashMap<&str, Node>, id: &str) -> Option<Vec<String>> {
    let source = by_id.get(id)?;
    let array = child(*source, "Name_array").or_else(|| child(*source, "IDREF_array"))?;
    Some(
        array
            .text()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_owned)
            .collect(),
    )
}

/// COLLADA writes matrices in row-major text order.
fn mat4_from_row_major(v: &[f32]) -> Option<Mat4> {
    if v.len() < 16 {
        return None;
    }
    let mut cols = [0.0f32; 16];
    for row in 0..4 {
        for col in 0..4 {
            cols[col * 4 + row] = v[row * 4 + col];
        }
    }
    Some(Mat4::from_cols_array(&cols))
}

/// Replace spaces inside the attribute values that participate in id lookup.
fn preprocess_ids(text: &str) -> String {
    let mut out = text.to_owned();
    for attr in ["id", "name", "url", "source", "target"] {
        out = sanitize_attr(&out, attr);
    }
    out
}

fn sanitize_attr(text: &str, attr: &str) -> String {
    let needle = format!(" {attr}=\"");
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find(&needle) {
        let value_start = pos + needle.len();
        out.push_str(&rest[..value_start]);
        match rest[value_start..].find('"') {
            Some(end) => {
                out.push_str(&rest[value_start..value_start + end].replace(' ', "_"));
                rest = &rest[value_start + end..];
            }
            None => {
                out.push_str(&rest[value_start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Up-axis and unit scale from the document `<asset>` block.
fn document_transform(root: Node) -> Mat4 {
    let mut up = UpAxis::Y;
    let mut meters = 1.0f32;
    if let Some(asset) = child(root, "asset") {
        if let Some(unit) = child(asset, "unit") {
            if let Some(m) = unit.attribute("meter").and_then(|m| m.parse().ok()) {
                meters = m;
            }
        }
        if let Some(axis) = child(asset, "up_axis") {
            up = match axis.text().unwrap_or_default().trim() {
                "X_UP" => UpAxis::X,
                "Z_UP" => UpAxis::Z,
                _ => UpAxis::Y,
            };
        }
    }
    base_transform(up, meters)
}

fn find_visual_scene<'a, 'input>(
    root: Node<'a, 'input>,
    by_id: &HashMap<&'a str, Node<'a, 'input>>,
) -> Option<Node<'a, 'input>> {
    let scene = child(root, "scene")?;
    let instance = child(scene, "instance_visual_scene")?;
    let url = instance.attribute("url")?;
    by_id
        .get(fragment(url))
        .copied()
        .or_else(|| child(root, "library_visual_scenes").and_then(|l| child(l, "visual_scene")))
}

// ---------------------------------------------------------------------------
// geometry

struct VertexInputs {
    positions: Vec<Vec3>,
    normals: Option<Vec<Vec3>>,
    tex_coords: Option<Vec<Vec2>>,
    pos_offset: usize,
    norm_offset: usize,
    tc_offset: usize,
    stride: usize,
}

impl VertexInputs {
    fn corner(&self, p: &[i64], corner: usize) -> Result<VertexData, MeshStatus> {
        let base = corner * self.stride;
        if base + self.stride > p.len() {
            return Err(MeshStatus::BadElement);
        }
        let fetch3 = |list: &[Vec3], idx: i64| -> Result<Vec3, MeshStatus> {
            usize::try_from(idx)
                .ok()
                .and_then(|i| list.get(i).copied())
                .ok_or(MeshStatus::BadElement)
        };

        let position = fetch3(&self.positions, p[base + self.pos_offset])?;
        let normal = match &self.normals {
            Some(normals) => fetch3(normals, p[base + self.norm_offset])?,
            None => Vec3::ZERO,
        };
        let tex_coord = match &self.tex_coords {
            Some(tc) => usize::try_from(p[base + self.tc_offset])
                .ok()
                .and_then(|i| tc.get(i).copied())
                .ok_or(MeshStatus::BadElement)?,
            None => Vec2::ZERO,
        };
        Ok(VertexData {
            position,
            normal,
            tex_coord,
        })
    }
}

fn vec3_list(raw: Vec<f32>) -> Vec<Vec3> {
    raw.chunks_exact(3)
        .map(|c| Vec3::new(c[0], c[1], c[2]))
        .collect()
}

fn vec2_list(raw: Vec<f32>) -> Vec<Vec2> {
    raw.chunks_exact(2).map(|c| Vec2::new(c[0], c[1])).collect()
}

/// Resolve the `<input>` layout of one primitive block. The VERTEX semantic
/// indirects through the mesh's `<vertices>` element.
fn resolve_inputs(
    primitive: Node,
    by_id: &HashMap<&str, Node>,
) -> Result<VertexInputs, MeshStatus> {
    let mut positions = None;
    let mut normals = None;
    let mut tex_coords = None;
    let mut pos_offset = 0;
    let mut norm_offset = 0;
    let mut tc_offset = 0;
    let mut stride = 1;

    for input in children(primitive, "input") {
        let semantic = input.attribute("semantic").unwrap_or_default();
        let source = fragment(input.attribute("source").unwrap_or_default());
        let offset: usize = input
            .attribute("offset")
            .and_then(|o| o.parse().ok())
            .unwrap_or(0);
        stride = stride.max(offset + 1);

        match semantic {
            "VERTEX" => {
                let vertices = by_id.get(source).ok_or(MeshStatus::BadElement)?;
                for vinput in children(*vertices, "input") {
                    let vsource = fragment(vinput.attribute("source").unwrap_or_default());
                    match vinput.attribute("semantic").unwrap_or_default() {
                        "POSITION" => {
                            let raw = float_source(by_id, vsource).ok_or(MeshStatus::BadElement)?;
                            positions = Some(vec3_list(raw));
                            pos_offset = offset;
                        }
                        "NORMAL" => {
                            let raw = float_source(by_id, vsource).ok_or(MeshStatus::BadElement)?;
                            normals = Some(vec3_list(raw));
                            norm_offset = offset;
                        }
                        _ => {}
                    }
                }
            }
            "NORMAL" => {
                let raw = float_source(by_id, source).ok_or(MeshStatus::BadElement)?;
                normals = Some(vec3_list(raw));
                norm_offset = offset;
            }
            "TEXCOORD" if tex_coords.is_none() => {
                let raw = float_source(by_id, source).ok_or(MeshStatus::BadElement)?;
                tex_coords = Some(vec2_list(raw));
                tc_offset = offset;
            }
            _ => {}
        }
    }

    Ok(VertexInputs {
        positions: positions.ok_or(MeshStatus::BadElement)?,
        normals,
        tex_coords,
        pos_offset,
        norm_offset,
        tc_offset,
        stride,
    })
}

/// Weld every primitive block of one `<mesh>` into faces with their material
/// binding symbol.
fn load_mesh_faces(
    mesh: Node,
    by_id: &HashMap<&str, Node>,
) -> Result<Vec<(VolumeFace, String)>, MeshStatus> {
    let mut out = Vec::new();

    for primitive in mesh.children().filter(|c| c.is_element()) {
        let kind = primitive.tag_name().name();
        if !matches!(kind, "triangles" | "polylist" | "polygons") {
            continue;
        }
        let inputs = resolve_inputs(primitive, by_id)?;
        let material = primitive.attribute("material").unwrap_or_default();
        let mut stream = FaceStream::new(
            material,
            inputs.normals.is_some(),
            inputs.tex_coords.is_some(),
        );

        match kind {
            "triangles" => {
                let p = child(primitive, "p").map(ints).unwrap_or_default();
                let corners = p.len() / inputs.stride;
                for tri in 0..corners / 3 {
                    stream.push_triangle([
                        inputs.corner(&p, tri * 3)?,
                        inputs.corner(&p, tri * 3 + 1)?,
                        inputs.corner(&p, tri * 3 + 2)?,
                    ])?;
                }
            }
            "polylist" => {
                let vcount = child(primitive, "vcount").map(ints).unwrap_or_default();
                let p = child(primitive, "p").map(ints).unwrap_or_default();
                let mut first = 0usize;
                for count in vcount {
                    let count = usize::try_from(count).map_err(|_| MeshStatus::BadElement)?;
                    for [a, b, c] in fan_triangles(count) {
                        stream.push_triangle([
                            inputs.corner(&p, first + a)?,
                            inputs.corner(&p, first + b)?,
                            inputs.corner(&p, first + c)?,
                        ])?;
                    }
                    first += count;
                }
            }
            "polygons" => {
                for p in children(primitive, "p") {
                    let p = ints(p);
                    let count = p.len() / inputs.stride;
                    for [a, b, c] in fan_triangles(count) {
                        stream.push_triangle([
                            inputs.corner(&p, a)?,
                            inputs.corner(&p, b)?,
                            inputs.corner(&p, c)?,
                        ])?;
                    }
                }
            }
            _ => unreachable!(),
        }

        out.extend(stream.finish());
    }

    Ok(out)
}

// ---------------------------------------------------------------------------
// skinning

struct DaeSkin {
    bind_shape: Mat4,
    joints: Vec<String>,
    inverse_bind: Vec<Mat4>,
    /// Influences per source vertex index, already normalized.
    vertex_weights: Vec<Vec<JointWeight>>,
}

/// Map of geometry id -> parsed skin, from `library_controllers`.
fn collect_skins(root: Node, by_id: &HashMap<&str, Node>) -> HashMap<String, DaeSkin> {
    let mut out = HashMap::new();
    let Some(controllers) = child(root, "library_controllers") else {
        return out;
    };
    for controller in children(controllers, "controller") {
        let Some(skin_node) = child(controller, "skin") else {
            continue;
        };
        let Some(source) = skin_node.attribute("source") else {
            continue;
        };
        match parse_skin(skin_node, by_id) {
            Ok(skin) => {
                out.insert(fragment(source).to_owned(), skin);
            }
            Err(status) => {
                warn!(
                    "skin for '{}' rejected: {status}",
                    fragment(source)
                );
            }
        }
    }
    out
}

fn parse_skin(skin: Node, by_id: &HashMap<&str, Node>) -> Result<DaeSkin, MeshStatus> {
    let bind_shape = child(skin, "bind_shape_matrix")
        .map(floats)
        .and_then(|v| mat4_from_row_major(&v))
        .unwrap_or(Mat4::IDENTITY);

    let mut joints = Vec::new();
    let mut inverse_bind = Vec::new();
    if let Some(joints_node) = child(skin, "joints") {
        for input in children(joints_node, "input") {
            let source = fragment(input.attribute("source").unwrap_or_default());
            match input.attribute("semantic").unwrap_or_default() {
                "JOINT" => {
                    joints = name_source(by_id, source).ok_or(MeshStatus::BadElement)?;
                }
                "INV_BIND_MATRIX" => {
                    let raw = float_source(by_id, source).ok_or(MeshStatus::BadElement)?;
                    inverse_bind = raw
                        .chunks_exact(16)
                        .filter_map(mat4_from_row_major)
                        .collect();
                }
                _ => {}
            }
        }
    }
    if joints.is_empty() {
        return Err(MeshStatus::BadElement);
    }

    let weights_node = child(skin, "vertex_weights").ok_or(MeshStatus::BadElement)?;
    let mut joint_offset = 0usize;
    let mut weight_offset = 0usize;
    let mut stride = 1usize;
    let mut weight_values = Vec::new();
    for input in children(weights_node, "input") {
        let offset: usize = input
            .attribute("offset")
            .and_then(|o| o.parse().ok())
            .unwrap_or(0);
        stride = stride.max(offset + 1);
        match input.attribute("semantic").unwrap_or_default() {
            "JOINT" => joint_offset = offset,
            "WEIGHT" => {
                weight_offset = offset;
                let source = fragment(input.attribute("source").unwrap_or_default());
                weight_values = float_source(by_id, source).ok_or(MeshStatus::BadElement)?;
            }
            _ => {}
        }
    }

    let vcount = child(weights_node, "vcount")
        .map(ints)
        .ok_or(MeshStatus::BadElement)?;
    let v = child(weights_node, "v").map(ints).unwrap_or_default();

    // The index list must cover exactly the influences vcount promises.
    let total: usize = vcount
        .iter()
        .map(|&c| usize::try_from(c).unwrap_or(0))
        .sum();
    if total * stride != v.len() {
        return Err(MeshStatus::BadElement);
    }

    let mut vertex_weights = Vec::with_capacity(vcount.len());
    let mut cursor = 0usize;
    for &count in &vcount {
        let count = usize::try_from(count).map_err(|_| MeshStatus::BadElement)?;
        let mut influences = Vec::with_capacity(count.min(4));
        for _ in 0..count {
            let joint = v[cursor + joint_offset];
            let weight_idx = v[cursor + weight_offset];
            cursor += stride;
            // -1 binds to the bind shape, not a joint.
            if joint < 0 {
                continue;
            }
            let joint = usize::try_from(joint).map_err(|_| MeshStatus::BadElement)?;
            let weight = usize::try_from(weight_idx)
                .ok()
                .and_then(|i| weight_values.get(i).copied())
                .ok_or(MeshStatus::BadElement)?;
            influences.push(JointWeight { joint, weight });
        }
        normalize_weights(&mut influences);
        vertex_weights.push(influences);
    }

    Ok(DaeSkin {
        bind_shape,
        joints,
        inverse_bind,
        vertex_weights,
    })
}

/// Attach a parsed skin to one model: alias-map the joints, key the weights by
/// source vertex position, grade the rig, and build the alternate bind set.
fn apply_skin(
    model: &mut Model,
    skin: &DaeSkin,
    mesh: Node,
    by_id: &HashMap<&str, Node>,
    session: &mut ImportSession,
    joint_translations: &HashMap<String, Vec3>,
) {
    let mut info = SkinInfo {
        bind_shape_matrix: skin.bind_shape,
        inverse_bind_matrices: skin.inverse_bind.clone(),
        ..SkinInfo::default()
    };
    for name in &skin.joints {
        info.joint_names
            .push(map_joint_name(&session.joint_aliases, name));
    }

    let flags = critique_rig(&info, &session.skeleton, session.max_joints_per_mesh);
    session.rig.unknown_joint |= flags.unknown_joint;
    session.rig.too_many_joints |= flags.too_many_joints;
    session.rig.no_joints |= flags.no_joints;

    build_alternate_bind(&mut info, joint_translations);
    if bind_shape_is_rotated(&info, BIND_ROTATION_TOLERANCE) {
        warn!(
            "model '{}' has a rotated bind shape; reposing will be wrong",
            model.label
        );
        session.escalate_state(LoadState::WarningBindShapeOrientation);
    }

    // Weights arrive per source vertex index; the weld re-indexed everything,
    // so key them by position instead.
    let mut weights = WeightMap::new();
    if let Some(positions) = mesh_positions(mesh, by_id) {
        for (i, influences) in skin.vertex_weights.iter().enumerate() {
            if influences.is_empty() {
                continue;
            }
            if let Some(p) = positions.get(i) {
                weights.insert(vec3_bits(*p), influences.clone());
            }
        }
    }

    model.skin = info;
    model.weights = weights;
}

/// The POSITION source of a mesh, for keying skin weights.
fn mesh_positions(mesh: Node, by_id: &HashMap<&str, Node>) -> Option<Vec<Vec3>> {
    let vertices = child(mesh, "vertices")?;
    for input in children(vertices, "input") {
        if input.attribute("semantic") == Some("POSITION") {
            let source = fragment(input.attribute("source")?);
            return float_source(by_id, source).map(vec3_list);
        }
    }
    None
}

/// Rest translations of every JOINT node in the visual scenes, alias-mapped.
fn collect_joint_translations(root: Node, session: &ImportSession) -> HashMap<String, Vec3> {
    let mut out = HashMap::new();
    let Some(scenes) = child(root, "library_visual_scenes") else {
        return out;
    };
    for scene in children(scenes, "visual_scene") {
        for node in children(scene, "node") {
            collect_joint_node(node, session, &mut out);
        }
    }
    out
}

fn collect_joint_node(node: Node, session: &ImportSession, out: &mut HashMap<String, Vec3>) {
    if node.attribute("type") == Some("JOINT") {
        let raw = node
            .attribute("name")
            .or_else(|| node.attribute("id"))
            .unwrap_or_default();
        let name = map_joint_name(&session.joint_aliases, raw);
        let translation = child(node, "translate")
            .map(floats)
            .filter(|v| v.len() >= 3)
            .map(|v| Vec3::new(v[0], v[1], v[2]))
            .or_else(|| {
                child(node, "matrix")
                    .map(floats)
                    .and_then(|v| mat4_from_row_major(&v))
                    .map(|m| m.w_axis.truncate())
            });
        if let Some(t) = translation {
            out.insert(name, t);
        }
    }
    for c in children(node, "node") {
        collect_joint_node(c, session, out);
    }
}

// ---------------------------------------------------------------------------
// scene

fn node_transform(node: Node, session: &mut ImportSession) -> Mat4 {
    let mut transform = Mat4::IDENTITY;
    for element in node.children().filter(|c| c.is_element()) {
        let step = match element.tag_name().name() {
            "translate" => {
                let v = floats(element);
                (v.len() >= 3).then(|| Mat4::from_translation(Vec3::new(v[0], v[1], v[2])))
            }
            "rotate" => {
                let v = floats(element);
                (v.len() >= 4).then(|| {
                    let axis = Vec3::new(v[0], v[1], v[2]).normalize_or_zero();
                    Mat4::from_axis_angle(axis, v[3].to_radians())
                })
            }
            "scale" => {
                let v = floats(element);
                (v.len() >= 3).then(|| Mat4::from_scale(Vec3::new(v[0], v[1], v[2])))
            }
            "matrix" => mat4_from_row_major(&floats(element)),
            _ => None,
        };
        if let Some(step) = step {
            transform *= step;
        }
    }
    if transform.determinant() < 0.0 {
        warn!("negative-determinant transform in scene node, mesh will be inverted");
        session.escalate_state(LoadState::ErrorParsing);
    }
    transform
}

fn process_scene_node(
    node: Node,
    parent: Mat4,
    session: &mut ImportSession,
    models_by_geometry: &HashMap<String, Vec<usize>>,
    by_id: &HashMap<&str, Node>,
    depth: usize,
) {
    if depth > 64 {
        warn!("scene node nesting too deep, stopping");
        return;
    }
    let transform = parent * node_transform(node, session);

    for element in node.children().filter(|c| c.is_element()) {
        match element.tag_name().name() {
            "instance_geometry" => {
                let url = fragment(element.attribute("url").unwrap_or_default());
                instance_models(element, url, transform, session, models_by_geometry, by_id);
            }
            "instance_controller" => {
                // Instancing the controller places its skinned geometry.
                let url = fragment(element.attribute("url").unwrap_or_default());
                let geometry = by_id
                    .get(url)
                    .and_then(|c| child(*c, "skin"))
                    .and_then(|s| s.attribute("source"))
                    .map(fragment);
                if let Some(geometry) = geometry {
                    instance_models(
                        element,
                        geometry,
                        transform,
                        session,
                        models_by_geometry,
                        by_id,
                    );
                }
            }
            "instance_node" => {
                let url = fragment(element.attribute("url").unwrap_or_default());
                if let Some(target) = by_id.get(url).copied() {
                    process_scene_node(
                        target,
                        transform,
                        session,
                        models_by_geometry,
                        by_id,
                        depth + 1,
                    );
                }
            }
            "node" => {
                process_scene_node(
                    element,
                    transform,
                    session,
                    models_by_geometry,
                    by_id,
                    depth + 1,
                );
            }
            _ => {}
        }
    }
}

fn instance_models(
    instance: Node,
    geometry_id: &str,
    transform: Mat4,
    session: &mut ImportSession,
    models_by_geometry: &HashMap<String, Vec<usize>>,
    by_id: &HashMap<&str, Node>,
) {
    let Some(model_indices) = models_by_geometry.get(geometry_id) else {
        warn!("instance references unknown geometry '{geometry_id}'");
        session.escalate_state(LoadState::ErrorParsing);
        return;
    };

    let materials = bound_materials(instance, by_id);
    for &index in model_indices {
        let label = session.models[index].label.clone();
        session.add_instance(index, label, transform, materials.clone());
    }
}

/// `<bind_material>` symbol -> resolved material.
fn bound_materials(
    instance: Node,
    by_id: &HashMap<&str, Node>,
) -> BTreeMap<String, ImportMaterial> {
    let mut out = BTreeMap::new();
    let Some(bindings) = child(instance, "bind_material")
        .and_then(|b| child(b, "technique_common"))
    else {
        return out;
    };
    for binding in children(bindings, "instance_material") {
        let Some(symbol) = binding.attribute("symbol") else {
            continue;
        };
        let target = fragment(binding.attribute("target").unwrap_or_default());
        let mut material = resolve_material(target, by_id);
        material.name = symbol.to_owned();
        out.insert(symbol.to_owned(), material);
    }
    out
}

/// Walk material -> effect -> profile_COMMON for the diffuse channel and the
/// fullbright test.
fn resolve_material(material_id: &str, by_id: &HashMap<&str, Node>) -> ImportMaterial {
    let mut out = ImportMaterial::default();
    let Some(effect) = by_id
        .get(material_id)
        .and_then(|m| child(*m, "instance_effect"))
        .and_then(|e| e.attribute("url"))
        .and_then(|url| by_id.get(fragment(url)))
        .copied()
    else {
        return out;
    };
    let Some(shader) = child(effect, "profile_COMMON")
        .and_then(|profile| child(profile, "technique"))
        .and_then(|t| {
            child(t, "phong")
                .or_else(|| child(t, "lambert"))
                .or_else(|| child(t, "blinn"))
        })
    else {
        return out;
    };

    if let Some(diffuse) = child(shader, "diffuse") {
        if let Some(color) = child(diffuse, "color") {
            let v = floats(color);
            if v.len() >= 4 {
                out.diffuse_color = [v[0], v[1], v[2], v[3]];
            }
        }
        if let Some(texture) = child(diffuse, "texture") {
            let sampler = texture.attribute("texture").unwrap_or_default();
            out.diffuse_map = resolve_texture_file(sampler, effect, by_id);
        }
    }
    if let Some(emission) = child(shader, "emission").and_then(|e| child(e, "color")) {
        let v = floats(emission);
        if v.len() >= 3 && (v[0] + v[1] + v[2]) / 3.0 > FULLBRIGHT_EMISSION {
            out.fullbright = true;
        }
    }
    out
}

/// Follow a sampler sid through its surface to the image file, falling back to
/// treating the reference as a direct image id (some exporters skip the
/// sampler indirection).
fn resolve_texture_file(
    sampler_sid: &str,
    effect: Node,
    by_id: &HashMap<&str, Node>,
) -> Option<String> {
    let image_id = find_sid(effect, sampler_sid)
        .and_then(|newparam| child(newparam, "sampler2D"))
        .and_then(|s| child(s, "source"))
        .and_then(|s| s.text())
        .map(str::trim)
        .and_then(|surface_sid| find_sid(effect, surface_sid))
        .and_then(|newparam| child(newparam, "surface"))
        .and_then(|s| child(s, "init_from"))
        .and_then(|i| i.text())
        .map(|t| t.trim().to_owned())
        .unwrap_or_else(|| sampler_sid.to_owned());

    by_id
        .get(image_id.as_str())
        .and_then(|image| child(*image, "init_from"))
        .and_then(|i| i.text())
        .map(|t| t.trim().to_owned())
}

/// Sampler and surface parameters are sid-scoped inside their effect.
fn find_sid<'a, 'input>(effect: Node<'a, 'input>, sid: &str) -> Option<Node<'a, 'input>> {
    effect.descendants().find(|n| n.attribute("sid") == Some(sid))
}
