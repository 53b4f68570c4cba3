//! Packed mesh asset: a JSON header addressing deflate-compressed blocks, one
//! per LOD slot plus an optional skin block. Geometry is quantized to 16 bits
//! per channel across per-face domains stored alongside the streams.

use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use glam::{Mat4, Vec2, Vec3};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::{Error, JointWeight, LodLevel, Model, SkinInfo, VolumeFace, WeightMap, vec3_bits};

const MAGIC: &[u8; 4] = b"MPAK";
const FORMAT_VERSION: u32 = 1;

const FACE_HAS_NORMALS: u8 = 1;
const FACE_HAS_TEX_COORDS: u8 = 2;
const FACE_HAS_WEIGHTS: u8 = 4;
const FACE_NO_GEOMETRY: u8 = 8;

/// End marker for a vertex carrying fewer than four influences.
const WEIGHT_TERMINATOR: u8 = 0xFF;

/// Models to pack, one per LOD slot. Slots may be empty; at least one must
/// carry a model.
#[derive(Clone, Copy, Default)]
pub struct LodSet<'a> {
    pub lowest: Option<&'a Model>,
    pub low: Option<&'a Model>,
    pub medium: Option<&'a Model>,
    pub high: Option<&'a Model>,
    pub physics: Option<&'a Model>,
}

impl<'a> LodSet<'a> {
    pub fn single(lod: LodLevel, model: &'a Model) -> Self {
        let mut set = LodSet::default();
        match lod {
            LodLevel::Lowest => set.lowest = Some(model),
            LodLevel::Low => set.low = Some(model),
            LodLevel::Medium => set.medium = Some(model),
            LodLevel::High => set.high = Some(model),
            LodLevel::Physics => set.physics = Some(model),
        }
        set
    }

    fn slots(&self) -> [(LodLevel, Option<&'a Model>); 5] {
        [
            (LodLevel::Lowest, self.lowest),
            (LodLevel::Low, self.low),
            (LodLevel::Medium, self.medium),
            (LodLevel::High, self.high),
            (LodLevel::Physics, self.physics),
        ]
    }

    /// The best model present, for skin and metadata.
    fn primary(&self) -> Option<&'a Model> {
        self.high
            .or(self.medium)
            .or(self.low)
            .or(self.lowest)
            .or(self.physics)
    }
}

/// Result of unpacking an asset.
#[derive(Clone, Debug, Default)]
pub struct DecodedAsset {
    pub lowest: Option<Model>,
    pub low: Option<Model>,
    pub medium: Option<Model>,
    pub high: Option<Model>,
    pub physics: Option<Model>,
    pub skin: Option<SkinInfo>,
    pub submodel_id: u32,
}

fn block_name(lod: LodLevel) -> &'static str {
    match lod {
        LodLevel::Lowest => "lowest_lod",
        LodLevel::Low => "low_lod",
        LodLevel::Medium => "medium_lod",
        LodLevel::High => "high_lod",
        LodLevel::Physics => "physics_mesh",
    }
}

#[derive(Serialize, Deserialize, Clone, Copy)]
struct BlockRef {
    offset: u64,
    size: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct Header {
    version: u32,
    #[serde(default)]
    submodel_id: u32,
    #[serde(default)]
    blocks: BTreeMap<String, BlockRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    skin: Option<BlockRef>,
}

#[derive(Serialize, Deserialize)]
struct SkinBlock {
    joint_names: Vec<String>,
    bind_shape_matrix: [f32; 16],
    inverse_bind_matrices: Vec<[f32; 16]>,
    alternate_bind_matrices: Vec<[f32; 16]>,
    pelvis_offset: f32,
}

// ---------------------------------------------------------------------------
// encode

/// Pack a LOD set into one binary asset.
pub fn encode(set: &LodSet) -> Result<Vec<u8>, Error> {
    let primary = set.primary().ok_or_else(|| Error::AssetEncode {
        message: "no model in any LOD slot".into(),
    })?;

    let mut header = Header {
        version: FORMAT_VERSION,
        submodel_id: primary.submodel_id,
        ..Header::default()
    };
    let mut blocks = Vec::new();

    for (lod, model) in set.slots() {
        let Some(model) = model else {
            continue;
        };
        let raw = encode_model(model)?;
        let packed = deflate(&raw)?;
        header.blocks.insert(
            block_name(lod).to_owned(),
            BlockRef {
                offset: blocks.len() as u64,
                size: packed.len() as u64,
            },
        );
        blocks.extend_from_slice(&packed);
    }

    if primary.skin.is_rigged() {
        let raw = serde_json::to_vec(&skin_block(&primary.skin)).map_err(|e| {
            Error::AssetEncode {
                message: e.to_string(),
            }
        })?;
        let packed = deflate(&raw)?;
        header.skin = Some(BlockRef {
            offset: blocks.len() as u64,
            size: packed.len() as u64,
        });
        blocks.extend_from_slice(&packed);
    }

    let header_json = serde_json::to_vec(&header).map_err(|e| Error::AssetEncode {
        message: e.to_string(),
    })?;

    let mut out = Vec::with_capacity(8 + header_json.len() + blocks.len());
    out.extend_from_slice(MAGIC);
    out.write_u32::<LittleEndian>(header_json.len() as u32)
        .map_err(|e| Error::AssetEncode {
            message: e.to_string(),
        })?;
    out.extend_from_slice(&header_json);
    out.extend_from_slice(&blocks);
    Ok(out)
}

fn encode_model(model: &Model) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    let write_err = |e: std::io::Error| Error::AssetEncode {
        message: e.to_string(),
    };

    out.write_u32::<LittleEndian>(model.faces.len() as u32)
        .map_err(write_err)?;
    for face in &model.faces {
        encode_face(&mut out, model, face).map_err(write_err)?;
    }
    Ok(out)
}

fn encode_face(out: &mut Vec<u8>, model: &Model, face: &VolumeFace) -> std::io::Result<()> {
    if face.positions.len() < 3 {
        out.write_u8(FACE_NO_GEOMETRY)?;
        return Ok(());
    }

    let has_weights = model.skin.is_rigged() && !model.weights.is_empty();
    let mut flags = 0u8;
    if face.normals.is_some() {
        flags |= FACE_HAS_NORMALS;
    }
    if face.tex_coords.is_some() {
        flags |= FACE_HAS_TEX_COORDS;
    }
    if has_weights {
        flags |= FACE_HAS_WEIGHTS;
    }
    out.write_u8(flags)?;

    let [min, max] = face.extents;
    let [tmin, tmax] = face.tex_extents;
    for v in [min, max] {
        out.write_f32::<LittleEndian>(v.x)?;
        out.write_f32::<LittleEndian>(v.y)?;
        out.write_f32::<LittleEndian>(v.z)?;
    }
    for v in [tmin, tmax] {
        out.write_f32::<LittleEndian>(v.x)?;
        out.write_f32::<LittleEndian>(v.y)?;
    }

    out.write_u32::<LittleEndian>(face.positions.len() as u32)?;
    for p in &face.positions {
        out.write_u16::<LittleEndian>(quantize(p.x, min.x, max.x))?;
        out.write_u16::<LittleEndian>(quantize(p.y, min.y, max.y))?;
        out.write_u16::<LittleEndian>(quantize(p.z, min.z, max.z))?;
    }
    if let Some(normals) = &face.normals {
        for n in normals {
            out.write_u16::<LittleEndian>(quantize(n.x, -1.0, 1.0))?;
            out.write_u16::<LittleEndian>(quantize(n.y, -1.0, 1.0))?;
            out.write_u16::<LittleEndian>(quantize(n.z, -1.0, 1.0))?;
        }
    }
    if let Some(tex_coords) = &face.tex_coords {
        for t in tex_coords {
            out.write_u16::<LittleEndian>(quantize(t.x, tmin.x, tmax.x))?;
            out.write_u16::<LittleEndian>(quantize(t.y, tmin.y, tmax.y))?;
        }
    }

    out.write_u32::<LittleEndian>(face.indices.len() as u32)?;
    for &i in &face.indices {
        out.write_u16::<LittleEndian>(i)?;
    }

    if has_weights {
        for p in &face.positions {
            let influences = model.joint_influences(*p);
            let mut written = 0;
            for w in influences.iter().take(4) {
                if w.joint >= WEIGHT_TERMINATOR as usize {
                    warn!("joint index {} too large for asset weights, dropped", w.joint);
                    continue;
                }
                out.write_u8(w.joint as u8)?;
                out.write_u16::<LittleEndian>(quantize(w.weight, 0.0, 1.0))?;
                written += 1;
            }
            if written < 4 {
                out.write_u8(WEIGHT_TERMINATOR)?;
            }
        }
    }
    Ok(())
}

fn skin_block(skin: &SkinInfo) -> SkinBlock {
    SkinBlock {
        joint_names: skin.joint_names.clone(),
        bind_shape_matrix: skin.bind_shape_matrix.to_cols_array(),
        inverse_bind_matrices: skin
            .inverse_bind_matrices
            .iter()
            .map(Mat4::to_cols_array)
            .collect(),
        alternate_bind_matrices: skin
            .alternate_bind_matrices
            .iter()
            .map(Mat4::to_cols_array)
            .collect(),
        pelvis_offset: skin.pelvis_offset,
    }
}

// ---------------------------------------------------------------------------
// decode

/// Unpack an asset produced by [`encode`].
pub fn decode(data: &[u8]) -> Result<DecodedAsset, Error> {
    let decode_err = |message: String| Error::AssetDecode { message };

    if data.len() < 8 || &data[0..4] != MAGIC {
        return Err(decode_err("not a mesh asset".into()));
    }
    let header_len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]) as usize;
    let body_start = 8 + header_len;
    if data.len() < body_start {
        return Err(decode_err("truncated header".into()));
    }
    let header: Header = serde_json::from_slice(&data[8..body_start])
        .map_err(|e| decode_err(e.to_string()))?;
    if header.version != FORMAT_VERSION {
        return Err(decode_err(format!(
            "unsupported asset version {}",
            header.version
        )));
    }
    let body = &data[body_start..];

    let block = |r: &BlockRef| -> Result<Vec<u8>, Error> {
        let start = r.offset as usize;
        let end = start + r.size as usize;
        if end > body.len() {
            return Err(Error::AssetDecode {
                message: "block out of range".into(),
            });
        }
        inflate(&body[start..end])
    };

    let skin = match &header.skin {
        Some(r) => {
            let raw = block(r)?;
            let parsed: SkinBlock =
                serde_json::from_slice(&raw).map_err(|e| decode_err(e.to_string()))?;
            Some(SkinInfo {
                joint_names: parsed.joint_names,
                bind_shape_matrix: Mat4::from_cols_array(&parsed.bind_shape_matrix),
                inverse_bind_matrices: parsed
                    .inverse_bind_matrices
                    .iter()
                    .map(Mat4::from_cols_array)
                    .collect(),
                alternate_bind_matrices: parsed
                    .alternate_bind_matrices
                    .iter()
                    .map(Mat4::from_cols_array)
                    .collect(),
                pelvis_offset: parsed.pelvis_offset,
            })
        }
        None => None,
    };

    let mut out = DecodedAsset {
        submodel_id: header.submodel_id,
        skin: skin.clone(),
        ..DecodedAsset::default()
    };

    for lod in LodLevel::ALL {
        let Some(r) = header.blocks.get(block_name(lod)) else {
            continue;
        };
        let raw = block(r)?;
        let mut model = decode_model(&raw)?;
        model.submodel_id = header.submodel_id;
        if let Some(skin) = &skin {
            model.skin = skin.clone();
        }
        match lod {
            LodLevel::Lowest => out.lowest = Some(model),
            LodLevel::Low => out.low = Some(model),
            LodLevel::Medium => out.medium = Some(model),
            LodLevel::High => out.high = Some(model),
            LodLevel::Physics => out.physics = Some(model),
        }
    }
    Ok(out)
}

fn decode_model(raw: &[u8]) -> Result<Model, Error> {
    let read_err = |e: std::io::Error| Error::AssetDecode {
        message: e.to_string(),
    };
    let mut cursor = Cursor::new(raw);
    let mut model = Model::new("");

    let face_count = read_count(&mut cursor, 1).map_err(read_err)?;
    let mut weights = WeightMap::new();
    for _ in 0..face_count {
        let face = decode_face(&mut cursor, &mut weights).map_err(read_err)?;
        model.faces.push(face);
        model.materials.push(String::new());
    }
    model.weights = weights;
    Ok(model)
}

/// Read a count field and check it fits in the bytes left in the block at its
/// minimum encoded size. Untrusted counts never reach an allocation.
fn read_count(cursor: &mut Cursor<&[u8]>, min_item_bytes: usize) -> std::io::Result<usize> {
    let count = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if count
        .checked_mul(min_item_bytes)
        .is_none_or(|needed| needed > remaining)
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("count {count} exceeds the {remaining} bytes left in the block"),
        ));
    }
    Ok(count)
}

fn decode_face(
    cursor: &mut Cursor<&[u8]>,
    weights: &mut WeightMap,
) -> std::io::Result<VolumeFace> {
    let flags = cursor.read_u8()?;
    if flags & FACE_NO_GEOMETRY != 0 {
        return Ok(VolumeFace::default());
    }

    let vec3 = |c: &mut Cursor<&[u8]>| -> std::io::Result<Vec3> {
        Ok(Vec3::new(
            c.read_f32::<LittleEndian>()?,
            c.read_f32::<LittleEndian>()?,
            c.read_f32::<LittleEndian>()?,
        ))
    };
    let min = vec3(cursor)?;
    let max = vec3(cursor)?;
    let tmin = Vec2::new(
        cursor.read_f32::<LittleEndian>()?,
        cursor.read_f32::<LittleEndian>()?,
    );
    let tmax = Vec2::new(
        cursor.read_f32::<LittleEndian>()?,
        cursor.read_f32::<LittleEndian>()?,
    );

    let vertex_count = read_count(cursor, 6)?;
    let mut positions = Vec::with_capacity(vertex_count);
    for _ in 0..vertex_count {
        positions.push(Vec3::new(
            dequantize(cursor.read_u16::<LittleEndian>()?, min.x, max.x),
            dequantize(cursor.read_u16::<LittleEndian>()?, min.y, max.y),
            dequantize(cursor.read_u16::<LittleEndian>()?, min.z, max.z),
        ));
    }

    let normals = if flags & FACE_HAS_NORMALS != 0 {
        let mut normals = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            normals.push(Vec3::new(
                dequantize(cursor.read_u16::<LittleEndian>()?, -1.0, 1.0),
                dequantize(cursor.read_u16::<LittleEndian>()?, -1.0, 1.0),
                dequantize(cursor.read_u16::<LittleEndian>()?, -1.0, 1.0),
            ));
        }
        Some(normals)
    } else {
        None
    };

    let tex_coords = if flags & FACE_HAS_TEX_COORDS != 0 {
        let mut tc = Vec::with_capacity(vertex_count);
        for _ in 0..vertex_count {
            tc.push(Vec2::new(
                dequantize(cursor.read_u16::<LittleEndian>()?, tmin.x, tmax.x),
                dequantize(cursor.read_u16::<LittleEndian>()?, tmin.y, tmax.y),
            ));
        }
        Some(tc)
    } else {
        None
    };

    let index_count = read_count(cursor, 2)?;
    let mut indices = Vec::with_capacity(index_count);
    for _ in 0..index_count {
        indices.push(cursor.read_u16::<LittleEndian>()?);
    }

    if flags & FACE_HAS_WEIGHTS != 0 {
        for p in &positions {
            let mut influences = Vec::with_capacity(4);
            for _ in 0..4 {
                let joint = cursor.read_u8()?;
                if joint == WEIGHT_TERMINATOR {
                    break;
                }
                let weight = dequantize(cursor.read_u16::<LittleEndian>()?, 0.0, 1.0);
                influences.push(JointWeight {
                    joint: joint as usize,
                    weight,
                });
            }
            if !influences.is_empty() {
                weights.insert(vec3_bits(*p), influences);
            }
        }
    }

    let mut face = VolumeFace {
        positions,
        normals,
        tex_coords,
        indices,
        ..VolumeFace::default()
    };
    face.update_extents();
    Ok(face)
}

// ---------------------------------------------------------------------------
// helpers

fn quantize(v: f32, min: f32, max: f32) -> u16 {
    if max <= min {
        return 0;
    }
    let t = ((v - min) / (max - min)).clamp(0.0, 1.0);
    (t * f32::from(u16::MAX)).round() as u16
}

fn dequantize(q: u16, min: f32, max: f32) -> f32 {
    min + (max - min) * (f32::from(q) / f32::from(u16::MAX))
}

fn deflate(raw: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(|e| Error::AssetEncode {
        message: e.to_string(),
    })?;
    encoder.finish().map_err(|e| Error::AssetEncode {
        message: e.to_string(),
    })
}

fn inflate(packed: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    ZlibDecoder::new(packed)
        .read_to_end(&mut out)
        .map_err(|e| Error::AssetDecode {
            message: e.to_string(),
        })?;
    Ok(out)
}
