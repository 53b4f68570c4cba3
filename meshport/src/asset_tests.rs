use std::io::Write;

use flate2::Compression;
use flate2::write::ZlibEncoder;
use glam::{Mat4, Vec2, Vec3};

use crate::asset::{LodSet, decode, encode};
use crate::{Error, JointWeight, Model, SkinInfo, VolumeFace, vec3_bits};

fn assert_approx(a: f32, b: f32, eps: f32, ctx: &str) {
    if (a - b).abs() > eps {
        panic!("{ctx}: {a} != {b} (eps {eps})");
    }
}

fn quad_model() -> Model {
    let mut model = Model::new("quad");
    let mut face = VolumeFace {
        positions: vec![
            Vec3::new(-2.0, 0.0, -1.0),
            Vec3::new(2.0, 0.0, -1.0),
            Vec3::new(2.0, 0.0, 1.0),
            Vec3::new(-2.0, 0.0, 1.0),
        ],
        normals: Some(vec![Vec3::Y; 4]),
        tex_coords: Some(vec![
            Vec2::new(0.0, 0.0),
            Vec2::new(1.0, 0.0),
            Vec2::new(1.0, 1.0),
            Vec2::new(0.0, 1.0),
        ]),
        indices: vec![0, 1, 2, 0, 2, 3],
        ..VolumeFace::default()
    };
    face.update_extents();
    model.faces.push(face);
    model.materials.push("cloth".into());
    model
}

fn rigged_model() -> Model {
    let mut model = quad_model();
    model.skin = SkinInfo {
        joint_names: vec!["mPelvis".into(), "mTorso".into()],
        bind_shape_matrix: Mat4::from_translation(Vec3::new(0.0, 0.5, 0.0)),
        inverse_bind_matrices: vec![Mat4::IDENTITY; 2],
        alternate_bind_matrices: vec![Mat4::IDENTITY; 2],
        pelvis_offset: -0.25,
    };
    for p in model.faces[0].positions.clone() {
        model.weights.insert(
            vec3_bits(p),
            vec![
                JointWeight {
                    joint: 0,
                    weight: 0.75,
                },
                JointWeight {
                    joint: 1,
                    weight: 0.25,
                },
            ],
        );
    }
    model
}

#[test]
fn geometry_survives_the_pack_within_quantization_error() {
    let model = quad_model();
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");

    let decoded = decode(&packed).expect("decode");
    let high = decoded.high.expect("high lod");
    assert!(decoded.medium.is_none());
    assert_eq!(high.faces.len(), 1);

    let face = &high.faces[0];
    let source = &model.faces[0];
    assert_eq!(face.indices, source.indices);
    assert_eq!(face.vertex_count(), source.vertex_count());

    // 16 bits across a 4-unit domain: well under a millimeter of error.
    for (a, b) in face.positions.iter().zip(&source.positions) {
        assert!((*a - *b).length() < 1e-3, "{a:?} vs {b:?}");
    }
    let normals = face.normals.as_ref().expect("normals");
    for n in normals {
        assert!((*n - Vec3::Y).length() < 1e-3, "{n:?}");
    }
    let tc = face.tex_coords.as_ref().expect("texcoords");
    assert_approx(tc[2].x, 1.0, 1e-4, "tc[2].x");
}

#[test]
fn domain_endpoints_quantize_exactly() {
    let model = quad_model();
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");
    let face = decode(&packed).expect("decode").high.expect("high").faces[0].clone();

    // Extents map to quantization endpoints, so they come back exact.
    assert_eq!(face.extents[0], Vec3::new(-2.0, 0.0, -1.0));
    assert_eq!(face.extents[1], Vec3::new(2.0, 0.0, 1.0));
    assert_approx(face.positions[0].x, -2.0, 0.0, "min x endpoint");
    assert_approx(face.positions[1].x, 2.0, 0.0, "max x endpoint");
}

#[test]
fn every_lod_slot_round_trips_independently() {
    let high = quad_model();
    let low = quad_model();
    let physics = quad_model();
    let packed = encode(&LodSet {
        high: Some(&high),
        low: Some(&low),
        physics: Some(&physics),
        ..LodSet::default()
    })
    .expect("encode");

    let decoded = decode(&packed).expect("decode");
    assert!(decoded.high.is_some());
    assert!(decoded.low.is_some());
    assert!(decoded.physics.is_some());
    assert!(decoded.lowest.is_none());
    assert!(decoded.medium.is_none());
}

#[test]
fn skin_and_weights_round_trip() {
    let model = rigged_model();
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");

    let decoded = decode(&packed).expect("decode");
    let skin = decoded.skin.expect("skin block");
    assert_eq!(skin.joint_names, vec!["mPelvis", "mTorso"]);
    assert_approx(skin.pelvis_offset, -0.25, 0.0, "pelvis offset");
    assert_eq!(
        skin.bind_shape_matrix.w_axis.truncate(),
        Vec3::new(0.0, 0.5, 0.0)
    );

    let high = decoded.high.expect("high");
    assert!(high.skin.is_rigged());
    let influences = high.joint_influences(Vec3::new(-2.0, 0.0, -1.0));
    assert_eq!(influences.len(), 2);
    assert_eq!(influences[0].joint, 0);
    assert_approx(influences[0].weight, 0.75, 1e-3, "strong weight");
    assert_approx(influences[1].weight, 0.25, 1e-3, "weak weight");
}

#[test]
fn unrigged_models_write_no_skin_block() {
    let model = quad_model();
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");
    let decoded = decode(&packed).expect("decode");
    assert!(decoded.skin.is_none());
    assert!(decoded.high.expect("high").weights.is_empty());
}

#[test]
fn submodel_id_rides_in_the_header() {
    let mut model = quad_model();
    model.submodel_id = 2;
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");
    let decoded = decode(&packed).expect("decode");
    assert_eq!(decoded.submodel_id, 2);
    assert_eq!(decoded.high.expect("high").submodel_id, 2);
}

#[test]
fn degenerate_faces_write_a_placeholder() {
    let mut model = quad_model();
    model.faces.push(VolumeFace::default());
    model.materials.push("empty".into());

    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");
    let decoded = decode(&packed).expect("decode");
    let high = decoded.high.expect("high");
    assert_eq!(high.faces.len(), 2);
    assert!(high.faces[1].is_empty());
}

#[test]
fn an_empty_lod_set_refuses_to_encode() {
    match encode(&LodSet::default()) {
        Err(Error::AssetEncode { .. }) => {}
        other => panic!("expected AssetEncode error, got {other:?}"),
    }
}

/// Assemble an asset whose high-LOD block is the given raw face stream.
fn asset_with_block(raw: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).expect("deflate");
    let block = encoder.finish().expect("deflate");

    let header = format!(
        r#"{{"version":1,"submodel_id":0,"blocks":{{"high_lod":{{"offset":0,"size":{}}}}}}}"#,
        block.len()
    );
    let mut packed = Vec::new();
    packed.extend_from_slice(b"MPAK");
    packed.extend_from_slice(&(header.len() as u32).to_le_bytes());
    packed.extend_from_slice(header.as_bytes());
    packed.extend_from_slice(&block);
    packed
}

#[test]
fn hostile_count_fields_fail_to_decode_without_allocating() {
    // One face, plain flags, zeroed extents, then a vertex count claiming
    // u32::MAX vertices with no bytes behind it.
    let mut raw = Vec::new();
    raw.extend_from_slice(&1u32.to_le_bytes());
    raw.push(0);
    for _ in 0..10 {
        raw.extend_from_slice(&0.0f32.to_le_bytes());
    }
    raw.extend_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        decode(&asset_with_block(&raw)),
        Err(Error::AssetDecode { .. })
    ));

    // Same with a sane vertex count but a hostile index count.
    let mut raw = Vec::new();
    raw.extend_from_slice(&1u32.to_le_bytes());
    raw.push(0);
    for _ in 0..10 {
        raw.extend_from_slice(&0.0f32.to_le_bytes());
    }
    raw.extend_from_slice(&0u32.to_le_bytes());
    raw.extend_from_slice(&u32::MAX.to_le_bytes());
    assert!(matches!(
        decode(&asset_with_block(&raw)),
        Err(Error::AssetDecode { .. })
    ));
}

#[test]
fn truncated_or_foreign_data_fails_to_decode() {
    assert!(matches!(
        decode(b"png\x89not a mesh"),
        Err(Error::AssetDecode { .. })
    ));

    let model = quad_model();
    let packed = encode(&LodSet {
        high: Some(&model),
        ..LodSet::default()
    })
    .expect("encode");
    assert!(decode(&packed[..packed.len() / 2]).is_err());
}
