use glam::{Vec2, Vec3};

use crate::{FACE_ROLLOVER_VERTICES, FaceBuilder, FaceStream, MeshStatus, VertexData, fan_triangles};

fn vert(x: f32, y: f32, z: f32) -> VertexData {
    VertexData {
        position: Vec3::new(x, y, z),
        normal: Vec3::Z,
        tex_coord: Vec2::ZERO,
    }
}

#[test]
fn shares_vertices_that_match_exactly() {
    let mut builder = FaceBuilder::new(true, true);
    // Two triangles sharing the edge (1,0,0)-(0,1,0).
    builder
        .push_triangle([vert(0.0, 0.0, 0.0), vert(1.0, 0.0, 0.0), vert(0.0, 1.0, 0.0)])
        .unwrap();
    builder
        .push_triangle([vert(1.0, 0.0, 0.0), vert(1.0, 1.0, 0.0), vert(0.0, 1.0, 0.0)])
        .unwrap();

    let face = builder.finish().expect("face");
    assert_eq!(face.vertex_count(), 4);
    assert_eq!(face.triangle_count(), 2);
}

#[test]
fn does_not_share_across_differing_normals() {
    let mut builder = FaceBuilder::new(true, false);
    let mut flipped = vert(0.0, 0.0, 0.0);
    flipped.normal = Vec3::X;
    builder
        .push_triangle([vert(0.0, 0.0, 0.0), vert(1.0, 0.0, 0.0), vert(0.0, 1.0, 0.0)])
        .unwrap();
    builder
        .push_triangle([flipped, vert(2.0, 0.0, 0.0), vert(0.0, 2.0, 0.0)])
        .unwrap();

    let face = builder.finish().expect("face");
    // The corner at the origin exists twice, once per normal.
    assert_eq!(face.vertex_count(), 6);
}

#[test]
fn near_equal_positions_stay_distinct() {
    let mut builder = FaceBuilder::new(false, false);
    let nudged = f32::from_bits(0.5f32.to_bits() + 1);
    builder
        .push_triangle([vert(0.5, 0.0, 0.0), vert(1.0, 0.0, 0.0), vert(0.0, 1.0, 0.0)])
        .unwrap();
    builder
        .push_triangle([vert(nudged, 0.0, 0.0), vert(2.0, 0.0, 0.0), vert(0.0, 2.0, 0.0)])
        .unwrap();

    let face = builder.finish().expect("face");
    assert_eq!(face.vertex_count(), 6);
}

#[test]
fn identical_corners_in_one_triangle_stay_distinct() {
    // A degenerate source triangle must not collapse to one repeated index.
    let mut builder = FaceBuilder::new(false, false);
    let v = vert(1.0, 2.0, 3.0);
    builder.push_triangle([v, v, v]).unwrap();

    let face = builder.finish().expect("face");
    assert_eq!(face.vertex_count(), 3);
    let tri = [face.indices[0], face.indices[1], face.indices[2]];
    assert_ne!(tri[0], tri[1]);
    assert_ne!(tri[1], tri[2]);
    assert_ne!(tri[0], tri[2]);
}

#[test]
fn nan_position_is_a_bad_element() {
    let mut builder = FaceBuilder::new(false, false);
    let result = builder.push_triangle([
        vert(f32::NAN, 0.0, 0.0),
        vert(1.0, 0.0, 0.0),
        vert(0.0, 1.0, 0.0),
    ]);
    assert_eq!(result, Err(MeshStatus::BadElement));
}

#[test]
fn builder_overflows_at_the_vertex_ceiling() {
    let mut builder = FaceBuilder::new(false, false);
    let mut i = 0u32;
    let mut unique = || {
        i += 1;
        vert(i as f32, 0.0, 0.0)
    };
    // 21845 triangles of unique vertices put the builder exactly at 65535.
    for _ in 0..21845 {
        builder
            .push_triangle([unique(), unique(), unique()])
            .unwrap();
    }
    assert_eq!(builder.vertex_count(), 65535);
    let result = builder.push_triangle([unique(), unique(), unique()]);
    assert_eq!(result, Err(MeshStatus::VertexNumberOverflow));
}

#[test]
fn stream_rolls_over_on_a_triangle_boundary() {
    let mut stream = FaceStream::new("skin", false, false);
    let mut i = 0u32;
    let mut unique = || {
        i += 1;
        vert(i as f32, 0.0, 0.0)
    };
    let triangles = FACE_ROLLOVER_VERTICES / 3 + 10;
    for _ in 0..triangles {
        stream.push_triangle([unique(), unique(), unique()]).unwrap();
    }

    let faces = stream.finish();
    assert_eq!(faces.len(), 2);
    assert_eq!(faces[0].1, "skin");
    assert_eq!(faces[1].1, "skin");
    assert_eq!(faces[0].0.vertex_count(), FACE_ROLLOVER_VERTICES);
    assert_eq!(faces[1].0.triangle_count(), 10);
    assert_eq!(
        faces[0].0.triangle_count() + faces[1].0.triangle_count(),
        triangles
    );
}

#[test]
fn fan_triangulation_of_a_quad() {
    let tris: Vec<_> = fan_triangles(4).collect();
    assert_eq!(tris, vec![[0, 1, 2], [0, 2, 3]]);
}

#[test]
fn fan_triangulation_of_degenerate_polygons() {
    assert_eq!(fan_triangles(2).count(), 0);
    assert_eq!(fan_triangles(0).count(), 0);
}

#[test]
fn empty_builder_finishes_to_none() {
    assert!(FaceBuilder::new(true, true).finish().is_none());
}
