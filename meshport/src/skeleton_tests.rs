use std::collections::HashMap;

use glam::{Mat4, Vec3};

use crate::{
    JointAliasMap, JointDescriptor, JointWeight, MAX_JOINTS_PER_MESH, SkeletonDescriptor, SkinInfo,
    UpAxis, base_transform, bind_shape_is_rotated, build_alternate_bind, critique_rig,
    map_joint_name, normalize_weights,
};

fn small_skeleton() -> SkeletonDescriptor {
    SkeletonDescriptor::new(vec![
        JointDescriptor {
            name: "mPelvis".into(),
            rest_translation: Vec3::new(0.0, 0.0, 1.067),
        },
        JointDescriptor {
            name: "mTorso".into(),
            rest_translation: Vec3::new(0.0, 0.0, 0.084),
        },
        JointDescriptor {
            name: "mHead".into(),
            rest_translation: Vec3::new(0.0, 0.0, 0.076),
        },
    ])
}

fn rigged_skin(joints: &[&str]) -> SkinInfo {
    SkinInfo {
        joint_names: joints.iter().map(|j| j.to_string()).collect(),
        inverse_bind_matrices: vec![Mat4::IDENTITY; joints.len()],
        ..SkinInfo::default()
    }
}

#[test]
fn alias_mapping_translates_known_names() {
    let mut aliases = JointAliasMap::new();
    aliases.insert("hip".into(), "mPelvis".into());
    assert_eq!(map_joint_name(&aliases, "hip"), "mPelvis");
    assert_eq!(map_joint_name(&aliases, "mPelvis"), "mPelvis");
    // Unknown names pass through for the critique to flag.
    assert_eq!(map_joint_name(&aliases, "tentacle3"), "tentacle3");
}

#[test]
fn critique_accepts_a_clean_rig() {
    let flags = critique_rig(
        &rigged_skin(&["mPelvis", "mTorso"]),
        &small_skeleton(),
        MAX_JOINTS_PER_MESH,
    );
    assert!(flags.is_ok());
}

#[test]
fn critique_flags_unknown_joints_without_aborting() {
    let flags = critique_rig(
        &rigged_skin(&["mPelvis", "tentacle3"]),
        &small_skeleton(),
        MAX_JOINTS_PER_MESH,
    );
    assert!(flags.unknown_joint);
    assert!(!flags.too_many_joints);
    assert!(!flags.is_ok());
}

#[test]
fn critique_flags_a_joint_budget_overrun() {
    let flags = critique_rig(&rigged_skin(&["mPelvis", "mTorso", "mHead"]), &small_skeleton(), 2);
    assert!(flags.too_many_joints);
}

#[test]
fn critique_flags_an_empty_skin() {
    let flags = critique_rig(&SkinInfo::default(), &small_skeleton(), MAX_JOINTS_PER_MESH);
    assert!(flags.no_joints);
    assert!(!flags.is_ok());
}

#[test]
fn weights_keep_the_strongest_four_and_sum_to_one() {
    let mut influences = vec![
        JointWeight { joint: 0, weight: 0.1 },
        JointWeight { joint: 1, weight: 0.5 },
        JointWeight { joint: 2, weight: 0.3 },
        JointWeight { joint: 3, weight: 0.2 },
        JointWeight { joint: 4, weight: 0.4 },
    ];
    normalize_weights(&mut influences);

    assert_eq!(influences.len(), 4);
    assert_eq!(influences[0].joint, 1);
    assert!(!influences.iter().any(|w| w.joint == 0), "weakest survived");
    let total: f32 = influences.iter().map(|w| w.weight).sum();
    assert!((total - 1.0).abs() < 1e-5, "total {total}");
}

#[test]
fn weights_drop_non_positive_entries() {
    let mut influences = vec![
        JointWeight { joint: 0, weight: 0.0 },
        JointWeight { joint: 1, weight: -0.25 },
        JointWeight { joint: 2, weight: 0.5 },
    ];
    normalize_weights(&mut influences);
    assert_eq!(influences.len(), 1);
    assert_eq!(influences[0].joint, 2);
    assert!((influences[0].weight - 1.0).abs() < 1e-6);
}

#[test]
fn alternate_bind_overrides_translation_only() {
    let mut skin = rigged_skin(&["mPelvis", "mTorso"]);
    skin.inverse_bind_matrices = vec![
        Mat4::from_rotation_z(0.5) * Mat4::from_translation(Vec3::new(9.0, 9.0, 9.0)),
        Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)),
    ];
    let mut translations = HashMap::new();
    translations.insert("mPelvis".to_string(), Vec3::new(0.0, 0.0, 1.067));

    build_alternate_bind(&mut skin, &translations);

    assert_eq!(skin.alternate_bind_matrices.len(), 2);
    let alt = skin.alternate_bind_matrices[0];
    assert_eq!(alt.w_axis.truncate(), Vec3::new(0.0, 0.0, 1.067));
    // Rotation part untouched.
    assert_eq!(alt.x_axis, skin.inverse_bind_matrices[0].x_axis);
    // mTorso had no node translation; its bind translation survives.
    assert_eq!(
        skin.alternate_bind_matrices[1].w_axis,
        skin.inverse_bind_matrices[1].w_axis
    );
}

#[test]
fn rotated_bind_shape_is_detected() {
    let mut skin = rigged_skin(&["mPelvis"]);
    assert!(!bind_shape_is_rotated(&skin, 0.05));

    skin.bind_shape_matrix = Mat4::from_rotation_x(0.3);
    assert!(bind_shape_is_rotated(&skin, 0.05));

    // Pure translation is not a rotation.
    skin.bind_shape_matrix = Mat4::from_translation(Vec3::new(0.0, 0.0, 5.0));
    assert!(!bind_shape_is_rotated(&skin, 0.05));
}

#[test]
fn up_axis_rotations_land_on_z_up() {
    let y_up = base_transform(UpAxis::Y, 1.0);
    let v = y_up.transform_point3(Vec3::Y);
    assert!((v - Vec3::Z).length() < 1e-6, "Y-up gave {v:?}");

    let x_up = base_transform(UpAxis::X, 1.0);
    let v = x_up.transform_point3(Vec3::X);
    assert!((v - Vec3::Z).length() < 1e-6, "X-up gave {v:?}");

    assert_eq!(base_transform(UpAxis::Z, 1.0), Mat4::IDENTITY);
}

#[test]
fn unit_scale_folds_into_the_base_transform() {
    let cm = base_transform(UpAxis::Z, 0.01);
    let v = cm.transform_point3(Vec3::new(100.0, 0.0, 0.0));
    assert!((v - Vec3::X).length() < 1e-6, "{v:?}");
}

#[test]
fn skeleton_lookup_by_name() {
    let skeleton = small_skeleton();
    assert!(skeleton.contains("mHead"));
    assert!(!skeleton.contains("mTail"));
    assert_eq!(
        skeleton.rest_translation("mPelvis"),
        Some(Vec3::new(0.0, 0.0, 1.067))
    );
    assert_eq!(skeleton.len(), 3);
}
