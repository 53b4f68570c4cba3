//! Skeleton descriptors and rig critique. The importer never owns a skeleton;
//! the caller supplies the canonical joint set and alias table, and the rig is
//! graded against them. A bad rig downgrades upload eligibility, it does not
//! abort the load.

use std::collections::HashMap;

use glam::{Mat4, Quat, Vec3};
use log::{debug, warn};

use crate::{JointWeight, SkinInfo};

/// External joint name -> canonical skeleton joint name.
pub type JointAliasMap = HashMap<String, String>;

/// Joint budget per mesh; the avatar skeleton tops out near this.
pub const MAX_JOINTS_PER_MESH: usize = 110;

/// Influences kept per vertex after normalization.
pub const MAX_WEIGHTS_PER_VERTEX: usize = 4;

#[derive(Clone, Debug)]
pub struct JointDescriptor {
    pub name: String,
    pub rest_translation: Vec3,
}

/// The canonical skeleton the caller rigs against.
#[derive(Clone, Debug, Default)]
pub struct SkeletonDescriptor {
    joints: Vec<JointDescriptor>,
    by_name: HashMap<String, usize>,
}

impl SkeletonDescriptor {
    pub fn new(joints: Vec<JointDescriptor>) -> Self {
        let by_name = joints
            .iter()
            .enumerate()
            .map(|(i, j)| (j.name.clone(), i))
            .collect();
        SkeletonDescriptor { joints, by_name }
    }

    pub fn len(&self) -> usize {
        self.joints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joints.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn rest_translation(&self, name: &str) -> Option<Vec3> {
        self.by_name.get(name).map(|&i| self.joints[i].rest_translation)
    }

    pub fn joints(&self) -> &[JointDescriptor] {
        &self.joints
    }
}

/// What the rig critique found. Any flag set disables joint-position upload
/// for the mesh; the geometry still loads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RigFlags {
    /// A joint name survived alias mapping without matching the skeleton.
    pub unknown_joint: bool,
    /// The mesh binds more joints than [`MAX_JOINTS_PER_MESH`].
    pub too_many_joints: bool,
    /// A skin was declared but bound no joints.
    pub no_joints: bool,
}

impl RigFlags {
    pub fn is_ok(&self) -> bool {
        !(self.unknown_joint || self.too_many_joints || self.no_joints)
    }
}

/// Run a joint name through the alias table. Unknown names pass through
/// verbatim; the critique flags them later.
pub fn map_joint_name(aliases: &JointAliasMap, name: &str) -> String {
    match aliases.get(name) {
        Some(canonical) => canonical.clone(),
        None => name.to_owned(),
    }
}

/// Grade a skin against the canonical skeleton and the per-mesh joint budget.
pub fn critique_rig(
    skin: &SkinInfo,
    skeleton: &SkeletonDescriptor,
    max_joints: usize,
) -> RigFlags {
    let mut flags = RigFlags::default();
    if skin.joint_names.is_empty() {
        flags.no_joints = true;
        return flags;
    }
    if skin.joint_names.len() > max_joints {
        warn!(
            "rig binds {} joints, over the {} joint budget",
            skin.joint_names.len(),
            max_joints
        );
        flags.too_many_joints = true;
    }
    for name in &skin.joint_names {
        if !skeleton.contains(name) {
            debug!("rig joint '{name}' is not part of the skeleton");
            flags.unknown_joint = true;
        }
    }
    flags
}

/// Normalize one vertex's influences: strongest first, at most four kept,
/// weights rescaled to sum to one. Non-positive entries are dropped.
pub fn normalize_weights(influences: &mut Vec<JointWeight>) {
    influences.retain(|w| w.weight > 0.0);
    influences.sort_by(|a, b| b.weight.total_cmp(&a.weight));
    influences.truncate(MAX_WEIGHTS_PER_VERTEX);

    let total: f32 = influences.iter().map(|w| w.weight).sum();
    if total > 0.0 {
        for w in influences.iter_mut() {
            w.weight /= total;
        }
    }
}

/// Build the alternate bind matrices: the inverse-bind matrices with their
/// translation replaced by the asset's own joint-node translation, in joint
/// buffer order. Joints the asset never placed keep their inverse-bind
/// translation.
pub fn build_alternate_bind(skin: &mut SkinInfo, joint_translations: &HashMap<String, Vec3>) {
    skin.alternate_bind_matrices.clear();
    for (name, inv_bind) in skin.joint_names.iter().zip(&skin.inverse_bind_matrices) {
        match joint_translations.get(name) {
            Some(&translation) => {
                let mut alt = *inv_bind;
                alt.w_axis = translation.extend(1.0);
                skin.alternate_bind_matrices.push(alt);
            }
            None => {
                warn!("no node translation for joint '{name}', keeping bind translation");
                skin.alternate_bind_matrices.push(*inv_bind);
            }
        }
    }
}

/// Whether the bind-shape rotation departs from identity beyond `tolerance`
/// radians. A rotated bind shape renders fine but reposes wrong, so it is
/// reported as a warning state.
pub fn bind_shape_is_rotated(skin: &SkinInfo, tolerance: f32) -> bool {
    let (_, rotation, _) = skin.bind_shape_matrix.to_scale_rotation_translation();
    rotation.angle_between(Quat::IDENTITY) > tolerance
}

/// Document vertical axis. Internally everything is Z-up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpAxis {
    X,
    Y,
    #[default]
    Z,
}

impl UpAxis {
    /// Rotation folding this up-axis into Z-up.
    pub fn to_z_up(self) -> Mat4 {
        match self {
            UpAxis::X => Mat4::from_rotation_y(-std::f32::consts::FRAC_PI_2),
            UpAxis::Y => Mat4::from_rotation_x(std::f32::consts::FRAC_PI_2),
            UpAxis::Z => Mat4::IDENTITY,
        }
    }
}

/// Root transform for a document: up-axis folded in as rotation, unit scale
/// (meters per document unit) folded in as uniform scale.
pub fn base_transform(up: UpAxis, meters_per_unit: f32) -> Mat4 {
    up.to_z_up() * Mat4::from_scale(Vec3::splat(meters_per_unit))
}
