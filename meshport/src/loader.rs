//! Import session plumbing: load states, LOD naming, scene extents, and the
//! callbacks a frontend drives while it parses.

use std::collections::BTreeMap;
use std::fs;

use glam::{Mat4, Vec3};
use log::{debug, warn};

use crate::{
    Error, ImportMaterial, JointAliasMap, MAX_JOINTS_PER_MESH, MeshStatus, Model, RigFlags,
    SkeletonDescriptor,
};

/// Materials a single model instance may reference before the import is
/// rejected with [`LoadState::ErrorMaterials`].
pub const MAX_OUTPUT_MATERIALS: usize = 12;

/// Successor models a single mesh may spill into.
pub const DEFAULT_SUBMODEL_LIMIT: usize = 8;

/// Where an import session stands. Error states order after `Done` so the
/// worst state observed can be kept with `max`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadState {
    Starting,
    ReadingFile,
    CreatingFaces,
    GeneratingLod,
    Done,
    /// Loaded, but the bind shape carries a rotation; reposing will be wrong.
    WarningBindShapeOrientation,
    ErrorParsing,
    ErrorMaterials,
    ErrorModel(MeshStatus),
}

impl LoadState {
    pub fn is_error(&self) -> bool {
        *self >= LoadState::ErrorParsing
    }
}

/// Level-of-detail slot a file is imported into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LodLevel {
    Lowest,
    Low,
    Medium,
    High,
    Physics,
}

impl LodLevel {
    pub const ALL: [LodLevel; 5] = [
        LodLevel::Lowest,
        LodLevel::Low,
        LodLevel::Medium,
        LodLevel::High,
        LodLevel::Physics,
    ];

    /// Label suffix marking a model as belonging to this LOD.
    pub fn suffix(self) -> &'static str {
        match self {
            LodLevel::Lowest => "_LOD0",
            LodLevel::Low => "_LOD1",
            LodLevel::Medium => "_LOD2",
            LodLevel::High => "",
            LodLevel::Physics => "_PHYS",
        }
    }
}

/// Strip any LOD suffix off a model label.
pub fn lodless_label(label: &str) -> &str {
    for lod in LodLevel::ALL {
        let suffix = lod.suffix();
        if !suffix.is_empty() {
            if let Some(stripped) = label.strip_suffix(suffix) {
                return stripped;
            }
        }
    }
    label
}

/// One placement of a model in the scene.
#[derive(Clone, Debug)]
pub struct ModelInstance {
    /// Index into [`ImportSession::models`].
    pub model: usize,
    pub label: String,
    pub transform: Mat4,
    /// Material binding name -> resolved material.
    pub materials: BTreeMap<String, ImportMaterial>,
}

type StateCallback = Box<dyn FnMut(LoadState)>;
type TextureCallback = Box<dyn FnMut(&str) -> bool>;

/// A format frontend. Implementations parse one document into the session.
pub trait ModelLoader {
    fn parse(&mut self, session: &mut ImportSession, data: &[u8]) -> Result<(), Error>;
}

/// Collects everything one import produces: models, their placements, scene
/// extents, rig grade, and the state trail.
pub struct ImportSession {
    pub filename: String,
    pub lod: LodLevel,
    pub joint_aliases: JointAliasMap,
    pub skeleton: SkeletonDescriptor,
    pub max_joints_per_mesh: usize,
    /// Successor models a mesh may spill into; the `a`..`z` label scheme
    /// clamps this to 25.
    pub submodel_limit: usize,
    pub models: Vec<Model>,
    pub instances: Vec<ModelInstance>,
    /// Scene bounds `[min, max]` over all placed instances.
    pub extents: Option<[Vec3; 2]>,
    pub rig: RigFlags,
    state: LoadState,
    state_cb: Option<StateCallback>,
    texture_cb: Option<TextureCallback>,
    /// Texture fetches started through the callback and not yet accounted for.
    pub pending_textures: usize,
}

impl ImportSession {
    pub fn new(
        filename: impl Into<String>,
        lod: LodLevel,
        skeleton: SkeletonDescriptor,
        joint_aliases: JointAliasMap,
    ) -> Self {
        ImportSession {
            filename: filename.into(),
            lod,
            joint_aliases,
            skeleton,
            max_joints_per_mesh: MAX_JOINTS_PER_MESH,
            submodel_limit: DEFAULT_SUBMODEL_LIMIT,
            models: Vec::new(),
            instances: Vec::new(),
            extents: None,
            rig: RigFlags::default(),
            state: LoadState::Starting,
            state_cb: None,
            texture_cb: None,
            pending_textures: 0,
        }
    }

    /// Observe every state transition.
    pub fn on_state(mut self, cb: impl FnMut(LoadState) + 'static) -> Self {
        self.state_cb = Some(Box::new(cb));
        self
    }

    /// Called once per texture file a material references; return `true` when
    /// a fetch was started, and the session counts it as pending.
    pub fn on_texture(mut self, cb: impl FnMut(&str) -> bool + 'static) -> Self {
        self.texture_cb = Some(Box::new(cb));
        self
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn set_state(&mut self, state: LoadState) {
        debug!("load state {:?} -> {:?}", self.state, state);
        self.state = state;
        if let Some(cb) = &mut self.state_cb {
            cb(state);
        }
    }

    /// Record a state only if it is worse than the current one. Keeps the
    /// first error sticky while later meshes keep loading.
    pub fn escalate_state(&mut self, state: LoadState) {
        if state > self.state {
            self.set_state(state);
        }
    }

    /// Add a model, returning its index for instancing.
    pub fn add_model(&mut self, model: Model) -> usize {
        if model.status != MeshStatus::Ok {
            self.escalate_state(LoadState::ErrorModel(model.status));
        }
        self.models.push(model);
        self.models.len() - 1
    }

    /// Place a model in the scene. Rejects instances binding more than
    /// [`MAX_OUTPUT_MATERIALS`] materials and requests every referenced
    /// texture through the texture callback.
    pub fn add_instance(
        &mut self,
        model: usize,
        label: impl Into<String>,
        transform: Mat4,
        materials: BTreeMap<String, ImportMaterial>,
    ) {
        let label = label.into();
        if materials.len() > MAX_OUTPUT_MATERIALS {
            warn!(
                "instance '{label}' binds {} materials, over the {MAX_OUTPUT_MATERIALS} cap",
                materials.len()
            );
            self.escalate_state(LoadState::ErrorMaterials);
            return;
        }

        for material in materials.values() {
            if let Some(file) = &material.diffuse_map {
                if let Some(cb) = &mut self.texture_cb {
                    if cb(file) {
                        self.pending_textures += 1;
                    }
                }
            }
        }

        if let Some([min, max]) = self.models[model].extents() {
            self.stretch_extents(min, max, transform);
        }
        self.instances.push(ModelInstance {
            model,
            label,
            transform,
            materials,
        });
    }

    /// Grow the scene bounds by a transformed axis-aligned box.
    pub fn stretch_extents(&mut self, min: Vec3, max: Vec3, transform: Mat4) {
        for i in 0..8 {
            let corner = Vec3::new(
                if i & 1 == 0 { min.x } else { max.x },
                if i & 2 == 0 { min.y } else { max.y },
                if i & 4 == 0 { min.z } else { max.z },
            );
            let v = transform.transform_point3(corner);
            let ext = self.extents.get_or_insert([v, v]);
            ext[0] = ext[0].min(v);
            ext[1] = ext[1].max(v);
        }
    }

    /// Find a loaded model by its full label.
    pub fn model_by_label(&self, label: &str) -> Option<usize> {
        self.models.iter().position(|m| m.label == label)
    }
}

/// Drive one frontend over the session's file.
pub fn run_import<L: ModelLoader>(loader: &mut L, session: &mut ImportSession) -> Result<(), Error> {
    session.set_state(LoadState::Starting);
    session.set_state(LoadState::ReadingFile);
    let data = fs::read(&session.filename).map_err(|e| {
        session.set_state(LoadState::ErrorParsing);
        Error::Io {
            path: session.filename.clone(),
            message: e.to_string(),
        }
    })?;
    run_import_slice(loader, session, &data)
}

/// Drive one frontend over an in-memory document.
pub fn run_import_slice<L: ModelLoader>(
    loader: &mut L,
    session: &mut ImportSession,
    data: &[u8],
) -> Result<(), Error> {
    session.set_state(LoadState::CreatingFaces);
    if let Err(e) = loader.parse(session, data) {
        session.escalate_state(LoadState::ErrorParsing);
        return Err(e);
    }
    // Keep warnings and errors; only a clean run lands on Done.
    if session.state < LoadState::Done {
        session.set_state(LoadState::Done);
    }
    Ok(())
}
