//! Submodel splitting. A source mesh may produce arbitrarily many faces, but a
//! model carries at most [`MAX_MODEL_FACES`]; the surplus spills into
//! successor models labelled `a`, `b`, ... after the parent.

use log::warn;

use crate::{LodLevel, MAX_MODEL_FACES, Model, VolumeFace};

/// Successors past this carry no distinct single-letter label tag.
const MAX_SUBMODEL_LIMIT: usize = 25;

/// Split a mesh's faces into as many models as the face cap requires.
///
/// Faces are sorted by material first so each material's faces land in the
/// same submodel where possible. `submodel_limit` bounds the number of
/// successor models and clamps to [`MAX_SUBMODEL_LIMIT`], the last tag the
/// `a`..`z` label scheme can express; faces beyond
/// `(submodel_limit + 1) * MAX_MODEL_FACES` are dropped with a warning rather
/// than failing the load.
pub fn split_into_models(
    label: &str,
    lod: LodLevel,
    faces: Vec<(VolumeFace, String)>,
    submodel_limit: usize,
) -> Vec<Model> {
    let submodel_limit = submodel_limit.min(MAX_SUBMODEL_LIMIT);
    let mut primary = Model::new(format!("{label}{}", lod.suffix()));
    for (face, material) in faces {
        primary.faces.push(face);
        primary.materials.push(material);
    }
    primary.sort_faces_by_material();

    let face_limit = (submodel_limit + 1) * MAX_MODEL_FACES;
    if primary.faces.len() > face_limit {
        warn!(
            "mesh '{label}' produced {} faces, keeping the first {face_limit}",
            primary.faces.len()
        );
        primary.faces.truncate(face_limit);
        primary.materials.truncate(face_limit);
    }

    let mut remainder = primary.trim_faces(MAX_MODEL_FACES);
    let mut models = vec![primary];
    let mut submodel_id = 0u32;
    while !remainder.is_empty() {
        submodel_id += 1;
        let tag = char::from(b'a' + submodel_id as u8);
        let mut next = Model::new(format!("{label}{tag}{}", lod.suffix()));
        next.submodel_id = submodel_id;
        for (face, material) in remainder.drain(..MAX_MODEL_FACES.min(remainder.len())) {
            next.faces.push(face);
            next.materials.push(material);
        }
        models.push(next);
    }
    models
}
