use thiserror::Error;

use crate::MeshStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("model '{label}' failed validation: {message}")]
    InvalidModel { label: String, message: String },

    #[error("mesh geometry rejected: {status}")]
    Geometry { status: MeshStatus },

    #[error("material list of '{label}' is not a subset of its reference model")]
    MaterialMismatch { label: String },

    #[error("failed to read '{path}': {message}")]
    Io { path: String, message: String },

    #[cfg(feature = "dae")]
    #[error("failed to parse COLLADA document: {message}")]
    DaeParse { message: String },

    #[cfg(feature = "dae")]
    #[error("COLLADA document has no <{element}> element")]
    DaeMissingElement { element: String },

    #[cfg(feature = "dae")]
    #[error("unresolved COLLADA reference '{url}' for <{context}>")]
    DaeUnresolvedUrl { context: String, url: String },

    #[cfg(feature = "gltf")]
    #[error("failed to parse glTF: {message}")]
    GltfParse { message: String },

    #[cfg(feature = "asset")]
    #[error("failed to encode mesh asset: {message}")]
    AssetEncode { message: String },

    #[cfg(feature = "asset")]
    #[error("failed to decode mesh asset: {message}")]
    AssetDecode { message: String },
}

impl From<MeshStatus> for Error {
    fn from(status: MeshStatus) -> Self {
        Error::Geometry { status }
    }
}
