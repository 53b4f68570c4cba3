//! Mesh-import pipeline for 16-bit indexed triangle meshes.
//!
//! This crate is renderer-agnostic. It parses COLLADA and glTF documents into
//! [`Model`]s (welded vertices, per-face materials, skin weights), validates rigs
//! against a caller-supplied skeleton, and packs the result into a compact binary
//! asset. Rendering and upload live with the caller.

#![forbid(unsafe_code)]

mod error;
mod loader;
mod model;
mod skeleton;
mod split;
mod weld;

#[cfg(feature = "dae")]
pub mod dae;

#[cfg(feature = "gltf")]
pub mod gltf;

#[cfg(feature = "asset")]
pub mod asset;

pub use error::*;
pub use loader::*;
pub use model::*;
pub use skeleton::*;
pub use split::*;
pub use weld::*;


#[cfg(test)]
mod weld_tests;

#[cfg(test)]
mod skeleton_tests;





#[cfg(all(test, feature = "asset"))]
mod asset_tests;
