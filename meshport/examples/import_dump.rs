//! Import a mesh document and dump what the pipeline produced.
//!
//! Usage:
//!   cargo run --example import_dump -- <file.dae|file.gltf|file.glb> [lod]
//!
//! `lod` is one of: lowest, low, medium, high (default), physics.

use meshport::dae::DaeLoader;
use meshport::gltf::GltfLoader;
use meshport::{ImportSession, JointAliasMap, LodLevel, SkeletonDescriptor, run_import};

fn main() {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let Some(path) = args.next() else {
        eprintln!("usage: import_dump <file.dae|file.gltf|file.glb> [lod]");
        std::process::exit(2);
    };
    let lod = match args.next().as_deref() {
        Some("lowest") => LodLevel::Lowest,
        Some("low") => LodLevel::Low,
        Some("medium") => LodLevel::Medium,
        Some("physics") => LodLevel::Physics,
        Some("high") | None => LodLevel::High,
        Some(other) => {
            eprintln!("unknown lod '{other}'");
            std::process::exit(2);
        }
    };

    let mut session = ImportSession::new(&path, lod, SkeletonDescriptor::default(), JointAliasMap::new())
        .on_state(|state| eprintln!("state: {state:?}"));

    let result = if path.ends_with(".dae") {
        run_import(&mut DaeLoader, &mut session)
    } else {
        run_import(&mut GltfLoader, &mut session)
    };
    if let Err(e) = result {
        eprintln!("import failed: {e}");
        std::process::exit(1);
    }

    println!("{}: {:?}", path, session.state());
    if let Some([min, max]) = session.extents {
        println!("scene extents: {min:?} .. {max:?}");
    }
    for model in &session.models {
        println!(
            "model '{}' (submodel {}): {} faces, status {}",
            model.label,
            model.submodel_id,
            model.faces.len(),
            model.status
        );
        for (face, material) in model.faces.iter().zip(&model.materials) {
            println!(
                "  face '{}': {} verts, {} tris",
                material,
                face.vertex_count(),
                face.triangle_count()
            );
        }
        if model.skin.is_rigged() {
            println!(
                "  rigged to {} joints ({} weighted verts)",
                model.skin.joint_names.len(),
                model.weights.len()
            );
        }
    }
    for instance in &session.instances {
        println!(
            "instance '{}' -> model {} ({} materials)",
            instance.label,
            instance.model,
            instance.materials.len()
        );
    }
    if !session.rig.is_ok() {
        println!("rig flags: {:?}", session.rig);
    }
}
