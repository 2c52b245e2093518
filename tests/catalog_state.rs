//! Catalog behavior: registration invariants, persistence, local install and
//! deletion of cached files.

mod common;

use std::collections::BTreeSet;

use modeld::catalog::{ModelCatalog, ModelLocation};
use modeld::config::ServerConfig;
use modeld::error::ServeError;
use modeld::recipe::{ModelClass, Recipe};

use common::descriptor;

fn config_in(tmp: &tempfile::TempDir) -> ServerConfig {
    ServerConfig {
        cache_root: tmp.path().to_path_buf(),
        ..ServerConfig::default()
    }
}

#[test]
fn builtins_are_listed_in_name_order() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();
    let names: Vec<String> = catalog.list().into_iter().map(|d| d.name).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.iter().any(|n| n == "whisper-base"));
}

#[test]
fn registration_survives_a_reload() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(&tmp);
    {
        let catalog = ModelCatalog::load(&config).unwrap();
        catalog
            .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
            .unwrap();
    }
    let catalog = ModelCatalog::load(&config).unwrap();
    let found = catalog.lookup("alpha").unwrap();
    assert_eq!(found.class, ModelClass::Llm);
    assert_eq!(found.recipe, Recipe::LlamaCpp);
}

#[test]
fn re_register_with_a_different_recipe_conflicts() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();
    catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    // Identical re-register is idempotent.
    catalog
        .register(descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp))
        .unwrap();

    let conflicting = descriptor("alpha", ModelClass::Llm, Recipe::Flm);
    assert!(matches!(
        catalog.register(conflicting),
        Err(ServeError::ConflictingDescriptor(_))
    ));
}

#[test]
fn label_class_coherence_is_enforced() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();

    // Embedding class without the embeddings label.
    let mut bad = descriptor("embedder", ModelClass::Embedding, Recipe::LlamaCpp);
    bad.labels = BTreeSet::new();
    assert!(catalog.register(bad).is_err());

    // LLM class carrying the embeddings label.
    let mut bad = descriptor("alpha", ModelClass::Llm, Recipe::LlamaCpp);
    bad.labels.insert("embeddings".to_string());
    assert!(catalog.register(bad).is_err());
}

#[tokio::test]
async fn vision_install_requires_mmproj_and_leaves_no_trace() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();
    let before = catalog.list().len();

    let weights = tmp.path().join("vision.gguf");
    std::fs::write(&weights, b"weights").unwrap();

    let labels: BTreeSet<String> = ["vision".to_string()].into();
    let result = catalog
        .install_local("vision-model", &weights, Recipe::LlamaCpp, labels, None)
        .await;

    assert!(matches!(result, Err(ServeError::InvalidRequest(_))));
    assert_eq!(catalog.list().len(), before);
    assert!(catalog.lookup("vision-model").is_err());
}

#[tokio::test]
async fn local_install_copies_into_the_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config_in(&tmp);
    let catalog = ModelCatalog::load(&config).unwrap();

    let source_dir = tempfile::tempdir().unwrap();
    let weights = source_dir.path().join("tiny.gguf");
    std::fs::write(&weights, b"0123456789").unwrap();

    let installed = catalog
        .install_local("tiny", &weights, Recipe::LlamaCpp, BTreeSet::new(), None)
        .await
        .unwrap();

    let cached = installed.location.local_path().unwrap();
    assert!(cached.starts_with(config.models_dir()));
    assert_eq!(std::fs::read(cached).unwrap(), b"0123456789");
    assert_eq!(installed.size_bytes, 10);
    assert_eq!(installed.class, ModelClass::Llm);

    // The original tree is untouched.
    assert!(weights.exists());
}

#[tokio::test]
async fn vision_install_carries_the_projector() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();

    let source_dir = tempfile::tempdir().unwrap();
    let weights = source_dir.path().join("vis.gguf");
    let mmproj = source_dir.path().join("mmproj-f16.gguf");
    std::fs::write(&weights, b"w").unwrap();
    std::fs::write(&mmproj, b"p").unwrap();

    let labels: BTreeSet<String> = ["vision".to_string()].into();
    let installed = catalog
        .install_local("vis", &weights, Recipe::LlamaCpp, labels, Some(mmproj))
        .await
        .unwrap();

    let cached_mmproj = installed.mmproj_path.unwrap();
    assert!(cached_mmproj.exists());
    assert!(installed.labels.contains("vision"));
}

#[tokio::test]
async fn delete_removes_entry_and_cached_files() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();

    let source_dir = tempfile::tempdir().unwrap();
    let weights = source_dir.path().join("tiny.gguf");
    std::fs::write(&weights, b"x").unwrap();
    let installed = catalog
        .install_local("tiny", &weights, Recipe::LlamaCpp, BTreeSet::new(), None)
        .await
        .unwrap();
    let cached = installed.location.local_path().unwrap().to_path_buf();

    catalog.delete("tiny").unwrap();
    assert!(catalog.lookup("tiny").is_err());
    assert!(!cached.exists());

    assert!(matches!(
        catalog.delete("tiny"),
        Err(ServeError::UnknownModel(_))
    ));
}

#[test]
fn delete_never_touches_files_outside_the_cache() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();

    let outside = tempfile::tempdir().unwrap();
    let weights = outside.path().join("external.gguf");
    std::fs::write(&weights, b"keep me").unwrap();

    let mut desc = descriptor("external", ModelClass::Llm, Recipe::LlamaCpp);
    desc.location = ModelLocation::Path(weights.clone());
    catalog.register(desc).unwrap();

    catalog.delete("external").unwrap();
    assert!(weights.exists());
}

#[test]
fn extra_dir_scan_registers_gguf_files() {
    let tmp = tempfile::tempdir().unwrap();
    let catalog = ModelCatalog::load(&config_in(&tmp)).unwrap();

    let extra = tempfile::tempdir().unwrap();
    std::fs::write(extra.path().join("found-model.gguf"), b"w").unwrap();
    std::fs::write(extra.path().join("notes.txt"), b"ignored").unwrap();

    catalog.scan_extra_dir(extra.path());
    let found = catalog.lookup("found-model").unwrap();
    assert_eq!(found.recipe, Recipe::LlamaCpp);
    assert_eq!(found.class, ModelClass::Llm);
    assert!(catalog.lookup("notes").is_err());
}
