//! ---
//! vtnc_section: "08-testing"
//! vtnc_subsection: "integration-tests"
//! vtnc_type: "source"
//! vtnc_scope: "code"
//! vtnc_description: "Checks the shipped example configuration against the engines."
//! vtnc_version: "v0.0.0-prealpha"
//! vtnc_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::time::Duration;

use vtnc_common::{AppConfig, ControllerKind, DisconnectedPolicy, LogFormat};
use vtnc_core::Capabilities;
use vtnc_store::KeyType;

fn example_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("configs/vtncd.example.toml")
}

#[test]
fn example_config_loads_and_validates() {
    let config = AppConfig::load(&[example_path()]).expect("example config loads");
    config.validate().expect("example config validates");

    assert_eq!(config.allocator.max_label, 4095);
    assert_eq!(config.commit.disconnected_policy, DisconnectedPolicy::MarkNotApplied);
    assert_eq!(config.audit.max_duration, Some(Duration::from_secs(300)));
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert_eq!(config.controllers.len(), 3);
    assert_eq!(
        config.controller("ctrlr-y").map(|c| c.kind),
        Some(ControllerKind::Pfc)
    );
    assert_eq!(config.digest().unwrap().len(), 64);
}

#[test]
fn example_capabilities_hide_unsupported_attributes() {
    let config = AppConfig::load(&[example_path()]).unwrap();
    let caps = Capabilities::from_config(&config.controllers).expect("key types resolve");
    assert!(!caps.supports("ctrlr-x", KeyType::Vbridge, "description"));
    assert!(caps.supports("ctrlr-y", KeyType::Vbridge, "description"));
    assert!(caps.supports("ctrlr-x", KeyType::Vtn, "description"));
}

#[test]
fn example_files_carry_frontmatter() {
    let contents = std::fs::read_to_string(example_path()).unwrap();
    assert!(contents.starts_with("# ---"));
    assert!(contents.contains("vtnc_section:"));
}
