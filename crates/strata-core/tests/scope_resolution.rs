use std::path::PathBuf;

use tempfile::TempDir;

use strata_core::StoreError;
use strata_core::options::StoreOptions;
use strata_core::scope::{CommandLineLayer, Scope, ScopeLocator};

#[test]
fn every_persisted_scope_resolves_with_a_project() {
    let locator = ScopeLocator::with_dirs(
        PathBuf::from("/home/dev/.claude"),
        PathBuf::from("/etc/claude-code/managed-settings.json"),
    );
    let root = PathBuf::from("/work/app");

    let paths: Vec<PathBuf> = Scope::PERSISTED
        .into_iter()
        .map(|scope| locator.resolve(scope, Some(&root)).unwrap())
        .collect();

    assert_eq!(
        paths,
        vec![
            PathBuf::from("/home/dev/.claude/settings.json"),
            PathBuf::from("/work/app/.claude/settings.json"),
            PathBuf::from("/work/app/.claude/settings.local.json"),
            PathBuf::from("/etc/claude-code/managed-settings.json"),
        ]
    );
}

#[test]
fn resolution_is_deterministic_and_touches_nothing() {
    let temp = TempDir::new().unwrap();
    let locator = ScopeLocator::with_dirs(
        temp.path().join(".claude"),
        temp.path().join("managed-settings.json"),
    );
    let root = temp.path().join("missing-project");

    let first = locator.resolve(Scope::ProjectLocal, Some(&root)).unwrap();
    let second = locator.resolve(Scope::ProjectLocal, Some(&root)).unwrap();

    assert_eq!(first, second);
    assert!(!root.exists());
    assert!(!temp.path().join(".claude").exists());
}

#[test]
fn project_scopes_need_a_root() {
    let locator = ScopeLocator::with_dirs(PathBuf::from("/h/.claude"), PathBuf::from("/m.json"));

    for scope in [Scope::ProjectShared, Scope::ProjectLocal] {
        assert!(matches!(
            locator.resolve(scope, None),
            Err(StoreError::ScopeRequiresProject { .. })
        ));
    }
    assert!(locator.resolve(Scope::User, None).is_ok());
    assert!(locator.resolve(Scope::Enterprise, None).is_ok());
}

#[test]
fn options_file_is_loaded_from_disk() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("strata.toml");
    std::fs::write(
        &path,
        "debounce_ms = 100\nwatch = false\nclaude_dir = \"/srv/claude\"\n",
    )
    .unwrap();

    let options = StoreOptions::load(&path).unwrap();

    assert_eq!(options.debounce_ms, 100);
    assert!(!options.watch);
    assert_eq!(options.claude_dir, Some(PathBuf::from("/srv/claude")));
    assert_eq!(options.write_attempts, 3);
}

#[test]
fn bad_options_file_names_the_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("strata.toml");
    std::fs::write(&path, "debounce_ms = [\n").unwrap();

    let err = StoreOptions::load(&path).unwrap_err().to_string();

    assert!(err.contains("strata.toml"), "{err}");
}

#[test]
fn command_line_layer_is_nested_by_key() {
    let layer = CommandLineLayer::from_args(["env.RUST_LOG=debug", "env.EDITOR=vi"]).unwrap();
    assert_eq!(
        serde_json::Value::Object(layer.root().clone()),
        serde_json::json!({"env": {"RUST_LOG": "debug", "EDITOR": "vi"}})
    );
}
