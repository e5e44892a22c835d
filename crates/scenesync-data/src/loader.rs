//! Resolution pipeline: reads data files, validates the manifest, builds the registry.
//!
//! Provides format detection (RON/JSON/TOML), file discovery, and deserialization
//! helpers, plus [`load_scene_data`] which loads a whole data directory.

use crate::schema::ComponentData;
use scenesync_core::config::BridgeConfig;
use scenesync_core::id::ComponentKey;
use scenesync_core::registry::{ComponentRegistry, RegistryBuilder, RegistryError};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base name of the component manifest.
pub const MANIFEST_FILE: &str = "components";
/// Base name of the optional bridge configuration.
pub const CONFIG_FILE: &str = "bridge";

// ===========================================================================
// Errors
// ===========================================================================

/// Errors that can occur during data loading.
#[derive(Debug, thiserror::Error)]
pub enum DataLoadError {
    /// A required data file was not found in the given directory.
    #[error("required file '{file}' not found in {dir}")]
    MissingRequired { file: String, dir: PathBuf },

    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two files with the same base name but different formats exist.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    /// A deserialization error occurred.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// Two manifest entries share a name.
    #[error("duplicate component name '{name}' in {file}")]
    DuplicateName { file: PathBuf, name: String },

    /// Two manifest entries share a key.
    #[error("duplicate component key {key} in {file}")]
    DuplicateKey { file: PathBuf, key: u32 },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ===========================================================================
// Format detection
// ===========================================================================

/// Supported data file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, DataLoadError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(DataLoadError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// File discovery
// ===========================================================================

/// Scan a directory for a data file with the given base name (without extension).
///
/// Looks for `{base_name}.ron`, `{base_name}.toml`, and `{base_name}.json`.
/// Returns `Ok(None)` if no file is found, or `Err(ConflictingFormats)` if
/// multiple formats exist for the same base name.
pub fn find_data_file(dir: &Path, base_name: &str) -> Result<Option<PathBuf>, DataLoadError> {
    let extensions = ["ron", "toml", "json"];
    let mut found: Option<PathBuf> = None;

    for ext in &extensions {
        let candidate = dir.join(format!("{base_name}.{ext}"));
        if candidate.exists() {
            if let Some(ref existing) = found {
                return Err(DataLoadError::ConflictingFormats {
                    a: existing.clone(),
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }

    Ok(found)
}

/// Like [`find_data_file`], but returns an error if no file is found.
pub fn require_data_file(dir: &Path, base_name: &str) -> Result<PathBuf, DataLoadError> {
    find_data_file(dir, base_name)?.ok_or_else(|| DataLoadError::MissingRequired {
        file: base_name.to_string(),
        dir: dir.to_path_buf(),
    })
}

// ===========================================================================
// Deserialization
// ===========================================================================

fn parse_error(path: &Path, detail: impl ToString) -> DataLoadError {
    DataLoadError::Parse {
        file: path.to_path_buf(),
        detail: detail.to_string(),
    }
}

/// Read a file and deserialize it according to its format (detected from extension).
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => toml::from_str(&content).map_err(|e| parse_error(path, e)),
    }
}

/// Deserialize a list from a file. For TOML files, extracts the array at the
/// given `toml_key` from a top-level table. For RON and JSON, deserializes
/// directly as `Vec<T>`.
pub fn deserialize_list<T: DeserializeOwned>(
    path: &Path,
    toml_key: &str,
) -> Result<Vec<T>, DataLoadError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;

    match format {
        Format::Ron => ron::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Json => serde_json::from_str(&content).map_err(|e| parse_error(path, e)),
        Format::Toml => {
            let table: toml::Value = toml::from_str(&content).map_err(|e| parse_error(path, e))?;
            let array = table
                .get(toml_key)
                .ok_or_else(|| parse_error(path, format!("missing key '{toml_key}' in TOML file")))?
                .clone();
            array
                .try_into()
                .map_err(|e: toml::de::Error| parse_error(path, e))
        }
    }
}

// ===========================================================================
// Manifest resolution
// ===========================================================================

/// Validate manifest entries and build the registry. Duplicate names and
/// keys are reported against `file`.
pub fn build_registry(
    components: &[ComponentData],
    file: &Path,
) -> Result<ComponentRegistry, DataLoadError> {
    let mut names: HashMap<&str, u32> = HashMap::with_capacity(components.len());
    let mut keys: HashMap<u32, &str> = HashMap::with_capacity(components.len());
    let mut builder = RegistryBuilder::new();

    for component in components {
        if names.contains_key(component.name.as_str()) {
            return Err(DataLoadError::DuplicateName {
                file: file.to_path_buf(),
                name: component.name.clone(),
            });
        }
        if keys.contains_key(&component.key) {
            return Err(DataLoadError::DuplicateKey {
                file: file.to_path_buf(),
                key: component.key,
            });
        }
        names.insert(&component.name, component.key);
        keys.insert(component.key, &component.name);
        builder.register(ComponentKey(component.key), &component.name, component.kind);
    }

    Ok(builder.build()?)
}

/// Load a component manifest file into a registry.
pub fn load_manifest(path: &Path) -> Result<ComponentRegistry, DataLoadError> {
    let components: Vec<ComponentData> = deserialize_list(path, "components")?;
    build_registry(&components, path)
}

/// Load a bridge configuration file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<BridgeConfig, DataLoadError> {
    deserialize_file(path)
}

// ===========================================================================
// Directory loading
// ===========================================================================

/// Everything a host needs to construct bridges.
#[derive(Debug)]
pub struct SceneData {
    pub config: BridgeConfig,
    pub registry: ComponentRegistry,
}

/// Load `components.{ron,toml,json}` (required) and `bridge.{ron,toml,json}`
/// (optional, defaults otherwise) from `dir`.
pub fn load_scene_data(dir: &Path) -> Result<SceneData, DataLoadError> {
    let manifest = require_data_file(dir, MANIFEST_FILE)?;
    let registry = load_manifest(&manifest)?;

    let config = match find_data_file(dir, CONFIG_FILE)? {
        Some(path) => load_config(&path)?,
        None => BridgeConfig::default(),
    };

    debug!(
        dir = %dir.display(),
        components = registry.len(),
        "scene data loaded"
    );
    Ok(SceneData { config, registry })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_core::component::ComponentKind;
    use std::fs;

    /// Create a temporary directory with a unique name for test isolation.
    fn make_test_dir(suffix: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "scenesync_data_test_{suffix}_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Clean up a test directory.
    fn cleanup(dir: &Path) {
        let _ = fs::remove_dir_all(dir);
    }

    const RON_MANIFEST: &str = r#"[
        (key: 1, name: "transform", kind: transform),
        (key: 2, name: "visibility", kind: visibility),
        (key: 4, name: "chat", kind: blob),
    ]"#;

    // -----------------------------------------------------------------------
    // detect_format
    // -----------------------------------------------------------------------

    #[test]
    fn detect_format_by_extension() {
        assert_eq!(detect_format(Path::new("components.ron")).unwrap(), Format::Ron);
        assert_eq!(
            detect_format(Path::new("components.toml")).unwrap(),
            Format::Toml
        );
        assert_eq!(
            detect_format(Path::new("components.json")).unwrap(),
            Format::Json
        );
    }

    #[test]
    fn detect_format_unsupported() {
        for name in ["components.yaml", "components"] {
            let result = detect_format(Path::new(name));
            assert!(matches!(
                result,
                Err(DataLoadError::UnsupportedFormat { .. })
            ));
        }
    }

    // -----------------------------------------------------------------------
    // find_data_file / require_data_file
    // -----------------------------------------------------------------------

    #[test]
    fn find_data_file_found() {
        let dir = make_test_dir("find_found");
        fs::write(dir.join("components.json"), "[]").unwrap();

        let result = find_data_file(&dir, "components").unwrap();
        assert_eq!(result, Some(dir.join("components.json")));

        cleanup(&dir);
    }

    #[test]
    fn find_data_file_conflict() {
        let dir = make_test_dir("find_conflict");
        fs::write(dir.join("components.ron"), "[]").unwrap();
        fs::write(dir.join("components.json"), "[]").unwrap();

        let result = find_data_file(&dir, "components");
        assert!(matches!(
            result,
            Err(DataLoadError::ConflictingFormats { .. })
        ));

        cleanup(&dir);
    }

    #[test]
    fn require_data_file_missing() {
        let dir = make_test_dir("require_missing");

        let result = require_data_file(&dir, "components");
        assert!(matches!(
            result,
            Err(DataLoadError::MissingRequired { ref file, .. }) if file == "components"
        ));

        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Manifests
    // -----------------------------------------------------------------------

    #[test]
    fn manifest_ron() {
        let dir = make_test_dir("manifest_ron");
        let path = dir.join("components.ron");
        fs::write(&path, RON_MANIFEST).unwrap();

        let registry = load_manifest(&path).unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.key_of("chat"), Some(ComponentKey(4)));
        assert_eq!(registry.get(ComponentKey(2)).unwrap().kind, ComponentKind::Visibility);

        cleanup(&dir);
    }

    #[test]
    fn manifest_json() {
        let dir = make_test_dir("manifest_json");
        let path = dir.join("components.json");
        fs::write(
            &path,
            r#"[{"key": 3, "name": "text", "kind": "text"}, {"key": 9, "name": "blob", "kind": "blob"}]"#,
        )
        .unwrap();

        let registry = load_manifest(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(ComponentKey(3)).unwrap().name, "text");

        cleanup(&dir);
    }

    #[test]
    fn manifest_toml() {
        let dir = make_test_dir("manifest_toml");
        let path = dir.join("components.toml");
        fs::write(
            &path,
            r#"
[[components]]
key = 1
name = "transform"
kind = "transform"

[[components]]
key = 2
name = "visibility"
kind = "visibility"
"#,
        )
        .unwrap();

        let registry = load_manifest(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.key_of("visibility"), Some(ComponentKey(2)));

        // The wrapper struct reads the same file.
        let wrapper: crate::schema::TomlComponents = deserialize_file(&path).unwrap();
        assert_eq!(wrapper.components[0].name, "transform");

        cleanup(&dir);
    }

    #[test]
    fn manifest_toml_missing_key() {
        let dir = make_test_dir("manifest_toml_missing");
        let path = dir.join("components.toml");
        fs::write(&path, r#"foo = "bar""#).unwrap();

        let result = load_manifest(&path);
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));

        cleanup(&dir);
    }

    #[test]
    fn manifest_unknown_kind_is_parse_error() {
        let dir = make_test_dir("manifest_bad_kind");
        let path = dir.join("components.json");
        fs::write(&path, r#"[{"key": 1, "name": "mesh", "kind": "mesh"}]"#).unwrap();

        let result = load_manifest(&path);
        assert!(matches!(result, Err(DataLoadError::Parse { .. })));

        cleanup(&dir);
    }

    #[test]
    fn duplicate_names_and_keys_are_rejected() {
        let file = Path::new("components.ron");
        let by_name = [
            ComponentData {
                key: 1,
                name: "transform".into(),
                kind: ComponentKind::Transform,
            },
            ComponentData {
                key: 2,
                name: "transform".into(),
                kind: ComponentKind::Blob,
            },
        ];
        assert!(matches!(
            build_registry(&by_name, file),
            Err(DataLoadError::DuplicateName { ref name, .. }) if name == "transform"
        ));

        let by_key = [
            ComponentData {
                key: 7,
                name: "a".into(),
                kind: ComponentKind::Text,
            },
            ComponentData {
                key: 7,
                name: "b".into(),
                kind: ComponentKind::Text,
            },
        ];
        assert!(matches!(
            build_registry(&by_key, file),
            Err(DataLoadError::DuplicateKey { key: 7, .. })
        ));
    }

    // -----------------------------------------------------------------------
    // Config and directories
    // -----------------------------------------------------------------------

    #[test]
    fn partial_config_keeps_defaults() {
        let dir = make_test_dir("config_partial");
        let path = dir.join("bridge.toml");
        fs::write(
            &path,
            r#"
[pools]
payload_ceiling = 2048

[sync]
acquire_timeout_ms = 250
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.pools.payload_ceiling, Some(2048));
        assert_eq!(config.pools.retain_per_pool, 64);
        assert_eq!(config.sync.acquire_timeout_ms, 250);
        assert_eq!(config.protocol.max_append_components, 100);

        cleanup(&dir);
    }

    #[test]
    fn load_scene_data_with_and_without_config() {
        let dir = make_test_dir("scene_data");
        fs::write(dir.join("components.ron"), RON_MANIFEST).unwrap();

        let data = load_scene_data(&dir).unwrap();
        assert_eq!(data.registry.len(), 3);
        assert_eq!(data.config, BridgeConfig::default());

        fs::write(
            dir.join("bridge.ron"),
            "(protocol: (max_append_components: 8))",
        )
        .unwrap();
        let data = load_scene_data(&dir).unwrap();
        assert_eq!(data.config.protocol.max_append_components, 8);

        cleanup(&dir);
    }

    #[test]
    fn load_scene_data_requires_manifest() {
        let dir = make_test_dir("scene_data_missing");
        fs::write(dir.join("bridge.json"), "{}").unwrap();

        let result = load_scene_data(&dir);
        assert!(matches!(result, Err(DataLoadError::MissingRequired { .. })));

        cleanup(&dir);
    }

    // -----------------------------------------------------------------------
    // Error display messages
    // -----------------------------------------------------------------------

    #[test]
    fn error_display_messages() {
        let e = DataLoadError::MissingRequired {
            file: "components".to_string(),
            dir: PathBuf::from("/data"),
        };
        assert!(format!("{e}").contains("components"));
        assert!(format!("{e}").contains("/data"));

        let e = DataLoadError::Parse {
            file: PathBuf::from("bad.ron"),
            detail: "syntax error".to_string(),
        };
        assert!(format!("{e}").contains("bad.ron"));
        assert!(format!("{e}").contains("syntax error"));

        let e = DataLoadError::DuplicateKey {
            file: PathBuf::from("components.ron"),
            key: 12,
        };
        assert!(format!("{e}").contains("12"));
    }

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let data_err: DataLoadError = io_err.into();
        assert!(matches!(data_err, DataLoadError::Io(_)));
        assert!(format!("{data_err}").contains("file not found"));
    }
}
