use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::{Deserialize, Deserializer, MapAccess, Visitor};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

use crate::errors::{AppError, AppResult};

/// One enrolled identity: a unique name and its reference embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityTemplate {
    pub name: String,
    pub embedding: Vec<f64>,
}

/// Enrolled identities, read-only after load. Iteration follows the order of the
/// persisted JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityStore {
    source: PathBuf,
    templates: Vec<IdentityTemplate>,
    dimension: usize,
}

impl IdentityStore {
    pub fn load(path: &Path) -> AppResult<Self> {
        let data = fs::read(path).map_err(|source| AppError::IdentityStoreRead {
            path: path.to_path_buf(),
            source,
        })?;
        let StoreEntries(entries) =
            serde_json::from_slice(&data).map_err(|err| AppError::InvalidIdentityStore {
                path: path.to_path_buf(),
                message: format!("expected a JSON object of name to embedding: {err}"),
            })?;

        let mut templates = Vec::with_capacity(entries.len());
        for (name, value) in entries {
            let embedding: Vec<f64> =
                serde_json::from_value(value).map_err(|err| AppError::InvalidIdentityStore {
                    path: path.to_path_buf(),
                    message: format!("embedding for '{name}' is not a number array: {err}"),
                })?;
            templates.push(IdentityTemplate { name, embedding });
        }

        Self::from_templates(path, templates)
    }

    /// Build a store from already-parsed templates, applying the same checks as [`load`].
    ///
    /// [`load`]: IdentityStore::load
    pub fn from_templates(source: &Path, templates: Vec<IdentityTemplate>) -> AppResult<Self> {
        let dimension = templates
            .first()
            .map(|template| template.embedding.len())
            .ok_or_else(|| AppError::EmptyIdentityStore {
                path: source.to_path_buf(),
            })?;
        if dimension == 0 {
            return Err(AppError::InvalidIdentityStore {
                path: source.to_path_buf(),
                message: "embedding vectors are empty".into(),
            });
        }

        let mut seen = std::collections::HashSet::new();
        for template in &templates {
            if template.embedding.len() != dimension {
                return Err(AppError::InvalidIdentityStore {
                    path: source.to_path_buf(),
                    message: format!(
                        "embedding length mismatch for '{}' (expected {}, found {})",
                        template.name,
                        dimension,
                        template.embedding.len()
                    ),
                });
            }
            if !seen.insert(template.name.as_str()) {
                return Err(AppError::InvalidIdentityStore {
                    path: source.to_path_buf(),
                    message: format!("duplicate identity '{}'", template.name),
                });
            }
        }

        Ok(Self {
            source: source.to_path_buf(),
            templates,
            dimension,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdentityTemplate> {
        self.templates.iter()
    }
}

/// Every member of the store object in file order, repeated keys included.
///
/// Deserializing into a map would fold a repeated name into one entry; the store rejects
/// those instead.
struct StoreEntries(Vec<(String, Value)>);

impl<'de> Deserialize<'de> for StoreEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = StoreEntries;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a JSON object of name to embedding")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<StoreEntries, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry::<String, Value>()? {
                    entries.push(entry);
                }
                Ok(StoreEntries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}

/// Persist `templates` as a JSON object, atomically replacing `path` with `0600` permissions.
pub fn write_identity_store(path: &Path, templates: &[IdentityTemplate]) -> AppResult<()> {
    let write_err = |source| AppError::IdentityStoreWrite {
        path: path.to_path_buf(),
        source,
    };

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).map_err(|source| AppError::IdentityStoreWrite {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut object = Map::with_capacity(templates.len());
    for template in templates {
        object.insert(
            template.name.clone(),
            Value::from(template.embedding.clone()),
        );
    }

    let mut tmp = NamedTempFile::new_in(parent).map_err(write_err)?;
    {
        let file = tmp.as_file_mut();
        let mut writer = BufWriter::new(&mut *file);
        serde_json::to_writer(&mut writer, &object)?;
        writer.write_all(b"\n").map_err(write_err)?;
        writer.flush().map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;

    let file = tmp.persist(path).map_err(|err| write_err(err.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata().map_err(write_err)?.permissions();
        perms.set_mode(0o600);
        file.set_permissions(perms).map_err(write_err)?;
    }
    #[cfg(not(unix))]
    drop(file);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_preserves_file_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(
            &path,
            r#"{"zoe": [0.1, 0.2], "alice": [0.3, 0.4], "mallory": [0.5, 0.6]}"#,
        )
        .unwrap();

        let store = IdentityStore::load(&path).unwrap();
        let names: Vec<_> = store.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["zoe", "alice", "mallory"]);
        assert_eq!(store.dimension(), 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("absent.json");
        let err = IdentityStore::load(&path).unwrap_err();
        match err {
            AppError::IdentityStoreRead { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn malformed_json_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(AppError::InvalidIdentityStore { .. })
        ));
    }

    #[test]
    fn non_numeric_embedding_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(&path, r#"{"alice": ["a", "b"]}"#).unwrap();
        let err = IdentityStore::load(&path).unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentityStore { message, .. } if message.contains("alice")));
    }

    #[test]
    fn dimension_mismatch_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(&path, r#"{"alice": [0.1, 0.2], "bob": [0.1]}"#).unwrap();
        let err = IdentityStore::load(&path).unwrap_err();
        assert!(matches!(err, AppError::InvalidIdentityStore { message, .. } if message.contains("bob")));
    }

    #[test]
    fn repeated_name_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(
            &path,
            r#"{"alice": [1.0, 1.0], "mallory": [9.0, 9.0], "alice": [0.0, 0.0]}"#,
        )
        .unwrap();
        let err = IdentityStore::load(&path).unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidIdentityStore { message, .. } if message.contains("duplicate identity 'alice'")
        ));
    }

    #[test]
    fn empty_store_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(&path, "{}").unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(AppError::EmptyIdentityStore { .. })
        ));
    }

    #[test]
    fn zero_length_embeddings_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("faces.json");
        fs::write(&path, r#"{"alice": []}"#).unwrap();
        assert!(matches!(
            IdentityStore::load(&path),
            Err(AppError::InvalidIdentityStore { .. })
        ));
    }

    #[test]
    fn written_store_loads_back_in_order() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested/faces.json");
        let templates = vec![
            IdentityTemplate {
                name: "bob".into(),
                embedding: vec![0.5, -0.25],
            },
            IdentityTemplate {
                name: "alice".into(),
                embedding: vec![0.0, 1.0],
            },
        ];

        write_identity_store(&path, &templates).unwrap();
        let store = IdentityStore::load(&path).unwrap();
        assert_eq!(store.iter().cloned().collect::<Vec<_>>(), templates);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
