//! Template storage and inheritance resolution.
//!
//! Templates are stored as raw JSON so that inheritance can merge at the
//! document level before the result is decoded into a typed [`Template`].
//! System templates are embedded in the binary and immutable; user
//! templates live in an optional directory and are written back on change.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::TemplateError;
use super::types::{Template, TemplateSummary};

/// Identity fields never inherited from an ancestor.
const IDENTITY_FIELDS: &[&str] = &["id", "name", "description"];

const BUILTIN_TEMPLATES: &[&str] = &[
    include_str!("../../templates/default.json"),
    include_str!("../../templates/default-verified.json"),
    include_str!("../../templates/subagents.json"),
];

struct Entry {
    raw: Value,
    system: bool,
    path: Option<PathBuf>,
}

/// In-memory template index.
#[derive(Default)]
pub struct TemplateRegistry {
    entries: HashMap<String, Entry>,
    /// Where user templates are written; `None` keeps them in memory only.
    dir: Option<PathBuf>,
}

impl TemplateRegistry {
    /// Empty registry without system templates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the embedded system templates.
    pub fn with_builtin() -> Result<Self, TemplateError> {
        let mut registry = Self::new();
        for source in BUILTIN_TEMPLATES {
            let raw: Value = serde_json::from_str(source).map_err(|e| TemplateError::Invalid {
                id: "<builtin>".to_string(),
                reason: e.to_string(),
            })?;
            registry.insert_system(raw)?;
        }
        Ok(registry)
    }

    /// Register a system template.
    pub fn insert_system(&mut self, raw: Value) -> Result<(), TemplateError> {
        let id = template_id(&raw)?;
        if self.entries.contains_key(&id) {
            return Err(TemplateError::AlreadyExists { id });
        }
        self.entries.insert(
            id,
            Entry {
                raw,
                system: true,
                path: None,
            },
        );
        Ok(())
    }

    /// Load every `*.json` / `*.toml` file in `dir` as a user template and
    /// remember `dir` as the write target. A missing directory is not an
    /// error. Returns the number of templates loaded.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, TemplateError> {
        self.dir = Some(dir.to_path_buf());
        if !dir.exists() {
            debug!(dir = %dir.display(), "Template directory does not exist yet");
            return Ok(0);
        }

        let read = std::fs::read_dir(dir).map_err(|source| TemplateError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = read
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json" | "toml")
                )
            })
            .collect();
        paths.sort();

        let mut loaded = 0;
        for path in paths {
            let raw = match read_template_file(&path) {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable template");
                    continue;
                }
            };
            let id = match template_id(&raw) {
                Ok(id) => id,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping template without id");
                    continue;
                }
            };
            if self.entries.get(&id).is_some_and(|e| e.system) {
                warn!(id, path = %path.display(), "User template shadows a system template, skipping");
                continue;
            }
            self.entries.insert(
                id,
                Entry {
                    raw,
                    system: false,
                    path: Some(path),
                },
            );
            loaded += 1;
        }

        info!(dir = %dir.display(), loaded, "Loaded user templates");
        Ok(loaded)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Raw (unresolved) document for `id`.
    pub fn raw(&self, id: &str) -> Option<&Value> {
        self.entries.get(id).map(|e| &e.raw)
    }

    /// Summaries of every template, sorted by id.
    pub fn list(&self) -> Vec<TemplateSummary> {
        let mut out: Vec<TemplateSummary> = self
            .entries
            .iter()
            .map(|(id, e)| TemplateSummary {
                id: id.clone(),
                name: str_field(&e.raw, "name").unwrap_or_default(),
                description: str_field(&e.raw, "description").unwrap_or_default(),
                extends: str_field(&e.raw, "extends"),
                is_system: e.system,
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Resolve `id` with its whole `extends` chain flattened.
    pub fn resolve(&self, id: &str) -> Result<Template, TemplateError> {
        let chain = self.chain(id)?;

        // chain is leaf-first; merge from the root down.
        let mut merged = Value::Object(serde_json::Map::new());
        for entry in chain.iter().rev() {
            deep_merge(&mut merged, &entry.raw);
        }

        let leaf = chain[0];
        if let Value::Object(map) = &mut merged {
            for field in IDENTITY_FIELDS {
                match leaf.raw.get(*field) {
                    Some(v) => {
                        map.insert((*field).to_string(), v.clone());
                    }
                    None => {
                        map.remove(*field);
                    }
                }
            }
            match leaf.raw.get("extends") {
                Some(v) => map.insert("extends".to_string(), v.clone()),
                None => map.remove("extends"),
            };
            map.insert("isSystem".to_string(), Value::Bool(leaf.system));
        }

        serde_json::from_value(merged).map_err(|e| TemplateError::Invalid {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    /// Walk the `extends` chain leaf-first, failing on cycles and gaps.
    fn chain(&self, id: &str) -> Result<Vec<&Entry>, TemplateError> {
        let mut chain = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut visited = HashSet::new();
        let mut current = Some(id.to_string());

        while let Some(cur) = current {
            if !visited.insert(cur.clone()) {
                names.push(cur);
                return Err(TemplateError::CircularInheritance {
                    chain: names.join(" -> "),
                });
            }
            let entry = self.entries.get(&cur).ok_or_else(|| match names.last() {
                None => TemplateError::NotFound { id: cur.clone() },
                Some(child) => TemplateError::MissingParent {
                    id: child.clone(),
                    parent: cur.clone(),
                },
            })?;
            current = str_field(&entry.raw, "extends");
            names.push(cur);
            chain.push(entry);
        }
        Ok(chain)
    }

    /// Create a user template.
    pub fn create(&mut self, mut raw: Value) -> Result<Template, TemplateError> {
        let id = template_id(&raw)?;
        if self.entries.contains_key(&id) {
            return Err(TemplateError::AlreadyExists { id });
        }
        if let Value::Object(map) = &mut raw {
            map.remove("isSystem");
        }
        self.commit(&id, raw, None)
    }

    /// Deep-merge `patch` into a user template. The id cannot change.
    pub fn update(&mut self, id: &str, patch: &Value) -> Result<Template, TemplateError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| TemplateError::NotFound { id: id.to_string() })?;
        if entry.system {
            return Err(TemplateError::SystemTemplate {
                id: id.to_string(),
                action: "update",
            });
        }
        if patch.get("id").and_then(Value::as_str).is_some_and(|p| p != id) {
            return Err(TemplateError::Invalid {
                id: id.to_string(),
                reason: "template id cannot be changed".to_string(),
            });
        }

        let mut raw = entry.raw.clone();
        let path = entry.path.clone();
        deep_merge(&mut raw, patch);
        if let Value::Object(map) = &mut raw {
            map.remove("isSystem");
        }
        self.commit(id, raw, path)
    }

    /// Delete a user template that nothing else extends.
    pub fn delete(&mut self, id: &str) -> Result<(), TemplateError> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| TemplateError::NotFound { id: id.to_string() })?;
        if entry.system {
            return Err(TemplateError::SystemTemplate {
                id: id.to_string(),
                action: "delete",
            });
        }

        let mut dependents: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| str_field(&e.raw, "extends").as_deref() == Some(id))
            .map(|(child, _)| child.clone())
            .collect();
        if !dependents.is_empty() {
            dependents.sort();
            return Err(TemplateError::InUse {
                id: id.to_string(),
                dependents,
            });
        }

        if let Some(path) = &entry.path
            && path.exists()
        {
            std::fs::remove_file(path).map_err(|source| TemplateError::Io {
                path: path.clone(),
                source,
            })?;
        }
        self.entries.remove(id);
        info!(id, "Deleted template");
        Ok(())
    }

    /// Insert `raw` under `id`, verify it resolves, persist it, and roll the
    /// index back if any step fails.
    fn commit(
        &mut self,
        id: &str,
        raw: Value,
        path: Option<PathBuf>,
    ) -> Result<Template, TemplateError> {
        let path = path.or_else(|| self.dir.as_ref().map(|d| d.join(format!("{id}.json"))));
        let previous = self.entries.insert(
            id.to_string(),
            Entry {
                raw: raw.clone(),
                system: false,
                path: path.clone(),
            },
        );

        let result = self.resolve(id).and_then(|template| {
            if let Some(path) = &path {
                write_template_file(path, &raw)?;
            }
            Ok(template)
        });

        if result.is_err() {
            match previous {
                Some(prev) => {
                    self.entries.insert(id.to_string(), prev);
                }
                None => {
                    self.entries.remove(id);
                }
            }
        } else {
            info!(id, "Saved template");
        }
        result
    }
}

/// Recursively merge `overlay` into `base`.
///
/// Objects merge key by key with the overlay winning; every other value,
/// arrays included, is replaced wholesale.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

fn template_id(raw: &Value) -> Result<String, TemplateError> {
    match raw.get("id").and_then(Value::as_str) {
        Some(id) if !id.trim().is_empty() => Ok(id.to_string()),
        _ => Err(TemplateError::Invalid {
            id: "<unknown>".to_string(),
            reason: "template is missing a non-empty 'id'".to_string(),
        }),
    }
}

fn str_field(raw: &Value, field: &str) -> Option<String> {
    raw.get(field).and_then(Value::as_str).map(String::from)
}

fn read_template_file(path: &Path) -> Result<Value, TemplateError> {
    let content = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let invalid = |reason: String| TemplateError::Invalid {
        id: path.display().to_string(),
        reason,
    };
    if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        let value: toml::Value = toml::from_str(&content).map_err(|e| invalid(e.to_string()))?;
        serde_json::to_value(value).map_err(|e| invalid(e.to_string()))
    } else {
        serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))
    }
}

fn write_template_file(path: &Path, raw: &Value) -> Result<(), TemplateError> {
    let io_err = |source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let invalid = |reason: String| TemplateError::Invalid {
        id: path.display().to_string(),
        reason,
    };
    let body = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
        toml::to_string_pretty(&without_nulls(raw)).map_err(|e| invalid(e.to_string()))?
    } else {
        serde_json::to_string_pretty(raw).map_err(|e| invalid(e.to_string()))?
    };
    std::fs::write(path, body).map_err(io_err)
}

/// TOML has no null; absent keys read back the same way.
fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), without_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}
