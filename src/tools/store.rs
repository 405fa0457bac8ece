use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::tool::ToolError;

/// Directory under the working directory holding the framework's JSON
/// stores.
pub const AGENT_DIR: &str = ".agent";
/// Escalation tickets opened by the stop tool.
pub const STOPS_FILE: &str = "stops.json";

/// Small JSON document store rooted at `<cwd>/.agent`. Reads are lenient
/// (a missing or malformed file yields the default), writes are pretty
/// printed and create the directory on demand.
pub struct JsonStore {
    root: PathBuf,
}

impl JsonStore {
    pub fn new(cwd: &Path) -> Self {
        Self {
            root: cwd.join(AGENT_DIR),
        }
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    pub fn read(&self, file: &str, default: Value) -> Value {
        let Ok(text) = std::fs::read_to_string(self.path(file)) else {
            return default;
        };
        match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(file, %err, "store file is not valid JSON; using default");
                default
            }
        }
    }

    pub fn write(&self, file: &str, value: &Value) -> Result<(), ToolError> {
        std::fs::create_dir_all(&self.root)?;
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| ToolError::failed(format!("cannot serialize {file}: {e}")))?;
        Ok(std::fs::write(self.path(file), text)?)
    }

    /// Read, deep-merge the delta in, write back. Returns the merged
    /// document.
    pub fn merge(&self, file: &str, delta: Value, default: Value) -> Result<Value, ToolError> {
        let merged = deep_merge(self.read(file, default), delta);
        self.write(file, &merged)?;
        Ok(merged)
    }
}

/// Recursive merge: objects merge key-wise, anything else is replaced by
/// the right-hand side.
pub fn deep_merge(base: Value, delta: Value) -> Value {
    match (base, delta) {
        (Value::Object(mut base), Value::Object(delta)) => {
            for (key, value) in delta {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (_, delta) => delta,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch_store(tag: &str) -> (PathBuf, JsonStore) {
        let dir = std::env::temp_dir().join(format!("agent-graph-store-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let store = JsonStore::new(&dir);
        (dir, store)
    }

    #[test]
    fn missing_file_reads_as_default() {
        let (dir, store) = scratch_store("default");
        assert_eq!(store.read("nope.json", json!({"tickets": []})), json!({"tickets": []}));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn write_then_read_round_trips() {
        let (dir, store) = scratch_store("roundtrip");
        store.write("doc.json", &json!({"a": 1})).unwrap();
        assert_eq!(store.read("doc.json", json!(null)), json!({"a": 1}));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn malformed_file_reads_as_default() {
        let (dir, store) = scratch_store("malformed");
        std::fs::create_dir_all(store.path("")).unwrap();
        std::fs::write(store.path("bad.json"), "{not json").unwrap();
        assert_eq!(store.read("bad.json", json!(42)), json!(42));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn merge_persists_the_combined_document() {
        let (dir, store) = scratch_store("merge");
        store.write("doc.json", &json!({"keep": 1, "nested": {"a": 1}})).unwrap();
        let merged = store
            .merge("doc.json", json!({"nested": {"b": 2}}), json!({}))
            .unwrap();
        assert_eq!(merged, json!({"keep": 1, "nested": {"a": 1, "b": 2}}));
        assert_eq!(store.read("doc.json", json!(null)), merged);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn deep_merge_replaces_non_objects() {
        assert_eq!(deep_merge(json!([1, 2]), json!([3])), json!([3]));
        assert_eq!(deep_merge(json!({"a": {"x": 1}}), json!({"a": 2})), json!({"a": 2}));
        assert_eq!(deep_merge(json!(1), json!({"a": 1})), json!({"a": 1}));
    }
}
