use std::path::{Path, PathBuf};

use crate::tool::ToolError;

/// Resolve a model-supplied path against the working directory. Absolute
/// paths pass through untouched.
pub fn resolve(cwd: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        cwd.join(p)
    }
}

pub fn read_file(path: &Path) -> Result<String, ToolError> {
    std::fs::read_to_string(path)
        .map_err(|e| ToolError::failed(format!("cannot read {}: {e}", path.display())))
}

/// Write a file, creating missing parent directories.
pub fn write_file(path: &Path, content: &str) -> Result<(), ToolError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(std::fs::write(path, content)?)
}

pub fn file_exists(path: &Path) -> bool {
    path.exists()
}

/// One entry of a directory listing, as reported to the model.
#[derive(Debug)]
pub struct DirEntry {
    pub name: String,
    /// "file", "dir" or "other".
    pub kind: &'static str,
    pub size: u64,
}

pub fn list_dir(path: &Path) -> Result<Vec<DirEntry>, ToolError> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let kind = if meta.is_dir() {
            "dir"
        } else if meta.is_file() {
            "file"
        } else {
            "other"
        };
        entries.push(DirEntry {
            name: entry.file_name().to_string_lossy().to_string(),
            kind,
            size: if meta.is_file() { meta.len() } else { 0 },
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
