//! Catalog serialization: walk an unpacked catalog tree and emit every
//! meta as one compact JSON object per line.
//!
//! The output is the catalog's canonical form: the walk order is
//! deterministic (lexical by path), YAML converts to JSON, and object keys
//! are emitted sorted, so byte-identical input trees always produce
//! byte-identical output. Downstream content addressing and ETag stability
//! depend on this.
//!
//! Serialization streams meta by meta; the full catalog is never held in
//! memory.

use std::io::{BufReader, Write};
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Walk `root` and write the catalog's JSON-lines serialization to `out`.
/// Returns the number of metas written.
pub fn write_catalog<W: Write>(root: &Path, out: &mut W) -> Result<u64> {
    let mut count = 0u64;
    // depth 0 is the walk root itself, which may legitimately be
    // dot-prefixed; hidden entries below it are skipped.
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry.path()));

    for entry in walker {
        let entry = entry.map_err(|e| Error::Storage(format!("catalog walk failed: {}", e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        match extension(path) {
            Some("json") => count += write_json_metas(path, out)?,
            Some("yaml") | Some("yml") => count += write_yaml_metas(path, out)?,
            _ => continue,
        }
    }
    Ok(count)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// A JSON catalog file is a stream of concatenated objects, with arbitrary
/// whitespace between them.
fn write_json_metas<W: Write>(path: &Path, out: &mut W) -> Result<u64> {
    let file = std::fs::File::open(path)?;
    let mut count = 0u64;
    for value in serde_json::Deserializer::from_reader(BufReader::new(file)).into_iter::<Value>() {
        let value = value.map_err(|e| {
            Error::Storage(format!("invalid catalog file {}: {}", path.display(), e))
        })?;
        write_meta(path, &value, out)?;
        count += 1;
    }
    Ok(count)
}

/// A YAML catalog file is a multi-document stream; each document is one
/// meta. Empty documents (a bare `---`) are skipped.
fn write_yaml_metas<W: Write>(path: &Path, out: &mut W) -> Result<u64> {
    let content = std::fs::read_to_string(path)?;
    let mut count = 0u64;
    for document in serde_yaml::Deserializer::from_str(&content) {
        let value = Value::deserialize(document).map_err(|e| {
            Error::Storage(format!("invalid catalog file {}: {}", path.display(), e))
        })?;
        if value.is_null() {
            continue;
        }
        write_meta(path, &value, out)?;
        count += 1;
    }
    Ok(count)
}

/// Validate and emit one meta as a single compact line. Keys come out
/// sorted because the JSON object representation is ordered by key.
fn write_meta<W: Write>(path: &Path, value: &Value, out: &mut W) -> Result<()> {
    let object = value.as_object().ok_or_else(|| {
        Error::Storage(format!(
            "catalog file {} contains a non-object meta",
            path.display()
        ))
    })?;
    match object.get("schema").and_then(|s| s.as_str()) {
        Some(schema) if !schema.is_empty() => {}
        _ => {
            return Err(Error::Storage(format!(
                "catalog file {} contains a meta without a schema",
                path.display()
            )))
        }
    }
    serde_json::to_writer(&mut *out, value)
        .map_err(|e| Error::Storage(format!("failed to write meta: {}", e)))?;
    out.write_all(b"\n")?;
    Ok(())
}
