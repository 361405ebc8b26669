//! Layer application. Each image layer is a possibly-compressed tar
//! stream; only the entries inside the catalog-content subtree are applied,
//! re-rooted onto the target directory, with ownership rewritten to the
//! running process and permissions opened up enough that the service can
//! later traverse and delete what it created.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use tar::EntryType;

use crate::error::{Error, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Prefix marking a deleted path in an overlay layer.
const WHITEOUT_PREFIX: &str = ".wh.";
/// Marker clearing the whole directory it appears in.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Wrap `reader` in the right decompressor based on magic bytes.
pub fn auto_decompress<R: BufRead + 'static>(mut reader: R) -> Result<Box<dyn Read>> {
    let head = reader.fill_buf()?;
    if head.starts_with(&GZIP_MAGIC) {
        Ok(Box::new(flate2::bufread::GzDecoder::new(reader)))
    } else if head.starts_with(&ZSTD_MAGIC) {
        Ok(Box::new(zstd::stream::read::Decoder::with_buffer(reader)?))
    } else {
        Ok(Box::new(reader))
    }
}

/// Apply one layer file to `target`, keeping only entries inside `subtree`
/// (the base directory named by the image-config label). Entries are
/// re-rooted, so `subtree/foo.json` lands at `target/foo.json`.
///
/// Metadata faults are fatal: path traversal, hardlinks pointing outside
/// the subtree, and duplicate file paths abort the whole pull. Device and
/// fifo entries are skipped.
pub fn apply_layer(layer: &Path, target: &Path, subtree: &str) -> Result<()> {
    let file = File::open(layer)?;
    let reader = auto_decompress(BufReader::new(file))?;
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(false);
    archive.set_preserve_ownerships(false);

    let mut seen: HashSet<PathBuf> = HashSet::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_path = entry.path()?.into_owned();
        let clean = sanitize_entry_path(&raw_path)?;

        let Some(rel) = subtree_relative(&clean, subtree) else {
            continue;
        };

        if let Some(name) = rel.file_name().and_then(|n| n.to_str()) {
            if name == OPAQUE_WHITEOUT {
                let dir = target.join(rel.parent().unwrap_or(Path::new("")));
                clear_directory(&dir)?;
                continue;
            }
            if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
                let dir = rel.parent().unwrap_or(Path::new(""));
                let victim_path = target.join(dir).join(victim);
                if victim_path.exists() {
                    if victim_path.is_dir() {
                        std::fs::remove_dir_all(&victim_path)?;
                    } else {
                        std::fs::remove_file(&victim_path)?;
                    }
                }
                continue;
            }
        }

        let entry_type = entry.header().entry_type();
        let dest = if rel.as_os_str().is_empty() {
            target.to_path_buf()
        } else {
            target.join(&rel)
        };

        match entry_type {
            EntryType::Directory => {
                std::fs::create_dir_all(&dest)?;
                set_mode(&dest, entry.header().mode().unwrap_or(0o755))?;
                continue;
            }
            EntryType::Char | EntryType::Block | EntryType::Fifo => {
                tracing::debug!(path = %raw_path.display(), "skipping special tar entry");
                continue;
            }
            EntryType::Link => {
                if !seen.insert(rel) {
                    return Err(duplicate_path(&raw_path));
                }
                apply_hardlink(&entry, target, subtree, &dest)?;
                continue;
            }
            _ => {}
        }

        if !seen.insert(rel) {
            return Err(duplicate_path(&raw_path));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry.unpack(&dest)?;

        if entry_type != EntryType::Symlink {
            set_mode(&dest, entry.header().mode().unwrap_or(0o644))?;
        }
    }

    Ok(())
}

fn duplicate_path(path: &Path) -> Error {
    Error::Unrecoverable(format!(
        "layer contains duplicate entry for path {:?}",
        path.display()
    ))
}

/// Normalize a tar entry path, rejecting absolute paths and `..` escapes.
fn sanitize_entry_path(raw: &Path) -> Result<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::Unrecoverable(format!(
                    "layer entry path {:?} escapes the unpack root",
                    raw.display()
                )));
            }
        }
    }
    Ok(clean)
}

/// If `path` is the subtree base or below it, return it relative to the
/// subtree; otherwise the entry is filtered out.
fn subtree_relative(path: &Path, subtree: &str) -> Option<PathBuf> {
    let mut components = path.components();
    match components.next() {
        Some(Component::Normal(first)) if first == subtree => {
            Some(components.as_path().to_path_buf())
        }
        _ => None,
    }
}

fn apply_hardlink<R: Read>(
    entry: &tar::Entry<'_, R>,
    target: &Path,
    subtree: &str,
    dest: &Path,
) -> Result<()> {
    let link_name = entry
        .link_name()?
        .ok_or_else(|| Error::Unrecoverable("hardlink entry without a target".to_string()))?;
    let clean = sanitize_entry_path(&link_name)?;
    let rel = subtree_relative(&clean, subtree).ok_or_else(|| {
        Error::Unrecoverable(format!(
            "hardlink target {:?} is outside the unpack root",
            link_name.display()
        ))
    })?;
    let source = target.join(rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::hard_link(&source, dest)?;
    Ok(())
}

/// Entries land owned by the running process (ownership is not preserved);
/// OR-ing 0770 onto the recorded mode keeps every created path traversable
/// and deletable by the service.
#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode((mode | 0o770) & 0o7777))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

fn clear_directory(dir: &Path) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    for child in std::fs::read_dir(dir)? {
        let child = child?;
        let path = child.path();
        if child.file_type()?.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}
