//! Tar serialization of bucket directory trees.
//!
//! `send_dir` walks a directory and writes it as an uncompressed tar stream
//! with paths relative to the walked root. `send_file` emits only the
//! directories leading to one file plus the file itself, so a peer can fetch
//! a single file out of a bucket. `receive` materializes such a stream back
//! into a directory.
//!
//! Permission bits survive the round trip (masked to `0o777` on receive);
//! symlinks, ownership, xattrs and timestamps do not.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path};
use tar::{Archive, Builder, EntryType, Header};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
#[error("{context}: {source}")]
pub struct TarStreamError {
    context: String,
    #[source]
    source: io::Error,
}

impl TarStreamError {
    fn new(context: impl Into<String>, source: io::Error) -> Self {
        Self {
            context: context.into(),
            source,
        }
    }
}

/// Recursively serializes `dir` into `writer` as a tar stream.
pub fn send_dir<W: Write>(dir: &Path, writer: W) -> Result<(), TarStreamError> {
    let mut builder = Builder::new(writer);

    for entry in WalkDir::new(dir) {
        let entry =
            entry.map_err(|e| TarStreamError::new("failed to walk directory", e.into()))?;
        if entry.path() == dir {
            continue;
        }
        append_entry(&mut builder, dir, entry.path())?;
    }

    builder
        .finish()
        .map_err(|e| TarStreamError::new("failed to close tar stream", e))
}

/// Serializes only `file` (a path relative to `dir`) into `writer`, together
/// with the directory entries on the way down to it.
pub fn send_file<W: Write>(file: &str, dir: &Path, writer: W) -> Result<(), TarStreamError> {
    let mut builder = Builder::new(writer);
    let target = Path::new(file);

    for entry in WalkDir::new(dir) {
        let entry =
            entry.map_err(|e| TarStreamError::new("failed to walk directory", e.into()))?;
        if entry.path() == dir {
            continue;
        }
        let rel = relativize(dir, entry.path())?;
        if file.is_empty() || !target.starts_with(rel) {
            continue;
        }
        append_entry(&mut builder, dir, entry.path())?;
    }

    builder
        .finish()
        .map_err(|e| TarStreamError::new("failed to close tar stream", e))
}

/// Reads a tar stream from `reader` and materializes it inside `dir`.
pub fn receive<R: Read>(dir: &Path, reader: R) -> Result<(), TarStreamError> {
    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| TarStreamError::new("failed to read tar stream", e))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| TarStreamError::new("failed to read tar stream", e))?;
        let name = entry
            .path()
            .map_err(|e| TarStreamError::new("failed to read entry path", e))?
            .into_owned();
        check_entry_path(&name)?;
        let abs = dir.join(&name);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&abs).map_err(|e| {
                    TarStreamError::new(
                        format!("failed to create directory {}", name.display()),
                        e,
                    )
                })?;
            }
            EntryType::Regular => {
                if let Some(parent) = abs.parent() {
                    fs::create_dir_all(parent).map_err(|e| {
                        TarStreamError::new(
                            format!("failed to create subdirectories of {}", name.display()),
                            e,
                        )
                    })?;
                }
                let mode = entry
                    .header()
                    .mode()
                    .map_err(|e| TarStreamError::new("failed to read entry mode", e))?
                    & 0o777;
                let mut f = File::create(&abs).map_err(|e| {
                    TarStreamError::new(format!("failed to create file {}", name.display()), e)
                })?;
                io::copy(&mut entry, &mut f).map_err(|e| {
                    TarStreamError::new(format!("failed to write file {}", name.display()), e)
                })?;
                // Set explicitly so the received bits are not clipped by umask.
                fs::set_permissions(&abs, fs::Permissions::from_mode(mode)).map_err(|e| {
                    TarStreamError::new(format!("failed to chmod file {}", name.display()), e)
                })?;
            }
            // Links, ownership and specials are not preserved.
            _ => {}
        }
    }

    Ok(())
}

fn append_entry<W: Write>(
    builder: &mut Builder<W>,
    root: &Path,
    path: &Path,
) -> Result<(), TarStreamError> {
    let rel = relativize(root, path)?;
    let meta = fs::metadata(path).map_err(|e| {
        TarStreamError::new(format!("failed to stat {}", path.display()), e)
    })?;

    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(meta.permissions().mode() & 0o777);

    if meta.is_dir() {
        header.set_entry_type(EntryType::Directory);
        header.set_size(0);
        builder
            .append_data(&mut header, rel, io::empty())
            .map_err(|e| {
                TarStreamError::new(format!("failed to write dir header {}", rel.display()), e)
            })
    } else if meta.is_file() {
        header.set_entry_type(EntryType::Regular);
        header.set_size(meta.len());
        let f = File::open(path).map_err(|e| {
            TarStreamError::new(format!("failed to open file {}", path.display()), e)
        })?;
        builder.append_data(&mut header, rel, f).map_err(|e| {
            TarStreamError::new(format!("failed to write file {}", rel.display()), e)
        })
    } else {
        // Symlinks and specials are skipped, matching the receive side.
        Ok(())
    }
}

fn relativize<'a>(root: &Path, path: &'a Path) -> Result<&'a Path, TarStreamError> {
    path.strip_prefix(root).map_err(|_| {
        TarStreamError::new(
            format!("failed to relativize {}", path.display()),
            io::Error::new(io::ErrorKind::InvalidInput, "path outside walked root"),
        )
    })
}

fn check_entry_path(name: &Path) -> Result<(), TarStreamError> {
    let clean = !name.as_os_str().is_empty()
        && name
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if !clean {
        return Err(TarStreamError::new(
            format!("invalid entry path {}", name.display()),
            io::Error::new(
                io::ErrorKind::InvalidData,
                "entry escapes the target directory",
            ),
        ));
    }
    Ok(())
}
