//! Walking differ.
//!
//! Compares two directory trees and writes the changes from `lower` to
//! `upper` as a layer tar stream. Paths only in `upper` are added, paths
//! only in `lower` become whiteouts, and paths in both are emitted when
//! their type, mode, ownership, link target, or content differ. Entries
//! are visited in name order so equal trees always produce equal layers.

use std::collections::{BTreeSet, HashSet};
use std::fs::Metadata;
use std::io::{Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use recast_common::error::{RecastError, Result};

use crate::content::ContentStore;
use crate::layer::{LayerDiff, LayerSink, WHITEOUT_PREFIX};
use crate::lease::Lease;
use crate::media::SchemaFamily;
use crate::mount::{Mount, with_temp_mount};

/// Mode bits compared between trees (permissions plus setuid/setgid/sticky).
const MODE_MASK: u32 = 0o7777;

/// Computes the layer between two mount sets and stores it as a blob.
///
/// # Errors
///
/// Returns an error if either mount set cannot be activated, a tree cannot
/// be walked, or the blob cannot be committed.
pub fn diff_mounts(
    content: &ContentStore,
    lease: &Lease,
    lower: &[Mount],
    upper: &[Mount],
    family: SchemaFamily,
) -> Result<LayerDiff> {
    with_temp_mount(lower, |lower_root| {
        with_temp_mount(upper, |upper_root| {
            diff_to_blob(content, lease, lower_root, upper_root, family)
        })
    })
}

/// Computes the layer between two directories and stores it as a blob.
///
/// # Errors
///
/// Returns an error if a tree cannot be walked or the blob cannot be
/// committed.
pub fn diff_to_blob(
    content: &ContentStore,
    lease: &Lease,
    lower: &Path,
    upper: &Path,
    family: SchemaFamily,
) -> Result<LayerDiff> {
    let mut builder = tar::Builder::new(LayerSink::new(content)?);
    builder.follow_symlinks(false);
    let changes = diff_directories(lower, upper, &mut builder)?;
    let sink = builder
        .into_inner()
        .map_err(|e| RecastError::io(upper, e))?;
    let layer = sink.finish(family, lease)?;
    tracing::info!(
        changes,
        digest = %layer.descriptor.digest,
        diff_id = %layer.diff_id,
        "layer diff computed"
    );
    Ok(layer)
}

/// Writes the changes from `lower` to `upper` into `builder`.
///
/// Returns the number of entries written, whiteouts included.
///
/// # Errors
///
/// Returns an error if a tree cannot be read or an entry cannot be
/// appended.
pub fn diff_directories<W: Write>(
    lower: &Path,
    upper: &Path,
    builder: &mut tar::Builder<W>,
) -> Result<usize> {
    let mut walker = Walker {
        lower,
        upper,
        builder,
        emitted_dirs: HashSet::new(),
        written: 0,
    };
    walker.compare_dir(Path::new(""))?;
    Ok(walker.written)
}

struct Walker<'a, W: Write> {
    lower: &'a Path,
    upper: &'a Path,
    builder: &'a mut tar::Builder<W>,
    emitted_dirs: HashSet<PathBuf>,
    written: usize,
}

impl<W: Write> Walker<'_, W> {
    fn compare_dir(&mut self, rel: &Path) -> Result<()> {
        let lower_names = list_names(&self.lower.join(rel))?;
        let upper_names = list_names(&self.upper.join(rel))?;

        for name in lower_names.union(&upper_names) {
            let child = rel.join(name);
            match (lower_names.contains(name), upper_names.contains(name)) {
                (true, false) => self.whiteout(&child)?,
                (false, true) => self.add_tree(&child)?,
                _ => self.compare_entry(&child)?,
            }
        }
        Ok(())
    }

    fn compare_entry(&mut self, rel: &Path) -> Result<()> {
        let lower_path = self.lower.join(rel);
        let upper_path = self.upper.join(rel);
        let old = symlink_metadata(&lower_path)?;
        let new = symlink_metadata(&upper_path)?;

        if old.is_dir() && new.is_dir() {
            if !same_attributes(&old, &new) {
                self.append(rel)?;
            }
            return self.compare_dir(rel);
        }
        if old.file_type() != new.file_type() {
            return self.add_tree(rel);
        }
        if !same_attributes(&old, &new) || !same_content(&lower_path, &upper_path, &old, &new)? {
            self.append(rel)?;
        }
        Ok(())
    }

    /// Emits an entry and, for directories, everything beneath it.
    fn add_tree(&mut self, rel: &Path) -> Result<()> {
        self.append(rel)?;
        if symlink_metadata(&self.upper.join(rel))?.is_dir() {
            for name in list_names(&self.upper.join(rel))? {
                self.add_tree(&rel.join(name))?;
            }
        }
        Ok(())
    }

    fn append(&mut self, rel: &Path) -> Result<()> {
        self.ensure_parents(rel)?;
        let path = self.upper.join(rel);
        self.builder
            .append_path_with_name(&path, rel)
            .map_err(|e| RecastError::io(&path, e))?;
        if std::fs::symlink_metadata(&path).is_ok_and(|m| m.is_dir()) {
            let _ = self.emitted_dirs.insert(rel.to_path_buf());
        }
        self.written += 1;
        Ok(())
    }

    fn whiteout(&mut self, rel: &Path) -> Result<()> {
        self.ensure_parents(rel)?;
        let name = rel
            .file_name()
            .map(|n| format!("{WHITEOUT_PREFIX}{}", n.to_string_lossy()))
            .unwrap_or_default();
        let marker = rel.with_file_name(name);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(0);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_cksum();
        self.builder
            .append_data(&mut header, &marker, std::io::empty())
            .map_err(|e| RecastError::io(&marker, e))?;
        self.written += 1;
        Ok(())
    }

    /// Emits the headers of not-yet-written ancestor directories so the
    /// layer carries their mode and ownership.
    fn ensure_parents(&mut self, rel: &Path) -> Result<()> {
        let mut ancestors: Vec<&Path> = rel
            .ancestors()
            .skip(1)
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        ancestors.reverse();
        for dir in ancestors {
            if self.emitted_dirs.contains(dir) {
                continue;
            }
            let path = self.upper.join(dir);
            self.builder
                .append_path_with_name(&path, dir)
                .map_err(|e| RecastError::io(&path, e))?;
            let _ = self.emitted_dirs.insert(dir.to_path_buf());
            self.written += 1;
        }
        Ok(())
    }
}

fn list_names(dir: &Path) -> Result<BTreeSet<std::ffi::OsString>> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| {
                entry
                    .map(|e| e.file_name())
                    .map_err(|e| RecastError::io(dir, e))
            })
            .collect(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(RecastError::io(dir, e)),
    }
}

fn symlink_metadata(path: &Path) -> Result<Metadata> {
    std::fs::symlink_metadata(path).map_err(|e| RecastError::io(path, e))
}

fn same_attributes(old: &Metadata, new: &Metadata) -> bool {
    old.mode() & MODE_MASK == new.mode() & MODE_MASK
        && old.uid() == new.uid()
        && old.gid() == new.gid()
        && old.rdev() == new.rdev()
}

fn same_content(lower: &Path, upper: &Path, old: &Metadata, new: &Metadata) -> Result<bool> {
    if old.file_type().is_symlink() {
        let a = std::fs::read_link(lower).map_err(|e| RecastError::io(lower, e))?;
        let b = std::fs::read_link(upper).map_err(|e| RecastError::io(upper, e))?;
        return Ok(a == b);
    }
    if !old.is_file() {
        return Ok(true);
    }
    if old.len() != new.len() {
        return Ok(false);
    }
    if old.dev() == new.dev() && old.ino() == new.ino() {
        return Ok(true);
    }
    let mut a = std::fs::File::open(lower).map_err(|e| RecastError::io(lower, e))?;
    let mut b = std::fs::File::open(upper).map_err(|e| RecastError::io(upper, e))?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = read_full(&mut a, &mut buf_a).map_err(|e| RecastError::io(lower, e))?;
        let m = read_full(&mut b, &mut buf_b).map_err(|e| RecastError::io(upper, e))?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(false);
        }
        if n == 0 {
            return Ok(true);
        }
    }
}

fn read_full(file: &mut std::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(lower: &Path, upper: &Path) -> Vec<String> {
        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        let _ = diff_directories(lower, upper, &mut builder).expect("diff");
        let bytes = builder.into_inner().expect("finish");
        let mut archive = tar::Archive::new(&bytes[..]);
        archive
            .entries()
            .expect("entries")
            .map(|e| {
                e.expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .trim_end_matches('/')
                    .to_owned()
            })
            .collect()
    }

    fn trees() -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let lower = dir.path().join("lower");
        let upper = dir.path().join("upper");
        for root in [&lower, &upper] {
            std::fs::create_dir_all(root.join("etc")).expect("mkdir");
            std::fs::write(root.join("etc/same"), b"same").expect("write");
        }
        (dir, lower, upper)
    }

    #[test]
    fn identical_trees_produce_no_entries() {
        let (_dir, lower, upper) = trees();
        assert!(entries(&lower, &upper).is_empty());
    }

    #[test]
    fn added_file_brings_its_parent_directory() {
        let (_dir, lower, upper) = trees();
        std::fs::write(upper.join("etc/new"), b"new").expect("write");
        assert_eq!(entries(&lower, &upper), vec!["etc", "etc/new"]);
    }

    #[test]
    fn deleted_file_becomes_whiteout() {
        let (_dir, lower, upper) = trees();
        std::fs::write(lower.join("etc/gone"), b"gone").expect("write");
        assert_eq!(entries(&lower, &upper), vec!["etc", "etc/.wh.gone"]);
    }

    #[test]
    fn modified_content_with_same_size_is_detected() {
        let (_dir, lower, upper) = trees();
        std::fs::write(upper.join("etc/same"), b"SAME").expect("write");
        assert_eq!(entries(&lower, &upper), vec!["etc", "etc/same"]);
    }

    #[test]
    fn new_directory_is_added_recursively() {
        let (_dir, lower, upper) = trees();
        std::fs::create_dir_all(upper.join("opt/tool")).expect("mkdir");
        std::fs::write(upper.join("opt/tool/bin"), b"#!").expect("write");
        assert_eq!(
            entries(&lower, &upper),
            vec!["opt", "opt/tool", "opt/tool/bin"]
        );
    }

    #[test]
    fn changed_symlink_target_is_detected() {
        let (_dir, lower, upper) = trees();
        std::os::unix::fs::symlink("same", lower.join("etc/link")).expect("symlink");
        std::os::unix::fs::symlink("other", upper.join("etc/link")).expect("symlink");
        assert_eq!(entries(&lower, &upper), vec!["etc", "etc/link"]);
    }

    #[test]
    fn diff_applied_to_lower_reproduces_upper() {
        let (dir, lower, upper) = trees();
        std::fs::write(upper.join("etc/new"), b"n").expect("write");
        std::fs::write(lower.join("etc/old"), b"o").expect("write");

        let mut builder = tar::Builder::new(Vec::new());
        builder.follow_symlinks(false);
        let _ = diff_directories(&lower, &upper, &mut builder).expect("diff");
        let bytes = builder.into_inner().expect("finish");

        let target = dir.path().join("target");
        std::fs::create_dir_all(target.join("etc")).expect("mkdir");
        std::fs::write(target.join("etc/same"), b"same").expect("write");
        std::fs::write(target.join("etc/old"), b"o").expect("write");
        let _ = crate::layer::apply_layer(&bytes[..], false, &target).expect("apply");

        assert!(target.join("etc/new").exists());
        assert!(!target.join("etc/old").exists());
        assert!(target.join("etc/same").exists());
    }
}
