//! Unpacking of copy-out archives.
//!
//! The runtime hands back a tar stream whose first path component is the
//! basename of the copied path (`src/...` for `/src`, `poc` for `/tmp/poc`).
//! [`unpack_stripped`] drops that component so the archive lands directly in
//! the destination.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::DockerError;

/// Unpacks `reader` into `dest`, stripping the archive's root component.
///
/// Returns the number of entries written below the root. Entries that would
/// escape `dest` (absolute paths, `..`, writes through symlinks) are rejected.
pub fn unpack_stripped<R: Read>(reader: R, dest: &Path) -> Result<usize, DockerError> {
    unpack_stripped_until(reader, dest, &AtomicBool::new(false))
}

/// Like [`unpack_stripped`], but stops before the next entry once `cancel`
/// is set.
pub fn unpack_stripped_until<R: Read>(
    reader: R,
    dest: &Path,
    cancel: &AtomicBool,
) -> Result<usize, DockerError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_mtime(true);
    archive.set_preserve_permissions(true);

    let mut written = 0;
    for entry in archive.entries()? {
        if cancel.load(Ordering::Acquire) {
            return Err(DockerError::Io(std::io::Error::new(
                std::io::ErrorKind::Interrupted,
                format!("unpack into '{}' cancelled", dest.display()),
            )));
        }
        let mut entry = entry?;
        let raw = entry.path()?.into_owned();
        let entry_type = entry.header().entry_type();

        let Some(rel) = strip_root(&raw)? else {
            // The copied path itself.
            if entry_type.is_dir() {
                fs::create_dir_all(dest)?;
            } else {
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                entry.unpack(dest)?;
            }
            continue;
        };

        ensure_no_symlink_ancestor(dest, &rel)?;
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        if entry_type.is_hard_link() {
            let link_name = entry
                .link_name()?
                .ok_or_else(|| DockerError::UnsafeArchiveEntry(raw.display().to_string()))?
                .into_owned();
            let link_rel = strip_root(&link_name)?
                .ok_or_else(|| DockerError::UnsafeArchiveEntry(link_name.display().to_string()))?;
            ensure_no_symlink_ancestor(dest, &link_rel)?;
            let source = dest.join(link_rel);
            if fs::hard_link(&source, &target).is_err() {
                fs::copy(&source, &target)?;
            }
        } else {
            entry.unpack(&target)?;
        }
        written += 1;
    }

    Ok(written)
}

/// Drops the first normal component; `None` means the path is the root itself.
fn strip_root(path: &Path) -> Result<Option<PathBuf>, DockerError> {
    let mut normal = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normal.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(DockerError::UnsafeArchiveEntry(path.display().to_string()));
            }
        }
    }

    if normal.len() <= 1 {
        return Ok(None);
    }
    Ok(Some(normal[1..].iter().collect()))
}

fn ensure_no_symlink_ancestor(dest: &Path, rel: &Path) -> Result<(), DockerError> {
    let mut current = dest.to_path_buf();
    let mut components = rel.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        current.push(component);
        if let Ok(meta) = fs::symlink_metadata(&current) {
            if meta.file_type().is_symlink() {
                return Err(DockerError::UnsafeArchiveEntry(rel.display().to_string()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Builds a tar archive the way the runtime returns it for `root`.
    pub(crate) fn tar_of(root: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir = tar::Header::new_gnu();
        dir.set_entry_type(tar::EntryType::Directory);
        dir.set_mode(0o755);
        dir.set_size(0);
        builder
            .append_data(&mut dir, format!("{root}/"), std::io::empty())
            .unwrap();
        for (name, body) in files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(body.len() as u64);
            builder
                .append_data(&mut header, format!("{root}/{name}"), *body)
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_unpack_directory_strips_root() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tree");
        let bytes = tar_of("src", &[("core/a.c", b"int a;"), ("fuzz/f.c", b"int f;")]);

        let written = unpack_stripped(bytes.as_slice(), &dest).unwrap();
        assert_eq!(written, 2);
        assert_eq!(fs::read(dest.join("core/a.c")).unwrap(), b"int a;");
        assert!(dest.join("fuzz/f.c").is_file());
        assert!(!dest.join("src").exists());
    }

    #[test]
    fn test_unpack_single_file_becomes_dest() {
        let dir = tempfile::tempdir().unwrap();
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(3);
        builder.append_data(&mut header, "poc", &b"\x00\x01\x02"[..]).unwrap();
        let bytes = builder.into_inner().unwrap();

        let dest = dir.path().join("artifacts/poc");
        let written = unpack_stripped(bytes.as_slice(), &dest).unwrap();
        assert_eq!(written, 0);
        assert_eq!(fs::read(&dest).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_cancelled_unpack_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tree");
        let bytes = tar_of("src", &[("core/a.c", b"int a;")]);

        let result = unpack_stripped_until(bytes.as_slice(), &dest, &AtomicBool::new(true));
        assert!(matches!(result, Err(DockerError::Io(ref e)) if e.kind() == std::io::ErrorKind::Interrupted));
        assert!(!dest.exists());
    }

    #[test]
    fn test_strip_root_rejects_escapes() {
        assert!(strip_root(Path::new("src/../../etc/passwd")).is_err());
        assert!(strip_root(Path::new("/etc/passwd")).is_err());
        assert_eq!(strip_root(Path::new("src")).unwrap(), None);
        assert_eq!(strip_root(Path::new("./src/")).unwrap(), None);
        assert_eq!(
            strip_root(Path::new("src/a/b.c")).unwrap(),
            Some(PathBuf::from("a/b.c"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_write_through_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let dest = dir.path().join("tree");
        fs::create_dir_all(&dest).unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.join("link")).unwrap();

        let bytes = tar_of("src", &[("link/evil.txt", b"x")]);
        let result = unpack_stripped(bytes.as_slice(), &dest);
        assert!(matches!(result, Err(DockerError::UnsafeArchiveEntry(_))));
        assert!(!outside.path().join("evil.txt").exists());
    }
}
