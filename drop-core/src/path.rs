//! Entry paths: keep every received entry inside the destination root.

use std::path::{Component, Path, PathBuf};

/// Normalize a received entry path into a plain relative path.
/// `.` segments are dropped; `..`, root and drive prefixes are rejected.
pub fn sanitize(entry: &Path) -> Result<PathBuf, UnsafePath> {
    let mut out = PathBuf::new();
    for component in entry.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(UnsafePath(entry.display().to_string()));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(UnsafePath(entry.display().to_string()));
    }
    Ok(out)
}

/// Join a received entry path onto `root` after sanitizing it.
pub fn safe_join(root: &Path, entry: &Path) -> Result<PathBuf, UnsafePath> {
    Ok(root.join(sanitize(entry)?))
}

/// Render a relative path with `/` separators for the wire.
pub fn to_wire(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// An entry path that would escape the destination root.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("entry path {0:?} escapes the destination root")]
pub struct UnsafePath(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_relative_paths_pass() {
        assert_eq!(sanitize(Path::new("a/b/c.txt")).unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(sanitize(Path::new("./a/./b")).unwrap(), PathBuf::from("a/b"));
    }

    #[test]
    fn traversal_is_rejected() {
        for bad in ["../etc/passwd", "a/../../b", "a/..", "/etc/passwd", "", "."] {
            assert!(sanitize(Path::new(bad)).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn join_stays_under_root() {
        let root = Path::new("/tmp/dest");
        assert_eq!(
            safe_join(root, Path::new("sub/file")).unwrap(),
            PathBuf::from("/tmp/dest/sub/file")
        );
        assert!(safe_join(root, Path::new("sub/../../x")).is_err());
    }

    #[test]
    fn wire_form_uses_slashes() {
        let p: PathBuf = ["a", "b", "c.txt"].iter().collect();
        assert_eq!(to_wire(&p), "a/b/c.txt");
    }
}
