//! In-memory snapshot of a directory subtree

use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::Path;

use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::fingerprint::Fingerprint;
use crate::protocol::BLOCK_SIZE;
use crate::protocol_core::mode_of;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Children in listing order, hidden entries excluded
    Directory(Vec<TreeNode>),
    /// All-zero when the file could not be read
    File(Fingerprint),
    /// Directory that could not be listed
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    /// rwxrwxrwx bits
    pub permissions: u32,
    pub kind: NodeKind,
}

impl TreeNode {
    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Directory(_) | NodeKind::Unreadable)
    }

    pub fn children(&self) -> &[TreeNode] {
        match &self.kind {
            NodeKind::Directory(children) => children,
            _ => &[],
        }
    }

    pub fn fingerprint(&self) -> Option<&Fingerprint> {
        match &self.kind {
            NodeKind::File(fp) => Some(fp),
            _ => None,
        }
    }

    /// Look up a descendant by a `/`-separated path relative to this node
    pub fn find(&self, path: &str) -> Option<&TreeNode> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(self, |node, part| {
                node.children().iter().find(|child| child.name == part)
            })
    }

    /// Number of nodes in the subtree, this one included
    pub fn count(&self) -> usize {
        1 + self.children().iter().map(TreeNode::count).sum::<usize>()
    }
}

/// Same names, permission bits and directory/file shape. Child order is
/// not significant.
pub fn isomorphic(a: &TreeNode, b: &TreeNode) -> bool {
    if a.name != b.name || a.permissions != b.permissions {
        return false;
    }
    match (&a.kind, &b.kind) {
        (NodeKind::Directory(ca), NodeKind::Directory(cb)) => {
            ca.len() == cb.len()
                && ca.iter().all(|child| {
                    cb.iter()
                        .find(|other| other.name == child.name)
                        .is_some_and(|other| isomorphic(child, other))
                })
        }
        (NodeKind::File(_), NodeKind::File(_)) => true,
        (NodeKind::Unreadable, NodeKind::Unreadable) => true,
        _ => false,
    }
}

/// Names beginning with a dot are never part of a tree
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Snapshot the subtree rooted at `root`. Failures below the root are
/// skipped; use [`build_reporting`] to collect them.
pub fn build(root: &Path) -> Result<TreeNode> {
    let mut errors = Vec::new();
    let node = build_reporting(root, &mut errors)?;
    for e in &errors {
        tracing::warn!(error = %e, "skipped entry while building tree");
    }
    Ok(node)
}

/// Snapshot the subtree rooted at `root`, pushing every per-entry failure
/// into `errors`. Only a failure on `root` itself is returned as `Err`.
pub fn build_reporting(root: &Path, errors: &mut Vec<SyncError>) -> Result<TreeNode> {
    let meta = fs::symlink_metadata(root).map_err(|e| SyncError::access(root, e))?;
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| root.to_string_lossy().into_owned());
    let permissions = mode_of(&meta);

    let kind = if meta.is_dir() {
        match list_children(root, errors) {
            Ok(children) => NodeKind::Directory(children),
            Err(e) => {
                errors.push(e);
                NodeKind::Unreadable
            }
        }
    } else if meta.is_file() || meta.file_type().is_symlink() {
        NodeKind::File(fingerprint_or_zero(root))
    } else {
        return Err(SyncError::access(
            root,
            std::io::Error::new(std::io::ErrorKind::Unsupported, "not a file or directory"),
        ));
    };

    Ok(TreeNode {
        name,
        permissions,
        kind,
    })
}

fn list_children(dir: &Path, errors: &mut Vec<SyncError>) -> Result<Vec<TreeNode>> {
    // Probe first so an unlistable directory is reported once, as itself
    fs::read_dir(dir).map_err(|e| SyncError::access(dir, e))?;

    let mut children = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().unwrap_or(dir).to_path_buf();
                errors.push(SyncError::access(path, e.into()));
                continue;
            }
        };
        if is_hidden(&entry.file_name().to_string_lossy()) {
            continue;
        }
        match build_reporting(entry.path(), errors) {
            Ok(child) => children.push(child),
            Err(e) => errors.push(e),
        }
    }
    Ok(children)
}

/// Fingerprint a regular file (or a link to one); zero when unreadable
fn fingerprint_or_zero(path: &Path) -> Fingerprint {
    let readable = fs::metadata(path).map(|m| m.is_file()).unwrap_or(false);
    if !readable {
        return Fingerprint::zeroed(BLOCK_SIZE);
    }
    File::open(path)
        .and_then(|f| Fingerprint::compute(BufReader::new(f), BLOCK_SIZE))
        .unwrap_or_else(|e| {
            tracing::debug!(path = %path.display(), error = %e, "unreadable file, zero fingerprint");
            Fingerprint::zeroed(BLOCK_SIZE)
        })
}

/// Pre-order listing, two spaces per level. Directories print as
/// `===== name (mode) =====`, everything else as `name (mode)`.
pub fn render(root: &TreeNode) -> String {
    let mut out = String::new();
    render_into(root, 0, &mut out);
    out
}

fn render_into(node: &TreeNode, depth: usize, out: &mut String) {
    let indent = depth * 2;
    match &node.kind {
        NodeKind::Directory(children) => {
            let _ = writeln!(
                out,
                "{:indent$}===== {} ({:o}) =====",
                "", node.name, node.permissions
            );
            for child in children {
                render_into(child, depth + 1, out);
            }
        }
        NodeKind::File(_) | NodeKind::Unreadable => {
            let _ = writeln!(out, "{:indent$}{} ({:o})", "", node.name, node.permissions);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_core::set_mode;
    use tempfile::TempDir;

    fn sample_tree() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("a.txt"), "hi").unwrap();
        fs::write(root.join("sub/b.txt"), "bye").unwrap();
        fs::write(root.join(".hidden"), "secret").unwrap();
        set_mode(&root.join("a.txt"), 0o644).unwrap();
        set_mode(&root.join("sub/b.txt"), 0o600).unwrap();
        set_mode(&root.join("sub"), 0o755).unwrap();
        set_mode(&root, 0o755).unwrap();
        tmp
    }

    #[test]
    fn test_build_shape_and_fingerprints() {
        let tmp = sample_tree();
        let tree = build(&tmp.path().join("root")).unwrap();

        assert_eq!(tree.name, "root");
        assert_eq!(tree.children().len(), 2);
        assert!(tree.find(".hidden").is_none());

        let a = tree.find("a.txt").unwrap();
        assert_eq!(a.permissions, 0o644);
        let expected = Fingerprint::compute(&b"hi"[..], BLOCK_SIZE).unwrap();
        assert_eq!(a.fingerprint(), Some(&expected));

        let b = tree.find("sub/b.txt").unwrap();
        assert_eq!(b.permissions, 0o600);
        assert!(tree.find("sub").unwrap().is_dir());
        assert_eq!(tree.count(), 4);
    }

    #[test]
    fn test_missing_root_is_access_error() {
        let tmp = TempDir::new().unwrap();
        let err = build(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, SyncError::Access { .. }));
    }

    #[test]
    fn test_single_file_root() {
        let tmp = sample_tree();
        let node = build(&tmp.path().join("root/a.txt")).unwrap();
        assert_eq!(node.name, "a.txt");
        assert!(node.fingerprint().is_some());
    }

    #[test]
    fn test_render_format() {
        let tmp = sample_tree();
        let tree = build(&tmp.path().join("root")).unwrap();
        let text = render(&tree);
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "===== root (755) =====");
        assert!(lines.contains(&"  a.txt (644)"));
        assert!(lines.contains(&"  ===== sub (755) ====="));
        assert!(lines.contains(&"    b.txt (600)"));
    }

    #[test]
    fn test_isomorphic_ignores_order_and_content() {
        let fp = |b: &[u8]| Fingerprint::compute(b, BLOCK_SIZE).unwrap();
        let file = |name: &str, content: &[u8]| TreeNode {
            name: name.into(),
            permissions: 0o644,
            kind: NodeKind::File(fp(content)),
        };
        let a = TreeNode {
            name: "r".into(),
            permissions: 0o755,
            kind: NodeKind::Directory(vec![file("x", b"1"), file("y", b"2")]),
        };
        let mut b = a.clone();
        if let NodeKind::Directory(children) = &mut b.kind {
            children.reverse();
            children[0] = file("y", b"other");
        }
        assert!(isomorphic(&a, &b));

        if let NodeKind::Directory(children) = &mut b.kind {
            children[0].permissions = 0o600;
        }
        assert!(!isomorphic(&a, &b));
    }
}
