//! In-memory project file set mirrored into the sandbox runtime.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SandboxError;

/// File whose change means dependencies must be reinstalled.
pub const MANIFEST_FILE: &str = "package.json";

/// Directories never loaded from disk into a project.
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// File set shared between the runtime manager and the sync bridge.
pub type SharedFiles = Arc<RwLock<ProjectFileSet>>;

/// Normalize a project-relative, forward-slash path.
///
/// Leading `/` and `./` are stripped and repeated separators collapse.
/// `.`/`..` segments and backslashes are rejected so that a path can never
/// escape the project root.
pub fn normalize_path(raw: &str) -> Result<String, SandboxError> {
    if raw.contains('\\') || raw.contains('\0') {
        return Err(SandboxError::InvalidPath(raw.to_string()));
    }
    let mut parts = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" => continue,
            "." | ".." => return Err(SandboxError::InvalidPath(raw.to_string())),
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return Err(SandboxError::InvalidPath(raw.to_string()));
    }
    Ok(parts.join("/"))
}

/// Parent directory of a normalized path, if it is not at the root.
pub fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(dir, _)| dir)
}

/// Mapping from path to text content. Insertion order is kept only for
/// rendering the directory tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectFileSet {
    files: IndexMap<String, String>,
}

impl ProjectFileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a file set from raw paths, normalizing each of them.
    pub fn from_entries<I, P, C>(entries: I) -> Result<Self, SandboxError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: AsRef<str>,
        C: Into<String>,
    {
        let mut set = Self::new();
        for (path, content) in entries {
            set.insert(path.as_ref(), content)?;
        }
        Ok(set)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Insert or replace a file, returning the previous content.
    pub fn insert(
        &mut self,
        path: &str,
        content: impl Into<String>,
    ) -> Result<Option<String>, SandboxError> {
        let path = normalize_path(path)?;
        Ok(self.files.insert(path, content.into()))
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.files.shift_remove(path)
    }

    /// Merge another set into this one; incoming entries win.
    pub fn merge(&mut self, other: &ProjectFileSet) {
        for (path, content) in other.iter() {
            self.files.insert(path.to_string(), content.to_string());
        }
    }

    /// Content of the root dependency manifest; empty when there is none.
    pub fn manifest(&self) -> &str {
        self.get(MANIFEST_FILE).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Render the paths as a directory tree, in insertion order.
    pub fn tree(&self) -> Vec<TreeNode> {
        let mut roots = Vec::new();
        for path in self.files.keys() {
            let parts: Vec<&str> = path.split('/').collect();
            insert_node(&mut roots, &parts, "", path);
        }
        roots
    }

    /// Load every UTF-8 file under `root`, skipping dependency and VCS folders.
    pub fn load_dir(root: &Path) -> io::Result<Self> {
        let mut set = Self::new();
        load_into(root, root, &mut set)?;
        Ok(set)
    }
}

fn load_into(root: &Path, dir: &Path, set: &mut ProjectFileSet) -> io::Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            let name = entry.file_name();
            if SKIPPED_DIRS.iter().any(|s| name == *s) {
                continue;
            }
            load_into(root, &path, set)?;
        } else if file_type.is_file() {
            let Ok(relative) = path.strip_prefix(root) else {
                continue;
            };
            let Some(relative) = relative.to_str() else {
                continue;
            };
            match fs::read_to_string(&path) {
                Ok(content) => {
                    let relative = relative.replace(std::path::MAIN_SEPARATOR, "/");
                    set.insert(&relative, content)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    debug!(path = %path.display(), "skipping non-UTF-8 file");
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

/// One entry of the rendered directory tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TreeNode {
    File {
        name: String,
        path: String,
    },
    Dir {
        name: String,
        path: String,
        children: Vec<TreeNode>,
    },
}

impl TreeNode {
    pub fn name(&self) -> &str {
        match self {
            TreeNode::File { name, .. } | TreeNode::Dir { name, .. } => name,
        }
    }
}

fn insert_node(nodes: &mut Vec<TreeNode>, parts: &[&str], prefix: &str, full: &str) {
    let Some((head, rest)) = parts.split_first() else {
        return;
    };
    let here = if prefix.is_empty() {
        head.to_string()
    } else {
        format!("{prefix}/{head}")
    };
    if rest.is_empty() {
        nodes.push(TreeNode::File {
            name: head.to_string(),
            path: full.to_string(),
        });
        return;
    }
    let existing = nodes
        .iter()
        .position(|n| matches!(n, TreeNode::Dir { name, .. } if name == head));
    let index = match existing {
        Some(i) => i,
        None => {
            nodes.push(TreeNode::Dir {
                name: head.to_string(),
                path: here.clone(),
                children: Vec::new(),
            });
            nodes.len() - 1
        }
    };
    if let TreeNode::Dir { children, .. } = &mut nodes[index] {
        insert_node(children, rest, &here, full);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_and_rejects() {
        assert_eq!(normalize_path("/src/App.jsx").unwrap(), "src/App.jsx");
        assert_eq!(normalize_path("./src//main.js").unwrap(), "src/main.js");
        assert!(normalize_path("../etc/passwd").is_err());
        assert!(normalize_path("src/./a.js").is_err());
        assert!(normalize_path("a\\b").is_err());
        assert!(normalize_path("/").is_err());
    }

    #[test]
    fn parent_dir_of_nested_and_root_paths() {
        assert_eq!(parent_dir("src/components/A.jsx"), Some("src/components"));
        assert_eq!(parent_dir("index.html"), None);
    }

    #[test]
    fn manifest_is_the_root_package_file_only() {
        let root = ProjectFileSet::from_entries([("package.json", "{}")]).unwrap();
        let nested = ProjectFileSet::from_entries([("pkg/package.json", "{}")]).unwrap();
        assert_eq!(root.manifest(), "{}");
        assert_eq!(nested.manifest(), "");
        assert_eq!(ProjectFileSet::new().manifest(), "");
    }

    #[test]
    fn tree_groups_directories_in_insertion_order() {
        let set = ProjectFileSet::from_entries([
            ("src/main.jsx", ""),
            ("index.html", ""),
            ("src/components/App.jsx", ""),
            ("src/index.css", ""),
        ])
        .unwrap();
        let tree = set.tree();
        let names: Vec<_> = tree.iter().map(TreeNode::name).collect();
        assert_eq!(names, ["src", "index.html"]);
        let TreeNode::Dir { children, path, .. } = &tree[0] else {
            panic!("expected a directory");
        };
        assert_eq!(path, "src");
        let names: Vec<_> = children.iter().map(TreeNode::name).collect();
        assert_eq!(names, ["main.jsx", "components", "index.css"]);
    }

    #[test]
    fn merge_overwrites_and_appends() {
        let mut set = ProjectFileSet::from_entries([("a.js", "1"), ("b.js", "2")]).unwrap();
        let incoming = ProjectFileSet::from_entries([("b.js", "3"), ("c.js", "4")]).unwrap();
        set.merge(&incoming);
        assert_eq!(set.get("b.js"), Some("3"));
        assert_eq!(set.paths().collect::<Vec<_>>(), ["a.js", "b.js", "c.js"]);
    }

    #[test]
    fn load_dir_skips_node_modules() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        fs::write(dir.path().join("package.json"), "{}").unwrap();
        fs::write(dir.path().join("src/main.js"), "console.log(1)").unwrap();
        fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();

        let set = ProjectFileSet::load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.get("src/main.js"), Some("console.log(1)"));
        assert!(!set.paths().any(|p| p.starts_with("node_modules")));
    }
}
