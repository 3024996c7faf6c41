//! Which files a replica picks up from its own tree.
//!
//! Files are matched by extension category. Names without an extension, and
//! dotfiles, sync only when they are on the project-file allow-list. Hidden
//! directories are skipped apart from editor settings.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::indexer::STATE_DIR;

/// Extension groups a replica can opt into
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileCategory {
    Markdown,
    Image,
    Code,
    Config,
    Document,
    Data,
}

impl FileCategory {
    pub const ALL: [FileCategory; 6] = [
        FileCategory::Markdown,
        FileCategory::Image,
        FileCategory::Code,
        FileCategory::Config,
        FileCategory::Document,
        FileCategory::Data,
    ];

    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            FileCategory::Markdown => &["md", "markdown", "mdown", "mkdn", "mkd", "mdwn", "mdtxt", "mdtext", "text"],
            FileCategory::Image => &["jpg", "jpeg", "png", "gif", "svg", "webp", "bmp", "ico", "tiff", "tif"],
            FileCategory::Code => &[
                "rs", "py", "js", "ts", "jsx", "tsx", "html", "css", "scss", "json", "yaml", "yml", "toml", "xml",
            ],
            FileCategory::Config => &["ini", "cfg", "conf", "config", "env"],
            FileCategory::Document => &["txt", "rtf", "doc", "docx", "pdf"],
            FileCategory::Data => &["csv", "tsv", "jsonl"],
        }
    }

    /// Category of a file name, by its last extension
    pub fn of(name: &str) -> Option<FileCategory> {
        let ext = match name.rfind('.') {
            Some(i) if i > 0 => &name[i + 1..],
            _ => return None,
        };
        FileCategory::ALL
            .into_iter()
            .find(|category| category.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }
}

impl fmt::Display for FileCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FileCategory::Markdown => "markdown",
            FileCategory::Image => "image",
            FileCategory::Code => "code",
            FileCategory::Config => "config",
            FileCategory::Document => "document",
            FileCategory::Data => "data",
        };
        f.write_str(name)
    }
}

/// Project files synced regardless of extension or a leading dot
pub const ALLOWED_PROJECT_FILES: &[&str] = &[
    ".gitignore",
    ".gitattributes",
    ".editorconfig",
    ".env.example",
    ".eslintrc",
    ".eslintrc.json",
    ".eslintrc.js",
    ".eslintrc.yml",
    ".prettierrc",
    ".prettierrc.json",
    ".prettierrc.js",
    ".prettierrc.yml",
    ".babelrc",
    ".babelrc.json",
    ".babelrc.js",
    ".vscodeignore",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.toml",
    "Cargo.lock",
    "go.mod",
    "go.sum",
    "pom.xml",
    "build.gradle",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "Pipfile",
    "poetry.lock",
    "tsconfig.json",
    "webpack.config.js",
    "vite.config.js",
    "next.config.js",
    "README",
    "README.md",
    "LICENSE",
    "CHANGELOG.md",
    "CONTRIBUTING.md",
];

/// Hidden directories that are still walked
pub const ALLOWED_HIDDEN_DIRS: &[&str] = &[".vscode"];

/// Which local files are indexed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncPolicy {
    pub categories: BTreeSet<FileCategory>,
    /// Extensions synced on top of the enabled categories
    pub extra_extensions: Vec<String>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            categories: FileCategory::ALL.into_iter().collect(),
            extra_extensions: Vec::new(),
        }
    }
}

impl SyncPolicy {
    /// Only the given categories
    pub fn only(categories: impl IntoIterator<Item = FileCategory>) -> Self {
        Self {
            categories: categories.into_iter().collect(),
            extra_extensions: Vec::new(),
        }
    }

    /// Whether a file with this name is picked up
    pub fn syncs_file(&self, name: &str) -> bool {
        if ALLOWED_PROJECT_FILES.contains(&name) {
            return true;
        }
        if name.starts_with('.') {
            return false;
        }
        if let Some(category) = FileCategory::of(name) {
            if self.categories.contains(&category) {
                return true;
            }
        }
        match name.rfind('.') {
            Some(i) if i > 0 => {
                let ext = &name[i + 1..];
                self.extra_extensions
                    .iter()
                    .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
            }
            _ => false,
        }
    }

    /// Whether a directory with this name is walked
    pub fn walks_dir(&self, name: &str) -> bool {
        name != STATE_DIR && (!name.starts_with('.') || ALLOWED_HIDDEN_DIRS.contains(&name))
    }

    /// Full check for a `/`-separated path relative to the root
    pub fn syncs_path(&self, rel: &str) -> bool {
        let mut parts = rel.split('/').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                return self.syncs_file(part);
            }
            if !self.walks_dir(part) {
                return false;
            }
        }
        false
    }
}
