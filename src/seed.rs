//! Seed corpus: markdown files bootstrapped into every new knowledge index.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A seed document: its path relative to the corpus root, and its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedDocument {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct SeedCorpus {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
}

impl SeedCorpus {
    pub fn new(root: impl Into<PathBuf>, include_globs: &[String]) -> Result<Self> {
        Ok(Self {
            root: root.into(),
            include: build_globset(include_globs)?,
            exclude: build_globset(&["**/.git/**".to_string(), "**/.*".to_string()])?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read every matching file, sorted by relative path.
    pub fn load(&self) -> Result<Vec<SeedDocument>> {
        if !self.root.is_dir() {
            bail!("Seed corpus directory does not exist: {}", self.root.display());
        }

        let mut documents = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            match std::fs::read_to_string(path) {
                Ok(text) => documents.push(SeedDocument {
                    name: rel_str,
                    text,
                }),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable seed file")
                }
            }
        }

        // Sort for deterministic ordering
        documents.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(documents)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_markdown_sorted() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("guides")).unwrap();
        std::fs::write(tmp.path().join("b.md"), "# B").unwrap();
        std::fs::write(tmp.path().join("guides/a.md"), "# A").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), "skip").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "skip").unwrap();

        let corpus = SeedCorpus::new(tmp.path(), &["**/*.md".to_string()]).unwrap();
        let docs = corpus.load().unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["b.md", "guides/a.md"]);
        assert_eq!(docs[1].text, "# A");
    }

    #[test]
    fn test_missing_root_fails() {
        let corpus = SeedCorpus::new("/nonexistent/kbchat-seed", &["**/*.md".to_string()]).unwrap();
        assert!(corpus.load().is_err());
    }

    #[test]
    fn test_bad_glob_rejected() {
        assert!(SeedCorpus::new(".", &["[".to_string()]).is_err());
    }
}
