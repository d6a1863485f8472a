use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::LocalSourceConfig;
use crate::models::Document;
use crate::traits::Connector;

/// Watches a local directory for PDFs.
///
/// Document ids are paths relative to the root with `/` separators, so they
/// stay stable when the root directory itself moves.
pub struct LocalConnector {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    recursive: bool,
}

impl LocalConnector {
    pub fn new(config: &LocalSourceConfig) -> Result<Self> {
        let mut default_excludes = vec!["**/.git/**".to_string(), ".git/**".to_string()];
        default_excludes.extend(config.exclude_globs.clone());

        Ok(Self {
            root: config.path.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&default_excludes)?,
            recursive: config.recursive,
        })
    }

    fn scan(&self) -> Result<Vec<Document>> {
        if !self.root.is_dir() {
            bail!(
                "Local source directory does not exist: {}",
                self.root.display()
            );
        }

        let mut walker = WalkDir::new(&self.root).min_depth(1);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut documents = Vec::new();
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            documents.push(file_to_document(path, rel_str)?);
        }

        documents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(documents)
    }
}

#[async_trait]
impl Connector for LocalConnector {
    fn name(&self) -> &str {
        "local"
    }

    async fn list_pending(&self) -> Result<Vec<Document>> {
        self.scan()
    }

    async fn fetch(&self, document: &Document) -> Result<Vec<u8>> {
        tokio::fs::read(&document.source_ref)
            .await
            .with_context(|| format!("Failed to read {}", document.source_ref))
    }
}

fn file_to_document(path: &Path, relative_path: String) -> Result<Document> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let modified_time = metadata.modified().ok().map(DateTime::<Utc>::from);

    let title = path
        .file_stem()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let absolute = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

    Ok(Document {
        id: relative_path,
        title,
        size: Some(metadata.len()),
        modified_time,
        source_ref: absolute.to_string_lossy().to_string(),
    })
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("Invalid glob pattern: {}", pattern))?;
        builder.add(glob);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn connector(root: &Path, recursive: bool) -> LocalConnector {
        LocalConnector::new(&LocalSourceConfig {
            path: root.to_path_buf(),
            include_globs: vec!["*.pdf".to_string()],
            exclude_globs: vec![],
            recursive,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_only_pdfs_sorted() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("b.pdf"), b"%PDF-b").unwrap();
        std::fs::write(tmp.path().join("A.PDF"), b"%PDF-a").unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"skip").unwrap();

        let docs = connector(tmp.path(), false).list_pending().await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["A.PDF", "b.pdf"]);
        assert_eq!(docs[1].title, "b");
        assert_eq!(docs[1].size, Some(6));
        assert!(docs[1].modified_time.is_some());
    }

    #[tokio::test]
    async fn listing_is_repeatable() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("x.pdf"), b"%PDF").unwrap();
        let c = connector(tmp.path(), false);
        assert_eq!(c.list_pending().await.unwrap(), c.list_pending().await.unwrap());
    }

    #[tokio::test]
    async fn nested_files_need_recursive() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("sub/deep.pdf"), b"%PDF").unwrap();

        assert!(connector(tmp.path(), false)
            .list_pending()
            .await
            .unwrap()
            .is_empty());

        let docs = connector(tmp.path(), true).list_pending().await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "sub/deep.pdf");
    }

    #[tokio::test]
    async fn fetch_reads_bytes() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("x.pdf"), b"%PDF-1.4 body").unwrap();
        let c = connector(tmp.path(), false);
        let docs = c.list_pending().await.unwrap();
        assert_eq!(c.fetch(&docs[0]).await.unwrap(), b"%PDF-1.4 body");
    }

    #[tokio::test]
    async fn missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let c = connector(&tmp.path().join("gone"), false);
        assert!(c.list_pending().await.is_err());
    }
}
