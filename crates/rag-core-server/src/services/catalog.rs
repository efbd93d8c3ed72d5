use async_trait::async_trait;
use std::path::PathBuf;

use crate::utils::error::AnalysisError;

/// Read-only document catalog capability: filename resolution, fuzzy
/// lookup and access checks. The core never writes through this.
#[async_trait]
pub trait DocumentCatalog: Send + Sync {
    async fn find_by_filename(
        &self,
        name: &str,
        organization_id: &str,
    ) -> Result<Option<PathBuf>, AnalysisError>;

    async fn similar(
        &self,
        name: &str,
        organization_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, AnalysisError>;

    async fn access_allowed(
        &self,
        document_path: &str,
        organization_id: &str,
        user_id: &str,
    ) -> Result<bool, AnalysisError>;
}

/// Filesystem-backed catalog rooted at a documents directory. Every file
/// under the root is visible to every caller; organization scoping is an
/// upstream concern.
pub struct FilesystemCatalog {
    root: PathBuf,
}

impl FilesystemCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn list_files(&self) -> Result<Vec<PathBuf>, AnalysisError> {
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                } else {
                    files.push(path);
                }
            }
        }

        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl DocumentCatalog for FilesystemCatalog {
    async fn find_by_filename(
        &self,
        name: &str,
        _organization_id: &str,
    ) -> Result<Option<PathBuf>, AnalysisError> {
        let target = name.to_lowercase();
        Ok(self.list_files()?.into_iter().find(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_lowercase() == target)
                .unwrap_or(false)
        }))
    }

    async fn similar(
        &self,
        name: &str,
        _organization_id: &str,
        limit: usize,
    ) -> Result<Vec<String>, AnalysisError> {
        let needle = name.to_lowercase();
        let mut matches: Vec<String> = self
            .list_files()?
            .into_iter()
            .filter_map(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.to_string())
            })
            .filter(|n| n.to_lowercase().contains(&needle))
            .collect();

        matches.truncate(limit);
        Ok(matches)
    }

    async fn access_allowed(
        &self,
        document_path: &str,
        _organization_id: &str,
        _user_id: &str,
    ) -> Result<bool, AnalysisError> {
        let path = PathBuf::from(document_path);
        Ok(path.starts_with(&self.root) && path.is_file())
    }
}
