//! Project store boundary: per-path file rows keyed by `(project_id, path)`.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::files::ProjectFileSet;

const FILES_TABLE: &str = "project_files";

/// What a workspace needs from persistent storage.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn list_files(&self, project_id: &str) -> Result<ProjectFileSet, StoreError>;

    /// Insert or update every file of `files` for the project.
    async fn upsert_files(&self, project_id: &str, files: &ProjectFileSet)
        -> Result<(), StoreError>;
}

#[derive(Deserialize)]
struct FileRow {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct FileInsert<'a> {
    project_id: &'a str,
    path: &'a str,
    content: &'a str,
}

/// Store reached through a PostgREST-style HTTP API.
#[derive(Clone)]
pub struct RestStore {
    http: Client,
    base_url: String,
    api_key: String,
    access_token: Option<String>,
}

impl RestStore {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            access_token: None,
        }
    }

    /// Act as a signed-in user instead of the anonymous key.
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, FILES_TABLE)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
        request.header("apikey", &self.api_key).bearer_auth(bearer)
    }
}

async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Status {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ProjectStore for RestStore {
    async fn list_files(&self, project_id: &str) -> Result<ProjectFileSet, StoreError> {
        let filter = format!("eq.{project_id}");
        let request = self.http.get(self.table_url()).query(&[
            ("project_id", filter.as_str()),
            ("select", "path,content"),
            ("order", "path.asc"),
        ]);
        let response = check(self.authorized(request).send().await?).await?;
        let rows: Vec<FileRow> = response.json().await?;
        debug!(%project_id, files = rows.len(), "project files listed");

        let mut files = ProjectFileSet::new();
        for row in rows {
            files
                .insert(&row.path, row.content)
                .map_err(|_| StoreError::InvalidPath(row.path.clone()))?;
        }
        Ok(files)
    }

    async fn upsert_files(
        &self,
        project_id: &str,
        files: &ProjectFileSet,
    ) -> Result<(), StoreError> {
        if files.is_empty() {
            return Ok(());
        }
        let rows: Vec<FileInsert<'_>> = files
            .iter()
            .map(|(path, content)| FileInsert {
                project_id,
                path,
                content,
            })
            .collect();
        let request = self
            .http
            .post(self.table_url())
            .query(&[("on_conflict", "project_id,path")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows);
        check(self.authorized(request).send().await?).await?;
        info!(%project_id, files = rows.len(), "project files saved");
        Ok(())
    }
}

/// Store kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    projects: RwLock<HashMap<String, ProjectFileSet>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn list_files(&self, project_id: &str) -> Result<ProjectFileSet, StoreError> {
        Ok(self
            .projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_files(
        &self,
        project_id: &str,
        files: &ProjectFileSet,
    ) -> Result<(), StoreError> {
        self.projects
            .write()
            .await
            .entry(project_id.to_string())
            .or_default()
            .merge(files);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_upserts_by_path() {
        let store = MemoryStore::new();
        let first = ProjectFileSet::from_entries([("a.js", "1"), ("b.js", "2")]).unwrap();
        let second = ProjectFileSet::from_entries([("b.js", "3")]).unwrap();
        store.upsert_files("p", &first).await.unwrap();
        store.upsert_files("p", &second).await.unwrap();

        let files = store.list_files("p").await.unwrap();
        assert_eq!(files.get("a.js"), Some("1"));
        assert_eq!(files.get("b.js"), Some("3"));
        assert!(store.list_files("other").await.unwrap().is_empty());
    }

    #[test]
    fn rest_store_builds_table_url() {
        let store = RestStore::new("https://db.example.com/", "anon");
        assert_eq!(
            store.table_url(),
            "https://db.example.com/rest/v1/project_files"
        );
    }
}
