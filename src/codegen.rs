//! Client for the remote code-generation function.
//!
//! The response is treated as an opaque bulk change: its `files` feed
//! straight into the runtime manager.

use std::collections::BTreeMap;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::CodegenError;
use crate::files::ProjectFileSet;

const FUNCTION_PATH: &str = "functions/v1/generate-code";

/// Editor focus sent along with a prompt.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditorContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_code: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub framework: Option<String>,
    pub existing_files: ProjectFileSet,
    pub analysis_mode: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<EditorContext>,
}

impl GenerateRequest {
    pub fn new(prompt: impl Into<String>, existing_files: ProjectFileSet) -> Self {
        Self {
            prompt: prompt.into(),
            framework: None,
            existing_files,
            analysis_mode: false,
            context: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub files: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub demo: Option<String>,
    #[serde(default)]
    pub tokens_used: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
}

impl GenerateResponse {
    /// Generated files as a bulk change. Entries with unusable paths are skipped.
    pub fn into_change(self) -> ProjectFileSet {
        let mut change = ProjectFileSet::new();
        for (path, content) in self.files.unwrap_or_default() {
            if let Err(err) = change.insert(&path, content) {
                warn!(%path, error = %err, "skipping generated file");
            }
        }
        change
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

/// Authenticated client of the generation function.
#[derive(Clone)]
pub struct CodegenClient {
    http: Client,
    endpoint: String,
    token: String,
}

impl CodegenClient {
    /// `base_url` is the project API root; `token` the caller's access token.
    pub fn new(base_url: &str, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: format!("{}/{}", base_url.trim_end_matches('/'), FUNCTION_PATH),
            token: token.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn generate(&self, request: &GenerateRequest) -> Result<GenerateResponse, CodegenError> {
        if request.prompt.trim().is_empty() {
            return Err(CodegenError::EmptyPrompt);
        }
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map(|body| body.error)
                .unwrap_or(text);
            return Err(CodegenError::Status {
                status: status.as_u16(),
                message,
            });
        }
        let generated: GenerateResponse = response.json().await?;
        info!(
            files = generated.files.as_ref().map_or(0, BTreeMap::len),
            tokens = generated.tokens_used.unwrap_or(0),
            "code generated"
        );
        Ok(generated)
    }
}
