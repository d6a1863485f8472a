//! Google Drive connector.
//!
//! Lists the PDFs directly inside one Drive folder and downloads their bytes
//! through the Drive v3 REST API, authenticated with a user OAuth
//! credential managed by [`crate::oauth::TokenManager`].
//!
//! # Configuration
//!
//! ```toml
//! [source]
//! provider = "google_drive"
//!
//! [source.google_drive]
//! folder_id = "1AbCdEf..."
//! client_secrets = "./secrets/client_secret.json"
//! # token_cache = "./secrets/client_secret_token.json"
//! page_size = 100
//! ```
//!
//! # Pagination
//!
//! Every listing follows `nextPageToken` until it is absent, so a single
//! [`Connector::list_pending`] call always returns the complete folder
//! snapshot. Shared drives are included (`supportsAllDrives`,
//! `includeItemsFromAllDrives`).
//!
//! # Authentication failures
//!
//! A `401` is retried once with a refreshed token. A second `401` surfaces
//! as [`AuthError::Rejected`], which aborts the cycle.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::DriveSourceConfig;
use crate::error::AuthError;
use crate::models::Document;
use crate::oauth::{ClientSecrets, HttpTokenEndpoint, SystemPrompt, TokenManager};
use crate::traits::Connector;

/// How the OAuth bootstrap should behave for this process.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthOptions {
    /// Never try the loopback browser flow.
    pub headless: bool,
    /// Discard the cached credential and authorize again.
    pub force_reauth: bool,
}

pub struct DriveConnector {
    client: reqwest::Client,
    api_base: String,
    folder_id: String,
    mime_type: String,
    page_size: u32,
    tokens: Mutex<TokenManager>,
}

impl DriveConnector {
    /// Build a connector wired to the real token endpoint and an
    /// interactive prompt chosen from the environment.
    pub fn from_config(config: &DriveSourceConfig, auth: AuthOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        let secrets = ClientSecrets::load(&config.client_secrets)?;
        let tokens = TokenManager::new(
            secrets,
            config.token_cache_path(),
            config.scopes.clone(),
            Box::new(HttpTokenEndpoint::new(client.clone())),
            Box::new(SystemPrompt::detect(auth.headless)),
        )
        .force_reauth(auth.force_reauth);
        Ok(Self::new(config, client, tokens))
    }

    pub fn new(config: &DriveSourceConfig, client: reqwest::Client, tokens: TokenManager) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            folder_id: config.folder_id.clone(),
            mime_type: config.mime_type.clone(),
            page_size: config.page_size,
            tokens: Mutex::new(tokens),
        }
    }

    fn listing_query(&self) -> String {
        format!(
            "'{}' in parents and mimeType='{}' and trashed = false",
            escape_query_literal(&self.folder_id),
            escape_query_literal(&self.mime_type)
        )
    }

    /// GET with a bearer token, retrying once on `401` after a refresh.
    async fn get_authorized(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let mut refreshed = false;
        loop {
            let token = self.tokens.lock().await.access_token().await?;
            let response = self
                .client
                .get(url)
                .bearer_auth(&token)
                .query(query)
                .send()
                .await
                .with_context(|| format!("Drive request to {} failed", url))?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }
            if refreshed {
                return Err(AuthError::Rejected {
                    status: response.status().as_u16(),
                }
                .into());
            }
            tracing::debug!("drive API returned 401, refreshing token");
            self.tokens.lock().await.invalidate();
            refreshed = true;
        }
    }

    async fn list_page(&self, page_token: Option<&str>) -> Result<FileList> {
        let mut query = vec![
            ("q", self.listing_query()),
            (
                "fields",
                "nextPageToken, files(id, name, size, modifiedTime)".to_string(),
            ),
            ("pageSize", self.page_size.to_string()),
            ("orderBy", "modifiedTime".to_string()),
            ("supportsAllDrives", "true".to_string()),
            ("includeItemsFromAllDrives", "true".to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let url = format!("{}/files", self.api_base);
        let response = self.get_authorized(&url, &query).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Drive files.list failed (HTTP {}): {}", status, body.trim());
        }
        response
            .json::<FileList>()
            .await
            .context("Failed to parse Drive files.list response")
    }
}

#[async_trait]
impl Connector for DriveConnector {
    fn name(&self) -> &str {
        "google_drive"
    }

    async fn authenticate(&self) -> Result<()> {
        self.tokens.lock().await.access_token().await?;
        Ok(())
    }

    async fn list_pending(&self) -> Result<Vec<Document>> {
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self.list_page(page_token.as_deref()).await?;
            pages += 1;
            documents.extend(page.files.into_iter().map(DriveFile::into_document));

            match page.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => break,
            }
        }

        tracing::debug!(
            folder = %self.folder_id,
            pages,
            files = documents.len(),
            "listed drive folder"
        );
        Ok(documents)
    }

    async fn fetch(&self, document: &Document) -> Result<Vec<u8>> {
        let url = format!("{}/files/{}", self.api_base, document.source_ref);
        let query = [
            ("alt", "media".to_string()),
            ("supportsAllDrives", "true".to_string()),
        ];
        let response = self.get_authorized(&url, &query).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "Drive download of '{}' failed (HTTP {}): {}",
                document.title,
                status,
                body.trim()
            );
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("Failed to read body of '{}'", document.title))?;
        Ok(bytes.to_vec())
    }
}

// ============ Drive API types ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    /// Drive reports int64 values as strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<DateTime<Utc>>,
}

impl DriveFile {
    fn into_document(self) -> Document {
        Document {
            title: if self.name.is_empty() {
                self.id.clone()
            } else {
                self.name
            },
            size: self.size.and_then(|s| s.parse().ok()),
            modified_time: self.modified_time,
            source_ref: self.id.clone(),
            id: self.id,
        }
    }
}

fn escape_query_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_parses_drive_shapes() {
        let list: FileList = serde_json::from_str(
            r#"{"nextPageToken": "p2", "files": [
                {"id": "a1", "name": "Scan.pdf", "size": "2048", "modifiedTime": "2024-09-18T10:30:00.000Z"},
                {"id": "b2"}
            ]}"#,
        )
        .unwrap();
        assert_eq!(list.next_page_token.as_deref(), Some("p2"));

        let docs: Vec<_> = list.files.into_iter().map(DriveFile::into_document).collect();
        assert_eq!(docs[0].size, Some(2048));
        assert_eq!(docs[0].source_ref, "a1");
        assert_eq!(
            docs[0].modified_time.unwrap().to_rfc3339(),
            "2024-09-18T10:30:00+00:00"
        );
        assert_eq!(docs[1].title, "b2");
        assert!(docs[1].modified_time.is_none());
    }

    #[test]
    fn query_literals_are_escaped() {
        assert_eq!(escape_query_literal("it's"), "it\\'s");
    }
}
