//! Narrow interfaces to the services the pipeline talks to, plus their HTTP
//! implementations.

use crate::config::{AnalysisServiceConfig, ServiceEndpoint};
use crate::models::{AnalysisVerdict, DefectCategory};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub name: String,
    pub id: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// At-least-once upload; returns a stable identifier.
    async fn upload(&self, local_path: &Path, folder: &str) -> Result<String>;
    async fn download(&self, remote_id: &str, dest_path: &Path) -> Result<PathBuf>;
    async fn list(&self, folder: &str) -> Result<Vec<RemoteItem>>;
}

/// Where a record sits in the dispatch, passed along with each analysis request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchContext {
    pub batch_index: usize,
    pub batch_count: usize,
    pub batch_len: usize,
    pub position: usize,
}

#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Uploads a frame image and returns the service-side file handle.
    async fn upload_image(&self, path: &Path) -> Result<String>;
    async fn analyze(&self, file_id: &str, ctx: &BatchContext) -> Result<AnalysisVerdict>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkOrderEvent {
    pub subject: String,
    pub description: String,
    pub category: DefectCategory,
    pub confidence: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub image_reference: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

/// A named place known to the CRM, such as a street segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedLocation {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[async_trait]
pub trait WorkOrderClient: Send + Sync {
    async fn create_event(&self, event: &WorkOrderEvent) -> Result<String>;

    /// Locations within `radius` degrees of the point on both axes.
    async fn nearby_locations(&self, _lat: f64, _lon: f64, _radius: f64) -> Result<Vec<NamedLocation>> {
        Ok(Vec::new())
    }
}

pub fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .gzip(true)
        .build()?;
    Ok(client)
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn join_url(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn authorize(req: reqwest::RequestBuilder, key: &Option<String>) -> reqwest::RequestBuilder {
    match key {
        Some(key) => req.bearer_auth(key),
        None => req,
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "upload.bin".to_string())
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    entries: Vec<RemoteItem>,
}

pub struct HttpObjectStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpObjectStore {
    pub fn new(cfg: &ServiceEndpoint) -> Result<Self> {
        Ok(HttpObjectStore { client: http_client()?, endpoint: cfg.endpoint.clone(), api_key: cfg.api_key() })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, local_path: &Path, folder: &str) -> Result<String> {
        let data = tokio::fs::read(local_path)
            .await
            .with_context(|| format!("failed to read {}", local_path.display()))?;
        let digest = sha256_hex(&data);
        let size = data.len();
        let form = reqwest::multipart::Form::new()
            .text("folder", folder.to_string())
            .part("file", reqwest::multipart::Part::bytes(data).file_name(file_name_of(local_path)));

        let req = self
            .client
            .post(join_url(&self.endpoint, "files"))
            .header("X-Content-Sha256", &digest)
            .multipart(form);
        let resp: IdResponse = authorize(req, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        tracing::debug!("uploaded {} ({} bytes, sha256={}) as {}", local_path.display(), size, digest, resp.id);
        Ok(resp.id)
    }

    async fn download(&self, remote_id: &str, dest_path: &Path) -> Result<PathBuf> {
        let url = join_url(&self.endpoint, &format!("files/{}/content", remote_id));
        let resp = authorize(self.client.get(url), &self.api_key)
            .send()
            .await?
            .error_for_status()?;

        if let Some(parent) = dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest_path).await?;
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        tracing::info!("downloaded {} to {}", remote_id, dest_path.display());
        Ok(dest_path.to_path_buf())
    }

    async fn list(&self, folder: &str) -> Result<Vec<RemoteItem>> {
        let url = join_url(&self.endpoint, &format!("folders/{}/items", folder));
        let resp: ListResponse = authorize(self.client.get(url), &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.entries)
    }
}

/// Request body for a chat-completions style vision API.
#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: Vec<ChatContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ChatContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_file")]
    ImageFile { image_file: ImageFileRef },
}

#[derive(Debug, Serialize)]
struct ImageFileRef {
    file_id: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct HttpAnalysisClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    prompt: String,
}

impl HttpAnalysisClient {
    pub fn new(cfg: &AnalysisServiceConfig) -> Result<Self> {
        let api_key = cfg.key_env.as_ref().and_then(|var| std::env::var(var).ok());
        Ok(HttpAnalysisClient {
            client: http_client()?,
            endpoint: cfg.endpoint.clone(),
            api_key,
            model: cfg.model.clone(),
            prompt: cfg.prompt.clone(),
        })
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn upload_image(&self, path: &Path) -> Result<String> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name_of(path))
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new().text("purpose", "vision").part("file", part);

        let req = self.client.post(join_url(&self.endpoint, "files")).multipart(form);
        let resp: IdResponse = authorize(req, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn analyze(&self, file_id: &str, ctx: &BatchContext) -> Result<AnalysisVerdict> {
        let request = ChatRequest {
            model: &self.model,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![ChatMessage {
                role: "user",
                content: vec![
                    ChatContent::Text {
                        text: format!(
                            "{}\n(Image {} of {} in batch {} of {}.)",
                            self.prompt,
                            ctx.position + 1,
                            ctx.batch_len,
                            ctx.batch_index + 1,
                            ctx.batch_count
                        ),
                    },
                    ChatContent::ImageFile { image_file: ImageFileRef { file_id: file_id.to_string() } },
                ],
            }],
        };

        let req = self.client.post(join_url(&self.endpoint, "chat/completions")).json(&request);
        let resp: ChatResponse = authorize(req, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let content = resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("analysis reply has no content"))?;
        parse_verdict_content(&content)
    }
}

/// Parses the JSON verdict out of a reply, tolerating a fenced code block.
pub fn parse_verdict_content(content: &str) -> Result<AnalysisVerdict> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).context("analysis reply is not a JSON verdict")
}

pub struct HttpWorkOrderClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpWorkOrderClient {
    pub fn new(cfg: &ServiceEndpoint) -> Result<Self> {
        Ok(HttpWorkOrderClient { client: http_client()?, endpoint: cfg.endpoint.clone(), api_key: cfg.api_key() })
    }
}

#[async_trait]
impl WorkOrderClient for HttpWorkOrderClient {
    async fn create_event(&self, event: &WorkOrderEvent) -> Result<String> {
        let req = self.client.post(join_url(&self.endpoint, "events")).json(event);
        let resp: IdResponse = authorize(req, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn nearby_locations(&self, lat: f64, lon: f64, radius: f64) -> Result<Vec<NamedLocation>> {
        let req = self.client.get(join_url(&self.endpoint, "locations")).query(&[
            ("lat_min", lat - radius),
            ("lat_max", lat + radius),
            ("lon_min", lon - radius),
            ("lon_max", lon + radius),
        ]);
        let resp: LocationList = authorize(req, &self.api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.entries)
    }
}

#[derive(Debug, Deserialize)]
struct LocationList {
    entries: Vec<NamedLocation>,
}
