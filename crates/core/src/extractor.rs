use crate::error::EngineError;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extensions handed to a layout/OCR service rather than parsed locally.
const LAYOUT_EXTENSIONS: [&str; 12] = [
    "docx", "xlsx", "pptx", "html", "jpg", "jpeg", "png", "bmp", "tiff", "tif", "heif", "heic",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocumentType {
    PlainText,
    Markdown,
    Json,
    Pdf,
    Layout(String),
}

impl DocumentType {
    pub fn from_file_name(file_name: &str) -> Result<Self, EngineError> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .ok_or_else(|| {
                EngineError::UnsupportedType(format!("{file_name} has no extension"))
            })?;

        Self::from_extension(&extension)
            .ok_or_else(|| EngineError::UnsupportedType(format!(".{extension}")))
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        let extension = extension.to_ascii_lowercase();
        match extension.as_str() {
            "txt" => Some(DocumentType::PlainText),
            "md" => Some(DocumentType::Markdown),
            "json" => Some(DocumentType::Json),
            "pdf" => Some(DocumentType::Pdf),
            other if LAYOUT_EXTENSIONS.contains(&other) => {
                Some(DocumentType::Layout(other.to_string()))
            }
            _ => None,
        }
    }

    pub fn label(&self) -> &str {
        match self {
            DocumentType::PlainText => "txt",
            DocumentType::Markdown => "md",
            DocumentType::Json => "json",
            DocumentType::Pdf => "pdf",
            DocumentType::Layout(extension) => extension,
        }
    }
}

/// Reduces an uploaded name to a safe basename.
pub fn secure_file_name(raw: &str) -> Result<String, EngineError> {
    let unsafe_chars = Regex::new(r"[^A-Za-z0-9_.-]+")
        .map_err(|error| EngineError::Validation(error.to_string()))?;

    let base = raw.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned = unsafe_chars.replace_all(base, "_");
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();

    if cleaned.is_empty() {
        return Err(EngineError::Validation(format!(
            "file name {raw:?} has no usable characters"
        )));
    }

    Ok(cleaned)
}

pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let supported = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(DocumentType::from_extension)
            .is_some();

        if supported {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], document_type: &DocumentType)
        -> Result<String, EngineError>;
}

#[derive(Default)]
pub struct LocalExtractor {
    layout: Option<LayoutServiceExtractor>,
}

impl LocalExtractor {
    pub fn with_layout_service(layout: LayoutServiceExtractor) -> Self {
        Self {
            layout: Some(layout),
        }
    }

    async fn delegate(
        &self,
        bytes: &[u8],
        document_type: &DocumentType,
        reason: Option<String>,
    ) -> Result<String, EngineError> {
        match (&self.layout, reason) {
            (Some(layout), _) => layout.extract(bytes, document_type).await,
            (None, Some(reason)) => Err(EngineError::Extraction(reason)),
            (None, None) => Err(EngineError::UnsupportedType(format!(
                ".{} requires a layout service",
                document_type.label()
            ))),
        }
    }
}

#[async_trait]
impl Extractor for LocalExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        document_type: &DocumentType,
    ) -> Result<String, EngineError> {
        match document_type {
            DocumentType::PlainText | DocumentType::Markdown => decode_utf8(bytes),
            DocumentType::Json => {
                let parsed: serde_json::Value = serde_json::from_slice(bytes)
                    .map_err(|error| EngineError::Extraction(format!("invalid json: {error}")))?;
                serde_json::to_string(&parsed)
                    .map_err(|error| EngineError::Extraction(error.to_string()))
            }
            DocumentType::Pdf => match extract_pdf_text(bytes) {
                Ok(text) => Ok(text),
                Err(reason) => self.delegate(bytes, document_type, Some(reason)).await,
            },
            DocumentType::Layout(_) => self.delegate(bytes, document_type, None).await,
        }
    }
}

fn decode_utf8(bytes: &[u8]) -> Result<String, EngineError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|error| EngineError::Extraction(format!("text is not utf-8: {error}")))
}

fn extract_pdf_text(bytes: &[u8]) -> Result<String, String> {
    let document = Document::load_mem(bytes).map_err(|error| error.to_string())?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| error.to_string())?;
        if !text.trim().is_empty() {
            pages.push(text.trim().to_string());
        }
    }

    if pages.is_empty() {
        return Err("pdf had no readable page text".to_string());
    }

    Ok(pages.join("\n\n"))
}

#[derive(Debug, Clone, Serialize)]
struct LayoutRequest<'a> {
    document_base64: String,
    content_type: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
struct LayoutResponse {
    pages: Option<Vec<LayoutPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LayoutPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

/// Client for a layout/OCR HTTP service.
pub struct LayoutServiceExtractor {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl LayoutServiceExtractor {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
        }
    }
}

#[async_trait]
impl Extractor for LayoutServiceExtractor {
    async fn extract(
        &self,
        bytes: &[u8],
        document_type: &DocumentType,
    ) -> Result<String, EngineError> {
        let payload = LayoutRequest {
            document_base64: STANDARD.encode(bytes),
            content_type: document_type.label(),
        };

        let mut request = self.client.post(&self.endpoint).json(&payload);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request
            .send()
            .await
            .map_err(|error| EngineError::Extraction(format!("layout service: {error}")))?;

        if !response.status().is_success() {
            return Err(EngineError::Extraction(format!(
                "layout request to {} returned {}",
                self.endpoint,
                response.status()
            )));
        }

        let payload: LayoutResponse = response
            .json()
            .await
            .map_err(|error| EngineError::Extraction(format!("layout response: {error}")))?;

        layout_text(&payload)
    }
}

fn layout_text(payload: &LayoutResponse) -> Result<String, EngineError> {
    if let Some(listed) = &payload.pages {
        let mut pages = listed
            .iter()
            .enumerate()
            .filter_map(|(position, page)| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some((page.page.unwrap_or(position as u32 + 1), text))
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            pages.sort_by_key(|(number, _)| *number);
            return Ok(pages
                .into_iter()
                .map(|(_, text)| text)
                .collect::<Vec<_>>()
                .join("\n\n"));
        }
    }

    if let Some(raw_text) = &payload.text {
        let text = raw_text
            .split('\u{000c}')
            .map(str::trim)
            .filter(|page| !page.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");

        if !text.is_empty() {
            return Ok(text);
        }
    }

    Err(EngineError::Extraction(
        "layout response had no readable text".to_string(),
    ))
}
