//! Text extraction for uploaded reference documents.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::{DynamicImage, ImageFormat};
use pdf2image::{PDF, Pages};
use tracing::info;

use crate::llm::{CallOptions, InlineImage, VisionModel};

pub const UNSUPPORTED_FILE: &str = "[暂不支持的文件类型]";
const NO_PDF_PAGES: &str = "[PDF 无法解析：未能渲染任何页面]";

const TEXT_SUFFIXES: [&str; 5] = ["txt", "md", "csv", "json", "xml"];

const OCR_SYSTEM_PROMPT: &str = "你是专业 OCR 引擎。任务是逐行转写图片中的文字。要求：1) 保持原文顺序；2) 不要总结；3) 不要补充推断；4) 无法识别处写 [不清晰]；5) 只输出纯文本。";
const OCR_INSTRUCTION: &str = "请提取这张图片中的全部文字，按原有顺序输出。";

#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, filename: &str, bytes: Vec<u8>) -> anyhow::Result<String>;
}

/// Rasterizes the leading pages of a PDF. Called on the blocking pool.
pub trait PageRenderer: Send + Sync {
    fn render(&self, bytes: Vec<u8>, max_pages: usize) -> anyhow::Result<Vec<DynamicImage>>;
}

/// Poppler-backed rendering through pdf2image
pub struct PopplerRenderer;

impl PageRenderer for PopplerRenderer {
    fn render(&self, bytes: Vec<u8>, max_pages: usize) -> anyhow::Result<Vec<DynamicImage>> {
        let pdf = PDF::from_bytes(bytes).map_err(|e| anyhow!("Failed to load PDF: {}", e))?;

        let last_page = (pdf.page_count() as usize).min(max_pages);
        if last_page == 0 {
            return Ok(Vec::new());
        }

        pdf.render(Pages::Range(1..=last_page as u32), None)
            .map_err(|e| anyhow!("Failed to render PDF pages: {}", e))
    }
}

/// Decodes text files directly and sends images and rendered PDF pages to a vision model
pub struct VisionDocumentExtractor {
    vision: Arc<dyn VisionModel>,
    renderer: Arc<dyn PageRenderer>,
    max_pdf_pages: usize,
}

impl VisionDocumentExtractor {
    pub fn new(vision: Arc<dyn VisionModel>, max_pdf_pages: usize) -> Self {
        Self {
            vision,
            renderer: Arc::new(PopplerRenderer),
            max_pdf_pages,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    async fn ocr(&self, image: InlineImage) -> anyhow::Result<String> {
        self.vision
            .read_image(OCR_SYSTEM_PROMPT, OCR_INSTRUCTION, &image, CallOptions::ocr())
            .await
    }

    async fn extract_pdf(&self, bytes: Vec<u8>) -> anyhow::Result<String> {
        let pages = render_pdf_pages(self.renderer.clone(), bytes, self.max_pdf_pages).await?;
        if pages.is_empty() {
            return Ok(NO_PDF_PAGES.to_string());
        }

        let mut blocks = Vec::with_capacity(pages.len());
        for (idx, page) in pages.into_iter().enumerate() {
            let text = self.ocr(page).await?;
            blocks.push(format!("[第{}页]\n{}", idx + 1, text));
        }
        info!(pages = blocks.len(), "PDF pages transcribed");
        Ok(blocks.join("\n\n").trim().to_string())
    }
}

#[async_trait]
impl DocumentExtractor for VisionDocumentExtractor {
    async fn extract(&self, filename: &str, bytes: Vec<u8>) -> anyhow::Result<String> {
        let suffix = suffix(filename);

        if TEXT_SUFFIXES.contains(&suffix.as_str()) {
            return Ok(String::from_utf8_lossy(&bytes).trim().to_string());
        }

        if let Some(mime) = image_mime(&suffix) {
            info!(filename, mime, "Transcribing image upload");
            return self
                .ocr(InlineImage {
                    mime: mime.to_string(),
                    base64: STANDARD.encode(&bytes),
                })
                .await;
        }

        if suffix == "pdf" {
            info!(filename, max_pages = self.max_pdf_pages, "Rendering PDF upload");
            return self.extract_pdf(bytes).await;
        }

        Ok(UNSUPPORTED_FILE.to_string())
    }
}

fn suffix(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

fn image_mime(suffix: &str) -> Option<&'static str> {
    match suffix {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "bmp" => Some("image/bmp"),
        "tif" | "tiff" => Some("image/tiff"),
        _ => None,
    }
}

/// Best-effort content type for an upload that did not declare one
pub fn guess_content_type(filename: &str) -> &'static str {
    let suffix = suffix(filename);
    if let Some(mime) = image_mime(&suffix) {
        return mime;
    }
    match suffix.as_str() {
        "pdf" => "application/pdf",
        "json" => "application/json",
        "xml" => "application/xml",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Render at most `max_pages` pages and encode them as PNG. Rendering shells out to
/// poppler, so it runs on the blocking pool.
async fn render_pdf_pages(
    renderer: Arc<dyn PageRenderer>,
    bytes: Vec<u8>,
    max_pages: usize,
) -> anyhow::Result<Vec<InlineImage>> {
    tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<InlineImage>> {
        let rendered = renderer.render(bytes, max_pages)?;

        rendered
            .iter()
            .take(max_pages)
            .map(|page| -> anyhow::Result<InlineImage> {
                Ok(InlineImage {
                    mime: "image/png".to_string(),
                    base64: png_base64(page)?,
                })
            })
            .collect()
    })
    .await?
}

fn png_base64(image: &DynamicImage) -> anyhow::Result<String> {
    let mut buffer = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .map_err(|e| anyhow!("Failed to encode image: {}", e))?;
    Ok(STANDARD.encode(&buffer))
}
