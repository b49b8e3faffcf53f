//! In-memory research history for the HTTP shell, with JSON, Markdown and
//! PDF export. Nothing here affects the pipeline.

use chrono::Local;
use genpdf::elements::{Break, Paragraph};
use genpdf::fonts::{FontData, FontFamily};
use genpdf::style::{Style, StyledString};
use genpdf::{Document, SimplePageDecorator};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::debug;

/// Font family every PDF is set in. `genpdf` expects the four
/// `LiberationSans-{Regular,Bold,Italic,BoldItalic}.ttf` files in one directory.
pub const PDF_FONT_FAMILY: &str = "LiberationSans";

const SYSTEM_FONT_DIRS: &[&str] = &[
    "/usr/share/fonts/truetype/liberation",
    "/usr/share/fonts/liberation-sans",
    "/usr/share/fonts/liberation",
    "/usr/local/share/fonts",
    "/Library/Fonts",
];

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no LiberationSans fonts found for PDF export, set PDF_FONT_DIR")]
    FontUnavailable,

    #[error("PDF error: {0}")]
    Pdf(#[from] genpdf::error::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchRecord {
    pub topic: String,
    pub result: String,
    pub timestamp: String,
}

impl ResearchRecord {
    pub fn now(topic: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            result: result.into(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Markdown,
    Pdf,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Markdown => "text/markdown; charset=utf-8",
            ExportFormat::Pdf => "application/pdf",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::Json => "research_history.json",
            ExportFormat::Markdown => "research_history.md",
            ExportFormat::Pdf => "research_history.pdf",
        }
    }
}

#[derive(Debug, Default)]
pub struct ResearchHistory {
    records: RwLock<Vec<ResearchRecord>>,
    font_dir: Option<PathBuf>,
}

impl ResearchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look for PDF fonts in `font_dir` before the usual system locations.
    pub fn with_font_dir(font_dir: Option<PathBuf>) -> Self {
        Self {
            records: RwLock::default(),
            font_dir,
        }
    }

    pub async fn record(&self, record: ResearchRecord) {
        self.records.write().await.push(record);
    }

    pub async fn list(&self) -> Vec<ResearchRecord> {
        self.records.read().await.clone()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }

    /// `None` when there is nothing to export.
    pub async fn export(&self, format: ExportFormat) -> Result<Option<Vec<u8>>, ExportError> {
        let records = self.records.read().await;
        if records.is_empty() {
            return Ok(None);
        }
        let body = match format {
            ExportFormat::Json => serde_json::to_vec_pretty(&*records)?,
            ExportFormat::Markdown => to_markdown(&records).into_bytes(),
            ExportFormat::Pdf => {
                let dirs = self
                    .font_dir
                    .iter()
                    .map(PathBuf::as_path)
                    .chain(SYSTEM_FONT_DIRS.iter().map(Path::new));
                to_pdf(&records, load_fonts(dirs)?)?
            }
        };
        Ok(Some(body))
    }
}

/// The first directory holding a loadable [`PDF_FONT_FAMILY`].
pub fn load_fonts<'a>(
    dirs: impl IntoIterator<Item = &'a Path>,
) -> Result<FontFamily<FontData>, ExportError> {
    for dir in dirs {
        match genpdf::fonts::from_files(dir, PDF_FONT_FAMILY, None) {
            Ok(family) => return Ok(family),
            Err(e) => debug!(dir = %dir.display(), error = %e, "No PDF fonts here"),
        }
    }
    Err(ExportError::FontUnavailable)
}

/// Same layout as [`to_markdown`]. Report headings are set in bold and the
/// rest of each report is laid out paragraph by paragraph.
pub fn to_pdf(
    records: &[ResearchRecord],
    fonts: FontFamily<FontData>,
) -> Result<Vec<u8>, ExportError> {
    let mut doc = Document::new(fonts);
    doc.set_title("Research History");
    let mut decorator = SimplePageDecorator::new();
    decorator.set_margins(20);
    doc.set_page_decorator(decorator);

    doc.push(heading("Research History", 18));
    doc.push(Break::new(1));
    for (idx, research) in records.iter().enumerate() {
        doc.push(heading(&format!("Research #{}", idx + 1), 14));
        doc.push(Paragraph::new(format!("Topic: {}", research.topic)));
        doc.push(Paragraph::new(format!("Date: {}", research.timestamp)));
        doc.push(Break::new(0.5));
        for block in research.result.split("\n\n") {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            match block.strip_prefix('#') {
                Some(title) => doc.push(heading(title.trim_start_matches('#').trim(), 12)),
                None => doc.push(Paragraph::new(block.to_string())),
            }
            doc.push(Break::new(0.5));
        }
        doc.push(Break::new(1));
    }

    let mut out = Vec::new();
    doc.render(&mut out)?;
    Ok(out)
}

fn heading(text: &str, size: u8) -> Paragraph {
    Paragraph::new(StyledString::new(
        text.to_string(),
        Style::new().bold().with_font_size(size),
    ))
}

pub fn to_markdown(records: &[ResearchRecord]) -> String {
    let mut markdown_content = String::from("# Research History\n\n");
    for (idx, research) in records.iter().enumerate() {
        markdown_content.push_str(&format!("## Research #{}\n", idx + 1));
        markdown_content.push_str(&format!("**Topic:** {}\n\n", research.topic));
        markdown_content.push_str(&format!("**Date:** {}\n\n", research.timestamp));
        markdown_content.push_str(&format!("{}\n\n", research.result));
        markdown_content.push_str("---\n\n");
    }
    markdown_content
}
