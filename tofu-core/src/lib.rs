use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

pub mod command;
pub mod config;
pub mod store;
pub mod viewer;

pub use command::{Bindings, CommandInterpreter, InterpreterState, Key};
pub use config::{KeyBindings, ViewerConfig};
pub use store::{
    DocumentRecord, FileStateStore, MemoryStateStore, StateStore, StoreError, PAGE_NUMBER_KEY,
};
pub use viewer::{Flow, Viewer, ViewerAction};

const UNTITLED: &str = "untitled";

/// Derives the title a document is stored under.
///
/// The file stem wins over embedded metadata, which is frequently missing or
/// left at whatever the authoring tool wrote. The metadata title is only used
/// when the path has no usable stem.
pub fn document_title(path: &Path, metadata: &DocumentMetadata) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().trim().to_owned())
        .filter(|stem| !stem.is_empty())
        .or_else(|| {
            metadata
                .title
                .as_deref()
                .map(str::trim)
                .filter(|title| !title.is_empty())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| UNTITLED.to_owned())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct DocumentMetadata {
    pub title: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub title: String,
    pub path: PathBuf,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
}

impl DocumentInfo {
    pub fn new(path: PathBuf, page_count: usize, metadata: DocumentMetadata) -> Self {
        let title = document_title(&path, &metadata);
        Self {
            title,
            path,
            page_count,
            metadata,
        }
    }

    pub fn last_page(&self) -> usize {
        self.page_count.saturating_sub(1)
    }
}

/// A rasterized page. Rows are `stride` bytes apart and may carry padding
/// past `width * bytes_per_pixel()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub has_alpha: bool,
    pub pixels: Vec<u8>,
}

impl RenderImage {
    /// Builds a tightly packed image, validating the buffer length.
    pub fn packed(width: u32, height: u32, has_alpha: bool, pixels: Vec<u8>) -> Result<Self> {
        let bpp = if has_alpha { 4 } else { 3 };
        let stride = width as usize * bpp;
        ensure!(
            pixels.len() == stride * height as usize,
            "pixel buffer of {} bytes does not match {}x{} with {} bytes per pixel",
            pixels.len(),
            width,
            height,
            bpp
        );
        Ok(Self {
            width,
            height,
            stride,
            has_alpha,
            pixels,
        })
    }

    pub fn bytes_per_pixel(&self) -> usize {
        if self.has_alpha {
            4
        } else {
            3
        }
    }

    /// The visible bytes of row `y`, without stride padding.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y as usize * self.stride;
        let end = start + self.width as usize * self.bytes_per_pixel();
        self.pixels.get(start..end)
    }
}

pub trait DocumentBackend: Send + Sync {
    fn info(&self) -> &DocumentInfo;
    fn render_page(&self, page_index: usize) -> Result<RenderImage>;
}

#[async_trait::async_trait]
pub trait DocumentProvider: Send + Sync {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>>;
}

/// Where rendered pages end up. Implementations show exactly one page at a
/// time; `present` replaces whatever was on screen before.
pub trait DisplaySurface {
    fn present(&mut self, image: &RenderImage) -> Result<()>;
    fn show_status(&mut self, status: &str) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}
