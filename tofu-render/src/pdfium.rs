use std::convert::TryFrom;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use pdfium_render::prelude::*;
use tofu_core::{DocumentBackend, DocumentInfo, DocumentMetadata, DocumentProvider, RenderImage};
use tracing::{debug, instrument};

use crate::{to_render_image, RENDER_SCALE};

/// Environment variable naming a pdfium shared library to load.
pub const LIBRARY_PATH_ENV: &str = "TOFU_PDFIUM_LIBRARY_PATH";

pub struct PdfiumRenderFactory {
    pdfium: Arc<Pdfium>,
}

impl PdfiumRenderFactory {
    /// Binds pdfium, trying `library` first, then `TOFU_PDFIUM_LIBRARY_PATH`,
    /// the working directory and finally the system library.
    pub fn new(library: Option<&Path>) -> Result<Self> {
        let mut errors = Vec::new();
        let env_library = std::env::var_os(LIBRARY_PATH_ENV)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let candidates = library
            .map(Path::to_path_buf)
            .into_iter()
            .chain(env_library)
            .chain(std::iter::once(Pdfium::pdfium_platform_library_name_at_path(
                "./",
            )));

        for candidate in candidates {
            match Pdfium::bind_to_library(&candidate) {
                Ok(bindings) => {
                    debug!(path = %candidate.display(), "bound pdfium");
                    return Ok(Self::from_pdfium(Pdfium::new(bindings)));
                }
                Err(err) => errors.push(format!("{}: {}", candidate.display(), err)),
            }
        }

        match Pdfium::bind_to_system_library() {
            Ok(bindings) => Ok(Self::from_pdfium(Pdfium::new(bindings))),
            Err(err) => {
                errors.push(format!("system: {err}"));
                Err(anyhow!(
                    "failed to bind to a pdfium library; ensure it is installed or set {} ({})",
                    LIBRARY_PATH_ENV,
                    errors.join(", ")
                ))
            }
        }
    }

    fn from_pdfium(pdfium: Pdfium) -> Self {
        Self {
            pdfium: Arc::new(pdfium),
        }
    }
}

#[async_trait]
impl DocumentProvider for PdfiumRenderFactory {
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve path for {:?}", path))?;
        let document = PdfiumDocument::open(Arc::clone(&self.pdfium), path, &absolute)?;
        Ok(Arc::new(document))
    }
}

struct PdfiumDocument {
    // Declared before `_pdfium` so it is dropped first.
    document: Mutex<PdfDocument<'static>>,
    info: DocumentInfo,
    _pdfium: Arc<Pdfium>,
}

impl PdfiumDocument {
    /// Loads `resolved` but describes the document by `path`, as the user named it.
    fn open(pdfium: Arc<Pdfium>, path: &Path, resolved: &Path) -> Result<Self> {
        let document = pdfium
            .load_pdf_from_file(resolved, None)
            .with_context(|| format!("failed to open {:?}", path))?;
        // SAFETY: the document borrows the bindings owned by `pdfium`. This
        // struct keeps its own `Arc<Pdfium>` alive and drops `document` before
        // it (fields drop in declaration order), so the borrow never dangles.
        let document = unsafe { mem::transmute::<PdfDocument<'_>, PdfDocument<'static>>(document) };
        let info = build_document_info(&document, path.to_path_buf());
        Ok(Self {
            document: Mutex::new(document),
            info,
            _pdfium: pdfium,
        })
    }

    fn render_internal(&self, document: &PdfDocument<'_>, page_index: usize) -> Result<RenderImage> {
        let index: PdfPageIndex = page_index
            .try_into()
            .map_err(|_| anyhow!("page {} is out of supported range", page_index))?;
        let page = document
            .pages()
            .get(index)
            .with_context(|| format!("page {} out of range", page_index))?;

        let config = PdfRenderConfig::new().scale_page_by_factor(RENDER_SCALE);
        let bitmap = page
            .render_with_config(&config)
            .with_context(|| format!("failed to render page {}", page_index))?;
        to_render_image(bitmap.as_image())
    }
}

impl DocumentBackend for PdfiumDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    #[instrument(skip(self), fields(title = %self.info.title))]
    fn render_page(&self, page_index: usize) -> Result<RenderImage> {
        let document = self.document.lock();
        self.render_internal(&document, page_index)
    }
}

fn build_document_info(document: &PdfDocument<'_>, path: PathBuf) -> DocumentInfo {
    let page_count = usize::try_from(document.pages().len()).unwrap_or_default();
    let metadata = document.metadata();

    let title = metadata
        .get(PdfDocumentMetadataTagType::Title)
        .map(|t| t.value().to_owned());
    let author = metadata
        .get(PdfDocumentMetadataTagType::Author)
        .map(|t| t.value().to_owned());
    if title.is_none() {
        debug!(path = %path.display(), "document has no title metadata");
    }

    DocumentInfo::new(path, page_count, DocumentMetadata { title, author })
}
