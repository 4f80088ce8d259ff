use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::store::{StateStore, PAGE_NUMBER_KEY};
use crate::{document_title, DisplaySurface, DocumentBackend, DocumentInfo, DocumentProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerAction {
    Next,
    Previous,
    Goto(usize),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// One open document shown on one display.
///
/// The page index is always inside `0..page_count`; navigation clamps
/// instead of handing an out-of-range page to the backend. The title keys
/// the saved state and comes from the path the viewer was opened with, not
/// from wherever the provider resolved it to.
pub struct Viewer<D: DisplaySurface> {
    backend: Arc<dyn DocumentBackend>,
    title: String,
    store: Arc<dyn StateStore>,
    display: D,
    page_index: usize,
    pending: Option<String>,
}

impl<D: DisplaySurface> Viewer<D> {
    #[instrument(skip(provider, store, display))]
    pub async fn open_with<P: DocumentProvider + ?Sized>(
        provider: &P,
        store: Arc<dyn StateStore>,
        display: D,
        path: &Path,
    ) -> Result<Self> {
        let backend = provider
            .open(path)
            .await
            .with_context(|| format!("failed to open {:?}", path))?;
        let info = backend.info();
        ensure!(info.page_count > 0, "{:?} has no pages", path);

        let title = document_title(path, &info.metadata);
        let record = store.load(&title);
        let saved = record.get(PAGE_NUMBER_KEY, 0usize);
        let page_index = saved.min(info.last_page());
        if page_index != saved {
            warn!(
                title = %title,
                saved,
                page_count = info.page_count,
                "saved page is past the end of the document"
            );
        }
        info!(title = %title, page_index, page_count = info.page_count, "opened document");

        let mut viewer = Self {
            backend,
            title,
            store,
            display,
            page_index,
            pending: None,
        };
        viewer.render_current_page()?;
        Ok(viewer)
    }

    pub fn info(&self) -> &DocumentInfo {
        self.backend.info()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn page_index(&self) -> usize {
        self.page_index
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    #[instrument(skip(self), fields(page = self.page_index))]
    pub fn render_current_page(&mut self) -> Result<()> {
        self.present_page(self.page_index)?;
        self.draw_status()
    }

    pub fn next(&mut self) -> Result<()> {
        self.move_to(self.page_index.saturating_add(1))
    }

    pub fn previous(&mut self) -> Result<()> {
        self.move_to(self.page_index.saturating_sub(1))
    }

    pub fn goto(&mut self, page_index: usize) -> Result<()> {
        self.move_to(page_index)
    }

    /// Writes the current page to the state store.
    pub fn save_position(&self) -> Result<()> {
        self.store
            .save(&self.title, PAGE_NUMBER_KEY, Value::from(self.page_index))
            .with_context(|| format!("failed to save state for {:?}", self.title))
    }

    /// Remembers the current page and closes the display.
    pub fn quit(&mut self) -> Result<()> {
        self.save_position()?;
        self.display.close()
    }

    pub fn apply(&mut self, action: ViewerAction) -> Result<Flow> {
        match action {
            ViewerAction::Next => self.next()?,
            ViewerAction::Previous => self.previous()?,
            ViewerAction::Goto(page) => self.goto(page)?,
            ViewerAction::Quit => {
                self.quit()?;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    /// Updates the half-typed command shown next to the page status.
    pub fn set_pending(&mut self, pending: Option<&str>) -> Result<()> {
        let pending = pending.filter(|p| !p.is_empty()).map(str::to_owned);
        if pending != self.pending {
            self.pending = pending;
            self.draw_status()?;
        }
        Ok(())
    }

    pub fn status(&self) -> String {
        let mut status = format!(
            "{} — page {}/{}",
            self.title,
            self.page_index + 1,
            self.info().page_count
        );
        if let Some(pending) = &self.pending {
            status.push_str(" | ");
            status.push_str(pending);
        }
        status
    }

    fn move_to(&mut self, page_index: usize) -> Result<()> {
        let next = page_index.min(self.info().last_page());
        if next == self.page_index {
            return Ok(());
        }
        // The index only moves once the page is on screen.
        self.present_page(next)?;
        self.page_index = next;
        self.draw_status()
    }

    fn present_page(&mut self, page_index: usize) -> Result<()> {
        let image = self.backend.render_page(page_index)?;
        self.display.present(&image)
    }

    fn draw_status(&mut self) -> Result<()> {
        let status = self.status();
        self.display.show_status(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use anyhow::{anyhow, bail};
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::store::{DocumentRecord, MemoryStateStore};
    use crate::{DocumentMetadata, RenderImage};

    struct FakeBackend {
        info: DocumentInfo,
        broken_page: Option<usize>,
        rendered: Arc<Mutex<Vec<usize>>>,
    }

    impl DocumentBackend for FakeBackend {
        fn info(&self) -> &DocumentInfo {
            &self.info
        }

        fn render_page(&self, page_index: usize) -> Result<RenderImage> {
            if page_index >= self.info.page_count {
                bail!("page {} out of range", page_index);
            }
            if self.broken_page == Some(page_index) {
                bail!("page {} is damaged", page_index);
            }
            self.rendered.lock().push(page_index);
            RenderImage::packed(1, 1, false, vec![page_index as u8; 3])
        }
    }

    struct FakeProvider {
        page_count: usize,
        broken_page: Option<usize>,
        // Where the provider claims the document lives, like a resolved symlink.
        resolved_path: Option<PathBuf>,
        rendered: Arc<Mutex<Vec<usize>>>,
    }

    impl FakeProvider {
        fn new(page_count: usize) -> Self {
            Self {
                page_count,
                broken_page: None,
                resolved_path: None,
                rendered: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    #[async_trait::async_trait]
    impl DocumentProvider for FakeProvider {
        async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
            if path.extension().map_or(true, |ext| ext != "pdf") {
                return Err(anyhow!("not a pdf"));
            }
            let reported = self
                .resolved_path
                .clone()
                .unwrap_or_else(|| path.to_path_buf());
            Ok(Arc::new(FakeBackend {
                info: DocumentInfo::new(reported, self.page_count, DocumentMetadata::default()),
                broken_page: self.broken_page,
                rendered: Arc::clone(&self.rendered),
            }))
        }
    }

    #[derive(Default)]
    struct RecordingSurface {
        presented: Vec<u8>,
        statuses: Vec<String>,
        closed: bool,
    }

    impl DisplaySurface for RecordingSurface {
        fn present(&mut self, image: &RenderImage) -> Result<()> {
            self.presented.push(image.pixels[0]);
            Ok(())
        }

        fn show_status(&mut self, status: &str) -> Result<()> {
            self.statuses.push(status.to_owned());
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    async fn open(
        provider: &FakeProvider,
        store: Arc<dyn StateStore>,
    ) -> Viewer<RecordingSurface> {
        Viewer::open_with(
            provider,
            store,
            RecordingSurface::default(),
            &PathBuf::from("/tmp/sample.pdf"),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn open_restores_saved_page_and_quit_preserves_other_keys() {
        let mut record = DocumentRecord::default();
        record.set(PAGE_NUMBER_KEY, json!(5));
        record.set("zoom", json!("fit-width"));
        let store = Arc::new(MemoryStateStore::with_record("sample", record));
        let provider = FakeProvider::new(20);

        let mut viewer = open(&provider, store.clone()).await;
        assert_eq!(viewer.title(), "sample");
        assert_eq!(viewer.page_index(), 5);
        assert_eq!(viewer.display().presented, vec![5]);

        viewer.apply(ViewerAction::Next).unwrap();
        assert_eq!(viewer.apply(ViewerAction::Quit).unwrap(), Flow::Quit);
        assert!(viewer.display().closed);

        let saved = store.load("sample");
        assert_eq!(saved.page_number, Some(6));
        assert_eq!(saved.get("zoom", String::new()), "fit-width");
    }

    #[tokio::test]
    async fn fresh_document_starts_on_first_page() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = FakeProvider::new(3);
        let viewer = open(&provider, store).await;
        assert_eq!(viewer.page_index(), 0);
        assert_eq!(viewer.status(), "sample — page 1/3");
    }

    #[tokio::test]
    async fn navigation_clamps_to_document_bounds() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = FakeProvider::new(3);
        let mut viewer = open(&provider, store).await;

        viewer.previous().unwrap();
        assert_eq!(viewer.page_index(), 0);

        viewer.goto(99).unwrap();
        assert_eq!(viewer.page_index(), 2);
        viewer.next().unwrap();
        assert_eq!(viewer.page_index(), 2);

        viewer.goto(1).unwrap();
        viewer.previous().unwrap();
        viewer.previous().unwrap();
        assert_eq!(viewer.page_index(), 0);

        assert_eq!(*provider.rendered.lock(), vec![0, 2, 1, 0]);
    }

    #[tokio::test]
    async fn saved_page_past_the_end_is_clamped() {
        let mut record = DocumentRecord::default();
        record.set(PAGE_NUMBER_KEY, json!(40));
        let store = Arc::new(MemoryStateStore::with_record("sample", record));
        let provider = FakeProvider::new(4);
        let viewer = open(&provider, store).await;
        assert_eq!(viewer.page_index(), 3);
    }

    #[tokio::test]
    async fn pending_command_shows_in_status() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = FakeProvider::new(10);
        let mut viewer = open(&provider, store).await;

        viewer.set_pending(Some("g4")).unwrap();
        assert_eq!(
            viewer.display().statuses.last().map(String::as_str),
            Some("sample — page 1/10 | g4")
        );
        let drawn = viewer.display().statuses.len();
        viewer.set_pending(Some("g4")).unwrap();
        assert_eq!(viewer.display().statuses.len(), drawn);

        viewer.set_pending(None).unwrap();
        assert_eq!(viewer.status(), "sample — page 1/10");
    }

    #[tokio::test]
    async fn title_follows_the_opened_path_not_the_resolved_one() {
        let mut record = DocumentRecord::default();
        record.set(PAGE_NUMBER_KEY, json!(2));
        let store = Arc::new(MemoryStateStore::with_record("thesis", record));
        let mut provider = FakeProvider::new(5);
        provider.resolved_path = Some(PathBuf::from("/store/ab12.pdf"));

        let mut viewer = Viewer::open_with(
            &provider,
            store.clone(),
            RecordingSurface::default(),
            Path::new("/home/me/papers/thesis.pdf"),
        )
        .await
        .unwrap();
        assert_eq!(viewer.title(), "thesis");
        assert_eq!(viewer.page_index(), 2);
        assert_eq!(viewer.status(), "thesis — page 3/5");

        viewer.next().unwrap();
        viewer.quit().unwrap();
        assert_eq!(store.load("thesis").page_number, Some(3));
        assert!(store.load("ab12").is_empty());
    }

    #[tokio::test]
    async fn failed_render_keeps_the_last_good_page() {
        let store = Arc::new(MemoryStateStore::new());
        let mut provider = FakeProvider::new(5);
        provider.broken_page = Some(2);
        let mut viewer = open(&provider, store.clone()).await;

        viewer.next().unwrap();
        assert!(viewer.apply(ViewerAction::Next).is_err());
        assert_eq!(viewer.page_index(), 1);
        assert_eq!(viewer.status(), "sample — page 2/5");

        viewer.save_position().unwrap();
        assert_eq!(store.load("sample").page_number, Some(1));
        assert!(!viewer.display().closed);
    }

    #[tokio::test]
    async fn open_failure_is_reported_up_front() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = FakeProvider::new(10);
        let result = Viewer::open_with(
            &provider,
            store,
            RecordingSurface::default(),
            Path::new("/tmp/notes.txt"),
        )
        .await;
        let err = result.err().expect("open should fail");
        assert!(format!("{:#}", err).contains("not a pdf"));
        assert!(provider.rendered.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_document_is_rejected() {
        let store = Arc::new(MemoryStateStore::new());
        let provider = FakeProvider::new(0);
        let result = Viewer::open_with(
            &provider,
            store,
            RecordingSurface::default(),
            Path::new("/tmp/empty.pdf"),
        )
        .await;
        assert!(result.is_err());
    }
}
