use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context, Result};
use clap::Parser;
use crossterm::event;
use directories::ProjectDirs;
use tofu_core::{
    Bindings, CommandInterpreter, DisplaySurface, FileStateStore, Flow, KeyBindings, StateStore,
    Viewer, ViewerAction, ViewerConfig,
};
use tofu_render::PdfRenderFactory;
use tofu_tty::{map_event, InputEvent, TerminalSurface};
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "tofu", version, about = "Minimal PDF viewer for kitty-compatible terminals")]
struct Args {
    /// Page number to open on (1-based), instead of the remembered one
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Directory holding per-document state [default: ~/.tofu_pdf]
    #[arg(long = "state-dir")]
    state_dir: Option<PathBuf>,

    /// Configuration file [default: <config dir>/config.toml]
    #[arg(long = "config")]
    config: Option<PathBuf>,

    /// PDF file to open
    file: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    ensure_readable(&args.file)?;

    let project_dirs = ProjectDirs::from("net", "tofu", "tofu")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ViewerConfig::load(&config_path)?;
    if let Some(dir) = args.state_dir.clone() {
        config.state_dir = Some(dir);
    }
    let _log_guard = init_logging(&project_dirs)?;

    let state_dir = config.resolve_state_dir()?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(state_dir)?);
    let provider = PdfRenderFactory::new(config.pdfium_library.as_deref())?;

    let surface = TerminalSurface::stdout()?;
    let mut viewer = Viewer::open_with(&provider, store, surface, &args.file).await?;
    if let Some(page) = args.page {
        viewer.goto(page_index(page))?;
    }

    let mut interpreter = CommandInterpreter::new(bindings(&config.keys));
    run(&mut viewer, &mut interpreter, || Ok(map_event(event::read()?)))
}

/// Drives the viewer until it quits. If the session fails part way, the last
/// page shown is still saved before the error is returned.
fn run<D, E>(
    viewer: &mut Viewer<D>,
    interpreter: &mut CommandInterpreter<ViewerAction>,
    next_event: E,
) -> Result<()>
where
    D: DisplaySurface,
    E: FnMut() -> Result<InputEvent>,
{
    let result = event_loop(viewer, interpreter, next_event);
    if let Err(err) = &result {
        warn!(?err, page = viewer.page_index(), "session failed, saving position");
        if let Err(save_err) = viewer.save_position() {
            warn!(?save_err, "failed to save position after error");
        }
    }
    result
}

fn event_loop<D, E>(
    viewer: &mut Viewer<D>,
    interpreter: &mut CommandInterpreter<ViewerAction>,
    mut next_event: E,
) -> Result<()>
where
    D: DisplaySurface,
    E: FnMut() -> Result<InputEvent>,
{
    loop {
        let action = match next_event()? {
            InputEvent::Key(key) => interpreter.feed(key),
            InputEvent::Interrupt => {
                interpreter.reset();
                Some(ViewerAction::Quit)
            }
            InputEvent::Resize => {
                viewer.render_current_page()?;
                None
            }
            InputEvent::Ignored => None,
        };
        viewer.set_pending(interpreter.pending())?;

        if let Some(action) = action {
            debug!(?action, "dispatching");
            if viewer.apply(action)? == Flow::Quit {
                info!(page = viewer.page_index(), "quitting");
                return Ok(());
            }
        }
    }
}

/// Typed page numbers count from 1, like the status line; `0` means the first page.
fn page_index(page_number: usize) -> usize {
    page_number.saturating_sub(1)
}

fn goto_page(page_number: usize) -> ViewerAction {
    ViewerAction::Goto(page_index(page_number))
}

fn bindings(keys: &KeyBindings) -> Bindings<ViewerAction> {
    Bindings::new()
        .immediate(keys.next, ViewerAction::Next)
        .immediate(keys.previous, ViewerAction::Previous)
        .immediate(keys.quit, ViewerAction::Quit)
        .parameterized(keys.goto, goto_page)
        .bare_count(keys.goto)
}

/// Fails before the terminal is touched if the document cannot be read.
fn ensure_readable(path: &Path) -> Result<()> {
    let metadata =
        fs::metadata(path).with_context(|| format!("cannot open {}", path.display()))?;
    ensure!(metadata.is_file(), "{} is not a file", path.display());
    File::open(path).with_context(|| format!("cannot read {}", path.display()))?;
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)
        .with_context(|| format!("failed to create log directory {:?}", log_dir))?;

    let file_appender = tracing_appender::rolling::never(log_dir, "tofu.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The terminal is in raw mode and showing a page, so logs only go to the file.
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
