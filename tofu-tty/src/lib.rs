use std::io::{self, Stdout, Write};

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use crossterm::{
    cursor,
    event::{Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    terminal::{self, Clear, ClearType},
};
use png::{BitDepth, ColorType, Encoder};
use tofu_core::{DisplaySurface, Key, RenderImage};
use tracing::debug;

/// Rows kept free at the bottom of the screen for the status line.
const STATUS_ROWS: u32 = 1;

pub struct KittyRenderer<W: Write> {
    writer: W,
    image_id: u32,
    placement_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawParams {
    pub columns: u32,
    pub rows: u32,
}

impl DrawParams {
    pub fn clamped(columns: u32, rows: u32) -> Self {
        Self {
            columns: columns.max(1),
            rows: rows.max(1),
        }
    }
}

impl<W: Write> KittyRenderer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            image_id: 1,
            placement_id: 1,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Transmits `image` as PNG and places it at the cursor, replacing the
    /// previously drawn page (same image and placement ids).
    pub fn draw(&mut self, image: &RenderImage, params: DrawParams) -> Result<()> {
        let buffer = encode_png(image)?;
        let encoded = BASE64.encode(&buffer);
        let mut chunks = encoded.as_bytes().chunks(4096).peekable();
        let mut first = true;

        while let Some(chunk) = chunks.next() {
            let more = chunks.peek().is_some();
            if first {
                write!(
                    self.writer,
                    "\u{1b}_Ga=T,f=100,C=1,q=2,i={},p={},c={},r={},z=-1,m={}",
                    self.image_id,
                    self.placement_id,
                    params.columns,
                    params.rows,
                    u8::from(more)
                )?;
                first = false;
            } else {
                write!(self.writer, "\u{1b}_Gm={},q=2", u8::from(more))?;
            }
            if !chunk.is_empty() {
                self.writer.write_all(b";")?;
                self.writer.write_all(chunk)?;
            }
            write!(self.writer, "\u{1b}\\")?;
        }

        self.writer.flush()?;
        Ok(())
    }

    /// Removes every image this renderer placed.
    pub fn delete_images(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}_Ga=d,d=I,i={},q=2\u{1b}\\", self.image_id)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn begin_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026h")?;
        Ok(())
    }

    /// Ends a synchronized update; the terminal shows the buffered frame.
    pub fn end_sync_update(&mut self) -> Result<()> {
        write!(self.writer, "\u{1b}[?2026l")?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn clear_all(&mut self) -> Result<()> {
        crossterm::execute!(
            &mut self.writer,
            Clear(ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        Ok(())
    }
}

fn encode_png(image: &RenderImage) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut encoder = Encoder::new(&mut buffer, image.width, image.height);
    encoder.set_color(if image.has_alpha {
        ColorType::Rgba
    } else {
        ColorType::Rgb
    });
    encoder.set_depth(BitDepth::Eight);
    let mut writer = encoder.write_header()?;

    let row_len = image.width as usize * image.bytes_per_pixel();
    if image.stride == row_len {
        writer.write_image_data(&image.pixels)?;
    } else {
        let mut packed = Vec::with_capacity(row_len * image.height as usize);
        for y in 0..image.height {
            let row = image
                .row(y)
                .ok_or_else(|| anyhow::anyhow!("pixel buffer ends before row {}", y))?;
            packed.extend_from_slice(row);
        }
        writer.write_image_data(&packed)?;
    }
    writer.finish()?;
    Ok(buffer)
}

/// Terminal size in cells and, when the terminal reports it, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub columns: u16,
    pub rows: u16,
    pub pixel_width: u16,
    pub pixel_height: u16,
}

impl TerminalGeometry {
    pub fn query() -> Result<Self> {
        let window = terminal::window_size()?;
        Ok(Self {
            columns: window.columns,
            rows: window.rows,
            pixel_width: window.width,
            pixel_height: window.height,
        })
    }

    pub fn status_row(&self) -> u16 {
        self.rows.saturating_sub(1)
    }
}

/// Where to put an image: top-left cell and size in cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub column: u16,
    pub row: u16,
    pub params: DrawParams,
}

/// Fits an image into the area above the status line, preserving its aspect
/// ratio, and centers it. Without pixel dimensions cells are assumed to be
/// twice as tall as they are wide.
pub fn center_image(image_width: u32, image_height: u32, geometry: TerminalGeometry) -> Placement {
    let columns = u32::from(geometry.columns).max(1);
    let total_rows = u32::from(geometry.rows).max(1);
    let image_rows = total_rows.saturating_sub(STATUS_ROWS).max(1);

    if image_width == 0 || image_height == 0 {
        return Placement {
            column: 0,
            row: 0,
            params: DrawParams::clamped(columns, image_rows),
        };
    }

    let (cell_width, cell_height) = if geometry.pixel_width > 0 && geometry.pixel_height > 0 {
        (
            f32::from(geometry.pixel_width) / columns as f32,
            f32::from(geometry.pixel_height) / total_rows as f32,
        )
    } else {
        (1.0, 2.0)
    };

    let available_width = columns as f32 * cell_width;
    let available_height = image_rows as f32 * cell_height;
    let scale = (available_width / image_width as f32).min(available_height / image_height as f32);

    let draw_columns = ((image_width as f32 * scale) / cell_width)
        .round()
        .clamp(1.0, columns as f32) as u32;
    let draw_rows = ((image_height as f32 * scale) / cell_height)
        .round()
        .clamp(1.0, image_rows as f32) as u32;

    Placement {
        column: ((columns - draw_columns) / 2) as u16,
        row: ((image_rows - draw_rows) / 2) as u16,
        params: DrawParams::clamped(draw_columns, draw_rows),
    }
}

/// A kitty-graphics terminal used as the page display.
///
/// Built with [`TerminalSurface::stdout`] it owns raw mode for its lifetime
/// and restores the terminal on `close` or drop.
pub struct TerminalSurface<W: Write> {
    renderer: KittyRenderer<W>,
    geometry: fn() -> Result<TerminalGeometry>,
    raw_mode: bool,
    closed: bool,
}

impl TerminalSurface<Stdout> {
    pub fn stdout() -> Result<Self> {
        terminal::enable_raw_mode()?;
        let mut surface = Self {
            renderer: KittyRenderer::new(io::stdout()),
            geometry: TerminalGeometry::query,
            raw_mode: true,
            closed: false,
        };
        crossterm::execute!(surface.renderer.writer(), cursor::Hide)?;
        surface.renderer.clear_all()?;
        Ok(surface)
    }
}

impl<W: Write> TerminalSurface<W> {
    /// A surface over an arbitrary writer; raw mode is left untouched.
    pub fn with_writer(writer: W, geometry: fn() -> Result<TerminalGeometry>) -> Self {
        Self {
            renderer: KittyRenderer::new(writer),
            geometry,
            raw_mode: false,
            closed: false,
        }
    }

    pub fn writer(&mut self) -> &mut W {
        self.renderer.writer()
    }

    fn restore(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let cleared = self.clear_screen();
        if self.raw_mode {
            terminal::disable_raw_mode()?;
        }
        cleared
    }

    fn clear_screen(&mut self) -> Result<()> {
        self.renderer.delete_images()?;
        self.renderer.clear_all()?;
        crossterm::execute!(self.renderer.writer(), cursor::Show)?;
        Ok(())
    }
}

impl<W: Write> DisplaySurface for TerminalSurface<W> {
    fn present(&mut self, image: &RenderImage) -> Result<()> {
        let geometry = (self.geometry)()?;
        let placement = center_image(image.width, image.height, geometry);
        debug!(?placement, width = image.width, height = image.height, "presenting page");

        self.renderer.begin_sync_update()?;
        self.renderer.delete_images()?;
        crossterm::execute!(
            self.renderer.writer(),
            Clear(ClearType::All),
            cursor::MoveTo(placement.column, placement.row)
        )?;
        self.renderer.draw(image, placement.params)?;
        self.renderer.end_sync_update()
    }

    fn show_status(&mut self, status: &str) -> Result<()> {
        let geometry = (self.geometry)()?;
        let writer = self.renderer.writer();
        crossterm::execute!(
            writer,
            cursor::MoveTo(0, geometry.status_row()),
            Clear(ClearType::CurrentLine)
        )?;
        let width = usize::from(geometry.columns);
        let label: String = status.chars().take(width).collect();
        write_status_line(writer, &label)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.restore()
    }
}

impl<W: Write> Drop for TerminalSurface<W> {
    fn drop(&mut self) {
        let _ = self.restore();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    Key(Key),
    /// Ctrl-C; raw mode swallows the signal so it arrives as a key.
    Interrupt,
    Resize,
    Ignored,
}

pub fn map_event(event: Event) -> InputEvent {
    match event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) => {
            if kind == KeyEventKind::Release {
                return InputEvent::Ignored;
            }
            match (code, modifiers) {
                (KeyCode::Char('c'), modifiers) if modifiers.contains(KeyModifiers::CONTROL) => {
                    InputEvent::Interrupt
                }
                (KeyCode::Char(c), modifiers)
                    if modifiers.is_empty() || modifiers == KeyModifiers::SHIFT =>
                {
                    InputEvent::Key(Key::Char(c))
                }
                (KeyCode::Enter, _) => InputEvent::Key(Key::Enter),
                (KeyCode::Esc, _) => InputEvent::Key(Key::Escape),
                (KeyCode::Backspace, _) => InputEvent::Key(Key::Backspace),
                _ => InputEvent::Ignored,
            }
        }
        Event::Resize(..) => InputEvent::Resize,
        _ => InputEvent::Ignored,
    }
}

pub fn write_status_line<W: Write>(writer: &mut W, label: &str) -> io::Result<()> {
    write!(writer, "{}", label)?;
    writer.flush()
}
