use anyhow::Result;
use image::DynamicImage;
use tofu_core::RenderImage;

#[cfg(feature = "pdf")]
mod pdfium;

#[cfg(feature = "pdf")]
pub use pdfium::{PdfiumRenderFactory, LIBRARY_PATH_ENV};

#[cfg(feature = "pdf")]
pub type PdfRenderFactory = PdfiumRenderFactory;

/// Scale applied to the page's point size when rasterizing. The terminal
/// downsamples to the cell grid, so rendering above 72 dpi keeps text sharp.
pub const RENDER_SCALE: f32 = 2.0;

/// Converts a decoded bitmap into the packed buffer the display consumes,
/// keeping the alpha channel only when the bitmap has one.
pub fn to_render_image(image: DynamicImage) -> Result<RenderImage> {
    let (width, height) = (image.width(), image.height());
    if image.color().has_alpha() {
        RenderImage::packed(width, height, true, image.into_rgba8().into_raw())
    } else {
        RenderImage::packed(width, height, false, image.into_rgb8().into_raw())
    }
}
