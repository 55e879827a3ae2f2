//! PDF rasterisation: the local phase of the bundled pipeline.
//!
//! ## Why is this gated?
//!
//! pdfium keeps process-global library state and is not safe to enter from
//! two threads at once, so [`PdfiumRasteriser::preprocess`] always runs
//! behind [`crate::gate::PreprocessGate`]. Rendering is fast next to VLM
//! inference; serialising it costs little wall-clock time.
//!
//! ## Why cap pixels, not DPI?
//!
//! Page sizes vary wildly: an A0 poster at 150 DPI is 12,000 × 17,000 px.
//! `max_rendered_pixels` caps the longest edge regardless of physical size,
//! keeping memory bounded inside the one-at-a-time critical section.

use crate::config::RasterConfig;
use crate::error::PhaseError;
use crate::pipeline::Preprocessor;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Cursor;
use tracing::{debug, info};

/// One rendered page, PNG-encoded.
#[derive(Debug, Clone)]
pub struct RasterPage {
    /// 1-based page number in the source document.
    pub page_num: usize,
    pub png: Vec<u8>,
}

/// The normalised form handed to the remote phase.
#[derive(Debug, Clone)]
pub struct RasterisedDocument {
    pub pages: Vec<RasterPage>,
    /// Page count of the whole source document, not just the rendered range.
    pub total_pages: usize,
}

/// Renders PDF pages with pdfium.
#[derive(Debug, Clone, Default)]
pub struct PdfiumRasteriser {
    config: RasterConfig,
}

impl PdfiumRasteriser {
    pub fn new(config: RasterConfig) -> Self {
        Self { config }
    }
}

impl Preprocessor for PdfiumRasteriser {
    type Output = RasterisedDocument;

    fn preprocess(&self, raw: &[u8]) -> Result<RasterisedDocument, PhaseError> {
        check_magic(raw)?;

        let pdfium = bind_pdfium()?;
        let password = self.config.password.as_deref();
        let document = pdfium
            .load_pdf_from_byte_slice(raw, password)
            .map_err(|e| load_error(e, password.is_some()))?;

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        let range = self.config.pages.to_indices(total_pages);
        if range.is_empty() {
            return Err(PhaseError::Preprocess(format!(
                "no pages selected (document has {total_pages} pages, range {:?})",
                self.config.pages
            )));
        }
        info!("PDF loaded: {} pages, rendering {:?}", total_pages, range);

        let max_pixels = self.config.max_rendered_pixels as i32;
        let render_config = PdfRenderConfig::new()
            .set_target_width(max_pixels)
            .set_maximum_height(max_pixels);

        let mut rendered = Vec::with_capacity(range.len());
        for idx in range {
            let page_num = idx + 1;
            let page = pages
                .get(idx as u16)
                .map_err(|e| PhaseError::Preprocess(format!("page {page_num}: {e:?}")))?;
            let bitmap = page
                .render_with_config(&render_config)
                .map_err(|e| PhaseError::Preprocess(format!("page {page_num}: {e:?}")))?;

            let image = bitmap.as_image();
            debug!(
                "Rendered page {} → {}x{} px",
                page_num,
                image.width(),
                image.height()
            );
            rendered.push(RasterPage {
                page_num,
                png: encode_png(&image)
                    .map_err(|e| PhaseError::Preprocess(format!("page {page_num}: {e}")))?,
            });
        }

        Ok(RasterisedDocument {
            pages: rendered,
            total_pages,
        })
    }
}

/// Reject non-PDF payloads before they reach pdfium.
pub fn check_magic(raw: &[u8]) -> Result<(), PhaseError> {
    if raw.len() < 4 || &raw[..4] != b"%PDF" {
        let head: Vec<u8> = raw.iter().take(4).copied().collect();
        return Err(PhaseError::Preprocess(format!(
            "not a PDF (first bytes: {head:?})"
        )));
    }
    Ok(())
}

/// Bind to `PDFIUM_LIB_PATH` when set, else to the system library.
fn bind_pdfium() -> Result<Pdfium, PhaseError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(dir) if !dir.is_empty() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&dir))
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| {
        PhaseError::Preprocess(format!(
            "failed to bind to pdfium: {e:?}; set PDFIUM_LIB_PATH to the directory holding libpdfium"
        ))
    })?;
    Ok(Pdfium::new(bindings))
}

fn load_error(e: PdfiumError, password_given: bool) -> PhaseError {
    let detail = format!("{e:?}");
    if detail.to_lowercase().contains("password") {
        if password_given {
            PhaseError::Preprocess("wrong PDF password".into())
        } else {
            PhaseError::Preprocess("PDF is encrypted and requires a password".into())
        }
    } else {
        PhaseError::Preprocess(format!("corrupt PDF: {detail}"))
    }
}

/// PNG is lossless; JPEG artefacts on rendered text degrade VLM accuracy.
fn encode_png(img: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn magic_check() {
        assert!(check_magic(b"%PDF-1.7\n...").is_ok());
        assert!(check_magic(b"PK\x03\x04zip").is_err());
        assert!(check_magic(b"").is_err());
    }

    #[test]
    fn non_pdf_rejected_before_binding() {
        // Fails on the magic check, so no pdfium library is needed.
        let r = PdfiumRasteriser::default().preprocess(b"hello world");
        match r {
            Err(PhaseError::Preprocess(msg)) => assert!(msg.contains("not a PDF")),
            other => panic!("expected preprocess error, got {other:?}"),
        }
    }

    #[test]
    fn encode_png_signature() {
        let img = DynamicImage::ImageRgba8(RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255])));
        let png = encode_png(&img).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
