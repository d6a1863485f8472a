//! Companion assets for a markdown artifact.
//!
//! Depending on the configured [`AssetPolicy`] a sink writes nothing, a copy
//! of the source PDF, or one image per page. Page images are rasterized with
//! `pdftoppm` (poppler-utils) unless the converter already supplied them,
//! then normalized here: 8-bit greyscale, at most the configured width,
//! optionally inverted, and for PNG squeezed through `optipng` or
//! `zopflipng` when either is on `PATH`.

use image::imageops::FilterType;
use image::{GrayImage, ImageFormat};
use std::io::Cursor;
use std::path::PathBuf;
use std::process::Command;

use crate::config::{AssetMode, OutputConfig};
use crate::error::SinkError;
use crate::models::{ArtifactFormat, OutputArtifact};

/// Scans whose mean brightness falls below this are inverted.
const DARK_MEAN_THRESHOLD: f64 = 128.0;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageFormat {
    Png,
    Jpeg,
}

impl PageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            PageFormat::Png => "png",
            PageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub format: PageFormat,
    pub width: u32,
    /// Always invert, instead of only for dark scans.
    pub invert: bool,
    pub optimize: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssetPolicy {
    None,
    SourcePdf,
    Pages(RenderOptions),
}

impl AssetPolicy {
    pub fn from_output_config(config: &OutputConfig) -> Self {
        if config.asset_directory.is_none() {
            return AssetPolicy::None;
        }
        let format = match config.asset_mode {
            AssetMode::Pdf => return AssetPolicy::SourcePdf,
            AssetMode::Png => PageFormat::Png,
            AssetMode::Jpg => PageFormat::Jpeg,
        };
        AssetPolicy::Pages(RenderOptions {
            format,
            width: config.page_width,
            invert: config.asset_invert,
            optimize: config.optimize_images,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    SourcePdf,
    /// 1-based page number.
    Page(usize),
}

/// A companion file ready to be written next to the markdown.
#[derive(Debug, Clone)]
pub struct Asset {
    pub file_name: String,
    pub kind: AssetKind,
    pub bytes: Vec<u8>,
}

/// Produce the assets `policy` asks for. Names share the artifact's stem.
/// Mind maps never get assets.
pub fn build_assets(artifact: &OutputArtifact, policy: &AssetPolicy) -> Result<Vec<Asset>, SinkError> {
    if artifact.format == ArtifactFormat::MindMap {
        return Ok(Vec::new());
    }
    match policy {
        AssetPolicy::None => Ok(Vec::new()),
        AssetPolicy::SourcePdf => match &artifact.source {
            Some(bytes) => Ok(vec![Asset {
                file_name: format!("{}.pdf", artifact.stem),
                kind: AssetKind::SourcePdf,
                bytes: bytes.clone(),
            }]),
            None => Ok(Vec::new()),
        },
        AssetPolicy::Pages(options) => {
            let raw_pages = if !artifact.page_images.is_empty() {
                artifact.page_images.clone()
            } else if let Some(source) = &artifact.source {
                rasterize(source, options.width)?
            } else {
                Vec::new()
            };

            raw_pages
                .iter()
                .enumerate()
                .map(|(i, raw)| {
                    Ok(Asset {
                        file_name: format!(
                            "{}-p{:02}.{}",
                            artifact.stem,
                            i + 1,
                            options.format.extension()
                        ),
                        kind: AssetKind::Page(i + 1),
                        bytes: finish_page(raw, options)?,
                    })
                })
                .collect()
        }
    }
}

/// Rasterize every page of `pdf` to greyscale PNG at `width` pixels.
pub fn rasterize(pdf: &[u8], width: u32) -> Result<Vec<Vec<u8>>, SinkError> {
    let workdir = tempfile::tempdir().map_err(|e| SinkError::io(std::env::temp_dir(), e))?;
    let input = workdir.path().join("input.pdf");
    std::fs::write(&input, pdf).map_err(|e| SinkError::io(&input, e))?;
    let prefix = workdir.path().join("page");

    let width_arg = width.to_string();
    let output = Command::new("pdftoppm")
        .args(["-png", "-gray", "-scale-to-x", width_arg.as_str(), "-scale-to-y", "-1"])
        .arg(&input)
        .arg(&prefix)
        .output()
        .map_err(|e| {
            SinkError::Render(format!(
                "cannot run pdftoppm ({}); install poppler-utils for image assets",
                e
            ))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SinkError::Render(format!("pdftoppm failed: {}", stderr.trim())));
    }

    let mut pages: Vec<PathBuf> = std::fs::read_dir(workdir.path())
        .map_err(|e| SinkError::io(workdir.path(), e))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "png"))
        .collect();
    // pdftoppm zero-pads page numbers to a common width, so this is page order.
    pages.sort();

    if pages.is_empty() {
        return Err(SinkError::Render("pdftoppm produced no pages".to_string()));
    }

    pages
        .iter()
        .map(|p| std::fs::read(p).map_err(|e| SinkError::io(p, e)))
        .collect()
}

/// Normalize one rendered page and encode it in the target format.
pub fn finish_page(raw: &[u8], options: &RenderOptions) -> Result<Vec<u8>, SinkError> {
    let decoded = image::load_from_memory(raw)
        .map_err(|e| SinkError::Render(format!("cannot decode page image: {}", e)))?;
    let mut gray = decoded.to_luma8();

    if gray.width() > options.width {
        let height = ((gray.height() as f64) * (options.width as f64) / (gray.width() as f64))
            .round()
            .max(1.0) as u32;
        gray = image::imageops::resize(&gray, options.width, height, FilterType::Lanczos3);
    }

    if options.invert || mean_brightness(&gray) < DARK_MEAN_THRESHOLD {
        image::imageops::invert(&mut gray);
    }

    let mut encoded = Vec::new();
    match options.format {
        PageFormat::Png => {
            gray.write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
                .map_err(|e| SinkError::Render(format!("PNG encoding failed: {}", e)))?;
            if options.optimize {
                encoded = optimize_png(encoded);
            }
        }
        PageFormat::Jpeg => {
            let mut encoder =
                image::codecs::jpeg::JpegEncoder::new_with_quality(&mut encoded, JPEG_QUALITY);
            encoder
                .encode_image(&gray)
                .map_err(|e| SinkError::Render(format!("JPEG encoding failed: {}", e)))?;
        }
    }
    Ok(encoded)
}

fn mean_brightness(gray: &GrayImage) -> f64 {
    let pixels = gray.as_raw();
    if pixels.is_empty() {
        return 255.0;
    }
    pixels.iter().map(|&p| p as u64).sum::<u64>() as f64 / pixels.len() as f64
}

/// Lossless recompression with whichever optimizer is installed. Any
/// failure keeps the original bytes.
fn optimize_png(bytes: Vec<u8>) -> Vec<u8> {
    let Some((program, args)) = png_optimizer() else {
        return bytes;
    };
    let Ok(workdir) = tempfile::tempdir() else {
        return bytes;
    };
    let path = workdir.path().join("page.png");
    if std::fs::write(&path, &bytes).is_err() {
        return bytes;
    }

    let mut cmd = Command::new(program);
    cmd.args(args).arg(&path);
    if program == "zopflipng" {
        cmd.arg(&path);
    }
    match cmd.output() {
        Ok(out) if out.status.success() => match std::fs::read(&path) {
            Ok(optimized) if !optimized.is_empty() && optimized.len() <= bytes.len() => optimized,
            _ => bytes,
        },
        Ok(out) => {
            tracing::debug!(
                optimizer = program,
                stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                "png optimizer failed; keeping original"
            );
            bytes
        }
        Err(_) => bytes,
    }
}

fn png_optimizer() -> Option<(&'static str, &'static [&'static str])> {
    if tool_available("optipng", "-v") {
        return Some(("optipng", &["-quiet", "-o7"]));
    }
    if tool_available("zopflipng", "-h") {
        return Some(("zopflipng", &["-y", "--iterations=50"]));
    }
    None
}

fn tool_available(program: &str, version_flag: &str) -> bool {
    Command::new(program).arg(version_flag).output().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn png_of(width: u32, height: u32, value: u8) -> Vec<u8> {
        let img = GrayImage::from_pixel(width, height, Luma([value]));
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .unwrap();
        out
    }

    fn options(format: PageFormat, invert: bool) -> RenderOptions {
        RenderOptions {
            format,
            width: 800,
            invert,
            optimize: false,
        }
    }

    fn artifact(source: Option<Vec<u8>>, pages: Vec<Vec<u8>>) -> OutputArtifact {
        OutputArtifact {
            document_id: "id".into(),
            title: "Scan".into(),
            stem: "Scan-20240918103000".into(),
            format: ArtifactFormat::Markdown,
            body: "# Scan".into(),
            source,
            page_images: pages,
        }
    }

    #[test]
    fn wide_pages_are_scaled_to_width() {
        let out = finish_page(&png_of(1600, 400, 255), &options(PageFormat::Png, false)).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!((img.width(), img.height()), (800, 200));
    }

    #[test]
    fn narrow_pages_keep_their_size() {
        let out = finish_page(&png_of(300, 100, 255), &options(PageFormat::Png, false)).unwrap();
        let img = image::load_from_memory(&out).unwrap();
        assert_eq!(img.width(), 300);
    }

    #[test]
    fn dark_scans_are_inverted() {
        let out = finish_page(&png_of(10, 10, 20), &options(PageFormat::Png, false)).unwrap();
        let img = image::load_from_memory(&out).unwrap().to_luma8();
        assert_eq!(img.get_pixel(0, 0)[0], 235);
    }

    #[test]
    fn forced_invert_applies_to_light_pages() {
        let out = finish_page(&png_of(10, 10, 250), &options(PageFormat::Png, true)).unwrap();
        let img = image::load_from_memory(&out).unwrap().to_luma8();
        assert_eq!(img.get_pixel(0, 0)[0], 5);
    }

    #[test]
    fn jpeg_output_is_jpeg() {
        let out = finish_page(&png_of(10, 10, 200), &options(PageFormat::Jpeg, false)).unwrap();
        assert_eq!(&out[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn source_pdf_policy_copies_bytes() {
        let assets =
            build_assets(&artifact(Some(b"%PDF".to_vec()), vec![]), &AssetPolicy::SourcePdf).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].file_name, "Scan-20240918103000.pdf");
        assert_eq!(assets[0].bytes, b"%PDF");
    }

    #[test]
    fn mind_maps_get_no_assets() {
        let mut map = artifact(Some(b"%PDF".to_vec()), vec![]);
        map.format = ArtifactFormat::MindMap;
        assert!(build_assets(&map, &AssetPolicy::SourcePdf).unwrap().is_empty());
    }

    #[test]
    fn converter_pages_are_used_without_rasterizing() {
        let pages = vec![png_of(10, 10, 255), png_of(10, 10, 255)];
        let assets = build_assets(
            &artifact(None, pages),
            &AssetPolicy::Pages(options(PageFormat::Png, false)),
        )
        .unwrap();
        let names: Vec<_> = assets.iter().map(|a| a.file_name.as_str()).collect();
        assert_eq!(
            names,
            vec!["Scan-20240918103000-p01.png", "Scan-20240918103000-p02.png"]
        );
        assert_eq!(assets[1].kind, AssetKind::Page(2));
    }

    #[test]
    fn no_asset_directory_means_no_assets() {
        let config = OutputConfig::default();
        assert_eq!(AssetPolicy::from_output_config(&config), AssetPolicy::None);
    }
}
