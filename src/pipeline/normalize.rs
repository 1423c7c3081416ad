//! Image normalisation: turn a phone photo or flatbed scan into an
//! OCR-ready grayscale bitmap.
//!
//! The chain is fixed and runs in this order:
//!
//! ```text
//! decode ──▶ grayscale ──▶ NL-means denoise ──▶ 3×3 sharpen ──▶ CLAHE
//! ```
//!
//! Denoising blurs stroke edges slightly; the sharpening kernel restores
//! them, and CLAHE then evens out lighting differences between regions of
//! the page (shadows from a curled sheet, a bright flash spot). None of the
//! steps take call-time parameters.
//!
//! The filters follow the usual reference definitions but are not
//! bit-identical to any particular library, so tests compare structure
//! (dimensions, uniformity, contrast, edge preservation), never raw bytes.
//!
//! All functions here are CPU-bound and synchronous; [`normalize_async`]
//! moves the work onto the blocking thread pool.

use crate::error::PipelineError;
use image::{DynamicImage, GrayImage, ImageReader, Luma, RgbImage};
use std::io::{Cursor, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Non-local-means filter strength.
pub const NLM_STRENGTH: f32 = 3.0;

/// Side of the square patch compared by the NL-means filter.
pub const NLM_TEMPLATE_WINDOW: usize = 7;

/// Side of the square neighbourhood searched for similar patches.
pub const NLM_SEARCH_WINDOW: usize = 21;

/// Patch weights below this are treated as zero.
const NLM_MIN_WEIGHT: f32 = 0.001;

/// Unsharp-style sharpening kernel.
pub const SHARPEN_KERNEL: [[i32; 3]; 3] = [[-1, -1, -1], [-1, 9, -1], [-1, -1, -1]];

/// CLAHE histogram clip limit, relative to a flat histogram.
pub const CLAHE_CLIP_LIMIT: f32 = 2.0;

/// CLAHE tiles per axis.
pub const CLAHE_GRID: u32 = 8;

/// Grayscale, denoised, sharpened, contrast-equalised bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage(GrayImage);

impl NormalizedImage {
    /// Wrap a bitmap that was already normalised elsewhere.
    pub fn from_gray(image: GrayImage) -> Self {
        Self(image)
    }

    pub fn as_gray(&self) -> &GrayImage {
        &self.0
    }

    pub fn into_gray(self) -> GrayImage {
        self.0
    }

    pub fn width(&self) -> u32 {
        self.0.width()
    }

    pub fn height(&self) -> u32 {
        self.0.height()
    }

    /// Lossless PNG encoding, for OCR engines that take encoded bytes.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let mut buf = Vec::new();
        self.0.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;
        debug!(
            "Encoded {}x{} normalised image → {} bytes PNG",
            self.0.width(),
            self.0.height(),
            buf.len()
        );
        Ok(buf)
    }
}

/// Decode the file at `path` and run the full normalisation chain.
pub fn normalize(path: &Path) -> Result<NormalizedImage, PipelineError> {
    let source = decode(path)?;
    debug!(
        "Decoded {} → {}x{} px",
        path.display(),
        source.width(),
        source.height()
    );
    Ok(normalize_image(&source))
}

/// [`normalize`] on the blocking thread pool.
pub async fn normalize_async(path: PathBuf) -> Result<NormalizedImage, PipelineError> {
    tokio::task::spawn_blocking(move || normalize(&path))
        .await
        .map_err(|e| PipelineError::Internal(format!("Normalize task panicked: {}", e)))?
}

/// Run the normalisation chain on an already decoded image.
pub fn normalize_image(source: &DynamicImage) -> NormalizedImage {
    let gray = to_grayscale(&source.to_rgb8());
    let denoised = denoise_nl_means(&gray, NLM_STRENGTH, NLM_TEMPLATE_WINDOW, NLM_SEARCH_WINDOW);
    let sharpened = sharpen(&denoised);
    NormalizedImage(clahe(&sharpened, CLAHE_CLIP_LIMIT, CLAHE_GRID))
}

/// Decode an image file, sniffing the format from its content.
///
/// A `.txt` file holding PNG bytes decodes fine; a `.png` holding garbage
/// is an [`PipelineError::ImageDecode`].
pub fn decode(path: &Path) -> Result<DynamicImage, PipelineError> {
    let reader = ImageReader::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => PipelineError::ImageNotFound {
            path: path.to_path_buf(),
        },
        ErrorKind::PermissionDenied => PipelineError::PermissionDenied {
            path: path.to_path_buf(),
        },
        _ => PipelineError::ImageDecode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        },
    })?;

    let image = reader
        .with_guessed_format()
        .map_err(|e| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?
        .decode()
        .map_err(|e| PipelineError::ImageDecode {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;

    if image.width() == 0 || image.height() == 0 {
        return Err(PipelineError::ImageDecode {
            path: path.to_path_buf(),
            detail: "image has zero width or height".into(),
        });
    }
    Ok(image)
}

// ═══════════════════════════════════════════════════════════
// Grayscale
// ═══════════════════════════════════════════════════════════

/// ITU-R BT.601 luma, rounded.
pub fn to_grayscale(rgb: &RgbImage) -> GrayImage {
    let mut gray = GrayImage::new(rgb.width(), rgb.height());
    for (x, y, p) in rgb.enumerate_pixels() {
        let luma = 0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32;
        gray.put_pixel(x, y, Luma([luma.round().clamp(0.0, 255.0) as u8]));
    }
    gray
}

// ═══════════════════════════════════════════════════════════
// Non-local-means denoising
// ═══════════════════════════════════════════════════════════

/// Non-local-means denoising of a grayscale image.
///
/// Every output pixel is a weighted mean of the pixels in its
/// `search_window`² neighbourhood, weighted by how similar the
/// `template_window`² patch around each candidate is to the patch around
/// the pixel itself: `w = exp(-mse / h²)`.
///
/// Patch distances are computed one search offset at a time from an
/// integral image of squared differences, so the cost is
/// O(pixels × search_window²) rather than an extra factor of the patch area.
/// Borders are reflected (reflect-101).
pub fn denoise_nl_means(
    img: &GrayImage,
    h: f32,
    template_window: usize,
    search_window: usize,
) -> GrayImage {
    let (w, ht) = (img.width() as usize, img.height() as usize);
    if w == 0 || ht == 0 || h <= 0.0 {
        return img.clone();
    }

    let tr = template_window / 2;
    let sr = search_window / 2;
    let tw = 2 * tr + 1;
    let border = tr + sr;
    let (pw, ph) = (w + 2 * border, ht + 2 * border);

    let mut padded = Vec::with_capacity(pw * ph);
    for py in 0..ph {
        let sy = reflect101(py as isize - border as isize, ht as isize) as u32;
        for px in 0..pw {
            let sx = reflect101(px as isize - border as isize, w as isize) as u32;
            padded.push(img.get_pixel(sx, sy).0[0] as i32);
        }
    }

    // Weight lookup by integer patch SSD; anything past the table is ~0.
    let area = (tw * tw) as f32;
    let h2 = h * h;
    let max_ssd = (-(NLM_MIN_WEIGHT.ln()) * h2 * area).ceil() as usize;
    let weight_lut: Vec<f32> = (0..=max_ssd)
        .map(|ssd| (-(ssd as f32 / area) / h2).exp())
        .collect();

    // Squared differences span every patch row/column: (ht + 2tr) × (w + 2tr).
    let (dw, dh) = (w + 2 * tr, ht + 2 * tr);
    let iw = dw + 1;
    let mut integral = vec![0u64; iw * (dh + 1)];
    let mut num = vec![0f32; w * ht];
    let mut den = vec![0f32; w * ht];

    let sr_i = sr as isize;
    for dy in -sr_i..=sr_i {
        for dx in -sr_i..=sr_i {
            for r in 0..dh {
                let mut row_sum = 0u64;
                let a_row = (r + sr) * pw;
                let b_row = ((r + sr) as isize + dy) as usize * pw;
                for c in 0..dw {
                    let a = padded[a_row + c + sr];
                    let b = padded[b_row + ((c + sr) as isize + dx) as usize];
                    let d = (a - b) as i64;
                    row_sum += (d * d) as u64;
                    integral[(r + 1) * iw + c + 1] = integral[r * iw + c + 1] + row_sum;
                }
            }

            for y in 0..ht {
                for x in 0..w {
                    let ssd = integral[(y + tw) * iw + x + tw] + integral[y * iw + x]
                        - integral[y * iw + x + tw]
                        - integral[(y + tw) * iw + x];
                    let Some(&weight) = weight_lut.get(ssd as usize) else {
                        continue;
                    };
                    if weight < NLM_MIN_WEIGHT {
                        continue;
                    }
                    let sy = ((y + border) as isize + dy) as usize;
                    let sx = ((x + border) as isize + dx) as usize;
                    let i = y * w + x;
                    num[i] += weight * padded[sy * pw + sx] as f32;
                    den[i] += weight;
                }
            }
        }
    }

    let mut out = GrayImage::new(w as u32, ht as u32);
    for (i, pixel) in out.pixels_mut().enumerate() {
        // The zero offset always contributes weight 1, so den ≥ 1.
        let v = num[i] / den[i].max(f32::EPSILON);
        *pixel = Luma([v.round().clamp(0.0, 255.0) as u8]);
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Sharpening
// ═══════════════════════════════════════════════════════════

/// Apply [`SHARPEN_KERNEL`].
pub fn sharpen(img: &GrayImage) -> GrayImage {
    convolve3x3(img, &SHARPEN_KERNEL)
}

/// Saturating 3×3 convolution with reflect-101 borders.
pub fn convolve3x3(img: &GrayImage, kernel: &[[i32; 3]; 3]) -> GrayImage {
    let (w, h) = (img.width() as isize, img.height() as isize);
    let mut out = GrayImage::new(img.width(), img.height());
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0i32;
            for (ky, row) in kernel.iter().enumerate() {
                let sy = reflect101(y + ky as isize - 1, h) as u32;
                for (kx, k) in row.iter().enumerate() {
                    let sx = reflect101(x + kx as isize - 1, w) as u32;
                    acc += k * img.get_pixel(sx, sy).0[0] as i32;
                }
            }
            out.put_pixel(x as u32, y as u32, Luma([acc.clamp(0, 255) as u8]));
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Contrast-limited adaptive histogram equalisation
// ═══════════════════════════════════════════════════════════

/// CLAHE over a `grid`×`grid` tile layout.
///
/// Each tile gets its own equalisation table built from a histogram whose
/// bins are clipped at `clip_limit × tile_area / 256` (the clipped excess is
/// spread over all bins). Output pixels blend the tables of the four nearest
/// tile centres bilinearly, which hides tile seams.
pub fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (w, h) = (img.width(), img.height());
    if w == 0 || h == 0 {
        return img.clone();
    }
    let gx = grid.clamp(1, w);
    let gy = grid.clamp(1, h);
    let span = |t: u32, n: u32, g: u32| (t * n / g, (t + 1) * n / g);

    let mut luts = Vec::with_capacity((gx * gy) as usize);
    for ty in 0..gy {
        let (y0, y1) = span(ty, h, gy);
        for tx in 0..gx {
            let (x0, x1) = span(tx, w, gx);
            let mut hist = [0u32; 256];
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[img.get_pixel(x, y).0[0] as usize] += 1;
                }
            }
            luts.push(tile_lut(&mut hist, (x1 - x0) * (y1 - y0), clip_limit));
        }
    }

    let tile_w = w as f32 / gx as f32;
    let tile_h = h as f32 / gy as f32;
    let neighbours = |pos: u32, tile: f32, tiles: u32| {
        let f = (pos as f32 + 0.5) / tile - 0.5;
        let lo = f.floor();
        let frac = f - lo;
        let lo = lo as i64;
        let clamp = |t: i64| t.clamp(0, tiles as i64 - 1) as usize;
        (clamp(lo), clamp(lo + 1), frac)
    };

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        let (ty0, ty1, fy) = neighbours(y, tile_h, gy);
        for x in 0..w {
            let (tx0, tx1, fx) = neighbours(x, tile_w, gx);
            let v = img.get_pixel(x, y).0[0] as usize;
            let lut = |ty: usize, tx: usize| luts[ty * gx as usize + tx][v] as f32;
            let top = lut(ty0, tx0) * (1.0 - fx) + lut(ty0, tx1) * fx;
            let bottom = lut(ty1, tx0) * (1.0 - fx) + lut(ty1, tx1) * fx;
            let value = top * (1.0 - fy) + bottom * fy;
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }
    out
}

/// Clip `hist`, redistribute the excess, and return the cumulative mapping.
fn tile_lut(hist: &mut [u32; 256], area: u32, clip_limit: f32) -> [u8; 256] {
    let mut lut = [0u8; 256];
    if area == 0 {
        return lut;
    }

    if clip_limit > 0.0 {
        let limit = ((clip_limit * area as f32 / 256.0) as u32).max(1);
        let mut excess = 0u32;
        for bin in hist.iter_mut() {
            if *bin > limit {
                excess += *bin - limit;
                *bin = limit;
            }
        }

        let batch = excess / 256;
        let mut residual = excess % 256;
        for bin in hist.iter_mut() {
            *bin += batch;
        }
        if residual > 0 {
            let step = (256 / residual).max(1) as usize;
            let mut i = 0;
            while i < 256 && residual > 0 {
                hist[i] += 1;
                residual -= 1;
                i += step;
            }
        }
    }

    let scale = 255.0 / area as f32;
    let mut sum = 0u32;
    for (entry, bin) in lut.iter_mut().zip(hist.iter()) {
        sum += bin;
        *entry = (sum as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

/// Reflect an out-of-range index back into `0..n`, excluding the edge
/// pixel itself (`gfedcb|abcdefgh|gfedcba`).
fn reflect101(mut i: isize, n: isize) -> usize {
    if n <= 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * n - 2 - i;
        } else {
            return i as usize;
        }
    }
}
