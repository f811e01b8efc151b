use std::io::Cursor;

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::contours::find_contours;
use imageproc::contrast::{adaptive_threshold, equalize_histogram, otsu_level};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, warp, Interpolation, Projection};
use imageproc::morphology::{close, open};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PreprocessOptions;
use crate::types::{PreprocessedImage, QualityProbe, RawImage};

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("invalid image payload: {0}")]
    Invalid(String),
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to encode processed image: {0}")]
    Encode(String),
}

/// A stage that could not run on this particular image. Logged and skipped —
/// never fatal to the job.
#[derive(Debug, Error)]
#[error("{0}")]
struct StageError(String);

const GAMMA: f32 = 0.9;
const CLAHE_GRID: u32 = 8;
const CLAHE_CLIP: f32 = 4.0;
const BILATERAL_RADIUS: u32 = 2;
const BILATERAL_RANGE_SIGMA: f32 = 25.0;
const INK_THRESHOLD: u8 = 128;

/// Normalize an arbitrary input photo into the form recognition engines
/// perform best on. Only a structurally invalid or undecodable payload
/// fails; every enhancement stage degrades to a no-op on trouble.
pub fn preprocess(
    raw: &RawImage,
    options: &PreprocessOptions,
) -> Result<PreprocessedImage, PreprocessError> {
    validate_payload(&raw.bytes, options)?;

    let decoded = decode(raw)?;
    let decoded = downscale_if_oversized(decoded, options.max_dimension);
    let mut gray: GrayImage = decoded.to_luma8();

    // Measured on the decoded input, before any enhancement touches it.
    let quality = measure_quality(&gray);

    let stages: [(&'static str, bool, fn(&GrayImage) -> Result<GrayImage, StageError>); 7] = [
        ("perspective", options.perspective_correction, correct_perspective),
        ("orientation", options.orientation_correction, correct_orientation),
        ("illumination", options.illumination_flattening, flatten_illumination),
        ("denoise", options.denoise, denoise_bilateral),
        ("contrast", options.contrast_enhancement, enhance_contrast),
        ("binarize", options.adaptive_binarization, binarize_adaptive),
        ("morphology", options.morphological_cleanup, morphological_cleanup),
    ];

    let mut applied = Vec::new();
    for (name, enabled, stage) in stages {
        if !enabled {
            continue;
        }
        match stage(&gray) {
            Ok(next) => {
                gray = next;
                applied.push(name);
            }
            Err(e) => warn!(stage = name, error = %e, "preprocess stage skipped"),
        }
    }

    debug!(
        width = gray.width(),
        height = gray.height(),
        stages = ?applied,
        blur = quality.blur_score,
        "image preprocessed"
    );

    let (width, height) = (gray.width(), gray.height());
    let png = encode_png(gray)?;
    Ok(PreprocessedImage::new(png, width, height, quality, applied))
}

fn validate_payload(bytes: &[u8], options: &PreprocessOptions) -> Result<(), PreprocessError> {
    if bytes.len() < options.min_bytes {
        return Err(PreprocessError::Invalid(format!(
            "{} bytes is too small to be a valid image",
            bytes.len()
        )));
    }
    if bytes.len() > options.max_bytes {
        return Err(PreprocessError::Invalid(format!(
            "{} bytes exceeds the {} byte limit",
            bytes.len(),
            options.max_bytes
        )));
    }
    Ok(())
}

fn decode(raw: &RawImage) -> Result<DynamicImage, PreprocessError> {
    // The declared format is a hint; fall back to content sniffing before
    // giving up, since upload layers routinely mislabel camera output.
    match image::load_from_memory_with_format(&raw.bytes, raw.format.hint()) {
        Ok(img) => Ok(img),
        Err(_) => Ok(image::load_from_memory(&raw.bytes)?),
    }
}

fn downscale_if_oversized(img: DynamicImage, max_dimension: u32) -> DynamicImage {
    if img.width() > max_dimension || img.height() > max_dimension {
        img.resize(max_dimension, max_dimension, image::imageops::FilterType::Lanczos3)
    } else {
        img
    }
}

fn encode_png(gray: GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    DynamicImage::ImageLuma8(gray)
        .write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

// ── Stage 1: perspective correction ──────────────────────────────────────────

/// Find the document's quadrilateral boundary and warp it front-facing.
/// Bails out (skipping the stage) when no confident quadrilateral exists.
fn correct_perspective(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let (w, h) = (gray.width(), gray.height());
    if w < 64 || h < 64 {
        return Err(StageError("image too small for contour detection".into()));
    }

    let level = otsu_level(gray);
    let binary: GrayImage = ImageBuffer::from_fn(w, h, |x, y| {
        if gray.get_pixel(x, y)[0] > level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    });

    let contours = find_contours::<i32>(&binary);
    let largest = contours
        .iter()
        .max_by_key(|c| {
            let (min_x, max_x, min_y, max_y) = bounds(&c.points);
            ((max_x - min_x) as i64) * ((max_y - min_y) as i64)
        })
        .ok_or_else(|| StageError("no contours found".into()))?;

    let corners = extreme_corners(&largest.points)
        .ok_or_else(|| StageError("degenerate contour".into()))?;
    let quad_area = shoelace_area(&corners);
    let image_area = (w as f64) * (h as f64);

    // Too small a quad means we latched onto a text block, not the page;
    // nearly the full frame means there is nothing to correct.
    if quad_area < 0.30 * image_area {
        return Err(StageError("no confident document quadrilateral".into()));
    }
    if quad_area > 0.95 * image_area {
        return Ok(gray.clone());
    }

    let [tl, tr, br, bl] = corners;
    let dst_w = distance(tl, tr).max(distance(bl, br)).round().clamp(16.0, w as f32) as u32;
    let dst_h = distance(tl, bl).max(distance(tr, br)).round().clamp(16.0, h as f32) as u32;

    let projection = Projection::from_control_points(
        [tl, tr, br, bl],
        [
            (0.0, 0.0),
            (dst_w as f32 - 1.0, 0.0),
            (dst_w as f32 - 1.0, dst_h as f32 - 1.0),
            (0.0, dst_h as f32 - 1.0),
        ],
    )
    .ok_or_else(|| StageError("quadrilateral is not invertible".into()))?;

    let warped = warp(gray, &projection, Interpolation::Bilinear, Luma([255u8]));
    Ok(image::imageops::crop_imm(&warped, 0, 0, dst_w, dst_h).to_image())
}

fn bounds(points: &[imageproc::point::Point<i32>]) -> (i32, i32, i32, i32) {
    let mut min_x = i32::MAX;
    let mut max_x = i32::MIN;
    let mut min_y = i32::MAX;
    let mut max_y = i32::MIN;
    for p in points {
        min_x = min_x.min(p.x);
        max_x = max_x.max(p.x);
        min_y = min_y.min(p.y);
        max_y = max_y.max(p.y);
    }
    (min_x, max_x, min_y, max_y)
}

/// Corner picks by the diagonal extremes: top-left minimizes x+y, bottom-right
/// maximizes it, top-right maximizes x-y, bottom-left minimizes it.
fn extreme_corners(points: &[imageproc::point::Point<i32>]) -> Option<[(f32, f32); 4]> {
    if points.len() < 4 {
        return None;
    }
    let mut tl = points[0];
    let mut tr = points[0];
    let mut br = points[0];
    let mut bl = points[0];
    for p in points {
        if p.x + p.y < tl.x + tl.y {
            tl = *p;
        }
        if p.x + p.y > br.x + br.y {
            br = *p;
        }
        if p.x - p.y > tr.x - tr.y {
            tr = *p;
        }
        if p.x - p.y < bl.x - bl.y {
            bl = *p;
        }
    }
    let corners = [
        (tl.x as f32, tl.y as f32),
        (tr.x as f32, tr.y as f32),
        (br.x as f32, br.y as f32),
        (bl.x as f32, bl.y as f32),
    ];
    // All four must be distinct for the warp to mean anything.
    for i in 0..4 {
        for j in (i + 1)..4 {
            if corners[i] == corners[j] {
                return None;
            }
        }
    }
    Some(corners)
}

fn shoelace_area(corners: &[(f32, f32); 4]) -> f64 {
    let mut sum = 0.0f64;
    for i in 0..4 {
        let (x1, y1) = corners[i];
        let (x2, y2) = corners[(i + 1) % 4];
        sum += (x1 as f64) * (y2 as f64) - (x2 as f64) * (y1 as f64);
    }
    (sum / 2.0).abs()
}

fn distance(a: (f32, f32), b: (f32, f32)) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

// ── Stage 2: orientation correction ──────────────────────────────────────────

/// Rotate to upright using text-line direction. Text lines produce a spiky
/// row-projection profile; a sideways page shows that spikiness only after a
/// 90° turn. Ambiguous profiles fall back to 0°.
fn correct_orientation(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let (w, h) = (gray.width(), gray.height());
    if w < 50 || h < 50 {
        return Err(StageError("image too small for orientation analysis".into()));
    }

    let upright = row_profile_variance(gray);
    let rotated90 = image::imageops::rotate90(gray);
    let sideways = row_profile_variance(&rotated90);

    let mut working = if sideways > upright * 1.5 && sideways > 0.0 {
        debug!(upright, sideways, "rotating image 90 degrees");
        rotated90
    } else {
        gray.clone()
    };

    if let Some(angle) = detect_skew_angle(&working) {
        debug!(angle, "deskewing image");
        let theta = -angle.to_radians();
        working = rotate_about_center(&working, theta, Interpolation::Bilinear, Luma([255u8]));
    }

    Ok(working)
}

/// Variance of per-row ink counts; high when dark pixels cluster into
/// horizontal lines.
fn row_profile_variance(gray: &GrayImage) -> f64 {
    let (w, h) = (gray.width(), gray.height());
    let mut counts = Vec::with_capacity(h as usize);
    for y in 0..h {
        let mut count = 0u32;
        let mut x = 0u32;
        while x < w {
            if gray.get_pixel(x, y)[0] < INK_THRESHOLD {
                count += 1;
            }
            x += 4;
        }
        counts.push(count as f64);
    }
    variance(&counts)
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64
}

/// Projection-profile skew estimate over ±5°. The candidate angle whose
/// un-skewed row projection has the crispest transitions wins. `None` when
/// the page is straight or has too little ink to judge.
pub(crate) fn detect_skew_angle(gray: &GrayImage) -> Option<f32> {
    let (w, h) = (gray.width(), gray.height());
    if w < 50 || h < 50 {
        return None;
    }

    let dark = gray.pixels().filter(|p| p[0] < INK_THRESHOLD).count();
    if (dark as f32) / ((w * h) as f32) < 0.02 {
        return None;
    }

    let mut best_angle = 0.0f32;
    let mut best_score = f64::NEG_INFINITY;
    let mut angle = -5.0f32;
    while angle <= 5.0 {
        let score = projection_transition_score(gray, angle);
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
        angle += 0.25;
    }

    if best_angle.abs() < 0.5 {
        None
    } else {
        Some(best_angle)
    }
}

fn projection_transition_score(gray: &GrayImage, angle_deg: f32) -> f64 {
    let (w, h) = (gray.width(), gray.height());
    let tan_a = (angle_deg.to_radians()).tan() as f64;
    let mut projection = vec![0u32; h as usize];

    for y in 0..h {
        let shift = (y as f64 * tan_a).round() as i64;
        let mut count = 0u32;
        let mut x = 0u32;
        // Subsample columns; the profile shape is what matters.
        while x < w {
            let sx = x as i64 + shift;
            if sx >= 0 && (sx as u32) < w && gray.get_pixel(sx as u32, y)[0] < INK_THRESHOLD {
                count += 1;
            }
            x += 4;
        }
        projection[y as usize] = count;
    }

    let mut score = 0.0f64;
    for pair in projection.windows(2) {
        let diff = pair[1] as f64 - pair[0] as f64;
        score += diff * diff;
    }
    score
}

// ── Stage 3: illumination flattening ─────────────────────────────────────────

/// Estimate the low-frequency illumination field with a heavy blur and
/// subtract it, re-centering on the field's mean so paper stays light.
fn flatten_illumination(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let (w, h) = (gray.width(), gray.height());
    if w < 16 || h < 16 {
        return Err(StageError("image too small for illumination estimation".into()));
    }

    let sigma = ((w.min(h) as f32) / 16.0).clamp(8.0, 40.0);
    let field = gaussian_blur_f32(gray, sigma);

    let mean = field.pixels().map(|p| p[0] as u64).sum::<u64>() / ((w as u64) * (h as u64));
    let mean = mean as i32;

    Ok(ImageBuffer::from_fn(w, h, |x, y| {
        let p = gray.get_pixel(x, y)[0] as i32;
        let b = field.get_pixel(x, y)[0] as i32;
        Luma([(p - b + mean).clamp(0, 255) as u8])
    }))
}

// ── Stage 4: denoising ────────────────────────────────────────────────────────

/// Edge-preserving bilateral smoothing: neighbors weigh in proportionally to
/// how similar their intensity is, so speckle averages out while character
/// edges stay put.
fn denoise_bilateral(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let (w, h) = (gray.width(), gray.height());
    if w < 8 || h < 8 {
        return Err(StageError("image too small to denoise".into()));
    }

    let radius = BILATERAL_RADIUS;
    let sigma_sq_2 = 2.0 * BILATERAL_RANGE_SIGMA * BILATERAL_RANGE_SIGMA;
    let mut out = GrayImage::new(w, h);

    for y in 0..h {
        for x in 0..w {
            let center = gray.get_pixel(x, y)[0] as f32;
            let mut sum = 0.0f32;
            let mut weight_sum = 0.0f32;

            let y0 = y.saturating_sub(radius);
            let y1 = (y + radius + 1).min(h);
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius + 1).min(w);

            for ny in y0..y1 {
                for nx in x0..x1 {
                    let v = gray.get_pixel(nx, ny)[0] as f32;
                    let d = v - center;
                    let weight = (-(d * d) / sigma_sq_2).exp();
                    sum += v * weight;
                    weight_sum += weight;
                }
            }

            let value = if weight_sum > 0.0 { sum / weight_sum } else { center };
            out.put_pixel(x, y, Luma([value.round().clamp(0.0, 255.0) as u8]));
        }
    }

    Ok(out)
}

// ── Stage 5: contrast enhancement ─────────────────────────────────────────────

/// Clip-limited local histogram equalization plus gamma correction. Images
/// too small to tile get the global equalizer instead.
fn enhance_contrast(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let (w, h) = (gray.width(), gray.height());
    if w == 0 || h == 0 {
        return Err(StageError("empty image".into()));
    }

    let equalized = if w < CLAHE_GRID * 4 || h < CLAHE_GRID * 4 {
        equalize_histogram(gray)
    } else {
        clahe(gray, CLAHE_GRID, CLAHE_CLIP)
    };

    let lut: Vec<u8> = (0..256)
        .map(|v| (255.0 * (v as f32 / 255.0).powf(GAMMA)).round() as u8)
        .collect();
    Ok(ImageBuffer::from_fn(w, h, |x, y| {
        Luma([lut[equalized.get_pixel(x, y)[0] as usize]])
    }))
}

/// Tile-based clip-limited adaptive histogram equalization with bilinear
/// interpolation between neighboring tile mappings.
fn clahe(gray: &GrayImage, grid: u32, clip: f32) -> GrayImage {
    let (w, h) = (gray.width(), gray.height());
    let tile_w = w.div_ceil(grid);
    let tile_h = h.div_ceil(grid);

    // One intensity mapping per tile.
    let mut maps: Vec<[u8; 256]> = Vec::with_capacity((grid * grid) as usize);
    for ty in 0..grid {
        for tx in 0..grid {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(w);
            let y1 = (y0 + tile_h).min(h);

            let mut hist = [0u32; 256];
            let mut total = 0u32;
            for y in y0..y1 {
                for x in x0..x1 {
                    hist[gray.get_pixel(x, y)[0] as usize] += 1;
                    total += 1;
                }
            }
            if total == 0 {
                maps.push(std::array::from_fn(|v| v as u8));
                continue;
            }

            // Clip spikes and spread the excess uniformly.
            let limit = ((clip * total as f32 / 256.0).max(1.0)) as u32;
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > limit {
                    excess += *bin - limit;
                    *bin = limit;
                }
            }
            let bump = excess / 256;
            for bin in hist.iter_mut() {
                *bin += bump;
            }

            let mut map = [0u8; 256];
            let mut cdf = 0u64;
            for (v, bin) in hist.iter().enumerate() {
                cdf += *bin as u64;
                map[v] = ((cdf * 255) / total as u64).min(255) as u8;
            }
            maps.push(map);
        }
    }

    let tile_at = |tx: u32, ty: u32| -> &[u8; 256] { &maps[(ty * grid + tx) as usize] };

    ImageBuffer::from_fn(w, h, |x, y| {
        let v = gray.get_pixel(x, y)[0] as usize;

        // Continuous tile coordinates centered on tile midpoints.
        let fx = (x as f32 / tile_w as f32 - 0.5).max(0.0);
        let fy = (y as f32 / tile_h as f32 - 0.5).max(0.0);
        let tx0 = (fx as u32).min(grid - 1);
        let ty0 = (fy as u32).min(grid - 1);
        let tx1 = (tx0 + 1).min(grid - 1);
        let ty1 = (ty0 + 1).min(grid - 1);
        let wx = fx - tx0 as f32;
        let wy = fy - ty0 as f32;

        let top = tile_at(tx0, ty0)[v] as f32 * (1.0 - wx) + tile_at(tx1, ty0)[v] as f32 * wx;
        let bottom = tile_at(tx0, ty1)[v] as f32 * (1.0 - wx) + tile_at(tx1, ty1)[v] as f32 * wx;
        let value = top * (1.0 - wy) + bottom * wy;
        Luma([value.round().clamp(0.0, 255.0) as u8])
    })
}

// ── Stage 6: adaptive binarization ───────────────────────────────────────────

/// Locally adaptive threshold; the per-region decision tolerates lighting
/// gradients a global Otsu cut would smear.
fn binarize_adaptive(gray: &GrayImage) -> Result<GrayImage, StageError> {
    let min_dim = gray.width().min(gray.height());
    if min_dim < 16 {
        return Err(StageError("image too small for adaptive threshold".into()));
    }
    let block_radius = (min_dim / 20).clamp(7, 25);
    Ok(adaptive_threshold(gray, block_radius))
}

// ── Stage 7: morphological cleanup ───────────────────────────────────────────

/// Opening removes speckle, closing reconnects broken strokes. Small L1
/// kernel so character shapes survive.
fn morphological_cleanup(gray: &GrayImage) -> Result<GrayImage, StageError> {
    if gray.width() < 8 || gray.height() < 8 {
        return Err(StageError("image too small for morphology".into()));
    }
    let opened = open(gray, Norm::L1, 1);
    Ok(close(&opened, Norm::L1, 1))
}

// ── Quality probes ────────────────────────────────────────────────────────────

fn measure_quality(gray: &GrayImage) -> QualityProbe {
    QualityProbe {
        blur_score: laplacian_variance(gray),
        contrast_score: rms_contrast(gray),
        skew_angle: detect_skew_angle(gray),
    }
}

/// Laplacian variance; the standard sharpness metric. Blurry documents sit
/// under ~100, crisp text well above 500.
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    if w < 3 || h < 3 {
        return 0.0;
    }

    let mut sum = 0.0f64;
    let mut sum_sq = 0.0f64;
    let mut count = 0u64;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let at = |dx: i64, dy: i64| gray.get_pixel((x + dx) as u32, (y + dy) as u32)[0] as f64;
            let lap = at(0, -1) + at(0, 1) + at(-1, 0) + at(1, 0) - 4.0 * at(0, 0);
            sum += lap;
            sum_sq += lap * lap;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    let mean = sum / count as f64;
    ((sum_sq / count as f64) - mean * mean).max(0.0) as f32
}

fn rms_contrast(gray: &GrayImage) -> f32 {
    let values: Vec<f64> = gray.pixels().map(|p| p[0] as f64).collect();
    variance(&values).sqrt() as f32
}

// ── Tests ─────────────────────────────────────────────────────────────────────
