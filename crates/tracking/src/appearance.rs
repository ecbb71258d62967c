//! Appearance signature of the tracked subject's torso and the gate that
//! compares new frames against it.
//!
//! A signature is an L2-normalized RGB histogram plus the torso's dominant
//! colors found by k-means. Two signatures are compared by averaging the
//! histogram correlation with a color-distance similarity.

use image::{RgbImage, imageops};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pose::TorsoKeypoints;

/// Euclidean distance between black and white in RGB space.
pub const MAX_COLOR_DISTANCE: f32 = 441.67;

#[derive(Debug, Error, PartialEq)]
pub enum CalibrationError {
    #[error("keypoint ({x:.3}, {y:.3}) lies outside the frame")]
    KeypointOutOfFrame { x: f32, y: f32 },
    #[error("torso region {width}x{height} is empty")]
    EmptyRegion { width: u32, height: u32 },
    #[error("dominant colors need at least {needed} pixels, torso has {available}")]
    TooFewPixels { needed: usize, available: usize },
    #[error("k-means did not converge within {iterations} iterations")]
    NotConverged { iterations: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct GateConfig {
    /// When false no signature is compared and tracking is never gated.
    pub enabled: bool,
    /// Scores at or below this value reject the frame.
    pub threshold: f32,
    /// Score every Nth processed frame.
    pub score_interval: u64,
    pub histogram_bins: usize,
    pub clusters: usize,
    pub max_iterations: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: 0.4,
            score_interval: 30,
            histogram_bins: 8,
            clusters: 3,
            max_iterations: 100,
        }
    }
}

/// Joint RGB histogram with `bins^3` cells, L2-normalized.
#[derive(Clone, Debug, PartialEq)]
pub struct ColorHistogram {
    bins: usize,
    cells: Vec<f32>,
}

impl ColorHistogram {
    pub fn from_image(image: &RgbImage, bins: usize) -> Self {
        let bins = bins.clamp(1, 256);
        let mut cells = vec![0.0f32; bins * bins * bins];
        let bin = |v: u8| usize::from(v) * bins / 256;
        for pixel in image.pixels() {
            let [r, g, b] = pixel.0;
            cells[(bin(r) * bins + bin(g)) * bins + bin(b)] += 1.0;
        }
        let norm = cells.iter().map(|c| c * c).sum::<f32>().sqrt();
        if norm > 0.0 {
            cells.iter_mut().for_each(|c| *c /= norm);
        }
        Self { bins, cells }
    }

    /// Pearson correlation of the cell values, in `[-1, 1]`.
    pub fn correlation(&self, other: &ColorHistogram) -> f32 {
        if self.bins != other.bins || self.cells.is_empty() {
            return 0.0;
        }
        let n = self.cells.len() as f64;
        let mean_a = self.cells.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let mean_b = other.cells.iter().map(|&v| f64::from(v)).sum::<f64>() / n;
        let (mut cov, mut var_a, mut var_b) = (0.0f64, 0.0f64, 0.0f64);
        for (&a, &b) in self.cells.iter().zip(&other.cells) {
            let da = f64::from(a) - mean_a;
            let db = f64::from(b) - mean_b;
            cov += da * db;
            var_a += da * da;
            var_b += db * db;
        }
        let denom = (var_a * var_b).sqrt();
        if denom == 0.0 {
            // Two uniform histograms are the same distribution.
            return if var_a == var_b { 1.0 } else { 0.0 };
        }
        (cov / denom) as f32
    }
}

/// Cluster centre and the number of pixels assigned to it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DominantColor {
    pub rgb: [f32; 3],
    pub population: usize,
}

/// The `k` dominant colors of `image`, most populous first.
///
/// Seeds are taken at evenly spaced luminance quantiles so results are
/// deterministic. Clusters that lose all pixels keep their previous centre.
pub fn dominant_colors(
    image: &RgbImage,
    k: usize,
    max_iterations: usize,
) -> Result<Vec<DominantColor>, CalibrationError> {
    let pixels: Vec<[f32; 3]> = image
        .pixels()
        .map(|p| [f32::from(p[0]), f32::from(p[1]), f32::from(p[2])])
        .collect();
    let k = k.max(1);
    if pixels.len() < k {
        return Err(CalibrationError::TooFewPixels {
            needed: k,
            available: pixels.len(),
        });
    }

    let mut by_luminance: Vec<usize> = (0..pixels.len()).collect();
    by_luminance.sort_by(|&a, &b| luminance(pixels[a]).total_cmp(&luminance(pixels[b])));
    let mut centres: Vec<[f32; 3]> = (0..k)
        .map(|i| pixels[by_luminance[(2 * i + 1) * pixels.len() / (2 * k)]])
        .collect();

    let mut assignment = vec![0usize; pixels.len()];
    for iteration in 0..max_iterations.max(1) {
        for (slot, pixel) in assignment.iter_mut().zip(&pixels) {
            *slot = nearest(&centres, *pixel);
        }

        let mut sums = vec![[0.0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (&cluster, pixel) in assignment.iter().zip(&pixels) {
            counts[cluster] += 1;
            for c in 0..3 {
                sums[cluster][c] += f64::from(pixel[c]);
            }
        }

        let mut shift = 0.0f32;
        for cluster in 0..k {
            if counts[cluster] == 0 {
                continue;
            }
            let n = counts[cluster] as f64;
            let updated = sums[cluster].map(|s| (s / n) as f32);
            shift = shift.max(distance(updated, centres[cluster]));
            centres[cluster] = updated;
        }

        if shift < 1e-3 {
            debug!(iteration, "k-means converged");
            let mut colors: Vec<DominantColor> = centres
                .into_iter()
                .zip(counts)
                .map(|(rgb, population)| DominantColor {
                    rgb: rgb.map(f32::round),
                    population,
                })
                .collect();
            colors.sort_by(|a, b| b.population.cmp(&a.population));
            return Ok(colors);
        }
    }

    Err(CalibrationError::NotConverged {
        iterations: max_iterations,
    })
}

fn luminance([r, g, b]: [f32; 3]) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

fn distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    a.iter()
        .zip(&b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn nearest(centres: &[[f32; 3]], pixel: [f32; 3]) -> usize {
    let mut best = 0;
    let mut best_distance = f32::INFINITY;
    for (index, centre) in centres.iter().enumerate() {
        let d = distance(*centre, pixel);
        if d < best_distance {
            best = index;
            best_distance = d;
        }
    }
    best
}

/// Crop the axis-aligned bounding box of the torso keypoints.
pub fn extract_torso(
    frame: &RgbImage,
    torso: &TorsoKeypoints,
) -> Result<RgbImage, CalibrationError> {
    let points = torso.points();
    if let Some(outside) = points.iter().find(|p| !p.in_frame()) {
        return Err(CalibrationError::KeypointOutOfFrame {
            x: outside.x,
            y: outside.y,
        });
    }

    let (w, h) = (frame.width() as f32, frame.height() as f32);
    let (mut x_min, mut x_max) = (f32::MAX, f32::MIN);
    let (mut y_min, mut y_max) = (f32::MAX, f32::MIN);
    for point in points {
        x_min = x_min.min(point.x);
        x_max = x_max.max(point.x);
        y_min = y_min.min(point.y);
        y_max = y_max.max(point.y);
    }
    let left = (x_min * w) as u32;
    let right = ((x_max * w) as u32).min(frame.width());
    let top = (y_min * h) as u32;
    let bottom = ((y_max * h) as u32).min(frame.height());

    let width = right.saturating_sub(left);
    let height = bottom.saturating_sub(top);
    if width == 0 || height == 0 {
        return Err(CalibrationError::EmptyRegion { width, height });
    }
    Ok(imageops::crop_imm(frame, left, top, width, height).to_image())
}

/// Appearance of a torso region.
#[derive(Clone, Debug, PartialEq)]
pub struct AppearanceSignature {
    pub histogram: ColorHistogram,
    pub dominant_colors: Vec<DominantColor>,
}

impl AppearanceSignature {
    pub fn from_region(region: &RgbImage, config: &GateConfig) -> Result<Self, CalibrationError> {
        Ok(Self {
            histogram: ColorHistogram::from_image(region, config.histogram_bins),
            dominant_colors: dominant_colors(region, config.clusters, config.max_iterations)?,
        })
    }

    /// `1 - mean distance / 441.67` over index-paired dominant colors.
    pub fn color_similarity(&self, other: &AppearanceSignature) -> f32 {
        let pairs = self.dominant_colors.len().min(other.dominant_colors.len());
        if pairs == 0 {
            return 0.0;
        }
        let total: f32 = self
            .dominant_colors
            .iter()
            .zip(&other.dominant_colors)
            .map(|(a, b)| distance(a.rgb, b.rgb))
            .sum();
        1.0 - total / pairs as f32 / MAX_COLOR_DISTANCE
    }

    /// Combined similarity in `[0, 1]`.
    pub fn similarity(&self, other: &AppearanceSignature) -> f32 {
        let histogram = self.histogram.correlation(&other.histogram);
        ((histogram + self.color_similarity(other)) / 2.0).clamp(0.0, 1.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum GateVerdict {
    /// No score available; track without appearance gating.
    Ungated,
    Accept(f32),
    Reject(f32),
}

/// Holds the calibrated signature and scores new frames against it.
#[derive(Clone, Debug, Default)]
pub struct AppearanceGate {
    config: GateConfig,
    signature: Option<AppearanceSignature>,
}

impl AppearanceGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            signature: None,
        }
    }

    pub fn is_calibrated(&self) -> bool {
        self.signature.is_some()
    }

    pub fn signature(&self) -> Option<&AppearanceSignature> {
        self.signature.as_ref()
    }

    /// Capture the subject's appearance. On failure the previous signature
    /// is kept.
    pub fn calibrate(
        &mut self,
        frame: &RgbImage,
        torso: &TorsoKeypoints,
    ) -> Result<(), CalibrationError> {
        let region = extract_torso(frame, torso)?;
        let signature = AppearanceSignature::from_region(&region, &self.config)?;
        info!(
            region = %format!("{}x{}", region.width(), region.height()),
            colors = ?signature.dominant_colors.iter().map(|c| c.rgb).collect::<Vec<_>>(),
            "appearance calibrated"
        );
        self.signature = Some(signature);
        Ok(())
    }

    /// Similarity of the torso in `frame` to the calibrated subject.
    pub fn score(&self, frame: &RgbImage, torso: &TorsoKeypoints) -> Option<f32> {
        let reference = self.signature.as_ref()?;
        let current = extract_torso(frame, torso)
            .and_then(|region| AppearanceSignature::from_region(&region, &self.config));
        match current {
            Ok(current) => Some(reference.similarity(&current)),
            Err(err) => {
                debug!(error = %err, "torso not scorable");
                None
            }
        }
    }

    /// Whether the given 1-based processed-frame count is due for scoring.
    pub fn is_due(&self, frame_count: u64) -> bool {
        self.config.enabled
            && self.signature.is_some()
            && frame_count % self.config.score_interval.max(1) == 0
    }

    pub fn verdict(&self, similarity: Option<f32>) -> GateVerdict {
        match similarity {
            _ if !self.config.enabled => GateVerdict::Ungated,
            None => GateVerdict::Ungated,
            Some(score) if score <= self.config.threshold => {
                warn!(
                    similarity = score,
                    threshold = self.config.threshold,
                    "subject not recognized"
                );
                GateVerdict::Reject(score)
            }
            Some(score) => GateVerdict::Accept(score),
        }
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use image::Rgb;

    use super::*;
    use crate::pose::Keypoint;

    fn whole_frame() -> TorsoKeypoints {
        TorsoKeypoints {
            left_shoulder: Keypoint::new(1.0, 0.0),
            right_shoulder: Keypoint::new(0.0, 0.0),
            left_hip: Keypoint::new(1.0, 1.0),
            right_hip: Keypoint::new(0.0, 1.0),
        }
    }

    /// Top 60% `top`, bottom 40% `bottom`.
    fn striped(top: [u8; 3], bottom: [u8; 3]) -> RgbImage {
        RgbImage::from_fn(40, 40, |_, y| if y < 24 { Rgb(top) } else { Rgb(bottom) })
    }

    #[test]
    fn identical_subject_scores_near_one() {
        let frame = striped([255, 0, 0], [0, 0, 255]);
        let mut gate = AppearanceGate::default();
        gate.calibrate(&frame, &whole_frame()).unwrap();

        let score = gate.score(&frame, &whole_frame()).unwrap();
        assert_relative_eq!(score, 1.0, epsilon = 1e-4);
        assert_eq!(gate.verdict(Some(score)), GateVerdict::Accept(score));
    }

    #[test]
    fn inverted_colors_are_rejected() {
        let mut gate = AppearanceGate::default();
        gate.calibrate(&striped([255, 0, 0], [0, 0, 255]), &whole_frame())
            .unwrap();

        let score = gate
            .score(&striped([0, 255, 255], [255, 255, 0]), &whole_frame())
            .unwrap();
        assert!(score < 0.4, "score {score}");
        assert!(matches!(gate.verdict(Some(score)), GateVerdict::Reject(_)));
    }

    #[test]
    fn dominant_colors_are_ordered_by_population() {
        let colors = dominant_colors(&striped([255, 0, 0], [0, 0, 255]), 3, 50).unwrap();
        assert_eq!(colors.len(), 3);
        assert_eq!(colors[0].rgb, [255.0, 0.0, 0.0]);
        assert_eq!(colors[0].population, 960);
        assert_eq!(colors[1].rgb, [0.0, 0.0, 255.0]);
        assert_eq!(colors[1].population, 640);
    }

    #[test]
    fn histogram_is_unit_length() {
        let histogram = ColorHistogram::from_image(&striped([10, 200, 30], [90, 90, 90]), 8);
        let norm: f32 = histogram.cells.iter().map(|c| c * c).sum::<f32>().sqrt();
        assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn keypoint_outside_frame_fails_and_keeps_signature() {
        let frame = striped([255, 0, 0], [0, 0, 255]);
        let mut gate = AppearanceGate::default();
        gate.calibrate(&frame, &whole_frame()).unwrap();
        let before = gate.signature().cloned();

        let mut torso = whole_frame();
        torso.left_hip.x = 1.2;
        let err = gate.calibrate(&frame, &torso).unwrap_err();
        assert!(matches!(err, CalibrationError::KeypointOutOfFrame { .. }));
        assert_eq!(gate.signature().cloned(), before);
    }

    #[test]
    fn degenerate_torso_is_empty_region() {
        let frame = striped([255, 0, 0], [0, 0, 255]);
        let point = Keypoint::new(0.5, 0.5);
        let torso = TorsoKeypoints {
            left_shoulder: point,
            right_shoulder: point,
            left_hip: point,
            right_hip: point,
        };
        assert!(matches!(
            extract_torso(&frame, &torso),
            Err(CalibrationError::EmptyRegion { .. })
        ));
    }

    #[test]
    fn uncalibrated_gate_never_scores() {
        let gate = AppearanceGate::default();
        let frame = striped([255, 0, 0], [0, 0, 255]);
        assert_eq!(gate.score(&frame, &whole_frame()), None);
        assert!(!gate.is_due(30));
        assert_eq!(gate.verdict(None), GateVerdict::Ungated);
    }

    #[test]
    fn disabled_gate_is_always_ungated() {
        let gate = AppearanceGate::new(GateConfig {
            enabled: false,
            ..GateConfig::default()
        });
        assert_eq!(gate.verdict(Some(0.0)), GateVerdict::Ungated);
    }

    #[test]
    fn similarity_stays_in_unit_interval() {
        let config = GateConfig::default();
        let samples = [
            striped([255, 0, 0], [0, 0, 255]),
            striped([0, 0, 0], [255, 255, 255]),
            striped([12, 200, 40], [12, 200, 40]),
            RgbImage::from_fn(40, 40, |x, y| match (x < 20, y < 20) {
                (true, true) => Rgb([250, 250, 250]),
                (true, false) => Rgb([30, 60, 90]),
                (false, true) => Rgb([200, 20, 20]),
                (false, false) => Rgb([20, 180, 20]),
            }),
        ];
        let signatures: Vec<_> = samples
            .iter()
            .map(|image| AppearanceSignature::from_region(image, &config).unwrap())
            .collect();
        for a in &signatures {
            for b in &signatures {
                let score = a.similarity(b);
                assert!((0.0..=1.0).contains(&score), "{score}");
            }
        }
    }
}
