//! Moving-average torso position and proportional follow control.

use std::collections::VecDeque;

use drone_link::{MAX_MOTION_MAGNITUDE, Motion};

use crate::pose::{FrameGeometry, TorsoKeypoints};

pub const DEFAULT_WINDOW: usize = 5;

/// Shoulder-midpoint position in pixels plus normalized torso size.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Measurement {
    pub x: f32,
    pub y: f32,
    pub size: f32,
}

impl Measurement {
    pub const fn new(x: f32, y: f32, size: f32) -> Self {
        Self { x, y, size }
    }
}

/// Fixed-capacity FIFO of recent measurements; oldest evicted first.
#[derive(Clone, Debug)]
pub struct MeasurementWindow {
    capacity: usize,
    samples: VecDeque<Measurement>,
}

impl MeasurementWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: Measurement) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-field arithmetic mean of everything currently held.
    pub fn mean(&self) -> Option<Measurement> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len() as f32;
        let sum = self
            .samples
            .iter()
            .fold(Measurement::default(), |acc, s| {
                Measurement::new(acc.x + s.x, acc.y + s.y, acc.size + s.size)
            });
        Some(Measurement::new(sum.x / n, sum.y / n, sum.size / n))
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

/// Turns raw keypoints into a smoothed position estimate.
#[derive(Clone, Debug)]
pub struct MotionEstimator {
    geometry: FrameGeometry,
    window: MeasurementWindow,
}

impl MotionEstimator {
    pub fn new(geometry: FrameGeometry, window: usize) -> Self {
        Self {
            geometry,
            window: MeasurementWindow::new(window),
        }
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn window(&self) -> &MeasurementWindow {
        &self.window
    }

    /// Convert keypoints to a pixel-space measurement without recording it.
    pub fn measure(&self, torso: &TorsoKeypoints) -> Measurement {
        let shoulders = torso.shoulder_midpoint();
        Measurement::new(
            shoulders.x * self.geometry.width as f32,
            shoulders.y * self.geometry.height as f32,
            torso.torso_size(),
        )
    }

    /// Record the keypoints' measurement and return the windowed mean.
    pub fn observe(&mut self, torso: &TorsoKeypoints) -> Measurement {
        let sample = self.measure(torso);
        self.push(sample)
    }

    pub fn push(&mut self, sample: Measurement) -> Measurement {
        self.window.push(sample);
        self.window.mean().unwrap_or(sample)
    }

    pub fn reset(&mut self) {
        self.window.clear();
    }
}

/// Proportional gain and dead-band for one axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AxisGain {
    pub gain: f32,
    pub deadband: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlGains {
    pub vertical: AxisGain,
    /// Where the shoulders should sit, as a fraction of frame height.
    pub target_height_ratio: f32,
    pub longitudinal: AxisGain,
    /// Torso size at the desired following distance.
    pub target_size: f32,
    pub yaw: AxisGain,
    /// Yaw gain grows by `1 + yaw_size_scale * size` as the subject nears.
    pub yaw_size_scale: f32,
}

impl Default for ControlGains {
    fn default() -> Self {
        Self {
            vertical: AxisGain {
                gain: 0.15,
                deadband: 40.0,
            },
            target_height_ratio: 1.0 / 3.0,
            longitudinal: AxisGain {
                gain: 1.2,
                deadband: 0.1,
            },
            target_size: 0.6,
            yaw: AxisGain {
                gain: 0.11,
                deadband: 50.0,
            },
            yaw_size_scale: 0.5,
        }
    }
}

/// Signed per-axis magnitudes; zero means no command on that axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ControlOutput {
    pub vertical: i32,
    pub longitudinal: i32,
    pub yaw: i32,
}

impl ControlOutput {
    pub fn is_hold(&self) -> bool {
        *self == Self::default()
    }

    /// Motion commands for the non-zero axes, vertical first.
    pub fn commands(&self) -> Vec<(Motion, u32)> {
        let axes = [
            (self.vertical, Motion::Up, Motion::Down),
            (self.longitudinal, Motion::Forward, Motion::Back),
            (self.yaw, Motion::Clockwise, Motion::CounterClockwise),
        ];
        axes.into_iter()
            .filter(|(magnitude, _, _)| *magnitude != 0)
            .map(|(magnitude, positive, negative)| {
                let motion = if magnitude > 0 { positive } else { negative };
                (motion, magnitude.unsigned_abs())
            })
            .collect()
    }
}

pub fn compute_control(
    estimate: Measurement,
    geometry: FrameGeometry,
    gains: &ControlGains,
) -> ControlOutput {
    let target_y = geometry.height as f32 * gains.target_height_ratio;
    let vertical_error = target_y - estimate.y;
    let longitudinal_error = gains.target_size - estimate.size;
    let yaw_error = estimate.x - geometry.width as f32 / 2.0;
    let yaw_gain = gains.yaw.gain * (1.0 + gains.yaw_size_scale * estimate.size);

    ControlOutput {
        vertical: proportional(vertical_error, gains.vertical.gain, gains.vertical.deadband),
        longitudinal: proportional(
            longitudinal_error,
            gains.longitudinal.gain * 100.0,
            gains.longitudinal.deadband,
        ),
        yaw: proportional(yaw_error, yaw_gain, gains.yaw.deadband),
    }
}

fn proportional(error: f32, gain: f32, deadband: f32) -> i32 {
    if !error.is_finite() || error.abs() <= deadband {
        return 0;
    }
    let limit = MAX_MOTION_MAGNITUDE as f32;
    (gain * error).trunc().clamp(-limit, limit) as i32
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    const HD: FrameGeometry = FrameGeometry::new(1280, 720);

    #[test]
    fn centred_subject_at_target_distance_holds() {
        let mut estimator = MotionEstimator::new(HD, DEFAULT_WINDOW);
        let mut estimate = Measurement::default();
        for _ in 0..5 {
            estimate = estimator.push(Measurement::new(640.0, 240.0, 0.6));
        }
        assert_relative_eq!(estimate.x, 640.0);
        assert_relative_eq!(estimate.y, 240.0);
        assert_relative_eq!(estimate.size, 0.6);

        let output = compute_control(estimate, HD, &ControlGains::default());
        assert_eq!(output, ControlOutput::default());
        assert!(output.commands().is_empty());
    }

    #[test]
    fn estimate_is_mean_of_last_five() {
        let mut estimator = MotionEstimator::new(HD, DEFAULT_WINDOW);
        let mut estimate = Measurement::default();
        for i in 1..=8 {
            estimate = estimator.push(Measurement::new(i as f32 * 10.0, 0.0, 0.1));
        }
        // Samples 4..=8 remain.
        assert_eq!(estimator.window().len(), 5);
        assert_relative_eq!(estimate.x, 60.0);
        assert_relative_eq!(estimate.size, 0.1, epsilon = 1e-6);
    }

    #[test]
    fn partial_window_averages_what_it_has() {
        let mut estimator = MotionEstimator::new(HD, DEFAULT_WINDOW);
        estimator.push(Measurement::new(100.0, 200.0, 0.2));
        let estimate = estimator.push(Measurement::new(300.0, 400.0, 0.4));
        assert_relative_eq!(estimate.x, 200.0);
        assert_relative_eq!(estimate.y, 300.0);
        assert_relative_eq!(estimate.size, 0.3, epsilon = 1e-6);
    }

    #[test]
    fn observe_converts_shoulders_to_pixels() {
        use crate::pose::Keypoint;

        let torso = TorsoKeypoints {
            left_shoulder: Keypoint::new(0.6, 0.25),
            right_shoulder: Keypoint::new(0.4, 0.25),
            left_hip: Keypoint::new(0.6, 0.75),
            right_hip: Keypoint::new(0.4, 0.75),
        };
        let mut estimator = MotionEstimator::new(HD, DEFAULT_WINDOW);
        let estimate = estimator.observe(&torso);
        assert_relative_eq!(estimate.x, 640.0, epsilon = 1e-3);
        assert_relative_eq!(estimate.y, 180.0, epsilon = 1e-3);
        assert_relative_eq!(estimate.size, 0.9, epsilon = 1e-6);
    }

    #[test]
    fn dead_band_suppresses_small_errors() {
        let gains = ControlGains::default();
        // 30 px below target, 0.05 too close, 45 px right of centre.
        let output = compute_control(Measurement::new(685.0, 270.0, 0.65), HD, &gains);
        assert!(output.is_hold());
    }

    #[test]
    fn errors_map_to_signed_magnitudes() {
        let gains = ControlGains::default();
        // Subject low in frame, far away and left of centre.
        let output = compute_control(Measurement::new(440.0, 440.0, 0.3), HD, &gains);
        assert_eq!(output.vertical, -30);
        assert_eq!(output.longitudinal, 36);
        // 0.11 * -200 * 1.15 = -25.3
        assert_eq!(output.yaw, -25);
        assert_eq!(
            output.commands(),
            vec![
                (Motion::Down, 30),
                (Motion::Forward, 36),
                (Motion::CounterClockwise, 25)
            ]
        );
    }

    #[test]
    fn magnitudes_never_exceed_limit() {
        let gains = ControlGains::default();
        for &x in &[-1.0e6, -5000.0, 0.0, 640.0, 1280.0, 9000.0, 1.0e6] {
            for &y in &[-1.0e6, -800.0, 0.0, 240.0, 720.0, 3000.0, 1.0e6] {
                for &size in &[-50.0, 0.0, 0.6, 2.0, 50.0] {
                    let output = compute_control(Measurement::new(x, y, size), HD, &gains);
                    for m in [output.vertical, output.longitudinal, output.yaw] {
                        assert!(m.abs() <= 100, "{m} out of range for ({x}, {y}, {size})");
                    }
                }
            }
        }
    }

    #[test]
    fn non_finite_estimates_produce_no_command() {
        let output = compute_control(
            Measurement::new(f32::NAN, f32::INFINITY, f32::NAN),
            HD,
            &ControlGains::default(),
        );
        assert!(output.is_hold());
    }
}
