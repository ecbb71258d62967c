//! Body keypoints as delivered by the external pose model.

use serde::{Deserialize, Serialize};

/// Normalized image coordinate, `(0, 0)` top-left and `(1, 1)` bottom-right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
}

impl Keypoint {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Keypoint) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn midpoint(self, other: Keypoint) -> Keypoint {
        Keypoint::new((self.x + other.x) / 2.0, (self.y + other.y) / 2.0)
    }

    pub fn in_frame(self) -> bool {
        (0.0..=1.0).contains(&self.x) && (0.0..=1.0).contains(&self.y)
    }
}

/// The four landmarks the follow controller relies on.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TorsoKeypoints {
    pub left_shoulder: Keypoint,
    pub right_shoulder: Keypoint,
    pub left_hip: Keypoint,
    pub right_hip: Keypoint,
}

impl TorsoKeypoints {
    pub fn points(&self) -> [Keypoint; 4] {
        [
            self.left_shoulder,
            self.right_shoulder,
            self.left_hip,
            self.right_hip,
        ]
    }

    /// Shoulder width + hip width + shoulder-to-hip height, in normalized units.
    /// Grows as the subject approaches the camera.
    pub fn torso_size(&self) -> f32 {
        let shoulders = self.left_shoulder.distance(self.right_shoulder);
        let hips = self.left_hip.distance(self.right_hip);
        let height = self.shoulder_midpoint().distance(self.hip_midpoint());
        shoulders + hips + height
    }

    pub fn shoulder_midpoint(&self) -> Keypoint {
        self.left_shoulder.midpoint(self.right_shoulder)
    }

    pub fn hip_midpoint(&self) -> Keypoint {
        self.left_hip.midpoint(self.right_hip)
    }

    pub fn fully_visible(&self) -> bool {
        self.points().iter().all(|point| point.in_frame())
    }
}

/// Pixel dimensions of the frames the keypoints refer to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
}

impl FrameGeometry {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FrameGeometry {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    #[test]
    fn torso_size_sums_widths_and_height() {
        let torso = TorsoKeypoints {
            left_shoulder: Keypoint::new(0.6, 0.3),
            right_shoulder: Keypoint::new(0.4, 0.3),
            left_hip: Keypoint::new(0.58, 0.6),
            right_hip: Keypoint::new(0.42, 0.6),
        };
        assert_relative_eq!(torso.torso_size(), 0.2 + 0.16 + 0.3, epsilon = 1e-6);
    }

    #[test]
    fn keypoints_outside_unit_square_are_not_visible() {
        let mut torso = TorsoKeypoints {
            left_shoulder: Keypoint::new(0.6, 0.3),
            right_shoulder: Keypoint::new(0.4, 0.3),
            left_hip: Keypoint::new(0.6, 0.9),
            right_hip: Keypoint::new(0.4, 0.9),
        };
        assert!(torso.fully_visible());
        torso.left_hip.y = 1.05;
        assert!(!torso.fully_visible());
    }

    #[test]
    fn deserializes_named_landmarks() {
        let json = r#"{
            "left_shoulder": {"x": 0.6, "y": 0.3},
            "right_shoulder": {"x": 0.4, "y": 0.3},
            "left_hip": {"x": 0.6, "y": 0.7},
            "right_hip": {"x": 0.4, "y": 0.7}
        }"#;
        let torso: TorsoKeypoints = serde_json::from_str(json).unwrap();
        assert_eq!(torso.right_hip, Keypoint::new(0.4, 0.7));
    }
}
