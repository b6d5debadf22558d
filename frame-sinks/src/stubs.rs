//! Built-in placeholder collaborators.

use lockstep_types::FrameEnvelope;
use tracing::trace;

use crate::{Display, Keypoints, Predictor, Result};

/// Headless display: logs instead of rendering. Stands in when no window
/// system is attached.
#[derive(Default)]
pub struct NullDisplay {
    rendered: u64,
}

impl Display for NullDisplay {
    fn render(&mut self, frame: &FrameEnvelope, overlay: Option<&Keypoints>) -> Result<()> {
        self.rendered += 1;
        trace!(
            "render frame {} ({} overlay points)",
            frame.frame_number,
            overlay.map(|k| k.len()).unwrap_or(0)
        );
        Ok(())
    }
}

/// Placeholder model producing a deterministic keypoint pattern.
///
/// Real inference is a collaborator; this stub only exercises the
/// latest-frame plumbing and gives the preview overlay something to draw.
pub struct StubPredictor {
    n_keypoints: usize,
    last_frame_number: u64,
}

impl StubPredictor {
    pub fn new(n_keypoints: usize) -> Self {
        Self {
            n_keypoints,
            last_frame_number: 0,
        }
    }
}

impl Default for StubPredictor {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Predictor for StubPredictor {
    fn set_frame(&mut self, frame: &FrameEnvelope) -> Result<()> {
        self.last_frame_number = frame.frame_number;
        Ok(())
    }

    fn latest_result(&self) -> Option<Keypoints> {
        if self.last_frame_number == 0 {
            return None;
        }
        // Keypoints march across the frame with the frame number, so a
        // live overlay visibly moves.
        let phase = (self.last_frame_number % 100) as f32;
        Some(
            (0..self.n_keypoints)
                .map(|i| [10.0 * i as f32 + phase, 20.0 * i as f32])
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::envelope;

    #[test]
    fn stub_predictor_result_follows_frames() {
        let mut predictor = StubPredictor::default();
        assert!(predictor.latest_result().is_none());

        predictor.set_frame(&envelope(3)).unwrap();
        let first = predictor.latest_result().unwrap();
        assert_eq!(first.len(), 5);

        predictor.set_frame(&envelope(4)).unwrap();
        assert_ne!(predictor.latest_result().unwrap(), first);
    }

    #[test]
    fn null_display_accepts_frames() {
        let mut display = NullDisplay::default();
        display.render(&envelope(1), None).unwrap();
        display
            .render(&envelope(2), Some(&vec![[1.0, 2.0]]))
            .unwrap();
    }
}
