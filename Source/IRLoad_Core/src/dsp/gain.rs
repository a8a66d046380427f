//! Smoothed output gain.

/// Linear gain driven by a dB target, with a fixed one-pole smoother so
/// parameter steps ramp instead of zipper.
pub struct GainStage {
    state: f64,
}

impl GainStage {
    pub fn new() -> Self {
        Self { state: 0.0 }
    }

    pub fn clear_state(&mut self) {
        self.state = 0.0;
    }

    /// Apply `gain_db` to `block` in place.
    pub fn compute(&mut self, gain_db: f32, block: &mut [f32]) {
        let target = 0.001 * 10f64.powf(0.05 * gain_db as f64);
        for sample in block.iter_mut() {
            self.state = target + 0.999 * self.state;
            *sample *= self.state as f32;
        }
    }
}

impl Default for GainStage {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settles_on_db_target() {
        let mut stage = GainStage::new();
        let mut block = vec![1.0f32; 48_000];
        stage.compute(6.0, &mut block);
        let expected = 10f32.powf(0.05 * 6.0);
        assert!((block[47_999] - expected).abs() < 1e-3);
    }

    #[test]
    fn ramps_without_jump() {
        let mut stage = GainStage::new();
        let mut block = vec![1.0f32; 64];
        stage.compute(0.0, &mut block);
        // Fresh smoother starts from silence and climbs monotonically.
        assert!(block[0] < 0.01);
        assert!(block.windows(2).all(|w| w[1] >= w[0]));
    }

    #[test]
    fn clear_state_restarts_ramp() {
        let mut stage = GainStage::new();
        let mut block = vec![1.0f32; 4_800];
        stage.compute(0.0, &mut block);
        stage.clear_state();
        let mut first = vec![1.0f32; 1];
        stage.compute(0.0, &mut first);
        assert!(first[0] < 0.01);
    }
}
