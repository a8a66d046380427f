//! Wet/dry crossfade.

/// Linear blend between the dry and processed copies of a block.
/// `wet_dry` is a percentage: 0 = fully dry, 100 = fully wet.
pub struct MixStage;

impl MixStage {
    pub fn new() -> Self {
        Self
    }

    pub fn compute(&self, wet_dry: f32, dry: &[f32], wet: &mut [f32]) {
        let w = wet_dry / 100.0;
        let d = 1.0 - w;
        for (out, dry) in wet.iter_mut().zip(dry) {
            *out = d * dry + w * *out;
        }
    }
}

impl Default for MixStage {
    fn default() -> Self {
        Self::new()
    }
}
