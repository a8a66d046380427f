pub mod denormal;
pub mod dry_wet;
pub mod gain;

pub use denormal::DenormalGuard;
pub use dry_wet::MixStage;
pub use gain::GainStage;
