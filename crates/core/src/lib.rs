pub mod arbiter;
pub mod capture;
pub mod config;
pub mod emotion;
pub mod engine;
pub mod features;
pub mod pause;
pub mod resources;
pub mod session;
pub mod transcript;
pub mod util;

pub use arbiter::{DetectionMode, DeviceResourceState, PerformanceMode};
pub use config::{DetectionConfig, EngineConfig, SamplingConfig};
pub use engine::VoiceStateEngine;
pub use session::{DetectionSession, EngineEvent, MotionDetector, SessionError};
pub use transcript::TranscriptBuffer;
