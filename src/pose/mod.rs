pub mod landmark;
pub mod tpose;

pub use landmark::{Landmark, LandmarkFrame, LandmarkIndex, PoseFrame};
pub use tpose::TPoseDetector;
