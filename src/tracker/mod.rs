pub mod normalize;
pub mod smooth;

pub use normalize::PoseNormalizer;
pub use smooth::PoseSmoother;
