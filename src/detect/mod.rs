//! Detector seam: the trait every backend implements, the result types, the
//! built-in backends, and the registry that builds one backend per pipeline.

mod backend;
pub mod backends;
mod registry;
mod result;

pub use backend::DetectorBackend;
pub use backends::{FixedBackend, LumaBackend, MotionBackend};
pub use registry::{BackendRegistry, DetectorSpec};
pub use result::{filter_confident, BoundingBox, Detection, DetectionResult};
