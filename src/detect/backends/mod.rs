pub mod fixed;
pub mod luma;
pub mod motion;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use fixed::FixedBackend;
pub use luma::LumaBackend;
pub use motion::MotionBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;
