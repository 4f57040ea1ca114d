use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use super::backend::DetectorBackend;
use super::backends::{FixedBackend, LumaBackend, MotionBackend};
use super::backends::luma::{DEFAULT_LUMA_THRESHOLD, DEFAULT_MIN_FRACTION};
use super::result::BoundingBox;

/// Which detector a source runs, as written in configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum DetectorSpec {
    #[default]
    Motion,
    Luma {
        #[serde(default = "default_luma_threshold")]
        threshold: u8,
        #[serde(default = "default_min_fraction")]
        min_fraction: f32,
    },
    Fixed {
        label: String,
        confidence: f32,
        bbox: BoundingBox,
    },
    #[cfg(feature = "backend-tract")]
    Tract {
        model: std::path::PathBuf,
        width: u32,
        height: u32,
        #[serde(default = "default_tract_label")]
        label: String,
    },
    /// Backend registered at runtime with `BackendRegistry::register`.
    Custom { name: String },
}

fn default_luma_threshold() -> u8 {
    DEFAULT_LUMA_THRESHOLD
}

fn default_min_fraction() -> f32 {
    DEFAULT_MIN_FRACTION
}

#[cfg(feature = "backend-tract")]
fn default_tract_label() -> String {
    "object".to_string()
}

type Factory = dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync;

/// Builds one detector instance per pipeline from a `DetectorSpec`.
///
/// Built-in specs are constructed directly; `Custom` specs are looked up among
/// the registered factories. Cheap to clone and shareable across threads.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<String, Arc<Factory>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in backend also reachable by name through
    /// `DetectorSpec::Custom`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("motion", || Ok(Box::new(MotionBackend::new())));
        registry.register("luma", || Ok(Box::new(LumaBackend::default())));
        registry
    }

    /// Register a factory under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Construct a fresh backend for one pipeline.
    pub fn build(&self, spec: &DetectorSpec) -> Result<Box<dyn DetectorBackend>> {
        match spec {
            DetectorSpec::Motion => Ok(Box::new(MotionBackend::new())),
            DetectorSpec::Luma {
                threshold,
                min_fraction,
            } => Ok(Box::new(LumaBackend::new(*threshold, *min_fraction))),
            DetectorSpec::Fixed {
                label,
                confidence,
                bbox,
            } => Ok(Box::new(FixedBackend::new(label.clone(), *confidence, *bbox))),
            #[cfg(feature = "backend-tract")]
            DetectorSpec::Tract {
                model,
                width,
                height,
                label,
            } => Ok(Box::new(super::backends::TractBackend::new(
                model, *width, *height, label,
            )?)),
            DetectorSpec::Custom { name } => {
                let factory = self
                    .factories
                    .get(name)
                    .ok_or_else(|| anyhow!("detector backend '{}' not registered", name))?;
                factory()
            }
        }
    }

    /// Registered factory names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Frame;

    #[test]
    fn builds_builtin_specs() {
        let registry = BackendRegistry::with_builtins();
        assert_eq!(registry.build(&DetectorSpec::Motion).unwrap().name(), "motion");
        let spec = DetectorSpec::Fixed {
            label: "cat".into(),
            confidence: 0.9,
            bbox: BoundingBox::new(1.0, 1.0, 3.0, 3.0),
        };
        let mut backend = registry.build(&spec).unwrap();
        let frame = Frame::blank("cam".into(), 4, 4).unwrap();
        let dets = backend.detect(&frame).unwrap();
        assert_eq!(dets[0].category, "cat");
    }

    #[test]
    fn custom_lookup_and_missing_name() {
        let mut registry = BackendRegistry::with_builtins();
        registry.register("always-dog", || {
            Ok(Box::new(FixedBackend::new("dog", 1.0, BoundingBox::default())))
        });
        let spec = DetectorSpec::Custom {
            name: "always-dog".into(),
        };
        assert_eq!(registry.build(&spec).unwrap().name(), "fixed");
        assert_eq!(registry.list(), vec!["always-dog", "luma", "motion"]);

        let missing = DetectorSpec::Custom {
            name: "nope".into(),
        };
        assert!(registry.build(&missing).is_err());
    }

    #[test]
    fn spec_parses_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            detector: DetectorSpec,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [detector]
            backend = "fixed"
            label = "cat"
            confidence = 0.9
            bbox = { x1 = 0.0, y1 = 0.0, x2 = 10.0, y2 = 10.0 }
            "#,
        )
        .unwrap();
        assert!(matches!(parsed.detector, DetectorSpec::Fixed { .. }));

        let parsed: Wrapper = toml::from_str("[detector]\nbackend = \"luma\"\n").unwrap();
        assert_eq!(
            parsed.detector,
            DetectorSpec::Luma {
                threshold: DEFAULT_LUMA_THRESHOLD,
                min_fraction: DEFAULT_MIN_FRACTION
            }
        );
    }
}
