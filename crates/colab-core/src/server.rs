//! Server descriptors and the static catalog of selectable compute shapes.
//!
//! A [`ColabServerDescriptor`] is an abstract, unassigned description of a
//! runtime: what the user picks before anything is allocated remotely.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine family of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Variant {
    /// CPU-only runtime.
    #[default]
    Default,
    /// GPU-backed runtime.
    Gpu,
    /// TPU-backed runtime.
    Tpu,
}

impl Variant {
    /// Returns the wire name of this variant.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::Gpu => "GPU",
            Self::Tpu => "TPU",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unrecognised variant name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown server variant: {0} (expected DEFAULT, GPU or TPU)")]
pub struct UnknownVariant(pub String);

impl FromStr for Variant {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEFAULT" | "CPU" => Ok(Self::Default),
            "GPU" => Ok(Self::Gpu),
            "TPU" => Ok(Self::Tpu),
            _ => Err(UnknownVariant(s.to_string())),
        }
    }
}

/// An unassigned compute shape the user can select.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColabServerDescriptor {
    /// Human-readable label, e.g. `"Colab GPU T4"`.
    pub label: String,
    /// Machine family.
    pub variant: Variant,
    /// Accelerator model (e.g. `"T4"`, `"V5E1"`); absent for CPU runtimes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<String>,
}

impl ColabServerDescriptor {
    /// Creates a descriptor without an accelerator.
    pub fn new(label: impl Into<String>, variant: Variant) -> Self {
        Self {
            label: label.into(),
            variant,
            accelerator: None,
        }
    }

    /// Builder method to set the accelerator.
    pub fn with_accelerator(mut self, accelerator: impl Into<String>) -> Self {
        self.accelerator = Some(accelerator.into());
        self
    }

    /// Returns true if `variant`/`accelerator` describe this shape.
    ///
    /// Accelerator names compare case-insensitively.
    pub fn matches(&self, variant: Variant, accelerator: Option<&str>) -> bool {
        self.variant == variant
            && match (self.accelerator.as_deref(), accelerator) {
                (None, None) => true,
                (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                _ => false,
            }
    }
}

impl fmt::Display for ColabServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accelerator {
            Some(ref accelerator) => write!(f, "{} ({}/{})", self.label, self.variant, accelerator),
            None => write!(f, "{} ({})", self.label, self.variant),
        }
    }
}

/// The shape assigned when nothing else was asked for.
pub fn default_server() -> ColabServerDescriptor {
    ColabServerDescriptor::new("Colab CPU", Variant::Default)
}

/// Every shape the client knows how to request, in display order.
pub fn server_catalog() -> Vec<ColabServerDescriptor> {
    vec![
        default_server(),
        ColabServerDescriptor::new("Colab GPU T4", Variant::Gpu).with_accelerator("T4"),
        ColabServerDescriptor::new("Colab GPU L4", Variant::Gpu).with_accelerator("L4"),
        ColabServerDescriptor::new("Colab GPU A100", Variant::Gpu).with_accelerator("A100"),
        ColabServerDescriptor::new("Colab TPU v5e-1", Variant::Tpu).with_accelerator("V5E1"),
        ColabServerDescriptor::new("Colab TPU v6e-1", Variant::Tpu).with_accelerator("V6E1"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_parses_case_insensitively() {
        assert_eq!("gpu".parse::<Variant>().unwrap(), Variant::Gpu);
        assert_eq!("TPU".parse::<Variant>().unwrap(), Variant::Tpu);
        assert_eq!("cpu".parse::<Variant>().unwrap(), Variant::Default);
        assert!("quantum".parse::<Variant>().is_err());
    }

    #[test]
    fn variant_serializes_screaming_case() {
        let json = serde_json::to_string(&Variant::Gpu).unwrap();
        assert_eq!(json, "\"GPU\"");
        let back: Variant = serde_json::from_str("\"DEFAULT\"").unwrap();
        assert_eq!(back, Variant::Default);
    }

    #[test]
    fn catalog_starts_with_default_server() {
        let catalog = server_catalog();
        assert_eq!(catalog[0], default_server());
        assert!(catalog[0].accelerator.is_none());
        assert!(catalog.iter().skip(1).all(|d| d.accelerator.is_some()));
    }

    #[test]
    fn descriptor_matching() {
        let t4 = ColabServerDescriptor::new("Colab GPU T4", Variant::Gpu).with_accelerator("T4");
        assert!(t4.matches(Variant::Gpu, Some("t4")));
        assert!(!t4.matches(Variant::Gpu, None));
        assert!(!t4.matches(Variant::Tpu, Some("T4")));
        assert!(default_server().matches(Variant::Default, None));
    }

    #[test]
    fn descriptor_display() {
        let t4 = ColabServerDescriptor::new("Colab GPU T4", Variant::Gpu).with_accelerator("T4");
        assert_eq!(t4.to_string(), "Colab GPU T4 (GPU/T4)");
        assert_eq!(default_server().to_string(), "Colab CPU (DEFAULT)");
    }
}
