//! Options controlling how a [`crate::DeviceContext`] picks its device.
//!
//! Defaults try every backend `wgpu` knows about in a fixed order and ask
//! for downlevel limits, which keeps kernels portable across adapters.
//! [`ContextOptions::from_env`] lets the `WGPU_BACKEND` and
//! `WGPU_POWER_PREF` variables override the defaults without code changes.

use log::warn;
use wgpu::{Backends, PowerPreference};

const BACKEND_VAR: &str = "WGPU_BACKEND";
const POWER_PREF_VAR: &str = "WGPU_POWER_PREF";

/// Which limits to request when creating the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitsPreset {
    /// `wgpu::Limits::downlevel_defaults()`.
    #[default]
    Downlevel,
    /// Everything the adapter reports.
    Adapter,
}

/// Device selection options.
#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Backend sets tried in order; the first that yields a device wins.
    pub backends: Vec<Backends>,
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
    pub limits: LimitsPreset,
    pub label: String,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            backends: vec![Backends::VULKAN, Backends::METAL, Backends::DX12, Backends::GL],
            power_preference: PowerPreference::HighPerformance,
            force_fallback_adapter: false,
            limits: LimitsPreset::Downlevel,
            label: "wgpu_dispatch_device".to_string(),
        }
    }
}

impl ContextOptions {
    /// Defaults, overridden by `WGPU_BACKEND` and `WGPU_POWER_PREF`.
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Ok(raw) = std::env::var(BACKEND_VAR) {
            match parse_backend_list(&raw) {
                Some(backends) => options.backends = backends,
                None => warn!("{BACKEND_VAR}='{raw}' not recognized; trying all backends"),
            }
        }
        if let Ok(raw) = std::env::var(POWER_PREF_VAR) {
            match parse_power_preference(&raw) {
                Some(pref) => options.power_preference = pref,
                None => warn!("{POWER_PREF_VAR}='{raw}' not recognized; using high performance"),
            }
        }
        options
    }

    pub fn with_backends(mut self, backends: impl IntoIterator<Item = Backends>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    pub fn with_power_preference(mut self, power_preference: PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    pub fn with_fallback_adapter(mut self, force: bool) -> Self {
        self.force_fallback_adapter = force;
        self
    }

    pub fn with_limits(mut self, limits: LimitsPreset) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Parse a comma-separated backend list such as `"vulkan,gl"`.
///
/// Order is preserved. Returns `None` if any entry is unknown or the list
/// is empty.
pub fn parse_backend_list(raw: &str) -> Option<Vec<Backends>> {
    let mut backends = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let backend = match name.to_ascii_lowercase().as_str() {
            "vulkan" | "vk" => Backends::VULKAN,
            "metal" | "mtl" => Backends::METAL,
            "dx12" | "d3d12" => Backends::DX12,
            "gl" | "gles" | "opengl" => Backends::GL,
            "webgpu" => Backends::BROWSER_WEBGPU,
            "primary" => Backends::PRIMARY,
            "secondary" => Backends::SECONDARY,
            "all" => Backends::all(),
            _ => return None,
        };
        backends.push(backend);
    }
    (!backends.is_empty()).then_some(backends)
}

pub fn parse_power_preference(raw: &str) -> Option<PowerPreference> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "high" | "high-performance" | "highperformance" => Some(PowerPreference::HighPerformance),
        "low" | "low-power" | "lowpower" => Some(PowerPreference::LowPower),
        "none" => Some(PowerPreference::None),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_order_prefers_native_backends_before_gl() {
        let options = ContextOptions::default();
        assert_eq!(options.backends.first(), Some(&Backends::VULKAN));
        assert_eq!(options.backends.last(), Some(&Backends::GL));
        assert_eq!(options.limits, LimitsPreset::Downlevel);
    }

    #[test]
    fn backend_list_keeps_order() {
        let parsed = parse_backend_list("gl, Vulkan").unwrap();
        assert_eq!(parsed, vec![Backends::GL, Backends::VULKAN]);
    }

    #[test]
    fn backend_list_rejects_unknown_and_empty() {
        assert!(parse_backend_list("vulkan,glide").is_none());
        assert!(parse_backend_list(" , ").is_none());
    }

    #[test]
    fn power_preference_names() {
        assert_eq!(parse_power_preference("LOW"), Some(PowerPreference::LowPower));
        assert_eq!(parse_power_preference("none"), Some(PowerPreference::None));
        assert_eq!(parse_power_preference("turbo"), None);
    }

    #[test]
    fn builder_overrides_fields() {
        let options = ContextOptions::default()
            .with_backends([Backends::METAL])
            .with_fallback_adapter(true)
            .with_limits(LimitsPreset::Adapter)
            .with_label("bench");
        assert_eq!(options.backends, vec![Backends::METAL]);
        assert!(options.force_fallback_adapter);
        assert_eq!(options.limits, LimitsPreset::Adapter);
        assert_eq!(options.label, "bench");
    }
}
