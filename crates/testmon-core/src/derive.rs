//! Metric derivation: raw samples to stored values.

/// Placeholder substituted with the unit's own component.
pub const USER_COMPONENT: &str = "{user_component}";

/// CPU usage ratio and memory delta computed from a raw sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedMetrics {
    pub cpu_usage: f64,
    pub net_memory: f64,
}

/// Derive `cpu_usage` and `net_memory` from raw measurements.
///
/// `cpu_usage` is `(user + kernel) / total`. A zero (or non-finite) total
/// yields `0.0` instead of dividing. `net_memory` is `raw - baseline`, not
/// clamped; a negative value means the unit ran below the baseline footprint.
pub fn derive(
    total_time: f64,
    user_time: f64,
    kernel_time: f64,
    raw_memory: f64,
    baseline_memory: f64,
) -> DerivedMetrics {
    let cpu_usage = if total_time == 0.0 || !total_time.is_finite() {
        0.0
    } else {
        (user_time + kernel_time) / total_time
    };
    DerivedMetrics {
        cpu_usage,
        net_memory: raw_memory - baseline_memory,
    }
}

/// Make a parametrization suffix readable: `a-b-c` becomes `a, b, c`.
pub fn normalize_variant(variant: &str) -> String {
    variant.replace('-', ", ")
}

/// How the stored component is built from a unit's own component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentTemplate {
    template: String,
}

impl Default for ComponentTemplate {
    fn default() -> Self {
        Self {
            template: USER_COMPONENT.to_string(),
        }
    }
}

impl ComponentTemplate {
    /// Every unit reports `component`, whatever it declares.
    pub fn forced(component: &str) -> Self {
        Self {
            template: component.to_string(),
        }
    }

    /// Units report `prefix.<their component>`.
    pub fn prefixed(prefix: &str) -> Self {
        Self {
            template: format!("{prefix}.{USER_COMPONENT}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Substitute `user_component` and trim a dangling trailing `.`.
    pub fn resolve(&self, user_component: &str) -> String {
        let resolved = self.template.replace(USER_COMPONENT, user_component);
        match resolved.strip_suffix('.') {
            Some(trimmed) => trimmed.to_string(),
            None => resolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_example() {
        let d = derive(0.5, 0.3, 0.1, 120.0, 100.0);
        assert!((d.cpu_usage - 0.8).abs() < 1e-12);
        assert_eq!(d.net_memory, 20.0);
    }

    #[test]
    fn test_derive_zero_duration_is_zero_usage() {
        let d = derive(0.0, 0.2, 0.1, 50.0, 10.0);
        assert_eq!(d.cpu_usage, 0.0);
        assert_eq!(d.net_memory, 40.0);
    }

    #[test]
    fn test_derive_non_finite_duration_is_zero_usage() {
        assert_eq!(derive(f64::NAN, 0.1, 0.1, 0.0, 0.0).cpu_usage, 0.0);
        assert_eq!(derive(f64::INFINITY, 0.1, 0.1, 0.0, 0.0).cpu_usage, 0.0);
    }

    #[test]
    fn test_derive_negative_memory_not_clamped() {
        let d = derive(1.0, 0.5, 0.0, 95.5, 100.0);
        assert_eq!(d.net_memory, -4.5);
    }

    #[test]
    fn test_derive_multithreaded_usage_can_exceed_one() {
        let d = derive(1.0, 3.0, 0.5, 0.0, 0.0);
        assert!((d.cpu_usage - 3.5).abs() < 1e-12);
    }

    #[test]
    fn test_normalize_variant() {
        assert_eq!(normalize_variant("1-2-abc"), "1, 2, abc");
        assert_eq!(normalize_variant(""), "");
        assert_eq!(normalize_variant("plain"), "plain");
    }

    #[test]
    fn test_component_default_passthrough() {
        let t = ComponentTemplate::default();
        assert_eq!(t.resolve("core"), "core");
        assert_eq!(t.resolve(""), "");
    }

    #[test]
    fn test_component_prefix() {
        let t = ComponentTemplate::prefixed("svc");
        assert_eq!(t.resolve("core"), "svc.core");
        assert_eq!(t.resolve(""), "svc");
    }

    #[test]
    fn test_component_forced_ignores_user_value() {
        let t = ComponentTemplate::forced("fixed");
        assert_eq!(t.resolve("core"), "fixed");
        assert_eq!(t.resolve(""), "fixed");
    }

    #[test]
    fn test_component_trims_trailing_dot_from_user_value() {
        let t = ComponentTemplate::prefixed("svc");
        assert_eq!(t.resolve("core."), "svc.core");
        assert_eq!(t.as_str(), "svc.{user_component}");
    }
}
