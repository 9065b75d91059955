//! Degradation ladder and mitigation lever tunings.
//!
//! The controller watches four normalized resource ratios; the largest one
//! is the system pressure `R`, and `R` alone decides the level. Each level
//! carries a fixed sampling rate and dispatch batch size.

use serde::{Deserialize, Serialize};

/// Discrete health tier of the core.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl DegradationLevel {
    /// Ladder on `R = max_i r_i`.
    pub fn from_pressure(pressure: f64) -> Self {
        if pressure >= 2.0 {
            DegradationLevel::Critical
        } else if pressure >= 1.5 {
            DegradationLevel::High
        } else if pressure >= 1.0 {
            DegradationLevel::Medium
        } else if pressure >= 0.7 {
            DegradationLevel::Low
        } else {
            DegradationLevel::None
        }
    }

    pub fn levers(&self) -> LeverSettings {
        match self {
            DegradationLevel::None => LeverSettings { sampling_rate: 1.0, batch_size: 1 },
            DegradationLevel::Low => LeverSettings { sampling_rate: 0.9, batch_size: 5 },
            DegradationLevel::Medium => LeverSettings { sampling_rate: 0.7, batch_size: 10 },
            DegradationLevel::High => LeverSettings { sampling_rate: 0.5, batch_size: 20 },
            DegradationLevel::Critical => LeverSettings { sampling_rate: 0.2, batch_size: 50 },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::None => "none",
            DegradationLevel::Low => "low",
            DegradationLevel::Medium => "medium",
            DegradationLevel::High => "high",
            DegradationLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mitigation tunings applied at a level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LeverSettings {
    /// Fraction of messages admitted past the sampler.
    pub sampling_rate: f64,
    /// Messages drained per dispatch tick.
    pub batch_size: usize,
}

/// Which resource a ratio describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Memory,
    Queue,
    Rate,
    Cpu,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 4] =
        [ResourceKind::Memory, ResourceKind::Queue, ResourceKind::Rate, ResourceKind::Cpu];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Queue => "queue",
            ResourceKind::Rate => "rate",
            ResourceKind::Cpu => "cpu",
        }
    }
}

/// Capacity ceilings the ratios are normalized against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub max_memory_mb: f64,
    pub max_queue: f64,
    pub max_rate: f64,
    pub max_cpu_pct: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self { max_memory_mb: 1024.0, max_queue: 10_000.0, max_rate: 5_000.0, max_cpu_pct: 80.0 }
    }
}

impl ResourceThresholds {
    pub fn ceiling(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.max_memory_mb,
            ResourceKind::Queue => self.max_queue,
            ResourceKind::Rate => self.max_rate,
            ResourceKind::Cpu => self.max_cpu_pct,
        }
    }
}

/// One sample of the four raw resource signals.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ResourceReadings {
    pub memory_mb: f64,
    pub queue_depth: f64,
    pub publish_rate: f64,
    pub cpu_pct: f64,
}

impl ResourceReadings {
    pub fn reading(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Queue => self.queue_depth,
            ResourceKind::Rate => self.publish_rate,
            ResourceKind::Cpu => self.cpu_pct,
        }
    }

    /// `r_i = current_i / max_i`, zero-guarded.
    pub fn ratios(&self, thresholds: &ResourceThresholds) -> [(ResourceKind, f64); 4] {
        ResourceKind::ALL.map(|kind| {
            let ceiling = thresholds.ceiling(kind);
            let ratio = if ceiling <= 0.0 { 0.0 } else { self.reading(kind) / ceiling };
            (kind, ratio)
        })
    }

    /// `R = max_i r_i`.
    pub fn pressure(&self, thresholds: &ResourceThresholds) -> f64 {
        self.ratios(thresholds).iter().map(|(_, r)| *r).fold(0.0, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_maps_pressure_to_levels() {
        assert_eq!(DegradationLevel::from_pressure(0.0), DegradationLevel::None);
        assert_eq!(DegradationLevel::from_pressure(0.69), DegradationLevel::None);
        assert_eq!(DegradationLevel::from_pressure(0.7), DegradationLevel::Low);
        assert_eq!(DegradationLevel::from_pressure(0.99), DegradationLevel::Low);
        assert_eq!(DegradationLevel::from_pressure(1.0), DegradationLevel::Medium);
        assert_eq!(DegradationLevel::from_pressure(1.49), DegradationLevel::Medium);
        assert_eq!(DegradationLevel::from_pressure(1.5), DegradationLevel::High);
        assert_eq!(DegradationLevel::from_pressure(1.99), DegradationLevel::High);
        assert_eq!(DegradationLevel::from_pressure(2.0), DegradationLevel::Critical);
        assert_eq!(DegradationLevel::from_pressure(9.9), DegradationLevel::Critical);
    }

    #[test]
    fn levers_follow_the_level_table() {
        let cases = [
            (DegradationLevel::None, 1.0, 1),
            (DegradationLevel::Low, 0.9, 5),
            (DegradationLevel::Medium, 0.7, 10),
            (DegradationLevel::High, 0.5, 20),
            (DegradationLevel::Critical, 0.2, 50),
        ];
        for (level, sampling, batch) in cases {
            let levers = level.levers();
            assert_eq!(levers.sampling_rate, sampling, "{level}");
            assert_eq!(levers.batch_size, batch, "{level}");
        }
    }

    #[test]
    fn pressure_is_the_worst_ratio() {
        let thresholds = ResourceThresholds {
            max_memory_mb: 100.0,
            max_queue: 100.0,
            max_rate: 100.0,
            max_cpu_pct: 80.0,
        };
        let readings = ResourceReadings {
            memory_mb: 50.0,
            queue_depth: 120.0,
            publish_rate: 10.0,
            cpu_pct: 8.0,
        };
        assert!((readings.pressure(&thresholds) - 1.2).abs() < 1e-9);
    }

    #[test]
    fn zero_ceilings_do_not_divide_by_zero() {
        let thresholds = ResourceThresholds {
            max_memory_mb: 0.0,
            max_queue: 100.0,
            max_rate: 100.0,
            max_cpu_pct: 80.0,
        };
        let readings = ResourceReadings { memory_mb: 50.0, ..Default::default() };
        assert_eq!(readings.pressure(&thresholds), 0.0);
    }

    #[test]
    fn degradation_staircase_from_memory_ramp() {
        let thresholds = ResourceThresholds {
            max_memory_mb: 100.0,
            max_queue: 100.0,
            max_rate: 100.0,
            max_cpu_pct: 80.0,
        };
        let expectations = [
            (50.0, DegradationLevel::None, 1.0),
            (70.0, DegradationLevel::Low, 0.9),
            (100.0, DegradationLevel::Medium, 0.7),
            (130.0, DegradationLevel::Medium, 0.7),
            (170.0, DegradationLevel::High, 0.5),
            (210.0, DegradationLevel::Critical, 0.2),
        ];
        for (memory_mb, level, sampling) in expectations {
            let readings = ResourceReadings { memory_mb, ..Default::default() };
            let got = DegradationLevel::from_pressure(readings.pressure(&thresholds));
            assert_eq!(got, level, "memory {memory_mb}");
            assert_eq!(got.levers().sampling_rate, sampling, "memory {memory_mb}");
        }
    }
}
