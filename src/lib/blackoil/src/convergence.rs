use serde::{Deserialize, Serialize};

use crate::controls::WellControlType;

/// Severity of one equation's worst residual.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Severity {
    /// Within tolerance
    None,
    /// Above tolerance but finite and bounded; another iteration may fix it
    Normal,
    /// Finite but beyond the hard cap; the step should be cut
    TooLarge,
    /// NaN entered the residual; the step must be cut
    NotANumber,
}

/// Residual tolerances of the multi-segment well equations.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tolerances {
    /// Flux (mass-balance) equation tolerance
    pub tolerance_wells: f64,
    /// Segment pressure-equation tolerance [Pa]
    pub tolerance_pressure_ms_wells: f64,
    /// Residuals beyond this are TooLarge regardless of tolerance
    pub max_residual_allowed: f64,
    /// When in force, only exceedances of tolerance·factor are reported
    pub relaxed_factor: Option<f64>,
    /// Pressure-control (BHP/THP) equation tolerance [Pa]
    pub tolerance_pressure_control: f64,
    /// Rate-control equation tolerance [m³/s]
    pub tolerance_rate_control: f64,
}

impl Default for Tolerances {
    fn default() -> Self {
        Tolerances {
            tolerance_wells: 1.0e-4,
            tolerance_pressure_ms_wells: 1.0e3,
            max_residual_allowed: 1.0e9,
            relaxed_factor: None,
            tolerance_pressure_control: 1.0e2,
            tolerance_rate_control: 1.0e-6,
        }
    }
}

impl Tolerances {
    /// Tolerance of the top-segment control equation, by control type.
    pub fn control_tolerance(&self, control_type: WellControlType) -> f64 {
        match control_type {
            WellControlType::Bhp | WellControlType::Thp => self.tolerance_pressure_control,
            WellControlType::ReservoirRate | WellControlType::SurfaceRate => {
                self.tolerance_rate_control
            }
        }
    }

    /// The reporting threshold for a base tolerance: the relaxed value
    /// when one is in force, the base tolerance otherwise.
    pub fn reporting_threshold(&self, tolerance: f64) -> f64 {
        match self.relaxed_factor {
            Some(factor) => tolerance * factor,
            None => tolerance,
        }
    }

    /// Classify a residual magnitude against `tolerance`.
    pub fn classify(&self, value: f64, tolerance: f64) -> Severity {
        if value.is_nan() {
            return Severity::NotANumber;
        }
        if !value.is_finite() || value > self.max_residual_allowed {
            return Severity::TooLarge;
        }
        if value > self.reporting_threshold(tolerance) {
            return Severity::Normal;
        }
        Severity::None
    }
}

/// Worst residual of one well equation across the segments.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquationMetric {
    /// Equation index: components first, pressure last
    pub equation: usize,
    pub max_residual: f64,
    pub severity: Severity,
}

/// Multi-criterion convergence report of one multi-segment well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceReport {
    pub well: String,
    /// One entry per well equation
    pub metrics: Vec<EquationMetric>,
    /// Top-segment control equation, checked against its own tolerance
    pub control_residual: f64,
    pub control_severity: Severity,
}

impl ConvergenceReport {
    pub fn converged(&self) -> bool {
        self.control_severity == Severity::None
            && self.metrics.iter().all(|m| m.severity == Severity::None)
    }

    /// Whether any equation carries a step-killing severity.
    pub fn failed(&self) -> bool {
        let bad = |s: Severity| matches!(s, Severity::TooLarge | Severity::NotANumber);
        bad(self.control_severity) || self.metrics.iter().any(|m| bad(m.severity))
    }

    pub fn worst_severity(&self) -> Severity {
        let rank = |s: Severity| match s {
            Severity::None => 0,
            Severity::Normal => 1,
            Severity::TooLarge => 2,
            Severity::NotANumber => 3,
        };
        self.metrics
            .iter()
            .map(|m| m.severity)
            .chain(std::iter::once(self.control_severity))
            .max_by_key(|s| rank(*s))
            .unwrap_or(Severity::None)
    }
}

/// Damping measure returned to the outer Newton loop: the sum of
/// residual/tolerance ratios over equations that are above tolerance.
pub fn residual_measure(residuals: &[f64], tolerances: &[f64]) -> f64 {
    debug_assert_eq!(residuals.len(), tolerances.len());
    residuals
        .iter()
        .zip(tolerances)
        .filter(|(r, t)| r.abs() > **t)
        .map(|(r, t)| r.abs() / t)
        .sum()
}
