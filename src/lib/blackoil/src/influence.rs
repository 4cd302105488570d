use nalgebra::{DMatrix, DVector};

use crate::error::SimError;

/// Least-squares polynomial fit through (x, y) samples, solved via QR.
///
/// Builds the Vandermonde system and solves the thin-QR normal problem
/// `R·c = Qᵀy`. With `with_bias` the constant term is included, so the
/// coefficient vector reads `[c0, c1, ..]`; without it powers start at x.
/// Deterministic, pure.
pub fn fit_polynomial(
    x: &[f64],
    y: &[f64],
    order: usize,
    with_bias: bool,
) -> Result<DVector<f64>, SimError> {
    if x.len() < order + 1 {
        return Err(SimError::InsufficientSamples {
            required: order + 1,
            actual: x.len(),
            order,
        });
    }
    debug_assert_eq!(x.len(), y.len());

    let num_coefficients = order + usize::from(with_bias);
    let mut vandermonde = DMatrix::<f64>::zeros(x.len(), num_coefficients);
    for (i, &xi) in x.iter().enumerate() {
        let mut power = if with_bias { 1.0 } else { xi };
        for c in 0..num_coefficients {
            vandermonde[(i, c)] = power;
            power *= xi;
        }
    }

    let qr = vandermonde.qr();
    let r = qr.r();
    for i in 0..num_coefficients {
        if r[(i, i)].abs() < 1e-14 {
            return Err(SimError::SingularFit);
        }
    }
    let rhs = qr.q().transpose() * DVector::from_column_slice(y);
    r.solve_upper_triangular(&rhs).ok_or(SimError::SingularFit)
}

/// Tabulated dimensionless pressure pD against dimensionless time tD,
/// with the fitted line `pD(tD) ≈ c0 + c1·tD` as the authoritative
/// evaluator used by the Carter–Tracy engine.
#[derive(Clone, Debug)]
pub struct InfluenceTable {
    td: Vec<f64>,
    pd: Vec<f64>,
    coefficients: DVector<f64>,
}

impl InfluenceTable {
    /// Samples must be strictly increasing in tD, with at least two
    /// entries so the line is determined.
    pub fn new(samples: &[(f64, f64)]) -> Result<Self, SimError> {
        for (i, pair) in samples.windows(2).enumerate() {
            if pair[1].0 <= pair[0].0 {
                return Err(SimError::NonIncreasingSamples { index: i + 1 });
            }
        }
        let td: Vec<f64> = samples.iter().map(|s| s.0).collect();
        let pd: Vec<f64> = samples.iter().map(|s| s.1).collect();
        let coefficients = fit_polynomial(&td, &pd, 1, true)?;
        Ok(InfluenceTable {
            td,
            pd,
            coefficients,
        })
    }

    /// pD at dimensionless time tD from the fitted line.
    pub fn dimensionless_pressure(&self, td: f64) -> f64 {
        self.coefficients[0] + self.coefficients[1] * td
    }

    /// d(pD)/d(tD) of the fitted line.
    pub fn dimensionless_pressure_slope(&self) -> f64 {
        self.coefficients[1]
    }

    pub fn samples(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.td.iter().copied().zip(self.pd.iter().copied())
    }

    pub fn num_samples(&self) -> usize {
        self.td.len()
    }
}
