use serde::{Deserialize, Serialize};

use crate::ad::AdScalar;
use crate::controls::Phase;
use crate::error::SimError;

/// Grid face direction, mapped from the external face tag {0..5}.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum FaceDir {
    XMinus,
    XPlus,
    YMinus,
    YPlus,
    ZMinus,
    ZPlus,
}

impl FaceDir {
    pub fn from_tag(tag: usize) -> Result<Self, SimError> {
        match tag {
            0 => Ok(FaceDir::XMinus),
            1 => Ok(FaceDir::XPlus),
            2 => Ok(FaceDir::YMinus),
            3 => Ok(FaceDir::YPlus),
            4 => Ok(FaceDir::ZMinus),
            5 => Ok(FaceDir::ZPlus),
            other => Err(SimError::InvalidFaceTag(other)),
        }
    }

    pub fn tag(self) -> usize {
        match self {
            FaceDir::XMinus => 0,
            FaceDir::XPlus => 1,
            FaceDir::YMinus => 2,
            FaceDir::YPlus => 3,
            FaceDir::ZMinus => 4,
            FaceDir::ZPlus => 5,
        }
    }
}

/// Per-cell fluid state evaluated by the external PVT layer.
///
/// AD quantities carry derivatives with respect to the cell's own primary
/// variables; all cells share one derivative layout of length
/// `num_primary_variables()`.
pub trait FluidFacade {
    fn num_primary_variables(&self) -> usize;

    /// Water-phase pressure [Pa]
    fn water_pressure(&self, cell: usize) -> AdScalar;

    /// Water-phase density [kg/m³]
    fn water_density(&self, cell: usize) -> AdScalar;

    /// Water-phase viscosity [Pa·s]
    fn water_viscosity(&self, cell: usize) -> AdScalar;

    /// Surface reference density [kg/m³]
    fn reference_density(&self, phase: Phase, cell: usize) -> f64;

    /// Inverse formation volume factor 1/B [dimensionless]
    fn inverse_formation_volume_factor(&self, phase: Phase, cell: usize) -> f64;

    /// Saturated dissolution factor (Rs for oil, Rv for gas) [dimensionless]
    fn saturated_dissolution_factor(&self, phase: Phase, cell: usize) -> f64;
}

/// Cell geometry supplied by the external grid.
pub trait GridFacade {
    /// Cell-center coordinates [m]; z grows downward (depth)
    fn cell_center(&self, cell: usize) -> [f64; 3];

    /// Depth of the cell center [m]
    fn cell_depth(&self, cell: usize) -> f64 {
        self.cell_center(cell)[2]
    }

    /// Area of the cell face in direction `dir` [m²]
    fn face_area(&self, cell: usize, dir: FaceDir) -> f64;
}

/// The global Jacobian/residual storage primitive.
///
/// Additive updates only. Under the footprint model each aquifer and each
/// well writes disjoint rows, so no locking is needed from a single
/// thread per owner.
pub trait LinearSystem {
    /// R[cell][eq] += value
    fn add_residual(&mut self, cell: usize, eq: usize, value: f64);

    /// J[row_cell][col_cell][eq, var] += value
    fn add_jacobian(&mut self, row_cell: usize, col_cell: usize, eq: usize, var: usize, value: f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_tags_round_trip() {
        for tag in 0..6 {
            assert_eq!(FaceDir::from_tag(tag).unwrap().tag(), tag);
        }
        assert!(FaceDir::from_tag(6).is_err());
    }
}
