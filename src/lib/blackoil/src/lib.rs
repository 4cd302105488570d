// File: `src/lib/blackoil/src/lib.rs`
//
// UNIT SYSTEM: STRICT SI (CONSISTENT THROUGHOUT)
// ==============================================
// Pressure: pascal (Pa)
// Distance: meter (m)
// Time: second (s)
// Volume: cubic meter (m³)
// Mass: kilogram (kg)
// Permeability: square meter (m²)
// Viscosity: pascal-second (Pa·s)
// Compressibility: 1/Pa
// Rates: m³/s (volumetric), kg/s (mass)
//
// All calculations maintain consistency in these base units with no
// hidden conversions; unit constants of the analytical aquifer are
// inputs, not built-ins.
//
// The crate is the core of a fully-implicit black-oil simulator:
// the Carter–Tracy analytical aquifer, the hierarchical well-group
// control engine, and the multi-segment well evaluator. Grid topology,
// PVT evaluation, the global linear solver, and the outer Newton loop
// are external collaborators reached through the narrow traits in
// `facade`.

pub mod ad;
pub mod aquifer;
pub mod controls;
pub mod convergence;
pub mod error;
pub mod facade;
pub mod group;
pub mod influence;
pub mod msw;
pub mod schedule;
pub mod segment;

pub use ad::AdScalar;
pub use aquifer::{AquiferCell, AquiferParameters, CarterTracyAquifer};
pub use controls::{
    InjectionControlMode, InjectionSpec, NUM_PHASES, Phase, ProductionControlMode,
    ProductionProcedure, ProductionSpec, WellControlSlot, WellControlType, WellControls,
    WellRates,
};
pub use convergence::{ConvergenceReport, EquationMetric, Severity, Tolerances};
pub use error::SimError;
pub use facade::{FaceDir, FluidFacade, GridFacade, LinearSystem};
pub use group::{GroupControlConfig, NodeKind, TreeNode, WellGroupTree};
pub use influence::{InfluenceTable, fit_polynomial};
pub use msw::{MswConfig, MultiSegmentWell, Perforation, WellLinearSystem};
pub use schedule::{
    GroupInput, ScheduleStep, SegmentInput, WellInput, WellType, build_segments,
};
pub use segment::{
    AutoIcdSpec, Segment, SegmentSet, SegmentType, SpiralIcdSpec, ValveSpec, ValveStatus,
};
