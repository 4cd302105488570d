use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use sprs::{CsMat, TriMatI};

use crate::ad::AdScalar;
use crate::controls::{NUM_PHASES, WellControlSlot, WellControlType};
use crate::convergence::{ConvergenceReport, EquationMetric, Tolerances, residual_measure};
use crate::error::SimError;
use crate::segment::{
    SegmentSet, SegmentType, ValveStatus, auto_icd_drop, friction_drop, hydrostatic_drop,
    spiral_icd_drop, valve_drop, velocity_head,
};

// Per-segment primary-variable layout
pub const WQ_TOTAL: usize = 0;
pub const WATER_FRACTION: usize = 1;
pub const GAS_FRACTION: usize = 2;
/// Segment pressure slot; also the pressure-equation row index
pub const SPRES: usize = NUM_PHASES;
/// Well equations per segment: one mass balance per component plus pressure
pub const NUM_WELL_EQ: usize = NUM_PHASES + 1;

/// Evaluator switches shared by all wells of a run.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MswConfig {
    pub friction_enabled: bool,
    pub acceleration_enabled: bool,
    /// Gravitational acceleration [m/s²]
    pub gravity: f64,
}

impl Default for MswConfig {
    fn default() -> Self {
        MswConfig {
            friction_enabled: true,
            acceleration_enabled: true,
            gravity: 9.81,
        }
    }
}

/// Reservoir connection of one segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Perforation {
    pub segment: usize,
    pub cell: usize,
    /// Depth offset from the segment node to the perforation [m]
    pub depth_diff: f64,
    /// Hydrostatic correction over `depth_diff`, refreshed each
    /// evaluation from the segment mixture density [Pa]
    pub pressure_diff: f64,
}

impl Perforation {
    pub fn new(segment: usize, cell: usize, depth_diff: f64) -> Self {
        Perforation {
            segment,
            cell,
            depth_diff,
            pressure_diff: 0.0,
        }
    }
}

/// Pressure-drop decomposition of one segment, recorded as values for
/// reporting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PressureDrops {
    pub hydrostatic: f64,
    pub friction: f64,
    pub acceleration: f64,
}

/// Derived per-segment quantities, refreshed from the primary variables
/// at the start of each evaluation.
#[derive(Clone, Debug)]
pub struct SegmentState {
    /// Mixture density at segment conditions [kg/m³]
    pub density: AdScalar,
    /// Mixture viscosity [Pa·s]
    pub viscosity: AdScalar,
    /// Mixed mass rate through the segment [kg/s]
    pub mass_rate: AdScalar,
    /// Segment whose intensive state feeds this segment's flux terms:
    /// the segment itself or its outlet
    pub upwind: usize,
    pub drops: PressureDrops,
}

impl SegmentState {
    fn empty() -> Self {
        SegmentState {
            density: AdScalar::constant(0.0, NUM_WELL_EQ),
            viscosity: AdScalar::constant(0.0, NUM_WELL_EQ),
            mass_rate: AdScalar::constant(0.0, NUM_WELL_EQ),
            upwind: 0,
            drops: PressureDrops::default(),
        }
    }
}

/// Block-sparse linear system of one multi-segment well. Blocks are
/// NUM_WELL_EQ × NUM_WELL_EQ at (row segment, column segment); storage is
/// scalar triplets in flattened coordinates, summed on CSR export.
pub struct WellLinearSystem {
    num_segments: usize,
    rows: Vec<usize>,
    cols: Vec<usize>,
    vals: Vec<f64>,
    residual: Vec<DVector<f64>>,
}

impl WellLinearSystem {
    pub fn new(num_segments: usize) -> Self {
        WellLinearSystem {
            num_segments,
            rows: Vec::with_capacity(num_segments * NUM_WELL_EQ * NUM_WELL_EQ * 3),
            cols: Vec::with_capacity(num_segments * NUM_WELL_EQ * NUM_WELL_EQ * 3),
            vals: Vec::with_capacity(num_segments * NUM_WELL_EQ * NUM_WELL_EQ * 3),
            residual: vec![DVector::zeros(NUM_WELL_EQ); num_segments],
        }
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.cols.clear();
        self.vals.clear();
        for r in &mut self.residual {
            r.fill(0.0);
        }
    }

    pub fn add_residual(&mut self, segment: usize, eq: usize, value: f64) {
        self.residual[segment][eq] += value;
    }

    pub fn add_jacobian(&mut self, row_seg: usize, col_seg: usize, eq: usize, var: usize, value: f64) {
        self.rows.push(row_seg * NUM_WELL_EQ + eq);
        self.cols.push(col_seg * NUM_WELL_EQ + var);
        self.vals.push(value);
    }

    pub fn residual(&self, segment: usize) -> &DVector<f64> {
        &self.residual[segment]
    }

    /// Flattened residual, segment-major.
    pub fn residual_vector(&self) -> DVector<f64> {
        let mut out = DVector::zeros(self.num_segments * NUM_WELL_EQ);
        for (s, r) in self.residual.iter().enumerate() {
            for e in 0..NUM_WELL_EQ {
                out[s * NUM_WELL_EQ + e] = r[e];
            }
        }
        out
    }

    /// Flattened scalar matrix for the external solver; duplicate
    /// triplets are summed.
    pub fn to_csr(&self) -> CsMat<f64> {
        let n = self.num_segments * NUM_WELL_EQ;
        let mut tri = TriMatI::<f64, usize>::new((n, n));
        for i in 0..self.vals.len() {
            tri.add_triplet(self.rows[i], self.cols[i], self.vals[i]);
        }
        tri.to_csr()
    }
}

/// Multi-segment well: per-segment primary variables, derived state,
/// residual assembly, and the convergence report.
pub struct MultiSegmentWell {
    name: String,
    segments: SegmentSet,
    perforations: Vec<Perforation>,
    config: MswConfig,
    /// Primary variables per segment: WQTotal [m³/s], water fraction,
    /// gas fraction, pressure [Pa]
    primary: Vec<[f64; NUM_WELL_EQ]>,
    /// Phase densities at segment conditions [kg/m³]
    phase_density: Vec<[f64; NUM_PHASES]>,
    /// Phase viscosities at segment conditions [Pa·s]
    phase_viscosity: Vec<[f64; NUM_PHASES]>,
    state: Vec<SegmentState>,
    system: WellLinearSystem,
}

impl MultiSegmentWell {
    pub fn new(
        name: impl Into<String>,
        segments: SegmentSet,
        perforations: Vec<Perforation>,
        config: MswConfig,
    ) -> Result<Self, SimError> {
        let n = segments.len();
        for (i, perf) in perforations.iter().enumerate() {
            if perf.segment >= n {
                return Err(SimError::Validation(format!(
                    "perforation {i}: segment {} out of range ({} segments)",
                    perf.segment, n
                )));
            }
        }
        Ok(MultiSegmentWell {
            name: name.into(),
            segments,
            perforations,
            config,
            primary: vec![[0.0; NUM_WELL_EQ]; n],
            phase_density: vec![[0.0; NUM_PHASES]; n],
            phase_viscosity: vec![[0.0; NUM_PHASES]; n],
            state: vec![SegmentState::empty(); n],
            system: WellLinearSystem::new(n),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segments(&self) -> &SegmentSet {
        &self.segments
    }

    pub fn perforations(&self) -> &[Perforation] {
        &self.perforations
    }

    pub fn set_primary(&mut self, segment: usize, values: [f64; NUM_WELL_EQ]) {
        self.primary[segment] = values;
    }

    pub fn primary(&self, segment: usize) -> &[f64; NUM_WELL_EQ] {
        &self.primary[segment]
    }

    /// Phase properties at segment conditions, from the PVT evaluation
    /// of the connected cells.
    pub fn set_phase_properties(
        &mut self,
        segment: usize,
        density: [f64; NUM_PHASES],
        viscosity: [f64; NUM_PHASES],
    ) {
        self.phase_density[segment] = density;
        self.phase_viscosity[segment] = viscosity;
    }

    pub fn segment_state(&self, segment: usize) -> &SegmentState {
        &self.state[segment]
    }

    pub fn linear_system(&self) -> &WellLinearSystem {
        &self.system
    }

    fn ad_var(&self, segment: usize, var: usize) -> AdScalar {
        AdScalar::variable(self.primary[segment][var], NUM_WELL_EQ, var)
    }

    /// Volume fractions (oil, water, gas) in the segment's own
    /// derivative domain; oil closes the sum to one.
    fn phase_fractions(&self, segment: usize) -> [AdScalar; NUM_PHASES] {
        let water = self.ad_var(segment, WATER_FRACTION);
        let gas = self.ad_var(segment, GAS_FRACTION);
        let oil = 1.0 - (&water + &gas);
        [oil, water, gas]
    }

    /// Per-component volumetric rates at segment conditions [m³/s].
    fn component_rates(&self, segment: usize) -> [AdScalar; NUM_PHASES] {
        let wq = self.ad_var(segment, WQ_TOTAL);
        let fractions = self.phase_fractions(segment);
        [
            &wq * &fractions[0],
            &wq * &fractions[1],
            &wq * &fractions[2],
        ]
    }

    /// Recompute derived quantities from the primary variables: mixture
    /// density/viscosity, mixed mass rate, the per-segment upwind choice,
    /// and perforation hydrostatic corrections.
    pub fn update_secondary_quantities(&mut self) {
        let n = self.segments.len();
        for s in 0..n {
            let fractions = self.phase_fractions(s);
            let mut density = AdScalar::constant(0.0, NUM_WELL_EQ);
            let mut viscosity = AdScalar::constant(0.0, NUM_WELL_EQ);
            for p in 0..NUM_PHASES {
                density = &density + &(&fractions[p] * self.phase_density[s][p]);
                viscosity = &viscosity + &(&fractions[p] * self.phase_viscosity[s][p]);
            }
            let mass_rate = &self.ad_var(s, WQ_TOTAL) * &density;
            self.state[s] = SegmentState {
                density,
                viscosity,
                mass_rate,
                upwind: s,
                drops: PressureDrops::default(),
            };
        }
        // Upwinding: flow toward the outlet takes the segment's own
        // state, reversed flow takes the outlet's. Fixed for the whole
        // residual evaluation.
        for s in 1..n {
            if self.state[s].mass_rate.value() < 0.0 {
                self.state[s].upwind = self.segments.get(s).outlet.expect("validated topology");
            }
        }
        for i in 0..self.perforations.len() {
            let seg = self.perforations[i].segment;
            let rho = self.state[seg].density.value();
            self.perforations[i].pressure_diff =
                rho * self.config.gravity * self.perforations[i].depth_diff;
        }
    }

    /// Density in segment `s`'s derivative domain: live when the upwind
    /// source is `s` itself, frozen when borrowed from the outlet.
    fn upwinded_density(&self, s: usize) -> AdScalar {
        let u = self.state[s].upwind;
        if u == s {
            self.state[s].density.clone()
        } else {
            self.state[u].density.frozen()
        }
    }

    fn upwinded_viscosity(&self, s: usize) -> AdScalar {
        let u = self.state[s].upwind;
        if u == s {
            self.state[s].viscosity.clone()
        } else {
            self.state[u].viscosity.frozen()
        }
    }

    /// Assemble the well equations at the current primary-variable state.
    ///
    /// Order per Newton step: derived quantities, then mass balances and
    /// pressure equations for every segment below the top, then the
    /// control equation on the top segment.
    ///
    /// `inverse_fvf` converts segment-condition rates to surface rates
    /// for surface-rate controls; `perforation_rates` are the frozen
    /// per-component reservoir inflows of each perforation [m³/s].
    pub fn assemble(
        &mut self,
        control: &WellControlSlot,
        inverse_fvf: &[f64; NUM_PHASES],
        perforation_rates: &[[f64; NUM_PHASES]],
    ) -> Result<(), SimError> {
        if perforation_rates.len() != self.perforations.len() {
            return Err(SimError::Validation(format!(
                "well {}: got {} perforation rates for {} perforations",
                self.name,
                perforation_rates.len(),
                self.perforations.len()
            )));
        }
        self.update_secondary_quantities();

        let n = self.segments.len();
        let mut system = WellLinearSystem::new(n);
        let mut drops = vec![PressureDrops::default(); n];

        // Mass balance per component: what leaves through this segment
        // minus what arrives from the inlets and the reservoir.
        for s in 0..n {
            let own = self.component_rates(s);
            for c in 0..NUM_PHASES {
                system.add_residual(s, c, own[c].value());
                for v in 0..NUM_WELL_EQ {
                    system.add_jacobian(s, s, c, v, own[c].derivative(v));
                }
            }
            for &inlet in &self.segments.get(s).inlets {
                let incoming = self.component_rates(inlet);
                for c in 0..NUM_PHASES {
                    system.add_residual(s, c, -incoming[c].value());
                    for v in 0..NUM_WELL_EQ {
                        system.add_jacobian(s, inlet, c, v, -incoming[c].derivative(v));
                    }
                }
            }
        }
        for (perf, rates) in self.perforations.iter().zip(perforation_rates) {
            for c in 0..NUM_PHASES {
                system.add_residual(perf.segment, c, -rates[c]);
            }
        }

        // Pressure equations for every segment below the top
        for s in 1..n {
            let segment = self.segments.get(s);
            let outlet = segment.outlet.expect("validated topology");

            if segment.segment_type == SegmentType::Valve
                && segment.valve.map(|v| v.status) == Some(ValveStatus::Shut)
            {
                // A shut valve pins the segment rate to zero and records
                // no pressure drop.
                let wq = self.ad_var(s, WQ_TOTAL);
                system.add_residual(s, SPRES, wq.value());
                for v in 0..NUM_WELL_EQ {
                    system.add_jacobian(s, s, SPRES, v, wq.derivative(v));
                }
                continue;
            }

            let pressure = self.ad_var(s, SPRES);
            let mass_rate = self.state[s].mass_rate.clone();
            let rho_upw = self.upwinded_density(s);
            let mu_upw = self.upwinded_viscosity(s);

            let local = match segment.segment_type {
                SegmentType::Regular => {
                    let hydro =
                        hydrostatic_drop(&rho_upw, segment.depth_change, self.config.gravity);
                    drops[s].hydrostatic = hydro.value();
                    let mut residual = &pressure - &hydro;
                    if self.config.friction_enabled {
                        let friction = friction_drop(segment, &mass_rate, &rho_upw, &mu_upw);
                        drops[s].friction = friction.value();
                        residual = &residual - &friction;
                    }
                    residual
                }
                SegmentType::SpiralIcd => {
                    let spec = segment.spiral_icd.as_ref().expect("validated device");
                    let device = spiral_icd_drop(spec, &mass_rate, &rho_upw, &mu_upw);
                    drops[s].friction = device.value();
                    &pressure - &device
                }
                SegmentType::AutoIcd => {
                    let spec = segment.auto_icd.as_ref().expect("validated device");
                    let device = auto_icd_drop(spec, &mass_rate, &rho_upw, &mu_upw);
                    drops[s].friction = device.value();
                    &pressure - &device
                }
                SegmentType::Valve => {
                    let spec = segment.valve.as_ref().expect("validated device");
                    let device = valve_drop(spec, &mass_rate, &rho_upw);
                    drops[s].friction = device.value();
                    &pressure - &device
                }
            };

            // Local part of E_p(s) lives in block (s, s)
            system.add_residual(s, SPRES, local.value());
            for v in 0..NUM_WELL_EQ {
                system.add_jacobian(s, s, SPRES, v, local.derivative(v));
            }
            // Outlet pressure couples block (s, outlet)
            system.add_residual(s, SPRES, -self.primary[outlet][SPRES]);
            system.add_jacobian(s, outlet, SPRES, SPRES, -1.0);

            if self.config.acceleration_enabled {
                // Velocity-head difference across the segment, sign
                // chosen by the flow direction.
                let sign = if mass_rate.value() >= 0.0 { -1.0 } else { 1.0 };
                let head = velocity_head(segment.cross_area, &mass_rate, &rho_upw);
                let mut accel_value = head.value();
                system.add_residual(s, SPRES, sign * head.value());
                for v in 0..NUM_WELL_EQ {
                    system.add_jacobian(s, s, SPRES, v, sign * head.derivative(v));
                }
                for &inlet in &segment.inlets {
                    let inlet_area = self.segments.get(inlet).cross_area.max(segment.cross_area);
                    let inlet_rate = self.state[inlet].mass_rate.clone();
                    let inlet_rho = self.upwinded_density(inlet);
                    let inlet_head = velocity_head(inlet_area, &inlet_rate, &inlet_rho);
                    accel_value -= inlet_head.value();
                    system.add_residual(s, SPRES, -sign * inlet_head.value());
                    for v in 0..NUM_WELL_EQ {
                        system.add_jacobian(s, inlet, SPRES, v, -sign * inlet_head.derivative(v));
                    }
                }
                drops[s].acceleration = sign * accel_value;
            }
        }

        // Top segment: the control equation replaces E_p(0)
        self.assemble_control_equation(&mut system, control, inverse_fvf);

        for (state, drop) in self.state.iter_mut().zip(drops) {
            state.drops = drop;
        }
        self.system = system;
        debug!("well {}: assembled {} segment equations", self.name, n);
        Ok(())
    }

    fn assemble_control_equation(
        &self,
        system: &mut WellLinearSystem,
        control: &WellControlSlot,
        inverse_fvf: &[f64; NUM_PHASES],
    ) {
        let residual = match control.control_type {
            WellControlType::Bhp | WellControlType::Thp => {
                self.ad_var(0, SPRES) - control.target
            }
            WellControlType::SurfaceRate => {
                let rates = self.component_rates(0);
                let mut sum = AdScalar::constant(-control.target, NUM_WELL_EQ);
                for p in 0..NUM_PHASES {
                    sum = &sum + &(&rates[p] * (control.phase_weights[p] * inverse_fvf[p]));
                }
                sum
            }
            WellControlType::ReservoirRate => {
                let rates = self.component_rates(0);
                let mut sum = AdScalar::constant(-control.target, NUM_WELL_EQ);
                for p in 0..NUM_PHASES {
                    sum = &sum + &(&rates[p] * control.phase_weights[p]);
                }
                sum
            }
        };
        system.add_residual(0, SPRES, residual.value());
        for v in 0..NUM_WELL_EQ {
            system.add_jacobian(0, 0, SPRES, v, residual.derivative(v));
        }
    }

    /// Build the multi-criterion convergence report: component maxima
    /// scaled by `b_avg`, the pressure-equation maximum over non-top
    /// segments, and the control equation against its own tolerance.
    pub fn convergence_report(
        &self,
        tolerances: &Tolerances,
        b_avg: &[f64; NUM_PHASES],
        control: &WellControlSlot,
    ) -> ConvergenceReport {
        let n = self.segments.len();
        let mut metrics = Vec::with_capacity(NUM_WELL_EQ);
        for c in 0..NUM_PHASES {
            let mut worst = 0.0_f64;
            for s in 0..n {
                let scaled = self.system.residual(s)[c].abs() * b_avg[c];
                if scaled.is_nan() {
                    worst = f64::NAN;
                    break;
                }
                worst = worst.max(scaled);
            }
            metrics.push(EquationMetric {
                equation: c,
                max_residual: worst,
                severity: tolerances.classify(worst, tolerances.tolerance_wells),
            });
        }

        let mut worst_pressure = 0.0_f64;
        for s in 1..n {
            let value = self.system.residual(s)[SPRES].abs();
            if value.is_nan() {
                worst_pressure = f64::NAN;
                break;
            }
            worst_pressure = worst_pressure.max(value);
        }
        metrics.push(EquationMetric {
            equation: SPRES,
            max_residual: worst_pressure,
            severity: tolerances.classify(worst_pressure, tolerances.tolerance_pressure_ms_wells),
        });

        let control_residual = self.system.residual(0)[SPRES].abs();
        let control_severity = tolerances.classify(
            control_residual,
            tolerances.control_tolerance(control.control_type),
        );

        ConvergenceReport {
            well: self.name.clone(),
            metrics,
            control_residual,
            control_severity,
        }
    }

    /// Damping measure for the outer Newton loop: above-tolerance
    /// residual/tolerance ratios summed over the well equations.
    pub fn residual_measure(
        &self,
        tolerances: &Tolerances,
        b_avg: &[f64; NUM_PHASES],
        control: &WellControlSlot,
    ) -> f64 {
        let report = self.convergence_report(tolerances, b_avg, control);
        let mut residuals: Vec<f64> = report.metrics.iter().map(|m| m.max_residual).collect();
        let mut tols = vec![tolerances.tolerance_wells; NUM_PHASES];
        tols.push(tolerances.tolerance_pressure_ms_wells);
        residuals.push(report.control_residual);
        tols.push(tolerances.control_tolerance(control.control_type));
        residual_measure(&residuals, &tols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::Severity;
    use crate::segment::{Segment, ValveSpec};
    use approx::assert_relative_eq;

    const WATER_DENSITY: f64 = 1000.0;

    fn uniform_props(well: &mut MultiSegmentWell) {
        for s in 0..well.num_segments() {
            well.set_phase_properties(
                s,
                [800.0, WATER_DENSITY, 100.0],
                [1.0e-3, 5.0e-4, 2.0e-5],
            );
        }
    }

    /// Top segment plus `extra` segments chained below it.
    fn chain(extra: usize) -> SegmentSet {
        let mut segments = vec![Segment::regular(0.01, 10.0, 0.0, None)];
        for i in 1..=extra {
            segments[i - 1].inlets = vec![i];
            segments.push(Segment::regular(0.01, 25.0, 20.0, Some(i - 1)));
        }
        SegmentSet::new(segments).unwrap()
    }

    fn bhp_control(target: f64) -> WellControlSlot {
        WellControlSlot::bhp(target)
    }

    #[test]
    fn hydrostatic_equilibrium_converges() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);

        // Pure water at rest: P(1) = P(0) + ρ·g·Δz balances exactly
        let p0 = 2.0e7;
        let p1 = p0 + WATER_DENSITY * 9.81 * 20.0;
        well.set_primary(0, [0.0, 1.0, 0.0, p0]);
        well.set_primary(1, [0.0, 1.0, 0.0, p1]);

        well.assemble(&bhp_control(p0), &[1.0; NUM_PHASES], &[]).unwrap();

        assert_relative_eq!(well.linear_system().residual(1)[SPRES], 0.0, epsilon = 1e-6);
        let report =
            well.convergence_report(&Tolerances::default(), &[1.0; NUM_PHASES], &bhp_control(p0));
        assert!(report.converged());
        assert_relative_eq!(
            well.segment_state(1).drops.hydrostatic,
            WATER_DENSITY * 9.81 * 20.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn bhp_control_equation_on_top_segment() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        well.set_primary(0, [0.0, 1.0, 0.0, 1.5e7]);
        well.set_primary(1, [0.0, 1.0, 0.0, 1.5e7]);

        well.assemble(&bhp_control(1.0e7), &[1.0; NUM_PHASES], &[]).unwrap();

        assert_relative_eq!(
            well.linear_system().residual(0)[SPRES],
            0.5e7,
            epsilon = 1e-3
        );
        let jac = well.linear_system().to_csr();
        assert_relative_eq!(*jac.get(SPRES, SPRES).unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn surface_rate_control_uses_weights_and_fvf() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        // Pure oil stream: fractions zero, oil closes to one
        well.set_primary(0, [-0.02, 0.0, 0.0, 1.0e7]);
        well.set_primary(1, [-0.02, 0.0, 0.0, 1.0e7]);

        let control = WellControlSlot {
            control_type: WellControlType::SurfaceRate,
            target: -0.01,
            phase_weights: [1.0, 0.0, 0.0],
        };
        let inverse_fvf = [0.8, 1.0, 100.0];
        well.assemble(&control, &inverse_fvf, &[]).unwrap();

        // q_o·b_o - target = -0.02·0.8 + 0.01
        assert_relative_eq!(
            well.linear_system().residual(0)[SPRES],
            -0.016 + 0.01,
            epsilon = 1e-12
        );
    }

    #[test]
    fn mass_balance_couples_inlet_blocks() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        // Identical rate and composition in both segments: balance closes
        well.set_primary(0, [-0.02, 0.3, 0.1, 1.0e7]);
        well.set_primary(1, [-0.02, 0.3, 0.1, 1.0e7]);

        well.assemble(&bhp_control(1.0e7), &[1.0; NUM_PHASES], &[]).unwrap();

        for c in 0..NUM_PHASES {
            assert_relative_eq!(well.linear_system().residual(0)[c], 0.0, epsilon = 1e-15);
        }
        // Water-component row of the top segment w.r.t. the inlet's
        // water fraction: -∂(wq·fw)/∂fw = +0.02
        let jac = well.linear_system().to_csr();
        let row = 0 * NUM_WELL_EQ + 1;
        let col = 1 * NUM_WELL_EQ + WATER_FRACTION;
        assert_relative_eq!(*jac.get(row, col).unwrap(), 0.02, epsilon = 1e-12);
    }

    #[test]
    fn shut_valve_pins_rate_to_zero() {
        let mut segments = vec![Segment::regular(0.01, 10.0, 0.0, None)];
        segments[0].inlets = vec![1];
        let mut valve = Segment::regular(0.01, 25.0, 20.0, Some(0));
        valve.segment_type = SegmentType::Valve;
        valve.valve = Some(ValveSpec {
            status: ValveStatus::Shut,
            cv: 0.7,
            constriction_area: 1.0e-4,
        });
        segments.push(valve);
        let set = SegmentSet::new(segments).unwrap();

        let mut well = MultiSegmentWell::new("P1", set, vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        well.set_primary(0, [0.0, 1.0, 0.0, 1.0e7]);
        well.set_primary(1, [0.004, 1.0, 0.0, 1.0e7]);

        well.assemble(&bhp_control(1.0e7), &[1.0; NUM_PHASES], &[]).unwrap();

        // Row encodes WQTotal(1) = 0
        assert_relative_eq!(
            well.linear_system().residual(1)[SPRES],
            0.004,
            epsilon = 1e-15
        );
        let jac = well.linear_system().to_csr();
        let row = 1 * NUM_WELL_EQ + SPRES;
        assert_relative_eq!(*jac.get(row, 1 * NUM_WELL_EQ + WQ_TOTAL).unwrap(), 1.0);
        assert!(jac.get(row, 0 * NUM_WELL_EQ + SPRES).is_none());

        let drops = well.segment_state(1).drops;
        assert_relative_eq!(drops.hydrostatic, 0.0);
        assert_relative_eq!(drops.friction, 0.0);
        assert_relative_eq!(drops.acceleration, 0.0);
    }

    #[test]
    fn upwinding_follows_flow_direction() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);

        well.set_primary(1, [0.01, 1.0, 0.0, 1.0e7]);
        well.update_secondary_quantities();
        assert_eq!(well.segment_state(1).upwind, 1);

        well.set_primary(1, [-0.01, 1.0, 0.0, 1.0e7]);
        well.update_secondary_quantities();
        assert_eq!(well.segment_state(1).upwind, 0);
    }

    #[test]
    fn perforation_rates_enter_mass_balance() {
        let mut well = MultiSegmentWell::new(
            "P1",
            chain(1),
            vec![Perforation::new(1, 42, 2.0)],
            MswConfig::default(),
        )
        .unwrap();
        uniform_props(&mut well);
        well.set_primary(0, [0.0, 1.0, 0.0, 1.0e7]);
        well.set_primary(1, [0.0, 1.0, 0.0, 1.0e7]);

        well.assemble(
            &bhp_control(1.0e7),
            &[1.0; NUM_PHASES],
            &[[0.0, -0.005, 0.0]],
        )
        .unwrap();

        assert_relative_eq!(
            well.linear_system().residual(1)[1],
            0.005,
            epsilon = 1e-15
        );
        // Hydrostatic correction toward the perforation uses the mixture
        // density of the owning segment
        assert_relative_eq!(
            well.perforations()[0].pressure_diff,
            WATER_DENSITY * 9.81 * 2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn nan_residual_is_reported_not_ignored() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        well.set_primary(0, [f64::NAN, 1.0, 0.0, 1.0e7]);
        well.set_primary(1, [0.0, 1.0, 0.0, 1.0e7]);

        well.assemble(&bhp_control(1.0e7), &[1.0; NUM_PHASES], &[]).unwrap();
        let report = well.convergence_report(
            &Tolerances::default(),
            &[1.0; NUM_PHASES],
            &bhp_control(1.0e7),
        );
        assert_eq!(report.worst_severity(), Severity::NotANumber);
        assert!(report.failed());
    }

    #[test]
    fn residual_measure_counts_only_exceedances() {
        let mut well =
            MultiSegmentWell::new("P1", chain(1), vec![], MswConfig::default()).unwrap();
        uniform_props(&mut well);
        let p0 = 2.0e7;
        let p1 = p0 + WATER_DENSITY * 9.81 * 20.0;
        well.set_primary(0, [0.0, 1.0, 0.0, p0]);
        well.set_primary(1, [0.0, 1.0, 0.0, p1]);
        well.assemble(&bhp_control(p0), &[1.0; NUM_PHASES], &[]).unwrap();
        let measure = well.residual_measure(
            &Tolerances::default(),
            &[1.0; NUM_PHASES],
            &bhp_control(p0),
        );
        assert_relative_eq!(measure, 0.0);

        // Off-target control: only that equation contributes
        well.assemble(&bhp_control(p0 - 1.0e6), &[1.0; NUM_PHASES], &[]).unwrap();
        let measure = well.residual_measure(
            &Tolerances::default(),
            &[1.0; NUM_PHASES],
            &bhp_control(p0 - 1.0e6),
        );
        let expected = 1.0e6 / Tolerances::default().tolerance_pressure_control;
        assert_relative_eq!(measure, expected, epsilon = 1e-9);
    }
}
