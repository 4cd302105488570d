use log::debug;
use serde::{Deserialize, Serialize};

use crate::ad::AdScalar;
use crate::error::SimError;
use crate::facade::{FaceDir, FluidFacade, GridFacade, LinearSystem};
use crate::influence::InfluenceTable;

/// Physical parameters of one Carter–Tracy analytical aquifer.
/// Immutable once constructed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AquiferParameters {
    pub id: usize,
    /// Porosity [dimensionless, 0-1]
    pub porosity: f64,
    /// Total (rock + water) compressibility [1/Pa]
    pub total_compressibility: f64,
    /// Inner radius at the reservoir boundary [m]
    pub inner_radius: f64,
    /// Aquifer permeability [m²]
    pub permeability: f64,
    /// Unit constant of the time-constant expression
    pub c1: f64,
    /// Unit constant of the influx-constant expression
    pub c2: f64,
    /// Net thickness [m]
    pub thickness: f64,
    /// Subtended angle as a fraction of the full circle [dimensionless, 0-1]
    pub angle_fraction: f64,
    /// Datum depth [m]
    pub datum_depth: f64,
    /// Initial aquifer pressure [Pa]. None: equilibrated from the
    /// connected cells at initialization
    pub initial_pressure: Option<f64>,
    /// Water PVT region resolved by the fluid facade
    pub water_pvt_table: usize,
    /// Influence table id; the table itself is handed to the constructor
    pub influence_table: usize,
}

impl AquiferParameters {
    /// Influx constant β = c₂·h·θ·φ·Cₜ·r₀² [m³/Pa]
    pub fn influx_constant(&self) -> f64 {
        self.c2
            * self.thickness
            * self.angle_fraction
            * self.porosity
            * self.total_compressibility
            * self.inner_radius.powi(2)
    }

    /// Time constant Tc = μ_w·φ·Cₜ·r₀² / (kₐ·c₁) [s]
    pub fn time_constant(&self, water_viscosity: f64) -> f64 {
        water_viscosity * self.porosity * self.total_compressibility * self.inner_radius.powi(2)
            / (self.permeability * self.c1)
    }
}

/// One boundary cell connected to the aquifer.
///
/// The derived fields are filled by `initialize_connections`; until then
/// they are zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AquiferCell {
    pub cell: usize,
    pub face_dir: FaceDir,
    /// Prescribed influx coefficient [m²]; defaults to the grid face area
    pub influx_coefficient: Option<f64>,
    /// Multiplier on the influx coefficient [dimensionless]
    pub influx_multiplier: f64,
    /// Effective face area after coefficient and multiplier [m²]
    #[serde(skip)]
    pub effective_face_area: f64,
    /// Cell-center depth [m]
    #[serde(skip)]
    pub depth: f64,
    /// αᵢ = face areaᵢ / Σ face areaⱼ; Σ αᵢ = 1
    #[serde(skip)]
    pub area_fraction: f64,
}

impl AquiferCell {
    pub fn new(cell: usize, face_dir: FaceDir) -> Self {
        AquiferCell {
            cell,
            face_dir,
            influx_coefficient: None,
            influx_multiplier: 1.0,
            effective_face_area: 0.0,
            depth: 0.0,
            area_fraction: 0.0,
        }
    }
}

/// Carter–Tracy aquifer: a time-convolution boundary source coupled
/// implicitly into the reservoir Jacobian.
///
/// Lifecycle per reporting step:
/// `begin_time_step` snapshots the previous water pressures,
/// `assemble` recomputes inflow and writes residual/Jacobian entries at
/// the connection footprint, `end_time_step` accumulates cumulative flux.
pub struct CarterTracyAquifer {
    params: AquiferParameters,
    table: InfluenceTable,
    connections: Vec<AquiferCell>,
    /// Water-component row index in the cell equation block
    water_equation: usize,
    /// Gravitational acceleration [m/s²]
    gravity: f64,

    /// Previous-step water pressures, frozen values [Pa]
    pressure_previous: Vec<f64>,
    /// Current water densities at the connections [kg/m³]
    density: Vec<AdScalar>,
    /// Current per-connection inflow Qᵢ [m³/s]
    inflow: Vec<AdScalar>,
    /// Cumulative influx W [m³]; only its frozen value feeds `a`
    cumulative_flux: f64,
    /// Resolved initial pressure p₀ [Pa]
    initial_pressure: f64,
    /// Effective aquifer water viscosity [Pa·s]
    water_viscosity: f64,
    time_constant: f64,
    influx_constant: f64,
    initialized: bool,
}

impl CarterTracyAquifer {
    pub fn new(
        params: AquiferParameters,
        table: InfluenceTable,
        connections: Vec<AquiferCell>,
        water_equation: usize,
        gravity: f64,
    ) -> Result<Self, SimError> {
        if connections.is_empty() {
            return Err(SimError::NoConnections { aquifer: params.id });
        }
        Ok(CarterTracyAquifer {
            params,
            table,
            connections,
            water_equation,
            gravity,
            pressure_previous: Vec::new(),
            density: Vec::new(),
            inflow: Vec::new(),
            cumulative_flux: 0.0,
            initial_pressure: 0.0,
            water_viscosity: 0.0,
            time_constant: 0.0,
            influx_constant: 0.0,
            initialized: false,
        })
    }

    /// Resolve connection geometry, area fractions, the effective
    /// viscosity, and the (possibly equilibrated) initial pressure.
    /// Called once at simulation start.
    pub fn initialize_connections(
        &mut self,
        fluid: &dyn FluidFacade,
        grid: &dyn GridFacade,
    ) -> Result<(), SimError> {
        let mut total_area = 0.0;
        for conn in &mut self.connections {
            let area = conn
                .influx_coefficient
                .unwrap_or_else(|| grid.face_area(conn.cell, conn.face_dir));
            conn.effective_face_area = area * conn.influx_multiplier;
            conn.depth = grid.cell_depth(conn.cell);
            total_area += conn.effective_face_area;
        }
        if total_area <= 0.0 || !total_area.is_finite() {
            return Err(SimError::Validation(format!(
                "aquifer {}: total connected face area must be positive and finite, got: {}",
                self.params.id, total_area
            )));
        }
        for conn in &mut self.connections {
            conn.area_fraction = conn.effective_face_area / total_area;
        }

        // Effective viscosity: area-weighted over the connections
        self.water_viscosity = self
            .connections
            .iter()
            .map(|c| fluid.water_viscosity(c.cell).value() * c.area_fraction)
            .sum();
        self.time_constant = self.params.time_constant(self.water_viscosity);
        self.influx_constant = self.params.influx_constant();

        // Defaulted p₀: area-weighted equilibration against the datum
        self.initial_pressure = match self.params.initial_pressure {
            Some(p0) => p0,
            None => self
                .connections
                .iter()
                .map(|c| {
                    let p_res = fluid.water_pressure(c.cell).value();
                    let rho = fluid.water_density(c.cell).value();
                    (p_res - rho * self.gravity * (c.depth - self.params.datum_depth))
                        * c.area_fraction
                })
                .sum(),
        };

        let n = fluid.num_primary_variables();
        self.pressure_previous = self
            .connections
            .iter()
            .map(|c| fluid.water_pressure(c.cell).value())
            .collect();
        self.density = self
            .connections
            .iter()
            .map(|c| fluid.water_density(c.cell))
            .collect();
        self.inflow = vec![AdScalar::constant(0.0, n); self.connections.len()];
        self.cumulative_flux = 0.0;
        self.initialized = true;

        debug!(
            "aquifer {}: initialized with {} connections, p0 = {:.6e} Pa, Tc = {:.6e} s",
            self.params.id,
            self.connections.len(),
            self.initial_pressure,
            self.time_constant
        );
        Ok(())
    }

    /// Snapshot the previous-step water pressures. Called at step begin.
    pub fn begin_time_step(&mut self, fluid: &dyn FluidFacade) {
        for (prev, conn) in self.pressure_previous.iter_mut().zip(&self.connections) {
            *prev = fluid.water_pressure(conn.cell).value();
        }
    }

    /// Recompute per-connection inflow at elapsed time `time` and step
    /// length `dt`, and write the water-component residual and Jacobian
    /// contributions at each connected cell.
    ///
    /// Only the current water pressure carries derivatives; the `a`, `b`
    /// coefficients and the previous pressure are frozen within the step.
    pub fn assemble(
        &mut self,
        fluid: &dyn FluidFacade,
        time: f64,
        dt: f64,
        system: &mut dyn LinearSystem,
    ) -> Result<(), SimError> {
        debug_assert!(self.initialized);
        let tc = self.time_constant;
        let beta = self.influx_constant;
        let td = time / tc;
        let td_end = (time + dt) / tc;
        let pi_td = self.table.dimensionless_pressure(td_end);
        let pi_td_slope = self.table.dimensionless_pressure_slope();

        let denominator = pi_td - td * pi_td_slope;
        if denominator <= 0.0 {
            // The fit no longer bounds the convolution; this is fatal
            return Err(SimError::InfluenceDenominator {
                aquifer: self.params.id,
                value: denominator,
            });
        }

        let num_vars = fluid.num_primary_variables();
        for (i, conn) in self.connections.iter().enumerate() {
            self.density[i] = fluid.water_density(conn.cell);
            let rho_w = self.density[i].value();

            // Potential drop, constant inside the step
            let dp_ai = self.initial_pressure
                + rho_w * self.gravity * (conn.depth - self.params.datum_depth)
                - self.pressure_previous[i];

            let a = (beta * dp_ai - self.cumulative_flux * pi_td_slope) / (tc * denominator);
            let b = beta / (tc * denominator);

            let p_curr = fluid.water_pressure(conn.cell);
            let inflow = (a - (p_curr - self.pressure_previous[i]) * b) * conn.area_fraction;

            system.add_residual(conn.cell, self.water_equation, -inflow.value());
            for k in 0..num_vars {
                system.add_jacobian(
                    conn.cell,
                    conn.cell,
                    self.water_equation,
                    k,
                    -inflow.derivative(k),
                );
            }
            self.inflow[i] = inflow;
        }
        Ok(())
    }

    /// Accumulate the cumulative influx W over the accepted step.
    pub fn end_time_step(&mut self, dt: f64) {
        let step_flux: f64 = self.inflow.iter().map(|q| q.value() * dt).sum();
        self.cumulative_flux += step_flux;
        debug!(
            "aquifer {}: step flux {:.6e} m3, cumulative {:.6e} m3",
            self.params.id, step_flux, self.cumulative_flux
        );
    }

    pub fn id(&self) -> usize {
        self.params.id
    }

    /// Cumulative influx W [m³]
    pub fn cumulative_flux(&self) -> f64 {
        self.cumulative_flux
    }

    /// Resolved initial pressure p₀ [Pa]
    pub fn initial_pressure(&self) -> f64 {
        self.initial_pressure
    }

    /// Current inflow of connection `i` [m³/s]
    pub fn inflow_rate(&self, i: usize) -> &AdScalar {
        &self.inflow[i]
    }

    /// Current water density at connection `i` [kg/m³]
    pub fn water_density(&self, i: usize) -> &AdScalar {
        &self.density[i]
    }

    pub fn connections(&self) -> &[AquiferCell] {
        &self.connections
    }
}
