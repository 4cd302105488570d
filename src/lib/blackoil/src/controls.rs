use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Active phases of the black-oil system.
pub const NUM_PHASES: usize = 3;

/// Rate targets and pressure limits use -1 for "unset".
pub const UNSET_TARGET: f64 = -1.0;

pub fn target_is_set(target: f64) -> bool {
    target >= 0.0
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum Phase {
    Oil,
    Water,
    Gas,
}

impl Phase {
    pub const ALL: [Phase; NUM_PHASES] = [Phase::Oil, Phase::Water, Phase::Gas];

    pub fn index(self) -> usize {
        match self {
            Phase::Oil => 0,
            Phase::Water => 1,
            Phase::Gas => 2,
        }
    }
}

/// Production control modes of a well or group.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ProductionControlMode {
    None,
    Orat,
    Wrat,
    Grat,
    Lrat,
    Crat,
    Resv,
    Prbl,
    Bhp,
    Thp,
    Grup,
    Fld,
}

/// Injection control modes of a well or group.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum InjectionControlMode {
    None,
    Rate,
    Resv,
    Bhp,
    Thp,
    Rein,
    Vrep,
    Grup,
    Fld,
}

/// What a group does when a production constraint is exceeded.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ProductionProcedure {
    /// Report the violation but change nothing.
    NoneP,
    /// Reapply the violated target as a group control over the subtree.
    Rate,
    /// Shut the worst-offending well.
    Well,
}

/// Control type of an installed per-well control slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum WellControlType {
    Bhp,
    Thp,
    ReservoirRate,
    SurfaceRate,
}

/// Production targets and limits of a tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductionSpec {
    pub control_mode: ProductionControlMode,
    /// Surface oil rate target [m³/s], -1 unset
    pub oil_target: f64,
    /// Surface water rate target [m³/s], -1 unset
    pub water_target: f64,
    /// Surface gas rate target [m³/s], -1 unset
    pub gas_target: f64,
    /// Surface liquid (oil+water) rate target [m³/s], -1 unset
    pub liquid_target: f64,
    /// Reservoir-volume rate target [m³/s], -1 unset
    pub resv_target: f64,
    /// Bottom-hole pressure limit [Pa], -1 unset
    pub bhp_limit: f64,
    /// Tubing-head pressure limit [Pa], -1 unset
    pub thp_limit: f64,
    /// A-priori weight used to split a parent target among siblings
    pub guide_rate: f64,
    pub procedure: ProductionProcedure,
}

impl Default for ProductionSpec {
    fn default() -> Self {
        ProductionSpec {
            control_mode: ProductionControlMode::None,
            oil_target: UNSET_TARGET,
            water_target: UNSET_TARGET,
            gas_target: UNSET_TARGET,
            liquid_target: UNSET_TARGET,
            resv_target: UNSET_TARGET,
            bhp_limit: UNSET_TARGET,
            thp_limit: UNSET_TARGET,
            guide_rate: 0.0,
            procedure: ProductionProcedure::NoneP,
        }
    }
}

impl ProductionSpec {
    /// The node's target in mode `mode` (>= 0), or -1 when unset.
    pub fn target_for(&self, mode: ProductionControlMode) -> f64 {
        match mode {
            ProductionControlMode::Orat => self.oil_target,
            ProductionControlMode::Wrat => self.water_target,
            ProductionControlMode::Grat => self.gas_target,
            ProductionControlMode::Lrat => self.liquid_target,
            ProductionControlMode::Resv => self.resv_target,
            ProductionControlMode::Bhp => self.bhp_limit,
            ProductionControlMode::Thp => self.thp_limit,
            _ => UNSET_TARGET,
        }
    }
}

/// Injection targets and limits of a tree node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InjectionSpec {
    pub control_mode: InjectionControlMode,
    /// Surface injection rate target [m³/s], -1 unset
    pub surface_target: f64,
    /// Reservoir-volume injection rate target [m³/s], -1 unset
    pub reservoir_target: f64,
    /// Bottom-hole pressure limit [Pa], -1 unset
    pub bhp_limit: f64,
    /// Tubing-head pressure limit [Pa], -1 unset
    pub thp_limit: f64,
    pub guide_rate: f64,
    /// Phase this node injects; selects the produced phase for REIN
    pub injected_phase: Phase,
    /// Fraction of produced phase volume reinjected under REIN
    pub reinjection_fraction: f64,
    /// Fraction of produced reservoir voidage replaced under VREP
    pub voidage_fraction: f64,
}

impl Default for InjectionSpec {
    fn default() -> Self {
        InjectionSpec {
            control_mode: InjectionControlMode::None,
            surface_target: UNSET_TARGET,
            reservoir_target: UNSET_TARGET,
            bhp_limit: UNSET_TARGET,
            thp_limit: UNSET_TARGET,
            guide_rate: 0.0,
            injected_phase: Phase::Water,
            reinjection_fraction: 1.0,
            voidage_fraction: 1.0,
        }
    }
}

impl InjectionSpec {
    /// The node's target in mode `mode` (>= 0), or -1 when unset.
    pub fn target_for(&self, mode: InjectionControlMode) -> f64 {
        match mode {
            InjectionControlMode::Rate => self.surface_target,
            InjectionControlMode::Resv => self.reservoir_target,
            InjectionControlMode::Bhp => self.bhp_limit,
            InjectionControlMode::Thp => self.thp_limit,
            _ => UNSET_TARGET,
        }
    }
}

/// Per-well phase rates at surface and reservoir conditions [m³/s].
/// Producers flow negative, injectors positive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WellRates {
    pub surface: [f64; NUM_PHASES],
    pub reservoir: [f64; NUM_PHASES],
}

impl WellRates {
    pub fn zero() -> Self {
        WellRates::default()
    }

    /// self += other * factor, phase by phase.
    pub fn add_scaled(&mut self, other: &WellRates, factor: f64) {
        for p in 0..NUM_PHASES {
            self.surface[p] += other.surface[p] * factor;
            self.reservoir[p] += other.reservoir[p] * factor;
        }
    }
}

/// Aggregate production rates by control mode.
///
/// Modes outside the table are a programmer error at this layer.
pub fn production_rate_by_mode(
    rates: &WellRates,
    mode: ProductionControlMode,
) -> Result<f64, SimError> {
    let surf = &rates.surface;
    match mode {
        ProductionControlMode::Orat => Ok(surf[Phase::Oil.index()]),
        ProductionControlMode::Wrat => Ok(surf[Phase::Water.index()]),
        ProductionControlMode::Grat => Ok(surf[Phase::Gas.index()]),
        ProductionControlMode::Lrat => {
            Ok(surf[Phase::Oil.index()] + surf[Phase::Water.index()])
        }
        ProductionControlMode::Resv => Ok(rates.reservoir.iter().sum()),
        _ => Err(SimError::UnhandledMode {
            node: "production rate aggregation".to_string(),
            mode: format!("{mode:?}"),
        }),
    }
}

/// Aggregate injection rates by control mode.
pub fn injection_rate_by_mode(
    rates: &WellRates,
    mode: InjectionControlMode,
) -> Result<f64, SimError> {
    match mode {
        InjectionControlMode::Rate => Ok(rates.surface.iter().sum()),
        InjectionControlMode::Resv => Ok(rates.reservoir.iter().sum()),
        _ => Err(SimError::UnhandledMode {
            node: "injection rate aggregation".to_string(),
            mode: format!("{mode:?}"),
        }),
    }
}

/// One entry of a well's control list. The active entry supplies the
/// top-segment control equation of the multi-segment well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WellControlSlot {
    pub control_type: WellControlType,
    /// Target rate [m³/s] or pressure [Pa], by control type
    pub target: f64,
    /// Per-phase weights of a rate target; zero for pressure controls
    pub phase_weights: [f64; NUM_PHASES],
}

impl WellControlSlot {
    pub fn bhp(target: f64) -> Self {
        WellControlSlot {
            control_type: WellControlType::Bhp,
            target,
            phase_weights: [0.0; NUM_PHASES],
        }
    }
}

/// Mutable control state of one well in the flat wells array.
///
/// The group engine mutates this through [`WellControls::install`]; the
/// multi-segment evaluator only reads the current slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WellControls {
    pub name: String,
    pub is_injector: bool,
    pub controls: Vec<WellControlSlot>,
    /// Index of the active control, if any
    pub current: Option<usize>,
    /// Cleared by a hard stop; a disabled well takes no part in a step
    pub enabled: bool,
    pub open: bool,
}

impl WellControls {
    pub fn new(name: impl Into<String>, is_injector: bool) -> Self {
        WellControls {
            name: name.into(),
            is_injector,
            controls: Vec::new(),
            current: None,
            enabled: true,
            open: true,
        }
    }

    /// Install a control slot: overwrite `slot_index` when it refers to an
    /// existing entry, append otherwise. Returns the slot index used.
    pub fn install(&mut self, slot_index: Option<usize>, slot: WellControlSlot) -> usize {
        match slot_index {
            Some(i) if i < self.controls.len() => {
                self.controls[i] = slot;
                i
            }
            _ => {
                self.controls.push(slot);
                self.controls.len() - 1
            }
        }
    }

    pub fn current_control(&self) -> Option<&WellControlSlot> {
        self.current.and_then(|i| self.controls.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn production_targets_by_mode() {
        let spec = ProductionSpec {
            oil_target: 10.0,
            liquid_target: 25.0,
            ..ProductionSpec::default()
        };
        assert_relative_eq!(spec.target_for(ProductionControlMode::Orat), 10.0);
        assert_relative_eq!(spec.target_for(ProductionControlMode::Lrat), 25.0);
        assert!(!target_is_set(spec.target_for(ProductionControlMode::Wrat)));
    }

    #[test]
    fn rate_aggregation_table() {
        let rates = WellRates {
            surface: [2.0, 3.0, 40.0],
            reservoir: [2.5, 3.0, 1.0],
        };
        assert_relative_eq!(
            production_rate_by_mode(&rates, ProductionControlMode::Orat).unwrap(),
            2.0
        );
        assert_relative_eq!(
            production_rate_by_mode(&rates, ProductionControlMode::Lrat).unwrap(),
            5.0
        );
        assert_relative_eq!(
            production_rate_by_mode(&rates, ProductionControlMode::Resv).unwrap(),
            6.5
        );
        assert_relative_eq!(
            injection_rate_by_mode(&rates, InjectionControlMode::Rate).unwrap(),
            45.0
        );
        assert!(production_rate_by_mode(&rates, ProductionControlMode::Bhp).is_err());
    }

    #[test]
    fn install_overwrites_recorded_slot() {
        let mut well = WellControls::new("P1", false);
        let first = well.install(None, WellControlSlot::bhp(1.0e7));
        assert_eq!(first, 0);
        let again = well.install(
            Some(first),
            WellControlSlot {
                control_type: WellControlType::SurfaceRate,
                target: -0.5,
                phase_weights: [1.0, 0.0, 0.0],
            },
        );
        assert_eq!(again, first);
        assert_eq!(well.controls.len(), 1);
        assert_eq!(
            well.controls[0].control_type,
            WellControlType::SurfaceRate
        );
    }
}
