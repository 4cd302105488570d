use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::controls::{
    InjectionControlMode, InjectionSpec, NUM_PHASES, ProductionControlMode, ProductionProcedure,
    ProductionSpec, WellControlSlot, WellControlType, WellControls, WellRates,
    injection_rate_by_mode, production_rate_by_mode, target_is_set,
};
use crate::error::SimError;

/// Explicit configuration of the group engine, passed through the tree
/// constructor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupControlConfig {
    /// Shut wells by disabling them outright instead of installing a
    /// zero-rate control
    pub shut_wells_hard: bool,
    /// Install REIN targets as reservoir-rate instead of surface-rate
    /// controls
    pub rein_targets_reservoir_rate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Group {
        children: Vec<usize>,
    },
    Well {
        /// Index into the flat wells array
        well_index: usize,
        /// Control-list slot owned by group control, once installed
        group_slot: Option<usize>,
        shut: bool,
    },
}

/// One member of the group tree. Parent references are arena indices;
/// ownership flows root → children through the `Group` children lists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    /// Uptime factor applied multiplicatively along the path to the root
    pub efficiency: f64,
    pub production: ProductionSpec,
    pub injection: InjectionSpec,
    pub parent: Option<usize>,
    pub kind: NodeKind,
    /// True while the node runs on its own limits instead of a group
    /// target
    pub individual_control: bool,
    pub should_update_targets: bool,
}

impl TreeNode {
    pub fn group(name: impl Into<String>, efficiency: f64) -> Self {
        TreeNode {
            name: name.into(),
            efficiency,
            production: ProductionSpec::default(),
            injection: InjectionSpec::default(),
            parent: None,
            kind: NodeKind::Group {
                children: Vec::new(),
            },
            individual_control: true,
            should_update_targets: false,
        }
    }

    pub fn well(name: impl Into<String>, efficiency: f64, well_index: usize) -> Self {
        TreeNode {
            name: name.into(),
            efficiency,
            production: ProductionSpec::default(),
            injection: InjectionSpec::default(),
            parent: None,
            kind: NodeKind::Well {
                well_index,
                group_slot: None,
                shut: false,
            },
            individual_control: true,
            should_update_targets: false,
        }
    }

    pub fn is_well(&self) -> bool {
        matches!(self.kind, NodeKind::Well { .. })
    }
}

/// The group→well hierarchy with its recursive constraint and
/// target-allocation engine.
///
/// Rates are read from the caller's flat `WellRates` array (indexed by
/// each leaf's `well_index`); control mutations land in the matching
/// flat [`WellControls`] array. Producers flow negative, injectors
/// positive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WellGroupTree {
    nodes: Vec<TreeNode>,
    root: usize,
    config: GroupControlConfig,
}

impl WellGroupTree {
    /// Validate and adopt a node arena: exactly one root, and parent
    /// pointers consistent with the children lists.
    pub fn from_nodes(nodes: Vec<TreeNode>, config: GroupControlConfig) -> Result<Self, SimError> {
        let roots: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.parent.is_none())
            .map(|(i, _)| i)
            .collect();
        if roots.len() != 1 {
            return Err(SimError::RootCount(roots.len()));
        }
        for (i, node) in nodes.iter().enumerate() {
            for other in &nodes[i + 1..] {
                if other.name == node.name {
                    return Err(SimError::DuplicateNode(node.name.clone()));
                }
            }
            if let NodeKind::Group { children } = &node.kind {
                for &child in children {
                    if child >= nodes.len() || nodes[child].parent != Some(i) {
                        return Err(SimError::Validation(format!(
                            "group '{}': child {child} does not point back to it",
                            node.name
                        )));
                    }
                }
            }
            if let Some(parent) = node.parent {
                let owned = match nodes.get(parent).map(|p| &p.kind) {
                    Some(NodeKind::Group { children }) => children.contains(&i),
                    _ => false,
                };
                if !owned {
                    return Err(SimError::Validation(format!(
                        "node '{}': parent {parent} does not own it",
                        node.name
                    )));
                }
            }
        }
        Ok(WellGroupTree {
            nodes,
            root: roots[0],
            config,
        })
    }

    pub fn root(&self) -> usize {
        self.root
    }

    pub fn node(&self, index: usize) -> &TreeNode {
        &self.nodes[index]
    }

    pub fn node_mut(&mut self, index: usize) -> &mut TreeNode {
        &mut self.nodes[index]
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn config(&self) -> &GroupControlConfig {
        &self.config
    }

    /// Depth-first search by name, children in declaration order.
    pub fn find_node(&self, name: &str) -> Option<usize> {
        fn dfs(tree: &WellGroupTree, index: usize, name: &str) -> Option<usize> {
            if tree.nodes[index].name == name {
                return Some(index);
            }
            if let NodeKind::Group { children } = &tree.nodes[index].kind {
                for &child in children {
                    if let Some(found) = dfs(tree, child, name) {
                        return Some(found);
                    }
                }
            }
            None
        }
        dfs(self, self.root, name)
    }

    pub fn number_of_leaves(&self, index: usize) -> usize {
        match &self.nodes[index].kind {
            NodeKind::Well { .. } => 1,
            NodeKind::Group { children } => children
                .iter()
                .map(|&child| self.number_of_leaves(child))
                .sum(),
        }
    }

    /// Product of efficiency factors from the node up to the root.
    pub fn effective_efficiency(&self, index: usize) -> f64 {
        let mut factor = self.nodes[index].efficiency;
        let mut current = index;
        while let Some(parent) = self.nodes[current].parent {
            factor *= self.nodes[parent].efficiency;
            current = parent;
        }
        factor
    }

    /// Guide rate of a node. For a well: its spec's guide rate, zero when
    /// shut, and zero under `only_group` when the well is individually
    /// controlled (it cannot be redirected). For a group: the sum over
    /// children, so that Σ_children guideRate(false) equals the group's
    /// own guideRate(false) by construction.
    pub fn guide_rate(&self, index: usize, only_group: bool, injection: bool) -> f64 {
        match &self.nodes[index].kind {
            NodeKind::Well { shut, .. } => {
                if *shut || (only_group && self.nodes[index].individual_control) {
                    0.0
                } else if injection {
                    self.nodes[index].injection.guide_rate
                } else {
                    self.nodes[index].production.guide_rate
                }
            }
            NodeKind::Group { children } => children
                .iter()
                .map(|&child| self.guide_rate(child, only_group, injection))
                .sum(),
        }
    }

    /// Production rates aggregated into this node's frame: each child
    /// total enters scaled by the child's own efficiency factor.
    pub fn aggregate_production(
        &self,
        index: usize,
        wells: &[WellControls],
        well_rates: &[WellRates],
    ) -> WellRates {
        match &self.nodes[index].kind {
            NodeKind::Well { well_index, .. } => {
                if wells[*well_index].is_injector {
                    WellRates::zero()
                } else {
                    well_rates[*well_index]
                }
            }
            NodeKind::Group { children } => {
                let mut total = WellRates::zero();
                for &child in children {
                    let child_total = self.aggregate_production(child, wells, well_rates);
                    total.add_scaled(&child_total, self.nodes[child].efficiency);
                }
                total
            }
        }
    }

    /// Injection counterpart of [`WellGroupTree::aggregate_production`].
    pub fn aggregate_injection(
        &self,
        index: usize,
        wells: &[WellControls],
        well_rates: &[WellRates],
    ) -> WellRates {
        match &self.nodes[index].kind {
            NodeKind::Well { well_index, .. } => {
                if wells[*well_index].is_injector {
                    well_rates[*well_index]
                } else {
                    WellRates::zero()
                }
            }
            NodeKind::Group { children } => {
                let mut total = WellRates::zero();
                for &child in children {
                    let child_total = self.aggregate_injection(child, wells, well_rates);
                    total.add_scaled(&child_total, self.nodes[child].efficiency);
                }
                total
            }
        }
    }

    /// Bottom-up constraint pass. Returns false as soon as a violated
    /// constraint mutated the control state; the caller re-runs the
    /// Newton iteration and asks again.
    ///
    /// `well_bhp` holds each well's current top-segment pressure [Pa],
    /// indexed like the flat wells array; the leaf limit checks read it.
    pub fn conditions_met(
        &mut self,
        wells: &mut [WellControls],
        well_rates: &[WellRates],
        well_bhp: &[f64],
    ) -> Result<bool, SimError> {
        let root = self.root;
        let met = self.conditions_met_node(root, wells, well_rates, well_bhp)?;
        Ok(met.0)
    }

    fn conditions_met_node(
        &mut self,
        index: usize,
        wells: &mut [WellControls],
        well_rates: &[WellRates],
        well_bhp: &[f64],
    ) -> Result<(bool, WellRates, WellRates), SimError> {
        let kind = self.nodes[index].kind.clone();
        match kind {
            NodeKind::Well { well_index, .. } => {
                let rates = well_rates[well_index];
                let (production, injection) = if wells[well_index].is_injector {
                    (WellRates::zero(), rates)
                } else {
                    (rates, WellRates::zero())
                };
                if !self.nodes[index].individual_control
                    && self.check_well_limits(
                        index,
                        well_index,
                        wells,
                        &rates,
                        well_bhp[well_index],
                    )?
                {
                    return Ok((false, production, injection));
                }
                Ok((true, production, injection))
            }
            NodeKind::Group { children } => {
                let mut production = WellRates::zero();
                let mut injection = WellRates::zero();
                for &child in &children {
                    let (met, child_prod, child_inj) =
                        self.conditions_met_node(child, wells, well_rates, well_bhp)?;
                    if !met {
                        return Ok((false, production, injection));
                    }
                    let eff = self.nodes[child].efficiency;
                    production.add_scaled(&child_prod, eff);
                    injection.add_scaled(&child_inj, eff);
                }

                let active_injection = self.nodes[index].injection.control_mode;
                for mode in [InjectionControlMode::Rate, InjectionControlMode::Resv] {
                    if mode == active_injection {
                        continue;
                    }
                    let target = self.nodes[index].injection.target_for(mode);
                    if !target_is_set(target) || target <= 0.0 {
                        continue;
                    }
                    let current = injection_rate_by_mode(&injection, mode)?;
                    if current > target {
                        warn!(
                            "group '{}': injection {mode:?} target {target} exceeded ({current}); \
                             switching the subtree to {mode:?}",
                            self.nodes[index].name
                        );
                        self.apply_inj_group_control(index, mode, target, false, wells)?;
                        self.nodes[index].injection.control_mode = mode;
                        return Ok((false, production, injection));
                    }
                }

                let active_production = self.nodes[index].production.control_mode;
                for mode in [
                    ProductionControlMode::Orat,
                    ProductionControlMode::Wrat,
                    ProductionControlMode::Grat,
                    ProductionControlMode::Lrat,
                    ProductionControlMode::Resv,
                ] {
                    if mode == active_production {
                        continue;
                    }
                    let target = self.nodes[index].production.target_for(mode);
                    if !target_is_set(target) || target <= 0.0 {
                        continue;
                    }
                    let current = production_rate_by_mode(&production, mode)?.abs();
                    if current > target {
                        warn!(
                            "group '{}': production {mode:?} target {target} exceeded ({current}); \
                             applying procedure {:?}",
                            self.nodes[index].name, self.nodes[index].production.procedure
                        );
                        match self.nodes[index].production.procedure {
                            ProductionProcedure::Well => {
                                if let Some((worst, rate)) =
                                    self.worst_offending(index, mode, wells, well_rates)?
                                {
                                    debug!(
                                        "group '{}': shutting worst offender '{}' ({rate})",
                                        self.nodes[index].name, self.nodes[worst].name
                                    );
                                    self.shut_well(worst, wells)?;
                                }
                            }
                            ProductionProcedure::Rate => {
                                self.apply_prod_group_control(index, mode, target, false, wells)?;
                                self.nodes[index].production.control_mode = mode;
                            }
                            ProductionProcedure::NoneP => {}
                        }
                        return Ok((false, production, injection));
                    }
                }

                Ok((true, production, injection))
            }
        }
    }

    /// Append a well-local control slot and make it current; the well
    /// leaves group control.
    fn install_individual_control(
        &mut self,
        node_index: usize,
        well_index: usize,
        wells: &mut [WellControls],
        slot: WellControlSlot,
    ) {
        let installed = wells[well_index].install(None, slot);
        wells[well_index].current = Some(installed);
        self.nodes[node_index].individual_control = true;
    }

    /// Well-level limit check for a group-controlled well: a violated
    /// own limit (rate or pressure) flips the well back to individual
    /// control. `bhp` is the well's current top-segment pressure; THP
    /// limits are checked against the same pressure the control
    /// equation uses.
    fn check_well_limits(
        &mut self,
        node_index: usize,
        well_index: usize,
        wells: &mut [WellControls],
        rates: &WellRates,
        bhp: f64,
    ) -> Result<bool, SimError> {
        if wells[well_index].is_injector {
            for mode in [InjectionControlMode::Rate, InjectionControlMode::Resv] {
                let limit = self.nodes[node_index].injection.target_for(mode);
                if !target_is_set(limit) || limit <= 0.0 {
                    continue;
                }
                if injection_rate_by_mode(rates, mode)? > limit {
                    warn!(
                        "well '{}': own injection {mode:?} limit {limit} violated, \
                         leaving group control",
                        self.nodes[node_index].name
                    );
                    let control_type = if mode == InjectionControlMode::Resv {
                        WellControlType::ReservoirRate
                    } else {
                        WellControlType::SurfaceRate
                    };
                    let slot = WellControlSlot {
                        control_type,
                        target: limit,
                        phase_weights: [1.0; NUM_PHASES],
                    };
                    self.install_individual_control(node_index, well_index, wells, slot);
                    self.nodes[node_index].injection.control_mode = mode;
                    return Ok(true);
                }
            }
            // Injector pressure limits are upper bounds
            let pressure_limits = [
                (
                    self.nodes[node_index].injection.bhp_limit,
                    WellControlType::Bhp,
                    InjectionControlMode::Bhp,
                ),
                (
                    self.nodes[node_index].injection.thp_limit,
                    WellControlType::Thp,
                    InjectionControlMode::Thp,
                ),
            ];
            for (limit, control_type, mode) in pressure_limits {
                if target_is_set(limit) && bhp > limit {
                    warn!(
                        "well '{}': own {mode:?} limit {limit} violated ({bhp}), \
                         leaving group control",
                        self.nodes[node_index].name
                    );
                    let slot = WellControlSlot {
                        control_type,
                        target: limit,
                        phase_weights: [0.0; NUM_PHASES],
                    };
                    self.install_individual_control(node_index, well_index, wells, slot);
                    self.nodes[node_index].injection.control_mode = mode;
                    return Ok(true);
                }
            }
            return Ok(false);
        }

        for mode in [
            ProductionControlMode::Orat,
            ProductionControlMode::Wrat,
            ProductionControlMode::Grat,
            ProductionControlMode::Lrat,
            ProductionControlMode::Resv,
        ] {
            let limit = self.nodes[node_index].production.target_for(mode);
            if !target_is_set(limit) || limit <= 0.0 {
                continue;
            }
            if production_rate_by_mode(rates, mode)?.abs() > limit {
                warn!(
                    "well '{}': own {mode:?} limit {limit} violated, leaving group control",
                    self.nodes[node_index].name
                );
                let (control_type, weights) = production_distribution(mode)
                    .expect("modes above are all distributable");
                let slot = WellControlSlot {
                    control_type,
                    target: -limit,
                    phase_weights: weights,
                };
                self.install_individual_control(node_index, well_index, wells, slot);
                self.nodes[node_index].production.control_mode = mode;
                return Ok(true);
            }
        }
        // Producer pressure limits are lower bounds: drawdown past the
        // limit pulls the well onto pressure control
        let pressure_limits = [
            (
                self.nodes[node_index].production.bhp_limit,
                WellControlType::Bhp,
                ProductionControlMode::Bhp,
            ),
            (
                self.nodes[node_index].production.thp_limit,
                WellControlType::Thp,
                ProductionControlMode::Thp,
            ),
        ];
        for (limit, control_type, mode) in pressure_limits {
            if target_is_set(limit) && bhp < limit {
                warn!(
                    "well '{}': own {mode:?} limit {limit} violated ({bhp}), \
                     leaving group control",
                    self.nodes[node_index].name
                );
                let slot = WellControlSlot {
                    control_type,
                    target: limit,
                    phase_weights: [0.0; NUM_PHASES],
                };
                self.install_individual_control(node_index, well_index, wells, slot);
                self.nodes[node_index].production.control_mode = mode;
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Worst-offending producer under `index` in mode `mode`, bubbled by
    /// maximum absolute rate.
    pub fn worst_offending(
        &self,
        index: usize,
        mode: ProductionControlMode,
        wells: &[WellControls],
        well_rates: &[WellRates],
    ) -> Result<Option<(usize, f64)>, SimError> {
        match &self.nodes[index].kind {
            NodeKind::Well { well_index, shut, .. } => {
                if *shut || wells[*well_index].is_injector {
                    return Ok(None);
                }
                let rate = production_rate_by_mode(&well_rates[*well_index], mode)?;
                Ok(Some((index, rate)))
            }
            NodeKind::Group { children } => {
                let mut worst: Option<(usize, f64)> = None;
                for &child in children {
                    if let Some((node, rate)) =
                        self.worst_offending(child, mode, wells, well_rates)?
                    {
                        let replace = match worst {
                            None => true,
                            Some((_, current)) => rate.abs() > current.abs(),
                        };
                        if replace {
                            worst = Some((node, rate));
                        }
                    }
                }
                Ok(worst)
            }
        }
    }

    /// Distribute a production target of mode `mode` over the subtree in
    /// proportion to guide rates, dividing by each level's efficiency.
    ///
    /// With `only_group` the call is a refresh of an existing group
    /// control: it skips groups not under group control and wells under
    /// individual control.
    pub fn apply_prod_group_control(
        &mut self,
        index: usize,
        mode: ProductionControlMode,
        target: f64,
        only_group: bool,
        wells: &mut [WellControls],
    ) -> Result<(), SimError> {
        match self.nodes[index].kind.clone() {
            NodeKind::Group { children } => {
                if only_group
                    && self.nodes[index].production.control_mode != ProductionControlMode::Fld
                {
                    return Ok(());
                }
                let total_guide: f64 = children
                    .iter()
                    .map(|&child| self.guide_rate(child, only_group, false))
                    .sum();
                if total_guide <= 0.0 {
                    if !only_group && target > 0.0 {
                        return Err(SimError::ZeroGuideRate {
                            group: self.nodes[index].name.clone(),
                            target,
                        });
                    }
                    return Ok(());
                }
                let efficiency = self.nodes[index].efficiency;
                for &child in &children {
                    let guide = self.guide_rate(child, only_group, false);
                    if guide <= 0.0 {
                        continue;
                    }
                    let child_target = (target / efficiency) * guide / total_guide;
                    self.apply_prod_group_control(child, mode, child_target, false, wells)?;
                }
                self.nodes[index].production.control_mode = ProductionControlMode::Fld;
                Ok(())
            }
            NodeKind::Well {
                well_index,
                group_slot,
                ..
            } => {
                let (control_type, weights) = production_distribution(mode).ok_or_else(|| {
                    SimError::UnhandledMode {
                        node: self.nodes[index].name.clone(),
                        mode: format!("{mode:?}"),
                    }
                })?;
                // Producers flow negative; the installed target absorbs
                // the well's own efficiency factor.
                let slot = WellControlSlot {
                    control_type,
                    target: -(target / self.nodes[index].efficiency),
                    phase_weights: weights,
                };
                let installed = wells[well_index].install(group_slot, slot);
                if let NodeKind::Well { group_slot, .. } = &mut self.nodes[index].kind {
                    *group_slot = Some(installed);
                }
                wells[well_index].current = Some(installed);
                self.nodes[index].individual_control = false;
                self.nodes[index].production.control_mode = ProductionControlMode::Grup;
                Ok(())
            }
        }
    }

    /// Injection counterpart of
    /// [`WellGroupTree::apply_prod_group_control`]; injector targets stay
    /// positive.
    pub fn apply_inj_group_control(
        &mut self,
        index: usize,
        mode: InjectionControlMode,
        target: f64,
        only_group: bool,
        wells: &mut [WellControls],
    ) -> Result<(), SimError> {
        match self.nodes[index].kind.clone() {
            NodeKind::Group { children } => {
                if only_group
                    && self.nodes[index].injection.control_mode != InjectionControlMode::Fld
                {
                    return Ok(());
                }
                let total_guide: f64 = children
                    .iter()
                    .map(|&child| self.guide_rate(child, only_group, true))
                    .sum();
                if total_guide <= 0.0 {
                    if !only_group && target > 0.0 {
                        return Err(SimError::ZeroGuideRate {
                            group: self.nodes[index].name.clone(),
                            target,
                        });
                    }
                    return Ok(());
                }
                let efficiency = self.nodes[index].efficiency;
                for &child in &children {
                    let guide = self.guide_rate(child, only_group, true);
                    if guide <= 0.0 {
                        continue;
                    }
                    let child_target = (target / efficiency) * guide / total_guide;
                    self.apply_inj_group_control(child, mode, child_target, false, wells)?;
                }
                self.nodes[index].injection.control_mode = InjectionControlMode::Fld;
                Ok(())
            }
            NodeKind::Well {
                well_index,
                group_slot,
                ..
            } => {
                let control_type = match mode {
                    InjectionControlMode::Rate => WellControlType::SurfaceRate,
                    InjectionControlMode::Resv => WellControlType::ReservoirRate,
                    _ => {
                        return Err(SimError::UnhandledMode {
                            node: self.nodes[index].name.clone(),
                            mode: format!("{mode:?}"),
                        });
                    }
                };
                let slot = WellControlSlot {
                    control_type,
                    target: target / self.nodes[index].efficiency,
                    phase_weights: [1.0; NUM_PHASES],
                };
                let installed = wells[well_index].install(group_slot, slot);
                if let NodeKind::Well { group_slot, .. } = &mut self.nodes[index].kind {
                    *group_slot = Some(installed);
                }
                wells[well_index].current = Some(installed);
                self.nodes[index].individual_control = false;
                self.nodes[index].injection.control_mode = InjectionControlMode::Grup;
                Ok(())
            }
        }
    }

    /// Shut a well: hard-stop it when so configured, otherwise pin it to
    /// a zero surface rate and keep it open.
    pub fn shut_well(
        &mut self,
        index: usize,
        wells: &mut [WellControls],
    ) -> Result<(), SimError> {
        let NodeKind::Well {
            well_index,
            group_slot,
            ..
        } = self.nodes[index].kind.clone()
        else {
            return Err(SimError::Validation(format!(
                "cannot shut group '{}'",
                self.nodes[index].name
            )));
        };
        warn!("shutting well '{}'", self.nodes[index].name);
        if self.config.shut_wells_hard {
            wells[well_index].enabled = false;
            wells[well_index].open = false;
        } else {
            let slot = WellControlSlot {
                control_type: WellControlType::SurfaceRate,
                target: 0.0,
                phase_weights: [1.0; NUM_PHASES],
            };
            let installed = wells[well_index].install(group_slot, slot);
            if let NodeKind::Well { group_slot, .. } = &mut self.nodes[index].kind {
                *group_slot = Some(installed);
            }
            wells[well_index].current = Some(installed);
            wells[well_index].open = true;
        }
        if let NodeKind::Well { shut, .. } = &mut self.nodes[index].kind {
            *shut = true;
        }
        Ok(())
    }

    /// Explicit reinjection: redistribute a fraction of the subtree's
    /// produced phase volume as injection targets. Called once per step.
    pub fn apply_reinjection(
        &mut self,
        index: usize,
        wells: &mut [WellControls],
        well_rates: &[WellRates],
    ) -> Result<(), SimError> {
        let NodeKind::Group { children } = self.nodes[index].kind.clone() else {
            return Err(SimError::Validation(format!(
                "REIN applies to groups, not well '{}'",
                self.nodes[index].name
            )));
        };
        let phase = self.nodes[index].injection.injected_phase;
        let fraction = self.nodes[index].injection.reinjection_fraction;
        let produced = self
            .aggregate_production(index, wells, well_rates)
            .surface[phase.index()];
        let mode = if self.config.rein_targets_reservoir_rate {
            InjectionControlMode::Resv
        } else {
            InjectionControlMode::Rate
        };
        let total_guide: f64 = children
            .iter()
            .map(|&child| self.guide_rate(child, false, true))
            .sum();
        if total_guide <= 0.0 {
            let implied = -produced * fraction;
            if implied > 0.0 {
                return Err(SimError::ZeroGuideRate {
                    group: self.nodes[index].name.clone(),
                    target: implied,
                });
            }
            return Ok(());
        }
        let efficiency = self.nodes[index].efficiency;
        for &child in &children {
            let guide = self.guide_rate(child, false, true);
            if guide <= 0.0 {
                continue;
            }
            let target = (guide / total_guide) * (-produced) * fraction / efficiency;
            self.apply_inj_group_control(child, mode, target, false, wells)?;
        }
        Ok(())
    }

    /// Voidage replacement: match the subtree's reservoir-volume
    /// production with injection. Called once per step.
    pub fn apply_voidage_replacement(
        &mut self,
        index: usize,
        wells: &mut [WellControls],
        well_rates: &[WellRates],
    ) -> Result<(), SimError> {
        let NodeKind::Group { children } = self.nodes[index].kind.clone() else {
            return Err(SimError::Validation(format!(
                "VREP applies to groups, not well '{}'",
                self.nodes[index].name
            )));
        };
        let fraction = self.nodes[index].injection.voidage_fraction;
        let voidage: f64 = self
            .aggregate_production(index, wells, well_rates)
            .reservoir
            .iter()
            .sum();
        let total_guide: f64 = children
            .iter()
            .map(|&child| self.guide_rate(child, false, true))
            .sum();
        if total_guide <= 0.0 {
            let implied = -voidage * fraction;
            if implied > 0.0 {
                return Err(SimError::ZeroGuideRate {
                    group: self.nodes[index].name.clone(),
                    target: implied,
                });
            }
            return Ok(());
        }
        let efficiency = self.nodes[index].efficiency;
        for &child in &children {
            let guide = self.guide_rate(child, false, true);
            if guide <= 0.0 {
                continue;
            }
            let target = (guide / total_guide) * (-voidage) * fraction / efficiency;
            self.apply_inj_group_control(child, InjectionControlMode::Resv, target, false, wells)?;
        }
        Ok(())
    }

    /// Refresh the production targets of a group's group-controlled
    /// wells: take the parent-informed target, reserve what the
    /// individually-controlled producers already take, and split the
    /// remainder by guide rate.
    pub fn update_well_production_targets(
        &mut self,
        index: usize,
        wells: &mut [WellControls],
        well_rates: &[WellRates],
    ) -> Result<(), SimError> {
        let NodeKind::Group { children } = self.nodes[index].kind.clone() else {
            return Err(SimError::Validation(format!(
                "production target update applies to groups, not well '{}'",
                self.nodes[index].name
            )));
        };

        // Under FLD the governing mode and target live one level up.
        let (mode, target) = if self.nodes[index].production.control_mode
            == ProductionControlMode::Fld
        {
            match self.nodes[index].parent {
                Some(parent) => {
                    let mode = self.nodes[parent].production.control_mode;
                    (mode, self.nodes[parent].production.target_for(mode))
                }
                None => {
                    let mode = self.nodes[index].production.control_mode;
                    (mode, self.nodes[index].production.target_for(mode))
                }
            }
        } else {
            let mode = self.nodes[index].production.control_mode;
            (mode, self.nodes[index].production.target_for(mode))
        };
        if production_distribution(mode).is_none() || !target_is_set(target) {
            return Ok(());
        }

        let reserved = self.individually_controlled_production(index, mode, wells, well_rates)?;
        let remainder = (target - reserved).max(0.0);

        // Split the remainder over the redirectable children only;
        // `only_group` propagates so sub-groups running their own
        // control are left alone.
        let total_guide: f64 = children
            .iter()
            .map(|&child| self.guide_rate(child, true, false))
            .sum();
        if total_guide <= 0.0 {
            return Ok(());
        }
        let efficiency = self.nodes[index].efficiency;
        for &child in &children {
            let guide = self.guide_rate(child, true, false);
            if guide <= 0.0 {
                continue;
            }
            let child_target = (remainder / efficiency) * guide / total_guide;
            self.apply_prod_group_control(child, mode, child_target, true, wells)?;
        }
        self.clear_update_flags(index, wells);
        Ok(())
    }

    /// |rate·η| of the individually-controlled producers below `index`,
    /// expressed in the node's frame.
    fn individually_controlled_production(
        &self,
        index: usize,
        mode: ProductionControlMode,
        wells: &[WellControls],
        well_rates: &[WellRates],
    ) -> Result<f64, SimError> {
        match &self.nodes[index].kind {
            NodeKind::Well { well_index, .. } => {
                if wells[*well_index].is_injector || !self.nodes[index].individual_control {
                    Ok(0.0)
                } else {
                    Ok(production_rate_by_mode(&well_rates[*well_index], mode)?.abs())
                }
            }
            NodeKind::Group { children } => {
                let mut sum = 0.0;
                for &child in children {
                    sum += self
                        .individually_controlled_production(child, mode, wells, well_rates)?
                        * self.nodes[child].efficiency;
                }
                Ok(sum)
            }
        }
    }

    fn clear_update_flags(&mut self, index: usize, wells: &[WellControls]) {
        match self.nodes[index].kind.clone() {
            NodeKind::Well { well_index, .. } => {
                if !wells[well_index].is_injector && !self.nodes[index].individual_control {
                    self.nodes[index].should_update_targets = false;
                }
            }
            NodeKind::Group { children } => {
                for &child in &children {
                    self.clear_update_flags(child, wells);
                }
            }
        }
    }
}

/// Phase distribution and control type of a production group target.
fn production_distribution(
    mode: ProductionControlMode,
) -> Option<(WellControlType, [f64; NUM_PHASES])> {
    match mode {
        ProductionControlMode::Orat => Some((WellControlType::SurfaceRate, [1.0, 0.0, 0.0])),
        ProductionControlMode::Wrat => Some((WellControlType::SurfaceRate, [0.0, 1.0, 0.0])),
        ProductionControlMode::Grat => Some((WellControlType::SurfaceRate, [0.0, 0.0, 1.0])),
        ProductionControlMode::Lrat => Some((WellControlType::SurfaceRate, [1.0, 1.0, 0.0])),
        ProductionControlMode::Resv => Some((WellControlType::ReservoirRate, [1.0; NUM_PHASES])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{Phase, UNSET_TARGET};
    use approx::assert_relative_eq;

    /// Root group with two producer wells, guide rates 1 each.
    fn producer_pair(
        procedure: ProductionProcedure,
        oil_target: f64,
    ) -> (WellGroupTree, Vec<WellControls>) {
        let mut root = TreeNode::group("FIELD", 1.0);
        root.production.oil_target = oil_target;
        root.production.procedure = procedure;
        if let NodeKind::Group { children } = &mut root.kind {
            children.extend([1, 2]);
        }
        let mut p1 = TreeNode::well("P1", 1.0, 0);
        p1.parent = Some(0);
        p1.production.guide_rate = 1.0;
        let mut p2 = TreeNode::well("P2", 1.0, 1);
        p2.parent = Some(0);
        p2.production.guide_rate = 1.0;

        let tree = WellGroupTree::from_nodes(
            vec![root, p1, p2],
            GroupControlConfig::default(),
        )
        .unwrap();
        let wells = vec![WellControls::new("P1", false), WellControls::new("P2", false)];
        (tree, wells)
    }

    fn oil_rate(rate: f64) -> WellRates {
        let mut rates = WellRates::zero();
        rates.surface[Phase::Oil.index()] = rate;
        rates.reservoir[Phase::Oil.index()] = rate * 1.1;
        rates
    }

    #[test]
    fn tree_structure_queries() {
        let (tree, _) = producer_pair(ProductionProcedure::Rate, 100.0);
        assert_eq!(tree.find_node("P2"), Some(2));
        assert_eq!(tree.find_node("missing"), None);
        assert_eq!(tree.number_of_leaves(tree.root()), 2);
    }

    #[test]
    fn rejects_inconsistent_parents() {
        let mut root = TreeNode::group("FIELD", 1.0);
        if let NodeKind::Group { children } = &mut root.kind {
            children.push(1);
        }
        // Child claims no parent: two roots
        let orphan = TreeNode::well("P1", 1.0, 0);
        assert!(matches!(
            WellGroupTree::from_nodes(vec![root, orphan], GroupControlConfig::default()),
            Err(SimError::RootCount(2))
        ));
    }

    #[test]
    fn guide_rate_sums_to_parent() {
        let (tree, _) = producer_pair(ProductionProcedure::Rate, 100.0);
        let child_sum: f64 = [1, 2]
            .iter()
            .map(|&c| tree.guide_rate(c, false, false))
            .sum();
        assert_relative_eq!(child_sum, tree.guide_rate(tree.root(), false, false));
    }

    #[test]
    fn orat_violation_reapplies_rate_target() {
        // Group target 100, rates {80, 30}: violated, procedure RATE
        // splits 50/50; the next pass with honored targets is clean.
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Rate, 100.0);
        let rates = vec![oil_rate(-80.0), oil_rate(-30.0)];
        let bhp = vec![2.0e7; 2];
        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());

        for well in &wells {
            let slot = well.current_control().unwrap();
            assert_eq!(slot.control_type, WellControlType::SurfaceRate);
            assert_relative_eq!(slot.target, -50.0);
            assert_relative_eq!(slot.phase_weights[Phase::Oil.index()], 1.0);
        }
        assert_eq!(
            tree.node(tree.root()).production.control_mode,
            ProductionControlMode::Orat
        );
        assert!(!tree.node(1).individual_control);

        let honored = vec![oil_rate(-50.0), oil_rate(-50.0)];
        assert!(tree.conditions_met(&mut wells, &honored, &bhp).unwrap());
    }

    #[test]
    fn well_procedure_shuts_worst_offender() {
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Well, 100.0);
        let rates = vec![oil_rate(-80.0), oil_rate(-30.0)];
        let bhp = vec![2.0e7; 2];

        let (worst, rate) = tree
            .worst_offending(tree.root(), ProductionControlMode::Orat, &wells, &rates)
            .unwrap()
            .unwrap();
        assert_eq!(tree.node(worst).name, "P1");
        assert_relative_eq!(rate.abs(), 80.0);

        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());
        let slot = wells[0].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::SurfaceRate);
        assert_relative_eq!(slot.target, 0.0);
        assert!(wells[0].open);
        assert!(matches!(
            tree.node(worst).kind,
            NodeKind::Well { shut: true, .. }
        ));
    }

    #[test]
    fn hard_stop_disables_the_well() {
        let mut root = TreeNode::group("FIELD", 1.0);
        if let NodeKind::Group { children } = &mut root.kind {
            children.push(1);
        }
        let mut p1 = TreeNode::well("P1", 1.0, 0);
        p1.parent = Some(0);
        let mut tree = WellGroupTree::from_nodes(
            vec![root, p1],
            GroupControlConfig {
                shut_wells_hard: true,
                ..GroupControlConfig::default()
            },
        )
        .unwrap();
        let mut wells = vec![WellControls::new("P1", false)];
        tree.shut_well(1, &mut wells).unwrap();
        assert!(!wells[0].enabled);
        assert!(!wells[0].open);
    }

    #[test]
    fn group_target_with_efficiencies_meets_invariant() {
        // Group η = 0.8, wells η = 0.5: the aggregated rate under the
        // applied control equals T/η_group.
        let mut root = TreeNode::group("FIELD", 0.8);
        root.production.procedure = ProductionProcedure::Rate;
        if let NodeKind::Group { children } = &mut root.kind {
            children.extend([1, 2]);
        }
        let mut p1 = TreeNode::well("P1", 0.5, 0);
        p1.parent = Some(0);
        p1.production.guide_rate = 1.0;
        let mut p2 = TreeNode::well("P2", 0.5, 1);
        p2.parent = Some(0);
        p2.production.guide_rate = 1.0;
        let mut tree = WellGroupTree::from_nodes(
            vec![root, p1, p2],
            GroupControlConfig::default(),
        )
        .unwrap();
        let mut wells = vec![WellControls::new("P1", false), WellControls::new("P2", false)];

        let target = 100.0;
        tree.apply_prod_group_control(0, ProductionControlMode::Orat, target, false, &mut wells)
            .unwrap();
        assert_eq!(
            tree.node(0).production.control_mode,
            ProductionControlMode::Fld
        );

        // Each well honors its installed target
        let honored: Vec<WellRates> = wells
            .iter()
            .map(|w| oil_rate(w.current_control().unwrap().target))
            .collect();
        let aggregated = tree.aggregate_production(0, &wells, &honored);
        let rate = production_rate_by_mode(&aggregated, ProductionControlMode::Orat)
            .unwrap()
            .abs();
        assert_relative_eq!(rate, target / 0.8, epsilon = 1e-12);
    }

    #[test]
    fn zero_guide_rate_with_nonzero_target_is_fatal() {
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Rate, 100.0);
        tree.node_mut(1).production.guide_rate = 0.0;
        tree.node_mut(2).production.guide_rate = 0.0;
        let err = tree
            .apply_prod_group_control(0, ProductionControlMode::Orat, 50.0, false, &mut wells)
            .unwrap_err();
        assert!(matches!(err, SimError::ZeroGuideRate { .. }));
    }

    #[test]
    fn voidage_replacement_targets_injector() {
        // Total reservoir production -50, voidage fraction 1: the single
        // injector gets a reservoir-rate target of 50/η.
        let mut root = TreeNode::group("FIELD", 1.0);
        root.injection.voidage_fraction = 1.0;
        if let NodeKind::Group { children } = &mut root.kind {
            children.extend([1, 2]);
        }
        let mut producer = TreeNode::well("P1", 1.0, 0);
        producer.parent = Some(0);
        producer.production.guide_rate = 1.0;
        let mut injector = TreeNode::well("I1", 0.5, 1);
        injector.parent = Some(0);
        injector.injection.guide_rate = 1.0;
        let mut tree = WellGroupTree::from_nodes(
            vec![root, producer, injector],
            GroupControlConfig::default(),
        )
        .unwrap();
        let mut wells = vec![WellControls::new("P1", false), WellControls::new("I1", true)];

        let mut produced = WellRates::zero();
        produced.reservoir = [-30.0, -15.0, -5.0];
        let rates = vec![produced, WellRates::zero()];

        tree.apply_voidage_replacement(0, &mut wells, &rates).unwrap();
        let slot = wells[1].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::ReservoirRate);
        assert_relative_eq!(slot.target, 50.0 / 0.5, epsilon = 1e-12);
    }

    #[test]
    fn reinjection_splits_produced_phase() {
        let mut root = TreeNode::group("FIELD", 1.0);
        root.injection.injected_phase = Phase::Water;
        root.injection.reinjection_fraction = 0.5;
        if let NodeKind::Group { children } = &mut root.kind {
            children.extend([1, 2]);
        }
        let mut producer = TreeNode::well("P1", 1.0, 0);
        producer.parent = Some(0);
        producer.production.guide_rate = 1.0;
        let mut injector = TreeNode::well("I1", 1.0, 1);
        injector.parent = Some(0);
        injector.injection.guide_rate = 1.0;
        let mut tree = WellGroupTree::from_nodes(
            vec![root, producer, injector],
            GroupControlConfig::default(),
        )
        .unwrap();
        let mut wells = vec![WellControls::new("P1", false), WellControls::new("I1", true)];

        let mut produced = WellRates::zero();
        produced.surface[Phase::Water.index()] = -40.0;
        let rates = vec![produced, WellRates::zero()];

        tree.apply_reinjection(0, &mut wells, &rates).unwrap();
        let slot = wells[1].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::SurfaceRate);
        assert_relative_eq!(slot.target, 20.0, epsilon = 1e-12);
    }

    #[test]
    fn production_target_update_reserves_individual_wells() {
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Rate, 100.0);
        tree.node_mut(0).production.control_mode = ProductionControlMode::Orat;

        // P1 runs on its own limits at 30; only P2 can be redirected,
        // so the group control must be applied first to mark it.
        tree.apply_prod_group_control(0, ProductionControlMode::Orat, 100.0, false, &mut wells)
            .unwrap();
        tree.node_mut(0).production.control_mode = ProductionControlMode::Orat;
        tree.node_mut(1).individual_control = true;
        tree.node_mut(2).should_update_targets = true;

        let rates = vec![oil_rate(-30.0), oil_rate(-50.0)];
        tree.update_well_production_targets(0, &mut wells, &rates)
            .unwrap();

        // Remainder 70 goes entirely to the group-controlled producer
        let slot = wells[1].current_control().unwrap();
        assert_relative_eq!(slot.target, -70.0, epsilon = 1e-12);
        assert!(!tree.node(2).should_update_targets);
        // The individually-controlled well keeps its own slot untouched
        assert!(tree.node(1).individual_control);
    }

    #[test]
    fn group_controlled_well_leaves_on_own_limit_violation() {
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Rate, 1000.0);
        // Put both wells under group control first
        tree.apply_prod_group_control(0, ProductionControlMode::Orat, 200.0, false, &mut wells)
            .unwrap();
        assert!(!tree.node(1).individual_control);

        // P1's own oil limit is tighter than its share
        tree.node_mut(1).production.oil_target = 60.0;
        let rates = vec![oil_rate(-100.0), oil_rate(-100.0)];
        let bhp = vec![2.0e7; 2];
        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());
        assert!(tree.node(1).individual_control);
        assert_eq!(
            tree.node(1).production.control_mode,
            ProductionControlMode::Orat
        );
        let slot = wells[0].current_control().unwrap();
        assert_relative_eq!(slot.target, -60.0);
    }

    #[test]
    fn group_controlled_producer_reverts_on_bhp_limit() {
        let (mut tree, mut wells) = producer_pair(ProductionProcedure::Rate, 1000.0);
        tree.apply_prod_group_control(0, ProductionControlMode::Orat, 100.0, false, &mut wells)
            .unwrap();
        assert!(!tree.node(1).individual_control);

        // P1 is drawn down below its BHP floor
        tree.node_mut(1).production.bhp_limit = 1.5e7;
        let rates = vec![oil_rate(-50.0), oil_rate(-50.0)];
        let bhp = vec![1.2e7, 2.0e7];
        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());

        assert!(tree.node(1).individual_control);
        assert_eq!(
            tree.node(1).production.control_mode,
            ProductionControlMode::Bhp
        );
        let slot = wells[0].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::Bhp);
        assert_relative_eq!(slot.target, 1.5e7);
        // P2 stays under group control
        assert!(!tree.node(2).individual_control);
    }

    #[test]
    fn group_controlled_injector_reverts_on_own_limits() {
        let mut root = TreeNode::group("FIELD", 1.0);
        if let NodeKind::Group { children } = &mut root.kind {
            children.extend([1, 2]);
        }
        let mut producer = TreeNode::well("P1", 1.0, 0);
        producer.parent = Some(0);
        producer.production.guide_rate = 1.0;
        let mut injector = TreeNode::well("I1", 1.0, 1);
        injector.parent = Some(0);
        injector.injection.guide_rate = 1.0;
        let mut tree = WellGroupTree::from_nodes(
            vec![root, producer, injector],
            GroupControlConfig::default(),
        )
        .unwrap();
        let mut wells = vec![WellControls::new("P1", false), WellControls::new("I1", true)];

        tree.apply_inj_group_control(0, InjectionControlMode::Rate, 40.0, false, &mut wells)
            .unwrap();
        assert!(!tree.node(2).individual_control);

        // The injector's own surface-rate limit is tighter than the
        // installed group target
        tree.node_mut(2).injection.surface_target = 30.0;
        let mut injected = WellRates::zero();
        injected.surface[Phase::Water.index()] = 40.0;
        let rates = vec![oil_rate(-40.0), injected];
        let bhp = vec![2.0e7, 2.0e7];
        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());

        assert!(tree.node(2).individual_control);
        assert_eq!(
            tree.node(2).injection.control_mode,
            InjectionControlMode::Rate
        );
        let slot = wells[1].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::SurfaceRate);
        assert_relative_eq!(slot.target, 30.0);

        // Second pass: rate honored, but the injector now exceeds its
        // BHP ceiling
        tree.node_mut(2).individual_control = false;
        tree.node_mut(2).injection.surface_target = UNSET_TARGET;
        tree.node_mut(2).injection.bhp_limit = 1.8e7;
        injected.surface[Phase::Water.index()] = 30.0;
        let rates = vec![oil_rate(-40.0), injected];
        assert!(!tree.conditions_met(&mut wells, &rates, &bhp).unwrap());

        assert!(tree.node(2).individual_control);
        assert_eq!(
            tree.node(2).injection.control_mode,
            InjectionControlMode::Bhp
        );
        let slot = wells[1].current_control().unwrap();
        assert_eq!(slot.control_type, WellControlType::Bhp);
        assert_relative_eq!(slot.target, 1.8e7);
    }
}
