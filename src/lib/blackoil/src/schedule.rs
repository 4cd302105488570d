use serde::{Deserialize, Serialize};

use crate::controls::{InjectionSpec, ProductionSpec, WellControls};
use crate::error::SimError;
use crate::group::{GroupControlConfig, NodeKind, TreeNode, WellGroupTree};
use crate::segment::{AutoIcdSpec, Segment, SegmentSet, SegmentType, SpiralIcdSpec, ValveSpec};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum WellType {
    Producer,
    Injector,
}

/// Declarative group definition: groups name their parent, children
/// lists are derived in declaration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupInput {
    pub name: String,
    /// None only for the root group
    pub parent: Option<String>,
    pub efficiency: f64,
    pub production: ProductionSpec,
    pub injection: InjectionSpec,
}

/// Declarative well definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WellInput {
    pub name: String,
    pub group: String,
    pub well_type: WellType,
    pub efficiency: f64,
    pub production: ProductionSpec,
    pub injection: InjectionSpec,
    /// Segment table for multi-segment wells; None for standard wells
    pub segments: Option<Vec<SegmentInput>>,
}

/// One row of a well's segment table. Inlets are derived from the
/// outlet pointers at build time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentInput {
    /// Outlet segment index; None only for the top segment (row 0)
    pub outlet: Option<usize>,
    /// Flow cross-section [m²]
    pub cross_area: f64,
    /// Length along the well path [m]
    pub length: f64,
    /// Depth increase from the outlet node [m]
    pub depth_change: f64,
    /// Hydraulic diameter [m]
    pub diameter: f64,
    /// Absolute roughness [m]
    pub roughness: f64,
    pub segment_type: SegmentType,
    pub valve: Option<ValveSpec>,
    pub spiral_icd: Option<SpiralIcdSpec>,
    pub auto_icd: Option<AutoIcdSpec>,
}

/// Per-time-step declarative schedule: the group tree and the wells.
/// The declaration order of `wells` defines the flat well indices.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStep {
    pub groups: Vec<GroupInput>,
    pub wells: Vec<WellInput>,
}

impl ScheduleStep {
    /// Build the group tree and the flat well-state array.
    pub fn build(
        &self,
        config: GroupControlConfig,
    ) -> Result<(WellGroupTree, Vec<WellControls>), SimError> {
        let mut nodes: Vec<TreeNode> = Vec::with_capacity(self.groups.len() + self.wells.len());
        let mut index_of = std::collections::HashMap::new();

        for group in &self.groups {
            let mut node = TreeNode::group(&group.name, group.efficiency);
            node.production = group.production.clone();
            node.injection = group.injection.clone();
            if index_of.insert(group.name.clone(), nodes.len()).is_some() {
                return Err(SimError::DuplicateNode(group.name.clone()));
            }
            nodes.push(node);
        }
        // Resolve group parents after all groups exist so declaration
        // order does not constrain the hierarchy
        for (i, group) in self.groups.iter().enumerate() {
            if let Some(parent_name) = &group.parent {
                let &parent = index_of
                    .get(parent_name)
                    .ok_or_else(|| SimError::UnknownNode(parent_name.clone()))?;
                nodes[i].parent = Some(parent);
                if let NodeKind::Group { children } = &mut nodes[parent].kind {
                    children.push(i);
                }
            }
        }

        let mut wells = Vec::with_capacity(self.wells.len());
        for (well_index, well) in self.wells.iter().enumerate() {
            let &parent = index_of
                .get(&well.group)
                .ok_or_else(|| SimError::UnknownNode(well.group.clone()))?;
            let mut node = TreeNode::well(&well.name, well.efficiency, well_index);
            node.production = well.production.clone();
            node.injection = well.injection.clone();
            node.parent = Some(parent);
            if index_of.insert(well.name.clone(), nodes.len()).is_some() {
                return Err(SimError::DuplicateNode(well.name.clone()));
            }
            let new_index = nodes.len();
            if let NodeKind::Group { children } = &mut nodes[parent].kind {
                children.push(new_index);
            } else {
                return Err(SimError::Validation(format!(
                    "well '{}': parent '{}' is not a group",
                    well.name, well.group
                )));
            }
            nodes.push(node);
            wells.push(WellControls::new(
                &well.name,
                well.well_type == WellType::Injector,
            ));
        }

        let tree = WellGroupTree::from_nodes(nodes, config)?;
        Ok((tree, wells))
    }

    /// Reconstruct the declarative form from a built tree, groups and
    /// wells depth-first. Wells keep their flat-array order.
    pub fn from_tree(tree: &WellGroupTree, wells: &[WellControls]) -> ScheduleStep {
        let mut groups = Vec::new();
        let mut tree_wells: Vec<(usize, WellInput)> = Vec::new();

        fn visit(
            tree: &WellGroupTree,
            index: usize,
            groups: &mut Vec<GroupInput>,
            tree_wells: &mut Vec<(usize, WellInput)>,
            wells: &[WellControls],
        ) {
            let node = tree.node(index);
            let parent_name = node.parent.map(|p| tree.node(p).name.clone());
            match &node.kind {
                NodeKind::Group { children } => {
                    groups.push(GroupInput {
                        name: node.name.clone(),
                        parent: parent_name,
                        efficiency: node.efficiency,
                        production: node.production.clone(),
                        injection: node.injection.clone(),
                    });
                    for &child in children {
                        visit(tree, child, groups, tree_wells, wells);
                    }
                }
                NodeKind::Well { well_index, .. } => {
                    tree_wells.push((
                        *well_index,
                        WellInput {
                            name: node.name.clone(),
                            group: parent_name.unwrap_or_default(),
                            well_type: if wells[*well_index].is_injector {
                                WellType::Injector
                            } else {
                                WellType::Producer
                            },
                            efficiency: node.efficiency,
                            production: node.production.clone(),
                            injection: node.injection.clone(),
                            segments: None,
                        },
                    ));
                }
            }
        }
        visit(tree, tree.root(), &mut groups, &mut tree_wells, wells);
        tree_wells.sort_by_key(|(well_index, _)| *well_index);

        ScheduleStep {
            groups,
            wells: tree_wells.into_iter().map(|(_, w)| w).collect(),
        }
    }
}

/// Build a validated segment set from a well's segment table, deriving
/// the inlets lists from the outlet pointers.
pub fn build_segments(inputs: &[SegmentInput]) -> Result<SegmentSet, SimError> {
    let mut segments: Vec<Segment> = inputs
        .iter()
        .map(|input| Segment {
            cross_area: input.cross_area,
            length: input.length,
            depth_change: input.depth_change,
            diameter: input.diameter,
            roughness: input.roughness,
            outlet: input.outlet,
            inlets: Vec::new(),
            segment_type: input.segment_type,
            valve: input.valve,
            spiral_icd: input.spiral_icd,
            auto_icd: input.auto_icd,
        })
        .collect();
    for i in 0..segments.len() {
        if let Some(outlet) = segments[i].outlet {
            if outlet >= segments.len() {
                return Err(SimError::InvalidSegment {
                    segment: i,
                    reason: format!("outlet {outlet} out of range"),
                });
            }
            segments[outlet].inlets.push(i);
        }
    }
    SegmentSet::new(segments)
}
