use serde::{Deserialize, Serialize};

use crate::ad::AdScalar;
use crate::error::SimError;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum SegmentType {
    Regular,
    SpiralIcd,
    AutoIcd,
    Valve,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ValveStatus {
    Open,
    Shut,
}

/// Flow-control valve inside a segment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValveSpec {
    pub status: ValveStatus,
    /// Discharge coefficient [dimensionless, typically 0.6-0.9]
    pub cv: f64,
    /// Constriction cross-section [m²]
    pub constriction_area: f64,
}

/// Spiral inflow-control device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpiralIcdSpec {
    /// Device strength: pressure drop per squared calibrated rate [Pa·s²/m⁶]
    pub strength: f64,
    /// Calibration fluid density [kg/m³]
    pub density_calibration: f64,
    /// Calibration fluid viscosity [Pa·s]
    pub viscosity_calibration: f64,
}

/// Autonomous inflow-control device.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct AutoIcdSpec {
    /// Device strength [Pa·(s/m³)^x]
    pub strength: f64,
    /// Calibration fluid density [kg/m³]
    pub density_calibration: f64,
    /// Calibration fluid viscosity [Pa·s]
    pub viscosity_calibration: f64,
    /// Flow-rate exponent x [dimensionless]
    pub flow_exponent: f64,
    /// Viscosity-ratio exponent y [dimensionless]
    pub viscosity_exponent: f64,
}

/// One discretisation unit of a multi-segment well.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Flow cross-section [m²]
    pub cross_area: f64,
    /// Length along the well path [m]
    pub length: f64,
    /// Depth increase from the outlet node to this node [m]
    pub depth_change: f64,
    /// Hydraulic diameter [m]
    pub diameter: f64,
    /// Absolute pipe roughness [m]
    pub roughness: f64,
    /// Segment toward the wellhead; None only for the top segment
    pub outlet: Option<usize>,
    /// Segments feeding into this one
    pub inlets: Vec<usize>,
    pub segment_type: SegmentType,
    pub valve: Option<ValveSpec>,
    pub spiral_icd: Option<SpiralIcdSpec>,
    pub auto_icd: Option<AutoIcdSpec>,
}

impl Segment {
    /// Plain pipe segment with the given geometry, outlet to `outlet`.
    pub fn regular(cross_area: f64, length: f64, depth_change: f64, outlet: Option<usize>) -> Self {
        Segment {
            cross_area,
            length,
            depth_change,
            diameter: 2.0 * (cross_area / std::f64::consts::PI).sqrt(),
            roughness: 1.0e-5,
            outlet,
            inlets: Vec::new(),
            segment_type: SegmentType::Regular,
            valve: None,
            spiral_icd: None,
            auto_icd: None,
        }
    }
}

/// Ordered segments forming a tree rooted at segment 0 (the wellhead).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentSet {
    segments: Vec<Segment>,
}

impl SegmentSet {
    /// Validates the outlet graph: segment 0 is the top (no outlet), all
    /// others reach 0 through their outlets without cycles, inlets lists
    /// mirror the outlet pointers, and device parameters match the type.
    pub fn new(segments: Vec<Segment>) -> Result<Self, SimError> {
        if segments.is_empty() {
            return Err(SimError::Validation(
                "segment set must contain at least the top segment".to_string(),
            ));
        }
        if segments[0].outlet.is_some() {
            return Err(SimError::InvalidSegment {
                segment: 0,
                reason: "top segment cannot have an outlet".to_string(),
            });
        }

        for (i, seg) in segments.iter().enumerate() {
            if i > 0 {
                match seg.outlet {
                    None => {
                        return Err(SimError::InvalidSegment {
                            segment: i,
                            reason: "only the top segment may lack an outlet".to_string(),
                        });
                    }
                    Some(o) if o >= segments.len() || o == i => {
                        return Err(SimError::InvalidSegment {
                            segment: i,
                            reason: format!("outlet {o} out of range"),
                        });
                    }
                    Some(o) => {
                        if !segments[o].inlets.contains(&i) {
                            return Err(SimError::InvalidSegment {
                                segment: i,
                                reason: format!("outlet {o} does not list it as inlet"),
                            });
                        }
                    }
                }
            }
            for &inlet in &seg.inlets {
                if inlet >= segments.len() || segments[inlet].outlet != Some(i) {
                    return Err(SimError::InvalidSegment {
                        segment: i,
                        reason: format!("inlet {inlet} does not point back via its outlet"),
                    });
                }
            }
            if seg.cross_area <= 0.0 || !seg.cross_area.is_finite() {
                return Err(SimError::InvalidSegment {
                    segment: i,
                    reason: format!("cross area must be positive and finite, got: {}", seg.cross_area),
                });
            }
            match seg.segment_type {
                SegmentType::Valve if seg.valve.is_none() => {
                    return Err(SimError::InvalidSegment {
                        segment: i,
                        reason: "valve segment without valve parameters".to_string(),
                    });
                }
                SegmentType::SpiralIcd if seg.spiral_icd.is_none() => {
                    return Err(SimError::InvalidSegment {
                        segment: i,
                        reason: "spiral ICD segment without device parameters".to_string(),
                    });
                }
                SegmentType::AutoIcd if seg.auto_icd.is_none() => {
                    return Err(SimError::InvalidSegment {
                        segment: i,
                        reason: "autonomous ICD segment without device parameters".to_string(),
                    });
                }
                _ => {}
            }
        }

        // Every segment must reach the top without revisiting a node
        for start in 1..segments.len() {
            let mut hops = 0;
            let mut current = start;
            while let Some(next) = segments[current].outlet {
                hops += 1;
                if hops > segments.len() {
                    return Err(SimError::InvalidSegment {
                        segment: start,
                        reason: "outlet chain does not reach the top segment".to_string(),
                    });
                }
                current = next;
            }
            if current != 0 {
                return Err(SimError::InvalidSegment {
                    segment: start,
                    reason: "outlet chain does not reach the top segment".to_string(),
                });
            }
        }

        Ok(SegmentSet { segments })
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }
}

// --- Pressure-drop kernels ---
//
// All kernels are written in AD; the caller decides the derivative
// domain by what it passes in, and freezes foreign-domain operands first.

/// Dynamic pressure of the stream through `area`:
/// v = ṁ/(ρ·A), head = ρ·v²/2 = ṁ²/(2·ρ·A²) [Pa]
pub fn velocity_head(area: f64, mass_rate: &AdScalar, density: &AdScalar) -> AdScalar {
    let squared = mass_rate * mass_rate;
    &squared / &(density * (2.0 * area * area))
}

/// Hydrostatic column over the segment's depth change [Pa]
pub fn hydrostatic_drop(density: &AdScalar, depth_change: f64, gravity: f64) -> AdScalar {
    density * (gravity * depth_change)
}

/// Darcy–Weisbach friction drop over the segment, signed with the flow
/// direction [Pa]. Laminar below Re = 2000, Haaland's explicit
/// correlation above.
pub fn friction_drop(segment: &Segment, mass_rate: &AdScalar, density: &AdScalar, viscosity: &AdScalar) -> AdScalar {
    let n = mass_rate.num_derivatives();
    let magnitude = mass_rate.abs();
    if magnitude.value() < 1.0e-12 {
        return AdScalar::constant(0.0, n);
    }

    // Re = ṁ·D/(A·μ)
    let reynolds = &(&magnitude * (segment.diameter / segment.cross_area)) / viscosity;

    let friction_factor = if reynolds.value() < 2000.0 {
        64.0 / reynolds
    } else {
        // 1/√f = -1.8·log10[(ε/(3.7·D))^1.11 + 6.9/Re]
        let roughness_term = (segment.roughness / (3.7 * segment.diameter)).powf(1.11);
        let argument = 6.9 / reynolds + roughness_term;
        let inv_sqrt = argument.ln() * (-1.8 / std::f64::consts::LN_10);
        1.0 / (&inv_sqrt * &inv_sqrt)
    };

    // ΔP = f·(L/D)·ṁ|ṁ|/(2·ρ·A²)
    let signed_head =
        &(mass_rate * &magnitude) / &(density * (2.0 * segment.cross_area * segment.cross_area));
    &friction_factor * &signed_head * (segment.length / segment.diameter)
}

/// Spiral ICD drop: strength scales the square of the calibrated
/// volumetric rate, corrected for the actual mixture density and a weak
/// quarter-power viscosity correction [Pa].
pub fn spiral_icd_drop(
    spec: &SpiralIcdSpec,
    mass_rate: &AdScalar,
    density: &AdScalar,
    viscosity: &AdScalar,
) -> AdScalar {
    let n = mass_rate.num_derivatives();
    if mass_rate.value().abs() < 1.0e-12 {
        return AdScalar::constant(0.0, n);
    }
    let calibrated_rate = mass_rate / spec.density_calibration;
    let signed_square = &calibrated_rate * &calibrated_rate.abs();
    let density_ratio = density / spec.density_calibration;
    let viscosity_ratio = (viscosity / spec.viscosity_calibration).powf(0.25);
    &(&signed_square * &density_ratio) * &viscosity_ratio * spec.strength
}

/// Autonomous ICD drop: like the spiral device but with a tunable
/// rate exponent x and viscosity-ratio exponent y [Pa].
pub fn auto_icd_drop(
    spec: &AutoIcdSpec,
    mass_rate: &AdScalar,
    density: &AdScalar,
    viscosity: &AdScalar,
) -> AdScalar {
    let n = mass_rate.num_derivatives();
    if mass_rate.value().abs() < 1.0e-12 {
        return AdScalar::constant(0.0, n);
    }
    let calibrated_rate = mass_rate / spec.density_calibration;
    // q·|q|^(x-1) keeps the sign for any exponent
    let signed_power = &calibrated_rate * &calibrated_rate.abs().powf(spec.flow_exponent - 1.0);
    let density_ratio = density / spec.density_calibration;
    let viscosity_ratio =
        (spec.viscosity_calibration / viscosity.clone()).powf(spec.viscosity_exponent);
    &(&signed_power * &density_ratio) * &viscosity_ratio * spec.strength
}

/// Open-valve drop through the constriction, Bernoulli inverted:
/// ΔP = ṁ|ṁ| / (2·ρ·(C_d·A_c)²) [Pa]
pub fn valve_drop(spec: &ValveSpec, mass_rate: &AdScalar, density: &AdScalar) -> AdScalar {
    let effective_area = spec.cv * spec.constriction_area;
    let signed_square = mass_rate * &mass_rate.abs();
    &signed_square / &(density * (2.0 * effective_area * effective_area))
}
