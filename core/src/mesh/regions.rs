use crate::config::Region;

/// One regulated sub-band: frequencies in [start, end) share a duty
/// cycle budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubBand {
    pub start_mhz: f64,
    pub end_mhz: f64,
    pub duty_cycle_percent: f64,
}

impl SubBand {
    pub fn contains(&self, frequency_mhz: f64) -> bool {
        frequency_mhz >= self.start_mhz && frequency_mhz < self.end_mhz
    }
}

/// The regulatory regime a region imposes on transmissions.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionConstraint {
    /// Per-sub-band duty cycle over a sliding window.
    DutyCycle {
        sub_bands: Vec<SubBand>,
        window_ms: u64,
    },
    /// No duty cycle; a per-transmission dwell-time cap applies when
    /// frequency hopping (US-style).
    DwellTime { max_dwell_ms: u64 },
    Unlimited,
}

/// ETSI EN 300 220 sub-bands for the 868 MHz SRD range.
fn eu_sub_bands() -> Vec<SubBand> {
    vec![
        SubBand {
            start_mhz: 863.0,
            end_mhz: 865.0,
            duty_cycle_percent: 0.1,
        },
        SubBand {
            start_mhz: 865.0,
            end_mhz: 868.0,
            duty_cycle_percent: 1.0,
        },
        SubBand {
            start_mhz: 868.0,
            end_mhz: 868.6,
            duty_cycle_percent: 1.0,
        },
        SubBand {
            start_mhz: 868.7,
            end_mhz: 869.2,
            duty_cycle_percent: 0.1,
        },
        SubBand {
            start_mhz: 869.4,
            end_mhz: 869.65,
            duty_cycle_percent: 10.0,
        },
        SubBand {
            start_mhz: 869.7,
            end_mhz: 870.0,
            duty_cycle_percent: 1.0,
        },
    ]
}

const ONE_HOUR_MS: u64 = 60 * 60 * 1_000;

/// Regulatory rules for a region. `custom_percent` only applies to
/// `Region::Custom`.
pub fn rules_for(region: Region, custom_percent: Option<f64>) -> RegionConstraint {
    match region {
        Region::Eu => RegionConstraint::DutyCycle {
            sub_bands: eu_sub_bands(),
            window_ms: ONE_HOUR_MS,
        },
        // FCC part 15.247: 400 ms dwell per channel when hopping.
        Region::Us | Region::Ca | Region::Mx => RegionConstraint::DwellTime { max_dwell_ms: 400 },
        // ARIB STD-T108: 10% duty cycle.
        Region::Jp => RegionConstraint::DutyCycle {
            sub_bands: vec![SubBand {
                start_mhz: 920.0,
                end_mhz: 928.0,
                duty_cycle_percent: 10.0,
            }],
            window_ms: ONE_HOUR_MS,
        },
        Region::Au | Region::Nz | Region::Br | Region::Ar => RegionConstraint::Unlimited,
        Region::Custom => RegionConstraint::DutyCycle {
            sub_bands: vec![SubBand {
                start_mhz: 0.0,
                end_mhz: f64::MAX,
                duty_cycle_percent: custom_percent.unwrap_or(1.0),
            }],
            window_ms: ONE_HOUR_MS,
        },
    }
}

/// The sub-band covering `frequency_mhz`, if the constraint has one.
pub fn sub_band_for(constraint: &RegionConstraint, frequency_mhz: f64) -> Option<SubBand> {
    match constraint {
        RegionConstraint::DutyCycle { sub_bands, .. } => sub_bands
            .iter()
            .find(|band| band.contains(frequency_mhz))
            .copied(),
        _ => None,
    }
}
