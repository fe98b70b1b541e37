//! Passive evaluation of Bluetooth advertisements.
//!
//! The earbuds broadcast manufacturer-specific data that appears to contain
//! their battery levels, which allows reading them without connecting.
//! The format is undocumented, so extraction is a best-effort heuristic
//! hidden behind the [`BatteryExtractor`] trait.
//!
//! All functions here are free of side effects and may be called concurrently
//! from scanner callbacks.

use crate::{
    battery::{BatteryReading, MAX_LEVEL, UNKNOWN_LEVEL},
    identity::{DeviceIdentity, MatchReason, Targets},
};
use log::{debug, trace};
use std::collections::BTreeMap;

/// Bluetooth SIG company identifiers used by Huawei.
pub const HUAWEI_COMPANY_IDS: [u16; 2] = [0x027d, 0x0156];

/// Signal strength below which devices are considered out of range.
pub const DEFAULT_MIN_RSSI: i16 = -80;

// Payloads shorter than this never carry battery levels
const MIN_PAYLOAD_LEN: usize = 7;

// Left, right and case level
const WINDOW_LEN: usize = 3;

/// A single advertisement as delivered by the Bluetooth scanner.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Observation {
    /// Address and name of the broadcaster.
    pub identity: DeviceIdentity,
    /// Received signal strength in dBm.
    pub rssi: i16,
    /// Manufacturer-specific data, keyed by company identifier.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

/// Extracts battery levels from manufacturer-specific advertisement data.
pub trait BatteryExtractor {
    /// Returns the battery levels contained in the payload, if any.
    fn extract(&self, company_id: u16, payload: &[u8]) -> Option<BatteryReading>;
}

/// Heuristic extractor scanning for three consecutive plausible levels.
///
/// A window is plausible if every byte is either a percentage (0 to 100)
/// or [`UNKNOWN_LEVEL`], and at least one byte is a percentage.
/// The first plausible window of a payload from an allowed company wins.
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct SlidingWindow {
    company_ids: Vec<u16>,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(HUAWEI_COMPANY_IDS)
    }
}

impl SlidingWindow {
    /// Constructs an extractor accepting payloads from the given companies.
    pub fn new(company_ids: impl IntoIterator<Item = u16>) -> Self {
        Self {
            company_ids: company_ids.into_iter().collect(),
        }
    }
}

impl BatteryExtractor for SlidingWindow {
    fn extract(&self, company_id: u16, payload: &[u8]) -> Option<BatteryReading> {
        if payload.len() < MIN_PAYLOAD_LEN || !self.company_ids.contains(&company_id) {
            return None;
        }

        let (pos, window) = payload
            .windows(WINDOW_LEN)
            .enumerate()
            .find(|(_, window)| is_plausible(window))?;

        trace!("Plausible battery levels at offset {pos}: {window:?}");

        Some(BatteryReading::from_raw(window[0], window[1], window[2]))
    }
}

fn is_plausible(window: &[u8]) -> bool {
    window
        .iter()
        .all(|&b| b <= MAX_LEVEL || b == UNKNOWN_LEVEL)
        && window.iter().any(|&b| b <= MAX_LEVEL)
}

/// Outcome of evaluating an [`Observation`].
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct MatchResult {
    /// Whether the broadcaster is a target device.
    pub is_target: bool,
    /// How the broadcaster was recognized.
    pub matched_by: Option<MatchReason>,
    /// Whether the signal is strong enough for a connection attempt.
    pub in_range: bool,
    /// Battery levels extracted from the advertisement.
    pub battery: Option<BatteryReading>,
}

/// Evaluates advertisements against the configured targets.
#[derive(Debug)]
pub struct Scanner<X = SlidingWindow> {
    targets: Targets,
    min_rssi: i16,
    extractor: X,
}

impl Scanner {
    /// Constructs a scanner using the [`SlidingWindow`] heuristic.
    #[must_use]
    pub fn new(targets: Targets) -> Self {
        Self::with_extractor(targets, SlidingWindow::default())
    }
}

impl<X: BatteryExtractor> Scanner<X> {
    /// Constructs a scanner using a custom battery extractor.
    pub fn with_extractor(targets: Targets, extractor: X) -> Self {
        Self {
            targets,
            min_rssi: DEFAULT_MIN_RSSI,
            extractor,
        }
    }

    /// Sets the signal strength below which devices are out of range.
    #[must_use]
    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = rssi;
        self
    }

    /// Returns the configured targets.
    #[must_use]
    pub fn targets(&self) -> &Targets {
        &self.targets
    }

    /// Evaluates a single advertisement.
    ///
    /// Battery levels are only extracted for target devices.
    /// Manufacturer data is examined in ascending company ID order.
    pub fn evaluate(&self, obs: &Observation) -> MatchResult {
        let matched_by = self.targets.match_identity(&obs.identity);
        let in_range = obs.rssi >= self.min_rssi;
        let battery = matched_by.and_then(|_| {
            obs.manufacturer_data
                .iter()
                .find_map(|(&id, payload)| self.extractor.extract(id, payload))
        });

        if let Some(reason) = matched_by {
            debug!(
                "Target {} matched by {reason} (RSSI {} dBm): {battery:?}",
                obs.identity.address, obs.rssi
            );
        }

        MatchResult {
            is_target: matched_by.is_some(),
            matched_by,
            in_range,
            battery,
        }
    }
}
