//! Battery levels of the earbuds and their charging case.
//!
//! Readings are produced either by parsing a battery response
//! (see [`BatteryReading::from_packet`]) or by the advertisement heuristic
//! in the [`broadcast`](crate::broadcast) module.

use crate::{CommandId, Field, Packet};
use core::fmt::{Display, Formatter};
use log::debug;
use std::time::{Duration, Instant};
use strum::FromRepr;

/// Raw level value meaning "unknown" or "not present".
pub const UNKNOWN_LEVEL: u8 = 0xff;

/// Highest valid battery level in percent.
pub const MAX_LEVEL: u8 = 100;

// Global level must fit into a u32
const GLOBAL_MAX_LEN: usize = 4;

/// Field types of a battery response.
#[derive(FromRepr, PartialEq, Eq, Copy, Clone, Debug)]
#[repr(u8)]
enum BatteryField {
    /// Aggregate level, big-endian integer of up to four bytes.
    Global = 1,
    /// Left, right and case levels, one byte each.
    Levels = 2,
}

/// Battery levels in percent.
///
/// Each level is `None` if it is unknown, e.g. because an earbud is
/// not inside the case.
#[derive(PartialEq, Eq, Copy, Clone, Default, Debug)]
pub struct BatteryReading {
    /// Aggregate level, if reported.
    pub global: Option<u32>,
    /// Left earbud level.
    pub left: Option<u8>,
    /// Right earbud level.
    pub right: Option<u8>,
    /// Charging case level.
    pub case: Option<u8>,
}

impl BatteryReading {
    /// Constructs a reading from raw level bytes.
    ///
    /// A raw value of [`UNKNOWN_LEVEL`] results in a missing level.
    #[must_use]
    pub fn from_raw(left: u8, right: u8, case: u8) -> Self {
        Self {
            global: None,
            left: level(left),
            right: level(right),
            case: level(case),
        }
    }

    /// Parses the fields of a battery response.
    ///
    /// Returns `None` if the packet is not a battery response.
    /// Unknown field types are ignored, so the reading may be empty.
    #[must_use]
    pub fn from_packet(packet: &Packet) -> Option<Self> {
        (packet.command == CommandId::BATTERY).then(|| Self::from_fields(&packet.fields))
    }

    /// Parses battery response fields.
    ///
    /// A global level longer than four bytes is ignored.
    #[must_use]
    pub fn from_fields(fields: &[Field]) -> Self {
        let mut reading = Self::default();

        for field in fields {
            match BatteryField::from_repr(field.ty) {
                Some(BatteryField::Global) if field.value.len() <= GLOBAL_MAX_LEN => {
                    reading.global = Some(
                        field
                            .value
                            .iter()
                            .fold(0, |acc, &b| (acc << 8) | u32::from(b)),
                    );
                }
                Some(BatteryField::Global) => {
                    debug!("Ignoring oversized global level: {:02x?}", field.value);
                }
                Some(BatteryField::Levels) => {
                    if let [left, right, case, ..] = field.value[..] {
                        let levels = Self::from_raw(left, right, case);

                        reading.left = levels.left;
                        reading.right = levels.right;
                        reading.case = levels.case;
                    }
                }
                None => {}
            }
        }

        reading
    }

    /// Returns whether no level is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.global.is_none() && self.levels().iter().all(Option::is_none)
    }

    /// Returns the left, right and case levels.
    #[must_use]
    pub fn levels(&self) -> [Option<u8>; 3] {
        [self.left, self.right, self.case]
    }
}

impl Display for BatteryReading {
    fn fmt(&self, f: &mut Formatter) -> core::fmt::Result {
        let names = ["left", "right", "case"];

        for (i, (name, level)) in names.iter().zip(self.levels()).enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }

            match level {
                Some(level) => write!(f, "{name} {level}%")?,
                None => write!(f, "{name} unknown")?,
            }
        }

        if let Some(global) = self.global {
            write!(f, " (global {global}%)")?;
        }

        Ok(())
    }
}

fn level(raw: u8) -> Option<u8> {
    (raw != UNKNOWN_LEVEL).then_some(raw)
}

/// Rate limiter for battery notifications.
///
/// Levels fluctuate by a point or two between readings, so a new reading is
/// only reported once enough time has passed or a level changed noticeably.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    delta: u8,
    last: Option<(Instant, BatteryReading)>,
}

impl Default for Throttle {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 5)
    }
}

impl Throttle {
    /// Constructs a new throttle.
    ///
    /// Readings are reported at least every `interval`, or earlier if
    /// any level changes by `delta` points or more.
    #[must_use]
    pub fn new(interval: Duration, delta: u8) -> Self {
        Self {
            interval,
            delta,
            last: None,
        }
    }

    /// Returns whether the reading should be reported.
    ///
    /// A reported reading becomes the new reference for later calls.
    pub fn report(&mut self, reading: BatteryReading, now: Instant) -> bool {
        let report = match &self.last {
            None => true,
            Some((time, last)) => {
                now.duration_since(*time) >= self.interval || self.changed(last, &reading)
            }
        };

        if report {
            self.last = Some((now, reading));
        }

        report
    }

    fn changed(&self, last: &BatteryReading, reading: &BatteryReading) -> bool {
        let global_changed = match (last.global, reading.global) {
            (Some(a), Some(b)) => a.abs_diff(b) >= u32::from(self.delta),
            (a, b) => a.is_some() != b.is_some(),
        };

        global_changed
            || last
                .levels()
                .iter()
                .zip(reading.levels())
                .any(|(a, b)| match (a, b) {
                    (Some(a), Some(b)) => a.abs_diff(b) >= self.delta,
                    (a, b) => a.is_some() != b.is_some(),
                })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_levels() {
        let reading = BatteryReading::from_fields(&[Field::new(2, [55, 60, 80])]);

        assert_eq!(reading.left, Some(55), "left level should be correct");
        assert_eq!(reading.right, Some(60), "right level should be correct");
        assert_eq!(reading.case, Some(80), "case level should be correct");
        assert_eq!(reading.global, None, "global level should be missing");
    }

    #[test]
    fn parse_global() {
        let reading = BatteryReading::from_fields(&[Field::new(1, [99])]);

        assert_eq!(reading.global, Some(99), "global level should be correct");
        assert_eq!(reading.levels(), [None; 3], "levels should be missing");

        let reading = BatteryReading::from_fields(&[Field::new(1, [0x01, 0x02])]);

        assert_eq!(reading.global, Some(0x0102), "global level should be big-endian");

        let reading = BatteryReading::from_fields(&[Field::new(1, [1, 2, 3, 4, 5])]);

        assert_eq!(reading.global, None, "oversized global level should be ignored");

        let reading = BatteryReading::from_fields(&[Field::new(1, [1, 2, 3, 4])]);

        assert_eq!(reading.global, Some(0x0102_0304), "4-byte global level should be kept");
    }

    #[test]
    fn parse_full_response() {
        let packet = Packet::new(
            CommandId::BATTERY,
            vec![
                Field::new(1, [40]),
                Field::new(2, [40, 45, 0xff]),
                Field::new(3, [0x01, 0x00, 0x00]),
            ],
        );
        let reading = BatteryReading::from_packet(&packet).unwrap();

        assert_eq!(
            reading,
            BatteryReading {
                global: Some(40),
                left: Some(40),
                right: Some(45),
                case: None,
            },
            "reading should be correct"
        );
    }

    #[test]
    fn parse_empty() {
        let reading = BatteryReading::from_fields(&[]);

        assert!(reading.is_empty(), "reading should be empty");

        let reading = BatteryReading::from_fields(&[Field::new(7, [1, 2, 3]), Field::new(2, [1])]);

        assert!(reading.is_empty(), "unknown and short fields should be ignored");
    }

    #[test]
    fn parse_other_command() {
        let packet = Packet::low_latency(true);

        assert_eq!(
            BatteryReading::from_packet(&packet),
            None,
            "other commands should not be parsed"
        );
    }

    #[test]
    fn display() {
        let reading = BatteryReading::from_raw(40, 0xff, 99);

        assert_eq!(
            reading.to_string(),
            "left 40%, right unknown, case 99%",
            "reading should be formatted correctly"
        );
    }

    #[test]
    fn throttle() {
        let mut throttle = Throttle::default();
        let start = Instant::now();
        let reading = BatteryReading::from_raw(50, 50, 80);

        assert!(throttle.report(reading, start), "first reading should be reported");
        assert!(
            !throttle.report(BatteryReading::from_raw(52, 49, 80), start + Duration::from_secs(1)),
            "small change should be suppressed"
        );
        assert!(
            throttle.report(BatteryReading::from_raw(45, 50, 80), start + Duration::from_secs(2)),
            "large change should be reported"
        );
        assert!(
            throttle.report(BatteryReading::from_raw(45, 0xff, 80), start + Duration::from_secs(3)),
            "missing level should be reported"
        );
        assert!(
            !throttle.report(BatteryReading::from_raw(45, 0xff, 80), start + Duration::from_secs(4)),
            "unchanged reading should be suppressed"
        );
        assert!(
            throttle.report(BatteryReading::from_raw(45, 0xff, 80), start + Duration::from_secs(9)),
            "reading should be reported after interval"
        );
    }
}
