//! Battery period programs: time-of-use, fixed charge and capacity control.
//!
//! Times are minutes since midnight (0..=1440). Day sets are indexed with
//! Sunday at 0; the text form numbers days 1 (Monday) to 7 (Sunday).
//!
//! Word layouts (all zero padded to the full register span):
//!
//! | program          | header | record (words)                                  | records |
//! |------------------|--------|-------------------------------------------------|---------|
//! | time of use      | count  | start, end, `charge_flag << 8 \| day_mask`       | 14      |
//! | fixed charge     | count  | start, end, power (i32, two words)              | 10      |
//! | capacity control | count  | start, end, power (u16), day_mask               | 14      |

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::fmt;

use crate::error::{Error, Result};

pub const TOU_MAX_PERIODS: usize = 14;
pub const FIXED_CHARGE_MAX_PERIODS: usize = 10;
pub const CAPACITY_CONTROL_MAX_PERIODS: usize = 14;

const MINUTES_PER_DAY: u16 = 1440;

static TOU_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d\d:\d\d)-(\d\d:\d\d)/([1-7]{0,7})/([+-])$").unwrap());
static CAPACITY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d\d:\d\d)-(\d\d:\d\d)/([1-7]{1,7})/(\d+)W$").unwrap());
static FIXED_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d\d:\d\d)-(\d\d:\d\d)/(\d+)W$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargeFlag {
    Charge,
    Discharge,
}

/// Seven flags, Sunday first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Days(pub [bool; 7]);

impl Days {
    pub const ALL: Days = Days([true; 7]);

    pub fn from_mask(mask: u8) -> Self {
        let mut days = [false; 7];
        for (i, day) in days.iter_mut().enumerate() {
            *day = mask & (1 << i) != 0;
        }
        Days(days)
    }

    pub fn mask(&self) -> u8 {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    fn intersects(&self, other: &Days) -> bool {
        self.mask() & other.mask() != 0
    }

    /// Parse `"12345"`-style day lists, 7 meaning Sunday.
    fn parse(text: &str) -> Result<Self> {
        let mut days = [false; 7];
        for c in text.chars() {
            let day = c
                .to_digit(10)
                .filter(|d| (1..=7).contains(d))
                .ok_or_else(|| Error::invalid(format!("invalid day '{c}'")))?;
            days[day as usize % 7] = true;
        }
        Ok(Days(days))
    }
}

impl fmt::Display for Days {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for i in 0..7 {
            if self.0[(i + 1) % 7] {
                write!(f, "{}", i + 1)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TouPeriod {
    pub start_time: u16,
    pub end_time: u16,
    pub charge_flag: ChargeFlag,
    pub days: Days,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FixedChargePeriod {
    pub start_time: u16,
    pub end_time: u16,
    /// Positive charges, negative discharges.
    pub power: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacityControlPeriod {
    pub start_time: u16,
    pub end_time: u16,
    pub power: u16,
    pub days: Days,
}

fn parse_time(value: &str) -> Result<u16> {
    let (hours, minutes) = value
        .split_once(':')
        .ok_or_else(|| Error::invalid(format!("invalid time '{value}'")))?;
    let hours: u16 = hours
        .parse()
        .map_err(|_| Error::invalid(format!("invalid time '{value}'")))?;
    let minutes: u16 = minutes
        .parse()
        .map_err(|_| Error::invalid(format!("invalid time '{value}'")))?;
    let total = hours * 60 + minutes;
    if minutes >= 60 || total > MINUTES_PER_DAY {
        return Err(Error::invalid(format!(
            "invalid time '{value}': must be between 00:00 and 24:00"
        )));
    }
    Ok(total)
}

fn format_time(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn lines(text: &str) -> impl Iterator<Item = &str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn check_span(start: u16, end: u16) -> Result<()> {
    if end > MINUTES_PER_DAY {
        return Err(Error::invalid(format!("end time {end} is past midnight")));
    }
    if start >= end {
        return Err(Error::invalid(format!(
            "period {}-{} must start before it ends",
            format_time(start),
            format_time(end)
        )));
    }
    Ok(())
}

fn overlaps(a: (u16, u16), b: (u16, u16)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

fn too_many(program: &str, got: usize, max: usize) -> Error {
    Error::out_of_range(program, format!("{got} periods, at most {max} fit"))
}

pub fn parse_tou_periods(text: &str) -> Result<Vec<TouPeriod>> {
    let periods = lines(text)
        .map(|line| {
            let caps = TOU_LINE
                .captures(line)
                .ok_or_else(|| Error::invalid(format!("malformed time-of-use period '{line}'")))?;
            Ok(TouPeriod {
                start_time: parse_time(&caps[1])?,
                end_time: parse_time(&caps[2])?,
                days: Days::parse(&caps[3])?,
                charge_flag: if &caps[4] == "+" {
                    ChargeFlag::Charge
                } else {
                    ChargeFlag::Discharge
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;
    validate_tou(&periods)?;
    Ok(periods)
}

pub fn parse_capacity_control_periods(text: &str) -> Result<Vec<CapacityControlPeriod>> {
    let periods = lines(text)
        .map(|line| {
            let caps = CAPACITY_LINE.captures(line).ok_or_else(|| {
                Error::invalid(format!("malformed capacity control period '{line}'"))
            })?;
            Ok(CapacityControlPeriod {
                start_time: parse_time(&caps[1])?,
                end_time: parse_time(&caps[2])?,
                days: Days::parse(&caps[3])?,
                power: caps[4]
                    .parse()
                    .map_err(|_| Error::invalid(format!("power out of range in '{line}'")))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    validate_capacity_control(&periods)?;
    Ok(periods)
}

pub fn parse_fixed_charge_periods(text: &str) -> Result<Vec<FixedChargePeriod>> {
    let periods = lines(text)
        .map(|line| {
            let caps = FIXED_LINE.captures(line).ok_or_else(|| {
                Error::invalid(format!("malformed fixed charge period '{line}'"))
            })?;
            Ok(FixedChargePeriod {
                start_time: parse_time(&caps[1])?,
                end_time: parse_time(&caps[2])?,
                power: caps[3]
                    .parse()
                    .map_err(|_| Error::invalid(format!("power out of range in '{line}'")))?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    validate_fixed_charge(&periods)?;
    Ok(periods)
}

pub fn validate_tou(periods: &[TouPeriod]) -> Result<()> {
    if periods.len() > TOU_MAX_PERIODS {
        return Err(too_many("time_of_use", periods.len(), TOU_MAX_PERIODS));
    }
    for (i, p) in periods.iter().enumerate() {
        check_span(p.start_time, p.end_time)?;
        for q in &periods[..i] {
            if p.days.intersects(&q.days)
                && overlaps((p.start_time, p.end_time), (q.start_time, q.end_time))
            {
                return Err(Error::invalid("time-of-use periods overlap"));
            }
        }
    }
    Ok(())
}

pub fn validate_capacity_control(periods: &[CapacityControlPeriod]) -> Result<()> {
    if periods.len() > CAPACITY_CONTROL_MAX_PERIODS {
        return Err(too_many(
            "capacity_control",
            periods.len(),
            CAPACITY_CONTROL_MAX_PERIODS,
        ));
    }
    for (i, p) in periods.iter().enumerate() {
        check_span(p.start_time, p.end_time)?;
        for q in &periods[..i] {
            if p.days.intersects(&q.days)
                && overlaps((p.start_time, p.end_time), (q.start_time, q.end_time))
            {
                return Err(Error::invalid("capacity control periods overlap"));
            }
        }
    }
    Ok(())
}

pub fn validate_fixed_charge(periods: &[FixedChargePeriod]) -> Result<()> {
    if periods.len() > FIXED_CHARGE_MAX_PERIODS {
        return Err(too_many(
            "fixed_charge",
            periods.len(),
            FIXED_CHARGE_MAX_PERIODS,
        ));
    }
    for (i, p) in periods.iter().enumerate() {
        check_span(p.start_time, p.end_time)?;
        if periods[..i]
            .iter()
            .any(|q| overlaps((p.start_time, p.end_time), (q.start_time, q.end_time)))
        {
            return Err(Error::invalid("fixed charge periods overlap"));
        }
    }
    Ok(())
}

pub fn format_tou_periods(periods: &[TouPeriod]) -> String {
    periods
        .iter()
        .map(|p| {
            format!(
                "{}-{}/{}/{}",
                format_time(p.start_time),
                format_time(p.end_time),
                p.days,
                match p.charge_flag {
                    ChargeFlag::Charge => '+',
                    ChargeFlag::Discharge => '-',
                }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_capacity_control_periods(periods: &[CapacityControlPeriod]) -> String {
    periods
        .iter()
        .map(|p| {
            format!(
                "{}-{}/{}/{}W",
                format_time(p.start_time),
                format_time(p.end_time),
                p.days,
                p.power
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_fixed_charge_periods(periods: &[FixedChargePeriod]) -> String {
    periods
        .iter()
        .map(|p| {
            format!(
                "{}-{}/{}W",
                format_time(p.start_time),
                format_time(p.end_time),
                p.power
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// Word layouts

fn record_count(words: &[u16], max: usize, program: &str) -> Result<usize> {
    let count = *words.first().unwrap_or(&0) as usize;
    if count > max {
        return Err(Error::Protocol(format!(
            "{program} header claims {count} periods, layout holds {max}"
        )));
    }
    Ok(count)
}

pub(crate) fn decode_tou(words: &[u16]) -> Result<Vec<TouPeriod>> {
    let count = record_count(words, TOU_MAX_PERIODS, "time_of_use")?;
    Ok(words
        .get(1..)
        .unwrap_or_default()
        .chunks_exact(3)
        .take(count)
        .map(|r| TouPeriod {
            start_time: r[0],
            end_time: r[1],
            charge_flag: if r[2] >> 8 == 0 {
                ChargeFlag::Charge
            } else {
                ChargeFlag::Discharge
            },
            days: Days::from_mask(r[2] as u8),
        })
        .collect())
}

pub(crate) fn encode_tou(periods: &[TouPeriod], length: usize) -> Result<Vec<u16>> {
    validate_tou(periods)?;
    let mut words = Vec::with_capacity(length);
    words.push(periods.len() as u16);
    for p in periods {
        let flag: u16 = match p.charge_flag {
            ChargeFlag::Charge => 0,
            ChargeFlag::Discharge => 1,
        };
        words.extend([p.start_time, p.end_time, flag << 8 | p.days.mask() as u16]);
    }
    words.resize(length, 0);
    Ok(words)
}

pub(crate) fn decode_fixed_charge(words: &[u16]) -> Result<Vec<FixedChargePeriod>> {
    let count = record_count(words, FIXED_CHARGE_MAX_PERIODS, "fixed_charge")?;
    Ok(words
        .get(1..)
        .unwrap_or_default()
        .chunks_exact(4)
        .take(count)
        .map(|r| FixedChargePeriod {
            start_time: r[0],
            end_time: r[1],
            power: ((r[2] as u32) << 16 | r[3] as u32) as i32,
        })
        .collect())
}

pub(crate) fn encode_fixed_charge(periods: &[FixedChargePeriod], length: usize) -> Result<Vec<u16>> {
    validate_fixed_charge(periods)?;
    let mut words = Vec::with_capacity(length);
    words.push(periods.len() as u16);
    for p in periods {
        let power = p.power as u32;
        words.extend([p.start_time, p.end_time, (power >> 16) as u16, power as u16]);
    }
    words.resize(length, 0);
    Ok(words)
}

pub(crate) fn decode_capacity_control(words: &[u16]) -> Result<Vec<CapacityControlPeriod>> {
    let count = record_count(words, CAPACITY_CONTROL_MAX_PERIODS, "capacity_control")?;
    Ok(words
        .get(1..)
        .unwrap_or_default()
        .chunks_exact(4)
        .take(count)
        .map(|r| CapacityControlPeriod {
            start_time: r[0],
            end_time: r[1],
            power: r[2],
            days: Days::from_mask(r[3] as u8),
        })
        .collect())
}

pub(crate) fn encode_capacity_control(
    periods: &[CapacityControlPeriod],
    length: usize,
) -> Result<Vec<u16>> {
    validate_capacity_control(periods)?;
    let mut words = Vec::with_capacity(length);
    words.push(periods.len() as u16);
    for p in periods {
        words.extend([p.start_time, p.end_time, p.power, p.days.mask() as u16]);
    }
    words.resize(length, 0);
    Ok(words)
}
