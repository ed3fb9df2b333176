//! CPU set parsing and rendering
//!
//! Node files describe CPUs in two encodings: the list format used by
//! `/sys/devices/system/cpu/online` (`0-3,8`) and the comma-chunked hex mask
//! used by `/proc/irq/default_smp_affinity` (`ffffffff,0000000c`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::HarnessError;

/// width of one comma-separated chunk in kernel cpumask output
const MASK_CHUNK_DIGITS: usize = 8;
/// largest NR_CPUS the kernel can be built with; ids at or above it are rejected
pub const MAX_CPUS: u32 = 8192;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuSet(BTreeSet<u32>);

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// parse the kernel list format, e.g. `0-3,8,10-11`
    pub fn parse_list(input: &str) -> Result<Self, HarnessError> {
        let trimmed = input.trim();
        let mut cpus = BTreeSet::new();
        if trimmed.is_empty() {
            return Ok(Self(cpus));
        }

        for token in trimmed.split(',') {
            let token = token.trim();
            if token.is_empty() {
                return Err(invalid(input, "empty element"));
            }

            match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_cpu(input, start)?;
                    let end = parse_cpu(input, end)?;
                    if start > end {
                        return Err(invalid(
                            input,
                            &format!("range {}-{} is reversed", start, end),
                        ));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    cpus.insert(parse_cpu(input, token)?);
                }
            }
        }

        Ok(Self(cpus))
    }

    /// parse a hex cpumask; the leftmost chunk holds the highest CPUs
    pub fn parse_mask(input: &str) -> Result<Self, HarnessError> {
        let digits: Vec<char> = input
            .trim()
            .chars()
            .filter(|c| *c != ',' && !c.is_whitespace())
            .collect();

        let mut cpus = BTreeSet::new();
        for (position, digit) in digits.iter().rev().enumerate() {
            let nibble = digit
                .to_digit(16)
                .ok_or_else(|| invalid(input, &format!("{:?} is not a hex digit", digit)))?;
            for bit in 0..4 {
                if nibble & (1 << bit) != 0 {
                    let cpu = position
                        .checked_mul(4)
                        .and_then(|base| u32::try_from(base + bit).ok())
                        .filter(|cpu| *cpu < MAX_CPUS)
                        .ok_or_else(|| {
                            invalid(input, &format!("mask sets CPUs at or above {}", MAX_CPUS))
                        })?;
                    cpus.insert(cpu);
                }
            }
        }

        Ok(Self(cpus))
    }

    /// parse a configuration value that may be either a mask or a list
    ///
    /// A value is a mask when it carries hex letters or any chunk is exactly
    /// one kernel mask chunk wide; everything else is read as a list.
    pub fn parse_auto(input: &str) -> Result<Self, HarnessError> {
        let trimmed = input.trim();
        let looks_like_mask = trimmed.chars().any(|c| matches!(c, 'a'..='f' | 'A'..='F'))
            || trimmed.split(',').any(|chunk| {
                let chunk = chunk.trim();
                chunk.len() == MASK_CHUNK_DIGITS && chunk.chars().all(|c| c.is_ascii_hexdigit())
            });

        if looks_like_mask {
            Self::parse_mask(trimmed)
        } else {
            Self::parse_list(trimmed)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, cpu: u32) -> bool {
        self.0.contains(&cpu)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<u32> {
        self.0.iter().copied().collect()
    }

    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        Self(self.0.union(&other.0).copied().collect())
    }
}

impl FromIterator<u32> for CpuSet {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromStr for CpuSet {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_list(s)
    }
}

/// renders the compressed list form, e.g. `0-3,8`
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(u32, u32)> = Vec::new();
        for cpu in self.iter() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }

        let rendered = ranges
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}", rendered)
    }
}

fn parse_cpu(input: &str, token: &str) -> Result<u32, HarnessError> {
    let cpu = token
        .trim()
        .parse::<u32>()
        .map_err(|e| invalid(input, &format!("{:?}: {}", token.trim(), e)))?;
    if cpu >= MAX_CPUS {
        return Err(invalid(
            input,
            &format!("CPU {} is out of range, the limit is {}", cpu, MAX_CPUS - 1),
        ));
    }
    Ok(cpu)
}

fn invalid(input: &str, reason: &str) -> HarnessError {
    HarnessError::InvalidCpuSet {
        input: input.to_string(),
        reason: reason.to_string(),
    }
}
