//! Size units and CPU set helpers

use crate::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Binary size unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SizeUnit {
    #[default]
    B,
    K,
    M,
    G,
}

impl SizeUnit {
    /// Number of bytes in one unit (1024^k)
    pub fn multiplier(&self) -> u64 {
        match self {
            SizeUnit::B => 1,
            SizeUnit::K => 1024,
            SizeUnit::M => 1024 * 1024,
            SizeUnit::G => 1024 * 1024 * 1024,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SizeUnit::B => "B",
            SizeUnit::K => "K",
            SizeUnit::M => "M",
            SizeUnit::G => "G",
        }
    }

    /// Parse a unit suffix, accepting the forms libvirt uses as well
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "b" | "bytes" => Some(SizeUnit::B),
            "k" | "kb" | "kib" => Some(SizeUnit::K),
            "m" | "mb" | "mib" => Some(SizeUnit::M),
            "g" | "gb" | "gib" => Some(SizeUnit::G),
            _ => None,
        }
    }
}

/// A `(value, unit)` pair. Arithmetic happens in bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Size {
    pub value: u64,
    pub unit: SizeUnit,
}

impl Size {
    pub fn new(value: u64, unit: SizeUnit) -> Self {
        Self { value, unit }
    }

    pub fn from_bytes(bytes: u64) -> Self {
        Self::new(bytes, SizeUnit::B)
    }

    pub fn kib(value: u64) -> Self {
        Self::new(value, SizeUnit::K)
    }

    pub fn mib(value: u64) -> Self {
        Self::new(value, SizeUnit::M)
    }

    pub fn gib(value: u64) -> Self {
        Self::new(value, SizeUnit::G)
    }

    pub fn bytes(&self) -> u64 {
        self.value.saturating_mul(self.unit.multiplier())
    }

    /// Convert to another unit, flooring any remainder
    pub fn convert(&self, unit: SizeUnit) -> Size {
        Size::new(self.bytes() / unit.multiplier(), unit)
    }

    pub fn kibibytes(&self) -> u64 {
        self.convert(SizeUnit::K).value
    }

    pub fn mebibytes(&self) -> u64 {
        self.convert(SizeUnit::M).value
    }

    pub fn gibibytes(&self) -> u64 {
        self.convert(SizeUnit::G).value
    }

    /// Largest unit that represents the size without loss
    pub fn normalized(&self) -> Size {
        let bytes = self.bytes();
        for unit in [SizeUnit::G, SizeUnit::M, SizeUnit::K] {
            if bytes != 0 && bytes % unit.multiplier() == 0 {
                return Size::new(bytes / unit.multiplier(), unit);
            }
        }
        Size::from_bytes(bytes)
    }
}

impl PartialEq for Size {
    fn eq(&self, other: &Self) -> bool {
        self.bytes() == other.bytes()
    }
}

impl Eq for Size {}

impl PartialOrd for Size {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Size {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bytes().cmp(&other.bytes())
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.as_str())
    }
}

impl FromStr for Size {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, suffix) = s.split_at(split);
        let value: u64 = digits
            .parse()
            .map_err(|_| Error::validation(format!("invalid size: {:?}", s)))?;
        let unit = SizeUnit::parse(suffix)
            .ok_or_else(|| Error::validation(format!("invalid size unit: {:?}", suffix)))?;
        Ok(Size::new(value, unit))
    }
}

/// Highest CPU id accepted in a CPU list (the kernel's `NR_CPUS` ceiling)
pub const MAX_CPU_ID: u32 = 8191;

/// Parse a CPU list such as `0-3,7` into a set.
///
/// Parsing stops at the first malformed token; everything before it is kept.
/// Ids above [`MAX_CPU_ID`] count as malformed.
pub fn parse_cpu_set(s: &str) -> BTreeSet<u32> {
    let mut set = BTreeSet::new();
    if s.trim().is_empty() {
        return set;
    }
    for token in s.split(',') {
        let token = token.trim();
        let parsed = match token.split_once('-') {
            Some((start, end)) => match (start.trim().parse::<u32>(), end.trim().parse::<u32>()) {
                (Ok(start), Ok(end)) if start <= end && end <= MAX_CPU_ID => Some(start..=end),
                _ => None,
            },
            None => token
                .parse::<u32>()
                .ok()
                .filter(|n| *n <= MAX_CPU_ID)
                .map(|n| n..=n),
        };
        match parsed {
            Some(range) => set.extend(range),
            None => break,
        }
    }
    set
}

/// Format a set back into the compact range notation
pub fn format_cpu_set(set: &BTreeSet<u32>) -> String {
    let mut parts = Vec::new();
    let mut iter = set.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(next) = end.checked_add(1).filter(|n| iter.peek() == Some(n)) {
            end = next;
            iter.next();
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{}-{}", start, end));
        }
    }
    parts.join(",")
}
