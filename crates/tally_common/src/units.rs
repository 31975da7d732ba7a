//! Byte-count conversion
//!
//! `wg show` prints transfer counters with binary suffixes (KiB, MiB, ...),
//! other tools and older builds print decimal ones (KB, MB, ...). Both tables
//! live here so no call site has to guess.

use crate::error::{Result, TallyError};
use std::fmt;
use std::str::FromStr;

/// Unit a byte counter can be expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteUnit {
    Byte,
    KiB,
    MiB,
    GiB,
    TiB,
    KB,
    MB,
    GB,
    TB,
}

impl ByteUnit {
    /// Number of bytes in one unit
    pub const fn multiplier(self) -> u64 {
        match self {
            ByteUnit::Byte => 1,
            ByteUnit::KiB => 1 << 10,
            ByteUnit::MiB => 1 << 20,
            ByteUnit::GiB => 1 << 30,
            ByteUnit::TiB => 1 << 40,
            ByteUnit::KB => 1_000,
            ByteUnit::MB => 1_000_000,
            ByteUnit::GB => 1_000_000_000,
            ByteUnit::TB => 1_000_000_000_000,
        }
    }

    pub const fn is_binary(self) -> bool {
        matches!(
            self,
            ByteUnit::KiB | ByteUnit::MiB | ByteUnit::GiB | ByteUnit::TiB
        )
    }

    pub const fn suffix(self) -> &'static str {
        match self {
            ByteUnit::Byte => "B",
            ByteUnit::KiB => "KiB",
            ByteUnit::MiB => "MiB",
            ByteUnit::GiB => "GiB",
            ByteUnit::TiB => "TiB",
            ByteUnit::KB => "KB",
            ByteUnit::MB => "MB",
            ByteUnit::GB => "GB",
            ByteUnit::TB => "TB",
        }
    }
}

impl FromStr for ByteUnit {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "B" => Ok(ByteUnit::Byte),
            "KiB" => Ok(ByteUnit::KiB),
            "MiB" => Ok(ByteUnit::MiB),
            "GiB" => Ok(ByteUnit::GiB),
            "TiB" => Ok(ByteUnit::TiB),
            "KB" | "kB" => Ok(ByteUnit::KB),
            "MB" => Ok(ByteUnit::MB),
            "GB" => Ok(ByteUnit::GB),
            "TB" => Ok(ByteUnit::TB),
            other => Err(TallyError::parse(format!("unknown byte unit '{}'", other))),
        }
    }
}

/// A byte counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ByteCount(pub u64);

impl ByteCount {
    /// Parse "1.50 MiB", "12 KB", "0 B" or a bare integer
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(TallyError::parse("empty byte count"));
        }

        let mut parts = text.split_whitespace();
        let number = parts.next().unwrap_or_default();
        let unit = match parts.next() {
            Some(u) => u.parse::<ByteUnit>()?,
            None => {
                return number
                    .parse::<u64>()
                    .map(ByteCount)
                    .map_err(|_| TallyError::parse(format!("invalid byte count '{}'", text)));
            }
        };
        if parts.next().is_some() {
            return Err(TallyError::parse(format!("invalid byte count '{}'", text)));
        }

        let value: f64 = number
            .parse()
            .map_err(|_| TallyError::parse(format!("invalid number '{}'", number)))?;
        if !value.is_finite() || value < 0.0 {
            return Err(TallyError::parse(format!("invalid number '{}'", number)));
        }

        // wg rounds to two decimals; round to the nearest byte, not down
        Ok(ByteCount((value * unit.multiplier() as f64).round() as u64))
    }

    pub fn bytes(self) -> u64 {
        self.0
    }

    /// Format with binary units, two decimals ("1.50 MiB")
    pub fn display_binary(self) -> String {
        const UNITS: [ByteUnit; 5] = [
            ByteUnit::Byte,
            ByteUnit::KiB,
            ByteUnit::MiB,
            ByteUnit::GiB,
            ByteUnit::TiB,
        ];

        let mut unit = ByteUnit::Byte;
        for candidate in UNITS {
            if self.0 >= candidate.multiplier() {
                unit = candidate;
            }
        }

        if unit == ByteUnit::Byte {
            format!("{} B", self.0)
        } else {
            format!(
                "{:.2} {}",
                self.0 as f64 / unit.multiplier() as f64,
                unit.suffix()
            )
        }
    }
}

impl fmt::Display for ByteCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_binary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_units() {
        assert_eq!(ByteCount::parse("1 KiB").unwrap().bytes(), 1024);
        assert_eq!(ByteCount::parse("1.50 MiB").unwrap().bytes(), 1_572_864);
        assert_eq!(ByteCount::parse("2 GiB").unwrap().bytes(), 2 * 1024 * 1024 * 1024);
        assert_eq!(ByteCount::parse("1 TiB").unwrap().bytes(), 1 << 40);
    }

    #[test]
    fn test_decimal_units() {
        assert_eq!(ByteCount::parse("1 KB").unwrap().bytes(), 1_000);
        assert_eq!(ByteCount::parse("1.5 MB").unwrap().bytes(), 1_500_000);
        assert_eq!(ByteCount::parse("3 GB").unwrap().bytes(), 3_000_000_000);
        assert_eq!(ByteCount::parse("1 TB").unwrap().bytes(), 1_000_000_000_000);
    }

    #[test]
    fn test_plain_bytes() {
        assert_eq!(ByteCount::parse("0 B").unwrap().bytes(), 0);
        assert_eq!(ByteCount::parse("932 B").unwrap().bytes(), 932);
        assert_eq!(ByteCount::parse("123456").unwrap().bytes(), 123_456);
        assert_eq!(ByteCount::parse("  42  ").unwrap().bytes(), 42);
    }

    #[test]
    fn test_same_number_differs_by_unit_system() {
        let binary = ByteCount::parse("10 MiB").unwrap();
        let decimal = ByteCount::parse("10 MB").unwrap();
        assert!(binary > decimal);
        assert_eq!(binary.bytes() - decimal.bytes(), 485_760);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ByteCount::parse("").is_err());
        assert!(ByteCount::parse("abc").is_err());
        assert!(ByteCount::parse("12 XB").is_err());
        assert!(ByteCount::parse("-1 KiB").is_err());
        assert!(ByteCount::parse("1 KiB extra").is_err());
    }

    #[test]
    fn test_display_binary() {
        assert_eq!(ByteCount(512).display_binary(), "512 B");
        assert_eq!(ByteCount(1024).display_binary(), "1.00 KiB");
        assert_eq!(ByteCount(1_572_864).display_binary(), "1.50 MiB");
        assert_eq!(ByteCount(3 << 30).to_string(), "3.00 GiB");
    }

    #[test]
    fn test_unit_tables() {
        assert!(ByteUnit::GiB.is_binary());
        assert!(!ByteUnit::GB.is_binary());
        assert!(!ByteUnit::Byte.is_binary());
        assert_eq!("kB".parse::<ByteUnit>().unwrap(), ByteUnit::KB);
    }
}
