use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Instruction-set revision of the bytecode being decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PyVersion {
    V3_10,
    V3_11,
    V3_12,
    V3_13,
    V3_14,
}

// Inclusive magic number ranges, oldest first.
const MAGIC_RANGES: &[(u16, u16, PyVersion)] = &[
    (3430, 3439, PyVersion::V3_10),
    (3495, 3519, PyVersion::V3_11),
    (3531, 3549, PyVersion::V3_12),
    (3550, 3599, PyVersion::V3_13),
    (3600, 3659, PyVersion::V3_14),
];

impl PyVersion {
    pub const ALL: [PyVersion; 5] = [
        PyVersion::V3_10,
        PyVersion::V3_11,
        PyVersion::V3_12,
        PyVersion::V3_13,
        PyVersion::V3_14,
    ];

    pub fn from_magic(magic: u16) -> Option<PyVersion> {
        MAGIC_RANGES
            .iter()
            .find(|(lo, hi, _)| (*lo..=*hi).contains(&magic))
            .map(|(_, _, v)| *v)
    }

    /// Closest known version for a magic number outside every known range.
    pub fn closest_to_magic(magic: u16) -> PyVersion {
        let mut best = PyVersion::V3_10;
        let mut best_dist = u32::MAX;
        for (lo, hi, v) in MAGIC_RANGES {
            let dist = if magic < *lo {
                (*lo - magic) as u32
            } else if magic > *hi {
                (magic - *hi) as u32
            } else {
                0
            };
            if dist < best_dist {
                best_dist = dist;
                best = *v;
            }
        }
        best
    }

    /// A representative magic number, used when writing headers in tests and tools.
    pub fn magic(self) -> u16 {
        match self {
            PyVersion::V3_10 => 3439,
            PyVersion::V3_11 => 3495,
            PyVersion::V3_12 => 3531,
            PyVersion::V3_13 => 3571,
            PyVersion::V3_14 => 3600,
        }
    }

    pub fn minor(self) -> u8 {
        match self {
            PyVersion::V3_10 => 10,
            PyVersion::V3_11 => 11,
            PyVersion::V3_12 => 12,
            PyVersion::V3_13 => 13,
            PyVersion::V3_14 => 14,
        }
    }

    /// 3.11 moved locals, cells and free variables into one `localsplus` array.
    pub fn has_localsplus(self) -> bool {
        self >= PyVersion::V3_11
    }
}

impl fmt::Display for PyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "3.{}", self.minor())
    }
}

impl FromStr for PyVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let minor = s.trim().strip_prefix("3.").unwrap_or(s.trim());
        match minor {
            "10" => Ok(PyVersion::V3_10),
            "11" => Ok(PyVersion::V3_11),
            "12" => Ok(PyVersion::V3_12),
            "13" => Ok(PyVersion::V3_13),
            "14" => Ok(PyVersion::V3_14),
            _ => Err(format!("unsupported python version: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_ranges() {
        assert_eq!(PyVersion::from_magic(3439), Some(PyVersion::V3_10));
        assert_eq!(PyVersion::from_magic(3531), Some(PyVersion::V3_12));
        assert_eq!(PyVersion::from_magic(3600), Some(PyVersion::V3_14));
        assert_eq!(PyVersion::from_magic(3900), None);
        for v in PyVersion::ALL {
            assert_eq!(PyVersion::from_magic(v.magic()), Some(v));
        }
    }

    #[test]
    fn closest_magic() {
        assert_eq!(PyVersion::closest_to_magic(3900), PyVersion::V3_14);
        assert_eq!(PyVersion::closest_to_magic(3000), PyVersion::V3_10);
        assert_eq!(PyVersion::closest_to_magic(3528), PyVersion::V3_12);
    }

    #[test]
    fn parse_version() {
        assert_eq!("3.11".parse::<PyVersion>(), Ok(PyVersion::V3_11));
        assert_eq!("13".parse::<PyVersion>(), Ok(PyVersion::V3_13));
        assert!("2.7".parse::<PyVersion>().is_err());
    }
}
