//! Physical execution locations
//!
//! A [`Place`] is the only key used to look up execution contexts and to
//! partition per-device resources. It is `Copy`, totally ordered (host before
//! pinned host before accelerators, accelerators by index) and hashable.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Where memory lives and work executes
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Place {
    /// Pageable host memory, host execution
    Host,
    /// Page-locked host memory used as a staging area for device transfers
    HostPinned,
    /// Accelerator device by driver index
    Accelerator(usize),
}

impl Place {
    /// Short name of the place kind
    pub fn kind(&self) -> &'static str {
        match self {
            Place::Host => "host",
            Place::HostPinned => "host_pinned",
            Place::Accelerator(_) => "accelerator",
        }
    }

    /// Is this the pageable host place?
    #[inline]
    pub fn is_host(&self) -> bool {
        matches!(self, Place::Host)
    }

    /// Is this the pinned host place?
    #[inline]
    pub fn is_host_pinned(&self) -> bool {
        matches!(self, Place::HostPinned)
    }

    /// Is this an accelerator device?
    #[inline]
    pub fn is_accelerator(&self) -> bool {
        matches!(self, Place::Accelerator(_))
    }

    /// Device index for accelerator places
    #[inline]
    pub fn device_index(&self) -> Option<usize> {
        match self {
            Place::Accelerator(index) => Some(*index),
            _ => None,
        }
    }

    /// Parse a comma-separated place list such as `"cpu,gpu:0,gpu:1"`.
    ///
    /// Empty segments are skipped, so a trailing comma is accepted. Duplicates
    /// are kept; the registry collapses them.
    pub fn parse_list(input: &str) -> Result<Vec<Place>> {
        input
            .split(',')
            .map(str::trim)
            .filter(|segment| !segment.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Place::Host => write!(f, "cpu"),
            Place::HostPinned => write!(f, "cpu_pinned"),
            Place::Accelerator(index) => write!(f, "gpu:{}", index),
        }
    }
}

impl FromStr for Place {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidPlace {
            input: s.to_string(),
        };

        let lower = s.trim().to_ascii_lowercase();
        match lower.as_str() {
            "cpu" | "host" => return Ok(Place::Host),
            "cpu_pinned" | "cuda_pinned" | "pinned" => return Ok(Place::HostPinned),
            _ => {}
        }

        let (prefix, index) = lower.split_once(':').ok_or_else(invalid)?;
        if !matches!(prefix, "gpu" | "cuda") {
            return Err(invalid());
        }
        index
            .parse::<usize>()
            .map(Place::Accelerator)
            .map_err(|_| invalid())
    }
}
