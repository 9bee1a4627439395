//! Global execution ranges and workgroup sizes.

use std::fmt;

use crate::error::ConfigurationError;

/// A 1–3 dimensional index space with every extent positive.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NdRange {
    dims: [usize; 3],
    work_dim: usize,
}

impl NdRange {
    pub fn new(extents: &[usize]) -> Result<Self, ConfigurationError> {
        if extents.is_empty() || extents.len() > 3 {
            return Err(ConfigurationError::InvalidRange {
                reason: format!("expected 1 to 3 dimensions, got {}", extents.len()),
            });
        }
        if let Some(pos) = extents.iter().position(|&e| e == 0) {
            return Err(ConfigurationError::InvalidRange {
                reason: format!("dimension {pos} is zero"),
            });

        }
        if extents.iter().try_fold(1_usize, |total, &e| total.checked_mul(e)).is_none() {
            return Err(ConfigurationError::InvalidRange {
                reason: format!("{extents:?} exceeds {} work items", usize::MAX),
            });
        }
        let mut dims = [1; 3];
        dims[..extents.len()].copy_from_slice(extents);
        Ok(Self { dims, work_dim: extents.len() })
    }

    pub fn d1(x: usize) -> Result<Self, ConfigurationError> {
        Self::new(&[x])
    }

    pub fn d2(x: usize, y: usize) -> Result<Self, ConfigurationError> {
        Self::new(&[x, y])
    }

    pub fn d3(x: usize, y: usize, z: usize) -> Result<Self, ConfigurationError> {
        Self::new(&[x, y, z])
    }

    pub fn work_dim(&self) -> usize {
        self.work_dim
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.dims[..self.work_dim]
    }

    /// Total number of work items. Construction rejects ranges whose
    /// product overflows `usize`.
    pub fn len(&self) -> usize {
        self.as_slice().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check a workgroup size against this global range.
    pub fn check_local(&self, local: &NdRange) -> Result<(), ConfigurationError> {
        if local.work_dim != self.work_dim {
            return Err(ConfigurationError::InvalidRange {
                reason: format!(
                    "workgroup size has {} dimensions but global range has {}",
                    local.work_dim, self.work_dim
                ),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NdRange{:?}", self.as_slice())
    }
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.as_slice().iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("x"))
    }
}

impl std::str::FromStr for NdRange {
    type Err = ConfigurationError;

    /// Parses `X`, `X,Y` or `X,Y,Z`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let extents = s
            .split(',')
            .map(|part| part.trim().parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ConfigurationError::InvalidRange { reason: format!("'{s}': {e}") })?;
        Self::new(&extents)
    }
}
