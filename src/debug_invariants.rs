//! Invariant checking shared by the plan descriptors and the topology.

use itertools::Itertools;

use crate::locality_error::LocalityError;

/// Trait for validating data structure invariants.
pub trait DebugInvariants {
    /// Assert invariants in debug builds or when invariant checking is enabled.
    fn debug_assert_invariants(&self);
    /// Validate invariants and return the first error encountered.
    fn validate_invariants(&self) -> Result<(), LocalityError>;
}

/// Run a fallible check and panic on error when invariant checking is enabled.
#[macro_export]
macro_rules! debug_invariants {
    ($expr:expr, $($ctx:tt)*) => {
        #[cfg(any(debug_assertions, feature = "strict-invariants", feature = "check-invariants"))]
        if let Err(e) = $expr {
            panic!(concat!("[invariants] ", $($ctx)*, ": {}"), e);
        }
    };
}

/// Offsets array of a compressed-row structure: starts at zero, never
/// decreases, and ends at `total`.
pub fn check_offsets(name: &str, offsets: &[usize], total: usize) -> Result<(), LocalityError> {
    match offsets.first() {
        Some(0) => {}
        Some(first) => {
            return Err(LocalityError::InvalidPlan(format!(
                "{name}[0] = {first}, expected 0"
            )));
        }
        None => return Err(LocalityError::InvalidPlan(format!("{name} is empty"))),
    }
    if let Some((i, (a, b))) = offsets
        .iter()
        .tuple_windows()
        .enumerate()
        .find(|(_, (a, b))| b < a)
    {
        return Err(LocalityError::InvalidPlan(format!(
            "{name} decreases at {}: {a} > {b}",
            i + 1
        )));
    }
    let last = offsets[offsets.len() - 1];
    if last != total {
        return Err(LocalityError::InvalidPlan(format!(
            "{name} ends at {last}, expected {total}"
        )));
    }
    Ok(())
}
