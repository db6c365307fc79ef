/// Maximum number of globally fitted non-linear variables (rows)
pub const MAX_VARIABLES: usize = 12;
/// Maximum number of model columns
pub const MAX_COLUMNS: usize = 8;

/// Structural map from non-linear variables to the model columns they touch
///
/// Fixed-capacity boolean matrix flattened as `row + col * 12`, the layout
/// consumed by variable-projection solvers. Row order matches the parameter
/// vector traversal (minus the reference lifetime, which has no analytic
/// derivative path); column order matches the model column order. Built once
/// per structural configuration by [crate::DecayModel::init] and reused by
/// every evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IncidenceMatrix {
    data: [u8; MAX_VARIABLES * MAX_COLUMNS],
}

impl Default for IncidenceMatrix {
    fn default() -> Self {
        Self::new()
    }
}

impl IncidenceMatrix {
    pub fn new() -> Self {
        Self {
            data: [0; MAX_VARIABLES * MAX_COLUMNS],
        }
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize) {
        assert!(row < MAX_VARIABLES && col < MAX_COLUMNS);
        self.data[row + col * MAX_VARIABLES] = 1;
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> bool {
        self.data[row + col * MAX_VARIABLES] != 0
    }

    /// Total number of marked pairs, which equals the number of derivative
    /// columns the model produces
    pub fn count_ones(&self) -> usize {
        self.data.iter().map(|&v| v as usize).sum()
    }

    /// Raw flattened entries, `row + col * 12` layout
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_row_plus_col_times_12() {
        let mut inc = IncidenceMatrix::new();
        inc.set(3, 2);
        assert!(inc.get(3, 2));
        assert_eq!(inc.as_slice()[3 + 2 * 12], 1);
        assert_eq!(inc.count_ones(), 1);
    }

    #[test]
    #[should_panic]
    fn row_capacity_is_enforced() {
        let mut inc = IncidenceMatrix::new();
        inc.set(12, 0);
    }
}
