/// Caller-owned column-major output storage with an explicit stride
///
/// Replaces raw pointer-plus-offset arithmetic: every component receives a
/// view covering the columns it may write, and bounds are asserted in debug
/// builds.
pub struct ColumnsMut<'a> {
    data: &'a mut [f64],
    stride: usize,
}

impl<'a> ColumnsMut<'a> {
    pub fn new(data: &'a mut [f64], stride: usize) -> Self {
        assert!(stride > 0);
        Self { data, stride }
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Number of whole columns this view can hold
    pub fn capacity(&self) -> usize {
        self.data.len() / self.stride
    }

    pub fn column_mut(&mut self, col: usize) -> &mut [f64] {
        let start = col * self.stride;
        debug_assert!(start + self.stride <= self.data.len(), "column out of range");
        &mut self.data[start..start + self.stride]
    }

    /// Zero a column and hand it out for accumulation
    pub fn clear_column(&mut self, col: usize) -> &mut [f64] {
        let column = self.column_mut(col);
        column.fill(0.0);
        column
    }

    /// Re-borrowed view starting at `col`, for handing the remainder of the
    /// buffer to the next component
    pub fn offset(&mut self, col: usize) -> ColumnsMut<'_> {
        ColumnsMut {
            data: &mut self.data[col * self.stride..],
            stride: self.stride,
        }
    }

    /// Multiply the first `n_cols` columns in place
    pub fn scale(&mut self, n_cols: usize, factor: f64) {
        for v in self.data[..n_cols * self.stride].iter_mut() {
            *v *= factor;
        }
    }
}

/// Iterator over the per-variable soft-constraint derivative slots
///
/// Decay groups advance this in lockstep with each globally fitted
/// parameter they emit derivatives for. No constraint penalty is currently
/// active, so the slots stay zero, but the contract keeps the hook in place
/// for future penalty terms.
pub struct KappaDerivatives<'a> {
    slots: &'a mut [f64],
    idx: usize,
}

impl<'a> KappaDerivatives<'a> {
    pub fn new(slots: &'a mut [f64]) -> Self {
        slots.fill(0.0);
        Self { slots, idx: 0 }
    }

    /// Slot for the variable currently being processed
    pub fn slot(&mut self) -> &mut f64 {
        &mut self.slots[self.idx]
    }

    /// Move to the next globally fitted variable
    pub fn advance(&mut self) {
        self.idx += 1;
        debug_assert!(self.idx <= self.slots.len());
    }
}
