/// Counters for one layout call (a full pass or a resumed one).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LayoutMetrics {
    pub passes: u64,
    /// Passes that resumed from a checkpoint instead of starting at the top.
    pub resumed_passes: u64,
    pub resumed_from: Option<usize>,
    pub segments: usize,
    pub runs: usize,
    pub clips: usize,
    pub errors: usize,
    pub table_passes: u64,
    pub table_repasses: u64,
    pub row_repasses: u64,
    pub list_repasses: u64,
    pub measured_cells: u64,
    pub measure_cache_hits: u64,
    pub layout_ms: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentMetrics {
    pub layout: LayoutMetrics,
    pub compile_ms: f64,
    pub render_ms: f64,
    pub render_commands: usize,
    pub stream_bytes: usize,
}
