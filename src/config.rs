//! Engine-tunable constants: page size, format variant, index split
//! threshold, and the autonumber-insert override collected onto one struct
//! passed into the table/index engines at construction.

/// Which on-disk layout variant of the format this file follows. The core
/// targets a single logical version; `Format` records enough to pick the
/// right constant table (page header offsets, entry-mask width) without
/// pulling in migration logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Jet 4 (the common modern desktop variant).
    Jet4,
    /// Jet 3 (legacy, narrower row/column-count fields).
    Jet3,
}

impl Default for Format {
    fn default() -> Self {
        Format::Jet4
    }
}

impl Format {
    /// Width in bytes of the page-relative row-count / column-count
    /// prefixes; Jet3 uses narrower fields than Jet4.
    pub fn row_count_width(self) -> usize {
        match self {
            Format::Jet4 => 2,
            Format::Jet3 => 2,
        }
    }

    /// Which row variable-offset trailer sub-format this format variant
    /// writes. Jet3's narrower legacy row layout used the 1-byte
    /// jump-table offsets; Jet4 widened this to 2-byte short offsets.
    pub fn var_offset_width(self) -> crate::row::VarOffsetWidth {
        match self {
            Format::Jet4 => crate::row::VarOffsetWidth::Short,
            Format::Jet3 => crate::row::VarOffsetWidth::JumpTable,
        }
    }
}

/// Engine configuration, mirroring the way the page-size and half-size
/// constants are collected on a single struct and threaded down into every
/// page/table/index type.
#[derive(Debug, Clone)]
pub struct Config {
    /// Page size in bytes (2048 or 4096 are the only values real files use).
    pub page_size: usize,
    /// File format variant.
    pub format: Format,
    /// Fraction of a page's data capacity targeted by an index split
    /// (reserves headroom for future inserts on each half).
    pub fill_factor: f32,
    /// Whether `add_row` accepts a caller-supplied value for an autonumber
    /// column instead of always generating one.
    pub allow_autonumber_insert: bool,
}

impl Config {
    /// Half the page size, used throughout the index/table engines as the
    /// default split point before `fill_factor` is applied.
    pub fn half_size(&self) -> usize {
        self.page_size / 2
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            page_size: 4096,
            format: Format::default(),
            fill_factor: 0.5,
            allow_autonumber_insert: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_size_divides_page_size() {
        let c = Config::default();
        assert_eq!(c.half_size(), 2048);
    }

    #[test]
    fn jet3_and_jet4_share_row_count_width_today() {
        assert_eq!(Format::Jet3.row_count_width(), Format::Jet4.row_count_width());
    }

    #[test]
    fn jet3_and_jet4_pick_different_var_offset_widths() {
        assert_eq!(Format::Jet3.var_offset_width(), crate::row::VarOffsetWidth::JumpTable);
        assert_eq!(Format::Jet4.var_offset_width(), crate::row::VarOffsetWidth::Short);
    }
}
