//! Row codec: null mask, fixed-column region, variable-column region, and
//! the reverse-order offset trailer. Operates on already
//! column-encoded bytes (produced by [`crate::value`]); this module only
//! knows about row layout, not column types.

use crate::error::{Context, JetError, JetResult};
use crate::util;

/// Where a single column sits within a row, independent of its live/deleted
/// status — `max_column_count`/`max_var_column_count` may exceed the number
/// of currently-live columns after deletions.
#[derive(Clone, Copy, Debug)]
pub struct ColumnPlan {
    /// Bit position of this column in the row's null mask.
    pub null_mask_bit: usize,
    /// Boolean columns store their value only in the null mask.
    pub stores_in_null_mask: bool,
    /// `true` if this column is variable-length.
    pub variable: bool,
    /// Fixed-region byte offset (ignored if `variable` or
    /// `stores_in_null_mask`).
    pub fixed_data_offset: usize,
    /// Fixed-region size in bytes (ignored if `variable` or
    /// `stores_in_null_mask`).
    pub fixed_size: usize,
    /// Position of this column in variable-offset-table order (ignored
    /// unless `variable`).
    pub var_order: usize,
}

/// Selects which variable-offset trailer sub-format a row uses
/// (`SIZE_ROW_VAR_COL_OFFSET`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarOffsetWidth {
    /// 2-byte offsets, one per variable column.
    Short,
    /// 1-byte offsets plus a jump table recording 256-wraps.
    JumpTable,
}

fn set_null_bit(mask: &mut [u8], bit: usize, not_null: bool) {
    if not_null {
        mask[bit / 8] |= 1 << (bit % 8);
    }
}

fn null_bit(mask: &[u8], bit: usize) -> bool {
    mask[bit / 8] & (1 << (bit % 8)) != 0
}

/// Build the on-disk row image. `values` is index-aligned with `columns`;
/// `None` means null (or, for a `stores_in_null_mask` column, false).
/// `width` picks the variable-offset trailer sub-format.
pub fn create_row(
    max_column_count: usize,
    max_var_column_count: usize,
    columns: &[ColumnPlan],
    values: &[Option<Vec<u8>>],
    width: VarOffsetWidth,
    min_row_size: usize,
    max_row_size: usize,
    ctx: &Context,
) -> JetResult<Vec<u8>> {
    debug_assert_eq!(columns.len(), values.len());

    let null_mask_bytes = max_column_count.div_ceil(8);
    let mut null_mask = vec![0u8; null_mask_bytes];

    // Fixed-column region (step 3).
    let fixed_region_len = columns
        .iter()
        .filter(|c| !c.variable && !c.stores_in_null_mask)
        .map(|c| c.fixed_data_offset + c.fixed_size)
        .max()
        .unwrap_or(0);
    let mut fixed_region = vec![0u8; fixed_region_len];

    for (col, val) in columns.iter().zip(values.iter()) {
        if col.stores_in_null_mask {
            if val.is_some() {
                set_null_bit(&mut null_mask, col.null_mask_bit, true);
            }
            continue;
        }
        if col.variable {
            continue;
        }
        if let Some(bytes) = val {
            set_null_bit(&mut null_mask, col.null_mask_bit, true);
            fixed_region[col.fixed_data_offset..col.fixed_data_offset + col.fixed_size]
                .copy_from_slice(bytes);
        }
    }

    // Variable-column region (step 4), in offset-table order.
    let mut by_order: Vec<Option<(&ColumnPlan, &Option<Vec<u8>>)>> = vec![None; max_var_column_count];
    for (col, val) in columns.iter().zip(values.iter()) {
        if col.variable {
            by_order[col.var_order] = Some((col, val));
        }
    }

    let (eod_width, offset_width) = match width {
        VarOffsetWidth::Short => (2, 2),
        VarOffsetWidth::JumpTable => (1, 1),
    };
    let header_and_fixed = 2 + fixed_region.len();
    let trailer_len = eod_width + offset_width * max_var_column_count + 2 + null_mask_bytes;
    let mut remaining = max_row_size.saturating_sub(header_and_fixed + trailer_len);

    let mut var_bytes = Vec::new();
    let mut var_offsets = vec![0u16; max_var_column_count];
    let mut cursor: u16 = 0;
    for (i, slot) in by_order.iter().enumerate() {
        var_offsets[i] = cursor;
        if let Some((col, val)) = slot {
            if let Some(bytes) = val {
                if bytes.len() > remaining {
                    return Err(JetError::invalid_value(
                        "row exceeds MAX_ROW_SIZE",
                        ctx.clone(),
                    ));
                }
                set_null_bit(&mut null_mask, col.null_mask_bit, true);
                var_bytes.extend_from_slice(bytes);
                cursor += bytes.len() as u16;
                remaining -= bytes.len();
            }
        }
    }
    let eod = cursor;
    if width == VarOffsetWidth::JumpTable && eod > 255 {
        return Err(JetError::invalid_value(
            "row's variable-length data exceeds the 255-byte limit of the Jet3 jump-table offset format",
            ctx.clone(),
        ));
    }

    let mut out = Vec::with_capacity(header_and_fixed + var_bytes.len() + trailer_len);
    out.extend_from_slice(&(max_column_count as u16).to_le_bytes());
    out.extend_from_slice(&fixed_region);
    out.extend_from_slice(&var_bytes);

    // Padding to min_row_size (step 6).
    let body_with_trailer = out.len() + trailer_len;
    if body_with_trailer < min_row_size {
        out.resize(out.len() + (min_row_size - body_with_trailer), 0);
    }

    match width {
        VarOffsetWidth::Short => {
            out.extend_from_slice(&eod.to_le_bytes());
            for off in var_offsets.iter().rev() {
                out.extend_from_slice(&off.to_le_bytes());
            }
        }
        VarOffsetWidth::JumpTable => {
            out.push((eod & 0xFF) as u8);
            for off in var_offsets.iter().rev() {
                out.push((off & 0xFF) as u8);
            }
        }
    }
    out.extend_from_slice(&(max_var_column_count as u16).to_le_bytes());
    out.extend_from_slice(&null_mask);

    if out.len() > max_row_size {
        return Err(JetError::invalid_value(
            "row exceeds MAX_ROW_SIZE",
            ctx.clone(),
        ));
    }
    Ok(out)
}

const FIXED_DATA_ROW_OFFSET: usize = 2;

/// Read a single column's value bytes out of a row buffer. Returns `None`
/// if the column is null. The `stores_in_null_mask` case is handled by the
/// caller (the null-mask bit itself is the whole value).
pub fn read_column<'a>(
    row: &'a [u8],
    col: &ColumnPlan,
    max_column_count: usize,
    max_var_column_count: usize,
    width: VarOffsetWidth,
) -> Option<&'a [u8]> {
    let null_mask_bytes = max_column_count.div_ceil(8);
    let null_mask_start = row.len() - null_mask_bytes;
    let null_mask = &row[null_mask_start..];

    if col.stores_in_null_mask {
        return if null_bit(null_mask, col.null_mask_bit) {
            Some(&[][..])
        } else {
            None
        };
    }
    if !null_bit(null_mask, col.null_mask_bit) {
        return None;
    }
    if !col.variable {
        let start = FIXED_DATA_ROW_OFFSET + col.fixed_data_offset;
        return Some(&row[start..start + col.fixed_size]);
    }

    let offsets = read_var_offsets(row, max_var_column_count, width, null_mask_bytes);
    let var_region_start = FIXED_DATA_ROW_OFFSET;
    let start = offsets[col.var_order] as usize;
    let end = if col.var_order + 1 < offsets.len() {
        offsets[col.var_order + 1] as usize
    } else {
        // Last entry's end is the EOD marker.
        read_eod(row, max_var_column_count, width, null_mask_bytes) as usize
    };
    Some(&row[var_region_start + start..var_region_start + end])
}

fn read_eod(row: &[u8], max_var_column_count: usize, width: VarOffsetWidth, null_mask_bytes: usize) -> u16 {
    match width {
        VarOffsetWidth::Short => {
            let offsets_start = row.len() - null_mask_bytes - 2 - 2 * max_var_column_count;
            util::getu16(row, offsets_start - 2)
        }
        VarOffsetWidth::JumpTable => {
            let offsets_start = row.len() - null_mask_bytes - 2 - max_var_column_count;
            row[offsets_start - 1] as u16
        }
    }
}

fn read_var_offsets(
    row: &[u8],
    max_var_column_count: usize,
    width: VarOffsetWidth,
    null_mask_bytes: usize,
) -> Vec<u16> {
    match width {
        VarOffsetWidth::Short => {
            // Layout from the tail: null_mask | var_count(2) | offsets(2 each,
            // reverse order) | eod(2).
            let limit = row.len() - null_mask_bytes - 2;
            let mut offsets = vec![0u16; max_var_column_count];
            for i in 0..max_var_column_count {
                offsets[i] = util::getu16(row, limit - 2 * (i + 1));
            }
            offsets
        }
        VarOffsetWidth::JumpTable => {
            // 1-byte offsets with periodic jump markers recording 256-wraps.
            let limit = row.len() - null_mask_bytes - 2;
            let mut offsets = vec![0u16; max_var_column_count];
            let mut wrap = 0u16;
            let mut prev = 0u16;
            for i in 0..max_var_column_count {
                let raw = row[limit - (i + 1)] as u16;
                if raw < prev {
                    wrap += 256;
                }
                prev = raw;
                offsets[i] = raw + wrap;
            }
            offsets
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple_columns() -> Vec<ColumnPlan> {
        vec![
            ColumnPlan {
                null_mask_bit: 0,
                stores_in_null_mask: false,
                variable: false,
                fixed_data_offset: 0,
                fixed_size: 4,
                var_order: 0,
            },
            ColumnPlan {
                null_mask_bit: 1,
                stores_in_null_mask: false,
                variable: true,
                fixed_data_offset: 0,
                fixed_size: 0,
                var_order: 0,
            },
        ]
    }

    #[test]
    fn round_trips_fixed_and_variable_columns() {
        let columns = simple_columns();
        let values = vec![Some(42i32.to_le_bytes().to_vec()), Some(b"hello".to_vec())];
        let row = create_row(2, 1, &columns, &values, VarOffsetWidth::Short, 0, 4096, &Context::default()).unwrap();

        let fixed = read_column(&row, &columns[0], 2, 1, VarOffsetWidth::Short).unwrap();
        assert_eq!(i32::from_le_bytes(fixed.try_into().unwrap()), 42);

        let var = read_column(&row, &columns[1], 2, 1, VarOffsetWidth::Short).unwrap();
        assert_eq!(var, b"hello");
    }

    #[test]
    fn null_fixed_column_reads_as_none() {
        let columns = simple_columns();
        let values = vec![None, Some(b"x".to_vec())];
        let row = create_row(2, 1, &columns, &values, VarOffsetWidth::Short, 0, 4096, &Context::default()).unwrap();
        assert!(read_column(&row, &columns[0], 2, 1, VarOffsetWidth::Short).is_none());
    }

    #[test]
    fn min_row_size_pads_body() {
        let columns = simple_columns();
        let values = vec![Some(1i32.to_le_bytes().to_vec()), None];
        let row = create_row(2, 1, &columns, &values, VarOffsetWidth::Short, 64, 4096, &Context::default()).unwrap();
        assert!(row.len() >= 64);
    }

    #[test]
    fn jump_table_round_trips_fixed_and_variable_columns() {
        let columns = simple_columns();
        let values = vec![Some(42i32.to_le_bytes().to_vec()), Some(b"hello".to_vec())];
        let row = create_row(2, 1, &columns, &values, VarOffsetWidth::JumpTable, 0, 4096, &Context::default()).unwrap();

        let fixed = read_column(&row, &columns[0], 2, 1, VarOffsetWidth::JumpTable).unwrap();
        assert_eq!(i32::from_le_bytes(fixed.try_into().unwrap()), 42);

        let var = read_column(&row, &columns[1], 2, 1, VarOffsetWidth::JumpTable).unwrap();
        assert_eq!(var, b"hello");
    }

    #[test]
    fn jump_table_rejects_rows_whose_variable_data_exceeds_255_bytes() {
        let columns = simple_columns();
        let values = vec![Some(1i32.to_le_bytes().to_vec()), Some(vec![0u8; 300])];
        let result = create_row(2, 1, &columns, &values, VarOffsetWidth::JumpTable, 0, 8192, &Context::default());
        assert!(result.is_err());
    }
}
