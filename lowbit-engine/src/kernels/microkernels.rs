use lowbit_quant::QK;
use lowbit_quant::codec::decode_block;

use super::{Activation, Tile, WeightRef};

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&x, &y)| x * y).sum()
}

#[inline]
fn f32_rows<'a>(a: &Activation<'a>) -> (&'a [f32], usize) {
    match *a {
        Activation::F32 { data, k } => (data, k),
        Activation::Int8 { .. } => unreachable!("float kernel dispatched with int8 activations"),
    }
}

pub(super) fn dense_f32(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
    let WeightRef::F32 { data: weights, k, .. } = *w else { unreachable!("dense_f32 dispatched on {w:?}") };
    let (x, _) = f32_rows(a);

    for c in 0..tile.cols {
        let w_row = &weights[(tile.col + c) * k..][..k];
        for r in 0..tile.rows {
            let x_row = &x[(tile.row + r) * k..][..k];
            out[r * ld + c] = dot(x_row, w_row);
        }
    }
}

pub(super) fn dense_f16(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
    let WeightRef::F16 { data: weights, k, .. } = *w else { unreachable!("dense_f16 dispatched on {w:?}") };
    let (x, _) = f32_rows(a);
    let mut w_row = vec![0.0f32; k];

    for c in 0..tile.cols {
        w_row.iter_mut().zip(&weights[(tile.col + c) * k..][..k]).for_each(|(d, s)| *d = s.to_f32());
        for r in 0..tile.rows {
            let x_row = &x[(tile.row + r) * k..][..k];
            out[r * ld + c] = dot(x_row, &w_row);
        }
    }
}

/// Block-format weights: each weight row is decoded one block at a time and the
/// per-block partial dot products are summed in block order.
pub(super) fn blocks(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
    let WeightRef::Blocks { format, data, k, .. } = *w else { unreachable!("blocks dispatched on {w:?}") };
    let (x, _) = f32_rows(a);
    let block_bytes = format.block_bytes();
    let row_bytes = k / QK * block_bytes;
    let mut decoded = [0.0f32; QK];
    let mut acc = vec![0.0f32; tile.rows];

    for c in 0..tile.cols {
        let w_row = &data[(tile.col + c) * row_bytes..][..row_bytes];
        acc.fill(0.0);
        for (kb, block) in w_row.chunks_exact(block_bytes).enumerate() {
            decode_block(format, block, &mut decoded);
            for (r, sum) in acc.iter_mut().enumerate() {
                *sum += dot(&x[(tile.row + r) * k + kb * QK..][..QK], &decoded);
            }
        }
        for (r, &sum) in acc.iter().enumerate() {
            out[r * ld + c] = sum;
        }
    }
}

/// Packed weights with float activations. Also serves the bf16 family, whose
/// activations are rounded to bf16 before dispatch.
pub(super) fn packed_f32(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
    let WeightRef::Packed(packed) = *w else { unreachable!("packed_f32 dispatched on {w:?}") };
    let (x, k) = f32_rows(a);
    let bs = packed.block_size();
    let mut codes = vec![0i8; bs];
    let mut acc = vec![0.0f32; tile.rows];

    for c in 0..tile.cols {
        let col = tile.col + c;
        acc.fill(0.0);
        for kb in 0..packed.k_blocks() {
            packed.column_block(col, kb, &mut codes);
            let scale = packed.scale(col, kb);
            for (r, sum) in acc.iter_mut().enumerate() {
                let x_block = &x[(tile.row + r) * k + kb * bs..][..bs];
                let partial: f32 = x_block.iter().zip(&codes).map(|(&v, &q)| v * q as f32).sum();
                *sum += partial * scale;
            }
        }
        for (r, &sum) in acc.iter().enumerate() {
            out[r * ld + c] = sum;
        }
    }
}

/// Packed weights with int8 activations: integer dot products per block,
/// scaled by both the weight and the activation block scale.
pub(super) fn packed_int8(w: &WeightRef<'_>, a: &Activation<'_>, tile: Tile, out: &mut [f32], ld: usize) {
    let WeightRef::Packed(packed) = *w else { unreachable!("packed_int8 dispatched on {w:?}") };
    let Activation::Int8 { rows } = *a else { unreachable!("packed_int8 dispatched with float activations") };
    let bs = packed.block_size();
    let mut codes = vec![0i8; bs];
    let mut acc = vec![0.0f32; tile.rows];

    for c in 0..tile.cols {
        let col = tile.col + c;
        acc.fill(0.0);
        for kb in 0..packed.k_blocks() {
            packed.column_block(col, kb, &mut codes);
            let w_scale = packed.scale(col, kb);
            for (r, sum) in acc.iter_mut().enumerate() {
                let row = rows[tile.row + r];
                let x_codes = &row.codes[kb * bs..][..bs];
                let isum: i32 = x_codes.iter().zip(&codes).map(|(&x, &q)| x as i32 * q as i32).sum();
                *sum += isum as f32 * (w_scale * row.scales[kb]);
            }
        }
        for (r, &sum) in acc.iter().enumerate() {
            out[r * ld + c] = sum;
        }
    }
}
