//! Row-wise numeric primitives used by the graph executor.

/// Normalization flavour of a norm op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    /// `x / sqrt(mean(x²) + ε)`
    Rms,
    /// `(x - mean) / sqrt(var + ε)`
    Layer,
}

/// Normalizes `input` into `output`, then applies the optional scale and shift.
pub fn norm(kind: NormKind, output: &mut [f32], input: &[f32], weight: Option<&[f32]>, bias: Option<&[f32]>, eps: f32) {
    debug_assert_eq!(output.len(), input.len());
    let n = input.len() as f32;

    match kind {
        NormKind::Rms => {
            let sum_of_squares = input.iter().map(|&x| x * x).sum::<f32>();
            let factor = 1.0f32 / ((sum_of_squares / n) + eps).sqrt();
            output.iter_mut().zip(input).for_each(|(out, &x)| *out = x * factor);
        }
        NormKind::Layer => {
            let mean = input.iter().sum::<f32>() / n;
            let variance = input.iter().map(|&x| (x - mean) * (x - mean)).sum::<f32>() / n;
            let factor = 1.0f32 / (variance + eps).sqrt();
            output.iter_mut().zip(input).for_each(|(out, &x)| *out = (x - mean) * factor);
        }
    }

    if let Some(weight) = weight {
        output.iter_mut().zip(weight).for_each(|(out, &w)| *out *= w);
    }
    if let Some(bias) = bias {
        output.iter_mut().zip(bias).for_each(|(out, &b)| *out += b);
    }
}

/// Rotary position embedding over the first `n_rot` values of one head.
///
/// Dimension `i` is paired with `i + n_rot/2` and rotated by `pos * theta^(-2i/n_rot)`.
pub fn rope(head: &mut [f32], pos: usize, n_rot: usize, theta: f32) {
    debug_assert!(n_rot <= head.len() && n_rot % 2 == 0);
    let half = n_rot / 2;
    let (first_half, rest) = head.split_at_mut(half);
    let second_half = &mut rest[..half];

    first_half.iter_mut().zip(second_half.iter_mut()).enumerate().for_each(|(i, (x, y))| {
        let freq = theta.powf(-(i as f32) / half as f32);
        let (sin, cos) = (pos as f32 * freq).sin_cos();
        let (x_val, y_val) = (*x, *y);
        *x = x_val * cos - y_val * sin;
        *y = x_val * sin + y_val * cos;
    });
}

/// Applies softmax normalization to a slice in-place.
///
/// Entries equal to negative infinity come out as exactly zero.
pub fn softmax(x: &mut [f32]) {
    let max_val = x.iter().fold(f32::NEG_INFINITY, |acc, &val| acc.max(val));
    if max_val == f32::NEG_INFINITY {
        x.fill(0.0);
        return;
    }
    let sum = x
        .iter_mut()
        .map(|val| {
            *val = (*val - max_val).exp();
            *val
        })
        .sum::<f32>();
    let inv_sum = sum.recip();
    x.iter_mut().for_each(|val| *val *= inv_sum);
}

const GELU_COEF_A: f32 = 0.044715;
const SQRT_2_OVER_PI: f32 = 0.797_884_6;

/// Tanh approximation of GELU.
#[inline]
pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * x * (1.0 + GELU_COEF_A * x * x)).tanh())
}

#[inline]
pub fn silu(x: f32) -> f32 {
    x * (1.0f32 + (-x).exp()).recip()
}

/// Per-head ALiBi slopes for `n_head` heads and a maximum bias of `bias_max`.
///
/// Heads beyond the largest power of two below `n_head` interleave with a second
/// geometric sequence, as in the reference ALiBi formulation.
pub fn alibi_slopes(n_head: usize, bias_max: f32) -> Vec<f32> {
    let n_floor = 1usize << (usize::BITS - 1 - n_head.max(1).leading_zeros());
    let m0 = 2.0f32.powf(-bias_max / n_floor as f32);
    let m1 = 2.0f32.powf(-(bias_max / 2.0) / n_floor as f32);

    (0..n_head)
        .map(|h| if h < n_floor { m0.powi(h as i32 + 1) } else { m1.powi(2 * (h - n_floor) as i32 + 1) })
        .collect()
}
