//! Host implementations of the device kernels.
//!
//! Batch tensors are laid out `d0` innermost, so an FC activation of
//! `[units, batch]` is a row-major `(batch, units)` matrix and a feature map of
//! `[w, h, c, batch]` is a row-major `(batch, c, h, w)` array.

use ndarray::{ArrayView1, ArrayView2, ArrayView3, ArrayView4, ArrayViewMut1, ArrayViewMut2, ArrayViewMut4, Axis, Zip};

use super::{ConvDims, FcDims, PoolDims, TargetEncoding, PROB_FLOOR};
use crate::error::{Error, Result};

pub fn fc_forward(x: &[f32], w: &[f32], b: &[f32], y: &mut [f32], d: FcDims) -> Result<()> {
    let x = ArrayView2::from_shape((d.batch, d.in_units), x)?;
    let w = ArrayView2::from_shape((d.out_units, d.in_units), w)?;
    let b = ArrayView1::from_shape(d.out_units, b)?;
    let mut y = ArrayViewMut2::from_shape((d.batch, d.out_units), y)?;
    y.assign(&(x.dot(&w.t()) + &b));
    Ok(())
}

pub fn fc_backward_input(w: &[f32], dy: &[f32], dx: &mut [f32], d: FcDims) -> Result<()> {
    let w = ArrayView2::from_shape((d.out_units, d.in_units), w)?;
    let dy = ArrayView2::from_shape((d.batch, d.out_units), dy)?;
    let mut dx = ArrayViewMut2::from_shape((d.batch, d.in_units), dx)?;
    dx.assign(&dy.dot(&w));
    Ok(())
}

pub fn fc_backward_weight(dy: &[f32], x: &[f32], dw: &mut [f32], d: FcDims) -> Result<()> {
    let dy = ArrayView2::from_shape((d.batch, d.out_units), dy)?;
    let x = ArrayView2::from_shape((d.batch, d.in_units), x)?;
    let mut dw = ArrayViewMut2::from_shape((d.out_units, d.in_units), dw)?;
    dw.assign(&dy.t().dot(&x));
    Ok(())
}

pub fn channel_sum(dy: &[f32], db: &mut [f32], inner: usize, channels: usize, outer: usize) -> Result<()> {
    let dy = ArrayView3::from_shape((outer, channels, inner), dy)?;
    let mut db = ArrayViewMut1::from_shape(channels, db)?;
    db.assign(&dy.sum_axis(Axis(2)).sum_axis(Axis(0)));
    Ok(())
}

/// Input coordinate read by output position `o` at kernel tap `k`, or `None`
/// when the tap lands in the zero padding.
fn source(o: usize, k: usize, d: &ConvDims, size: usize) -> Option<usize> {
    (o * d.stride + k).checked_sub(d.padding).filter(|&i| i < size)
}

/// Output position whose tap `k` reads input coordinate `i`, if any.
fn target(i: usize, k: usize, d: &ConvDims, size: usize) -> Option<usize> {
    (i + d.padding)
        .checked_sub(k)
        .filter(|t| t % d.stride == 0)
        .map(|t| t / d.stride)
        .filter(|&o| o < size)
}

pub fn conv2d_forward(x: &[f32], w: &[f32], b: &[f32], y: &mut [f32], d: &ConvDims) -> Result<()> {
    let x = ArrayView4::from_shape((d.batch, d.in_c, d.in_h, d.in_w), x)?;
    let w = ArrayView4::from_shape((d.out_c, d.in_c, d.kernel, d.kernel), w)?;
    let mut y = ArrayViewMut4::from_shape((d.batch, d.out_c, d.out_h, d.out_w), y)?;

    for n in 0..d.batch {
        for oc in 0..d.out_c {
            for oy in 0..d.out_h {
                for ox in 0..d.out_w {
                    let mut acc = b[oc];
                    for ic in 0..d.in_c {
                        for ky in 0..d.kernel {
                            let Some(iy) = source(oy, ky, d, d.in_h) else { continue };
                            for kx in 0..d.kernel {
                                let Some(ix) = source(ox, kx, d, d.in_w) else { continue };
                                acc += w[[oc, ic, ky, kx]] * x[[n, ic, iy, ix]];
                            }
                        }
                    }
                    y[[n, oc, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(())
}

pub fn conv2d_backward_input(w: &[f32], dy: &[f32], dx: &mut [f32], d: &ConvDims) -> Result<()> {
    let w = ArrayView4::from_shape((d.out_c, d.in_c, d.kernel, d.kernel), w)?;
    let dy = ArrayView4::from_shape((d.batch, d.out_c, d.out_h, d.out_w), dy)?;
    let mut dx = ArrayViewMut4::from_shape((d.batch, d.in_c, d.in_h, d.in_w), dx)?;

    for n in 0..d.batch {
        for ic in 0..d.in_c {
            for iy in 0..d.in_h {
                for ix in 0..d.in_w {
                    let mut acc = 0.0;
                    for oc in 0..d.out_c {
                        for ky in 0..d.kernel {
                            let Some(oy) = target(iy, ky, d, d.out_h) else { continue };
                            for kx in 0..d.kernel {
                                let Some(ox) = target(ix, kx, d, d.out_w) else { continue };
                                acc += w[[oc, ic, ky, kx]] * dy[[n, oc, oy, ox]];
                            }
                        }
                    }
                    dx[[n, ic, iy, ix]] = acc;
                }
            }
        }
    }
    Ok(())
}

pub fn conv2d_backward_weight(dy: &[f32], x: &[f32], dw: &mut [f32], d: &ConvDims) -> Result<()> {
    let dy = ArrayView4::from_shape((d.batch, d.out_c, d.out_h, d.out_w), dy)?;
    let x = ArrayView4::from_shape((d.batch, d.in_c, d.in_h, d.in_w), x)?;
    let mut dw = ArrayViewMut4::from_shape((d.out_c, d.in_c, d.kernel, d.kernel), dw)?;

    for oc in 0..d.out_c {
        for ic in 0..d.in_c {
            for ky in 0..d.kernel {
                for kx in 0..d.kernel {
                    let mut acc = 0.0;
                    for n in 0..d.batch {
                        for oy in 0..d.out_h {
                            let Some(iy) = source(oy, ky, d, d.in_h) else { continue };
                            for ox in 0..d.out_w {
                                let Some(ix) = source(ox, kx, d, d.in_w) else { continue };
                                acc += dy[[n, oc, oy, ox]] * x[[n, ic, iy, ix]];
                            }
                        }
                    }
                    dw[[oc, ic, ky, kx]] = acc;
                }
            }
        }
    }
    Ok(())
}

pub fn max_pool_forward(x: &[f32], y: &mut [f32], argmax: &mut [f32], d: &PoolDims) -> Result<()> {
    let (out_h, out_w) = (d.out_h(), d.out_w());
    let x = ArrayView4::from_shape((d.batch, d.channels, d.in_h, d.in_w), x)?;
    let mut y = ArrayViewMut4::from_shape((d.batch, d.channels, out_h, out_w), y)?;
    let mut argmax = ArrayViewMut4::from_shape((d.batch, d.channels, out_h, out_w), argmax)?;

    for n in 0..d.batch {
        for c in 0..d.channels {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut best = x[[n, c, 2 * oy, 2 * ox]];
                    let mut slot = 0;
                    for k in 1..4 {
                        let v = x[[n, c, 2 * oy + k / 2, 2 * ox + k % 2]];
                        if v > best {
                            best = v;
                            slot = k;
                        }
                    }
                    y[[n, c, oy, ox]] = best;
                    argmax[[n, c, oy, ox]] = slot as f32;
                }
            }
        }
    }
    Ok(())
}

pub fn max_pool_backward(dy: &[f32], argmax: &[f32], dx: &mut [f32], d: &PoolDims) -> Result<()> {
    let (out_h, out_w) = (d.out_h(), d.out_w());
    let dy = ArrayView4::from_shape((d.batch, d.channels, out_h, out_w), dy)?;
    let argmax = ArrayView4::from_shape((d.batch, d.channels, out_h, out_w), argmax)?;
    let mut dx = ArrayViewMut4::from_shape((d.batch, d.channels, d.in_h, d.in_w), dx)?;

    dx.fill(0.0);
    for ((n, c, oy, ox), &g) in dy.indexed_iter() {
        let slot = argmax[[n, c, oy, ox]] as usize;
        dx[[n, c, 2 * oy + slot / 2, 2 * ox + slot % 2]] = g;
    }
    Ok(())
}

pub fn multiply(a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
    Zip::from(ArrayViewMut1::from(out))
        .and(ArrayView1::from(a))
        .and(ArrayView1::from(b))
        .for_each(|o, &a, &b| *o = a * b);
    Ok(())
}

pub fn relu_forward(x: &[f32], y: &mut [f32]) -> Result<()> {
    Zip::from(ArrayViewMut1::from(y))
        .and(ArrayView1::from(x))
        .for_each(|y, &x| *y = x.max(0.0));
    Ok(())
}

pub fn relu_backward(x: &[f32], dy: &[f32], dx: &mut [f32]) -> Result<()> {
    Zip::from(ArrayViewMut1::from(dx))
        .and(ArrayView1::from(x))
        .and(ArrayView1::from(dy))
        .for_each(|dx, &x, &dy| *dx = if x > 0.0 { dy } else { 0.0 });
    Ok(())
}

pub fn softmax_forward(x: &[f32], y: &mut [f32], classes: usize) -> Result<()> {
    for (xs, ys) in x.chunks_exact(classes).zip(y.chunks_exact_mut(classes)) {
        let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (y, &x) in ys.iter_mut().zip(xs) {
            *y = (x - max).exp();
            sum += *y;
        }
        for y in ys.iter_mut() {
            *y = (*y / sum).max(PROB_FLOOR);
        }
    }
    Ok(())
}

pub fn softmax_backward(
    y: &[f32],
    target: &[f32],
    dx: &mut [f32],
    classes: usize,
    encoding: TargetEncoding,
) -> Result<()> {
    let batch = y.len() / classes;
    let scale = 1.0 / batch as f32;
    for (n, (ys, dxs)) in y.chunks_exact(classes).zip(dx.chunks_exact_mut(classes)).enumerate() {
        for (c, (dx, &p)) in dxs.iter_mut().zip(ys).enumerate() {
            let t = match encoding {
                TargetEncoding::Dense => target[n * classes + c],
                TargetEncoding::Indices => {
                    let label = target[n];
                    if !(0.0..classes as f32).contains(&label) {
                        return Err(Error::config(format!(
                            "label {label} outside [0, {classes}) in batch column {n}"
                        )));
                    }
                    if label as usize == c {
                        1.0
                    } else {
                        0.0
                    }
                }
            };
            *dx = (p - t) * scale;
        }
    }
    Ok(())
}

pub fn scaled_difference(a: &[f32], b: &[f32], out: &mut [f32], scale: f32) -> Result<()> {
    Zip::from(ArrayViewMut1::from(out))
        .and(ArrayView1::from(a))
        .and(ArrayView1::from(b))
        .for_each(|o, &a, &b| *o = scale * (a - b));
    Ok(())
}

pub fn axpy(alpha: f32, x: &[f32], y: &mut [f32]) -> Result<()> {
    let mut y = ArrayViewMut1::from(y);
    y.scaled_add(alpha, &ArrayView1::from(x));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(in_w: usize, in_c: usize, out_c: usize, kernel: usize, stride: usize, padding: usize) -> ConvDims {
        let out_w = (in_w + 2 * padding - kernel) / stride + 1;
        ConvDims {
            in_w,
            in_h: in_w,
            in_c,
            out_w,
            out_h: out_w,
            out_c,
            kernel,
            stride,
            padding,
            batch: 1,
        }
    }

    #[test]
    fn test_fc_forward_matches_hand_computation() {
        // w = [[1, 2], [3, 4], [5, 6]], two batch columns.
        let w = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [0.5, 0.0, -1.0];
        let x = [1.0, 1.0, 2.0, -1.0];
        let mut y = [0.0; 6];
        let d = FcDims {
            in_units: 2,
            out_units: 3,
            batch: 2,
        };
        fc_forward(&x, &w, &b, &mut y, d).unwrap();
        assert_eq!(y, [3.5, 7.0, 10.0, 0.5, 2.0, 3.0]);
    }

    #[test]
    fn test_padded_convolution_zero_fills_borders() {
        // 3x3 ones, 3x3 ones kernel, padding 1: corner sees 4, edge 6, centre 9.
        let d = conv(3, 1, 1, 3, 1, 1);
        let x = [1.0; 9];
        let w = [1.0; 9];
        let mut y = [0.0; 9];
        conv2d_forward(&x, &w, &[0.0], &mut y, &d).unwrap();
        assert_eq!(y, [4.0, 6.0, 4.0, 6.0, 9.0, 6.0, 4.0, 6.0, 4.0]);
    }

    #[test]
    fn test_strided_convolution_output_size() {
        let d = conv(5, 1, 1, 3, 2, 0);
        assert_eq!(d.out_w, 2);
        let x: Vec<f32> = (0..25).map(|v| v as f32).collect();
        let mut w = [0.0; 9];
        w[4] = 1.0; // centre tap picks the window centre
        let mut y = [0.0; 4];
        conv2d_forward(&x, &w, &[0.0], &mut y, &d).unwrap();
        assert_eq!(y, [6.0, 8.0, 16.0, 18.0]);
    }

    #[test]
    fn test_transposed_convolution_is_the_adjoint() {
        // <conv(x), dy> == <x, conv_backward_input(dy)> for any x, dy.
        let d = conv(4, 2, 3, 3, 2, 1);
        let x: Vec<f32> = (0..d.input_len()).map(|v| (v as f32 * 0.37).sin()).collect();
        let w: Vec<f32> = (0..d.weight_len()).map(|v| (v as f32 * 0.11).cos()).collect();
        let dy: Vec<f32> = (0..d.output_len()).map(|v| (v as f32 * 0.53).sin()).collect();
        let b = vec![0.0; d.out_c];

        let mut y = vec![0.0; d.output_len()];
        conv2d_forward(&x, &w, &b, &mut y, &d).unwrap();
        let mut dx = vec![0.0; d.input_len()];
        conv2d_backward_input(&w, &dy, &mut dx, &d).unwrap();

        let lhs: f32 = y.iter().zip(&dy).map(|(a, b)| a * b).sum();
        let rhs: f32 = x.iter().zip(&dx).map(|(a, b)| a * b).sum();
        assert!((lhs - rhs).abs() < 1e-3, "{lhs} vs {rhs}");
    }

    #[test]
    fn test_softmax_survives_large_logits() {
        let x = [1000.0, 1.0, 2.0, -1000.0];
        let mut y = [0.0; 4];
        softmax_forward(&x, &mut y, 4).unwrap();
        assert!(y.iter().all(|v| v.is_finite() && *v > 0.0));
        let sum: f32 = y.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_softmax_backward_rejects_out_of_range_labels() {
        let y = [0.5, 0.5];
        let mut dx = [0.0; 2];
        let err = softmax_backward(&y, &[2.0], &mut dx, 2, TargetEncoding::Indices);
        assert!(err.is_err());
    }

    #[test]
    fn test_channel_sum_reduces_inner_and_outer() {
        // inner 2, channels 2, outer 2
        let dy = [1.0, 2.0, 10.0, 20.0, 3.0, 4.0, 30.0, 40.0];
        let mut db = [0.0; 2];
        channel_sum(&dy, &mut db, 2, 2, 2).unwrap();
        assert_eq!(db, [10.0, 100.0]);
    }
}
