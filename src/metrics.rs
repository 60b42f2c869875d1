//! Evaluation helpers for classifier outputs laid out `[classes, batch]`.

use ndarray::ArrayView2;

use crate::error::{Error, Result};

/// Summed negative log-likelihood of the true class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogLoss {
    pub total: f64,
    /// Samples that contributed to `total`.
    pub counted: usize,
    /// Samples whose true-class probability was not a positive finite number.
    pub skipped: usize,
}

impl LogLoss {
    pub fn mean(&self) -> f64 {
        if self.counted == 0 {
            0.0
        } else {
            self.total / self.counted as f64
        }
    }
}

impl std::ops::AddAssign for LogLoss {
    fn add_assign(&mut self, rhs: Self) {
        self.total += rhs.total;
        self.counted += rhs.counted;
        self.skipped += rhs.skipped;
    }
}

/// Hits within the top 1, 3 and 5 predictions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopK {
    pub samples: usize,
    pub top1: usize,
    pub top3: usize,
    pub top5: usize,
}

impl std::ops::AddAssign for TopK {
    fn add_assign(&mut self, rhs: Self) {
        self.samples += rhs.samples;
        self.top1 += rhs.top1;
        self.top3 += rhs.top3;
        self.top5 += rhs.top5;
    }
}

fn columns<'a>(probs: &'a [f32], labels: &[f32], classes: usize) -> Result<ArrayView2<'a, f32>> {
    if classes == 0 || probs.len() != classes * labels.len() {
        return Err(Error::config(format!(
            "{} probabilities do not form {} columns of {classes} classes",
            probs.len(),
            labels.len()
        )));
    }
    Ok(ArrayView2::from_shape((labels.len(), classes), probs)?)
}

fn class_index(label: f32, classes: usize) -> Result<usize> {
    if label.fract() != 0.0 || !(0.0..classes as f32).contains(&label) {
        return Err(Error::config(format!("label {label} is not a class index below {classes}")));
    }
    Ok(label as usize)
}

/// `-ln p[label]` summed over the batch. Probabilities that are zero,
/// negative or non-finite are skipped rather than poisoning the sum.
pub fn log_loss(probs: &[f32], labels: &[f32], classes: usize) -> Result<LogLoss> {
    let view = columns(probs, labels, classes)?;
    let mut loss = LogLoss::default();
    for (column, &label) in view.rows().into_iter().zip(labels) {
        let p = column[class_index(label, classes)?];
        if p > 0.0 && p.is_finite() {
            loss.total -= f64::from(p).ln();
            loss.counted += 1;
        } else {
            loss.skipped += 1;
        }
    }
    Ok(loss)
}

/// Counts samples whose label is among the `k` most probable classes. A label
/// ranks by how many classes score strictly higher, so ties favour it.
pub fn top_k(probs: &[f32], labels: &[f32], classes: usize, k: usize) -> Result<usize> {
    let view = columns(probs, labels, classes)?;
    let mut hits = 0;
    for (column, &label) in view.rows().into_iter().zip(labels) {
        let p = column[class_index(label, classes)?];
        let rank = column.iter().filter(|&&q| q > p).count();
        if rank < k {
            hits += 1;
        }
    }
    Ok(hits)
}

pub fn accuracy(probs: &[f32], labels: &[f32], classes: usize) -> Result<TopK> {
    Ok(TopK {
        samples: labels.len(),
        top1: top_k(probs, labels, classes, 1)?,
        top3: top_k(probs, labels, classes, 3)?,
        top5: top_k(probs, labels, classes, 5)?,
    })
}
