use crate::device::Device;
use crate::error::{Error, Result};
use crate::kernels::{self, TargetEncoding};
use crate::layer::{batch_of, Layer};
use crate::tensor::{Shape, SyncState, Tensor};

/// Per-column softmax, trained as the terminal layer with a fused
/// cross-entropy gradient `(p - onehot(target)) / batch`.
///
/// The target is either one class index per batch column or a dense
/// distribution shaped like the output.
#[derive(Debug)]
pub struct Softmax {
    shape: Shape,
    output: Tensor,
    input_grad: Tensor,
}

impl Softmax {
    pub fn new(device: &Device, shape: Shape) -> Result<Self> {
        Ok(Softmax {
            shape,
            output: Tensor::with_shape(device, shape)?,
            input_grad: Tensor::with_shape(device, shape)?,
        })
    }

    pub fn classes(&self) -> usize {
        self.shape.numel()
    }
}

/// Class indices must be whole numbers in `[0, classes)`.
fn check_labels(labels: &[f32], classes: usize) -> Result<()> {
    for (column, &label) in labels.iter().enumerate() {
        if label.fract() != 0.0 || !(0.0..classes as f32).contains(&label) {
            return Err(Error::config(format!(
                "label {label} in batch column {column} is not a class index below {classes}"
            )));
        }
    }
    Ok(())
}

impl Layer for Softmax {
    fn name(&self) -> &'static str {
        "softmax"
    }

    fn input_shape(&self) -> Shape {
        self.shape
    }

    fn output_shape(&self) -> Shape {
        self.shape
    }

    fn forward(&mut self, input: &Tensor, _training: bool) -> Result<&Tensor> {
        let batch = batch_of("softmax forward", self.shape, input)?;
        self.output.ensure_shape(self.shape.with_batch(batch)?)?;
        let classes = self.classes();
        kernels::softmax_forward(input, &mut self.output, classes, batch)?;
        Ok(&self.output)
    }

    fn backward(&mut self, input: &Tensor, target: &Tensor) -> Result<&Tensor> {
        let classes = self.classes();
        let batch = batch_of("softmax backward", self.shape, input)?;
        let encoding = if target.len() == classes * batch {
            TargetEncoding::Dense
        } else if target.len() == batch {
            TargetEncoding::Indices
        } else {
            return Err(Error::config(format!(
                "softmax target of {} elements fits neither {batch} labels nor {} probabilities",
                target.len(),
                classes * batch
            )));
        };
        if target.sync_state() == SyncState::HostAhead {
            return Err(Error::Unsynced("softmax target"));
        }
        if encoding == TargetEncoding::Indices {
            if target.host_is_current() {
                check_labels(target.host(), classes)?;
            } else {
                check_labels(&target.to_vec()?, classes)?;
            }
        }

        self.input_grad.ensure_shape(input.shape())?;
        kernels::softmax_backward(&self.output, target, &mut self.input_grad, classes, batch, encoding)?;
        Ok(&self.input_grad)
    }

    fn output(&self) -> &Tensor {
        &self.output
    }

    fn input_grad(&self) -> &Tensor {
        &self.input_grad
    }

    fn is_terminal(&self) -> bool {
        true
    }
}
