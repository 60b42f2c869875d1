// MNIST in IDX format (all header fields big-endian):
//   images: magic(2051) | count(u32) | rows(u32) | cols(u32) | pixels(u8...)
//   labels: magic(2049) | count(u32) | labels(u8...)

use std::fs;
use std::path::Path;

use crate::device::Device;
use crate::error::{Error, Result};
use crate::tensor::Tensor;

const IMAGE_MAGIC: u32 = 2051;
const LABEL_MAGIC: u32 = 2049;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn file_names(self) -> (&'static str, &'static str) {
        match self {
            Split::Train => ("train-images.idx3-ubyte", "train-labels.idx1-ubyte"),
            Split::Test => ("t10k-images.idx3-ubyte", "t10k-labels.idx1-ubyte"),
        }
    }
}

/// One device-resident batch: images `[cols, rows, 1, n]` scaled to [0, 1]
/// and one class index per image.
#[derive(Debug)]
pub struct Batch {
    pub images: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Raw MNIST pixels and labels held in memory.
#[derive(Debug, Clone)]
pub struct Mnist {
    pixels: Vec<u8>,
    labels: Vec<u8>,
    rows: usize,
    cols: usize,
}

fn read_u32(bytes: &[u8], offset: usize, what: &str) -> Result<u32> {
    bytes
        .get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| Error::Dataset(format!("{what} header truncated at byte {offset}")))
}

fn check_magic(bytes: &[u8], expected: u32, what: &str) -> Result<()> {
    let got = read_u32(bytes, 0, what)?;
    if got != expected {
        return Err(Error::Dataset(format!(
            "{what}: expected magic {expected}, got {got}"
        )));
    }
    Ok(())
}

fn payload<'a>(bytes: &'a [u8], header: usize, len: usize, what: &str) -> Result<&'a [u8]> {
    let end = header
        .checked_add(len)
        .ok_or_else(|| Error::Dataset(format!("{what}: header sizes overflow")))?;
    bytes
        .get(header..end)
        .ok_or_else(|| Error::Dataset(format!("{what}: expected {len} data bytes, file is short")))
}

impl Mnist {
    /// Loads `split` from the standard file names under `dir`.
    pub fn load(dir: impl AsRef<Path>, split: Split) -> Result<Self> {
        let (images, labels) = split.file_names();
        let dir = dir.as_ref();
        Self::from_idx(&fs::read(dir.join(images))?, &fs::read(dir.join(labels))?)
    }

    pub fn from_idx(image_bytes: &[u8], label_bytes: &[u8]) -> Result<Self> {
        check_magic(image_bytes, IMAGE_MAGIC, "images")?;
        let count = read_u32(image_bytes, 4, "images")? as usize;
        let rows = read_u32(image_bytes, 8, "images")? as usize;
        let cols = read_u32(image_bytes, 12, "images")? as usize;
        if rows == 0 || cols == 0 {
            return Err(Error::Dataset(format!("images: empty {rows}x{cols} image size")));
        }
        let pixel_count = count
            .checked_mul(rows)
            .and_then(|n| n.checked_mul(cols))
            .ok_or_else(|| Error::Dataset(format!("images: {count}x{rows}x{cols} header sizes overflow")))?;
        let pixels = payload(image_bytes, 16, pixel_count, "images")?;

        check_magic(label_bytes, LABEL_MAGIC, "labels")?;
        let label_count = read_u32(label_bytes, 4, "labels")? as usize;
        if label_count != count {
            return Err(Error::Dataset(format!(
                "{count} images but {label_count} labels"
            )));
        }
        let labels = payload(label_bytes, 8, count, "labels")?;

        Ok(Mnist {
            pixels: pixels.to_vec(),
            labels: labels.to_vec(),
            rows,
            cols,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// `(rows, cols)` of every image.
    pub fn image_dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Splits the set into pushed batches of `batch_size`; the last batch
    /// holds the remainder.
    pub fn batches(&self, device: &Device, batch_size: usize) -> Result<Vec<Batch>> {
        if batch_size == 0 {
            return Err(Error::config("batch size must be positive"));
        }
        let pixels_per_image = self.rows * self.cols;
        self.pixels
            .chunks(batch_size * pixels_per_image)
            .zip(self.labels.chunks(batch_size))
            .map(|(pixels, labels)| {
                let n = labels.len();
                let scaled = pixels.iter().map(|&p| f32::from(p) / 255.0).collect();
                let mut images = Tensor::from_vec(device, &[self.cols, self.rows, 1, n], scaled)?;
                images.push()?;
                let mut labels = Tensor::from_vec(device, &[n], labels.iter().map(|&l| f32::from(l)).collect())?;
                labels.push()?;
                Ok(Batch { images, labels })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// IDX image and label files for `labels.len()` images of `rows x cols`
    /// whose pixels are all equal to their label.
    fn idx_files(rows: usize, cols: usize, labels: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut images = Vec::new();
        for v in [IMAGE_MAGIC, labels.len() as u32, rows as u32, cols as u32] {
            images.extend_from_slice(&v.to_be_bytes());
        }
        for &l in labels {
            images.extend(std::iter::repeat(l).take(rows * cols));
        }
        let mut label_file = Vec::new();
        label_file.extend_from_slice(&LABEL_MAGIC.to_be_bytes());
        label_file.extend_from_slice(&(labels.len() as u32).to_be_bytes());
        label_file.extend_from_slice(labels);
        (images, label_file)
    }

    #[test]
    fn test_decodes_and_batches_with_short_tail() {
        let (images, labels) = idx_files(4, 2, &[0, 255, 3, 7, 9]);
        let set = Mnist::from_idx(&images, &labels).unwrap();
        assert_eq!(set.len(), 5);
        assert_eq!(set.image_dims(), (4, 2));

        let batches = set.batches(&Device::Cpu, 2).unwrap();
        assert_eq!(batches.iter().map(Batch::len).collect::<Vec<_>>(), vec![2, 2, 1]);
        assert_eq!(batches[0].images.shape().dims(), &[2, 4, 1, 2]);
        assert_eq!(batches[2].images.shape().dims(), &[2, 4, 1, 1]);

        let first = batches[0].images.to_vec().unwrap();
        assert!(first[..8].iter().all(|&p| p == 0.0));
        assert!(first[8..].iter().all(|&p| p == 1.0));
        assert_eq!(batches[1].labels.to_vec().unwrap(), vec![3.0, 7.0]);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let (mut images, labels) = idx_files(2, 2, &[1]);
        images[3] = 0;
        assert!(matches!(Mnist::from_idx(&images, &labels), Err(Error::Dataset(_))));
        let (images, mut labels) = idx_files(2, 2, &[1]);
        labels[3] = 0;
        assert!(Mnist::from_idx(&images, &labels).is_err());
    }

    #[test]
    fn test_rejects_count_mismatch_and_truncation() {
        let (images, _) = idx_files(2, 2, &[1, 2]);
        let (_, labels) = idx_files(2, 2, &[1]);
        assert!(Mnist::from_idx(&images, &labels).is_err());

        let (images, labels) = idx_files(2, 2, &[1, 2]);
        assert!(Mnist::from_idx(&images[..images.len() - 1], &labels).is_err());
        assert!(Mnist::from_idx(&images[..10], &labels).is_err());
    }

    #[test]
    fn test_oversized_header_is_an_error() {
        let mut images = Vec::new();
        for v in [IMAGE_MAGIC, u32::MAX, u32::MAX, u32::MAX] {
            images.extend_from_slice(&v.to_be_bytes());
        }
        images.extend_from_slice(&[0u8; 64]);
        let (_, labels) = idx_files(2, 2, &[1]);
        assert!(matches!(Mnist::from_idx(&images, &labels), Err(Error::Dataset(_))));
    }
}
