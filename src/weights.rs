//! Weight files: the parameter tensors of every parametric layer, in stack
//! order, weight before bias, as raw little-endian `f32`. There is no header;
//! the loading network must be built exactly like the saving one.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::network::Network;

const F32_BYTES: usize = std::mem::size_of::<f32>();

fn write_f32s(w: &mut impl Write, data: &[f32]) -> std::io::Result<()> {
    for v in data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

fn read_f32s(r: &mut impl Read, dst: &mut [f32]) -> std::io::Result<()> {
    let mut bytes = vec![0u8; dst.len() * F32_BYTES];
    r.read_exact(&mut bytes)?;
    for (v, chunk) in dst.iter_mut().zip(bytes.chunks_exact(F32_BYTES)) {
        *v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

/// Writes the device copies of `network`'s parameters to `path`.
pub fn save(network: &Network, path: impl AsRef<Path>) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for param in network.params() {
        write_f32s(&mut writer, &param.to_vec()?)?;
    }
    writer.flush()?;
    Ok(())
}

/// Reads parameters saved by [`save`] into `network` and pushes them to the
/// device. Nothing is modified unless the file size matches the network's
/// parameter count exactly.
pub fn load(network: &mut Network, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let expected = (network.parameter_count() * F32_BYTES) as u64;
    if file_len != expected {
        return Err(Error::WeightFile(format!(
            "{} holds {file_len} bytes, the network's {} parameters need {expected}",
            path.display(),
            network.parameter_count()
        )));
    }

    let mut reader = BufReader::new(file);
    for param in network.params_mut() {
        read_f32s(&mut reader, param.host_mut())?;
        param.push()?;
    }
    Ok(())
}
