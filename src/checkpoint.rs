use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::Path,
};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::autograd::Param;

pub const WEIGHTS_MAGIC: &[u8; 4] = b"SNTW";
pub const OPTIMIZER_MAGIC: &[u8; 4] = b"SNTO";
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid checkpoint format: {0}")]
    InvalidFormat(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Header plus the raw tensors that followed it on disk.
#[derive(Debug)]
pub struct LoadedTensors<H> {
    pub version: u32,
    pub header: H,
    pub tensors: Vec<Vec<f64>>,
}

/// Writes `magic`, version, a JSON header and length-prefixed little-endian
/// `f64` tensors.
pub fn save<H: Serialize>(
    path: &Path,
    magic: &[u8; 4],
    header: &H,
    tensors: &[&[f64]],
) -> Result<(), CheckpointError> {
    let mut file = BufWriter::new(File::create(path)?);
    let header_json = serde_json::to_vec(header)?;

    file.write_all(magic)?;
    file.write_all(&VERSION.to_le_bytes())?;
    file.write_all(&(header_json.len() as u32).to_le_bytes())?;
    file.write_all(&header_json)?;

    file.write_all(&(tensors.len() as u32).to_le_bytes())?;
    for tensor in tensors {
        file.write_all(&(tensor.len() as u32).to_le_bytes())?;
        for value in *tensor {
            file.write_all(&value.to_le_bytes())?;
        }
    }

    let file = file.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    Ok(())
}

pub fn load<H: DeserializeOwned>(
    path: &Path,
    magic: &[u8; 4],
) -> Result<LoadedTensors<H>, CheckpointError> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut file = BufReader::new(file);
    let mut found = [0_u8; 4];
    file.read_exact(&mut found)?;
    if &found != magic {
        return Err(CheckpointError::InvalidFormat(format!(
            "bad magic in {}",
            path.display()
        )));
    }

    let version = read_u32(&mut file)?;
    if version != VERSION {
        return Err(CheckpointError::InvalidFormat(format!(
            "unsupported version {version}"
        )));
    }
    // Lengths come from the file itself; bound them by what is left before
    // allocating.
    let mut remaining = file_len.saturating_sub(12);
    let header_len = read_u32(&mut file)? as usize;
    claim(&mut remaining, header_len as u64, "header")?;
    let mut header_bytes = vec![0_u8; header_len];
    file.read_exact(&mut header_bytes)?;
    let header: H = serde_json::from_slice(&header_bytes)?;

    claim(&mut remaining, 4, "tensor count")?;
    let tensor_count = read_u32(&mut file)? as usize;
    claim(&mut remaining, tensor_count as u64 * 4, "tensor table")?;
    let mut tensors = Vec::with_capacity(tensor_count);
    for _ in 0..tensor_count {
        let len = read_u32(&mut file)? as usize;
        claim(&mut remaining, len as u64 * 8, "tensor")?;
        let mut values = Vec::with_capacity(len);
        for _ in 0..len {
            values.push(read_f64(&mut file)?);
        }
        tensors.push(values);
    }

    let mut trailing = [0_u8; 1];
    if file.read(&mut trailing)? != 0 {
        return Err(CheckpointError::InvalidFormat(
            "trailing bytes after last tensor".to_string(),
        ));
    }

    Ok(LoadedTensors {
        version,
        header,
        tensors,
    })
}

/// Copies loaded tensors into `params`, slot by slot.
pub fn apply(tensors: &[Vec<f64>], params: &mut [Param]) -> Result<(), CheckpointError> {
    if tensors.len() != params.len() {
        return Err(CheckpointError::InvalidFormat(format!(
            "parameter count mismatch: {} != {}",
            params.len(),
            tensors.len()
        )));
    }

    for (slot, (target, values)) in params.iter_mut().zip(tensors).enumerate() {
        if target.data.len() != values.len() {
            return Err(CheckpointError::InvalidFormat(format!(
                "parameter {} size mismatch: {} != {}",
                slot,
                target.data.len(),
                values.len()
            )));
        }
        target.data.copy_from_slice(values);
    }

    Ok(())
}

/// Reserves `bytes` of the unread file, failing if the file is shorter.
fn claim(remaining: &mut u64, bytes: u64, what: &str) -> Result<(), CheckpointError> {
    if bytes > *remaining {
        return Err(CheckpointError::InvalidFormat(format!(
            "{what} needs {bytes} bytes but only {remaining} remain"
        )));
    }
    *remaining -= bytes;
    Ok(())
}

fn read_u32(reader: &mut dyn Read) -> Result<u32, CheckpointError> {
    let mut bytes = [0_u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_f64(reader: &mut dyn Read) -> Result<f64, CheckpointError> {
    let mut bytes = [0_u8; 8];
    reader.read_exact(&mut bytes)?;
    Ok(f64::from_le_bytes(bytes))
}
