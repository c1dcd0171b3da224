//! Disk and RAM series of I/O capable sequences.
//!
//! Files use the layout of the generated units: one record of
//! `length` native-endian `f64` values per simulation step, record `idx`
//! starting at byte `idx * length * 8`.

use super::instance::ModelInstance;
use crate::errors::{ModelgenError, ModelgenResult};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

const VALUE_SIZE: u64 = std::mem::size_of::<f64>() as u64;

/// Where one sequence's series is read from and written to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceIo {
    pub reading: bool,
    pub writing: bool,
    pub path: Option<PathBuf>,
    pub ram: bool,
}

impl SequenceIo {
    pub fn read_from(path: impl Into<PathBuf>) -> Self {
        Self {
            reading: true,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn write_to(path: impl Into<PathBuf>) -> Self {
        Self {
            writing: true,
            path: Some(path.into()),
            ..Default::default()
        }
    }

    pub fn ram() -> Self {
        Self {
            ram: true,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
struct Channel {
    key: String,
    io: SequenceIo,
    file: Option<File>,
    array: Vec<f64>,
}

/// Open files and RAM arrays of the sequences of one model instance.
///
/// Files are closed by [`SequenceFiles::close`] and whenever the value is dropped.
#[derive(Debug, Default)]
pub struct SequenceFiles {
    channels: Vec<Channel>,
}

impl SequenceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace the settings of the sequence stored under `key`.
    pub fn configure(&mut self, key: impl Into<String>, io: SequenceIo) {
        let key = key.into();
        self.channels.retain(|c| c.key != key);
        self.channels.push(Channel {
            key,
            io,
            file: None,
            array: Vec::new(),
        });
    }

    /// Open every configured file. Already opened files are closed again when
    /// one of them fails.
    pub fn open(&mut self) -> ModelgenResult<()> {
        for idx in 0..self.channels.len() {
            let channel = &mut self.channels[idx];
            if !(channel.io.reading || channel.io.writing) {
                continue;
            }
            let path = match &channel.io.path {
                Some(path) => path.clone(),
                None => {
                    let key = channel.key.clone();
                    self.close();
                    return Err(ModelgenError::Error(format!(
                        "sequence `{key}` is flagged for disk I/O but has no path"
                    )));
                }
            };
            let mut options = OpenOptions::new();
            match (channel.io.reading, channel.io.writing) {
                (true, true) => options.read(true).write(true),
                (true, false) => options.read(true),
                _ => options.write(true).create(true).truncate(true),
            };
            match options.open(&path) {
                Ok(file) => channel.file = Some(file),
                Err(e) => {
                    self.close();
                    return Err(ModelgenError::io(path, e));
                }
            }
        }
        debug!(sequences = self.channels.len(), "Opened sequence files");
        Ok(())
    }

    /// Close every open file; closing twice is harmless.
    pub fn close(&mut self) {
        for channel in &mut self.channels {
            if channel.file.take().is_some() {
                debug!(sequence = %channel.key, "Closed sequence file");
            }
        }
    }

    /// The RAM series of a sequence, one record per step.
    pub fn series(&self, key: &str) -> Option<&[f64]> {
        self.channels
            .iter()
            .find(|c| c.key == key)
            .map(|c| c.array.as_slice())
    }

    pub fn set_series(&mut self, key: &str, values: Vec<f64>) -> ModelgenResult<()> {
        let channel = self
            .channels
            .iter_mut()
            .find(|c| c.key == key)
            .ok_or_else(|| ModelgenError::UnknownVariable(key.to_string()))?;
        channel.array = values;
        Ok(())
    }

    /// Load step `idx` of every reading sequence into `instance`.
    pub fn load(&mut self, instance: &mut ModelInstance, idx: usize) -> ModelgenResult<()> {
        for channel in &mut self.channels {
            let length = instance.get(&channel.key)?.len();
            let values = if channel.io.reading {
                let file = open_file(channel, "load_data")?;
                let mut bytes = vec![0u8; length * VALUE_SIZE as usize];
                seek(file, idx, length)
                    .and_then(|_| file.read_exact(&mut bytes))
                    .map_err(|e| channel_error(channel, e))?;
                bytes
                    .chunks_exact(VALUE_SIZE as usize)
                    .map(|chunk| {
                        let mut raw = [0u8; VALUE_SIZE as usize];
                        raw.copy_from_slice(chunk);
                        f64::from_ne_bytes(raw)
                    })
                    .collect()
            } else if channel.io.ram {
                let start = idx * length;
                channel
                    .array
                    .get(start..start + length)
                    .map(<[f64]>::to_vec)
                    .ok_or_else(|| ModelgenError::Runtime {
                        method: "load_data".to_string(),
                        message: format!(
                            "RAM series of `{}` holds no step {idx}",
                            channel.key
                        ),
                    })?
            } else {
                continue;
            };
            instance.set_flat(&channel.key, &values)?;
        }
        Ok(())
    }

    /// Save the values of step `idx` of every writing or RAM sequence.
    pub fn save(&mut self, instance: &ModelInstance, idx: usize) -> ModelgenResult<()> {
        for channel in &mut self.channels {
            let values = instance.flat(&channel.key)?;
            let length = values.len();
            if channel.io.writing {
                let file = open_file(channel, "save_data")?;
                let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();
                seek(file, idx, length)
                    .and_then(|_| file.write_all(&bytes))
                    .map_err(|e| channel_error(channel, e))?;
            }
            if channel.io.ram {
                let end = (idx + 1) * length;
                if channel.array.len() < end {
                    channel.array.resize(end, 0.0);
                }
                channel.array[idx * length..end].copy_from_slice(&values);
            }
        }
        Ok(())
    }
}

impl Drop for SequenceFiles {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_file<'c>(channel: &'c mut Channel, routine: &str) -> ModelgenResult<&'c mut File> {
    let key = channel.key.clone();
    channel.file.as_mut().ok_or_else(|| ModelgenError::Runtime {
        method: routine.to_string(),
        message: format!("file of sequence `{key}` is not open"),
    })
}

fn seek(file: &mut File, idx: usize, length: usize) -> std::io::Result<u64> {
    file.seek(SeekFrom::Start(idx as u64 * length as u64 * VALUE_SIZE))
}

fn channel_error(channel: &Channel, source: std::io::Error) -> ModelgenError {
    ModelgenError::io(
        channel
            .io
            .path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&channel.key)),
        source,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ModelDefinition;
    use crate::schema::{GroupKind, Variable, VariableGroup};
    use ndarray::array;

    fn instance() -> ModelInstance {
        let definition = ModelDefinition::builder("m")
            .group(VariableGroup::new(GroupKind::Inputs).variable(Variable::float("p").with_ndim(1)))
            .group(VariableGroup::new(GroupKind::Fluxes).variable(Variable::int("n")))
            .build()
            .unwrap();
        let mut instance = ModelInstance::new(&definition);
        instance.set_shape("inputs.p", &[2]).unwrap();
        instance
    }

    #[test]
    fn disk_series_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.bin");
        let mut instance = instance();

        let mut files = SequenceFiles::new();
        files.configure("inputs.p", SequenceIo::write_to(&path));
        files.open().unwrap();
        for idx in 0..3 {
            let v = idx as f64;
            instance
                .set_array("inputs.p", array![v, 10.0 * v].into_dyn())
                .unwrap();
            files.save(&instance, idx).unwrap();
        }
        files.close();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 3 * 2 * 8);

        files.configure("inputs.p", SequenceIo::read_from(&path));
        files.open().unwrap();
        files.load(&mut instance, 1).unwrap();
        assert_eq!(instance.flat("inputs.p").unwrap(), vec![1.0, 10.0]);
        assert!(files.load(&mut instance, 3).is_err());
    }

    #[test]
    fn ram_series_are_cast_on_load() {
        let mut instance = instance();
        let mut files = SequenceFiles::new();
        files.configure("fluxes.n", SequenceIo::ram());
        files.set_series("fluxes.n", vec![1.5, 2.5]).unwrap();
        files.load(&mut instance, 1).unwrap();
        assert_eq!(instance.scalar("fluxes.n").unwrap(), 2.0);
        instance.set_scalar("fluxes.n", 7.0).unwrap();
        files.save(&instance, 3).unwrap();
        assert_eq!(files.series("fluxes.n").unwrap(), &[1.5, 2.5, 0.0, 7.0]);
        assert!(files.load(&mut instance, 4).is_err());
    }

    #[test]
    fn failed_open_closes_earlier_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = SequenceFiles::new();
        files.configure("inputs.p", SequenceIo::write_to(dir.path().join("p.bin")));
        files.configure("fluxes.n", SequenceIo::read_from(dir.path().join("missing.bin")));
        assert!(matches!(files.open(), Err(ModelgenError::Io { .. })));
        assert!(files.channels.iter().all(|c| c.file.is_none()));
    }
}
