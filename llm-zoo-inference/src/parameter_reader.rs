#[cfg(test)]
#[path = "../tests/unit/parameter_reader_test.rs"]
mod parameter_reader_test;

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use crate::data_type::DataType;
use crate::error::ParameterFileError;
use crate::tensor::Matrix;
use crate::utils::MemoryMapper;

/// File extension of tensor container files.
const PARAMETER_FILE_EXTENSION: &str = "safetensors";
/// Reserved header key holding free-form string metadata.
const METADATA_KEY: &str = "__metadata__";

/// Location and layout of a single tensor inside a container file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorDescriptor {
    pub file: PathBuf,
    /// Absolute byte offset of the file's data region (`8 + header length`).
    pub data_offset: usize,
    pub data_type: DataType,
    pub shape: Vec<usize>,
    /// Byte range relative to the data region.
    pub start: usize,
    pub end: usize,
}

impl TensorDescriptor {
    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.end - self.start
    }
}

struct ParameterFile {
    path: PathBuf,
    mapper: MemoryMapper,
    metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawTensorEntry {
    dtype: String,
    shape: Vec<usize>,
    #[serde(default)]
    data_offsets: Option<Value>,
}

/// Immutable index over every tensor stored in a model directory.
pub struct ParameterIndex {
    directory: PathBuf,
    files: Vec<ParameterFile>,
    tensors: HashMap<String, (usize, TensorDescriptor)>,
}

impl ParameterIndex {
    /// Scans `directory` for container files and indexes their headers.
    pub fn load(directory: &Path) -> Result<Self> {
        if !directory.is_dir() {
            return Err(ParameterFileError::MissingDirectory(directory.to_path_buf()).into());
        }

        let mut paths = std::fs::read_dir(directory)
            .with_context(|| format!("Failed to read directory: {}", directory.display()))?
            .filter_map(|entry| {
                let path = entry.ok()?.path();
                matches!(path.extension(), Some(ext) if ext == PARAMETER_FILE_EXTENSION).then_some(path)
            })
            .collect::<Vec<_>>();
        paths.sort();

        if paths.is_empty() {
            return Err(ParameterFileError::NoParameterFiles(directory.to_path_buf()).into());
        }

        let mut index = Self { directory: directory.to_path_buf(), files: Vec::new(), tensors: HashMap::new() };

        for path in paths {
            index.add_file(path)?;
        }

        info!("Indexed {} tensors from {} safetensors file(s)", index.tensors.len(), index.files.len());

        Ok(index)
    }

    fn add_file(&mut self, path: PathBuf) -> Result<()> {
        let file = File::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
        let mut mapper = MemoryMapper::new(file).with_context(|| format!("Failed to map {}", path.display()))?;

        let malformed = |message: String| ParameterFileError::MalformedHeader { file: path.clone(), message };

        let header_length = mapper.get_u64().map_err(|err| malformed(err.to_string()))?;
        let header_length = usize::try_from(header_length)
            .map_err(|_| malformed(format!("header length {header_length} does not fit in memory")))?;
        let header = mapper.get_bytes(header_length).map_err(|err| malformed(err.to_string()))?;

        let entries: HashMap<String, Value> =
            serde_json::from_slice(header).map_err(|err| malformed(format!("invalid JSON: {err}")))?;

        let data_offset = mapper.position();
        let data_length = mapper.len() - data_offset;
        let file_idx = self.files.len();
        let mut metadata: HashMap<String, String> = HashMap::new();

        for (id, entry) in entries {
            if id == METADATA_KEY {
                metadata = serde_json::from_value(entry)
                    .map_err(|err| malformed(format!("invalid {METADATA_KEY}: {err}")))?;
                continue;
            }

            let entry: RawTensorEntry =
                serde_json::from_value(entry).map_err(|err| malformed(format!("invalid entry for {id}: {err}")))?;
            let descriptor = parse_descriptor(&path, &id, entry, data_offset, data_length)?;

            if let Some((other_idx, _)) = self.tensors.get(&id) {
                return Err(ParameterFileError::DuplicateTensor {
                    id,
                    first: self.files[*other_idx].path.clone(),
                    second: path,
                }
                .into());
            }

            self.tensors.insert(id, (file_idx, descriptor));
        }

        debug!("Indexed {} with metadata {:?}", path.display(), metadata);
        self.files.push(ParameterFile { path, mapper, metadata });

        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tensors.contains_key(id)
    }

    pub fn descriptor(&self, id: &str) -> Option<&TensorDescriptor> {
        self.tensors.get(id).map(|(_, descriptor)| descriptor)
    }

    /// Returns the `__metadata__` table of the given container file.
    pub fn metadata(&self, file: &Path) -> Option<&HashMap<String, String>> {
        self.files.iter().find(|candidate| candidate.path == file).map(|candidate| &candidate.metadata)
    }

    /// Reads a tensor holding exactly `expected_size` elements.
    pub fn read_vector(&self, id: &str, expected_size: usize) -> Result<Vec<f32>> {
        let (file_idx, descriptor) =
            self.tensors.get(id).ok_or_else(|| ParameterFileError::NotFound(id.to_string()))?;

        self.decode(id, *file_idx, descriptor, expected_size)
    }

    /// Like [`Self::read_vector`], but an absent tensor is not an error.
    pub fn read_vector_optional(&self, id: &str, expected_size: usize) -> Result<Option<Vec<f32>>> {
        match self.tensors.get(id) {
            Some((file_idx, descriptor)) => self.decode(id, *file_idx, descriptor, expected_size).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_matrix(&self, id: &str, rows: usize, cols: usize) -> Result<Matrix> {
        Ok(Matrix::new(rows, cols, self.read_vector(id, rows * cols)?))
    }

    pub fn read_matrix_optional(&self, id: &str, rows: usize, cols: usize) -> Result<Option<Matrix>> {
        Ok(self.read_vector_optional(id, rows * cols)?.map(|data| Matrix::new(rows, cols, data)))
    }

    fn decode(&self, id: &str, file_idx: usize, descriptor: &TensorDescriptor, expected: usize) -> Result<Vec<f32>> {
        let actual = descriptor.element_count();
        if actual != expected {
            return Err(ParameterFileError::SizeMismatch { id: id.to_string(), expected, actual }.into());
        }

        if !descriptor.data_type.is_float() {
            return Err(ParameterFileError::UnsupportedDataType {
                id: id.to_string(),
                dtype: descriptor.data_type.to_string(),
            }
            .into());
        }

        let bytes = self.files[file_idx]
            .mapper
            .get_bytes_at(descriptor.data_offset + descriptor.start, descriptor.size_in_bytes())
            .with_context(|| format!("Failed to read tensor {id}"))?;

        descriptor.data_type.decode(bytes).ok_or_else(|| {
            ParameterFileError::UnsupportedDataType { id: id.to_string(), dtype: descriptor.data_type.to_string() }
                .into()
        })
    }
}

impl std::fmt::Debug for ParameterIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterIndex")
            .field("directory", &self.directory)
            .field("files", &self.files.len())
            .field("tensors", &self.tensors.len())
            .finish()
    }
}

fn parse_descriptor(
    file: &Path,
    id: &str,
    entry: RawTensorEntry,
    data_offset: usize,
    data_length: usize,
) -> Result<TensorDescriptor, ParameterFileError> {
    let malformed_offsets = |message: &str| ParameterFileError::MalformedOffsets {
        file: file.to_path_buf(),
        id: id.to_string(),
        message: message.to_string(),
    };

    let offsets = match entry.data_offsets {
        Some(Value::Array(values)) if values.len() == 2 => values
            .iter()
            .map(|value| value.as_u64().and_then(|offset| usize::try_from(offset).ok()))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| malformed_offsets("offsets must be non-negative integers"))?,
        Some(_) => return Err(malformed_offsets("expected exactly two offsets")),
        None => return Err(malformed_offsets("missing data_offsets")),
    };

    let (start, end) = (offsets[0], offsets[1]);
    if start > end {
        return Err(malformed_offsets(&format!("start {start} is after end {end}")));
    }
    if end > data_length {
        return Err(malformed_offsets(&format!("end {end} exceeds data region of {data_length} bytes")));
    }

    let data_type = entry
        .dtype
        .parse::<DataType>()
        .map_err(|dtype| ParameterFileError::UnknownDataType { id: id.to_string(), dtype })?;

    let expected = entry.shape.iter().try_fold(1usize, |count, &dim| count.checked_mul(dim)).ok_or_else(|| {
        ParameterFileError::MalformedHeader {
            file: file.to_path_buf(),
            message: format!("tensor {id} declares shape {:?} whose element count overflows", entry.shape),
        }
    })?;
    match data_type.element_count(end - start) {
        Some(actual) if actual == expected => {}
        actual => {
            return Err(ParameterFileError::ShapeMismatch {
                id: id.to_string(),
                shape: entry.shape,
                expected,
                actual: actual.unwrap_or((end - start) / (data_type.bits() / 8)),
            });
        }
    }

    Ok(TensorDescriptor { file: file.to_path_buf(), data_offset, data_type, shape: entry.shape, start, end })
}
