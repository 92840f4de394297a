#[cfg(test)]
#[path = "../tests/unit/parameter_store_test.rs"]
mod parameter_store_test;

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::parameter_reader::ParameterIndex;
use crate::tensor::Matrix;

/// Placeholder for the logical tensor name inside naming templates.
pub const NAME_PLACEHOLDER: &str = "{name}";
/// Placeholder for the decoder index inside naming templates.
pub const DECODER_ID_PLACEHOLDER: &str = "{decoderId}";

/// Maps logical tensor names to the ids used inside the container files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterNaming {
    model_template: String,
    decoder_template: String,
    overrides: HashMap<String, String>,
}

impl ParameterNaming {
    pub fn new(model_template: &str, decoder_template: &str, overrides: HashMap<String, String>) -> Self {
        Self { model_template: model_template.to_string(), decoder_template: decoder_template.to_string(), overrides }
    }

    /// Resolves a tensor that belongs to the model boundary (embeddings, final norm).
    pub fn model_name(&self, name: &str) -> String {
        let name = self.apply_override(name);
        self.model_template.replace(NAME_PLACEHOLDER, &name)
    }

    /// Resolves a tensor of the decoder with index `decoder_id`.
    pub fn decoder_name(&self, decoder_id: usize, name: &str) -> String {
        let decoder_id = decoder_id.to_string();
        let name = self.apply_override(name).replace(DECODER_ID_PLACEHOLDER, &decoder_id);

        let formatted =
            self.decoder_template.replace(DECODER_ID_PLACEHOLDER, &decoder_id).replace(NAME_PLACEHOLDER, &name);

        self.apply_override(&formatted)
    }

    fn apply_override(&self, name: &str) -> String {
        self.overrides.get(name).cloned().unwrap_or_else(|| name.to_string())
    }
}

/// Which part of the model a store resolves names for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Model,
    Decoder(usize),
}

#[derive(Clone, Copy)]
enum Source<'a> {
    Index(&'a ParameterIndex),
    /// Nothing is read; the optional index only tells which optional tensors exist.
    CalculationOnly(Option<&'a ParameterIndex>),
}

/// Loading facade used by model recipes: resolves names and counts parameters.
pub struct ParameterStore<'a> {
    source: Source<'a>,
    naming: &'a ParameterNaming,
    scope: Scope,
    parameter_count: usize,
}

impl<'a> ParameterStore<'a> {
    pub fn new(index: &'a ParameterIndex, naming: &'a ParameterNaming, scope: Scope) -> Self {
        Self { source: Source::Index(index), naming, scope, parameter_count: 0 }
    }

    pub fn calculation_only(index: Option<&'a ParameterIndex>, naming: &'a ParameterNaming, scope: Scope) -> Self {
        Self { source: Source::CalculationOnly(index), naming, scope, parameter_count: 0 }
    }

    /// Returns a store with the same source and naming for another scope.
    pub fn with_scope(&self, scope: Scope) -> Self {
        Self { source: self.source, naming: self.naming, scope, parameter_count: 0 }
    }

    pub fn is_calculation_only(&self) -> bool {
        matches!(self.source, Source::CalculationOnly(_))
    }

    /// Number of elements loaded (or counted) through this store so far.
    pub fn parameter_count(&self) -> usize {
        self.parameter_count
    }

    pub fn resolve(&self, name: &str) -> String {
        match self.scope {
            Scope::Model => self.naming.model_name(name),
            Scope::Decoder(decoder_id) => self.naming.decoder_name(decoder_id, name),
        }
    }

    pub fn vector(&mut self, name: &str, size: usize) -> Result<Vec<f32>> {
        let id = self.resolve(name);
        self.parameter_count += size;

        match self.source {
            Source::Index(index) => index.read_vector(&id, size).with_context(|| self.describe(&id)),
            Source::CalculationOnly(_) => Ok(Vec::new()),
        }
    }

    pub fn vector_optional(&mut self, name: &str, size: usize) -> Result<Option<Vec<f32>>> {
        let id = self.resolve(name);

        let vector = match self.source {
            Source::Index(index) => index.read_vector_optional(&id, size).with_context(|| self.describe(&id))?,
            Source::CalculationOnly(Some(index)) if index.contains(&id) => Some(Vec::new()),
            Source::CalculationOnly(_) => None,
        };

        if vector.is_some() {
            self.parameter_count += size;
        }

        Ok(vector)
    }

    pub fn matrix(&mut self, name: &str, rows: usize, cols: usize) -> Result<Matrix> {
        let id = self.resolve(name);
        self.parameter_count += rows * cols;

        match self.source {
            Source::Index(index) => index.read_matrix(&id, rows, cols).with_context(|| self.describe(&id)),
            Source::CalculationOnly(_) => Ok(Matrix::default()),
        }
    }

    pub fn matrix_optional(&mut self, name: &str, rows: usize, cols: usize) -> Result<Option<Matrix>> {
        let id = self.resolve(name);

        let matrix = match self.source {
            Source::Index(index) => index.read_matrix_optional(&id, rows, cols).with_context(|| self.describe(&id))?,
            Source::CalculationOnly(Some(index)) if index.contains(&id) => Some(Matrix::default()),
            Source::CalculationOnly(_) => None,
        };

        if matrix.is_some() {
            self.parameter_count += rows * cols;
        }

        Ok(matrix)
    }

    fn describe(&self, id: &str) -> String {
        match self.scope {
            Scope::Model => format!("Failed to load parameter {id}"),
            Scope::Decoder(decoder_id) => format!("Failed to load parameter {id} of decoder {decoder_id}"),
        }
    }
}
