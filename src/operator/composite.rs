use crate::error::ensure_config;
use crate::operator::Operator;
use crate::vector::Vector;
use crate::{Backend, Result};

/// Sum of operators sharing their active input and output.
#[derive(Debug)]
pub struct CompositeOperator<'a> {
    backend: Backend,
    subs: Vec<&'a Operator<'a>>,
}

impl<'a> CompositeOperator<'a> {
    pub(crate) fn new(backend: Backend) -> Self {
        Self {
            backend,
            subs: Vec::new(),
        }
    }

    /// Adds a sub-operator. Its active sizes must agree with those of the operators added
    /// before it.
    pub fn add_sub(mut self, op: &'a Operator<'a>) -> Result<Self> {
        ensure_config!(
            op.backend().same_as(&self.backend),
            "sub-operator was created by a different backend"
        );
        if let (Some(size), Some(other)) = (op.input_size(), self.input_size()) {
            ensure_config!(
                size == other,
                "sub-operator has active input size {}, but the composite has {}",
                size,
                other
            );
        }
        if let (Some(size), Some(other)) = (op.output_size(), self.output_size()) {
            ensure_config!(
                size == other,
                "sub-operator has active output size {}, but the composite has {}",
                size,
                other
            );
        }
        self.subs.push(op);
        Ok(self)
    }

    pub fn sub_operators(&self) -> &[&'a Operator<'a>] {
        &self.subs
    }

    pub fn input_size(&self) -> Option<usize> {
        self.subs.iter().find_map(|op| op.input_size())
    }

    pub fn output_size(&self) -> Option<usize> {
        self.subs.iter().find_map(|op| op.output_size())
    }

    /// Computes `output = sum_i A_i(input)`.
    pub fn apply(&self, input: &Vector, output: &Vector) -> Result<()> {
        for op in &self.subs {
            op.zero_outputs(output)?;
        }
        self.apply_add(input, output)
    }

    /// Computes `output += sum_i A_i(input)`.
    pub fn apply_add(&self, input: &Vector, output: &Vector) -> Result<()> {
        for op in &self.subs {
            op.apply_add(input, output)?;
        }
        Ok(())
    }

    pub fn linear_assemble_diagonal(&self, diag: &Vector) -> Result<()> {
        diag.set_value(0.0)?;
        self.linear_assemble_add_diagonal(diag)
    }

    pub fn linear_assemble_add_diagonal(&self, diag: &Vector) -> Result<()> {
        for op in &self.subs {
            op.linear_assemble_add_diagonal(diag)?;
        }
        Ok(())
    }
}
