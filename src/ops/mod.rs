//! Operator definitions
//!
//! What an operator computes is opaque to the dispatch core. The core only
//! needs its name, how many inputs it accepts, how many outputs it declares,
//! and enough shape inference for a backend to size the results.

use std::fmt::{self, Debug, Display};
use std::sync::Arc;

use crate::{
    error::{IngotError, IngotResult},
    tensor::TensorLayout,
};

/// Number of inputs an operator accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, nargs: usize) -> bool {
        match *self {
            Arity::Exact(n) => nargs == n,
            Arity::AtLeast(n) => nargs >= n,
        }
    }

    pub fn is_nullary(&self) -> bool {
        matches!(self, Arity::Exact(0) | Arity::AtLeast(0))
    }
}

impl Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{}", n),
            Arity::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

/// Operator definition trait implemented by whatever produces operators
pub trait OpDef: Send + Sync + Debug {
    fn name(&self) -> &str;

    fn input_arity(&self) -> Arity;

    /// Declared number of results for `nargs` inputs
    fn num_outputs(&self, nargs: usize) -> usize;

    /// Result layouts for the given input layouts, in declared output order
    fn infer_output_layouts(&self, inputs: &[TensorLayout]) -> IngotResult<Vec<TensorLayout>>;

    /// Operators that only re-share their inputs and never reach a backend
    fn is_fastpath_copy(&self) -> bool {
        false
    }
}

/// Reject argument lists the operator does not declare
pub fn check_inputs(op: &dyn OpDef, nargs: usize) -> IngotResult<()> {
    let arity = op.input_arity();
    if arity.accepts(nargs) {
        Ok(())
    } else {
        Err(IngotError::arity(op.name(), arity.to_string(), nargs))
    }
}

/// How a [`GenericOp`] derives result layouts
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutRule {
    /// Broadcast all inputs; every output takes the broadcast shape and the
    /// dtype/device of the first input
    Elementwise { outputs: usize },
    /// One output per input with the input's layout
    SameAsInputs,
    /// Results are fixed regardless of inputs (creation ops)
    Fixed(Vec<TensorLayout>),
}

/// Table-driven operator definition usable by every bundled backend
#[derive(Debug, Clone, PartialEq)]
pub struct GenericOp {
    name: String,
    inputs: Arity,
    rule: LayoutRule,
    fastpath_copy: bool,
}

impl GenericOp {
    pub fn new(name: &str, inputs: Arity, rule: LayoutRule) -> Self {
        Self {
            name: name.to_string(),
            inputs,
            rule,
            fastpath_copy: false,
        }
    }

    /// Single-output elementwise operator over `nargs` inputs
    pub fn elemwise(name: &str, nargs: usize) -> Arc<dyn OpDef> {
        Arc::new(Self::new(name, Arity::Exact(nargs), LayoutRule::Elementwise { outputs: 1 }))
    }

    /// Nullary operator producing the given layouts
    pub fn creation(name: &str, outputs: Vec<TensorLayout>) -> Arc<dyn OpDef> {
        Arc::new(Self::new(name, Arity::Exact(0), LayoutRule::Fixed(outputs)))
    }

    /// Shares the single input's handle without a backend round-trip
    pub fn fastpath_copy() -> Arc<dyn OpDef> {
        Arc::new(Self {
            name: "FastpathCopy".to_string(),
            inputs: Arity::Exact(1),
            rule: LayoutRule::SameAsInputs,
            fastpath_copy: true,
        })
    }

    pub fn rule(&self) -> &LayoutRule {
        &self.rule
    }
}

impl OpDef for GenericOp {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_arity(&self) -> Arity {
        self.inputs
    }

    fn num_outputs(&self, nargs: usize) -> usize {
        match &self.rule {
            LayoutRule::Elementwise { outputs } => *outputs,
            LayoutRule::SameAsInputs => nargs,
            LayoutRule::Fixed(layouts) => layouts.len(),
        }
    }

    fn infer_output_layouts(&self, inputs: &[TensorLayout]) -> IngotResult<Vec<TensorLayout>> {
        check_inputs(self, inputs.len())?;

        match &self.rule {
            LayoutRule::Elementwise { outputs } => {
                let first = inputs.first().ok_or_else(|| {
                    IngotError::InvalidInput(format!("{} needs at least one input", self.name))
                })?;

                let mut shape = first.shape.clone();
                for input in &inputs[1..] {
                    if input.device != first.device {
                        return Err(IngotError::InvalidInput(format!(
                            "{}: inputs on {} and {}",
                            self.name, first.device, input.device
                        )));
                    }
                    shape = shape.broadcast(&input.shape)?;
                }

                let layout = TensorLayout::new(shape, first.dtype, first.device);
                Ok(vec![layout; *outputs])
            }
            LayoutRule::SameAsInputs => Ok(inputs.to_vec()),
            LayoutRule::Fixed(layouts) => Ok(layouts.clone()),
        }
    }

    fn is_fastpath_copy(&self) -> bool {
        self.fastpath_copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{DType, Device};

    #[test]
    fn test_arity() {
        assert!(Arity::Exact(2).accepts(2));
        assert!(!Arity::Exact(2).accepts(1));
        assert!(Arity::AtLeast(1).accepts(5));
        assert!(Arity::Exact(0).is_nullary());
        assert!(!Arity::AtLeast(1).is_nullary());
    }

    #[test]
    fn test_elemwise_inference() {
        let add = GenericOp::elemwise("add", 2);
        let a = TensorLayout::new([4, 1], DType::F32, Device::Cpu);
        let b = TensorLayout::new([3], DType::F32, Device::Cpu);

        let out = add.infer_output_layouts(&[a, b]).unwrap();
        assert_eq!(out.len(), add.num_outputs(2));
        assert_eq!(out[0].shape.dims, vec![4, 3]);
    }

    #[test]
    fn test_elemwise_rejects_cross_device_and_bad_arity() {
        let add = GenericOp::elemwise("add", 2);
        let a = TensorLayout::new([2], DType::F32, Device::Cpu);
        let b = TensorLayout::new([2], DType::F32, Device::Cuda(0));

        assert!(matches!(
            add.infer_output_layouts(&[a.clone(), b]),
            Err(IngotError::InvalidInput(_))
        ));
        assert!(matches!(
            add.infer_output_layouts(&[a]),
            Err(IngotError::ArityMismatch { got: 1, .. })
        ));
    }

    #[test]
    fn test_creation_and_copy() {
        let layout = TensorLayout::new([8], DType::I32, Device::Cpu);
        let zeros = GenericOp::creation("zeros", vec![layout.clone()]);
        assert!(zeros.input_arity().is_nullary());
        assert_eq!(zeros.infer_output_layouts(&[]).unwrap(), vec![layout.clone()]);

        let copy = GenericOp::fastpath_copy();
        assert!(copy.is_fastpath_copy());
        assert_eq!(copy.num_outputs(1), 1);
        assert!(check_inputs(copy.as_ref(), 0).is_err());
    }
}
