//! Runtime Values
//!
//! Values flowing through the interpreter and compiled partitions at
//! execution time.
//!
//! @version 0.1.0
//! @author `AutomataNexus` Development Team

use onegraph_tensor::{Shape, Tensor};

use crate::error::{FuseError, FuseResult};
use crate::ir::{ConstValue, TensorType, ValueType};

/// A value produced or consumed while executing a graph.
#[derive(Debug, Clone)]
pub enum RtValue {
    /// A tensor; views share storage with their base.
    Tensor(Tensor),
    /// A float scalar.
    Float(f64),
    /// An integer scalar.
    Int(i64),
    /// A boolean scalar.
    Bool(bool),
    /// An integer list.
    Ints(Vec<i64>),
    /// A heterogeneous list.
    List(Vec<RtValue>),
    /// The absent value.
    None,
}

impl RtValue {
    /// Returns the tensor, or a runtime error naming `what`.
    pub fn as_tensor(&self) -> FuseResult<&Tensor> {
        match self {
            Self::Tensor(t) => Ok(t),
            other => Err(FuseError::runtime(format!(
                "expected a tensor, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns the tensor if this is one.
    #[must_use]
    pub fn tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Returns the numeric value of a scalar.
    pub fn as_scalar(&self) -> FuseResult<f64> {
        match self {
            Self::Float(v) => Ok(*v),
            Self::Int(v) => Ok(*v as f64),
            Self::Bool(v) => Ok(if *v { 1.0 } else { 0.0 }),
            other => Err(FuseError::runtime(format!(
                "expected a scalar, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns an integer list; a list of ints is accepted too.
    pub fn as_ints(&self) -> FuseResult<Vec<i64>> {
        match self {
            Self::Ints(v) => Ok(v.clone()),
            Self::List(items) => items
                .iter()
                .map(|item| match item {
                    Self::Int(v) => Ok(*v),
                    other => Err(FuseError::runtime(format!(
                        "expected an int list element, found {}",
                        other.kind_name()
                    ))),
                })
                .collect(),
            other => Err(FuseError::runtime(format!(
                "expected an int list, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Interprets the value as a branch condition.
    pub fn as_bool(&self) -> FuseResult<bool> {
        match self {
            Self::Bool(v) => Ok(*v),
            Self::Int(v) => Ok(*v != 0),
            Self::Tensor(t) => Ok(t.item()? != 0.0),
            other => Err(FuseError::runtime(format!(
                "expected a condition, found {}",
                other.kind_name()
            ))),
        }
    }

    /// Returns the inferred type of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Tensor(t) => ValueType::Tensor(TensorType {
                dtype: t.dtype(),
                shape: Some(Shape::from_slice(t.shape())),
                layout: t.layout(),
            }),
            Self::Float(_) => ValueType::Float,
            Self::Int(_) => ValueType::Int,
            Self::Bool(_) => ValueType::Bool,
            Self::Ints(_) => ValueType::IntList,
            Self::List(_) => ValueType::List,
            Self::None => ValueType::None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Float(_) => "float",
            Self::Int(_) => "int",
            Self::Bool(_) => "bool",
            Self::Ints(_) => "int list",
            Self::List(_) => "list",
            Self::None => "none",
        }
    }
}

impl From<Tensor> for RtValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<&ConstValue> for RtValue {
    fn from(c: &ConstValue) -> Self {
        match c {
            ConstValue::Tensor(t) => Self::Tensor(t.clone()),
            ConstValue::Float(v) => Self::Float(*v),
            ConstValue::Int(v) => Self::Int(*v),
            ConstValue::Bool(v) => Self::Bool(*v),
            ConstValue::Ints(v) => Self::Ints(v.clone()),
            ConstValue::None => Self::None,
        }
    }
}
