//! Weighting: the formula interpreter and the weighting function registry

mod formula;
mod functions;

pub use formula::{
    BinaryFunction, FormulaContext, FormulaInterpreter, FunctionMap, IteratorSpec, UnaryFunction,
    VariableFn,
};
pub use functions::{
    PostingSource, WeightingContext, WeightingFactory, WeightingInit, WeightingParams,
    WeightingRegistry, MAX_NOF_WEIGHTING_ELEMENTS,
};
