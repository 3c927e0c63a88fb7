#![doc = include_str!("../README.md")]

//! SMT encoding and solver integration for flow-framework reasoning.
//!
//! The [`encoding::Encoding`] type is the single entry point the engine
//! uses: it owns one solver, a scoped premise stack, and a batched check
//! queue. Flow values are modeled as uninterpreted membership functions,
//! so the layer distinguishes boolean expressions from second-order
//! function references (see [`encoding::EExpr`]).

pub mod batch;
pub mod encoding;
pub mod solver;
pub mod sorts;
pub mod terms;
