#![doc = include_str!("../README.md")]

//! Shared data model for the remora prover.
//!
//! The types here follow a few conventions that the algorithm crates rely
//! on:
//!
//! - Symbolic values are plain copyable indices ([`symbols::SymbolId`]);
//!   structural sharing is by value, never by reference.
//! - AST categories are closed enums; consumers dispatch by exhaustive
//!   pattern matching.
//! - Field maps preserve insertion order so encodings and diagnostics are
//!   deterministic.

pub mod config;
pub mod flowgraph;
pub mod logic;
pub mod program;
pub mod symbols;
