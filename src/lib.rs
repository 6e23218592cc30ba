//! Translation of Boolean constraint circuits into CNF formulas in the
//! DIMACS format.
//!
//! A constraint circuit is a DAG of Boolean gates (constants, inputs,
//! NOT/OR/AND, if-then-else, n-ary equivalence and parity, and cardinality
//! gates) where any gate may be constrained to a truth value. The pipeline
//! rewrites the circuit to a smaller equisatisfiable form, normalizes it to a
//! shape where every gate has a constant-size clause template, and emits a
//! Tseitin-style CNF restricted to the cone of influence of the constraints.

pub mod circuit;
pub mod cnf;
pub mod normalize;
pub mod parse;
pub mod share;
pub mod simplify;
pub mod solve;

/// Two contradictory truth constraints met on the same gate: the circuit is
/// unsatisfiable. This is a regular translation outcome, not a process
/// error; the pipeline short-circuits to the canned UNSAT formula.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Conflict;
