//! Front-end compiler for the Silt programming language.
//!
//! Silt is a dynamic, Python-like scripting language; this crate turns a
//! parsed syntax tree into positionally-addressed bytecode for the separate
//! stack-based Silt VM. Three pieces carry the weight:
//!
//! * scope resolution ([`compiler::scope`]) classifies every variable
//!   reference per lexical scope, LEGB style,
//! * code emission ([`compiler::emitter`]) walks the tree and emits
//!   instructions with deferred jump patching, and
//! * call binding ([`vm::binder`]) maps call-site arguments onto a compiled
//!   signature's parameter slots at call time.
//!
//! Parsing, bytecode execution, and the cooperative scheduler live elsewhere;
//! the scheduler is consumed here only to pre-evaluate default-argument
//! values at definition time.

pub mod ast;
pub mod binary;
pub mod compiler;
pub mod error;
pub mod vm;

pub use compiler::{CodeObject, Compiler, GlobalEnv};
pub use error::{ErrorKind, SiltError, SiltResult, Span};
pub use vm::{bind, Scheduler, Value};
