// Front-end compiler: scope classification, bytecode emission, and the
// deferred-patch machinery both lean on.

pub mod code;
pub mod emitter;
pub mod jump;
pub mod opcode;
pub mod scope;

pub use code::{CodeBuilder, CodeObject};
pub use emitter::Compiler;
pub use jump::JumpFixup;
pub use opcode::{CompareOp, OpCode};
pub use scope::{GlobalEnv, NameScope, ScopeScanner, ScopeTree, ScopeType};
