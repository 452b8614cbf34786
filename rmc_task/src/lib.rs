//! The task domain: the command/status state machine that sequences
//! operator and interpreter commands against motion and I/O state.
//!
//! [`fsm::TaskFsm`] is the gate: every operator command is accepted,
//! queued, or rejected according to the machine state, mode, and
//! interpreter state. [`interp::CanonAdapter`] translates canonical
//! machining calls into channel commands tagged with source line ids,
//! and [`interp_list::InterpList`] is the bounded queue between the
//! two.

pub mod fsm;
pub mod interp;
pub mod interp_list;

pub use fsm::{Disposition, OperatorCmd, TaskFsm};
pub use interp::{CanonAdapter, Interpreter, PlanReadResult};
pub use interp_list::{InterpList, TaskItem, TaskOp};
