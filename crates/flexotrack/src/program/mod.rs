//! Machine program lifecycle: status model, domain types and the engine.

pub mod engine;
pub mod error;
pub mod model;
pub mod status;

pub use engine::ProgramEngine;
pub use error::ProgramError;
pub use model::{
    ActorId, InitialStatus, MachineProgram, NewProgram, ProgramId, ProgramPatch, ProgramStats,
    StatusChange,
};
pub use status::{EntryEffect, ProgramStatus, UnknownStatus, RUNNING_PROGRESS_FLOOR};
