//! Pure pipeline logic: the step model, the signal grammar, feedback
//! formatting, and sandbox path checks. Nothing here touches the filesystem
//! or spawns processes.

pub mod feedback;
pub mod runtime;
pub mod sandbox;
pub mod signals;
pub mod types;
