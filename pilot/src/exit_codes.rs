//! Stable exit codes for `pilot` commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Invalid config, failed step, aborted gate, or any other fatal error.
pub const FAILED: i32 = 1;
/// An agent tried to write outside the sandbox.
pub const SECURITY: i32 = 2;
/// Run was interrupted (Ctrl-C / SIGTERM).
pub const CANCELLED: i32 = 130;
