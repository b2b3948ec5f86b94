//! Runtime diagnostics.
//!
//! Memory-object misuse that is not an error result (unmapping an unmapped object,
//! releasing a parent with live sub-buffers, deferred frees) is reported here with a
//! stable code.
//!
//! ## Diagnostic Codes
//!
//! | Code  | Meaning                        |
//! |-------|--------------------------------|
//! | DM0xx | Map/unmap lifecycle            |
//! | DM1xx | Staging buffers                |
//! | DM2xx | Sub-buffers and release        |
//! | DM3xx | Device allocations/commands    |

pub mod emit;
pub mod kind;
pub mod macros;

pub use emit::{emit, emit_with_context, suppress_diagnostics};
pub use kind::{Diagnostic, DiagnosticKind};
pub use kind::{DM001, DM002, DM101, DM102, DM201, DM301, DM302, DM303};
