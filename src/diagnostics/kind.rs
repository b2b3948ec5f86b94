//! Diagnostic kinds and core types.
//!
//! Mirrors rustc's diagnostic levels for familiar UX.

/// The severity level of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A hard error - something is definitely wrong.
    Error,
    /// A warning - something is probably wrong or suboptimal.
    Warning,
    /// Additional context, emitted for bookkeeping events.
    Note,
}

impl DiagnosticKind {
    /// Get the display prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            DiagnosticKind::Error => "error",
            DiagnosticKind::Warning => "warning",
            DiagnosticKind::Note => "note",
        }
    }
}

/// A diagnostic message with code, message, and optional context.
///
/// Diagnostic codes follow the pattern:
/// - `DM0xx` - Map/unmap lifecycle
/// - `DM1xx` - Staging buffers
/// - `DM2xx` - Sub-buffers and object release
/// - `DM3xx` - Device allocations and commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Severity level.
    pub kind: DiagnosticKind,
    /// Diagnostic code (e.g., "DM001").
    pub code: &'static str,
    /// Primary message.
    pub message: &'static str,
    /// Optional additional context.
    pub note: Option<&'static str>,
    /// Optional fix suggestion.
    pub help: Option<&'static str>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub const fn error(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new warning diagnostic.
    pub const fn warning(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Create a new note diagnostic.
    pub const fn note(code: &'static str, message: &'static str) -> Self {
        Self {
            kind: DiagnosticKind::Note,
            code,
            message,
            note: None,
            help: None,
        }
    }

    /// Add a note to this diagnostic.
    pub const fn with_note(mut self, note: &'static str) -> Self {
        self.note = Some(note);
        self
    }

    /// Add a help message to this diagnostic.
    pub const fn with_help(mut self, help: &'static str) -> Self {
        self.help = Some(help);
        self
    }
}

// =============================================================================
// Predefined diagnostics (DM0xx - Map lifecycle)
// =============================================================================

/// DM001: Unmap without a matching map.
pub const DM001: Diagnostic = Diagnostic::warning(
    "DM001",
    "unmap called on a memory object that is not mapped"
).with_note("the map count is already zero; the call was ignored")
 .with_help("pair every map() with exactly one unmap()");

/// DM002: Release while mapped.
pub const DM002: Diagnostic = Diagnostic::error(
    "DM002",
    "memory object released while host mappings are outstanding"
).with_help("unmap every mapping (including sub-buffer mappings) before releasing the object");

// =============================================================================
// Predefined diagnostics (DM1xx - Staging)
// =============================================================================

/// DM101: Staging buffer grown.
pub const DM101: Diagnostic = Diagnostic::note(
    "DM101",
    "staging buffer reallocated to a larger size"
);

/// DM102: Staging growth refused while mapped.
pub const DM102: Diagnostic = Diagnostic::error(
    "DM102",
    "staging buffer cannot grow while it is mapped"
).with_note("growing would invalidate the host pointer handed out by map()")
 .with_help("unmap the image before issuing a larger transfer");

// =============================================================================
// Predefined diagnostics (DM2xx - Sub-buffers)
// =============================================================================

/// DM201: Parent released with live sub-buffers.
pub const DM201: Diagnostic = Diagnostic::warning(
    "DM201",
    "parent buffer released while sub-buffers are live"
).with_note("the sub-buffers were released alongside their parent and their handles are now stale");

// =============================================================================
// Predefined diagnostics (DM3xx - Device)
// =============================================================================

/// DM301: Allocation freed while mapped.
pub const DM301: Diagnostic = Diagnostic::warning(
    "DM301",
    "device allocation freed while still mapped"
);

/// DM302: Free deferred.
pub const DM302: Diagnostic = Diagnostic::note(
    "DM302",
    "allocation free deferred until pending commands complete"
);

/// DM303: Recorded command failed.
pub const DM303: Diagnostic = Diagnostic::error(
    "DM303",
    "recorded device command failed during execution"
).with_help("commands are validated at record time; this indicates a backend bug");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predefined_codes() {
        assert_eq!(DM001.code, "DM001");
        assert_eq!(DM001.kind, DiagnosticKind::Warning);
        assert!(DM001.help.is_some());
        assert_eq!(DM102.kind.prefix(), "error");
        assert_eq!(DM302.kind, DiagnosticKind::Note);
    }
}
