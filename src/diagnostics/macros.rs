//! Diagnostic macros used throughout the crate.

/// Emit a predefined diagnostic by code, optionally with formatted context.
///
/// # Example
///
/// ```rust,ignore
/// dm_emit!(DM001);
/// dm_emit!(DM302, "allocation {} waits for serial {}", id, serial);
/// ```
#[doc(hidden)]
#[macro_export]
macro_rules! dm_emit {
    ($code:ident) => {{
        $crate::diagnostics::emit::emit(&$crate::diagnostics::$code);
    }};
    ($code:ident, $($ctx:tt)+) => {{
        if !$crate::diagnostics::emit::is_suppressed() {
            $crate::diagnostics::emit::emit_with_context(
                &$crate::diagnostics::$code,
                &format!($($ctx)+),
            );
        }
    }};
}

/// Trace an operation through `log::trace!` when the `log` feature is enabled.
#[doc(hidden)]
#[macro_export]
macro_rules! dm_trace {
    ($($arg:tt)+) => {{
        #[cfg(feature = "log")]
        {
            log::trace!($($arg)+);
        }
        #[cfg(not(feature = "log"))]
        {
            let _ = format_args!($($arg)+);
        }
    }};
}
