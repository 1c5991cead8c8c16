//! Platform Core Logging Macros
//!
//! This module provides the logging surface used by every subsystem of the
//! platform core. Records are handed to a [`LogSink`] as a severity, a static
//! message and a short list of numeric parameters, which is the shape the
//! firmware trace transport expects. Formatting happens on the host side, so
//! nothing here allocates or formats strings.
//!
//! `log_debug!` and `log_trace!` compile to nothing in builds without
//! `debug_assertions`.

#![deny(missing_docs)]

/// Debug output levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum DebugLevel {
    /// Error messages - always shown
    Error = 0,
    /// Warning messages
    Warning = 1,
    /// Information messages
    Info = 2,
    /// Debug messages
    Debug = 3,
    /// Trace messages - most verbose
    Trace = 4,
}

/// Destination for log records.
///
/// Implemented by the platform trace transport. Must be callable from any core
/// and from interrupt context; implementations must not block.
pub trait LogSink {
    /// Emit one record.
    fn log(&self, level: DebugLevel, message: &'static str, params: &[u32]);
}

/// Emit an error record: `log_error!(sink, "message", args...)`.
#[macro_export]
macro_rules! log_error {
    ($sink:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        $crate::macros::LogSink::log(
            $sink,
            $crate::macros::DebugLevel::Error,
            $msg,
            &[$(($arg) as u32),*],
        )
    };
}

/// Emit a warning record.
#[macro_export]
macro_rules! log_warn {
    ($sink:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        $crate::macros::LogSink::log(
            $sink,
            $crate::macros::DebugLevel::Warning,
            $msg,
            &[$(($arg) as u32),*],
        )
    };
}

/// Emit an informational record.
#[macro_export]
macro_rules! log_info {
    ($sink:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        $crate::macros::LogSink::log(
            $sink,
            $crate::macros::DebugLevel::Info,
            $msg,
            &[$(($arg) as u32),*],
        )
    };
}

/// Emit a debug record (debug builds only).
#[macro_export]
macro_rules! log_debug {
    ($sink:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(debug_assertions)]
        {
            $crate::macros::LogSink::log(
                $sink,
                $crate::macros::DebugLevel::Debug,
                $msg,
                &[$(($arg) as u32),*],
            )
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = ($sink, $(&($arg)),*);
        }
    };
}

/// Emit a trace record (debug builds only).
#[macro_export]
macro_rules! log_trace {
    ($sink:expr, $msg:literal $(, $arg:expr)* $(,)?) => {
        #[cfg(debug_assertions)]
        {
            $crate::macros::LogSink::log(
                $sink,
                $crate::macros::DebugLevel::Trace,
                $msg,
                &[$(($arg) as u32),*],
            )
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = ($sink, $(&($arg)),*);
        }
    };
}
