//! Minimal logging macros.
//!
//! Messages are written to stderr as `[level] ctx : message` lines. A
//! context tag can be passed as the first argument to name the subsystem
//! the message originates from:
//!
//! ```ignore
//! info!("ext2", "mounted filesystem on {path}");
//! ```
//!
//! `debug!` compiles to nothing in release builds.

/// Prints a standard information message to stderr.
#[macro_export]
macro_rules! info {
    ($ctx: literal, $($arg: tt)*) => {
        eprintln!("[info] {} : {}", $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        eprintln!("[info] {}", format_args!($($arg)*))
    };
}

/// Prints an error message to stderr.
#[macro_export]
macro_rules! error {
    ($ctx: literal, $($arg: tt)*) => {
        eprintln!("[error] {} : {}", $ctx, format_args!($($arg)*))
    };
    ($($arg: tt)*) => {
        eprintln!("[error] {}", format_args!($($arg)*))
    };
}

/// Prints a debug message to stderr. Elided in release builds.
#[macro_export]
macro_rules! debug {
    ($ctx: literal, $($arg: tt)*) => {
        if cfg!(debug_assertions) {
            eprintln!("[debug] {} : {}", $ctx, format_args!($($arg)*));
        }
    };
    ($($arg: tt)*) => {
        if cfg!(debug_assertions) {
            eprintln!("[debug] {}", format_args!($($arg)*));
        }
    };
}
