#![allow(unused_macros)]
#![allow(unused_imports)]

//! Logging shims.
//!
//! With the `defmt` feature the macros forward to the `defmt` macro of the
//! same level. Without it the arguments are only borrowed, so that nothing
//! becomes unused.

macro_rules! log_at {
    ($level:ident, $s:literal $(, $x:expr)* $(,)?) => {
        {
            #[cfg(feature = "defmt")]
            ::defmt::$level!($s $(, $x)*);
            #[cfg(not(feature = "defmt"))]
            let _ = ($( & $x ),*);
        }
    };
}

macro_rules! trace {
    ($($t:tt)*) => { $crate::fmt::log_at!(trace, $($t)*) };
}

macro_rules! debug {
    ($($t:tt)*) => { $crate::fmt::log_at!(debug, $($t)*) };
}

macro_rules! info {
    ($($t:tt)*) => { $crate::fmt::log_at!(info, $($t)*) };
}

macro_rules! warning {
    ($($t:tt)*) => { $crate::fmt::log_at!(warn, $($t)*) };
}

macro_rules! error {
    ($($t:tt)*) => { $crate::fmt::log_at!(error, $($t)*) };
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
pub(crate) use log_at;
pub(crate) use trace;
pub(crate) use warning as warn;
