// Stand-ins for the `tracing` macros used when the `tracing` feature is
// disabled. Arguments are discarded without being evaluated.

#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => { () };
}

#[allow(unused_macros)]
macro_rules! debug {
    ($($arg:tt)*) => { () };
}

#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => { () };
}

#[allow(unused_macros)]
macro_rules! warn {
    ($($arg:tt)*) => { () };
}
