//! Machine console print utilities.

use std::fmt::Write as _;
use std::io::Write as _;

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    // Buffer the whole line so concurrent threads do not interleave bytes.
    let mut line = String::new();
    let _ = write!(&mut line, "{fmt}");
    let mut out = std::io::stdout().lock();
    let _ = out.write_all(line.as_bytes());
    let _ = out.flush();
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the host standard output.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
