// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Support for reporting runtime contract violations.
//!
//! Every fatal condition in the runtime funnels through [`die`], so the
//! output format is uniform: the failed condition, the source location, and
//! key/value pairs of whatever live variables the call site considered
//! relevant. Contract violations are not recoverable at this layer -- no
//! error value crosses a handler boundary -- so `die` diverges.
//!
//! The [`require!`] macro is the usual entry point:
//!
//! ```ignore
//! require!(
//!     dest >= 0 && dest < num_nodes,
//!     "send destination out of range",
//!     dest = dest,
//!     num_nodes = num_nodes,
//! );
//! ```

use core::fmt::Display;

/// Terminates the process with a structured description of the failure.
///
/// This is `panic!` underneath so that tests can observe fatal paths with
/// `#[should_panic]`; release builds are expected to compile with
/// `panic = "abort"`, which turns this into a nonzero-status process exit
/// with the message on stderr.
#[inline(never)]
pub fn die(msg: impl Display) -> ! {
    panic!("runtime contract violation: {msg}");
}

/// Checks a runtime contract, dying with structured output on failure.
///
/// The expansion stringifies the condition and formats each `key = value`
/// pair with `Debug`, followed by the source location.
#[macro_export]
macro_rules! require {
    ($cond:expr, $what:expr $(, $key:ident = $val:expr)* $(,)?) => {
        if !$cond {
            $crate::fail::die(format_args!(
                concat!(
                    $what,
                    ": failed `{}`",
                    $(concat!(", ", stringify!($key), "={:?}"),)*
                    " at {}:{}"
                ),
                stringify!($cond),
                $($val,)*
                file!(),
                line!(),
            ));
        }
    };
}

/// Unwraps a transport-layer result, dying on error (the contract defines
/// transport failure as fatal; no retry is attempted at this layer).
pub fn transport_ok<T, E: Display>(r: Result<T, E>, what: &str) -> T {
    match r {
        Ok(v) => v,
        Err(e) => die(format_args!("transport failure during {what}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    #[test]
    #[should_panic(expected = "runtime contract violation")]
    fn require_reports_condition_and_values() {
        let dest = 9;
        require!(dest < 4, "send destination out of range", dest = dest);
    }

    #[test]
    fn require_passes_silently() {
        require!(1 + 1 == 2, "arithmetic is broken");
    }
}
