//! Integration tests for cstor-chunked.
//!
//! Every test runs against its own temporary layer store, compresses its
//! input with the real compressor and pulls the result back through
//! [`cstor_chunked::ChunkedDiffer`]. Tests are registered with the linkme
//! crate so each module can add its own without a central list.

#![allow(unsafe_code)] // Required for linkme

use libtest_mimic::{Arguments, Trial};
use linkme::distributed_slice;

pub mod fixture;
mod tests;

/// Test constructors collected from every module by `integration_test!`.
#[distributed_slice]
pub static INTEGRATION_TESTS: [fn() -> Trial];

/// Turn a failed test body into a libtest failure, keeping the whole chain
/// of causes in the message.
pub fn report_failure(report: color_eyre::Report) -> libtest_mimic::Failed {
    libtest_mimic::Failed::from(format!("{report:?}"))
}

/// Run every registered test, sorted by name so output is stable across
/// link orders.
pub fn run_tests() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args = Arguments::from_args();
    let mut tests: Vec<Trial> = INTEGRATION_TESTS.iter().map(|f| f()).collect();
    tests.sort_by(|a, b| a.name().cmp(b.name()));

    libtest_mimic::run(&args, tests).exit();
}

/// Register an integration test.
///
/// The body is a closure returning `color_eyre::Result<()>`, so both library
/// errors and `eyre!` messages can be raised with `?`.
///
/// # Example
///
/// ```ignore
/// use integration_tests::{integration_test, fixture::TestStore};
///
/// integration_test!(test_pull_layer, || {
///     let store = TestStore::new()?;
///     // ... test code
///     Ok(())
/// });
/// ```
#[macro_export]
macro_rules! integration_test {
    ($name:ident, $body:expr) => {
        $crate::paste::paste! {
            #[$crate::linkme::distributed_slice($crate::INTEGRATION_TESTS)]
            #[linkme(crate = $crate::linkme)]
            fn [<__register_ $name>]() -> $crate::libtest_mimic::Trial {
                $crate::libtest_mimic::Trial::test(
                    stringify!($name),
                    move || {
                        let result: $crate::color_eyre::Result<()> = $body();
                        result.map_err($crate::report_failure)
                    },
                )
            }
        }
    };
}

// Re-exported for the macro expansion.
pub use color_eyre;
pub use libtest_mimic;
pub use linkme;
pub use paste;
