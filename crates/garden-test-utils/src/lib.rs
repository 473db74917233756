// Copyright (c) Garden Contributors
// SPDX-License-Identifier: Apache-2.0

//! Test utilities shared between the garden crates.

use rand::{rngs::StdRng, Rng as _, SeedableRng as _};

/// A result type useful in tests, letting `?` absorb any error.
pub type Result<T = ()> = anyhow::Result<T>;

/// Expands a list of named cases into one `#[test]` function each, all calling the same
/// already-defined function with that case's arguments.
///
/// The cases live in a module named after the target function, so a failure reports as
/// `my_check::some_case`. Attributes placed on a case (such as `#[ignore]`) apply to the
/// generated test.
///
/// ```
/// # use garden_test_utils::param_test;
/// param_test! {
///     doubles {
///         one(1, 2),
///         three(3, 6),
///     }
/// }
/// fn doubles(input: u32, expected: u32) {
///     assert_eq!(input * 2, expected);
/// }
/// # fn main() {}
/// ```
#[macro_export]
macro_rules! param_test {
    ($func:ident { $($(#[$attr:meta])* $case:ident($($arg:expr),* $(,)?)),+ $(,)? }) => {
        mod $func {
            use super::*;

            $(
                $(#[$attr])*
                #[test]
                fn $case() {
                    super::$func($($arg),*);
                }
            )+
        }
    };
}

/// The `async` counterpart of [`param_test`]: every generated test is a `#[tokio::test]`
/// awaiting the target function.
///
/// ```
/// # use garden_test_utils::async_param_test;
/// async_param_test! {
///     doubles {
///         one(1, 2),
///         three(3, 6),
///     }
/// }
/// async fn doubles(input: u32, expected: u32) {
///     assert_eq!(input * 2, expected);
/// }
/// # fn main() {}
/// ```
#[macro_export]
macro_rules! async_param_test {
    ($func:ident { $($(#[$attr:meta])* $case:ident($($arg:expr),* $(,)?)),+ $(,)? }) => {
        mod $func {
            use super::*;

            $(
                $(#[$attr])*
                #[tokio::test]
                async fn $case() {
                    super::$func($($arg),*).await;
                }
            )+
        }
    };
}

/// Returns `length` bytes drawn from a seeded generator, so repeated calls (and repeated test
/// runs) see the same data.
pub fn random_data(length: usize) -> Vec<u8> {
    random_data_with_seed(length, 42)
}

/// Returns `length` reproducible bytes for the given seed.
///
/// Distinct seeds give independent streams, which is useful when a test needs several plots
/// with different contents.
pub fn random_data_with_seed(length: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    std::iter::repeat_with(|| rng.gen()).take(length).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    param_test! {
        sums {
            small(1, 2, 3),
            negative(-4, 1, -3),
            #[ignore = "checks that case attributes are applied"]
            ignored(0, 0, 0),
        }
    }
    fn sums(lhs: i32, rhs: i32, total: i32) {
        assert_eq!(lhs + rhs, total);
    }

    async_param_test! {
        async_sums {
            small(1, 2, 3),
            larger(10, 11, 21),
        }
    }
    async fn async_sums(lhs: i32, rhs: i32, total: i32) {
        assert_eq!(lhs + rhs, total);
    }

    #[test]
    fn random_data_is_reproducible() {
        assert_eq!(random_data(128), random_data(128));
        assert_ne!(
            random_data_with_seed(128, 1),
            random_data_with_seed(128, 2)
        );
    }
}
