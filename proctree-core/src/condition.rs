// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Obstruction conditions (§4.4): the reason a `Flow` reports when it
//! refuses more input or output. `Condition` values are compared by
//! identity-ish equality (two conditions are "the same" obstruction only
//! if they're the same value), and [`Inexorable`] is the sentinel for an
//! obstruction that will never clear.

use std::fmt;

/// A named obstruction reason. Cheap to clone and compare; flows hold a
/// small `Vec<Condition>` of everything currently obstructing them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Condition(&'static str);

impl Condition {
    pub const fn new(reason: &'static str) -> Self {
        Condition(reason)
    }

    pub fn reason(&self) -> &'static str {
        self.0
    }

    /// The permanent, never-clearable obstruction (§4.4): once a flow is
    /// obstructed by `Inexorable` it is never expected to un-obstruct, and
    /// downstream consumers should treat it as terminal rather than wait.
    pub fn is_inexorable(&self) -> bool {
        *self == INEXORABLE
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const INEXORABLE: Condition = Condition::new("inexorable");

/// Common obstruction reasons raised by the flow/io/multiplex crates.
/// Kept here, rather than scattered per-crate, so obstruction monitors
/// written against `proctree-core` can match on a shared vocabulary.
pub const OVERFLOW: Condition = Condition::new("overflow");
pub const BACKPRESSURE: Condition = Condition::new("backpressure");
pub const SHUTDOWN: Condition = Condition::new("shutdown");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inexorable_is_distinct_from_other_conditions() {
        assert!(INEXORABLE.is_inexorable());
        assert!(!OVERFLOW.is_inexorable());
        assert_ne!(INEXORABLE, OVERFLOW);
    }

    #[test]
    fn conditions_with_the_same_reason_are_equal() {
        assert_eq!(Condition::new("x"), Condition::new("x"));
    }
}
