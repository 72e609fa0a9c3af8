// Copyright (C) 2025-present The NetGauze Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error classes shared by all components.
//!
//! Each component keeps its own error enum, every one of them maps onto an
//! [ErrorClass] that the reconciliation layer uses to pick a requeue policy.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
pub enum ErrorClass {
    /// Dial, authentication, or hello exchange failure
    #[strum(to_string = "connection error")]
    Connection,

    /// The peer answered, but with `<rpc-error>` elements or an unusable reply
    #[strum(to_string = "protocol error")]
    Protocol,

    /// A prerequisite is missing or did not succeed (yet)
    #[strum(to_string = "dependency unmet")]
    DependencyUnmet,

    /// Malformed payload or configuration, needs to be corrected by the user
    #[strum(to_string = "validation error")]
    Validation,

    /// No live session for the target identity
    #[strum(to_string = "not connected")]
    NotConnected,
}

impl ErrorClass {
    /// Errors that are expected to clear up on their own and should be
    /// retried after a short delay.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection | Self::DependencyUnmet | Self::NotConnected
        )
    }
}

/// Implemented by every component error to expose its [ErrorClass]
pub trait Classify {
    fn class(&self) -> ErrorClass;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes() {
        assert!(ErrorClass::Connection.is_transient());
        assert!(ErrorClass::DependencyUnmet.is_transient());
        assert!(ErrorClass::NotConnected.is_transient());
        assert!(!ErrorClass::Protocol.is_transient());
        assert!(!ErrorClass::Validation.is_transient());
    }
}
