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

//! NETCONF capability URIs as exchanged in `<hello>` messages

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

pub const CAP_BASE_1_0: &str = "urn:ietf:params:netconf:base:1.0";
pub const CAP_BASE_1_1: &str = "urn:ietf:params:netconf:base:1.1";
pub const CAP_NOTIFICATION: &str = "urn:ietf:params:netconf:capability:notification:1.0";
pub const CAP_INTERLEAVE: &str = "urn:ietf:params:netconf:capability:interleave:1.0";

/// Capabilities announced by the client unless told otherwise
pub const DEFAULT_CAPABILITIES: [&str; 4] =
    [CAP_BASE_1_0, CAP_BASE_1_1, CAP_NOTIFICATION, CAP_INTERLEAVE];

/// Ordered, de-duplicated set of capability URIs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities(IndexSet<Box<str>>);

impl Capabilities {
    /// Client side capabilities: the defaults followed by any additional
    /// capabilities requested for a mount point.
    pub fn client<S: AsRef<str>>(additional: &[S]) -> Self {
        DEFAULT_CAPABILITIES
            .iter()
            .copied()
            .chain(additional.iter().map(AsRef::as_ref))
            .collect()
    }

    pub fn insert(&mut self, capability: &str) -> bool {
        let capability = capability.trim();
        if capability.is_empty() {
            return false;
        }
        self.0.insert(capability.into())
    }

    /// Checks if the capability is present, ignoring any query parameters
    /// (e.g. `?module=...&revision=...`) attached to the announced URI.
    pub fn contains(&self, capability: &str) -> bool {
        self.0
            .iter()
            .any(|cap| cap.as_ref() == capability || strip_query(cap) == capability)
    }

    pub fn supports_chunked_framing(&self) -> bool {
        self.contains(CAP_BASE_1_1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(AsRef::as_ref)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Box<str>> {
        self.0.iter().cloned().collect()
    }
}

impl<'a> FromIterator<&'a str> for Capabilities {
    fn from_iter<T: IntoIterator<Item = &'a str>>(iter: T) -> Self {
        let mut caps = Self::default();
        for cap in iter {
            caps.insert(cap);
        }
        caps
    }
}

fn strip_query(capability: &str) -> &str {
    capability
        .split_once('?')
        .map_or(capability, |(uri, _)| uri)
}
