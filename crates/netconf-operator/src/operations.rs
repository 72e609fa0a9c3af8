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

//! NETCONF operations as issued inside an `<rpc>` envelope

use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};

pub const NOTIFICATION_NS: &str = "urn:ietf:params:xml:ns:netconf:notification:1.0";
pub const EVENT_NOTIFICATIONS_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-event-notifications";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Datastore {
    Running,
    #[default]
    Candidate,
    Startup,
}

/// `<default-operation>` of an `<edit-config>`
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DefaultOperation {
    #[default]
    Merge,
    Replace,
    None,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum FilterType {
    #[default]
    Subtree,
    Xpath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub filter_type: FilterType,
    /// Subtree content, or the XPath expression for `xpath` filters
    pub content: Box<str>,
}

impl Filter {
    fn write_xml(&self, xml: &mut String) {
        match self.filter_type {
            FilterType::Subtree => {
                xml.push_str("<filter type=\"subtree\">");
                xml.push_str(&self.content);
                xml.push_str("</filter>");
            }
            FilterType::Xpath => {
                xml.push_str("<filter type=\"xpath\" select=\"");
                xml.push_str(&escape(self.content.trim()));
                xml.push_str("\"/>");
            }
        }
    }
}

/// Parameters of a RFC 5277 `<create-subscription>`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamParams {
    pub stream: Option<Box<str>>,
    pub start_time: Option<Box<str>>,
    pub stop_time: Option<Box<str>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Lock(Datastore),
    Unlock(Datastore),
    Get {
        filter: Option<Filter>,
    },
    GetConfig {
        source: Datastore,
        filter: Option<Filter>,
    },
    EditConfig {
        target: Datastore,
        default_operation: DefaultOperation,
        config: Box<str>,
    },
    Commit,
    CloseSession,
    KillSession(u32),
    CreateSubscription(StreamParams),
    /// Complete `<establish-subscription>` element as provided by the user
    EstablishSubscription(Box<str>),
    DeleteSubscription(Box<str>),
    /// Arbitrary operation payload sent as is
    Raw(Box<str>),
}

impl Operation {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Lock(_) => "lock",
            Self::Unlock(_) => "unlock",
            Self::Get { .. } => "get",
            Self::GetConfig { .. } => "get-config",
            Self::EditConfig { .. } => "edit-config",
            Self::Commit => "commit",
            Self::CloseSession => "close-session",
            Self::KillSession(_) => "kill-session",
            Self::CreateSubscription(_) => "create-subscription",
            Self::EstablishSubscription(_) => "establish-subscription",
            Self::DeleteSubscription(_) => "delete-subscription",
            Self::Raw(_) => "rpc",
        }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::new();
        match self {
            Self::Lock(target) => {
                xml.push_str("<lock><target><");
                xml.push_str(&target.to_string());
                xml.push_str("/></target></lock>");
            }
            Self::Unlock(target) => {
                xml.push_str("<unlock><target><");
                xml.push_str(&target.to_string());
                xml.push_str("/></target></unlock>");
            }
            Self::Get { filter } => match filter {
                Some(filter) => {
                    xml.push_str("<get>");
                    filter.write_xml(&mut xml);
                    xml.push_str("</get>");
                }
                None => xml.push_str("<get/>"),
            },
            Self::GetConfig { source, filter } => {
                xml.push_str("<get-config><source><");
                xml.push_str(&source.to_string());
                xml.push_str("/></source>");
                if let Some(filter) = filter {
                    filter.write_xml(&mut xml);
                }
                xml.push_str("</get-config>");
            }
            Self::EditConfig {
                target,
                default_operation,
                config,
            } => {
                xml.push_str("<edit-config><target><");
                xml.push_str(&target.to_string());
                xml.push_str("/></target><default-operation>");
                xml.push_str(&default_operation.to_string());
                xml.push_str("</default-operation><config>");
                xml.push_str(config);
                xml.push_str("</config></edit-config>");
            }
            Self::Commit => xml.push_str("<commit/>"),
            Self::CloseSession => xml.push_str("<close-session/>"),
            Self::KillSession(session_id) => {
                xml.push_str("<kill-session><session-id>");
                xml.push_str(&session_id.to_string());
                xml.push_str("</session-id></kill-session>");
            }
            Self::CreateSubscription(params) => {
                xml.push_str("<create-subscription xmlns=\"");
                xml.push_str(NOTIFICATION_NS);
                xml.push_str("\">");
                let fields = [
                    ("stream", &params.stream),
                    ("startTime", &params.start_time),
                    ("stopTime", &params.stop_time),
                ];
                for (tag, value) in fields {
                    if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                        xml.push('<');
                        xml.push_str(tag);
                        xml.push('>');
                        xml.push_str(&escape(value));
                        xml.push_str("</");
                        xml.push_str(tag);
                        xml.push('>');
                    }
                }
                xml.push_str("</create-subscription>");
            }
            Self::EstablishSubscription(payload) | Self::Raw(payload) => xml.push_str(payload),
            Self::DeleteSubscription(subscription_id) => {
                xml.push_str("<delete-subscription xmlns=\"");
                xml.push_str(EVENT_NOTIFICATIONS_NS);
                xml.push_str("\"><subscription-id>");
                xml.push_str(&escape(subscription_id.as_ref()));
                xml.push_str("</subscription-id></delete-subscription>");
            }
        }
        xml
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::check_well_formed;
    use std::str::FromStr;

    #[test]
    fn test_datastore_names() {
        assert_eq!(Datastore::default(), Datastore::Candidate);
        assert_eq!(Datastore::from_str("running"), Ok(Datastore::Running));
        assert_eq!(DefaultOperation::None.to_string(), "none");
    }

    #[test]
    fn test_lock_unlock() {
        assert_eq!(
            Operation::Lock(Datastore::Candidate).to_xml(),
            "<lock><target><candidate/></target></lock>"
        );
        assert_eq!(
            Operation::Unlock(Datastore::Running).to_xml(),
            "<unlock><target><running/></target></unlock>"
        );
    }

    #[test]
    fn test_get_filters() {
        let subtree = Operation::Get {
            filter: Some(Filter {
                filter_type: FilterType::Subtree,
                content: "<interfaces xmlns=\"urn:ietf:params:xml:ns:yang:ietf-interfaces\"/>".into(),
            }),
        };
        assert_eq!(
            subtree.to_xml(),
            "<get><filter type=\"subtree\"><interfaces xmlns=\"urn:ietf:params:xml:ns:yang:ietf-interfaces\"/></filter></get>"
        );
        let xpath = Operation::GetConfig {
            source: Datastore::Running,
            filter: Some(Filter {
                filter_type: FilterType::Xpath,
                content: "/interfaces/interface[name='eth0']".into(),
            }),
        };
        assert_eq!(
            xpath.to_xml(),
            "<get-config><source><running/></source><filter type=\"xpath\" select=\"/interfaces/interface[name=&apos;eth0&apos;]\"/></get-config>"
        );
        assert_eq!(Operation::Get { filter: None }.to_xml(), "<get/>");
    }

    #[test]
    fn test_edit_config() {
        let edit = Operation::EditConfig {
            target: Datastore::Candidate,
            default_operation: DefaultOperation::Merge,
            config: "<system><hostname>r1</hostname></system>".into(),
        };
        assert_eq!(
            edit.to_xml(),
            "<edit-config><target><candidate/></target><default-operation>merge</default-operation><config><system><hostname>r1</hostname></system></config></edit-config>"
        );
    }

    #[test]
    fn test_subscriptions() {
        let create = Operation::CreateSubscription(StreamParams {
            stream: Some("NETCONF".into()),
            start_time: Some("2024-01-01T00:00:00Z".into()),
            stop_time: None,
        });
        assert_eq!(
            create.to_xml(),
            "<create-subscription xmlns=\"urn:ietf:params:xml:ns:netconf:notification:1.0\"><stream>NETCONF</stream><startTime>2024-01-01T00:00:00Z</startTime></create-subscription>"
        );
        assert_eq!(
            Operation::DeleteSubscription("42".into()).to_xml(),
            "<delete-subscription xmlns=\"urn:ietf:params:xml:ns:yang:ietf-event-notifications\"><subscription-id>42</subscription-id></delete-subscription>"
        );
        assert_eq!(
            Operation::KillSession(12).to_xml(),
            "<kill-session><session-id>12</session-id></kill-session>"
        );
    }

    #[test]
    fn test_every_operation_is_well_formed() {
        let operations = [
            Operation::Lock(Datastore::Candidate),
            Operation::Commit,
            Operation::CloseSession,
            Operation::KillSession(1),
            Operation::CreateSubscription(StreamParams::default()),
            Operation::DeleteSubscription("a&b".into()),
        ];
        for operation in operations {
            assert!(
                check_well_formed(&operation.to_xml()).is_ok(),
                "{} is not well-formed",
                operation.name()
            );
        }
    }
}
