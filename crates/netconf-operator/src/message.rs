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

//! Classification and decoding of raw NETCONF frames.
//!
//! Only the parts needed to route frames and judge RPC outcomes are decoded:
//! the root element, `message-id`, `<ok/>`, `<rpc-error>` elements, `<data>`
//! and subscription identifiers. Everything else stays as raw text and is
//! handed to the caller untouched.

use crate::capabilities::Capabilities;
use quick_xml::{
    escape::{escape, unescape},
    events::{BytesStart, Event},
    name::QName,
    Reader,
};
use std::{borrow::Cow, fmt};

pub const NETCONF_NS: &str = "urn:ietf:params:xml:ns:netconf:base:1.0";

/// Namespaces of the events that carry the identifier of a dynamic
/// subscription
const SUBSCRIPTION_EVENT_NS: [&str; 3] = [
    "urn:ietf:params:xml:ns:yang:ietf-yang-push",
    "urn:ietf:params:xml:ns:yang:ietf-subscribed-notifications",
    "urn:ietf:params:xml:ns:yang:ietf-event-notifications",
];

const SUBSCRIPTION_EVENTS: [&str; 9] = [
    "push-update",
    "push-change-update",
    "subscription-started",
    "subscription-modified",
    "subscription-terminated",
    "subscription-suspended",
    "subscription-resumed",
    "subscription-completed",
    "replay-completed",
];
const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

#[derive(Debug, strum_macros::Display)]
pub enum XmlError {
    #[strum(to_string = "XML parsing error: {0}")]
    Parsing(quick_xml::Error),

    #[strum(to_string = "invalid UTF-8 in XML document: {0}")]
    Utf8(std::str::Utf8Error),

    #[strum(to_string = "XML document has no root element")]
    NoRoot,

    #[strum(to_string = "XML document ends with {0} unclosed element(s)")]
    Unclosed(usize),

    #[strum(to_string = "unexpected text `{0}` outside of any element")]
    TextOutsideRoot(String),

    #[strum(to_string = "expected `<{expected}>` as root element but found `<{actual}>`")]
    UnexpectedRoot {
        expected: &'static str,
        actual: String,
    },

    #[strum(to_string = "invalid value `{value}` for `<{element}>`")]
    InvalidValue {
        element: &'static str,
        value: String,
    },
}

impl std::error::Error for XmlError {}

impl From<quick_xml::Error> for XmlError {
    fn from(err: quick_xml::Error) -> Self {
        Self::Parsing(err)
    }
}

impl From<std::str::Utf8Error> for XmlError {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::Utf8(err)
    }
}

impl From<quick_xml::events::attributes::AttrError> for XmlError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        Self::Parsing(quick_xml::Error::InvalidAttr(err))
    }
}

/// Kind of a frame received from the peer, judged by its root element
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum FrameKind {
    #[strum(to_string = "hello")]
    Hello,
    #[strum(to_string = "rpc-reply")]
    RpcReply,
    #[strum(to_string = "notification")]
    Notification,
    #[strum(to_string = "unknown")]
    Unknown,
}

fn new_reader(raw: &str) -> Reader<&[u8]> {
    let mut reader = Reader::from_str(raw);
    reader.config_mut().trim_text(true);
    reader
}

fn is_blank(text: &[u8]) -> bool {
    text.iter().all(u8::is_ascii_whitespace)
}

/// Advance the reader to the first element of the document
fn root_element<'a>(reader: &mut Reader<&'a [u8]>) -> Result<(BytesStart<'a>, bool), XmlError> {
    loop {
        match reader.read_event()? {
            Event::Start(start) => return Ok((start, false)),
            Event::Empty(start) => return Ok((start, true)),
            Event::Text(text) if !is_blank(&text) => {
                return Err(XmlError::TextOutsideRoot(
                    String::from_utf8_lossy(&text).into_owned(),
                ));
            }
            Event::Eof => return Err(XmlError::NoRoot),
            _ => {}
        }
    }
}

fn expect_root(start: &BytesStart<'_>, expected: &'static str) -> Result<(), XmlError> {
    let actual = start.local_name();
    if actual.as_ref() == expected.as_bytes() {
        Ok(())
    } else {
        Err(XmlError::UnexpectedRoot {
            expected,
            actual: String::from_utf8_lossy(actual.as_ref()).into_owned(),
        })
    }
}

fn attribute(start: &BytesStart<'_>, name: &[u8]) -> Result<Option<Box<str>>, XmlError> {
    for attr in start.attributes() {
        let attr = attr?;
        if attr.key.local_name().as_ref() == name {
            return Ok(Some(std::str::from_utf8(&attr.value)?.into()));
        }
    }
    Ok(None)
}

/// Trimmed and unescaped text content, the raw text is kept if it contains
/// entities that cannot be resolved.
fn text_value(text: Cow<'_, str>) -> Box<str> {
    let trimmed = text.trim();
    match unescape(trimmed) {
        Ok(value) => value.into_owned().into_boxed_str(),
        Err(_) => trimmed.into(),
    }
}

fn read_text_value(reader: &mut Reader<&[u8]>, end: QName<'_>) -> Result<Box<str>, XmlError> {
    Ok(text_value(reader.read_text(end)?))
}

/// Classify a frame by its root element
pub fn frame_kind(raw: &str) -> Result<FrameKind, XmlError> {
    let mut reader = new_reader(raw);
    let (root, _) = root_element(&mut reader)?;
    let kind = match root.local_name().as_ref() {
        b"hello" => FrameKind::Hello,
        b"rpc-reply" => FrameKind::RpcReply,
        b"notification" => FrameKind::Notification,
        _ => FrameKind::Unknown,
    };
    Ok(kind)
}

/// The `message-id` of a frame when it is an `<rpc-reply>`
pub fn reply_message_id(raw: &str) -> Result<Option<Box<str>>, XmlError> {
    let mut reader = new_reader(raw);
    let (root, _) = root_element(&mut reader)?;
    if root.local_name().as_ref() != b"rpc-reply" {
        return Ok(None);
    }
    attribute(&root, b"message-id")
}

/// Check that a payload is well-formed XML: balanced elements, at least one
/// element, and no text outside of elements. Several sibling top-level
/// elements are accepted since configuration payloads are often fragments.
pub fn check_well_formed(xml: &str) -> Result<(), XmlError> {
    let mut reader = new_reader(xml);
    let mut depth = 0usize;
    let mut roots = 0usize;
    loop {
        match reader.read_event()? {
            Event::Start(_) => {
                if depth == 0 {
                    roots += 1;
                }
                depth += 1;
            }
            Event::Empty(_) if depth == 0 => roots += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(text) if depth == 0 && !is_blank(&text) => {
                return Err(XmlError::TextOutsideRoot(
                    String::from_utf8_lossy(&text).into_owned(),
                ));
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if depth > 0 {
        return Err(XmlError::Unclosed(depth));
    }
    if roots == 0 {
        return Err(XmlError::NoRoot);
    }
    Ok(())
}

/// Well-formed check plus a check on the name of the first root element
pub fn check_root(xml: &str, expected: &'static str) -> Result<(), XmlError> {
    check_well_formed(xml)?;
    let mut reader = new_reader(xml);
    let (root, _) = root_element(&mut reader)?;
    expect_root(&root, expected)
}

/// Serialize a client `<hello>` announcing the given capabilities
pub fn hello_xml(capabilities: &Capabilities) -> String {
    let mut xml = String::from(XML_HEADER);
    xml.push_str("<hello xmlns=\"");
    xml.push_str(NETCONF_NS);
    xml.push_str("\"><capabilities>");
    for capability in capabilities.iter() {
        xml.push_str("<capability>");
        xml.push_str(&escape(capability));
        xml.push_str("</capability>");
    }
    xml.push_str("</capabilities></hello>");
    xml
}

/// Wrap an operation in an `<rpc>` envelope
pub fn rpc_xml(message_id: &str, operation: &str) -> String {
    let mut xml = String::with_capacity(operation.len() + 128);
    xml.push_str(XML_HEADER);
    xml.push_str("<rpc message-id=\"");
    xml.push_str(&escape(message_id));
    xml.push_str("\" xmlns=\"");
    xml.push_str(NETCONF_NS);
    xml.push_str("\">");
    xml.push_str(operation);
    xml.push_str("</rpc>");
    xml
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    session_id: Option<u32>,
    capabilities: Capabilities,
}

impl Hello {
    pub const fn session_id(&self) -> Option<u32> {
        self.session_id
    }

    pub const fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn parse(raw: &str) -> Result<Self, XmlError> {
        let mut reader = new_reader(raw);
        let (root, empty) = root_element(&mut reader)?;
        expect_root(&root, "hello")?;
        let mut hello = Self {
            session_id: None,
            capabilities: Capabilities::default(),
        };
        if empty {
            return Ok(hello);
        }
        let mut depth = 1usize;
        loop {
            match reader.read_event()? {
                Event::Start(start) => match start.local_name().as_ref() {
                    b"capability" => {
                        let capability = read_text_value(&mut reader, start.name())?;
                        hello.capabilities.insert(&capability);
                    }
                    b"session-id" => {
                        let value = read_text_value(&mut reader, start.name())?;
                        let session_id =
                            value.parse::<u32>().map_err(|_| XmlError::InvalidValue {
                                element: "session-id",
                                value: value.to_string(),
                            })?;
                        hello.session_id = Some(session_id);
                    }
                    _ => depth += 1,
                },
                Event::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(hello);
                    }
                }
                Event::Eof => return Err(XmlError::Unclosed(depth)),
                _ => {}
            }
        }
    }
}

/// A single `<rpc-error>` element as defined in RFC 6241 section 4.3
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcError {
    pub error_type: Option<Box<str>>,
    pub error_tag: Option<Box<str>>,
    pub severity: Option<Box<str>>,
    pub app_tag: Option<Box<str>>,
    pub path: Option<Box<str>>,
    pub message: Option<Box<str>>,
    pub info: Option<Box<str>>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}",
            self.severity.as_deref().unwrap_or("error"),
            self.error_type.as_deref().unwrap_or("-"),
            self.error_tag.as_deref().unwrap_or("-"),
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

impl RpcError {
    /// Parse the children of an `<rpc-error>`, the reader must be positioned
    /// right after its start tag. Consumes the matching end tag.
    fn parse(reader: &mut Reader<&[u8]>) -> Result<Self, XmlError> {
        let mut error = Self::default();
        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"error-type" => error.error_type = Some(read_text_value(reader, name)?),
                        b"error-tag" => error.error_tag = Some(read_text_value(reader, name)?),
                        b"error-severity" => {
                            error.severity = Some(read_text_value(reader, name)?)
                        }
                        b"error-app-tag" => error.app_tag = Some(read_text_value(reader, name)?),
                        b"error-path" => error.path = Some(read_text_value(reader, name)?),
                        b"error-message" => error.message = Some(read_text_value(reader, name)?),
                        b"error-info" => {
                            error.info = Some(reader.read_text(name)?.trim().into());
                        }
                        _ => {
                            reader.read_to_end(name)?;
                        }
                    }
                }
                Event::End(_) => return Ok(error),
                Event::Eof => return Err(XmlError::Unclosed(1)),
                _ => {}
            }
        }
    }
}

/// Decoded `<rpc-reply>`, the raw text is always preserved for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    message_id: Option<Box<str>>,
    ok: bool,
    errors: Vec<RpcError>,
    data: Option<Box<str>>,
    subscription_id: Option<Box<str>>,
    subscription_result: Option<Box<str>>,
    raw: Box<str>,
}

impl RpcReply {
    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// The reply carried an explicit `<ok/>`
    pub const fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn errors(&self) -> &[RpcError] {
        &self.errors
    }

    /// Protocol level failure: at least one `<rpc-error>`, or a subscription
    /// result other than `ok`.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
            || self
                .subscription_result
                .as_deref()
                .is_some_and(|result| !result.ends_with("ok"))
    }

    /// Inner content of `<data>`
    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    /// Subscription identifier assigned by the peer to an
    /// `<establish-subscription>`, both the `ietf-event-notifications`
    /// `<subscription-id>` and the RFC 8639 `<id>` forms are recognized.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn subscription_result(&self) -> Option<&str> {
        self.subscription_result.as_deref()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn into_raw(self) -> Box<str> {
        self.raw
    }

    pub fn parse(raw: &str) -> Result<Self, XmlError> {
        let mut reader = new_reader(raw);
        let (root, empty) = root_element(&mut reader)?;
        expect_root(&root, "rpc-reply")?;
        let mut reply = Self {
            message_id: attribute(&root, b"message-id")?,
            ok: false,
            errors: vec![],
            data: None,
            subscription_id: None,
            subscription_result: None,
            raw: raw.into(),
        };
        if empty {
            return Ok(reply);
        }
        let mut depth = 1usize;
        loop {
            match reader.read_event()? {
                Event::Start(start) if depth == 1 => {
                    let name = start.name();
                    match start.local_name().as_ref() {
                        b"ok" => {
                            reply.ok = true;
                            reader.read_to_end(name)?;
                        }
                        b"data" => {
                            reply.data = Some(reader.read_text(name)?.trim().into());
                        }
                        b"rpc-error" => reply.errors.push(RpcError::parse(&mut reader)?),
                        b"subscription-id" | b"id" => {
                            reply.subscription_id = Some(read_text_value(&mut reader, name)?);
                        }
                        b"subscription-result" => {
                            reply.subscription_result = Some(read_text_value(&mut reader, name)?);
                        }
                        _ => depth += 1,
                    }
                }
                Event::Start(_) => depth += 1,
                Event::Empty(start) if depth == 1 => match start.local_name().as_ref() {
                    b"ok" => reply.ok = true,
                    b"data" => reply.data = Some("".into()),
                    _ => {}
                },
                Event::End(_) => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(reply);
                    }
                }
                Event::Eof => return Err(XmlError::Unclosed(depth)),
                _ => {}
            }
        }
    }
}

/// Decoded `<notification>` (RFC 5277), keeping the raw frame for delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    event_time: Option<Box<str>>,
    event_name: Option<Box<str>>,
    subscription_id: Option<Box<str>>,
    raw: Box<str>,
}

impl Notification {
    pub fn event_time(&self) -> Option<&str> {
        self.event_time.as_deref()
    }

    /// Local name of the event element, e.g. `push-update`
    pub fn event_name(&self) -> Option<&str> {
        self.event_name.as_deref()
    }

    /// Subscription the notification belongs to. `None` for notifications
    /// of a legacy `<create-subscription>` stream.
    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription_id.as_deref()
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn parse(raw: &str) -> Result<Self, XmlError> {
        let mut reader = new_reader(raw);
        let (root, empty) = root_element(&mut reader)?;
        expect_root(&root, "notification")?;
        let mut notification = Self {
            event_time: None,
            event_name: None,
            subscription_id: None,
            raw: raw.into(),
        };
        if empty {
            return Ok(notification);
        }
        let mut depth = 1usize;
        // set while inside the event element of a dynamic subscription
        let mut subscription_event = false;
        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    let name = start.name();
                    match (depth, start.local_name().as_ref()) {
                        (1, b"eventTime") => {
                            notification.event_time = Some(read_text_value(&mut reader, name)?);
                        }
                        (2, b"subscription-id" | b"id")
                            if subscription_event && notification.subscription_id.is_none() =>
                        {
                            notification.subscription_id =
                                Some(read_text_value(&mut reader, name)?);
                        }
                        (1, local) => {
                            if notification.event_name.is_none() {
                                notification.event_name =
                                    Some(std::str::from_utf8(local)?.into());
                                subscription_event = is_subscription_event(&start)?;
                            }
                            depth += 1;
                        }
                        _ => depth += 1,
                    }
                }
                Event::Empty(start) if depth == 1 && notification.event_name.is_none() => {
                    notification.event_name =
                        Some(std::str::from_utf8(start.local_name().as_ref())?.into());
                }
                Event::End(_) => {
                    depth -= 1;
                    if depth == 1 {
                        subscription_event = false;
                    }
                    if depth == 0 {
                        return Ok(notification);
                    }
                }
                Event::Eof => return Err(XmlError::Unclosed(depth)),
                _ => {}
            }
        }
    }
}

/// Whether the event element is one of the dynamic subscription events.
/// Events of legacy streams are routed to the stream listener even when
/// they carry an `<id>` of their own.
fn is_subscription_event(start: &BytesStart<'_>) -> Result<bool, XmlError> {
    let local = start.local_name();
    let known = SUBSCRIPTION_EVENTS
        .iter()
        .any(|event| event.as_bytes() == local.as_ref());
    if !known {
        return Ok(false);
    }
    // an inherited default namespace is accepted
    Ok(match attribute(start, b"xmlns")? {
        Some(ns) => SUBSCRIPTION_EVENT_NS.iter().any(|known| *known == &*ns),
        None => true,
    })
}
