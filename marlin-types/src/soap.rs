//! SOAP envelopes, faults, and the header blocks the server acts on.
//!
//! The server is not a general XML processor; payload parsing belongs to
//! an external collaborator. What lives here is the structured form of an
//! envelope that the protocol machines need: the SOAP version, the message
//! namespace and action, the WS-ReliableMessaging sequence numbers, the
//! WS-Security header, the body as a small element tree, and the fault
//! structure. A plain-text codec turns the structure into envelope text
//! and back for the wire.

use std::fmt;

/// SOAP 1.1 envelope namespace.
pub const NS_SOAP11_ENVELOPE: &str = "http://schemas.xmlsoap.org/soap/envelope/";
/// SOAP 1.2 envelope namespace.
pub const NS_SOAP12_ENVELOPE: &str = "http://www.w3.org/2003/05/soap-envelope";
/// WS-Addressing namespace.
pub const NS_ADDRESSING: &str = "http://www.w3.org/2005/08/addressing";
/// Default WS-ReliableMessaging namespace; configurable per deployment.
pub const NS_RELIABLE: &str = "http://schemas.xmlsoap.org/ws/2005/02/rm";
/// WS-Security extension namespace (UsernameToken profile).
pub const NS_SECURITY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";

/// The SOAP protocol version of an envelope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SoapVersion {
    /// SOAP 1.1, the default for plain request/response services.
    #[default]
    V11,
    /// SOAP 1.2, required for WS-ReliableMessaging.
    V12,
}

impl SoapVersion {
    /// The envelope namespace of this version.
    pub fn envelope_namespace(&self) -> &'static str {
        match self {
            SoapVersion::V11 => NS_SOAP11_ENVELOPE,
            SoapVersion::V12 => NS_SOAP12_ENVELOPE,
        }
    }
}

/// A small element tree for envelope headers and bodies.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct XmlElement {
    /// Local name, prefix stripped.
    pub name: String,
    /// Attributes in document order, `xmlns` declarations included.
    pub attributes: Vec<(String, String)>,
    /// Concatenated character data directly inside this element.
    pub text: String,
    /// Child elements in document order.
    pub children: Vec<XmlElement>,
}

impl XmlElement {
    /// An empty element.
    pub fn new(name: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            ..Default::default()
        }
    }

    /// An element holding only character data.
    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        XmlElement {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    /// Appends a child and returns a mutable borrow of it.
    pub fn add_child(&mut self, child: XmlElement) -> &mut XmlElement {
        self.children.push(child);
        self.children.last_mut().unwrap()
    }

    /// Sets (or replaces) an attribute.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        if let Some(slot) = self.attributes.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value.into();
        } else {
            self.attributes.push((name, value.into()));
        }
    }

    /// Attribute value by exact name.
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Direct child by local name.
    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Depth-first search for a descendant (or self) by local name.
    pub fn find(&self, name: &str) -> Option<&XmlElement> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    /// Depth-first search for an element carrying `attribute == value`.
    pub fn find_by_attribute(&self, attribute: &str, value: &str) -> Option<&XmlElement> {
        if self.attribute(attribute) == Some(value) {
            return Some(self);
        }
        self.children
            .iter()
            .find_map(|c| c.find_by_attribute(attribute, value))
    }

    /// Canonical serialization used for signature digests.
    ///
    /// Attributes sorted by name, no insignificant whitespace, entities
    /// escaped. Stable across parse/serialize cycles.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        let mut attributes = self.attributes.clone();
        attributes.sort();
        for (name, value) in &attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_xml(value));
            out.push('"');
        }
        out.push('>');
        out.push_str(&escape_xml(self.text.trim()));
        for child in &self.children {
            child.write_canonical(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }

    fn write_xml(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (name, value) in &self.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_xml(value));
            out.push('"');
        }
        if self.text.is_empty() && self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        out.push_str(&escape_xml(&self.text));
        for child in &self.children {
            child.write_xml(out);
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// A SOAP fault, rendered into the body of a fault envelope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoapFault {
    /// Fault code (`Client`, `Server`).
    pub code: String,
    /// The acting party the fault points at.
    pub actor: String,
    /// Short fault string.
    pub string: String,
    /// Longer detail text.
    pub detail: String,
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}: {} ({})", self.code, self.actor, self.string, self.detail)
    }
}

/// Error produced by [`SoapMessage::parse`].
#[derive(Debug, thiserror::Error)]
pub enum SoapParseError {
    /// The byte stream is not well-formed XML.
    #[error("ill-formed XML: {0}")]
    IllFormed(String),
    /// The document is XML but not a SOAP envelope.
    #[error("not a SOAP envelope: {0}")]
    NotSoap(String),
}

/// The structured form of one SOAP envelope.
#[derive(Clone, Debug, PartialEq)]
pub struct SoapMessage {
    /// SOAP protocol version.
    pub version: SoapVersion,
    /// The message (service) namespace of the body content.
    pub namespace: String,
    /// SOAP action: the addressing action, or the first body element name.
    pub action: String,
    /// Body content elements (fault excluded).
    pub parameters: Vec<XmlElement>,
    /// The WS-Security header block, when present.
    pub security: Option<XmlElement>,
    /// Whether WS-Addressing headers are rendered on the wire.
    pub addressing: bool,
    /// Whether the reliable-messaging sequence blocks are rendered.
    pub reliability: bool,
    /// `Sequence/Identifier`: the sequence the sender writes into.
    pub client_sequence: String,
    /// `SequenceAcknowledgement/Identifier`: the acknowledged sequence.
    pub server_sequence: String,
    /// `Sequence/MessageNumber`.
    pub client_message_number: u64,
    /// `SequenceAcknowledgement/MessageNumber`.
    pub server_message_number: u64,
    /// Whether the `Sequence/LastMessage` marker is present.
    pub last_message: bool,
    /// The fault carried by the body, if any.
    pub fault: Option<SoapFault>,
    /// The URL the message arrived on (reflected into RM accept replies).
    pub url: String,
}

impl SoapMessage {
    /// A new request/response envelope.
    pub fn new(version: SoapVersion, namespace: impl Into<String>, action: impl Into<String>) -> Self {
        SoapMessage {
            version,
            namespace: namespace.into(),
            action: action.into(),
            parameters: Vec::new(),
            security: None,
            addressing: false,
            reliability: false,
            client_sequence: String::new(),
            server_sequence: String::new(),
            client_message_number: 0,
            server_message_number: 0,
            last_message: false,
            fault: None,
            url: String::new(),
        }
    }

    /// Clears body content and fault to turn the message into a reply.
    ///
    /// Version, namespaces, and sequence state survive the reset.
    pub fn reset(&mut self) {
        self.parameters.clear();
        self.fault = None;
    }

    /// Adds a body parameter, returning a mutable borrow for nesting.
    pub fn set_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> &mut XmlElement {
        self.parameters.push(XmlElement::with_text(name, value));
        self.parameters.last_mut().unwrap()
    }

    /// Text of a top-level body parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.text.as_str())
    }

    /// Depth-first search across body and security header.
    pub fn find_element(&self, name: &str) -> Option<&XmlElement> {
        self.parameters
            .iter()
            .find_map(|p| p.find(name))
            .or_else(|| self.security.as_ref().and_then(|s| s.find(name)))
    }

    /// Depth-first search for an element with `attribute == value`.
    pub fn find_by_attribute(&self, attribute: &str, value: &str) -> Option<&XmlElement> {
        self.parameters
            .iter()
            .find_map(|p| p.find_by_attribute(attribute, value))
    }

    /// Replaces the body with a fault; the reply becomes a fault envelope.
    pub fn set_fault(
        &mut self,
        code: impl Into<String>,
        actor: impl Into<String>,
        string: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.reset();
        self.fault = Some(SoapFault {
            code: code.into(),
            actor: actor.into(),
            string: string.into(),
            detail: detail.into(),
        });
    }

    /// Whether the body carries a fault.
    pub fn is_fault(&self) -> bool {
        self.fault.is_some()
    }

    /// Serializes the envelope to its wire text.
    pub fn to_xml(&self) -> String {
        let mut envelope = XmlElement::new("s:Envelope");
        envelope.set_attribute("xmlns:s", self.version.envelope_namespace());
        if self.addressing {
            envelope.set_attribute("xmlns:a", NS_ADDRESSING);
        }
        if self.reliability {
            envelope.set_attribute("xmlns:rm", NS_RELIABLE);
        }

        let mut header = XmlElement::new("s:Header");
        if self.addressing && !self.action.is_empty() {
            header.add_child(XmlElement::with_text(
                "a:Action",
                format!("{}/{}", self.namespace.trim_end_matches('/'), self.action),
            ));
        }
        if self.reliability {
            let sequence = header.add_child(XmlElement::new("rm:Sequence"));
            sequence.add_child(XmlElement::with_text("rm:Identifier", &self.client_sequence));
            sequence.add_child(XmlElement::with_text(
                "rm:MessageNumber",
                self.client_message_number.to_string(),
            ));
            if self.last_message {
                sequence.add_child(XmlElement::new("rm:LastMessage"));
            }
            if !self.server_sequence.is_empty() {
                let ack = header.add_child(XmlElement::new("rm:SequenceAcknowledgement"));
                ack.add_child(XmlElement::with_text("rm:Identifier", &self.server_sequence));
                ack.add_child(XmlElement::with_text(
                    "rm:MessageNumber",
                    self.server_message_number.to_string(),
                ));
            }
        }
        if let Some(security) = &self.security {
            let mut block = security.clone();
            block.set_attribute("xmlns:wsse", NS_SECURITY);
            header.add_child(block);
        }
        if !header.children.is_empty() {
            envelope.add_child(header);
        }

        let body = envelope.add_child(XmlElement::new("s:Body"));
        if let Some(fault) = &self.fault {
            let fault_el = body.add_child(XmlElement::new("s:Fault"));
            fault_el.add_child(XmlElement::with_text("faultcode", &fault.code));
            fault_el.add_child(XmlElement::with_text("faultactor", &fault.actor));
            fault_el.add_child(XmlElement::with_text("faultstring", &fault.string));
            fault_el.add_child(XmlElement::with_text("detail", &fault.detail));
        } else if !self.action.is_empty() {
            let action = body.add_child(XmlElement::new(self.action.clone()));
            if !self.namespace.is_empty() {
                action.set_attribute("xmlns", self.namespace.clone());
            }
            for parameter in &self.parameters {
                action.add_child(parameter.clone());
            }
        }

        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>");
        envelope.write_xml(&mut out);
        out
    }

    /// Parses envelope text into the structured form.
    pub fn parse(text: &str) -> Result<SoapMessage, SoapParseError> {
        let root = parse_document(text)?;
        if root.name != "Envelope" {
            return Err(SoapParseError::NotSoap(format!(
                "root element is <{}>",
                root.name
            )));
        }
        let version = envelope_version(&root)
            .ok_or_else(|| SoapParseError::NotSoap("unknown envelope namespace".to_owned()))?;

        let mut message = SoapMessage::new(version, "", "");

        if let Some(header) = root.child("Header") {
            if let Some(action) = header.child("Action") {
                let full = action.text.trim();
                message.action = full.rsplit('/').next().unwrap_or(full).to_owned();
                message.addressing = true;
            }
            if let Some(sequence) = header.child("Sequence") {
                message.reliability = true;
                if let Some(identifier) = sequence.child("Identifier") {
                    message.client_sequence = identifier.text.trim().to_owned();
                }
                if let Some(number) = sequence.child("MessageNumber") {
                    message.client_message_number = number.text.trim().parse().unwrap_or(0);
                }
                message.last_message = sequence.child("LastMessage").is_some();
            }
            if let Some(ack) = header.child("SequenceAcknowledgement") {
                if let Some(identifier) = ack.child("Identifier") {
                    message.server_sequence = identifier.text.trim().to_owned();
                }
                if let Some(number) = ack.child("MessageNumber") {
                    message.server_message_number = number.text.trim().parse().unwrap_or(0);
                }
            }
            if let Some(security) = header.child("Security") {
                message.security = Some(security.clone());
            }
        }

        let body = root
            .child("Body")
            .ok_or_else(|| SoapParseError::NotSoap("envelope has no Body".to_owned()))?;
        if let Some(fault) = body.child("Fault") {
            message.fault = Some(SoapFault {
                code: fault.child("faultcode").map(|e| e.text.trim().to_owned()).unwrap_or_default(),
                actor: fault.child("faultactor").map(|e| e.text.trim().to_owned()).unwrap_or_default(),
                string: fault.child("faultstring").map(|e| e.text.trim().to_owned()).unwrap_or_default(),
                detail: fault.child("detail").map(|e| e.text.trim().to_owned()).unwrap_or_default(),
            });
        } else if let Some(content) = body.children.first() {
            message.action = content.name.clone();
            message.namespace = element_namespace(content).unwrap_or_default();
            message.parameters = content.children.clone();
        }
        Ok(message)
    }
}

fn envelope_version(root: &XmlElement) -> Option<SoapVersion> {
    for (name, value) in &root.attributes {
        if name == "xmlns" || name.starts_with("xmlns:") {
            if value == NS_SOAP12_ENVELOPE {
                return Some(SoapVersion::V12);
            }
            if value == NS_SOAP11_ENVELOPE {
                return Some(SoapVersion::V11);
            }
        }
    }
    None
}

fn element_namespace(element: &XmlElement) -> Option<String> {
    element
        .attributes
        .iter()
        .find(|(name, _)| name == "xmlns" || name.starts_with("xmlns:"))
        .map(|(_, value)| value.clone())
}

fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let entity_len = rest.find(';').map(|p| p + 1).unwrap_or(1);
        match &rest[..entity_len] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            other => out.push_str(other),
        }
        rest = &rest[entity_len..];
    }
    out.push_str(rest);
    out
}

/// Parses one XML document into its root element.
///
/// This is deliberately a small scanner, not a general XML processor:
/// prologs, comments, entities, attributes, and nesting are handled;
/// DTDs, processing instructions, and CDATA are not.
fn parse_document(text: &str) -> Result<XmlElement, SoapParseError> {
    let mut scanner = Scanner {
        bytes: text.as_bytes(),
        pos: 0,
    };
    scanner.skip_prolog();
    let root = scanner.parse_element()?;
    Ok(root)
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn error(&self, what: &str) -> SoapParseError {
        SoapParseError::IllFormed(format!("{what} at byte {}", self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    fn skip_prolog(&mut self) {
        loop {
            self.skip_whitespace();
            if self.starts_with("<?") {
                match self.find_from("?>") {
                    Some(end) => self.pos = end + 2,
                    None => return,
                }
            } else if self.starts_with("<!--") {
                match self.find_from("-->") {
                    Some(end) => self.pos = end + 3,
                    None => return,
                }
            } else {
                return;
            }
        }
    }

    fn starts_with(&self, token: &str) -> bool {
        self.bytes[self.pos..].starts_with(token.as_bytes())
    }

    fn find_from(&self, token: &str) -> Option<usize> {
        let haystack = &self.bytes[self.pos..];
        haystack
            .windows(token.len())
            .position(|w| w == token.as_bytes())
            .map(|p| self.pos + p)
    }

    fn parse_name(&mut self) -> Result<String, SoapParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || matches!(b, b':' | b'_' | b'-' | b'.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.error("expected a name"));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_element(&mut self) -> Result<XmlElement, SoapParseError> {
        self.skip_whitespace();
        if self.peek() != Some(b'<') {
            return Err(self.error("expected '<'"));
        }
        self.pos += 1;
        let qualified = self.parse_name()?;
        let mut element = XmlElement::new(local_name(&qualified));

        // Attributes
        loop {
            self.skip_whitespace();
            match self.peek() {
                Some(b'/') => {
                    self.pos += 1;
                    if self.peek() != Some(b'>') {
                        return Err(self.error("expected '>' after '/'"));
                    }
                    self.pos += 1;
                    return Ok(element);
                }
                Some(b'>') => {
                    self.pos += 1;
                    break;
                }
                Some(_) => {
                    let attr_name = self.parse_name()?;
                    self.skip_whitespace();
                    if self.peek() != Some(b'=') {
                        return Err(self.error("expected '=' in attribute"));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = self.peek().ok_or_else(|| self.error("unterminated attribute"))?;
                    if quote != b'"' && quote != b'\'' {
                        return Err(self.error("expected a quoted attribute value"));
                    }
                    self.pos += 1;
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b != quote) {
                        self.pos += 1;
                    }
                    if self.peek() != Some(quote) {
                        return Err(self.error("unterminated attribute value"));
                    }
                    let value =
                        String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
                    self.pos += 1;
                    element.attributes.push((attr_name, unescape_xml(&value)));
                }
                None => return Err(self.error("unterminated start tag")),
            }
        }

        // Content: text and children until the matching close tag
        loop {
            if self.starts_with("<!--") {
                match self.find_from("-->") {
                    Some(end) => {
                        self.pos = end + 3;
                        continue;
                    }
                    None => return Err(self.error("unterminated comment")),
                }
            }
            if self.starts_with("</") {
                self.pos += 2;
                let closing = self.parse_name()?;
                if local_name(&closing) != element.name {
                    return Err(self.error("mismatched close tag"));
                }
                self.skip_whitespace();
                if self.peek() != Some(b'>') {
                    return Err(self.error("expected '>' in close tag"));
                }
                self.pos += 1;
                return Ok(element);
            }
            match self.peek() {
                Some(b'<') => {
                    let child = self.parse_element()?;
                    element.children.push(child);
                }
                Some(_) => {
                    let start = self.pos;
                    while self.peek().is_some_and(|b| b != b'<') {
                        self.pos += 1;
                    }
                    let text = String::from_utf8_lossy(&self.bytes[start..self.pos]);
                    let text = unescape_xml(&text);
                    element.text.push_str(text.trim());
                }
                None => return Err(self.error("unterminated element")),
            }
        }
    }
}

fn local_name(qualified: &str) -> &str {
    qualified.rsplit(':').next().unwrap_or(qualified)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_action_and_namespace() {
        let mut message = SoapMessage::new(SoapVersion::V12, "http://svc.example/calc", "Add");
        message.set_parameter("Left", "2");
        message.set_parameter("Right", "40");
        let xml = message.to_xml();

        let parsed = SoapMessage::parse(&xml).unwrap();
        assert_eq!(parsed.version, SoapVersion::V12);
        assert_eq!(parsed.action, "Add");
        assert_eq!(parsed.namespace, "http://svc.example/calc");
        assert_eq!(parsed.parameter("Left"), Some("2"));
        assert_eq!(parsed.parameter("Right"), Some("40"));
    }

    #[test]
    fn soap11_envelope_is_detected() {
        let xml = r#"<?xml version="1.0"?>
            <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
              <s:Body><Ping xmlns="urn:test"/></s:Body>
            </s:Envelope>"#;
        let parsed = SoapMessage::parse(xml).unwrap();
        assert_eq!(parsed.version, SoapVersion::V11);
        assert_eq!(parsed.action, "Ping");
    }

    #[test]
    fn reliability_headers_round_trip() {
        let mut message = SoapMessage::new(SoapVersion::V12, "urn:svc", "Work");
        message.reliability = true;
        message.addressing = true;
        message.client_sequence = "urn:uuid:S".to_owned();
        message.server_sequence = "urn:uuid:C".to_owned();
        message.client_message_number = 3;
        message.server_message_number = 2;
        message.last_message = true;

        let parsed = SoapMessage::parse(&message.to_xml()).unwrap();
        assert!(parsed.reliability);
        assert_eq!(parsed.client_sequence, "urn:uuid:S");
        assert_eq!(parsed.server_sequence, "urn:uuid:C");
        assert_eq!(parsed.client_message_number, 3);
        assert_eq!(parsed.server_message_number, 2);
        assert!(parsed.last_message);
    }

    #[test]
    fn fault_replaces_the_body() {
        let mut message = SoapMessage::new(SoapVersion::V12, "urn:svc", "Work");
        message.set_parameter("Input", "x");
        message.set_fault("Client", "Settings", "Must use WS-ReliableMessaging", "detail text");
        assert!(message.is_fault());
        assert!(message.parameters.is_empty());

        let parsed = SoapMessage::parse(&message.to_xml()).unwrap();
        let fault = parsed.fault.expect("fault body");
        assert_eq!(fault.code, "Client");
        assert_eq!(fault.string, "Must use WS-ReliableMessaging");
    }

    #[test]
    fn ill_formed_xml_is_rejected() {
        assert!(matches!(
            SoapMessage::parse("<s:Envelope><s:Body>"),
            Err(SoapParseError::IllFormed(_))
        ));
        assert!(matches!(
            SoapMessage::parse("<Other xmlns=\"urn:x\"/>"),
            Err(SoapParseError::NotSoap(_))
        ));
    }

    #[test]
    fn canonical_form_sorts_attributes_and_trims() {
        let mut element = XmlElement::with_text("Data", "  payload  ");
        element.set_attribute("b", "2");
        element.set_attribute("a", "1");
        assert_eq!(element.canonical(), "<Data a=\"1\" b=\"2\">payload</Data>");
    }

    #[test]
    fn find_by_attribute_locates_signed_parts() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
              <s:Body><Order xmlns="urn:shop"><Item Id="part-1">widget</Item></Order></s:Body>
            </s:Envelope>"#;
        let parsed = SoapMessage::parse(xml).unwrap();
        let item = parsed.find_by_attribute("Id", "part-1").unwrap();
        assert_eq!(item.text, "widget");
    }

    #[test]
    fn entities_are_unescaped() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope">
              <s:Body><Echo xmlns="urn:t"><Text>a &amp; b &lt;ok&gt;</Text></Echo></s:Body>
            </s:Envelope>"#;
        let parsed = SoapMessage::parse(xml).unwrap();
        assert_eq!(parsed.parameter("Text"), Some("a & b <ok>"));
    }
}
