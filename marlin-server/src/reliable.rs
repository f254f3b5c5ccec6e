//! The WS-ReliableMessaging session machine.
//!
//! Sessions are keyed by [`SessionAddress`] and live in the per-site
//! [`RmSessions`] registry; every transition runs under the registry lock,
//! so at most one mutation is in flight per session. Any fault destroys
//! the session: clients must start a new sequence after receiving one.

use std::collections::HashMap;

use marlin_types::{SessionAddress, SoapMessage};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::metrics::{METRICS_ID_RM_FAULTS, METRICS_ID_RM_SESSIONS_OPEN};
use crate::site::{ReliableType, Site};

/// One reliable-messaging session.
#[derive(Clone, Debug)]
pub struct RmSession {
    /// Server-chosen sequence nonce (`urn:uuid:<v4>`).
    pub server_nonce: String,
    /// Client-offered sequence nonce.
    pub client_nonce: String,
    /// Last accepted inbound message number; the next expected is one more.
    pub client_msg_id: u64,
    /// Last outbound message number.
    pub server_msg_id: u64,
    /// Whether the client has flagged its last message.
    pub last_message_seen: bool,
}

/// The session registry of one site.
#[derive(Default)]
pub struct RmSessions {
    sessions: Mutex<HashMap<SessionAddress, RmSession>>,
}

impl RmSessions {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn create(&self, address: &SessionAddress, client_nonce: String) -> RmSession {
        let session = RmSession {
            server_nonce: format!("urn:uuid:{}", Uuid::new_v4()),
            client_nonce,
            client_msg_id: 0,
            server_msg_id: 0,
            last_message_seen: false,
        };
        self.sessions.lock().insert(address.clone(), session.clone());
        metrics::gauge!(METRICS_ID_RM_SESSIONS_OPEN).increment(1);
        session
    }

    /// A snapshot of the session for `address`.
    pub fn find(&self, address: &SessionAddress) -> Option<RmSession> {
        self.sessions.lock().get(address).cloned()
    }

    fn remove(&self, address: &SessionAddress) {
        if self.sessions.lock().remove(address).is_some() {
            metrics::gauge!(METRICS_ID_RM_SESSIONS_OPEN).decrement(1);
        }
    }

    /// Destroys the session for `address`, if any.
    ///
    /// Exposed for the fault emitters: a reliability fault always ends
    /// the session it concerns.
    pub fn remove_address(&self, address: &SessionAddress) {
        self.remove(address);
    }

    /// Destroys every session; used during shutdown.
    pub fn clear(&self) {
        let mut sessions = self.sessions.lock();
        metrics::gauge!(METRICS_ID_RM_SESSIONS_OPEN).decrement(sessions.len() as f64);
        sessions.clear();
    }

    /// Number of open sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is open.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// What the pipeline should do after the reliability check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RmOutcome {
    /// The message now holds the reply (RM control response or fault);
    /// send it without calling the user handler.
    Handled,
    /// A validated normal message, decorated with the mirrored sequence
    /// state; hand it to the user handler.
    Continue,
}

/// Runs the reliability protocol for one inbound envelope.
///
/// The caller has already verified SOAP 1.2 and well-formedness. On
/// return the message either carries the protocol reply ([`RmOutcome::Handled`])
/// or is cleared for the handler ([`RmOutcome::Continue`]).
pub fn reliable_check(
    site: &Site,
    rm_namespace: &str,
    address: &SessionAddress,
    message: &mut SoapMessage,
) -> RmOutcome {
    let sessions = &site.rm_sessions;

    if message.namespace == rm_namespace {
        if site.reliable == ReliableType::None {
            return fault(
                sessions,
                address,
                message,
                "Settings",
                "Must not use WS-ReliableMessaging",
                "Encountered a SOAP/XML request using the WS-ReliableMessaging protocol. \
                 Review your settings!",
            );
        }
        if site.reliable_login && address.user_sid.is_empty() {
            return fault(
                sessions,
                address,
                message,
                "User",
                "Not logged with a user/password combination",
                "User should login with a user/password combination to make use of a \
                 reliable webservice connection",
            );
        }
        return match message.action.as_str() {
            "CreateSequence" => handle_create_sequence(sessions, address, message),
            "LastMessage" => handle_last_message(sessions, address, message),
            "TerminateSequence" => handle_terminate_sequence(sessions, address, message),
            other => {
                let detail = format!(
                    "Encountered a WS-ReliableMessaging request that is unknown to the server: {other}"
                );
                fault(
                    sessions,
                    address,
                    message,
                    "Client program",
                    "Unknown WS-ReliableMessaging request",
                    &detail,
                )
            }
        };
    }

    // An application message at a reliability-required site must carry
    // the sequence headers
    if !message.reliability {
        return fault(
            sessions,
            address,
            message,
            "Settings",
            "Must use WS-ReliableMessaging",
            "Encountered a SOAP/XML request without using the WS-ReliableMessaging \
             protocol. Review your settings!",
        );
    }
    handle_message(sessions, address, message)
}

/// Validates a normal in-sequence message and advances the session.
fn handle_message(
    sessions: &RmSessions,
    address: &SessionAddress,
    message: &mut SoapMessage,
) -> RmOutcome {
    let mut map = sessions.sessions.lock();
    let Some(session) = map.get_mut(address) else {
        drop(map);
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "No RM sequence found",
            "No reliable-messaging protocol with 'CreateSequence' found for this \
             connection yet. Review your program logic.",
        );
    };

    if !message.client_sequence.eq_ignore_ascii_case(&session.server_nonce) {
        drop(map);
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "Wrong RM sequence found",
            "Client sent a wrong server sequence nonce in the reliable-messaging \
             protocol. Review your program logic.",
        );
    }
    if !message.server_sequence.is_empty()
        && !message.server_sequence.eq_ignore_ascii_case(&session.client_nonce)
    {
        drop(map);
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "Wrong RM sequence found",
            "Client sent a wrong client sequence nonce in the reliable-messaging \
             protocol. Review your program logic.",
        );
    }
    if message.client_message_number != session.client_msg_id + 1 {
        drop(map);
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "RM message out of sequence",
            "The message number skips or repeats within the sequence. Review your \
             program logic.",
        );
    }
    session.client_msg_id += 1;
    session.server_msg_id += 1;
    let session = session.clone();
    drop(map);

    decorate_reply(&session, message);
    RmOutcome::Continue
}

fn handle_create_sequence(
    sessions: &RmSessions,
    address: &SessionAddress,
    message: &mut SoapMessage,
) -> RmOutcome {
    if sessions.find(address).is_some() {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "Already a RM sequence",
            "Program requested a new RM-sequence, but a sequence for this session \
             already exists. Review your program logic.",
        );
    }

    // The client must offer a nonce for the reply sequence
    let offered = message
        .find_element("Offer")
        .and_then(|offer| offer.child("Identifier"))
        .map(|identifier| identifier.text.trim().to_owned())
        .unwrap_or_default();
    if offered.is_empty() {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "No ReliableMessage nonce",
            "Program requested a new RM-sequence, but did not offer a client nonce \
             (GUID). Review your program logic.",
        );
    }

    let session = sessions.create(address, offered);
    let url = message.url.clone();

    message.reset();
    message.action = "CreateSequenceResponse".to_owned();
    message.set_parameter("Identifier", &session.server_nonce);
    let accept = message.set_parameter("Accept", "");
    accept.add_child(marlin_types::XmlElement::with_text("Address", url));
    decorate_reply(&session, message);
    RmOutcome::Handled
}

fn handle_last_message(
    sessions: &RmSessions,
    address: &SessionAddress,
    message: &mut SoapMessage,
) -> RmOutcome {
    let Some(session) = sessions.find(address) else {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "No RM sequence",
            "Program flagged a last-message in a RM-sequence, but the sequence \
             doesn't exist. Review your program logic.",
        );
    };
    if session.last_message_seen {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "LastMessage already passed",
            "Program has sent the 'LastMessage' more than once. Review your program logic.",
        );
    }
    if let RmOutcome::Handled = handle_message(sessions, address, message) {
        // The sequence checks faulted; the fault is already in place
        return RmOutcome::Handled;
    }
    let mut map = sessions.sessions.lock();
    if let Some(session) = map.get_mut(address) {
        session.last_message_seen = true;
    }
    drop(map);

    message.reset();
    RmOutcome::Handled
}

fn handle_terminate_sequence(
    sessions: &RmSessions,
    address: &SessionAddress,
    message: &mut SoapMessage,
) -> RmOutcome {
    let Some(session) = sessions.find(address) else {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "No RM sequence",
            "Program flagged a 'TerminateSequence' in a RM-sequence, but the sequence \
             doesn't exist. Review your program logic.",
        );
    };
    if !session.last_message_seen {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "No LastMessage before TerminateSequence",
            "Encountered a 'TerminateSequence' of the RM protocol, but no 'LastMessage' \
             has passed.",
        );
    }
    let identifier = message.parameter("Identifier").unwrap_or_default().to_owned();
    if !identifier.eq_ignore_ascii_case(&session.server_nonce) {
        return fault(
            sessions,
            address,
            message,
            "Client program",
            "TerminateSequence for wrong sequence",
            "Encountered a 'TerminateSequence' of the RM protocol, but for a different \
             client. Review your settings.",
        );
    }

    message.reset();
    message.set_parameter("Identifier", &session.client_nonce);
    let mut session = session;
    session.server_msg_id += 1;
    decorate_reply(&session, message);

    // The acknowledged end of the sequence
    sessions.remove(address);
    RmOutcome::Handled
}

/// Mirrors the session state into an outgoing reply.
///
/// The server writes into the client-offered sequence and acknowledges
/// its own; the message nonce stays empty because the server responds
/// rather than originates.
fn decorate_reply(session: &RmSession, message: &mut SoapMessage) {
    message.reliability = true;
    message.addressing = true;
    message.client_sequence = session.client_nonce.clone();
    message.server_sequence = session.server_nonce.clone();
    message.client_message_number = session.server_msg_id;
    message.server_message_number = session.client_msg_id;
    message.last_message = false;
}

/// Emits a reliability fault and destroys the session.
fn fault(
    sessions: &RmSessions,
    address: &SessionAddress,
    message: &mut SoapMessage,
    actor: &str,
    string: &str,
    detail: &str,
) -> RmOutcome {
    sessions.remove(address);
    metrics::counter!(METRICS_ID_RM_FAULTS).increment(1);
    tracing::warn!("RM fault for {}: {string}", address.abs_path);
    message.set_fault("Client", actor, string, detail);
    RmOutcome::Handled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteBuilder;
    use marlin_types::{SoapVersion, XmlElement};

    const RM_NS: &str = marlin_types::soap::NS_RELIABLE;
    const APP_NS: &str = "urn:example:app";

    fn reliable_site() -> Site {
        SiteBuilder::new(80, "/svc/")
            .reliable(ReliableType::Once)
            .build()
            .unwrap()
            .0
    }

    fn address() -> SessionAddress {
        SessionAddress::new("S-1-5-21", 0, "127.0.0.1:4000".parse().unwrap(), "/svc/")
    }

    fn create_sequence_message(offer: &str) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, RM_NS, "CreateSequence");
        message.url = "http://localhost:80/svc/".to_owned();
        let mut offer_element = XmlElement::new("Offer");
        offer_element.add_child(XmlElement::with_text("Identifier", offer));
        message.parameters.push(offer_element);
        message
    }

    fn normal_message(server_nonce: &str, client_nonce: &str, number: u64) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V12, APP_NS, "DoWork");
        message.reliability = true;
        message.client_sequence = server_nonce.to_owned();
        message.server_sequence = client_nonce.to_owned();
        message.client_message_number = number;
        message
    }

    fn open_session(site: &Site) -> RmSession {
        let mut create = create_sequence_message("urn:uuid:C");
        assert_eq!(
            reliable_check(site, RM_NS, &address(), &mut create),
            RmOutcome::Handled
        );
        assert!(!create.is_fault());
        site.rm_sessions.find(&address()).expect("session exists")
    }

    #[test]
    fn create_sequence_opens_a_session_and_accepts_the_url() {
        let site = reliable_site();
        let mut create = create_sequence_message("urn:uuid:C");
        reliable_check(&site, RM_NS, &address(), &mut create);

        let session = site.rm_sessions.find(&address()).unwrap();
        assert!(session.server_nonce.starts_with("urn:uuid:"));
        assert_eq!(session.client_nonce, "urn:uuid:C");
        assert_eq!(create.action, "CreateSequenceResponse");
        assert_eq!(create.parameter("Identifier"), Some(session.server_nonce.as_str()));
        let accept = create.find_element("Accept").unwrap();
        assert_eq!(
            accept.child("Address").map(|a| a.text.as_str()),
            Some("http://localhost:80/svc/")
        );
        assert!(create.addressing);
    }

    #[test]
    fn create_sequence_twice_faults_and_destroys() {
        let site = reliable_site();
        open_session(&site);
        let mut again = create_sequence_message("urn:uuid:C2");
        reliable_check(&site, RM_NS, &address(), &mut again);
        assert!(again.is_fault());
        assert_eq!(again.fault.as_ref().unwrap().string, "Already a RM sequence");
        assert!(site.rm_sessions.is_empty());
    }

    #[test]
    fn create_sequence_without_offer_faults() {
        let site = reliable_site();
        let mut create = SoapMessage::new(SoapVersion::V12, RM_NS, "CreateSequence");
        reliable_check(&site, RM_NS, &address(), &mut create);
        assert_eq!(
            create.fault.as_ref().unwrap().string,
            "No ReliableMessage nonce"
        );
    }

    #[test]
    fn happy_path_mirrors_sequences_and_counts() {
        let site = reliable_site();
        let session = open_session(&site);

        // (b) first normal message
        let mut work = normal_message(&session.server_nonce, &session.client_nonce, 1);
        assert_eq!(
            reliable_check(&site, RM_NS, &address(), &mut work),
            RmOutcome::Continue
        );
        assert_eq!(work.client_sequence, "urn:uuid:C");
        assert_eq!(work.server_sequence, session.server_nonce);
        assert_eq!(work.client_message_number, 1);
        assert_eq!(work.server_message_number, 1);

        // (c) last message
        let mut last = SoapMessage::new(SoapVersion::V12, RM_NS, "LastMessage");
        last.reliability = true;
        last.client_sequence = session.server_nonce.clone();
        last.client_message_number = 2;
        assert_eq!(
            reliable_check(&site, RM_NS, &address(), &mut last),
            RmOutcome::Handled
        );
        assert!(!last.is_fault());
        assert!(site.rm_sessions.find(&address()).unwrap().last_message_seen);

        // (d) terminate with the server identifier, answered with the client's
        let mut terminate = SoapMessage::new(SoapVersion::V12, RM_NS, "TerminateSequence");
        terminate.set_parameter("Identifier", &session.server_nonce);
        assert_eq!(
            reliable_check(&site, RM_NS, &address(), &mut terminate),
            RmOutcome::Handled
        );
        assert!(!terminate.is_fault());
        assert_eq!(terminate.parameter("Identifier"), Some("urn:uuid:C"));
        assert!(site.rm_sessions.is_empty());
    }

    #[test]
    fn out_of_sequence_faults_and_later_messages_find_no_session() {
        let site = reliable_site();
        let session = open_session(&site);

        // Skip message number 1
        let mut skipped = normal_message(&session.server_nonce, &session.client_nonce, 2);
        assert_eq!(
            reliable_check(&site, RM_NS, &address(), &mut skipped),
            RmOutcome::Handled
        );
        assert_eq!(
            skipped.fault.as_ref().unwrap().string,
            "RM message out of sequence"
        );
        assert!(site.rm_sessions.is_empty());

        let mut next = normal_message(&session.server_nonce, &session.client_nonce, 1);
        reliable_check(&site, RM_NS, &address(), &mut next);
        assert_eq!(next.fault.as_ref().unwrap().string, "No RM sequence found");
    }

    #[test]
    fn wrong_nonces_fault() {
        let site = reliable_site();
        let session = open_session(&site);
        let mut wrong = normal_message("urn:uuid:other", &session.client_nonce, 1);
        reliable_check(&site, RM_NS, &address(), &mut wrong);
        assert_eq!(wrong.fault.as_ref().unwrap().string, "Wrong RM sequence found");
    }

    #[test]
    fn last_message_twice_faults() {
        let site = reliable_site();
        let session = open_session(&site);
        for expected_fault in [false, true] {
            let mut last = SoapMessage::new(SoapVersion::V12, RM_NS, "LastMessage");
            last.reliability = true;
            last.client_sequence = session.server_nonce.clone();
            last.client_message_number = 1;
            reliable_check(&site, RM_NS, &address(), &mut last);
            assert_eq!(last.is_fault(), expected_fault);
        }
    }

    #[test]
    fn terminate_before_last_message_faults() {
        let site = reliable_site();
        let session = open_session(&site);
        let mut terminate = SoapMessage::new(SoapVersion::V12, RM_NS, "TerminateSequence");
        terminate.set_parameter("Identifier", &session.server_nonce);
        reliable_check(&site, RM_NS, &address(), &mut terminate);
        assert_eq!(
            terminate.fault.as_ref().unwrap().string,
            "No LastMessage before TerminateSequence"
        );
    }

    #[test]
    fn rm_traffic_at_a_plain_site_faults() {
        let site = SiteBuilder::new(80, "/plain/").build().unwrap().0;
        let mut create = create_sequence_message("urn:uuid:C");
        reliable_check(&site, RM_NS, &address(), &mut create);
        assert_eq!(
            create.fault.as_ref().unwrap().string,
            "Must not use WS-ReliableMessaging"
        );
    }

    #[test]
    fn plain_traffic_at_a_reliable_site_faults() {
        let site = reliable_site();
        let mut plain = SoapMessage::new(SoapVersion::V12, APP_NS, "DoWork");
        reliable_check(&site, RM_NS, &address(), &mut plain);
        assert_eq!(
            plain.fault.as_ref().unwrap().string,
            "Must use WS-ReliableMessaging"
        );
    }

    #[test]
    fn reliable_login_requires_a_user() {
        let site = SiteBuilder::new(80, "/svc/")
            .reliable(ReliableType::Once)
            .reliable_login(true)
            .build()
            .unwrap()
            .0;
        let anonymous = SessionAddress::new("", 0, "127.0.0.1:4000".parse().unwrap(), "/svc/");
        let mut create = create_sequence_message("urn:uuid:C");
        reliable_check(&site, RM_NS, &anonymous, &mut create);
        assert_eq!(
            create.fault.as_ref().unwrap().string,
            "Not logged with a user/password combination"
        );
    }
}
