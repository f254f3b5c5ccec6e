//! Reliable-messaging sessions driven over real HTTP connections.

use marlin_server::site::{ReliableType, SiteBuilder};
use marlin_server::{Exchange, ServerError, SiteHandler};
use marlin_test_utils::{TestServer, rm};
use marlin_types::Verb;

const APP_NS: &str = "urn:example:orders";

/// Echo service: answers every validated reliable message with `Echo`.
struct EchoService;

impl SiteHandler for EchoService {
    fn handle(&self, exchange: &mut Exchange<'_>) -> Result<(), ServerError> {
        let mut reply = exchange.soap.take().expect("reliable sites always carry SOAP");
        reply.reset();
        reply.set_parameter("Echo", "ok");
        exchange.send_soap(&reply);
        Ok(())
    }
}

fn reliable_server() -> eyre::Result<TestServer> {
    TestServer::spawn_site(|port| {
        SiteBuilder::new(port, "/orders/")
            .reliable(ReliableType::Once)
            .handler(Verb::Post, EchoService)
    })
}

#[test]
fn full_session_walks_the_happy_path() -> eyre::Result<()> {
    let server = reliable_server()?;
    let mut client = server.client()?;
    let client_nonce = rm::client_nonce();

    // (a) CreateSequence: the server picks a nonce and accepts our URL
    let response = client.post_soap("/orders/", &rm::create_sequence(&client_nonce))?;
    assert!(!response.is_fault(), "unexpected fault: {:?}", response.fault);
    let server_nonce = response.parameter("Identifier").expect("Identifier").to_owned();
    assert!(server_nonce.starts_with("urn:uuid:"));
    let accept = response.find_element("Accept").expect("Accept block");
    assert!(
        accept.child("Address").map(|a| a.text.contains("/orders/")) == Some(true),
        "Accept.Address should reflect the request URL"
    );

    // (b) first normal message: ids mirrored, counters at one
    let work = rm::message(APP_NS, "PlaceOrder", &server_nonce, &client_nonce, 1);
    let response = client.post_soap("/orders/", &work)?;
    assert!(!response.is_fault());
    assert_eq!(response.parameter("Echo"), Some("ok"));
    assert_eq!(response.client_sequence, client_nonce);
    assert_eq!(response.server_sequence, server_nonce);
    assert_eq!(response.client_message_number, 1);
    assert_eq!(response.server_message_number, 1);

    // (c) LastMessage is accepted exactly once
    let response = client.post_soap("/orders/", &rm::last_message(&server_nonce, 2))?;
    assert!(!response.is_fault());

    // (d) TerminateSequence answers with our nonce and ends the session
    let response = client.post_soap("/orders/", &rm::terminate_sequence(&server_nonce))?;
    assert!(!response.is_fault());
    assert_eq!(response.parameter("Identifier"), Some(client_nonce.as_str()));

    let site = server.server.find_site(server.port, "/orders/").unwrap();
    assert!(site.rm_sessions.is_empty());
    Ok(())
}

#[test]
fn out_of_sequence_faults_and_destroys_the_session() -> eyre::Result<()> {
    let server = reliable_server()?;
    let mut client = server.client()?;
    let client_nonce = rm::client_nonce();

    let response = client.post_soap("/orders/", &rm::create_sequence(&client_nonce))?;
    let server_nonce = response.parameter("Identifier").unwrap().to_owned();

    // Skip message number one
    let skipped = rm::message(APP_NS, "PlaceOrder", &server_nonce, &client_nonce, 2);
    let response = client.post_soap("/orders/", &skipped)?;
    let fault = response.fault.expect("out-of-sequence fault");
    assert_eq!(fault.code, "Client");
    assert_eq!(fault.string, "RM message out of sequence");

    // The session is gone; the correct number now finds no sequence
    let retry = rm::message(APP_NS, "PlaceOrder", &server_nonce, &client_nonce, 1);
    let response = client.post_soap("/orders/", &retry)?;
    assert_eq!(
        response.fault.expect("no-session fault").string,
        "No RM sequence found"
    );
    Ok(())
}

#[test]
fn soap_11_envelopes_are_refused_on_reliable_sites() -> eyre::Result<()> {
    let server = reliable_server()?;
    let mut client = server.client()?;

    let mut message = marlin_types::SoapMessage::new(
        marlin_types::SoapVersion::V11,
        APP_NS,
        "PlaceOrder",
    );
    message.reliability = true;
    message.client_message_number = 1;
    let response = client.post_soap("/orders/", &message)?;
    assert_eq!(response.fault.expect("version fault").string, "Must use SOAP 1.2");
    Ok(())
}

#[test]
fn non_xml_bodies_fault_as_not_soap() -> eyre::Result<()> {
    let server = reliable_server()?;
    let mut client = server.client()?;
    let response = client.request(
        "POST",
        "/orders/",
        &[("Content-Type", "application/soap+xml")],
        b"this is not xml at all",
    )?;
    let envelope = response.soap()?;
    assert_eq!(
        envelope.fault.expect("not-xml fault").string,
        "Not a valid SOAP/XML message"
    );
    Ok(())
}
