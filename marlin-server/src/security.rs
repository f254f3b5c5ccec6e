//! The WS-Security request validator.
//!
//! Three message security levels are checked here: XML-DSIG body signing,
//! encrypted bodies, and fully encrypted envelopes. Signing digests are
//! HMACs keyed with the site password (SHA-1 by default, overridable via
//! `DigestMethod/@Algorithm`); encryption is AES-256-GCM under a key
//! derived from the site password. The separate UsernameToken profile
//! validates `(username, password)` pairs with a freshness-checked
//! `PasswordDigest` and yields the authenticated principal.

use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use marlin_types::{SoapMessage, XmlElement};
use rand::RngCore;
use secrecy::ExposeSecret;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::site::{EncryptionLevel, Site};

/// Default UsernameToken freshness window.
pub const DEFAULT_FRESHNESS: Duration = Duration::from_secs(300);
/// Smallest accepted freshness window.
pub const FRESHNESS_MIN: Duration = Duration::from_secs(60);
/// Largest accepted freshness window.
pub const FRESHNESS_MAX: Duration = Duration::from_secs(3600);

/// Clamps a configured freshness window into its accepted range.
pub fn clamp_freshness(window: Duration) -> Duration {
    window.clamp(FRESHNESS_MIN, FRESHNESS_MAX)
}

/// A failed security check, reported to the client as a
/// `Client / Configuration` SOAP fault.
#[derive(Debug, thiserror::Error)]
#[error("{string}: {detail}")]
pub struct SecurityFault {
    /// Short fault string.
    pub string: String,
    /// Longer detail text.
    pub detail: String,
}

impl SecurityFault {
    fn new(string: &str, detail: impl Into<String>) -> Self {
        SecurityFault {
            string: string.to_owned(),
            detail: detail.into(),
        }
    }
}

/// Unwraps and validates one request body at the site's security level.
///
/// Returns the (possibly decrypted and re-parsed) message the handler
/// should see. Only called when the site level is not `Plain`.
pub fn unwrap_and_validate(site: &Site, raw_body: &[u8]) -> Result<SoapMessage, SecurityFault> {
    match site.encryption_level {
        EncryptionLevel::Plain => unreachable!("validator runs on secured sites only"),
        EncryptionLevel::Signing => {
            let message = parse_at_level(site, raw_body, EncryptionLevel::Signing)?;
            check_body_signing(site, &message)?;
            Ok(message)
        }
        EncryptionLevel::Body => {
            let mut message = parse_at_level(site, raw_body, EncryptionLevel::Body)?;
            decrypt_body(site, &mut message)?;
            Ok(message)
        }
        EncryptionLevel::Message => decrypt_message(site, raw_body),
    }
}

/// Parses the body and verifies the message carries the site's level.
fn parse_at_level(
    site: &Site,
    raw_body: &[u8],
    level: EncryptionLevel,
) -> Result<SoapMessage, SecurityFault> {
    let text = std::str::from_utf8(raw_body)
        .map_err(|_| SecurityFault::new("Same security level", "Request body is not text"))?;
    let message = SoapMessage::parse(text).map_err(|error| {
        SecurityFault::new(
            "Same security level",
            format!("Request body is not a SOAP envelope: {error}"),
        )
    })?;
    if detect_level(&message) != level {
        return Err(SecurityFault::new(
            "Same security level",
            "Client and server should have the same security level \
             (signing, body-encryption or message-encryption).",
        ));
    }
    Ok(message)
}

/// The security level a parsed envelope presents.
fn detect_level(message: &SoapMessage) -> EncryptionLevel {
    if let Some(security) = &message.security {
        if security
            .child("Password")
            .is_some_and(|password| !password.text.is_empty())
            && message.action.is_empty()
        {
            return EncryptionLevel::Body;
        }
        if security.find("SignatureValue").is_some() {
            return EncryptionLevel::Signing;
        }
    }
    EncryptionLevel::Plain
}

/// Verifies the XML-DSIG body signing of a message.
///
/// The signed part is located through `Reference/@URI`; when that leads
/// nowhere the Body content is digested instead.
fn check_body_signing(site: &Site, message: &SoapMessage) -> Result<(), SecurityFault> {
    let no_signing = || {
        SecurityFault::new(
            "No signing",
            "SOAP message should have a signed body. Signing is incorrect or missing.",
        )
    };

    let signature = message
        .find_element("SignatureValue")
        .map(|element| element.text.trim().to_owned())
        .filter(|signature| !signature.is_empty())
        .ok_or_else(no_signing)?;

    // Digest method rides in the fragment of the algorithm URI
    let method = message
        .find_element("DigestMethod")
        .and_then(|element| element.attribute("Algorithm"))
        .map(|algorithm| match algorithm.rsplit_once('#') {
            Some((_, fragment)) => fragment.to_owned(),
            None => algorithm.to_owned(),
        })
        .unwrap_or_else(|| "sha1".to_owned());

    let signed_xml = message
        .find_element("Reference")
        .and_then(|reference| reference.attribute("URI"))
        .map(|uri| uri.trim_start_matches('#'))
        .and_then(|id| message.find_by_attribute("Id", id))
        .map(XmlElement::canonical)
        .unwrap_or_else(|| body_canonical(message));

    let password = site.encryption_password.expose_secret();
    let digest = digest_with_password(&method, password, &signed_xml)?;
    if digest.eq_ignore_ascii_case(&signature) {
        Ok(())
    } else {
        tracing::warn!("body signature mismatch (method {method})");
        Err(no_signing())
    }
}

/// The canonical form of the body content, the signing fallback target.
pub fn body_canonical(message: &SoapMessage) -> String {
    let mut body = XmlElement::new(message.action.clone());
    if !message.namespace.is_empty() {
        body.set_attribute("xmlns", message.namespace.clone());
    }
    for parameter in &message.parameters {
        body.children.push(parameter.clone());
    }
    body.canonical()
}

/// Decrypts an encrypted-body message in place and re-parses the body.
fn decrypt_body(site: &Site, message: &mut SoapMessage) -> Result<(), SecurityFault> {
    let no_encryption = |detail: String| SecurityFault::new("No encryption", detail);

    let ciphertext = message
        .security
        .as_ref()
        .and_then(|security| security.child("Password"))
        .map(|password| password.text.trim().to_owned())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| no_encryption("Message carries no encrypted body".to_owned()))?;

    let password = site.encryption_password.expose_secret().to_owned();
    let plaintext = decrypt_with_password(&password, &ciphertext)?;

    if plaintext.is_empty() {
        // An empty command is legal: nothing to re-parse
        message.security = None;
        message.action.clear();
        message.parameters.clear();
        return Ok(());
    }

    let envelope = format!(
        "<s:Envelope xmlns:s=\"{}\"><s:Body>{}</s:Body></s:Envelope>",
        message.version.envelope_namespace(),
        String::from_utf8(plaintext)
            .map_err(|_| no_encryption("Decrypted body is not UTF-8".to_owned()))?
    );
    let inner = SoapMessage::parse(&envelope)
        .map_err(|error| no_encryption(format!("Decrypted body does not parse: {error}")))?;

    message.action = inner.action;
    message.namespace = inner.namespace;
    message.parameters = inner.parameters;
    message.security = None;
    Ok(())
}

/// Decrypts a fully encrypted envelope.
fn decrypt_message(site: &Site, raw_body: &[u8]) -> Result<SoapMessage, SecurityFault> {
    let no_encryption = |detail: String| SecurityFault::new("No encryption", detail);

    let text = std::str::from_utf8(raw_body)
        .map_err(|_| no_encryption("Request body is not text".to_owned()))?;
    let compact: String = text.split_whitespace().collect();
    if compact.starts_with('<') {
        return Err(SecurityFault::new(
            "Same security level",
            "Expected a fully encrypted envelope, got plain XML.",
        ));
    }

    let password = site.encryption_password.expose_secret().to_owned();
    let plaintext = decrypt_with_password(&password, &compact)?;
    let envelope = String::from_utf8(plaintext)
        .map_err(|_| no_encryption("Decrypted envelope is not UTF-8".to_owned()))?;
    SoapMessage::parse(&envelope)
        .map_err(|error| no_encryption(format!("Decrypted envelope does not parse: {error}")))
}

/// Base64 HMAC digest of `payload` keyed with the site password.
pub fn digest_with_password(
    method: &str,
    password: &str,
    payload: &str,
) -> Result<String, SecurityFault> {
    let digest = match method.to_ascii_lowercase().as_str() {
        "sha1" | "rsa-sha1" | "hmac-sha1" => {
            let mut mac = <Hmac<Sha1> as hmac::Mac>::new_from_slice(password.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(payload.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        "sha256" | "rsa-sha256" | "hmac-sha256" => {
            let mut mac = <Hmac<Sha256> as hmac::Mac>::new_from_slice(password.as_bytes())
                .expect("HMAC accepts any key length");
            mac.update(payload.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        other => {
            return Err(SecurityFault::new(
                "No signing",
                format!("Unsupported digest method: {other}"),
            ));
        }
    };
    Ok(BASE64.encode(digest))
}

fn derive_key(password: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.finalize().into()
}

/// Encrypts `plaintext` under the site password.
///
/// Wire form: base64 of `nonce (12 bytes) || AES-256-GCM ciphertext`.
pub fn encrypt_with_password(password: &str, plaintext: &[u8]) -> String {
    let cipher = Aes256Gcm::new(&derive_key(password).into());
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .expect("AES-GCM encryption cannot fail for in-memory data");
    let mut blob = nonce.to_vec();
    blob.extend_from_slice(&ciphertext);
    BASE64.encode(blob)
}

/// Reverses [`encrypt_with_password`].
pub fn decrypt_with_password(password: &str, encoded: &str) -> Result<Vec<u8>, SecurityFault> {
    let bad = || {
        SecurityFault::new(
            "No encryption",
            "Message could not be decrypted with the site password.",
        )
    };
    let blob = BASE64.decode(encoded.trim()).map_err(|_| bad())?;
    if blob.len() < 12 {
        return Err(bad());
    }
    let (nonce, ciphertext) = blob.split_at(12);
    let cipher = Aes256Gcm::new(&derive_key(password).into());
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| bad())
}

/// Validates the UsernameToken profile of a message, when present.
///
/// Returns the authenticated principal on success and `Ok(None)` when no
/// token rides in the security header. The password is accepted either
/// in plaintext or as `base64(SHA1(nonce + created + password))` with the
/// `PasswordDigest` type, in which case `Created` must fall inside the
/// site's freshness window.
pub fn validate_username_token(
    site: &Site,
    message: &SoapMessage,
) -> Result<Option<String>, SecurityFault> {
    let Some(token) = message
        .security
        .as_ref()
        .and_then(|security| security.find("UsernameToken"))
    else {
        return Ok(None);
    };

    let rejected = || SecurityFault::new("Access denied", "Unknown user or wrong password.");

    let username = token
        .child("Username")
        .map(|element| element.text.trim().to_owned())
        .filter(|name| !name.is_empty())
        .ok_or_else(rejected)?;
    let password_element = token.child("Password").ok_or_else(rejected)?;
    let presented = password_element.text.trim();
    let expected = site.token_users.get(&username).ok_or_else(rejected)?;
    let expected = expected.expose_secret();

    let nonce = token.child("Nonce").map(|element| element.text.trim().to_owned());
    let created = token.child("Created").map(|element| element.text.trim().to_owned());
    let is_digest = password_element
        .attribute("Type")
        .is_some_and(|kind| kind.contains("PasswordDigest"))
        || (nonce.is_some() && created.is_some());

    if is_digest {
        let (Some(nonce), Some(created)) = (nonce, created) else {
            return Err(rejected());
        };
        let stamp = DateTime::parse_from_rfc3339(&created)
            .map(|stamp| stamp.with_timezone(&Utc))
            .map_err(|_| rejected())?;
        let age = (Utc::now() - stamp).abs();
        let window = clamp_freshness(site.security_freshness);
        if age.num_seconds() as u64 > window.as_secs() {
            tracing::warn!("UsernameToken for {username} outside the freshness window");
            return Err(SecurityFault::new(
                "Access denied",
                "Security token is no longer fresh.",
            ));
        }

        let raw_nonce = BASE64.decode(&nonce).map_err(|_| rejected())?;
        let mut hasher = Sha1::new();
        hasher.update(&raw_nonce);
        hasher.update(created.as_bytes());
        hasher.update(expected.as_bytes());
        let should_be = BASE64.encode(hasher.finalize());
        if should_be != presented {
            return Err(rejected());
        }
    } else if presented != expected {
        return Err(rejected());
    }

    Ok(Some(username))
}

/// Builds the digest form of a UsernameToken password (client support).
pub fn username_token_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::SiteBuilder;
    use marlin_types::SoapVersion;

    const PASSWORD: &str = "site-secret";

    fn secured_site(level: EncryptionLevel) -> Site {
        SiteBuilder::new(80, "/secure/")
            .encryption(level, PASSWORD)
            .token_user("marlin", "word-fish")
            .build()
            .unwrap()
            .0
    }

    fn signed_envelope(tamper: bool) -> String {
        let mut message = SoapMessage::new(SoapVersion::V12, "urn:svc", "Order");
        message.set_parameter("Item", "widget");
        let signed = body_canonical(&message);
        let digest = digest_with_password("sha1", PASSWORD, &signed).unwrap();

        let mut security = XmlElement::new("Security");
        let signature = security.add_child(XmlElement::new("Signature"));
        let info = signature.add_child(XmlElement::new("SignedInfo"));
        let mut method = XmlElement::new("DigestMethod");
        method.set_attribute("Algorithm", "http://www.w3.org/2000/09/xmldsig#sha1");
        info.children.push(method);
        signature.add_child(XmlElement::with_text(
            "SignatureValue",
            if tamper { "bogus".to_owned() } else { digest },
        ));
        message.security = Some(security);
        message.to_xml()
    }

    #[test]
    fn valid_signing_passes_and_tampering_fails() {
        let site = secured_site(EncryptionLevel::Signing);
        let good = signed_envelope(false);
        let message = unwrap_and_validate(&site, good.as_bytes()).unwrap();
        assert_eq!(message.parameter("Item"), Some("widget"));

        let bad = signed_envelope(true);
        let fault = unwrap_and_validate(&site, bad.as_bytes()).unwrap_err();
        assert_eq!(fault.string, "No signing");
    }

    #[test]
    fn encryption_round_trips() {
        let wire = encrypt_with_password(PASSWORD, b"secret payload");
        assert_eq!(
            decrypt_with_password(PASSWORD, &wire).unwrap(),
            b"secret payload"
        );
        assert!(decrypt_with_password("wrong", &wire).is_err());
    }

    #[test]
    fn encrypted_body_is_unwrapped() {
        let site = secured_site(EncryptionLevel::Body);
        let inner = "<Order xmlns=\"urn:svc\"><Item>widget</Item></Order>";
        let ciphertext = encrypt_with_password(PASSWORD, inner.as_bytes());

        let mut message = SoapMessage::new(SoapVersion::V12, "", "");
        let mut security = XmlElement::new("Security");
        security.add_child(XmlElement::with_text("Password", ciphertext));
        message.security = Some(security);
        let wire = message.to_xml();

        let unwrapped = unwrap_and_validate(&site, wire.as_bytes()).unwrap();
        assert_eq!(unwrapped.action, "Order");
        assert_eq!(unwrapped.parameter("Item"), Some("widget"));
        assert!(unwrapped.security.is_none());
    }

    #[test]
    fn encrypted_message_is_unwrapped() {
        let site = secured_site(EncryptionLevel::Message);
        let mut inner = SoapMessage::new(SoapVersion::V12, "urn:svc", "Order");
        inner.set_parameter("Item", "widget");
        let wire = encrypt_with_password(PASSWORD, inner.to_xml().as_bytes());

        let unwrapped = unwrap_and_validate(&site, wire.as_bytes()).unwrap();
        assert_eq!(unwrapped.action, "Order");
    }

    #[test]
    fn plain_xml_at_an_encrypting_site_is_a_level_mismatch() {
        let site = secured_site(EncryptionLevel::Message);
        let mut plain = SoapMessage::new(SoapVersion::V12, "urn:svc", "Order");
        plain.set_parameter("Item", "widget");
        let fault = unwrap_and_validate(&site, plain.to_xml().as_bytes()).unwrap_err();
        assert_eq!(fault.string, "Same security level");
    }

    #[test]
    fn wrong_password_fails_decryption() {
        let site = secured_site(EncryptionLevel::Message);
        let wire = encrypt_with_password("other-password", b"<x/>");
        let fault = unwrap_and_validate(&site, wire.as_bytes()).unwrap_err();
        assert_eq!(fault.string, "No encryption");
    }

    fn token_message(username: &str, password: XmlElement, extra: Vec<XmlElement>) -> SoapMessage {
        let mut message = SoapMessage::new(SoapVersion::V11, "urn:svc", "Ping");
        let mut security = XmlElement::new("Security");
        let token = security.add_child(XmlElement::new("UsernameToken"));
        token.add_child(XmlElement::with_text("Username", username));
        token.children.push(password);
        for element in extra {
            token.children.push(element);
        }
        message.security = Some(security);
        message
    }

    #[test]
    fn plaintext_token_validates() {
        let site = secured_site(EncryptionLevel::Signing);
        let message = token_message(
            "marlin",
            XmlElement::with_text("Password", "word-fish"),
            Vec::new(),
        );
        assert_eq!(
            validate_username_token(&site, &message).unwrap().as_deref(),
            Some("marlin")
        );

        let wrong = token_message(
            "marlin",
            XmlElement::with_text("Password", "word-shark"),
            Vec::new(),
        );
        assert!(validate_username_token(&site, &wrong).is_err());
    }

    #[test]
    fn digest_token_validates_and_stale_created_is_rejected() {
        let site = secured_site(EncryptionLevel::Signing);
        let nonce = b"0123456789abcdef";

        let fresh = Utc::now().to_rfc3339();
        let digest = username_token_digest(nonce, &fresh, "word-fish");
        let mut password = XmlElement::with_text("Password", digest);
        password.set_attribute("Type", "#PasswordDigest");
        let message = token_message(
            "marlin",
            password,
            vec![
                XmlElement::with_text("Nonce", BASE64.encode(nonce)),
                XmlElement::with_text("Created", &fresh),
            ],
        );
        assert_eq!(
            validate_username_token(&site, &message).unwrap().as_deref(),
            Some("marlin")
        );

        let stale = (Utc::now() - chrono::Duration::hours(2)).to_rfc3339();
        let digest = username_token_digest(nonce, &stale, "word-fish");
        let mut password = XmlElement::with_text("Password", digest);
        password.set_attribute("Type", "#PasswordDigest");
        let message = token_message(
            "marlin",
            password,
            vec![
                XmlElement::with_text("Nonce", BASE64.encode(nonce)),
                XmlElement::with_text("Created", &stale),
            ],
        );
        let fault = validate_username_token(&site, &message).unwrap_err();
        assert!(fault.detail.contains("fresh"));
    }

    #[test]
    fn absent_token_is_not_an_error() {
        let site = secured_site(EncryptionLevel::Signing);
        let message = SoapMessage::new(SoapVersion::V11, "urn:svc", "Ping");
        assert!(validate_username_token(&site, &message).unwrap().is_none());
    }

    #[test]
    fn freshness_is_clamped() {
        assert_eq!(clamp_freshness(Duration::from_secs(1)), FRESHNESS_MIN);
        assert_eq!(clamp_freshness(Duration::from_secs(86400)), FRESHNESS_MAX);
        assert_eq!(
            clamp_freshness(Duration::from_secs(600)),
            Duration::from_secs(600)
        );
    }
}
