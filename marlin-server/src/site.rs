//! Sites: configured endpoints with handlers, filters, and policy.
//!
//! A site owns one handler per verb and an ordered filter chain, plus the
//! policy knobs that drive the pipeline: authentication, encryption
//! level, reliability, CORS, automatic security headers, compression,
//! throttling, cookies, and error pages. Sub-sites reference their main
//! site by registry index and inherit nothing implicitly; they are full
//! sites whose path extends the parent's.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use marlin_types::{HttpCookie, SameSite, SessionAddress, Verb};
use parking_lot::{Mutex, RwLock};
use secrecy::SecretString;

use crate::config::{CachePolicy, ConfigError, parse_bool};
use crate::error::ServerError;
use crate::pipeline::Exchange;
use crate::registry::SiteId;
use crate::reliable::RmSessions;

/// Throttle maps larger than this get a cleanup pass.
pub const MAX_HTTP_THROTTLES: usize = 1000;

/// XML encryption level of a site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EncryptionLevel {
    /// No message security.
    #[default]
    Plain,
    /// XML-DSIG body signing.
    Signing,
    /// Encrypted SOAP body.
    Body,
    /// Fully encrypted envelope.
    Message,
}

impl EncryptionLevel {
    /// Parses the `Encryption.Level` configuration value.
    pub fn parse(value: &str) -> Option<EncryptionLevel> {
        match value.to_ascii_lowercase().as_str() {
            "plain" => Some(EncryptionLevel::Plain),
            "sign" | "signing" => Some(EncryptionLevel::Signing),
            "body" => Some(EncryptionLevel::Body),
            "message" => Some(EncryptionLevel::Message),
            _ => None,
        }
    }
}

/// Reliability mode of a site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReliableType {
    /// Reliable messaging not required.
    #[default]
    None,
    /// At-most-once delivery.
    AtMostOnce,
    /// Exactly-once delivery.
    Once,
    /// At-least-once delivery.
    AtLeastOnce,
    /// Addressing-only mode. Not supported; rejected at build time.
    Addressing,
}

/// Authentication scheme configured on a site.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum AuthScheme {
    #[default]
    Anonymous,
    Basic,
    Digest,
    Ntlm,
    Negotiate,
    Kerberos,
}

impl AuthScheme {
    /// Parses the `Authentication.Scheme` configuration value.
    pub fn parse(value: &str) -> Option<AuthScheme> {
        match value.to_ascii_lowercase().as_str() {
            "anonymous" => Some(AuthScheme::Anonymous),
            "basic" => Some(AuthScheme::Basic),
            "digest" => Some(AuthScheme::Digest),
            "ntlm" => Some(AuthScheme::Ntlm),
            "negotiate" => Some(AuthScheme::Negotiate),
            "kerberos" => Some(AuthScheme::Kerberos),
            _ => None,
        }
    }
}

/// Authentication settings of a site.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// The scheme clients must present.
    pub scheme: AuthScheme,
    /// Realm for the WWW-Authenticate challenge.
    pub realm: String,
    /// Domain for the challenge.
    pub domain: String,
    /// Cache NTLM handshakes.
    pub ntlm_cache: bool,
}

/// `X-Frame-Options` policy.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum XFrameOption {
    /// Header not sent.
    #[default]
    NotSet,
    /// `DENY`.
    Deny,
    /// `SAMEORIGIN`.
    SameOrigin,
    /// `ALLOW-FROM <uri>`.
    AllowFrom(String),
}

/// The automatic security response headers of a site.
#[derive(Clone, Debug, Default)]
pub struct AutoHeaders {
    /// `X-Frame-Options` policy.
    pub x_frame: XFrameOption,
    /// `Strict-Transport-Security: max-age=N` when set.
    pub hsts_max_age: Option<u64>,
    /// Append `includeSubDomains` to the HSTS header.
    pub hsts_sub_domains: bool,
    /// `X-Content-Type-Options: nosniff`.
    pub no_sniff: bool,
    /// `X-XSS-Protection: 1`.
    pub xss_protection: bool,
    /// Append `mode=block` to the XSS header.
    pub xss_block: bool,
    /// The cache-blocking header triplet.
    pub no_cache_control: bool,
    /// `Access-Control-Allow-Origin` value; `*` admits all origins.
    pub allow_origin: Option<String>,
    /// Whether the CORS origin check runs at all.
    pub use_cors: bool,
}

/// Site-wide cookie attribute defaults.
///
/// Any attribute a cookie leaves unset inherits from here when the
/// response is assembled.
#[derive(Clone, Debug, Default)]
pub struct CookieDefaults {
    /// Default `Secure`.
    pub secure: Option<bool>,
    /// Default `HttpOnly`.
    pub http_only: Option<bool>,
    /// Default `SameSite`.
    pub same_site: Option<SameSite>,
    /// Default `Path`.
    pub path: Option<String>,
    /// Default `Domain`.
    pub domain: Option<String>,
    /// Default `Max-Age`.
    pub max_age: Option<i64>,
    /// Cookie lifetime in minutes used to compute `Expires`.
    pub expires_minutes: Option<i64>,
}

/// Outcome of one site filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterOutcome {
    /// Pass the request on to the next filter or the handler.
    Continue,
    /// The filter answered the request; stop the chain.
    Handled,
}

/// A request handler bound to one verb of a site.
pub trait SiteHandler: Send + Sync {
    /// Handles one request.
    fn handle(&self, exchange: &mut Exchange<'_>) -> Result<(), ServerError>;
}

impl<F> SiteHandler for F
where
    F: Fn(&mut Exchange<'_>) -> Result<(), ServerError> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange<'_>) -> Result<(), ServerError> {
        self(exchange)
    }
}

/// A filter running before the handler, in ascending priority order.
pub trait SiteFilter: Send + Sync {
    /// Inspects or mutates the request; may answer it and short-circuit.
    fn filter(&self, exchange: &mut Exchange<'_>) -> Result<FilterOutcome, ServerError>;
}

impl<F> SiteFilter for F
where
    F: Fn(&mut Exchange<'_>) -> Result<FilterOutcome, ServerError> + Send + Sync,
{
    fn filter(&self, exchange: &mut Exchange<'_>) -> Result<FilterOutcome, ServerError> {
        self(exchange)
    }
}

const DEFAULT_CLIENT_ERROR_PAGE: &str = "<html><head><title>Error</title></head>\
<body><h1>{status} {reason}</h1><p>The request could not be served.</p></body></html>";
const DEFAULT_SERVER_ERROR_PAGE: &str = "<html><head><title>Server error</title></head>\
<body><h1>{status} {reason}</h1><p>The server could not process the request.</p></body></html>";

/// One configured endpoint: port + base path + handlers + policy.
pub struct Site {
    /// Listening port.
    pub port: u16,
    /// Base path as registered (original casing).
    pub base_path: String,
    /// Absolute URL prefix of this site.
    pub prefix_url: String,
    /// Main site index when this is a sub-site.
    pub main_site: Option<SiteId>,
    /// Webroot override; the server webroot applies when `None`.
    pub webroot: Option<PathBuf>,
    /// Authentication settings.
    pub auth: AuthConfig,
    /// XML encryption level.
    pub encryption_level: EncryptionLevel,
    /// Site-wide encryption/signing password.
    pub encryption_password: SecretString,
    /// Answer 200 immediately and keep processing in the background.
    pub async_site: bool,
    /// Reliability mode; anything but `None` requires RM envelopes.
    pub reliable: ReliableType,
    /// Require an authenticated user for reliable messaging.
    pub reliable_login: bool,
    /// GET requests open server push event streams.
    pub is_event_stream: bool,
    /// Allow `X-HTTP-Method` verb rewriting on POST.
    pub verb_tunneling: bool,
    /// Gzip responses when the client accepts it.
    pub http_compression: bool,
    /// Serialize requests per session address.
    pub throttling: bool,
    /// Automatic response headers.
    pub auto_headers: AutoHeaders,
    /// HTTP cache policy for every response of this site.
    pub cache_policy: CachePolicy,
    /// Cookie attribute defaults.
    pub cookie_defaults: CookieDefaults,
    /// Respond in UTF-16.
    pub respond_unicode: bool,
    /// Prefix SOAP replies with a BOM.
    pub respond_soap_bom: bool,
    /// Prefix JSON replies with a BOM.
    pub respond_json_bom: bool,
    /// Freshness window for UsernameToken `Created` stamps.
    pub security_freshness: Duration,
    /// Expected passwords for the UsernameToken profile.
    pub token_users: HashMap<String, SecretString>,
    /// 4xx error page template with `{status}`/`{reason}` placeholders.
    pub client_error_page: String,
    /// 5xx error page template with `{status}`/`{reason}` placeholders.
    pub server_error_page: String,

    handlers: RwLock<HashMap<Verb, Arc<dyn SiteHandler>>>,
    filters: RwLock<BTreeMap<u32, Arc<dyn SiteFilter>>>,
    content_types: RwLock<HashMap<String, String>>,
    /// Reliable-messaging sessions of this site.
    pub rm_sessions: RmSessions,
    throttles: Mutex<HashMap<SessionAddress, Arc<Mutex<()>>>>,
}

impl Site {
    /// The registry key of this site.
    pub fn site_key(&self) -> String {
        crate::registry::make_site_key(self.port, &self.base_path)
    }

    /// The handler for a verb.
    pub fn handler(&self, verb: Verb) -> Option<Arc<dyn SiteHandler>> {
        self.handlers.read().get(&verb).cloned()
    }

    /// Sets (or replaces) the handler for a verb.
    pub fn set_handler(&self, verb: Verb, handler: Arc<dyn SiteHandler>) {
        self.handlers.write().insert(verb, handler);
    }

    /// The verbs with registered handlers, for the `Allow:` header.
    pub fn allow_list(&self) -> String {
        let handlers = self.handlers.read();
        let mut verbs: Vec<&str> = Verb::all()
            .iter()
            .filter(|verb| handlers.contains_key(*verb))
            .map(Verb::as_str)
            .collect();
        if !verbs.contains(&"OPTIONS") {
            verbs.push("OPTIONS");
        }
        verbs.join(", ")
    }

    /// Sets a filter at `priority`; fails when the slot is taken.
    pub fn set_filter(&self, priority: u32, filter: Arc<dyn SiteFilter>) -> bool {
        let mut filters = self.filters.write();
        if filters.contains_key(&priority) {
            tracing::error!("filter priority {priority} already in use on {}", self.prefix_url);
            return false;
        }
        filters.insert(priority, filter);
        true
    }

    /// Removes the filter at `priority`.
    pub fn remove_filter(&self, priority: u32) -> bool {
        self.filters.write().remove(&priority).is_some()
    }

    /// A snapshot of the filter chain in ascending priority order.
    pub fn filter_chain(&self) -> Vec<Arc<dyn SiteFilter>> {
        self.filters.read().values().cloned().collect()
    }

    /// Registers a content type for a file extension.
    pub fn add_content_type(&self, extension: &str, content_type: &str) {
        self.content_types
            .write()
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), content_type.to_owned());
    }

    /// Content type for a resource name, by extension.
    pub fn content_type_for(&self, resource: &str) -> Option<String> {
        let extension = resource.rsplit('.').next()?.to_ascii_lowercase();
        self.content_types.read().get(&extension).cloned()
    }

    /// The per-address throttle lock, created on first use.
    ///
    /// Callers lock the returned mutex for the duration of the pipeline;
    /// the path member of the address is ignored for throttling.
    pub fn throttle_for(&self, address: &SessionAddress) -> Arc<Mutex<()>> {
        let key = address.without_path();
        let mut throttles = self.throttles.lock();
        Arc::clone(throttles.entry(key).or_default())
    }

    /// Purges idle throttle locks once the map exceeds its cap.
    pub fn flush_throttles(&self) {
        let mut throttles = self.throttles.lock();
        if throttles.len() <= MAX_HTTP_THROTTLES {
            return;
        }
        throttles.retain(|_, lock| lock.try_lock().is_none());
    }

    /// Number of throttle entries (test support).
    pub fn throttle_count(&self) -> usize {
        self.throttles.lock().len()
    }

    /// Renders the error page for `status`.
    pub fn error_page(&self, status: u16, reason: &str) -> String {
        let template = if status >= 500 {
            &self.server_error_page
        } else {
            &self.client_error_page
        };
        template
            .replace("{status}", &status.to_string())
            .replace("{reason}", reason)
    }

    /// Applies cookie attribute defaults and computes `Expires`.
    pub fn finish_cookie(&self, cookie: &mut HttpCookie) {
        let defaults = &self.cookie_defaults;
        cookie.secure = cookie.secure.or(defaults.secure);
        cookie.http_only = cookie.http_only.or(defaults.http_only);
        cookie.same_site = cookie.same_site.or(defaults.same_site);
        if cookie.path.is_none() {
            cookie.path = defaults.path.clone();
        }
        if cookie.domain.is_none() {
            cookie.domain = defaults.domain.clone();
        }
        cookie.max_age = cookie.max_age.or(defaults.max_age);
        if cookie.expires.is_none() {
            if let Some(minutes) = defaults.expires_minutes {
                cookie.expires = Some(chrono::Utc::now() + chrono::Duration::minutes(minutes));
            }
        }
    }
}

/// Builder for a [`Site`].
pub struct SiteBuilder {
    site: Site,
    parent: Option<(u16, String)>,
}

impl SiteBuilder {
    /// Starts a site on `port` under `base_path`.
    pub fn new(port: u16, base_path: impl Into<String>) -> Self {
        let base_path = base_path.into();
        SiteBuilder {
            site: Site {
                port,
                prefix_url: format!("http://+:{port}{base_path}"),
                base_path,
                main_site: None,
                webroot: None,
                auth: AuthConfig::default(),
                encryption_level: EncryptionLevel::Plain,
                encryption_password: SecretString::from(String::new()),
                async_site: false,
                reliable: ReliableType::None,
                reliable_login: false,
                is_event_stream: false,
                verb_tunneling: false,
                http_compression: false,
                throttling: false,
                auto_headers: AutoHeaders::default(),
                cache_policy: CachePolicy::Nocache,
                cookie_defaults: CookieDefaults::default(),
                respond_unicode: false,
                respond_soap_bom: false,
                respond_json_bom: false,
                security_freshness: crate::security::DEFAULT_FRESHNESS,
                token_users: HashMap::new(),
                client_error_page: DEFAULT_CLIENT_ERROR_PAGE.to_owned(),
                server_error_page: DEFAULT_SERVER_ERROR_PAGE.to_owned(),
                handlers: RwLock::new(HashMap::new()),
                filters: RwLock::new(BTreeMap::new()),
                content_types: RwLock::new(default_content_types()),
                rm_sessions: RmSessions::new(),
                throttles: Mutex::new(HashMap::new()),
            },
            parent: None,
        }
    }

    /// Declares this site a sub-site of `parent_path` on the same port.
    pub fn sub_site_of(mut self, parent_path: impl Into<String>) -> Self {
        self.parent = Some((self.site.port, parent_path.into()));
        self
    }

    /// Sets the handler for a verb.
    pub fn handler(self, verb: Verb, handler: impl SiteHandler + 'static) -> Self {
        self.site.handlers.write().insert(verb, Arc::new(handler));
        self
    }

    /// Adds a filter at `priority`.
    pub fn filter(self, priority: u32, filter: impl SiteFilter + 'static) -> Self {
        self.site.filters.write().insert(priority, Arc::new(filter));
        self
    }

    /// Overrides the webroot for this site.
    pub fn webroot(mut self, webroot: impl Into<PathBuf>) -> Self {
        self.site.webroot = Some(webroot.into());
        self
    }

    /// Marks the site asynchronous: 200 first, processing after.
    pub fn async_site(mut self, on: bool) -> Self {
        self.site.async_site = on;
        self
    }

    /// Sets the reliability mode.
    pub fn reliable(mut self, mode: ReliableType) -> Self {
        self.site.reliable = mode;
        self
    }

    /// Requires a logged-in user for reliable messaging.
    pub fn reliable_login(mut self, on: bool) -> Self {
        self.site.reliable_login = on;
        self
    }

    /// Marks the site as a push event stream endpoint.
    pub fn event_stream(mut self, on: bool) -> Self {
        self.site.is_event_stream = on;
        self
    }

    /// Enables verb tunneling on POST.
    pub fn verb_tunneling(mut self, on: bool) -> Self {
        self.site.verb_tunneling = on;
        self
    }

    /// Enables gzip compression.
    pub fn http_compression(mut self, on: bool) -> Self {
        self.site.http_compression = on;
        self
    }

    /// Enables per-address throttling.
    pub fn throttling(mut self, on: bool) -> Self {
        self.site.throttling = on;
        self
    }

    /// Sets the encryption level and password.
    pub fn encryption(mut self, level: EncryptionLevel, password: impl Into<String>) -> Self {
        self.site.encryption_level = level;
        self.site.encryption_password = SecretString::from(password.into());
        self
    }

    /// Sets the authentication settings.
    pub fn auth(mut self, auth: AuthConfig) -> Self {
        self.site.auth = auth;
        self
    }

    /// Sets the automatic header block.
    pub fn auto_headers(mut self, headers: AutoHeaders) -> Self {
        self.site.auto_headers = headers;
        self
    }

    /// Sets the site cache policy.
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.site.cache_policy = policy;
        self
    }

    /// Sets the cookie attribute defaults.
    pub fn cookie_defaults(mut self, defaults: CookieDefaults) -> Self {
        self.site.cookie_defaults = defaults;
        self
    }

    /// Registers an expected UsernameToken credential.
    pub fn token_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.site
            .token_users
            .insert(username.into(), SecretString::from(password.into()));
        self
    }

    /// Overrides the error page templates.
    pub fn error_pages(mut self, client: impl Into<String>, server: impl Into<String>) -> Self {
        self.site.client_error_page = client.into();
        self.site.server_error_page = server.into();
        self
    }

    /// Applies one dotted configuration key from the site table.
    pub fn apply_setting(mut self, key: &str, value: &str) -> Result<Self, ConfigError> {
        let bad = |key: &str, value: &str| ConfigError::BadValue {
            key: key.to_owned(),
            value: value.to_owned(),
        };
        let site = &mut self.site;
        match key {
            "Server.WebRoot" => site.webroot = Some(PathBuf::from(value)),
            "Server.Reliable" => {
                site.reliable = if parse_bool(value).ok_or_else(|| bad(key, value))? {
                    ReliableType::Once
                } else {
                    ReliableType::None
                };
            }
            "Server.VerbTunneling" => {
                site.verb_tunneling = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Server.HTTPCompression" => {
                site.http_compression = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Server.HTTPThrotteling" => {
                site.throttling = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Server.RespondUnicode" => {
                site.respond_unicode = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Server.RespondSoapBOM" => {
                site.respond_soap_bom = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Server.RespondJsonBOM" => {
                site.respond_json_bom = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Encryption.Level" => {
                site.encryption_level =
                    EncryptionLevel::parse(value).ok_or_else(|| bad(key, value))?;
            }
            "Encryption.Password" => {
                site.encryption_password = SecretString::from(value.to_owned());
            }
            "Authentication.Scheme" => {
                site.auth.scheme = AuthScheme::parse(value).ok_or_else(|| bad(key, value))?;
            }
            "Authentication.NTLMCache" => {
                site.auth.ntlm_cache = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Authentication.Realm" => site.auth.realm = value.to_owned(),
            "Authentication.Domain" => site.auth.domain = value.to_owned(),
            "Security.XFrameOption" => {
                site.auto_headers.x_frame = match value.to_ascii_uppercase().as_str() {
                    "DENY" => XFrameOption::Deny,
                    "SAMEORIGIN" => XFrameOption::SameOrigin,
                    "ALLOW-FROM" => XFrameOption::AllowFrom(String::new()),
                    _ => return Err(bad(key, value)),
                };
            }
            "Security.XFrameAllowed" => {
                site.auto_headers.x_frame = XFrameOption::AllowFrom(value.to_owned());
            }
            "Security.CORS" => {
                site.auto_headers.use_cors = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Security.CORS_AllowOrigin" => {
                site.auto_headers.allow_origin = Some(value.to_owned());
            }
            "Security.HSTSMaxAge" => {
                site.auto_headers.hsts_max_age = Some(value.parse().map_err(|_| bad(key, value))?);
            }
            "Security.HSTSSubDomains" => {
                site.auto_headers.hsts_sub_domains =
                    parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Security.ContentNoSniff" => {
                site.auto_headers.no_sniff = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Security.XSSProtection" => {
                site.auto_headers.xss_protection =
                    parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Security.XSSBlockMode" => {
                site.auto_headers.xss_block = parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            "Security.NoCacheControl" => {
                site.auto_headers.no_cache_control =
                    parse_bool(value).ok_or_else(|| bad(key, value))?;
            }
            other => return Err(ConfigError::UnknownKey(other.to_owned())),
        }
        Ok(self)
    }

    /// Finishes the site.
    ///
    /// The `Addressing` reliability mode is not supported and yields a
    /// configuration error.
    pub fn build(self) -> Result<(Site, Option<(u16, String)>), ConfigError> {
        if self.site.reliable == ReliableType::Addressing {
            return Err(ConfigError::BadValue {
                key: "Server.Reliable".to_owned(),
                value: "Addressing mode is unsupported".to_owned(),
            });
        }
        Ok((self.site, self.parent))
    }
}

fn default_content_types() -> HashMap<String, String> {
    let mut table = HashMap::new();
    for (extension, content_type) in [
        ("html", "text/html"),
        ("htm", "text/html"),
        ("css", "text/css"),
        ("js", "application/javascript"),
        ("json", "application/json"),
        ("xml", "text/xml"),
        ("txt", "text/plain"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("gif", "image/gif"),
        ("ico", "image/x-icon"),
        ("pdf", "application/pdf"),
    ] {
        table.insert(extension.to_owned(), content_type.to_owned());
    }
    table
}
