//! Outbound relay over SMTP.

use async_trait::async_trait;
use lettre::message::{MultiPart, SinglePart, header::ContentType};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::{info, warn};

use super::email_types::ParsedMessage;
use crate::config::RelayConfig;
use crate::error::RelayError;

/// Body of a forwarded message. Always has at least one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundBody {
    Plain(String),
    Html(String),
    /// `multipart/alternative` with the HTML part preferred.
    Alternative { text: String, html: String },
}

/// A message ready to hand to a [`Relay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub subject: String,
    pub body: OutboundBody,
}

impl OutboundMessage {
    /// The plain-text rendition, if the message carries one.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            OutboundBody::Plain(text) | OutboundBody::Alternative { text, .. } => Some(text),
            OutboundBody::Html(_) => None,
        }
    }

    pub fn html(&self) -> Option<&str> {
        match &self.body {
            OutboundBody::Html(html) | OutboundBody::Alternative { html, .. } => Some(html),
            OutboundBody::Plain(_) => None,
        }
    }
}

/// Tag the subject with `marker` and carry over the body.
pub fn compose_forward(message: &ParsedMessage, marker: &str) -> OutboundMessage {
    let body = match (message.body_text.is_empty(), message.body_html.is_empty()) {
        (false, false) => OutboundBody::Alternative {
            text: message.body_text.clone(),
            html: message.body_html.clone(),
        },
        (true, false) => OutboundBody::Html(message.body_html.clone()),
        (false, true) => OutboundBody::Plain(message.body_text.clone()),
        (true, true) => OutboundBody::Plain(String::new()),
    };

    OutboundMessage {
        subject: format!("{marker} {}", message.subject),
        body,
    }
}

/// Something that delivers forwarded mail.
#[async_trait]
pub trait Relay: Send + Sync {
    async fn send(&self, message: &OutboundMessage) -> Result<(), RelayError>;

    /// Connect and authenticate without sending anything.
    async fn test_connection(&self) -> Result<(), RelayError>;
}

/// SMTP relay: implicit TLS first, STARTTLS on the submission port as fallback.
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    config: RelayConfig,
}

impl SmtpRelay {
    pub fn new(config: RelayConfig) -> Self {
        Self { config }
    }

    fn build_message(&self, outbound: &OutboundMessage) -> Result<Message, RelayError> {
        let builder = Message::builder()
            .from(
                self.config
                    .from_address
                    .parse()
                    .map_err(|e| RelayError::Build(format!("Invalid from address: {e}")))?,
            )
            .to(self
                .config
                .destination
                .parse()
                .map_err(|e| RelayError::Build(format!("Invalid to address: {e}")))?)
            .subject(outbound.subject.clone());

        let built = match &outbound.body {
            OutboundBody::Plain(text) => builder.header(ContentType::TEXT_PLAIN).body(text.clone()),
            OutboundBody::Html(html) => builder.header(ContentType::TEXT_HTML).body(html.clone()),
            OutboundBody::Alternative { text, html } => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            ),
        };
        built.map_err(|e| RelayError::Build(e.to_string()))
    }

    fn transport(config: &RelayConfig, mode: TlsMode) -> Result<SmtpTransport, RelayError> {
        let port = mode.port(config);
        let builder = match mode {
            TlsMode::Implicit => SmtpTransport::relay(&config.host),
            TlsMode::StartTls => SmtpTransport::starttls_relay(&config.host),
        }
        .map_err(|e| RelayError::Connect {
            host: config.host.clone(),
            port,
            reason: format!("SMTP relay error: {e}"),
        })?;

        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        Ok(builder.port(port).credentials(creds).build())
    }

    /// Open, authenticate and close one connection in `mode`. Blocking.
    fn probe(config: &RelayConfig, mode: TlsMode) -> Attempt {
        let transport = match Self::transport(config, mode) {
            Ok(transport) => transport,
            Err(e) => return Attempt::Rejected(e),
        };
        match transport.test_connection() {
            Ok(true) => Attempt::Ready,
            Ok(false) => Attempt::Unreachable("server did not accept the connection".to_string()),
            Err(e) if e.status().is_some() || e.is_response() => {
                Attempt::Rejected(classify(e, config, mode.port(config)))
            }
            Err(e) => Attempt::Unreachable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsMode {
    Implicit,
    StartTls,
}

impl TlsMode {
    fn port(self, config: &RelayConfig) -> u16 {
        match self {
            Self::Implicit => config.port,
            Self::StartTls => config.starttls_port,
        }
    }
}

/// Outcome of a connection check.
#[derive(Debug)]
enum Attempt {
    Ready,
    /// No SMTP conversation took place.
    Unreachable(String),
    /// The server answered and refused.
    Rejected(RelayError),
}

/// Pick implicit TLS, or STARTTLS when implicit TLS is unreachable, then run
/// `deliver` exactly once on the chosen mode. Errors from `deliver` are never
/// retried on the other mode.
fn relay_once<T>(
    config: &RelayConfig,
    probe: impl Fn(TlsMode) -> Attempt,
    deliver: impl FnOnce(TlsMode) -> Result<T, RelayError>,
) -> Result<T, RelayError> {
    let mode = match probe(TlsMode::Implicit) {
        Attempt::Ready => TlsMode::Implicit,
        Attempt::Rejected(e) => return Err(e),
        Attempt::Unreachable(reason) => {
            warn!(
                host = %config.host,
                port = config.port,
                "Implicit TLS connection failed, falling back to STARTTLS on {}: {reason}",
                config.starttls_port
            );
            match probe(TlsMode::StartTls) {
                Attempt::Ready => TlsMode::StartTls,
                Attempt::Rejected(e) => return Err(e),
                Attempt::Unreachable(reason) => {
                    return Err(RelayError::Connect {
                        host: config.host.clone(),
                        port: config.starttls_port,
                        reason,
                    });
                }
            }
        }
    };
    deliver(mode)
}

/// Map a lettre error onto auth / send / connect.
fn classify(error: lettre::transport::smtp::Error, config: &RelayConfig, port: u16) -> RelayError {
    match error.status().map(|code| code.to_string()) {
        Some(code) if matches!(code.as_str(), "530" | "534" | "535") => RelayError::Auth {
            reason: error.to_string(),
        },
        Some(_) => RelayError::Send {
            reason: error.to_string(),
        },
        None => RelayError::Connect {
            host: config.host.clone(),
            port,
            reason: error.to_string(),
        },
    }
}

#[async_trait]
impl Relay for SmtpRelay {
    async fn send(&self, outbound: &OutboundMessage) -> Result<(), RelayError> {
        let message = self.build_message(outbound)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            relay_once(
                &config,
                |mode| Self::probe(&config, mode),
                |mode| {
                    Self::transport(&config, mode)?
                        .send(&message)
                        .map(drop)
                        .map_err(|e| classify(e, &config, mode.port(&config)))
                },
            )
        })
        .await
        .map_err(|e| RelayError::Send {
            reason: format!("relay task failed: {e}"),
        })??;

        info!(to = %self.config.destination, subject = %outbound.subject, "Forwarded message sent");
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), RelayError> {
        let config = self.config.clone();
        let mode = tokio::task::spawn_blocking(move || {
            relay_once(&config, |mode| Self::probe(&config, mode), Ok)
        })
        .await
        .map_err(|e| RelayError::Send {
            reason: format!("relay task failed: {e}"),
        })??;

        info!(host = %self.config.host, ?mode, "SMTP connection test successful");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use secrecy::SecretString;

    use super::*;

    fn parsed(subject: &str, text: &str, html: &str) -> ParsedMessage {
        ParsedMessage {
            subject: subject.into(),
            body_text: text.into(),
            body_html: html.into(),
            ..Default::default()
        }
    }

    fn relay() -> SmtpRelay {
        SmtpRelay::new(RelayConfig {
            host: "smtp.example.com".into(),
            port: 465,
            starttls_port: 587,
            username: "bot@example.com".into(),
            password: SecretString::from("pw"),
            from_address: "bot@example.com".into(),
            destination: "me@example.org".into(),
        })
    }

    #[test]
    fn subject_gets_marker() {
        let out = compose_forward(&parsed("Weekly report", "hi", ""), "[EmailLLM]");
        assert_eq!(out.subject, "[EmailLLM] Weekly report");
    }

    #[test]
    fn body_selection() {
        let text_only = compose_forward(&parsed("s", "plain", ""), "[M]");
        assert_eq!(text_only.body, OutboundBody::Plain("plain".into()));

        let html_only = compose_forward(&parsed("s", "", "<p>x</p>"), "[M]");
        assert_eq!(html_only.body, OutboundBody::Html("<p>x</p>".into()));
        assert_eq!(html_only.text(), None);

        let both = compose_forward(&parsed("s", "plain", "<p>x</p>"), "[M]");
        assert_eq!(both.html(), Some("<p>x</p>"));
        assert_eq!(both.text(), Some("plain"));

        let empty = compose_forward(&parsed("s", "", ""), "[M]");
        assert_eq!(empty.body, OutboundBody::Plain(String::new()));
    }

    #[test]
    fn builds_plain_message() {
        let out = compose_forward(&parsed("Weekly report", "summary text", ""), "[EmailLLM]");
        let formatted = String::from_utf8(relay().build_message(&out).unwrap().formatted()).unwrap();
        assert!(formatted.contains("Subject: [EmailLLM] Weekly report"));
        assert!(formatted.contains("To: me@example.org"));
        assert!(formatted.contains("text/plain"));
        assert!(formatted.contains("summary text"));
    }

    #[test]
    fn builds_alternative_message() {
        let out = compose_forward(&parsed("Hi", "plain", "<b>rich</b>"), "[EmailLLM]");
        let formatted = String::from_utf8(relay().build_message(&out).unwrap().formatted()).unwrap();
        assert!(formatted.contains("multipart/alternative"));
        assert!(formatted.contains("text/html"));
    }

    #[test]
    fn bad_destination_is_build_error() {
        let mut relay = relay();
        relay.config.destination = "not an address".into();
        let out = compose_forward(&parsed("s", "t", ""), "[M]");
        assert!(matches!(relay.build_message(&out), Err(RelayError::Build(_))));
    }

    fn scripted(implicit: fn() -> Attempt, starttls: fn() -> Attempt) -> impl Fn(TlsMode) -> Attempt {
        move |mode| match mode {
            TlsMode::Implicit => implicit(),
            TlsMode::StartTls => starttls(),
        }
    }

    #[test]
    fn unreachable_implicit_tls_falls_back_to_starttls() {
        let config = relay().config;
        let probe = scripted(|| Attempt::Unreachable("refused".into()), || Attempt::Ready);
        let chosen = relay_once(&config, probe, Ok).unwrap();
        assert_eq!(chosen, TlsMode::StartTls);
    }

    #[test]
    fn rejected_implicit_tls_does_not_fall_back() {
        let config = relay().config;
        let starttls_probed = Cell::new(false);
        let probe = |mode| match mode {
            TlsMode::Implicit => Attempt::Rejected(RelayError::Auth {
                reason: "535 bad credentials".into(),
            }),
            TlsMode::StartTls => {
                starttls_probed.set(true);
                Attempt::Ready
            }
        };
        let err = relay_once(&config, probe, Ok).unwrap_err();
        assert!(err.is_auth());
        assert!(!starttls_probed.get());
    }

    #[test]
    fn failed_delivery_is_not_retried() {
        let config = relay().config;
        let deliveries = Cell::new(0);
        let probe = scripted(|| Attempt::Ready, || Attempt::Ready);
        let err = relay_once(&config, probe, |mode| {
            deliveries.set(deliveries.get() + 1);
            assert_eq!(mode, TlsMode::Implicit);
            Err::<(), _>(RelayError::Connect {
                host: config.host.clone(),
                port: mode.port(&config),
                reason: "connection reset after DATA".into(),
            })
        })
        .unwrap_err();
        assert!(matches!(err, RelayError::Connect { port: 465, .. }));
        assert_eq!(deliveries.get(), 1);
    }

    #[test]
    fn both_modes_unreachable_is_connect_error() {
        let config = relay().config;
        let probe = scripted(
            || Attempt::Unreachable("refused".into()),
            || Attempt::Unreachable("no route".into()),
        );
        let err = relay_once(&config, probe, Ok).unwrap_err();
        match err {
            RelayError::Connect { port, reason, .. } => {
                assert_eq!(port, 587);
                assert_eq!(reason, "no route");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
