//! IMAP mailbox access.
//!
//! `ImapSession` speaks the handful of IMAP4rev1 commands the forwarder
//! needs over any async byte stream; `ImapMailbox` owns one session over
//! TLS and implements [`Mailbox`]. Messages are fetched with `BODY.PEEK[]`
//! so reading never sets `\Seen` on its own.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use secrecy::ExposeSecret;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info, warn};

use super::email_types::{RawMessage, Uid};
use super::run_state::RunState;
use crate::config::MailboxConfig;
use crate::error::MailboxError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
/// Largest `{n}` literal accepted from the server.
const MAX_LITERAL: usize = 64 * 1024 * 1024;

static FETCH_UID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bUID (\d+)").unwrap());

/// Why an IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleEvent {
    /// The server announced new messages (`EXISTS`).
    NewMail,
    /// `max_wait` elapsed with nothing new.
    Timeout,
    /// A stop was requested while waiting.
    Stopped,
}

/// Session-level access to the source mailbox.
///
/// `connect` is idempotent and `disconnect` never fails. `fetch_raw` simply
/// omits identifiers the server no longer has.
#[async_trait]
pub trait Mailbox: Send {
    async fn connect(&mut self) -> Result<(), MailboxError>;

    /// Identifiers of unread messages in `folder`, in server order.
    async fn list_unseen(&mut self, folder: &str) -> Result<Vec<Uid>, MailboxError>;

    async fn fetch_raw(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, RawMessage>, MailboxError>;

    /// Set `\Seen` on one message. Idempotent.
    async fn mark_seen(&mut self, uid: Uid) -> Result<(), MailboxError>;

    /// Wait on the selected folder for new mail, a timeout or a stop request.
    async fn idle(&mut self, max_wait: Duration, run_state: &RunState) -> Result<IdleEvent, MailboxError>;

    async fn disconnect(&mut self);
}

// ── Protocol session ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One server response: the line text (literal markers included) and the
/// literal payloads that followed it, in order.
#[derive(Debug, Default)]
struct Response {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Untagged responses collected while waiting for a tagged completion.
#[derive(Debug)]
struct Completion {
    status: Status,
    info: String,
    untagged: Vec<Response>,
}

/// A logged-in (or not yet logged-in) IMAP conversation over `S`.
pub struct ImapSession<S> {
    stream: BufReader<S>,
    /// Partial line carried across cancelled reads.
    pending: Vec<u8>,
    next_tag: u32,
    /// An `EXISTS` arrived outside IDLE and has not been reported yet.
    pending_exists: bool,
    peer: String,
    /// Upper bound on any single read or write, not on a whole exchange.
    command_timeout: Duration,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Read the server greeting. `peer` is only used in error messages.
    pub async fn open(stream: S, peer: impl Into<String>, command_timeout: Duration) -> Result<Self, MailboxError> {
        let mut session = Self {
            stream: BufReader::new(stream),
            pending: Vec::new(),
            next_tag: 1,
            pending_exists: false,
            peer: peer.into(),
            command_timeout,
        };

        let greeting = session.read_response().await?;
        let upper = greeting.text.to_ascii_uppercase();
        if upper.starts_with("* OK") || upper.starts_with("* PREAUTH") {
            debug!(peer = %session.peer, "IMAP greeting: {}", greeting.text);
            Ok(session)
        } else {
            Err(MailboxError::Connect {
                host: session.peer.clone(),
                reason: format!("unexpected greeting: {}", greeting.text),
            })
        }
    }

    pub async fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        let command = format!("LOGIN {} {}", quote(user)?, quote(password)?);
        let completion = self.command("LOGIN", &command).await?;
        match completion.status {
            Status::Ok => Ok(()),
            Status::No | Status::Bad => Err(MailboxError::Auth {
                user: user.to_string(),
                reason: completion.info,
            }),
        }
    }

    pub async fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        let completion = self.command("SELECT", &format!("SELECT {}", quote(folder)?)).await?;
        expect_ok("SELECT", &completion)
    }

    /// `UID SEARCH UNSEEN` on the selected folder.
    pub async fn search_unseen(&mut self) -> Result<Vec<Uid>, MailboxError> {
        // The search covers anything announced so far.
        self.pending_exists = false;
        let completion = self.command("SEARCH", "UID SEARCH UNSEEN").await?;
        expect_ok("SEARCH", &completion)?;

        let mut uids = Vec::new();
        for response in &completion.untagged {
            let mut words = response.text.split_whitespace();
            if words.next() != Some("*") || !words.next().is_some_and(|w| w.eq_ignore_ascii_case("SEARCH")) {
                continue;
            }
            for word in words {
                match word.parse::<Uid>() {
                    Ok(uid) => uids.push(uid),
                    Err(_) => warn!("Ignoring non-numeric SEARCH result {word:?}"),
                }
            }
        }
        Ok(uids)
    }

    /// `UID FETCH` the full raw source of each message.
    pub async fn fetch(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, RawMessage>, MailboxError> {
        if uids.is_empty() {
            return Ok(HashMap::new());
        }
        let set = uids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",");
        let completion = self
            .command("FETCH", &format!("UID FETCH {set} (UID BODY.PEEK[])"))
            .await?;
        expect_ok("FETCH", &completion)?;

        let wanted: HashSet<Uid> = uids.iter().copied().collect();
        let mut messages = HashMap::with_capacity(uids.len());
        for response in completion.untagged {
            let Some(uid) = fetch_uid(&response.text) else {
                continue;
            };
            if !wanted.contains(&uid) {
                continue;
            }
            if let Some(body) = response.literals.into_iter().next() {
                messages.insert(uid, RawMessage::new(body));
            }
        }
        Ok(messages)
    }

    /// `UID STORE <uid> +FLAGS.SILENT (\Seen)`.
    pub async fn store_seen(&mut self, uid: Uid) -> Result<(), MailboxError> {
        let completion = self
            .command("STORE", &format!("UID STORE {uid} +FLAGS.SILENT (\\Seen)"))
            .await?;
        expect_ok("STORE", &completion)
    }

    /// Enter IDLE on the selected folder.
    ///
    /// Returns `NewMail` straight away, without entering IDLE, when an
    /// `EXISTS` arrived during an earlier command. Otherwise always sends
    /// `DONE` and reads the tagged completion before returning, so the
    /// session is usable afterwards.
    pub async fn idle(&mut self, max_wait: Duration, run_state: &RunState) -> Result<IdleEvent, MailboxError> {
        if std::mem::take(&mut self.pending_exists) {
            debug!("New mail announced before IDLE");
            return Ok(IdleEvent::NewMail);
        }

        let tag = self.take_tag();
        self.write_line(&format!("{tag} IDLE")).await?;

        let mut early_exists = false;
        loop {
            let response = self.read_response().await?;
            if response.text.starts_with('+') {
                break;
            }
            if tagged_status(&response.text, &tag).is_some() {
                return Err(MailboxError::Protocol(format!("IDLE rejected: {}", response.text)));
            }
            early_exists |= is_exists(&response.text);
        }

        let event = if early_exists {
            IdleEvent::NewMail
        } else {
            let deadline = Instant::now() + max_wait;
            loop {
                tokio::select! {
                    line = self.read_line_untimed() => {
                        let line = line?;
                        let text = String::from_utf8_lossy(&line);
                        if is_exists(&text) {
                            break IdleEvent::NewMail;
                        }
                        if text.to_ascii_uppercase().starts_with("* BYE") {
                            return Err(self.closed(text.trim_end()));
                        }
                        debug!("IDLE update: {}", text.trim_end());
                    }
                    _ = tokio::time::sleep_until(deadline) => break IdleEvent::Timeout,
                    _ = run_state.stopped() => break IdleEvent::Stopped,
                }
            }
        };

        self.write_line("DONE").await?;
        let completion = self.read_completion(&tag).await?;
        expect_ok("IDLE", &completion)?;
        if event == IdleEvent::NewMail {
            self.pending_exists = false;
        }
        Ok(event)
    }

    pub async fn logout(&mut self) -> Result<(), MailboxError> {
        self.command("LOGOUT", "LOGOUT").await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    // ── wire helpers ────────────────────────────────────────────────

    fn take_tag(&mut self) -> String {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    /// Send one tagged command and collect everything up to its completion.
    /// `verb` is what gets logged; the command text may carry credentials.
    async fn command(&mut self, verb: &str, command: &str) -> Result<Completion, MailboxError> {
        let tag = self.take_tag();
        self.write_line(&format!("{tag} {command}")).await?;
        let completion = self.read_completion(&tag).await?;
        debug!(status = ?completion.status, "IMAP {verb}: {}", completion.info);
        Ok(completion)
    }

    async fn read_completion(&mut self, tag: &str) -> Result<Completion, MailboxError> {
        let mut untagged = Vec::new();
        loop {
            let response = self.read_response().await?;
            if let Some((status, info)) = tagged_status(&response.text, tag) {
                return Ok(Completion {
                    status,
                    info,
                    untagged,
                });
            }
            if response.text.starts_with('+') {
                return Err(MailboxError::Protocol(format!(
                    "unexpected continuation: {}",
                    response.text
                )));
            }
            self.pending_exists |= is_exists(&response.text);
            untagged.push(response);
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<(), MailboxError> {
        let mut data = Vec::with_capacity(line.len() + 2);
        data.extend_from_slice(line.as_bytes());
        data.extend_from_slice(b"\r\n");
        let stream = self.stream.get_mut();
        let written = timeout(self.command_timeout, async {
            stream.write_all(&data).await?;
            stream.flush().await
        })
        .await;
        match written {
            Ok(result) => Ok(result?),
            Err(_) => Err(self.timed_out("the server to accept data")),
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, MailboxError> {
        match timeout(self.command_timeout, self.read_line_untimed()).await {
            Ok(result) => result,
            Err(_) => Err(self.timed_out("a server response")),
        }
    }

    /// Read one CRLF-terminated line. Cancel-safe: a partial line stays in
    /// `pending` and is completed by the next call.
    async fn read_line_untimed(&mut self) -> Result<Vec<u8>, MailboxError> {
        self.stream.read_until(b'\n', &mut self.pending).await?;
        if !self.pending.ends_with(b"\n") {
            self.pending.clear();
            return Err(self.closed("connection closed by server"));
        }
        Ok(std::mem::take(&mut self.pending))
    }

    /// Read one response line plus any `{n}` literals it announces.
    async fn read_response(&mut self) -> Result<Response, MailboxError> {
        let mut response = Response::default();
        loop {
            let line = self.read_line().await?;
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            response.text.push_str(text);

            let Some(len) = literal_len(text) else {
                return Ok(response);
            };
            if len > MAX_LITERAL {
                return Err(MailboxError::Protocol(format!(
                    "server announced a {len} byte literal, limit is {MAX_LITERAL}"
                )));
            }
            let literal = self.read_literal(len).await?;
            response.literals.push(literal);
        }
    }

    /// Read exactly `len` bytes; the timeout applies to each read, so a slow
    /// but steady transfer completes.
    async fn read_literal(&mut self, len: usize) -> Result<Vec<u8>, MailboxError> {
        let mut literal = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let read = match timeout(self.command_timeout, self.stream.read(&mut literal[filled..])).await {
                Ok(result) => result?,
                Err(_) => return Err(self.timed_out("literal data")),
            };
            if read == 0 {
                return Err(self.closed("connection closed in the middle of a literal"));
            }
            filled += read;
        }
        Ok(literal)
    }

    fn timed_out(&self, what: &str) -> MailboxError {
        MailboxError::Connect {
            host: self.peer.clone(),
            reason: format!("timed out after {:?} waiting for {what}", self.command_timeout),
        }
    }

    fn closed(&self, reason: &str) -> MailboxError {
        MailboxError::Connect {
            host: self.peer.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Quote an IMAP string argument.
fn quote(value: &str) -> Result<String, MailboxError> {
    if value.contains(['\r', '\n']) {
        return Err(MailboxError::Protocol(
            "line breaks are not allowed in IMAP string arguments".to_string(),
        ));
    }
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    Ok(format!("\"{escaped}\""))
}

/// `"{tag} OK ..."` → `(Ok, "...")`.
fn tagged_status(text: &str, tag: &str) -> Option<(Status, String)> {
    let rest = text.strip_prefix(tag)?.strip_prefix(' ')?;
    let (word, info) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        _ => return None,
    };
    Some((status, info.to_string()))
}

fn expect_ok(verb: &str, completion: &Completion) -> Result<(), MailboxError> {
    match completion.status {
        Status::Ok => Ok(()),
        Status::No | Status::Bad => Err(MailboxError::Protocol(format!(
            "{verb} failed: {}",
            completion.info
        ))),
    }
}

/// Length of a trailing `{n}` or `{n+}` literal marker.
fn literal_len(text: &str) -> Option<usize> {
    let inner = text.strip_suffix('}')?;
    let start = inner.rfind('{')?;
    inner[start + 1..].trim_end_matches('+').parse().ok()
}

fn fetch_uid(text: &str) -> Option<Uid> {
    if !text.to_ascii_uppercase().contains(" FETCH ") {
        return None;
    }
    FETCH_UID
        .captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn is_exists(text: &str) -> bool {
    let mut words = text.split_whitespace();
    words.next() == Some("*")
        && words.next().is_some_and(|n| n.parse::<u32>().is_ok())
        && words.next().is_some_and(|w| w.eq_ignore_ascii_case("EXISTS"))
}

// ── TLS mailbox ─────────────────────────────────────────────────────

/// [`Mailbox`] over IMAPS, one session at a time.
pub struct ImapMailbox {
    config: MailboxConfig,
    session: Option<ImapSession<TlsStream<TcpStream>>>,
    selected: Option<String>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: None,
            selected: None,
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession<TlsStream<TcpStream>>, MailboxError> {
        self.session.as_mut().ok_or(MailboxError::NotConnected)
    }

    async fn open_tls(&self) -> Result<TlsStream<TcpStream>, MailboxError> {
        let host = self.config.host.clone();
        let connect_error = |reason: String| MailboxError::Connect {
            host: host.clone(),
            reason,
        };

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), self.config.port)))
            .await
            .map_err(|_| connect_error(format!("TCP connect timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|e| connect_error(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = rustls_pki_types::ServerName::try_from(host.clone())
            .map_err(|e| connect_error(format!("invalid server name: {e}")))?;

        timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| connect_error(format!("TLS handshake timed out after {CONNECT_TIMEOUT:?}")))?
            .map_err(|e| connect_error(format!("TLS handshake failed: {e}")))
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn connect(&mut self) -> Result<(), MailboxError> {
        if self.session.is_some() {
            return Ok(());
        }

        info!(host = %self.config.host, port = self.config.port, "Connecting to IMAP server");
        let tls = self.open_tls().await?;
        let mut session = ImapSession::open(tls, self.config.host.clone(), COMMAND_TIMEOUT).await?;
        session
            .login(&self.config.username, self.config.password.expose_secret())
            .await?;

        info!(user = %self.config.username, "IMAP login successful");
        self.session = Some(session);
        self.selected = None;
        Ok(())
    }

    async fn list_unseen(&mut self, folder: &str) -> Result<Vec<Uid>, MailboxError> {
        let needs_select = self.selected.as_deref() != Some(folder);
        let session = self.session()?;
        if needs_select {
            session.select(folder).await?;
        }
        self.selected = Some(folder.to_string());
        self.session()?.search_unseen().await
    }

    async fn fetch_raw(&mut self, uids: &[Uid]) -> Result<HashMap<Uid, RawMessage>, MailboxError> {
        self.session()?.fetch(uids).await
    }

    async fn mark_seen(&mut self, uid: Uid) -> Result<(), MailboxError> {
        self.session()?.store_seen(uid).await
    }

    async fn idle(&mut self, max_wait: Duration, run_state: &RunState) -> Result<IdleEvent, MailboxError> {
        if self.selected.is_none() {
            return Err(MailboxError::Protocol("IDLE requires a selected folder".to_string()));
        }
        self.session()?.idle(max_wait, run_state).await
    }

    async fn disconnect(&mut self) {
        self.selected = None;
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                debug!("IMAP logout failed (ignored): {e}");
            }
            info!("Disconnected from IMAP server");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_specials() {
        assert_eq!(quote("plain").unwrap(), "\"plain\"");
        assert_eq!(quote(r#"pa"ss\word"#).unwrap(), r#""pa\"ss\\word""#);
        assert!(quote("evil\r\nA2 LOGOUT").is_err());
    }

    #[test]
    fn tagged_status_parsing() {
        assert_eq!(
            tagged_status("A3 OK SEARCH completed", "A3"),
            Some((Status::Ok, "SEARCH completed".to_string()))
        );
        assert_eq!(
            tagged_status("A1 no [AUTHENTICATIONFAILED] Invalid", "A1").map(|(s, _)| s),
            Some(Status::No)
        );
        assert_eq!(tagged_status("A10 OK done", "A1"), None);
        assert_eq!(tagged_status("* OK still here", "A1"), None);
    }

    #[test]
    fn literal_markers() {
        assert_eq!(literal_len("* 1 FETCH (UID 7 BODY[] {342}"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (BODY[] {12+}"), Some(12));
        assert_eq!(literal_len("* 1 FETCH (FLAGS (\\Seen))"), None);
        assert_eq!(literal_len("A1 OK {not a literal}"), None);
    }

    #[test]
    fn uid_from_fetch_text() {
        assert_eq!(fetch_uid("* 3 FETCH (UID 101 BODY[] {10})"), Some(Uid(101)));
        assert_eq!(fetch_uid("* 3 FETCH (BODY[] {10} UID 55)"), Some(Uid(55)));
        assert_eq!(fetch_uid("* 3 FETCH (FLAGS (\\Seen))"), None);
        assert_eq!(fetch_uid("* SEARCH 1 2 3"), None);
    }

    #[test]
    fn exists_detection() {
        assert!(is_exists("* 12 EXISTS\r\n"));
        assert!(is_exists("* 4 exists"));
        assert!(!is_exists("* 3 RECENT"));
        assert!(!is_exists("* OK Still here"));
    }

    #[tokio::test]
    async fn rejects_bye_greeting() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"* BYE too many connections\r\n")
            .await
            .unwrap();
        let err = ImapSession::open(client, "imap.test", Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MailboxError::Connect { .. }));
    }

    #[tokio::test]
    async fn not_connected_mailbox_errors() {
        let mut mailbox = ImapMailbox::new(MailboxConfig {
            host: "imap.test".into(),
            port: 993,
            username: "bot@test".into(),
            password: secrecy::SecretString::from("pw"),
            folder: "INBOX".into(),
        });
        assert!(matches!(
            mailbox.list_unseen("INBOX").await,
            Err(MailboxError::NotConnected)
        ));
        assert!(matches!(
            mailbox.mark_seen(Uid(1)).await,
            Err(MailboxError::NotConnected)
        ));
        // Disconnect on a never-connected mailbox is a no-op.
        mailbox.disconnect().await;
    }
}
