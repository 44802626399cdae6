//! Message identifiers, raw and parsed messages, MIME decoding.

use std::fmt;
use std::str::FromStr;

use mail_parser::{Address, HeaderName, MessageParser, MimeHeaders, PartType};
use tracing::warn;

use crate::error::ParseError;

/// Server-assigned UID of a message within the selected folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(pub u32);

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Uid {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(Uid)
    }
}

/// RFC822 bytes exactly as fetched from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage(Vec<u8>);

impl RawMessage {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Attachment metadata. Contents are never relayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
}

/// A decoded message. Every field has an empty default, never "absent".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMessage {
    pub uid: Option<Uid>,
    pub subject: String,
    pub sender: String,
    pub recipient: String,
    /// Date header as sent, not normalized.
    pub date: String,
    pub body_text: String,
    pub body_html: String,
    pub attachments: Vec<Attachment>,
}

impl ParsedMessage {
    /// Decode a raw message.
    ///
    /// Headers are RFC 2047 decoded. Non-attachment `text/plain` parts are
    /// concatenated into `body_text` and `text/html` parts into `body_html`,
    /// in encounter order. Parts marked `Content-Disposition: attachment`
    /// only contribute metadata. Undecodable bytes are replaced, and a part
    /// that cannot be read at all is left out.
    pub fn parse(uid: Uid, raw: RawMessage) -> Result<Self, ParseError> {
        if raw.is_empty() {
            return Err(ParseError::Malformed(format!("UID {uid}: empty message")));
        }

        let message = MessageParser::default()
            .parse(raw.as_bytes())
            .ok_or_else(|| ParseError::Malformed(format!("UID {uid}: not an RFC822 message")))?;

        let mut parsed = ParsedMessage {
            uid: Some(uid),
            subject: message.subject().unwrap_or_default().trim().to_string(),
            sender: format_addresses(message.from()),
            recipient: format_addresses(message.to()),
            date: raw_date_header(&message),
            ..Default::default()
        };

        for (index, part) in message.parts.iter().enumerate() {
            if matches!(part.body, PartType::Multipart(_)) {
                continue;
            }

            let (ctype, subtype) = match part.content_type() {
                Some(ct) => (
                    ct.ctype().to_ascii_lowercase(),
                    ct.subtype().map(str::to_ascii_lowercase),
                ),
                None => ("text".to_string(), Some("plain".to_string())),
            };

            let is_attachment = part
                .content_disposition()
                .is_some_and(|cd| cd.ctype().eq_ignore_ascii_case("attachment"));

            if is_attachment {
                parsed.attachments.push(Attachment {
                    filename: part.attachment_name().unwrap_or_default().to_string(),
                    content_type: match &subtype {
                        Some(sub) => format!("{ctype}/{sub}"),
                        None => ctype.clone(),
                    },
                });
                continue;
            }

            if ctype != "text" {
                continue;
            }

            if part.is_encoding_problem {
                warn!(uid = %uid, part = index, "Part has encoding problems, decoded lossily");
            }

            match (subtype.as_deref(), &part.body) {
                (Some("plain") | None, PartType::Text(text)) => parsed.body_text.push_str(text),
                (Some("html"), PartType::Html(html)) => parsed.body_html.push_str(html),
                (Some("plain") | None, PartType::Binary(bytes) | PartType::InlineBinary(bytes)) => {
                    parsed.body_text.push_str(&String::from_utf8_lossy(bytes));
                }
                (Some("html"), PartType::Binary(bytes) | PartType::InlineBinary(bytes)) => {
                    parsed.body_html.push_str(&String::from_utf8_lossy(bytes));
                }
                _ => {}
            }
        }

        Ok(parsed)
    }
}

/// Render an address header as `Name <addr>, ...`.
fn format_addresses(addr: Option<&Address>) -> String {
    let Some(addr) = addr else {
        return String::new();
    };

    let render = |a: &mail_parser::Addr| match (a.name.as_deref(), a.address.as_deref()) {
        (Some(name), Some(address)) if !name.is_empty() => format!("{name} <{address}>"),
        (_, Some(address)) => address.to_string(),
        (Some(name), None) => name.to_string(),
        (None, None) => String::new(),
    };

    let rendered: Vec<String> = match addr {
        Address::List(addrs) => addrs.iter().map(render).collect(),
        Address::Group(groups) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(render))
            .collect(),
    };

    rendered
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The Date header text as it appears on the wire.
fn raw_date_header(message: &mail_parser::Message) -> String {
    message
        .root_part()
        .headers()
        .iter()
        .find(|h| matches!(h.name, HeaderName::Date))
        .and_then(|h| {
            message
                .raw_message()
                .get(h.offset_start as usize..h.offset_end as usize)
        })
        .map(|bytes| String::from_utf8_lossy(bytes).trim().to_string())
        .unwrap_or_default()
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Escape text for embedding in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
