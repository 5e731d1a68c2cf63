//! Header, sender, subject and DSN heuristics that decide whether an inbound
//! message is a delivery failure.
//!
//! A message is only a bounce when it both looks like one (report content
//! type, daemon sender or bounce subject) and carries severity evidence
//! (DSN status, SMTP code or a known failure phrase). Looking like one
//! without evidence is reported as ambiguous and left for a human.

use mail_parser::{HeaderValue, MimeHeaders};

use crate::models::conversation::normalize_message_id;
use crate::models::BounceType;

const DAEMON_SENDERS: &[&str] = &[
    "mailer-daemon",
    "mailerdaemon",
    "postmaster",
    "mail-delivery-subsystem",
];

const BOUNCE_SUBJECTS: &[&str] = &[
    "undelivered mail returned to sender",
    "delivery status notification (failure)",
    "delivery status notification (delay)",
    "mail delivery failed",
    "mail delivery failure",
    "delivery failure",
    "undeliverable",
    "undelivered mail",
    "failure notice",
    "returned mail",
    "delayed mail",
    "delivery delayed",
];

const HARD_SMTP_CODES: &[&str] = &["550", "551", "553", "554"];
const SOFT_SMTP_CODES: &[&str] = &["421", "450", "451", "452"];

const HARD_PHRASES: &[&str] = &[
    "user unknown",
    "unknown user",
    "no such user",
    "does not exist",
    "address rejected",
    "mailbox unavailable",
    "recipient not found",
    "invalid recipient",
    "account has been disabled",
];

const SOFT_PHRASES: &[&str] = &[
    "mailbox full",
    "mailbox is full",
    "over quota",
    "quota exceeded",
    "try again later",
    "temporarily",
    "temporary failure",
    "delivery delayed",
];

/// Header facts about an inbound message, whether or not it is a bounce.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub message_id: Option<String>,
    pub from: Option<String>,
    pub subject: Option<String>,
    pub in_reply_to: Option<String>,
    /// Oldest first, as they appear in the header
    pub references: Vec<String>,
    pub date: Option<i64>,
    /// Out-of-office and other machine replies
    pub auto_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceEvidence {
    pub bounce_type: BounceType,
    pub reason: String,
    pub failed_recipient: Option<String>,
    /// Message-IDs of the outbound mail the bounce refers to
    pub original_message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Bounce(BounceEvidence),
    NotABounce,
    /// Bounce-shaped but without severity evidence
    Ambiguous { reason: String },
}

#[derive(Debug, Clone)]
pub struct ClassifiedMessage {
    pub message: InboundMessage,
    pub classification: Classification,
}

/// Returns None only when the bytes are not a parseable message.
pub fn classify(raw: &[u8]) -> Option<ClassifiedMessage> {
    let parsed = mail_parser::Message::parse(raw)?;
    let text = String::from_utf8_lossy(raw);
    let (head, body) = split_head_body(&text);

    let message = InboundMessage {
        message_id: parsed
            .message_id()
            .map(normalize_message_id)
            .filter(|m| !m.is_empty()),
        from: first_address(parsed.from()),
        subject: parsed.subject().map(|s| s.trim().to_string()),
        in_reply_to: header_texts(parsed.in_reply_to()).into_iter().next(),
        references: header_texts(parsed.references()),
        date: parsed.date().map(|d| d.to_timestamp()),
        auto_reply: is_auto_reply(head, parsed.subject()),
    };

    let is_report = parsed
        .parts
        .first()
        .and_then(|root| root.content_type())
        .map(|ct| {
            ct.c_type.eq_ignore_ascii_case("multipart")
                && ct.subtype().is_some_and(|s| s.eq_ignore_ascii_case("report"))
                && ct
                    .attribute("report-type")
                    .is_some_and(|r| r.eq_ignore_ascii_case("delivery-status"))
        })
        .unwrap_or(false);
    let daemon_sender = message.from.as_deref().is_some_and(is_daemon_address);
    let subject_lower = message.subject.as_deref().unwrap_or("").to_lowercase();
    let bounce_subject = BOUNCE_SUBJECTS.iter().any(|s| subject_lower.contains(s));

    if !(is_report || daemon_sender || bounce_subject) {
        return Some(ClassifiedMessage {
            message,
            classification: Classification::NotABounce,
        });
    }

    // Decoded text parts cover base64 and quoted-printable bodies.
    let mut evidence_text = body.to_string();
    let mut idx = 0;
    while let Some(part) = parsed.body_text(idx) {
        evidence_text.push('\n');
        evidence_text.push_str(&part);
        idx += 1;
    }

    let classification = match severity(&evidence_text, &subject_lower) {
        Some((bounce_type, matched)) => {
            let reason = diagnostic_code(&evidence_text).unwrap_or(matched);
            Classification::Bounce(BounceEvidence {
                bounce_type,
                reason: truncate(&reason, 500),
                failed_recipient: failed_recipient(head, &evidence_text),
                original_message_ids: original_ids(&evidence_text, &message),
            })
        }
        None => {
            let mut why = Vec::new();
            if is_report {
                why.push("delivery-status report");
            }
            if daemon_sender {
                why.push("daemon sender");
            }
            if bounce_subject {
                why.push("bounce subject");
            }
            Classification::Ambiguous {
                reason: format!("{} without failure status", why.join(" and ")),
            }
        }
    };
    Some(ClassifiedMessage {
        message,
        classification,
    })
}

pub fn is_daemon_address(address: &str) -> bool {
    let local = address
        .trim()
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();
    DAEMON_SENDERS.iter().any(|d| local == *d)
}

fn split_head_body(text: &str) -> (&str, &str) {
    let crlf = text.find("\r\n\r\n").map(|i| (i, 4));
    let lf = text.find("\n\n").map(|i| (i, 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((at, len)) => (&text[..at], &text[at + len..]),
        None => (text, ""),
    }
}

/// Looks up an unfolded header in the raw header block.
fn raw_header(head: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;
    for line in head.lines() {
        if let Some(current) = value.as_mut() {
            if line.starts_with(' ') || line.starts_with('\t') {
                current.push(' ');
                current.push_str(line.trim());
                continue;
            }
            break;
        }
        if let Some((key, rest)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case(name) {
                value = Some(rest.trim().to_string());
            }
        }
    }
    value
}

fn is_auto_reply(head: &str, subject: Option<&str>) -> bool {
    if let Some(auto) = raw_header(head, "auto-submitted") {
        if !auto.eq_ignore_ascii_case("no") {
            return true;
        }
    }
    if raw_header(head, "x-autoreply").is_some() || raw_header(head, "x-autorespond").is_some() {
        return true;
    }
    let subject = subject.unwrap_or("").to_lowercase();
    subject.starts_with("automatic reply") || subject.starts_with("out of office")
}

fn first_address(value: &HeaderValue<'_>) -> Option<String> {
    let address = match value {
        HeaderValue::Address(addr) => addr.address.as_deref(),
        HeaderValue::AddressList(list) => list.first().and_then(|a| a.address.as_deref()),
        _ => None,
    };
    address.map(|a| a.trim().to_lowercase()).filter(|a| !a.is_empty())
}

fn header_texts(value: &HeaderValue<'_>) -> Vec<String> {
    let raw: Vec<&str> = match value {
        HeaderValue::Text(text) => vec![text.as_ref()],
        HeaderValue::TextList(list) => list.iter().map(|t| t.as_ref()).collect(),
        _ => Vec::new(),
    };
    raw.into_iter()
        .flat_map(|v| v.split_whitespace())
        .map(normalize_message_id)
        .filter(|v| !v.is_empty())
        .collect()
}

/// DSN status first, then enhanced or basic SMTP codes, then phrases.
fn severity(text: &str, subject_lower: &str) -> Option<(BounceType, String)> {
    let lower = text.to_lowercase();

    for line in lower.lines() {
        if let Some(status) = line.trim().strip_prefix("status:") {
            let status = status.trim();
            match status.chars().next() {
                Some('5') => return Some((BounceType::Hard, format!("status {status}"))),
                Some('4') => return Some((BounceType::Soft, format!("status {status}"))),
                _ => {}
            }
        }
    }

    let tokens: Vec<&str> = lower
        .split(|c: char| c.is_whitespace() || matches!(c, ';' | ',' | '(' | ')' | '[' | ']' | '<' | '>' | '"'))
        .filter(|t| !t.is_empty())
        .collect();
    for token in &tokens {
        let token = token.trim_end_matches(['.', ':', '-']);
        if is_enhanced_code(token) {
            let bounce_type = if token.starts_with('5') {
                BounceType::Hard
            } else {
                BounceType::Soft
            };
            return Some((bounce_type, format!("status {token}")));
        }
    }
    for token in &tokens {
        let code = token.trim_end_matches(['-', ':']);
        if HARD_SMTP_CODES.contains(&code) {
            return Some((BounceType::Hard, format!("smtp {code}")));
        }
        if SOFT_SMTP_CODES.contains(&code) {
            return Some((BounceType::Soft, format!("smtp {code}")));
        }
    }

    if let Some(phrase) = HARD_PHRASES.iter().find(|p| lower.contains(*p)) {
        return Some((BounceType::Hard, (*phrase).to_string()));
    }
    if let Some(phrase) = SOFT_PHRASES.iter().find(|p| lower.contains(*p)) {
        return Some((BounceType::Soft, (*phrase).to_string()));
    }
    if subject_lower.contains("(delay)") || subject_lower.contains("delayed mail") {
        return Some((BounceType::Soft, "delivery delayed".to_string()));
    }
    None
}

/// Matches `4.x.x` / `5.x.x` enhanced status codes.
fn is_enhanced_code(token: &str) -> bool {
    let mut parts = token.split('.');
    let (Some(class), Some(subject), Some(detail), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    (class == "4" || class == "5")
        && (1..=3).contains(&subject.len())
        && (1..=3).contains(&detail.len())
        && subject.chars().all(|c| c.is_ascii_digit())
        && detail.chars().all(|c| c.is_ascii_digit())
}

fn diagnostic_code(text: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let trimmed = line.trim();
        let (key, value) = trimmed.split_once(':')?;
        if !key.trim().eq_ignore_ascii_case("diagnostic-code") {
            return None;
        }
        let value = value.split_once(';').map(|(_, v)| v).unwrap_or(value).trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

fn failed_recipient(head: &str, text: &str) -> Option<String> {
    if let Some(value) = raw_header(head, "x-failed-recipients") {
        if let Some(first) = value.split(',').map(clean_address).find(|a| a.contains('@')) {
            return Some(first);
        }
    }
    for field in ["final-recipient", "original-recipient"] {
        let found = text.lines().find_map(|line| {
            let (key, value) = line.trim().split_once(':')?;
            if !key.trim().eq_ignore_ascii_case(field) {
                return None;
            }
            let address = value.split_once(';').map(|(_, v)| v).unwrap_or(value);
            let address = clean_address(address);
            address.contains('@').then_some(address)
        });
        if found.is_some() {
            return found;
        }
    }
    None
}

fn clean_address(raw: &str) -> String {
    normalize_message_id(raw).to_lowercase()
}

/// Message-IDs quoted in the returned headers, plus the bounce's own reply headers.
fn original_ids(text: &str, message: &InboundMessage) -> Vec<String> {
    let own = message.message_id.as_deref();
    let mut ids: Vec<String> = Vec::new();
    let mut push = |id: String| {
        if !id.is_empty() && Some(id.as_str()) != own && !ids.contains(&id) {
            ids.push(id);
        }
    };
    for line in text.lines() {
        if let Some((key, value)) = line.trim().split_once(':') {
            if key.trim().eq_ignore_ascii_case("message-id") {
                push(normalize_message_id(value));
            }
        }
    }
    if let Some(parent) = &message.in_reply_to {
        push(parent.clone());
    }
    for reference in message.references.iter().rev() {
        push(reference.clone());
    }
    ids
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
