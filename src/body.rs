use chrono::{DateTime, TimeZone, Utc};
use mailparse::{MailHeaderMap, ParsedMail};
use once_cell::sync::Lazy;
use regex::Regex;

pub const NO_READABLE_BODY: &str = "(no readable body)";
pub const NO_SUBJECT: &str = "(no subject)";
const ELLIPSIS: &str = "...";

static HIDDEN_BLOCKS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(style|script|head)[^>]*>.*?</(style|script|head)>").expect("valid regex")
});
static LINE_BREAK_TAGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)<(br|/p|/div|/tr|/li|/h[1-6])[^>]*>").expect("valid regex"));
static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static SPACES: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));

const HTML_ENTITIES: &[(&str, &str)] = &[
    ("&nbsp;", " "),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&apos;", "'"),
    ("&#39;", "'"),
    ("&copy;", "©"),
    ("&reg;", "®"),
    ("&trade;", "™"),
    ("&mdash;", "—"),
    ("&ndash;", "–"),
    ("&hellip;", "..."),
    ("&laquo;", "«"),
    ("&raquo;", "»"),
    ("&amp;", "&"),
];

/// The readable shape of a message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyPart {
    PlainText(String),
    Html(String),
    Multipart(Vec<BodyPart>),
    Unknown,
}

impl BodyPart {
    pub fn from_mail(mail: &ParsedMail<'_>) -> Self {
        let mimetype = mail.ctype.mimetype.to_ascii_lowercase();
        if !mail.subparts.is_empty() {
            return BodyPart::Multipart(mail.subparts.iter().map(BodyPart::from_mail).collect());
        }
        if is_attachment(mail) {
            return BodyPart::Unknown;
        }
        match mimetype.as_str() {
            "text/plain" => mail.get_body().map(BodyPart::PlainText).unwrap_or(BodyPart::Unknown),
            "text/html" => mail.get_body().map(BodyPart::Html).unwrap_or(BodyPart::Unknown),
            _ => BodyPart::Unknown,
        }
    }

    /// First non-empty line, preferring plain text anywhere in the tree over HTML.
    pub fn first_line(&self) -> Option<String> {
        self.first_plain_line().or_else(|| self.first_html_line())
    }

    fn first_plain_line(&self) -> Option<String> {
        match self {
            BodyPart::PlainText(text) => first_non_empty_line(text),
            BodyPart::Multipart(parts) => parts.iter().find_map(BodyPart::first_plain_line),
            BodyPart::Html(_) | BodyPart::Unknown => None,
        }
    }

    fn first_html_line(&self) -> Option<String> {
        match self {
            BodyPart::Html(html) => first_non_empty_line(&html_to_text(html)),
            BodyPart::Multipart(parts) => parts.iter().find_map(BodyPart::first_html_line),
            BodyPart::PlainText(_) | BodyPart::Unknown => None,
        }
    }
}

fn is_attachment(mail: &ParsedMail<'_>) -> bool {
    mail.get_content_disposition().disposition == mailparse::DispositionType::Attachment
}

/// Subject, preview line and `Date` header of a fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub subject: String,
    pub preview: String,
    pub sent_at: Option<DateTime<Utc>>,
}

pub fn summarize(raw: &[u8], text_limit: usize) -> Result<MessageSummary, mailparse::MailParseError> {
    let mail = mailparse::parse_mail(raw)?;

    let subject = mail
        .headers
        .get_first_value("Subject")
        .map(|value| collapse_whitespace(&value))
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let preview = BodyPart::from_mail(&mail)
        .first_line()
        .unwrap_or_else(|| NO_READABLE_BODY.to_string());

    let sent_at = mail
        .headers
        .get_first_value("Date")
        .and_then(|value| parse_date(&value));

    Ok(MessageSummary {
        subject: truncate(&subject, text_limit),
        preview: truncate(&preview, text_limit),
        sent_at,
    })
}

/// `Date` header of a raw header block (or whole message), in UTC.
pub fn header_date(raw: &[u8]) -> Option<DateTime<Utc>> {
    let (headers, _) = mailparse::parse_headers(raw).ok()?;
    headers.get_first_value("Date").and_then(|value| parse_date(&value))
}

/// Parses an RFC 2822 date, applying its declared offset so the result is in UTC.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let epoch = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(epoch, 0).single()
}

/// Cuts `text` to at most `limit` characters, marking the cut with `...`.
pub fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}{ELLIPSIS}", text[..cut].trim_end()),
        None => text.to_string(),
    }
}

pub fn html_to_text(html: &str) -> String {
    let without_blocks = HIDDEN_BLOCKS.replace_all(html, "");
    let with_breaks = LINE_BREAK_TAGS.replace_all(&without_blocks, "\n");
    let mut text = TAGS.replace_all(&with_breaks, "").into_owned();
    for (entity, replacement) in HTML_ENTITIES {
        text = text.replace(entity, replacement);
    }
    text.lines()
        .map(|line| SPACES.replace_all(line, " ").trim().to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_non_empty_line(text: &str) -> Option<String> {
    text.lines()
        .map(collapse_whitespace)
        .find(|line| !line.is_empty())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_yields_first_non_empty_line() {
        let raw = b"Subject: Hello\r\nContent-Type: text/plain\r\n\r\n\r\n   \r\nFirst line here\r\nsecond line\r\n";
        let summary = summarize(raw, 50).unwrap();
        assert_eq!(summary.subject, "Hello");
        assert_eq!(summary.preview, "First line here");
    }

    #[test]
    fn multipart_prefers_plain_text_over_html() {
        let raw = concat!(
            "Subject: Mixed\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/alternative; boundary=\"b1\"\r\n\r\n",
            "--b1\r\n",
            "Content-Type: text/html\r\n\r\n",
            "<p>html version</p>\r\n",
            "--b1\r\n",
            "Content-Type: text/plain\r\n\r\n",
            "plain version\r\n",
            "--b1--\r\n"
        );
        let summary = summarize(raw.as_bytes(), 50).unwrap();
        assert_eq!(summary.preview, "plain version");
    }

    #[test]
    fn html_only_message_is_converted_to_text() {
        let raw = concat!(
            "Subject: Html\r\n",
            "Content-Type: text/html\r\n\r\n",
            "<html><head><style>p { color: red; }</style></head>",
            "<body><p>Fish &amp; chips</p><p>tonight</p></body></html>\r\n"
        );
        let summary = summarize(raw.as_bytes(), 50).unwrap();
        assert_eq!(summary.preview, "Fish & chips");
    }

    #[test]
    fn attachments_and_unknown_parts_fall_back() {
        let raw = concat!(
            "Subject: Attachment\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b2\"\r\n\r\n",
            "--b2\r\n",
            "Content-Type: text/plain\r\n",
            "Content-Disposition: attachment; filename=\"notes.txt\"\r\n\r\n",
            "not a body\r\n",
            "--b2\r\n",
            "Content-Type: image/png\r\n\r\n",
            "xxxx\r\n",
            "--b2--\r\n"
        );
        let summary = summarize(raw.as_bytes(), 50).unwrap();
        assert_eq!(summary.preview, NO_READABLE_BODY);
    }

    #[test]
    fn encoded_subject_is_decoded_and_missing_subject_has_placeholder() {
        let raw = b"Subject: =?UTF-8?B?5paw6YKu5Lu2?=\r\n\r\nbody\r\n";
        assert_eq!(summarize(raw, 50).unwrap().subject, "新邮件");

        let raw = b"From: a@test\r\n\r\nbody\r\n";
        assert_eq!(summarize(raw, 50).unwrap().subject, NO_SUBJECT);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly10!", 10), "exactly10!");
        assert_eq!(truncate("邮件邮件邮件邮件邮件邮件", 10), "邮件邮件邮件邮件邮件...");
        assert_eq!(truncate("hello world again", 10), "hello worl...");
    }

    #[test]
    fn date_offset_is_applied() {
        let east = parse_date("Mon, 20 Oct 2025 18:00:00 +0800").unwrap();
        let utc = parse_date("Mon, 20 Oct 2025 10:00:00 +0000").unwrap();
        assert_eq!(east, utc);
        assert!(parse_date("").is_none());
    }

    #[test]
    fn header_block_date_is_read_without_a_body() {
        let header = b"Subject: x\r\nDate: Mon, 20 Oct 2025 18:00:00 +0800\r\n\r\n";
        assert_eq!(header_date(header), parse_date("Mon, 20 Oct 2025 10:00:00 +0000"));
        assert!(header_date(b"Subject: undated\r\n\r\n").is_none());
    }
}
