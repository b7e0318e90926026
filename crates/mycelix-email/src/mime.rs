use crate::{EmailError, RawMessage};
use chrono::{DateTime, TimeZone, Utc};
use mailparse::{
    addrparse_header, parse_mail, DispositionType, MailAddr, MailHeaderMap, ParsedMail,
};
use mycelix_core::{DecodedMessage, MailAddress, MailAttachment};
use regex::Regex;
use std::sync::OnceLock;
use uuid::Uuid;

pub const NO_SUBJECT: &str = "(No Subject)";
const UNNAMED_ATTACHMENT: &str = "unnamed";
const SYNTHETIC_ID_DOMAIN: &str = "mycelix";

/// Decodes one RFC 5322 message.
///
/// Missing headers get placeholders rather than errors: a random
/// `<uuid@mycelix>` Message-ID, `(No Subject)`, an empty sender, and the
/// current time for an absent or unreadable `Date`. Only a payload without
/// any header fields is rejected.
pub fn decode(raw: &[u8]) -> Result<DecodedMessage, EmailError> {
    decode_received(raw, None)
}

/// Like [`decode`], but a message without a usable `Date` takes
/// `received_at` (the server's INTERNALDATE) before falling back to now.
pub fn decode_received(
    raw: &[u8],
    received_at: Option<DateTime<Utc>>,
) -> Result<DecodedMessage, EmailError> {
    let parsed = parse_mail(raw)?;
    if parsed.headers.is_empty() {
        return Err(EmailError::Parse("message has no header fields".to_string()));
    }

    let subject = parsed
        .headers
        .get_first_value("Subject")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());
    let message_id = parsed
        .headers
        .get_first_value("Message-ID")
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(synthesize_message_id);

    let mut body = MimeBody::default();
    walk_parts(&parsed, &mut body);
    let body_html = body.html.map(|html| sanitize_html(&html));
    let body_text = body.text.or_else(|| {
        body_html
            .as_deref()
            .map(|html| strip_html_tags(html).trim().to_string())
    });

    Ok(DecodedMessage {
        message_id,
        subject,
        from: address_header(&parsed, "From")
            .into_iter()
            .next()
            .unwrap_or_default(),
        to: address_header(&parsed, "To"),
        cc: address_header(&parsed, "Cc"),
        bcc: address_header(&parsed, "Bcc"),
        reply_to: address_header(&parsed, "Reply-To"),
        sent_at: parsed_message_date(&parsed)
            .or(received_at)
            .unwrap_or_else(Utc::now),
        body_text,
        body_html,
        size: raw.len() as u64,
        attachments: body.attachments,
    })
}

/// Decodes a fetched window, skipping (and logging) messages that fail.
pub fn decode_batch(raws: &[RawMessage]) -> Vec<DecodedMessage> {
    let mut decoded = Vec::with_capacity(raws.len());
    for raw in raws {
        match decode_received(&raw.bytes, raw.internal_date) {
            Ok(message) => decoded.push(message),
            Err(err) => {
                tracing::warn!(
                    sequence = raw.sequence,
                    bytes = raw.bytes.len(),
                    "skipping undecodable message: {err}"
                );
            }
        }
    }
    decoded
}

/// Naive tag removal, used for the plain-text copy of outgoing HTML and for
/// HTML-only incoming mail.
pub fn strip_html_tags(html: &str) -> String {
    static TAGS: OnceLock<Regex> = OnceLock::new();
    TAGS.get_or_init(|| Regex::new(r"<[^>]*>").expect("valid tag regex"))
        .replace_all(html, "")
        .into_owned()
}

fn synthesize_message_id() -> String {
    format!("<{}@{SYNTHETIC_ID_DOMAIN}>", Uuid::new_v4())
}

/// Keeps `cid:` URLs so inline images still resolve against attachments.
fn sanitize_html(html: &str) -> String {
    ammonia::Builder::default()
        .add_url_schemes(&["cid"])
        .clean(html)
        .to_string()
}

#[derive(Default)]
struct MimeBody {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<MailAttachment>,
}

fn walk_parts(part: &ParsedMail<'_>, body: &mut MimeBody) {
    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk_parts(sub, body);
        }
        return;
    }

    let content_type = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .or_else(|| part.ctype.params.get("name"))
        .cloned();
    let is_attachment = disposition.disposition == DispositionType::Attachment
        || !content_type.starts_with("text/")
        || filename.is_some();

    if !is_attachment {
        if content_type == "text/plain" && body.text.is_none() {
            body.text = part.get_body().ok();
            return;
        }
        if content_type == "text/html" && body.html.is_none() {
            body.html = part.get_body().ok();
            return;
        }
    }

    // Any leaf that is not one of the two bodies is listed, extra text
    // parts such as calendar invites included.
    let size = part.get_body_raw().map(|raw| raw.len()).unwrap_or(0);
    body.attachments.push(MailAttachment {
        filename: filename.unwrap_or_else(|| UNNAMED_ATTACHMENT.to_string()),
        content_type,
        size: size as u64,
        content_id: part
            .headers
            .get_first_value("Content-ID")
            .map(|value| {
                value
                    .trim()
                    .trim_start_matches('<')
                    .trim_end_matches('>')
                    .to_string()
            })
            .filter(|value| !value.is_empty()),
    });
}

fn address_header(parsed: &ParsedMail<'_>, key: &str) -> Vec<MailAddress> {
    let Some(header) = parsed.headers.get_first_header(key) else {
        return Vec::new();
    };

    match addrparse_header(header) {
        Ok(list) => list
            .iter()
            .flat_map(|addr| match addr {
                MailAddr::Single(single) => vec![single.clone()],
                MailAddr::Group(group) => group.addrs.clone(),
            })
            .map(|single| MailAddress {
                name: single.display_name.filter(|name| !name.trim().is_empty()),
                address: single.addr,
            })
            .collect(),
        Err(_) => parse_address_list(&header.get_value()),
    }
}

/// Lenient fallback for headers `addrparse` rejects.
fn parse_address_list(raw: &str) -> Vec<MailAddress> {
    raw.split(',')
        .filter_map(|segment| {
            let value = segment.trim();
            if value.is_empty() {
                return None;
            }

            if let (Some(lt), Some(gt)) = (value.rfind('<'), value.rfind('>')) {
                if lt < gt {
                    let name = value[..lt].trim().trim_matches('"').trim().to_string();
                    let address = value[lt + 1..gt].trim().to_string();
                    if address.is_empty() {
                        return None;
                    }
                    return Some(MailAddress {
                        name: if name.is_empty() { None } else { Some(name) },
                        address,
                    });
                }
            }

            Some(MailAddress::new(value.trim_matches('"')))
        })
        .collect()
}

fn parsed_message_date(parsed: &ParsedMail<'_>) -> Option<DateTime<Utc>> {
    let raw = parsed.headers.get_first_value("Date")?;
    let timestamp = mailparse::dateparse(&raw).ok()?;
    Utc.timestamp_opt(timestamp, 0).single()
}
