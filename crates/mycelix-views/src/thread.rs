use chrono::{DateTime, Utc};
use mycelix_core::Message;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::OnceLock;
use uuid::Uuid;

const PREVIEW_CHARS: usize = 150;

/// A conversation derived from the messages passed to [`group`]. Messages
/// are referenced by their index in that slice, oldest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Thread {
    /// `thread_<normalized subject>_<newest message id>`.
    pub id: String,
    /// Original subject of the newest message.
    pub subject: String,
    pub normalized_subject: String,
    pub messages: Vec<usize>,
    /// Distinct from/to/cc addresses in first-seen order.
    pub participants: Vec<String>,
    pub last_message_at: DateTime<Utc>,
    pub latest_message_id: Uuid,
    pub unread_count: usize,
    pub is_starred: bool,
    pub has_attachments: bool,
    pub preview: String,
}

impl Thread {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Resolves the thread's messages, oldest first.
    pub fn resolve<'a>(&self, arena: &'a [Message]) -> Vec<&'a Message> {
        self.messages
            .iter()
            .filter_map(|&index| arena.get(index))
            .collect()
    }
}

fn reply_prefix() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)^(re:|fwd:|fw:)\s*").expect("valid reply prefix regex")
    })
}

/// Grouping key for a subject. Only one leading `Re:`/`Fwd:`/`Fw:` is
/// removed, so `Re: Re: x` and `x` stay apart.
pub fn normalize_subject(subject: &str) -> String {
    let stripped = reply_prefix().replace(subject, "");
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn is_same_thread(a: &Message, b: &Message) -> bool {
    normalize_subject(&a.subject) == normalize_subject(&b.subject)
}

/// Groups messages into threads by normalized subject, newest thread first.
/// Messages whose subject normalizes to nothing are left out.
pub fn group(messages: &[Message]) -> Vec<Thread> {
    let mut order: Vec<String> = Vec::new();
    let mut buckets: HashMap<String, Vec<usize>> = HashMap::new();

    for (index, message) in messages.iter().enumerate() {
        let key = normalize_subject(&message.subject);
        if key.is_empty() {
            continue;
        }
        buckets
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(index);
    }

    let mut threads: Vec<Thread> = order
        .into_iter()
        .filter_map(|key| {
            let mut indices = buckets.remove(&key)?;
            indices.sort_by_key(|&index| messages[index].sent_at);
            build_thread(messages, key, indices)
        })
        .collect();

    threads.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    threads
}

fn build_thread(messages: &[Message], normalized: String, indices: Vec<usize>) -> Option<Thread> {
    let latest = &messages[*indices.last()?];

    let mut participants: Vec<String> = Vec::new();
    let mut unread_count = 0;
    let mut is_starred = false;
    let mut has_attachments = false;

    for &index in &indices {
        let message = &messages[index];
        let addresses = std::iter::once(&message.from)
            .chain(&message.to)
            .chain(&message.cc)
            .map(|addr| &addr.address);
        for address in addresses {
            if !participants.contains(address) {
                participants.push(address.clone());
            }
        }
        if !message.is_read {
            unread_count += 1;
        }
        is_starred |= message.is_starred;
        has_attachments |= message.has_attachments();
    }

    Some(Thread {
        id: format!("thread_{normalized}_{}", latest.id),
        subject: latest.subject.clone(),
        normalized_subject: normalized,
        participants,
        last_message_at: latest.sent_at,
        latest_message_id: latest.id,
        unread_count,
        is_starred,
        has_attachments,
        preview: latest
            .body_text
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(PREVIEW_CHARS)
            .collect(),
        messages: indices,
    })
}

/// `"a, b, c, +2 others"` style summary of a participant list.
pub fn format_participants(participants: &[String], max_shown: usize) -> String {
    if participants.len() <= max_shown {
        return participants.join(", ");
    }

    let remaining = participants.len() - max_shown;
    let plural = if remaining > 1 { "s" } else { "" };
    format!(
        "{}, +{remaining} other{plural}",
        participants[..max_shown].join(", ")
    )
}

/// Ranking score for the thread list: unread volume, stars, activity and
/// recency relative to `now`.
pub fn thread_importance(thread: &Thread, now: DateTime<Utc>) -> u32 {
    let mut score = thread.unread_count as u32 * 10;
    if thread.is_starred {
        score += 20;
    }

    let count = thread.message_count();
    if count > 5 {
        score += 15;
    } else if count > 2 {
        score += 10;
    }

    let minutes = (now - thread.last_message_at).num_minutes();
    if minutes < 60 {
        score += 20;
    } else if minutes < 24 * 60 {
        score += 10;
    } else if minutes < 72 * 60 {
        score += 5;
    }

    if thread.has_attachments {
        score += 5;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use mycelix_core::MailAddress;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, hour, 0, 0).unwrap()
    }

    fn message(subject: &str, from: &str, sent_at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            folder_id: Uuid::nil(),
            message_id: format!("<{}@test>", Uuid::new_v4()),
            subject: subject.to_string(),
            from: MailAddress::new(from),
            to: vec![MailAddress::new("me@example.com")],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            body_text: Some(format!("{subject} body")),
            body_html: None,
            size: 0,
            is_read: false,
            is_starred: false,
            attachments: Vec::new(),
            sent_at,
            created_at: sent_at,
            updated_at: sent_at,
        }
    }

    #[test]
    fn reply_prefixes_normalize_to_one_key() {
        for subject in ["Re: Hello", "RE: Hello", "Hello", "fwd:   hello", "FW: Hello  "] {
            assert_eq!(normalize_subject(subject), "hello", "{subject}");
        }
        assert_eq!(normalize_subject("  Weekly   sync\tnotes "), "weekly sync notes");
        assert_eq!(normalize_subject("Re: Re: Hello"), "re: hello");
        assert_eq!(normalize_subject("Re:"), "");
    }

    #[test]
    fn groups_replies_into_one_thread() {
        let mut bob_reply = message("Re: Hello", "bob@example.com", at(10));
        bob_reply.cc.push(MailAddress::new("carol@example.com"));
        let messages = vec![
            bob_reply,
            message("Hello", "alice@example.com", at(9)),
            message("RE: Hello", "alice@example.com", at(11)),
        ];
        assert!(is_same_thread(&messages[0], &messages[2]));

        let threads = group(&messages);
        assert_eq!(threads.len(), 1);
        let thread = &threads[0];
        assert_eq!(thread.messages, vec![1, 0, 2]);
        assert_eq!(thread.subject, "RE: Hello");
        assert_eq!(thread.normalized_subject, "hello");
        assert_eq!(
            thread.participants,
            vec![
                "alice@example.com",
                "me@example.com",
                "bob@example.com",
                "carol@example.com"
            ]
        );
        assert_eq!(thread.unread_count, 3);
        assert_eq!(thread.preview, "RE: Hello body");
        assert_eq!(thread.id, format!("thread_hello_{}", messages[2].id));
        assert_eq!(thread.resolve(&messages)[0].subject, "Hello");
    }

    #[test]
    fn threads_are_newest_first_and_subjectless_messages_are_dropped() {
        let mut starred = message("Lunch", "carol@example.com", at(8));
        starred.is_starred = true;
        starred.is_read = true;
        let messages = vec![
            starred,
            message("Report", "dave@example.com", at(12)),
            message("", "eve@example.com", at(13)),
            message("Re:", "eve@example.com", at(14)),
        ];

        let threads = group(&messages);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[0].subject, "Report");
        assert_eq!(threads[1].subject, "Lunch");
        assert!(threads[1].is_starred);
        assert_eq!(threads[1].unread_count, 0);
    }

    #[test]
    fn preview_is_limited_to_150_characters() {
        let mut long = message("Essay", "a@example.com", at(9));
        long.body_text = Some("é".repeat(400));
        let threads = group(std::slice::from_ref(&long));
        assert_eq!(threads[0].preview.chars().count(), 150);
    }

    #[test]
    fn formats_participant_overflow() {
        let people: Vec<String> = ["a", "b", "c", "d", "e"].iter().map(|p| p.to_string()).collect();
        assert_eq!(format_participants(&people[..3], 3), "a, b, c");
        assert_eq!(format_participants(&people[..4], 3), "a, b, c, +1 other");
        assert_eq!(format_participants(&people, 3), "a, b, c, +2 others");
        assert_eq!(format_participants(&[], 3), "");
    }

    #[test]
    fn thread_importance_weighs_activity_and_recency() {
        let now = at(12);
        let mut messages: Vec<Message> = (0..6)
            .map(|i| message("Plan", "a@example.com", now - Duration::hours(i)))
            .collect();
        messages[0].is_starred = true;
        let threads = group(&messages);
        let busy = &threads[0];
        // 6 unread, starred, more than 5 messages, newest within the hour.
        assert_eq!(thread_importance(busy, now), 60 + 20 + 15 + 20);

        let mut old = message("Old", "a@example.com", now - Duration::days(10));
        old.is_read = true;
        let threads = group(std::slice::from_ref(&old));
        let quiet = &threads[0];
        assert_eq!(thread_importance(quiet, now), 0);
    }
}
