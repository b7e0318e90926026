use chrono::{DateTime, Utc};
use mycelix_core::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

pub const URGENT_KEYWORDS: [&str; 10] = [
    "urgent",
    "asap",
    "important",
    "critical",
    "emergency",
    "deadline",
    "time-sensitive",
    "action required",
    "immediate",
    "priority",
];

const KNOWN_TLDS: [&str; 5] = [".com", ".org", ".net", ".io", ".co"];

pub const AUTO_LABEL_THRESHOLD: u8 = 50;
const MAX_SCORE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportanceLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ImportanceLevel {
    pub fn from_score(score: u8) -> Self {
        match score {
            70.. => Self::Critical,
            50..=69 => Self::High,
            30..=49 => Self::Medium,
            _ => Self::Low,
        }
    }
}

pub fn should_auto_label(score: u8) -> bool {
    score >= AUTO_LABEL_THRESHOLD
}

fn reply_or_forward() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)^(re:|fwd:)").expect("valid reply regex"))
}

pub fn score(message: &Message, user_email: Option<&str>, vip_contacts: &[String]) -> u8 {
    score_at(message, user_email, vip_contacts, Utc::now())
}

/// Additive heuristic in `0..=100`. Signals are summed, then capped.
pub fn score_at(
    message: &Message,
    user_email: Option<&str>,
    vip_contacts: &[String],
    now: DateTime<Utc>,
) -> u8 {
    let mut score: u32 = 0;

    if let Some(user) = user_email {
        let is_user = |address: &str| address.eq_ignore_ascii_case(user);
        if message.to.iter().any(|to| is_user(&to.address)) {
            score += 20;
        } else if message.cc.iter().any(|cc| is_user(&cc.address)) {
            score += 5;
        }
    }

    if vip_contacts
        .iter()
        .any(|vip| vip.eq_ignore_ascii_case(&message.from.address))
    {
        score += 30;
    }

    let subject = message.subject.to_lowercase();
    let body = message
        .body_text
        .as_deref()
        .unwrap_or_default()
        .to_lowercase();
    for keyword in URGENT_KEYWORDS {
        if subject.contains(keyword) {
            score += 15;
        } else if body.contains(keyword) {
            score += 10;
        }
    }

    if let (Some(sender_domain), Some(user)) = (message.from.domain(), user_email) {
        let user_domain = user
            .split_once('@')
            .map(|(_, domain)| domain.to_lowercase());
        if user_domain.as_deref() == Some(sender_domain.as_str()) {
            score += 15;
        }
        if KNOWN_TLDS.iter().any(|tld| sender_domain.ends_with(tld)) {
            score += 5;
        }
    }

    match message.to.len() + message.cc.len() {
        1 => score += 10,
        0..=3 => score += 5,
        _ => {}
    }

    if message.has_attachments() {
        score += 5;
    }
    if reply_or_forward().is_match(&message.subject) {
        score += 5;
    }

    let minutes = (now - message.sent_at).num_minutes();
    if minutes < 60 {
        score += 10;
    } else if minutes < 24 * 60 {
        score += 5;
    }

    if message.is_starred {
        score += 25;
    }

    score.min(MAX_SCORE) as u8
}

/// Highest score first; ties keep their input order.
pub fn sort_by_importance<'a>(
    messages: &'a [Message],
    user_email: Option<&str>,
    vip_contacts: &[String],
    now: DateTime<Utc>,
) -> Vec<&'a Message> {
    let mut scored: Vec<(u8, &Message)> = messages
        .iter()
        .map(|message| (score_at(message, user_email, vip_contacts, now), message))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, message)| message).collect()
}

pub fn filter_important<'a>(
    messages: &'a [Message],
    min_score: u8,
    user_email: Option<&str>,
    vip_contacts: &[String],
    now: DateTime<Utc>,
) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|message| score_at(message, user_email, vip_contacts, now) >= min_score)
        .collect()
}
