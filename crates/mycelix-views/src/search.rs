use chrono::{DateTime, NaiveDate, Utc};
use mycelix_core::Message;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use uuid::Uuid;

const IMPORTANT_LABEL: &str = "Important";

const OPERATOR_SUGGESTIONS: [(&str, &str); 8] = [
    ("from:", "Emails from specific sender"),
    ("to:", "Emails sent to specific recipient"),
    ("subject:", "Emails with subject containing..."),
    ("has:attachment", "Emails with attachments"),
    ("is:unread", "Unread emails"),
    ("is:starred", "Starred emails"),
    ("is:important", "Important emails"),
    ("label:", "Emails with specific label"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatorKind {
    From,
    To,
    Subject,
    Has,
    Is,
    Before,
    After,
    Label,
}

impl OperatorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::From => "from",
            Self::To => "to",
            Self::Subject => "subject",
            Self::Has => "has",
            Self::Is => "is",
            Self::Before => "before",
            Self::After => "after",
            Self::Label => "label",
        }
    }

    /// Case-insensitive lookup; unknown names are not operators.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "from" => Some(Self::From),
            "to" => Some(Self::To),
            "subject" => Some(Self::Subject),
            "has" => Some(Self::Has),
            "is" => Some(Self::Is),
            "before" => Some(Self::Before),
            "after" => Some(Self::After),
            "label" => Some(Self::Label),
            _ => None,
        }
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOperator {
    pub kind: OperatorKind,
    pub value: String,
    pub negated: bool,
}

impl SearchOperator {
    pub fn new(kind: OperatorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            negated: false,
        }
    }

    pub fn negated(kind: OperatorKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            negated: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub operators: Vec<SearchOperator>,
    pub free_text: Vec<String>,
}

impl ParsedQuery {
    pub fn is_empty(&self) -> bool {
        self.operators.is_empty() && self.free_text.is_empty()
    }
}

impl fmt::Display for ParsedQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_query(&self.operators, &self.free_text))
    }
}

/// Labels attached to messages. Label storage lives outside this crate.
pub trait LabelSource {
    fn labels_for(&self, message_id: Uuid) -> &[String];
}

impl LabelSource for () {
    fn labels_for(&self, _message_id: Uuid) -> &[String] {
        &[]
    }
}

impl LabelSource for HashMap<Uuid, Vec<String>> {
    fn labels_for(&self, message_id: Uuid) -> &[String] {
        self.get(&message_id).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    pub text: String,
    pub description: Option<&'static str>,
}

fn operator_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(-)?(\w+):("([^"]+)"|(\S+))"#).expect("valid search operator regex")
    })
}

/// Splits a query into `[-]name:value` operators and whitespace-separated
/// free text. A `name:value` token with an unknown name is kept verbatim as
/// one free-text token.
pub fn parse(query: &str) -> ParsedQuery {
    let mut parsed = ParsedQuery::default();
    let mut last_end = 0;

    for captures in operator_pattern().captures_iter(query) {
        let Some(whole) = captures.get(0) else {
            continue;
        };
        push_words(&mut parsed.free_text, &query[last_end..whole.start()]);
        last_end = whole.end();

        let name = captures.get(2).map_or("", |m| m.as_str());
        let value = captures
            .get(4)
            .or_else(|| captures.get(5))
            .map_or("", |m| m.as_str());

        match OperatorKind::from_name(name) {
            Some(kind) => parsed.operators.push(SearchOperator {
                kind,
                value: value.to_string(),
                negated: captures.get(1).is_some(),
            }),
            None => parsed.free_text.push(whole.as_str().to_string()),
        }
    }

    push_words(&mut parsed.free_text, &query[last_end..]);
    parsed
}

fn push_words(out: &mut Vec<String>, text: &str) {
    out.extend(text.split_whitespace().map(str::to_string));
}

/// Renders operators and free text back into query syntax. Values holding
/// whitespace are quoted.
pub fn format_query(operators: &[SearchOperator], free_text: &[String]) -> String {
    operators
        .iter()
        .map(|op| {
            let prefix = if op.negated { "-" } else { "" };
            if op.value.contains(char::is_whitespace) {
                format!("{prefix}{}:\"{}\"", op.kind, op.value)
            } else {
                format!("{prefix}{}:{}", op.kind, op.value)
            }
        })
        .chain(free_text.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Messages satisfying every operator and containing every free-text token.
pub fn filter<'a>(
    messages: &'a [Message],
    query: &ParsedQuery,
    labels: &dyn LabelSource,
) -> Vec<&'a Message> {
    messages
        .iter()
        .filter(|message| matches(message, query, labels))
        .collect()
}

pub fn matches(message: &Message, query: &ParsedQuery, labels: &dyn LabelSource) -> bool {
    let operators_hold = query.operators.iter().all(|op| {
        // An operator whose value cannot be evaluated excludes the message
        // whether or not it is negated.
        match evaluate(message, op, labels) {
            Some(hit) => hit != op.negated,
            None => false,
        }
    });
    if !operators_hold {
        return false;
    }
    if query.free_text.is_empty() {
        return true;
    }

    let haystack = searchable_text(message);
    query
        .free_text
        .iter()
        .all(|token| haystack.contains(&token.to_lowercase()))
}

fn evaluate(message: &Message, op: &SearchOperator, labels: &dyn LabelSource) -> Option<bool> {
    let needle = op.value.to_lowercase();
    let hit = match op.kind {
        OperatorKind::From => {
            contains_ci(&message.from.address, &needle)
                || message
                    .from
                    .name
                    .as_deref()
                    .is_some_and(|name| contains_ci(name, &needle))
        }
        OperatorKind::To => message.to.iter().any(|recipient| {
            contains_ci(&recipient.address, &needle)
                || recipient
                    .name
                    .as_deref()
                    .is_some_and(|name| contains_ci(name, &needle))
        }),
        OperatorKind::Subject => contains_ci(&message.subject, &needle),
        OperatorKind::Has => match needle.as_str() {
            "attachment" => message.has_attachments(),
            "link" => [&message.body_text, &message.body_html]
                .into_iter()
                .flatten()
                .any(|body| body.contains("http")),
            _ => return None,
        },
        OperatorKind::Is => match needle.as_str() {
            "unread" => !message.is_read,
            "read" => message.is_read,
            "starred" => message.is_starred,
            "important" => labels
                .labels_for(message.id)
                .iter()
                .any(|label| label.eq_ignore_ascii_case(IMPORTANT_LABEL)),
            _ => return None,
        },
        OperatorKind::Before => message.sent_at < parse_date(&op.value)?,
        OperatorKind::After => message.sent_at > parse_date(&op.value)?,
        OperatorKind::Label => labels
            .labels_for(message.id)
            .iter()
            .any(|label| contains_ci(label, &needle)),
    };
    Some(hit)
}

fn contains_ci(haystack: &str, lowered_needle: &str) -> bool {
    haystack.to_lowercase().contains(lowered_needle)
}

/// `YYYY-MM-DD` (midnight UTC) or a full RFC 3339 timestamp.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn searchable_text(message: &Message) -> String {
    let mut parts = vec![message.subject.as_str()];
    if let Some(name) = message.from.name.as_deref() {
        parts.push(name);
    }
    parts.push(&message.from.address);
    if let Some(body) = message.body_text.as_deref() {
        parts.push(body);
    }
    parts.extend(message.to.iter().map(|addr| addr.address.as_str()));
    parts.extend(message.cc.iter().map(|addr| addr.address.as_str()));
    parts.join(" ").to_lowercase()
}

/// Operator completions while no operator has been typed yet, plus label
/// completions after `label:`.
pub fn suggestions(query: &str, label_names: &[String]) -> Vec<Suggestion> {
    let lowered = query.to_lowercase();
    let mut out = Vec::new();

    if !query.contains(':') {
        out.extend(
            OPERATOR_SUGGESTIONS
                .iter()
                .filter(|(op, _)| op.starts_with(&lowered))
                .map(|(op, description)| Suggestion {
                    text: op.to_string(),
                    description: Some(*description),
                }),
        );
    }

    if let Some(partial) = lowered.strip_prefix("label:") {
        out.extend(
            label_names
                .iter()
                .filter(|name| name.to_lowercase().contains(partial))
                .map(|name| Suggestion {
                    text: format!("label:{name}"),
                    description: None,
                }),
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use mycelix_core::{MailAddress, MailAttachment};

    fn message(from: &str, subject: &str, body: &str) -> Message {
        let now = Utc::now();
        Message {
            id: Uuid::new_v4(),
            account_id: Uuid::nil(),
            folder_id: Uuid::nil(),
            message_id: format!("<{}@test>", Uuid::new_v4()),
            subject: subject.to_string(),
            from: MailAddress::new(from),
            to: vec![MailAddress::named("Me", "me@example.com")],
            cc: Vec::new(),
            bcc: Vec::new(),
            reply_to: Vec::new(),
            body_text: Some(body.to_string()),
            body_html: None,
            size: 0,
            is_read: false,
            is_starred: false,
            attachments: Vec::new(),
            sent_at: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
            created_at: now,
            updated_at: now,
        }
    }

    fn mailbox() -> Vec<Message> {
        let mut report = message("alice@x.com", "Quarterly report", "numbers inside");
        report.attachments.push(MailAttachment {
            filename: "q2.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            size: 10,
            content_id: None,
        });
        let mut lunch = message("bob@y.org", "Lunch?", "see https://maps.example.com");
        lunch.is_read = true;
        lunch.is_starred = true;
        lunch.sent_at = Utc.with_ymd_and_hms(2024, 1, 10, 12, 0, 0).unwrap();
        vec![report, lunch]
    }

    #[test]
    fn parses_operators_quotes_negation_and_free_text() {
        let parsed = parse(r#"budget from:alice -is:read subject:"quarterly report" final"#);
        assert_eq!(
            parsed.operators,
            vec![
                SearchOperator::new(OperatorKind::From, "alice"),
                SearchOperator::negated(OperatorKind::Is, "read"),
                SearchOperator::new(OperatorKind::Subject, "quarterly report"),
            ]
        );
        assert_eq!(parsed.free_text, vec!["budget", "final"]);
    }

    #[test]
    fn unknown_operator_names_are_free_text() {
        let parsed = parse("color:blue FROM:Alice");
        assert_eq!(parsed.free_text, vec!["color:blue"]);
        assert_eq!(parsed.operators.len(), 1);
        assert_eq!(parsed.operators[0].kind, OperatorKind::From);
        assert_eq!(parsed.operators[0].value, "Alice");
    }

    #[test]
    fn negation_excludes_exactly_what_the_operator_includes() {
        let messages = mailbox();
        let included = filter(&messages, &parse("from:alice"), &());
        let excluded = filter(&messages, &parse("-from:alice"), &());

        assert_eq!(included.len(), 1);
        assert_eq!(included[0].from.address, "alice@x.com");
        assert!(excluded.iter().all(|m| m.from.address != "alice@x.com"));
        assert_eq!(excluded.len(), 1);
    }

    #[test]
    fn operators_and_free_text_are_conjunctive() {
        let messages = mailbox();
        assert_eq!(filter(&messages, &parse("has:attachment is:unread"), &()).len(), 1);
        assert_eq!(filter(&messages, &parse("has:link is:starred"), &()).len(), 1);
        assert_eq!(filter(&messages, &parse("has:attachment is:starred"), &()).len(), 0);
        assert_eq!(filter(&messages, &parse("report NUMBERS"), &()).len(), 1);
        assert_eq!(filter(&messages, &parse("report lunch"), &()).len(), 0);
        assert_eq!(filter(&messages, &parse("to:me@example"), &()).len(), 2);
        assert_eq!(filter(&messages, &parse(""), &()).len(), 2);
    }

    #[test]
    fn date_operators_accept_days_and_timestamps() {
        let messages = mailbox();
        let before = filter(&messages, &parse("before:2024-03-01"), &());
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].subject, "Lunch?");

        let after = filter(&messages, &parse("after:2024-06-15T11:00:00Z"), &());
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].subject, "Quarterly report");
    }

    #[test]
    fn invalid_values_fail_closed_even_when_negated() {
        let messages = mailbox();
        for query in [
            "before:someday",
            "-before:someday",
            "has:pdf",
            "-has:pdf",
            "is:urgent",
            "-is:urgent",
        ] {
            assert!(filter(&messages, &parse(query), &()).is_empty(), "{query}");
        }
    }

    #[test]
    fn labels_come_from_the_label_source() {
        let messages = mailbox();
        let mut labels: HashMap<Uuid, Vec<String>> = HashMap::new();
        labels.insert(
            messages[1].id,
            vec!["Important".to_string(), "Personal/Food".to_string()],
        );

        let important = filter(&messages, &parse("is:important"), &labels);
        assert_eq!(important.len(), 1);
        assert_eq!(important[0].id, messages[1].id);
        assert_eq!(filter(&messages, &parse("label:food"), &labels).len(), 1);
        assert_eq!(filter(&messages, &parse("-label:food"), &labels).len(), 1);
        assert!(filter(&messages, &parse("is:important"), &()).is_empty());
    }

    #[test]
    fn formatting_round_trips_through_parse() {
        let operators = vec![
            SearchOperator::new(OperatorKind::From, "alice@x.com"),
            SearchOperator::negated(OperatorKind::Is, "read"),
            SearchOperator::new(OperatorKind::After, "2024-01-01"),
            SearchOperator::negated(OperatorKind::Label, "work"),
        ];
        let free_text = vec!["budget".to_string(), "q3".to_string()];

        let formatted = format_query(&operators, &free_text);
        assert_eq!(
            formatted,
            "from:alice@x.com -is:read after:2024-01-01 -label:work budget q3"
        );
        let reparsed = parse(&formatted);
        assert_eq!(format_query(&reparsed.operators, &reparsed.free_text), formatted);
        assert_eq!(reparsed.to_string(), formatted);
    }

    #[test]
    fn quoted_values_survive_a_round_trip() {
        let operators = vec![SearchOperator::new(OperatorKind::Subject, "weekly sync")];
        let formatted = format_query(&operators, &[]);
        assert_eq!(formatted, r#"subject:"weekly sync""#);
        assert_eq!(parse(&formatted).operators, operators);
    }

    #[test]
    fn suggests_operators_then_labels() {
        let labels = vec!["Work".to_string(), "Workshop".to_string(), "Home".to_string()];

        let texts = |query: &str| -> Vec<String> {
            suggestions(query, &labels)
                .into_iter()
                .map(|s| s.text)
                .collect()
        };

        assert_eq!(texts("is"), vec!["is:unread", "is:starred", "is:important"]);
        assert_eq!(texts("").len(), 8);
        assert_eq!(texts("label:wor"), vec!["label:Work", "label:Workshop"]);
        assert!(texts("from:al").is_empty());
    }
}
