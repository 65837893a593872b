//! Keyword and regex intent matching for chat messages.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

const DEFAULT_RECENT: usize = 5;
const MAX_RECENT: usize = 20;
const DEFAULT_DAYS: i64 = 14;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    SearchDocuments { query: String, tags: Vec<String> },
    ListRecent { limit: usize },
    UpcomingEvents { days: i64 },
    SendEmail { to: String, subject: String, body: String },
    Notify { audience: String, message: String },
    SyncStatus,
    Help,
    Unknown,
}

impl Intent {
    pub fn name(&self) -> &'static str {
        match self {
            Intent::SearchDocuments { .. } => "search_documents",
            Intent::ListRecent { .. } => "list_recent",
            Intent::UpcomingEvents { .. } => "upcoming_events",
            Intent::SendEmail { .. } => "send_email",
            Intent::Notify { .. } => "notify",
            Intent::SyncStatus => "sync_status",
            Intent::Help => "help",
            Intent::Unknown => "unknown",
        }
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).expect("valid regex")
}

static HELP: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)^\s*(?:help|\?+|what can you do|commands)\s*[?!.]*\s*$"));
static EMAIL_VERB: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:e-?mail|send\s+(?:a\s+)?(?:message|mail))\b"));
static ADDRESS: Lazy<Regex> = Lazy::new(|| re(r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+"));
static SUBJECT: Lazy<Regex> = Lazy::new(|| {
    re(r#"(?i)\b(?:subject|about|re)\b[:\s]+(?:"([^"]+)"|(.+?))(?:\s+(?:saying|with body|body)\b|:|$)"#)
});
static BODY: Lazy<Regex> = Lazy::new(|| re(r"(?i)(?:\b(?:saying|with body|body)\b[:\s]*|:\s*)(.+)$"));
static NOTIFY: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^\s*(?:please\s+)?(?:notify|alert|remind|tell|message)\s+(?:the\s+)?(team|squad|players|coaches|forwards|backs|everyone|all|[\w.+-]+@[\w-]+(?:\.[\w-]+)+)\b[\s,:]*(?:that\s+|to\s+|about\s+)?(.+)$")
});
static SYNC_STATUS: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:sync(?:ing|hroni[sz]ation)?\s+status|status\s+of\s+(?:the\s+)?sync|last\s+sync|index(?:ing)?\s+status|is\s+(?:the\s+)?(?:drive\s+)?(?:sync|index)\w*\s+(?:up\s+to\s+date|working|running))\b")
});
static RECENT: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:recent|latest|newest|new|last)\b(?:\s+\d+)?(?:\s+\w+)?\s+(?:docs?|documents?|files?|uploads?|changes)\b|\bwhat'?s\s+new\b")
});
static SEARCH_VERB: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:find|search(?:\s+for)?|look(?:ing)?\s+(?:up|for)|where\s+(?:is|are)|locate|pull\s+up)\b")
});
static EVENTS: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)\b(?:upcoming|schedule|calendar|fixtures?|events?|what'?s\s+on|next\s+(?:match|game|session|training|fixture))\b")
});
static NUMBER: Lazy<Regex> = Lazy::new(|| re(r"\b(\d{1,3})\b"));
static NEXT_DAYS: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:next|coming|within)\s+(\d{1,3})\s+days?\b"));
static QUOTED: Lazy<Regex> = Lazy::new(|| re(r#"["“]([^"”]{2,})["”]"#));
static TOPIC_STRONG: Lazy<Regex> =
    Lazy::new(|| re(r"(?i)\b(?:about|regarding|called|named|titled|mentioning)\s+(.+)$"));
static TOPIC_WEAK: Lazy<Regex> = Lazy::new(|| re(r"(?i)\b(?:for|on)\s+(.+)$"));
static HASHTAG: Lazy<Regex> = Lazy::new(|| re(r"#([A-Za-z][\w-]*)"));
static COMMAND_PREFIX: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^\s*(?:(?:can|could)\s+you\s+)?(?:please\s+)?(?:find|search(?:\s+for)?|look(?:ing)?\s+(?:up|for)|where\s+(?:is|are)|locate|pull\s+up|show\s+me)\s+")
});
static FILLER: Lazy<Regex> = Lazy::new(|| {
    re(r"(?i)^(?:(?:the|a|an|any|all|my|our|some)\s+)*(?:(?:docs?|documents?|files?|notes)\b\s*)?(?:(?:about|for|on|regarding)\s+)?")
});
static TRAILING: Lazy<Regex> = Lazy::new(|| re(r"(?i)(?:\s+(?:docs?|documents?|files?|please))+\s*$"));

/// Ordered rules: the first match wins.
#[derive(Debug, Default, Clone)]
pub struct IntentClassifier;

impl IntentClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, text: &str) -> Intent {
        let text = text.trim();
        if text.is_empty() || HELP.is_match(text) {
            return Intent::Help;
        }
        if EMAIL_VERB.is_match(text) {
            if let Some(intent) = email_intent(text) {
                return intent;
            }
        }
        if let Some(caps) = NOTIFY.captures(text) {
            let audience = match caps[1].to_lowercase().as_str() {
                "everyone" | "all" | "squad" | "players" => "team".to_string(),
                other => other.to_string(),
            };
            let message = caps[2].trim().to_string();
            if !message.is_empty() {
                return Intent::Notify { audience, message };
            }
        }
        if SYNC_STATUS.is_match(text) {
            return Intent::SyncStatus;
        }
        if RECENT.is_match(text) {
            let limit = NUMBER
                .captures(text)
                .and_then(|c| c[1].parse::<usize>().ok())
                .unwrap_or(DEFAULT_RECENT)
                .clamp(1, MAX_RECENT);
            return Intent::ListRecent { limit };
        }
        if SEARCH_VERB.is_match(text) {
            return search_intent(text);
        }
        if EVENTS.is_match(text) {
            return Intent::UpcomingEvents {
                days: days_from(text),
            };
        }
        if QUOTED.is_match(text) || TOPIC_STRONG.is_match(text) || HASHTAG.is_match(text) {
            return search_intent(text);
        }
        Intent::Unknown
    }
}

fn email_intent(text: &str) -> Option<Intent> {
    let to = ADDRESS.find(text)?.as_str().to_string();
    let rest = &text[text.find(&to).map(|i| i + to.len()).unwrap_or(0)..];
    let subject = SUBJECT
        .captures(rest)
        .and_then(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "Message from Lineout".to_string());
    let body = BODY
        .captures(rest)
        .map(|c| c[1].trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| subject.clone());
    Some(Intent::SendEmail { to, subject, body })
}

fn days_from(text: &str) -> i64 {
    let lower = text.to_lowercase();
    if let Some(caps) = NEXT_DAYS.captures(&lower) {
        if let Ok(days) = caps[1].parse::<i64>() {
            return days.clamp(1, 365);
        }
    }
    if lower.contains("today") {
        1
    } else if lower.contains("tomorrow") {
        2
    } else if lower.contains("week") {
        7
    } else if lower.contains("month") {
        30
    } else {
        DEFAULT_DAYS
    }
}

fn clean_query(raw: &str) -> String {
    let without_tags = HASHTAG.replace_all(raw, " ");
    let trimmed = without_tags.trim_matches(|c: char| c.is_whitespace() || "?.!,".contains(c));
    let trimmed = FILLER.replace(trimmed, "");
    let trimmed = TRAILING.replace(&trimmed, "");
    trimmed.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Topic of a search request: a quoted phrase, the words after
/// "about"/"called"/..., then after "for"/"on", else the message minus the verb.
pub fn extract_query(text: &str) -> String {
    if let Some(caps) = QUOTED.captures(text) {
        return caps[1].trim().to_string();
    }
    let stripped = COMMAND_PREFIX.replace(text, "");
    for rule in [&*TOPIC_STRONG, &*TOPIC_WEAK] {
        if let Some(caps) = rule.captures(&stripped) {
            let query = clean_query(&caps[1]);
            if !query.is_empty() {
                return query;
            }
        }
    }
    clean_query(&stripped)
}

pub fn extract_tags(text: &str) -> Vec<String> {
    let mut tags: Vec<String> = HASHTAG
        .captures_iter(text)
        .map(|c| c[1].to_lowercase())
        .collect();
    tags.sort();
    tags.dedup();
    tags
}

fn search_intent(text: &str) -> Intent {
    Intent::SearchDocuments {
        query: extract_query(text),
        tags: extract_tags(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(text: &str) -> Intent {
        IntentClassifier::new().classify(text)
    }

    #[test]
    fn test_search_with_topic() {
        assert_eq!(
            classify("find documents about lineout calls"),
            Intent::SearchDocuments {
                query: "lineout calls".into(),
                tags: vec![]
            }
        );
        assert_eq!(
            classify("search for the scrum drills"),
            Intent::SearchDocuments {
                query: "scrum drills".into(),
                tags: vec![]
            }
        );
    }

    #[test]
    fn test_quoted_phrase_and_tags() {
        assert_eq!(
            classify("look for \"exit strategy\" #defence #Kicking"),
            Intent::SearchDocuments {
                query: "exit strategy".into(),
                tags: vec!["defence".into(), "kicking".into()]
            }
        );
        assert_eq!(
            classify("anything regarding maul defence?"),
            Intent::SearchDocuments {
                query: "maul defence".into(),
                tags: vec![]
            }
        );
    }

    #[test]
    fn test_recent_documents() {
        assert_eq!(classify("show me the latest documents"), Intent::ListRecent { limit: 5 });
        assert_eq!(classify("last 3 uploaded files"), Intent::ListRecent { limit: 3 });
        assert_eq!(classify("what's new?"), Intent::ListRecent { limit: 5 });
    }

    #[test]
    fn test_upcoming_events() {
        assert_eq!(classify("what's on this week"), Intent::UpcomingEvents { days: 7 });
        assert_eq!(classify("upcoming fixtures in the next 21 days"), Intent::UpcomingEvents { days: 21 });
        assert_eq!(classify("when is the next match"), Intent::UpcomingEvents { days: 14 });
    }

    #[test]
    fn test_send_email() {
        assert_eq!(
            classify("email coach@club-x.org about Saturday kit: bring both jerseys"),
            Intent::SendEmail {
                to: "coach@club-x.org".into(),
                subject: "Saturday kit".into(),
                body: "bring both jerseys".into()
            }
        );
        match classify("send an email to physio@club.org") {
            Intent::SendEmail { to, subject, .. } => {
                assert_eq!(to, "physio@club.org");
                assert_eq!(subject, "Message from Lineout");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_notify() {
        assert_eq!(
            classify("notify the squad that training moves to 7pm"),
            Intent::Notify {
                audience: "team".into(),
                message: "training moves to 7pm".into()
            }
        );
        assert_eq!(
            classify("remind coaches: selection meeting at 6"),
            Intent::Notify {
                audience: "coaches".into(),
                message: "selection meeting at 6".into()
            }
        );
    }

    #[test]
    fn test_status_help_unknown() {
        assert_eq!(classify("what's the sync status?"), Intent::SyncStatus);
        assert_eq!(classify("help"), Intent::Help);
        assert_eq!(classify(""), Intent::Help);
        assert_eq!(classify("good game lads"), Intent::Unknown);
    }
}
