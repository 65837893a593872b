//! Turns exported Drive content into searchable text plus scraped metadata.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use lineout_ingest::DocumentMetadata;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::config::ExtractConfig;
use crate::drive::{DOC_MIME, SHEET_MIME, SLIDES_MIME};

pub const TRUNCATION_MARKER: &str = "[truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    Plain,
    Html,
    Csv,
}

/// How to fetch the body of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportPlan {
    /// Google-native file exported to this MIME type.
    Export(&'static str, ContentFormat),
    /// Stored file fetched with `alt=media`.
    Download(ContentFormat),
    Unsupported,
}

impl ExportPlan {
    pub fn format(&self) -> Option<ContentFormat> {
        match self {
            ExportPlan::Export(_, format) | ExportPlan::Download(format) => Some(*format),
            ExportPlan::Unsupported => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub text: String,
    pub metadata: DocumentMetadata,
    pub truncated: bool,
}

static HASHTAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|[\s(,;])#([A-Za-z][\w-]*)").expect("valid regex"));
static TAGS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*tags?[ \t]*:[ \t]*(.+)$").expect("valid regex"));
static PLAYERS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?im)^[ \t]*players?[ \t]*:[ \t]*(.+)$").expect("valid regex"));
static MD_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[ \t]{0,3}#{1,6}[ \t]+(.+?)[ \t]*#*[ \t]*$").expect("valid regex"));
static ISO_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").expect("valid regex"));
static DMY_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{1,2})/(\d{1,2})/(\d{4})\b").expect("valid regex"));
static LONG_DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(\d{1,2})(?:st|nd|rd|th)?\s+(jan(?:uary)?|feb(?:ruary)?|mar(?:ch)?|apr(?:il)?|may|june?|july?|aug(?:ust)?|sep(?:t(?:ember)?)?|oct(?:ober)?|nov(?:ember)?|dec(?:ember)?)\.?,?\s+(\d{4})\b",
    )
    .expect("valid regex")
});
static SCRIPT_STYLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<script\b.*?</script\s*>|<style\b.*?</style\s*>").expect("valid regex"));
static HTML_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<h[1-6]\b[^>]*>(.*?)</h[1-6]\s*>").expect("valid regex"));
static BLOCK_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</(?:p|div|li|tr|h[1-6]|table|ul|ol|section|article)\s*>")
        .expect("valid regex")
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("valid regex"));
static ENTITY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"&(#[xX][0-9a-fA-F]+|#[0-9]+|[a-zA-Z]+);").expect("valid regex"));

#[derive(Debug, Clone)]
pub struct ContentExtractor {
    max_bytes: usize,
    roster: Vec<(String, Regex)>,
}

impl ContentExtractor {
    pub fn new(config: &ExtractConfig) -> Self {
        let roster = config
            .roster
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .filter_map(|name| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(name).replace(' ', r"\s+"));
                Regex::new(&pattern).ok().map(|re| (name.to_string(), re))
            })
            .collect();
        Self {
            max_bytes: config.max_bytes,
            roster,
        }
    }

    pub fn export_format(mime: &str) -> ExportPlan {
        match mime {
            DOC_MIME => ExportPlan::Export("text/plain", ContentFormat::Plain),
            SHEET_MIME => ExportPlan::Export("text/csv", ContentFormat::Csv),
            SLIDES_MIME => ExportPlan::Export("text/plain", ContentFormat::Plain),
            "text/html" => ExportPlan::Download(ContentFormat::Html),
            "text/csv" => ExportPlan::Download(ContentFormat::Csv),
            "application/json" => ExportPlan::Download(ContentFormat::Plain),
            m if m.starts_with("text/") => ExportPlan::Download(ContentFormat::Plain),
            _ => ExportPlan::Unsupported,
        }
    }

    pub fn extract(&self, format: ContentFormat, body: &str) -> ExtractedContent {
        let mut metadata = DocumentMetadata::default();
        let text = match format {
            ContentFormat::Plain => {
                metadata.headings = markdown_headings(body);
                body.replace("\r\n", "\n")
            }
            ContentFormat::Html => {
                metadata.headings = html_headings(body);
                html_to_text(body)
            }
            ContentFormat::Csv => {
                let rows = parse_csv(body);
                if let Some(header) = rows.first() {
                    metadata.csv_columns = header
                        .iter()
                        .map(|c| c.trim().to_string())
                        .filter(|c| !c.is_empty())
                        .collect();
                }
                metadata.csv_rows = Some(rows.len().saturating_sub(1) as u64);
                rows.iter()
                    .map(|row| {
                        row.iter()
                            .map(|c| c.trim())
                            .filter(|c| !c.is_empty())
                            .collect::<Vec<_>>()
                            .join(" ")
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        };

        metadata.word_count = text.split_whitespace().count() as u64;
        metadata.line_count = text.lines().filter(|l| !l.trim().is_empty()).count() as u64;
        metadata.tags = scrape_tags(&text);
        metadata.dates = scrape_dates(&text);
        metadata.players = self.scrape_players(&text);

        let (text, truncated) = truncate_utf8(text, self.max_bytes);
        ExtractedContent {
            text,
            metadata,
            truncated,
        }
    }

    fn scrape_players(&self, text: &str) -> Vec<String> {
        let mut found: Vec<String> = self
            .roster
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(name, _)| name.clone())
            .collect();

        for caps in PLAYERS_LINE.captures_iter(text) {
            for name in caps[1].split([',', ';']) {
                let name = name.trim().trim_end_matches('.');
                let name = name.strip_prefix("and ").unwrap_or(name).trim();
                if name.is_empty() || name.len() > 60 {
                    continue;
                }
                if !found.iter().any(|f| f.eq_ignore_ascii_case(name)) {
                    found.push(name.to_string());
                }
            }
        }
        found.sort_by_key(|n| n.to_lowercase());
        found
    }
}

fn scrape_tags(text: &str) -> Vec<String> {
    let mut tags = BTreeSet::new();
    for caps in HASHTAG.captures_iter(text) {
        tags.insert(caps[1].to_lowercase());
    }
    for caps in TAGS_LINE.captures_iter(text) {
        for tag in caps[1].split(',') {
            let tag = tag.trim().trim_start_matches('#').trim().to_lowercase();
            if !tag.is_empty() {
                tags.insert(tag);
            }
        }
    }
    tags.into_iter().collect()
}

fn month_number(name: &str) -> Option<u32> {
    let prefix: String = name.chars().take(3).collect::<String>().to_lowercase();
    let n = match prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "aug" => 8,
        "sep" => 9,
        "oct" => 10,
        "nov" => 11,
        "dec" => 12,
        _ => return None,
    };
    Some(n)
}

fn scrape_dates(text: &str) -> Vec<String> {
    let mut dates = BTreeSet::new();
    let mut push = |y: &str, m: u32, d: &str| {
        if let (Ok(y), Ok(d)) = (y.parse::<i32>(), d.parse::<u32>()) {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                dates.insert(date.format("%Y-%m-%d").to_string());
            }
        }
    };
    for caps in ISO_DATE.captures_iter(text) {
        if let Ok(m) = caps[2].parse() {
            push(&caps[1], m, &caps[3]);
        }
    }
    for caps in DMY_DATE.captures_iter(text) {
        if let Ok(m) = caps[2].parse() {
            push(&caps[3], m, &caps[1]);
        }
    }
    for caps in LONG_DATE.captures_iter(text) {
        if let Some(m) = month_number(&caps[2]) {
            push(&caps[3], m, &caps[1]);
        }
    }
    dates.into_iter().collect()
}

fn markdown_headings(text: &str) -> Vec<String> {
    MD_HEADING
        .captures_iter(text)
        .map(|c| c[1].trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

fn html_headings(html: &str) -> Vec<String> {
    HTML_HEADING
        .captures_iter(html)
        .map(|c| decode_entities(&TAG.replace_all(&c[1], "")).trim().to_string())
        .filter(|h| !h.is_empty())
        .collect()
}

fn decode_entities(text: &str) -> String {
    ENTITY
        .replace_all(text, |caps: &regex::Captures| {
            let entity = &caps[1];
            let decoded = if let Some(hex) = entity.strip_prefix("#x").or_else(|| entity.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match entity {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    "ndash" => Some('–'),
                    "mdash" => Some('—'),
                    "hellip" => Some('…'),
                    _ => None,
                }
            };
            decoded
                .map(|c| c.to_string())
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

fn html_to_text(html: &str) -> String {
    let without_scripts = SCRIPT_STYLE.replace_all(html, " ");
    let with_breaks = BLOCK_BREAK.replace_all(&without_scripts, "\n");
    let stripped = TAG.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&stripped);
    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// RFC 4180 style: quoted fields may contain commas, newlines and doubled quotes.
fn parse_csv(body: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = body.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                field.push('"');
                chars.next();
            }
            ('"', true) => in_quotes = false,
            ('"', false) if field.is_empty() => in_quotes = true,
            (',', false) => row.push(std::mem::take(&mut field)),
            ('\r', false) => {}
            ('\n', false) => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| r.iter().any(|c| !c.trim().is_empty()));
    rows
}

/// Cut at a char boundary at or below `max_bytes` and append the marker.
pub fn truncate_utf8(mut text: String, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }
    let mut cut = max_bytes;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push('\n');
    text.push_str(TRUNCATION_MARKER);
    (text, true)
}
