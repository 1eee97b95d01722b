//! Temporal expression parsing.
//!
//! Turns free text plus a reference instant into resolved calendar dates:
//!
//! - **Absolute** dates (`14/03/2025`, `2025-03-14`, `March 14, 2025`,
//!   `14 March 2025`, and year-less `March 14` / `14 March`).
//! - **Relative** phrases (`tomorrow`, `next week`, `in 3 days`,
//!   `2 months ago`, `next friday`, ...), resolved against the reference.
//! - **Recurring** phrases (`every monday`, `every month`, `daily`, ...),
//!   resolved to their next occurrence and carrying a [`RecurrenceRule`].
//!
//! Content mentioning a birthday, anniversary or holiday turns every absolute
//! date in it into a yearly recurrence: those events come round every year no
//! matter how the date was written.
//!
//! Relative and recurring matches are annotated in place with the resolved
//! date, e.g. `tomorrow` becomes `tomorrow (Saturday, May 31, 2025)`. The
//! annotation itself is never re-matched, so parsing already-processed text
//! leaves it unchanged.
//!
//! Parsing never fails from the caller's point of view: an internal error
//! (arithmetic overflow on an absurd offset, an unparseable count) degrades
//! to the original text, no references, and [`NEUTRAL_SCORE`].

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;

/// Score assigned when temporal enrichment itself failed.
pub const NEUTRAL_SCORE: f32 = 0.5;

/// Absolute dates before this year are treated as noise (phone numbers,
/// version strings, ...).
const MIN_YEAR: i32 = 1900;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a temporal reference was expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemporalKind {
    Absolute,
    Relative,
    Recurring,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
            Frequency::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

/// When a recurring event comes round again.
///
/// `day_of_week` is 0 = Sunday through 6 = Saturday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u8>,
}

impl RecurrenceRule {
    pub fn daily() -> Self {
        Self {
            frequency: Frequency::Daily,
            day_of_week: None,
            day_of_month: None,
            month: None,
        }
    }

    pub fn weekly(weekday: Weekday) -> Self {
        Self {
            frequency: Frequency::Weekly,
            day_of_week: Some(weekday.num_days_from_sunday() as u8),
            day_of_month: None,
            month: None,
        }
    }

    pub fn monthly(day_of_month: u32) -> Self {
        Self {
            frequency: Frequency::Monthly,
            day_of_week: None,
            day_of_month: Some(day_of_month as u8),
            month: None,
        }
    }

    pub fn yearly(month: u32, day_of_month: u32) -> Self {
        Self {
            frequency: Frequency::Yearly,
            day_of_week: None,
            day_of_month: Some(day_of_month as u8),
            month: Some(month as u8),
        }
    }

    /// First occurrence on or after the calendar day of `after`.
    ///
    /// Day-of-month values past the end of a short month clamp to its last
    /// day (a Feb 29 anniversary lands on Feb 28 in common years).
    pub fn next_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = after.date_naive();
        let date = match self.frequency {
            Frequency::Daily => Some(today),
            Frequency::Weekly => {
                let target = self
                    .day_of_week
                    .map(u32::from)
                    .unwrap_or_else(|| today.weekday().num_days_from_sunday());
                let current = today.weekday().num_days_from_sunday();
                let ahead = (target as i64 - current as i64).rem_euclid(7);
                today.checked_add_signed(TimeDelta::try_days(ahead)?)
            }
            Frequency::Monthly => {
                let day = self.day_of_month.map(u32::from).unwrap_or(today.day());
                let this_month = clamped_date(today.year(), today.month(), day)?;
                if this_month >= today {
                    Some(this_month)
                } else {
                    let next = today.checked_add_months(Months::new(1))?;
                    clamped_date(next.year(), next.month(), day)
                }
            }
            Frequency::Yearly => {
                let month = self.month.map(u32::from).unwrap_or(today.month());
                let day = self.day_of_month.map(u32::from).unwrap_or(today.day());
                let this_year = clamped_date(today.year(), month, day)?;
                if this_year >= today {
                    Some(this_year)
                } else {
                    clamped_date(today.year() + 1, month, day)
                }
            }
        };
        date.map(midnight)
    }

    fn describe(&self) -> String {
        match self.frequency {
            Frequency::Daily => "every day".to_string(),
            Frequency::Weekly => match self.day_of_week.and_then(weekday_from_sunday_index) {
                Some(w) => format!("every {}", weekday_name(w)),
                None => "every week".to_string(),
            },
            Frequency::Monthly => match self.day_of_month {
                Some(d) => format!("monthly on day {d}"),
                None => "every month".to_string(),
            },
            Frequency::Yearly => match (self.month, self.day_of_month) {
                (Some(m), Some(d)) => match clamped_date(2000, m as u32, d as u32) {
                    Some(date) => format!("every year on {}", date.format("%B %-d")),
                    None => "every year".to_string(),
                },
                _ => "every year".to_string(),
            },
        }
    }
}

/// One temporal expression found in a piece of text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalReference {
    /// The matched span as written, e.g. `"tomorrow"`.
    pub original_text: String,
    /// Midnight UTC of the resolved calendar day.
    pub resolved_date: Option<DateTime<Utc>>,
    pub kind: TemporalKind,
    /// Confidence in the match \[0.0, 1.0\].
    pub confidence: f32,
    /// Relative to the last evaluation instant, not to storage time.
    pub is_past: bool,
    pub days_since_storage: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<RecurrenceRule>,
}

impl TemporalReference {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Is the resolved day strictly before the day of `now`?
    pub fn is_past_at(&self, now: DateTime<Utc>) -> bool {
        self.resolved_date
            .is_some_and(|d| d.date_naive() < now.date_naive())
    }

    /// Is the resolved day strictly after the day of `now`?
    pub fn is_future_at(&self, now: DateTime<Utc>) -> bool {
        self.resolved_date
            .is_some_and(|d| d.date_naive() > now.date_naive())
    }

    /// Recompute the evaluation-time fields against a new "now".
    pub fn reevaluate(&mut self, now: DateTime<Utc>, stored_at: DateTime<Utc>) {
        self.is_past = self.is_past_at(now);
        self.days_since_storage = days_between(stored_at, now);
    }

    /// Per-reference relevance at `now` for an entry stored at `stored_at`.
    ///
    /// `confidence`, +0.3 for a future date, +0.2 for a recurrence, and an
    /// age penalty for past one-off references (-0.1 between 7 and 30 days
    /// after storage, -0.2 beyond that). Clamped to \[0, 1\].
    pub fn relevance_at(&self, now: DateTime<Utc>, stored_at: DateTime<Utc>) -> f32 {
        let mut score = self.confidence;
        if self.is_future_at(now) {
            score += 0.3;
        }
        if self.is_recurring() {
            score += 0.2;
        } else if self.is_past_at(now) {
            match days_between(stored_at, now) {
                7..=30 => score -= 0.1,
                d if d > 30 => score -= 0.2,
                _ => {}
            }
        }
        score.clamp(0.0, 1.0)
    }

    /// Next occurrence on or after `now` for recurring references.
    pub fn next_occurrence(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.recurrence.and_then(|r| r.next_occurrence(now))
    }

    /// Short human-readable explanation relative to `now`.
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        if let Some(rule) = self.recurrence {
            return match rule.next_occurrence(now) {
                Some(next) => format!(
                    "\"{}\" recurs {} (next: {})",
                    self.original_text,
                    rule.describe(),
                    next.format("%A, %B %-d, %Y")
                ),
                None => format!("\"{}\" recurs {}", self.original_text, rule.describe()),
            };
        }
        let Some(date) = self.resolved_date else {
            return format!("\"{}\"", self.original_text);
        };
        let days = (date.date_naive() - now.date_naive()).num_days();
        let when = match days {
            0 => "today".to_string(),
            1 => "tomorrow".to_string(),
            -1 => "yesterday".to_string(),
            d if d > 1 => format!("in {d} days"),
            d => format!("{} days ago", -d),
        };
        format!(
            "\"{}\" is {} ({})",
            self.original_text,
            when,
            date.format("%A, %B %-d, %Y")
        )
    }
}

/// Output of [`TemporalParser::parse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTemporalContent {
    pub original_content: String,
    /// Content with resolved dates appended after relative/recurring spans.
    pub processed_content: String,
    pub temporal_info: Vec<TemporalReference>,
    pub temporal_relevance_score: f32,
    pub contains_temporal_refs: bool,
    pub resolved_dates: Vec<DateTime<Utc>>,
}

impl ProcessedTemporalContent {
    /// The fallback used when parsing hit an internal error.
    pub fn degraded(content: &str) -> Self {
        Self {
            original_content: content.to_string(),
            processed_content: content.to_string(),
            temporal_info: Vec::new(),
            temporal_relevance_score: NEUTRAL_SCORE,
            contains_temporal_refs: false,
            resolved_dates: Vec::new(),
        }
    }
}

/// Mean of per-reference relevance at `now`; 0.0 when there are none.
pub fn score_references(
    refs: &[TemporalReference],
    now: DateTime<Utc>,
    stored_at: DateTime<Utc>,
) -> f32 {
    if refs.is_empty() {
        return 0.0;
    }
    let total: f32 = refs.iter().map(|r| r.relevance_at(now, stored_at)).sum();
    (total / refs.len() as f32).clamp(0.0, 1.0)
}

#[derive(Debug, thiserror::Error)]
enum TemporalError {
    #[error("date offset out of range: {0}")]
    OutOfRange(String),
    #[error("invalid count: {0}")]
    InvalidNumber(String),
}

// ---------------------------------------------------------------------------
// Pattern table
// ---------------------------------------------------------------------------

/// What a pattern resolved to.
struct Resolution {
    date: NaiveDate,
    recurrence: Option<RecurrenceRule>,
}

/// `Ok(None)` means "matched text, but not a real date" and the match is
/// dropped; `Err` aborts the whole parse.
type Resolver = fn(&Captures<'_>, NaiveDate) -> Result<Option<Resolution>, TemporalError>;

struct Pattern {
    regex: Regex,
    kind: TemporalKind,
    confidence: f32,
    resolve: Resolver,
}

impl Pattern {
    fn new(regex: &str, kind: TemporalKind, confidence: f32, resolve: Resolver) -> Self {
        Self {
            regex: Regex::new(regex).expect("Invalid regex"),
            kind,
            confidence,
            resolve,
        }
    }
}

const MONTHS: &str = "january|february|march|april|may|june|july|august|september|october|november|december|sept|jan|feb|mar|apr|jun|jul|aug|sep|oct|nov|dec";
const WEEKDAYS: &str = "sunday|monday|tuesday|wednesday|thursday|friday|saturday";
const COUNT: &str = r"\d+|an?|one|two|three|four|five|six|seven|eight|nine|ten|eleven|twelve";

/// Absolute shapes, most specific first. A span claimed by an earlier shape
/// is not re-matched by a later one.
static ABSOLUTE_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern::new(
            r"\b(\d{1,2})/(\d{1,2})/(\d{4}|\d{2})\b",
            TemporalKind::Absolute,
            0.9,
            |c, _| Ok(absolute(year_from(&c[3]), num(&c[2]), num(&c[1]))),
        ),
        Pattern::new(
            r"\b(\d{4})-(\d{1,2})-(\d{1,2})\b",
            TemporalKind::Absolute,
            0.9,
            |c, _| Ok(absolute(year_from(&c[1]), num(&c[2]), num(&c[3]))),
        ),
        Pattern::new(
            &format!(r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?,?\s+(\d{{4}})\b"),
            TemporalKind::Absolute,
            0.9,
            |c, _| Ok(absolute(year_from(&c[3]), month_number(&c[1]), num(&c[2]))),
        ),
        Pattern::new(
            &format!(r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\.?,?\s+(\d{{4}})\b"),
            TemporalKind::Absolute,
            0.9,
            |c, _| Ok(absolute(year_from(&c[3]), month_number(&c[2]), num(&c[1]))),
        ),
        Pattern::new(
            &format!(r"(?i)\b({MONTHS})\.?\s+(\d{{1,2}})(?:st|nd|rd|th)?\b"),
            TemporalKind::Absolute,
            0.7,
            |c, reference| Ok(absolute(Some(reference.year()), month_number(&c[1]), num(&c[2]))),
        ),
        Pattern::new(
            &format!(r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({MONTHS})\b"),
            TemporalKind::Absolute,
            0.7,
            |c, reference| Ok(absolute(Some(reference.year()), month_number(&c[2]), num(&c[1]))),
        ),
    ]
});

/// Relative and recurring phrases, in match priority order.
static RELATIVE_PATTERNS: LazyLock<Vec<Pattern>> = LazyLock::new(|| {
    vec![
        Pattern::new(r"(?i)\btomorrow\b", TemporalKind::Relative, 0.95, |_, r| {
            shifted(r, Unit::Day, 1)
        }),
        Pattern::new(r"(?i)\byesterday\b", TemporalKind::Relative, 0.95, |_, r| {
            shifted(r, Unit::Day, -1)
        }),
        Pattern::new(r"(?i)\b(?:today|tonight)\b", TemporalKind::Relative, 0.95, |_, r| {
            shifted(r, Unit::Day, 0)
        }),
        Pattern::new(r"(?i)\bnext\s+week\b", TemporalKind::Relative, 0.8, |_, r| {
            shifted(r, Unit::Week, 1)
        }),
        Pattern::new(r"(?i)\blast\s+week\b", TemporalKind::Relative, 0.8, |_, r| {
            shifted(r, Unit::Week, -1)
        }),
        Pattern::new(r"(?i)\bnext\s+month\b", TemporalKind::Relative, 0.8, |_, r| {
            shifted(r, Unit::Month, 1)
        }),
        Pattern::new(r"(?i)\blast\s+month\b", TemporalKind::Relative, 0.8, |_, r| {
            shifted(r, Unit::Month, -1)
        }),
        Pattern::new(
            &format!(r"(?i)\bin\s+({COUNT})\s+(days?|weeks?|months?|years?)\b"),
            TemporalKind::Relative,
            0.85,
            |c, r| shifted(r, unit_from(&c[2]), parse_count(&c[1])?),
        ),
        Pattern::new(
            &format!(r"(?i)\b({COUNT})\s+(days?|weeks?|months?|years?)\s+ago\b"),
            TemporalKind::Relative,
            0.85,
            |c, r| {
                let n = parse_count(&c[1])?;
                shifted(r, unit_from(&c[2]), -n)
            },
        ),
        Pattern::new(
            &format!(r"(?i)\b(next|last|this)\s+({WEEKDAYS})\b"),
            TemporalKind::Relative,
            0.85,
            |c, r| {
                let Some(target) = weekday_from_name(&c[2]) else {
                    return Ok(None);
                };
                let offset = weekday_offset(r.weekday(), target, &c[1].to_ascii_lowercase());
                shifted(r, Unit::Day, offset)
            },
        ),
        Pattern::new(
            r"(?i)\bevery\s+(day|week|month|year)\b",
            TemporalKind::Recurring,
            0.9,
            |c, r| recurring(r, unit_from(&c[1])),
        ),
        Pattern::new(
            r"(?i)\b(daily|weekly|monthly|yearly|annually)\b",
            TemporalKind::Recurring,
            0.85,
            |c, r| {
                let unit = match c[1].to_ascii_lowercase().as_str() {
                    "daily" => Unit::Day,
                    "weekly" => Unit::Week,
                    "monthly" => Unit::Month,
                    _ => Unit::Year,
                };
                recurring(r, unit)
            },
        ),
        Pattern::new(
            &format!(r"(?i)\bevery\s+({WEEKDAYS})s?\b"),
            TemporalKind::Recurring,
            0.9,
            |c, r| {
                let Some(target) = weekday_from_name(&c[1]) else {
                    return Ok(None);
                };
                let offset = weekday_offset(r.weekday(), target, "next");
                let Some(resolved) = shifted(r, Unit::Day, offset)? else {
                    return Ok(None);
                };
                Ok(Some(Resolution {
                    date: resolved.date,
                    recurrence: Some(RecurrenceRule::weekly(target)),
                }))
            },
        ),
    ]
});

static RECURRING_EVENT_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:birthdays?|bday|b-day|anniversary|anniversaries|holidays?)\b")
        .expect("Invalid regex")
});

/// Matches the annotations this parser writes, so they are never re-matched.
static ANNOTATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\((?:next: )?(?:Monday|Tuesday|Wednesday|Thursday|Friday|Saturday|Sunday), (?:January|February|March|April|May|June|July|August|September|October|November|December) \d{1,2}, \d{4}\)",
    )
    .expect("Invalid regex")
});

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// A match before deduplication.
struct Candidate {
    start: usize,
    end: usize,
    reference: TemporalReference,
    annotate: bool,
}

/// Stateless temporal expression parser over the fixed pattern tables.
#[derive(Debug, Default, Clone, Copy)]
pub struct TemporalParser;

impl TemporalParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse `content` with relative phrases resolved against
    /// `reference_instant`; evaluation-time fields use `reference_instant` as
    /// "now".
    pub fn parse(
        &self,
        content: &str,
        reference_instant: DateTime<Utc>,
        storage_instant: DateTime<Utc>,
    ) -> ProcessedTemporalContent {
        match self.try_parse(content, reference_instant, storage_instant) {
            Ok(processed) => processed,
            Err(e) => {
                tracing::warn!(error = %e, "temporal parsing failed; storing content unenriched");
                ProcessedTemporalContent::degraded(content)
            }
        }
    }

    /// True if `text` contains at least one recognised temporal expression.
    pub fn mentions_time(&self, text: &str) -> bool {
        ABSOLUTE_PATTERNS
            .iter()
            .chain(RELATIVE_PATTERNS.iter())
            .any(|p| p.regex.is_match(text))
    }

    fn try_parse(
        &self,
        content: &str,
        reference_instant: DateTime<Utc>,
        storage_instant: DateTime<Utc>,
    ) -> Result<ProcessedTemporalContent, TemporalError> {
        let reference = reference_instant.date_naive();
        let annotations: Vec<(usize, usize)> = ANNOTATION
            .find_iter(content)
            .map(|m| (m.start(), m.end()))
            .collect();
        let mut claimed = annotations.clone();
        let mut candidates = Vec::new();

        Self::scan(
            &ABSOLUTE_PATTERNS,
            content,
            reference,
            &mut claimed,
            &mut candidates,
        )?;

        if RECURRING_EVENT_KEYWORDS.is_match(content) {
            for candidate in &mut candidates {
                if let Some(date) = candidate.reference.resolved_date {
                    candidate.reference.recurrence =
                        Some(RecurrenceRule::yearly(date.month(), date.day()));
                }
            }
        }

        Self::scan(
            &RELATIVE_PATTERNS,
            content,
            reference,
            &mut claimed,
            &mut candidates,
        )?;

        candidates.sort_by_key(|c| c.start);

        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut inserts: Vec<(usize, String)> = Vec::new();
        for mut candidate in candidates {
            if !seen.insert(candidate.reference.original_text.to_lowercase()) {
                continue;
            }
            candidate
                .reference
                .reevaluate(reference_instant, storage_instant);
            if candidate.annotate && !Self::already_annotated(content, candidate.end, &annotations)
            {
                if let Some(date) = candidate.reference.resolved_date {
                    let label = match candidate.reference.kind {
                        TemporalKind::Recurring => {
                            format!(" (next: {})", date.format("%A, %B %-d, %Y"))
                        }
                        _ => format!(" ({})", date.format("%A, %B %-d, %Y")),
                    };
                    inserts.push((candidate.end, label));
                }
            }
            kept.push(candidate.reference);
        }

        let mut processed_content = content.to_string();
        inserts.sort_by(|a, b| b.0.cmp(&a.0));
        for (at, label) in inserts {
            processed_content.insert_str(at, &label);
        }

        let temporal_relevance_score = score_references(&kept, reference_instant, storage_instant);
        let resolved_dates = kept.iter().filter_map(|r| r.resolved_date).collect();

        Ok(ProcessedTemporalContent {
            original_content: content.to_string(),
            processed_content,
            contains_temporal_refs: !kept.is_empty(),
            temporal_info: kept,
            temporal_relevance_score,
            resolved_dates,
        })
    }

    fn scan(
        patterns: &[Pattern],
        content: &str,
        reference: NaiveDate,
        claimed: &mut Vec<(usize, usize)>,
        out: &mut Vec<Candidate>,
    ) -> Result<(), TemporalError> {
        for pattern in patterns {
            for caps in pattern.regex.captures_iter(content) {
                let Some(whole) = caps.get(0) else {
                    continue;
                };
                let (start, end) = (whole.start(), whole.end());
                if claimed.iter().any(|&(s, e)| start < e && s < end) {
                    continue;
                }
                let Some(resolution) = (pattern.resolve)(&caps, reference)? else {
                    continue;
                };
                claimed.push((start, end));
                out.push(Candidate {
                    start,
                    end,
                    annotate: pattern.kind != TemporalKind::Absolute,
                    reference: TemporalReference {
                        original_text: whole.as_str().to_string(),
                        resolved_date: Some(midnight(resolution.date)),
                        kind: pattern.kind,
                        confidence: pattern.confidence,
                        is_past: false,
                        days_since_storage: 0,
                        recurrence: resolution.recurrence,
                    },
                });
            }
        }
        Ok(())
    }

    /// Is `end` followed (after optional whitespace) by one of our annotations?
    fn already_annotated(content: &str, end: usize, annotations: &[(usize, usize)]) -> bool {
        annotations
            .iter()
            .any(|&(s, _)| s >= end && content[end..s].chars().all(char::is_whitespace))
    }
}

// ---------------------------------------------------------------------------
// Resolution helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Unit {
    Day,
    Week,
    Month,
    Year,
}

fn unit_from(word: &str) -> Unit {
    let w = word.to_ascii_lowercase();
    if w.starts_with("week") {
        Unit::Week
    } else if w.starts_with("month") {
        Unit::Month
    } else if w.starts_with("year") {
        Unit::Year
    } else {
        Unit::Day
    }
}

fn shift(date: NaiveDate, unit: Unit, n: i64) -> Result<NaiveDate, TemporalError> {
    let out_of_range = || TemporalError::OutOfRange(format!("{n} {unit:?} from {date}"));
    match unit {
        Unit::Day | Unit::Week => {
            let days = match unit {
                Unit::Week => n.checked_mul(7).ok_or_else(out_of_range)?,
                _ => n,
            };
            let delta = TimeDelta::try_days(days).ok_or_else(out_of_range)?;
            date.checked_add_signed(delta).ok_or_else(out_of_range)
        }
        Unit::Month | Unit::Year => {
            let months = match unit {
                Unit::Year => n.checked_mul(12).ok_or_else(out_of_range)?,
                _ => n,
            };
            let magnitude = u32::try_from(months.unsigned_abs()).map_err(|_| out_of_range())?;
            let shifted = if months >= 0 {
                date.checked_add_months(Months::new(magnitude))
            } else {
                date.checked_sub_months(Months::new(magnitude))
            };
            shifted.ok_or_else(out_of_range)
        }
    }
}

fn shifted(reference: NaiveDate, unit: Unit, n: i64) -> Result<Option<Resolution>, TemporalError> {
    Ok(Some(Resolution {
        date: shift(reference, unit, n)?,
        recurrence: None,
    }))
}

fn recurring(reference: NaiveDate, unit: Unit) -> Result<Option<Resolution>, TemporalError> {
    let date = shift(reference, unit, 1)?;
    let rule = match unit {
        Unit::Day => RecurrenceRule::daily(),
        Unit::Week => RecurrenceRule::weekly(date.weekday()),
        Unit::Month => RecurrenceRule::monthly(date.day()),
        Unit::Year => RecurrenceRule::yearly(date.month(), date.day()),
    };
    Ok(Some(Resolution {
        date,
        recurrence: Some(rule),
    }))
}

/// Signed day offset from `current` to `target`:
/// `next` lands in (0, 7], `last` in \[-7, 0), `this` in \[0, 7).
fn weekday_offset(current: Weekday, target: Weekday, direction: &str) -> i64 {
    let forward =
        (target.num_days_from_sunday() as i64 - current.num_days_from_sunday() as i64).rem_euclid(7);
    match direction {
        "next" => {
            if forward == 0 {
                7
            } else {
                forward
            }
        }
        "last" => {
            let back = (7 - forward) % 7;
            if back == 0 {
                -7
            } else {
                -back
            }
        }
        _ => forward,
    }
}

fn absolute(year: Option<i32>, month: Option<u32>, day: Option<u32>) -> Option<Resolution> {
    let date = NaiveDate::from_ymd_opt(year?, month?, day?)?;
    if date.year() < MIN_YEAR {
        return None;
    }
    Some(Resolution {
        date,
        recurrence: None,
    })
}

fn num(s: &str) -> Option<u32> {
    s.parse().ok()
}

fn year_from(s: &str) -> Option<i32> {
    let y: i32 = s.parse().ok()?;
    Some(if s.len() == 2 { 2000 + y } else { y })
}

fn parse_count(s: &str) -> Result<i64, TemporalError> {
    let word = s.to_ascii_lowercase();
    let n = match word.as_str() {
        "a" | "an" | "one" => 1,
        "two" => 2,
        "three" => 3,
        "four" => 4,
        "five" => 5,
        "six" => 6,
        "seven" => 7,
        "eight" => 8,
        "nine" => 9,
        "ten" => 10,
        "eleven" => 11,
        "twelve" => 12,
        digits => digits
            .parse::<i64>()
            .map_err(|_| TemporalError::InvalidNumber(digits.to_string()))?,
    };
    Ok(n)
}

fn month_number(name: &str) -> Option<u32> {
    let key: String = name.to_ascii_lowercase().chars().take(3).collect();
    let n = match key.as_str() {
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

fn weekday_from_name(name: &str) -> Option<Weekday> {
    name.to_ascii_lowercase().parse::<Weekday>().ok()
}

fn weekday_from_sunday_index(i: u8) -> Option<Weekday> {
    match i {
        0 => Some(Weekday::Sun),
        1..=6 => Weekday::try_from(i - 1).ok(),
        _ => None,
    }
}

fn weekday_name(w: Weekday) -> &'static str {
    match w {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

fn clamped_date(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
    (1..=day.min(31))
        .rev()
        .find_map(|d| NaiveDate::from_ymd_opt(year, month, d))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to.date_naive() - from.date_naive()).num_days().max(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
