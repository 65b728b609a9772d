//! Deterministic obligation detection.
//!
//! A sentence is an obligation when it carries both an obligation cue
//! ("need to", "pay", "remember to", ...) and temporal language that
//! resolves to a due date or signals urgency. Relative expressions are
//! resolved against a reference date (the artifact's extraction date).
//!
//! Model-proposed action items are grounded against what this detector finds:
//! proposals with no matching obligation sentence are dropped and obligations
//! the model missed are added.

use std::collections::HashSet;
use std::sync::OnceLock;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use regex::Regex;

use crate::domain::{ActionItem, Priority};

/// Obligations due within this many days are high priority
const URGENT_WITHIN_DAYS: i64 = 7;

/// Minimum share of the shorter task's words two tasks must share to match
const MATCH_OVERLAP: f32 = 0.5;

const MONTHS: [&str; 12] = [
    "january",
    "february",
    "march",
    "april",
    "may",
    "june",
    "july",
    "august",
    "september",
    "october",
    "november",
    "december",
];

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "have", "need", "must", "should",
    "will", "before", "until", "next", "due", "our", "your", "their", "then", "please",
];

struct Patterns {
    obligation: Regex,
    urgent: Regex,
    someday: Regex,
    filler: Regex,
    iso: Regex,
    relative_day: Regex,
    offset: Regex,
    end_of: Regex,
    next_week: Regex,
    weekday: Regex,
    day_month: Regex,
    month_day: Regex,
}

fn patterns() -> Option<&'static Patterns> {
    static PATTERNS: OnceLock<Option<Patterns>> = OnceLock::new();
    PATTERNS
        .get_or_init(|| {
            let month = MONTHS.join("|");
            Some(Patterns {
                obligation: Regex::new(
                    r"(?i)\b(must|have to|has to|had better|need to|needs to|should|ought to|remember to|don't forget|do not forget|make sure|todo|to-do|pay|call|send|submit|renew|book|schedule|buy|finish|reply|respond|sign|file|return|cancel|deadline|due)\b",
                )
                .ok()?,
                urgent: Regex::new(
                    r"(?i)\b(urgent|urgently|asap|as soon as possible|immediately|critical|important|overdue|deadline)\b",
                )
                .ok()?,
                someday: Regex::new(
                    r"(?i)\b(someday|some day|eventually|sometime|at some point|no rush|low priority|when possible)\b",
                )
                .ok()?,
                filler: Regex::new(
                    r"(?i)^\s*(?:[-*•]\s*)?(?:(?:todo|to-do)\s*:?\s*)?(?:please\s+)?(?:(?:i|we|you)\s+)?(?:really\s+)?(?:must|have to|need to|should|ought to|remember to|don't forget to|do not forget to|make sure to)?\s*",
                )
                .ok()?,
                iso: Regex::new(r"\b(\d{4})-(\d{2})-(\d{2})\b").ok()?,
                relative_day: Regex::new(r"(?i)\b(day after tomorrow|tomorrow|today|tonight)\b")
                    .ok()?,
                offset: Regex::new(
                    r"(?i)\bin\s+(\d+|a|an|one|two|three|four|five|six|seven|eight|nine|ten)\s+(day|days|week|weeks|month|months)\b",
                )
                .ok()?,
                end_of: Regex::new(r"(?i)\b(?:by\s+)?(?:the\s+)?end\s+of\s+(?:the\s+|this\s+)?(week|month)\b")
                    .ok()?,
                next_week: Regex::new(r"(?i)\bnext\s+week\b").ok()?,
                weekday: Regex::new(
                    r"(?i)\b(next\s+|this\s+|coming\s+)?(monday|tuesday|wednesday|thursday|friday|saturday|sunday)\b",
                )
                .ok()?,
                day_month: Regex::new(&format!(
                    r"(?i)\b(\d{{1,2}})(?:st|nd|rd|th)?\s+(?:of\s+)?({})\b",
                    month
                ))
                .ok()?,
                month_day: Regex::new(&format!(
                    r"(?i)\b({})\s+(\d{{1,2}})(?:st|nd|rd|th)?\b",
                    month
                ))
                .ok()?,
            })
        })
        .as_ref()
}

/// Find obligation sentences in `text` and turn them into action items
pub fn detect(text: &str, reference: NaiveDate) -> Vec<ActionItem> {
    let Some(p) = patterns() else {
        return Vec::new();
    };

    let mut items: Vec<ActionItem> = Vec::new();
    for sentence in sentences(text) {
        if !p.obligation.is_match(sentence) {
            continue;
        }

        let due = resolve_due(sentence, reference);
        let urgent = p.urgent.is_match(sentence);
        if due.is_none() && !urgent {
            continue;
        }

        let task = task_text(sentence);
        if task.is_empty() || items.iter().any(|i| i.task.eq_ignore_ascii_case(&task)) {
            continue;
        }

        items.push(ActionItem {
            task,
            due,
            priority: priority_for(sentence, due, reference),
            context: Some(sentence.trim().to_string()),
        });
    }
    items
}

/// Resolve the first temporal expression in `text` to a calendar date
pub fn resolve_due(text: &str, reference: NaiveDate) -> Option<NaiveDate> {
    let p = patterns()?;

    if let Some(c) = p.iso.captures(text) {
        let date = NaiveDate::from_ymd_opt(
            c[1].parse().ok()?,
            c[2].parse().ok()?,
            c[3].parse().ok()?,
        );
        if date.is_some() {
            return date;
        }
    }

    if let Some(c) = p.relative_day.captures(text) {
        let days = match c[1].to_lowercase().as_str() {
            "day after tomorrow" => 2,
            "tomorrow" => 1,
            _ => 0,
        };
        return reference.checked_add_days(Days::new(days));
    }

    if let Some(c) = p.offset.captures(text) {
        let n = parse_count(&c[1])?;
        let unit = c[2].to_lowercase();
        return if unit.starts_with("day") {
            reference.checked_add_days(Days::new(u64::from(n)))
        } else if unit.starts_with("week") {
            reference.checked_add_days(Days::new(u64::from(n) * 7))
        } else {
            reference.checked_add_months(Months::new(n))
        };
    }

    if let Some(c) = p.end_of.captures(text) {
        return if c[1].eq_ignore_ascii_case("week") {
            Some(upcoming(reference, Weekday::Fri, false))
        } else {
            last_day_of_month(reference)
        };
    }

    if p.next_week.is_match(text) {
        return Some(upcoming(reference, Weekday::Mon, true));
    }

    if let Some(c) = p.weekday.captures(text) {
        let strictly_after = c
            .get(1)
            .map(|m| m.as_str().trim().eq_ignore_ascii_case("next"))
            .unwrap_or(false);
        let weekday: Weekday = c[2].parse().ok()?;
        return Some(upcoming(reference, weekday, strictly_after));
    }

    if let Some(c) = p.day_month.captures(text) {
        return calendar_date(reference, &c[2], &c[1]);
    }
    if let Some(c) = p.month_day.captures(text) {
        return calendar_date(reference, &c[1], &c[2]);
    }

    None
}

/// Keep model items that match a detected obligation and add the ones it missed
pub fn ground(proposed: Vec<ActionItem>, detected: Vec<ActionItem>) -> Vec<ActionItem> {
    if detected.is_empty() {
        return Vec::new();
    }

    let mut matched = vec![false; detected.len()];
    let mut grounded = Vec::new();

    for mut item in proposed {
        let words = significant_words(&item.task);
        let best = detected
            .iter()
            .enumerate()
            .map(|(idx, d)| (idx, overlap(&words, &significant_words(&d.task))))
            .filter(|(_, score)| *score >= MATCH_OVERLAP)
            .max_by(|a, b| a.1.total_cmp(&b.1));

        let Some((idx, _)) = best else {
            continue;
        };
        matched[idx] = true;

        let anchor = &detected[idx];
        if item.due.is_none() {
            item.due = anchor.due;
        }
        item.priority = item.priority.max(anchor.priority);
        if item.context.is_none() {
            item.context = anchor.context.clone();
        }
        if !grounded
            .iter()
            .any(|g: &ActionItem| g.task.eq_ignore_ascii_case(&item.task))
        {
            grounded.push(item);
        }
    }

    grounded.extend(
        detected
            .into_iter()
            .zip(matched)
            .filter(|(_, was_matched)| !was_matched)
            .map(|(item, _)| item),
    );
    grounded
}

fn priority_for(sentence: &str, due: Option<NaiveDate>, reference: NaiveDate) -> Priority {
    let Some(p) = patterns() else {
        return Priority::Normal;
    };
    if p.urgent.is_match(sentence) {
        return Priority::High;
    }
    if p.someday.is_match(sentence) {
        return Priority::Low;
    }
    match due {
        Some(d) if (d - reference).num_days() <= URGENT_WITHIN_DAYS => Priority::High,
        _ => Priority::Normal,
    }
}

/// Split on sentence punctuation followed by whitespace, and on line breaks
fn sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, ch)) = chars.next() {
        let boundary = match ch {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map(|(_, next)| next.is_whitespace()).unwrap_or(true),
            _ => false,
        };
        if boundary {
            let end = idx + ch.len_utf8();
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

fn task_text(sentence: &str) -> String {
    let stripped = match patterns() {
        Some(p) => p.filler.replace(sentence, "").into_owned(),
        None => sentence.to_string(),
    };
    let trimmed = stripped
        .trim()
        .trim_end_matches(['.', '!', '?', ';', ','])
        .trim();

    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Next `target` weekday on or after `from` (strictly after if `strict`)
fn upcoming(from: NaiveDate, target: Weekday, strict: bool) -> NaiveDate {
    let current = from.weekday().num_days_from_monday();
    let wanted = target.num_days_from_monday();
    let mut ahead = (7 + wanted - current) % 7;
    if strict && ahead == 0 {
        ahead = 7;
    }
    from + chrono::Duration::days(i64::from(ahead))
}

fn last_day_of_month(date: NaiveDate) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(date.year(), date.month(), 1)?;
    first.checked_add_months(Months::new(1))?.pred_opt()
}

/// Day/month without a year: this year, or next year if already past
fn calendar_date(reference: NaiveDate, month: &str, day: &str) -> Option<NaiveDate> {
    let month = MONTHS
        .iter()
        .position(|m| m.eq_ignore_ascii_case(month))? as u32
        + 1;
    let day: u32 = day.parse().ok()?;
    let this_year = NaiveDate::from_ymd_opt(reference.year(), month, day)?;
    if this_year >= reference {
        Some(this_year)
    } else {
        NaiveDate::from_ymd_opt(reference.year() + 1, month, day)
    }
}

/// Counted units in "in N days"; anything past `u32` is not a date
fn parse_count(word: &str) -> Option<u32> {
    let n = match word.to_lowercase().as_str() {
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
        digits => digits.parse().ok()?,
    };
    Some(n)
}

fn significant_words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|w| w.chars().count() >= 3 && !STOPWORDS.contains(&w.as_str()))
        .collect()
}

fn overlap(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f32 / smaller as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    // Monday
    fn reference() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_bill_by_friday() {
        let items = detect("Pay the electricity bill by Friday.", reference());
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].task, "Pay the electricity bill by Friday");
        assert_eq!(items[0].due, Some(date(2026, 10, 23)));
        assert_eq!(items[0].priority, Priority::High);
    }

    #[test]
    fn test_neutral_text_has_no_items() {
        let text = "The weather was lovely. We walked along the river and talked about books.";
        assert!(detect(text, reference()).is_empty());
    }

    #[test]
    fn test_obligation_without_time_is_ignored() {
        assert!(detect("I should call the plumber.", reference()).is_empty());
    }

    #[test]
    fn test_resolve_relative_expressions() {
        let r = reference();
        assert_eq!(resolve_due("tomorrow", r), Some(date(2026, 10, 20)));
        assert_eq!(resolve_due("the day after tomorrow", r), Some(date(2026, 10, 21)));
        assert_eq!(resolve_due("in 2 weeks", r), Some(date(2026, 11, 2)));
        assert_eq!(resolve_due("in a month", r), Some(date(2026, 11, 19)));
        assert_eq!(resolve_due("by end of month", r), Some(date(2026, 10, 31)));
        assert_eq!(resolve_due("end of the week", r), Some(date(2026, 10, 23)));
        assert_eq!(resolve_due("next week", r), Some(date(2026, 10, 26)));
        assert_eq!(resolve_due("on Monday", r), Some(date(2026, 10, 19)));
        assert_eq!(resolve_due("next Monday", r), Some(date(2026, 10, 26)));
        assert_eq!(resolve_due("before 2026-12-01", r), Some(date(2026, 12, 1)));
        assert_eq!(resolve_due("by 3rd of March", r), Some(date(2027, 3, 3)));
        assert_eq!(resolve_due("on November 5th", r), Some(date(2026, 11, 5)));
        assert_eq!(resolve_due("whenever", r), None);
    }

    #[test]
    fn test_absurd_offsets_resolve_to_nothing() {
        let r = reference();
        assert_eq!(resolve_due("I must pay this in 3000000000000000000 weeks", r), None);
        assert_eq!(resolve_due("due in 4000000000 days", r), None);
        assert_eq!(resolve_due("in 99999999 months", r), None);
        assert!(detect("I must pay this in 3000000000000000000 weeks.", r).is_empty());
    }

    #[test]
    fn test_priority_rules() {
        let r = reference();
        let far = detect("Renew the passport by 2027-06-01.", r);
        assert_eq!(far[0].priority, Priority::Normal);

        let someday = detect("Someday we need to book a trip in 3 months.", r);
        assert_eq!(someday[0].priority, Priority::Low);

        let urgent = detect("Urgent: send the signed contract.", r);
        assert_eq!(urgent[0].priority, Priority::High);
        assert_eq!(urgent[0].due, None);
    }

    #[test]
    fn test_filler_is_stripped() {
        let items = detect("Don't forget to submit the tax form tomorrow!", reference());
        assert_eq!(items[0].task, "Submit the tax form tomorrow");
    }

    #[test]
    fn test_ground_drops_ungrounded_and_adds_missed() {
        let r = reference();
        let detected = detect(
            "Pay the electricity bill by Friday. Call the dentist tomorrow.",
            r,
        );
        assert_eq!(detected.len(), 2);

        let proposed = vec![
            ActionItem::new("Pay electricity bill"),
            ActionItem::new("Enjoy the weekend"),
        ];
        let grounded = ground(proposed, detected);

        assert_eq!(grounded.len(), 2);
        assert_eq!(grounded[0].task, "Pay electricity bill");
        assert_eq!(grounded[0].due, Some(date(2026, 10, 23)));
        assert!(grounded[1].task.starts_with("Call the dentist"));
    }

    #[test]
    fn test_ground_with_nothing_detected_is_empty() {
        let grounded = ground(vec![ActionItem::new("Buy milk")], Vec::new());
        assert!(grounded.is_empty());
    }
}
