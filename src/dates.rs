use chrono::{Datelike, Days, NaiveDate, NaiveTime, Weekday};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::ops::Range;

static DATE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?ix)
        \b(?:
            (?P<relative>today|tomorrow|yesterday)
          | next\s+(?P<next>week|monday|tuesday|wednesday|thursday|friday|saturday|sunday)
          | in\s+(?P<count>\d{1,4})\s+(?P<unit>days?|weeks?)
          | (?P<iso>\d{4}-\d{1,2}-\d{1,2})
          | (?P<weekday>monday|tuesday|wednesday|thursday|friday|saturday|sunday)
        )
        (?:\s+at\s+(?P<hour>\d{1,2})(?::(?P<minute>\d{2}))?\s*(?P<meridiem>am|pm)?)?
        \b",
    )
    .expect("valid date phrase regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
}

impl ResolvedDate {
    pub fn has_time(&self) -> bool {
        self.time.is_some()
    }

    /// `YYYY-MM-DD`, or `YYYY-MM-DDTHH:MM` when a time was given.
    pub fn display_value(&self) -> String {
        match self.time {
            Some(time) => format!("{}T{}", self.date.format("%Y-%m-%d"), time.format("%H:%M")),
            None => self.date.format("%Y-%m-%d").to_string(),
        }
    }
}

/// Byte ranges of every date phrase candidate in `input`, longest match first at each position.
pub fn find_date_phrases(input: &str) -> Vec<Range<usize>> {
    DATE_PHRASE.find_iter(input).map(|found| found.range()).collect()
}

/// Resolves a candidate phrase relative to `today`. `None` means the phrase has a
/// recognizable shape but does not name a real date or time.
pub fn resolve_phrase(phrase: &str, today: NaiveDate) -> Option<ResolvedDate> {
    let captures = DATE_PHRASE.captures(phrase)?;
    resolve_captures(&captures, today)
}

/// Like [`resolve_phrase`] but the whole (trimmed) input must be a single phrase.
pub fn resolve_exact(input: &str, today: NaiveDate) -> Option<ResolvedDate> {
    let trimmed = input.trim();
    let captures = DATE_PHRASE.captures(trimmed)?;
    let whole = captures.get(0)?;
    if whole.start() != 0 || whole.end() != trimmed.len() {
        return None;
    }
    resolve_captures(&captures, today)
}

fn resolve_captures(captures: &Captures<'_>, today: NaiveDate) -> Option<ResolvedDate> {
    let date: Option<NaiveDate> = if let Some(relative) = captures.name("relative") {
        match relative.as_str().to_ascii_lowercase().as_str() {
            "today" => Some(today),
            "tomorrow" => today.checked_add_days(Days::new(1)),
            "yesterday" => today.checked_sub_days(Days::new(1)),
            _ => None,
        }
    } else if let Some(next) = captures.name("next") {
        let lowered = next.as_str().to_ascii_lowercase();
        if lowered == "week" {
            today.checked_add_days(Days::new(7))
        } else {
            parse_weekday(&lowered).and_then(|weekday| next_weekday(today, weekday))
        }
    } else if let Some(count) = captures.name("count") {
        let count: u64 = count.as_str().parse().ok()?;
        let unit = captures.name("unit").map(|value| value.as_str().to_ascii_lowercase())?;
        let days = if unit.starts_with("week") { count.checked_mul(7)? } else { count };
        today.checked_add_days(Days::new(days))
    } else if let Some(iso) = captures.name("iso") {
        NaiveDate::parse_from_str(iso.as_str(), "%Y-%m-%d").ok()
    } else if let Some(weekday) = captures.name("weekday") {
        parse_weekday(&weekday.as_str().to_ascii_lowercase()).and_then(|weekday| next_weekday(today, weekday))
    } else {
        None
    };
    let date = date?;

    let time = match captures.name("hour") {
        Some(hour) => Some(resolve_time(
            hour.as_str(),
            captures.name("minute").map(|value| value.as_str()),
            captures.name("meridiem").map(|value| value.as_str()),
        )?),
        None => None,
    };

    Some(ResolvedDate { date, time })
}

fn resolve_time(hour: &str, minute: Option<&str>, meridiem: Option<&str>) -> Option<NaiveTime> {
    let mut hour: u32 = hour.parse().ok()?;
    let minute: u32 = match minute {
        Some(raw) => raw.parse().ok()?,
        None => 0,
    };
    match meridiem.map(str::to_ascii_lowercase).as_deref() {
        Some("am") => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            if hour == 12 {
                hour = 0;
            }
        }
        Some("pm") => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            if hour != 12 {
                hour += 12;
            }
        }
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

fn parse_weekday(raw: &str) -> Option<Weekday> {
    match raw {
        "monday" => Some(Weekday::Mon),
        "tuesday" => Some(Weekday::Tue),
        "wednesday" => Some(Weekday::Wed),
        "thursday" => Some(Weekday::Thu),
        "friday" => Some(Weekday::Fri),
        "saturday" => Some(Weekday::Sat),
        "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}

/// First `weekday` strictly after `today`.
fn next_weekday(today: NaiveDate, weekday: Weekday) -> Option<NaiveDate> {
    let current = today.weekday().num_days_from_monday() as i64;
    let target = weekday.num_days_from_monday() as i64;
    let mut delta = (target - current).rem_euclid(7);
    if delta == 0 {
        delta = 7;
    }
    today.checked_add_days(Days::new(delta as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Thursday
    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).expect("valid date")
    }

    fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).expect("valid date")
    }

    #[test]
    fn relative_words_resolve_against_today() {
        assert_eq!(resolve_phrase("today", today()).map(|r| r.date), Some(today()));
        assert_eq!(resolve_phrase("Tomorrow", today()).map(|r| r.date), Some(ymd(2026, 1, 16)));
        assert_eq!(resolve_phrase("yesterday", today()).map(|r| r.date), Some(ymd(2026, 1, 14)));
    }

    #[test]
    fn weekdays_land_strictly_after_today() {
        assert_eq!(resolve_phrase("next monday", today()).map(|r| r.date), Some(ymd(2026, 1, 19)));
        assert_eq!(resolve_phrase("next thursday", today()).map(|r| r.date), Some(ymd(2026, 1, 22)));
        assert_eq!(resolve_phrase("friday", today()).map(|r| r.date), Some(ymd(2026, 1, 16)));
        assert_eq!(resolve_phrase("next week", today()).map(|r| r.date), Some(ymd(2026, 1, 22)));
    }

    #[test]
    fn offsets_and_iso_dates() {
        assert_eq!(resolve_phrase("in 3 days", today()).map(|r| r.date), Some(ymd(2026, 1, 18)));
        assert_eq!(resolve_phrase("in 1 day", today()).map(|r| r.date), Some(ymd(2026, 1, 16)));
        assert_eq!(resolve_phrase("in 2 weeks", today()).map(|r| r.date), Some(ymd(2026, 1, 29)));
        assert_eq!(resolve_phrase("2026-02-28", today()).map(|r| r.date), Some(ymd(2026, 2, 28)));
    }

    #[test]
    fn trailing_time_is_parsed() {
        let resolved = resolve_phrase("tomorrow at 5pm", today()).expect("resolved");
        assert_eq!(resolved.time, NaiveTime::from_hms_opt(17, 0, 0));
        assert!(resolved.has_time());
        assert_eq!(resolved.display_value(), "2026-01-16T17:00");

        let resolved = resolve_phrase("2026-03-01 at 9:45", today()).expect("resolved");
        assert_eq!(resolved.time, NaiveTime::from_hms_opt(9, 45, 0));

        let resolved = resolve_phrase("today at 12am", today()).expect("resolved");
        assert_eq!(resolved.time, NaiveTime::from_hms_opt(0, 0, 0));
    }

    #[test]
    fn impossible_values_are_unresolved() {
        assert!(resolve_phrase("2026-02-30", today()).is_none());
        assert!(resolve_phrase("tomorrow at 25:00", today()).is_none());
        assert!(resolve_phrase("today at 13pm", today()).is_none());
    }

    #[test]
    fn longest_candidate_includes_time_suffix() {
        let input = "Call mom tomorrow at 10am please";
        let ranges = find_date_phrases(input);
        assert_eq!(ranges.len(), 1);
        assert_eq!(&input[ranges[0].clone()], "tomorrow at 10am");
    }

    #[test]
    fn words_containing_date_terms_are_not_candidates() {
        assert!(find_date_phrases("todayish mondays").is_empty());
    }

    #[test]
    fn exact_resolution_requires_whole_input() {
        assert_eq!(resolve_exact("  tomorrow ", today()).map(|r| r.date), Some(ymd(2026, 1, 16)));
        assert!(resolve_exact("sometime tomorrow", today()).is_none());
        assert!(resolve_exact("whenever", today()).is_none());
    }
}
