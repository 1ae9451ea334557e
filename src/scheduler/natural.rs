//! Natural-language schedule phrases → cron expressions.
//!
//! An ordered table of rules is tried in sequence; the first rule whose
//! pattern matches and whose builder accepts the captures wins. Phrases that
//! match nothing are parsed as raw cron.

use regex::{Captures, Regex};
use tracing::debug;

use crate::error::ScheduleError;
use crate::scheduler::cron::CronExpression;

/// Cron expression that is never due (February 31st).
pub const NEVER: &str = "0 0 31 2 *";

/// Time-of-day fragment shared by several rules.
const TIME: &str = r"(?P<time>\d{1,2}(?::\d{2})?\s*(?:am|pm)?|noon|midnight)";

/// Weekday name fragment (full, abbreviated, or plural).
const DAY: &str = r"(?:mon|tue|wed|thu|fri|sat|sun)[a-z]*";

/// Builds a cron string from a rule's captures, or rejects the match.
pub type RuleBuilder = fn(&Captures<'_>) -> Option<String>;

/// A single phrase rule with a compiled regex.
#[derive(Debug, Clone)]
pub struct PhraseRule {
    /// Human-readable description for logs.
    pub name: &'static str,
    /// Anchored pattern matched against the normalized phrase.
    pub regex: Regex,
    pub build: RuleBuilder,
}

/// Translates schedule phrases such as "every 15 minutes" or "weekdays at
/// 9am" into cron expressions.
#[derive(Debug, Clone)]
pub struct NaturalLanguageParser {
    rules: Vec<PhraseRule>,
}

impl NaturalLanguageParser {
    /// Parser with the default phrase rules.
    pub fn new() -> Self {
        let rule = |name: &'static str, pattern: &str, build: RuleBuilder| PhraseRule {
            name,
            regex: Regex::new(&format!("^(?:{pattern})$")).unwrap(),
            build,
        };

        let rules = vec![
            rule("never", r"never", |_| Some(NEVER.into())),
            rule("every minute", r"every minute", |_| {
                Some("* * * * *".into())
            }),
            rule(
                "every N units",
                r"every (?P<n>\d+) (?P<unit>minute|hour|day|week|month|year)s?",
                every_n,
            ),
            rule(
                "every unit",
                r"every (?P<unit>hour|day|week|month|year)",
                |caps| named_interval(&caps["unit"]),
            ),
            rule(
                "named interval",
                r"(?P<unit>hourly|daily|weekly|monthly|yearly|annually|midnight|noon)",
                |caps| named_interval(&caps["unit"]),
            ),
            rule(
                "time of day",
                &format!(r"(?:(?:daily|every day) )?at {TIME}"),
                |caps| daily_at(&caps["time"], "*"),
            ),
            rule(
                "weekdays/weekends",
                &format!(r"(?:every |on )?(?P<kind>weekday|weekend)s?(?: at {TIME})?"),
                |caps| {
                    let days = if &caps["kind"] == "weekday" { "1-5" } else { "0,6" };
                    daily_at(caps.name("time").map_or("midnight", |m| m.as_str()), days)
                },
            ),
            rule(
                "business hours",
                r"(?:during |every hour during )?business hours",
                |_| Some("0 9-17 * * 1-5".into()),
            ),
            rule(
                "day names",
                &format!(
                    r"(?:every |on )?(?P<days>{DAY}(?:(?:\s*,\s*|\s+and\s+|\s*&\s*|\s*,\s*and\s+){DAY})*)(?: at {TIME})?"
                ),
                |caps| {
                    let days = weekday_list(&caps["days"])?;
                    daily_at(caps.name("time").map_or("midnight", |m| m.as_str()), &days)
                },
            ),
            rule(
                "monthly on the Nth",
                &format!(
                    r"(?:monthly|every month) on the (?P<day>\d{{1,2}})(?:st|nd|rd|th)?(?: at {TIME})?"
                ),
                monthly_on,
            ),
            rule(
                "Nth of every month",
                &format!(
                    r"on the (?P<day>\d{{1,2}})(?:st|nd|rd|th)? of (?:every|each) month(?: at {TIME})?"
                ),
                monthly_on,
            ),
        ];

        Self { rules }
    }

    /// Add a custom rule, tried after the defaults.
    pub fn add_rule(
        &mut self,
        name: &'static str,
        pattern: &str,
        build: RuleBuilder,
    ) -> Result<(), regex::Error> {
        self.rules.push(PhraseRule {
            name,
            regex: Regex::new(&format!("^(?:{pattern})$"))?,
            build,
        });
        Ok(())
    }

    /// Translate a phrase (or raw cron text) into a cron expression.
    pub fn parse(&self, phrase: &str) -> Result<CronExpression, ScheduleError> {
        let normalized = normalize(phrase);

        for rule in &self.rules {
            let Some(caps) = rule.regex.captures(&normalized) else {
                continue;
            };
            if let Some(cron) = (rule.build)(&caps) {
                debug!(phrase = %phrase, rule = rule.name, cron = %cron, "Matched schedule phrase");
                return CronExpression::parse(&cron);
            }
        }

        CronExpression::parse(phrase).map_err(|_| ScheduleError::Unparseable(phrase.to_string()))
    }
}

impl Default for NaturalLanguageParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase, collapse whitespace, drop a trailing period.
fn normalize(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches('.')
        .to_string()
}

fn every_n(caps: &Captures<'_>) -> Option<String> {
    let n: u32 = caps["n"].parse().ok()?;
    if n == 0 {
        return None;
    }
    let cron = match (&caps["unit"], n) {
        ("minute", 1) => "* * * * *".to_string(),
        ("minute", 2..=59) => format!("*/{n} * * * *"),
        ("hour", 1) => "0 * * * *".to_string(),
        ("hour", 2..=23) => format!("0 */{n} * * *"),
        ("day", 1) => "0 0 * * *".to_string(),
        ("day", 2..=31) => format!("0 0 */{n} * *"),
        ("week", 1) => "0 0 * * 0".to_string(),
        ("week", 2..=4) => format!("0 0 */{} * *", n * 7),
        ("month", 1) => "0 0 1 * *".to_string(),
        ("month", 2..=12) => format!("0 0 1 */{n} *"),
        ("year", 1) => "0 0 1 1 *".to_string(),
        _ => return None,
    };
    Some(cron)
}

fn named_interval(unit: &str) -> Option<String> {
    let cron = match unit {
        "hour" | "hourly" => "0 * * * *",
        "day" | "daily" | "midnight" => "0 0 * * *",
        "week" | "weekly" => "0 0 * * 0",
        "month" | "monthly" => "0 0 1 * *",
        "year" | "yearly" | "annually" => "0 0 1 1 *",
        "noon" => "0 12 * * *",
        _ => return None,
    };
    Some(cron.into())
}

fn monthly_on(caps: &Captures<'_>) -> Option<String> {
    let day: u32 = caps["day"].parse().ok()?;
    if !(1..=31).contains(&day) {
        return None;
    }
    let (hour, minute) = parse_time(caps.name("time").map_or("midnight", |m| m.as_str()))?;
    Some(format!("{minute} {hour} {day} * *"))
}

/// `M H * * <days>` for a time-of-day phrase.
fn daily_at(time: &str, days: &str) -> Option<String> {
    let (hour, minute) = parse_time(time)?;
    Some(format!("{minute} {hour} * * {days}"))
}

/// Parse "9", "9:30", "9pm", "12:15 am", "noon", "midnight" into (hour, minute).
fn parse_time(text: &str) -> Option<(u32, u32)> {
    match text.trim() {
        "noon" => return Some((12, 0)),
        "midnight" => return Some((0, 0)),
        _ => {}
    }

    let text = text.replace(' ', "");
    let (clock, meridiem) = if let Some(rest) = text.strip_suffix("am") {
        (rest, Some(false))
    } else if let Some(rest) = text.strip_suffix("pm") {
        (rest, Some(true))
    } else {
        (text.as_str(), None)
    };

    let (hour, minute) = match clock.split_once(':') {
        Some((h, m)) => (h.parse::<u32>().ok()?, m.parse::<u32>().ok()?),
        None => (clock.parse::<u32>().ok()?, 0),
    };
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        Some(pm) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (hour, pm) {
                (12, false) => 0,
                (12, true) => 12,
                (h, true) => h + 12,
                (h, false) => h,
            }
        }
        None if hour <= 23 => hour,
        None => return None,
    };
    Some((hour, minute))
}

/// Map a list of weekday names to a sorted cron day list ("1,3,5").
fn weekday_list(text: &str) -> Option<String> {
    const NAMES: [&str; 7] = [
        "sunday",
        "monday",
        "tuesday",
        "wednesday",
        "thursday",
        "friday",
        "saturday",
    ];

    let mut days: Vec<usize> = Vec::new();
    for word in text
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|w| !w.is_empty() && *w != "and")
    {
        let word = word.strip_suffix('s').filter(|w| w.len() >= 3).unwrap_or(word);
        let idx = NAMES.iter().position(|name| {
            name.starts_with(word) && word.len() >= 3 || (word == "tues" && *name == "tuesday")
        })?;
        if !days.contains(&idx) {
            days.push(idx);
        }
    }
    if days.is_empty() {
        return None;
    }
    days.sort_unstable();
    Some(
        days.iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(","),
    )
}
