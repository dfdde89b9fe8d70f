//! Cron evaluator for classic 5-field expressions (`minute hour
//! day-of-month month day-of-week`), civil-time DST aware (spec.md §4.2).
//!
//! Grounded in the teacher's `scheduler.rs::next_run_time`, which padded a
//! 5-field expression to 7 fields and delegated to the `cron` crate. That
//! approach doesn't give us control over the DST skip/ambiguous-instant
//! rules the spec requires, so this module parses and evaluates fields
//! itself against `chrono`/`chrono-tz` civil time, in the same spirit as
//! the teacher's helper (small, self-contained, called from the scheduler
//! loop) rather than a generic crate.

use crate::error::{CloudGatherError, Result};
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone)]
pub struct CronSchedule {
    minute: FieldSet,
    hour: FieldSet,
    day_of_month: FieldSet,
    month: FieldSet,
    day_of_week: FieldSet,
    source: String,
}

/// A parsed field: the set of values it matches, stored as a bitset-ish
/// sorted `Vec` (these ranges are tiny, 0..=59 at most).
#[derive(Debug, Clone)]
struct FieldSet {
    values: Vec<u32>,
}

impl FieldSet {
    fn matches(&self, v: u32) -> bool {
        self.values.contains(&v)
    }
}

fn parse_field(raw: &str, min: u32, max: u32) -> Result<FieldSet> {
    let mut values = Vec::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(CloudGatherError::InvalidCron(format!("empty field part in '{raw}'")));
        }
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s
                    .parse()
                    .map_err(|_| CloudGatherError::InvalidCron(format!("bad step in '{part}'")))?;
                if step == 0 {
                    return Err(CloudGatherError::InvalidCron(format!("zero step in '{part}'")));
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a: u32 = a
                .parse()
                .map_err(|_| CloudGatherError::InvalidCron(format!("bad range start in '{part}'")))?;
            let b: u32 = b
                .parse()
                .map_err(|_| CloudGatherError::InvalidCron(format!("bad range end in '{part}'")))?;
            if a > b || a < min || b > max {
                return Err(CloudGatherError::InvalidCron(format!(
                    "range '{part}' out of bounds [{min},{max}]"
                )));
            }
            (a, b)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| CloudGatherError::InvalidCron(format!("bad value '{part}'")))?;
            if v < min || v > max {
                return Err(CloudGatherError::InvalidCron(format!(
                    "value '{part}' out of bounds [{min},{max}]"
                )));
            }
            (v, v)
        };

        let mut v = lo;
        while v <= hi {
            values.push(v);
            v += step;
        }
    }
    values.sort_unstable();
    values.dedup();
    Ok(FieldSet { values })
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.trim().split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CloudGatherError::InvalidCron(format!(
                "expected 5 fields, got {} in '{expr}'",
                fields.len()
            )));
        }
        let minute = parse_field(fields[0], 0, 59)?;
        let hour = parse_field(fields[1], 0, 23)?;
        let day_of_month = parse_field(fields[2], 1, 31)?;
        let month = parse_field(fields[3], 1, 12)?;
        // Weekdays 0-6, Sunday = 0. Some authors also write 7 for Sunday;
        // accept it and fold it onto 0.
        let mut day_of_week = parse_field(fields[4], 0, 7)?;
        for v in day_of_week.values.iter_mut() {
            if *v == 7 {
                *v = 0;
            }
        }
        day_of_week.values.sort_unstable();
        day_of_week.values.dedup();

        Ok(CronSchedule {
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
            source: expr.trim().to_string(),
        })
    }

    fn matches_civil(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.day_of_month.matches(dt.day())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Returns the next fire instant strictly after `from`, evaluated in
    /// `tz`. Walks forward minute-by-minute (cron's finest granularity);
    /// a one-year bound guards against unsatisfiable expressions (e.g.
    /// Feb 30).
    pub fn next_fire(&self, from: DateTime<Utc>, tz: Tz) -> Result<DateTime<Utc>> {
        let local = from.with_timezone(&tz);
        let mut candidate_naive = local
            .naive_local()
            .date()
            .and_hms_opt(local.hour(), local.minute(), 0)
            .unwrap()
            + chrono::Duration::minutes(1);

        let limit = candidate_naive + chrono::Duration::days(366 * 2);

        loop {
            if candidate_naive > limit {
                return Err(CloudGatherError::InvalidCron(format!(
                    "no fire time found for '{}' within two years of {from}",
                    self.source
                )));
            }

            if !self.matches_civil(&candidate_naive) {
                candidate_naive += chrono::Duration::minutes(1);
                continue;
            }

            match tz.from_local_datetime(&candidate_naive) {
                chrono::LocalResult::Single(dt) => {
                    let utc = dt.with_timezone(&Utc);
                    if utc > from {
                        return Ok(utc);
                    }
                }
                chrono::LocalResult::Ambiguous(earliest, _latest) => {
                    // A repeated instant (fall-back) fires only once: take
                    // the earliest occurrence.
                    let utc = earliest.with_timezone(&Utc);
                    if utc > from {
                        return Ok(utc);
                    }
                }
                chrono::LocalResult::None => {
                    // A skipped instant (spring-forward gap): this civil
                    // time never happens locally, so it does not fire.
                    // Fall through to the next candidate minute.
                }
            }
            candidate_naive += chrono::Duration::minutes(1);
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

/// `validate(expr) -> (ok, description)`.
pub fn validate(expr: &str) -> (bool, String) {
    match CronSchedule::parse(expr) {
        Ok(schedule) => (true, describe(&schedule)),
        Err(e) => (false, e.to_string()),
    }
}

/// `nextFire(expr, fromInstant) -> instant`, timezone given by name (falls
/// back to UTC on an unrecognized name rather than failing the whole call,
/// since the scheduler must keep making progress).
pub fn next_fire(expr: &str, from: DateTime<Utc>, tz_name: &str) -> Result<DateTime<Utc>> {
    let schedule = CronSchedule::parse(expr)?;
    let tz: Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    schedule.next_fire(from, tz)
}

fn describe(schedule: &CronSchedule) -> String {
    let minute_desc = describe_field(&schedule.minute, 0, 59, "minute");
    let hour_desc = describe_field(&schedule.hour, 0, 23, "hour");
    let dom_desc = if schedule.day_of_month.values.len() == 31 {
        "every day of the month".to_string()
    } else {
        format!("on day(s) {:?} of the month", schedule.day_of_month.values)
    };
    let month_desc = if schedule.month.values.len() == 12 {
        "every month".to_string()
    } else {
        format!("in month(s) {:?}", schedule.month.values)
    };
    let dow_desc = if schedule.day_of_week.values.len() == 7 {
        "any day of the week".to_string()
    } else {
        let names = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];
        let rendered: Vec<&str> = schedule
            .day_of_week
            .values
            .iter()
            .map(|v| names[*v as usize])
            .collect();
        format!("on {}", rendered.join(","))
    };

    format!("{minute_desc}, {hour_desc}, {dom_desc}, {month_desc}, {dow_desc}")
}

fn describe_field(field: &FieldSet, min: u32, max: u32, unit: &str) -> String {
    if field.values.len() as u32 == max - min + 1 {
        format!("every {unit}")
    } else if field.values.len() >= 2 {
        let step = field.values[1] - field.values[0];
        let is_uniform_step = field
            .values
            .windows(2)
            .all(|w| w[1] - w[0] == step);
        if is_uniform_step && step > 1 {
            format!("every {step} {unit}s starting at {}", field.values[0])
        } else {
            format!("at {unit}s {:?}", field.values)
        }
    } else {
        format!("at {unit} {}", field.values.first().copied().unwrap_or(0))
    }
}

/// `randomFromPattern(pattern) -> expr`.
pub fn random_from_pattern(pattern: &str) -> Result<String> {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    match pattern {
        "hourly" => Ok(format!("{} * * * *", rng.gen_range(0..60))),
        "daily" => Ok(format!("{} {} * * *", rng.gen_range(0..60), rng.gen_range(0..24))),
        "night" => {
            let (start, end) = night_window();
            Ok(format!("{} {} * * *", rng.gen_range(0..60), rng.gen_range(start..end)))
        }
        other => Err(CloudGatherError::InvalidCron(format!("unknown pattern '{other}'"))),
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CronPreset {
    pub name: &'static str,
    pub expr: &'static str,
    pub description: &'static str,
}

/// `listPresets() -> [{name, expr, description}]`.
pub fn list_presets() -> Vec<CronPreset> {
    vec![
        CronPreset {
            name: "every_5_minutes",
            expr: "*/5 * * * *",
            description: "Every 5 minutes",
        },
        CronPreset {
            name: "hourly",
            expr: "0 * * * *",
            description: "Once an hour, on the hour",
        },
        CronPreset {
            name: "daily_2am",
            expr: "0 2 * * *",
            description: "Once a day at 02:00",
        },
        CronPreset {
            name: "weekly_sunday",
            expr: "0 3 * * 0",
            description: "Once a week, Sunday at 03:00",
        },
        CronPreset {
            name: "weekdays_nightly",
            expr: "0 2 * * 1-5",
            description: "Monday-Friday at 02:00",
        },
    ]
}

/// A day boundary helper used by tests and by `random_from_pattern`'s
/// "night" window; kept separate so the window is documented once.
pub fn night_window() -> (u32, u32) {
    (1, 6)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn validate_accepts_classic_expression() {
        let (ok, desc) = validate("*/15 2-6 * * 1-5");
        assert!(ok);
        assert!(desc.contains("every 15 minute"));
    }

    #[test]
    fn validate_rejects_bad_field_count() {
        let (ok, _) = validate("* * * *");
        assert!(!ok);
    }

    #[test]
    fn next_fire_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 10, 2, 30, 0).unwrap();
        let next = next_fire("0 3 * * *", now, "America/New_York").unwrap();
        assert!(next > now);
    }

    #[test]
    fn next_fire_monotonic() {
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let first = schedule.next_fire(now, chrono_tz::UTC).unwrap();
        let second = schedule.next_fire(first, chrono_tz::UTC).unwrap();
        assert!(first > now);
        assert!(second > first);
    }

    #[test]
    fn dst_spring_forward_skips_to_next_valid_instant() {
        // America/New_York 2024-03-10: 02:00 local jumps to 03:00 (2:xx
        // doesn't exist). A task scheduled "0 2 * * *" should fire at the
        // next valid instant, not vanish for the day.
        let schedule = CronSchedule::parse("30 2 * * *").unwrap();
        let from = Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap();
        let tz: Tz = "America/New_York".parse().unwrap();
        let next = schedule.next_fire(from, tz).unwrap();
        // 2:30 local doesn't exist that day; evaluator must not return a
        // time on 2024-03-10 at all for that field combination, it should
        // land on the next valid day.
        let local = next.with_timezone(&tz);
        assert!(local.date_naive() > NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());
    }

    #[test]
    fn weekday_zero_is_sunday() {
        let schedule = CronSchedule::parse("0 0 * * 0").unwrap();
        assert!(schedule.day_of_week.matches(0));
        assert!(!schedule.day_of_week.matches(1));
    }

    #[test]
    fn random_from_pattern_respects_daily_bounds() {
        let expr = random_from_pattern("daily").unwrap();
        let (ok, _) = validate(&expr);
        assert!(ok);
    }

    #[test]
    fn presets_all_parse() {
        for preset in list_presets() {
            let (ok, _) = validate(preset.expr);
            assert!(ok, "preset {} failed to validate", preset.name);
        }
    }
}
