//! `/beer-stats` slash command: argument parsing and reply rendering.

use std::fmt::Write as _;

use chrono::{Days, NaiveDate};

use beerbot_ledger::RankedUser;

const DEFAULT_DAYS: u32 = 7;
const MAX_DAYS: u32 = 365;
const DEFAULT_LIMIT: usize = 5;
const MAX_LIMIT: usize = 25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsRequest {
    pub days: u32,
    pub limit: usize,
}

impl Default for StatsRequest {
    fn default() -> Self {
        Self {
            days: DEFAULT_DAYS,
            limit: DEFAULT_LIMIT,
        }
    }
}

impl StatsRequest {
    /// Parse `days=N` (alias `timeframe=N`) and `limit=M`. Unknown keys and
    /// out-of-range values fall back to the defaults.
    pub fn parse(text: &str) -> Self {
        let mut request = Self::default();
        for part in text.split_whitespace() {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.to_ascii_lowercase().as_str() {
                "days" | "timeframe" => {
                    if let Ok(n) = value.parse::<u32>() {
                        if (1..=MAX_DAYS).contains(&n) {
                            request.days = n;
                        }
                    }
                }
                "limit" => {
                    if let Ok(n) = value.parse::<usize>() {
                        if (1..=MAX_LIMIT).contains(&n) {
                            request.limit = n;
                        }
                    }
                }
                _ => {}
            }
        }
        request
    }

    /// Inclusive window of `days` calendar days ending on `today`.
    pub fn window(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        let back = u64::from(self.days.saturating_sub(1));
        let start = today.checked_sub_days(Days::new(back)).unwrap_or(today);
        (start, today)
    }
}

pub fn render(request: &StatsRequest, givers: &[RankedUser], receivers: &[RankedUser]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "*Beer Stats* (last {} days)", request.days);
    section(&mut out, "*Top Givers:*", givers);
    section(&mut out, "*Top Receivers:*", receivers);
    out
}

fn section(out: &mut String, title: &str, rows: &[RankedUser]) {
    let _ = writeln!(out, "{title}");
    if rows.is_empty() {
        out.push_str("(none)\n");
        return;
    }
    for (rank, row) in rows.iter().enumerate() {
        let _ = writeln!(out, "{}. <@{}>: {}", rank + 1, row.user, row.total);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_days_and_limit() {
        assert_eq!(
            StatsRequest::parse("days=30 limit=10"),
            StatsRequest {
                days: 30,
                limit: 10
            }
        );
        assert_eq!(StatsRequest::parse("timeframe=2").days, 2);
    }

    #[test]
    fn out_of_range_values_keep_defaults() {
        assert_eq!(
            StatsRequest::parse("days=0 limit=26"),
            StatsRequest::default()
        );
        assert_eq!(StatsRequest::parse("days=366 junk").days, 7);
        assert_eq!(StatsRequest::parse("").limit, 5);
    }

    #[test]
    fn window_includes_today() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 6).unwrap();
        let (start, end) = StatsRequest::default().window(today);
        assert_eq!(start, NaiveDate::from_ymd_opt(2024, 5, 31).unwrap());
        assert_eq!(end, today);
    }

    #[test]
    fn renders_ranked_sections() {
        let givers = vec![RankedUser {
            user: "U1".to_string(),
            total: 4,
        }];
        let text = render(&StatsRequest::default(), &givers, &[]);
        assert!(text.starts_with("*Beer Stats* (last 7 days)\n"));
        assert!(text.contains("*Top Givers:*\n1. <@U1>: 4\n"));
        assert!(text.ends_with("*Top Receivers:*\n(none)\n"));
    }
}
