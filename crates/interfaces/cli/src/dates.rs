use anyhow::{Result, bail};
use chrono::{Days, Months, NaiveDate};
use clap::Args;

/// Date window selection shared by the query subcommands. All dates are UTC
/// calendar days, inclusive.
#[derive(Debug, Clone, Default, Args)]
pub struct RangeArgs {
    /// A single day (YYYY-MM-DD).
    #[arg(long, conflicts_with_all = ["start", "end", "since"])]
    pub day: Option<NaiveDate>,
    /// First day of the window (YYYY-MM-DD).
    #[arg(long, requires = "end", conflicts_with = "since")]
    pub start: Option<NaiveDate>,
    /// Last day of the window (YYYY-MM-DD).
    #[arg(long, requires = "start")]
    pub end: Option<NaiveDate>,
    /// Relative window ending today: 7d, 2m, 1y.
    #[arg(long)]
    pub since: Option<String>,
}

impl RangeArgs {
    /// Resolve to `(start, end)`. Without any flag, `default_days` (counting
    /// today) is used when given, otherwise it is an error.
    pub fn resolve(&self, today: NaiveDate, default_days: Option<u64>) -> Result<(NaiveDate, NaiveDate)> {
        if let Some(day) = self.day {
            return Ok((day, day));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                bail!("--start {start} is after --end {end}");
            }
            return Ok((start, end));
        }
        if let Some(since) = &self.since {
            return Ok((parse_relative(since, today)?, today));
        }
        match default_days {
            Some(days) => {
                let start = today
                    .checked_sub_days(Days::new(days.saturating_sub(1)))
                    .unwrap_or(NaiveDate::MIN);
                Ok((start, today))
            }
            None => bail!("provide --day, --start and --end, or --since"),
        }
    }
}

/// Parse `Nd`, `Nm` or `Ny` (an optional leading `-` is accepted) into the
/// date that far before `today`.
pub fn parse_relative(input: &str, today: NaiveDate) -> Result<NaiveDate> {
    let input = input.trim().trim_start_matches('-');
    let Some(unit) = input.chars().last() else {
        bail!("empty relative date");
    };
    let amount = &input[..input.len() - unit.len_utf8()];
    let Ok(n) = amount.parse::<u32>() else {
        bail!("invalid relative date {input:?}; expected e.g. 7d, 2m, 1y");
    };

    let date = match unit {
        'd' => today.checked_sub_days(Days::new(u64::from(n))),
        'm' => today.checked_sub_months(Months::new(n)),
        'y' => n
            .checked_mul(12)
            .and_then(|months| today.checked_sub_months(Months::new(months))),
        other => bail!("invalid time unit {other:?}; use d, m or y"),
    };
    match date {
        Some(date) => Ok(date),
        None => bail!("relative date {input:?} is out of range"),
    }
}
