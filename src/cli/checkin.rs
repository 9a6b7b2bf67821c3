//! snail checkin and streak commands.

use chrono::{Local, NaiveDate};
use serde::Serialize;

use crate::checkin::{record_check_in, CheckInLog, StreakSummary};
use crate::cli::{parse_day, Context};
use crate::error::Result;
use crate::output::{emit_success, HumanOutput};

#[derive(Serialize)]
struct CheckInOutput {
    date: NaiveDate,
    added: bool,
    streak: StreakSummary,
}

pub(crate) fn run_checkin(ctx: &Context, date: Option<&str>) -> Result<()> {
    let today = Local::now().date_naive();
    let day = match date {
        Some(raw) => parse_day("date", raw)?,
        None => today,
    };
    let (log, added) = record_check_in(&ctx.config.checkin_path(), day)?;
    let streak = log.summary(today);

    let mut human = HumanOutput::new(if added {
        "Checked in"
    } else {
        "Already checked in"
    });
    human.push_summary("Date", day.to_string());
    human.push_summary("Current streak", streak.current.to_string());
    emit_success(
        ctx.output,
        "checkin",
        &CheckInOutput {
            date: day,
            added,
            streak,
        },
        Some(&human),
    )
}

pub(crate) fn run_streak(ctx: &Context) -> Result<()> {
    let today = Local::now().date_naive();
    let log = CheckInLog::load(&ctx.config.checkin_path())?;
    let streak = log.summary(today);

    let mut human = HumanOutput::new("Streak");
    human.push_summary("Current", streak.current.to_string());
    human.push_summary("Longest", streak.longest.to_string());
    human.push_summary("Days checked in", streak.total.to_string());
    if !log.contains(today) {
        human.push_next_step("snail checkin");
    }
    emit_success(ctx.output, "streak", &streak, Some(&human))
}
