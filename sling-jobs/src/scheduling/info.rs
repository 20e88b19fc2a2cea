//! A single rule describing when a scheduled job fires.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scheduler::{SchedulerError, Trigger};

const DAY_NAMES: [&str; 7] = ["Sun", "Mon", "Tue", "Wed", "Thu", "Fri", "Sat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleType {
    Date,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Cron,
}

/// Days of the week count from `1` (Sunday) to `7` (Saturday). Days of the month are limited to
/// `1..=28` so that a monthly rule fires every month. All times are UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleInfo {
    /// Fires once.
    Date(DateTime<Utc>),
    Hourly {
        minute: u32,
    },
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
    Monthly {
        day_of_month: u32,
        hour: u32,
        minute: u32,
    },
    Yearly {
        month: u32,
        day_of_month: u32,
        hour: u32,
        minute: u32,
    },
    /// A six or seven field cron expression, seconds first.
    Cron(String),
}

impl ScheduleInfo {
    pub fn kind(&self) -> ScheduleType {
        match self {
            Self::Date(_) => ScheduleType::Date,
            Self::Hourly { .. } => ScheduleType::Hourly,
            Self::Daily { .. } => ScheduleType::Daily,
            Self::Weekly { .. } => ScheduleType::Weekly,
            Self::Monthly { .. } => ScheduleType::Monthly,
            Self::Yearly { .. } => ScheduleType::Yearly,
            Self::Cron(_) => ScheduleType::Cron,
        }
    }

    pub fn at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(at) => Some(*at),
            _ => None,
        }
    }

    pub fn expression(&self) -> Option<&str> {
        match self {
            Self::Cron(expression) => Some(expression),
            _ => None,
        }
    }

    /// Appends a message to `errors` for every problem found.
    pub fn check(&self, errors: &mut Vec<String>) {
        let kind = self.kind();
        let mut time = |hour: u32, minute: u32| {
            if hour > 23 {
                errors.push(format!("Wrong hour {hour} for {kind} schedule, must be 0-23"));
            }
            if minute > 59 {
                errors.push(format!(
                    "Wrong minute {minute} for {kind} schedule, must be 0-59"
                ));
            }
        };
        match self {
            Self::Date(at) => {
                if *at <= Utc::now() {
                    errors.push(format!("Date must be in the future: {at}"));
                }
            }
            Self::Hourly { minute } => time(0, *minute),
            Self::Daily { hour, minute } => time(*hour, *minute),
            Self::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                time(*hour, *minute);
                if !(1..=7).contains(day_of_week) {
                    errors.push(format!(
                        "Wrong day of week {day_of_week} for weekly schedule, must be 1-7"
                    ));
                }
            }
            Self::Monthly {
                day_of_month,
                hour,
                minute,
            } => {
                time(*hour, *minute);
                check_day_of_month(*day_of_month, kind, errors);
            }
            Self::Yearly {
                month,
                day_of_month,
                hour,
                minute,
            } => {
                time(*hour, *minute);
                check_day_of_month(*day_of_month, kind, errors);
                if !(1..=12).contains(month) {
                    errors.push(format!(
                        "Wrong month {month} for yearly schedule, must be 1-12"
                    ));
                }
            }
            Self::Cron(expression) => {
                if expression.trim().is_empty() {
                    errors.push("Cron expression not specified".to_owned());
                } else if let Err(err) = cron::Schedule::from_str(expression) {
                    errors.push(format!("Invalid cron expression {expression:?}: {err}"));
                }
            }
        }
    }

    /// The cron expression equivalent to this rule. `None` for a [`ScheduleInfo::Date`].
    pub fn cron_expression(&self) -> Option<String> {
        Some(match self {
            Self::Date(_) => return None,
            Self::Hourly { minute } => format!("0 {minute} * * * *"),
            Self::Daily { hour, minute } => format!("0 {minute} {hour} * * *"),
            Self::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                let day = day_of_week
                    .checked_sub(1)
                    .and_then(|index| DAY_NAMES.get(index as usize))
                    .map(ToString::to_string)
                    .unwrap_or_else(|| day_of_week.to_string());
                format!("0 {minute} {hour} * * {day}")
            }
            Self::Monthly {
                day_of_month,
                hour,
                minute,
            } => format!("0 {minute} {hour} {day_of_month} * *"),
            Self::Yearly {
                month,
                day_of_month,
                hour,
                minute,
            } => format!("0 {minute} {hour} {day_of_month} {month} *"),
            Self::Cron(expression) => expression.clone(),
        })
    }

    /// The next time this rule fires, `None` when it never fires again.
    pub fn next_scheduled_execution(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(at) => Some(*at).filter(|at| *at > Utc::now()),
            _ => cron::Schedule::from_str(&self.cron_expression()?)
                .ok()?
                .upcoming(Utc)
                .next(),
        }
    }

    pub(crate) fn trigger(&self) -> Result<Trigger, SchedulerError> {
        match (self, self.cron_expression()) {
            (Self::Date(at), _) => Ok(Trigger::At(*at)),
            (_, Some(expression)) => Trigger::cron(&expression),
            (_, None) => Err(SchedulerError::BadState),
        }
    }
}

fn check_day_of_month(day_of_month: u32, kind: ScheduleType, errors: &mut Vec<String>) {
    if !(1..=28).contains(&day_of_month) {
        errors.push(format!(
            "Wrong day of month {day_of_month} for {kind} schedule, must be 1-28"
        ));
    }
}

impl Display for ScheduleType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Date => "date",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
            Self::Cron => "cron",
        };
        f.write_str(kind)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::{Datelike, TimeDelta, Timelike};

    use super::*;

    fn errors(info: ScheduleInfo) -> Vec<String> {
        let mut errors = Vec::new();
        info.check(&mut errors);
        errors
    }

    #[test]
    fn valid_schedules_pass_check() {
        let valid = [
            ScheduleInfo::Date(Utc::now() + TimeDelta::hours(1)),
            ScheduleInfo::Hourly { minute: 59 },
            ScheduleInfo::Daily { hour: 23, minute: 0 },
            ScheduleInfo::Weekly {
                day_of_week: 7,
                hour: 0,
                minute: 0,
            },
            ScheduleInfo::Monthly {
                day_of_month: 28,
                hour: 12,
                minute: 30,
            },
            ScheduleInfo::Yearly {
                month: 12,
                day_of_month: 1,
                hour: 12,
                minute: 30,
            },
            ScheduleInfo::Cron("0 0/5 * * * *".to_owned()),
        ];
        for info in valid {
            assert_eq!(errors(info.clone()), Vec::<String>::new(), "{info:?}");
        }
    }

    #[test]
    fn out_of_range_values_are_reported() {
        assert_eq!(errors(ScheduleInfo::Hourly { minute: 60 }).len(), 1);
        assert_eq!(errors(ScheduleInfo::Daily { hour: 24, minute: 60 }).len(), 2);
        assert_eq!(
            errors(ScheduleInfo::Weekly {
                day_of_week: 0,
                hour: 1,
                minute: 1
            }),
            vec!["Wrong day of week 0 for weekly schedule, must be 1-7".to_owned()]
        );
        assert_eq!(
            errors(ScheduleInfo::Monthly {
                day_of_month: 29,
                hour: 1,
                minute: 1
            }),
            vec!["Wrong day of month 29 for monthly schedule, must be 1-28".to_owned()]
        );
        assert_eq!(
            errors(ScheduleInfo::Yearly {
                month: 13,
                day_of_month: 0,
                hour: 1,
                minute: 1
            })
            .len(),
            2
        );
    }

    #[test]
    fn past_dates_and_bad_cron_are_reported() {
        assert_eq!(
            errors(ScheduleInfo::Date(Utc::now() - TimeDelta::seconds(1))).len(),
            1
        );
        assert_eq!(
            errors(ScheduleInfo::Cron("  ".to_owned())),
            vec!["Cron expression not specified".to_owned()]
        );
        assert_eq!(errors(ScheduleInfo::Cron("every day".to_owned())).len(), 1);
    }

    #[test]
    fn cron_expressions() {
        assert_eq!(
            ScheduleInfo::Hourly { minute: 5 }.cron_expression().unwrap(),
            "0 5 * * * *"
        );
        assert_eq!(
            ScheduleInfo::Daily { hour: 3, minute: 5 }
                .cron_expression()
                .unwrap(),
            "0 5 3 * * *"
        );
        assert_eq!(
            ScheduleInfo::Weekly {
                day_of_week: 1,
                hour: 3,
                minute: 5
            }
            .cron_expression()
            .unwrap(),
            "0 5 3 * * Sun"
        );
        assert_eq!(
            ScheduleInfo::Monthly {
                day_of_month: 2,
                hour: 3,
                minute: 5
            }
            .cron_expression()
            .unwrap(),
            "0 5 3 2 * *"
        );
        assert_eq!(
            ScheduleInfo::Yearly {
                month: 4,
                day_of_month: 2,
                hour: 3,
                minute: 5
            }
            .cron_expression()
            .unwrap(),
            "0 5 3 2 4 *"
        );
        assert_eq!(ScheduleInfo::Date(Utc::now()).cron_expression(), None);
    }

    #[test]
    fn next_execution_follows_the_rule() {
        let next = ScheduleInfo::Daily {
            hour: 4,
            minute: 30,
        }
        .next_scheduled_execution()
        .unwrap();
        assert!(next > Utc::now());
        assert_eq!((next.hour(), next.minute(), next.second()), (4, 30, 0));

        let next = ScheduleInfo::Weekly {
            day_of_week: 2,
            hour: 0,
            minute: 0,
        }
        .next_scheduled_execution()
        .unwrap();
        assert_eq!(next.weekday(), chrono::Weekday::Mon);

        let at = Utc::now() + TimeDelta::minutes(5);
        assert_eq!(ScheduleInfo::Date(at).next_scheduled_execution(), Some(at));
        assert_eq!(
            ScheduleInfo::Date(Utc::now() - TimeDelta::minutes(5)).next_scheduled_execution(),
            None
        );
    }

    #[test]
    fn triggers() {
        let at = Utc::now();
        assert_matches!(ScheduleInfo::Date(at).trigger(), Ok(Trigger::At(fires)) if fires == at);
        assert_matches!(
            ScheduleInfo::Hourly { minute: 1 }.trigger(),
            Ok(Trigger::Cron(_))
        );
        assert_matches!(
            ScheduleInfo::Cron("bogus".to_owned()).trigger(),
            Err(SchedulerError::InvalidCron { .. })
        );
    }
}
