use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::meal_slot::MealSlot;

/// Serde helpers for `HH:MM` times (seconds accepted on input).
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    #[serde(with = "hhmm")]
    pub start: NaiveTime,
    #[serde(with = "hhmm")]
    pub end: NaiveTime,
}

impl TimeWindow {
    fn hm(start: (u32, u32), end: (u32, u32)) -> Self {
        Self {
            start: NaiveTime::from_hms_opt(start.0, start.1, 0).unwrap_or_default(),
            end: NaiveTime::from_hms_opt(end.0, end.1, 0).unwrap_or_default(),
        }
    }
}

/// The four named windows a meal slot maps onto. Missing keys in the stored
/// JSON fall back to the defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeWindows {
    pub breakfast: TimeWindow,
    pub lunch: TimeWindow,
    pub dinner: TimeWindow,
    pub snack: TimeWindow,
}

impl Default for TimeWindows {
    fn default() -> Self {
        Self {
            breakfast: TimeWindow::hm((8, 0), (9, 0)),
            lunch: TimeWindow::hm((12, 0), (13, 0)),
            dinner: TimeWindow::hm((18, 0), (19, 0)),
            snack: TimeWindow::hm((15, 0), (15, 30)),
        }
    }
}

impl TimeWindows {
    pub fn for_slot(&self, slot: MealSlot) -> TimeWindow {
        match slot {
            MealSlot::Breakfast => self.breakfast,
            MealSlot::Lunch => self.lunch,
            MealSlot::Dinner => self.dinner,
            MealSlot::Snack => self.snack,
        }
    }
}

/// A user's remote calendar settings, already decrypted by the settings module.
///
/// Credentials live only for the duration of a sync attempt; `Debug` never
/// prints the password.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCalendarConfig {
    pub user_id: String,
    pub server_url: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub enabled: bool,
    pub time_windows: TimeWindows,
    pub timezone: Option<String>,
}

impl fmt::Debug for RemoteCalendarConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteCalendarConfig")
            .field("user_id", &self.user_id)
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("time_windows", &self.time_windows)
            .field("timezone", &self.timezone)
            .finish()
    }
}

impl RemoteCalendarConfig {
    fn tz(&self) -> Tz {
        match self.timezone.as_deref() {
            None | Some("") => Tz::UTC,
            Some(name) => name.parse::<Tz>().unwrap_or_else(|_| {
                tracing::warn!(
                    "Unknown timezone '{}' on remote calendar for user {}; using UTC",
                    name,
                    self.user_id
                );
                Tz::UTC
            }),
        }
    }

    /// Longest DST or zone-change gap we step across, in minutes.
    const MAX_GAP_MINUTES: i64 = 26 * 60;

    fn to_utc(tz: Tz, local: NaiveDateTime) -> DateTime<Utc> {
        if let Some(dt) = tz.from_local_datetime(&local).earliest() {
            return dt.with_timezone(&Utc);
        }
        // Local time falls into a gap: use the first whole minute after it,
        // which is the instant the clocks jumped.
        let mut candidate = local
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(local);
        for _ in 0..Self::MAX_GAP_MINUTES {
            candidate += Duration::minutes(1);
            if let Some(dt) = tz.from_local_datetime(&candidate).earliest() {
                return dt.with_timezone(&Utc);
            }
        }
        Utc.from_utc_datetime(&local)
    }

    /// Map a slot on `date` to a UTC `[start, end)` interval using this
    /// config's windows and timezone. A window whose end is earlier than its
    /// start ends on the following day; equal times yield an empty interval
    /// which the payload builder rejects.
    pub fn interval_for(&self, slot: MealSlot, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        let window = self.time_windows.for_slot(slot);
        let tz = self.tz();

        let start_local = date.and_time(window.start);
        let end_date = if window.end < window.start {
            date.succ_opt().unwrap_or(date)
        } else {
            date
        };
        let end_local = end_date.and_time(window.end);

        (Self::to_utc(tz, start_local), Self::to_utc(tz, end_local))
    }
}
