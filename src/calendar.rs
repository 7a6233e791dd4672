//! Calendar model.
//!
//! The device speaks a slot matrix (`cals[].days[].slots[]`), the UI a flat list
//! keyed by `<cal>-<HH:MM>-<HH:MM>`. [`CalendarSet`] is the in-memory form of the
//! matrix; [`CalendarList`] the in-memory form of the list.

use crate::schemas::indego::{CalendarDay, CalendarEntry, DeviceCalendar, WireSlot};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::fmt;

/// Calendar index the device uses for mowing windows.
pub(crate) const MOWING_CAL: u8 = 2;
/// Calendar index of the time-table (UZSU) view.
pub(crate) const TIMETABLE_CAL: u8 = 8;
/// Calendar index used for the SmartMow schedule view.
pub(crate) const SMARTMOW_CAL: u8 = 9;
/// Number of calendars a fully populated device reports.
const FULL_SET: usize = 5;
const MOWING_SLOTS: usize = 2;
const DAYS: std::ops::RangeInclusive<u8> = 0..=6;
/// Unpaired time-table starts get a window this many hours long.
const INFERRED_WINDOW_HOURS: u8 = 4;

const CRIMSON: &str = "#DC143C";
const GREY: &str = "#BEBEBE";
const PAIRED: &str = "#0AFF0A";
const INFERRED: &str = "#FFA985";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub(crate) enum Error {
    #[error("`{0}` is not a HH:MM time of day")]
    Time(String),
    #[error("slot {start}-{end} ends before it starts")]
    Reversed { start: Time, end: Time },
    #[error("`{0}` is not a calendar list key")]
    Key(String),
    #[error("`{0}` is not a day index")]
    Day(String),
    #[error("the calendar list is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub(crate) struct Time {
    pub(crate) hour: u8,
    pub(crate) minute: u8,
}

impl Time {
    pub(crate) fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour <= 23 && minute <= 59).then_some(Self { hour, minute })
    }

    pub(crate) fn parse(s: &str) -> Result<Self, Error> {
        let bad = || Error::Time(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
        let hour = h.parse().map_err(|_| bad())?;
        let minute = m.get(..2).unwrap_or(m).parse().map_err(|_| bad())?;
        Self::new(hour, minute).ok_or_else(bad)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Attribute codes the vendor puts on exclusion slots.
fn attr_colour(attr: &str) -> &'static str {
    match attr {
        "C" => CRIMSON,
        // p: rain, P: heavy rain, D: heat, and whatever else shows up.
        _ => GREY,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Active {
        start: Time,
        end: Time,
        attr: Option<String>,
    },
    Empty,
}

impl Slot {
    fn active(start: Time, end: Time) -> Result<Self, Error> {
        if start > end {
            return Err(Error::Reversed { start, end });
        }
        Ok(Slot::Active {
            start,
            end,
            attr: None,
        })
    }

    fn from_wire(slot: &WireSlot) -> Result<Self, Error> {
        if !slot.en {
            return Ok(Slot::Empty);
        }
        let time = |h, m| Time::new(h, m).ok_or_else(|| Error::Time(format!("{h:02}:{m:02}")));
        let start = time(slot.st_hr, slot.st_min)?;
        let end = time(slot.en_hr, slot.en_min)?;
        match Slot::active(start, end)? {
            Slot::Active { start, end, .. } => Ok(Slot::Active {
                start,
                end,
                attr: slot.attr.clone(),
            }),
            Slot::Empty => Ok(Slot::Empty),
        }
    }

    fn to_wire(&self) -> WireSlot {
        match self {
            Slot::Active { start, end, attr } => WireSlot {
                st_hr: start.hour,
                st_min: start.minute,
                en_hr: end.hour,
                en_min: end.minute,
                en: true,
                attr: attr.clone(),
            },
            Slot::Empty => WireSlot {
                st_hr: 0,
                st_min: 0,
                en_hr: 0,
                en_min: 0,
                en: false,
                attr: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Calendar {
    pub(crate) cal: u8,
    pub(crate) days: BTreeMap<u8, Vec<Slot>>,
}

impl Calendar {
    fn is_mowing(&self) -> bool {
        self.cal == MOWING_CAL
    }

    fn clear(&mut self) {
        for slots in self.days.values_mut() {
            slots.iter_mut().for_each(|s| *s = Slot::Empty);
        }
    }

    /// Put `slot` into the first free position of `day`.
    fn insert(&mut self, day: u8, slot: Slot) {
        let mowing = self.is_mowing();
        let slots = self.days.entry(day).or_default();
        if let Some(free) = slots.iter_mut().find(|s| **s == Slot::Empty) {
            *free = slot;
        } else if !mowing || slots.len() < MOWING_SLOTS {
            slots.push(slot);
        } else {
            tracing::warn!(cal = self.cal, day, ?slot, "day has no free mowing slot, dropping");
        }
    }

    fn pad(&mut self) {
        if !self.is_mowing() {
            return;
        }
        for slots in self.days.values_mut() {
            while slots.len() < MOWING_SLOTS {
                slots.push(Slot::Empty);
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CalendarSet {
    pub(crate) sel_cal: Option<u8>,
    pub(crate) cals: Vec<Calendar>,
}

impl CalendarSet {
    pub(crate) fn from_wire(wire: &DeviceCalendar) -> Result<Self, Error> {
        let mut cals = Vec::with_capacity(wire.cals.len());
        for entry in &wire.cals {
            let mut days = BTreeMap::new();
            for day in &entry.days {
                let slots = day
                    .slots
                    .iter()
                    .map(Slot::from_wire)
                    .collect::<Result<Vec<_>, _>>()?;
                days.insert(day.day, slots);
            }
            cals.push(Calendar {
                cal: entry.cal,
                days,
            });
        }
        Ok(Self {
            sel_cal: wire.sel_cal,
            cals,
        })
    }

    pub(crate) fn to_wire(&self) -> DeviceCalendar {
        DeviceCalendar {
            sel_cal: self.sel_cal,
            cals: self
                .cals
                .iter()
                .map(|c| CalendarEntry {
                    cal: c.cal,
                    days: c
                        .days
                        .iter()
                        .map(|(day, slots)| CalendarDay {
                            day: *day,
                            slots: slots.iter().map(Slot::to_wire).collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    fn calendar_mut(&mut self, cal: u8) -> Option<&mut Calendar> {
        self.cals.iter_mut().find(|c| c.cal == cal)
    }

    /// Set every slot of every calendar to `Empty`.
    pub(crate) fn clear(&mut self) {
        self.cals.iter_mut().for_each(Calendar::clear);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListEntry {
    pub(crate) cal: u8,
    pub(crate) start: Time,
    pub(crate) end: Time,
    pub(crate) days: Vec<u8>,
    pub(crate) colour: Option<&'static str>,
}

impl ListEntry {
    pub(crate) fn key(&self) -> String {
        format!("{}-{}-{}", self.cal, self.start, self.end)
    }

    fn to_value(&self) -> Value {
        let days = self
            .days
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut v = json!({
            "Key": self.key(),
            "Start": self.start.to_string(),
            "End": self.end.to_string(),
            "Days": days,
        });
        if let Some(colour) = self.colour {
            v["Color"] = Value::String(colour.into());
        }
        v
    }
}

/// UI list form of a calendar set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CalendarList {
    pub(crate) entries: BTreeMap<String, ListEntry>,
    pub(crate) cal_count: Vec<u8>,
}

fn parse_key(key: &str) -> Result<(u8, Time, Time), Error> {
    let bad = || Error::Key(key.to_string());
    let mut parts = key.splitn(3, '-');
    let cal = parts.next().and_then(|c| c.parse().ok()).ok_or_else(bad)?;
    let start = Time::parse(parts.next().ok_or_else(bad)?)?;
    let end = Time::parse(parts.next().ok_or_else(bad)?)?;
    Ok((cal, start, end))
}

fn parse_days(days: &str) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    for day in days.split(',').map(str::trim).filter(|d| !d.is_empty()) {
        let d: u8 = day.parse().map_err(|_| Error::Day(day.to_string()))?;
        if !DAYS.contains(&d) {
            return Err(Error::Day(day.to_string()));
        }
        if !out.contains(&d) {
            out.push(d);
        }
    }
    Ok(out)
}

impl CalendarList {
    pub(crate) fn from_value(value: &Value) -> Result<Self, Error> {
        let map = value.as_object().ok_or(Error::NotAnObject)?;
        let mut list = CalendarList::default();
        for (key, entry) in map {
            if key == "Params" {
                if let Some(count) = entry.get("CalCount").and_then(Value::as_array) {
                    list.cal_count = count
                        .iter()
                        .filter_map(Value::as_u64)
                        .filter_map(|c| u8::try_from(c).ok())
                        .collect();
                }
                continue;
            }
            let (cal, mut start, mut end) = match entry.get("Key").and_then(Value::as_str) {
                Some(k) => parse_key(k)?,
                None => parse_key(key)?,
            };
            if let Some(s) = entry.get("Start").and_then(Value::as_str) {
                start = Time::parse(s)?;
            }
            if let Some(e) = entry.get("End").and_then(Value::as_str) {
                end = Time::parse(e)?;
            }
            if start > end {
                return Err(Error::Reversed { start, end });
            }
            let days = match entry.get("Days") {
                Some(Value::String(s)) => parse_days(s)?,
                Some(Value::Number(n)) => parse_days(&n.to_string())?,
                _ => Vec::new(),
            };
            let colour = entry.get("Color").and_then(Value::as_str).map(|c| match c {
                CRIMSON => CRIMSON,
                PAIRED => PAIRED,
                INFERRED => INFERRED,
                _ => GREY,
            });
            let entry = ListEntry {
                cal,
                start,
                end,
                days,
                colour,
            };
            list.entries.insert(entry.key(), entry);
        }
        Ok(list)
    }

    pub(crate) fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, entry) in &self.entries {
            map.insert(key.clone(), entry.to_value());
        }
        map.insert("Params".into(), json!({ "CalCount": self.cal_count }));
        Value::Object(map)
    }

    /// Flatten every enabled slot into one entry per distinct `(cal, start, end)`.
    pub(crate) fn from_set(set: &CalendarSet) -> Self {
        let mut list = CalendarList::default();
        for calendar in &set.cals {
            if !list.cal_count.contains(&calendar.cal) {
                list.cal_count.push(calendar.cal);
            }
            for (day, slots) in &calendar.days {
                for slot in slots {
                    let Slot::Active { start, end, attr } = slot else {
                        continue;
                    };
                    let key = format!("{}-{}-{}", calendar.cal, start, end);
                    let entry = list.entries.entry(key).or_insert_with(|| ListEntry {
                        cal: calendar.cal,
                        start: *start,
                        end: *end,
                        days: Vec::new(),
                        colour: attr.as_deref().map(attr_colour),
                    });
                    if !entry.days.contains(day) {
                        entry.days.push(*day);
                    }
                }
            }
        }
        list
    }

    /// Fold the list back into `existing`.
    ///
    /// While fewer than a full set of calendars is known, each calendar named by
    /// the list is rebuilt from its entries alone. Otherwise every calendar the
    /// list covers is cleared and repopulated, so days without entries end up
    /// empty.
    pub(crate) fn to_set(&self, existing: &CalendarSet) -> CalendarSet {
        let mut set = existing.clone();
        let mut by_cal: BTreeMap<u8, Vec<&ListEntry>> = BTreeMap::new();
        for entry in self.entries.values() {
            by_cal.entry(entry.cal).or_default().push(entry);
        }
        let rebuild = existing.cals.len() < FULL_SET;
        for &cal in &self.cal_count {
            if by_cal.contains_key(&cal) {
                continue;
            }
            if let Some(calendar) = set.calendar_mut(cal) {
                calendar.clear();
            }
        }
        for (cal, entries) in by_cal {
            let calendar = match set.calendar_mut(cal) {
                Some(calendar) if !rebuild => {
                    calendar.clear();
                    calendar
                }
                Some(calendar) => {
                    calendar.days.clear();
                    calendar
                }
                None => {
                    set.cals.push(Calendar {
                        cal,
                        days: BTreeMap::new(),
                    });
                    let last = set.cals.len() - 1;
                    &mut set.cals[last]
                }
            };
            for entry in entries {
                for &day in &entry.days {
                    calendar.insert(
                        day,
                        Slot::Active {
                            start: entry.start,
                            end: entry.end,
                            attr: None,
                        },
                    );
                }
            }
            calendar.pad();
        }
        set
    }
}

/// Build the list for a single set of days (SmartMow schedule views).
pub(crate) fn days_to_list(cal: u8, days: &[CalendarDay]) -> Result<CalendarList, Error> {
    let wire = DeviceCalendar {
        sel_cal: None,
        cals: vec![CalendarEntry {
            cal,
            days: days.to_vec(),
        }],
    };
    Ok(CalendarList::from_set(&CalendarSet::from_wire(&wire)?))
}

const WEEKDAYS: [&str; 7] = ["MO", "TU", "WE", "TH", "FR", "SA", "SU"];

struct TimetableEvent {
    time: Time,
    days: Vec<u8>,
}

fn timetable_events(timetable: &Value, command: &str) -> Vec<TimetableEvent> {
    let Some(list) = timetable.get("list").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut events = Vec::new();
    for item in list {
        let value = match item.get("value") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => continue,
        };
        if value != command || item.get("active").and_then(Value::as_bool) != Some(true) {
            continue;
        }
        let Some(mut time) = item.get("time").and_then(Value::as_str) else {
            continue;
        };
        if time.contains("sun") {
            // Sunrise/sunset relative entries are only usable once resolved.
            match item.get("calculated").and_then(Value::as_str) {
                Some(calculated) => time = calculated,
                None => continue,
            }
        }
        let Ok(time) = Time::parse(time) else {
            tracing::debug!(time, "skipping a time-table entry with an unusable time");
            continue;
        };
        let rrule = item.get("rrule").and_then(Value::as_str).unwrap_or_default();
        let days = rrule
            .split(';')
            .filter_map(|part| part.strip_prefix("BYDAY="))
            .flat_map(|days| days.split(','))
            .filter_map(|d| WEEKDAYS.iter().position(|w| *w == d.trim()))
            .filter_map(|d| u8::try_from(d).ok())
            .collect();
        events.push(TimetableEvent { time, days });
    }
    events
}

/// Convert a time-table (start `10` / stop `20` events with weekly recurrence)
/// into the list form.
///
/// Each start is paired with the earliest stop at or after it that shares a day
/// with it. Starts without such a stop get a window of a few hours, capped at
/// 23:xx, and are coloured as inferred.
pub(crate) fn timetable_to_list(timetable: &Value) -> CalendarList {
    let starts = timetable_events(timetable, "10");
    let stops = timetable_events(timetable, "20");
    let mut merged: BTreeMap<Time, Vec<u8>> = BTreeMap::new();
    for start in starts {
        let days = merged.entry(start.time).or_default();
        for day in start.days {
            if !days.contains(&day) {
                days.push(day);
            }
        }
    }
    let mut list = CalendarList {
        entries: BTreeMap::new(),
        cal_count: vec![TIMETABLE_CAL],
    };
    for (start, days) in merged {
        let stop = stops
            .iter()
            .filter(|s| s.time >= start && s.days.iter().any(|d| days.contains(d)))
            .map(|s| s.time)
            .min();
        let (end, colour) = match stop {
            Some(end) => (end, PAIRED),
            None => {
                let hour = (start.hour + INFERRED_WINDOW_HOURS).min(23);
                (
                    Time {
                        hour,
                        minute: start.minute,
                    },
                    INFERRED,
                )
            }
        };
        let entry = ListEntry {
            cal: TIMETABLE_CAL,
            start,
            end,
            days,
            colour: Some(colour),
        };
        list.entries.insert(entry.key(), entry);
    }
    list
}
