//! Periodic polling of the vendor cloud into the item tree.
//!
//! Every job fetches one part of the mower's state, derives the values the
//! visualisation shows and writes them as plugin items. A job that fails logs
//! the cause and leaves the affected items alone; the next tick retries.

use crate::alerts::AlertStore;
use crate::api::{self, DeviceApi};
use crate::auth::{self, Credentials};
use crate::calendar::{self, CalendarList, CalendarSet, SMARTMOW_CAL};
use crate::items::{Items, Table};
use crate::map;
use crate::ringlog::{RingLog, stamp};
use crate::schedule::{Cadence, Job, SAMPLING_PERIOD, SAVE_RETRY, Schedule, Transition};
use crate::schemas::indego;
use crate::states::{Category, StateTable};
use crate::triggers::{self, TRIGGER_SLOTS, Triggers};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

const OPERATING_DATA_PERIOD: Duration = Duration::new(300, 0);
const ALERTS_PERIOD: Duration = Duration::new(300, 0);
const CALENDARS_PERIOD: Duration = Duration::new(300, 0);
const DEVICE_DATA_PERIOD: Duration = Duration::new(120, 0);
const WEATHER_PERIOD: Duration = Duration::new(600, 0);
const NEXT_TIME_PERIOD: Duration = Duration::new(300, 0);
const IDLE_SLEEP: Duration = Duration::new(3600, 0);
const SAVE_ATTEMPTS: u32 = 3;
const WEATHER_INTERVALS_PER_DAY: usize = 4;
const UNKNOWN_PICTURE: &str = "na.png";
const WEEKDAYS: [&str; 7] = [
    "Montag",
    "Dienstag",
    "Mittwoch",
    "Donnerstag",
    "Freitag",
    "Samstag",
    "Sonntag",
];

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error(transparent)]
    Api(#[from] api::Error),
    #[error("could not renew the session")]
    Auth(#[source] auth::Error),
    #[error("could not compose the garden map")]
    Map(#[source] map::Error),
    #[error("could not write the garden map to `{1}`")]
    WriteMap(#[source] std::io::Error, PathBuf),
    #[error("the calendar from the vendor is malformed")]
    Calendar(#[source] calendar::Error),
    #[error("item `{1}` does not hold a device calendar")]
    CalendarItem(#[source] serde_json::Error, &'static str),
}

/// Plugin parameters the jobs depend on.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    pub(crate) cycle: Duration,
    pub(crate) img_path: Option<PathBuf>,
    pub(crate) weather_pics_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cycle: Duration::new(30, 0),
            img_path: None,
            weather_pics_path: String::new(),
        }
    }
}

/// Which of the two editable device calendars.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Which {
    Mowing,
    Predictive,
}

impl Which {
    fn item(self) -> &'static str {
        match self {
            Which::Mowing => "calendar",
            Which::Predictive => "calendar_predictive",
        }
    }

    fn child(self, suffix: &str) -> String {
        format!("{}_{suffix}", self.item())
    }

    fn job(self) -> Job {
        match self {
            Which::Mowing => Job::SaveCalendar,
            Which::Predictive => Job::SavePredictiveCalendar,
        }
    }

    fn saved_message(self) -> &'static str {
        match self {
            Which::Mowing => "Mähkalender wurde gespeichert",
            Which::Predictive => "Ausschlusskalender wurde gespeichert",
        }
    }
}

#[derive(Debug, Default)]
struct State {
    states: StateTable,
    providers: BTreeMap<String, Value>,
    mowertypes: BTreeMap<String, Value>,
    weather_pics: BTreeMap<String, Value>,
    cadence: Cadence,
    category: Category,
    last_code: Option<u32>,
    alert_reset: bool,
    alerts: AlertStore,
    save_attempts: BTreeMap<Job, u32>,
}

pub(crate) struct Reconciler {
    api: DeviceApi,
    items: Items,
    settings: Settings,
    credentials: Mutex<Option<Credentials>>,
    state: Mutex<State>,
    schedule: Mutex<Schedule>,
    wake: Notify,
    state_log: Mutex<RingLog>,
}

impl Reconciler {
    pub(crate) async fn new(
        api: DeviceApi,
        items: Items,
        settings: Settings,
        credentials: Option<Credentials>,
    ) -> Self {
        let reconciler = Self {
            api,
            items,
            settings,
            credentials: Mutex::new(credentials),
            state: Mutex::new(State::default()),
            schedule: Mutex::new(Schedule::default()),
            wake: Notify::new(),
            state_log: Mutex::new(RingLog::default()),
        };
        reconciler.load_tables().await;
        reconciler
    }

    pub(crate) fn api(&self) -> &DeviceApi {
        &self.api
    }

    pub(crate) fn items(&self) -> &Items {
        &self.items
    }

    pub(crate) fn comm_log(&self) -> &Arc<Mutex<RingLog>> {
        self.api.transport().comm_log()
    }

    /// Mirror the communication log into its item.
    async fn publish_comm_log(&self) {
        let lines = self.comm_log().lock().await.lines();
        self.items.set("webif.communication_protocoll", lines).await;
    }

    pub(crate) fn state_log(&self) -> &Mutex<RingLog> {
        &self.state_log
    }

    pub(crate) async fn credentials(&self) -> Option<Credentials> {
        self.credentials.lock().await.clone()
    }

    pub(crate) async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.lock().await = Some(credentials);
    }

    /// Bind the lookup tables the item tree carries and the cached alerts.
    async fn load_tables(&self) {
        let tables = self.items.lock().await.tables();
        let alerts = AlertStore::from_value(&self.items.get("visu.alerts").await);
        let mut state = self.state.lock().await;
        state.alerts = alerts;
        for (name, table) in tables {
            let table = match table {
                Ok(table) => table,
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        table = %name,
                        "could not parse a lookup table, using its default"
                    );
                    continue;
                }
            };
            match (name.as_str(), table) {
                ("states", Table::Int(entries)) if !entries.is_empty() => {
                    state.states = StateTable::from_entries(&entries);
                }
                ("providers", Table::Str(entries)) => state.providers = entries,
                ("mowertype", Table::Str(entries)) => state.mowertypes = entries,
                ("weather_pics", Table::Str(entries)) => state.weather_pics = entries,
                (name, _) => tracing::debug!(name, "ignoring lookup table"),
            }
        }
    }

    /// Log in if credentials are known and arm every periodic job.
    pub(crate) async fn start(&self) {
        if let Some(credentials) = self.credentials().await {
            if let Err(e) = self.api.identity().login(&credentials).await {
                tracing::warn!(error = &e as &dyn std::error::Error, "initial login failed");
            }
        }
        let refresh = self.api.identity().session().await.refresh_period();
        let now = boot_time::Instant::now();
        let mut schedule = self.schedule.lock().await;
        schedule.every(Job::OperatingData, OPERATING_DATA_PERIOD, now);
        schedule.every(Job::State, self.settings.cycle, now);
        schedule.every(Job::Alerts, ALERTS_PERIOD, now);
        schedule.every(Job::Calendars, CALENDARS_PERIOD, now);
        schedule.every(Job::RefreshToken, refresh, now.checked_add(refresh).unwrap_or(now));
        schedule.every(Job::DeviceData, DEVICE_DATA_PERIOD, now);
        schedule.every(Job::Weather, WEATHER_PERIOD, now);
        schedule.every(Job::NextTime, NEXT_TIME_PERIOD, now);
        drop(schedule);
        self.wake.notify_one();
    }

    /// Disarm every job and drop the session.
    pub(crate) async fn stop(&self) {
        self.schedule.lock().await.clear();
        self.api.identity().logout().await;
        tracing::debug!("reconciler stopped");
    }

    /// Drive the schedule forever.
    pub(crate) async fn run(&self) {
        loop {
            let now = boot_time::Instant::now();
            let due = self.schedule.lock().await.due(now);
            if due.is_empty() {
                let sleep = self
                    .schedule
                    .lock()
                    .await
                    .sleep_for(now)
                    .unwrap_or(IDLE_SLEEP);
                tokio::select! {
                    _ = tokio::time::sleep(sleep) => {}
                    _ = self.wake.notified() => {}
                }
                continue;
            }
            for job in due {
                self.run_job(job).await;
            }
        }
    }

    pub(crate) async fn run_job(&self, job: Job) {
        tracing::trace!(job = job.name(), "running job");
        if job != Job::RefreshToken {
            self.renew_if_rejected().await;
        }
        let result = match job {
            Job::State => self.poll_state().await,
            Job::OperatingData => self.operating_data().await,
            Job::Alerts => self.poll_alerts().await,
            Job::Calendars => self.calendars().await,
            Job::RefreshToken => self.refresh_token().await,
            Job::DeviceData => self.device_data().await,
            Job::Weather => self.weather().await,
            Job::NextTime => self.next_time().await,
            Job::SaveCalendar => self.save_calendar(Which::Mowing).await,
            Job::SavePredictiveCalendar => self.save_calendar(Which::Predictive).await,
        };
        if let Err(e) = result {
            tracing::warn!(error = &e as &dyn std::error::Error, job = job.name(), "job failed");
        }
        self.publish_comm_log().await;
    }

    /// Jobs are no-ops in winter mode and without a session.
    async fn active(&self) -> bool {
        if self.items.bool("wartung.wintermodus").await {
            return false;
        }
        self.api.identity().session().await.logged_in()
    }

    async fn renew_if_rejected(&self) {
        if self.api.identity().session().await.force_refresh {
            if let Err(e) = self.refresh_token().await {
                tracing::warn!(error = &e as &dyn std::error::Error, "could not renew a rejected bearer");
            }
        }
    }

    /// Renew the bearer; sign in from scratch when the refresh token is gone.
    pub(crate) async fn refresh_token(&self) -> Result<(), Error> {
        let identity = self.api.identity();
        match identity.refresh().await {
            Ok(()) => {}
            Err(auth::Error::Busy) => return Ok(()),
            Err(e) => {
                let Some(credentials) = self.credentials().await else {
                    return Err(Error::Auth(e));
                };
                tracing::info!(error = &e as &dyn std::error::Error, "refresh failed, logging in again");
                identity.login(&credentials).await.map_err(Error::Auth)?;
            }
        }
        let period = identity.session().await.refresh_period();
        self.schedule
            .lock()
            .await
            .change(Job::RefreshToken, period, boot_time::Instant::now());
        Ok(())
    }

    /// Log in again with new credentials and refresh every item.
    pub(crate) async fn relogin(&self) -> Result<(), Error> {
        let Some(credentials) = self.credentials().await else {
            return Ok(());
        };
        let identity = self.api.identity();
        identity.logout().await;
        identity.login(&credentials).await.map_err(Error::Auth)?;
        let period = identity.session().await.refresh_period();
        self.schedule
            .lock()
            .await
            .change(Job::RefreshToken, period, boot_time::Instant::now());
        Ok(())
    }

    async fn triggers(&self) -> Triggers {
        let mut triggers = Triggers::default();
        for n in 1..=TRIGGER_SLOTS {
            triggers.state[n - 1] = self.items.string(&triggers::state_pattern(n)).await;
            triggers.alarm[n - 1] = self.items.string(&triggers::alarm_pattern(n)).await;
        }
        triggers
    }

    pub(crate) async fn poll_state(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let state = match self.api.state().await {
            Ok(state) => state,
            Err(e) => {
                if !e.is_broken_pipe() {
                    self.items.set("online", false).await;
                }
                return Err(e.into());
            }
        };
        let items = &self.items;
        items.set("online", true).await;
        items.set("stateError", state.error.unwrap_or(0)).await;

        let (code, grew, changed, category, transition) = {
            let mut st = self.state.lock().await;
            let (code, grew) = st.states.observe(state.state);
            if let Some(category) = code.category() {
                st.category = category;
            }
            let changed = st.last_code != Some(state.state);
            st.last_code = Some(state.state);
            let grew = grew.then(|| st.states.to_value());
            let category = st.category;
            let transition = st.cadence.observe(state.state);
            (code, grew, changed, category, transition)
        };
        if let Some(table) = grew {
            items.set("states_str", table.to_string()).await;
        }
        items.set("stateCode", code.code()).await;
        if changed {
            items.set("webif.laststateCode", code.code()).await;
            let line = format!(
                "{}  State : {} State-Message : {}",
                stamp(),
                code.code(),
                code.text()
            );
            let lines = {
                let mut log = self.state_log.lock().await;
                log.push(line);
                log.lines()
            };
            items.set("webif.state_protocoll", lines).await;
            for n in self.triggers().await.match_state(code.code()) {
                tracing::info!(slot = n, code = code.code(), "state trigger fired");
                items.set(&triggers::state_flag(n), true).await;
            }
        }

        for (name, flag) in category.flags() {
            items.set(name, flag).await;
        }
        let fetch_alerts = {
            let mut st = self.state.lock().await;
            match category {
                Category::Help => std::mem::take(&mut st.alert_reset),
                _ => {
                    st.alert_reset = true;
                    false
                }
            }
        };
        if category == Category::Moving {
            items.set("mowedDate", stamp()).await;
        }
        if fetch_alerts {
            if let Err(e) = self.poll_alerts().await {
                tracing::warn!(error = &e as &dyn std::error::Error, "could not fetch alerts for a help state");
            }
        }

        items.set("state_str", code.text()).await;
        items.set("mowedPercent", state.mowed).await;
        let last_percent = items.f64("visu.mow_track.last_percent_mowed").await;
        if state.mowed == 0.0 && last_percent > 0.0 {
            tracing::debug!("mowing restarted, clearing the mow track");
            items.set("visu.mow_track", Value::Array(Vec::new())).await;
        }
        self.follow_cadence(transition).await;
        items.set("visu.mow_track.last_percent_mowed", state.mowed).await;
        if let Some(mode) = state.mowmode {
            items.set("mowmode", mode).await;
        }

        let runtime = &state.runtime;
        for (name, minutes) in [
            ("runtimeTotalOperationMins", runtime.total.operate),
            ("runtimeTotalChargeMins", runtime.total.charge),
        ] {
            items.set(name, minutes).await;
            items.set(&format!("{name}.dhm"), daystring(minutes)).await;
        }
        items
            .set("runtimeSessionOperationMins", runtime.session.operate)
            .await;
        items
            .set("runtimeSessionChargeMins", runtime.session.charge)
            .await;

        if let (Some(x), Some(y)) = (state.x_pos, state.y_pos) {
            items.set("xPos", x).await;
            items.set("yPos", y).await;
            if let (Some(svg_x), Some(svg_y)) = (state.svg_x_pos, state.svg_y_pos) {
                items.set("svg_xPos", svg_x).await;
                items.set("svg_yPos", svg_y).await;
                items.set("visu.svg_pos", format!("svg_pos|{svg_x},{svg_y}")).await;
                self.extend_track(svg_x, svg_y).await;
            }
        }
        items
            .set("mapUpdateAvailable", state.map_update_available)
            .await;
        if state.map_update_available {
            self.load_map().await?;
        }
        Ok(())
    }

    async fn follow_cadence(&self, transition: Transition) {
        let now = boot_time::Instant::now();
        match transition {
            Transition::StartSampling => {
                tracing::info!("mower is out, sampling its position");
                self.request_position().await;
                self.schedule
                    .lock()
                    .await
                    .change(Job::State, SAMPLING_PERIOD, now);
            }
            Transition::Rearm => self.request_position().await,
            Transition::StopSampling => {
                tracing::info!("mower is heading home, back to the regular cadence");
                self.schedule
                    .lock()
                    .await
                    .change(Job::State, self.settings.cycle, now);
            }
            Transition::Hold => {}
        }
    }

    async fn request_position(&self) {
        if let Err(e) = self.api.request_position().await {
            tracing::warn!(error = &e as &dyn std::error::Error, "position request failed");
        }
    }

    async fn extend_track(&self, x: i64, y: i64) {
        let point = format!("{x},{y}");
        let mut track = match self.items.get("visu.mow_track").await {
            Value::Array(points) => points,
            _ => Vec::new(),
        };
        if track.last().and_then(Value::as_str) == Some(point.as_str()) {
            return;
        }
        track.push(Value::String(point));
        self.items.set("visu.mow_track", Value::Array(track)).await;
    }

    pub(crate) async fn load_map(&self) -> Result<(), Error> {
        let svg = self.api.map().await?;
        let svg = String::from_utf8(svg).map_err(|_| Error::Map(map::Error::Encoding))?;
        self.items.set("webif.garden_map", svg).await;
        self.items.set("mapSvgCacheDate", stamp()).await;
        self.parse_map().await
    }

    /// Recompose the displayed map from the cached vendor map. On failure the
    /// previously composed map stays in place.
    pub(crate) async fn parse_map(&self) -> Result<(), Error> {
        let raw = self.items.string("webif.garden_map").await;
        if raw.is_empty() {
            return Ok(());
        }
        let colour = self.items.string("visu.mower_colour").await;
        let overlay = self.items.string("visu.add_svg_images").await;
        let composed = map::compose(&raw, &colour, &overlay).map_err(Error::Map)?;
        if let Some(path) = &self.settings.img_path {
            tokio::fs::write(path, composed.as_bytes())
                .await
                .map_err(|e| Error::WriteMap(e, path.clone()))?;
        }
        self.items.set("visu.map_2_display", composed).await;
        Ok(())
    }

    /// Publish the mow track polyline, or clear it when the track is hidden.
    pub(crate) async fn render_track(&self, show: bool) {
        if !show {
            self.items.set("visu.svg_mow_track", "svg_mow_track|").await;
            return;
        }
        let points: Vec<String> = match self.items.get("visu.mow_track").await {
            Value::Array(points) => points
                .iter()
                .filter_map(|p| p.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        };
        let model_type = self.items.i64("visu.model_type").await;
        let track = map::mow_track(&points, model_type);
        self.items
            .set("visu.svg_mow_track", format!("svg_mow_track|{track}"))
            .await;
    }

    /// Mirror `value` into items below `prefix`, skipping keys with no item.
    async fn flatten(&self, prefix: &str, value: &Value) {
        match value {
            Value::Object(map) => {
                for (key, value) in map {
                    Box::pin(self.flatten(&format!("{prefix}.{key}"), value)).await;
                }
            }
            leaf => {
                if !self.items.set_known(prefix, leaf.clone()).await {
                    tracing::trace!(item = prefix, "no item for vendor value");
                }
            }
        }
    }

    pub(crate) async fn operating_data(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let data = self.api.operating_data().await?;
        self.flatten("operatingInfo", &data).await;
        let model_type = self.items.i64("visu.model_type").await;
        match model_type {
            1 => {
                if let Some(voltage) = data.pointer("/battery/voltage").and_then(Value::as_f64) {
                    let (load, icon) = battery_from_voltage(voltage);
                    self.items.set("visu.battery_load", load).await;
                    self.items.set("visu.battery_load_icon", icon).await;
                }
            }
            2 => {
                let percent = self.items.f64("operatingInfo.battery.percent").await;
                self.items.set("visu.battery_load", percent).await;
                self.items
                    .set("visu.battery_load_icon", (percent / 100.0 * 255.0).round() as i64)
                    .await;
                self.network().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn network(&self) -> Result<(), Error> {
        let network = self.api.network().await?;
        self.flatten("network", &network).await;
        let mcc = network.get("mcc").and_then(Value::as_i64);
        let mnc = network.get("mnc").and_then(Value::as_i64);
        let (Some(mcc), Some(mnc)) = (mcc, mnc) else {
            return Ok(());
        };
        let key = provider_key(mcc, mnc);
        let (current, available, learned) = {
            let mut st = self.state.lock().await;
            let learned = if st.providers.contains_key(&key) {
                None
            } else {
                tracing::info!(provider = key, "unknown mobile network provider");
                st.providers
                    .insert(key.clone(), Value::String(format!("{key}unknown")));
                Some(Value::Object(
                    st.providers.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
                ))
            };
            let current = provider_name(&st.providers, &key).unwrap_or_else(|| format!("unknown({key})"));
            let available = network
                .get("networks")
                .and_then(Value::as_array)
                .map(|networks| {
                    networks
                        .iter()
                        .map(|n| {
                            let code = match n {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            provider_name(&st.providers, &code)
                                .unwrap_or_else(|| format!("{code} - unknown"))
                        })
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default();
            (current, available, learned)
        };
        if let Some(table) = learned {
            self.items.set("providers", table.to_string()).await;
        }
        self.items.set("visu.network.act_provider", current).await;
        self.items
            .set("visu.network.available_provider", available)
            .await;
        Ok(())
    }

    pub(crate) async fn next_time(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let next = match self.api.next_cutting().await {
            Ok(Some(next)) => {
                format_cutting(&next.mow_next).unwrap_or_else(|| "nicht geplant".to_string())
            }
            Ok(None) => "nicht geplant".to_string(),
            Err(api::Error::Schema(..)) => "kein Mähen geplant".to_string(),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "no next cutting");
                "nicht geplant".to_string()
            }
        };
        self.items.set("next_time", next).await;
        let last = match self.api.last_cutting().await {
            Ok(last) => format_cutting(&last.last_mowed),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "no last cutting");
                None
            }
        };
        self.items
            .set(
                "last_time",
                last.unwrap_or_else(|| "kein letztes Mähen bekannt".to_string()),
            )
            .await;
        Ok(())
    }

    pub(crate) async fn weather(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let weather = self.api.weather().await?;
        let intervals = weather.location_weather.forecast.intervals;
        let mut days: BTreeMap<usize, Day> = BTreeMap::new();
        let mut learned = false;
        for (i, interval) in intervals.iter().enumerate() {
            for (key, value) in interval {
                self.items
                    .set_known(&format!("weather.int_{i}.{key}"), value.clone())
                    .await;
            }
            let picture = match interval.get("wwsymbol_mg2008") {
                Some(symbol) => {
                    let symbol = match symbol {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let (file, grew) = self.weather_picture(&symbol).await;
                    learned |= grew;
                    let path = format!("{}{file}", self.settings.weather_pics_path);
                    self.items
                        .set_known(&format!("weather.int_{i}.picture"), path.clone())
                        .await;
                    Some(path)
                }
                None => None,
            };
            let day = days.entry(i / WEATHER_INTERVALS_PER_DAY).or_default();
            if let Some(tt) = interval.get("tt").and_then(Value::as_f64) {
                if day.max.is_none_or(|max| tt > max) {
                    day.max = Some(tt);
                    day.picture = picture;
                }
                if day.min.is_none_or(|min| tt < min) {
                    day.min = Some(tt);
                }
            }
            if day.weekday.is_none() {
                day.weekday = interval
                    .get("dateTime")
                    .and_then(Value::as_str)
                    .and_then(weekday);
            }
        }
        for (d, day) in days {
            if let Some(max) = day.max {
                self.items.set_known(&format!("weather.day_{d}.tx"), max).await;
            }
            if let Some(min) = day.min {
                self.items.set_known(&format!("weather.day_{d}.tn"), min).await;
            }
            if let Some(picture) = day.picture {
                self.items
                    .set_known(&format!("weather.day_{d}.picture"), picture)
                    .await;
            }
            if let Some(weekday) = day.weekday {
                self.items
                    .set_known(&format!("weather.day_{d}.wochentag"), weekday)
                    .await;
            }
        }
        if learned {
            let table = {
                let st = self.state.lock().await;
                Value::Object(
                    st.weather_pics
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                )
            };
            self.items.set("weather_pics", table.to_string()).await;
        }
        Ok(())
    }

    /// Picture file for a weather symbol; unknown symbols are remembered with
    /// the placeholder picture so they are reported once.
    async fn weather_picture(&self, symbol: &str) -> (String, bool) {
        let mut st = self.state.lock().await;
        match st.weather_pics.get(symbol).and_then(Value::as_str) {
            Some(file) => (file.to_string(), false),
            None => {
                tracing::warn!(symbol, "unknown weather symbol");
                st.weather_pics
                    .insert(symbol.to_string(), Value::String(UNKNOWN_PICTURE.into()));
                (UNKNOWN_PICTURE.to_string(), true)
            }
        }
    }

    pub(crate) async fn poll_alerts(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let incoming = match self.api.alerts().await {
            Ok(alerts) => alerts,
            Err(e) => {
                self.state.lock().await.alert_reset = false;
                return Err(e.into());
            }
        };
        let (fresh, value) = {
            let mut st = self.state.lock().await;
            let fresh = st.alerts.merge(incoming);
            (fresh, st.alerts.to_value())
        };
        if !fresh.is_empty() {
            tracing::info!(count = fresh.len(), "new alerts");
            self.items.set("visu.alert_new", true).await;
            let triggers = self.triggers().await;
            for alert in &fresh {
                let text = format!("{} {}", alert.message, alert.headline);
                for n in triggers.match_alarm(&text) {
                    tracing::info!(slot = n, id = alert.alert_id, "alarm trigger fired");
                    self.items.set(&triggers::alarm_flag(n), true).await;
                }
            }
        }
        self.items.set("visu.alerts", value).await;
        Ok(())
    }

    /// Mark every alert listed in `visu.alerts_set_read` as read.
    pub(crate) async fn mark_alerts_read(&self) {
        let ids = crate::alerts::ids(&self.items.get("visu.alerts_set_read").await);
        for id in &ids {
            if let Err(e) = self.api.mark_alert_read(id).await {
                tracing::warn!(error = &e as &dyn std::error::Error, id, "could not mark alert read");
            }
        }
        let value = {
            let mut st = self.state.lock().await;
            for id in &ids {
                st.alerts.mark_read(id);
            }
            st.alerts.to_value()
        };
        self.items.set("visu.alerts", value).await;
    }

    /// Delete every alert listed in `visu.alerts_set_clear`.
    pub(crate) async fn clear_alerts(&self) {
        let ids = crate::alerts::ids(&self.items.get("visu.alerts_set_clear").await);
        let mut deleted = Vec::new();
        for id in ids {
            match self.api.delete_alert(&id).await {
                Ok(()) => deleted.push(id),
                Err(e) => {
                    tracing::warn!(error = &e as &dyn std::error::Error, id, "could not delete alert")
                }
            }
        }
        let (value, empty) = {
            let mut st = self.state.lock().await;
            for id in &deleted {
                st.alerts.remove(id);
            }
            (st.alerts.to_value(), st.alerts.is_empty())
        };
        self.items.set("visu.alerts", value).await;
        if empty {
            self.items.set("visu.alert_new", false).await;
        }
    }

    pub(crate) async fn device_data(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let model_type = self.items.i64("visu.model_type").await;
        let (location, updates, automatic) = futures::join!(
            self.api.location(),
            self.api.updates_available(),
            self.api.automatic_update(),
        );
        match location {
            Ok(location) => {
                if let Some(latitude) = location.latitude {
                    self.items.set("location.latitude", latitude).await;
                }
                if let Some(longitude) = location.longitude {
                    self.items.set("location.longitude", longitude).await;
                }
                if let Some(timezone) = location.timezone {
                    self.items.set("location.timezone", timezone).await;
                }
            }
            Err(e) => tracing::warn!(error = &e as &dyn std::error::Error, "no location"),
        }
        match updates {
            Ok(available) => {
                self.items
                    .set("wartung.update", if available { "JA" } else { "NEIN" })
                    .await
            }
            Err(e) => tracing::warn!(error = &e as &dyn std::error::Error, "no update status"),
        }
        if model_type == 2 {
            match self.api.config().await {
                Ok(config) => self.items.set("wartung.alm_config", config).await,
                Err(e) => tracing::warn!(error = &e as &dyn std::error::Error, "no device config"),
            }
        }
        match automatic {
            Ok(allow) => self.items.set("wartung.update_auto", allow).await,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "no automatic update flag")
            }
        }

        let data = self.api.device_data().await?;
        let items = &self.items;
        items.set("alm_sn", data.alm_sn.clone()).await;
        if let Some(name) = &data.alm_name {
            items.set("alm_name", name.clone()).await;
        }
        items.set("service_counter", data.service_counter).await;
        items
            .set("service_counter.dhm", daystring(data.service_counter))
            .await;
        items.set("needs_service", data.needs_service).await;
        items.set("alm_mode", data.alm_mode.clone()).await;
        items.set("SMART", data.alm_mode == "smart").await;
        let timetable_active = items.bool("active_mode.uzsu.schaltuhr.active").await;
        items
            .set("alm_mode.str", mode_caption(&data.alm_mode, timetable_active))
            .await;

        let (model, model_type, learned) = {
            let mut st = self.state.lock().await;
            let tool = data.bare_toolnumber.as_str();
            match st.mowertypes.get(tool).and_then(Value::as_str).and_then(parse_model) {
                Some((name, kind)) => (format!("Indego {name}"), kind, None),
                None => {
                    let learned = if st.mowertypes.contains_key(tool) {
                        None
                    } else {
                        tracing::warn!(tool, "unknown mower model");
                        st.mowertypes
                            .insert(tool.to_string(), Value::String("unknown".into()));
                        Some(Value::Object(
                            st.mowertypes
                                .iter()
                                .map(|(k, v)| (k.clone(), v.clone()))
                                .collect(),
                        ))
                    };
                    (format!("unknown Modell ({tool})"), 0, learned)
                }
            }
        };
        if let Some(table) = learned {
            items.set("mowertype", table.to_string()).await;
        }
        items.set("visu.model", model).await;
        items.set("visu.model_type", model_type).await;
        items.set("bareToolnumber", data.bare_toolnumber.clone()).await;

        if let Some(version) = data.alm_firmware_version {
            let previous = items.string("alm_firmware_version").await;
            if previous != version {
                if !previous.is_empty() {
                    tracing::info!(previous, version, "firmware changed");
                    items.set("alm_firmware_version.before", previous).await;
                    items.set("alm_firmware_version.changed", stamp()).await;
                }
                items.set("alm_firmware_version", version).await;
            }
        }
        Ok(())
    }

    pub(crate) async fn calendars(&self) -> Result<(), Error> {
        if !self.active().await {
            return Ok(());
        }
        let smart = self.items.bool("SMART").await;
        let code = self.items.i64("stateCode").await;
        if smart && (code == 513 || code == 518) {
            tracing::debug!(code, "SmartMow is mowing, not touching the calendars");
            return Ok(());
        }
        let setup = match self.api.predictive_setup().await {
            Ok(setup) => setup,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "no SmartMow setup, using defaults");
                indego::PredictiveSetup::default()
            }
        };
        self.items
            .set("visu.avoid_temperature", setup.avoid_temperature)
            .await;
        self.items.set("visu.avoid_rain", setup.avoid_rain).await;
        self.items
            .set("visu.use_grass_growth", setup.use_grass_growth)
            .await;
        self.items.set("visu.full_cuts", setup.full_cuts).await;

        for which in [Which::Mowing, Which::Predictive] {
            if self.items.bool(&which.child("save")).await {
                tracing::debug!(calendar = which.item(), "save in progress, not fetching");
                continue;
            }
            let wire = match which {
                Which::Mowing => self.api.calendar().await?,
                Which::Predictive => self.api.predictive_calendar().await?,
            };
            self.publish_calendar(which, &wire).await?;
        }

        if smart {
            let schedule = self.api.predictive_schedule().await?;
            let exclusion =
                calendar::days_to_list(SMARTMOW_CAL, &schedule.exclusion_days).map_err(Error::Calendar)?;
            let mowing =
                calendar::days_to_list(SMARTMOW_CAL, &schedule.schedule_days).map_err(Error::Calendar)?;
            self.items
                .set(
                    "visu.smartmow_days",
                    json!([exclusion.to_value(), mowing.to_value()]),
                )
                .await;
        }
        Ok(())
    }

    async fn publish_calendar(&self, which: Which, wire: &indego::DeviceCalendar) -> Result<(), Error> {
        let set = CalendarSet::from_wire(wire).map_err(Error::Calendar)?;
        let list = CalendarList::from_set(&set);
        let value = serde_json::to_value(wire)
            .map_err(|e| Error::CalendarItem(e, which.item()))?;
        self.items.set(which.item(), value).await;
        self.items.set(&which.child("list"), list.to_value()).await;
        self.items
            .set(&which.child("sel_cal"), wire.sel_cal.unwrap_or(0))
            .await;
        Ok(())
    }

    /// Rebuild the calendar item from its list form.
    pub(crate) async fn apply_list(&self, which: Which) -> Result<(), Error> {
        let list = CalendarList::from_value(&self.items.get(&which.child("list")).await)
            .map_err(Error::Calendar)?;
        let existing = self.calendar_item(which).await?;
        let existing = CalendarSet::from_wire(&existing).map_err(Error::Calendar)?;
        let wire = list.to_set(&existing).to_wire();
        let value = serde_json::to_value(&wire)
            .map_err(|e| Error::CalendarItem(e, which.item()))?;
        self.items.set(which.item(), value).await;
        Ok(())
    }

    async fn calendar_item(&self, which: Which) -> Result<indego::DeviceCalendar, Error> {
        match self.items.get(which.item()).await {
            Value::Null => Ok(indego::DeviceCalendar::default()),
            Value::Object(map) if map.is_empty() => Ok(indego::DeviceCalendar::default()),
            value => serde_json::from_value(value).map_err(|e| Error::CalendarItem(e, which.item())),
        }
    }

    /// First attempt of a calendar save requested through `*_save`.
    pub(crate) async fn start_save(&self, which: Which) {
        self.items
            .set(&which.child("result"), "speichern gestartet")
            .await;
        self.state
            .lock()
            .await
            .save_attempts
            .insert(which.job(), 0);
        if let Err(e) = self.save_calendar(which).await {
            tracing::warn!(error = &e as &dyn std::error::Error, calendar = which.item(), "calendar save failed");
        }
    }

    /// PUT the calendar item; retried a minute later, three attempts at most.
    async fn save_calendar(&self, which: Which) -> Result<(), Error> {
        let attempt = {
            let mut st = self.state.lock().await;
            let attempt = st.save_attempts.entry(which.job()).or_insert(0);
            *attempt += 1;
            *attempt
        };
        let mut wire = self.calendar_item(which).await?;
        let sel_cal = self.items.i64(&which.child("sel_cal")).await;
        wire.sel_cal = Some(u8::try_from(sel_cal).unwrap_or_default());
        let value = serde_json::to_value(&wire)
            .map_err(|e| Error::CalendarItem(e, which.item()))?;
        self.items.set(which.item(), value).await;
        let result = match which {
            Which::Mowing => self.api.put_calendar(&wire).await,
            Which::Predictive => self.api.put_predictive_calendar(&wire).await,
        };
        match result {
            Ok(()) => {
                tracing::info!(calendar = which.item(), attempt, "calendar saved");
                self.items.set(&which.child("save"), false).await;
                self.items
                    .set(&which.child("result"), which.saved_message())
                    .await;
                if which == Which::Mowing {
                    self.items.set("active_mode.kalender", true).await;
                }
                Ok(())
            }
            Err(e) if attempt < SAVE_ATTEMPTS => {
                self.items
                    .set(
                        &which.child("result"),
                        format!(
                            "Mäher konnte nicht erreicht werden nächster Versuch in 60 Sekunden Anzahl Versuche : {attempt}"
                        ),
                    )
                    .await;
                self.schedule
                    .lock()
                    .await
                    .once(which.job(), SAVE_RETRY, boot_time::Instant::now());
                self.wake.notify_one();
                Err(e.into())
            }
            Err(e) => {
                self.items
                    .set(
                        &which.child("result"),
                        "Mähkalender konnte nach drei Versuchen nicht gespeichert werden. Speichern abgebrochen",
                    )
                    .await;
                self.items.set(&which.child("save"), false).await;
                Err(e.into())
            }
        }
    }

    /// Write the SmartMow profile from the `visu.*` items.
    pub(crate) async fn store_smart_profile(&self) -> Result<(), Error> {
        let items = &self.items;
        let mut setup = indego::PredictiveSetup {
            full_cuts: items.i64("visu.full_cuts").await,
            avoid_rain: items.bool("visu.avoid_rain").await,
            use_grass_growth: items.bool("visu.use_grass_growth").await,
            avoid_temperature: items.bool("visu.avoid_temperature").await,
            ..Default::default()
        };
        if items.bool("visu.use_exclude_time_4_sms").await {
            let exclusion = self.calendar_item(Which::Predictive).await?;
            setup.no_mow_calendar_days = exclusion
                .cals
                .into_iter()
                .next()
                .map(|cal| cal.days)
                .unwrap_or_default();
        }
        self.api.put_predictive_setup(&setup).await?;
        Ok(())
    }

    /// Re-read everything the visualisation shows.
    pub(crate) async fn refresh_all(&self) {
        self.items.set("update_active_mode", true).await;
        for job in [
            Job::Calendars,
            Job::State,
            Job::Alerts,
            Job::DeviceData,
            Job::NextTime,
            Job::Weather,
        ] {
            self.run_job(job).await;
        }
        if let Err(e) = self.load_map().await {
            tracing::warn!(error = &e as &dyn std::error::Error, "could not load the garden map");
        }
        self.items.set("update_active_mode", false).await;
    }
}

#[derive(Debug, Default)]
struct Day {
    max: Option<f64>,
    min: Option<f64>,
    picture: Option<String>,
    weekday: Option<&'static str>,
}

/// `minutes` as "X Tage Y Std Z Min".
pub(crate) fn daystring(minutes: u64) -> String {
    let days = minutes / (24 * 60);
    let hours = minutes % (24 * 60) / 60;
    let minutes = minutes % 60;
    format!("{days} Tage {hours} Std {minutes} Min")
}

/// Battery load in percent and its 0..255 icon value for a voltage-reporting model.
fn battery_from_voltage(voltage: f64) -> (i64, i64) {
    let level = (voltage.min(35.0) - 30.0).max(0.0) / 5.0;
    ((level * 100.0).round() as i64, (level * 255.0).round() as i64)
}

fn provider_key(mcc: i64, mnc: i64) -> String {
    format!("{mcc}{mnc:02}")
}

fn provider_name(providers: &BTreeMap<String, Value>, key: &str) -> Option<String> {
    let name = providers.get(key)?.as_str()?;
    (name != format!("{key}unknown")).then(|| name.to_string())
}

/// `"name,type"` from the model table.
fn parse_model(entry: &str) -> Option<(String, i64)> {
    let (name, kind) = entry.split_once(',')?;
    Some((name.trim().to_string(), kind.trim().parse().ok()?))
}

fn mode_caption(mode: &str, timetable_active: bool) -> &'static str {
    match mode {
        "smart" => "Übersicht SmartMow mähen:",
        "calendar" => "Übersicht Kalender mähen:",
        "manual" if timetable_active => "Übersicht mähen nach UZSU:",
        "manual" => "",
        _ => "unbekannt",
    }
}

/// Vendor cutting time as `DD.MM.YYYY - HH:MM` in the offset it was given in.
fn format_cutting(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let datetime: jiff::civil::DateTime = raw
        .parse()
        .ok()
        .or_else(|| raw.get(..19)?.parse().ok())?;
    Some(datetime.strftime("%d.%m.%Y - %H:%M").to_string())
}

fn weekday(raw: &str) -> Option<&'static str> {
    let date: jiff::civil::Date = raw.get(..10)?.parse().ok()?;
    let index = usize::try_from(date.weekday().to_monday_zero_offset()).ok()?;
    WEEKDAYS.get(index).copied()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::tests::{SERIAL, logged_in_api};
    use crate::items::ItemTree;
    use mockito::{Matcher, Server, ServerGuard};

    pub(crate) const DEFINITIONS: &str = include_str!("../items.json");

    impl Reconciler {
        /// Period the state job currently runs at.
        async fn state_period(&self) -> Option<Duration> {
            self.schedule.lock().await.period(Job::State)
        }
    }

    pub(crate) async fn reconciler(server: &ServerGuard) -> Reconciler {
        let definitions: Value = serde_json::from_str(DEFINITIONS).unwrap();
        let tree = ItemTree::from_definitions("indego", &definitions).unwrap();
        Reconciler::new(
            logged_in_api(server).await,
            Items::new(tree),
            Settings::default(),
            None,
        )
        .await
    }

    fn state_body(code: u32, mowed: f64, svg: Option<(i64, i64)>) -> String {
        let mut body = json!({
            "state": code,
            "mowed": mowed,
            "mowmode": 0,
            "map_update_available": false,
            "runtime": {
                "total": {"operate": 1500, "charge": 61},
                "session": {"operate": 12, "charge": 0}
            }
        });
        if let Some((x, y)) = svg {
            body["xPos"] = json!(x * 10);
            body["yPos"] = json!(y * 10);
            body["svg_xPos"] = json!(x);
            body["svg_yPos"] = json!(y);
        }
        body.to_string()
    }

    async fn serve_state(server: &mut ServerGuard, body: String) -> mockito::Mock {
        server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/state").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    async fn serve_json(server: &mut ServerGuard, path: &str, body: Value) -> mockito::Mock {
        server
            .mock("GET", path)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .expect_at_least(1)
            .create_async()
            .await
    }

    #[tokio::test]
    async fn communication_is_mirrored_into_its_item() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let _state = serve_state(&mut server, state_body(258, 0.0, None)).await;
        reconciler.run_job(Job::State).await;
        let lines = reconciler.items.get("webif.communication_protocoll").await;
        let lines = lines.as_array().unwrap();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].as_str().unwrap().contains("/state"));
        assert_eq!(json!(reconciler.comm_log().lock().await.lines()), json!(lines));
    }

    #[tokio::test]
    async fn refresh_reloads_everything() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let device = |path: &str| format!("/api/v1/alms/{SERIAL}{path}");
        let calendar = json!({"sel_cal": 1, "cals": [{"cal": 1, "days": []}]});
        let state = serve_state(&mut server, state_body(258, 0.0, None)).await;
        let mowing = serve_json(&mut server, &device("/calendar"), calendar.clone()).await;
        let predictive =
            serve_json(&mut server, &device("/predictive/calendar"), calendar).await;
        let alerts = serve_json(
            &mut server,
            "/api/v1/alerts",
            json!([{"alert_id": "A1", "message": "Blade worn", "headline": "Service"}]),
        )
        .await;
        let root = serve_json(
            &mut server,
            &device(""),
            json!({"alm_sn": SERIAL, "alm_mode": "calendar", "bareToolnumber": "3600HA2300"}),
        )
        .await;
        let map = server
            .mock("GET", device("/map").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "image/svg+xml")
            .with_body(crate::map::tests::GARDEN)
            .create_async()
            .await;
        let mut rx = reconciler.items.subscribe().await;
        reconciler.refresh_all().await;
        for mock in [&state, &mowing, &predictive, &alerts, &root, &map] {
            mock.assert_async().await;
        }
        let flags: Vec<_> = crate::items::tests::drain(&mut rx)
            .into_iter()
            .filter(|c| c.path == "indego.update_active_mode")
            .map(|c| c.value)
            .collect();
        assert_eq!(flags, vec![json!(true), json!(false)]);
        assert_eq!(reconciler.items.get("update_active_mode").await, json!(false));
        assert!(reconciler.items.get("visu.alerts").await.get("A1").is_some());
        assert!(reconciler
            .items
            .string("visu.map_2_display")
            .await
            .contains(r#"id="mower_pos""#));
        assert!(!reconciler
            .items
            .get("webif.communication_protocoll")
            .await
            .as_array()
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn mow_track_skips_repeated_points() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let position = server
            .mock("POST", format!("/api/v1/alms/{SERIAL}/requestPosition").as_str())
            .match_query(Matcher::Any)
            .with_status(200)
            .create_async()
            .await;
        for point in [(10, 10), (10, 10), (11, 12)] {
            let mock = serve_state(&mut server, state_body(518, 12.0, Some(point))).await;
            reconciler.poll_state().await.unwrap();
            mock.remove_async().await;
        }
        position.assert_async().await;
        assert_eq!(
            reconciler.items.get("visu.mow_track").await,
            json!(["10,10", "11,12"])
        );
        assert_eq!(reconciler.items.get("visu.svg_pos").await, json!("svg_pos|11,12"));
    }

    #[tokio::test]
    async fn track_is_cleared_when_mowing_restarts() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler
            .items
            .set("visu.mow_track", json!(["1,1", "2,2"]))
            .await;
        reconciler
            .items
            .set("visu.mow_track.last_percent_mowed", 80.0)
            .await;
        let _state = serve_state(&mut server, state_body(258, 0.0, None)).await;
        reconciler.poll_state().await.unwrap();
        assert_eq!(reconciler.items.get("visu.mow_track").await, json!([]));
        assert_eq!(reconciler.items.get("docked").await, json!(true));
        assert_eq!(reconciler.items.get("moving").await, json!(false));
        assert_eq!(
            reconciler.items.get("runtimeTotalOperationMins.dhm").await,
            json!("1 Tage 1 Std 0 Min")
        );
    }

    #[tokio::test]
    async fn state_changes_are_logged_and_trigger() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler
            .items
            .set("trigger.state_trigger_2.state", "00258-Angedockt")
            .await;
        let mut rx = reconciler.items.subscribe().await;
        let state = serve_state(&mut server, state_body(258, 0.0, None)).await;
        reconciler.poll_state().await.unwrap();
        reconciler.poll_state().await.unwrap();
        state.remove_async().await;
        assert_eq!(reconciler.state_log.lock().await.len(), 1);
        let fired: Vec<_> = crate::items::tests::drain(&mut rx)
            .into_iter()
            .filter(|c| c.path == "indego.trigger.state_trigger_2")
            .collect();
        assert_eq!(fired.len(), 1);
        assert_eq!(reconciler.items.get("webif.laststateCode").await, json!(258));
        assert_eq!(reconciler.items.get("state_str").await, json!("Angedockt"));
    }

    #[tokio::test]
    async fn unknown_codes_are_persisted() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let _state = serve_state(&mut server, state_body(4242, 0.0, None)).await;
        reconciler.poll_state().await.unwrap();
        assert_eq!(reconciler.items.get("state_str").await, json!("4242 unknown"));
        let table: Value =
            serde_json::from_str(&reconciler.items.string("states_str").await).unwrap();
        assert_eq!(table["4242"], json!(["4242 unknown", "unknown"]));
        // The previous category stands in, so exactly one flag stays set.
        let flags = futures::future::join_all(
            ["docked", "moving", "pause", "help"].map(|f| reconciler.items.bool(f)),
        )
        .await;
        assert_eq!(flags.iter().filter(|f| **f).count(), 1);
    }

    #[tokio::test]
    async fn cadence_follows_activity() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler.start().await;
        let position = server
            .mock("POST", format!("/api/v1/alms/{SERIAL}/requestPosition").as_str())
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("count".into(), "100".into()),
                Matcher::UrlEncoded("interval".into(), "7".into()),
            ]))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let mowing = serve_state(&mut server, state_body(518, 5.0, None)).await;
        reconciler.poll_state().await.unwrap();
        reconciler.poll_state().await.unwrap();
        mowing.remove_async().await;
        assert_eq!(reconciler.state_period().await, Some(SAMPLING_PERIOD));
        let done = serve_state(&mut server, state_body(775, 100.0, None)).await;
        reconciler.poll_state().await.unwrap();
        done.remove_async().await;
        position.assert_async().await;
        assert_eq!(
            reconciler.state_period().await,
            Some(Settings::default().cycle)
        );
    }

    #[tokio::test]
    async fn winter_mode_skips_polling() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler.items.set("wartung.wintermodus", true).await;
        let weather = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/predictive/weather").as_str())
            .expect(0)
            .create_async()
            .await;
        // Nothing else is mocked either; any request would fail the job.
        reconciler.poll_state().await.unwrap();
        reconciler.poll_alerts().await.unwrap();
        reconciler.weather().await.unwrap();
        weather.assert_async().await;
        assert_eq!(reconciler.items.get("online").await, json!(false));
    }

    #[tokio::test]
    async fn new_alert_fires_alarm_trigger() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler
            .items
            .set("trigger.alarm_trigger_1.alarm", "blade")
            .await;
        let _alerts = server
            .mock("GET", "/api/v1/alerts")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"alert_id":"A1","message":"Blade worn","headline":"Service"}]"#)
            .create_async()
            .await;
        reconciler.poll_alerts().await.unwrap();
        assert!(reconciler.items.get("visu.alerts").await.get("A1").is_some());
        assert_eq!(reconciler.items.get("visu.alert_new").await, json!(true));
        assert_eq!(
            reconciler.items.get("trigger.alarm_trigger_1").await,
            json!(true)
        );
        assert_eq!(
            reconciler.items.get("trigger.alarm_trigger_2").await,
            json!(false)
        );
    }

    #[tokio::test]
    async fn cleared_alerts_reset_the_new_flag() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let _alerts = server
            .mock("GET", "/api/v1/alerts")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"alert_id":0,"message":"m","headline":"h"}]"#)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/api/v1/alerts/0")
            .with_status(200)
            .create_async()
            .await;
        reconciler.poll_alerts().await.unwrap();
        reconciler.items.set("visu.alerts_set_clear", json!([0])).await;
        reconciler.clear_alerts().await;
        delete.assert_async().await;
        assert_eq!(reconciler.items.get("visu.alerts").await, json!({}));
        assert_eq!(reconciler.items.get("visu.alert_new").await, json!(false));
    }

    #[tokio::test]
    async fn battery_and_provider_for_connected_models() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler.items.set("visu.model_type", 2).await;
        let _data = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/operatingData").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"battery":{"percent":80,"voltage":33.1},"garden":{"size":420}}"#)
            .create_async()
            .await;
        let _network = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/network").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"mcc":262,"mnc":1,"rssi":-70,"networks":[26201,99999]}"#)
            .create_async()
            .await;
        reconciler.operating_data().await.unwrap();
        assert_eq!(reconciler.items.get("visu.battery_load").await, json!(80.0));
        assert_eq!(reconciler.items.get("visu.battery_load_icon").await, json!(204));
        assert_eq!(
            reconciler.items.get("visu.network.act_provider").await,
            json!("Telekom Deutschland")
        );
        assert_eq!(
            reconciler.items.get("visu.network.available_provider").await,
            json!("Telekom Deutschland, 99999 - unknown")
        );
    }

    #[tokio::test]
    async fn device_data_learns_unknown_models() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let mut mocks = Vec::new();
        for (path, body) in [
            ("predictive/location", r#"{"latitude":"48.1","longitude":"11.5","timezone":"Europe/Berlin"}"#),
            ("updates", r#"{"available":false}"#),
            ("automaticUpdate", r#"{"allow_automatic_update":true}"#),
            (
                "",
                r#"{"alm_sn":"603702021","alm_name":"Indego","service_counter":1505,
                    "needs_service":false,"alm_mode":"calendar","bareToolnumber":"XYZ",
                    "alm_firmware_version":"00837.01043"}"#,
            ),
        ] {
            let url = if path.is_empty() {
                format!("/api/v1/alms/{SERIAL}")
            } else {
                format!("/api/v1/alms/{SERIAL}/{path}")
            };
            let mock = server
                .mock("GET", url.as_str())
                .with_status(200)
                .with_header("content-type", "application/json")
                .with_body(body)
                .create_async()
                .await;
            mocks.push(mock);
        }
        reconciler.device_data().await.unwrap();
        let items = &reconciler.items;
        assert_eq!(items.get("wartung.update").await, json!("NEIN"));
        assert_eq!(items.get("wartung.update_auto").await, json!(true));
        assert_eq!(items.get("alm_mode.str").await, json!("Übersicht Kalender mähen:"));
        assert_eq!(items.get("service_counter.dhm").await, json!("1 Tage 1 Std 5 Min"));
        assert_eq!(items.get("visu.model").await, json!("unknown Modell (XYZ)"));
        assert_eq!(items.get("visu.model_type").await, json!(0));
        let table: Value = serde_json::from_str(&items.string("mowertype").await).unwrap();
        assert_eq!(table["XYZ"], json!("unknown"));
        assert_eq!(items.get("alm_firmware_version").await, json!("00837.01043"));
        assert_eq!(items.get("alm_firmware_version.before").await, json!(""));
    }

    #[tokio::test]
    async fn weather_is_aggregated_per_day() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let intervals: Vec<Value> = [(11.0, "2"), (17.5, "1"), (14.0, "3"), (9.0, "2"), (8.0, "777")]
            .iter()
            .enumerate()
            .map(|(i, (tt, symbol))| {
                json!({
                    "dateTime": format!("2024-06-{:02}T{:02}:00:00Z", 3 + i / 4, (i % 4) * 6),
                    "tt": tt,
                    "wwsymbol_mg2008": symbol,
                })
            })
            .collect();
        let _weather = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/predictive/weather").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"LocationWeather": {"forecast": {"intervals": intervals}}}).to_string())
            .create_async()
            .await;
        reconciler.weather().await.unwrap();
        let items = &reconciler.items;
        assert_eq!(items.get("weather.day_0.tx").await, json!(17.5));
        assert_eq!(items.get("weather.day_0.tn").await, json!(9.0));
        assert_eq!(items.get("weather.day_0.wochentag").await, json!("Montag"));
        assert_eq!(items.get("weather.day_0.picture").await, json!("sun.png"));
        assert_eq!(items.get("weather.day_1.wochentag").await, json!("Dienstag"));
        assert_eq!(items.get("weather.int_4.picture").await, json!("na.png"));
        let table: Value = serde_json::from_str(&items.string("weather_pics").await).unwrap();
        assert_eq!(table["777"], json!("na.png"));
    }

    #[tokio::test]
    async fn cutting_times_are_formatted() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let _next = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/predictive/nextcutting").as_str())
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"mow_next":"2024-06-03T14:30:00+02:00"}"#)
            .create_async()
            .await;
        let _last = server
            .mock("GET", format!("/api/v1/alms/{SERIAL}/predictive/lastcutting").as_str())
            .with_status(500)
            .create_async()
            .await;
        reconciler.next_time().await.unwrap();
        assert_eq!(
            reconciler.items.get("next_time").await,
            json!("03.06.2024 - 14:30")
        );
        assert_eq!(
            reconciler.items.get("last_time").await,
            json!("kein letztes Mähen bekannt")
        );
    }

    #[tokio::test]
    async fn failed_saves_are_retried_then_abandoned() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        let put = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/calendar").as_str())
            .with_status(504)
            .expect(3)
            .create_async()
            .await;
        reconciler.items.set("calendar_save", true).await;
        reconciler.start_save(Which::Mowing).await;
        assert!(reconciler.schedule.lock().await.contains(Job::SaveCalendar));
        assert!(reconciler
            .items
            .string("calendar_result")
            .await
            .ends_with("Anzahl Versuche : 1"));
        reconciler.run_job(Job::SaveCalendar).await;
        reconciler.run_job(Job::SaveCalendar).await;
        put.assert_async().await;
        assert_eq!(reconciler.items.get("calendar_save").await, json!(false));
        assert!(reconciler
            .items
            .string("calendar_result")
            .await
            .contains("Speichern abgebrochen"));
    }

    #[tokio::test]
    async fn successful_save_selects_calendar_mode() {
        let mut server = Server::new_async().await;
        let reconciler = reconciler(&server).await;
        reconciler
            .items
            .set(
                "calendar",
                json!({"cals": [{"cal": 2, "days": [{"day": 0, "slots": [
                    {"StHr": 10, "StMin": 0, "EnHr": 12, "EnMin": 0, "En": true}
                ]}]}]}),
            )
            .await;
        reconciler.items.set("calendar_sel_cal", 2).await;
        let put = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/calendar").as_str())
            .match_body(Matcher::PartialJson(json!({"sel_cal": 2})))
            .with_status(200)
            .create_async()
            .await;
        reconciler.start_save(Which::Mowing).await;
        put.assert_async().await;
        assert_eq!(
            reconciler.items.get("calendar_result").await,
            json!("Mähkalender wurde gespeichert")
        );
        assert_eq!(reconciler.items.get("active_mode.kalender").await, json!(true));
    }

    #[test]
    fn helpers() {
        assert_eq!(daystring(0), "0 Tage 0 Std 0 Min");
        assert_eq!(battery_from_voltage(34.0), (80, 204));
        assert_eq!(battery_from_voltage(40.0), (100, 255));
        assert_eq!(battery_from_voltage(20.0), (0, 0));
        assert_eq!(provider_key(262, 1), "26201");
        assert_eq!(parse_model("S+ 400,2"), Some(("S+ 400".to_string(), 2)));
        assert_eq!(mode_caption("manual", true), "Übersicht mähen nach UZSU:");
        assert_eq!(mode_caption("weird", false), "unbekannt");
        assert_eq!(format_cutting("garbage"), None);
        assert_eq!(weekday("2024-06-09T00:00:00Z"), Some("Sonntag"));
    }
}
