//! Routes item writes to the vendor and to dependent items.

use crate::calendar;
use crate::items::{ItemChange, truthy};
use crate::reconciler::{Reconciler, Which};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

const CALENDAR_MODE_CAPTION: &str = "Übersicht Kalender mähen:";
const SMART_MODE_CAPTION: &str = "Übersicht SmartMow mähen:";
const TIMETABLE_CAPTION: &str = "Übersicht mähen nach UZSU:";

/// Handlers items can name through `indego_function_4_all` and
/// `indego_function_4_visu`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Handler {
    Alerts,
    MowTrack,
    Wartung,
    StoreCals,
    ParseMap,
    CalendarList,
    AlmMode,
    Refresh,
    ActiveMode,
}

impl Handler {
    /// Accepts both `mow_track` and the older `_handle_mow_track` spelling.
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Some(match name.strip_prefix("_handle_").unwrap_or(name) {
            "alerts" => Self::Alerts,
            "mow_track" => Self::MowTrack,
            "wartung" => Self::Wartung,
            "store_cals" => Self::StoreCals,
            "parse_map" => Self::ParseMap,
            "calendar_list" => Self::CalendarList,
            "alm_mode" => Self::AlmMode,
            "refresh" => Self::Refresh,
            "active_mode" => Self::ActiveMode,
            _ => return None,
        })
    }
}

pub(crate) struct Bridge {
    reconciler: Arc<Reconciler>,
}

impl Bridge {
    pub(crate) fn new(reconciler: Arc<Reconciler>) -> Self {
        Self { reconciler }
    }

    /// Handle item changes one at a time until every sender is gone.
    pub(crate) async fn run(&self, mut changes: mpsc::UnboundedReceiver<ItemChange>) {
        while let Some(change) = changes.recv().await {
            self.dispatch(&change).await;
        }
        tracing::debug!("item change stream ended");
    }

    pub(crate) async fn dispatch(&self, change: &ItemChange) {
        let (name, attributes) = {
            let tree = self.reconciler.items().lock().await;
            let Some(name) = tree.relative(&change.path) else {
                return;
            };
            let Some(item) = tree.item(&change.path) else {
                return;
            };
            (name.to_string(), item.attributes.clone())
        };
        let value = &change.value;

        if change.origin.is_user() {
            tracing::info!(item = name, origin = change.origin.label(), "item changed outside the plugin");
            if let (Some(body), Some(url)) = (&attributes.config, &attributes.config_url) {
                self.send_config(&name, url, body, value).await;
            }
            if let Some(function) = &attributes.function_4_visu {
                self.call(function, &name, value).await;
            }
            if name == "active_mode.uzsu" {
                let command = match value.as_i64() {
                    Some(10) => Some("MOW"),
                    Some(20) => Some("RETURN"),
                    Some(30) => Some("PAUSE"),
                    _ => None,
                };
                if let Some(command) = command {
                    self.set(command, true).await;
                }
            }
            if name.contains("show_uzsu_popup") && truthy(value) {
                self.set("visu.fire_uszu_popup", "fire_uszu_popup|True").await;
            }
        }

        if let Some(command) = &attributes.command {
            if truthy(value) {
                self.send_command(&name, command).await;
            }
        }
        if let Some(function) = &attributes.function_4_all {
            self.call(function, &name, value).await;
        }
        if name.starts_with("active_mode") {
            let mode = self.reconciler.items().get("active_mode").await;
            self.set("visu.cal_2_show", format!("cal2show|{mode}")).await;
        }
    }

    async fn set(&self, name: &str, value: impl Into<Value>) {
        self.reconciler.items().set(name, value).await;
    }

    async fn send_command(&self, name: &str, command: &str) {
        let command: Value = match serde_json::from_str(command) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, item = name, "command is not JSON");
                return;
            }
        };
        if let Err(e) = self.reconciler.api().command(&command).await {
            tracing::warn!(error = &e as &dyn std::error::Error, item = name, "command failed");
        }
    }

    /// PUT the item's config template with `#` replaced by its value.
    async fn send_config(&self, name: &str, url: &str, body: &str, value: &Value) {
        let value = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let body: Value = match serde_json::from_str(&body.replace('#', &value)) {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, item = name, "config body is not JSON");
                return;
            }
        };
        if let Err(e) = self.reconciler.api().put_config(url, &body).await {
            tracing::warn!(error = &e as &dyn std::error::Error, item = name, "config write failed");
        }
    }

    async fn call(&self, function: &str, name: &str, value: &Value) {
        let Some(handler) = Handler::from_name(function) else {
            tracing::warn!(item = name, function, "no such handler");
            return;
        };
        tracing::debug!(item = name, ?handler, "running handler");
        match handler {
            Handler::Alerts => self.alerts(name).await,
            Handler::MowTrack => self.mow_track(name, value).await,
            Handler::Wartung => self.wartung(name, value).await,
            Handler::StoreCals => self.store_cals(name, value).await,
            Handler::ParseMap => {
                if let Err(e) = self.reconciler.parse_map().await {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not recompose the map");
                }
            }
            Handler::CalendarList => self.calendar_list(name).await,
            Handler::AlmMode => self.alm_mode(value).await,
            Handler::Refresh => {
                if truthy(value) {
                    self.reconciler.refresh_all().await;
                    self.set(name, false).await;
                }
            }
            Handler::ActiveMode => self.active_mode(name, value).await,
        }
    }

    async fn alerts(&self, name: &str) {
        match name {
            "visu.alerts_set_read" => self.reconciler.mark_alerts_read().await,
            "visu.alerts_set_clear" => self.reconciler.clear_alerts().await,
            _ => {}
        }
    }

    async fn mow_track(&self, name: &str, value: &Value) {
        let items = self.reconciler.items();
        match name {
            "visu.mow_track" if items.bool("visu.show_mow_track").await => {
                self.reconciler.render_track(true).await
            }
            "visu.show_mow_track" => self.reconciler.render_track(truthy(value)).await,
            _ => {}
        }
    }

    async fn wartung(&self, name: &str, value: &Value) {
        let api = self.reconciler.api();
        match name {
            "wartung.wintermodus" => {
                self.set("visu.wintermodus", format!("wintermodus|{}", truthy(value)))
                    .await;
            }
            "wartung.update_auto" => {
                if let Err(e) = api.put_automatic_update(truthy(value)).await {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not store the automatic update flag");
                }
            }
            "wartung.messer_zaehler" if truthy(value) => match api.reset_blade_counter().await {
                Ok(()) => self.set(name, false).await,
                Err(e) => {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not reset the blade counter")
                }
            },
            "wartung.update_start" if truthy(value) => {
                if let Err(e) = api.start_update().await {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not start the firmware update");
                }
                self.set(name, false).await;
            }
            _ => {}
        }
    }

    async fn store_cals(&self, name: &str, value: &Value) {
        if !truthy(value) {
            return;
        }
        match name {
            "visu.store_sms_profile" => {
                if let Err(e) = self.reconciler.store_smart_profile().await {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not store the SmartMow profile");
                }
                self.set(name, false).await;
            }
            "calendar_save" => self.reconciler.start_save(Which::Mowing).await,
            "calendar_predictive_save" => self.reconciler.start_save(Which::Predictive).await,
            _ => {}
        }
    }

    async fn calendar_list(&self, name: &str) {
        let which = match name {
            "calendar_list" => Which::Mowing,
            "calendar_predictive_list" => Which::Predictive,
            _ => return,
        };
        if let Err(e) = self.reconciler.apply_list(which).await {
            tracing::warn!(error = &e as &dyn std::error::Error, item = name, "could not apply the calendar list");
        }
    }

    /// Mirror the mode the vendor reports into the three exclusive mode flags.
    async fn alm_mode(&self, value: &Value) {
        let (mode, chosen) = match value.as_str() {
            Some("smart") => (2, "active_mode.smart"),
            Some("calendar") => (1, "active_mode.kalender"),
            Some("manual") => (3, "active_mode.aus"),
            _ => return,
        };
        self.set("active_mode", mode).await;
        for flag in ["active_mode.aus", "active_mode.kalender", "active_mode.smart"] {
            if flag != chosen {
                self.set(flag, false).await;
            }
        }
        self.set(chosen, true).await;
        if chosen != "active_mode.aus" {
            self.set("active_mode.uzsu.schaltuhr.active", false).await;
        }
    }

    async fn set_predictive(&self, enabled: bool) {
        if let Err(e) = self.reconciler.api().set_predictive(enabled).await {
            tracing::warn!(error = &e as &dyn std::error::Error, enabled, "could not switch SmartMow");
        }
    }

    async fn active_mode(&self, name: &str, value: &Value) {
        match name {
            "active_mode.kalender" if truthy(value) => {
                self.set("update_active_mode", true).await;
                self.set("active_mode", 1).await;
                self.set("active_mode.smart", false).await;
                self.set("active_mode.aus", false).await;
                self.set_predictive(false).await;
                self.set("calendar_sel_cal", 2).await;
                self.set("calendar_save", true).await;
                self.set("alm_mode.str", CALENDAR_MODE_CAPTION).await;
                self.set("alm_mode", "calendar").await;
                self.set("update_active_mode", false).await;
                self.set("active_mode.uzsu.schaltuhr.active", false).await;
            }
            "active_mode.aus" if truthy(value) => {
                self.set("update_active_mode", true).await;
                self.set("active_mode", 3).await;
                self.set("active_mode.kalender", false).await;
                self.set("alm_mode.str", "").await;
                self.set("active_mode.smart", false).await;
                self.set_predictive(false).await;
                self.set("calendar_sel_cal", 0).await;
                self.set("calendar_save", true).await;
                self.set("alm_mode", "manual").await;
                self.set("update_active_mode", false).await;
            }
            "active_mode.smart" if truthy(value) => {
                self.set("update_active_mode", true).await;
                self.set("active_mode", 2).await;
                self.set("alm_mode.str", SMART_MODE_CAPTION).await;
                self.set("active_mode.aus", false).await;
                self.set("active_mode.kalender", false).await;
                self.set("calendar_sel_cal", 3).await;
                self.set("calendar_save", true).await;
                self.set_predictive(true).await;
                self.set("alm_mode", "smart").await;
                self.set("update_active_mode", false).await;
                self.set("active_mode.uzsu.schaltuhr.active", false).await;
            }
            "active_mode.uzsu.schaltuhr" => {
                let active = value.get("active").is_some_and(truthy);
                self.set("active_mode.uzsu.schaltuhr.active", active).await;
                if active {
                    let list = calendar::timetable_to_list(value);
                    self.set("active_mode.uzsu.calendar_list", list.to_value())
                        .await;
                    self.set("alm_mode.str", TIMETABLE_CAPTION).await;
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::SERIAL;
    use crate::items::Origin;
    use crate::items::tests::drain;
    use crate::reconciler::tests::reconciler;
    use mockito::{Matcher, Server};
    use serde_json::json;

    async fn external(bridge: &Bridge, name: &str, value: Value) {
        let items = bridge.reconciler.items();
        let path = items.lock().await.path(name);
        items
            .write(&path, value.clone(), Origin::External("visu".into()))
            .await;
        bridge
            .dispatch(&ItemChange {
                path,
                value,
                origin: Origin::External("visu".into()),
            })
            .await;
    }

    #[test]
    fn handler_names() {
        assert_eq!(Handler::from_name("mow_track"), Some(Handler::MowTrack));
        assert_eq!(Handler::from_name("_handle_store_cals"), Some(Handler::StoreCals));
        assert_eq!(Handler::from_name("nope"), None);
    }

    #[tokio::test]
    async fn calendar_mode_is_selected() {
        let mut server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let items = bridge.reconciler.items();
        items.set("active_mode.smart", true).await;
        items.set("active_mode", 2).await;
        let predictive = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/predictive").as_str())
            .match_body(Matcher::Json(json!({"enabled": false})))
            .with_status(200)
            .create_async()
            .await;
        let mut rx = items.subscribe().await;
        external(&bridge, "active_mode.kalender", json!(true)).await;
        predictive.assert_async().await;
        assert_eq!(items.get("active_mode").await, json!(1));
        assert_eq!(items.get("active_mode.smart").await, json!(false));
        assert_eq!(items.get("active_mode.aus").await, json!(false));
        assert_eq!(items.get("alm_mode").await, json!("calendar"));
        assert_eq!(items.get("calendar_sel_cal").await, json!(2));
        assert_eq!(items.get("calendar_save").await, json!(true));
        assert_eq!(items.get("visu.cal_2_show").await, json!("cal2show|1"));
        let order: Vec<_> = drain(&mut rx)
            .into_iter()
            .map(|c| c.path)
            .filter(|p| p == "indego.active_mode" || p == "indego.alm_mode")
            .collect();
        assert_eq!(order, vec!["indego.active_mode", "indego.alm_mode"]);
    }

    #[tokio::test]
    async fn plugin_writes_do_not_run_visu_handlers() {
        let server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let items = bridge.reconciler.items();
        let path = items.lock().await.path("active_mode.smart");
        items.set("active_mode.smart", true).await;
        // No predictive mock: a PUT would only log, so check the items instead.
        bridge
            .dispatch(&ItemChange {
                path,
                value: json!(true),
                origin: Origin::Plugin,
            })
            .await;
        assert_eq!(items.get("alm_mode").await, json!(""));
        assert_eq!(items.get("calendar_save").await, json!(false));
    }

    #[tokio::test]
    async fn commands_are_sent_for_any_origin() {
        let mut server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let mow = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/state").as_str())
            .match_body(Matcher::Json(json!({"state": "mow"})))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let path = bridge.reconciler.items().lock().await.path("MOW");
        bridge
            .dispatch(&ItemChange {
                path,
                value: json!(true),
                origin: Origin::Plugin,
            })
            .await;
        mow.assert_async().await;
    }

    #[tokio::test]
    async fn timetable_values_fire_commands() {
        let mut server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let mut rx = bridge.reconciler.items().subscribe().await;
        let _ret = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/state").as_str())
            .with_status(200)
            .create_async()
            .await;
        external(&bridge, "active_mode.uzsu", json!(20)).await;
        assert!(drain(&mut rx)
            .iter()
            .any(|c| c.path == "indego.RETURN" && c.value == json!(true)));
    }

    #[tokio::test]
    async fn config_template_is_filled_in() {
        let mut server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let config = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/config").as_str())
            .match_body(Matcher::Json(json!({"bump_sensitivity": 1})))
            .with_status(200)
            .create_async()
            .await;
        external(&bridge, "config.bump_sensitivity", json!(1)).await;
        config.assert_async().await;
    }

    #[tokio::test]
    async fn calendar_list_edits_reach_the_matrix() {
        let server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let list = json!({
            "2-10:00-12:00": {"Key": "2-10:00-12:00", "Days": "1,3,5"},
            "Params": {"CalCount": [2]}
        });
        external(&bridge, "calendar_list", list).await;
        let calendar = bridge.reconciler.items().get("calendar").await;
        let cal = calendar["cals"]
            .as_array()
            .unwrap()
            .iter()
            .find(|c| c["cal"] == 2)
            .unwrap()
            .clone();
        for day in cal["days"].as_array().unwrap() {
            let slot = &day["slots"][0];
            if [1, 3, 5].contains(&day["day"].as_u64().unwrap()) {
                assert_eq!(slot["StHr"], 10);
                assert_eq!(slot["EnHr"], 12);
                assert_eq!(slot["En"], true);
            } else {
                assert_eq!(slot["En"], false);
            }
        }
    }

    #[tokio::test]
    async fn showing_the_track_renders_it() {
        let server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let items = bridge.reconciler.items();
        items.set("visu.mow_track", json!(["1,1", "2,2"])).await;
        external(&bridge, "visu.show_mow_track", json!(true)).await;
        let rendered = items.string("visu.svg_mow_track").await;
        let track: Value =
            serde_json::from_str(rendered.strip_prefix("svg_mow_track|").unwrap()).unwrap();
        assert_eq!(track["Points"], json!(["1,1", "2,2"]));
        external(&bridge, "visu.show_mow_track", json!(false)).await;
        assert_eq!(items.get("visu.svg_mow_track").await, json!("svg_mow_track|"));
    }

    #[tokio::test]
    async fn vendor_mode_sets_exactly_one_flag() {
        let server = Server::new_async().await;
        let bridge = Bridge::new(Arc::new(reconciler(&server).await));
        let items = bridge.reconciler.items();
        items.set("active_mode.kalender", true).await;
        bridge.alm_mode(&json!("manual")).await;
        assert_eq!(items.get("active_mode").await, json!(3));
        assert_eq!(items.get("active_mode.aus").await, json!(true));
        assert_eq!(items.get("active_mode.kalender").await, json!(false));
        assert_eq!(items.get("active_mode.smart").await, json!(false));
    }
}
