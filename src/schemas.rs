pub(crate) mod oauth {
    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct TokenResponse {
        pub(crate) access_token: String,
        pub(crate) refresh_token: Option<String>,
        pub(crate) expires_in: f64,
    }
}

pub(crate) mod indego {
    use serde::Deserialize as _;
    use std::collections::BTreeMap;

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Alm {
        pub(crate) alm_sn: String,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct State {
        pub(crate) state: u32,
        pub(crate) error: Option<u32>,
        #[serde(default)]
        pub(crate) mowed: f64,
        pub(crate) mowmode: Option<i64>,
        pub(crate) runtime: Runtime,
        #[serde(rename = "xPos")]
        pub(crate) x_pos: Option<i64>,
        #[serde(rename = "yPos")]
        pub(crate) y_pos: Option<i64>,
        #[serde(rename = "svg_xPos")]
        pub(crate) svg_x_pos: Option<i64>,
        #[serde(rename = "svg_yPos")]
        pub(crate) svg_y_pos: Option<i64>,
        #[serde(default)]
        pub(crate) map_update_available: bool,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Runtime {
        pub(crate) total: RuntimeCounters,
        pub(crate) session: RuntimeCounters,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct RuntimeCounters {
        pub(crate) operate: u64,
        pub(crate) charge: u64,
    }

    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
    pub(crate) struct Alert {
        #[serde(deserialize_with = "string_or_number")]
        pub(crate) alert_id: String,
        #[serde(default)]
        pub(crate) message: String,
        #[serde(default)]
        pub(crate) headline: String,
        #[serde(default = "unread")]
        pub(crate) read_status: String,
        #[serde(default)]
        pub(crate) date: Option<String>,
    }

    fn unread() -> String {
        "unread".into()
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct DeviceData {
        pub(crate) alm_sn: String,
        pub(crate) alm_name: Option<String>,
        #[serde(default)]
        pub(crate) service_counter: u64,
        #[serde(default)]
        pub(crate) needs_service: bool,
        pub(crate) alm_mode: String,
        #[serde(rename = "bareToolnumber")]
        pub(crate) bare_toolnumber: String,
        pub(crate) alm_firmware_version: Option<String>,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub(crate) struct Location {
        pub(crate) latitude: Option<serde_json::Value>,
        pub(crate) longitude: Option<serde_json::Value>,
        pub(crate) timezone: Option<String>,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Updates {
        pub(crate) available: bool,
    }

    #[derive(Debug, serde::Deserialize, serde::Serialize)]
    pub(crate) struct AutomaticUpdate {
        pub(crate) allow_automatic_update: bool,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct NextCutting {
        pub(crate) mow_next: String,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct LastCutting {
        pub(crate) last_mowed: String,
    }

    #[derive(Debug, serde::Deserialize)]
    #[serde(rename_all = "PascalCase")]
    pub(crate) struct Weather {
        pub(crate) location_weather: LocationWeather,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct LocationWeather {
        pub(crate) forecast: Forecast,
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct Forecast {
        pub(crate) intervals: Vec<BTreeMap<String, serde_json::Value>>,
    }

    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
    pub(crate) struct PredictiveSetup {
        pub(crate) full_cuts: i64,
        #[serde(default)]
        pub(crate) no_mow_calendar_days: Vec<CalendarDay>,
        #[serde(default)]
        pub(crate) avoid_rain: bool,
        #[serde(default)]
        pub(crate) use_grass_growth: bool,
        #[serde(default)]
        pub(crate) avoid_temperature: bool,
    }

    impl Default for PredictiveSetup {
        fn default() -> Self {
            Self {
                full_cuts: 2,
                no_mow_calendar_days: Vec::new(),
                avoid_rain: false,
                use_grass_growth: false,
                avoid_temperature: false,
            }
        }
    }

    #[derive(Debug, serde::Deserialize)]
    pub(crate) struct PredictiveSchedule {
        #[serde(default)]
        pub(crate) exclusion_days: Vec<CalendarDay>,
        #[serde(default)]
        pub(crate) schedule_days: Vec<CalendarDay>,
    }

    /// The device's slot-based calendar set.
    #[derive(Debug, Clone, Default, serde::Deserialize, serde::Serialize, PartialEq)]
    pub(crate) struct DeviceCalendar {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub(crate) sel_cal: Option<u8>,
        #[serde(default)]
        pub(crate) cals: Vec<CalendarEntry>,
    }

    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
    pub(crate) struct CalendarEntry {
        pub(crate) cal: u8,
        #[serde(default)]
        pub(crate) days: Vec<CalendarDay>,
    }

    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
    pub(crate) struct CalendarDay {
        pub(crate) day: u8,
        #[serde(default)]
        pub(crate) slots: Vec<WireSlot>,
    }

    /// Hours and minutes arrive as numbers from the vendor but older clients
    /// wrote them back as zero-padded strings, so both are accepted.
    #[derive(Debug, Clone, serde::Deserialize, serde::Serialize, PartialEq)]
    pub(crate) struct WireSlot {
        #[serde(rename = "StHr", deserialize_with = "lenient_u8", default)]
        pub(crate) st_hr: u8,
        #[serde(rename = "StMin", deserialize_with = "lenient_u8", default)]
        pub(crate) st_min: u8,
        #[serde(rename = "EnHr", deserialize_with = "lenient_u8", default)]
        pub(crate) en_hr: u8,
        #[serde(rename = "EnMin", deserialize_with = "lenient_u8", default)]
        pub(crate) en_min: u8,
        #[serde(rename = "En", default)]
        pub(crate) en: bool,
        #[serde(rename = "Attr", default, skip_serializing_if = "Option::is_none")]
        pub(crate) attr: Option<String>,
    }

    fn lenient_u8<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::Number(n) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| D::Error::custom(format!("time component out of range: {n}"))),
            serde_json::Value::String(s) if s.is_empty() => Ok(0),
            serde_json::Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("bad time component `{s}`"))),
            serde_json::Value::Null => Ok(0),
            other => Err(D::Error::custom(format!("bad time component {other}"))),
        }
    }

    fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Number(n) => Ok(n.to_string()),
            other => Err(D::Error::custom(format!("unexpected id {other}"))),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::indego::*;

    #[test]
    fn state_decodes_positions() {
        let state: State = serde_json::from_str(
            r#"{"state":518,"mowed":42.0,"mowmode":1,"map_update_available":false,
                "runtime":{"total":{"operate":100,"charge":50},"session":{"operate":3,"charge":0}},
                "xPos":10,"yPos":20,"svg_xPos":110,"svg_yPos":120}"#,
        )
        .unwrap();
        assert_eq!(state.state, 518);
        assert_eq!(state.svg_x_pos, Some(110));
        assert_eq!(state.error, None);
    }

    #[test]
    fn alert_id_zero_is_kept() {
        let alert: Alert =
            serde_json::from_str(r#"{"alert_id":0,"message":"m","headline":"h"}"#).unwrap();
        assert_eq!(alert.alert_id, "0");
        assert_eq!(alert.read_status, "unread");
    }

    #[test]
    fn slots_accept_padded_strings() {
        let slot: WireSlot = serde_json::from_str(
            r#"{"StHr":"08","StMin":"05","EnHr":12,"EnMin":0,"En":true}"#,
        )
        .unwrap();
        assert_eq!((slot.st_hr, slot.st_min, slot.en_hr, slot.en_min), (8, 5, 12, 0));
    }
}
