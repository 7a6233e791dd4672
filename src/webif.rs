//! Admin web surface: credential setup, trigger patterns, map styling and the
//! two protocol logs.

use crate::auth::Credentials;
use crate::reconciler::Reconciler;
use crate::ringlog::RingLog;
use crate::schemas::indego::Location;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Form, Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

const CREDENTIALS_KEY: &str = "indego_credentials";
const LOCATION_TIMEZONE: &str = "Europe/Berlin";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("could not bind the admin web surface to {1}")]
    Bind(#[source] std::io::Error, SocketAddr),
    #[error("the admin web surface stopped")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
pub(crate) struct WebState {
    pub(crate) reconciler: Arc<Reconciler>,
    /// Host plugin configuration whose credential line the setup rewrites.
    pub(crate) plugin_config: Option<PathBuf>,
}

pub(crate) fn router(state: WebState) -> Router {
    Router::new()
        .route("/store_color", get(store_color).post(store_color))
        .route("/store_state_trigger", get(store_state_trigger).post(store_state_trigger))
        .route("/store_alarm_trigger", get(store_alarm_trigger).post(store_alarm_trigger))
        .route("/store_add_svg", get(store_add_svg).post(store_add_svg))
        .route("/store_credentials", get(store_credentials).post(store_credentials))
        .route("/get_proto", get(get_proto).post(get_proto))
        .route("/clear_proto", get(clear_proto).post(clear_proto))
        .route("/set_location", get(set_location).post(set_location))
        .with_state(state)
}

pub(crate) async fn serve(listen: SocketAddr, state: WebState) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Bind(e, listen))?;
    tracing::info!(%listen, "admin web surface listening");
    axum::serve(listener, router(state))
        .await
        .map_err(Error::Serve)
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ColorForm {
    #[serde(rename = "newColor")]
    new_color: String,
}

async fn store_color(State(web): State<WebState>, Form(form): Form<ColorForm>) -> StatusCode {
    let hex = form.new_color.trim_start_matches('#');
    web.reconciler
        .items()
        .set("visu.mower_colour", format!("mower_colour:\"{hex}\""))
        .await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct StateTriggerForm {
    #[serde(rename = "Trigger_State_Item")]
    item: String,
    #[serde(rename = "newState", default)]
    state: String,
}

async fn store_state_trigger(
    State(web): State<WebState>,
    Form(form): Form<StateTriggerForm>,
) -> StatusCode {
    store_pattern(&web, &format!("trigger.{}.state", form.item), form.state).await
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct AlarmTriggerForm {
    #[serde(rename = "Trigger_Alarm_Item")]
    item: String,
    #[serde(rename = "newAlarm", default)]
    alarm: String,
}

async fn store_alarm_trigger(
    State(web): State<WebState>,
    Form(form): Form<AlarmTriggerForm>,
) -> StatusCode {
    store_pattern(&web, &format!("trigger.{}.alarm", form.item), form.alarm).await
}

async fn store_pattern(web: &WebState, name: &str, pattern: String) -> StatusCode {
    if web.reconciler.items().set_known(name, pattern).await {
        StatusCode::NO_CONTENT
    } else {
        tracing::warn!(item = name, "no such trigger");
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct SvgForm {
    #[serde(default)]
    add_svg_str: String,
}

async fn store_add_svg(State(web): State<WebState>, Form(form): Form<SvgForm>) -> StatusCode {
    web.reconciler
        .items()
        .set("visu.add_svg_images", form.add_svg_str)
        .await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, Default, serde::Deserialize)]
pub(crate) struct CredentialsForm {
    #[serde(default)]
    user: String,
    #[serde(default)]
    pwd: String,
    #[serde(default)]
    store_2_config: Option<String>,
}

/// Replace the value of every `indego_credentials:` line, leaving all other
/// bytes of `config` as they are.
fn rewrite_credentials(config: &str, encoded: &str) -> String {
    config
        .split_inclusive('\n')
        .map(|line| {
            let body = line.trim_end_matches(['\r', '\n']);
            let Some((key, _)) = body.split_once(':') else {
                return line.to_string();
            };
            if key.trim() != CREDENTIALS_KEY {
                return line.to_string();
            }
            let indent = &key[..key.len() - key.trim_start().len()];
            let ending = &line[body.len()..];
            format!("{indent}{CREDENTIALS_KEY}: {encoded}{ending}")
        })
        .collect()
}

async fn store_credentials(
    State(web): State<WebState>,
    Form(form): Form<CredentialsForm>,
) -> Json<serde_json::Value> {
    let credentials = Credentials {
        user: form.user,
        password: form.pwd,
    };
    let encoded = credentials.encode();
    let mut proto = vec![format!("encoded:{encoded}"), "Encoding done".to_string()];
    let mut params = serde_json::Map::new();
    if form.store_2_config.as_deref() == Some("true") {
        if let Some(path) = &web.plugin_config {
            match tokio::fs::read_to_string(path).await {
                Ok(config) => {
                    proto.push("replaced credentials in temporary file".to_string());
                    let config = rewrite_credentials(&config, &encoded);
                    match tokio::fs::write(path, config).await {
                        Ok(()) => proto.push("stored new config to filesystem".to_string()),
                        Err(e) => {
                            tracing::warn!(
                                error = &e as &dyn std::error::Error,
                                path = %path.display(),
                                "could not write the plugin configuration"
                            );
                            proto.push("could not store the new config".to_string());
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "could not read the plugin configuration"
                    );
                    proto.push("could not read the config".to_string());
                }
            }
        }
        let reconciler = &web.reconciler;
        reconciler.set_credentials(credentials).await;
        match reconciler.relogin().await {
            Ok(()) => proto.push("logged in succesfully".to_string()),
            Err(e) => {
                tracing::warn!(error = &e as &dyn std::error::Error, "login with new credentials failed");
                proto.push("login failed".to_string());
            }
        }
        let session = reconciler.api().identity().session().await;
        let when = |t: Option<jiff::Timestamp>| {
            t.map(|t| t.strftime(TIME_FORMAT).to_string())
                .unwrap_or_default()
        };
        params.insert("logged_in".into(), session.logged_in().into());
        params.insert(
            "timeStamp".into(),
            format!("{} / {}", when(session.last_login), when(session.expiry)).into(),
        );
        params.insert("SessionID".into(), session.serial.into());
        reconciler.items().set("visu.refresh", true).await;
        proto.push("refresh of Items initiated".to_string());
    }
    params.insert("encoded".into(), encoded.into());
    Json(json!({"Proto": proto, "Params": params}))
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ProtoForm {
    #[serde(rename = "proto_Name")]
    name: String,
}

enum Proto {
    Communication,
    State,
}

impl Proto {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "Com_log_file" | "webif.communication_protocoll" => Some(Self::Communication),
            "state_log_file" | "webif.state_protocoll" => Some(Self::State),
            _ => None,
        }
    }

    fn item(&self) -> &'static str {
        match self {
            Self::Communication => "webif.communication_protocoll",
            Self::State => "webif.state_protocoll",
        }
    }

    async fn with_log<T>(&self, reconciler: &Reconciler, f: impl FnOnce(&mut RingLog) -> T) -> T {
        match self {
            Self::Communication => f(&mut *reconciler.comm_log().lock().await),
            Self::State => f(&mut *reconciler.state_log().lock().await),
        }
    }
}

async fn get_proto(State(web): State<WebState>, Form(form): Form<ProtoForm>) -> Response {
    let Some(proto) = Proto::from_name(&form.name) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let lines = proto.with_log(&web.reconciler, |log| log.lines()).await;
    Json(lines).into_response()
}

async fn clear_proto(State(web): State<WebState>, Form(form): Form<ProtoForm>) -> StatusCode {
    let Some(proto) = Proto::from_name(&form.name) else {
        return StatusCode::NOT_FOUND;
    };
    proto.with_log(&web.reconciler, RingLog::clear).await;
    web.reconciler
        .items()
        .set(proto.item(), serde_json::Value::Array(Vec::new()))
        .await;
    StatusCode::NO_CONTENT
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct LocationForm {
    longitude: f64,
    latitude: f64,
}

async fn set_location(State(web): State<WebState>, Form(form): Form<LocationForm>) -> String {
    let items = web.reconciler.items();
    items.set("webif.location_longitude", form.longitude).await;
    items.set("webif.location_latitude", form.latitude).await;
    let location = Location {
        latitude: Some(form.latitude.to_string().into()),
        longitude: Some(form.longitude.to_string().into()),
        timezone: Some(LOCATION_TIMEZONE.to_string()),
    };
    match web.reconciler.api().put_location(&location).await {
        Ok(()) => "Stored location successfully".to_string(),
        Err(e) => {
            tracing::warn!(error = &e as &dyn std::error::Error, "could not store the location");
            "could not store location".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tests::SERIAL;
    use crate::reconciler::tests::reconciler;
    use mockito::{Matcher, Server};

    async fn web(server: &mockito::ServerGuard, plugin_config: Option<PathBuf>) -> WebState {
        WebState {
            reconciler: Arc::new(reconciler(server).await),
            plugin_config,
        }
    }

    #[test]
    fn only_the_credential_line_changes() {
        let config = "indego:\r\n    plugin_name: indego4shng\r\n    indego_credentials: b2xk\r\n    cycle: 30\n";
        assert_eq!(
            rewrite_credentials(config, "bmV3"),
            "indego:\r\n    plugin_name: indego4shng\r\n    indego_credentials: bmV3\r\n    cycle: 30\n"
        );
        assert_eq!(rewrite_credentials("no newline", "x"), "no newline");
    }

    #[tokio::test]
    async fn colour_and_triggers() {
        let server = Server::new_async().await;
        let web = web(&server, None).await;
        let status = store_color(
            State(web.clone()),
            Form(ColorForm {
                new_color: "#ff0000".into(),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let items = web.reconciler.items();
        assert_eq!(items.string("visu.mower_colour").await, "mower_colour:\"ff0000\"");
        store_state_trigger(
            State(web.clone()),
            Form(StateTriggerForm {
                item: "state_trigger_3".into(),
                state: "00518-Mähe".into(),
            }),
        )
        .await;
        assert_eq!(items.string("trigger.state_trigger_3.state").await, "00518-Mähe");
        let missing = store_alarm_trigger(
            State(web.clone()),
            Form(AlarmTriggerForm {
                item: "alarm_trigger_9".into(),
                alarm: "blade".into(),
            }),
        )
        .await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn protocols_can_be_read_and_cleared() {
        let server = Server::new_async().await;
        let web = web(&server, None).await;
        web.reconciler
            .state_log()
            .lock()
            .await
            .push("2024-06-03 10:00:00  State : 258".into());
        let form = || {
            Form(ProtoForm {
                name: "state_log_file".into(),
            })
        };
        let response = get_proto(State(web.clone()), form()).await;
        assert_eq!(response.status(), StatusCode::OK);
        clear_proto(State(web.clone()), form()).await;
        assert_eq!(web.reconciler.state_log().lock().await.len(), 0);
        assert_eq!(
            web.reconciler.items().get("webif.state_protocoll").await,
            json!([])
        );
    }

    #[tokio::test]
    async fn location_is_pushed() {
        let mut server = Server::new_async().await;
        let web = web(&server, None).await;
        let put = server
            .mock("PUT", format!("/api/v1/alms/{SERIAL}/predictive/location").as_str())
            .match_body(Matcher::Json(json!({
                "latitude": "48.1",
                "longitude": "11.5",
                "timezone": "Europe/Berlin",
            })))
            .with_status(200)
            .create_async()
            .await;
        let reply = set_location(
            State(web.clone()),
            Form(LocationForm {
                longitude: 11.5,
                latitude: 48.1,
            }),
        )
        .await;
        put.assert_async().await;
        assert_eq!(reply, "Stored location successfully");
        assert_eq!(
            web.reconciler.items().get("webif.location_latitude").await,
            json!(48.1)
        );
    }

    #[tokio::test]
    async fn credentials_are_encoded_and_stored() {
        let server = Server::new_async().await;
        let path = std::env::temp_dir().join(format!("indego2mqtt-plugin-{}.yaml", std::process::id()));
        std::fs::write(&path, "indego:\n    indego_credentials: old\n    cycle: 30\n").unwrap();
        let web = web(&server, Some(path.clone())).await;
        let Json(reply) = store_credentials(
            State(web.clone()),
            Form(CredentialsForm {
                user: "u@example.com".into(),
                pwd: "pw".into(),
                store_2_config: Some("true".into()),
            }),
        )
        .await;
        let encoded = "dUBleGFtcGxlLmNvbTpwdw==";
        assert_eq!(reply["Params"]["encoded"], encoded);
        // The mock identity provider serves nothing, so the login fails.
        assert_eq!(reply["Params"]["logged_in"], false);
        assert!(reply["Proto"]
            .as_array()
            .unwrap()
            .contains(&json!("stored new config to filesystem")));
        let written = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(
            written,
            format!("indego:\n    indego_credentials: {encoded}\n    cycle: 30\n")
        );
        assert_eq!(
            web.reconciler.credentials().await.map(|c| c.user),
            Some("u@example.com".to_string())
        );
        assert_eq!(web.reconciler.items().get("visu.refresh").await, json!(true));
    }

    #[tokio::test]
    async fn encoding_alone_touches_nothing() {
        let server = Server::new_async().await;
        let web = web(&server, None).await;
        let Json(reply) = store_credentials(
            State(web.clone()),
            Form(CredentialsForm {
                user: "u".into(),
                pwd: "p".into(),
                store_2_config: None,
            }),
        )
        .await;
        assert_eq!(reply["Params"]["encoded"], "dTpw");
        assert!(reply["Params"].get("logged_in").is_none());
        assert!(web.reconciler.credentials().await.is_none());
    }
}
