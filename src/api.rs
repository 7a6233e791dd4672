//! Typed adapters over the vendor REST endpoints.

use crate::auth::Identity;
use crate::http::{self, Body, DEFAULT_TIMEOUT, Transport, endpoint};
use crate::schemas::indego;
use reqwest::Url;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;

const SHORT_TIMEOUT: Duration = Duration::new(10, 0);
const MAP_TIMEOUT: Duration = Duration::new(120, 0);
/// Samples and sample interval (seconds) requested while the mower is out.
pub(crate) const POSITION_SAMPLES: u32 = 100;
pub(crate) const POSITION_INTERVAL: u32 = 7;

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("not logged in to the vendor cloud")]
    NotLoggedIn,
    #[error("could not {1}")]
    Http(#[source] http::Error, &'static str),
    #[error("unexpected response shape from {1}")]
    Schema(#[source] serde_json::Error, &'static str),
    #[error("{0} returned no data")]
    Empty(&'static str),
}

impl Error {
    pub(crate) fn is_broken_pipe(&self) -> bool {
        matches!(self, Error::Http(e, _) if e.is_broken_pipe())
    }
}

pub(crate) struct DeviceApi {
    transport: Transport,
    identity: Arc<Identity>,
    base: Url,
}

impl DeviceApi {
    pub(crate) fn new(transport: Transport, identity: Arc<Identity>, base: Url) -> Self {
        Self {
            transport,
            identity,
            base,
        }
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    pub(crate) fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Bearer and serial of a usable session.
    async fn credentials(&self) -> Result<(String, String), Error> {
        let session = self.identity.ready_session().await;
        if !session.logged_in() {
            return Err(Error::NotLoggedIn);
        }
        Ok((session.bearer, session.serial))
    }

    fn device_url(&self, serial: &str, path: &str, what: &'static str) -> Result<Url, Error> {
        let path = if path.is_empty() {
            format!("alms/{serial}")
        } else {
            format!("alms/{serial}/{path}")
        };
        endpoint(&self.base, &path).map_err(|e| Error::Http(e, what))
    }

    async fn checked(&self, result: Result<Body, http::Error>, what: &'static str) -> Result<Body, Error> {
        match result {
            Ok(body) => Ok(body),
            Err(e) => {
                if e.is_auth_expired() {
                    self.identity.invalidate().await;
                }
                Err(Error::Http(e, what))
            }
        }
    }

    async fn get_url(&self, url: Url, bearer: &str, timeout: Duration, what: &'static str) -> Result<Body, Error> {
        let result = self.transport.get(&url, bearer, timeout).await;
        self.checked(result, what).await
    }

    async fn get_device(&self, path: &str, timeout: Duration, what: &'static str) -> Result<Body, Error> {
        let (bearer, serial) = self.credentials().await?;
        let url = self.device_url(&serial, path, what)?;
        self.get_url(url, &bearer, timeout, what).await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
        what: &'static str,
    ) -> Result<T, Error> {
        let value = self
            .get_device(path, timeout, what)
            .await?
            .into_json()
            .ok_or(Error::Empty(what))?;
        serde_json::from_value(value).map_err(|e| Error::Schema(e, what))
    }

    async fn put_device(
        &self,
        path: &str,
        body: Option<&Value>,
        timeout: Duration,
        what: &'static str,
    ) -> Result<Body, Error> {
        let (bearer, serial) = self.credentials().await?;
        let url = self.device_url(&serial, path, what)?;
        let result = self.transport.put(&url, &bearer, body, timeout).await;
        self.checked(result, what).await
    }

    async fn put_serialized<T: serde::Serialize>(
        &self,
        path: &str,
        body: &T,
        what: &'static str,
    ) -> Result<(), Error> {
        let body = serde_json::to_value(body).map_err(|e| Error::Schema(e, what))?;
        self.put_device(path, Some(&body), SHORT_TIMEOUT, what).await?;
        Ok(())
    }

    pub(crate) async fn state(&self) -> Result<indego::State, Error> {
        self.get_json("state", SHORT_TIMEOUT, "get the state").await
    }

    pub(crate) async fn operating_data(&self) -> Result<Value, Error> {
        self.get_json("operatingData", SHORT_TIMEOUT, "get the operating data").await
    }

    pub(crate) async fn network(&self) -> Result<Value, Error> {
        self.get_json("network", SHORT_TIMEOUT, "get the network data").await
    }

    pub(crate) async fn config(&self) -> Result<Value, Error> {
        self.get_json("config", SHORT_TIMEOUT, "get the device config").await
    }

    /// The root `alms/<serial>` resource.
    pub(crate) async fn device_data(&self) -> Result<indego::DeviceData, Error> {
        self.get_json("", SHORT_TIMEOUT, "get the device data").await
    }

    pub(crate) async fn calendar(&self) -> Result<indego::DeviceCalendar, Error> {
        self.get_json("calendar", SHORT_TIMEOUT, "get the mowing calendar").await
    }

    pub(crate) async fn put_calendar(&self, calendar: &indego::DeviceCalendar) -> Result<(), Error> {
        self.put_serialized("calendar", calendar, "store the mowing calendar").await
    }

    pub(crate) async fn predictive_calendar(&self) -> Result<indego::DeviceCalendar, Error> {
        self.get_json("predictive/calendar", SHORT_TIMEOUT, "get the exclusion calendar")
            .await
    }

    pub(crate) async fn put_predictive_calendar(
        &self,
        calendar: &indego::DeviceCalendar,
    ) -> Result<(), Error> {
        self.put_serialized("predictive/calendar", calendar, "store the exclusion calendar")
            .await
    }

    pub(crate) async fn predictive_setup(&self) -> Result<indego::PredictiveSetup, Error> {
        self.get_json("predictive/setup", SHORT_TIMEOUT, "get the SmartMow setup")
            .await
    }

    pub(crate) async fn put_predictive_setup(&self, setup: &indego::PredictiveSetup) -> Result<(), Error> {
        self.put_serialized("predictive/setup", setup, "store the SmartMow setup")
            .await
    }

    pub(crate) async fn predictive_schedule(&self) -> Result<indego::PredictiveSchedule, Error> {
        self.get_json("predictive/schedule", SHORT_TIMEOUT, "get the SmartMow schedule")
            .await
    }

    pub(crate) async fn location(&self) -> Result<indego::Location, Error> {
        self.get_json("predictive/location", SHORT_TIMEOUT, "get the location")
            .await
    }

    pub(crate) async fn put_location(&self, location: &indego::Location) -> Result<(), Error> {
        self.put_serialized("predictive/location", location, "store the location")
            .await
    }

    pub(crate) async fn next_cutting(&self) -> Result<Option<indego::NextCutting>, Error> {
        match self
            .get_device("predictive/nextcutting", SHORT_TIMEOUT, "get the next cutting")
            .await?
        {
            Body::Json(v) => serde_json::from_value(v)
                .map(Some)
                .map_err(|e| Error::Schema(e, "the next cutting")),
            // Nothing scheduled.
            _ => Ok(None),
        }
    }

    pub(crate) async fn last_cutting(&self) -> Result<indego::LastCutting, Error> {
        self.get_json("predictive/lastcutting", SHORT_TIMEOUT, "get the last cutting")
            .await
    }

    pub(crate) async fn weather(&self) -> Result<indego::Weather, Error> {
        self.get_json("predictive/weather", SHORT_TIMEOUT, "get the weather forecast")
            .await
    }

    /// Raw garden map SVG.
    pub(crate) async fn map(&self) -> Result<Vec<u8>, Error> {
        const WHAT: &str = "get the garden map";
        match self
            .get_device("map?cached=0&showMower=1", MAP_TIMEOUT, WHAT)
            .await?
        {
            Body::Svg(bytes) => Ok(bytes),
            Body::Text(text) => Ok(text.into_bytes()),
            _ => Err(Error::Empty(WHAT)),
        }
    }

    pub(crate) async fn alerts(&self) -> Result<Vec<indego::Alert>, Error> {
        const WHAT: &str = "get the alerts";
        let (bearer, _) = self.credentials().await?;
        let url = endpoint(&self.base, "alerts").map_err(|e| Error::Http(e, WHAT))?;
        match self.get_url(url, &bearer, SHORT_TIMEOUT, WHAT).await? {
            Body::Json(v) => serde_json::from_value(v).map_err(|e| Error::Schema(e, WHAT)),
            _ => Ok(Vec::new()),
        }
    }

    pub(crate) async fn mark_alert_read(&self, id: &str) -> Result<(), Error> {
        const WHAT: &str = "mark an alert read";
        let (bearer, _) = self.credentials().await?;
        let url = endpoint(&self.base, &format!("alerts/{id}")).map_err(|e| Error::Http(e, WHAT))?;
        let body = json!({ "read_status": "read" });
        let result = self.transport.put(&url, &bearer, Some(&body), SHORT_TIMEOUT).await;
        self.checked(result, WHAT).await?;
        Ok(())
    }

    pub(crate) async fn delete_alert(&self, id: &str) -> Result<(), Error> {
        const WHAT: &str = "delete an alert";
        let (bearer, _) = self.credentials().await?;
        let url = endpoint(&self.base, &format!("alerts/{id}")).map_err(|e| Error::Http(e, WHAT))?;
        let result = self.transport.delete(&url, &bearer, SHORT_TIMEOUT).await;
        self.checked(result, WHAT).await?;
        Ok(())
    }

    pub(crate) async fn automatic_update(&self) -> Result<bool, Error> {
        let v: indego::AutomaticUpdate = self
            .get_json("automaticUpdate", SHORT_TIMEOUT, "get the automatic update flag")
            .await?;
        Ok(v.allow_automatic_update)
    }

    pub(crate) async fn put_automatic_update(&self, allow: bool) -> Result<(), Error> {
        let body = indego::AutomaticUpdate {
            allow_automatic_update: allow,
        };
        self.put_serialized("automaticUpdate", &body, "store the automatic update flag")
            .await
    }

    pub(crate) async fn updates_available(&self) -> Result<bool, Error> {
        let v: indego::Updates = self
            .get_json("updates", SHORT_TIMEOUT, "check for firmware updates")
            .await?;
        Ok(v.available)
    }

    pub(crate) async fn start_update(&self) -> Result<(), Error> {
        self.put_device("updates", None, DEFAULT_TIMEOUT, "start the firmware update")
            .await?;
        Ok(())
    }

    /// PUT a single-key command such as `{"state":"mow"}`.
    pub(crate) async fn command(&self, command: &Value) -> Result<(), Error> {
        tracing::info!(%command, "sending command");
        self.put_device("state", Some(command), SHORT_TIMEOUT, "send a command")
            .await?;
        Ok(())
    }

    pub(crate) async fn set_predictive(&self, enabled: bool) -> Result<(), Error> {
        let body = json!({ "enabled": enabled });
        self.put_device("predictive", Some(&body), SHORT_TIMEOUT, "switch SmartMow")
            .await?;
        Ok(())
    }

    pub(crate) async fn reset_blade_counter(&self) -> Result<(), Error> {
        let body = json!({ "needs_service": false });
        self.put_device("", Some(&body), SHORT_TIMEOUT, "reset the blade counter")
            .await?;
        Ok(())
    }

    /// Ask the mower to report its position `POSITION_SAMPLES` times.
    pub(crate) async fn request_position(&self) -> Result<(), Error> {
        const WHAT: &str = "request position updates";
        let (bearer, serial) = self.credentials().await?;
        let mut url = self.device_url(&serial, "requestPosition", WHAT)?;
        url.query_pairs_mut()
            .append_pair("count", &POSITION_SAMPLES.to_string())
            .append_pair("interval", &POSITION_INTERVAL.to_string());
        let result = self
            .transport
            .post(&url, &bearer, None, None, SHORT_TIMEOUT)
            .await;
        self.checked(result, WHAT).await?;
        Ok(())
    }

    /// PUT to a templated config URL such as `alms/{}/config`.
    pub(crate) async fn put_config(&self, url_template: &str, body: &Value) -> Result<(), Error> {
        const WHAT: &str = "store a config value";
        let (bearer, serial) = self.credentials().await?;
        let path = url_template.replace("{}", &serial);
        let url = endpoint(&self.base, &path).map_err(|e| Error::Http(e, WHAT))?;
        let result = self.transport.put(&url, &bearer, Some(body), SHORT_TIMEOUT).await;
        self.checked(result, WHAT).await?;
        Ok(())
    }
}
