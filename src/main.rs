use clap::Parser as _;
use homie5::{Homie5DeviceProtocol, HomieID};
use reqwest::Url;
use rumqttc::v5::MqttOptions;
use rumqttc::v5::mqttbytes::v5::LastWill;
use std::error::Error as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

mod alerts;
mod api;
mod auth;
mod bridge;
mod calendar;
mod http;
mod items;
mod map;
mod mqtt;
mod reconciler;
mod ringlog;
mod schedule;
mod schemas;
mod states;
mod triggers;
mod webif;

/// Bridge a Bosch Indego mower in the vendor cloud to MQTT.
#[derive(clap::Parser)]
struct Args {
    /// How to connect to the MQTT broker.
    ///
    /// The value is expected to be provided as an URL, such as:
    /// `mqtt://location:1883?client_id=hostname` for plain text connection or
    /// `mqtts://location:1883?client_id=hostname` for TLS protected connection.
    #[clap(short = 'm', long)]
    mqtt_broker: String,

    /// To be provided together with `--mqtt-password` to use password based authentication
    /// with the broker.
    #[clap(short = 'u', long, requires = "mqtt_password")]
    mqtt_user: Option<String>,

    /// To be provided together with `--mqtt-user` to use password based authentication with
    /// the broker.
    #[clap(short = 'p', long, requires = "mqtt_user")]
    mqtt_password: Option<String>,

    #[clap(long, default_value = "indego2mqtt")]
    device_name: HomieID,

    #[clap(long, default_value = "info", env = "INDEGO2MQTT_LOG")]
    log_filter: tracing_subscriber::filter::targets::Targets,

    /// SingleKey ID login as base64 encoded `user:password`.
    ///
    /// Without it the bridge starts logged out until credentials are stored
    /// through the admin web surface.
    #[clap(short = 'c', long, env = "INDEGO_CREDENTIALS")]
    credentials: Option<String>,

    #[clap(long, default_value = "https://api.indego-cloud.iot.bosch-si.com/api/v1/")]
    indego_url: Url,

    /// Identity provider the SingleKey ID sign-in starts at.
    #[clap(long, default_value = "https://prodindego.b2clogin.com/")]
    identity_url: Url,

    /// Item the whole tree hangs off.
    #[clap(long, default_value = "indego")]
    parent_item: String,

    /// JSON file defining the items and their attributes.
    #[clap(short = 'i', long, default_value = "items.json")]
    items: PathBuf,

    /// State poll period in seconds while the mower is not out mowing.
    #[clap(long, default_value_t = 30)]
    cycle: u64,

    /// Where the composed garden map is written.
    #[clap(long)]
    img_path: Option<PathBuf>,

    /// Prefix prepended to weather picture file names.
    #[clap(long, default_value = "")]
    weather_pics_path: String,

    /// Host plugin configuration whose `indego_credentials` line the credential
    /// setup may rewrite.
    #[clap(long)]
    plugin_config: Option<PathBuf>,

    #[clap(long, default_value = "127.0.0.1:8383")]
    webif_listen: SocketAddr,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error("could not parse the `--mqtt-broker` argument")]
    ParseMqttBroker(#[source] rumqttc::v5::OptionError),
    #[error("could not start the async runtime")]
    Runtime(#[source] std::io::Error),
    #[error("could not load the item tree")]
    Items(#[from] items::Error),
    #[error("could not set up the cloud API transport")]
    Transport(#[source] http::Error),
    #[error("could not set up the identity client")]
    Identity(#[source] auth::Error),
    #[error("could not decode `--credentials`")]
    Credentials(#[source] auth::Error),
    #[error("mqtt bridge failed")]
    Mqtt(#[from] mqtt::Error),
    #[error("admin web surface failed")]
    Webif(#[from] webif::Error),
    #[error("could not listen for the interrupt signal")]
    Signal(#[source] std::io::Error),
}

fn main() {
    let args = Args::parse();
    std::process::exit(match setup_and_run(args) {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn setup_and_run(args: Args) -> Result<(), Error> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(args.log_filter.clone())
        .init();
    tracing::debug!(filter = ?args.log_filter, message = "logging initiated");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::Runtime)?;
    runtime.block_on(run(args))
}

async fn load_items(args: &Args) -> Result<items::Items, items::Error> {
    let raw = tokio::fs::read_to_string(&args.items)
        .await
        .map_err(|e| items::Error::Read(e, args.items.display().to_string()))?;
    let definitions: serde_json::Value = serde_json::from_str(&raw).map_err(items::Error::Json)?;
    let tree = items::ItemTree::from_definitions(&args.parent_item, &definitions)?;
    Ok(items::Items::new(tree))
}

async fn run(args: Args) -> Result<(), Error> {
    let items = load_items(&args).await?;
    let credentials = args
        .credentials
        .as_deref()
        .filter(|c| !c.trim().is_empty())
        .map(auth::Credentials::decode)
        .transpose()
        .map_err(Error::Credentials)?;
    if credentials.is_none() {
        tracing::warn!("no credentials configured, waiting for the admin web surface");
    }

    let comm_log = Arc::new(Mutex::new(ringlog::RingLog::default()));
    let transport = http::Transport::new(comm_log).map_err(Error::Transport)?;
    let identity = auth::Identity::new(args.identity_url.clone(), args.indego_url.clone(), transport.clone())
        .map_err(Error::Identity)?;
    let api = api::DeviceApi::new(transport, Arc::new(identity), args.indego_url.clone());
    let settings = reconciler::Settings {
        cycle: Duration::from_secs(args.cycle.max(1)),
        img_path: args.img_path.clone(),
        weather_pics_path: args.weather_pics_path.clone(),
    };
    let reconciler = Arc::new(
        reconciler::Reconciler::new(api, items.clone(), settings, credentials).await,
    );
    let bridge = bridge::Bridge::new(Arc::clone(&reconciler));
    let bridge_changes = items.subscribe().await;
    let mqtt_changes = items.subscribe().await;

    let (protocol, lw) =
        Homie5DeviceProtocol::new(args.device_name.clone(), homie5::HomieDomain::Default);
    let mut mqtt_options =
        MqttOptions::parse_url(&args.mqtt_broker).map_err(Error::ParseMqttBroker)?;
    if let (Some(u), Some(p)) = (args.mqtt_user.as_ref(), args.mqtt_password.as_ref()) {
        mqtt_options.set_credentials(u, p);
    }
    let lw = LastWill::new(lw.topic, lw.message, mqtt::convert_qos(lw.qos), lw.retain, None);
    mqtt_options.set_last_will(lw);
    let (mqtt, mqtt_loop) = rumqttc::v5::AsyncClient::new(mqtt_options, 100);
    let homie = Arc::new(mqtt::Homie::new(args.device_name, protocol, mqtt, items).await);

    let web = webif::WebState {
        reconciler: Arc::clone(&reconciler),
        plugin_config: args.plugin_config,
    };

    reconciler.start().await;
    let result = tokio::select! {
        r = Arc::clone(&homie).run(mqtt_loop, mqtt_changes) => r.map_err(Error::from),
        r = webif::serve(args.webif_listen, web) => r.map_err(Error::from),
        () = reconciler.run() => Ok(()),
        () = bridge.run(bridge_changes) => Ok(()),
        r = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
            r.map_err(Error::Signal)
        }
    };
    reconciler.stop().await;
    result
}
