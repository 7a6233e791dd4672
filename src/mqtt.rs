//! Homie 5 view of the item tree.
//!
//! Every item below the parent becomes a property. The first path segment picks
//! the node; items directly below the parent live on the `mower` node.

use crate::items::{ItemChange, ItemTree, Items, Kind, Origin};
use homie5::client::Publish as HomiePublish;
use homie5::client::Subscription;
use homie5::device_description::DeviceDescriptionBuilder;
use homie5::device_description::HomieDeviceDescription;
use homie5::device_description::HomiePropertyDescription;
use homie5::device_description::NodeDescriptionBuilder;
use homie5::device_description::PropertyDescriptionBuilder;
use homie5::{Homie5DeviceProtocol, HomieDataType, HomieDeviceStatus, HomieID};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

static ROOT_NODE_ID: HomieID = HomieID::new_const("mower");
const MQTT_ORIGIN: &str = "mqtt";

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("mqtt connection error")]
    MqttConnection(#[source] rumqttc::v5::ConnectionError),
    #[error("could not publish init value to the state topic")]
    PublishInitState(#[source] rumqttc::v5::ClientError),
    #[error("could not construct device description message")]
    GenerateDescription(#[source] homie5::Homie5ProtocolError),
    #[error("could not publish the device description")]
    PublishDescription(#[source] rumqttc::v5::ClientError),
    #[error("could not publish ready value to the state topic")]
    PublishReadyState(#[source] rumqttc::v5::ClientError),
    #[error("could not construct the mqtt subscribtion message")]
    GenerateSubscribtions(#[source] homie5::Homie5ProtocolError),
    #[error("could not subscribe to the homie properties")]
    Subscribe(#[source] rumqttc::v5::ClientError),
    #[error("could not publish value to `{1}`")]
    PublishValue(#[source] rumqttc::v5::ClientError, String),
    #[error("could not join a publisher task")]
    PublisherJoin(#[source] tokio::task::JoinError),
    #[error("disconnected from the MQTT server")]
    MqttDisconnect,
}

/// `stateCode` → `state-code`, `svg_xPos` → `svg-x-pos`, `MOW` → `mow`.
fn homie_id(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    let mut previous_lower = false;
    for c in segment.chars() {
        if c.is_ascii_uppercase() {
            if previous_lower {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
            previous_lower = false;
        } else if c.is_ascii_alphanumeric() {
            out.push(c);
            previous_lower = true;
        } else {
            if !out.ends_with('-') && !out.is_empty() {
                out.push('-');
            }
            previous_lower = false;
        }
    }
    out.trim_end_matches('-').to_string()
}

/// Node and property id for an item name relative to the parent.
fn address(name: &str) -> Option<(HomieID, HomieID)> {
    let (node, property) = match name.split_once('.') {
        Some((node, rest)) => (HomieID::try_from(homie_id(node)).ok()?, homie_id(rest)),
        None => (ROOT_NODE_ID.clone(), homie_id(name)),
    };
    Some((node, HomieID::try_from(property).ok()?))
}

fn data_type(kind: Kind) -> HomieDataType {
    match kind {
        Kind::Bool => HomieDataType::Boolean,
        Kind::Num => HomieDataType::Float,
        Kind::Str | Kind::List | Kind::Dict | Kind::Foo => HomieDataType::String,
    }
}

/// Payload published for an item value.
fn payload(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Item value for a `/set` payload; the tree coerces it further by kind.
fn parse_set(kind: Kind, raw: &str) -> Value {
    match kind {
        Kind::Foo => serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.into())),
        _ => Value::String(raw.into()),
    }
}

/// Where each item is published and which item each property writes.
#[derive(Debug, Default)]
struct Addresses {
    by_item: BTreeMap<String, (HomieID, HomieID)>,
    by_property: BTreeMap<String, (String, Kind)>,
}

fn describe(tree: &ItemTree) -> (HomieDeviceDescription, Addresses) {
    let mut addresses = Addresses::default();
    let mut nodes: BTreeMap<String, (HomieID, Vec<(HomieID, HomiePropertyDescription)>)> =
        BTreeMap::new();
    for (path, item) in tree.iter() {
        let Some(name) = tree.relative(path) else {
            continue;
        };
        let Some((node, property)) = address(name) else {
            tracing::debug!(item = path, "item has no valid homie address, not published");
            continue;
        };
        let key = format!("{node}/{property}");
        if addresses.by_property.contains_key(&key) {
            tracing::warn!(item = path, property = key, "homie property already taken, not published");
            continue;
        }
        let attributes = &item.attributes;
        let description = PropertyDescriptionBuilder::new(data_type(attributes.kind))
            .settable(true)
            .retained(!attributes.enforce_updates)
            .build();
        nodes
            .entry(node.to_string())
            .or_insert_with(|| (node.clone(), Vec::new()))
            .1
            .push((property.clone(), description));
        addresses
            .by_property
            .insert(key, (path.clone(), attributes.kind));
        addresses.by_item.insert(path.clone(), (node, property));
    }
    let mut description = DeviceDescriptionBuilder::new().name("Bosch Indego");
    for (_, (id, properties)) in nodes {
        let node = properties
            .into_iter()
            .fold(NodeDescriptionBuilder::new(), |node, (id, property)| {
                node.add_property(id, property)
            })
            .build();
        description = description.add_node(id, node);
    }
    (description.build(), addresses)
}

/// `(node, property)` of a `…/<device>/<node>/<property>/set` topic.
fn set_target<'a>(topic: &'a str, device: &str) -> Option<(&'a str, &'a str)> {
    let rest = topic.split_once(&format!("/{device}/"))?.1;
    let rest = rest.strip_suffix("/set")?;
    let (node, property) = rest.split_once('/')?;
    (!property.contains('/')).then_some((node, property))
}

pub(crate) struct Homie {
    device_id: HomieID,
    mqtt: rumqttc::v5::AsyncClient,
    protocol: Homie5DeviceProtocol,
    description: HomieDeviceDescription,
    addresses: Addresses,
    items: Items,
}

impl Homie {
    pub(crate) async fn new(
        device_id: HomieID,
        protocol: Homie5DeviceProtocol,
        mqtt: rumqttc::v5::AsyncClient,
        items: Items,
    ) -> Self {
        let (description, addresses) = describe(&*items.lock().await);
        Self {
            device_id,
            mqtt,
            protocol,
            description,
            addresses,
            items,
        }
    }

    async fn publish_value(&self, path: &str, value: &Value) -> Result<(), Error> {
        let Some((node, property)) = self.addresses.by_item.get(path) else {
            return Ok(());
        };
        let retained = self
            .description
            .nodes
            .get(node)
            .and_then(|n| n.properties.get(property))
            .is_none_or(|p| p.retained);
        let p = self
            .protocol
            .publish_value(node, property, payload(value), retained);
        self.mqtt
            .homie_publish(p)
            .await
            .map_err(|e| Error::PublishValue(e, format!("{node}/{property}")))
    }

    async fn publish_device(&self) -> Result<(), Error> {
        for step in homie5::homie_device_publish_steps() {
            match step {
                homie5::DevicePublishStep::DeviceStateInit => {
                    let p = self.protocol.publish_state(HomieDeviceStatus::Init);
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishInitState)?;
                }
                homie5::DevicePublishStep::DeviceDescription => {
                    let p = self
                        .protocol
                        .publish_description(&self.description)
                        .map_err(Error::GenerateDescription)?;
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishDescription)?;
                }
                homie5::DevicePublishStep::PropertyValues => {
                    let values: Vec<(String, Value)> = {
                        let tree = self.items.lock().await;
                        tree.iter()
                            .map(|(path, item)| (path.clone(), item.value.clone()))
                            .collect()
                    };
                    for (path, value) in values {
                        self.publish_value(&path, &value).await?;
                    }
                }
                homie5::DevicePublishStep::SubscribeProperties => {
                    let p = self
                        .protocol
                        .subscribe_props(&self.description)
                        .map_err(Error::GenerateSubscribtions)?;
                    self.mqtt
                        .homie_subscribe(p)
                        .await
                        .map_err(Error::Subscribe)?;
                }
                homie5::DevicePublishStep::DeviceStateReady => {
                    let p = self.protocol.publish_state(HomieDeviceStatus::Ready);
                    self.mqtt
                        .homie_publish(p)
                        .await
                        .map_err(Error::PublishReadyState)?;
                }
            }
        }
        Ok(())
    }

    /// Publish item changes as they happen. Only returns on failure.
    async fn forward(self: Arc<Self>, mut changes: mpsc::UnboundedReceiver<ItemChange>) -> Error {
        while let Some(change) = changes.recv().await {
            if let Err(e) = self.publish_value(&change.path, &change.value).await {
                return e;
            }
        }
        Error::MqttDisconnect
    }

    async fn handle_set(&self, topic: &str, payload: &[u8]) {
        let Some((node, property)) = set_target(topic, &self.device_id.to_string()) else {
            tracing::trace!(topic, "not a property set message");
            return;
        };
        let Some((path, kind)) = self.addresses.by_property.get(&format!("{node}/{property}")) else {
            tracing::warn!(topic, "set for an unknown property");
            return;
        };
        let raw = String::from_utf8_lossy(payload);
        tracing::debug!(item = path, value = %raw, "property set over mqtt");
        self.items
            .write(path, parse_set(*kind, &raw), Origin::External(MQTT_ORIGIN.into()))
            .await;
    }

    pub(crate) async fn run(
        self: Arc<Self>,
        mut mqtt_loop: rumqttc::v5::EventLoop,
        changes: mpsc::UnboundedReceiver<ItemChange>,
    ) -> Result<(), Error> {
        let mut forwarder = tokio::spawn(Arc::clone(&self).forward(changes));
        let mut publisher: Option<tokio::task::JoinHandle<Result<(), Error>>> = None;
        loop {
            use rumqttc::Outgoing;
            use rumqttc::v5::Event;
            use rumqttc::v5::mqttbytes::v5::Packet;

            let polled = tokio::select! {
                r = mqtt_loop.poll() => Some(r),
                joined = &mut forwarder => {
                    return Err(joined.unwrap_or_else(Error::PublisherJoin));
                }
                joined = async {
                    match publisher.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                }, if publisher.is_some() => {
                    match joined {
                        Ok(Ok(())) => None,
                        Ok(Err(e)) => return Err(e),
                        Err(join_error) => return Err(Error::PublisherJoin(join_error)),
                    }
                }
            };
            let Some(result) = polled else {
                tracing::debug!("device published");
                publisher = None;
                continue;
            };
            match result.map_err(Error::MqttConnection)? {
                Event::Incoming(Packet::ConnAck(_)) => {
                    tracing::debug!("connected to mqtt");
                    let this = Arc::clone(&self);
                    let joiner = tokio::spawn(async move { this.publish_device().await });
                    if let Some(previous) = publisher.replace(joiner) {
                        previous.abort();
                    }
                }
                Event::Incoming(Packet::Publish(publish)) => {
                    let topic = String::from_utf8_lossy(&publish.topic);
                    self.handle_set(&topic, &publish.payload).await;
                }
                Event::Outgoing(Outgoing::Disconnect) => {
                    return Err(Error::MqttDisconnect);
                }
                event @ Event::Incoming(_) | event @ Event::Outgoing(_) => {
                    tracing::trace!(?event, "not handled in any way");
                }
            }
        }
    }
}

pub(crate) trait MqttClientExt {
    type PublishError;
    type SubscribeError;
    async fn homie_publish(&self, p: HomiePublish) -> Result<(), Self::PublishError>;
    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError>;
}

impl MqttClientExt for rumqttc::v5::AsyncClient {
    type PublishError = rumqttc::v5::ClientError;
    type SubscribeError = rumqttc::v5::ClientError;
    async fn homie_publish(&self, p: HomiePublish) -> Result<(), Self::PublishError> {
        self.publish(p.topic, convert_qos(p.qos), p.retain, p.payload)
            .await
    }

    async fn homie_subscribe(
        &self,
        subs: impl Iterator<Item = Subscription> + Send,
    ) -> Result<(), Self::SubscribeError> {
        let subs = subs
            .map(|sub| rumqttc::v5::mqttbytes::v5::Filter::new(sub.topic, convert_qos(sub.qos)))
            .collect::<Vec<_>>();
        if subs.is_empty() {
            return Ok(());
        }
        self.subscribe_many(subs).await
    }
}

pub(crate) fn convert_qos(homie: homie5::client::QoS) -> rumqttc::v5::mqttbytes::QoS {
    use homie5::client::QoS::*;
    match homie {
        AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}
