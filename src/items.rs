//! The item tree the plugin reads its configuration from and publishes into.
//!
//! Items are loaded from a nested JSON definition: every object key that is not
//! an attribute name is a child item. Each write carries an [`Origin`] and is
//! fanned out to all subscribers as an [`ItemChange`].

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

/// Origin label the plugin tags its own writes with.
pub(crate) const PLUGIN_LABEL: &str = "indego";

const ATTRIBUTE_KEYS: &[&str] = &[
    "type",
    "initial_value",
    "enforce_updates",
    "indego_command",
    "indego_config",
    "indego_config_url",
    "indego_plugin_handled",
    "indego_function_4_all",
    "indego_function_4_visu",
    "indego_parse_2_attr",
    "indego_attr_name",
    "indego_attr_type",
];

#[derive(thiserror::Error, Debug)]
pub(crate) enum Error {
    #[error("could not read the item definitions from `{1}`")]
    Read(#[source] std::io::Error, String),
    #[error("the item definitions are not valid JSON")]
    Json(#[source] serde_json::Error),
    #[error("invalid attributes on item `{0}`")]
    Attributes(String, #[source] serde_json::Error),
    #[error("the item definitions have no `{0}` root")]
    NoParent(String),
    #[error("item `{0}` does not hold a JSON object")]
    TableValue(String),
    #[error("key `{key}` of item `{path}` is not an integer")]
    TableKey { path: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    Plugin,
    External(String),
}

impl Origin {
    pub(crate) fn label(&self) -> &str {
        match self {
            Self::Plugin => PLUGIN_LABEL,
            Self::External(label) => label,
        }
    }

    /// Whether the write came from a person (visualisation, MQTT, admin page)
    /// rather than from the plugin or the host's own automation.
    pub(crate) fn is_user(&self) -> bool {
        match self {
            Self::Plugin => false,
            Self::External(label) => {
                label != PLUGIN_LABEL && label != "Autotimer" && label != "Logic"
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Kind {
    Bool,
    Num,
    Str,
    List,
    Dict,
    #[default]
    Foo,
}

impl Kind {
    fn default_value(self) -> Value {
        match self {
            Kind::Bool => Value::Bool(false),
            Kind::Num => Value::from(0),
            Kind::Str => Value::String(String::new()),
            Kind::List => Value::Array(Vec::new()),
            Kind::Dict => Value::Object(Map::new()),
            Kind::Foo => Value::Null,
        }
    }

    /// Bring `value` into the shape this kind stores.
    pub(crate) fn coerce(self, value: Value) -> Value {
        match (self, value) {
            (Kind::Bool, Value::String(s)) => match s.trim() {
                "true" | "True" | "1" | "on" => Value::Bool(true),
                _ => Value::Bool(false),
            },
            (Kind::Bool, Value::Number(n)) => Value::Bool(n.as_f64().is_some_and(|n| n != 0.0)),
            (Kind::Num, Value::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .map(Value::from)
                    .or_else(|_| s.parse::<f64>().map(Value::from))
                    .unwrap_or_else(|_| Value::from(0))
            }
            (Kind::Num, Value::Bool(b)) => Value::from(i64::from(b)),
            (Kind::Str, Value::Null) => Value::String(String::new()),
            (Kind::Str, v @ (Value::Array(_) | Value::Object(_))) => Value::String(v.to_string()),
            (Kind::Str, Value::Number(n)) => Value::String(n.to_string()),
            (Kind::Str, Value::Bool(b)) => Value::String(b.to_string()),
            (Kind::List | Kind::Dict, Value::String(s)) => {
                serde_json::from_str(&s).unwrap_or_else(|_| self.default_value())
            }
            (_, v) => v,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum KeyType {
    Int,
    Str,
}

/// Item attributes the plugin acts upon.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub(crate) struct Attributes {
    #[serde(rename = "type", default)]
    pub(crate) kind: Kind,
    #[serde(default)]
    pub(crate) initial_value: Option<Value>,
    #[serde(default)]
    pub(crate) enforce_updates: bool,
    #[serde(rename = "indego_command")]
    pub(crate) command: Option<String>,
    #[serde(rename = "indego_config")]
    pub(crate) config: Option<String>,
    #[serde(rename = "indego_config_url")]
    pub(crate) config_url: Option<String>,
    #[serde(rename = "indego_plugin_handled", default)]
    pub(crate) plugin_handled: bool,
    #[serde(rename = "indego_function_4_all")]
    pub(crate) function_4_all: Option<String>,
    #[serde(rename = "indego_function_4_visu")]
    pub(crate) function_4_visu: Option<String>,
    #[serde(rename = "indego_parse_2_attr", default)]
    pub(crate) parse_to_attr: bool,
    #[serde(rename = "indego_attr_name")]
    pub(crate) attr_name: Option<String>,
    #[serde(rename = "indego_attr_type")]
    pub(crate) attr_type: Option<KeyType>,
}

impl Attributes {
    /// Whether writes to the item are routed to the plugin.
    pub(crate) fn is_watched(&self) -> bool {
        self.command.is_some()
            || self.config.is_some()
            || self.plugin_handled
            || self.function_4_all.is_some()
            || self.function_4_visu.is_some()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Item {
    pub(crate) value: Value,
    pub(crate) attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ItemChange {
    /// Full path, parent prefix included.
    pub(crate) path: String,
    pub(crate) value: Value,
    pub(crate) origin: Origin,
}

/// Dictionary bound from an item through `indego_parse_2_attr`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Table {
    Int(BTreeMap<i64, Value>),
    Str(BTreeMap<String, Value>),
}

#[derive(Debug, Default)]
pub(crate) struct ItemTree {
    parent: String,
    items: BTreeMap<String, Item>,
    subscribers: Vec<mpsc::UnboundedSender<ItemChange>>,
}

fn collect(path: &str, node: &Map<String, Value>, out: &mut BTreeMap<String, Item>) -> Result<(), Error> {
    let mut attrs = Map::new();
    for (key, value) in node {
        if ATTRIBUTE_KEYS.contains(&key.as_str()) {
            attrs.insert(key.clone(), value.clone());
        }
    }
    let attributes: Attributes = serde_json::from_value(Value::Object(attrs))
        .map_err(|e| Error::Attributes(path.to_string(), e))?;
    let value = match &attributes.initial_value {
        Some(v) => attributes.kind.coerce(v.clone()),
        None => attributes.kind.default_value(),
    };
    out.insert(path.to_string(), Item { value, attributes });
    for (key, value) in node {
        if ATTRIBUTE_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Value::Object(child) = value {
            collect(&format!("{path}.{key}"), child, out)?;
        }
    }
    Ok(())
}

impl ItemTree {
    /// Build the tree below `parent` from nested definitions.
    pub(crate) fn from_definitions(parent: &str, definitions: &Value) -> Result<Self, Error> {
        let root = definitions
            .get(parent)
            .and_then(Value::as_object)
            .ok_or_else(|| Error::NoParent(parent.to_string()))?;
        let mut items = BTreeMap::new();
        collect(parent, root, &mut items)?;
        Ok(Self {
            parent: parent.to_string(),
            items,
            subscribers: Vec::new(),
        })
    }

    pub(crate) fn parent(&self) -> &str {
        &self.parent
    }

    pub(crate) fn path(&self, name: &str) -> String {
        format!("{}.{name}", self.parent)
    }

    /// Name relative to the parent item, if `path` lies below it.
    pub(crate) fn relative<'a>(&self, path: &'a str) -> Option<&'a str> {
        path.strip_prefix(&self.parent)?.strip_prefix('.')
    }

    pub(crate) fn item(&self, path: &str) -> Option<&Item> {
        self.items.get(path)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Item)> {
        self.items.iter()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Value> {
        self.items.get(&self.path(name)).map(|i| &i.value)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.items.contains_key(&self.path(name))
    }

    pub(crate) fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ItemChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    /// Write `value` to the item at the full `path`.
    ///
    /// Subscribers hear about the write when the value changed or the item
    /// enforces updates. Returns `false` when no such item exists.
    pub(crate) fn write(&mut self, path: &str, value: Value, origin: Origin) -> bool {
        let Some(item) = self.items.get_mut(path) else {
            tracing::warn!(path, "no such item");
            return false;
        };
        let value = item.attributes.kind.coerce(value);
        let changed = item.value != value;
        if !changed && !item.attributes.enforce_updates {
            return true;
        }
        item.value = value.clone();
        tracing::trace!(path, %value, origin = origin.label(), "item written");
        let change = ItemChange {
            path: path.to_string(),
            value,
            origin,
        };
        self.subscribers.retain(|s| s.send(change.clone()).is_ok());
        true
    }

    /// Parse every `indego_parse_2_attr` item into the table it binds. Each
    /// table fails on its own.
    pub(crate) fn tables(&self) -> BTreeMap<String, Result<Table, Error>> {
        let mut out = BTreeMap::new();
        for (path, item) in &self.items {
            let attrs = &item.attributes;
            if !attrs.parse_to_attr {
                continue;
            }
            let Some(name) = &attrs.attr_name else {
                tracing::warn!(path, "item parses to an attribute but names none");
                continue;
            };
            out.insert(name.clone(), parse_table(path, item));
        }
        out
    }
}

fn parse_table(path: &str, item: &Item) -> Result<Table, Error> {
    let parsed = match &item.value {
        Value::String(s) if s.trim().is_empty() => Map::new(),
        Value::String(s) => match serde_json::from_str(s) {
            Ok(Value::Object(map)) => map,
            _ => return Err(Error::TableValue(path.to_string())),
        },
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        _ => return Err(Error::TableValue(path.to_string())),
    };
    Ok(match item.attributes.attr_type.unwrap_or(KeyType::Str) {
        KeyType::Int => {
            let mut entries = BTreeMap::new();
            for (key, value) in parsed {
                let k = key.trim().parse().map_err(|_| Error::TableKey {
                    path: path.to_string(),
                    key: key.clone(),
                })?;
                entries.insert(k, value);
            }
            Table::Int(entries)
        }
        KeyType::Str => Table::Str(parsed.into_iter().collect()),
    })
}

/// Shared handle on the item tree.
#[derive(Debug, Clone)]
pub(crate) struct Items {
    tree: Arc<Mutex<ItemTree>>,
}

impl Items {
    pub(crate) fn new(tree: ItemTree) -> Self {
        Self {
            tree: Arc::new(Mutex::new(tree)),
        }
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ItemTree> {
        self.tree.lock().await
    }

    pub(crate) async fn subscribe(&self) -> mpsc::UnboundedReceiver<ItemChange> {
        self.tree.lock().await.subscribe()
    }

    /// Value of the child item `name`, `Null` if there is no such item.
    pub(crate) async fn get(&self, name: &str) -> Value {
        let tree = self.tree.lock().await;
        match tree.get(name) {
            Some(v) => v.clone(),
            None => {
                tracing::warn!(item = name, "could not get item");
                Value::Null
            }
        }
    }

    pub(crate) async fn bool(&self, name: &str) -> bool {
        truthy(&self.get(name).await)
    }

    pub(crate) async fn i64(&self, name: &str) -> i64 {
        let v = self.get(name).await;
        v.as_i64()
            .or_else(|| v.as_f64().map(|f| f as i64))
            .unwrap_or_default()
    }

    pub(crate) async fn f64(&self, name: &str) -> f64 {
        self.get(name).await.as_f64().unwrap_or_default()
    }

    pub(crate) async fn string(&self, name: &str) -> String {
        match self.get(name).await {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }

    /// Write the child item `name` on the plugin's behalf.
    pub(crate) async fn set(&self, name: &str, value: impl Into<Value>) {
        let mut tree = self.tree.lock().await;
        let path = tree.path(name);
        tree.write(&path, value.into(), Origin::Plugin);
    }

    /// Like [`Items::set`], but silently skips items the tree does not define.
    /// Used when mirroring vendor payloads whose keys vary between models.
    pub(crate) async fn set_known(&self, name: &str, value: impl Into<Value>) -> bool {
        let mut tree = self.tree.lock().await;
        if !tree.contains(name) {
            return false;
        }
        let path = tree.path(name);
        tree.write(&path, value.into(), Origin::Plugin)
    }

    /// Write the item at the full `path` on someone else's behalf.
    pub(crate) async fn write(&self, path: &str, value: Value, origin: Origin) -> bool {
        self.tree.lock().await.write(path, value, origin)
    }
}

/// Truthiness of an item value.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}
