//! Cached vendor alerts.

use crate::schemas::indego::Alert;
use serde_json::Value;
use std::collections::BTreeMap;

const DISPLAY_HINT: &str = " Bitte folgen Sie den Anweisungen im Display des Mähers.";

/// Alerts keyed by id.
///
/// Alerts stay cached until they are deleted, even when a later poll no longer
/// reports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct AlertStore {
    alerts: BTreeMap<String, Value>,
}

impl AlertStore {
    /// Rebuild the store from the `visu.alerts` item.
    pub(crate) fn from_value(value: &Value) -> Self {
        let alerts = value
            .as_object()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        Self { alerts }
    }

    pub(crate) fn to_value(&self) -> Value {
        Value::Object(
            self.alerts
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &str) -> bool {
        self.alerts.contains_key(id)
    }

    /// Add the alerts not seen before and return them.
    pub(crate) fn merge(&mut self, incoming: Vec<Alert>) -> Vec<Alert> {
        let mut fresh = Vec::new();
        for mut alert in incoming {
            if self.alerts.contains_key(&alert.alert_id) {
                continue;
            }
            alert.message = alert.message.replace(DISPLAY_HINT, "");
            tracing::debug!(id = alert.alert_id, message = alert.message, "new alert");
            match serde_json::to_value(&alert) {
                Ok(v) => {
                    self.alerts.insert(alert.alert_id.clone(), v);
                }
                Err(e) => {
                    tracing::warn!(error = &e as &dyn std::error::Error, "could not cache alert");
                    continue;
                }
            }
            fresh.push(alert);
        }
        fresh
    }

    pub(crate) fn mark_read(&mut self, id: &str) {
        if let Some(Value::Object(alert)) = self.alerts.get_mut(id) {
            alert.insert("read_status".into(), Value::String("read".into()));
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        self.alerts.remove(id).is_some()
    }
}

/// Alert ids from an item value: a list of strings or numbers.
pub(crate) fn ids(value: &Value) -> Vec<String> {
    match value {
        Value::Array(ids) => ids
            .iter()
            .filter_map(|id| match id {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        Value::String(s) if !s.is_empty() => vec![s.clone()],
        Value::Number(n) => vec![n.to_string()],
        _ => Vec::new(),
    }
}
