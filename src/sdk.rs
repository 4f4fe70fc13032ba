//! Host SDK surface exposed to plugins.
//!
//! While a plugin is servicing a `handleApi` call it may issue `sdkRequest`
//! frames back to the host. This module answers them: every call is scoped
//! to the calling plugin's own config namespace, so one plugin can never
//! read or write another's settings.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::protocol::{SdkCall, SdkReply};
use crate::store::Store;
use crate::transport::SdkHandler;

/// Answers plugin SDK calls against the host store.
pub struct HostSdk {
    store: Arc<Store>,
}

impl HostSdk {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Render a stored value as a plain string. String values come back
    /// bare; anything else is its JSON text.
    fn coerce_string(value: Value) -> String {
        match value {
            Value::String(s) => s,
            other => other.to_string(),
        }
    }
}

#[async_trait]
impl SdkHandler for HostSdk {
    async fn handle(&self, plugin_id: &str, call: SdkCall) -> SdkReply {
        debug!(plugin = %plugin_id, call = ?call, "Plugin SDK call");
        match call {
            SdkCall::ConfigGet { key } => match self.store.config_get(plugin_id, &key) {
                Ok(value) => SdkReply::Value(value),
                Err(e) => SdkReply::Error(e.to_string()),
            },
            SdkCall::ConfigGetString { key } => match self.store.config_get(plugin_id, &key) {
                Ok(value) => SdkReply::Text(value.map(Self::coerce_string)),
                Err(e) => SdkReply::Error(e.to_string()),
            },
            SdkCall::ConfigSet { key, value } => {
                match self.store.config_set(plugin_id, &key, &value) {
                    Ok(()) => SdkReply::Done,
                    Err(e) => SdkReply::Error(e.to_string()),
                }
            }
            SdkCall::ConfigDelete { key } => match self.store.config_delete(plugin_id, &key) {
                Ok(_) => SdkReply::Done,
                Err(e) => SdkReply::Error(e.to_string()),
            },
        }
    }
}
