use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::errors::PluginError;
use crate::packet::{ContentType, ProtocolData};
use crate::protocol_map::{ProtocolMap, ProtocolValue};
use crate::util::base64url_encode;

type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, PluginError>> + Send + Sync>;

/// User-defined sub-protocol handlers, consulted for MESSAGE frames whose
/// primary protocol is not built in. Each handled part produces one JSON part
/// in the response under the same name.
#[derive(Clone, Default)]
pub struct CustomRpcRegistry {
    handlers: Arc<RwLock<HashMap<String, Handler>>>,
}

impl CustomRpcRegistry {
    pub fn new() -> Self {
        CustomRpcRegistry::default()
    }

    pub fn register<F, Fut>(&self, protocol: &str, handler: F)
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, PluginError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |value| Box::pin(handler(value)));
        self.handlers
            .write()
            .insert(protocol.to_string(), handler);
    }

    pub fn unregister(&self, protocol: &str) -> bool {
        self.handlers.write().remove(protocol).is_some()
    }

    pub async fn handle(&self, view: &ProtocolMap) -> Result<Vec<ProtocolData>, PluginError> {
        let mut responses = Vec::new();
        for (name, value) in &view.map {
            let handler = self.handlers.read().get(name).cloned();
            let handler = match handler {
                Some(handler) => handler,
                None => continue,
            };
            let input = match value {
                ProtocolValue::Json(value) => value.clone(),
                ProtocolValue::Text(text) => serde_json::Value::String(text.clone()),
                ProtocolValue::Binary(bytes) => {
                    serde_json::Value::String(base64url_encode(bytes))
                }
            };
            let output = handler(input).await?;
            responses.push(ProtocolData {
                protocol_name: Cow::Owned(name.clone()),
                content_type: ContentType::ApplicationJson,
                data: output.to_string().into_bytes(),
            });
        }
        if responses.is_empty() {
            return Err(PluginError::NotAccepted(format!(
                "Unsupported side protocol {}",
                view.primary.as_deref().unwrap_or("(none)")
            )));
        }
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ProtocolData;

    fn message_view(name: &'static str, value: serde_json::Value) -> ProtocolMap {
        ProtocolMap::from_parts(&[ProtocolData::json(name, &value)]).unwrap()
    }

    #[tokio::test]
    async fn handles_registered_protocols() {
        let registry = CustomRpcRegistry::new();
        registry.register("quote", |input| async move {
            Ok(serde_json::json!({ "echo": input }))
        });

        let responses = registry
            .handle(&message_view("quote", serde_json::json!({ "amount": "5" })))
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].protocol_name, "quote");
        let value: serde_json::Value = serde_json::from_slice(&responses[0].data).unwrap();
        assert_eq!(value["echo"]["amount"], "5");
    }

    #[tokio::test]
    async fn unregistered_protocols_are_refused() {
        let registry = CustomRpcRegistry::new();
        let err = registry
            .handle(&message_view("mystery", serde_json::json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotAccepted(_)));
    }

    #[tokio::test]
    async fn unregister_removes_the_handler() {
        let registry = CustomRpcRegistry::new();
        registry.register("quote", |_| async move { Ok(serde_json::json!(1)) });
        assert!(registry.unregister("quote"));
        assert!(!registry.unregister("quote"));

        let err = registry
            .handle(&message_view("quote", serde_json::json!(null)))
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotAccepted(_)));
    }
}
