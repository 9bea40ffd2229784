use std::borrow::Cow;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::ParseError;
use crate::packet::{ContentType, ProtocolData};

/// A sub-protocol payload decoded according to its declared content type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ProtocolValue {
    Binary(#[serde(with = "crate::util::b64_bytes")] Vec<u8>),
    Text(String),
    Json(serde_json::Value),
}

impl ProtocolValue {
    fn content_type(&self) -> ContentType {
        match self {
            ProtocolValue::Binary(_) => ContentType::ApplicationOctetStream,
            ProtocolValue::Text(_) => ContentType::TextPlainUtf8,
            ProtocolValue::Json(_) => ContentType::ApplicationJson,
        }
    }

    fn to_wire(&self) -> Vec<u8> {
        match self {
            ProtocolValue::Binary(data) => data.clone(),
            ProtocolValue::Text(text) => text.as_bytes().to_vec(),
            ProtocolValue::Json(value) => value.to_string().into_bytes(),
        }
    }

    fn from_wire(content_type: ContentType, data: &[u8]) -> Result<Self, ParseError> {
        match content_type {
            ContentType::TextPlainUtf8 => {
                Ok(ProtocolValue::Text(String::from_utf8(data.to_vec())?))
            }
            ContentType::ApplicationJson => Ok(ProtocolValue::Json(serde_json::from_slice(data)?)),
            // unknown content types are passed through untouched
            ContentType::ApplicationOctetStream | ContentType::Unknown(_) => {
                Ok(ProtocolValue::Binary(data.to_vec()))
            }
        }
    }
}

/// Structured view over the flat sub-protocol list of a BTP message.
///
/// The `ilp` part is singled out, every other part lands in `custom` decoded
/// per content type, and `map` preserves all parts by name so primary-protocol
/// dispatch (`auth`, `info`, `balance`, `limit`) can look them up uniformly.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProtocolMap {
    pub ilp: Option<Vec<u8>>,
    pub custom: BTreeMap<String, ProtocolValue>,
    pub map: BTreeMap<String, ProtocolValue>,
    /// Name of the first sub-protocol on the wire, which selects the handler.
    pub primary: Option<String>,
}

impl ProtocolMap {
    pub fn from_parts(parts: &[ProtocolData]) -> Result<Self, ParseError> {
        let mut view = ProtocolMap::default();
        for part in parts {
            let name = part.protocol_name.as_ref();
            let value = ProtocolValue::from_wire(part.content_type, &part.data)?;
            if view.primary.is_none() {
                view.primary = Some(name.to_string());
            }
            if name == "ilp" {
                view.ilp = Some(part.data.clone());
            } else {
                view.custom.insert(name.to_string(), value.clone());
            }
            view.map.insert(name.to_string(), value);
        }
        Ok(view)
    }

    /// The inverse of `from_parts`. `ilp` leads, custom parts follow in name
    /// order; `ilp` and `vouch` always travel as octet streams.
    pub fn to_parts(&self) -> Vec<ProtocolData> {
        let mut parts = Vec::with_capacity(self.custom.len() + 1);
        if let Some(ilp) = &self.ilp {
            parts.push(ProtocolData::octet_stream("ilp", ilp.clone()));
        }
        for (name, value) in &self.custom {
            let (content_type, data) = if name == "vouch" {
                (ContentType::ApplicationOctetStream, value.to_wire())
            } else {
                (value.content_type(), value.to_wire())
            };
            parts.push(ProtocolData {
                protocol_name: Cow::Owned(name.clone()),
                content_type,
                data,
            });
        }
        parts
    }

    pub fn from_ilp(ilp: Vec<u8>) -> Self {
        ProtocolMap {
            ilp: Some(ilp),
            primary: Some("ilp".to_string()),
            ..ProtocolMap::default()
        }
    }

    pub fn from_custom(custom: BTreeMap<String, ProtocolValue>) -> Self {
        let primary = custom.keys().next().cloned();
        let map = custom.clone();
        ProtocolMap {
            ilp: None,
            custom,
            map,
            primary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::ProtocolData;

    #[test]
    fn splits_ilp_from_custom_parts() {
        let parts = vec![
            ProtocolData::octet_stream("ilp", vec![0x0c, 0x01, 0x02]),
            ProtocolData::text("memo", "thanks".to_string()),
            ProtocolData::json("details", &serde_json::json!({ "invoice": 7 })),
        ];
        let view = ProtocolMap::from_parts(&parts).unwrap();

        assert_eq!(view.primary.as_deref(), Some("ilp"));
        assert_eq!(view.ilp.as_deref(), Some(&[0x0c, 0x01, 0x02][..]));
        assert!(!view.custom.contains_key("ilp"));
        assert_eq!(
            view.custom.get("memo"),
            Some(&ProtocolValue::Text("thanks".to_string()))
        );
        assert_eq!(
            view.custom.get("details"),
            Some(&ProtocolValue::Json(serde_json::json!({ "invoice": 7 })))
        );
        // the full map still carries every part for primary-protocol dispatch
        assert!(view.map.contains_key("ilp"));
        assert_eq!(view.map.len(), 3);
    }

    #[test]
    fn primary_is_the_first_part_on_the_wire() {
        let parts = vec![
            ProtocolData::octet_stream("auth", vec![]),
            ProtocolData::text("auth_username", "alice".to_string()),
            ProtocolData::text("auth_token", "hunter2".to_string()),
        ];
        let view = ProtocolMap::from_parts(&parts).unwrap();
        assert_eq!(view.primary.as_deref(), Some("auth"));
        assert_eq!(
            view.map.get("auth_token"),
            Some(&ProtocolValue::Text("hunter2".to_string()))
        );
    }

    #[test]
    fn reencodes_parts_with_ilp_first() {
        let mut custom = BTreeMap::new();
        custom.insert(
            "memo".to_string(),
            ProtocolValue::Text("zebra".to_string()),
        );
        custom.insert(
            "aaa".to_string(),
            ProtocolValue::Json(serde_json::json!(1)),
        );
        let view = ProtocolMap {
            ilp: Some(vec![0xff]),
            custom,
            map: BTreeMap::new(),
            primary: None,
        };

        let parts = view.to_parts();
        assert_eq!(parts[0].protocol_name, "ilp");
        assert_eq!(parts[0].content_type, ContentType::ApplicationOctetStream);
        assert_eq!(parts[1].protocol_name, "aaa");
        assert_eq!(parts[2].protocol_name, "memo");
    }

    #[test]
    fn vouch_is_always_an_octet_stream() {
        let mut custom = BTreeMap::new();
        custom.insert("vouch".to_string(), ProtocolValue::Binary(vec![1, 2, 3]));
        let view = ProtocolMap::from_custom(custom);
        let parts = view.to_parts();
        assert_eq!(parts[0].protocol_name, "vouch");
        assert_eq!(parts[0].content_type, ContentType::ApplicationOctetStream);
    }

    #[test]
    fn roundtrips_custom_values() {
        let parts = vec![
            ProtocolData::json("config", &serde_json::json!({ "limit": "10" })),
            ProtocolData::octet_stream("blob", vec![9, 9, 9]),
        ];
        let view = ProtocolMap::from_parts(&parts).unwrap();
        let reencoded = view.to_parts();
        let again = ProtocolMap::from_parts(&reencoded).unwrap();
        assert_eq!(view.custom, again.custom);
    }

    #[test]
    fn bad_json_part_is_an_error() {
        let parts = vec![ProtocolData {
            protocol_name: "details".into(),
            content_type: ContentType::ApplicationJson,
            data: b"{not json".to_vec(),
        }];
        assert!(ProtocolMap::from_parts(&parts).is_err());
    }
}
