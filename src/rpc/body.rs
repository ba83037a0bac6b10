use crate::core::{ProxyError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::fmt;

/// Typed argument or result payload of one RPC.
///
/// Any serde type qualifies; payloads travel as MessagePack maps so fields can
/// be added without breaking older peers.
pub trait RpcBody: Any + Send + Sync + fmt::Debug {
    /// Populates `self` from an encoded payload.
    fn decode_from(&mut self, payload: &[u8]) -> Result<()>;

    fn encode_to(&self) -> Result<Vec<u8>>;

    fn as_any(&self) -> &dyn Any;

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
}

impl<T> RpcBody for T
where
    T: Serialize + DeserializeOwned + Any + Send + Sync + fmt::Debug,
{
    fn decode_from(&mut self, payload: &[u8]) -> Result<()> {
        *self = rmp_serde::from_slice(payload)
            .map_err(|e| ProxyError::Decode(format!("argument payload: {}", e)))?;
        Ok(())
    }

    fn encode_to(&self) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| ProxyError::Encode(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }
}

/// Recovers the concrete type behind a decoded body.
pub fn downcast_body<T: RpcBody>(body: Box<dyn RpcBody>) -> Result<Box<T>> {
    body.into_any().downcast::<T>().map_err(|_| {
        ProxyError::InvalidData(format!(
            "unexpected body type, wanted {}",
            std::any::type_name::<T>()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct TableQuery {
        name: String,
        ids: Vec<i32>,
    }

    #[test]
    fn test_decode_populates_created_instance() {
        let original = TableQuery {
            name: "t".into(),
            ids: vec![1, 2],
        };
        let payload = original.encode_to().unwrap();

        let mut body: Box<dyn RpcBody> = Box::new(TableQuery::default());
        body.decode_from(&payload).unwrap();
        assert_eq!(body.as_any().downcast_ref::<TableQuery>(), Some(&original));
    }

    #[test]
    fn test_downcast_to_wrong_type_fails() {
        let body: Box<dyn RpcBody> = Box::new(TableQuery::default());
        assert!(downcast_body::<String>(body).is_err());
    }

    #[test]
    fn test_garbage_payload_is_decode_error() {
        let mut body = TableQuery::default();
        assert!(matches!(
            body.decode_from(&[0xc1]),
            Err(ProxyError::Decode(_))
        ));
    }
}
