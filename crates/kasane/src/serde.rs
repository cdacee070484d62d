//! Pluggable codecs used to persist aggregate snapshots as opaque payloads.

use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

#[derive(Debug, thiserror::Error)]
pub enum SerdeError {
    #[error("failed to convert type values: {0}")]
    ConversionError(String),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("failed to deserialize protobuf message into value: {0}")]
    ProtobufDeserializationError(#[from] prost::DecodeError),
}

pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerdeError>;
}

pub trait Deserializer<T>: Send + Sync {
    fn deserialize(&self, data: &[u8]) -> Result<T, SerdeError>;
}

pub trait Serde<T>: Serializer<T> + Deserializer<T> + Send + Sync {}

impl<S, T> Serde<T> for S where S: Serializer<T> + Deserializer<T> {}

#[derive(Debug, Clone, Copy)]
pub struct Json<T>(PhantomData<fn() -> T>)
where
    T: Serialize,
    for<'d> T: Deserialize<'d>;

impl<T> Default for Json<T>
where
    T: Serialize,
    for<'d> T: Deserialize<'d>,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for Json<T>
where
    T: Serialize,
    for<'d> T: Deserialize<'d>,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerdeError> {
        Ok(serde_json::to_vec(value)?)
    }
}

impl<T> Deserializer<T> for Json<T>
where
    T: Serialize,
    for<'d> T: Deserialize<'d>,
{
    fn deserialize(&self, data: &[u8]) -> Result<T, SerdeError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Protobuf<T>(PhantomData<fn() -> T>)
where
    T: prost::Message + Default;

impl<T> Default for Protobuf<T>
where
    T: prost::Message + Default,
{
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<T> Serializer<T> for Protobuf<T>
where
    T: prost::Message + Default,
{
    fn serialize(&self, value: &T) -> Result<Vec<u8>, SerdeError> {
        Ok(value.encode_to_vec())
    }
}

impl<T> Deserializer<T> for Protobuf<T>
where
    T: prost::Message + Default,
{
    fn deserialize(&self, data: &[u8]) -> Result<T, SerdeError> {
        Ok(T::decode(data)?)
    }
}
