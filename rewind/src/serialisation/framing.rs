//! Class-name framing: `<response-type-name>\n<payload>`.
//!
//! Always applied. The prefix lets a reader identify the stored type without
//! decoding the payload.

use bytes::{BufMut, Bytes, BytesMut};

use super::{SerialisationDecorationMetadata, SerialisationDecorator};
use crate::error::SerialisationError;
use crate::request::ResponseType;

const DELIMITER: u8 = b'\n';

#[derive(Debug, Default, Clone, Copy)]
pub struct ClassNameDecorator;

impl ClassNameDecorator {
    /// Split a framed payload into its type name and body.
    pub fn split(payload: &Bytes) -> Result<(&str, Bytes), SerialisationError> {
        let position = payload
            .iter()
            .position(|b| *b == DELIMITER)
            .ok_or_else(|| {
                SerialisationError::Framing("Missing class name delimiter".to_string())
            })?;

        let name = std::str::from_utf8(&payload[..position])
            .map_err(|e| SerialisationError::Framing(format!("Invalid class name: {}", e)))?;
        if name.is_empty() {
            return Err(SerialisationError::Framing("Empty class name".to_string()));
        }
        Ok((name, payload.slice(position + 1..)))
    }
}

impl SerialisationDecorator for ClassNameDecorator {
    fn decorate_serialisation(
        &self,
        response_type: &ResponseType,
        _metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        let name = response_type.name().as_bytes();
        if name.contains(&DELIMITER) {
            return Err(SerialisationError::Framing(format!(
                "Class name {:?} contains the frame delimiter",
                response_type.name()
            )));
        }
        let mut framed = BytesMut::with_capacity(name.len() + 1 + payload.len());
        framed.put_slice(name);
        framed.put_u8(DELIMITER);
        framed.put(payload);
        Ok(framed.freeze())
    }

    fn decorate_deserialisation(
        &self,
        response_type: &ResponseType,
        _metadata: &SerialisationDecorationMetadata,
        payload: Bytes,
    ) -> Result<Bytes, SerialisationError> {
        let (name, body) = Self::split(&payload)?;
        if name != response_type.name() {
            return Err(SerialisationError::TypeMismatch {
                expected: response_type.name().to_string(),
                found: name.to_string(),
            });
        }
        Ok(body)
    }

    fn name(&self) -> &'static str {
        "class_name"
    }
}
