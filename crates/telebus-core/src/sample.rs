//! Messages as written and samples as received.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::time::TimeService;

/// Decoded field values of one message.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Writer identity stamped on every outgoing message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    /// Logical identity of the writer, e.g. `Test:1` or `user@host`.
    pub identity: String,
    /// Process id of the writer.
    pub origin: u32,
    /// Host id of the writer.
    pub host: i32,
}

/// A message handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Instance index of the component the topic belongs to.
    pub sal_index: u32,
    /// Sequence number; for acknowledgments, that of the command acknowledged.
    pub seq_num: i64,
    pub origin: Origin,
    /// Send time, TAI unix seconds.
    pub snd_stamp: f64,
    pub fields: Fields,
}

/// A message as returned by a transport take.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    /// Receipt time on the transport's UTC clock, unix seconds.
    pub reception_utc: f64,
    /// False for metadata-only deliveries (e.g. disposal notices).
    pub valid: bool,
}

#[derive(Debug)]
struct SampleInner {
    message: Message,
    rcv_stamp: f64,
}

/// An immutable received message.
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct Sample {
    inner: Arc<SampleInner>,
}

impl Sample {
    pub fn new(message: Message, rcv_stamp: f64) -> Self {
        Self {
            inner: Arc::new(SampleInner { message, rcv_stamp }),
        }
    }

    /// Convert a delivery, stamping the receipt time in TAI.
    pub(crate) fn from_delivery(delivery: Delivery, time: &TimeService) -> Self {
        Self::new(delivery.message, time.stamp_tai(delivery.reception_utc))
    }

    pub fn message(&self) -> &Message {
        &self.inner.message
    }

    pub fn fields(&self) -> &Fields {
        &self.inner.message.fields
    }

    pub fn seq_num(&self) -> i64 {
        self.inner.message.seq_num
    }

    pub fn sal_index(&self) -> u32 {
        self.inner.message.sal_index
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.message.origin
    }

    pub fn identity(&self) -> &str {
        &self.inner.message.origin.identity
    }

    /// Send time, TAI unix seconds.
    pub fn snd_stamp(&self) -> f64 {
        self.inner.message.snd_stamp
    }

    /// Receipt time, TAI unix seconds.
    pub fn rcv_stamp(&self) -> f64 {
        self.inner.rcv_stamp
    }

    /// Raw value of one field.
    pub fn value(&self, name: &str) -> Option<&serde_json::Value> {
        self.inner.message.fields.get(name)
    }

    /// Typed value of one field.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self
            .value(name)
            .ok_or_else(|| Error::NotFound(format!("field {name}")))?;
        Ok(T::deserialize(value)?)
    }

    /// Decode all fields into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(serde_json::Value::Object(
            self.inner.message.fields.clone(),
        ))?)
    }

    /// True if both handles refer to the same received message.
    pub fn same_as(&self, other: &Sample) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Build [`Fields`] from any serializable struct or map.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(Error::InvalidValue(format!(
            "expected an object of fields, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, Serialize, PartialEq)]
    struct Position {
        x: f64,
        label: String,
    }

    fn sample(fields: serde_json::Value) -> Sample {
        let fields = match fields {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        Sample::new(
            Message {
                sal_index: 1,
                seq_num: 7,
                origin: Origin::default(),
                snd_stamp: 1.0,
                fields,
            },
            2.0,
        )
    }

    #[test]
    fn test_typed_access() {
        let s = sample(json!({"x": 1.5, "label": "a"}));
        assert_eq!(s.field::<f64>("x").unwrap(), 1.5);
        assert!(matches!(s.field::<f64>("y"), Err(Error::NotFound(_))));
        assert!(matches!(s.field::<f64>("label"), Err(Error::Json(_))));
        assert_eq!(
            s.decode::<Position>().unwrap(),
            Position {
                x: 1.5,
                label: "a".into()
            }
        );
    }

    #[test]
    fn test_clones_share_data() {
        let s = sample(json!({"x": 1.0}));
        let other = sample(json!({"x": 1.0}));
        assert!(s.same_as(&s.clone()));
        assert!(!s.same_as(&other));
    }

    #[test]
    fn test_to_fields() {
        let fields = to_fields(&Position {
            x: 2.0,
            label: "b".into(),
        })
        .unwrap();
        assert_eq!(fields["label"], json!("b"));
        assert!(to_fields(&3).is_err());
    }
}
