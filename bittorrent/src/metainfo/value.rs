// A generic bencode value, used only to walk the v2 `file tree` dict, whose shape
// (arbitrarily nested directories) can't be fixed at compile time the way the rest
// of the info dictionary can.

use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};

#[derive(Debug, Clone)]
pub enum BValue {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<BValue>),
    Dict(BTreeMap<Vec<u8>, BValue>),
}

impl BValue {
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BValue>> {
        match self {
            BValue::Dict(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for BValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = BValue;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                write!(f, "a bencode value")
            }

            fn visit_i64<E>(self, v: i64) -> Result<BValue, E> {
                Ok(BValue::Int(v))
            }

            fn visit_u64<E>(self, v: u64) -> Result<BValue, E> {
                Ok(BValue::Int(v as i64))
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<BValue, E> {
                Ok(BValue::Bytes(v.to_vec()))
            }

            fn visit_byte_buf<E>(self, v: Vec<u8>) -> Result<BValue, E> {
                Ok(BValue::Bytes(v))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<BValue, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut out = Vec::new();
                while let Some(v) = seq.next_element()? {
                    out.push(v);
                }
                Ok(BValue::List(out))
            }

            fn visit_map<A>(self, mut map: A) -> Result<BValue, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut out = BTreeMap::new();
                while let Some((k, v)) = map.next_entry::<serde_bytes::ByteBuf, BValue>()? {
                    out.insert(k.into_vec(), v);
                }
                Ok(BValue::Dict(out))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
