//! A small persistent map, used as the default root class.  Keys are
//! strings; values are either inline bytes or references to other
//! persistent objects.  Ordinary library code riding on the core
//! contracts, not part of the storage engine itself.

use crate::error::Result;
use crate::persistent::{ClassRegistry, ObjectState, PObject, PRef};
use crate::serialize::{StateDecoder, StateEncoder};
use std::any::Any;
use std::collections::BTreeMap;

pub const CLASS_NAME: &str = "durus.PMap";

#[derive(Clone, Debug)]
pub enum PValue {
    Bytes(Vec<u8>),
    Ref(PRef),
}

#[derive(Default)]
pub struct PMap {
    entries: BTreeMap<String, PValue>,
}

impl PMap {
    pub fn new() -> PMap {
        PMap::default()
    }

    pub fn get(&self, key: &str) -> Option<&PValue> {
        self.entries.get(key)
    }

    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(PValue::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn get_ref(&self, key: &str) -> Option<PRef> {
        match self.entries.get(key) {
            Some(PValue::Ref(reference)) => Some(reference.clone()),
            _ => None,
        }
    }

    pub fn insert_bytes<K: Into<String>, V: Into<Vec<u8>>>(&mut self, key: K, value: V) {
        self.entries.insert(key.into(), PValue::Bytes(value.into()));
    }

    pub fn insert_ref<K: Into<String>>(&mut self, key: K, reference: PRef) {
        self.entries.insert(key.into(), PValue::Ref(reference));
    }

    pub fn insert_object<K: Into<String>>(&mut self, key: K, obj: &PObject) {
        self.insert_ref(key, PRef::to(obj));
    }

    pub fn remove(&mut self, key: &str) -> Option<PValue> {
        self.entries.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|key| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &PValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }
}

impl ObjectState for PMap {
    fn class_name(&self) -> &'static str {
        CLASS_NAME
    }

    fn encode(&self, encoder: &mut StateEncoder) -> Result<()> {
        encoder.put_u32(self.entries.len() as u32);
        for (key, value) in &self.entries {
            encoder.put_str(key);
            match value {
                PValue::Bytes(bytes) => {
                    encoder.put_u8(0);
                    encoder.put_bytes(bytes);
                }
                PValue::Ref(reference) => {
                    encoder.put_u8(1);
                    encoder.put_ref(reference)?;
                }
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn decode(decoder: &mut StateDecoder) -> Result<Box<dyn ObjectState>> {
    let count = decoder.get_u32()?;
    let mut map = PMap::new();
    for _ in 0..count {
        let key = decoder.get_str()?.to_string();
        let value = match decoder.get_u8()? {
            0 => PValue::Bytes(decoder.get_bytes()?.to_vec()),
            _ => PValue::Ref(decoder.get_ref()?),
        };
        map.entries.insert(key, value);
    }
    Ok(Box::new(map))
}

pub fn register(registry: &mut ClassRegistry) {
    registry.register(CLASS_NAME, decode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Oid;

    #[test]
    fn map_holds_bytes_and_refs() {
        let mut map = PMap::new();
        map.insert_bytes("greeting", &b"hello"[..]);
        map.insert_ref("child", PRef::from_oid(Oid(4)));
        assert_eq!(map.get_bytes("greeting"), Some(&b"hello"[..]));
        assert_eq!(map.get_ref("child").unwrap().oid(), Some(Oid(4)));
        assert!(map.get_bytes("child").is_none());
        assert_eq!(map.len(), 2);
        map.remove("greeting");
        assert!(!map.contains_key("greeting"));
    }
}
