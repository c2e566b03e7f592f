//! Declared handler shapes, shared by server and client.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, RpcError};

/// The five handler shapes a method can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerType {
    /// Header in, one leading result plus a raw byte stream out.
    Raw,
    /// One value in, one value out.
    Unary,
    /// One value in, many values out.
    Server,
    /// Many values in, one value out.
    Client,
    /// Many values in, many values out.
    Duplex,
}

impl HandlerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Unary => "unary",
            Self::Server => "server",
            Self::Client => "client",
            Self::Duplex => "duplex",
        }
    }
}

impl fmt::Display for HandlerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Method name to handler shape.
///
/// Serializes as a plain JSON object, e.g. `{"echo": "unary", "cat": "raw"}`.
/// Deserializing goes through [`insert`](Self::insert), so a loaded manifest
/// is checked the same way as a built one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Manifest {
    entries: BTreeMap<String, HandlerType>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare `method`. Re-declaring with the same shape is a no-op; a
    /// different shape is a configuration error.
    pub fn insert(&mut self, method: impl Into<String>, kind: HandlerType) -> Result<()> {
        let method = method.into();
        match self.entries.get(&method) {
            Some(existing) if *existing != kind => Err(RpcError::Config(format!(
                "method `{method}` declared as both {existing} and {kind}"
            ))),
            Some(_) => Ok(()),
            None => {
                self.entries.insert(method, kind);
                Ok(())
            }
        }
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, method: impl Into<String>, kind: HandlerType) -> Result<Self> {
        self.insert(method, kind)?;
        Ok(self)
    }

    pub fn get(&self, method: &str) -> Option<HandlerType> {
        self.entries.get(method).copied()
    }

    pub fn contains(&self, method: &str) -> bool {
        self.entries.contains_key(method)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, HandlerType)> {
        self.entries.iter().map(|(method, kind)| (method.as_str(), *kind))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a manifest from its JSON object form.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|err| RpcError::Config(format!("invalid manifest: {err}")))
    }
}

impl<'de> Deserialize<'de> for Manifest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ManifestVisitor;

        impl<'de> Visitor<'de> for ManifestVisitor {
            type Value = Manifest;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of method names to handler types")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Manifest, A::Error> {
                let mut manifest = Manifest::new();
                while let Some((method, kind)) = map.next_entry::<String, HandlerType>()? {
                    manifest.insert(method, kind).map_err(de::Error::custom)?;
                }
                Ok(manifest)
            }
        }

        deserializer.deserialize_map(ManifestVisitor)
    }
}

impl TryFrom<Vec<(String, HandlerType)>> for Manifest {
    type Error = RpcError;

    fn try_from(entries: Vec<(String, HandlerType)>) -> Result<Self> {
        entries
            .into_iter()
            .try_fold(Self::new(), |manifest, (method, kind)| manifest.with(method, kind))
    }
}
