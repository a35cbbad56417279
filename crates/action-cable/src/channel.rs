//! Channel descriptions and their canonical identifiers.

use serde_json::{Map, Value};

const CHANNEL_KEY: &str = "channel";

/// A server-side channel class plus the parameters it is subscribed with.
///
/// ```
/// use action_cable::Channel;
///
/// let channel = Channel::new("ChatChannel").with_param("room", "lobby");
/// assert_eq!(channel.identifier(), r#"{"channel":"ChatChannel","room":"lobby"}"#);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    name: String,
    params: Map<String, Value>,
}

impl Channel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Map::new(),
        }
    }

    /// Add a subscription parameter. A parameter named `channel` is ignored.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key == CHANNEL_KEY {
            tracing::warn!(channel = %self.name, "Ignoring parameter named \"channel\"");
            return self;
        }
        self.params.insert(key, value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// The identifier string the server uses to address this channel.
    ///
    /// `channel` comes first, then the parameters in sorted key order, so equal
    /// channels always produce byte-identical identifiers.
    pub fn identifier(&self) -> String {
        let mut out = String::from("{\"channel\":");
        out.push_str(&Value::from(self.name.as_str()).to_string());
        for (key, value) in &self.params {
            out.push(',');
            out.push_str(&Value::from(key.as_str()).to_string());
            out.push(':');
            out.push_str(&value.to_string());
        }
        out.push('}');
        out
    }
}
