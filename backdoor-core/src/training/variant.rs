//! Single-key-selects-variant configuration parsing.

use crate::error::BackdoorError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// A closed set of variants written as `{"<variant>": {options}}`.
///
/// `VARIANTS` lists the recognised keys in dispatch order; when a mapping
/// carries more than one, the first listed wins and the rest are ignored.
pub trait VariantConfig: DeserializeOwned {
    /// What is being selected ("network", "optimizer", ...), for messages.
    const KIND: &'static str;
    const VARIANTS: &'static [&'static str];

    /// Parse an untyped mapping.
    ///
    /// An absent or unrecognised key is `UnsupportedVariant` carrying the
    /// whole mapping; malformed options for a recognised key are `Config`.
    fn from_value(value: &Value) -> Result<Self, BackdoorError> {
        let selected = value.as_object().and_then(|map| {
            Self::VARIANTS
                .iter()
                .find_map(|key| map.get_key_value(*key))
        });
        let Some((key, options)) = selected else {
            return Err(BackdoorError::unsupported(Self::KIND, value.to_string()));
        };

        let mut single = Map::new();
        single.insert(key.clone(), options.clone());
        serde_json::from_value(Value::Object(single)).map_err(|e| {
            BackdoorError::config(format!("invalid options for {} `{key}`: {e}", Self::KIND))
        })
    }
}
