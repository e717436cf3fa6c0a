use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_REGENERATE_INTERVAL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GalleryConfig {
    /// How often the background task checks for a pending order rebuild.
    #[serde(with = "secs")]
    pub regenerate_interval: Duration,
    /// Run the background task at all; when off, orders change only on
    /// explicit force-regenerate and reload.
    pub auto_regenerate: bool,
    /// Reload the whole cache from the backing store after a write that the
    /// store accepted but the cache could not apply.
    pub resync_on_desync: bool,
}

impl Default for GalleryConfig {
    fn default() -> Self {
        Self {
            regenerate_interval: DEFAULT_REGENERATE_INTERVAL,
            auto_regenerate: true,
            resync_on_desync: true,
        }
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: GalleryConfig = serde_json::from_str(r#"{"regenerate_interval": 5}"#).unwrap();
        assert_eq!(cfg.regenerate_interval, Duration::from_secs(5));
        assert!(cfg.auto_regenerate);
        assert!(cfg.resync_on_desync);
    }
}
