use serde::Serialize;

/// Closed set of network providers with a GPS endpoint on the Compass API.
/// Adding a provider means adding a variant and its two table entries below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Starlink,
    Idirect,
    Newtec,
    OneWeb,
}

impl Provider {
    /// Case-insensitive lookup. Unknown names resolve to `None`, never an
    /// error: rosters routinely carry providers without a GPS endpoint and
    /// callers are expected to skip those.
    pub fn parse(name: &str) -> Option<Provider> {
        match name.trim().to_ascii_lowercase().as_str() {
            "starlink" => Some(Provider::Starlink),
            "idirect" => Some(Provider::Idirect),
            "newtec" => Some(Provider::Newtec),
            "oneweb" => Some(Provider::OneWeb),
            _ => None,
        }
    }

    /// Path of the provider's GPS endpoint, relative to the Compass base URL.
    pub fn endpoint_path(&self) -> &'static str {
        match self {
            Provider::Starlink => "/starlinkgps",
            Provider::Idirect => "/idirectgps",
            Provider::Newtec => "/newtecgps",
            Provider::OneWeb => "/oneweb",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Starlink => "starlink",
            Provider::Idirect => "idirect",
            Provider::Newtec => "newtec",
            Provider::OneWeb => "oneweb",
        }
    }
}
