use std::collections::HashMap;

/// Static `api_key -> tenant_id` lookup, built once at startup from the
/// `API_KEYS` configuration value.
#[derive(Debug, Default)]
pub struct ApiKeyMap {
    keys: HashMap<String, String>,
}

impl ApiKeyMap {
    pub fn new(keys: HashMap<String, String>) -> Self {
        Self { keys }
    }

    pub fn tenant_for(&self, api_key: &str) -> Option<&str> {
        self.keys.get(api_key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
