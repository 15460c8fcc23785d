use std::sync::Arc;

use manager::InstanceManager;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<InstanceManager>,
    pub api_key: Option<String>,
    pub proxy_client: reqwest::Client,
}
