use std::{sync::Arc, time::Duration};

use gateway::Gateway;
use storage::Storage;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) gateway: Gateway,
    pub(crate) storage: Storage,
}

impl AppState {
    /// Wires the gateway to persist acknowledged commands through `storage`.
    pub(crate) fn new(storage: Storage, command_timeout: Duration) -> Self {
        let gateway = Gateway::new(Arc::new(storage.clone()), command_timeout);
        Self { gateway, storage }
    }
}
