use std::sync::atomic::{AtomicI64, Ordering};

use crate::lsp::error::Error;
use crate::lsp::registry::{NotificationMethod, RequestMethod};
use crate::lsp::types::{Notification, Request, RequestId};

/// Builds outgoing messages and hands out request ids.
///
/// Ids come from a counter starting at 1, so an id is never reused while the
/// factory lives.
pub struct MessageFactory {
    id: AtomicI64,
}

impl Default for MessageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageFactory {
    pub fn new() -> Self {
        MessageFactory {
            id: AtomicI64::new(0),
        }
    }

    pub fn get_id(&self) -> RequestId {
        RequestId::Number(self.id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub fn create_request<M: RequestMethod>(&self, params: &M::Params) -> Result<Request, Error> {
        let params = serde_json::to_value(params).map_err(Error::Serialize)?;
        Ok(Request::new(self.get_id(), M::NAME, params))
    }

    pub fn create_notification<M: NotificationMethod>(
        &self,
        params: &M::Params,
    ) -> Result<Notification, Error> {
        let params = serde_json::to_value(params).map_err(Error::Serialize)?;
        Ok(Notification::new(M::NAME, params))
    }
}
