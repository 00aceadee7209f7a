use crate::client::{Client, ClientError, ClientSpec};

/// Owns the one live connection to the remote assistant. Constructed once at
/// startup and passed by reference into the dispatcher.
///
/// At most one client is live at a time: `ensure_open` fills the slot lazily
/// and is idempotent; `close` empties it and runs exactly once per top-level
/// invocation via the dispatcher's unconditional-teardown path.
pub struct SessionManager {
    spec: ClientSpec,
    debug: bool,
    slot: Option<Client>,
}

impl SessionManager {
    pub fn new(spec: ClientSpec, debug: bool) -> SessionManager {
        SessionManager {
            spec,
            debug,
            slot: None,
        }
    }

    /// Opens the session if it isn't open yet and returns the handle. A
    /// second call without an intervening `close` returns the existing handle
    /// unchanged.
    pub async fn ensure_open(&mut self) -> Result<&mut Client, ClientError> {
        if self.slot.is_none() {
            self.slot = Some(Client::open(&self.spec, self.debug).await?);
        }
        Ok(self.slot.as_mut().unwrap())
    }

    /// Closes the session if one is open; a harmless no-op otherwise.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut client) = self.slot.take() {
            client.close_conversation().await?;
        }
        Ok(())
    }

    /// Clears the remote conversation state without dropping the handle.
    /// Only meaningful while a session is open.
    pub async fn reset(&mut self) -> Result<(), ClientError> {
        if let Some(client) = self.slot.as_mut() {
            client.reset_conversation().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::void::VoidCounters;

    fn void_session(scenario: &str) -> (SessionManager, VoidCounters) {
        let counters = VoidCounters::new();
        let session = SessionManager::new(
            ClientSpec::Void {
                scenario: scenario.to_string(),
                counters: counters.clone(),
            },
            false,
        );
        (session, counters)
    }

    #[tokio::test]
    async fn test_ensure_open_is_idempotent() {
        let (mut session, counters) = void_session("hello-world");
        session.ensure_open().await.unwrap();
        session.ensure_open().await.unwrap();
        session.ensure_open().await.unwrap();
        assert_eq!(counters.opened(), 1);
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let (mut session, counters) = void_session("hello-world");
        session.close().await.unwrap();
        assert_eq!(counters.closed(), 0);
    }

    #[tokio::test]
    async fn test_close_clears_the_slot() {
        let (mut session, counters) = void_session("hello-world");
        session.ensure_open().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(counters.closed(), 1);
        // A later ensure_open opens a fresh session
        session.ensure_open().await.unwrap();
        assert_eq!(counters.opened(), 2);
    }

    #[tokio::test]
    async fn test_reset_keeps_the_handle() {
        let (mut session, counters) = void_session("hello-world");
        session.ensure_open().await.unwrap();
        session.reset().await.unwrap();
        assert_eq!(counters.resets(), 1);
        assert_eq!(counters.opened(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_slot_empty() {
        let (mut session, counters) = void_session("create-conversation");
        assert!(session.ensure_open().await.is_err());
        session.close().await.unwrap();
        assert_eq!(counters.closed(), 0);
    }
}
