use crate::core::{Result, SessionState};

/// Hooks into the session lifecycle.
///
/// The `before` hooks may rewrite the incoming record or veto the operation by
/// returning an error; nothing has been persisted at that point.
pub trait SessionExtension: Send + Sync {
    fn on_before_start(&self, _params: &mut SessionState) -> Result<()> {
        Ok(())
    }

    fn on_after_start(&self, _state: &SessionState) {}

    fn on_before_update(&self, _params: &mut SessionState) -> Result<()> {
        Ok(())
    }

    fn on_after_update(&self, _state: &SessionState) {}

    fn on_before_apply(&self, _state: &mut SessionState) -> Result<()> {
        Ok(())
    }

    fn on_after_apply(&self, _state: &SessionState) {}

    fn on_before_end(&self) {}

    fn on_after_end(&self) {}
}
