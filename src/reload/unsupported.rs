//! Handoff for targets and configurations where listeners cannot be passed on.

use super::handoff::{Handoff, Replacement};
use super::ReloadError;
use crate::net::{BoundSocket, ListenAddress};

/// Handoff for platforms without descriptor inheritance, or when reloading is disabled.
///
/// Listeners are always bound fresh and every upgrade fails with
/// [`ReloadError::Unsupported`].
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedHandoff;

impl Handoff for UnsupportedHandoff {
    fn is_supported(&self) -> bool {
        false
    }

    fn has_parent(&self) -> bool {
        false
    }

    fn take_inherited(&self, _address: &ListenAddress) -> Result<Option<BoundSocket>, ReloadError> {
        Ok(None)
    }

    fn close_unclaimed(&self) -> Vec<ListenAddress> {
        Vec::new()
    }

    fn spawn_replacement(&self, _sockets: &[(&ListenAddress, &BoundSocket)]) -> Result<Replacement, ReloadError> {
        Err(ReloadError::Unsupported)
    }

    fn notify_parent(&self) -> Result<(), ReloadError> {
        Ok(())
    }
}
