use std::sync::Arc;

use chrono::Utc;

use crate::keys::{KeyError, KeyManager};

/// One tick of the key-rotation loop. The storage updater contract
/// arbitrates between instances, so running this everywhere on a timer is
/// safe; losers of the race simply pick up the winner's key.
pub async fn rotate_keys(keys: &Arc<KeyManager>) -> Result<bool, KeyError> {
    keys.rotate_if_needed(Utc::now()).await
}
