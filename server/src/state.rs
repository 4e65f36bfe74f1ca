//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the record store and a map of live board rooms. A room is the
//! set of connected clients on one board plus the presence roster they have
//! published. Rooms live only as long as someone is joined; objects live in
//! the store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use boardsync::PresenceMeta;
use boardsync::frame::Frame;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::store::RecordStore;

// =============================================================================
// BOARD ROOM
// =============================================================================

/// Per-board live state. Never persisted.
#[derive(Default)]
pub struct BoardRoom {
    /// Connected clients: `client_id` -> sender for outgoing frames.
    pub clients: HashMap<Uuid, mpsc::Sender<Frame>>,
    /// Tracked presence, one entry per client.
    pub roster: BTreeMap<Uuid, PresenceMeta>,
}

impl BoardRoom {
    #[must_use]
    pub fn roster(&self) -> Vec<PresenceMeta> {
        self.roster.values().cloned().collect()
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub boards: Arc<RwLock<HashMap<String, BoardRoom>>>,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store, boards: Arc::new(RwLock::new(HashMap::new())) }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================
