// Long-poll watch registration: completed exactly once

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use vesta_persistence::ConfigFileKey;

use crate::model::ChangedFile;

/// Lifecycle of a registration; every state but `Registered` is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchState {
    Registered,
    Matched,
    Expired,
    Cancelled,
}

pub(crate) struct Registration {
    /// Distinguishes a replaced registration of the same client
    pub(crate) id: u64,
    pub(crate) client_id: String,
    pub(crate) labels: HashMap<String, String>,
    /// file key -> (file, last known version)
    pub(crate) files: HashMap<String, (ConfigFileKey, u64)>,
    pub(crate) deadline: Instant,
    state: Mutex<WatchState>,
    sender: Mutex<Option<oneshot::Sender<Vec<ChangedFile>>>>,
}

impl Registration {
    pub(crate) fn new(
        id: u64,
        client_id: String,
        labels: HashMap<String, String>,
        files: HashMap<String, (ConfigFileKey, u64)>,
        deadline: Instant,
    ) -> (Self, oneshot::Receiver<Vec<ChangedFile>>) {
        let (sender, receiver) = oneshot::channel();
        let registration = Self {
            id,
            client_id,
            labels,
            files,
            deadline,
            state: Mutex::new(WatchState::Registered),
            sender: Mutex::new(Some(sender)),
        };
        (registration, receiver)
    }

    pub(crate) fn state(&self) -> WatchState {
        *self.state.lock()
    }

    /// Move to a terminal state. Only the first call wins; the changed files
    /// are delivered only for `Matched`.
    pub(crate) fn complete(&self, state: WatchState, changed: Vec<ChangedFile>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        *self.state.lock() = state;
        if state == WatchState::Matched {
            let _ = sender.send(changed);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use vesta_persistence::ReleaseType;

    use super::*;

    fn changed(version: u64) -> ChangedFile {
        ChangedFile {
            namespace: "ns".to_string(),
            group: "g".to_string(),
            file_name: "a.yaml".to_string(),
            release_type: ReleaseType::Normal,
            version,
            md5: String::new(),
        }
    }

    #[tokio::test]
    async fn test_completes_exactly_once() {
        let (registration, rx) = Registration::new(
            1,
            "c1".to_string(),
            HashMap::new(),
            HashMap::new(),
            Instant::now(),
        );
        assert_eq!(registration.state(), WatchState::Registered);

        assert!(registration.complete(WatchState::Matched, vec![changed(4)]));
        // a timer firing after the match is a no-op
        assert!(!registration.complete(WatchState::Expired, Vec::new()));
        assert_eq!(registration.state(), WatchState::Matched);
        assert_eq!(rx.await.unwrap(), vec![changed(4)]);
    }

    #[tokio::test]
    async fn test_cancel_drops_sender() {
        let (registration, rx) = Registration::new(
            1,
            "c1".to_string(),
            HashMap::new(),
            HashMap::new(),
            Instant::now(),
        );
        assert!(registration.complete(WatchState::Cancelled, vec![changed(1)]));
        assert!(rx.await.is_err());
    }
}
