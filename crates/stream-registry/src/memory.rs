use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{CreateStreamRequest, Heartbeat, RegistryError, SessionRegistry, StreamSummary};

/// One call observed by [`InMemoryRegistry`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryCall {
    Create(CreateStreamRequest),
    Heartbeat(Heartbeat),
    Close { camp_id: String, session_id: String },
    List { camp_id: String },
}

#[derive(Debug, Clone)]
struct Record {
    camp_id: String,
    summary: StreamSummary,
    open: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    records: HashMap<String, Record>,
    calls: Vec<RegistryCall>,
    fail_creates: bool,
    fail_heartbeats: bool,
    fail_closes: bool,
}

/// In-memory registry with failure injection, for tests and offline runs.
#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.state.lock().fail_heartbeats = fail;
    }

    pub fn fail_closes(&self, fail: bool) {
        self.state.lock().fail_closes = fail;
    }

    pub fn calls(&self) -> Vec<RegistryCall> {
        self.state.lock().calls.clone()
    }

    pub fn create_count(&self) -> usize {
        self.count(|call| matches!(call, RegistryCall::Create(_)))
    }

    pub fn heartbeat_count(&self) -> usize {
        self.count(|call| matches!(call, RegistryCall::Heartbeat(_)))
    }

    pub fn close_count(&self) -> usize {
        self.count(|call| matches!(call, RegistryCall::Close { .. }))
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.state
            .lock()
            .records
            .get(session_id)
            .map(|record| record.open)
            .unwrap_or(false)
    }

    fn count(&self, predicate: impl Fn(&RegistryCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| predicate(call)).count()
    }
}

#[async_trait]
impl SessionRegistry for InMemoryRegistry {
    async fn create_session(
        &self,
        request: &CreateStreamRequest,
    ) -> Result<StreamSummary, RegistryError> {
        let mut state = self.state.lock();
        state.calls.push(RegistryCall::Create(request.clone()));
        if state.fail_creates {
            return Err(RegistryError::Unavailable("create rejected".into()));
        }
        state.next_id += 1;
        let summary = StreamSummary {
            stream_id: state.next_id.to_string(),
            title: request.title.clone(),
            owner_nickname: None,
            kind: Some(request.kind),
        };
        state.records.insert(
            summary.stream_id.clone(),
            Record {
                camp_id: request.camp_id.clone(),
                summary: summary.clone(),
                open: true,
            },
        );
        Ok(summary)
    }

    async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.calls.push(RegistryCall::Heartbeat(heartbeat.clone()));
        if state.fail_heartbeats {
            return Err(RegistryError::Unavailable("heartbeat rejected".into()));
        }
        match state.records.get(&heartbeat.session_id) {
            Some(record) if record.open => Ok(()),
            _ => Err(RegistryError::NotFound(heartbeat.session_id.clone())),
        }
    }

    async fn close_session(&self, camp_id: &str, session_id: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        state.calls.push(RegistryCall::Close {
            camp_id: camp_id.to_string(),
            session_id: session_id.to_string(),
        });
        if state.fail_closes {
            return Err(RegistryError::Unavailable("close rejected".into()));
        }
        match state.records.get_mut(session_id) {
            Some(record) => {
                record.open = false;
                Ok(())
            }
            None => Err(RegistryError::NotFound(session_id.to_string())),
        }
    }

    async fn list_active(&self, camp_id: &str) -> Result<Vec<StreamSummary>, RegistryError> {
        let mut state = self.state.lock();
        state.calls.push(RegistryCall::List {
            camp_id: camp_id.to_string(),
        });
        let mut active: Vec<StreamSummary> = state
            .records
            .values()
            .filter(|record| record.open && record.camp_id == camp_id)
            .map(|record| record.summary.clone())
            .collect();
        active.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StreamKind;

    fn request(camp: &str) -> CreateStreamRequest {
        CreateStreamRequest {
            title: "Demo".into(),
            kind: StreamKind::PeerStudy,
            camp_id: camp.into(),
            track: None,
        }
    }

    #[tokio::test]
    async fn lifecycle_is_recorded() {
        let registry = InMemoryRegistry::new();
        let created = registry.create_session(&request("1")).await.unwrap();
        assert!(registry.is_open(&created.stream_id));

        let beat = Heartbeat {
            session_id: created.stream_id.clone(),
            mic_on: true,
            cam_on: true,
            screen_on: false,
            share_target: None,
        };
        registry.heartbeat(&beat).await.unwrap();
        assert_eq!(registry.list_active("1").await.unwrap().len(), 1);
        assert!(registry.list_active("2").await.unwrap().is_empty());

        registry.close_session("1", &created.stream_id).await.unwrap();
        assert!(!registry.is_open(&created.stream_id));
        assert!(matches!(
            registry.heartbeat(&beat).await,
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.create_count(), 1);
        assert_eq!(registry.heartbeat_count(), 2);
        assert_eq!(registry.close_count(), 1);
    }

    #[tokio::test]
    async fn injected_failures_still_record_calls() {
        let registry = InMemoryRegistry::new();
        registry.fail_creates(true);
        assert!(registry.create_session(&request("1")).await.is_err());
        assert_eq!(registry.create_count(), 1);
        assert!(registry.list_active("1").await.unwrap().is_empty());
    }
}
