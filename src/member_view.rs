//! Read-side projection of the room's call membership state.
//!
//! The view is stateless: every query re-reads the room's member events,
//! sorts them by server-origin timestamp for deterministic iteration,
//! flattens all users' `memberships` arrays and drops malformed or expired
//! entries. Malformed entries never surface as errors; the event layer is
//! fail-open.

use chrono::Utc;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::services::RoomService;
use crate::types::member::{CallMembership, memberships_array, parse_membership};

pub struct MembershipView {
    room: Arc<dyn RoomService>,
    room_id: String,
}

impl MembershipView {
    pub fn new(room: Arc<dyn RoomService>, room_id: impl Into<String>) -> Self {
        Self {
            room,
            room_id: room_id.into(),
        }
    }

    /// Every valid, non-expired membership in the room, across all call ids.
    pub async fn memberships(&self) -> Result<Vec<CallMembership>, ServiceError> {
        let now = Utc::now().timestamp_millis();
        let mut events = self.room.call_member_events(&self.room_id).await?;
        events.sort_by_key(|e| e.origin_server_ts);

        let mut out = Vec::new();
        for event in &events {
            for raw in memberships_array(&event.content) {
                if let Some(m) = parse_membership(&event.sender, &self.room_id, &raw)
                    && !m.is_expired(now)
                {
                    out.push(m);
                }
            }
        }
        Ok(out)
    }

    /// Memberships of one group call, filtered by call id, application and
    /// scope.
    pub async fn current(
        &self,
        call_id: &str,
        application: &str,
        scope: &str,
    ) -> Result<Vec<CallMembership>, ServiceError> {
        Ok(self
            .memberships()
            .await?
            .into_iter()
            .filter(|m| m.call_id == call_id && m.application == application && m.scope == scope)
            .collect())
    }

    /// Distinct call ids with at least one live membership, in first-seen
    /// order.
    pub async fn active_group_call_ids(&self) -> Result<Vec<String>, ServiceError> {
        let mut ids: Vec<String> = Vec::new();
        for m in self.memberships().await? {
            if !ids.contains(&m.call_id) {
                ids.push(m.call_id);
            }
        }
        Ok(ids)
    }

    pub async fn participant_count(&self, call_id: &str) -> Result<usize, ServiceError> {
        Ok(self
            .memberships()
            .await?
            .into_iter()
            .filter(|m| m.call_id == call_id)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemberStateEvent;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct FakeRoom {
        events: Mutex<Vec<MemberStateEvent>>,
    }

    #[async_trait]
    impl RoomService for FakeRoom {
        async fn call_member_events(
            &self,
            _room_id: &str,
        ) -> Result<Vec<MemberStateEvent>, ServiceError> {
            Ok(self.events.lock().await.clone())
        }

        async fn set_call_member_event(
            &self,
            _room_id: &str,
            _user_id: &str,
            _content: Value,
        ) -> Result<(), ServiceError> {
            Ok(())
        }
    }

    fn membership_json(call_id: &str, device_id: &str, expires_ts: i64) -> Value {
        json!({
            "call_id": call_id,
            "device_id": device_id,
            "expires_ts": expires_ts,
            "foci_active": [{"type": "mesh"}],
            "application": "m.call",
            "scope": "m.room",
            "membershipId": format!("sess-{device_id}"),
        })
    }

    fn far_future() -> i64 {
        Utc::now().timestamp_millis() + 3_600_000
    }

    #[tokio::test]
    async fn test_flattens_filters_and_sorts() {
        let room = Arc::new(FakeRoom::default());
        room.events.lock().await.extend([
            MemberStateEvent {
                sender: "@b:srv".into(),
                origin_server_ts: 200,
                content: json!({"memberships": [membership_json("conf", "D2", far_future())]}),
            },
            MemberStateEvent {
                sender: "@a:srv".into(),
                origin_server_ts: 100,
                content: json!({"memberships": [
                    membership_json("conf", "D1", far_future()),
                    membership_json("other-conf", "D1", far_future()),
                ]}),
            },
        ]);

        let view = MembershipView::new(room, "!r:srv");
        let all = view.memberships().await.unwrap();
        assert_eq!(all.len(), 3);
        // Oldest event first.
        assert_eq!(all[0].user_id, "@a:srv");

        let current = view.current("conf", "m.call", "m.room").await.unwrap();
        assert_eq!(current.len(), 2);

        let ids = view.active_group_call_ids().await.unwrap();
        assert_eq!(ids, vec!["conf".to_string(), "other-conf".to_string()]);

        assert_eq!(view.participant_count("conf").await.unwrap(), 2);
        assert_eq!(view.participant_count("other-conf").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_expired_and_malformed_are_dropped() {
        let room = Arc::new(FakeRoom::default());
        room.events.lock().await.push(MemberStateEvent {
            sender: "@a:srv".into(),
            origin_server_ts: 1,
            content: json!({"memberships": [
                membership_json("conf", "LIVE", far_future()),
                membership_json("conf", "DEAD", 1),
                {"device_id": "NO_CALL_ID", "expires_ts": far_future(), "foci_active": [{"type": "mesh"}]},
            ]}),
        });

        let view = MembershipView::new(room, "!r:srv");
        let current = view.current("conf", "m.call", "m.room").await.unwrap();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].device_id, "LIVE");
    }

    #[tokio::test]
    async fn test_missing_memberships_array_is_empty() {
        let room = Arc::new(FakeRoom::default());
        room.events.lock().await.push(MemberStateEvent {
            sender: "@a:srv".into(),
            origin_server_ts: 1,
            content: json!({}),
        });

        let view = MembershipView::new(room, "!r:srv");
        assert!(view.memberships().await.unwrap().is_empty());
    }
}
