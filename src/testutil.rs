//! Shared test fixtures: a full in-memory stack wired to the simulator
//! transport.

use crate::autoreply::AutoReplyEngine;
use crate::bulk::BulkEngine;
use crate::config::{AutoReplyConfig, MediaConfig, SessionConfig, WebhookConfig};
use crate::media::MediaStore;
use crate::queue::JobQueue;
use crate::session::{CreateSessionRequest, SessionManager, UserCtx};
use crate::wa::sim::{SimClient, SimClientFactory};
use crate::webhook::WebhookDispatcher;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

pub(crate) struct TestStack {
    pub pool: SqlitePool,
    pub factory: Arc<SimClientFactory>,
    pub manager: Arc<SessionManager>,
    pub bulk: Arc<BulkEngine>,
    pub queue: JobQueue,
    pub autoreply: Arc<AutoReplyEngine>,
    pub media: Arc<MediaStore>,
    _media_dir: tempfile::TempDir,
}

pub(crate) fn owner() -> UserCtx {
    UserCtx::user("u-test")
}

pub(crate) async fn stack() -> TestStack {
    stack_with_factory(Arc::new(SimClientFactory::new())).await
}

pub(crate) async fn stack_with_factory(factory: Arc<SimClientFactory>) -> TestStack {
    let pool = crate::db::connect_in_memory().await.expect("db");
    let media_dir = tempfile::tempdir().expect("media dir");
    let media = Arc::new(
        MediaStore::new(&MediaConfig {
            directory: media_dir.path().to_path_buf(),
            url_ttl_minutes: 5,
        })
        .expect("media store"),
    );
    let manager = SessionManager::new(
        pool.clone(),
        factory.clone(),
        SessionConfig {
            connect_timeout_s: 5,
            pairing_timeout_s: 5,
            ..Default::default()
        },
        WebhookDispatcher::new(WebhookConfig::default()),
        media.clone(),
    );
    let autoreply = AutoReplyEngine::new(pool.clone(), &manager, AutoReplyConfig::default());
    manager.attach_auto_reply(autoreply.clone());
    let bulk = BulkEngine::new(manager.clone(), pool.clone());
    let queue = JobQueue::new(pool.clone());
    TestStack {
        pool,
        factory,
        manager,
        bulk,
        queue,
        autoreply,
        media,
        _media_dir: media_dir,
    }
}

impl TestStack {
    /// Create a session for `caller` and connect it.
    pub async fn connected_session(&self, phone: &str, caller: &UserCtx) -> String {
        let view = self
            .manager
            .create(
                CreateSessionRequest {
                    phone: Some(phone.to_string()),
                    name: "test".to_string(),
                    ..Default::default()
                },
                caller,
            )
            .await
            .expect("create session");
        self.manager
            .connect(&view.id, caller)
            .await
            .expect("connect session");
        view.id
    }

    pub fn sim(&self, session_id: &str) -> Arc<SimClient> {
        self.factory.client(session_id).expect("sim client")
    }
}

/// Poll a condition until it holds; panics after ~10s of (virtual) time.
pub(crate) async fn wait_until<F>(mut cond: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..5000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {what}");
}
