//! Shared fixtures for handler and connection tests.

use std::sync::Arc;

use tempfile::TempDir;

use guardpost_shared::{Role, UserId};
use guardpost_store::Database;

use crate::api::AppState;
use crate::attachments::AttachmentStore;
use crate::config::ServerConfig;
use crate::facade::MessagingFacade;
use crate::gateway::RealtimeGateway;
use crate::identity::{DirectoryEntry, IdentityGateway, StaticDirectory};
use crate::presence::PresenceTracker;
use crate::store::SharedStore;

pub const MAX_TEST_ATTACHMENT: usize = 1024;

/// Users known to every test directory; each one's token is `tok-<id>`.
pub const USERS: [(&str, Role); 4] = [
    ("sub-a", Role::Subadmin),
    ("guard-b", Role::Guard),
    ("guard-c", Role::Guard),
    ("applicant-d", Role::Applicant),
];

pub struct TestApp {
    pub state: AppState,
    _dir: TempDir,
}

pub async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        database_path: Some(dir.path().join("chat.db")),
        attachment_storage_path: dir.path().join("attachments"),
        max_attachment_size: MAX_TEST_ATTACHMENT,
        outbound_queue: 256,
        ..ServerConfig::default()
    };

    let db = Database::open_at(&dir.path().join("chat.db")).unwrap();
    let directory = StaticDirectory::from_entries(USERS.iter().map(|(id, role)| DirectoryEntry {
        user_id: UserId::new(*id),
        role: *role,
        display_name: format!("{id} name"),
        token: format!("tok-{id}"),
    }));
    let identity: Arc<dyn IdentityGateway> = Arc::new(directory);
    let attachments = Arc::new(
        AttachmentStore::new(config.attachment_storage_path.clone(), config.max_attachment_size)
            .await
            .unwrap(),
    );
    let gateway = RealtimeGateway::new(PresenceTracker::new(), config.outbound_queue);
    let facade = MessagingFacade::new(
        SharedStore::new(db),
        gateway.clone(),
        identity.clone(),
        attachments.clone(),
    );

    TestApp {
        state: AppState {
            facade,
            identity,
            attachments,
            gateway,
            config: Arc::new(config),
        },
        _dir: dir,
    }
}
