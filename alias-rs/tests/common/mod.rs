//! Shared fixtures for integration tests

#![allow(dead_code)]

use alias_rs::config::ServiceConfig;
use alias_rs::error::Result;
use alias_rs::mailer::{ForwardRequest, OutboundMailer};
use alias_rs::message::{EnvelopeRecipient, InboundEnvelope};
use alias_rs::model::{Recipient, User};
use alias_rs::notify::{NotificationEvent, Notifier};
use alias_rs::pipeline::{ReceivePipeline, ReceiveReport};
use alias_rs::store::{connect, SqliteStore};
use alias_rs::Config;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub const DEFAULT_LIMIT: u64 = 104_857_600;

pub const SIMPLE: &str = "From: Will <will@anonaddy.com>\r\n\
    To: ebay@johndoe.anonaddy.me\r\n\
    Subject: Test Email\r\n\
    Message-ID: <simple@anonaddy.com>\r\n\
    Content-Type: text/plain; charset=utf-8\r\n\
    \r\n\
    Hi,\r\n\
    \r\n\
    This is a test email.\r\n\
    \r\n\
    Will\r\n";

pub const WITH_ATTACHMENT: &str = "From: Will <will@anonaddy.com>\r\n\
    To: attachment@johndoe.anonaddy.me\r\n\
    Subject: With attachment\r\n\
    MIME-Version: 1.0\r\n\
    Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
    \r\n\
    --XYZ\r\n\
    Content-Type: text/plain; charset=utf-8\r\n\
    \r\n\
    See attached.\r\n\
    --XYZ\r\n\
    Content-Type: application/pdf; name=\"invoice.pdf\"\r\n\
    Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\
    Content-Transfer-Encoding: base64\r\n\
    \r\n\
    JVBERi0xLjQK\r\n\
    --XYZ--\r\n";

/// Mailer that records every forward instead of queueing it
#[derive(Default)]
pub struct RecordingMailer {
    requests: Mutex<Vec<ForwardRequest>>,
}

impl RecordingMailer {
    pub fn requests(&self) -> Vec<ForwardRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundMailer for RecordingMailer {
    async fn forward(&self, request: ForwardRequest) -> Result<()> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(Uuid, NotificationEvent)>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(Uuid, NotificationEvent)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, user: &User, event: NotificationEvent) -> Result<()> {
        self.events.lock().unwrap().push((user.id, event));
        Ok(())
    }
}

pub struct TestEnv {
    pub store: Arc<SqliteStore>,
    pub mailer: Arc<RecordingMailer>,
    pub notifier: Arc<RecordingNotifier>,
    pub pipeline: ReceivePipeline,
    /// `johndoe`, with a verified default recipient
    pub user: User,
    pub default_recipient: Recipient,
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.service = ServiceConfig {
        domains: vec!["anonaddy.me".to_string(), "anonaddy.com".to_string()],
        ..ServiceConfig::default()
    };
    config
}

pub async fn setup() -> TestEnv {
    setup_with(test_config(), DEFAULT_LIMIT).await
}

pub async fn setup_with(config: Config, bandwidth_limit: u64) -> TestEnv {
    let pool = connect("sqlite::memory:").await.unwrap();
    let store = Arc::new(SqliteStore::new(pool));
    let (user, default_recipient) = seed(&store, bandwidth_limit).await;

    let mailer = Arc::new(RecordingMailer::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let pipeline = ReceivePipeline::new(&config, store.clone(), mailer.clone(), notifier.clone());

    TestEnv {
        store,
        mailer,
        notifier,
        pipeline,
        user,
        default_recipient,
    }
}

/// Create the schema and `johndoe` with a verified default recipient
pub async fn seed(store: &SqliteStore, bandwidth_limit: u64) -> (User, Recipient) {
    store.init_db().await.unwrap();

    let mut user = store.insert_user("johndoe", bandwidth_limit).await.unwrap();
    let default_recipient = store
        .insert_recipient(user.id, "will@anonaddy.com", true)
        .await
        .unwrap();
    store
        .set_default_recipient(user.id, default_recipient.id)
        .await
        .unwrap();
    user.default_recipient_id = Some(default_recipient.id);

    (user, default_recipient)
}

/// Pipeline over its own pool, the way separate invocations share a database
pub async fn open_pipeline(database_url: &str) -> ReceivePipeline {
    let store = Arc::new(SqliteStore::new(connect(database_url).await.unwrap()));
    ReceivePipeline::new(
        &test_config(),
        store,
        Arc::new(RecordingMailer::default()),
        Arc::new(RecordingNotifier::default()),
    )
}

pub fn envelope(addresses: &[&str]) -> InboundEnvelope {
    InboundEnvelope {
        recipients: addresses
            .iter()
            .map(|address| EnvelopeRecipient::from_address(address).unwrap())
            .collect(),
    }
}

impl TestEnv {
    pub async fn receive(&self, raw: &'static str, addresses: &[&str], size: u64) -> ReceiveReport {
        self.receive_from(raw, "will@anonaddy.com", addresses, size)
            .await
    }

    pub async fn receive_from(
        &self,
        raw: &'static str,
        sender: &str,
        addresses: &[&str],
        size: u64,
    ) -> ReceiveReport {
        self.pipeline
            .receive(
                &envelope(addresses),
                Bytes::from_static(raw.as_bytes()),
                sender,
                size,
            )
            .await
            .unwrap()
    }

    pub async fn bandwidth(&self) -> u64 {
        use alias_rs::store::AliasStore;
        self.store
            .find_user(self.user.id)
            .await
            .unwrap()
            .unwrap()
            .bandwidth
    }
}
