//! End-to-end engine behavior across backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use agentvault_common::BackendKind;
use agentvault_crypto::KdfParams;
use agentvault_storage::{
    DevicePolicy, EncryptedFileBackend, HardwareBackend, InMemoryKeyring, KeychainBackend,
    MemoryBackend, SecretBackend, SimulatedTouch,
};
use agentvault_vault::{
    AuditAction, Credential, EngineConfig, Error, Labels, SessionState, VaultEngine,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn file_backend(path: &Path) -> Arc<dyn SecretBackend> {
    Arc::new(EncryptedFileBackend::new(path).with_kdf_params(KdfParams::minimal()))
}

async fn engine_over(backend: Arc<dyn SecretBackend>) -> VaultEngine {
    VaultEngine::with_backend(EngineConfig::memory(), backend)
        .await
        .unwrap()
}

fn device_policy() -> DevicePolicy {
    DevicePolicy::default().with_pin_kdf(KdfParams::minimal())
}

fn hardware_backend() -> Arc<dyn SecretBackend> {
    Arc::new(HardwareBackend::simulated(
        device_policy(),
        Arc::new(SimulatedTouch::instant()),
    ))
}

#[tokio::test]
async fn researcher_secret_is_invisible_to_writer() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.avp");
    let password = Credential::password("correct-horse-battery");

    let engine = engine_over(file_backend(&path)).await;
    engine.provision(&password).await.unwrap();

    let researcher = engine.authenticate(&password, "researcher").await.unwrap();
    engine
        .store(&researcher, "anthropic_api_key", "sk-ant-test", Labels::new())
        .await
        .unwrap();
    engine.close(&researcher).await;

    let writer = engine.authenticate(&password, "writer").await.unwrap();
    assert!(matches!(
        engine.retrieve(&writer, "anthropic_api_key").await,
        Err(Error::NotFound(_))
    ));

    let researcher = engine.authenticate(&password, "researcher").await.unwrap();
    let secret = engine
        .retrieve(&researcher, "anthropic_api_key")
        .await
        .unwrap();
    assert_eq!(secret.value.as_bytes(), b"sk-ant-test");
}

#[tokio::test]
async fn isolation_and_round_trip_hold_on_every_backend() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let cases: Vec<(Arc<dyn SecretBackend>, Credential)> = vec![
        (Arc::new(MemoryBackend::new()), Credential::OsLogin),
        (
            file_backend(&dir.path().join("vault.avp")),
            Credential::password("pw"),
        ),
        (
            Arc::new(KeychainBackend::with_store(
                "agentvault-test",
                Arc::new(InMemoryKeyring::new()),
            )),
            Credential::OsLogin,
        ),
        (hardware_backend(), Credential::pin("1234")),
    ];

    let value: Vec<u8> = (0..=255u8).collect();
    for (backend, credential) in cases {
        let kind = backend.kind();
        let engine = engine_over(backend).await;
        if kind == BackendKind::Hardware {
            engine.provision(&credential).await.unwrap();
        }

        let w1 = engine.authenticate(&credential, "w1").await.unwrap();
        let w2 = engine.authenticate(&credential, "w2").await.unwrap();

        engine
            .store(&w1, "token", value.clone(), Labels::new())
            .await
            .unwrap();
        assert_eq!(
            engine.retrieve(&w1, "token").await.unwrap().value.as_bytes(),
            value.as_slice(),
            "{kind} round trip"
        );
        assert!(
            matches!(engine.retrieve(&w2, "token").await, Err(Error::NotFound(_))),
            "{kind} isolation"
        );
        assert!(engine.list(&w2).await.unwrap().is_empty(), "{kind} list isolation");
        assert!(!engine.delete(&w2, "token").await.unwrap(), "{kind} delete isolation");
        assert!(engine.retrieve(&w1, "token").await.is_ok());
    }
}

#[tokio::test]
async fn rotate_increments_and_store_resets() {
    init_tracing();
    let engine = engine_over(Arc::new(MemoryBackend::new())).await;
    let session = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();

    let mut labels = Labels::new();
    labels.insert("provider".into(), "openai".into());
    assert_eq!(engine.store(&session, "k", "v1", labels).await.unwrap(), 1);
    assert_eq!(engine.rotate(&session, "k", "v2").await.unwrap(), 2);
    assert_eq!(engine.rotate(&session, "k", "v3").await.unwrap(), 3);

    let secret = engine.retrieve(&session, "k").await.unwrap();
    assert_eq!(secret.version, 3);
    assert_eq!(secret.value.as_bytes(), b"v3");
    assert_eq!(secret.labels.get("provider").map(String::as_str), Some("openai"));
    assert!(secret.updated_at >= secret.created_at);

    assert_eq!(engine.store(&session, "k", "v4", Labels::new()).await.unwrap(), 1);
    assert_eq!(engine.retrieve(&session, "k").await.unwrap().version, 1);

    assert!(matches!(
        engine.rotate(&session, "missing", "v").await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn expired_session_fails_every_operation() {
    init_tracing();
    let mut config = EngineConfig::memory();
    config.session.ttl = 1;
    let engine = VaultEngine::new(config).await.unwrap();
    let session = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();
    engine
        .store(&session, "k", "v", Labels::new())
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(2)).await;

    assert_eq!(engine.session_state(&session).await, SessionState::Expired);
    assert!(matches!(
        engine.store(&session, "k", "v", Labels::new()).await,
        Err(Error::SessionExpired(_))
    ));
    assert!(matches!(
        engine.retrieve(&session, "k").await,
        Err(Error::SessionExpired(_))
    ));
    assert!(matches!(
        engine.delete(&session, "k").await,
        Err(Error::SessionExpired(_))
    ));
    assert!(matches!(
        engine.list(&session).await,
        Err(Error::SessionExpired(_))
    ));
    assert!(matches!(
        engine.rotate(&session, "k", "v2").await,
        Err(Error::SessionExpired(_))
    ));

    // No auto-renewal; a new session works.
    let renewed = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();
    assert!(engine.retrieve(&renewed, "k").await.is_ok());
}

#[tokio::test]
async fn three_bad_pins_wipe_the_device() {
    init_tracing();
    let engine = engine_over(hardware_backend()).await;
    let pin = Credential::pin("1234");
    engine.provision(&pin).await.unwrap();

    let session = engine.authenticate(&pin, "w").await.unwrap();
    engine
        .store(&session, "k", "v", Labels::new())
        .await
        .unwrap();

    let bad = Credential::pin("9999");
    assert!(matches!(
        engine.authenticate(&bad, "w").await,
        Err(Error::Authentication(_))
    ));
    assert!(matches!(
        engine.authenticate(&bad, "w").await,
        Err(Error::Authentication(_))
    ));
    let wiped = engine.authenticate(&bad, "w").await.unwrap_err();
    assert!(matches!(wiped, Error::DeviceWiped(_)));
    assert!(!wiped.is_retryable());

    assert!(matches!(
        engine.authenticate(&pin, "w").await,
        Err(Error::DeviceWiped(_))
    ));
    let hardware = engine.discover().await.hardware.unwrap();
    assert_eq!(hardware.slots_used, 0);

    engine.provision(&pin).await.unwrap();
    let session = engine.authenticate(&pin, "w").await.unwrap();
    assert!(engine.list(&session).await.unwrap().is_empty());

    let failures = engine
        .audit_log()
        .await
        .iter()
        .filter(|e| e.action == AuditAction::AuthenticationFailed)
        .count();
    assert_eq!(failures, 4);
}

#[tokio::test]
async fn bad_pin_in_one_workspace_leaves_other_sessions_working() {
    init_tracing();
    let engine = engine_over(hardware_backend()).await;
    let pin = Credential::pin("1234");
    engine.provision(&pin).await.unwrap();

    let researcher = engine.authenticate(&pin, "researcher").await.unwrap();
    engine
        .store(&researcher, "k", "v", Labels::new())
        .await
        .unwrap();

    assert!(matches!(
        engine.authenticate(&Credential::pin("0000"), "writer").await,
        Err(Error::Authentication(_))
    ));

    assert_eq!(
        engine.session_state(&researcher).await,
        SessionState::Authenticated
    );
    assert_eq!(
        engine.retrieve(&researcher, "k").await.unwrap().value.as_bytes(),
        b"v"
    );
    assert_eq!(engine.rotate(&researcher, "k", "v2").await.unwrap(), 2);
}

#[tokio::test]
async fn hardware_capacity_is_reported_not_evicted() {
    init_tracing();
    let backend: Arc<dyn SecretBackend> = Arc::new(HardwareBackend::simulated(
        DevicePolicy {
            max_slots: 1,
            ..device_policy()
        },
        Arc::new(SimulatedTouch::instant()),
    ));
    let engine = engine_over(backend).await;
    let pin = Credential::pin("1234");
    engine.provision(&pin).await.unwrap();
    let session = engine.authenticate(&pin, "w").await.unwrap();

    engine
        .store(&session, "first", "1", Labels::new())
        .await
        .unwrap();
    assert!(matches!(
        engine.store(&session, "second", "2", Labels::new()).await,
        Err(Error::Capacity(_))
    ));
    assert_eq!(
        engine.retrieve(&session, "first").await.unwrap().value.as_bytes(),
        b"1"
    );
}

#[tokio::test]
async fn audit_log_has_one_entry_per_call_in_order() {
    init_tracing();
    let engine = engine_over(Arc::new(MemoryBackend::new())).await;
    let session = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();

    engine.store(&session, "a", "1", Labels::new()).await.unwrap();
    engine.retrieve(&session, "a").await.unwrap();
    engine.list(&session).await.unwrap();
    engine.rotate(&session, "a", "2").await.unwrap();
    let _ = engine.retrieve(&session, "missing").await;
    engine.delete(&session, "a").await.unwrap();
    engine.delete(&session, "a").await.unwrap();

    let entries = engine.audit_log().await;
    let actions: Vec<_> = entries.iter().map(|e| e.action).collect();
    assert_eq!(
        actions,
        vec![
            AuditAction::SessionCreated,
            AuditAction::Store,
            AuditAction::Retrieve,
            AuditAction::List,
            AuditAction::Rotate,
            AuditAction::Retrieve,
            AuditAction::Delete,
            AuditAction::Delete,
        ]
    );
    assert!(!entries[5].outcome.is_success());
    assert!(entries.iter().all(|e| e.workspace.as_str() == "w"));
    assert!(entries.iter().all(|e| e.session_id == Some(session.id())));
    engine.audit().verify().await.unwrap();

    // Reading twice gives the same trail.
    assert_eq!(engine.audit_log().await, entries);
}

#[tokio::test]
async fn flipped_ciphertext_byte_fails_every_authentication() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.avp");
    let password = Credential::password("correct-horse-battery");

    {
        let engine = engine_over(file_backend(&path)).await;
        let session = engine.authenticate(&password, "w").await.unwrap();
        engine
            .store(&session, "k", "secret-value", Labels::new())
            .await
            .unwrap();
    }

    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() - 20;
    bytes[middle] ^= 0x80;
    std::fs::write(&path, &bytes).unwrap();

    let engine = engine_over(file_backend(&path)).await;
    for _ in 0..3 {
        assert!(matches!(
            engine.authenticate(&password, "w").await,
            Err(Error::Integrity(_))
        ));
    }
}

#[tokio::test]
async fn wrong_password_looks_like_corruption() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.avp");

    let engine = engine_over(file_backend(&path)).await;
    engine
        .provision(&Credential::password("right"))
        .await
        .unwrap();

    let err = engine
        .authenticate(&Credential::password("wrong"), "w")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Integrity(_)));
    assert!(err.is_security_failure());
}

#[tokio::test]
async fn concurrent_writers_share_one_vault_file() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.avp");
    let password = Credential::password("pw");

    let engine = Arc::new(engine_over(file_backend(&path)).await);
    let a = engine.authenticate(&password, "a").await.unwrap();
    let b = engine.authenticate(&password, "b").await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let engine = engine.clone();
        let session = if i % 2 == 0 { a.clone() } else { b.clone() };
        tasks.push(tokio::spawn(async move {
            engine
                .store(&session, &format!("key-{i}"), format!("value-{i}"), Labels::new())
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(engine.list(&a).await.unwrap().len(), 5);
    assert_eq!(engine.list(&b).await.unwrap().len(), 5);

    // A fresh engine over the same file sees everything.
    let reopened = engine_over(file_backend(&path)).await;
    let a = reopened.authenticate(&password, "a").await.unwrap();
    assert_eq!(
        reopened.retrieve(&a, "key-4").await.unwrap().value.as_bytes(),
        b"value-4"
    );
}

#[tokio::test]
async fn durable_audit_trail_continues_across_engines() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let audit_path = dir.path().join("audit.jsonl");
    let config = EngineConfig::from_toml_str(&format!(
        "[backend]\ntype = \"memory\"\n[audit]\npath = {:?}\n",
        audit_path.display().to_string()
    ))
    .unwrap();

    {
        let engine = VaultEngine::new(config.clone()).await.unwrap();
        let session = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();
        engine.list(&session).await.unwrap();
    }

    let engine = VaultEngine::new(config).await.unwrap();
    assert_eq!(engine.audit_log().await.len(), 2);
    let session = engine.authenticate(&Credential::OsLogin, "w").await.unwrap();
    engine.close(&session).await;

    let entries = engine.audit_log().await;
    assert_eq!(entries.len(), 4);
    assert_eq!(entries[3].action, AuditAction::SessionClosed);
    engine.audit().verify().await.unwrap();

    let summary = engine.audit().summary().await;
    assert_eq!(summary.total, 4);
    assert_eq!(summary.by_action[&AuditAction::SessionCreated], 2);
}

#[tokio::test]
async fn discover_needs_no_credentials() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    let file = engine_over(file_backend(&dir.path().join("vault.avp"))).await;
    let info = file.discover().await;
    assert_eq!(info.security_level.ordinal(), 2);
    assert!(info.persistent);
    assert!(file.audit_log().await.is_empty());

    let hardware = engine_over(hardware_backend()).await;
    let info = hardware.discover().await;
    assert_eq!(info.security_level.ordinal(), 4);
    assert!(info.requires_touch);
    assert_eq!(info.hardware.unwrap().slots_total, 32);
}
