//! Tests of the secrets-for-crypto shim: key entry bookkeeping and the
//! asynchronous store/retrieve/delete helpers routed through the request
//! pipeline.

use std::sync::mpsc;

use secretsd_core::{
    AccessControlMode, CryptoHelperEvent, DaemonConfig, DaemonKeys, DeviceLockUnlockSemantic,
    Error, KeyEntryIdentifier, PluginRegistry, RequestProcessor, Response, SecretsDatabase,
    SecretsService, StaticIdentity,
};
use secretsd_plugins::{MemoryEncryptionPlugin, MemoryStoragePlugin, TestAuthenticationPlugin};

const APP_A: u32 = 100;

fn service() -> (SecretsService, mpsc::Receiver<CryptoHelperEvent>) {
    let mut registry = PluginRegistry::new(true);
    registry
        .register_storage(Box::new(MemoryStoragePlugin::new("store")))
        .expect("register storage");
    registry
        .register_encryption(Box::new(MemoryEncryptionPlugin::new("crypt")))
        .expect("register encryption");
    registry
        .register_authentication(Box::new(TestAuthenticationPlugin::new("auth")))
        .expect("register authentication");

    let processor = RequestProcessor::new(
        SecretsDatabase::open_in_memory().expect("open database"),
        registry,
        Box::new(StaticIdentity::new().with_application(APP_A, "app-a")),
        DaemonKeys::for_testing(),
    );
    let mut service = SecretsService::new(
        processor,
        &DaemonConfig {
            test_mode: true,
            ..DaemonConfig::default()
        },
    );
    let events = service.take_crypto_events().expect("crypto events");
    (service, events)
}

fn create_collection(service: &mut SecretsService, name: &str) {
    let (tx, rx) = mpsc::channel::<Response>();
    service
        .create_device_lock_collection(
            APP_A,
            name,
            "store",
            "crypt",
            DeviceLockUnlockSemantic::KeepUnlocked,
            AccessControlMode::OwnerOnly,
            tx,
        )
        .expect("enqueue");
    service.drive();
    rx.try_recv().expect("reply").result.expect("create succeeds");
}

fn identifier(collection: &str, key: &str) -> KeyEntryIdentifier {
    KeyEntryIdentifier {
        key_name: key.to_string(),
        collection_name: collection.to_string(),
    }
}

#[test]
fn test_storage_plugin_names() {
    let (service, _events) = service();
    assert_eq!(service.storage_plugin_names(APP_A), vec!["store".to_string()]);
}

#[test]
fn test_key_entry_bookkeeping() {
    let (service, _events) = service();
    let ident = identifier("vault", "signing");

    assert!(service.key_entry(APP_A, &ident).expect("lookup").is_none());
    service
        .add_key_entry(APP_A, &ident, "softcrypto", "store")
        .expect("add");
    assert_eq!(
        service.key_entry(APP_A, &ident).expect("lookup"),
        Some(("softcrypto".to_string(), "store".to_string()))
    );
    assert_eq!(service.key_entry_identifiers(APP_A).expect("list"), vec![ident.clone()]);

    service.remove_key_entry(APP_A, &ident).expect("remove");
    assert!(service.key_entry(APP_A, &ident).expect("lookup").is_none());
    assert!(service.key_entry_identifiers(APP_A).expect("list").is_empty());
}

#[test]
fn test_store_and_retrieve_key_material() {
    let (mut service, events) = service();
    create_collection(&mut service, "vault");
    let ident = identifier("vault", "signing");

    service
        .store_key(APP_A, 71, &ident, b"serialised-key-material")
        .expect("accepted");
    service.drive();
    match events.try_recv().expect("completion") {
        CryptoHelperEvent::StoreKeyCompleted {
            crypto_request_id,
            result,
        } => {
            assert_eq!(crypto_request_id, 71);
            result.expect("store succeeds");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    service.stored_key(APP_A, 72, &ident).expect("accepted");
    service.drive();
    match events.try_recv().expect("completion") {
        CryptoHelperEvent::StoredKeyCompleted {
            crypto_request_id,
            result,
        } => {
            assert_eq!(crypto_request_id, 72);
            assert_eq!(result.expect("retrieve succeeds"), b"serialised-key-material");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn test_delete_stored_key() {
    let (mut service, events) = service();
    create_collection(&mut service, "vault");
    let ident = identifier("vault", "signing");

    service.store_key(APP_A, 1, &ident, b"material").expect("accepted");
    service.drive();
    events.try_recv().expect("store completion");

    service.delete_stored_key(APP_A, 2, &ident).expect("accepted");
    service.drive();
    match events.try_recv().expect("completion") {
        CryptoHelperEvent::DeleteStoredKeyCompleted {
            crypto_request_id,
            result,
        } => {
            assert_eq!(crypto_request_id, 2);
            result.expect("delete succeeds");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    service.stored_key(APP_A, 3, &ident).expect("accepted");
    service.drive();
    match events.try_recv().expect("completion") {
        CryptoHelperEvent::StoredKeyCompleted { result, .. } => match result {
            Err(Error::InvalidSecret(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        },
        other => panic!("unexpected event: {other:?}"),
    }
}

#[test]
fn test_store_key_into_missing_collection_fails() {
    let (mut service, events) = service();
    let ident = identifier("ghost", "signing");

    service.store_key(APP_A, 9, &ident, b"material").expect("accepted");
    service.drive();
    match events.try_recv().expect("completion") {
        CryptoHelperEvent::StoreKeyCompleted { result, .. } => match result {
            Err(Error::InvalidCollection(_)) => {}
            other => panic!("unexpected result: {other:?}"),
        },
        other => panic!("unexpected event: {other:?}"),
    }
}
