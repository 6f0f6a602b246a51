//! Integration tests of the daemon event loop: command intake, plugin
//! info replies, and parked authentication flows resolved over the
//! authentication channel.

use std::time::Duration;

use secretsd_core::{
    AccessControlMode, AuthenticationSink, CustomLockUnlockSemantic, DaemonCommand, DaemonConfig,
    PluginRegistry, RequestArgs, SecretsService, StaticIdentity, UserInteractionMode,
};
use secretsd_plugins::{
    MemoryEncryptedStoragePlugin, MemoryEncryptionPlugin, MemoryStoragePlugin,
    PassphraseAuthPlugin,
};
use tokio::sync::mpsc;

fn test_service(sink: AuthenticationSink) -> SecretsService {
    let mut registry = PluginRegistry::new(true);
    registry
        .register_storage(Box::new(MemoryStoragePlugin::new("store")))
        .expect("register storage");
    registry
        .register_encryption(Box::new(MemoryEncryptionPlugin::new("crypt")))
        .expect("register encryption");
    registry
        .register_encrypted_storage(Box::new(MemoryEncryptedStoragePlugin::new("enc")))
        .expect("register encrypted storage");
    registry
        .register_authentication(Box::new(PassphraseAuthPlugin::new(
            "dialog", sink, b"hunter2", true,
        )))
        .expect("register authentication");
    SecretsService::open(
        &DaemonConfig {
            test_mode: true,
            ..DaemonConfig::default()
        },
        registry,
        Box::new(StaticIdentity::new().with_application(1, "app-a")),
    )
    .expect("open service")
}

#[tokio::test]
async fn test_daemon_answers_calls_and_shuts_down() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (sink, auth_rx) = AuthenticationSink::channel();
            let service = test_service(sink);
            let daemon = tokio::task::spawn_local(secretsd_core::daemon::run(
                service, command_rx, auth_rx,
            ));

            let (reply_tx, reply_rx) = std::sync::mpsc::channel();
            command_tx
                .send(DaemonCommand::Call {
                    caller_pid: 1,
                    args: RequestArgs::GetPluginInfo,
                    reply: reply_tx,
                })
                .expect("send");
            let handle = tokio::task::spawn_blocking(move || {
                reply_rx.recv_timeout(Duration::from_secs(5))
            });
            let response = handle.await.expect("join").expect("reply delivered");
            response.result.expect("plugin info");

            command_tx.send(DaemonCommand::Shutdown).expect("send");
            daemon.await.expect("daemon exits");
        })
        .await;
}

#[tokio::test]
async fn test_daemon_resolves_parked_authentication_via_channel() {
    let local = tokio::task::LocalSet::new();
    local
        .run_until(async {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let (sink, auth_rx) = AuthenticationSink::channel();
            let service = test_service(sink);
            let daemon = tokio::task::spawn_local(secretsd_core::daemon::run(
                service, command_rx, auth_rx,
            ));

            // The create parks on authentication; the passphrase
            // plugin resolves it over the auth channel, and the daemon
            // loop finishes the request without further prompting.
            let (reply_tx, reply_rx) = std::sync::mpsc::channel();
            command_tx
                .send(DaemonCommand::Call {
                    caller_pid: 1,
                    args: RequestArgs::CreateCustomLockCollection {
                        collection_name: "vault".to_string(),
                        storage_plugin: "enc".to_string(),
                        encryption_plugin: "enc".to_string(),
                        authentication_plugin: "dialog".to_string(),
                        unlock_semantic: CustomLockUnlockSemantic::KeepUnlocked,
                        custom_lock_timeout_ms: 0,
                        access_control: AccessControlMode::OwnerOnly,
                        user_interaction: UserInteractionMode::System,
                        ui_service_address: String::new(),
                    },
                    reply: reply_tx,
                })
                .expect("send");
            let handle = tokio::task::spawn_blocking(move || {
                reply_rx.recv_timeout(Duration::from_secs(5))
            });
            let response = handle.await.expect("join").expect("reply delivered");
            response.result.expect("collection created");

            command_tx.send(DaemonCommand::Shutdown).expect("send");
            daemon.await.expect("daemon exits");
        })
        .await;
}
