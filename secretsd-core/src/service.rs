//! The public request router and drive loop.
//!
//! One [`SecretsService`] is constructed at process start and threaded
//! explicitly through the daemon loop; there is no ambient state. Client
//! transports call the per-method entry points, which package typed
//! arguments and hand them to the queue; [`SecretsService::drive`]
//! dispatches queued requests to the processor in enqueue order.

use std::collections::HashMap;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::DaemonConfig;
use crate::crypto_helpers::{CryptoHelperEvent, CryptoHelperKind};
use crate::database::SecretsDatabase;
use crate::error::{Error, SecretsResult};
use crate::identity::ProcessIdentity;
use crate::keys::DaemonKeys;
use crate::plugin::PluginRegistry;
use crate::processor::{HandlerOutcome, RequestProcessor};
use crate::queue::{QueuedRequest, ReplySink, RequestQueue, RequestStatus};
use crate::types::{
    AccessControlMode, CustomLockUnlockSemantic, DeviceLockUnlockSemantic, Pid, RequestArgs,
    RequestId, Response, ResponseBody, UserInteractionMode,
};

/// A client's reply channel.
pub type ReplySender = mpsc::Sender<Response>;

/// The daemon service: processor, queue, and crypto-helper plumbing.
pub struct SecretsService {
    pub(crate) processor: RequestProcessor,
    pub(crate) queue: RequestQueue,
    pub(crate) crypto_requests: HashMap<u64, CryptoHelperKind>,
    pub(crate) crypto_events: mpsc::Sender<CryptoHelperEvent>,
    crypto_events_rx: Option<mpsc::Receiver<CryptoHelperEvent>>,
    yield_window: Duration,
}

impl SecretsService {
    pub fn new(processor: RequestProcessor, config: &DaemonConfig) -> Self {
        let (crypto_events, crypto_events_rx) = mpsc::channel();
        Self {
            processor,
            queue: RequestQueue::new(config.request_id_space.unwrap_or(u64::MAX)),
            crypto_requests: HashMap::new(),
            crypto_events,
            crypto_events_rx: Some(crypto_events_rx),
            yield_window: Duration::from_millis(config.yield_window_ms),
        }
    }

    /// Opens the durable state named by `config` (metadata database and
    /// key files) and assembles the service around it.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or key material cannot be opened,
    /// or if no keys directory is configured outside test mode.
    pub fn open(
        config: &DaemonConfig,
        registry: PluginRegistry,
        identity: Box<dyn ProcessIdentity>,
    ) -> SecretsResult<Self> {
        let db = match &config.database_path {
            Some(path) => SecretsDatabase::open(path)?,
            None => SecretsDatabase::open_in_memory()?,
        };
        let keys = match &config.keys_dir {
            Some(dir) => DaemonKeys::load(dir)?,
            None if config.test_mode => DaemonKeys::for_testing(),
            None => {
                return Err(Error::Unknown(
                    "a keys directory is required outside test mode".to_string(),
                ))
            }
        };
        Ok(Self::new(
            RequestProcessor::new(db, registry, identity, keys),
            config,
        ))
    }

    /// Hands the crypto completion events receiver to the crypto
    /// subsystem. Yields `None` after the first call.
    pub fn take_crypto_events(&mut self) -> Option<mpsc::Receiver<CryptoHelperEvent>> {
        self.crypto_events_rx.take()
    }

    /// Startup sweep of quarantined master rows.
    pub fn sweep_quarantine(&mut self) {
        self.processor.sweep_quarantine();
    }

    /// Drops cached keys whose relock deadline has passed.
    pub fn purge_expired_locks(&mut self) {
        self.processor.purge_expired_locks();
    }

    /// Earliest pending relock deadline.
    pub fn next_lock_deadline(&self) -> Option<Instant> {
        self.processor.next_lock_deadline()
    }

    /// Handles a device-lock event.
    pub fn device_locked(&mut self) {
        self.processor.device_locked();
    }

    // ── Router entry points ─────────────────────────────────────────────

    fn enqueue(
        &mut self,
        caller_pid: Pid,
        args: RequestArgs,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.queue.enqueue(caller_pid, args, ReplySink::Client(reply))
    }

    /// Generic entry used by transports that already hold typed arguments.
    /// An enqueue failure is delivered on the reply channel immediately.
    pub fn submit(&mut self, caller_pid: Pid, args: RequestArgs, reply: ReplySender) {
        if let Err(err) = self.enqueue(caller_pid, args, reply.clone()) {
            let _ = reply.send(Response {
                request_id: 0,
                result: Err(err),
            });
        }
    }

    pub fn get_plugin_info(
        &mut self,
        caller_pid: Pid,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(caller_pid, RequestArgs::GetPluginInfo, reply)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_device_lock_collection(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::CreateDeviceLockCollection {
                collection_name: collection_name.to_string(),
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                unlock_semantic,
                access_control,
            },
            reply,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_custom_lock_collection(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::CreateCustomLockCollection {
                collection_name: collection_name.to_string(),
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                authentication_plugin: authentication_plugin.to_string(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    pub fn delete_collection(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        user_interaction: UserInteractionMode,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::DeleteCollection {
                collection_name: collection_name.to_string(),
                user_interaction,
            },
            reply,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_collection_secret(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
        secret: &[u8],
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::SetCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
                secret: secret.to_vec(),
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_standalone_device_lock_secret(
        &mut self,
        caller_pid: Pid,
        storage_plugin: &str,
        encryption_plugin: &str,
        secret_name: &str,
        secret: &[u8],
        unlock_semantic: DeviceLockUnlockSemantic,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::SetStandaloneDeviceLockSecret {
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                secret_name: secret_name.to_string(),
                secret: secret.to_vec(),
                unlock_semantic,
                access_control,
                user_interaction,
            },
            reply,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn set_standalone_custom_lock_secret(
        &mut self,
        caller_pid: Pid,
        storage_plugin: &str,
        encryption_plugin: &str,
        authentication_plugin: &str,
        secret_name: &str,
        secret: &[u8],
        unlock_semantic: CustomLockUnlockSemantic,
        custom_lock_timeout_ms: u64,
        access_control: AccessControlMode,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::SetStandaloneCustomLockSecret {
                storage_plugin: storage_plugin.to_string(),
                encryption_plugin: encryption_plugin.to_string(),
                authentication_plugin: authentication_plugin.to_string(),
                secret_name: secret_name.to_string(),
                secret: secret.to_vec(),
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    pub fn get_collection_secret(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::GetCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    pub fn get_standalone_secret(
        &mut self,
        caller_pid: Pid,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::GetStandaloneSecret {
                secret_name: secret_name.to_string(),
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    pub fn delete_collection_secret(
        &mut self,
        caller_pid: Pid,
        collection_name: &str,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        ui_service_address: &str,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::DeleteCollectionSecret {
                collection_name: collection_name.to_string(),
                secret_name: secret_name.to_string(),
                user_interaction,
                ui_service_address: ui_service_address.to_string(),
            },
            reply,
        )
    }

    pub fn delete_standalone_secret(
        &mut self,
        caller_pid: Pid,
        secret_name: &str,
        user_interaction: UserInteractionMode,
        reply: ReplySender,
    ) -> SecretsResult<RequestId> {
        self.enqueue(
            caller_pid,
            RequestArgs::DeleteStandaloneSecret {
                secret_name: secret_name.to_string(),
                user_interaction,
            },
            reply,
        )
    }

    // ── Completions ─────────────────────────────────────────────────────

    /// Delivers the outcome of an authentication flow for a parked
    /// request. The request transitions to finished; the next drive pass
    /// emits its reply.
    pub fn authentication_completed(
        &mut self,
        request_id: RequestId,
        result: SecretsResult<()>,
        authentication_key: Zeroizing<Vec<u8>>,
    ) {
        let outcome = self
            .processor
            .resume_authenticated(request_id, result, &authentication_key);
        self.queue.finish(request_id, outcome);
    }

    /// Marks a request finished with an externally produced outcome.
    pub fn request_finished(&mut self, request_id: RequestId, outcome: SecretsResult<ResponseBody>) {
        self.queue.finish(request_id, outcome);
    }

    // ── Drive loop ──────────────────────────────────────────────────────

    /// Processes queued requests in order. Returns `true` when the pass
    /// exceeded the yield window with work remaining, in which case the
    /// caller should reschedule another pass.
    pub fn drive(&mut self) -> bool {
        self.processor.purge_expired_locks();
        let started = Instant::now();
        debug!(queued = self.queue.len(), "driving request queue");
        let mut index = 0;
        while index < self.queue.len() {
            match self.queue.status_at(index) {
                Some(RequestStatus::Pending) => {
                    let Some((request_id, caller_pid, args)) = self.queue.start_at(index) else {
                        index += 1;
                        continue;
                    };
                    debug!(kind = %args.kind(), request_id, caller_pid, "handling request");
                    match self.dispatch(caller_pid, request_id, args) {
                        HandlerOutcome::Complete(outcome) => {
                            if let Some(request) = self.queue.remove_at(index) {
                                self.emit_reply(request, outcome);
                            }
                        }
                        HandlerOutcome::Pending => index += 1,
                    }
                }
                Some(RequestStatus::Finished) => {
                    if let Some(mut request) = self.queue.remove_at(index) {
                        let outcome = request.outcome.take().unwrap_or_else(|| {
                            Err(Error::Unknown(format!(
                                "unable to determine result of {} request",
                                request.kind
                            )))
                        });
                        self.emit_reply(request, outcome);
                    }
                }
                Some(RequestStatus::InProgress) => index += 1,
                None => break,
            }

            if started.elapsed() > self.yield_window && !self.queue.is_empty() {
                debug!(remaining = self.queue.len(), "yielding to event loop with requests still queued");
                return true;
            }
        }
        false
    }

    fn emit_reply(&mut self, request: QueuedRequest, outcome: SecretsResult<ResponseBody>) {
        match request.reply {
            ReplySink::Client(tx) => {
                if tx
                    .send(Response {
                        request_id: request.id,
                        result: outcome,
                    })
                    .is_err()
                {
                    warn!(request_id = request.id, "client went away before its reply was sent");
                }
            }
            ReplySink::CryptoHelper { crypto_request_id } => {
                self.asynchronous_crypto_request_completed(crypto_request_id, outcome);
            }
        }
    }

    fn dispatch(&mut self, caller_pid: Pid, request_id: RequestId, args: RequestArgs) -> HandlerOutcome {
        match args {
            RequestArgs::GetPluginInfo => {
                HandlerOutcome::Complete(Ok(ResponseBody::PluginInfo(self.processor.plugin_info())))
            }
            RequestArgs::CreateDeviceLockCollection {
                collection_name,
                storage_plugin,
                encryption_plugin,
                unlock_semantic,
                access_control,
            } => HandlerOutcome::done(self.processor.create_device_lock_collection(
                caller_pid,
                &collection_name,
                &storage_plugin,
                &encryption_plugin,
                unlock_semantic,
                access_control,
            )),
            RequestArgs::CreateCustomLockCollection {
                collection_name,
                storage_plugin,
                encryption_plugin,
                authentication_plugin,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                ui_service_address,
            } => self.processor.create_custom_lock_collection(
                caller_pid,
                request_id,
                &collection_name,
                &storage_plugin,
                &encryption_plugin,
                &authentication_plugin,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::DeleteCollection {
                collection_name,
                user_interaction,
            } => HandlerOutcome::done(self.processor.delete_collection(
                caller_pid,
                &collection_name,
                user_interaction,
            )),
            RequestArgs::SetCollectionSecret {
                collection_name,
                secret_name,
                secret,
                user_interaction,
                ui_service_address,
            } => self.processor.set_collection_secret(
                caller_pid,
                request_id,
                &collection_name,
                &secret_name,
                &secret,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::SetStandaloneDeviceLockSecret {
                storage_plugin,
                encryption_plugin,
                secret_name,
                secret,
                unlock_semantic,
                access_control,
                user_interaction,
            } => HandlerOutcome::done(self.processor.set_standalone_device_lock_secret(
                caller_pid,
                &storage_plugin,
                &encryption_plugin,
                &secret_name,
                &secret,
                unlock_semantic,
                access_control,
                user_interaction,
            )),
            RequestArgs::SetStandaloneCustomLockSecret {
                storage_plugin,
                encryption_plugin,
                authentication_plugin,
                secret_name,
                secret,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                ui_service_address,
            } => self.processor.set_standalone_custom_lock_secret(
                caller_pid,
                request_id,
                &storage_plugin,
                &encryption_plugin,
                &authentication_plugin,
                &secret_name,
                &secret,
                unlock_semantic,
                custom_lock_timeout_ms,
                access_control,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::GetCollectionSecret {
                collection_name,
                secret_name,
                user_interaction,
                ui_service_address,
            } => self.processor.get_collection_secret(
                caller_pid,
                request_id,
                &collection_name,
                &secret_name,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::GetStandaloneSecret {
                secret_name,
                user_interaction,
                ui_service_address,
            } => self.processor.get_standalone_secret(
                caller_pid,
                request_id,
                &secret_name,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::DeleteCollectionSecret {
                collection_name,
                secret_name,
                user_interaction,
                ui_service_address,
            } => self.processor.delete_collection_secret(
                caller_pid,
                request_id,
                &collection_name,
                &secret_name,
                user_interaction,
                &ui_service_address,
            ),
            RequestArgs::DeleteStandaloneSecret {
                secret_name,
                user_interaction,
            } => HandlerOutcome::done(self.processor.delete_standalone_secret(
                caller_pid,
                &secret_name,
                user_interaction,
            )),
        }
    }
}
