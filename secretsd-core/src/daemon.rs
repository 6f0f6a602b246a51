//! Single-threaded daemon event loop.
//!
//! All service state is owned by this loop; client transports and
//! authentication plugins communicate with it over channels. Blocking
//! work is not permitted on this thread — plugin calls are synchronous and
//! must complete promptly, and user-interaction steps suspend requests
//! instead of blocking.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::info;

use crate::plugin::AuthenticationCompleted;
use crate::service::{ReplySender, SecretsService};
use crate::types::{Pid, RequestArgs};

/// Commands the daemon loop accepts from transports.
#[derive(Debug)]
pub enum DaemonCommand {
    /// A client call with its reply channel.
    Call {
        caller_pid: Pid,
        args: RequestArgs,
        reply: ReplySender,
    },
    /// The device locked; relock entities with device-lock semantics.
    DeviceLocked,
    Shutdown,
}

/// Runs the daemon loop until shutdown.
///
/// `commands` carries client calls, `auth_events` carries completions from
/// authentication plugins (the receiving end of
/// [`AuthenticationSink::channel`](crate::plugin::AuthenticationSink::channel)).
pub async fn run(
    mut service: SecretsService,
    mut commands: mpsc::UnboundedReceiver<DaemonCommand>,
    mut auth_events: mpsc::UnboundedReceiver<AuthenticationCompleted>,
) {
    service.sweep_quarantine();
    info!("secrets daemon initialised, awaiting requests");

    loop {
        // Drain queued work, yielding between passes so channel intake
        // stays responsive during request bursts.
        while service.drive() {
            tokio::task::yield_now().await;
        }

        let deadline = service.next_lock_deadline();
        tokio::select! {
            command = commands.recv() => match command {
                None | Some(DaemonCommand::Shutdown) => {
                    info!("secrets daemon shutting down");
                    return;
                }
                Some(DaemonCommand::Call { caller_pid, args, reply }) => {
                    service.submit(caller_pid, args, reply);
                }
                Some(DaemonCommand::DeviceLocked) => service.device_locked(),
            },
            Some(completion) = auth_events.recv() => {
                service.authentication_completed(
                    completion.request_id,
                    completion.result,
                    completion.authentication_key,
                );
            },
            () = tokio::time::sleep_until(
                tokio::time::Instant::from_std(deadline.unwrap_or_else(Instant::now)),
            ), if deadline.is_some() => {
                service.purge_expired_locks();
            },
        }
    }
}
