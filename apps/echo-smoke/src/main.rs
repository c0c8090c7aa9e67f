//! Headless driver that logs in, loads the timeline and prints realtime events.

mod config;
mod logging;

use std::{process::ExitCode, sync::Arc};

use config::SmokeConfig;
use echo_client::{EchoRuntimeHandle, spawn_runtime};
use echo_core::{BackendCommand, BackendEvent, LifecycleState};
use echo_platform::{OsKeyringSecretStore, TokenStore};
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Instant, sleep_until},
};
use tracing::{error, info, warn};
use uuid::Uuid;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };
    info!(server_url = %config.server_url, "starting echo-smoke");

    let store = TokenStore::new(Arc::new(OsKeyringSecretStore), config.keyring_service.clone());
    let runtime = spawn_runtime(store);

    match run(&runtime, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!(%message, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(runtime: &EchoRuntimeHandle, config: &SmokeConfig) -> Result<(), String> {
    let mut events = runtime.subscribe();

    send(
        runtime,
        BackendCommand::Init {
            server_url: config.server_url.clone(),
            config: Some(config.init_config.clone()),
        },
    )
    .await?;

    let auth = match &config.credentials {
        Some(credentials) if credentials.signup => BackendCommand::Signup {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        },
        Some(credentials) => BackendCommand::Login {
            username: credentials.username.clone(),
            password: credentials.password.clone(),
        },
        None => BackendCommand::RestoreSession,
    };
    send(runtime, auth).await?;

    loop {
        match events.recv().await {
            Ok(BackendEvent::AuthResult {
                success: true,
                user_id,
                ..
            }) => {
                info!(user_id = user_id.as_deref().unwrap_or("unknown"), "authenticated");
                break;
            }
            Ok(BackendEvent::AuthResult { error_code, .. }) => {
                return Err(format!(
                    "authentication failed: {}",
                    error_code.as_deref().unwrap_or("unknown")
                ));
            }
            Ok(BackendEvent::FatalError { code, message, .. }) => {
                return Err(format!("{code}: {message}"));
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
            Err(RecvError::Closed) => return Err("runtime stopped".to_owned()),
        }
    }

    send(runtime, BackendCommand::LoadTimeline).await?;
    send(runtime, BackendCommand::StartRealtime).await?;
    if let Some(content) = &config.post_content {
        send(
            runtime,
            BackendCommand::CreatePost {
                client_txn_id: Uuid::new_v4().to_string(),
                content: content.clone(),
                image_url: None,
            },
        )
        .await?;
    }

    let deadline = Instant::now() + config.duration;
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if print_event(&event) {
                        return Err("session expired".to_owned());
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event receiver lagged"),
                Err(RecvError::Closed) => return Err("runtime stopped".to_owned()),
            },
        }
    }

    send(runtime, BackendCommand::StopRealtime).await?;
    loop {
        match events.recv().await {
            Ok(BackendEvent::StateChanged {
                state: LifecycleState::Authenticated,
            }) => break,
            Ok(BackendEvent::FatalError { code, message, .. }) => {
                return Err(format!("{code}: {message}"));
            }
            Ok(_) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err("runtime stopped".to_owned()),
        }
    }
    info!("smoke run finished");
    Ok(())
}

async fn send(runtime: &EchoRuntimeHandle, command: BackendCommand) -> Result<(), String> {
    runtime.send(command).await.map_err(|err| err.to_string())
}

/// Log one runtime event. Returns `true` once the session is gone.
fn print_event(event: &BackendEvent) -> bool {
    match event {
        BackendEvent::TimelineUpdated(snapshot) => info!(
            posts = snapshot.posts.len(),
            reactions = snapshot.user_reactions.len(),
            error = snapshot.error_code.as_deref().unwrap_or("none"),
            "timeline updated"
        ),
        BackendEvent::ReactionReceived(reaction) => info!(
            post_id = %reaction.post_id,
            reaction = reaction.reaction_type.as_str(),
            "reaction received"
        ),
        BackendEvent::AvatarExpression { reaction } => {
            info!(reaction = reaction.as_str(), "avatar expression")
        }
        BackendEvent::RealtimeStatus(status) => {
            info!(channel = %status.channel, state = ?status.state, "realtime status")
        }
        BackendEvent::PostAck(ack) => info!(
            client_txn_id = %ack.client_txn_id,
            success = ack.success,
            error = ack.error_code.as_deref().unwrap_or("none"),
            "post acknowledged"
        ),
        BackendEvent::FatalError {
            code,
            message,
            recoverable,
        } => warn!(%code, %message, recoverable, "runtime error"),
        BackendEvent::SessionExpired => {
            warn!("session expired");
            return true;
        }
        other => info!(event = ?other, "event"),
    }
    false
}
