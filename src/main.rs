//! gamelink CLI - register for push notifications and listen for them.
//!
//! Thin wrapper over the library: `register` runs the registration
//! flows and writes the credentials blob, `listen` runs the push
//! session and prints notifications, `pair` links an account and
//! registers the push token with the companion API.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gamelink::push::register::{self, AndroidRegisterOptions};
use gamelink::push::{PushClient, PushConfig, PushEvent};
use gamelink::{auth, credentials, Credentials};

#[derive(Parser)]
#[command(name = "gamelink", version, about = "Companion push receiver and game RPC client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register for push delivery and write a credentials file.
    Register {
        /// Sender id to register under.
        #[arg(long)]
        sender: String,
        /// Use the Android-style registration path.
        #[arg(long)]
        android: bool,
        /// API key (Android path).
        #[arg(long = "api-key")]
        api_key: Option<String>,
        /// Project id (Android path).
        #[arg(long)]
        project: Option<String>,
        /// App id (Android path).
        #[arg(long = "app-id")]
        app_id: Option<String>,
        /// Package name (Android path).
        #[arg(long)]
        package: Option<String>,
        /// Package certificate fingerprint (Android path).
        #[arg(long)]
        cert: Option<String>,
        /// Where to write the credentials blob.
        #[arg(long, default_value = "credentials.json")]
        output: PathBuf,
    },
    /// Listen for push notifications and print them.
    Listen {
        /// Credentials file written by `register`.
        #[arg(long, default_value = "credentials.json")]
        credentials: PathBuf,
        /// Comma-separated persistent ids to replay, or a path to a JSON
        /// array file.
        #[arg(long = "persistent-ids")]
        persistent_ids: Option<String>,
    },
    /// Link an account and register the push token with the companion API.
    Pair {
        /// Credentials file written by `register`.
        #[arg(long, default_value = "credentials.json")]
        credentials: PathBuf,
        /// App id used for the push-token exchange.
        #[arg(long = "app-id")]
        app_id: String,
        /// Project id used for the push-token exchange.
        #[arg(long)]
        project: String,
    },
    /// Reserved.
    Send,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Register {
            sender,
            android,
            api_key,
            project,
            app_id,
            package,
            cert,
            output,
        } => {
            let http = reqwest::Client::new();
            let creds = if android {
                let (Some(api_key), Some(project), Some(app_id), Some(package), Some(cert)) =
                    (api_key, project, app_id, package, cert)
                else {
                    bail!("android registration requires: --api-key, --project, --sender, --app-id, --package, --cert");
                };
                println!("Registering (android path)...");
                register::register_android(
                    &http,
                    &AndroidRegisterOptions {
                        api_key,
                        project_id: project,
                        sender_id: sender,
                        app_id,
                        package_name: package,
                        package_cert: cert,
                    },
                )
                .await?
            } else {
                println!("Registering...");
                register::register(&http, &sender).await?
            };

            creds.save(&output)?;
            println!("Registration successful. Credentials saved to {}", output.display());
            println!("Token: {}", creds.fcm.token);
            println!("Android id: {}", creds.gcm.android_id);
            Ok(())
        }

        Command::Listen {
            credentials,
            persistent_ids,
        } => {
            let creds = Credentials::load(&credentials)?;
            let ids = load_ids(persistent_ids.as_deref())?;

            println!("Connecting to push relay...");
            let (client, mut events) = PushClient::connect(PushConfig {
                credentials: creds,
                persistent_ids: ids,
            })
            .await
            .context("failed to connect")?;

            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Some(PushEvent::Connected) => println!("Listening for notifications..."),
                        Some(PushEvent::Disconnected) => log::info!("disconnected, reconnecting"),
                        Some(PushEvent::Notification(notification)) => {
                            println!("{}", serde_json::to_string_pretty(&notification)?);
                        }
                        None => break,
                    },
                    _ = shutdown_signal() => {
                        println!("Shutting down...");
                        client.stop();
                        break;
                    }
                }
            }
            Ok(())
        }

        Command::Pair {
            credentials,
            app_id,
            project,
        } => {
            let creds = Credentials::load(&credentials)?;
            let http = reqwest::Client::new();

            let capture = auth::AuthCapture::bind_default().await?;
            println!("Open http://{} in your browser to link your account.", capture.addr());
            let auth_token = capture
                .wait_for_token(gamelink::constants::AUTH_CAPTURE_DEADLINE)
                .await?;
            println!("Auth token captured.");

            let push_token =
                register::expo_push_token(&http, &app_id, &project, &creds.fcm.token).await?;
            register::register_companion(&http, &auth_token, &push_token).await?;
            println!("Push token registered with the companion API.");
            println!("Auth token: {auth_token}");
            Ok(())
        }

        Command::Send => {
            println!("send is not implemented");
            Ok(())
        }
    }
}

/// Persistent ids come either as a comma-separated list or as a path to
/// a JSON array file.
fn load_ids(value: Option<&str>) -> Result<Vec<String>> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let path = PathBuf::from(value);
    if path.is_file() {
        return credentials::load_persistent_ids(&path);
    }
    Ok(value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
