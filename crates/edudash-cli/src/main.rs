//! edudash - command-line client for the school dashboard API.
//!
//! Signs in, keeps the session alive, and prints JSON from any read endpoint.

use std::io::{self, Write};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edudash_core::auth::EndReason;
use edudash_core::{
    ApiError, CacheDomain, ClientConfig, DashboardClient, QueryParams, SessionEvent,
};

const USAGE: &str = "\
Usage: edudash <command>

Commands:
  login <email>             Sign in (password is prompted)
  logout                    Sign out and forget stored credentials
  whoami                    Show the signed-in user
  get <path> [key=value...] Fetch a read endpoint and print its JSON

Environment:
  EDUDASH_API_URL           API base URL (default http://127.0.0.1:8000/api)
  RUST_LOG                  Log filter (default warn)";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let config = ClientConfig::load()?;
    let client = DashboardClient::new(config)?;
    info!(command = %command, "edudash starting");

    match command.as_str() {
        "login" => {
            let email = args.get(1).context("login requires an email address")?;
            login(&client, email).await
        }
        "logout" => {
            client.logout();
            println!("Signed out.");
            Ok(())
        }
        "whoami" => whoami(&client).await,
        "get" => {
            let path = args.get(1).context("get requires an API path")?;
            get(&client, path, &args[2..]).await
        }
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
}

async fn login(client: &DashboardClient, email: &str) -> Result<()> {
    print!("Password for {}: ", email);
    io::stdout().flush()?;
    let password = rpassword::read_password().context("Failed to read password")?;

    let claims = client.login(email, &password).await?;
    println!(
        "Signed in as {} ({}), session valid for {} minutes.",
        claims.display_name,
        claims.role.display_name(),
        claims.minutes_until_expiry()
    );
    Ok(())
}

async fn whoami(client: &DashboardClient) -> Result<()> {
    let Some(claims) = client.claims() else {
        println!("Not signed in. Run `edudash login <email>`.");
        return Ok(());
    };
    println!("{} ({})", claims.display_name, claims.role.display_name());
    println!("User id: {}", claims.subject_id);
    if claims.is_expired() {
        println!("Access token expired; it will be renewed on the next request.");
    } else {
        println!("Access token expires in {} minutes.", claims.minutes_until_expiry());
    }

    let _renewal = client.spawn_passive_renewal();
    match client.refresh_profile().await {
        Ok(profile) => println!("{}", serde_json::to_string_pretty(&profile)?),
        Err(ApiError::SessionEnded) => println!("Session ended. Run `edudash login <email>`."),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn parse_params(pairs: &[String]) -> Result<QueryParams> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("Expected key=value, got '{}'", pair))
        })
        .collect()
}

async fn get(client: &DashboardClient, path: &str, pairs: &[String]) -> Result<()> {
    let params = parse_params(pairs)?;
    let domain = CacheDomain::for_path(path);
    let service = std::sync::Arc::new(client.domain::<Value>(domain));
    let _renewal = client.spawn_passive_renewal();

    let mut events = client.subscribe();
    let notice = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEvent::Ended(EndReason::RenewalFailed) = event {
                eprintln!("Your session has ended. Run `edudash login <email>` to sign in again.");
            }
        }
    });

    let endpoint = path.to_string();
    let controller = client.controller(move |params: QueryParams| {
        let service = std::sync::Arc::clone(&service);
        let endpoint = endpoint.clone();
        async move { service.read(&endpoint, &endpoint, &params).await }
    });
    controller.execute(params).await?;
    notice.abort();

    let state = controller.state();
    if let Some(error) = state.error {
        bail!(error);
    }
    match state.data {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => bail!("No data returned"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_drops_empty_values() {
        let args = vec!["class=10A".to_string(), "term=".to_string()];
        let params = parse_params(&args).unwrap();
        assert_eq!(params.get("class"), Some("10A"));
        assert_eq!(params.get("term"), None);
    }

    #[test]
    fn test_parse_params_rejects_bare_words() {
        let args = vec!["class".to_string()];
        assert!(parse_params(&args).is_err());
    }
}
