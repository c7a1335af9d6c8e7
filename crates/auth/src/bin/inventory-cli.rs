use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use inventory_auth::{
    AuthConfig, DeviceCodePrompt, EntraIdentityProvider, GraphDirectory, Session,
    SessionManager, SessionTimeouts, TracingNotifier,
};
use shared_types::{CapabilitySet, Role};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "inventory-cli")]
#[command(about = "Sign in to the inventory portal and inspect access")]
#[command(
    long_about = "A command-line interface for the inventory portal's authentication layer.\n\n\
    Signs in through Microsoft Entra ID using a device code, checks the account\n\
    against the SharePoint allow-list and prints the resulting role and capabilities."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and print the session
    ///
    /// Uses the cached sign-in when one exists, otherwise prompts for a
    /// device code sign-in, then validates the account against the allow-list.
    Session,

    /// Print the capabilities granted to a role
    Capabilities {
        /// Role to resolve (admin, user, readonly). Omit for an unauthorized session.
        #[arg(short, long, value_name = "ROLE")]
        role: Option<String>,
    },

    /// Check whether another email is on the allow-list
    ///
    /// Signs in first, since the allow-list is only readable with a token.
    Check {
        /// Email address to look up.
        email: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Capabilities { role } => {
            let role = match role {
                Some(name) => Some(name.parse::<Role>()?),
                None => None,
            };
            print_capabilities(&CapabilitySet::for_role(role));
        }
        Commands::Session => {
            let manager = build_manager()?;
            let session = sign_in(&manager).await;
            print_session(&session);
        }
        Commands::Check { email } => {
            let manager = build_manager()?;
            let session = sign_in(&manager).await;
            if !session.is_authorized() {
                print_session(&session);
                anyhow::bail!("Sign-in did not produce an authorized session");
            }

            let token = manager.access_token().await?;
            let outcome = manager
                .validator()
                .validate(&token, &email, &CancellationToken::new())
                .await?;

            match outcome.role {
                Some(role) if outcome.authorized => {
                    println!("✓ {} is authorized as {}", email, role)
                }
                _ => println!("✗ {} is not on the allow-list", email),
            }
        }
    }

    Ok(())
}

fn build_manager() -> anyhow::Result<SessionManager> {
    let config = AuthConfig::from_env().context("Failed to load auth configuration")?;
    let timeouts = SessionTimeouts::from_env();

    let prompt = Arc::new(|prompt: &DeviceCodePrompt| {
        if prompt.message.is_empty() {
            println!(
                "To sign in, open {} and enter the code {}",
                prompt.verification_uri, prompt.user_code
            );
        } else {
            println!("{}", prompt.message);
        }
    });

    let scopes = config.scopes.clone();
    let directory = Arc::new(GraphDirectory::new(&config));
    let provider = Arc::new(EntraIdentityProvider::new(config, prompt));

    Ok(SessionManager::new(
        provider,
        directory,
        Arc::new(TracingNotifier),
        scopes,
        timeouts,
    ))
}

/// Use an existing sign-in if there is one, otherwise sign in interactively.
async fn sign_in(manager: &SessionManager) -> Session {
    let session = manager.initialize().await;
    if session.is_authorized() || session.user().is_some() {
        return session;
    }
    manager.sign_in().await
}

fn print_session(session: &Session) {
    println!("Status: {}", session.status().as_str());
    if let Some(user) = session.user() {
        println!("User:   {} <{}>", user.display_name, user.email);
    }
    if let Some(role) = session.role() {
        println!("Role:   {}", role);
    }
    if let Some(failure) = session.authorization_error() {
        println!("Reason: {}", failure.message);
        if failure.retry_available() {
            println!("        Run the command again to retry.");
        }
    }
    println!();
    print_capabilities(&session.capabilities());
}

fn print_capabilities(capabilities: &CapabilitySet) {
    for (name, granted) in capabilities.flags() {
        let mark = if granted { "✓" } else { "✗" };
        println!("{} {}", mark, name);
    }
}
