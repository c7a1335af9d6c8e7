//! Authentication, authorization and session layer for the inventory portal.
//!
//! Signs the user in through Entra ID, checks them against the SharePoint
//! allow-list and exposes the resulting [`Session`] and its capabilities.

pub mod config;
pub mod directory;
pub mod entra;
pub mod error;
pub mod graph;
pub mod interaction;
pub mod manager;
pub mod notify;
pub mod provider;
pub mod session;
pub mod token;
pub mod validator;

#[cfg(test)]
mod test_support;

pub use config::{AuthConfig, SessionTimeouts};
pub use directory::{ArcDirectory, Directory};
pub use entra::{DeviceCodePrompt, EntraIdentityProvider, PromptHandler};
pub use error::{AuthError, AuthErrorKind, AuthResult, ConfigError};
pub use graph::GraphDirectory;
pub use interaction::{InteractionGuard, InteractionSerializer, InteractionState};
pub use manager::SessionManager;
pub use notify::{ArcNotifier, Notifier, NotifyOptions, TracingNotifier};
pub use provider::{AccessToken, Account, ArcIdentityProvider, IdentityProvider, LoginResult};
pub use session::{
    AuthorizationFailure, FailureReason, FailureStage, Session, SessionStore, Ticket,
};
pub use token::TokenAcquirer;
pub use validator::{Authorization, AuthorizationValidator};
