//! CLI commands

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Subcommand, ValueEnum};
use serde_json::Value;
use sessionkeeper_core::auth::RegisterRequest;
use sessionkeeper_core::{
    ApiClient, AuthApi, ClientConfig, CredentialKey, CredentialStore, Database,
    RequestDescriptor, SqliteCredentialStore,
};
use tracing::info;

#[derive(Subcommand)]
pub enum Commands {
    #[command(flatten)]
    Session(SessionCommands),

    /// Inspect or change the client configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// Commands that run against the stored session.
#[derive(Subcommand)]
pub enum SessionCommands {
    /// Sign in and store the issued tokens
    Login {
        #[arg(long)]
        email: String,

        #[arg(long, env = "SESSIONKEEPER_PASSWORD", hide_env_values = true)]
        password: String,

        /// Push notification token registered with the session
        #[arg(long)]
        fcm_token: Option<String>,
    },

    /// End the session on this device
    Logout {
        /// Only clear local credentials, don't notify the server
        #[arg(long)]
        local: bool,
    },

    /// End the session on every device
    LogoutAll,

    /// Show the stored session
    Status,

    /// Send an authenticated request and print the response data
    Request {
        #[arg(short = 'X', long, value_enum, default_value = "get")]
        method: HttpMethod,

        /// Path relative to the base URL
        path: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Check whether an email address can still be registered
    CheckEmail { email: String },

    /// Send an email verification code
    SendCode { email: String },

    /// Confirm an email verification code
    VerifyCode { email: String, code: String },

    /// Create an account
    Register {
        #[arg(long)]
        email: String,

        #[arg(long, env = "SESSIONKEEPER_PASSWORD", hide_env_values = true)]
        password: String,

        #[arg(long)]
        name: String,

        #[arg(long)]
        phone: Option<String>,

        /// Token returned by `verify-code`
        #[arg(long)]
        verification_token: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Set the API base URL
    SetBaseUrl { url: String },

    /// Set the request timeout in seconds
    SetTimeout { secs: u64 },

    /// Restore the defaults
    Reset,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    fn descriptor(self, path: String) -> RequestDescriptor {
        match self {
            Self::Get => RequestDescriptor::get(path),
            Self::Post => RequestDescriptor::post(path),
            Self::Put => RequestDescriptor::put(path),
            Self::Patch => RequestDescriptor::patch(path),
            Self::Delete => RequestDescriptor::delete(path),
        }
    }
}

/// Everything a session command needs.
struct Session {
    store: Arc<SqliteCredentialStore>,
    api: AuthApi,
}

fn open_database(db_path: Option<PathBuf>) -> Result<(PathBuf, Database)> {
    let path = match db_path {
        Some(path) => path,
        None => Database::default_path()?,
    };
    let db = Database::open_at(path.clone())
        .with_context(|| format!("Failed to open database at {}", path.display()))?;
    db.migrate()?;
    Ok((path, db))
}

fn effective_config(db: &Database) -> ClientConfig {
    let mut config = ClientConfig::load(db);
    config.apply_env();
    config.validate();
    config
}

fn session_ended(redirect_to: &str) {
    eprintln!("Session ended. Sign in again with `sessionkeeper login` ({redirect_to}).");
}

fn open_session(db_path: Option<PathBuf>) -> Result<Session> {
    let (path, db) = open_database(db_path)?;
    let config = effective_config(&db);
    info!(base_url = %config.base_url, db = %path.display(), "Using configuration");

    let store = Arc::new(SqliteCredentialStore::new(Database::open_at(path)?));
    let client = ApiClient::builder()
        .config(config)
        .store(store.clone())
        .listener(Arc::new(session_ended))
        .build()?;

    Ok(Session {
        store,
        api: AuthApi::new(client),
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Commands {
    pub async fn execute(self, db_path: Option<PathBuf>) -> Result<()> {
        match self {
            Commands::Session(command) => command.execute(open_session(db_path)?).await,
            Commands::Config { command } => command.execute(db_path),
        }
    }
}

impl SessionCommands {
    async fn execute(self, session: Session) -> Result<()> {
        let api = &session.api;

        match self {
            SessionCommands::Login {
                email,
                password,
                fcm_token,
            } => {
                let tokens = api.login(&email, &password, fcm_token.as_deref()).await?;
                match tokens.user_info {
                    Some(user) => println!("Signed in as {} <{}>", user.name, user.email),
                    None => println!("Signed in as {email}"),
                }
            }
            SessionCommands::Logout { local } => {
                api.logout(!local).await?;
                println!("Signed out");
            }
            SessionCommands::LogoutAll => {
                api.logout_all().await?;
                println!("Signed out of all devices");
            }
            SessionCommands::Status => {
                let device_id = session.store.get(CredentialKey::DeviceId).await?;
                println!("Device:   {}", device_id.as_deref().unwrap_or("(not provisioned)"));

                if !api.is_authenticated().await? {
                    println!("Not signed in");
                    return Ok(());
                }
                match api.current_user().await? {
                    Some(user) => {
                        println!("User:     {} <{}> (id {})", user.name, user.email, user.id)
                    }
                    None => println!("User:     (profile not cached)"),
                }

                if let Some(at) = session.store.updated_at(CredentialKey::AccessToken)? {
                    let age = chrono::Utc::now().signed_duration_since(at);
                    println!(
                        "Token:    issued {} ({} min ago)",
                        at.format("%Y-%m-%d %H:%M:%S UTC"),
                        age.num_minutes()
                    );
                }
            }
            SessionCommands::Request { method, path, data } => {
                let mut request = method.descriptor(path);
                if let Some(data) = data {
                    let body: Value =
                        serde_json::from_str(&data).context("--data must be valid JSON")?;
                    request = request.json(&body)?;
                }
                let data: Value = api.client().send_json(request).await?;
                print_json(&data)?;
            }
            SessionCommands::CheckEmail { email } => {
                if api.check_email_availability(&email).await? {
                    println!("{email} is available");
                } else {
                    println!("{email} is already registered");
                }
            }
            SessionCommands::SendCode { email } => {
                api.send_verification_code(&email).await?;
                println!("Verification code sent to {email}");
            }
            SessionCommands::VerifyCode { email, code } => {
                let result = api.verify_email_code(&email, &code).await?;
                if result.verified {
                    println!("Verified. Token: {}", result.verification_token);
                } else {
                    println!("Verification failed");
                }
            }
            SessionCommands::Register {
                email,
                password,
                name,
                phone,
                verification_token,
            } => {
                let user_id = api
                    .register(&RegisterRequest {
                        email,
                        password,
                        name,
                        phone,
                        verification_token,
                    })
                    .await?;
                println!("Registered user {user_id}");
            }
        }

        Ok(())
    }
}

impl ConfigCommands {
    fn execute(self, db_path: Option<PathBuf>) -> Result<()> {
        let (_, db) = open_database(db_path)?;

        match self {
            ConfigCommands::Show => {
                print_json(&serde_json::to_value(effective_config(&db))?)?;
            }
            ConfigCommands::SetBaseUrl { url } => {
                let mut config = ClientConfig::load(&db);
                config.base_url = url;
                config.validate();
                config.save(&db)?;
                println!("Base URL set to {}", config.base_url);
            }
            ConfigCommands::SetTimeout { secs } => {
                let mut config = ClientConfig::load(&db);
                config.timeout_secs = secs;
                config.validate();
                config.save(&db)?;
                println!("Timeout set to {}s", config.timeout_secs);
            }
            ConfigCommands::Reset => {
                ClientConfig::default().save(&db)?;
                println!("Configuration reset");
            }
        }

        Ok(())
    }
}
