use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use dashboard_session::api::AuthApi;
use dashboard_session::config::Timeouts;
use dashboard_session::guard::{RouteDecision, resolve_route};
use dashboard_session::storage::{FileStore, KeyValueStore};
use dashboard_session::transport::{ApiResponse, HttpTransport, Transport};
use dashboard_session::{
    AuthError, ClientConfig, ConfigError, Gateway, GatewayError, LoginRequest, RegisterRequest, Role,
    SessionStore, StorageError, TransportError,
};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Session-file key holding the transport's cookies between runs.
const COOKIES_KEY: &str = "cookies";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("unknown role `{0}`; expected admin or user")]
    UnknownRole(String),
    #[error("not signed in; run `dashboard login` first")]
    NotSignedIn,
    #[error("server returned HTTP {status}: {message}")]
    ServerError { status: u16, message: String },
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "dashboard", about = "Admin dashboard session CLI")]
struct Cli {
    #[arg(long, env = "DASHBOARD_API_BASE_URL", default_value = dashboard_session::config::DEFAULT_API_BASE_URL)]
    base_url: String,

    #[arg(long, env = "DASHBOARD_SESSION_FILE", default_value = dashboard_session::config::DEFAULT_SESSION_FILE)]
    session_file: PathBuf,

    #[arg(
        long,
        env = "DASHBOARD_REQUEST_TIMEOUT_SECS",
        default_value_t = dashboard_session::config::DEFAULT_REQUEST_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    request_timeout_secs: u64,

    #[arg(
        long,
        env = "DASHBOARD_CONNECT_TIMEOUT_SECS",
        default_value_t = dashboard_session::config::DEFAULT_CONNECT_TIMEOUT_SECS,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    connect_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sign in and persist the session.
    Login {
        username: String,
        #[arg(long, env = "DASHBOARD_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Create an account and persist the resulting session.
    Register(RegisterArgs),
    /// Exchange the refresh cookie for a new access token.
    Refresh,
    /// End the session and notify the server.
    Logout,
    /// Print the persisted session (without the token).
    Status,
    /// GET an API path through the authenticated gateway.
    Get { path: String },
    /// POST a JSON body through the authenticated gateway.
    Post {
        path: String,
        #[arg(long)]
        data: String,
    },
    /// Show what the route guard decides for a client route.
    Route { path: String },
}

#[derive(Args, Debug)]
struct RegisterArgs {
    username: String,
    #[arg(long, env = "DASHBOARD_PASSWORD", hide_env_values = true)]
    password: String,
    #[arg(long)]
    email: Option<String>,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long, default_value = "user")]
    role: String,
}

struct CliContext {
    gateway: Gateway,
    http: Arc<HttpTransport>,
    storage: Arc<FileStore>,
}

impl CliContext {
    fn session(&self) -> &SessionStore {
        self.gateway.session()
    }

    /// Keep the cookie jar alongside a live session; drop it once the
    /// session has ended.
    fn save_cookies(&self) -> Result<(), StorageError> {
        match self.http.cookie_header() {
            Some(cookies) if self.session().is_authenticated() => {
                self.storage.set_items(&[(COOKIES_KEY, cookies.as_str())])
            }
            _ => self.storage.remove_items(&[COOKIES_KEY]),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let timeouts = Timeouts {
        request: Duration::from_secs(cli.request_timeout_secs),
        connect: Duration::from_secs(cli.connect_timeout_secs),
    };
    let config = ClientConfig::new(&cli.base_url, timeouts, cli.session_file)?;
    let ctx = build_context(&config)?;

    let outcome = dispatch(&ctx, cli.command).await;
    ctx.save_cookies()?;
    outcome
}

async fn dispatch(ctx: &CliContext, command: Command) -> Result<(), CliError> {
    match command {
        Command::Login { username, password } => run_login(ctx, LoginRequest::new(username, password)).await,
        Command::Register(args) => run_register(ctx, args).await,
        Command::Refresh => run_refresh(ctx).await,
        Command::Logout => {
            ctx.session().logout_and_notify().await;
            println!("signed out");
            Ok(())
        }
        Command::Status => print_json(&serde_json::to_value(ctx.session().snapshot())?),
        Command::Get { path } => print_response(ctx.gateway.get(&path).await?),
        Command::Post { path, data } => {
            let body = serde_json::from_str::<Value>(&data)?;
            print_response(ctx.gateway.post_json(&path, body).await?)
        }
        Command::Route { path } => {
            run_route(ctx, &path);
            Ok(())
        }
    }
}

fn build_context(config: &ClientConfig) -> Result<CliContext, CliError> {
    let http = Arc::new(HttpTransport::new(config)?);
    let storage = Arc::new(FileStore::new(config.session_file.clone()));
    if let Some(cookies) = storage.get(COOKIES_KEY)? {
        http.restore_cookies(&cookies)?;
    }

    let transport: Arc<dyn Transport> = http.clone();
    let session = SessionStore::new(AuthApi::new(transport.clone()), storage.clone());
    let on_terminated = |redirect_to: &str| eprintln!("session expired; sign in again ({redirect_to})");
    let gateway = Gateway::new(transport, session, Arc::new(on_terminated));

    Ok(CliContext { gateway, http, storage })
}

async fn run_login(ctx: &CliContext, request: LoginRequest) -> Result<(), CliError> {
    let snapshot = ctx.session().login(request).await?;
    if let Some(user) = &snapshot.user {
        println!("signed in as {} ({})", user.username, user.role.as_str());
    }
    Ok(())
}

async fn run_register(ctx: &CliContext, args: RegisterArgs) -> Result<(), CliError> {
    let role = Role::parse(&args.role).ok_or_else(|| CliError::UnknownRole(args.role.clone()))?;
    let request = RegisterRequest {
        username: args.username,
        password: args.password,
        email: args.email,
        first_name: args.first_name,
        last_name: args.last_name,
        role,
    };
    let snapshot = ctx.session().register(request).await?;
    if let Some(user) = &snapshot.user {
        println!("registered and signed in as {}", user.username);
    }
    Ok(())
}

async fn run_refresh(ctx: &CliContext) -> Result<(), CliError> {
    if !ctx.session().is_authenticated() {
        return Err(CliError::NotSignedIn);
    }
    ctx.session().refresh().await?;
    println!("access token refreshed");
    Ok(())
}

fn run_route(ctx: &CliContext, path: &str) {
    match resolve_route(path, &ctx.session().snapshot()) {
        RouteDecision::Render => println!("render {path}"),
        RouteDecision::Loading => println!("loading"),
        RouteDecision::Redirect { to, from: Some(from) } => println!("redirect {to} (from {from})"),
        RouteDecision::Redirect { to, from: None } => println!("redirect {to}"),
    }
}

fn print_response(response: ApiResponse) -> Result<(), CliError> {
    if !response.is_success() {
        return Err(CliError::ServerError {
            status: response.status,
            message: response.error_message().unwrap_or_else(|| response.body.clone()),
        });
    }

    match response.json::<Value>() {
        Ok(value) => print_json(&value),
        Err(_) => {
            println!("{}", response.body);
            Ok(())
        }
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}
