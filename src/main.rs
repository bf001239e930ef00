//! feedkeeper: command-line admin for a Supabase-backed message board.
//!
//! # Usage
//!
//! ```bash
//! export SUPABASE_URL=https://xxxx.supabase.co SUPABASE_ANON_KEY=...
//! feedkeeper login admin@example.com --password '...'
//! feedkeeper messages
//! feedkeeper post "Maintenance tonight at 22:00"
//! feedkeeper watch
//!
//! # No backend needed
//! feedkeeper demo
//! ```

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use feedkeeper::feed::{parse_timestamp, Message, Profile, Role};
use feedkeeper::integrations::MemoryBackend;
use feedkeeper::{AdminApp, Config, SyncError};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feedkeeper")]
#[command(about = "Session and message-feed admin for a Supabase message board")]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// More logging; repeat for trace
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and keep the session for later commands
    Login {
        email: String,
        #[arg(long, env = "FEEDKEEPER_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Sign out and forget the stored session
    Logout,
    /// Show the signed-in identity, profile and role
    Whoami,
    /// Print the message feed, oldest first
    Messages,
    /// Print every profile
    Users,
    /// Post a message as the signed-in user
    Post { content: String },
    /// Replace a message's content
    Edit {
        id: String,
        content: String,
        /// Only edit if the message still has this `created_at`
        #[arg(long)]
        expect: Option<String>,
    },
    /// Delete a message
    Delete { id: String },
    /// Rename a user
    SetUsername { user_id: String, username: String },
    /// Change a user's avatar URL
    SetAvatar { user_id: String, url: String },
    /// Print the feed and reprint it on every change until Ctrl-C
    Watch,
    /// Run a scripted session against an in-memory backend
    Demo,
}

fn init_logging(verbose: u8, configured: Option<&str>) {
    let fallback = match verbose {
        0 => configured.unwrap_or("feedkeeper=info").to_string(),
        1 => "feedkeeper=debug".to_string(),
        _ => "feedkeeper=trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(cli.verbose, config.log.level.as_deref());

    if let Commands::Demo = cli.command {
        return demo(&config).await;
    }

    let app = AdminApp::from_config(&config).context("Invalid configuration")?;
    app.start().await;
    let result = run(&app, cli.command).await;
    app.shutdown();
    result
}

async fn run(app: &AdminApp, command: Commands) -> Result<()> {
    match command {
        Commands::Login { email, password } => {
            let state = app.session().login_detailed(&email, &password).await?;
            match &state.profile {
                Some(profile) => println!("Signed in as {} ({})", profile.username, profile.role),
                None => println!("Signed in as {email} (no profile; role unknown)"),
            }
        }
        Commands::Logout => {
            app.session().logout().await;
            println!("Signed out");
        }
        Commands::Whoami => {
            let state = app.session().state();
            match (&state.identity, &state.profile) {
                (None, _) => println!("Not signed in"),
                (Some(identity), profile) => {
                    println!("id:       {}", identity.id);
                    println!("email:    {}", identity.email.as_deref().unwrap_or("-"));
                    match profile {
                        Some(p) => {
                            println!("username: {}", p.username);
                            println!("role:     {}", p.role);
                        }
                        None => println!("profile:  missing"),
                    }
                }
            }
        }
        Commands::Messages => {
            ready_feed(app).await?;
            print_feed(&app.feed().messages());
        }
        Commands::Users => {
            ready_feed(app).await?;
            for profile in app.feed().profiles() {
                print_profile(&profile);
            }
        }
        Commands::Post { content } => {
            let author = ready_feed(app).await?;
            let message = app.feed().add_message(&content, &author).await?;
            println!("Posted {}", message.id);
        }
        Commands::Edit { id, content, expect } => {
            ready_feed(app).await?;
            let message = match expect {
                Some(raw) => {
                    let expected = parse_timestamp(&raw)
                        .map_err(|e| anyhow::anyhow!("Invalid --expect timestamp: {e}"))?;
                    app.feed().edit_message_checked(&id, &content, expected).await?
                }
                None => app.feed().edit_message(&id, &content).await?,
            };
            println!("Edited {} (now {})", message.id, message.created_at.to_rfc3339());
        }
        Commands::Delete { id } => {
            ready_feed(app).await?;
            app.feed().delete_message(&id).await?;
            println!("Deleted {id}");
        }
        Commands::SetUsername { user_id, username } => {
            ready_feed(app).await?;
            let profile = app.feed().edit_user_username(&user_id, &username).await?;
            print_profile(&profile);
        }
        Commands::SetAvatar { user_id, url } => {
            ready_feed(app).await?;
            let profile = app.feed().edit_user_avatar(&user_id, &url).await?;
            print_profile(&profile);
        }
        Commands::Watch => {
            ready_feed(app).await?;
            watch(app).await?;
        }
        Commands::Demo => bail!("demo runs against its own in-memory backend"),
    }
    Ok(())
}

/// Require a signed-in session and an active feed. Returns the user id.
async fn ready_feed(app: &AdminApp) -> Result<String> {
    let state = app.session().state();
    let Some(user_id) = state.user_id().map(str::to_string) else {
        return Err(SyncError::NotAuthenticated).context("Run `feedkeeper login` first");
    };
    app.sync_feed().await;
    Ok(user_id)
}

async fn watch(app: &AdminApp) -> Result<()> {
    let mut changes = app.feed().changes();
    print_feed(&app.feed().messages());
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                changes.borrow_and_update();
                if !app.feed().is_active() {
                    println!("-- session ended --");
                    break;
                }
                println!("--");
                print_feed(&app.feed().messages());
            }
        }
    }
    Ok(())
}

fn print_feed(messages: &[Message]) {
    if messages.is_empty() {
        println!("(no messages)");
    }
    for message in messages {
        println!(
            "{}  {:<16} {}  [{}]",
            message.created_at.format("%Y-%m-%d %H:%M:%S"),
            message.author_name(),
            message.content,
            message.id
        );
    }
}

fn print_profile(profile: &Profile) {
    let avatar = if profile.avatar_url.is_empty() { "-" } else { &profile.avatar_url };
    println!("{}  {:<16} {:<8} {}", profile.id, profile.username, profile.role.as_str(), avatar);
}

async fn demo(config: &Config) -> Result<()> {
    let backend = Arc::new(MemoryBackend::new());
    backend.seed_identity(
        "admin@example.com",
        "admin",
        Profile {
            id: "admin-1".into(),
            username: "admin".into(),
            avatar_url: String::new(),
            role: Role::Admin,
        },
    );
    backend.seed_identity(
        "kim@example.com",
        "kim",
        Profile {
            id: "user-1".into(),
            username: "kim".into(),
            avatar_url: String::new(),
            role: Role::StandardUser,
        },
    );
    backend.seed_message("user-1", "Is the board open this weekend?");

    let app = AdminApp::new(backend, config.feed.clone());
    app.start().await;

    if !app.session().login("admin@example.com", "admin").await {
        bail!("demo login failed");
    }
    app.sync_feed().await;
    println!("== signed in as admin");

    let feed = app.feed();
    let posted = feed.add_message("Yes, 10:00 to 16:00.", "admin-1").await?;
    feed.edit_message(&posted.id, "Yes, 10:00 to 17:00.").await?;
    feed.edit_user_username("user-1", "kim.j").await?;
    feed.edit_user_avatar("user-1", "https://example.com/kim.png").await?;
    if let Err(e) = feed.edit_user_avatar("user-1", "kim.png").await {
        println!("== rejected avatar: {e}");
    }
    print_feed(&feed.messages());

    feed.delete_message(&posted.id).await?;
    println!("== after delete");
    print_feed(&feed.messages());

    app.session().logout().await;
    app.sync_feed().await;
    println!("== signed out; feed active: {}", app.feed().is_active());
    app.shutdown();
    Ok(())
}
