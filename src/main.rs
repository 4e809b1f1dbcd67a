//! Issue Sync - CLI
//!
//! Drives a sync session against an issue-tracker server: lists, optimistic
//! edits and a live `watch` view fed by the push channel.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use issue_sync::auth::{AuthClient, SessionToken, StaticToken, TokenProvider};
use issue_sync::events::SyncEvent;
use issue_sync::models::{
    EntityKind, IssueFilters, IssuePatch, IssuePriority, IssueStatus, NewIssue, ViewKey,
};
use issue_sync::query::{FetchOutcome, ViewSnapshot};
use issue_sync::{Config, SyncHandle, SyncSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "issue-sync")]
#[command(about = "Issue tracker sync client")]
struct Cli {
    /// Path to the YAML config file (default: issue-sync.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all projects
    Projects,

    /// Create a project
    CreateProject {
        /// Project name
        name: String,
    },

    /// Rename a project
    RenameProject {
        /// Project ID
        id: i64,

        /// New name
        name: String,
    },

    /// Delete a project
    DeleteProject {
        /// Project ID
        id: i64,
    },

    /// List issues of a project
    Issues {
        /// Project ID
        #[arg(long)]
        project: i64,

        /// Filter by status (OPEN, IN_PROGRESS, CLOSED)
        #[arg(long)]
        status: Option<String>,

        /// Filter by priority (LOW, MEDIUM, HIGH, CRITICAL)
        #[arg(long)]
        priority: Option<String>,

        /// Full-text search
        #[arg(long)]
        search: Option<String>,

        /// Page index, starting at 0
        #[arg(long, default_value = "0")]
        page: u32,

        /// Page size (default from config)
        #[arg(long)]
        size: Option<u32>,
    },

    /// Create an issue
    CreateIssue {
        /// Project ID
        #[arg(long)]
        project: i64,

        /// Issue title
        #[arg(short, long)]
        title: String,

        /// Issue description
        #[arg(short, long, default_value = "")]
        desc: String,

        /// Priority (LOW, MEDIUM, HIGH, CRITICAL)
        #[arg(short, long, default_value = "MEDIUM")]
        priority: String,
    },

    /// Update an issue
    UpdateIssue {
        /// Issue ID
        id: i64,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        desc: Option<String>,

        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        priority: Option<String>,
    },

    /// Delete an issue
    DeleteIssue {
        /// Issue ID
        id: i64,
    },

    /// Log in and print a bearer token for ISSUE_SYNC_TOKEN
    Login {
        #[arg(long)]
        email: String,

        #[arg(long, env = "ISSUE_SYNC_PASSWORD")]
        password: String,
    },

    /// Follow a project's issue list until Ctrl-C
    Watch {
        /// Project ID
        #[arg(long)]
        project: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = Config::from_yaml_and_env(cli.config.as_deref())?;

    let tokens: Arc<dyn TokenProvider> = match &config.token {
        Some(token) => Arc::new(StaticToken::new(token.clone())),
        None => Arc::new(StaticToken::none()),
    };
    let session = SyncSession::from_config(&config, tokens).context("Failed to start session")?;
    let handle = session.handle();

    let result = run(&config, &session, &handle, cli.command).await;
    session.shutdown().await;
    result
}

fn init_tracing(json: bool) {
    // Logs go to stderr so command output stays clean
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,issue_sync=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(
    config: &Config,
    session: &SyncSession,
    handle: &SyncHandle,
    command: Commands,
) -> Result<()> {
    match command {
        Commands::Projects => {
            let view = ViewKey::projects();
            expect_applied(handle.open_view(view, None).await?.settled().await)?;
            print_projects(&snapshot(handle, view).await?);
        }

        Commands::CreateProject { name } => {
            let ticket = handle.create_project(name).await?;
            let id = ticket.settled().await?;
            println!("Created project: {}", id);
        }

        Commands::RenameProject { id, name } => {
            load(handle, EntityKind::Project, id).await?;
            handle.rename_project(id, name).await?.settled().await?;
            println!("Renamed project {}", id);
        }

        Commands::DeleteProject { id } => {
            load(handle, EntityKind::Project, id).await?;
            handle
                .submit_delete(EntityKind::Project, id)
                .await?
                .settled()
                .await?;
            println!("Deleted project {}", id);
        }

        Commands::Issues {
            project,
            status,
            priority,
            search,
            page,
            size,
        } => {
            let view = ViewKey::issues_of(project);
            let mut params = config.view_defaults();
            params.filters = IssueFilters {
                status: status.as_deref().map(str::parse::<IssueStatus>).transpose()?,
                priority: priority
                    .as_deref()
                    .map(str::parse::<IssuePriority>)
                    .transpose()?,
                search_text: search,
            };
            params.page = page;
            if let Some(size) = size {
                params.size = size;
            }
            expect_applied(handle.open_view(view, Some(params)).await?.settled().await)?;
            print_issues(&snapshot(handle, view).await?);
        }

        Commands::CreateIssue {
            project,
            title,
            desc,
            priority,
        } => {
            let new = NewIssue::new(project, title)
                .with_description(desc)
                .with_priority(priority.parse()?);
            let id = handle.create_issue(new).await?.settled().await?;
            println!("Created issue: {}", id);
        }

        Commands::UpdateIssue {
            id,
            title,
            desc,
            status,
            priority,
        } => {
            let patch = IssuePatch {
                title,
                description: desc,
                status: status.as_deref().map(str::parse::<IssueStatus>).transpose()?,
                priority: priority.as_deref().map(str::parse::<IssuePriority>).transpose()?,
                ..Default::default()
            };
            if patch == IssuePatch::default() {
                bail!("Nothing to update: pass at least one of --title, --desc, --status, --priority");
            }
            load(handle, EntityKind::Issue, id).await?;
            handle.update_issue(id, patch).await?.settled().await?;
            println!("Updated issue {}", id);
        }

        Commands::DeleteIssue { id } => {
            load(handle, EntityKind::Issue, id).await?;
            handle
                .submit_delete(EntityKind::Issue, id)
                .await?
                .settled()
                .await?;
            println!("Deleted issue {}", id);
        }

        Commands::Watch { project } => watch(session, handle, project).await?,

        Commands::Login { email, password } => login(config, &email, &password).await?,
    }
    Ok(())
}

async fn login(config: &Config, email: &str, password: &str) -> Result<()> {
    let session = Arc::new(SessionToken::new());
    let client = AuthClient::new(config.api_url.clone(), config.request_timeout(), session)?;
    let response = client.login(email, password).await?;
    println!("Logged in as {} <{}>", response.name, response.email);
    println!("export ISSUE_SYNC_TOKEN={}", response.token);
    Ok(())
}

async fn watch(session: &SyncSession, handle: &SyncHandle, project: i64) -> Result<()> {
    let view = ViewKey::issues_of(project);
    let mut events = handle.subscribe();
    expect_applied(handle.open_view(view, None).await?.settled().await)?;
    print_issues(&snapshot(handle, view).await?);
    if session.push_state().is_none() {
        println!("(no push source configured; the list will not update)");
    }

    loop {
        let event = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => event,
        };
        let redraw = match event {
            Ok(SyncEvent::ViewUpdated { view: updated, .. }) => updated == view,
            Ok(SyncEvent::ChannelStateChanged(state)) => {
                match state.check() {
                    Ok(()) => println!("-- push channel: {:?}", state),
                    Err(e) => println!("-- {}; the list may be stale until it reconnects", e),
                }
                false
            }
            Ok(SyncEvent::FetchFailed { error, .. }) => {
                println!("-- refresh failed: {}", error);
                false
            }
            Ok(_) => false,
            Err(RecvError::Lagged(_)) => true,
            Err(RecvError::Closed) => break,
        };
        if redraw {
            print_issues(&snapshot(handle, view).await?);
        }
    }
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

/// Fetch one entity into the session so it can be edited
async fn load(handle: &SyncHandle, kind: EntityKind, id: i64) -> Result<()> {
    let fetch = handle.watch(kind, id).await?;
    expect_applied(fetch.settled().await)
}

fn expect_applied(outcome: FetchOutcome) -> Result<()> {
    match outcome {
        FetchOutcome::Applied => Ok(()),
        FetchOutcome::Failed(e) => Err(e.into()),
        FetchOutcome::Removed => bail!("Not found"),
        other => bail!("Fetch did not complete: {:?}", other),
    }
}

async fn snapshot(handle: &SyncHandle, view: ViewKey) -> Result<ViewSnapshot> {
    handle
        .view(view)
        .await?
        .with_context(|| format!("View {} is not open", view))
}

fn print_projects(snapshot: &ViewSnapshot) {
    println!("{:<8} {:<20} {}", "ID", "OWNER", "NAME");
    println!("{}", "-".repeat(80));
    for project in snapshot.entities.iter().filter_map(|e| e.as_project()) {
        println!(
            "{:<8} {:<20} {}",
            project.id.to_string(),
            project.owner_name.as_deref().unwrap_or("-"),
            project.name
        );
    }
}

fn print_issues(snapshot: &ViewSnapshot) {
    println!("{:<8} {:<12} {:<9} {}", "ID", "STATUS", "PRIORITY", "TITLE");
    println!("{}", "-".repeat(80));
    for issue in snapshot.entities.iter().filter_map(|e| e.as_issue()) {
        println!(
            "{:<8} {:<12} {:<9} {}",
            issue.id.to_string(),
            format!("{:?}", issue.status),
            format!("{:?}", issue.priority),
            issue.title
        );
    }
    let pagination = snapshot.pagination;
    println!(
        "Page {}/{} ({} issues)",
        pagination.page + 1,
        pagination.total_pages.max(1),
        pagination.total_elements
    );
}
