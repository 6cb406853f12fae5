//! Scene Studio CLI - inspect and edit content from the terminal
//!
//! The signed-in account is remembered in the local store between runs.
//! With the default `mem://` cloud endpoint the cloud tier only lives for
//! one invocation; point `SCENE_STUDIO_CLOUD_ENDPOINT` at a server to keep it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::{style, Emoji};

use scene_studio::{
    resolve_position_id, resolve_scene_id, AuthState, ContentSync, ItemType, StudioConfig,
    SyncStatus,
};

static CHECK: Emoji<'_, '_> = Emoji("✓ ", "+ ");
static CROSS: Emoji<'_, '_> = Emoji("✗ ", "x ");
static ARROW: Emoji<'_, '_> = Emoji("→ ", "-> ");
static STAR: Emoji<'_, '_> = Emoji("★ ", "* ");

const SESSION_KEY: &str = "session.owner";

#[derive(Parser)]
#[command(name = "scene-cli")]
#[command(version)]
#[command(about = "Scene Studio CLI - scenes, positions and favorites across devices")]
#[command(long_about = r#"
Scene Studio CLI works on the same content as the app: bundled default
scenes and positions, your own custom ones, and your favorites.

Signed out, everything is stored on this device. Signing in moves local
custom content into your account and seeds the default scenes once.

Examples:
  scene-cli list                       # Scenes, positions and favorites
  scene-cli add-scene "Foo" -c "Bar"   # New custom scene
  scene-cli favorite asset_3           # Toggle a scene favorite
  scene-cli sign-in alice              # Switch to the cloud tier
  scene-cli export -o snapshot.json    # Write an export snapshot
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List content of the authoritative tier
    List {
        /// Only scenes
        #[arg(long)]
        scenes: bool,

        /// Only positions
        #[arg(long)]
        positions: bool,
    },

    /// Create a custom scene
    AddScene {
        title: String,

        #[arg(short, long, default_value = "")]
        content: String,
    },

    /// Edit a custom scene
    EditScene {
        /// Stable id as shown by `list`
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        content: Option<String>,
    },

    /// Delete a custom scene
    DeleteScene { id: String },

    /// Create a custom position from an image path or URL
    AddPosition { name: String, image: String },

    /// Toggle a favorite
    Favorite {
        id: String,

        /// The id refers to a position
        #[arg(short, long)]
        position: bool,
    },

    /// Sign in and reconcile local content into the account
    SignIn { owner_id: String },

    /// Sign out; cloud content stays in the account
    SignOut,

    /// Retry pending migrations and seeding
    Reload,

    /// Show sync status
    Status,

    /// Export custom content and favorites as JSON
    Export {
        /// Output file (defaults to the configured export directory)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove local custom content and favorites
    Reset,

    /// Show the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StudioConfig::load_from(path)?.with_env_overrides(),
        None => StudioConfig::load(),
    };
    let filter = if cli.verbose {
        "debug"
    } else {
        config.log_level.as_filter()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let sync = ContentSync::open(&config)
        .await
        .context("Failed to open content stores")?;

    if let Some(owner_id) = sync.local().get_value(SESSION_KEY) {
        report_transition(&sync, AuthState::SignedIn { owner_id }).await;
    }

    match cli.command {
        Commands::List { scenes, positions } => {
            let all = !scenes && !positions;
            if all || scenes {
                list_scenes(&sync);
            }
            if all || positions {
                list_positions(&sync);
            }
        }

        Commands::AddScene { title, content } => {
            let scene = sync.scenes().add_scene(&title, &content).await?;
            println!("{}Added scene {}", CHECK, style(resolve_scene_id(&scene)).cyan());
        }

        Commands::EditScene { id, title, content } => {
            let mut scene = sync
                .scenes()
                .find(&id)
                .with_context(|| format!("No scene with id {}", id))?;
            if let Some(title) = title {
                scene.title = title;
            }
            if let Some(content) = content {
                scene.content = content;
            }
            sync.scenes().update_scene(&scene).await?;
            println!("{}Updated scene {}", CHECK, style(&id).cyan());
        }

        Commands::DeleteScene { id } => {
            sync.scenes().delete_scene(&id).await?;
            println!("{}Deleted scene {}", CHECK, style(&id).cyan());
        }

        Commands::AddPosition { name, image } => {
            let position = sync.positions().add_position(&name, &image).await?;
            println!(
                "{}Added position {}",
                CHECK,
                style(resolve_position_id(&position)).cyan()
            );
        }

        Commands::Favorite { id, position } => {
            let item_type = if position {
                ItemType::Position
            } else {
                ItemType::Scene
            };
            let now = sync.toggle_favorite(&id, item_type).await?;
            if now {
                println!("{}{} is now a favorite", STAR, style(&id).cyan());
            } else {
                println!("{}{} is no longer a favorite", ARROW, style(&id).cyan());
            }
        }

        Commands::SignIn { owner_id } => {
            let owner_id = owner_id.trim().to_string();
            if report_transition(&sync, AuthState::SignedIn {
                owner_id: owner_id.clone(),
            })
            .await
            {
                sync.local().set_value(SESSION_KEY, &owner_id)?;
                println!("{}Signed in as {}", CHECK, style(&owner_id).green().bold());
            }
        }

        Commands::SignOut => {
            sync.apply(AuthState::SignedOut).await?;
            sync.local().remove_value(SESSION_KEY)?;
            println!("{}Signed out", CHECK);
        }

        Commands::Reload => {
            sync.reload().await?;
            println!("{}Reloaded", CHECK);
        }

        Commands::Status => {
            for status in sync.status() {
                print_status(&status);
            }
        }

        Commands::Export { output } => {
            let path = output.unwrap_or_else(|| {
                config.export.output_dir.join(format!(
                    "scene-export-{}.json",
                    chrono::Utc::now().format("%Y%m%d-%H%M%S")
                ))
            });
            let snapshot = sync.export_to(&path).await?;
            println!(
                "{}Exported {} scenes and {} positions to {}",
                CHECK,
                snapshot.scenes.len(),
                snapshot.positions.len(),
                style(path.display()).dim()
            );
        }

        Commands::Reset => {
            sync.reset_to_defaults()?;
            println!("{}Local content reset to defaults", CHECK);
        }

        Commands::Config { save } => {
            print!("{}", config.to_toml()?);
            if save {
                let path = cli.config.clone().unwrap_or_else(StudioConfig::default_path);
                config.save_to(&path)?;
                println!("{}Saved config to {}", CHECK, style(path.display()).dim());
            }
        }
    }

    print_issues(&sync);
    Ok(())
}

/// Apply a transition; failures are printed rather than aborting the command
async fn report_transition(sync: &ContentSync, state: AuthState) -> bool {
    match sync.apply(state).await {
        Ok(Some(report)) => {
            let migrated = report.scenes.migration.migrated + report.positions.migrated;
            if migrated > 0 || report.scenes.seeded > 0 {
                println!(
                    "{}Migrated {} items, seeded {} default scenes",
                    ARROW, migrated, report.scenes.seeded
                );
            }
            true
        }
        Ok(None) => true,
        Err(e) => {
            println!("{}Sign-in incomplete: {}", CROSS, style(e).red());
            false
        }
    }
}

fn list_scenes(sync: &ContentSync) {
    let favorites = sync.favorites().current_scene_ids();
    println!("{}", style("Scenes").bold().underlined());
    for scene in sync.scenes().current() {
        let id = resolve_scene_id(&scene);
        let marker = if favorites.contains(&id) {
            style("★").yellow()
        } else {
            style(" ").dim()
        };
        let kind = if scene.is_custom {
            style("custom").cyan()
        } else {
            style("default").dim()
        };
        println!("  {} {:<28} {} ({})", marker, id, style(&scene.title).bold(), kind);
    }
    println!();
}

fn list_positions(sync: &ContentSync) {
    println!("{}", style("Positions").bold().underlined());
    for position in sync.positions().current() {
        let marker = if position.is_favorite {
            style("★").yellow()
        } else {
            style(" ").dim()
        };
        println!(
            "  {} {:<28} {} {}",
            marker,
            resolve_position_id(&position),
            style(&position.display_name).bold(),
            style(&position.image_ref).dim()
        );
    }
    println!();
}

fn print_status(status: &SyncStatus) {
    let tier = match &status.signed_in_as {
        Some(owner) => style(format!("cloud ({})", owner)).green(),
        None => style("local".to_string()).yellow(),
    };
    let last = status
        .last_sync
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!(
        "  tier: {}  pending: {}  last sync: {}",
        tier,
        status.pending,
        style(last).dim()
    );
}

fn print_issues(sync: &ContentSync) {
    for status in sync.status() {
        for issue in &status.issues {
            println!(
                "{}[{}] {}",
                CROSS,
                issue.family,
                style(&issue.message).yellow()
            );
        }
    }
}
