//! Command line host for the sync core. Manages the local identity, shares
//! positions and photos, and streams the merged family view as JSON lines.

use std::{fs, path::Path, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, Subcommand};
use nostravel::{
    codec::{GeoPoint, LocationSample, PhotoShare},
    config::{Settings, DEFAULT_RELAYS},
    event::unix_now_millis,
    tracker::FixedPosition,
    Client, ClientOptions, DataSource,
};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Time given to endpoint tasks to flush a just-published event.
const FLUSH_GRACE: Duration = Duration::from_millis(750);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "nostravel",
    author,
    version,
    about = "Share family locations and photos over Nostr relays"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Increase log verbosity (-v info, -vv debug); `RUST_LOG` wins.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default `.env` if none exists.
    Init,
    /// Create a new identity.
    Keygen {
        #[arg(long)]
        name: String,
    },
    /// Restore an identity from its `nsec` secret form.
    Import {
        nsec: String,
        #[arg(long)]
        name: String,
    },
    /// Show the current identity.
    Whoami,
    /// Print a key backup document.
    Export,
    /// Forget the stored identity.
    Logout,
    /// Publish one position.
    ShareLocation {
        #[arg(long, allow_negative_numbers = true)]
        lat: f64,
        #[arg(long, allow_negative_numbers = true)]
        lng: f64,
    },
    /// Publish a photo reference.
    SharePhoto {
        #[arg(long)]
        url: String,
        #[arg(long, default_value = "")]
        caption: String,
        #[arg(long, allow_negative_numbers = true, requires = "lng")]
        lat: Option<f64>,
        #[arg(long, allow_negative_numbers = true, requires = "lat")]
        lng: Option<f64>,
    },
    /// Print location and photo snapshots as they change.
    Watch {
        /// Stop after this many seconds instead of waiting for Ctrl-C.
        #[arg(long)]
        seconds: Option<u64>,
        /// Re-share this latitude on the location interval while watching.
        #[arg(long, allow_negative_numbers = true, requires = "lng")]
        lat: Option<f64>,
        #[arg(long, allow_negative_numbers = true, requires = "lat")]
        lng: Option<f64>,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let client = Client::new(ClientOptions::from(&cfg));
    match cli.command {
        Commands::Init => {
            println!("{}", cli.env);
        }
        Commands::Keygen { name } => {
            let id = client.create_identity(&name)?;
            println!("{}", id.keys.npub());
        }
        Commands::Import { nsec, name } => {
            let id = client.import_identity(&nsec, &name)?;
            println!("{}", id.keys.npub());
        }
        Commands::Whoami => {
            let id = client
                .restore_identity()
                .context("no identity, run keygen or import first")?;
            println!(
                "{}",
                json!({
                    "npub": id.keys.npub(),
                    "pubkey": id.keys.public_hex(),
                    "name": id.profile.name,
                })
            );
        }
        Commands::Export => {
            client
                .restore_identity()
                .context("no identity, run keygen or import first")?;
            println!("{}", serde_json::to_string_pretty(&client.export_backup()?)?);
        }
        Commands::Logout => {
            client.restore_identity();
            client.logout()?;
        }
        Commands::ShareLocation { lat, lng } => {
            let point = checked_point(lat, lng)?;
            require_identity(&client)?;
            connect_live(&client).await?;
            let sample = LocationSample {
                lat: point.lat,
                lng: point.lng,
                timestamp: unix_now_millis(),
            };
            let published = client.originate_location(sample)?;
            finish_publish(&client, published).await?;
        }
        Commands::SharePhoto {
            url,
            caption,
            lat,
            lng,
        } => {
            let location = match (lat, lng) {
                (Some(lat), Some(lng)) => Some(checked_point(lat, lng)?),
                _ => None,
            };
            require_identity(&client)?;
            connect_live(&client).await?;
            let published = client.originate_photo(PhotoShare {
                url,
                caption,
                location,
                timestamp: unix_now_millis(),
            })?;
            finish_publish(&client, published).await?;
        }
        Commands::Watch { seconds, lat, lng } => {
            client.restore_identity();
            let source = client.connect().await;
            info!(source = ?source, "watching");
            client.subscribe_locations(|snap| {
                println!("{}", json!({ "locations": snap }));
            });
            client.subscribe_photos(|snap| {
                println!("{}", json!({ "photos": snap }));
            });
            if let (Some(lat), Some(lng)) = (lat, lng) {
                let point = checked_point(lat, lng)?;
                client.start_location_sharing(Arc::new(FixedPosition::new(point.lat, point.lng)))?;
            }
            match seconds {
                Some(s) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(s)) => {}
                        _ = tokio::signal::ctrl_c() => {}
                    }
                }
                None => tokio::signal::ctrl_c().await?,
            }
            client.teardown();
        }
    }
    Ok(())
}

fn checked_point(lat: f64, lng: f64) -> anyhow::Result<GeoPoint> {
    let point = GeoPoint { lat, lng };
    if !point.is_valid() {
        bail!("coordinates out of range: {lat}, {lng}");
    }
    Ok(point)
}

fn require_identity(client: &Client) -> anyhow::Result<()> {
    if client.restore_identity().is_none() {
        bail!("no identity, run keygen or import first");
    }
    Ok(())
}

async fn connect_live(client: &Client) -> anyhow::Result<()> {
    if client.connect().await != DataSource::LiveRelay {
        client.teardown();
        bail!("no relay reachable, nothing published");
    }
    Ok(())
}

async fn finish_publish(client: &Client, published: bool) -> anyhow::Result<()> {
    if published {
        tokio::time::sleep(FLUSH_GRACE).await;
    }
    client.teardown();
    if !published {
        bail!("event was not published");
    }
    println!("published");
    Ok(())
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let identity_path = base_dir.join("nostravel-identity.json");
    let mut content = String::new();
    content.push_str(&format!("RELAYS={}\n", DEFAULT_RELAYS.join(",")));
    content.push_str(&format!("IDENTITY_PATH={}\n", identity_path.to_string_lossy()));
    content.push_str("TOR_SOCKS=\n");
    content.push_str("CONNECT_TIMEOUT_SECS=10\n");
    content.push_str("LOCATION_INTERVAL_SECS=30\n");
    content.push_str("SINCE_WINDOW_SECS=86400\n");
    content.push_str("DEMO_DELAY_MS=2000\n");
    fs::write(env_path, content)?;
    Ok(())
}

/// Install the fmt subscriber on stderr, keeping stdout for command output.
fn setup_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use tokio::net::TcpListener;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: [&str; 7] = [
        "RELAYS",
        "IDENTITY_PATH",
        "TOR_SOCKS",
        "CONNECT_TIMEOUT_SECS",
        "LOCATION_INTERVAL_SECS",
        "SINCE_WINDOW_SECS",
        "DEMO_DELAY_MS",
    ];

    fn clear_vars() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    async fn dead_url() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("ws://{addr}")
    }

    fn write_env(dir: &TempDir, relay: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "RELAYS={relay}\nIDENTITY_PATH={}\nCONNECT_TIMEOUT_SECS=2\nDEMO_DELAY_MS=10\n",
            dir.path().join("id.json").display()
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_string_lossy().into_owned()
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.to_string(),
            verbose: 0,
            command,
        }
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("conf").join(".env");
        run(cli(&env_path.to_string_lossy(), Commands::Init))
            .await
            .unwrap();
        let data = fs::read_to_string(&env_path).unwrap();
        assert!(data.contains("RELAYS=wss://relay.damus.io,wss://nos.lol"));
        let expected = dir.path().join("conf").join("nostravel-identity.json");
        assert!(data.contains(&format!("IDENTITY_PATH={}", expected.to_string_lossy())));
        assert!(data.contains("LOCATION_INTERVAL_SECS=30"));
    }

    #[tokio::test]
    async fn keygen_export_and_logout() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "ws://127.0.0.1:9");
        let id_path = dir.path().join("id.json");

        run(cli(&env, Commands::Keygen { name: "Alice".into() }))
            .await
            .unwrap();
        assert!(id_path.exists());
        run(cli(&env, Commands::Whoami)).await.unwrap();
        run(cli(&env, Commands::Export)).await.unwrap();
        run(cli(&env, Commands::Logout)).await.unwrap();
        assert!(!id_path.exists());
        assert!(run(cli(&env, Commands::Whoami)).await.is_err());
        assert!(run(cli(&env, Commands::Export)).await.is_err());
    }

    #[tokio::test]
    async fn import_rejects_public_form() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, "ws://127.0.0.1:9");
        let npub = nostravel::Keys::generate().npub();
        let res = run(cli(
            &env,
            Commands::Import {
                nsec: npub,
                name: "Alice".into(),
            },
        ))
        .await;
        assert!(res.is_err());
        assert!(!dir.path().join("id.json").exists());
    }

    #[tokio::test]
    async fn share_location_fails_offline() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, &dead_url().await);
        run(cli(&env, Commands::Keygen { name: "Alice".into() }))
            .await
            .unwrap();
        let res = run(cli(
            &env,
            Commands::ShareLocation {
                lat: 47.3447,
                lng: 11.8486,
            },
        ))
        .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn share_location_requires_identity_and_valid_coordinates() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, &dead_url().await);
        let res = run(cli(&env, Commands::ShareLocation { lat: 1.0, lng: 1.0 })).await;
        assert!(res.unwrap_err().to_string().contains("no identity"));
        let res = run(cli(&env, Commands::ShareLocation { lat: 95.0, lng: 1.0 })).await;
        assert!(res.unwrap_err().to_string().contains("out of range"));
    }

    #[tokio::test]
    async fn watch_offline_runs_on_demo_data() {
        let _g = ENV_MUTEX.lock().unwrap();
        clear_vars();
        let dir = TempDir::new().unwrap();
        let env = write_env(&dir, &dead_url().await);
        run(cli(
            &env,
            Commands::Watch {
                seconds: Some(1),
                lat: None,
                lng: None,
            },
        ))
        .await
        .unwrap();
    }
}
