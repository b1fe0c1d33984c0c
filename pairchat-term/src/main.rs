use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use futures::StreamExt;
use pairchat_framework::{
    model::{profile::parse_matches, Attribution, Participant},
    store::{SqliteStore, SqliteStoreConfig},
    ChannelSynchronizer, ResubscribePolicy, SendOutcome, SyncConfig, SyncEvent,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tokio::io::{AsyncBufReadExt, BufReader};

/// Chat with a matched peer from the terminal
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
    /// Path to the sqlite database holding all channel logs
    #[arg(long, default_value = "pairchat.db")]
    db: PathBuf,
    /// Identity token (email) of the local participant
    #[arg(long)]
    me: String,
    /// Display name of the local participant
    #[arg(long)]
    name: String,
    /// Identity token of the peer to chat with
    #[arg(long, required_unless_present = "matches")]
    peer: Option<String>,
    /// Display name of the peer, defaults to their identity
    #[arg(long)]
    peer_name: Option<String>,
    /// Match listing returned by the matching service, the top-ranked candidate is chosen as
    /// the peer
    #[arg(long, conflicts_with = "peer")]
    matches: Option<PathBuf>,
    /// Milliseconds between checks for messages written by other clients of the database
    #[arg(long, default_value_t = 500)]
    poll_ms: u64,
    /// Milliseconds to wait before the first resubscription attempt
    #[arg(long, default_value_t = 250)]
    backoff_ms: u64,
    /// Give up resubscribing after this many attempts
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Increase logging verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    stderrlog::new()
        .verbosity(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init()?;

    let me = Participant::new(args.me.trim().to_lowercase(), args.name.trim());
    let peer = peer(&args)?;

    let db = SqlitePoolOptions::new()
        .connect_with(
            SqliteConnectOptions::new()
                .filename(&args.db)
                .create_if_missing(true),
        )
        .await?;
    let store = Arc::new(
        SqliteStore::new(
            db,
            SqliteStoreConfig {
                poll_interval_ms: args.poll_ms,
                ..Default::default()
            },
        )
        .await?,
    );

    let sync = ChannelSynchronizer::new(
        store,
        SyncConfig {
            resubscribe: ResubscribePolicy {
                initial_backoff_ms: args.backoff_ms,
                max_attempts: args.max_attempts,
                ..Default::default()
            },
        },
    );

    let mut handle = sync.open_between(&me, &peer).await?;
    let channel = handle.channel().clone();
    log::info!("Opened channel {} with {}", channel, peer.display_name);

    let viewer = me.identity.clone();
    let printer = tokio::spawn(async move {
        let mut shown = 0;
        while let Some(event) = handle.next().await {
            match event {
                SyncEvent::Snapshot(view) => {
                    // Snapshots are complete, print only what is new since the last one
                    for msg in view.render(&viewer, &peer).iter().skip(shown) {
                        let who = match &msg.attribution {
                            Attribution::Own => "you",
                            Attribution::Peer(name) => name.as_str(),
                        };
                        println!("[{}] {}: {}", msg.timestamp.format("%H:%M:%S"), who, msg.body);
                    }
                    shown = view.len();
                }
                SyncEvent::State(state) => log::info!("Channel is {:?}", state),
                SyncEvent::SubscriptionLost(e) => eprintln!("Connection lost: {}", e),
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match sync.send(&channel, &me, &line).await {
            Ok(SendOutcome::Sent(msg)) => log::debug!("Sent message {}", msg.seq),
            Ok(SendOutcome::Empty) => (),
            Err(e) => eprintln!("Failed to send: {}", e),
        }
    }

    sync.close();
    let _ = printer.await;

    Ok(())
}

/// Get the peer chosen on the command line, or the best match from a match listing
fn peer(args: &Args) -> Result<Participant, Box<dyn std::error::Error>> {
    if let Some(path) = &args.matches {
        let listing = std::fs::read_to_string(path)?;
        let best = parse_matches(&listing)?
            .into_iter()
            .next()
            .ok_or("match listing is empty")?;

        log::info!("Chatting with top match {} (score {})", best.user.name, best.score);
        return Ok(best.user.participant());
    }

    let identity = args.peer.as_deref().ok_or("no peer given")?.trim().to_lowercase();
    let name = args.peer_name.clone().unwrap_or_else(|| identity.clone());

    Ok(Participant::new(identity, name))
}
