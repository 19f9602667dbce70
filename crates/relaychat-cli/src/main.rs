//! Relay Chat CLI
//!
//! Thin wrapper around relaychat-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show our identity (uid and wire public key)
//! relaychat identity show
//!
//! # Add a contact from their wire public key
//! relaychat contact add <wire_pub> --remark Alice --password 1234
//!
//! # List contacts
//! relaychat contact list
//!
//! # Send a message
//! relaychat send <uid> "hello"
//!
//! # One-shot fetch for a contact
//! relaychat fetch <uid>
//!
//! # Stream a single contact, or everything
//! relaychat sync --contact <uid>
//! relaychat sync --broadcast
//!
//! # Print a conversation
//! relaychat history <uid>
//! ```

use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use relaychat_core::{
    Contact, EngineConfig, MergeOutcome, Speaker, SyncEngine, SyncEvent, SyncMode,
};
use tracing_subscriber::EnvFilter;

/// Relay Chat - end-to-end encrypted messaging over an untrusted relay
#[derive(Parser)]
#[command(name = "relaychat")]
#[command(version = "0.1.0")]
#[command(about = "Relay Chat - encrypted messaging over an untrusted relay")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Relay base URL
    #[arg(short, long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Data directory (default: ~/.relaychat)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Contact management
    Contact {
        #[command(subcommand)]
        action: ContactAction,
    },

    /// Send a message to a contact
    Send {
        /// Recipient uid
        uid: String,
        /// Message text
        text: String,
    },

    /// One-shot fetch of a contact's queued messages
    Fetch {
        /// Contact uid
        uid: String,
    },

    /// Stream incoming messages until interrupted
    Sync {
        /// Stream a single contact
        #[arg(long, conflicts_with = "broadcast")]
        contact: Option<String>,
        /// Stream all contacts over one connection
        #[arg(long)]
        broadcast: bool,
    },

    /// Print a conversation in chronological order
    History {
        /// Contact uid
        uid: String,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Print our uid and wire-form public key
    Show,
}

#[derive(Subcommand)]
enum ContactAction {
    /// Add a contact from their wire-form public key
    Add {
        /// Peer public key, wire form (base64-wrapped PEM)
        wire_pub: String,
        /// Display label
        #[arg(long, default_value = "")]
        remark: String,
        /// Shared handshake password
        #[arg(long, default_value = "")]
        password: String,
    },
    /// List all contacts
    List,
    /// Remove a contact
    Remove { uid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "relaychat_core=warn",
        1 => "relaychat_core=info",
        _ => "relaychat_core=debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::home_dir()
            .map(|home| home.join(".relaychat"))
            .unwrap_or_else(|| PathBuf::from(".relaychat")),
    };

    let engine = SyncEngine::new(EngineConfig::new(cli.server, data_dir)).await?;

    match cli.command {
        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                println!("uid: {}", engine.uid());
                println!("pub: {}", engine.identity().wire_pub());
            }
        },

        Commands::Contact { action } => match action {
            ContactAction::Add {
                wire_pub,
                remark,
                password,
            } => {
                let contact = Contact::from_wire_pub(wire_pub, remark, password);
                let uid = contact.uid.clone();
                engine.store().upsert_contact(contact).await?;
                println!("Added contact {}", uid);
            }
            ContactAction::List => {
                let contacts = engine.store().read_contacts().await?;
                if contacts.is_empty() {
                    println!("No contacts");
                }
                for (uid, contact) in contacts {
                    println!("{}  {}", uid, contact.remark);
                }
            }
            ContactAction::Remove { uid } => {
                engine.store().remove_contact(&uid).await?;
                println!("Removed {}", uid);
            }
        },

        Commands::Send { uid, text } => {
            let ts = engine.send_message(&uid, &text).await?;
            println!("Sent (ts {})", ts);
        }

        Commands::Fetch { uid } => match engine.fetch_once(&uid).await? {
            MergeOutcome::Merged { added } => println!("Fetched {} new message(s)", added),
            MergeOutcome::HandshakeFailed => println!("Handshake failed; nothing merged"),
        },

        Commands::Sync { contact, broadcast } => {
            let mode = match (contact, broadcast) {
                (Some(uid), _) => SyncMode::Contact(uid),
                (None, true) => SyncMode::Broadcast,
                (None, false) => bail!("Pass --contact <uid> or --broadcast"),
            };

            let mut events = engine.subscribe();
            engine.start(mode).await?;
            println!("Syncing; Ctrl-C to stop");

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        Ok(SyncEvent::HistoryChanged { uid, added }) => {
                            println!("{}: {} new message(s)", uid, added);
                        }
                        Ok(SyncEvent::HandshakeFailed { uid }) => {
                            println!("{}: handshake FAILED", uid);
                        }
                        Ok(SyncEvent::StatusChanged { status }) => {
                            println!("[{}]", status);
                        }
                        Ok(SyncEvent::SyncError { message }) => {
                            eprintln!("error: {}", message);
                        }
                        Err(_) => break,
                    },
                }
            }
            engine.stop().await;
        }

        Commands::History { uid } => {
            let history = engine.store().read_history(&uid).await?;
            for (ts, message) in relaychat_core::types::sorted_entries(&history) {
                let tag = match message.speaker {
                    Speaker::Me => "me",
                    Speaker::Peer => "peer",
                    Speaker::System => "sys",
                };
                println!("{:>12}  [{:>4}]  {}", ts, tag, message.text);
            }
        }
    }

    Ok(())
}
