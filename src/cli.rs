//! Command-line access to the widget's local state and chat endpoint.

use crate::config::Config;
use crate::server::ChatServer;
use crate::widget::ChatWidget;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

/// Environment variable read by `login` before prompting on stdin.
pub const PASSWORD_ENV: &str = "CHATWIDGET_PASSWORD";

/// Chat widget session and conversation tool
#[derive(Parser, Debug)]
#[command(name = "chatwidget", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the current session
    Session {
        /// Discard the current session and start a new one
        #[arg(long)]
        new: bool,
    },
    /// List conversation summaries, newest first
    Conversations {
        /// Only conversations of this session (default: all)
        #[arg(long)]
        session: Option<String>,
    },
    /// Search stored messages
    Search {
        query: String,
        /// Only search this session (default: all)
        #[arg(long)]
        session: Option<String>,
    },
    /// Print a conversation as JSON
    Export {
        id: String,
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Import a conversation exported as JSON (use "-" for stdin)
    Import { file: PathBuf },
    /// Delete a conversation
    Delete { id: String },
    /// Send a message and store the reply
    Chat {
        message: String,
        /// Continue this conversation instead of starting one
        #[arg(short, long)]
        conversation: Option<String>,
    },
    /// Serve POST /api/ai/chat
    Serve {
        /// Listen address (default from config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Log in to the issue-tracking API
    Login { username: String },
    /// Forget stored tokens
    Logout,
}

pub async fn run(cli: Cli) -> ExitCode {
    match run_inner(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run_inner(cli: Cli) -> Result<ExitCode> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let widget = ChatWidget::from_config(&config).context("Failed to open storage")?;

    match cli.command {
        Commands::Session { new } => {
            let record = if new {
                widget.session().create_new_session(None)
            } else {
                widget.session().ensure_session()
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::Conversations { session } => {
            let summaries = widget
                .conversations()
                .get_conversation_summaries(session.as_deref());
            if summaries.is_empty() {
                println!("No conversations");
            }
            for summary in summaries {
                println!(
                    "{}  {}  ({} messages, updated {})",
                    summary.id,
                    summary.title,
                    summary.message_count,
                    summary.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Commands::Search { query, session } => {
            let results = widget
                .conversations()
                .search_messages(&query, session.as_deref());
            if results.is_empty() {
                println!("No matches");
            }
            for result in results {
                println!(
                    "[{}] {}: {}",
                    result.score, result.conversation_title, result.message.content
                );
            }
        }
        Commands::Export { id, output } => {
            let data = widget.conversations().export_conversation(&id)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, data)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Exported {id} to {}", path.display());
                }
                None => println!("{data}"),
            }
        }
        Commands::Import { file } => {
            let data = read_input(&file)?;
            let conversation = widget.conversations().import_conversation(&data)?;
            println!(
                "Imported {} ({} messages)",
                conversation.id,
                conversation.messages.len()
            );
        }
        Commands::Delete { id } => {
            if !widget.conversations().delete_conversation(&id) {
                eprintln!("No conversation {id}");
                return Ok(ExitCode::from(1));
            }
            println!("Deleted {id}");
        }
        Commands::Chat {
            message,
            conversation,
        } => {
            let exchange = widget
                .send_message(conversation.as_deref(), &message)
                .await?;
            println!("{}", exchange.reply.response);
            for action in &exchange.reply.suggested_actions {
                println!("  > {}", action.label);
            }
            eprintln!("conversation: {}", exchange.conversation.id);
        }
        Commands::Serve { addr } => {
            let addr = addr.unwrap_or_else(|| config.server_addr.clone());
            let server = ChatServer::bind(&addr, widget.backend().clone())?;
            let shutdown = server.shutdown_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    shutdown.shutdown();
                }
            });
            server.run().await?;
        }
        Commands::Login { username } => {
            let password = read_password()?;
            widget.api().login(&username, &password).await?;
            println!("Logged in as {username}");
        }
        Commands::Logout => {
            widget.api().logout();
            println!("Logged out");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn read_input(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(buffer);
    }
    std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var(PASSWORD_ENV)
        && !password.is_empty()
    {
        return Ok(password);
    }

    eprint!("Password: ");
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requires_command() {
        assert!(Cli::try_parse_from(["chatwidget"]).is_err());
    }

    #[test]
    fn test_parse_session() {
        let cli = Cli::try_parse_from(["chatwidget", "session"]).unwrap();
        assert!(matches!(cli.command, Commands::Session { new: false }));

        let cli = Cli::try_parse_from(["chatwidget", "session", "--new"]).unwrap();
        assert!(matches!(cli.command, Commands::Session { new: true }));
    }

    #[test]
    fn test_parse_search_with_session() {
        let cli =
            Cli::try_parse_from(["chatwidget", "search", "pothole", "--session", "session_1"])
                .unwrap();
        if let Commands::Search { query, session } = cli.command {
            assert_eq!(query, "pothole");
            assert_eq!(session.as_deref(), Some("session_1"));
        } else {
            panic!("Expected Search command");
        }
    }

    #[test]
    fn test_parse_chat() {
        let cli = Cli::try_parse_from(["chatwidget", "chat", "-c", "conv_1", "hello"]).unwrap();
        if let Commands::Chat {
            message,
            conversation,
        } = cli.command
        {
            assert_eq!(message, "hello");
            assert_eq!(conversation.as_deref(), Some("conv_1"));
        } else {
            panic!("Expected Chat command");
        }
    }

    #[test]
    fn test_parse_global_config() {
        let cli =
            Cli::try_parse_from(["chatwidget", "logout", "--config", "/tmp/c.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Logout));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/c.toml")));
    }

    #[test]
    fn test_parse_serve_addr() {
        let cli = Cli::try_parse_from(["chatwidget", "serve", "--addr", "0.0.0.0:8080"]).unwrap();
        if let Commands::Serve { addr } = cli.command {
            assert_eq!(addr.as_deref(), Some("0.0.0.0:8080"));
        } else {
            panic!("Expected Serve command");
        }
    }

    #[test]
    fn test_read_input_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conv.json");
        std::fs::write(&path, "{}").unwrap();
        assert_eq!(read_input(&path).unwrap(), "{}");
        assert!(read_input(&dir.path().join("missing.json")).is_err());
    }
}
