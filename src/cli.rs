//! Command-line interface definition for Forkchat
//!
//! This module defines the CLI structure using clap's derive API,
//! providing commands to create conversations, stream turns and navigate
//! branches.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::conversation::Direction;

/// Forkchat - streaming chat with branching history
///
/// Conversations are trees: regenerating a reply or editing a message
/// creates a sibling branch that can be switched back and forth.
#[derive(Parser, Debug, Clone)]
#[command(name = "forkchat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Override the database path
    #[arg(long, env = "FORKCHAT_DB")]
    pub storage_path: Option<PathBuf>,

    /// Override the API base URL
    #[arg(long)]
    pub api_base: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Branch switch direction
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectionArg {
    /// Previous (older) sibling
    Prev,
    /// Next (newer) sibling
    Next,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Prev => Direction::Previous,
            DirectionArg::Next => Direction::Next,
        }
    }
}

/// Available commands for Forkchat
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Create a conversation and print its id
    New {
        /// Conversation title
        #[arg(short, long)]
        title: Option<String>,

        /// Model for text-only turns (defaults to the configured model)
        #[arg(short, long)]
        model: Option<String>,

        /// Let the model fetch web pages
        #[arg(long)]
        url_context: bool,
    },

    /// List conversations
    List,

    /// Send a message and stream the reply
    Send {
        /// Conversation id (or unique prefix)
        conversation: String,

        /// Message text
        text: String,

        /// Image to attach
        #[arg(short, long)]
        image: Option<PathBuf>,
    },

    /// Generate a new reply to the last user message
    Regenerate {
        /// Conversation id (or unique prefix)
        conversation: String,
    },

    /// Edit a user message, creating a sibling branch, and stream the reply
    Edit {
        /// User message id (or unique prefix)
        message: String,

        /// Replacement text
        text: String,
    },

    /// Print the active branch
    Show {
        /// Conversation id (or unique prefix)
        conversation: String,
    },

    /// Switch a message to its previous or next sibling
    Switch {
        /// Message id (or unique prefix)
        message: String,

        /// Direction to move
        #[arg(value_enum)]
        direction: DirectionArg,
    },

    /// Delete a message and everything below it
    Delete {
        /// Message id (or unique prefix)
        message: String,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_new_with_options() {
        let cli =
            Cli::try_parse_from(["forkchat", "new", "--title", "T", "--model", "m", "--url-context"])
                .unwrap();
        match cli.command {
            Commands::New {
                title,
                model,
                url_context,
            } => {
                assert_eq!(title.as_deref(), Some("T"));
                assert_eq!(model.as_deref(), Some("m"));
                assert!(url_context);
            }
            other => panic!("Expected New command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_send_with_image() {
        let cli = Cli::try_parse_from(["forkchat", "send", "abc", "hello", "--image", "a.png"])
            .unwrap();
        match cli.command {
            Commands::Send {
                conversation,
                text,
                image,
            } => {
                assert_eq!(conversation, "abc");
                assert_eq!(text, "hello");
                assert_eq!(image, Some(PathBuf::from("a.png")));
            }
            other => panic!("Expected Send command, got {:?}", other),
        }
    }

    #[test]
    fn test_cli_parse_switch_direction() {
        let cli = Cli::try_parse_from(["forkchat", "switch", "m1", "prev"]).unwrap();
        match cli.command {
            Commands::Switch { message, direction } => {
                assert_eq!(message, "m1");
                assert_eq!(Direction::from(direction), Direction::Previous);
            }
            other => panic!("Expected Switch command, got {:?}", other),
        }
        assert!(Cli::try_parse_from(["forkchat", "switch", "m1", "sideways"]).is_err());
    }

    #[test]
    fn test_cli_parse_with_verbose_and_overrides() {
        let cli = Cli::try_parse_from([
            "forkchat",
            "-v",
            "--api-base",
            "http://localhost:8080/v1",
            "list",
        ])
        .unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.api_base.as_deref(), Some("http://localhost:8080/v1"));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_cli_parse_missing_command() {
        assert!(Cli::try_parse_from(["forkchat"]).is_err());
    }

    #[test]
    fn test_cli_parse_invalid_command() {
        assert!(Cli::try_parse_from(["forkchat", "invalid"]).is_err());
    }
}
