// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

/// minne, a conversational spaced-repetition recall tutor.
///
/// Facts live in recall sets; a tutor probes you for the due ones in a
/// conversation, an evaluator checks what you actually retrieved, and the
/// scheduler pushes each fact's next review into the future.
#[derive(Parser, Debug)]
#[command(name = "minne", version, about)]
pub struct Cli {
    /// Path to an explicit config file (merged over the discovered layers).
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Log filter written to stderr (overrides MINNE_LOG).
    #[arg(long, global = true)]
    pub log: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a study session on a recall set.
    ///
    /// Lines you type go to the tutor. In-band commands:
    ///   /enter    opt in to the most recently offered tangent
    ///   /back     leave the tangent and return to review
    ///   /decline  wave the offered tangent off
    ///   /pause    pause the session (progress is kept; `study` resumes it)
    ///   /done     finish after the completion overlay
    ///   /quit     abandon the session
    Study {
        /// Name of the recall set.
        set: String,
    },

    /// List recall sets with their due counts.
    List,

    /// List sessions, newest first.
    Sessions {
        /// Restrict to one recall set.
        set: Option<String>,
    },

    /// Scheduling statistics for one recall set.
    Stats {
        /// Name of the recall set.
        set: String,
    },

    /// Print the persisted dialog of a past session.
    Replay {
        /// Session id (prefix match is accepted).
        session: String,
    },

    /// Export stored data as JSON to stdout.
    Export {
        #[command(subcommand)]
        what: ExportTarget,
    },

    /// Load recall sets from a YAML seed file.
    Seed {
        /// Path to the seed file.
        file: PathBuf,
    },

    /// Print the merged configuration and exit.
    ShowConfig,

    /// Generate shell completions.
    Completions {
        #[arg(value_enum)]
        shell: ShellArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum ExportTarget {
    /// One session: row, messages, outcomes, rabbit holes, metrics.
    Session { id: String },
    /// One recall set with all of its points.
    Set { name: String },
    /// Cross-session analytics: every metrics row.
    Analytics,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum ShellArg {
    Bash,
    Zsh,
    Fish,
}

pub fn print_completions(shell: ShellArg) {
    let shell = match shell {
        ShellArg::Bash => Shell::Bash,
        ShellArg::Zsh => Shell::Zsh,
        ShellArg::Fish => Shell::Fish,
    };
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "minne", &mut std::io::stdout());
}
