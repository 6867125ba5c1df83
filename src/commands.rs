//! Subcommands of the offcache binary

use clap::Subcommand;

use offcache::worker::ControlMessage;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
  /// Precache the manifest for the configured version and activate it
  Install,

  /// Send a request through the interceptor
  Fetch {
    /// Path on the origin, e.g. /api/items
    path: String,

    /// HTTP method
    #[arg(short, long, default_value = "GET")]
    method: String,

    /// Request body
    #[arg(short, long)]
    data: Option<String>,
  },

  /// List cache generations in storage
  Generations,

  /// List request identities cached in the current generation
  Entries,

  /// Deliver a control message (e.g. SKIP_WAITING)
  Message {
    message: ControlMessage,
  },

  /// Manage the feed snapshot
  Feed {
    #[command(subcommand)]
    action: FeedAction,
  },

  /// One-shot connectivity and pending-sync report
  Status,

  /// Poll sync status until interrupted
  Watch,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedAction {
  /// Fetch the feed and capture a new snapshot
  Refresh,
  /// Print the cached items
  Show,
  /// Drop the snapshot
  Clear,
  /// Report snapshot age and staleness
  Status,
}
